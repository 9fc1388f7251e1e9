//! Priority-ordered job queue
//!
//! The queue exclusively owns its jobs. It keeps them sorted by priority
//! tier (stable within a tier), answers "which job downloads next", applies
//! bulk pause/resume by tier or category, and persists a versioned snapshot
//! to disk after every structural change, before the lock is released, so a
//! crash can never observe a mutation that was not saved.

pub mod persistence;

use crate::config::DuplicateAction;
use crate::error::{Error, QueueError, Result};
use crate::nzb::NzbObject;
use crate::types::{JobId, JobState, Priority, QueueStats};
use chrono::Utc;
use std::path::PathBuf;
use std::sync::RwLock;
use std::time::Duration;

/// Where a job lands within its priority tier
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AddPosition {
    /// First of its tier
    Top,
    /// Last of its tier (default)
    Bottom,
}

/// What admission decided about a would-be duplicate
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AdmissionOutcome {
    /// Job admitted normally
    Admitted,
    /// Job admitted paused (duplicate policy Pause)
    AdmittedPaused {
        /// The matching existing entry
        existing: String,
    },
    /// Job admitted with a duplicate tag on its name (policy Tag)
    AdmittedTagged {
        /// The matching existing entry
        existing: String,
    },
    /// Job refused (policy Fail); the caller writes the history record
    Refused {
        /// The matching existing entry
        existing: String,
    },
}

/// The multi-priority job queue
pub struct Queue {
    admin_dir: PathBuf,
    inner: RwLock<Vec<NzbObject>>,
}

impl Queue {
    /// Open the queue, restoring any snapshot found in `admin_dir`.
    pub fn open(admin_dir: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&admin_dir)?;
        let jobs = persistence::restore_queue(&admin_dir)?;
        tracing::info!(jobs = jobs.len(), "queue restored");
        Ok(Self {
            admin_dir,
            inner: RwLock::new(jobs),
        })
    }

    /// Admit a job, honoring its priority tier and the duplicate policy.
    ///
    /// `known_duplicate` carries the id of a matching history record, if the
    /// caller found one; the queue itself checks the current queue.
    pub fn add(
        &self,
        mut job: NzbObject,
        position: AddPosition,
        duplicate_action: DuplicateAction,
        known_duplicate: Option<String>,
    ) -> Result<(JobId, AdmissionOutcome)> {
        #[allow(clippy::expect_used)]
        let mut jobs = self.inner.write().expect("queue lock poisoned");

        let existing = known_duplicate.or_else(|| {
            jobs.iter()
                .find(|j| j.duplicate_key == job.duplicate_key)
                .map(|j| j.id.as_str().to_string())
        });

        let outcome = match (existing, duplicate_action) {
            (None, _) | (Some(_), DuplicateAction::Ignore) => AdmissionOutcome::Admitted,
            (Some(existing), DuplicateAction::Pause) => {
                job.pause(false);
                AdmissionOutcome::AdmittedPaused { existing }
            }
            (Some(existing), DuplicateAction::Tag) => {
                job.name = format!("{}.DUPLICATE", job.name);
                AdmissionOutcome::AdmittedTagged { existing }
            }
            (Some(existing), DuplicateAction::Fail) => {
                return Ok((job.id, AdmissionOutcome::Refused { existing }));
            }
        };

        let id = job.id.clone();
        let index = insertion_index(&jobs, job.priority, position);
        jobs.insert(index, job);
        self.persist_locked(&jobs)?;
        Ok((id, outcome))
    }

    /// The job the downloader should pull articles from: the
    /// highest-priority non-paused, non-delayed job with something left to
    /// dispatch. Under a global pause only Force jobs qualify.
    pub fn next_active(
        &self,
        globally_paused: bool,
        propagation_delay: Option<Duration>,
    ) -> Option<JobId> {
        #[allow(clippy::expect_used)]
        let jobs = self.inner.read().expect("queue lock poisoned");
        jobs.iter()
            .find(|j| eligible(j, globally_paused, propagation_delay) && has_pending(j))
            .map(|j| j.id.clone())
    }

    /// Run a closure over eligible jobs in queue order until it produces a
    /// value. With `top_only` only the first eligible job is offered.
    ///
    /// This is the downloader's dispatch entry: the closure picks the next
    /// article and decides server fitness under the queue lock.
    pub fn dispatch<R>(
        &self,
        globally_paused: bool,
        propagation_delay: Option<Duration>,
        top_only: bool,
        mut f: impl FnMut(&mut NzbObject) -> Option<R>,
    ) -> Option<R> {
        #[allow(clippy::expect_used)]
        let mut jobs = self.inner.write().expect("queue lock poisoned");
        for job in jobs.iter_mut() {
            if !eligible(job, globally_paused, propagation_delay) {
                continue;
            }
            if let Some(r) = f(job) {
                return Some(r);
            }
            // top_only: only the single highest-priority active job may feed
            // the downloader, even when it has nothing dispatchable
            if top_only {
                break;
            }
        }
        None
    }

    /// Run a closure with mutable access to one job, persisting afterwards.
    ///
    /// Every guarded job operation goes through here so the admin record on
    /// disk never lags a committed mutation.
    pub fn with_job_mut<R>(
        &self,
        id: &JobId,
        f: impl FnOnce(&mut NzbObject) -> R,
    ) -> Result<R> {
        #[allow(clippy::expect_used)]
        let mut jobs = self.inner.write().expect("queue lock poisoned");
        let job = jobs
            .iter_mut()
            .find(|j| &j.id == id)
            .ok_or_else(|| Error::Queue(QueueError::NoSuchJob(id.clone())))?;
        let result = f(job);
        self.persist_locked(&jobs)?;
        Ok(result)
    }

    /// Run a closure with mutable access to one job without persisting.
    ///
    /// For high-frequency runtime counters (per-article accounting) where a
    /// snapshot per mutation would thrash the disk; the periodic persist and
    /// every structural change still write the snapshot.
    pub fn update_job<R>(&self, id: &JobId, f: impl FnOnce(&mut NzbObject) -> R) -> Option<R> {
        #[allow(clippy::expect_used)]
        let mut jobs = self.inner.write().expect("queue lock poisoned");
        jobs.iter_mut().find(|j| &j.id == id).map(f)
    }

    /// Run a read-only closure over one job
    pub fn with_job<R>(&self, id: &JobId, f: impl FnOnce(&NzbObject) -> R) -> Option<R> {
        #[allow(clippy::expect_used)]
        let jobs = self.inner.read().expect("queue lock poisoned");
        jobs.iter().find(|j| &j.id == id).map(f)
    }

    /// Pause one job
    pub fn pause_job(&self, id: &JobId, by_user: bool) -> Result<()> {
        self.with_job_mut(id, |j| j.pause(by_user))
    }

    /// Resume one job
    pub fn resume_job(&self, id: &JobId) -> Result<()> {
        self.with_job_mut(id, NzbObject::resume)
    }

    /// Change a job's priority and re-slot it at the bottom of the new tier
    pub fn set_priority(&self, id: &JobId, priority: Priority) -> Result<()> {
        #[allow(clippy::expect_used)]
        let mut jobs = self.inner.write().expect("queue lock poisoned");
        let pos = jobs
            .iter()
            .position(|j| &j.id == id)
            .ok_or_else(|| Error::Queue(QueueError::NoSuchJob(id.clone())))?;
        let mut job = jobs.remove(pos);
        job.set_priority(priority);
        let index = insertion_index(&jobs, job.priority, AddPosition::Bottom);
        jobs.insert(index, job);
        self.persist_locked(&jobs)
    }

    /// Change a job's category
    pub fn set_category(&self, id: &JobId, category: Option<String>) -> Result<()> {
        self.with_job_mut(id, |j| j.set_category(category))
    }

    /// Move a job to the top of its tier
    pub fn move_to_top(&self, id: &JobId) -> Result<()> {
        self.reorder(id, AddPosition::Top)
    }

    /// Move a job to the bottom of its tier
    pub fn move_to_bottom(&self, id: &JobId) -> Result<()> {
        self.reorder(id, AddPosition::Bottom)
    }

    fn reorder(&self, id: &JobId, position: AddPosition) -> Result<()> {
        #[allow(clippy::expect_used)]
        let mut jobs = self.inner.write().expect("queue lock poisoned");
        let pos = jobs
            .iter()
            .position(|j| &j.id == id)
            .ok_or_else(|| Error::Queue(QueueError::NoSuchJob(id.clone())))?;
        let job = jobs.remove(pos);
        let index = insertion_index(&jobs, job.priority, position);
        jobs.insert(index, job);
        self.persist_locked(&jobs)
    }

    /// Pause every job at a priority tier
    pub fn pause_priority(&self, tier: Priority) -> Result<usize> {
        self.bulk(|j| {
            if j.priority == tier && j.state.accepts_dispatch() {
                j.pause(false);
                true
            } else {
                false
            }
        })
    }

    /// Resume every paused job at a priority tier (user pauses stay)
    pub fn resume_priority(&self, tier: Priority) -> Result<usize> {
        self.bulk(|j| {
            if j.priority == tier && j.state == JobState::Paused && !j.paused_by_user {
                j.resume();
                true
            } else {
                false
            }
        })
    }

    /// Pause every job in a category
    pub fn pause_category(&self, category: &str) -> Result<usize> {
        self.bulk(|j| {
            if j.category.as_deref() == Some(category) && j.state.accepts_dispatch() {
                j.pause(false);
                true
            } else {
                false
            }
        })
    }

    /// Resume every policy-paused job in a category
    pub fn resume_category(&self, category: &str) -> Result<usize> {
        self.bulk(|j| {
            if j.category.as_deref() == Some(category)
                && j.state == JobState::Paused
                && !j.paused_by_user
            {
                j.resume();
                true
            } else {
                false
            }
        })
    }

    fn bulk(&self, mut f: impl FnMut(&mut NzbObject) -> bool) -> Result<usize> {
        #[allow(clippy::expect_used)]
        let mut jobs = self.inner.write().expect("queue lock poisoned");
        let mut touched = 0;
        for job in jobs.iter_mut() {
            if f(job) {
                touched += 1;
            }
        }
        if touched > 0 {
            self.persist_locked(&jobs)?;
        }
        Ok(touched)
    }

    /// Remove a job from the queue entirely (deletion).
    ///
    /// The job is fenced to Deleted first so in-flight completions observing
    /// it discard their work. The caller drops cached articles and cleans
    /// the incomplete directory.
    pub fn remove(&self, id: &JobId) -> Result<NzbObject> {
        #[allow(clippy::expect_used)]
        let mut jobs = self.inner.write().expect("queue lock poisoned");
        let pos = jobs
            .iter()
            .position(|j| &j.id == id)
            .ok_or_else(|| Error::Queue(QueueError::NoSuchJob(id.clone())))?;
        let mut job = jobs.remove(pos);
        job.state = JobState::Deleted;
        self.persist_locked(&jobs)?;
        Ok(job)
    }

    /// Pull a download-complete job out for post-processing.
    ///
    /// The job leaves the queue snapshot and enters the separately-persisted
    /// post-processing queue; its state becomes Checking.
    pub fn take_for_postproc(&self, id: &JobId) -> Result<NzbObject> {
        #[allow(clippy::expect_used)]
        let mut jobs = self.inner.write().expect("queue lock poisoned");
        let pos = jobs
            .iter()
            .position(|j| &j.id == id)
            .ok_or_else(|| Error::Queue(QueueError::NoSuchJob(id.clone())))?;
        let mut job = jobs.remove(pos);
        job.state = JobState::Checking;
        self.persist_locked(&jobs)?;
        Ok(job)
    }

    /// Mark a job failed and remove it; the caller synthesizes the history
    /// record and drops cached articles.
    pub fn fail_job(&self, id: &JobId, reason: &str) -> Result<NzbObject> {
        #[allow(clippy::expect_used)]
        let mut jobs = self.inner.write().expect("queue lock poisoned");
        let pos = jobs
            .iter()
            .position(|j| &j.id == id)
            .ok_or_else(|| Error::Queue(QueueError::NoSuchJob(id.clone())))?;
        let mut job = jobs.remove(pos);
        job.state = JobState::Failed;
        job.fail_message = reason.to_string();
        self.persist_locked(&jobs)?;
        Ok(job)
    }

    /// Find a duplicate of `key` in the current queue
    pub fn find_duplicate(&self, key: &str) -> Option<JobId> {
        #[allow(clippy::expect_used)]
        let jobs = self.inner.read().expect("queue lock poisoned");
        jobs.iter()
            .find(|j| j.duplicate_key == key)
            .map(|j| j.id.clone())
    }

    /// Snapshot of job order, for the control surface and tests
    pub fn job_ids(&self) -> Vec<JobId> {
        #[allow(clippy::expect_used)]
        let jobs = self.inner.read().expect("queue lock poisoned");
        jobs.iter().map(|j| j.id.clone()).collect()
    }

    /// Per-job snapshots in queue order, for the control surface
    pub fn jobs_info(&self) -> Vec<crate::types::JobInfo> {
        #[allow(clippy::expect_used)]
        let jobs = self.inner.read().expect("queue lock poisoned");
        jobs.iter()
            .map(|j| crate::types::JobInfo {
                id: j.id.clone(),
                name: j.name.clone(),
                category: j.category.clone(),
                state: j.state,
                priority: j.priority,
                total_bytes: j.total_bytes,
                downloaded_bytes: j.bytes_downloaded,
                added_at: j.added_at,
                avg_date: j.avg_date,
            })
            .collect()
    }

    /// Aggregate statistics; speed fields are filled by the caller
    pub fn stats(&self) -> QueueStats {
        #[allow(clippy::expect_used)]
        let jobs = self.inner.read().expect("queue lock poisoned");
        let mut stats = QueueStats {
            total: jobs.len(),
            queued: 0,
            downloading: 0,
            paused: 0,
            processing: 0,
            total_bytes: 0,
            downloaded_bytes: 0,
            speed_limit_bps: None,
            paused_globally: false,
        };
        for job in jobs.iter() {
            match job.state {
                JobState::Queued | JobState::Grabbing => stats.queued += 1,
                JobState::Downloading | JobState::FetchingExtraPar2 => stats.downloading += 1,
                JobState::Paused => stats.paused += 1,
                s if s.in_post_processing() => stats.processing += 1,
                _ => {}
            }
            stats.total_bytes += job.total_bytes;
            stats.downloaded_bytes += job.bytes_downloaded;
        }
        stats
    }

    /// Number of jobs in the queue
    pub fn len(&self) -> usize {
        #[allow(clippy::expect_used)]
        let jobs = self.inner.read().expect("queue lock poisoned");
        jobs.len()
    }

    /// Whether the queue is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Force a snapshot write outside a mutation (periodic safety net)
    pub fn persist(&self) -> Result<()> {
        #[allow(clippy::expect_used)]
        let jobs = self.inner.read().expect("queue lock poisoned");
        self.persist_locked(&jobs)
    }

    fn persist_locked(&self, jobs: &[NzbObject]) -> Result<()> {
        persistence::persist_queue(&self.admin_dir, jobs)
    }
}

/// Whether a job can feed the downloader right now
fn eligible(job: &NzbObject, globally_paused: bool, propagation_delay: Option<Duration>) -> bool {
    if !job.priority.dispatchable() || !job.state.accepts_dispatch() {
        return false;
    }
    // Force priority dispatches even under a global pause
    if globally_paused && job.priority != Priority::Force {
        return false;
    }
    if let Some(delay) = propagation_delay {
        let Ok(delay) = chrono::Duration::from_std(delay) else {
            return false;
        };
        if job.avg_date > Utc::now() - delay {
            return false;
        }
    }
    true
}

/// Whether a job still has an article to hand out
fn has_pending(job: &NzbObject) -> bool {
    job.files.iter().any(|f| {
        !f.assembled
            && f.articles
                .iter()
                .any(|a| a.status == crate::nzb::ArticleStatus::Pending)
    })
}

/// Index a job of `priority` should occupy for the given position.
/// Jobs are kept sorted by priority descending; ties keep insertion order.
fn insertion_index(jobs: &[NzbObject], priority: Priority, position: AddPosition) -> usize {
    match position {
        // Top of tier: before the first job of the same or lower priority
        AddPosition::Top => jobs
            .iter()
            .position(|j| j.priority <= priority)
            .unwrap_or(jobs.len()),
        // Bottom of tier: after the last job of the same or higher priority
        AddPosition::Bottom => jobs
            .iter()
            .position(|j| j.priority < priority)
            .unwrap_or(jobs.len()),
    }
}
