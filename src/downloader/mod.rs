//! The download engine dispatcher
//!
//! A single dispatcher loop pulls the next article from the active job,
//! finds a fit server in the pool, leases a connection, and spawns one fetch
//! task per article. Parallelism is bounded by the sum of per-server
//! connection limits, not a fixed worker count. The dispatcher owns the
//! retry-then-failover policy, the PAR2 holdback, the propagation delay, and
//! the advisory bandwidth limit.

use crate::cache::ArticleCache;
use crate::config::Config;
use crate::error::FetchError;
use crate::nzb::{Article, NzbObject};
use crate::pool::{ConnectionLease, ReleaseEffect, ServerPool};
use crate::queue::{AddPosition, Queue};
use crate::retry::Backoff;
use crate::speed_limiter::SpeedLimiter;
use crate::supervisor::PauseState;
use crate::types::{Event, JobId, JobState, Priority, ServerId};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;

/// Pause between dispatch attempts when nothing is dispatchable
const IDLE_POLL: Duration = Duration::from_millis(100);

/// One article handed to a connection
struct Assignment {
    job: JobId,
    file: usize,
    article_index: usize,
    article: Article,
    file_date: DateTime<Utc>,
    server: ServerId,
}

/// What the dispatch closure decided for the active job
enum Picked {
    /// Fetch this article on this server
    Assign(Box<Assignment>),
    /// The job finished (last outstanding article failed permanently)
    Complete(JobId),
    /// Too many failures; abort the job
    Abort(JobId, String),
}

/// Rolling download speed over a short window
struct SpeedMeter {
    window_start: std::sync::Mutex<Instant>,
    bytes: AtomicU64,
    last_bps: AtomicU64,
}

impl SpeedMeter {
    fn new() -> Self {
        Self {
            window_start: std::sync::Mutex::new(Instant::now()),
            bytes: AtomicU64::new(0),
            last_bps: AtomicU64::new(0),
        }
    }

    fn record(&self, bytes: u64) {
        self.bytes.fetch_add(bytes, Ordering::Relaxed);
        #[allow(clippy::expect_used)]
        let mut start = self.window_start.lock().expect("speed meter poisoned");
        let elapsed = start.elapsed();
        if elapsed >= Duration::from_secs(5) {
            let total = self.bytes.swap(0, Ordering::Relaxed);
            let bps = (total as f64 / elapsed.as_secs_f64()) as u64;
            self.last_bps.store(bps, Ordering::Relaxed);
            *start = Instant::now();
        }
    }

    fn bps(&self) -> u64 {
        self.last_bps.load(Ordering::Relaxed)
    }
}

/// The download engine
pub struct Downloader {
    queue: Arc<Queue>,
    pool: Arc<ServerPool>,
    cache: Arc<ArticleCache>,
    speed_limiter: SpeedLimiter,
    config: Arc<Config>,
    event_tx: broadcast::Sender<Event>,
    /// Nudges the assembler when a file gains an in-order article
    kick_tx: mpsc::UnboundedSender<crate::assembler::AssemblyKick>,
    /// Jobs whose downloads finished (all files assembled or exhausted)
    complete_tx: mpsc::UnboundedSender<JobId>,
    /// Jobs aborted by the failure-ratio heuristic, with the reason
    failed_tx: mpsc::UnboundedSender<(JobId, String)>,
    pause: Arc<PauseState>,
    speed: SpeedMeter,
}

impl Downloader {
    /// Wire the dispatcher to its collaborators
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        queue: Arc<Queue>,
        pool: Arc<ServerPool>,
        cache: Arc<ArticleCache>,
        config: Arc<Config>,
        event_tx: broadcast::Sender<Event>,
        kick_tx: mpsc::UnboundedSender<crate::assembler::AssemblyKick>,
        complete_tx: mpsc::UnboundedSender<JobId>,
        failed_tx: mpsc::UnboundedSender<(JobId, String)>,
        pause: Arc<PauseState>,
    ) -> Self {
        let speed_limiter = SpeedLimiter::new(config.download.effective_speed_limit());
        Self {
            queue,
            pool,
            cache,
            speed_limiter,
            config,
            event_tx,
            kick_tx,
            complete_tx,
            failed_tx,
            pause,
            speed: SpeedMeter::new(),
        }
    }

    /// The shared bandwidth limiter, for runtime limit changes
    pub fn speed_limiter(&self) -> &SpeedLimiter {
        &self.speed_limiter
    }

    /// Current rolling download speed in bytes per second
    pub fn current_bps(&self) -> u64 {
        self.speed.bps()
    }

    /// Dispatcher loop: runs until cancelled
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        tracing::info!("downloader dispatcher started");
        loop {
            if cancel.is_cancelled() {
                break;
            }
            if !Arc::clone(&self).dispatch_once().await {
                tokio::time::sleep(IDLE_POLL).await;
            }
        }
        tracing::info!("downloader dispatcher stopped");
    }

    /// One dispatch attempt. Returns whether anything was set in motion.
    async fn dispatch_once(self: Arc<Self>) -> bool {
        let paused = self.pause.download_paused();
        let delay = self.config.download.propagation_delay;
        let top_only = self.config.download.top_only;

        let picked = self.queue.dispatch(paused, delay, top_only, |job| {
            self.pick_from(job)
        });

        match picked {
            Some(Picked::Assign(assignment)) => {
                let Some(lease) = self.pool.acquire(assignment.server).await else {
                    // Slot vanished between fitness and acquire; put the
                    // article back for the next pass
                    self.queue.update_job(&assignment.job, |j| {
                        j.requeue_article(assignment.file, assignment.article_index);
                    });
                    return false;
                };
                let engine = Arc::clone(&self);
                tokio::spawn(async move {
                    engine.fetch_assignment(*assignment, lease).await;
                });
                true
            }
            Some(Picked::Complete(job)) => {
                self.complete_tx.send(job).ok();
                true
            }
            Some(Picked::Abort(job, reason)) => {
                self.failed_tx.send((job, reason)).ok();
                true
            }
            None => false,
        }
    }

    /// Pick the next dispatchable article of one job, marking the attempt.
    ///
    /// Articles whose every fit server is exhausted are failed permanently
    /// right here; the loop then tries the job's next article.
    fn pick_from(&self, job: &mut NzbObject) -> Option<Picked> {
        loop {
            let (file, index) = job.next_article()?;
            let article = job.files[file].articles[index].clone();
            let file_date = job.files[file].date;

            if let Some(server) = self.pool.fitness(&article, file_date) {
                let priority = self.pool.server(server).map(|s| s.config.priority);
                let a = &mut job.files[file].articles[index];
                a.tried.insert(server);
                a.fetcher_priority = priority;
                return Some(Picked::Assign(Box::new(Assignment {
                    job: job.id.clone(),
                    file,
                    article_index: index,
                    article: a.clone(),
                    file_date,
                    server,
                })));
            }

            if self.pool.any_fit(&article, file_date) {
                // Fit servers exist but none has a free slot right now
                job.requeue_article(file, index);
                return None;
            }

            // Every fit server has already failed this article
            tracing::debug!(
                job = %job.id,
                message_id = %article.message_id,
                "article failed on every fit server"
            );
            job.add_failed_article(file, index);
            self.cache.mark_failed(&job.id, file, index);
            self.kick_tx.send((job.id.clone(), file)).ok();

            if job.failure_ratio() > self.config.download.max_failure_ratio {
                return Some(Picked::Abort(
                    job.id.clone(),
                    format!(
                        "aborted: {:.0}% of article data unavailable",
                        job.failure_ratio() * 100.0
                    ),
                ));
            }
            if job.download_complete() {
                return Some(Picked::Complete(job.id.clone()));
            }
        }
    }

    /// Fetch one assignment on its leased connection, with same-server
    /// retries for transient errors before escalating to failover.
    async fn fetch_assignment(self: Arc<Self>, assignment: Assignment, mut lease: ConnectionLease) {
        self.speed_limiter.acquire(assignment.article.bytes).await;

        let mut backoff = Backoff::new(&self.config.download.retry);
        let mut attempts = 0u32;
        let outcome = loop {
            match lease.conn.fetch(&assignment.article).await {
                Ok(bytes) => break Ok(bytes),
                Err(e) if e.retryable_same_server() && attempts < self.config.download.max_retries => {
                    attempts += 1;
                    let delay = backoff.next_delay();
                    tracing::debug!(
                        job = %assignment.job,
                        server = %assignment.server,
                        attempt = attempts,
                        error = %e,
                        "transient fetch failure, retrying on the same server"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => break Err(e),
            }
        };

        match outcome {
            Ok(bytes) => {
                let len = bytes.len() as u64;
                self.speed.record(len);
                let effect = self.pool.release(lease, Ok(len));
                self.apply_release_effect(assignment.server, effect);
                self.finish_success(&assignment, bytes).await;
            }
            Err(e) => {
                let effect = self.pool.release(lease, Err(&e));
                self.apply_release_effect(assignment.server, effect);
                self.finish_failure(&assignment, e);
            }
        }
    }

    /// Book a successful fetch: accounting, cache insert, assembler kick
    async fn finish_success(&self, assignment: &Assignment, bytes: Vec<u8>) {
        let progress = self.queue.update_job(&assignment.job, |j| {
            j.article_done(assignment.file, assignment.article_index);
            (
                j.bytes_downloaded,
                j.total_bytes,
                j.files.iter().map(|f| f.failed_bytes).sum::<u64>(),
            )
        });

        let Some((downloaded, total, failed)) = progress else {
            // Deleted while the article was in flight; nothing more may be
            // written for it
            tracing::debug!(job = %assignment.job, "discarding article for removed job");
            self.cache.drop_job(&assignment.job);
            return;
        };

        let ready = self
            .cache
            .put(
                &assignment.job,
                assignment.file,
                assignment.article_index,
                bytes,
            )
            .await;
        if ready {
            self.kick_tx
                .send((assignment.job.clone(), assignment.file))
                .ok();
        }

        self.event_tx
            .send(Event::Downloading {
                id: assignment.job.clone(),
                downloaded_bytes: downloaded,
                total_bytes: total,
                speed_bps: self.speed.bps(),
                failed_articles: failed,
            })
            .ok();
    }

    /// Book a failed fetch according to its error kind
    fn finish_failure(&self, assignment: &Assignment, error: FetchError) {
        match &error {
            FetchError::ArticleMissing { .. } | FetchError::ArticleIncomplete { .. } => {
                tracing::debug!(
                    job = %assignment.job,
                    server = %assignment.server,
                    message_id = %assignment.article.message_id,
                    error = %error,
                    "failing over to the next fit server"
                );
                self.requeue(assignment, false);
            }
            FetchError::AuthFailed { .. } => {
                // The pool disabled the server; the attempt does not count
                // against the article
                self.requeue(assignment, true);
            }
            FetchError::QuotaExceeded { .. } | FetchError::Throttled { .. } => {
                self.requeue(assignment, true);
            }
            FetchError::Transient { .. } => {
                // Same-server retries are exhausted; escalate to failover
                self.requeue(assignment, false);
            }
        }
    }

    /// Put the article back for the dispatcher. With `forgive` the failing
    /// server's attempt is erased (server-level conditions, not content).
    fn requeue(&self, assignment: &Assignment, forgive: bool) {
        self.queue.update_job(&assignment.job, |j| {
            let a = &mut j.files[assignment.file].articles[assignment.article_index];
            if forgive {
                a.tried.remove(&assignment.server);
            }
            if a.status == crate::nzb::ArticleStatus::InFlight {
                a.status = crate::nzb::ArticleStatus::Pending;
            }
        });
    }

    /// Translate a pool release effect into events and the global pause
    fn apply_release_effect(&self, server: ServerId, effect: ReleaseEffect) {
        match effect {
            ReleaseEffect::None => {}
            ReleaseEffect::Parked => {
                self.event_tx.send(Event::ServerParked { server }).ok();
            }
            ReleaseEffect::Disabled { required } => {
                self.event_tx
                    .send(Event::ServerDisabled { server, required })
                    .ok();
                if required {
                    // A required server without credentials would burn every
                    // article's attempts; stop the engine until fixed
                    tracing::warn!(server = %server, "required server disabled, pausing downloads");
                    self.pause.pause_for_auth();
                    self.event_tx.send(Event::DownloadPaused).ok();
                }
            }
        }
    }

    /// Promote withheld PAR2 volumes of a borrowed job and hand the job back
    /// to the queue at Repair priority for the extra fetch round.
    ///
    /// Called by the post-processor's repair stage; `blocks` is the number
    /// of recovery blocks PAR2 asked for. Returns how many volume files were
    /// promoted.
    pub fn fetch_extra_par2(&self, mut job: NzbObject, blocks: u32) -> crate::error::Result<usize> {
        let moved = job.promote_extra_par2(blocks);
        if moved == 0 {
            return Ok(0);
        }
        job.priority = Priority::Repair;
        job.state = JobState::FetchingExtraPar2;
        tracing::info!(
            job = %job.id,
            volumes = moved,
            blocks,
            "fetching extra PAR2 volumes for repair"
        );
        self.queue.add(
            job,
            AddPosition::Top,
            crate::config::DuplicateAction::Ignore,
            None,
        )?;
        Ok(moved)
    }
}
