//! Top-level lifecycle: component construction, pause state, shutdown
//!
//! The supervisor owns every component as an explicit value; there are no globals.
//! It spawns the long-lived tasks (dispatcher, assembler, post-processor,
//! scheduler, signal routers), exposes the control operations the API
//! adapter calls, and propagates shutdown with a bounded grace period.
//! Per-job errors never terminate the process; only hard invariants
//! (admin directory unwritable) refuse startup.

use crate::assembler::Assembler;
use crate::cache::ArticleCache;
use crate::config::Config;
use crate::downloader::Downloader;
use crate::error::{Error, Result};
use crate::history::{History, HistoryFilter, HistoryRecord};
use crate::nzb::admin::{JobAdmin, JobAttributes};
use crate::nzb::{NzbFile, NzbObject};
use crate::parity::{CliParityHandler, NoOpParityHandler, ParityHandler};
use crate::pool::ServerPool;
use crate::postproc::PostProcessor;
use crate::queue::{AddPosition, AdmissionOutcome, Queue};
use crate::scheduler::Scheduler;
use crate::types::{Event, HistoryStatus, JobId, JobState, Priority, QueueStats};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;

/// Global pause state, one atomic per cause.
///
/// Downloading is paused while any cause holds; the causes clear
/// independently (a disk-full resume does not undo a user pause). The
/// post-processing flag is separate: it suspends stage transitions, not
/// downloading.
#[derive(Debug, Default)]
pub struct PauseState {
    user: AtomicBool,
    disk_full: AtomicBool,
    auth: AtomicBool,
    postproc_demand: AtomicBool,
    postproc_user: AtomicBool,
}

impl PauseState {
    /// Fresh, unpaused state
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the downloader may dispatch (Force jobs excepted)
    pub fn download_paused(&self) -> bool {
        self.user.load(Ordering::Relaxed)
            || self.disk_full.load(Ordering::Relaxed)
            || self.auth.load(Ordering::Relaxed)
            || self.postproc_demand.load(Ordering::Relaxed)
    }

    /// User pressed pause
    pub fn pause_user(&self) {
        self.user.store(true, Ordering::SeqCst);
    }

    /// User pressed resume
    pub fn resume_user(&self) {
        self.user.store(false, Ordering::SeqCst);
    }

    /// The assembler hit ENOSPC
    pub fn pause_disk_full(&self) {
        self.disk_full.store(true, Ordering::SeqCst);
    }

    /// The free-space watcher found room again
    pub fn resume_disk_full(&self) {
        self.disk_full.store(false, Ordering::SeqCst);
    }

    /// A required server's login failed
    pub fn pause_for_auth(&self) {
        self.auth.store(true, Ordering::SeqCst);
    }

    /// The operator fixed the required server
    pub fn clear_auth(&self) {
        self.auth.store(false, Ordering::SeqCst);
    }

    /// A post-processing stage demanded the downloader stop
    pub fn pause_by_postproc(&self) {
        self.postproc_demand.store(true, Ordering::SeqCst);
    }

    /// The demanding stage finished
    pub fn resume_by_postproc(&self) {
        self.postproc_demand.store(false, Ordering::SeqCst);
    }

    /// Suspend post-processing stage transitions
    pub fn pause_postproc_flag(&self) {
        self.postproc_user.store(true, Ordering::SeqCst);
    }

    /// Resume post-processing stage transitions
    pub fn resume_postproc_flag(&self) {
        self.postproc_user.store(false, Ordering::SeqCst);
    }

    /// Whether post-processing is suspended between stages
    pub fn postproc_paused(&self) -> bool {
        self.postproc_user.load(Ordering::Relaxed)
    }
}

/// One entry of the warning ring
#[derive(Clone, Debug)]
pub struct Warning {
    /// When the warning was recorded
    pub at: chrono::DateTime<chrono::Utc>,
    /// Human-readable text
    pub text: String,
}

/// Bounded ring of recent non-fatal warnings, exposed read-only.
///
/// Fed from the event stream; when full, the oldest entry falls out.
#[derive(Debug)]
pub struct WarningRing {
    entries: std::sync::Mutex<std::collections::VecDeque<Warning>>,
    capacity: usize,
}

impl WarningRing {
    fn new(capacity: usize) -> Self {
        Self {
            entries: std::sync::Mutex::new(std::collections::VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    fn push(&self, text: String) {
        #[allow(clippy::expect_used)]
        let mut entries = self.entries.lock().expect("warning ring poisoned");
        if entries.len() == self.capacity {
            entries.pop_front();
        }
        entries.push_back(Warning {
            at: chrono::Utc::now(),
            text,
        });
    }

    /// Snapshot of the current warnings, oldest first
    pub fn snapshot(&self) -> Vec<Warning> {
        #[allow(clippy::expect_used)]
        let entries = self.entries.lock().expect("warning ring poisoned");
        entries.iter().cloned().collect()
    }
}

/// Options for admitting a job
#[derive(Clone, Debug, Default)]
pub struct AddJobOptions {
    /// Category tag
    pub category: Option<String>,
    /// Priority tier
    pub priority: Option<Priority>,
    /// Operator-supplied password
    pub password: Option<String>,
    /// Post-processing level override
    pub post_proc: Option<crate::types::PostProcLevel>,
    /// Source URL for the history record
    pub url: Option<String>,
    /// Queue position within the tier
    pub top: bool,
}

/// The running engine: components, tasks, and the control surface.
pub struct Supervisor {
    config: Arc<Config>,
    queue: Arc<Queue>,
    pool: Arc<ServerPool>,
    cache: Arc<ArticleCache>,
    history: Arc<History>,
    downloader: Arc<Downloader>,
    scheduler: Arc<Scheduler>,
    pause: Arc<PauseState>,
    event_tx: broadcast::Sender<Event>,
    pp_tx: mpsc::UnboundedSender<NzbObject>,
    cancel: CancellationToken,
    tasks: std::sync::Mutex<Vec<tokio::task::JoinHandle<()>>>,
    warnings: Arc<WarningRing>,
}

impl Supervisor {
    /// Build every component, restore persisted state, and start the
    /// long-lived tasks.
    pub async fn start(config: Config) -> Result<Arc<Self>> {
        let config = Arc::new(config);

        // Hard invariant: the directories must be writable or nothing works
        for dir in [
            &config.folders.admin_dir,
            &config.folders.incomplete_dir,
            &config.folders.complete_dir,
        ] {
            std::fs::create_dir_all(dir).map_err(|e| Error::Config {
                message: format!("cannot create directory {}: {e}", dir.display()),
                key: Some("folders".to_string()),
            })?;
        }

        let (event_tx, _) = broadcast::channel(1024);
        let pause = Arc::new(PauseState::new());
        let cancel = CancellationToken::new();
        let warning_ring_size = config.warning_ring_size;

        let queue = Arc::new(Queue::open(config.folders.admin_dir.clone())?);
        let pool = Arc::new(ServerPool::new(
            config.servers.clone(),
            config.download.network_timeout,
        ));
        let cache = Arc::new(ArticleCache::new(config.download.cache_limit_bytes));
        let history = Arc::new(History::open(&config.folders.admin_dir).await?);

        let parity: Arc<dyn ParityHandler> = match &config.processing.par2_path {
            Some(path) => Arc::new(CliParityHandler::new(path.clone())),
            None => CliParityHandler::from_path()
                .map(|h| Arc::new(h) as Arc<dyn ParityHandler>)
                .unwrap_or_else(|| Arc::new(NoOpParityHandler)),
        };
        tracing::info!(
            handler = parity.name(),
            can_repair = parity.capabilities().can_repair,
            "parity handler initialized"
        );

        let (kick_tx, kick_rx) = mpsc::unbounded_channel();
        let (complete_tx, complete_rx) = mpsc::unbounded_channel();
        let (failed_tx, failed_rx) = mpsc::unbounded_channel();
        let (disk_full_tx, disk_full_rx) = mpsc::unbounded_channel();
        let (pp_tx, pp_rx) = mpsc::unbounded_channel();

        let downloader = Arc::new(Downloader::new(
            queue.clone(),
            pool.clone(),
            cache.clone(),
            config.clone(),
            event_tx.clone(),
            kick_tx.clone(),
            complete_tx.clone(),
            failed_tx,
            pause.clone(),
        ));

        let assembler = Assembler::new(
            cache.clone(),
            queue.clone(),
            config.folders.incomplete_dir.clone(),
            event_tx.clone(),
            complete_tx,
            disk_full_tx,
        );

        let scheduler = Arc::new(Scheduler::new(
            config.clone(),
            queue.clone(),
            pool.clone(),
            history.clone(),
            cache.clone(),
            downloader.speed_limiter().clone(),
            pause.clone(),
            event_tx.clone(),
            kick_tx,
        ));

        let postproc = Arc::new(PostProcessor::new(
            config.clone(),
            queue.clone(),
            downloader.clone(),
            history.clone(),
            parity,
            event_tx.clone(),
            pause.clone(),
        ));

        let supervisor = Arc::new(Self {
            config,
            queue,
            pool,
            cache,
            history,
            downloader: downloader.clone(),
            scheduler: scheduler.clone(),
            pause,
            event_tx,
            pp_tx,
            cancel: cancel.clone(),
            tasks: std::sync::Mutex::new(Vec::new()),
            warnings: Arc::new(WarningRing::new(warning_ring_size)),
        });

        let mut tasks = Vec::new();
        tasks.push(tokio::spawn(Self::collect_warnings(
            supervisor.warnings.clone(),
            supervisor.event_tx.subscribe(),
            cancel.clone(),
        )));
        tasks.push(tokio::spawn(downloader.run(cancel.clone())));
        tasks.push(tokio::spawn(assembler.run(kick_rx, cancel.clone())));
        tasks.push(tokio::spawn(postproc.run(pp_rx, cancel.clone())));
        tasks.push(tokio::spawn(scheduler.run(cancel.clone())));
        tasks.push(tokio::spawn(Self::route_completions(
            supervisor.clone(),
            complete_rx,
            cancel.clone(),
        )));
        tasks.push(tokio::spawn(Self::route_failures(
            supervisor.clone(),
            failed_rx,
            cancel.clone(),
        )));
        tasks.push(tokio::spawn(Self::route_disk_full(
            supervisor.clone(),
            disk_full_rx,
            cancel.clone(),
        )));
        tasks.push(tokio::spawn(Self::periodic_persist(
            supervisor.clone(),
            cancel,
        )));

        #[allow(clippy::expect_used)]
        supervisor
            .tasks
            .lock()
            .expect("supervisor lock poisoned")
            .extend(tasks);
        tracing::info!("supervisor started");
        Ok(supervisor)
    }

    /// Fold warning-grade events into the bounded ring
    async fn collect_warnings(
        ring: Arc<WarningRing>,
        mut events: broadcast::Receiver<Event>,
        cancel: CancellationToken,
    ) {
        loop {
            tokio::select! {
                received = events.recv() => {
                    let Ok(event) = received else { continue };
                    match event {
                        Event::JobFailed { id, reason } => {
                            ring.push(format!("job {id} failed: {reason}"));
                        }
                        Event::Encrypted { id } => {
                            ring.push(format!("job {id} needs a password"));
                        }
                        Event::ServerDisabled { server, required } => {
                            ring.push(format!(
                                "server {server} disabled after login failure{}",
                                if required { " (required: downloads paused)" } else { "" }
                            ));
                        }
                        Event::ServerParked { server } => {
                            ring.push(format!("server {server} parked: quota exhausted"));
                        }
                        Event::DuplicateDetected { name, existing } => {
                            ring.push(format!("{name} duplicates {existing}"));
                        }
                        _ => {}
                    }
                }
                _ = cancel.cancelled() => break,
            }
        }
    }

    /// Hand download-complete jobs from the queue to the post-processor
    async fn route_completions(
        self: Arc<Self>,
        mut complete_rx: mpsc::UnboundedReceiver<JobId>,
        cancel: CancellationToken,
    ) {
        loop {
            tokio::select! {
                received = complete_rx.recv() => {
                    let Some(id) = received else { break };
                    self.event_tx.send(Event::DownloadComplete { id: id.clone() }).ok();
                    match self.queue.take_for_postproc(&id) {
                        Ok(job) => {
                            self.pp_tx.send(job).ok();
                        }
                        Err(e) => {
                            // Already taken or deleted; nothing to route
                            tracing::debug!(job = %id, error = %e, "completion for absent job");
                        }
                    }
                }
                _ = cancel.cancelled() => break,
            }
        }
    }

    /// Jobs aborted by the downloader go straight to failed history
    async fn route_failures(
        self: Arc<Self>,
        mut failed_rx: mpsc::UnboundedReceiver<(JobId, String)>,
        cancel: CancellationToken,
    ) {
        loop {
            tokio::select! {
                received = failed_rx.recv() => {
                    let Some((id, reason)) = received else { break };
                    if let Err(e) = self.fail_to_history(&id, &reason).await {
                        tracing::error!(job = %id, error = %e, "failed to record aborted job");
                    }
                }
                _ = cancel.cancelled() => break,
            }
        }
    }

    /// Disk-full: pause downloading and install the free-space watcher
    async fn route_disk_full(
        self: Arc<Self>,
        mut disk_full_rx: mpsc::UnboundedReceiver<u64>,
        cancel: CancellationToken,
    ) {
        loop {
            tokio::select! {
                received = disk_full_rx.recv() => {
                    let Some(required) = received else { break };
                    tracing::warn!(required, "disk full: pausing downloads");
                    self.pause.pause_disk_full();
                    self.event_tx.send(Event::DownloadPaused).ok();
                    self.scheduler.watch_free_space(required);
                }
                _ = cancel.cancelled() => break,
            }
        }
    }

    /// Safety-net queue snapshot, in addition to the per-mutation writes
    async fn periodic_persist(self: Arc<Self>, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(30)) => {
                    if let Err(e) = self.queue.persist() {
                        tracing::warn!(error = %e, "periodic queue persist failed");
                    }
                }
                _ = cancel.cancelled() => break,
            }
        }
    }

    /// Admit a parsed job descriptor.
    ///
    /// Runs duplicate detection against the queue and history, creates the
    /// admin directory with the compressed NZB copy and the attribute file,
    /// and inserts the job at its tier.
    pub async fn add_job(
        &self,
        name: &str,
        files: Vec<NzbFile>,
        nzb_xml: Option<&[u8]>,
        options: AddJobOptions,
    ) -> Result<JobId> {
        if self.cancel.is_cancelled() {
            return Err(Error::ShuttingDown);
        }

        let mut job = NzbObject::from_parts(
            name,
            files,
            &self.config.folders.admin_dir,
            options.password,
        );
        job.state = JobState::Grabbing;
        job.category = options.category;
        if let Some(category) = &job.category {
            if let Some(cat_config) = self.config.categories.get(category) {
                if let Some(priority) = cat_config.priority {
                    job.priority = priority;
                }
                if let Some(pp) = cat_config.post_process {
                    job.post_proc = pp;
                }
            }
        }
        if let Some(priority) = options.priority {
            job.priority = priority;
        }
        if let Some(pp) = options.post_proc {
            job.post_proc = pp;
        }
        job.url = options.url;

        // Admin dir exists for the whole life of the job in the system
        let admin = JobAdmin::create(&job.admin_dir)?;
        if let Some(xml) = nzb_xml {
            admin.save_nzb_gz(&job.name, xml)?;
        }
        admin.save_attributes(&JobAttributes {
            category: job.category.clone(),
            priority: Some(job.priority),
            password: job.password.clone(),
            url: job.url.clone(),
            extra: Vec::new(),
        })?;
        for file in job.files.iter().chain(&job.extra_par2) {
            admin.save_nzf(file)?;
        }

        let history_duplicate = self.history.find_duplicate(&job.duplicate_key).await?;
        job.state = JobState::Queued;
        let name_for_event = job.name.clone();
        let position = if options.top {
            AddPosition::Top
        } else {
            AddPosition::Bottom
        };

        let (id, outcome) = self.queue.add(
            job,
            position,
            self.config.processing.duplicate_action,
            history_duplicate,
        )?;

        match outcome {
            AdmissionOutcome::Admitted => {}
            AdmissionOutcome::AdmittedPaused { existing }
            | AdmissionOutcome::AdmittedTagged { existing } => {
                self.event_tx
                    .send(Event::DuplicateDetected {
                        name: name_for_event.clone(),
                        existing,
                    })
                    .ok();
            }
            AdmissionOutcome::Refused { existing } => {
                self.event_tx
                    .send(Event::DuplicateDetected {
                        name: name_for_event.clone(),
                        existing,
                    })
                    .ok();
                return Err(Error::Duplicate(format!(
                    "{name_for_event} duplicates an existing entry"
                )));
            }
        }

        self.event_tx
            .send(Event::Queued {
                id: id.clone(),
                name: name_for_event,
            })
            .ok();
        Ok(id)
    }

    /// Pause downloading globally
    pub fn pause_all(&self) {
        self.pause.pause_user();
        self.event_tx.send(Event::DownloadPaused).ok();
    }

    /// Resume downloading globally
    pub fn resume_all(&self) {
        self.pause.resume_user();
        self.event_tx.send(Event::DownloadResumed).ok();
    }

    /// Resume downloading in `minutes` (stale timers never fire)
    pub fn resume_in(&self, minutes: u64) {
        self.scheduler.resume_in(minutes);
    }

    /// Pause one job
    pub fn pause_job(&self, id: &JobId) -> Result<()> {
        self.queue.pause_job(id, true)
    }

    /// Resume one job; a job that already finished downloading goes straight
    /// to post-processing (the encrypted-pause path re-enters here once the
    /// password is set).
    pub fn resume_job(&self, id: &JobId) -> Result<()> {
        self.queue.resume_job(id)?;
        self.pause.resume_postproc_flag();
        let complete = self
            .queue
            .with_job(id, NzbObject::download_complete)
            .unwrap_or(false);
        if complete {
            let job = self.queue.take_for_postproc(id)?;
            self.pp_tx.send(job).ok();
        }
        Ok(())
    }

    /// Set a job's password (for the encrypted-pause recovery path)
    pub fn set_job_password(&self, id: &JobId, password: Option<String>) -> Result<()> {
        self.queue.with_job_mut(id, |j| j.password = password)
    }

    /// Change a job's priority tier
    pub fn set_priority(&self, id: &JobId, priority: Priority) -> Result<()> {
        self.queue.set_priority(id, priority)
    }

    /// Change a job's category
    pub fn set_category(&self, id: &JobId, category: Option<String>) -> Result<()> {
        self.queue.set_category(id, category)
    }

    /// Delete a job: fence dispatch, drop cached bytes, remove from the
    /// queue, and best-effort delete its directories.
    pub fn delete_job(&self, id: &JobId) -> Result<()> {
        let job = self.queue.remove(id)?;
        self.cache.drop_job(id);

        let incomplete = self.config.folders.incomplete_dir.join(&job.name);
        if incomplete.exists() {
            if let Err(e) = std::fs::remove_dir_all(&incomplete) {
                tracing::warn!(job = %id, error = %e, "failed to remove incomplete dir");
            }
        }
        if let Ok(admin) = JobAdmin::create(&job.admin_dir) {
            if let Err(e) = admin.delete() {
                tracing::warn!(job = %id, error = %e, "failed to remove admin dir");
            }
        }

        self.event_tx.send(Event::Removed { id: id.clone() }).ok();
        Ok(())
    }

    /// Remove a job from the queue and record it failed in history
    pub async fn fail_to_history(&self, id: &JobId, reason: &str) -> Result<()> {
        let job = self.queue.fail_job(id, reason)?;
        self.cache.drop_job(id);
        self.history
            .append(
                &job,
                HistoryStatus::Failed,
                None,
                Duration::default(),
                Duration::default(),
            )
            .await?;
        let admin = JobAdmin::create(&job.admin_dir)?;
        admin.delete()?;
        self.event_tx
            .send(Event::JobFailed {
                id: id.clone(),
                reason: reason.to_string(),
            })
            .ok();
        Ok(())
    }

    /// Subscribe to the event stream
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.event_tx.subscribe()
    }

    /// Per-job snapshots in queue order
    pub fn jobs(&self) -> Vec<crate::types::JobInfo> {
        self.queue.jobs_info()
    }

    /// Read-only snapshot of the recent-warning ring
    pub fn warnings(&self) -> Vec<Warning> {
        self.warnings.snapshot()
    }

    /// Aggregate queue statistics with live speed readings
    pub fn stats(&self) -> QueueStats {
        let mut stats = self.queue.stats();
        stats.speed_limit_bps = self.downloader.speed_limiter().get_limit();
        stats.paused_globally = self.pause.download_paused();
        stats
    }

    /// Change the global speed limit
    pub fn set_speed_limit(&self, limit_bps: Option<u64>) {
        self.downloader.speed_limiter().set_limit(limit_bps);
        self.event_tx
            .send(Event::SpeedLimitChanged { limit_bps })
            .ok();
    }

    /// List history records
    pub async fn history_list(
        &self,
        filter: &HistoryFilter,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<HistoryRecord>> {
        self.history.list(filter, limit, offset).await
    }

    /// Re-enable a disabled server and clear the auth pause
    pub fn enable_server(&self, server: crate::types::ServerId) {
        self.pool.enable(server);
        self.pause.clear_auth();
    }

    /// The incomplete-directory path of a job, for diagnostics
    pub fn incomplete_dir(&self) -> PathBuf {
        self.config.folders.incomplete_dir.clone()
    }

    /// Shut down: stop accepting work, cancel tasks, wait out the grace
    /// period, then abort whatever is left.
    pub async fn shutdown(&self, grace: Duration) {
        tracing::info!("shutdown initiated");
        self.event_tx.send(Event::Shutdown).ok();

        if let Err(e) = self.queue.persist() {
            tracing::warn!(error = %e, "final queue persist failed");
        }
        self.cancel.cancel();

        let tasks: Vec<_> = {
            #[allow(clippy::expect_used)]
            let mut guard = self.tasks.lock().expect("supervisor lock poisoned");
            guard.drain(..).collect()
        };
        let all = futures::future::join_all(tasks.into_iter().map(|t| async move {
            // Abort on the way out if the task outlives the grace period
            t.await.ok();
        }));
        if tokio::time::timeout(grace, all).await.is_err() {
            tracing::warn!("grace period elapsed, forcing shutdown");
        }
        tracing::info!("shutdown complete");
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::nzb::tests::make_file;

    async fn start_supervisor(configure: impl FnOnce(&mut Config)) -> (Arc<Supervisor>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.folders.admin_dir = dir.path().join("admin");
        config.folders.incomplete_dir = dir.path().join("incomplete");
        config.folders.complete_dir = dir.path().join("complete");
        configure(&mut config);

        let supervisor = Supervisor::start(config).await.unwrap();
        (supervisor, dir)
    }

    #[tokio::test]
    async fn pause_state_combines_causes() {
        let pause = PauseState::new();
        assert!(!pause.download_paused());

        pause.pause_user();
        pause.pause_disk_full();
        assert!(pause.download_paused());

        // Clearing one cause is not enough
        pause.resume_disk_full();
        assert!(pause.download_paused());
        pause.resume_user();
        assert!(!pause.download_paused());
    }

    #[tokio::test]
    async fn postproc_flag_is_independent_of_download_pause() {
        let pause = PauseState::new();
        pause.pause_postproc_flag();
        assert!(pause.postproc_paused());
        assert!(!pause.download_paused());
    }

    #[test]
    fn warning_ring_drops_oldest_beyond_capacity() {
        let ring = WarningRing::new(3);
        for i in 0..5 {
            ring.push(format!("warning {i}"));
        }
        let snapshot = ring.snapshot();
        assert_eq!(snapshot.len(), 3);
        assert_eq!(snapshot[0].text, "warning 2", "oldest two fell out");
        assert_eq!(snapshot[2].text, "warning 4");
    }

    #[tokio::test]
    async fn failed_job_reaches_the_warning_ring() {
        let (supervisor, _dir) = start_supervisor(|_| {}).await;
        let id = supervisor
            .add_job(
                "Ring Test",
                vec![make_file(0, 1, 100)],
                None,
                AddJobOptions::default(),
            )
            .await
            .unwrap();

        supervisor.fail_to_history(&id, "gone").await.unwrap();

        // The collector task runs concurrently; give it a moment
        tokio::time::sleep(Duration::from_millis(100)).await;
        let warnings = supervisor.warnings();
        assert!(
            warnings.iter().any(|w| w.text.contains("gone")),
            "ring should hold the failure, got {warnings:?}"
        );
        supervisor.shutdown(Duration::from_secs(5)).await;
    }

    #[tokio::test]
    async fn add_job_creates_admin_state_and_emits_event() {
        let (supervisor, dir) = start_supervisor(|_| {}).await;
        let mut events = supervisor.subscribe();

        let id = supervisor
            .add_job(
                "My Release",
                vec![make_file(0, 3, 1000)],
                Some(b"<nzb>source</nzb>"),
                AddJobOptions {
                    category: Some("tv".into()),
                    priority: Some(Priority::High),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let event = events.recv().await.unwrap();
        assert!(matches!(event, Event::Queued { id: ref e, .. } if *e == id));

        let admin_dir = dir
            .path()
            .join("admin")
            .join("My Release")
            .join("__ADMIN__");
        assert!(admin_dir.join("My Release.nzb.gz").exists());
        assert!(admin_dir.join("SABnzbd_attrib").exists());
        assert!(admin_dir.join("SABnzbd_nzf_nzf_0").exists());

        let admin = JobAdmin::create(&admin_dir).unwrap();
        let attrs = admin.load_attributes().unwrap();
        assert_eq!(attrs.category.as_deref(), Some("tv"));
        assert_eq!(attrs.priority, Some(Priority::High));
    }

    #[tokio::test]
    async fn duplicate_fail_policy_refuses_second_copy() {
        let (supervisor, _dir) = start_supervisor(|c| {
            c.processing.duplicate_action = crate::config::DuplicateAction::Fail;
        })
        .await;

        supervisor
            .add_job(
                "Same Thing",
                vec![make_file(0, 2, 500)],
                None,
                AddJobOptions::default(),
            )
            .await
            .unwrap();

        let result = supervisor
            .add_job(
                "Same Thing",
                vec![make_file(0, 2, 500)],
                None,
                AddJobOptions::default(),
            )
            .await;
        assert!(matches!(result, Err(Error::Duplicate(_))));
        assert_eq!(supervisor.queue.len(), 1);
    }

    #[tokio::test]
    async fn category_defaults_apply_at_admission() {
        let (supervisor, _dir) = start_supervisor(|c| {
            c.categories.insert(
                "movies".to_string(),
                crate::config::CategoryConfig {
                    destination: None,
                    post_process: Some(crate::types::PostProcLevel::Repair),
                    priority: Some(Priority::Low),
                    script: None,
                },
            );
        })
        .await;

        let id = supervisor
            .add_job(
                "Filmed",
                vec![make_file(0, 1, 100)],
                None,
                AddJobOptions {
                    category: Some("movies".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let (priority, pp) = supervisor
            .queue
            .with_job(&id, |j| (j.priority, j.post_proc))
            .unwrap();
        assert_eq!(priority, Priority::Low);
        assert_eq!(pp, crate::types::PostProcLevel::Repair);
    }

    #[tokio::test]
    async fn delete_job_purges_everything() {
        let (supervisor, dir) = start_supervisor(|_| {}).await;
        let id = supervisor
            .add_job(
                "Doomed",
                vec![make_file(0, 2, 500)],
                Some(b"<nzb/>"),
                AddJobOptions::default(),
            )
            .await
            .unwrap();

        // Simulate some cached bytes and on-disk data
        supervisor.cache.put(&id, 0, 0, vec![0u8; 64]).await;
        let incomplete = dir.path().join("incomplete").join("Doomed");
        std::fs::create_dir_all(&incomplete).unwrap();
        std::fs::write(incomplete.join("file0.bin"), b"partial").unwrap();

        supervisor.delete_job(&id).unwrap();

        assert_eq!(supervisor.cache.tracked_bytes(), 0);
        assert!(supervisor.queue.is_empty());
        assert!(!incomplete.exists());
        assert!(!dir
            .path()
            .join("admin")
            .join("Doomed")
            .join("__ADMIN__")
            .exists());
    }

    #[tokio::test]
    async fn fail_to_history_records_reason_and_cleans_up() {
        let (supervisor, _dir) = start_supervisor(|_| {}).await;
        let id = supervisor
            .add_job(
                "Unlucky",
                vec![make_file(0, 2, 500)],
                None,
                AddJobOptions::default(),
            )
            .await
            .unwrap();

        supervisor
            .fail_to_history(&id, "too many missing articles")
            .await
            .unwrap();

        assert!(supervisor.queue.is_empty());
        let record = supervisor.history.get(&id).await.unwrap().unwrap();
        assert_eq!(record.status, "Failed");
        assert_eq!(record.fail_message, "too many missing articles");
    }

    #[tokio::test]
    async fn stats_reflect_pause_and_limits() {
        let (supervisor, _dir) = start_supervisor(|_| {}).await;
        supervisor.pause_all();
        supervisor.set_speed_limit(Some(1_000_000));

        let stats = supervisor.stats();
        assert!(stats.paused_globally);
        assert_eq!(stats.speed_limit_bps, Some(1_000_000));

        supervisor.resume_all();
        assert!(!supervisor.stats().paused_globally);
    }

    #[tokio::test]
    async fn shutdown_finishes_within_grace() {
        let (supervisor, _dir) = start_supervisor(|_| {}).await;
        let started = std::time::Instant::now();
        supervisor.shutdown(Duration::from_secs(5)).await;
        assert!(
            started.elapsed() < Duration::from_secs(5),
            "idle engine must shut down promptly"
        );
        // After shutdown new jobs are refused
        let result = supervisor
            .add_job("late", vec![make_file(0, 1, 10)], None, AddJobOptions::default())
            .await;
        assert!(matches!(result, Err(Error::ShuttingDown)));
    }

    #[tokio::test]
    async fn queue_restored_across_restart() {
        let dir = tempfile::tempdir().unwrap();
        let make_config = || {
            let mut config = Config::default();
            config.folders.admin_dir = dir.path().join("admin");
            config.folders.incomplete_dir = dir.path().join("incomplete");
            config.folders.complete_dir = dir.path().join("complete");
            config
        };

        let id;
        {
            let supervisor = Supervisor::start(make_config()).await.unwrap();
            id = supervisor
                .add_job(
                    "Survivor",
                    vec![make_file(0, 2, 500)],
                    None,
                    AddJobOptions::default(),
                )
                .await
                .unwrap();
            supervisor.shutdown(Duration::from_secs(5)).await;
        }

        let supervisor = Supervisor::start(make_config()).await.unwrap();
        assert_eq!(supervisor.queue.job_ids(), vec![id]);
        supervisor.shutdown(Duration::from_secs(5)).await;
    }
}
