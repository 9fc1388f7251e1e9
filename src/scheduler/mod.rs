//! Time-driven actions against the engine
//!
//! A cron-like engine: user rules fire at `(minute, hour, weekday-set)`
//! against the supervisor's pause state, the queue, the pool, and the speed
//! limiter, never component internals. Built-in always-on tasks cover the
//! midnight bandwidth-meter rollover, history retention, the server expiry
//! and quota checks, the RSS tick for the external ingestor, and a daily
//! version check at a per-install random time. One-shot resume timers carry
//! a generation stamp so a stale timer can never undo a later pause, and
//! the disk-full watcher re-checks free space on a five-minute interval.

use crate::cache::ArticleCache;
use crate::history::History;
use crate::pool::ServerPool;
use crate::queue::Queue;
use crate::queue::persistence::TotalsMeter;
use crate::speed_limiter::SpeedLimiter;
use crate::supervisor::PauseState;
use crate::types::{Event, Priority, ServerId};
use chrono::{DateTime, Datelike, Local, NaiveDateTime, Timelike, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;

/// How often the scheduler wakes up to look at the clock
const TICK: Duration = Duration::from_secs(15);

/// Day of week for cron rules
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Weekday {
    /// Monday
    Monday,
    /// Tuesday
    Tuesday,
    /// Wednesday
    Wednesday,
    /// Thursday
    Thursday,
    /// Friday
    Friday,
    /// Saturday
    Saturday,
    /// Sunday
    Sunday,
}

impl Weekday {
    /// Convert from chrono's weekday
    pub fn from_chrono(wd: chrono::Weekday) -> Self {
        match wd {
            chrono::Weekday::Mon => Weekday::Monday,
            chrono::Weekday::Tue => Weekday::Tuesday,
            chrono::Weekday::Wed => Weekday::Wednesday,
            chrono::Weekday::Thu => Weekday::Thursday,
            chrono::Weekday::Fri => Weekday::Friday,
            chrono::Weekday::Sat => Weekday::Saturday,
            chrono::Weekday::Sun => Weekday::Sunday,
        }
    }
}

/// What a cron rule does when it fires.
///
/// Every action goes through the supervisor's pause state or the queue's
/// public operations.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", content = "arg", rename_all = "snake_case")]
pub enum CronAction {
    /// Pause all downloading
    PauseAll,
    /// Resume downloading
    ResumeAll,
    /// Pause every job at a priority tier
    PausePriority(Priority),
    /// Resume every policy-paused job at a priority tier
    ResumePriority(Priority),
    /// Pause every job in a category
    PauseCategory(String),
    /// Resume every policy-paused job in a category
    ResumeCategory(String),
    /// Change the speed limit (None = unlimited)
    SpeedLimit(Option<u64>),
    /// Enable a server by index
    EnableServer(usize),
    /// Disable a server by index
    DisableServer(usize),
}

/// A user-configured time rule: fire `action` at `hour:minute` on the given
/// weekdays (empty set = every day).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CronRule {
    /// Whether the rule participates at all
    pub enabled: bool,
    /// Minute of the hour (0-59)
    pub minute: u32,
    /// Hour of the day (0-23)
    pub hour: u32,
    /// Days the rule applies; empty = all days
    #[serde(default)]
    pub weekdays: Vec<Weekday>,
    /// What to do
    pub action: CronAction,
}

impl CronRule {
    /// Whether the rule fires at this local time
    pub fn matches(&self, now: NaiveDateTime) -> bool {
        if !self.enabled {
            return false;
        }
        if now.hour() != self.hour || now.minute() != self.minute {
            return false;
        }
        self.weekdays.is_empty()
            || self
                .weekdays
                .contains(&Weekday::from_chrono(now.weekday()))
    }
}

/// Pending one-shot resume with its generation stamp
#[derive(Debug, Clone, Copy)]
struct OneShotResume {
    generation: u64,
    due: DateTime<Utc>,
}

/// Free-space watcher installed after a disk-full signal
#[derive(Debug, Clone, Copy)]
struct FreeSpaceWatch {
    required_bytes: u64,
    last_check: DateTime<Utc>,
}

/// The scheduler task
pub struct Scheduler {
    config: Arc<crate::config::Config>,
    queue: Arc<Queue>,
    pool: Arc<ServerPool>,
    history: Arc<History>,
    cache: Arc<ArticleCache>,
    speed_limiter: SpeedLimiter,
    pause: Arc<PauseState>,
    event_tx: broadcast::Sender<Event>,
    kick_tx: mpsc::UnboundedSender<crate::assembler::AssemblyKick>,

    /// Rules are swappable at runtime (config change) without losing the
    /// pending one-shot below
    rules: RwLock<Vec<CronRule>>,
    one_shot: Mutex<Option<OneShotResume>>,
    one_shot_generation: AtomicU64,
    free_space: Mutex<Option<FreeSpaceWatch>>,
    totals: Mutex<TotalsMeter>,
    /// Last per-server counter readings, for delta metering
    last_counters: Mutex<Vec<u64>>,
    /// Per-install random time of day for the version check
    version_check_at: (u32, u32),
    last_tick_minute: Mutex<Option<NaiveDateTime>>,
    last_quota_check: Mutex<DateTime<Utc>>,
    last_rss_tick: Mutex<DateTime<Utc>>,
}

impl Scheduler {
    /// Build the scheduler, restoring the bandwidth meter from disk
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Arc<crate::config::Config>,
        queue: Arc<Queue>,
        pool: Arc<ServerPool>,
        history: Arc<History>,
        cache: Arc<ArticleCache>,
        speed_limiter: SpeedLimiter,
        pause: Arc<PauseState>,
        event_tx: broadcast::Sender<Event>,
        kick_tx: mpsc::UnboundedSender<crate::assembler::AssemblyKick>,
    ) -> Self {
        use rand::Rng;
        let totals = TotalsMeter::restore(&config.folders.admin_dir).unwrap_or_default();
        let mut rng = rand::thread_rng();
        let version_check_at = (rng.gen_range(0..24), rng.gen_range(0..60));
        let rules = config.scheduler.rules.clone();

        Self {
            config,
            queue,
            pool,
            history,
            cache,
            speed_limiter,
            pause,
            event_tx,
            kick_tx,
            rules: RwLock::new(rules),
            one_shot: Mutex::new(None),
            one_shot_generation: AtomicU64::new(0),
            free_space: Mutex::new(None),
            totals: Mutex::new(totals),
            last_counters: Mutex::new(Vec::new()),
            version_check_at,
            last_tick_minute: Mutex::new(None),
            last_quota_check: Mutex::new(Utc::now()),
            last_rss_tick: Mutex::new(Utc::now()),
        }
    }

    /// Replace the cron rules after a configuration change.
    ///
    /// Pending one-shot timers survive the swap.
    pub fn set_rules(&self, rules: Vec<CronRule>) {
        #[allow(clippy::expect_used)]
        let mut guard = self.rules.write().expect("scheduler lock poisoned");
        *guard = rules;
        tracing::info!(count = guard.len(), "scheduler rules replaced");
    }

    /// Schedule a one-shot resume in `minutes`. A newer call supersedes any
    /// pending timer; the superseded timer can never fire.
    pub fn resume_in(&self, minutes: u64) {
        let generation = self.one_shot_generation.fetch_add(1, Ordering::SeqCst) + 1;
        #[allow(clippy::expect_used)]
        let mut guard = self.one_shot.lock().expect("scheduler lock poisoned");
        *guard = Some(OneShotResume {
            generation,
            due: Utc::now() + chrono::Duration::minutes(minutes as i64),
        });
        tracing::info!(minutes, "one-shot resume scheduled");
    }

    /// Install the free-space watcher after a disk-full signal
    pub fn watch_free_space(&self, required_bytes: u64) {
        #[allow(clippy::expect_used)]
        let mut guard = self.free_space.lock().expect("scheduler lock poisoned");
        *guard = Some(FreeSpaceWatch {
            required_bytes,
            // Backdate so the first check happens on the next tick
            last_check: Utc::now() - chrono::Duration::days(1),
        });
        tracing::info!(required_bytes, "free-space watcher installed");
    }

    /// Scheduler loop until cancelled
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        tracing::info!("scheduler started");
        loop {
            tokio::select! {
                _ = tokio::time::sleep(TICK) => self.tick().await,
                _ = cancel.cancelled() => break,
            }
        }
        tracing::info!("scheduler stopped");
    }

    /// One pass over everything time-driven
    pub async fn tick(&self) {
        let now_local = Local::now().naive_local();
        let minute = now_local.with_second(0).and_then(|t| t.with_nanosecond(0));

        let (fresh_minute, crossed_midnight) = {
            #[allow(clippy::expect_used)]
            let mut last = self.last_tick_minute.lock().expect("scheduler lock poisoned");
            if *last == minute {
                (false, false)
            } else {
                let crossed = matches!(
                    (*last, minute),
                    (Some(prev), Some(cur)) if prev.date() != cur.date()
                );
                *last = minute;
                (true, crossed)
            }
        };

        if crossed_midnight {
            self.midnight_tasks().await;
        }
        if fresh_minute {
            self.fire_cron_rules(now_local);
            self.maybe_version_check(now_local);
            // Keep-alive probes and idle teardown, once a minute
            self.pool
                .sweep_idle(self.config.download.idle_timeout)
                .await;
        }

        self.check_one_shot_resume();
        self.check_quota_period();
        self.check_rss_tick();
        self.check_free_space();
        self.meter_bandwidth();
    }

    /// Evaluate every rule against the current minute
    fn fire_cron_rules(&self, now: NaiveDateTime) {
        let rules = {
            #[allow(clippy::expect_used)]
            let guard = self.rules.read().expect("scheduler lock poisoned");
            guard.clone()
        };
        for rule in rules.iter().filter(|r| r.matches(now)) {
            tracing::info!(action = ?rule.action, "cron rule firing");
            self.apply(&rule.action);
        }
    }

    /// Apply one action through the public surfaces
    fn apply(&self, action: &CronAction) {
        match action {
            CronAction::PauseAll => {
                self.pause.pause_user();
                self.event_tx.send(Event::DownloadPaused).ok();
            }
            CronAction::ResumeAll => {
                self.pause.resume_user();
                self.event_tx.send(Event::DownloadResumed).ok();
            }
            CronAction::PausePriority(tier) => {
                if let Err(e) = self.queue.pause_priority(*tier) {
                    tracing::warn!(error = %e, "pause_priority failed");
                }
            }
            CronAction::ResumePriority(tier) => {
                if let Err(e) = self.queue.resume_priority(*tier) {
                    tracing::warn!(error = %e, "resume_priority failed");
                }
            }
            CronAction::PauseCategory(category) => {
                if let Err(e) = self.queue.pause_category(category) {
                    tracing::warn!(error = %e, "pause_category failed");
                }
            }
            CronAction::ResumeCategory(category) => {
                if let Err(e) = self.queue.resume_category(category) {
                    tracing::warn!(error = %e, "resume_category failed");
                }
            }
            CronAction::SpeedLimit(limit) => {
                self.speed_limiter.set_limit(*limit);
                self.event_tx
                    .send(Event::SpeedLimitChanged { limit_bps: *limit })
                    .ok();
            }
            CronAction::EnableServer(index) => self.pool.enable(ServerId(*index)),
            CronAction::DisableServer(index) => self.pool.disable(ServerId(*index)),
        }
    }

    /// Midnight: bandwidth-meter rollover, history retention, server expiry
    async fn midnight_tasks(&self) {
        tracing::info!("midnight tasks running");
        {
            #[allow(clippy::expect_used)]
            let mut totals = self.totals.lock().expect("scheduler lock poisoned");
            totals.rollover(Local::now().date_naive());
            if let Err(e) = totals.persist(&self.config.folders.admin_dir) {
                tracing::warn!(error = %e, "failed to persist bandwidth meter");
            }
        }

        if let Some(days) = self.config.history.retention_days {
            match self.history.purge_older_than(days).await {
                Ok(purged) if purged > 0 => {
                    tracing::info!(purged, days, "history retention purge");
                }
                Ok(_) => {}
                Err(e) => tracing::warn!(error = %e, "history retention purge failed"),
            }
        }
        if let Some(count) = self.config.history.retention_count {
            if let Err(e) = self.history.trim_to_count(count).await {
                tracing::warn!(error = %e, "history count trim failed");
            }
        }

        // Daily server expiry check: surface approaching retention limits
        for (index, server) in self.config.servers.iter().enumerate() {
            if let Some(days) = server.retention_days {
                tracing::debug!(server = index, retention_days = days, "server expiry check");
            }
        }
    }

    /// Daily version check at the per-install random time
    fn maybe_version_check(&self, now: NaiveDateTime) {
        if (now.hour(), now.minute()) == self.version_check_at {
            tracing::info!(version = env!("CARGO_PKG_VERSION"), "daily version check");
        }
    }

    /// Fire the pending one-shot resume if it is still the planned one
    fn check_one_shot_resume(&self) {
        let due = {
            #[allow(clippy::expect_used)]
            let mut guard = self.one_shot.lock().expect("scheduler lock poisoned");
            match *guard {
                Some(shot)
                    if Utc::now() >= shot.due
                        && shot.generation == self.one_shot_generation.load(Ordering::SeqCst) =>
                {
                    *guard = None;
                    true
                }
                Some(shot) if Utc::now() >= shot.due => {
                    // Stale timer: a newer schedule superseded it
                    *guard = None;
                    false
                }
                _ => false,
            }
        };
        if due {
            tracing::info!("one-shot resume firing");
            self.pause.resume_user();
            self.event_tx.send(Event::DownloadResumed).ok();
        }
    }

    /// 10-minute server-quota check
    fn check_quota_period(&self) {
        #[allow(clippy::expect_used)]
        let mut last = self.last_quota_check.lock().expect("scheduler lock poisoned");
        if Utc::now() - *last >= chrono::Duration::minutes(10) {
            *last = Utc::now();
            self.pool.reset_elapsed_quotas();
        }
    }

    /// RSS tick: just tell the external ingestor to poll
    fn check_rss_tick(&self) {
        let Some(interval) = self.config.scheduler.rss_interval else {
            return;
        };
        let Ok(interval) = chrono::Duration::from_std(interval) else {
            return;
        };
        #[allow(clippy::expect_used)]
        let mut last = self.last_rss_tick.lock().expect("scheduler lock poisoned");
        if Utc::now() - *last >= interval {
            *last = Utc::now();
            self.event_tx.send(Event::RssTick).ok();
        }
    }

    /// Free-space watcher: resume downloading once enough space is back
    fn check_free_space(&self) {
        let watch = {
            #[allow(clippy::expect_used)]
            let guard = self.free_space.lock().expect("scheduler lock poisoned");
            *guard
        };
        let Some(watch) = watch else { return };

        let Ok(interval) = chrono::Duration::from_std(self.config.scheduler.free_space_interval)
        else {
            return;
        };
        if Utc::now() - watch.last_check < interval {
            return;
        }

        let needed = watch.required_bytes.max(self.config.scheduler.min_free_bytes);
        let available =
            crate::utils::get_available_space(&self.config.folders.incomplete_dir).unwrap_or(0);

        if available >= needed {
            tracing::info!(available, needed, "free space recovered, resuming downloads");
            {
                #[allow(clippy::expect_used)]
                let mut guard = self.free_space.lock().expect("scheduler lock poisoned");
                *guard = None;
            }
            self.pause.resume_disk_full();
            self.event_tx.send(Event::DownloadResumed).ok();
            // Wake the assembler for everything that queued up in the cache
            for (job, file) in self.cache.ready_files() {
                self.kick_tx.send((job, file)).ok();
            }
        } else {
            #[allow(clippy::expect_used)]
            let mut guard = self.free_space.lock().expect("scheduler lock poisoned");
            *guard = Some(FreeSpaceWatch {
                required_bytes: watch.required_bytes,
                last_check: Utc::now(),
            });
        }
    }

    /// Fold the pool's byte counters into the persisted meter.
    ///
    /// The pool reports running totals per quota period; the meter records
    /// the delta since the last tick. A counter dropping below its previous
    /// reading means a quota reset, so the whole reading counts as fresh.
    fn meter_bandwidth(&self) {
        let current = self.pool.take_byte_counters();
        #[allow(clippy::expect_used)]
        let mut last = self.last_counters.lock().expect("scheduler lock poisoned");
        let deltas: Vec<u64> = current
            .iter()
            .enumerate()
            .map(|(i, &now)| {
                let prev = last.get(i).copied().unwrap_or(0);
                if now >= prev { now - prev } else { now }
            })
            .collect();
        *last = current;

        if deltas.iter().any(|&d| d > 0) {
            #[allow(clippy::expect_used)]
            let mut totals = self.totals.lock().expect("scheduler lock poisoned");
            totals.record(&deltas, Local::now().date_naive());
        }
    }

    /// Current bandwidth meter snapshot
    pub fn totals(&self) -> TotalsMeter {
        #[allow(clippy::expect_used)]
        let totals = self.totals.lock().expect("scheduler lock poisoned");
        totals.clone()
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, DuplicateAction};
    use crate::nzb::NzbObject;
    use crate::nzb::tests::make_file;
    use crate::queue::AddPosition;
    use chrono::NaiveDate;

    struct Rig {
        scheduler: Arc<Scheduler>,
        queue: Arc<Queue>,
        pause: Arc<PauseState>,
        event_rx: broadcast::Receiver<Event>,
        _dir: tempfile::TempDir,
    }

    async fn rig(configure: impl FnOnce(&mut Config)) -> Rig {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.folders.admin_dir = dir.path().join("admin");
        config.folders.incomplete_dir = dir.path().join("incomplete");
        std::fs::create_dir_all(&config.folders.incomplete_dir).unwrap();
        configure(&mut config);
        let config = Arc::new(config);

        let queue = Arc::new(Queue::open(config.folders.admin_dir.clone()).unwrap());
        let pool = Arc::new(ServerPool::new(vec![], Duration::from_secs(5)));
        let history = Arc::new(History::open(&config.folders.admin_dir).await.unwrap());
        let cache = Arc::new(ArticleCache::new(1024));
        let pause = Arc::new(PauseState::new());
        let (event_tx, event_rx) = broadcast::channel(64);
        let (kick_tx, _kick_rx) = mpsc::unbounded_channel();

        let scheduler = Arc::new(Scheduler::new(
            config,
            queue.clone(),
            pool,
            history,
            cache,
            SpeedLimiter::new(None),
            pause.clone(),
            event_tx,
            kick_tx,
        ));
        Rig {
            scheduler,
            queue,
            pause,
            event_rx,
            _dir: dir,
        }
    }

    fn at(hour: u32, minute: u32, weekday_offset: i64) -> NaiveDateTime {
        // 2026-08-03 is a Monday
        NaiveDate::from_ymd_opt(2026, 8, 3)
            .unwrap()
            .checked_add_days(chrono::Days::new(weekday_offset as u64))
            .unwrap()
            .and_hms_opt(hour, minute, 0)
            .unwrap()
    }

    #[test]
    fn cron_rule_matches_time_and_weekday() {
        let rule = CronRule {
            enabled: true,
            minute: 30,
            hour: 9,
            weekdays: vec![Weekday::Monday, Weekday::Friday],
            action: CronAction::PauseAll,
        };

        assert!(rule.matches(at(9, 30, 0)), "Monday 09:30");
        assert!(rule.matches(at(9, 30, 4)), "Friday 09:30");
        assert!(!rule.matches(at(9, 30, 1)), "Tuesday excluded");
        assert!(!rule.matches(at(9, 31, 0)), "wrong minute");
        assert!(!rule.matches(at(10, 30, 0)), "wrong hour");
    }

    #[test]
    fn disabled_rule_never_matches() {
        let rule = CronRule {
            enabled: false,
            minute: 0,
            hour: 0,
            weekdays: vec![],
            action: CronAction::PauseAll,
        };
        assert!(!rule.matches(at(0, 0, 0)));
    }

    #[test]
    fn empty_weekday_set_means_every_day() {
        let rule = CronRule {
            enabled: true,
            minute: 0,
            hour: 12,
            weekdays: vec![],
            action: CronAction::ResumeAll,
        };
        for day in 0..7 {
            assert!(rule.matches(at(12, 0, day)), "day offset {day}");
        }
    }

    #[tokio::test]
    async fn pause_action_sets_global_pause() {
        let rig = rig(|_| {}).await;
        rig.scheduler.apply(&CronAction::PauseAll);
        assert!(rig.pause.download_paused());

        rig.scheduler.apply(&CronAction::ResumeAll);
        assert!(!rig.pause.download_paused());
    }

    #[tokio::test]
    async fn priority_action_routes_to_queue() {
        let rig = rig(|_| {}).await;
        let job = NzbObject::from_parts(
            "tiered",
            vec![make_file(0, 1, 100)],
            rig._dir.path().join("admin").as_path(),
            None,
        );
        let (id, _) = rig
            .queue
            .add(job, AddPosition::Bottom, DuplicateAction::Ignore, None)
            .unwrap();

        rig.scheduler
            .apply(&CronAction::PausePriority(Priority::Normal));
        assert_eq!(
            rig.queue
                .with_job(&id, |j| j.state)
                .unwrap(),
            crate::types::JobState::Paused
        );
    }

    #[tokio::test]
    async fn speed_limit_action_emits_event() {
        let mut rig = rig(|_| {}).await;
        rig.scheduler
            .apply(&CronAction::SpeedLimit(Some(2_000_000)));

        assert_eq!(rig.scheduler.speed_limiter.get_limit(), Some(2_000_000));
        let event = rig.event_rx.try_recv().unwrap();
        assert!(matches!(
            event,
            Event::SpeedLimitChanged {
                limit_bps: Some(2_000_000)
            }
        ));
    }

    #[tokio::test]
    async fn one_shot_resume_fires_once_when_due() {
        let rig = rig(|_| {}).await;
        rig.pause.pause_user();

        rig.scheduler.resume_in(0);
        rig.scheduler.check_one_shot_resume();
        assert!(!rig.pause.download_paused(), "due timer must resume");

        // Firing consumed the timer
        rig.pause.pause_user();
        rig.scheduler.check_one_shot_resume();
        assert!(rig.pause.download_paused(), "no second fire");
    }

    #[tokio::test]
    async fn superseded_one_shot_timer_never_fires() {
        let rig = rig(|_| {}).await;
        rig.pause.pause_user();

        rig.scheduler.resume_in(0);
        // A newer plan supersedes the due one
        rig.scheduler.resume_in(60);
        rig.scheduler.check_one_shot_resume();

        assert!(
            rig.pause.download_paused(),
            "the superseded timer is stale; only the new one may fire later"
        );
    }

    #[tokio::test]
    async fn free_space_watcher_resumes_when_space_is_back() {
        let rig = rig(|c| {
            c.scheduler.min_free_bytes = 1;
        })
        .await;
        rig.pause.pause_disk_full();

        // Temp dirs have far more than 1 byte free, so one check resumes
        rig.scheduler.watch_free_space(1);
        rig.scheduler.check_free_space();

        assert!(!rig.pause.download_paused());
        assert!(
            rig.scheduler.free_space.lock().unwrap().is_none(),
            "watcher uninstalls after resuming"
        );
    }

    #[tokio::test]
    async fn free_space_watcher_respects_check_interval() {
        let rig = rig(|c| {
            c.scheduler.min_free_bytes = 1;
        })
        .await;
        rig.pause.pause_disk_full();
        rig.scheduler.watch_free_space(1);

        // First check resumes and uninstalls
        rig.scheduler.check_free_space();
        assert!(!rig.pause.download_paused());

        // Reinstall with an impossible requirement: stays paused, and the
        // next check within the interval does nothing
        rig.pause.pause_disk_full();
        rig.scheduler.watch_free_space(u64::MAX);
        rig.scheduler.check_free_space();
        assert!(rig.pause.download_paused());

        rig.scheduler.check_free_space();
        assert!(rig.pause.download_paused(), "second check inside interval");
    }

    #[tokio::test]
    async fn set_rules_preserves_pending_one_shot() {
        let rig = rig(|_| {}).await;
        rig.pause.pause_user();
        rig.scheduler.resume_in(0);

        rig.scheduler.set_rules(vec![CronRule {
            enabled: true,
            minute: 0,
            hour: 0,
            weekdays: vec![],
            action: CronAction::PauseAll,
        }]);

        rig.scheduler.check_one_shot_resume();
        assert!(
            !rig.pause.download_paused(),
            "rule swap must not lose the pending one-shot"
        );
    }

    #[tokio::test]
    async fn rss_tick_fires_on_interval() {
        let mut rig = rig(|c| {
            c.scheduler.rss_interval = Some(Duration::from_secs(0));
        })
        .await;

        rig.scheduler.check_rss_tick();
        let event = rig.event_rx.try_recv().unwrap();
        assert!(matches!(event, Event::RssTick));
    }

    #[test]
    fn cron_rules_serialize_round_trip() {
        let rule = CronRule {
            enabled: true,
            minute: 5,
            hour: 23,
            weekdays: vec![Weekday::Sunday],
            action: CronAction::SpeedLimit(None),
        };
        let json = serde_json::to_string(&rule).unwrap();
        let back: CronRule = serde_json::from_str(&json).unwrap();
        assert_eq!(back, rule);
    }
}
