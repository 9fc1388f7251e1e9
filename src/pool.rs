//! Server pool: per-server connection slots, fitness, quota, and failover
//!
//! The pool holds every configured server with its runtime counters and a
//! set of pooled idle connections. The downloader asks for the fittest
//! server for an article, leases a connection, and returns it with the
//! outcome; the pool keeps the books (active counts, consumed bytes, quota
//! parking, disabling on auth failure).

use crate::config::{QuotaPeriod, ServerConfig};
use crate::error::FetchError;
use crate::nntp::resolver::Resolver;
use crate::nntp::{ConnectionState, NntpConnection};
use crate::nzb::Article;
use crate::types::ServerId;
use chrono::{DateTime, Datelike, Duration as ChronoDuration, TimeZone, Utc};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

/// Runtime state for one configured server
pub struct ServerState {
    /// The configuration this server was built from
    pub config: ServerConfig,
    /// Connections currently leased out
    active: AtomicUsize,
    /// Bytes fetched from this server in the current quota period
    bytes_consumed: AtomicU64,
    /// Set after an authentication failure or operator action
    disabled: AtomicBool,
    /// Parked until this time after crossing the quota
    parked_until: Mutex<Option<DateTime<Utc>>>,
    /// Idle connections ready for reuse
    idle: Mutex<Vec<NntpConnection>>,
}

impl ServerState {
    fn new(config: ServerConfig) -> Self {
        Self {
            config,
            active: AtomicUsize::new(0),
            bytes_consumed: AtomicU64::new(0),
            disabled: AtomicBool::new(false),
            parked_until: Mutex::new(None),
            idle: Mutex::new(Vec::new()),
        }
    }

    /// Whether the server is parked right now
    fn parked(&self) -> bool {
        #[allow(clippy::expect_used)]
        let parked = self.parked_until.lock().expect("pool lock poisoned");
        matches!(*parked, Some(until) if Utc::now() < until)
    }

    /// Whether the local quota byte budget is spent
    fn quota_spent(&self) -> bool {
        match self.config.quota_bytes {
            Some(quota) => self.bytes_consumed.load(Ordering::Relaxed) >= quota,
            None => false,
        }
    }
}

/// A leased connection; return it with [`ServerPool::release`].
pub struct ConnectionLease {
    /// The server the connection belongs to
    pub server: ServerId,
    /// The connection itself
    pub conn: NntpConnection,
}

/// All configured servers with their runtime state
pub struct ServerPool {
    servers: Vec<ServerState>,
    resolver: Resolver,
    network_timeout: Duration,
}

impl ServerPool {
    /// Build the pool from configuration. Server order defines the
    /// [`ServerId`] space.
    pub fn new(configs: Vec<ServerConfig>, network_timeout: Duration) -> Self {
        Self {
            servers: configs.into_iter().map(ServerState::new).collect(),
            resolver: Resolver::new(),
            network_timeout,
        }
    }

    /// Number of configured servers
    pub fn len(&self) -> usize {
        self.servers.len()
    }

    /// Whether the pool has no servers
    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }

    /// Access a server's state
    pub fn server(&self, id: ServerId) -> Option<&ServerState> {
        self.servers.get(id.0)
    }

    /// The highest-priority enabled server fit to try this article.
    ///
    /// Fit means: enabled and not disabled, not quota-parked, retention
    /// covers the article's age, quota has room, the server has not already
    /// failed this article, the fetcher-priority watermark allows it, and a
    /// connection slot is free.
    pub fn fitness(&self, article: &Article, article_date: DateTime<Utc>) -> Option<ServerId> {
        let age_days = (Utc::now() - article_date).num_days().max(0) as u32;

        let mut best: Option<(i32, ServerId)> = None;
        for (idx, server) in self.servers.iter().enumerate() {
            let id = ServerId(idx);
            if !server.config.enabled || server.disabled.load(Ordering::Relaxed) {
                continue;
            }
            if server.parked() || server.quota_spent() {
                continue;
            }
            if let Some(retention) = server.config.retention_days {
                if age_days > retention {
                    continue;
                }
            }
            if article.tried.contains(&id) {
                continue;
            }
            // Failover never climbs back to a better-priority server than the
            // last one that tried this article
            if let Some(watermark) = article.fetcher_priority {
                if server.config.priority < watermark {
                    continue;
                }
            }
            if server.active.load(Ordering::Relaxed) >= server.config.connections {
                continue;
            }
            match best {
                Some((best_priority, _)) if best_priority <= server.config.priority => {}
                _ => best = Some((server.config.priority, id)),
            }
        }
        best.map(|(_, id)| id)
    }

    /// Whether any server could ever serve this article, ignoring free
    /// connection slots and temporary parking.
    ///
    /// When this returns false the article has exhausted its options and is
    /// permanently failed.
    pub fn any_fit(&self, article: &Article, article_date: DateTime<Utc>) -> bool {
        let age_days = (Utc::now() - article_date).num_days().max(0) as u32;
        self.servers.iter().enumerate().any(|(idx, server)| {
            let id = ServerId(idx);
            if !server.config.enabled || server.disabled.load(Ordering::Relaxed) {
                return false;
            }
            if let Some(retention) = server.config.retention_days {
                if age_days > retention {
                    return false;
                }
            }
            if article.tried.contains(&id) {
                return false;
            }
            if let Some(watermark) = article.fetcher_priority {
                if server.config.priority < watermark {
                    return false;
                }
            }
            true
        })
    }

    /// Lease a connection from `id`, reusing an idle one when possible.
    pub async fn acquire(&self, id: ServerId) -> Option<ConnectionLease> {
        let server = self.servers.get(id.0)?;
        if server.active.load(Ordering::Relaxed) >= server.config.connections {
            return None;
        }
        server.active.fetch_add(1, Ordering::SeqCst);

        let reused = {
            #[allow(clippy::expect_used)]
            let mut idle = server.idle.lock().expect("pool lock poisoned");
            let pos = idle.iter().position(NntpConnection::available);
            pos.map(|i| idle.swap_remove(i))
        };

        let conn = match reused {
            Some(conn) => conn,
            None => {
                // Pin the raced address for plain/insecure connections;
                // strict TLS keeps the hostname
                let pinned = self
                    .resolver
                    .resolve(&server.config.host, server.config.port)
                    .await
                    .ok();
                NntpConnection::new(id, &server.config, pinned, self.network_timeout)
            }
        };

        Some(ConnectionLease { server: id, conn })
    }

    /// Return a lease, updating counters from the outcome.
    ///
    /// On success the consumed-bytes counter grows and quota crossing parks
    /// the server until the period boundary. Auth failure disables the
    /// server. The returned effect tells the caller which event to emit.
    pub fn release(
        &self,
        mut lease: ConnectionLease,
        outcome: Result<u64, &FetchError>,
    ) -> ReleaseEffect {
        let Some(server) = self.servers.get(lease.server.0) else {
            return ReleaseEffect::None;
        };
        server.active.fetch_sub(1, Ordering::SeqCst);

        let mut effect = ReleaseEffect::None;
        match outcome {
            Ok(bytes) => {
                let consumed = server.bytes_consumed.fetch_add(bytes, Ordering::SeqCst) + bytes;
                if let Some(quota) = server.config.quota_bytes {
                    if consumed >= quota {
                        self.park(lease.server, quota_period_end(server.config.quota_period));
                        effect = ReleaseEffect::Parked;
                    }
                }
            }
            Err(FetchError::AuthFailed { .. }) => {
                self.disable(lease.server);
                effect = ReleaseEffect::Disabled {
                    required: server.config.required,
                };
            }
            Err(FetchError::QuotaExceeded { .. }) => {
                self.park(lease.server, quota_period_end(server.config.quota_period));
                effect = ReleaseEffect::Parked;
            }
            Err(_) => {}
        }

        if lease.conn.state() != ConnectionState::Closed
            && !server.disabled.load(Ordering::Relaxed)
        {
            #[allow(clippy::expect_used)]
            let mut idle = server.idle.lock().expect("pool lock poisoned");
            idle.push(lease.conn);
        } else {
            lease.conn.close();
        }

        effect
    }

    /// Park a server until the given time (quota crossing)
    pub fn park(&self, id: ServerId, until: DateTime<Utc>) {
        if let Some(server) = self.servers.get(id.0) {
            #[allow(clippy::expect_used)]
            let mut parked = server.parked_until.lock().expect("pool lock poisoned");
            *parked = Some(until);
            tracing::info!(server = %id, until = %until, "server parked until quota period reset");
        }
    }

    /// Disable a server (auth failure or operator action)
    pub fn disable(&self, id: ServerId) {
        if let Some(server) = self.servers.get(id.0) {
            server.disabled.store(true, Ordering::SeqCst);
            #[allow(clippy::expect_used)]
            let mut idle = server.idle.lock().expect("pool lock poisoned");
            for conn in idle.iter_mut() {
                conn.close();
            }
            idle.clear();
            tracing::warn!(server = %id, "server disabled");
        }
    }

    /// Re-enable a disabled server
    pub fn enable(&self, id: ServerId) {
        if let Some(server) = self.servers.get(id.0) {
            server.disabled.store(false, Ordering::SeqCst);
            tracing::info!(server = %id, "server enabled");
        }
    }

    /// Whether the server is currently disabled
    pub fn is_disabled(&self, id: ServerId) -> bool {
        self.servers
            .get(id.0)
            .is_some_and(|s| s.disabled.load(Ordering::Relaxed))
    }

    /// Reset quota accounting for servers whose period boundary has passed.
    ///
    /// Driven by the scheduler's 10-minute quota check.
    pub fn reset_elapsed_quotas(&self) {
        for (idx, server) in self.servers.iter().enumerate() {
            #[allow(clippy::expect_used)]
            let mut parked = server.parked_until.lock().expect("pool lock poisoned");
            if let Some(until) = *parked {
                if Utc::now() >= until {
                    *parked = None;
                    server.bytes_consumed.store(0, Ordering::SeqCst);
                    tracing::info!(server = idx, "quota period elapsed, server unparked");
                }
            }
        }
    }

    /// Roll every per-server byte counter, returning the totals.
    ///
    /// Driven by the scheduler's midnight bandwidth-meter rollover.
    pub fn take_byte_counters(&self) -> Vec<u64> {
        self.servers
            .iter()
            .map(|s| {
                // Quota accounting keeps running; the meter reads without reset
                s.bytes_consumed.load(Ordering::Relaxed)
            })
            .collect()
    }

    /// Total leased connections across all servers
    pub fn active_connections(&self) -> usize {
        self.servers
            .iter()
            .map(|s| s.active.load(Ordering::Relaxed))
            .sum()
    }

    /// Sum of connection limits across enabled servers
    pub fn connection_capacity(&self) -> usize {
        self.servers
            .iter()
            .filter(|s| s.config.enabled && !s.disabled.load(Ordering::Relaxed))
            .map(|s| s.config.connections)
            .sum()
    }

    /// Probe idle connections and drop the ones past the idle timeout
    pub async fn sweep_idle(&self, idle_timeout: Duration) {
        for server in &self.servers {
            let mut survivors = Vec::new();
            let drained: Vec<NntpConnection> = {
                #[allow(clippy::expect_used)]
                let mut idle = server.idle.lock().expect("pool lock poisoned");
                std::mem::take(&mut *idle)
            };
            for mut conn in drained {
                if conn.idle_expired(idle_timeout) {
                    conn.close();
                    continue;
                }
                conn.keepalive().await;
                if conn.state() != ConnectionState::Closed {
                    survivors.push(conn);
                }
            }
            #[allow(clippy::expect_used)]
            let mut idle = server.idle.lock().expect("pool lock poisoned");
            idle.extend(survivors);
        }
    }
}

/// What a release did to the server, for event emission by the caller
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReleaseEffect {
    /// Nothing beyond the usual counter updates
    None,
    /// The server crossed its quota and was parked
    Parked,
    /// The server was disabled after an authentication failure
    Disabled {
        /// Whether the server is flagged required
        required: bool,
    },
}

/// End of the current quota period
fn quota_period_end(period: QuotaPeriod) -> DateTime<Utc> {
    let now = Utc::now();
    match period {
        QuotaPeriod::Day => {
            let next = now.date_naive() + ChronoDuration::days(1);
            Utc.from_utc_datetime(&next.and_hms_opt(0, 0, 0).unwrap_or_default())
        }
        QuotaPeriod::Week => {
            let days_left = 7 - i64::from(now.weekday().num_days_from_monday());
            let next = now.date_naive() + ChronoDuration::days(days_left);
            Utc.from_utc_datetime(&next.and_hms_opt(0, 0, 0).unwrap_or_default())
        }
        QuotaPeriod::Month => {
            let (year, month) = if now.month() == 12 {
                (now.year() + 1, 1)
            } else {
                (now.year(), now.month() + 1)
            };
            Utc.with_ymd_and_hms(year, month, 1, 0, 0, 0)
                .single()
                .unwrap_or(now)
        }
    }
}
