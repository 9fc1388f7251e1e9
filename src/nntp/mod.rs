//! NNTP connection management
//!
//! One [`NntpConnection`] wraps one authenticated socket, built on the
//! `nntp-rs` client. A connection fetches one article at a time, decodes the
//! yEnc payload, and maps every failure to a classified
//! [`FetchError`](crate::error::FetchError) for the downloader's retry and
//! failover policy. Idle connections are probed periodically and torn down
//! after the configured idle timeout.

pub mod resolver;

use crate::config::{ServerConfig, TlsVerification};
use crate::error::FetchError;
use crate::nzb::Article;
use crate::types::ServerId;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// State of a single connection
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    /// Socket open and authenticated, no article assigned
    Idle,
    /// TCP/TLS handshake in progress
    Connecting,
    /// Login in progress
    Authenticating,
    /// An article is being fetched; at most one at a time
    Fetching,
    /// Backing off after a failure; unusable until the deadline
    Failed {
        /// When the connection may be used again
        until: Instant,
    },
    /// Torn down; the server was disabled or the socket retired
    Closed,
}

/// A single authenticated NNTP connection owned by one server.
///
/// Never outlives its server: the pool drops connections when a server is
/// disabled or removed.
pub struct NntpConnection {
    server: ServerId,
    wire_config: Arc<nntp_rs::ServerConfig>,
    client: Option<nntp_rs::NntpClient>,
    state: ConnectionState,
    last_used: Instant,
    network_timeout: Duration,
    /// Consecutive transient failures, drives the exponential backoff
    failure_streak: u32,
}

impl NntpConnection {
    /// Create an unconnected handle for `server`.
    ///
    /// When a resolver pin is available and the server does not need strict
    /// TLS verification, the pinned address replaces the hostname so the
    /// socket goes straight to the raced winner.
    pub fn new(
        server: ServerId,
        config: &ServerConfig,
        pinned_addr: Option<std::net::IpAddr>,
        network_timeout: Duration,
    ) -> Self {
        let mut wire: nntp_rs::ServerConfig = config.clone().into();
        if let Some(addr) = pinned_addr {
            if config.tls_verification != TlsVerification::Strict {
                wire.host = addr.to_string();
            }
        }
        Self {
            server,
            wire_config: Arc::new(wire),
            client: None,
            state: ConnectionState::Idle,
            last_used: Instant::now(),
            network_timeout,
            failure_streak: 0,
        }
    }

    /// The owning server
    pub fn server(&self) -> ServerId {
        self.server
    }

    /// Current state
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Whether the connection can take an article right now
    pub fn available(&self) -> bool {
        match self.state {
            ConnectionState::Idle | ConnectionState::Connecting => true,
            ConnectionState::Failed { until } => Instant::now() >= until,
            _ => false,
        }
    }

    /// Whether the connection sat unused past the idle timeout
    pub fn idle_expired(&self, idle_timeout: Duration) -> bool {
        matches!(self.state, ConnectionState::Idle) && self.last_used.elapsed() > idle_timeout
    }

    /// Fetch one article and return its decoded bytes.
    ///
    /// Connects and authenticates lazily. On success the connection returns
    /// to Idle; on failure the error is classified and the connection enters
    /// the matching state (Failed with backoff, or Closed for auth).
    pub async fn fetch(&mut self, article: &Article) -> Result<Vec<u8>, FetchError> {
        self.ensure_connected().await?;

        self.state = ConnectionState::Fetching;
        self.last_used = Instant::now();

        #[allow(clippy::expect_used)]
        let client = self.client.as_mut().expect("connected above");

        let message_id = article.bracketed_id();
        let response = match tokio::time::timeout(
            self.network_timeout,
            client.fetch_article_binary(&message_id),
        )
        .await
        {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                let mapped = self.classify(&e);
                self.note_failure(&mapped);
                return Err(mapped);
            }
            Err(_) => {
                let mapped = FetchError::Transient {
                    server: self.server,
                    reason: format!("article fetch timed out after {:?}", self.network_timeout),
                };
                self.note_failure(&mapped);
                return Err(mapped);
            }
        };

        let decoded = match nntp_rs::yenc_decode(&response.data) {
            Ok(decoded) => decoded,
            Err(e) => {
                // Truncated body or CRC mismatch: the article exists but is
                // unusable here, so failover should try another server
                let mapped = FetchError::ArticleIncomplete {
                    server: self.server,
                    reason: format!("yEnc decode failed: {e}"),
                };
                self.state = ConnectionState::Idle;
                return Err(mapped);
            }
        };

        if decoded.data.is_empty() {
            let mapped = FetchError::ArticleIncomplete {
                server: self.server,
                reason: "empty article body".to_string(),
            };
            self.state = ConnectionState::Idle;
            return Err(mapped);
        }

        self.failure_streak = 0;
        self.state = ConnectionState::Idle;
        self.last_used = Instant::now();
        Ok(decoded.data)
    }

    /// Keep-alive probe for idle connections.
    ///
    /// A cheap capabilities query stands in for a NOOP; a failed probe
    /// closes the connection so the pool replaces it.
    pub async fn keepalive(&mut self) {
        if self.state != ConnectionState::Idle || self.client.is_none() {
            return;
        }
        #[allow(clippy::expect_used)]
        let client = self.client.as_mut().expect("checked above");
        match tokio::time::timeout(self.network_timeout, client.capabilities()).await {
            Ok(Ok(_)) => self.last_used = Instant::now(),
            _ => {
                tracing::debug!(server = %self.server, "keep-alive probe failed, closing connection");
                self.close();
            }
        }
    }

    /// Tear the connection down
    pub fn close(&mut self) {
        self.client = None;
        self.state = ConnectionState::Closed;
    }

    async fn ensure_connected(&mut self) -> Result<(), FetchError> {
        if let ConnectionState::Failed { until } = self.state {
            if Instant::now() < until {
                return Err(FetchError::Transient {
                    server: self.server,
                    reason: "connection backing off".to_string(),
                });
            }
        }
        if self.client.is_some() && self.state != ConnectionState::Closed {
            return Ok(());
        }

        self.state = ConnectionState::Connecting;
        let client = match tokio::time::timeout(
            self.network_timeout,
            nntp_rs::NntpClient::connect(self.wire_config.clone()),
        )
        .await
        {
            Ok(Ok(client)) => client,
            Ok(Err(e)) => {
                let mapped = self.classify(&e);
                self.note_failure(&mapped);
                return Err(mapped);
            }
            Err(_) => {
                let mapped = FetchError::Transient {
                    server: self.server,
                    reason: "connect timed out".to_string(),
                };
                self.note_failure(&mapped);
                return Err(mapped);
            }
        };
        self.client = Some(client);

        if !self.wire_config.username.is_empty() {
            self.state = ConnectionState::Authenticating;
            #[allow(clippy::expect_used)]
            let client = self.client.as_mut().expect("set above");
            match tokio::time::timeout(self.network_timeout, client.authenticate()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    let mapped = self.classify_auth(&e);
                    self.note_failure(&mapped);
                    return Err(mapped);
                }
                Err(_) => {
                    let mapped = FetchError::Transient {
                        server: self.server,
                        reason: "authentication timed out".to_string(),
                    };
                    self.note_failure(&mapped);
                    return Err(mapped);
                }
            }
        }

        self.state = ConnectionState::Idle;
        Ok(())
    }

    /// Classify an nntp-rs error into a fetch error kind
    fn classify(&self, err: &nntp_rs::NntpError) -> FetchError {
        match err {
            nntp_rs::NntpError::NoSuchArticle(_) => FetchError::ArticleMissing {
                server: self.server,
            },
            nntp_rs::NntpError::Protocol { code, .. } if *code == 430 => {
                FetchError::ArticleMissing {
                    server: self.server,
                }
            }
            nntp_rs::NntpError::Protocol { code, .. } if *code == 480 || *code == 481 => {
                FetchError::AuthFailed {
                    server: self.server,
                }
            }
            other => {
                let msg = other.to_string();
                let lower = msg.to_lowercase();
                if lower.contains("no such article") {
                    FetchError::ArticleMissing {
                        server: self.server,
                    }
                } else if lower.contains("quota") || lower.contains("exceeded your") {
                    FetchError::QuotaExceeded {
                        server: self.server,
                    }
                } else if lower.contains("too many") || lower.contains("rate limit") {
                    FetchError::Throttled {
                        server: self.server,
                        delay: Duration::from_secs(30),
                    }
                } else {
                    FetchError::Transient {
                        server: self.server,
                        reason: msg,
                    }
                }
            }
        }
    }

    /// Auth-phase errors default to AuthFailed unless clearly transient
    fn classify_auth(&self, err: &nntp_rs::NntpError) -> FetchError {
        let msg = err.to_string().to_lowercase();
        if msg.contains("timeout") || msg.contains("connection") {
            FetchError::Transient {
                server: self.server,
                reason: err.to_string(),
            }
        } else {
            FetchError::AuthFailed {
                server: self.server,
            }
        }
    }

    /// Update state according to a classified failure
    fn note_failure(&mut self, err: &FetchError) {
        match err {
            FetchError::AuthFailed { .. } => {
                self.close();
            }
            FetchError::Throttled { delay, .. } => {
                self.client = None;
                self.state = ConnectionState::Failed {
                    until: Instant::now() + *delay,
                };
            }
            FetchError::Transient { .. } => {
                self.failure_streak += 1;
                // Exponential backoff: 1s, 2s, 4s, ... capped at 60s
                let backoff =
                    Duration::from_secs(1 << self.failure_streak.min(6).saturating_sub(1))
                        .min(Duration::from_secs(60));
                self.client = None;
                self.state = ConnectionState::Failed {
                    until: Instant::now() + backoff,
                };
            }
            // Missing/incomplete/quota are article- or server-level facts,
            // not socket problems
            _ => {
                self.state = ConnectionState::Idle;
            }
        }
    }
}
