//! Happy-eyeballs address resolution
//!
//! Resolves a server name to IPv4 and IPv6 candidates, races a TCP probe
//! against the first of each family (IPv6 gets a small head start), and
//! caches the winning address for a short period so reconnects skip the
//! race. Strict-TLS servers bypass the pin (the TLS layer needs the
//! hostname), so the cache only feeds plain and insecure-TLS connections.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio::net::{TcpStream, lookup_host};

/// How long the IPv6 probe runs alone before IPv4 joins the race
const FAMILY_HEAD_START: Duration = Duration::from_millis(250);

/// How long a raced winner stays cached
const CACHE_TTL: Duration = Duration::from_secs(300);

/// Per-probe connect timeout
const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug)]
struct CachedWinner {
    addr: IpAddr,
    resolved_at: Instant,
}

/// Happy-eyeballs resolver with a short-lived winner cache
#[derive(Debug, Default)]
pub struct Resolver {
    cache: Mutex<HashMap<(String, u16), CachedWinner>>,
}

impl Resolver {
    /// Create an empty resolver
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve `host:port` to the address that completes a TCP handshake
    /// first, preferring a fresh cached winner.
    pub async fn resolve(&self, host: &str, port: u16) -> std::io::Result<IpAddr> {
        if let Some(addr) = self.cached(host, port) {
            return Ok(addr);
        }

        let mut v4: Vec<SocketAddr> = Vec::new();
        let mut v6: Vec<SocketAddr> = Vec::new();
        for addr in lookup_host((host, port)).await? {
            match addr {
                SocketAddr::V4(_) => v4.push(addr),
                SocketAddr::V6(_) => v6.push(addr),
            }
        }

        let winner = match (v6.first().copied(), v4.first().copied()) {
            (Some(six), Some(four)) => self.race(six, four).await?,
            (Some(six), None) => six,
            (None, Some(four)) => four,
            (None, None) => {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!("no addresses for {host}"),
                ));
            }
        };

        #[allow(clippy::expect_used)]
        self.cache
            .lock()
            .expect("resolver cache poisoned")
            .insert(
                (host.to_string(), port),
                CachedWinner {
                    addr: winner.ip(),
                    resolved_at: Instant::now(),
                },
            );
        Ok(winner.ip())
    }

    /// Drop a cached winner after a connect failure so the next attempt
    /// races again.
    pub fn invalidate(&self, host: &str, port: u16) {
        #[allow(clippy::expect_used)]
        self.cache
            .lock()
            .expect("resolver cache poisoned")
            .remove(&(host.to_string(), port));
    }

    fn cached(&self, host: &str, port: u16) -> Option<IpAddr> {
        #[allow(clippy::expect_used)]
        let cache = self.cache.lock().expect("resolver cache poisoned");
        cache
            .get(&(host.to_string(), port))
            .filter(|w| w.resolved_at.elapsed() < CACHE_TTL)
            .map(|w| w.addr)
    }

    /// Race both families: IPv6 starts immediately, IPv4 joins after the
    /// head start. First completed handshake wins; the probe sockets are
    /// dropped right away.
    async fn race(&self, six: SocketAddr, four: SocketAddr) -> std::io::Result<SocketAddr> {
        let probe_v6 = async {
            tokio::time::timeout(PROBE_TIMEOUT, TcpStream::connect(six))
                .await
                .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "probe timeout"))?
                .map(|_| six)
        };
        let probe_v4 = async {
            tokio::time::sleep(FAMILY_HEAD_START).await;
            tokio::time::timeout(PROBE_TIMEOUT, TcpStream::connect(four))
                .await
                .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "probe timeout"))?
                .map(|_| four)
        };

        tokio::select! {
            Ok(addr) = async { probe_v6.await } => Ok(addr),
            Ok(addr) = async { probe_v4.await } => Ok(addr),
            else => Err(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                "both address families failed",
            )),
        }
    }
}
