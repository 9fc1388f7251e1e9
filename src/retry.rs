//! Retry logic with exponential backoff
//!
//! Transient fetch failures are retried locally with exponential backoff and
//! optional jitter before the downloader escalates to server failover.

use crate::config::RetryConfig;
use crate::error::{Error, FetchError};
use rand::Rng;
use std::future::Future;
use std::time::Duration;

/// Trait for errors that can be classified as retryable or not.
///
/// Transient failures (timeouts, resets, throttling) return `true`;
/// permanent failures (missing article, auth rejection, quota) return
/// `false` and are handled by failover or server-level policy instead.
pub trait IsRetryable {
    /// Returns true if the operation should be retried on the same server
    fn is_retryable(&self) -> bool;
}

impl IsRetryable for FetchError {
    fn is_retryable(&self) -> bool {
        self.retryable_same_server()
    }
}

impl IsRetryable for Error {
    fn is_retryable(&self) -> bool {
        match self {
            Error::Fetch(e) => e.is_retryable(),
            Error::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::ConnectionRefused
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::NotConnected
                    | std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::Interrupted
            ),
            // External tools can hit transient conditions (busy volume,
            // temporary lock); everything else is permanent at this level
            Error::ExternalTool(msg) => {
                msg.contains("timeout") || msg.contains("busy") || msg.contains("temporary")
            }
            _ => false,
        }
    }
}

/// Execute an async operation with exponential backoff retry.
///
/// The operation runs at least once; retryable errors are retried up to
/// `config.max_attempts` times with a delay that starts at
/// `config.initial_delay` and multiplies by `config.backoff_multiplier`
/// (capped at `config.max_delay`), with optional jitter.
pub async fn with_retry<F, Fut, T, E>(config: &RetryConfig, mut operation: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: IsRetryable + std::fmt::Display,
{
    let mut attempt = 0;
    let mut delay = config.initial_delay;

    loop {
        match operation().await {
            Ok(result) => {
                if attempt > 0 {
                    tracing::info!(attempts = attempt + 1, "operation succeeded after retry");
                }
                return Ok(result);
            }
            Err(e) if e.is_retryable() && attempt < config.max_attempts => {
                attempt += 1;

                tracing::warn!(
                    error = %e,
                    attempt = attempt,
                    max_attempts = config.max_attempts,
                    delay_ms = delay.as_millis(),
                    "operation failed, retrying"
                );

                let jittered = if config.jitter { add_jitter(delay) } else { delay };
                tokio::time::sleep(jittered).await;

                delay = Duration::from_secs_f64(delay.as_secs_f64() * config.backoff_multiplier)
                    .min(config.max_delay);
            }
            Err(e) => {
                if e.is_retryable() {
                    tracing::warn!(
                        error = %e,
                        attempts = attempt + 1,
                        "retries exhausted, escalating"
                    );
                }
                return Err(e);
            }
        }
    }
}

/// Backoff schedule for call sites that manage their own retry loop (the
/// downloader retries on a mutably-borrowed connection, which `with_retry`'s
/// closure shape cannot express).
pub struct Backoff {
    delay: Duration,
    max_delay: Duration,
    multiplier: f64,
    jitter: bool,
}

impl Backoff {
    /// Start a schedule from the retry configuration
    pub fn new(config: &RetryConfig) -> Self {
        Self {
            delay: config.initial_delay,
            max_delay: config.max_delay,
            multiplier: config.backoff_multiplier,
            jitter: config.jitter,
        }
    }

    /// The delay to sleep before the next attempt; advances the schedule
    pub fn next_delay(&mut self) -> Duration {
        let current = self.delay;
        self.delay =
            Duration::from_secs_f64(self.delay.as_secs_f64() * self.multiplier).min(self.max_delay);
        if self.jitter { add_jitter(current) } else { current }
    }
}

/// Add uniform jitter: the delay becomes between 1x and 2x the base.
fn add_jitter(delay: Duration) -> Duration {
    let mut rng = rand::thread_rng();
    let factor: f64 = rng.gen_range(0.0..=1.0);
    Duration::from_secs_f64(delay.as_secs_f64() * (1.0 + factor))
}
