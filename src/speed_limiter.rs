//! Global bandwidth limiting using a token bucket
//!
//! All connections share one bucket, so bandwidth distributes naturally by
//! demand. The limit is advisory: an article is never split mid-transfer, the
//! dispatcher simply waits for tokens before handing out the next one.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Shared token-bucket limiter.
///
/// Lock-free: `limit_bps` is the refill rate (0 = unlimited), `tokens` the
/// bytes currently spendable, `last_refill` a monotonic timestamp in
/// nanoseconds. Cloning shares the underlying state.
#[derive(Clone)]
pub struct SpeedLimiter {
    limit_bps: Arc<AtomicU64>,
    tokens: Arc<AtomicU64>,
    last_refill: Arc<AtomicU64>,
}

impl SpeedLimiter {
    /// Create a limiter with the given limit in bytes/second (None = unlimited)
    #[must_use]
    pub fn new(limit_bps: Option<u64>) -> Self {
        let limit = limit_bps.unwrap_or(0);
        Self {
            limit_bps: Arc::new(AtomicU64::new(limit)),
            tokens: Arc::new(AtomicU64::new(limit)),
            last_refill: Arc::new(AtomicU64::new(Self::now_nanos())),
        }
    }

    /// Change the limit at runtime.
    ///
    /// Takes effect on the next `acquire`. Raising the limit tops the bucket
    /// up by the difference; lowering it lets existing tokens drain first.
    pub fn set_limit(&self, limit_bps: Option<u64>) {
        let new_limit = limit_bps.unwrap_or(0);
        let old_limit = self.limit_bps.swap(new_limit, Ordering::SeqCst);

        if new_limit > old_limit {
            self.tokens.fetch_add(new_limit - old_limit, Ordering::SeqCst);
        }
    }

    /// Current limit in bytes/second, or None when unlimited
    pub fn get_limit(&self) -> Option<u64> {
        let limit = self.limit_bps.load(Ordering::Relaxed);
        if limit == 0 { None } else { Some(limit) }
    }

    /// Wait until `bytes` may be transferred.
    ///
    /// Returns immediately when unlimited or `bytes == 0`. Re-reads the limit
    /// while waiting so runtime changes (including removal) take effect
    /// promptly.
    pub async fn acquire(&self, bytes: u64) {
        if bytes == 0 || self.limit_bps.load(Ordering::Relaxed) == 0 {
            return;
        }

        let mut remaining = bytes;

        loop {
            let limit = self.limit_bps.load(Ordering::Relaxed);
            if limit == 0 {
                return;
            }

            self.refill_tokens();

            let current = self.tokens.load(Ordering::SeqCst);
            let to_consume = remaining.min(current);

            if to_consume > 0 {
                if self
                    .tokens
                    .compare_exchange(
                        current,
                        current - to_consume,
                        Ordering::SeqCst,
                        Ordering::SeqCst,
                    )
                    .is_ok()
                {
                    remaining -= to_consume;
                    if remaining == 0 {
                        return;
                    }
                }
                continue;
            }

            // Bucket empty. Sleep toward the refill we need, capped so limit
            // changes are noticed within ~100ms.
            let wait_ms = (remaining as f64 / limit as f64 * 1000.0) as u64;
            tokio::time::sleep(Duration::from_millis(wait_ms.clamp(10, 100))).await;
        }
    }

    /// Refill the bucket from elapsed time, capping at one second's worth.
    fn refill_tokens(&self) {
        let limit = self.limit_bps.load(Ordering::Relaxed);
        if limit == 0 {
            return;
        }

        let now = Self::now_nanos();
        let last = self.last_refill.load(Ordering::SeqCst);
        let elapsed_secs = now.saturating_sub(last) as f64 / 1_000_000_000.0;
        let tokens_to_add = (limit as f64 * elapsed_secs) as u64;

        if tokens_to_add > 0
            && self
                .last_refill
                .compare_exchange(last, now, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
        {
            let current = self.tokens.load(Ordering::SeqCst);
            self.tokens
                .store((current + tokens_to_add).min(limit), Ordering::SeqCst);
        }
    }

    /// Monotonic time in nanoseconds since an arbitrary process-local epoch
    fn now_nanos() -> u64 {
        static START: std::sync::OnceLock<Instant> = std::sync::OnceLock::new();
        let start = START.get_or_init(Instant::now);
        start.elapsed().as_nanos() as u64
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raising_limit_tops_up_bucket() {
        let limiter = SpeedLimiter::new(Some(5_000_000));
        let before = limiter.tokens.load(Ordering::Relaxed);

        limiter.set_limit(Some(10_000_000));

        assert_eq!(limiter.get_limit(), Some(10_000_000));
        assert_eq!(limiter.tokens.load(Ordering::Relaxed), before + 5_000_000);
    }

    #[test]
    fn lowering_limit_keeps_existing_tokens() {
        let limiter = SpeedLimiter::new(Some(10_000_000));
        let before = limiter.tokens.load(Ordering::Relaxed);

        limiter.set_limit(Some(5_000_000));

        assert_eq!(limiter.get_limit(), Some(5_000_000));
        assert_eq!(
            limiter.tokens.load(Ordering::Relaxed),
            before,
            "lowering the limit must not confiscate tokens"
        );
    }

    #[test]
    fn unlimited_reports_none() {
        let limiter = SpeedLimiter::new(None);
        assert_eq!(limiter.get_limit(), None);
        assert_eq!(limiter.limit_bps.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn acquire_is_instant_when_unlimited() {
        let limiter = SpeedLimiter::new(None);

        let start = Instant::now();
        limiter.acquire(50_000_000).await;
        assert!(start.elapsed() < Duration::from_millis(10));
    }

    #[tokio::test]
    async fn acquire_zero_bytes_is_instant_even_when_drained() {
        let limiter = SpeedLimiter::new(Some(100));
        limiter.tokens.store(0, Ordering::SeqCst);

        let start = Instant::now();
        limiter.acquire(0).await;
        assert!(start.elapsed() < Duration::from_millis(50));
    }

    #[tokio::test]
    async fn acquire_waits_for_refill_when_bucket_empty() {
        let rate_bps = 1_000;
        let limiter = SpeedLimiter::new(Some(rate_bps));
        limiter.tokens.store(0, Ordering::SeqCst);
        limiter
            .last_refill
            .store(SpeedLimiter::now_nanos(), Ordering::SeqCst);

        // 500 bytes at 1000 B/s should take roughly half a second
        let start = Instant::now();
        limiter.acquire(500).await;
        let elapsed = start.elapsed();

        assert!(
            elapsed >= Duration::from_millis(250),
            "acquire returned too fast: {elapsed:?}"
        );
        assert!(
            elapsed <= Duration::from_millis(1500),
            "acquire took too long: {elapsed:?}"
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn removing_limit_unblocks_waiting_acquire() {
        let limiter = SpeedLimiter::new(Some(1));
        limiter.tokens.store(0, Ordering::SeqCst);
        limiter
            .last_refill
            .store(SpeedLimiter::now_nanos(), Ordering::SeqCst);

        let waiting = limiter.clone();
        let handle = tokio::spawn(async move {
            waiting.acquire(1_000_000).await;
        });

        tokio::time::sleep(Duration::from_millis(300)).await;
        limiter.set_limit(None);

        let result = tokio::time::timeout(Duration::from_secs(3), handle).await;
        assert!(
            result.is_ok(),
            "acquire should return promptly once the limit is removed"
        );
        result.unwrap().unwrap();
    }

    #[test]
    fn clones_share_state() {
        let original = SpeedLimiter::new(Some(1_000_000));
        let clone = original.clone();

        clone.set_limit(Some(5_000_000));
        assert_eq!(original.get_limit(), Some(5_000_000));

        original.set_limit(None);
        assert_eq!(clone.get_limit(), None);
    }
}
