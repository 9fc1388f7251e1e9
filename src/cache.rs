//! Bounded in-memory article cache
//!
//! Articles arrive out of order across connections, but the assembler writes
//! each file in strictly increasing offset order. The cache absorbs that
//! reordering up to a configured byte budget and then back-pressures: when
//! the budget is spent and in-order articles are waiting, `put` blocks until
//! the assembler drains. Byte buffers are moved in and moved out, never
//! shared.

use crate::types::JobId;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Mutex;
use tokio::sync::Notify;

/// Reordering window for one file of one job
#[derive(Debug, Default)]
struct FileWindow {
    /// The article index the assembler needs next
    next_needed: usize,
    /// Decoded buffers waiting for their turn, keyed by article index
    pending: BTreeMap<usize, Vec<u8>>,
    /// Indices that permanently failed; the window advances past them
    failed: HashSet<usize>,
}

impl FileWindow {
    /// Skip over failed indices so `next_needed` points at a real article
    fn advance_past_failures(&mut self) {
        while self.failed.remove(&self.next_needed) {
            self.next_needed += 1;
        }
    }

    /// Whether the next in-order article is already here
    fn has_ready(&self) -> bool {
        self.pending.contains_key(&self.next_needed)
    }
}

#[derive(Debug, Default)]
struct CacheInner {
    windows: HashMap<(JobId, usize), FileWindow>,
    total_bytes: u64,
}

impl CacheInner {
    fn any_ready(&self) -> bool {
        self.windows.values().any(FileWindow::has_ready)
    }
}

/// Bounded mapping from article identity to decoded bytes.
///
/// The primary backpressure signal of the engine: connections block on
/// [`ArticleCache::put`] when the budget is spent until the assembler drains.
pub struct ArticleCache {
    limit: u64,
    inner: Mutex<CacheInner>,
    /// Signaled whenever bytes leave the cache
    drained: Notify,
}

impl ArticleCache {
    /// Create a cache with the given byte budget
    pub fn new(limit_bytes: u64) -> Self {
        Self {
            limit: limit_bytes,
            inner: Mutex::new(CacheInner::default()),
            drained: Notify::new(),
        }
    }

    /// Insert a decoded article buffer.
    ///
    /// Returns `true` when the inserted file now has an in-order article
    /// ready, i.e. the assembler should be kicked. If the budget is spent and
    /// some file has drainable articles, this waits for the assembler; if
    /// nothing anywhere is drainable, the insert is allowed to overshoot the
    /// budget so the gap blocking everyone can still be filled.
    pub async fn put(&self, job: &JobId, file: usize, article: usize, bytes: Vec<u8>) -> bool {
        let len = bytes.len() as u64;
        let mut bytes = Some(bytes);

        loop {
            let wait = {
                #[allow(clippy::expect_used)]
                let mut inner = self.inner.lock().expect("cache lock poisoned");
                if inner.total_bytes + len <= self.limit || !inner.any_ready() {
                    let window = inner
                        .windows
                        .entry((job.clone(), file))
                        .or_default();
                    #[allow(clippy::expect_used)]
                    let buf = bytes.take().expect("buffer consumed twice");
                    window.pending.insert(article, buf);
                    window.advance_past_failures();
                    let ready = window.has_ready();
                    inner.total_bytes += len;
                    return ready;
                }
                // Budget spent and the assembler has work: wait for a drain.
                self.drained.notified()
            };
            // Bounded wait: a drain signaled between releasing the lock and
            // registering the waiter would otherwise be missed.
            let _ = tokio::time::timeout(std::time::Duration::from_millis(100), wait).await;
        }
    }

    /// Take the next in-order article for a file, or None when the next
    /// needed article has not arrived yet.
    pub fn take_for_assembly(&self, job: &JobId, file: usize) -> Option<(usize, Vec<u8>)> {
        #[allow(clippy::expect_used)]
        let mut inner = self.inner.lock().expect("cache lock poisoned");
        let window = inner.windows.get_mut(&(job.clone(), file))?;
        window.advance_past_failures();
        let index = window.next_needed;
        let buf = window.pending.remove(&index)?;
        window.next_needed = index + 1;
        window.advance_past_failures();
        inner.total_bytes -= buf.len() as u64;
        self.drained.notify_waiters();
        Some((index, buf))
    }

    /// Record that an article permanently failed so the window can advance
    /// past the hole it leaves.
    pub fn mark_failed(&self, job: &JobId, file: usize, article: usize) {
        #[allow(clippy::expect_used)]
        let mut inner = self.inner.lock().expect("cache lock poisoned");
        let window = inner.windows.entry((job.clone(), file)).or_default();
        window.failed.insert(article);
        window.advance_past_failures();
        // A failure can unblock a stalled window; wake writers re-checking
        // for drainable work.
        self.drained.notify_waiters();
    }

    /// Purge every cached buffer belonging to a cancelled job
    pub fn drop_job(&self, job: &JobId) {
        #[allow(clippy::expect_used)]
        let mut inner = self.inner.lock().expect("cache lock poisoned");
        let mut freed = 0u64;
        inner.windows.retain(|(j, _), window| {
            if j == job {
                freed += window.pending.values().map(|b| b.len() as u64).sum::<u64>();
                false
            } else {
                true
            }
        });
        inner.total_bytes -= freed;
        if freed > 0 {
            self.drained.notify_waiters();
        }
    }

    /// Every (job, file) pair with an in-order article ready to drain.
    ///
    /// Used to re-kick the assembler after a pause (disk-full recovery).
    pub fn ready_files(&self) -> Vec<(JobId, usize)> {
        #[allow(clippy::expect_used)]
        let inner = self.inner.lock().expect("cache lock poisoned");
        inner
            .windows
            .iter()
            .filter(|(_, w)| w.has_ready())
            .map(|((job, file), _)| (job.clone(), *file))
            .collect()
    }

    /// Bytes currently tracked by the cache
    pub fn tracked_bytes(&self) -> u64 {
        #[allow(clippy::expect_used)]
        let inner = self.inner.lock().expect("cache lock poisoned");
        inner.total_bytes
    }
}
