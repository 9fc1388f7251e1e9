//! Versioned on-disk snapshots of queue state
//!
//! The queue, the post-processing queue, and the bandwidth meter each
//! persist to a single versioned file in the admin directory
//! (`queue<V>.sab`, `postproc<V>.sab`, `totals<V>.sab`). Writes are atomic
//! (temp file, fsync, rename); restores refuse snapshots written by a newer
//! version with a clear error instead of guessing.

use crate::error::{QueueError, Result};
use crate::nzb::NzbObject;
use crate::nzb::admin::atomic_write;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde::de::DeserializeOwned;
use std::path::{Path, PathBuf};

/// Version of the queue snapshot format
pub const QUEUE_VERSION: u32 = 10;
/// Version of the post-processing queue snapshot format
pub const POSTPROC_VERSION: u32 = 10;
/// Version of the bandwidth-meter snapshot format
pub const TOTALS_VERSION: u32 = 10;

/// File name of the queue snapshot
pub fn queue_file(dir: &Path) -> PathBuf {
    dir.join(format!("queue{QUEUE_VERSION}.sab"))
}

/// File name of the post-processing queue snapshot
pub fn postproc_file(dir: &Path) -> PathBuf {
    dir.join(format!("postproc{POSTPROC_VERSION}.sab"))
}

/// File name of the bandwidth-meter snapshot
pub fn totals_file(dir: &Path) -> PathBuf {
    dir.join(format!("totals{TOTALS_VERSION}.sab"))
}

/// Versioned envelope shared by every snapshot file
#[derive(Serialize, Deserialize)]
struct Snapshot<T> {
    version: u32,
    payload: T,
}

fn save_snapshot<T: Serialize>(path: &Path, version: u32, payload: &T) -> Result<()> {
    let data = serde_json::to_vec(&Snapshot { version, payload })?;
    atomic_write(path, &data)?;
    Ok(())
}

fn load_snapshot<T: DeserializeOwned>(path: &Path, supported: u32) -> Result<Option<T>> {
    let data = match std::fs::read(path) {
        Ok(data) => data,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    // Peek at the version before decoding the payload, so a newer snapshot
    // produces a version error rather than a confusing parse error
    #[derive(Deserialize)]
    struct VersionOnly {
        version: u32,
    }
    let header: VersionOnly = serde_json::from_slice(&data)
        .map_err(|e| QueueError::Corrupt(format!("unreadable snapshot header: {e}")))?;
    if header.version > supported {
        return Err(QueueError::VersionTooNew {
            found: header.version,
            supported,
        }
        .into());
    }
    let snapshot: Snapshot<T> = serde_json::from_slice(&data)
        .map_err(|e| QueueError::Corrupt(format!("unreadable snapshot payload: {e}")))?;
    Ok(Some(snapshot.payload))
}

/// Persist the ordered queue to `queue<V>.sab`
pub fn persist_queue(dir: &Path, jobs: &[NzbObject]) -> Result<()> {
    save_snapshot(&queue_file(dir), QUEUE_VERSION, &jobs)
}

/// Restore the queue, resetting runtime-only article state.
///
/// Returns an empty queue when no snapshot exists.
pub fn restore_queue(dir: &Path) -> Result<Vec<NzbObject>> {
    let mut jobs: Vec<NzbObject> = load_snapshot(&queue_file(dir), QUEUE_VERSION)?.unwrap_or_default();
    for job in &mut jobs {
        job.reset_after_restore();
    }
    Ok(jobs)
}

/// Persist the post-processing queue to `postproc<V>.sab`
pub fn persist_postproc(dir: &Path, jobs: &[NzbObject]) -> Result<()> {
    save_snapshot(&postproc_file(dir), POSTPROC_VERSION, &jobs)
}

/// Restore the post-processing queue, empty when no snapshot exists
pub fn restore_postproc(dir: &Path) -> Result<Vec<NzbObject>> {
    Ok(load_snapshot(&postproc_file(dir), POSTPROC_VERSION)?.unwrap_or_default())
}

/// Bandwidth meter: bytes moved per server, rolled over daily at midnight
/// by the scheduler.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TotalsMeter {
    /// Day the `today` counters cover
    pub day: Option<NaiveDate>,
    /// Bytes per server today, indexed by server id
    pub today: Vec<u64>,
    /// Bytes per server this month
    pub month: Vec<u64>,
    /// Bytes per server since the counters were created
    pub all_time: Vec<u64>,
}

impl TotalsMeter {
    /// Fold a fresh per-server reading into the meter
    pub fn record(&mut self, per_server: &[u64], today: NaiveDate) {
        let grow = |v: &mut Vec<u64>| {
            if v.len() < per_server.len() {
                v.resize(per_server.len(), 0);
            }
        };
        grow(&mut self.today);
        grow(&mut self.month);
        grow(&mut self.all_time);

        if self.day != Some(today) {
            self.rollover(today);
        }
        for (i, bytes) in per_server.iter().enumerate() {
            self.today[i] += bytes;
            self.month[i] += bytes;
            self.all_time[i] += bytes;
        }
    }

    /// Midnight rollover: zero the daily counters, and the monthly ones on
    /// the first of the month.
    pub fn rollover(&mut self, today: NaiveDate) {
        use chrono::Datelike;
        if let Some(prev) = self.day {
            if prev.month() != today.month() || prev.year() != today.year() {
                self.month.iter_mut().for_each(|b| *b = 0);
            }
        }
        self.today.iter_mut().for_each(|b| *b = 0);
        self.day = Some(today);
    }

    /// Persist to `totals<V>.sab`
    pub fn persist(&self, dir: &Path) -> Result<()> {
        save_snapshot(&totals_file(dir), TOTALS_VERSION, self)
    }

    /// Restore, default when no snapshot exists
    pub fn restore(dir: &Path) -> Result<Self> {
        Ok(load_snapshot(&totals_file(dir), TOTALS_VERSION)?.unwrap_or_default())
    }
}
