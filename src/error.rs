//! Error types for nzbgrab
//!
//! Every component classifies errors at its public boundary: transient fetch
//! failures stay inside the connection/retry layer, permanent failures bubble
//! up to the job as a state transition with a reason string, and nothing an
//! individual job does can terminate the process.

use crate::types::{JobId, ServerId};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for nzbgrab operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for nzbgrab
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error with context about which setting is invalid
    #[error("configuration error: {message}")]
    Config {
        /// Human-readable error message describing the configuration issue
        message: String,
        /// The configuration key that caused the error (e.g., "incomplete_dir")
        key: Option<String>,
    },

    /// Article fetch failed with a classified kind
    #[error("fetch error: {0}")]
    Fetch(#[from] FetchError),

    /// Post-processing error (repair, join, unpack, move, script)
    #[error("post-processing error: {0}")]
    PostProcess(#[from] PostProcessError),

    /// Queue operation failed
    #[error("queue error: {0}")]
    Queue(#[from] QueueError),

    /// History store error
    #[error("history error: {0}")]
    History(#[from] sqlx::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Disk is full; downloading is paused until space frees up
    #[error("disk full: need {required} bytes, have {available} bytes")]
    DiskFull {
        /// Bytes still required by the current job
        required: u64,
        /// Bytes currently available on the target volume
        available: u64,
    },

    /// Job not found in queue or history
    #[error("job not found: {0}")]
    NotFound(JobId),

    /// Duplicate job detected at admission
    #[error("duplicate job: {0}")]
    Duplicate(String),

    /// Job descriptor could not be understood
    #[error("invalid job descriptor: {0}")]
    ParseError(String),

    /// Shutdown in progress; not accepting new work
    #[error("shutdown in progress: not accepting new jobs")]
    ShuttingDown,

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// External tool execution failed (par2, scripts)
    #[error("external tool error: {0}")]
    ExternalTool(String),

    /// Operation not supported (missing binary, feature disabled)
    #[error("not supported: {0}")]
    NotSupported(String),

    /// Internal invariant violation caught at a component boundary.
    ///
    /// Logged with context and converted to a per-job failure; never allowed
    /// to escape a long-running task.
    #[error("internal error: {0}")]
    Internal(String),
}

/// Classified failure of a single article fetch.
///
/// Emitted by a connection, consumed by the downloader's retry/failover
/// policy and the server pool's fitness bookkeeping.
#[derive(Debug, Clone, Error)]
pub enum FetchError {
    /// Server replied "no such article" (430-class)
    #[error("article missing on server {server}")]
    ArticleMissing {
        /// The server that reported the article missing
        server: ServerId,
    },

    /// Transport closed mid-article or the yEnc CRC did not match
    #[error("article incomplete on server {server}: {reason}")]
    ArticleIncomplete {
        /// The server the partial article came from
        server: ServerId,
        /// What went wrong (truncated reply, CRC mismatch)
        reason: String,
    },

    /// Login rejected; the server is disabled until operator action
    #[error("authentication failed on server {server}")]
    AuthFailed {
        /// The server that rejected the credentials
        server: ServerId,
    },

    /// Server asked us to slow down; the connection backs off
    #[error("server {server} throttled, retry after {delay:?}")]
    Throttled {
        /// The throttling server
        server: ServerId,
        /// Suggested delay before the connection is used again
        delay: Duration,
    },

    /// Timeout, reset, or DNS failure; retried with exponential backoff
    #[error("transient failure on server {server}: {reason}")]
    Transient {
        /// The server the failure occurred on
        server: ServerId,
        /// Underlying cause
        reason: String,
    },

    /// Server-reported quota response or locally-tracked quota crossed
    #[error("quota exceeded on server {server}")]
    QuotaExceeded {
        /// The server that is out of quota
        server: ServerId,
    },
}

impl FetchError {
    /// The server this failure is attributed to
    pub fn server(&self) -> ServerId {
        match self {
            FetchError::ArticleMissing { server }
            | FetchError::ArticleIncomplete { server, .. }
            | FetchError::AuthFailed { server }
            | FetchError::Throttled { server, .. }
            | FetchError::Transient { server, .. }
            | FetchError::QuotaExceeded { server } => *server,
        }
    }

    /// Whether retrying the same article on the same server can help
    pub fn retryable_same_server(&self) -> bool {
        matches!(
            self,
            FetchError::Transient { .. } | FetchError::Throttled { .. }
        )
    }

    /// Whether the article should be escalated to the next fit server
    pub fn wants_failover(&self) -> bool {
        matches!(
            self,
            FetchError::ArticleMissing { .. } | FetchError::ArticleIncomplete { .. }
        )
    }
}

/// Queue persistence and manipulation errors
#[derive(Debug, Error)]
pub enum QueueError {
    /// The on-disk snapshot was written by a newer version of the program
    #[error("queue file version {found} is newer than supported version {supported}")]
    VersionTooNew {
        /// Version found in the snapshot
        found: u32,
        /// Highest version this binary can read
        supported: u32,
    },

    /// The snapshot could not be decoded
    #[error("corrupt queue file: {0}")]
    Corrupt(String),

    /// A position/priority operation referenced a job not in the queue
    #[error("job {0} is not in the queue")]
    NoSuchJob(JobId),
}

/// Post-processing errors (PAR2 repair, join, extraction, move, script)
#[derive(Debug, Error)]
pub enum PostProcessError {
    /// PAR2 reported the set unrepairable with the recovery blocks on hand
    #[error("repair of {job} is not possible: {reason}")]
    Unrepairable {
        /// The job whose PAR2 set cannot repair the damage
        job: JobId,
        /// Parsed reason (e.g. "need 12 more recovery blocks")
        reason: String,
    },

    /// Archive extraction failed
    #[error("extraction failed for {archive}: {reason}")]
    ExtractionFailed {
        /// The archive file that failed to extract
        archive: PathBuf,
        /// The reason extraction failed
        reason: String,
    },

    /// Wrong password for an encrypted archive
    #[error("wrong password for encrypted archive {archive}")]
    WrongPassword {
        /// The encrypted archive that could not be opened
        archive: PathBuf,
    },

    /// Every candidate password failed for an encrypted archive
    #[error("all {count} passwords failed for archive {archive}")]
    AllPasswordsFailed {
        /// The encrypted archive that could not be opened
        archive: PathBuf,
        /// The number of passwords that were tried
        count: usize,
    },

    /// An encrypted archive was met and no password was available at all
    #[error("no passwords available for encrypted archive {archive}")]
    NoPasswordsAvailable {
        /// The encrypted archive that requires a password
        archive: PathBuf,
    },

    /// Joining a split-file set failed
    #[error("joining split set {base} failed: {reason}")]
    JoinFailed {
        /// Base name of the split set (without the numeric suffix)
        base: String,
        /// The reason the join failed
        reason: String,
    },

    /// File move/rename failed
    #[error("failed to move {source_path} to {dest_path}: {reason}")]
    MoveFailed {
        /// The source path of the file being moved
        source_path: PathBuf,
        /// The destination path where the file should be moved
        dest_path: PathBuf,
        /// The reason the move failed
        reason: String,
    },

    /// An external tool died without producing a usable exit
    #[error("tool {tool} crashed: {reason}")]
    ToolCrashed {
        /// Tool name ("par2", "unrar", script path)
        tool: String,
        /// What was observed (signal, missing exit code)
        reason: String,
    },

    /// User post-processing script exited non-zero and `script_can_fail` is off
    #[error("script {script} failed with exit code {code}")]
    ScriptFailed {
        /// The script that failed
        script: PathBuf,
        /// Its exit code
        code: i32,
    },

    /// Invalid path encountered during post-processing
    #[error("invalid path {path}: {reason}")]
    InvalidPath {
        /// The invalid path that was encountered
        path: PathBuf,
        /// The reason the path is invalid
        reason: String,
    },

    /// Cleanup failed (non-fatal, usually logged as warning)
    #[error("cleanup failed for job {job}: {reason}")]
    CleanupFailed {
        /// The job for which cleanup failed
        job: JobId,
        /// The reason cleanup failed
        reason: String,
    },
}

/// Check whether an I/O error means the target volume is out of space
pub fn is_disk_full(err: &std::io::Error) -> bool {
    #[cfg(unix)]
    {
        if err.raw_os_error() == Some(libc::ENOSPC) {
            return true;
        }
    }
    matches!(err.kind(), std::io::ErrorKind::StorageFull)
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fetch_error_attribution_returns_originating_server() {
        let cases: Vec<FetchError> = vec![
            FetchError::ArticleMissing {
                server: ServerId(3),
            },
            FetchError::AuthFailed {
                server: ServerId(3),
            },
            FetchError::Transient {
                server: ServerId(3),
                reason: "timeout".into(),
            },
        ];
        for e in cases {
            assert_eq!(e.server(), ServerId(3), "{e}");
        }
    }

    #[test]
    fn transient_and_throttled_retry_on_same_server() {
        let transient = FetchError::Transient {
            server: ServerId(0),
            reason: "reset".into(),
        };
        let throttled = FetchError::Throttled {
            server: ServerId(0),
            delay: Duration::from_secs(30),
        };
        assert!(transient.retryable_same_server());
        assert!(throttled.retryable_same_server());
        assert!(!transient.wants_failover());
    }

    #[test]
    fn missing_and_incomplete_escalate_to_failover() {
        let missing = FetchError::ArticleMissing {
            server: ServerId(1),
        };
        let incomplete = FetchError::ArticleIncomplete {
            server: ServerId(1),
            reason: "crc mismatch".into(),
        };
        assert!(missing.wants_failover());
        assert!(incomplete.wants_failover());
        assert!(!missing.retryable_same_server());
    }

    #[test]
    fn auth_and_quota_neither_retry_nor_fail_over() {
        // These are server-level conditions handled by the pool, not the
        // article's retry policy.
        let auth = FetchError::AuthFailed {
            server: ServerId(0),
        };
        let quota = FetchError::QuotaExceeded {
            server: ServerId(0),
        };
        for e in [auth, quota] {
            assert!(!e.retryable_same_server(), "{e}");
            assert!(!e.wants_failover(), "{e}");
        }
    }

    #[test]
    fn error_display_includes_context() {
        let e = Error::DiskFull {
            required: 1000,
            available: 10,
        };
        let msg = e.to_string();
        assert!(msg.contains("1000") && msg.contains("10"), "got: {msg}");
    }
}
