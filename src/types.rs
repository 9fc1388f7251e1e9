//! Core types for nzbgrab

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Unique identifier for a job (an NZB in the queue or history)
///
/// Job ids are opaque strings of the form `nzg_xxxxxxxx`, generated at
/// admission and stable across restarts. They name the job's admin directory
/// and its history record.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub String);

impl JobId {
    /// Generate a fresh job id
    pub fn generate() -> Self {
        use rand::Rng;
        let mut rng = rand::thread_rng();
        let suffix: String = (0..10)
            .map(|_| {
                let n: u8 = rng.gen_range(0..36);
                if n < 10 {
                    (b'0' + n) as char
                } else {
                    (b'a' + n - 10) as char
                }
            })
            .collect();
        Self(format!("nzg_{suffix}"))
    }

    /// Borrow the inner string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for JobId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Index of a server in the pool's configuration order.
///
/// Servers are referenced by index everywhere (attempted-sets, leases,
/// counters); the index is stable for the lifetime of a pool.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ServerId(pub usize);

impl std::fmt::Display for ServerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Job priority tiers, ordered from most to least urgent.
///
/// Derived `Ord` compares the discriminants, so `Force > Repair > High >
/// Normal > Low > Paused > Stop` holds. `Paused` and `Stop` are real tiers:
/// jobs admitted at them sit in the queue without dispatching.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    /// Never dispatched; removed from consideration entirely (-4)
    Stop = -4,
    /// Admitted paused (-2)
    Paused = -2,
    /// Low priority (-1)
    Low = -1,
    /// Normal priority (0)
    #[default]
    Normal = 0,
    /// High priority (1)
    High = 1,
    /// Tier used for re-queued repair fetches (2)
    Repair = 2,
    /// Force start, dispatched even when the queue is paused (3)
    Force = 3,
}

impl Priority {
    /// Convert an integer priority code to a Priority tier
    pub fn from_i32(priority: i32) -> Self {
        match priority {
            -4 => Priority::Stop,
            -2 => Priority::Paused,
            -1 => Priority::Low,
            0 => Priority::Normal,
            1 => Priority::High,
            2 => Priority::Repair,
            3 => Priority::Force,
            _ => Priority::Normal,
        }
    }

    /// Whether jobs at this tier may be dispatched at all
    pub fn dispatchable(self) -> bool {
        !matches!(self, Priority::Paused | Priority::Stop)
    }
}

/// Lifecycle state of a job
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Waiting in the queue
    Queued,
    /// Descriptor being admitted (duplicate check, admin dir creation)
    Grabbing,
    /// Articles being fetched
    Downloading,
    /// Fetching withheld PAR2 volumes on request of the repair stage
    FetchingExtraPar2,
    /// Paused by user or policy
    Paused,
    /// Post-processing queued, not yet started
    Checking,
    /// Cheap on-disk size check against descriptors
    QuickCheck,
    /// PAR2 verification running
    Verifying,
    /// PAR2 repair running
    Repairing,
    /// Archive extraction running
    Extracting,
    /// Moving to the completion directory
    Moving,
    /// User post-processing script running
    RunningScript,
    /// Finished successfully, recorded in history
    Completed,
    /// Finished unsuccessfully, recorded in history
    Failed,
    /// Deleted by the user; dispatch fence for in-flight work
    Deleted,
}

impl JobState {
    /// Whether the downloader may dispatch new articles for a job in this state
    pub fn accepts_dispatch(self) -> bool {
        matches!(
            self,
            JobState::Queued | JobState::Downloading | JobState::FetchingExtraPar2
        )
    }

    /// Whether this state belongs to the post-processing half of the lifecycle
    pub fn in_post_processing(self) -> bool {
        matches!(
            self,
            JobState::Checking
                | JobState::QuickCheck
                | JobState::Verifying
                | JobState::Repairing
                | JobState::Extracting
                | JobState::Moving
                | JobState::RunningScript
        )
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobState::Queued => "Queued",
            JobState::Grabbing => "Grabbing",
            JobState::Downloading => "Downloading",
            JobState::FetchingExtraPar2 => "Fetching extra PAR2",
            JobState::Paused => "Paused",
            JobState::Checking => "Checking",
            JobState::QuickCheck => "QuickCheck",
            JobState::Verifying => "Verifying",
            JobState::Repairing => "Repairing",
            JobState::Extracting => "Extracting",
            JobState::Moving => "Moving",
            JobState::RunningScript => "Running script",
            JobState::Completed => "Completed",
            JobState::Failed => "Failed",
            JobState::Deleted => "Deleted",
        };
        write!(f, "{s}")
    }
}

/// How much post-processing a job gets
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PostProcLevel {
    /// Assemble only; no verify, repair or unpack
    Skip,
    /// Verify and repair with PAR2
    Repair,
    /// Repair, then unpack archives
    Unpack,
    /// Repair, unpack, and delete source archives and PAR2 files
    #[default]
    Delete,
}

/// One of the ordered post-processing stages
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    /// PAR2 verify/repair
    Repair,
    /// Concatenate split-file sets
    Join,
    /// Archive extraction
    Unpack,
    /// Rename generically-named files
    Deobfuscate,
    /// Remove source archives, PAR2 sets, unwanted extensions
    Cleanup,
    /// Move to the completion directory
    Move,
    /// User post-processing script
    Script,
    /// History record, admin removal, notification
    Finalize,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Stage::Repair => "Repair",
            Stage::Join => "Join",
            Stage::Unpack => "Unpack",
            Stage::Deobfuscate => "Deobfuscate",
            Stage::Cleanup => "Cleanup",
            Stage::Move => "Move",
            Stage::Script => "Script",
            Stage::Finalize => "Finalize",
        };
        write!(f, "{s}")
    }
}

/// Outcome of a single post-processing stage
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StageOutcome {
    /// Stage completed
    Ok,
    /// Stage completed with a recorded warning; pipeline continues
    PartialOk(String),
    /// Stage failed; remaining stages except Finalize are skipped
    Failed(String),
}

impl StageOutcome {
    /// Whether the pipeline may proceed past this stage normally
    pub fn is_ok(&self) -> bool {
        !matches!(self, StageOutcome::Failed(_))
    }
}

/// Event emitted on the broadcast channel during the lifecycle of jobs.
///
/// Consumed by the out-of-process control surface; the engine never blocks
/// on subscribers.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// Job admitted to the queue
    Queued {
        /// Job ID
        id: JobId,
        /// Display name
        name: String,
    },

    /// Job removed from the queue
    Removed {
        /// Job ID
        id: JobId,
    },

    /// Download progress update
    Downloading {
        /// Job ID
        id: JobId,
        /// Bytes downloaded so far
        downloaded_bytes: u64,
        /// Total bytes in the job
        total_bytes: u64,
        /// Current speed in bytes per second
        speed_bps: u64,
        /// Articles that have permanently failed so far
        failed_articles: u64,
    },

    /// All articles fetched or failed beyond recovery; handing to post-processing
    DownloadComplete {
        /// Job ID
        id: JobId,
    },

    /// A single file within the job finished assembly
    FileAssembled {
        /// Job ID
        id: JobId,
        /// Index of the file within the job
        file_index: usize,
        /// Final (sanitized) filename
        filename: String,
    },

    /// A post-processing stage started
    StageStarted {
        /// Job ID
        id: JobId,
        /// The stage
        stage: Stage,
    },

    /// Structured progress within a stage (e.g. "Verifying 12/40")
    StageProgress {
        /// Job ID
        id: JobId,
        /// The stage
        stage: Stage,
        /// Human-readable progress line
        line: String,
    },

    /// A post-processing stage finished
    StageFinished {
        /// Job ID
        id: JobId,
        /// The stage
        stage: Stage,
        /// Whether the stage succeeded
        ok: bool,
        /// Elapsed time formatted `HH:MM:SS`
        elapsed: String,
    },

    /// Job fully complete, recorded in history
    Complete {
        /// Job ID
        id: JobId,
        /// Final storage path
        path: PathBuf,
    },

    /// Job failed, recorded in history
    JobFailed {
        /// Job ID
        id: JobId,
        /// Failure reason stored in history
        reason: String,
    },

    /// An encrypted archive was met without a usable password
    Encrypted {
        /// Job ID
        id: JobId,
    },

    /// Downloading paused (user, disk-full, or post-processing demand)
    DownloadPaused,

    /// Downloading resumed
    DownloadResumed,

    /// Speed limit changed
    SpeedLimitChanged {
        /// New limit in bytes per second (None = unlimited)
        limit_bps: Option<u64>,
    },

    /// A server was disabled after an authentication failure
    ServerDisabled {
        /// Server index
        server: ServerId,
        /// Whether the server is flagged required (pauses downloading)
        required: bool,
    },

    /// A server crossed its quota and was parked until the period reset
    ServerParked {
        /// Server index
        server: ServerId,
    },

    /// The RSS ingestor (external) should poll its feeds now
    RssTick,

    /// A duplicate job was detected at admission
    DuplicateDetected {
        /// The would-be job's display name
        name: String,
        /// Id of the matching queue or history entry
        existing: String,
    },

    /// Graceful shutdown initiated
    Shutdown,
}

/// Aggregate queue statistics for the control surface
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QueueStats {
    /// Total jobs in the queue
    pub total: usize,
    /// Jobs waiting to start
    pub queued: usize,
    /// Jobs currently downloading
    pub downloading: usize,
    /// Jobs paused
    pub paused: usize,
    /// Jobs in post-processing
    pub processing: usize,
    /// Total size of all queued jobs in bytes
    pub total_bytes: u64,
    /// Bytes downloaded across all queued jobs
    pub downloaded_bytes: u64,
    /// Current speed limit (None = unlimited)
    pub speed_limit_bps: Option<u64>,
    /// Whether downloading is globally paused
    pub paused_globally: bool,
}

/// A snapshot of one job suitable for the control surface
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JobInfo {
    /// Job ID
    pub id: JobId,
    /// Display name
    pub name: String,
    /// Category, if assigned
    pub category: Option<String>,
    /// Current state
    pub state: JobState,
    /// Priority tier
    pub priority: Priority,
    /// Total size in bytes
    pub total_bytes: u64,
    /// Bytes downloaded so far
    pub downloaded_bytes: u64,
    /// When the job was admitted
    pub added_at: DateTime<Utc>,
    /// Average posting date of the job's articles
    pub avg_date: DateTime<Utc>,
}

/// Final status of a history record
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HistoryStatus {
    /// Finished successfully
    Completed,
    /// Finished unsuccessfully
    Failed,
}

impl HistoryStatus {
    /// Canonical string stored in the history table
    pub fn as_str(self) -> &'static str {
        match self {
            HistoryStatus::Completed => "Completed",
            HistoryStatus::Failed => "Failed",
        }
    }

    /// Parse the canonical string form
    pub fn from_str_opt(s: &str) -> Option<Self> {
        match s {
            "Completed" => Some(HistoryStatus::Completed),
            "Failed" => Some(HistoryStatus::Failed),
            _ => None,
        }
    }
}
