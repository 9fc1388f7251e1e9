//! Configuration types for nzbgrab
//!
//! Configuration is grouped by concern: servers, folders, download behavior,
//! post-processing, scheduler, and history. Every field has a sensible
//! default so `Config::default()` yields a working (if server-less) engine.

use crate::types::Priority;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

/// Top-level configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    /// NNTP servers, in configuration order (order defines [`crate::types::ServerId`])
    #[serde(default)]
    pub servers: Vec<ServerConfig>,

    /// Directory layout
    #[serde(default)]
    pub folders: FolderConfig,

    /// Download engine behavior
    #[serde(default)]
    pub download: DownloadConfig,

    /// Post-processing behavior
    #[serde(default)]
    pub processing: ProcessingConfig,

    /// Scheduler rules and built-in task intervals
    #[serde(default)]
    pub scheduler: SchedulerConfig,

    /// History retention
    #[serde(default)]
    pub history: HistoryConfig,

    /// Per-category destination and post-processing overrides
    #[serde(default)]
    pub categories: HashMap<String, CategoryConfig>,

    /// How many recent warnings the in-memory ring keeps
    #[serde(default = "default_warning_ring_size")]
    pub warning_ring_size: usize,
}

fn default_warning_ring_size() -> usize {
    20
}

impl Default for Config {
    fn default() -> Self {
        Self {
            servers: Vec::new(),
            folders: FolderConfig::default(),
            download: DownloadConfig::default(),
            processing: ProcessingConfig::default(),
            scheduler: SchedulerConfig::default(),
            history: HistoryConfig::default(),
            categories: HashMap::new(),
            warning_ring_size: default_warning_ring_size(),
        }
    }
}

/// TLS hostname verification mode
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TlsVerification {
    /// No certificate verification at all
    None,
    /// Verify the chain but not the hostname
    Minimal,
    /// Full chain and hostname verification
    #[default]
    Strict,
}

/// Period over which a server quota applies
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QuotaPeriod {
    /// Reset at midnight
    #[default]
    Day,
    /// Reset at the start of the week
    Week,
    /// Reset at the start of the month
    Month,
}

/// NNTP server configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Display name shown in logs and the control surface
    #[serde(default)]
    pub name: String,

    /// Server hostname
    pub host: String,

    /// Server port (typically 119 for plain, 563 for TLS)
    pub port: u16,

    /// Whether to use TLS
    #[serde(default)]
    pub tls: bool,

    /// TLS hostname verification mode
    #[serde(default)]
    pub tls_verification: TlsVerification,

    /// Username for authentication (None = no auth)
    #[serde(default)]
    pub username: Option<String>,

    /// Password for authentication
    #[serde(default)]
    pub password: Option<String>,

    /// Maximum concurrent connections to this server
    #[serde(default = "default_connections")]
    pub connections: usize,

    /// Server priority; lower value = preferred
    #[serde(default)]
    pub priority: i32,

    /// Article retention in days (None = unlimited)
    #[serde(default)]
    pub retention_days: Option<u32>,

    /// Byte quota per [`QuotaPeriod`] (None = unmetered)
    #[serde(default)]
    pub quota_bytes: Option<u64>,

    /// Period the quota applies to
    #[serde(default)]
    pub quota_period: QuotaPeriod,

    /// Whether this server participates in dispatch
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Required servers pause downloading globally when their login fails;
    /// optional servers only log.
    #[serde(default)]
    pub required: bool,
}

fn default_connections() -> usize {
    4
}

fn default_true() -> bool {
    true
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            host: String::new(),
            port: 119,
            tls: false,
            tls_verification: TlsVerification::default(),
            username: None,
            password: None,
            connections: default_connections(),
            priority: 0,
            retention_days: None,
            quota_bytes: None,
            quota_period: QuotaPeriod::default(),
            enabled: true,
            required: false,
        }
    }
}

// Conversion to the nntp-rs client configuration. Verification modes other
// than Strict map to allow_insecure_tls; the client does not distinguish
// minimal from none.
impl From<ServerConfig> for nntp_rs::ServerConfig {
    fn from(config: ServerConfig) -> Self {
        nntp_rs::ServerConfig {
            host: config.host,
            port: config.port,
            tls: config.tls,
            allow_insecure_tls: config.tls_verification != TlsVerification::Strict,
            username: config.username.unwrap_or_default(),
            password: config.password.unwrap_or_default(),
        }
    }
}

/// Directory layout
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FolderConfig {
    /// Root for queue/history/admin state (`queue<V>.sab`, per-job admin dirs)
    pub admin_dir: PathBuf,

    /// Staging area for in-progress jobs
    pub incomplete_dir: PathBuf,

    /// Final output location, optionally nested by category
    pub complete_dir: PathBuf,
}

impl Default for FolderConfig {
    fn default() -> Self {
        Self {
            admin_dir: PathBuf::from("admin"),
            incomplete_dir: PathBuf::from("incomplete"),
            complete_dir: PathBuf::from("complete"),
        }
    }
}

/// Download engine behavior
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DownloadConfig {
    /// Article cache budget in bytes
    #[serde(default = "default_cache_limit")]
    pub cache_limit_bytes: u64,

    /// Configured line speed in bytes per second (None = unmetered)
    #[serde(default)]
    pub bandwidth_max_bps: Option<u64>,

    /// Advisory percentage of `bandwidth_max_bps` to actually use (1-100)
    #[serde(default = "default_bandwidth_percent")]
    pub bandwidth_percent: u8,

    /// Skip jobs whose average posting date is newer than this window,
    /// letting articles propagate across the backbone first
    #[serde(
        default,
        serialize_with = "serialize_opt_duration_secs",
        deserialize_with = "deserialize_opt_duration_secs"
    )]
    pub propagation_delay: Option<Duration>,

    /// Only dispatch articles of the single highest-priority job
    #[serde(default)]
    pub top_only: bool,

    /// Transient-error retries on the same server before failover
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Timeout applied to every blocking network call
    #[serde(
        default = "default_network_timeout",
        serialize_with = "serialize_duration_secs",
        deserialize_with = "deserialize_duration_secs"
    )]
    pub network_timeout: Duration,

    /// Tear down connections idle longer than this
    #[serde(
        default = "default_idle_timeout",
        serialize_with = "serialize_duration_secs",
        deserialize_with = "deserialize_duration_secs"
    )]
    pub idle_timeout: Duration,

    /// Abort a job early when this fraction of its articles has failed
    #[serde(default = "default_max_failure_ratio")]
    pub max_failure_ratio: f64,

    /// Retry policy for transient fetch errors
    #[serde(default)]
    pub retry: RetryConfig,
}

fn default_cache_limit() -> u64 {
    256 * 1024 * 1024
}

fn default_bandwidth_percent() -> u8 {
    100
}

fn default_max_retries() -> u32 {
    3
}

fn default_network_timeout() -> Duration {
    Duration::from_secs(60)
}

fn default_idle_timeout() -> Duration {
    Duration::from_secs(300)
}

fn default_max_failure_ratio() -> f64 {
    0.5
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            cache_limit_bytes: default_cache_limit(),
            bandwidth_max_bps: None,
            bandwidth_percent: default_bandwidth_percent(),
            propagation_delay: None,
            top_only: false,
            max_retries: default_max_retries(),
            network_timeout: default_network_timeout(),
            idle_timeout: default_idle_timeout(),
            max_failure_ratio: default_max_failure_ratio(),
            retry: RetryConfig::default(),
        }
    }
}

impl DownloadConfig {
    /// Effective bandwidth limit after applying the advisory percentage
    pub fn effective_speed_limit(&self) -> Option<u64> {
        self.bandwidth_max_bps
            .map(|max| max.saturating_mul(u64::from(self.bandwidth_percent.clamp(1, 100))) / 100)
    }
}

/// Retry configuration for transient failures
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum retry attempts before escalating
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Delay before the first retry
    #[serde(
        default = "default_initial_delay",
        serialize_with = "serialize_duration_secs",
        deserialize_with = "deserialize_duration_secs"
    )]
    pub initial_delay: Duration,

    /// Ceiling on the backoff delay
    #[serde(
        default = "default_max_delay",
        serialize_with = "serialize_duration_secs",
        deserialize_with = "deserialize_duration_secs"
    )]
    pub max_delay: Duration,

    /// Multiplier applied to the delay after each attempt
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Add random jitter to the delay to avoid thundering herds
    #[serde(default = "default_true")]
    pub jitter: bool,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_delay() -> Duration {
    Duration::from_secs(1)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(60)
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay: default_initial_delay(),
            max_delay: default_max_delay(),
            backoff_multiplier: default_backoff_multiplier(),
            jitter: true,
        }
    }
}

/// Duplicate-detection policy applied at admission
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DuplicateAction {
    /// Admit the job regardless
    #[default]
    Ignore,
    /// Admit the job paused
    Pause,
    /// Refuse the job and write a failed history record
    Fail,
    /// Admit the job with a duplicate tag on its name
    Tag,
}

/// Post-processing behavior
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProcessingConfig {
    /// Skip the Move stage after any failed stage so broken output never
    /// lands in the completion directory
    #[serde(default = "default_true")]
    pub safe_postproc: bool,

    /// Pause the job when an encrypted archive has no usable password
    #[serde(default = "default_true")]
    pub pause_on_pwrar: bool,

    /// Continue past an unrepairable PAR2 set instead of failing the job
    #[serde(default)]
    pub allow_incomplete: bool,

    /// Extensions (without dots) removed by the Cleanup stage
    #[serde(default)]
    pub cleanup_extensions: Vec<String>,

    /// Remove source archives and PAR2 files after a successful unpack
    #[serde(default = "default_true")]
    pub delete_sources: bool,

    /// User post-processing script (None = stage skipped)
    #[serde(default)]
    pub script: Option<PathBuf>,

    /// Whether a non-zero script exit fails the job
    #[serde(default)]
    pub script_can_fail: bool,

    /// Timeout applied to the user script
    #[serde(
        default = "default_script_timeout",
        serialize_with = "serialize_duration_secs",
        deserialize_with = "deserialize_duration_secs"
    )]
    pub script_timeout: Duration,

    /// Global password file, one candidate per line
    #[serde(default)]
    pub password_file: Option<PathBuf>,

    /// Try the empty password as a last resort
    #[serde(default)]
    pub try_empty_password: bool,

    /// Explicit path to the par2 binary (None = search PATH)
    #[serde(default)]
    pub par2_path: Option<PathBuf>,

    /// Archive extraction settings
    #[serde(default)]
    pub extraction: ExtractionConfig,

    /// Filename deobfuscation settings
    #[serde(default)]
    pub deobfuscation: DeobfuscationConfig,

    /// Duplicate-detection policy
    #[serde(default)]
    pub duplicate_action: DuplicateAction,
}

fn default_script_timeout() -> Duration {
    Duration::from_secs(3600)
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            safe_postproc: true,
            pause_on_pwrar: true,
            allow_incomplete: false,
            cleanup_extensions: Vec::new(),
            delete_sources: true,
            script: None,
            script_can_fail: false,
            script_timeout: default_script_timeout(),
            password_file: None,
            try_empty_password: false,
            par2_path: None,
            extraction: ExtractionConfig::default(),
            deobfuscation: DeobfuscationConfig::default(),
            duplicate_action: DuplicateAction::default(),
        }
    }
}

/// Archive extraction settings
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExtractionConfig {
    /// Maximum nesting depth for archives inside archives
    #[serde(default = "default_recursion_depth")]
    pub max_recursion_depth: u32,

    /// Extensions (without dots) treated as archives for nested extraction
    #[serde(default = "default_archive_extensions")]
    pub archive_extensions: Vec<String>,
}

fn default_recursion_depth() -> u32 {
    3
}

fn default_archive_extensions() -> Vec<String> {
    ["rar", "zip", "7z"].iter().map(|s| s.to_string()).collect()
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            max_recursion_depth: default_recursion_depth(),
            archive_extensions: default_archive_extensions(),
        }
    }
}

/// Filename deobfuscation settings
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DeobfuscationConfig {
    /// Whether the Deobfuscate stage runs at all
    #[serde(default)]
    pub enabled: bool,

    /// Minimum size in bytes for a file to be considered for renaming
    #[serde(default = "default_deobfuscate_min_size")]
    pub min_file_size: u64,
}

fn default_deobfuscate_min_size() -> u64 {
    10 * 1024 * 1024
}

impl Default for DeobfuscationConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            min_file_size: default_deobfuscate_min_size(),
        }
    }
}

/// Scheduler configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// User cron rules
    #[serde(default)]
    pub rules: Vec<crate::scheduler::CronRule>,

    /// Interval between RSS ticks (None disables the tick)
    #[serde(
        default = "default_rss_interval",
        serialize_with = "serialize_opt_duration_secs",
        deserialize_with = "deserialize_opt_duration_secs"
    )]
    pub rss_interval: Option<Duration>,

    /// Interval for the free-space watcher installed on disk-full
    #[serde(
        default = "default_free_space_interval",
        serialize_with = "serialize_duration_secs",
        deserialize_with = "deserialize_duration_secs"
    )]
    pub free_space_interval: Duration,

    /// Minimum free bytes before the watcher resumes downloading
    #[serde(default = "default_min_free_bytes")]
    pub min_free_bytes: u64,
}

fn default_rss_interval() -> Option<Duration> {
    Some(Duration::from_secs(900))
}

fn default_free_space_interval() -> Duration {
    Duration::from_secs(300)
}

fn default_min_free_bytes() -> u64 {
    512 * 1024 * 1024
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            rules: Vec::new(),
            rss_interval: default_rss_interval(),
            free_space_interval: default_free_space_interval(),
            min_free_bytes: default_min_free_bytes(),
        }
    }
}

/// History retention policy
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct HistoryConfig {
    /// Keep at most this many records (None = unlimited by count)
    #[serde(default)]
    pub retention_count: Option<u64>,

    /// Purge records older than this many days (None = unlimited by age)
    #[serde(default)]
    pub retention_days: Option<u32>,
}

/// Per-category destination and post-processing overrides
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CategoryConfig {
    /// Subdirectory of `complete_dir` for this category (None = category name)
    #[serde(default)]
    pub destination: Option<PathBuf>,

    /// Post-processing level override
    #[serde(default)]
    pub post_process: Option<crate::types::PostProcLevel>,

    /// Default priority for jobs admitted into this category
    #[serde(default)]
    pub priority: Option<Priority>,

    /// Script override for this category
    #[serde(default)]
    pub script: Option<PathBuf>,
}

// --- serde helpers for Duration-as-seconds ---

fn serialize_duration_secs<S>(d: &Duration, serializer: S) -> std::result::Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    serializer.serialize_u64(d.as_secs())
}

fn deserialize_duration_secs<'de, D>(deserializer: D) -> std::result::Result<Duration, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let secs = u64::deserialize(deserializer)?;
    Ok(Duration::from_secs(secs))
}

fn serialize_opt_duration_secs<S>(
    d: &Option<Duration>,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    match d {
        Some(d) => serializer.serialize_some(&d.as_secs()),
        None => serializer.serialize_none(),
    }
}

fn deserialize_opt_duration_secs<'de, D>(
    deserializer: D,
) -> std::result::Result<Option<Duration>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let secs = Option::<u64>::deserialize(deserializer)?;
    Ok(secs.map(Duration::from_secs))
}
