//! Traits and report types for PAR2 parity handling

use async_trait::async_trait;
use std::path::Path;

/// Channel a handler streams human-readable progress lines into
/// ("Verifying 12/40", "Repairing 37%").
pub type ProgressSink = tokio::sync::mpsc::UnboundedSender<String>;

/// Result of a PAR2 verification pass
#[must_use]
#[derive(Debug, Clone, Default)]
pub struct VerifyReport {
    /// Every target file present and intact
    pub all_intact: bool,
    /// Damaged or missing data blocks found
    pub damaged_blocks: u32,
    /// Recovery blocks on hand
    pub recovery_blocks: u32,
    /// Additional recovery blocks the tool asked for (0 when repairable)
    pub needed_blocks: u32,
    /// Whether repair can proceed with the recovery data on hand
    pub repairable: bool,
    /// Target files reported damaged
    pub damaged_files: Vec<String>,
    /// Target files reported missing
    pub missing_files: Vec<String>,
}

/// Outcome of a PAR2 repair attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RepairOutcome {
    /// No repair was needed, or repair succeeded
    Ok,
    /// The tool needs this many more recovery blocks; the repair stage
    /// requests extra PAR2 volumes and retries
    NeedsMoreBlocks(u32),
    /// Unrepairable with any amount of recovery data the set can provide
    Damaged(String),
}

/// Result of a PAR2 repair pass
#[must_use]
#[derive(Debug, Clone)]
pub struct RepairReport {
    /// What happened
    pub outcome: RepairOutcome,
    /// Files the tool rewrote
    pub repaired_files: Vec<String>,
}

/// Capabilities of a parity handler implementation
#[derive(Debug, Clone, Copy)]
pub struct ParityCapabilities {
    /// Can verify file integrity
    pub can_verify: bool,
    /// Can repair damaged files
    pub can_repair: bool,
}

/// Interface for PAR2 verification and repair.
///
/// Implemented by the external-binary handler and the no-op fallback;
/// pluggable so tests can substitute a scripted handler.
#[async_trait]
pub trait ParityHandler: Send + Sync {
    /// Verify the files covered by `par2_file`, streaming progress lines
    /// into `progress` when provided.
    async fn verify(
        &self,
        par2_file: &Path,
        progress: Option<ProgressSink>,
    ) -> crate::error::Result<VerifyReport>;

    /// Repair the files covered by `par2_file`, streaming progress lines
    /// into `progress` when provided.
    async fn repair(
        &self,
        par2_file: &Path,
        progress: Option<ProgressSink>,
    ) -> crate::error::Result<RepairReport>;

    /// What this handler can do
    fn capabilities(&self) -> ParityCapabilities;

    /// Name for logging and capability reporting
    fn name(&self) -> &'static str;
}
