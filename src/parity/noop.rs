//! No-op PAR2 handler for graceful degradation

use super::traits::{
    ParityCapabilities, ParityHandler, ProgressSink, RepairReport, VerifyReport,
};
use async_trait::async_trait;
use std::path::Path;

/// Stand-in used when no par2 binary is available or configured.
///
/// Both operations return `NotSupported` so the repair stage can skip
/// cleanly instead of failing the job.
pub struct NoOpParityHandler;

#[async_trait]
impl ParityHandler for NoOpParityHandler {
    async fn verify(
        &self,
        _par2_file: &Path,
        _progress: Option<ProgressSink>,
    ) -> crate::error::Result<VerifyReport> {
        Err(crate::error::Error::NotSupported(
            "PAR2 verification requires the external par2 binary; configure par2_path \
             or install par2 in PATH"
                .into(),
        ))
    }

    async fn repair(
        &self,
        _par2_file: &Path,
        _progress: Option<ProgressSink>,
    ) -> crate::error::Result<RepairReport> {
        Err(crate::error::Error::NotSupported(
            "PAR2 repair requires the external par2 binary; configure par2_path \
             or install par2 in PATH"
                .into(),
        ))
    }

    fn capabilities(&self) -> ParityCapabilities {
        ParityCapabilities {
            can_verify: false,
            can_repair: false,
        }
    }

    fn name(&self) -> &'static str {
        "noop"
    }
}
