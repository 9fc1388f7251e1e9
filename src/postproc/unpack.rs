//! Unpack stage: recursive archive extraction
//!
//! Every archive in the job directory is extracted into an `extracted/`
//! subtree, recursing into nested archives. Passwords come from the job
//! (operator input before NZB metadata) and the global password file. An
//! encrypted archive no candidate opens tags the job Encrypted; the
//! pipeline then pauses or continues per `pause_on_pwrar`.

use crate::config::ProcessingConfig;
use crate::error::{Error, PostProcessError, Result};
use crate::extraction::{PasswordList, detect_archives, extract_all};
use crate::nzb::NzbObject;
use std::path::{Path, PathBuf};

/// What the unpack stage produced
#[derive(Debug)]
pub enum UnpackStageResult {
    /// Archives extracted (possibly zero files for empty archives)
    Ok {
        /// Files extracted across all archives
        files: Vec<PathBuf>,
        /// The source archives, for the cleanup stage
        sources: Vec<PathBuf>,
        /// The password that opened the archives, when one was needed
        used_password: Option<String>,
    },
    /// A password-protected archive had no working password
    Encrypted,
    /// No archives found; nothing to do
    Skipped,
}

/// Subdirectory extraction lands in
pub const EXTRACT_SUBDIR: &str = "extracted";

/// Run extraction over the job directory
pub async fn run_unpack_stage(
    job: &NzbObject,
    dir: &Path,
    config: &ProcessingConfig,
) -> Result<UnpackStageResult> {
    let archives = detect_archives(dir)?;
    if archives.is_empty() {
        return Ok(UnpackStageResult::Skipped);
    }

    let passwords = PasswordList::collect(
        &job.passwords(),
        config.password_file.as_deref(),
        config.try_empty_password,
    )
    .await;

    let dest = dir.join(EXTRACT_SUBDIR);
    let mut files = Vec::new();
    let mut used_password = None;

    for archive in &archives {
        tracing::info!(
            job = %job.id,
            archive = %archive.display(),
            "extracting archive"
        );
        match extract_all(&job.id, archive, &dest, &passwords, &config.extraction).await {
            Ok(mut extracted) => {
                files.append(&mut extracted.files);
                if used_password.is_none() {
                    used_password = extracted.used_password;
                }
            }
            Err(Error::PostProcess(
                PostProcessError::AllPasswordsFailed { .. }
                | PostProcessError::NoPasswordsAvailable { .. }
                | PostProcessError::WrongPassword { .. },
            )) => {
                tracing::warn!(
                    job = %job.id,
                    archive = %archive.display(),
                    "encrypted archive without a usable password"
                );
                return Ok(UnpackStageResult::Encrypted);
            }
            Err(e) => return Err(e),
        }
    }

    Ok(UnpackStageResult::Ok {
        files,
        sources: archives,
        used_password,
    })
}
