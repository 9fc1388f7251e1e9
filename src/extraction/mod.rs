//! Archive extraction with password support
//!
//! RAR, 7z and ZIP archives are extracted by their codec crates with
//! password attempts in precedence order (job password, NZB metadata
//! password, global password file, optionally the empty password). The
//! password that opened an archive is reported back so the unpack stage can
//! record it in the job's admin attributes.

mod password_list;
mod rar;
mod sevenz;
mod shared;
mod zip;

pub use password_list::PasswordList;
pub use rar::RarExtractor;
pub use sevenz::SevenZipExtractor;
pub use shared::{detect_archives, extract_recursive, is_archive};
pub use zip::ZipExtractor;

use crate::config::ExtractionConfig;
use crate::error::{Error, PostProcessError, Result};
use crate::types::JobId;
use std::path::{Path, PathBuf};

/// What one archive extraction produced
#[derive(Debug, Default)]
pub struct Extracted {
    /// Every file written, including from nested archives
    pub files: Vec<PathBuf>,
    /// The password that opened the archive, when one was needed
    pub used_password: Option<String>,
}

/// Extract one archive, routed by extension.
///
/// Returns the extracted files and the password that worked. A
/// password-protected archive with no working candidate surfaces
/// [`PostProcessError::AllPasswordsFailed`] or
/// [`PostProcessError::NoPasswordsAvailable`], which the unpack stage maps
/// to the Encrypted tagging policy.
pub async fn extract_archive(
    job: &JobId,
    archive_path: &Path,
    dest_path: &Path,
    passwords: &PasswordList,
) -> Result<Extracted> {
    let ext = archive_path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_lowercase)
        .unwrap_or_default();

    match ext.as_str() {
        "rar" | "r00" => {
            shared::extract_with_passwords("RAR", RarExtractor::try_extract, job, archive_path, dest_path, passwords)
                .await
        }
        "7z" => {
            shared::extract_with_passwords("7z", SevenZipExtractor::try_extract, job, archive_path, dest_path, passwords)
                .await
        }
        "zip" => {
            shared::extract_with_passwords("ZIP", ZipExtractor::try_extract, job, archive_path, dest_path, passwords)
                .await
        }
        other => Err(Error::PostProcess(PostProcessError::ExtractionFailed {
            archive: archive_path.to_path_buf(),
            reason: format!("unknown archive type: .{other}"),
        })),
    }
}

/// Extraction entry used by the unpack stage: extract and recurse into
/// nested archives up to the configured depth.
pub async fn extract_all(
    job: &JobId,
    archive_path: &Path,
    dest_path: &Path,
    passwords: &PasswordList,
    config: &ExtractionConfig,
) -> Result<Extracted> {
    extract_recursive(job, archive_path, dest_path, passwords, config, 0).await
}
