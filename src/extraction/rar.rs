//! RAR extraction via the unrar crate

use crate::error::{Error, PostProcessError, Result};
use crate::types::JobId;
use std::path::{Path, PathBuf};
use tracing::debug;

use super::Extracted;
use super::password_list::PasswordList;
use super::shared::extract_with_passwords;

/// Extractor for RAR archives, including multi-volume sets (`partN.rar`,
/// `.rNN`) which the library follows from the first volume.
pub struct RarExtractor;

impl RarExtractor {
    /// Whether an unrar error message points at a password problem
    fn is_password_error(error_msg: &str) -> bool {
        let lower = error_msg.to_lowercase();
        lower.contains("password")
            || lower.contains("encrypted")
            || error_msg.contains("ERAR_BAD_PASSWORD")
            || error_msg.contains("ERAR_MISSING_PASSWORD")
    }

    fn map_error(e: unrar::error::UnrarError, archive_path: &Path) -> Error {
        let msg = e.to_string();
        if Self::is_password_error(&msg) {
            Error::PostProcess(PostProcessError::WrongPassword {
                archive: archive_path.to_path_buf(),
            })
        } else {
            Error::PostProcess(PostProcessError::ExtractionFailed {
                archive: archive_path.to_path_buf(),
                reason: msg,
            })
        }
    }

    /// Extract with one password; blocking, called via `spawn_blocking`.
    pub fn try_extract(
        archive_path: &Path,
        password: &str,
        dest_path: &Path,
    ) -> Result<Vec<PathBuf>> {
        debug!(archive = %archive_path.display(), "attempting RAR extraction");
        std::fs::create_dir_all(dest_path)?;

        let archive = if password.is_empty() {
            unrar::Archive::new(archive_path)
        } else {
            unrar::Archive::with_password(archive_path, password.as_bytes())
        };

        let mut at_header = archive
            .open_for_processing()
            .map_err(|e| Self::map_error(e, archive_path))?;

        let mut extracted = Vec::new();
        loop {
            let at_file = match at_header.read_header() {
                Ok(Some(p)) => p,
                Ok(None) => break,
                Err(e) => return Err(Self::map_error(e, archive_path)),
            };

            let header = at_file.entry();

            // Strip anything that could climb out of the destination
            let safe: PathBuf = Path::new(&header.filename)
                .components()
                .filter(|c| matches!(c, std::path::Component::Normal(_)))
                .collect();

            if safe.as_os_str().is_empty() || header.is_directory() {
                at_header = at_file.skip().map_err(|e| {
                    Error::PostProcess(PostProcessError::ExtractionFailed {
                        archive: archive_path.to_path_buf(),
                        reason: format!("failed to skip entry: {e}"),
                    })
                })?;
                continue;
            }

            let out = dest_path.join(&safe);
            at_header = at_file
                .extract_to(&out)
                .map_err(|e| Self::map_error(e, archive_path))?;
            extracted.push(out);
        }

        Ok(extracted)
    }

    /// Extract with the candidate password list
    pub async fn extract_with_passwords(
        job: &JobId,
        archive_path: &Path,
        dest_path: &Path,
        passwords: &PasswordList,
    ) -> Result<Extracted> {
        extract_with_passwords("RAR", Self::try_extract, job, archive_path, dest_path, passwords)
            .await
    }
}
