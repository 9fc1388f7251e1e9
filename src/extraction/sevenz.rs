//! 7z extraction via the sevenz-rust crate

use crate::error::{Error, PostProcessError, Result};
use crate::types::JobId;
use std::path::{Path, PathBuf};
use tracing::debug;

use super::Extracted;
use super::password_list::PasswordList;
use super::shared::extract_with_passwords;

/// Extractor for 7z archives
pub struct SevenZipExtractor;

impl SevenZipExtractor {
    fn is_password_error(msg: &str) -> bool {
        let lower = msg.to_lowercase();
        lower.contains("password") || lower.contains("checksum") || lower.contains("aes")
    }

    /// Extract with one password; blocking, called via `spawn_blocking`.
    pub fn try_extract(
        archive_path: &Path,
        password: &str,
        dest_path: &Path,
    ) -> Result<Vec<PathBuf>> {
        debug!(archive = %archive_path.display(), "attempting 7z extraction");
        std::fs::create_dir_all(dest_path)?;

        let result = if password.is_empty() {
            sevenz_rust::decompress_file(archive_path, dest_path)
        } else {
            sevenz_rust::decompress_file_with_password(
                archive_path,
                dest_path,
                sevenz_rust::Password::from(password),
            )
        };

        match result {
            Ok(()) => collect_extracted(dest_path),
            Err(e) => {
                let msg = e.to_string();
                if Self::is_password_error(&msg) {
                    Err(Error::PostProcess(PostProcessError::WrongPassword {
                        archive: archive_path.to_path_buf(),
                    }))
                } else {
                    Err(Error::PostProcess(PostProcessError::ExtractionFailed {
                        archive: archive_path.to_path_buf(),
                        reason: msg,
                    }))
                }
            }
        }
    }

    /// Extract with the candidate password list
    pub async fn extract_with_passwords(
        job: &JobId,
        archive_path: &Path,
        dest_path: &Path,
        passwords: &PasswordList,
    ) -> Result<Extracted> {
        extract_with_passwords("7z", Self::try_extract, job, archive_path, dest_path, passwords)
            .await
    }
}

/// The sevenz API extracts in place; enumerate what landed under the
/// destination, rejecting anything that escaped it.
fn collect_extracted(dest_path: &Path) -> Result<Vec<PathBuf>> {
    let canonical_dest = dest_path.canonicalize()?;
    let mut files = Vec::new();
    let mut stack = vec![dest_path.to_path_buf()];
    while let Some(dir) = stack.pop() {
        for entry in std::fs::read_dir(&dir)? {
            let path = entry?.path();
            let canonical = path.canonicalize()?;
            if !canonical.starts_with(&canonical_dest) {
                return Err(Error::PostProcess(PostProcessError::InvalidPath {
                    path,
                    reason: "extracted entry escaped the destination".to_string(),
                }));
            }
            if path.is_dir() {
                stack.push(path);
            } else {
                files.push(path);
            }
        }
    }
    files.sort();
    Ok(files)
}
