//! ZIP extraction via the zip crate

use crate::error::{Error, PostProcessError, Result};
use crate::types::JobId;
use std::path::{Path, PathBuf};
use tracing::debug;

use super::Extracted;
use super::password_list::PasswordList;
use super::shared::extract_with_passwords;

/// Extractor for ZIP archives
pub struct ZipExtractor;

impl ZipExtractor {
    /// Extract with one password; blocking, called via `spawn_blocking`.
    pub fn try_extract(
        archive_path: &Path,
        password: &str,
        dest_path: &Path,
    ) -> Result<Vec<PathBuf>> {
        debug!(archive = %archive_path.display(), "attempting ZIP extraction");
        std::fs::create_dir_all(dest_path)?;

        let file = std::fs::File::open(archive_path)?;
        let mut archive = zip::ZipArchive::new(file).map_err(|e| {
            Error::PostProcess(PostProcessError::ExtractionFailed {
                archive: archive_path.to_path_buf(),
                reason: format!("failed to read ZIP archive: {e}"),
            })
        })?;

        let mut extracted = Vec::new();
        for i in 0..archive.len() {
            let entry = Self::open_entry(&mut archive, i, password, archive_path)?;
            if let Some(path) = Self::write_entry(entry, dest_path, archive_path)? {
                extracted.push(path);
            }
        }
        Ok(extracted)
    }

    fn open_entry<'a>(
        archive: &'a mut zip::ZipArchive<std::fs::File>,
        index: usize,
        password: &str,
        archive_path: &Path,
    ) -> Result<zip::read::ZipFile<'a>> {
        let map_err = |e: zip::result::ZipError| {
            let msg = e.to_string();
            if msg.to_lowercase().contains("password") || msg.to_lowercase().contains("encrypted") {
                Error::PostProcess(PostProcessError::WrongPassword {
                    archive: archive_path.to_path_buf(),
                })
            } else {
                Error::PostProcess(PostProcessError::ExtractionFailed {
                    archive: archive_path.to_path_buf(),
                    reason: format!("failed to read ZIP entry: {msg}"),
                })
            }
        };

        if password.is_empty() {
            archive.by_index(index).map_err(map_err)
        } else {
            archive
                .by_index_decrypt(index, password.as_bytes())
                .map_err(map_err)?
                .map_err(|_| {
                    Error::PostProcess(PostProcessError::WrongPassword {
                        archive: archive_path.to_path_buf(),
                    })
                })
        }
    }

    fn write_entry(
        mut entry: zip::read::ZipFile,
        dest_path: &Path,
        archive_path: &Path,
    ) -> Result<Option<PathBuf>> {
        // enclosed_name rejects path traversal
        let Some(relative) = entry.enclosed_name().map(Path::to_path_buf) else {
            tracing::warn!("skipping ZIP entry with unsafe path");
            return Ok(None);
        };
        let out = dest_path.join(relative);

        if entry.is_dir() {
            std::fs::create_dir_all(&out)?;
            return Ok(None);
        }

        if let Some(parent) = out.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut outfile = std::fs::File::create(&out)?;
        std::io::copy(&mut entry, &mut outfile).map_err(|e| {
            let msg = e.to_string();
            if msg.to_lowercase().contains("password") {
                Error::PostProcess(PostProcessError::WrongPassword {
                    archive: archive_path.to_path_buf(),
                })
            } else {
                Error::Io(e)
            }
        })?;
        Ok(Some(out))
    }

    /// Extract with the candidate password list
    pub async fn extract_with_passwords(
        job: &JobId,
        archive_path: &Path,
        dest_path: &Path,
        passwords: &PasswordList,
    ) -> Result<Extracted> {
        extract_with_passwords("ZIP", Self::try_extract, job, archive_path, dest_path, passwords)
            .await
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn build_zip(dir: &Path, name: &str, entries: &[(&str, &[u8])]) -> PathBuf {
        let path = dir.join(name);
        let file = std::fs::File::create(&path).unwrap();
        let mut writer = zip::ZipWriter::new(file);
        let options = zip::write::FileOptions::default();
        for (entry_name, data) in entries {
            writer.start_file(*entry_name, options).unwrap();
            writer.write_all(data).unwrap();
        }
        writer.finish().unwrap();
        path
    }

    #[test]
    fn extracts_plain_zip() {
        let dir = tempfile::tempdir().unwrap();
        let archive = build_zip(
            dir.path(),
            "bundle.zip",
            &[("readme.txt", b"hello"), ("sub/data.bin", b"world")],
        );

        let out = dir.path().join("out");
        let files = ZipExtractor::try_extract(&archive, "", &out).unwrap();

        assert_eq!(files.len(), 2);
        assert_eq!(std::fs::read(out.join("readme.txt")).unwrap(), b"hello");
        assert_eq!(std::fs::read(out.join("sub/data.bin")).unwrap(), b"world");
    }

    #[test]
    fn corrupt_zip_reports_extraction_failure() {
        let dir = tempfile::tempdir().unwrap();
        let fake = dir.path().join("fake.zip");
        std::fs::write(&fake, b"certainly not a zip").unwrap();

        let result = ZipExtractor::try_extract(&fake, "", dir.path());
        assert!(matches!(
            result,
            Err(Error::PostProcess(PostProcessError::ExtractionFailed { .. }))
        ));
    }

    #[tokio::test]
    async fn password_list_extraction_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let archive = build_zip(dir.path(), "open.zip", &[("f.txt", b"data")]);
        let job = JobId("nzg_zip".into());

        let result = ZipExtractor::extract_with_passwords(
            &job,
            &archive,
            &dir.path().join("out"),
            &PasswordList::default(),
        )
        .await
        .unwrap();

        assert_eq!(result.files.len(), 1);
        assert!(result.used_password.is_none());
    }
}
