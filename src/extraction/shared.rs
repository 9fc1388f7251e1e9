//! Shared extraction plumbing: password attempts, detection, recursion

use crate::config::ExtractionConfig;
use crate::error::{Error, PostProcessError, Result};
use crate::types::JobId;
use std::path::{Path, PathBuf};
use tokio::task::spawn_blocking;
use tracing::{debug, info, warn};

use super::password_list::PasswordList;
use super::Extracted;

/// Try each password in order against `try_extract_fn` (run on a blocking
/// thread). The single implementation behind every format's
/// `extract_with_passwords`.
pub(crate) async fn extract_with_passwords(
    format_name: &str,
    try_extract_fn: impl Fn(&Path, &str, &Path) -> Result<Vec<PathBuf>> + Send + 'static + Clone,
    job: &JobId,
    archive_path: &Path,
    dest_path: &Path,
    passwords: &PasswordList,
) -> Result<Extracted> {
    // An unprotected archive still extracts with the empty password, so an
    // empty candidate list first tries without one
    let candidates: Vec<String> = if passwords.is_empty() {
        vec![String::new()]
    } else {
        passwords.iter().cloned().collect()
    };

    let mut saw_password_error = false;

    for (i, password) in candidates.iter().enumerate() {
        debug!(
            job = %job,
            attempt = i + 1,
            total = candidates.len(),
            "trying {format_name} extraction"
        );

        let archive_owned = archive_path.to_path_buf();
        let dest_owned = dest_path.to_path_buf();
        let password_owned = password.clone();
        let try_fn = try_extract_fn.clone();

        let result = spawn_blocking(move || try_fn(&archive_owned, &password_owned, &dest_owned))
            .await
            .map_err(|e| {
                Error::PostProcess(PostProcessError::ToolCrashed {
                    tool: format_name.to_string(),
                    reason: format!("extraction task panicked: {e}"),
                })
            })?;

        match result {
            Ok(files) => {
                info!(
                    job = %job,
                    archive = %archive_path.display(),
                    count = files.len(),
                    "{format_name} extraction succeeded"
                );
                let used_password = (!password.is_empty()).then(|| password.clone());
                return Ok(Extracted {
                    files,
                    used_password,
                });
            }
            Err(Error::PostProcess(PostProcessError::WrongPassword { .. })) => {
                saw_password_error = true;
                debug!(job = %job, attempt = i + 1, "wrong password, trying next");
            }
            Err(e) => {
                warn!(
                    job = %job,
                    archive = %archive_path.display(),
                    error = %e,
                    "{format_name} extraction failed with non-password error"
                );
                return Err(e);
            }
        }
    }

    if saw_password_error && passwords.is_empty() {
        return Err(Error::PostProcess(PostProcessError::NoPasswordsAvailable {
            archive: archive_path.to_path_buf(),
        }));
    }
    Err(Error::PostProcess(PostProcessError::AllPasswordsFailed {
        archive: archive_path.to_path_buf(),
        count: candidates.len(),
    }))
}

/// Whether a file looks like an archive per the configured extension list
pub fn is_archive(path: &Path, archive_extensions: &[String]) -> bool {
    path.extension()
        .map(|ext| {
            let ext = ext.to_string_lossy().to_lowercase();
            archive_extensions.iter().any(|a| a.to_lowercase() == ext)
        })
        .unwrap_or(false)
}

/// Find the extraction entry points in a directory.
///
/// Multi-volume RAR sets contribute one entry: `.rar` for old-style sets
/// (the `.rNN` volumes follow implicitly), `part1.rar`/`part01.rar` for
/// new-style sets. 7z and zip files are taken as they come.
pub fn detect_archives(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut archives = Vec::new();

    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            continue;
        }
        let Some(ext) = path.extension().map(|e| e.to_string_lossy().to_lowercase()) else {
            continue;
        };
        let stem = path
            .file_stem()
            .map(|s| s.to_string_lossy().to_lowercase())
            .unwrap_or_default();

        match ext.as_str() {
            "rar" => {
                // partNN volumes other than the first are reached through
                // the first volume
                if let Some(part) = part_number(&stem) {
                    if part == 1 {
                        archives.push(path);
                    }
                } else {
                    archives.push(path);
                }
            }
            "7z" | "zip" => archives.push(path),
            _ => {}
        }
    }

    archives.sort();
    Ok(archives)
}

/// The N of a `name.partN` stem, when present
fn part_number(stem: &str) -> Option<u32> {
    let (_, part) = stem.rsplit_once(".part")?;
    part.parse().ok()
}

/// Extract an archive and recurse into any archives it produced, up to the
/// configured depth. Failures of nested archives are logged and skipped so
/// one bad inner file does not lose the rest.
pub fn extract_recursive<'a>(
    job: &'a JobId,
    archive_path: &'a Path,
    dest_path: &'a Path,
    passwords: &'a PasswordList,
    config: &'a ExtractionConfig,
    depth: u32,
) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<Extracted>> + Send + 'a>> {
    Box::pin(async move {
        let mut result = super::extract_archive(job, archive_path, dest_path, passwords).await?;

        if depth >= config.max_recursion_depth {
            debug!(job = %job, depth, "max recursion depth reached, not descending");
            return Ok(result);
        }

        let nested: Vec<PathBuf> = result
            .files
            .iter()
            .filter(|f| is_archive(f, &config.archive_extensions))
            .cloned()
            .collect();

        for inner in nested {
            let inner_dest = dest_path.join(format!(
                "nested_{}_{}",
                inner
                    .file_stem()
                    .and_then(|s| s.to_str())
                    .unwrap_or("archive"),
                depth + 1
            ));
            match extract_recursive(job, &inner, &inner_dest, passwords, config, depth + 1).await {
                Ok(mut nested_result) => {
                    result.files.append(&mut nested_result.files);
                    if result.used_password.is_none() {
                        result.used_password = nested_result.used_password;
                    }
                }
                Err(e) => {
                    warn!(
                        job = %job,
                        archive = %inner.display(),
                        error = %e,
                        "nested archive failed, continuing"
                    );
                }
            }
        }

        Ok(result)
    })
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn is_archive_matches_configured_extensions() {
        let exts = vec!["rar".to_string(), "zip".to_string()];
        assert!(is_archive(Path::new("a.rar"), &exts));
        assert!(is_archive(Path::new("a.RAR"), &exts));
        assert!(!is_archive(Path::new("a.7z"), &exts));
        assert!(!is_archive(Path::new("noext"), &exts));
    }

    #[test]
    fn detect_skips_later_rar_parts() {
        let dir = tempfile::tempdir().unwrap();
        for name in [
            "set.part01.rar",
            "set.part02.rar",
            "set.part03.rar",
            "other.rar",
            "bundle.zip",
            "notes.txt",
        ] {
            std::fs::write(dir.path().join(name), b"x").unwrap();
        }

        let found = detect_archives(dir.path()).unwrap();
        let names: Vec<_> = found
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().to_string())
            .collect();
        assert!(names.contains(&"set.part01.rar".to_string()));
        assert!(!names.contains(&"set.part02.rar".to_string()));
        assert!(names.contains(&"other.rar".to_string()));
        assert!(names.contains(&"bundle.zip".to_string()));
        assert!(!names.contains(&"notes.txt".to_string()));
    }

    #[test]
    fn part_number_parses_new_style_volumes() {
        assert_eq!(part_number("set.part01"), Some(1));
        assert_eq!(part_number("set.part12"), Some(12));
        assert_eq!(part_number("set"), None);
        assert_eq!(part_number("set.partx"), None);
    }

    #[tokio::test]
    async fn wrong_password_walks_the_whole_list() {
        let job = JobId("nzg_test".into());
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("locked.rar");
        std::fs::write(&archive, b"x").unwrap();

        let tried = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
        let tried_clone = tried.clone();

        let passwords = PasswordList::from_vec(vec!["a".into(), "b".into()]);
        let result = extract_with_passwords(
            "RAR",
            move |archive_path: &Path, pw: &str, _dest: &Path| {
                tried_clone.lock().unwrap().push(pw.to_string());
                Err(Error::PostProcess(PostProcessError::WrongPassword {
                    archive: archive_path.to_path_buf(),
                }))
            },
            &job,
            &archive,
            dir.path(),
            &passwords,
        )
        .await;

        assert!(matches!(
            result,
            Err(Error::PostProcess(PostProcessError::AllPasswordsFailed { count: 2, .. }))
        ));
        assert_eq!(*tried.lock().unwrap(), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn successful_password_is_reported_back() {
        let job = JobId("nzg_test".into());
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("locked.rar");
        std::fs::write(&archive, b"x").unwrap();

        let passwords = PasswordList::from_vec(vec!["wrong".into(), "right".into()]);
        let result = extract_with_passwords(
            "RAR",
            |archive_path: &Path, pw: &str, _dest: &Path| {
                if pw == "right" {
                    Ok(vec![PathBuf::from("out.bin")])
                } else {
                    Err(Error::PostProcess(PostProcessError::WrongPassword {
                        archive: archive_path.to_path_buf(),
                    }))
                }
            },
            &job,
            &archive,
            dir.path(),
            &passwords,
        )
        .await
        .unwrap();

        assert_eq!(result.used_password.as_deref(), Some("right"));
        assert_eq!(result.files, vec![PathBuf::from("out.bin")]);
    }

    #[tokio::test]
    async fn empty_list_tries_unprotected_extraction() {
        let job = JobId("nzg_test".into());
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("open.zip");
        std::fs::write(&archive, b"x").unwrap();

        let result = extract_with_passwords(
            "ZIP",
            |_: &Path, pw: &str, _: &Path| {
                assert_eq!(pw, "", "no candidates means try without a password");
                Ok(vec![])
            },
            &job,
            &archive,
            dir.path(),
            &PasswordList::default(),
        )
        .await
        .unwrap();

        assert!(result.used_password.is_none());
    }

    #[tokio::test]
    async fn encrypted_archive_with_no_passwords_reports_none_available() {
        let job = JobId("nzg_test".into());
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("locked.rar");
        std::fs::write(&archive, b"x").unwrap();

        let result = extract_with_passwords(
            "RAR",
            |archive_path: &Path, _: &str, _: &Path| {
                Err(Error::PostProcess(PostProcessError::WrongPassword {
                    archive: archive_path.to_path_buf(),
                }))
            },
            &job,
            &archive,
            dir.path(),
            &PasswordList::default(),
        )
        .await;

        assert!(matches!(
            result,
            Err(Error::PostProcess(PostProcessError::NoPasswordsAvailable { .. }))
        ));
    }

    #[tokio::test]
    async fn non_password_error_stops_immediately() {
        let job = JobId("nzg_test".into());
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("corrupt.rar");
        std::fs::write(&archive, b"x").unwrap();

        let calls = std::sync::Arc::new(std::sync::atomic::AtomicU32::new(0));
        let calls_clone = calls.clone();
        let passwords = PasswordList::from_vec(vec!["a".into(), "b".into()]);

        let result = extract_with_passwords(
            "RAR",
            move |archive_path: &Path, _: &str, _: &Path| {
                calls_clone.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                Err(Error::PostProcess(PostProcessError::ExtractionFailed {
                    archive: archive_path.to_path_buf(),
                    reason: "corrupt header".into(),
                }))
            },
            &job,
            &archive,
            dir.path(),
            &passwords,
        )
        .await;

        assert!(matches!(
            result,
            Err(Error::PostProcess(PostProcessError::ExtractionFailed { .. }))
        ));
        assert_eq!(
            calls.load(std::sync::atomic::Ordering::SeqCst),
            1,
            "corruption is not a password problem; do not retry"
        );
    }
}
