//! Obfuscated filename detection and renaming
//!
//! Releases often ship with meaningless random filenames. The heuristics
//! here flag such names so the deobfuscate stage can rename the surviving
//! large files after the job's display name. Deliberately conservative:
//! missing an obfuscated file is cheaper than renaming a real one.

use std::path::{Path, PathBuf};

/// Below this length apparent randomness is too likely by chance
const MIN_ENTROPY_LENGTH: usize = 24;

/// Whether a filename looks random rather than chosen by a person.
///
/// Flags uniform-mix alphanumerics, UUIDs (with or without hyphens), long
/// pure-hex strings, and vowel-free strings.
#[must_use]
pub fn is_obfuscated(filename: &str) -> bool {
    let stem = Path::new(filename)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or(filename);

    is_uniform_mix(stem)
        || is_uuid_shaped(stem)
        || (is_hex(stem) && stem.len() > 16)
        || (lacks_vowels(stem) && stem.len() > 8)
}

/// Uniform mix of upper, lower and digits, the signature of base62-style
/// random names like `aB3cD5eF7gH9iJ1kL2mN4oP6`.
fn is_uniform_mix(s: &str) -> bool {
    if s.len() < MIN_ENTROPY_LENGTH {
        return false;
    }

    let mut upper = 0usize;
    let mut lower = 0usize;
    let mut digit = 0usize;
    for c in s.chars() {
        match c {
            'A'..='Z' => upper += 1,
            'a'..='z' => lower += 1,
            '0'..='9' => digit += 1,
            _ => {}
        }
    }
    let total = upper + lower + digit;
    if total < MIN_ENTROPY_LENGTH || upper == 0 || lower == 0 || digit == 0 {
        return false;
    }

    // Every class close to a third of the characters. Structured names
    // (Show.S01E01.1080p) never balance this evenly.
    let near_third = |n: usize| {
        let ratio = n as f32 / total as f32;
        (0.28..=0.38).contains(&ratio)
    };
    near_third(upper) && near_third(lower) && near_third(digit)
}

/// `550e8400-e29b-41d4-a716-446655440000` or the same without hyphens
fn is_uuid_shaped(s: &str) -> bool {
    if s.len() == 36 {
        let parts: Vec<&str> = s.split('-').collect();
        return parts.len() == 5
            && [8, 4, 4, 4, 12]
                .iter()
                .zip(&parts)
                .all(|(len, p)| p.len() == *len && p.chars().all(|c| c.is_ascii_hexdigit()));
    }
    s.len() == 32 && is_hex(s)
}

fn is_hex(s: &str) -> bool {
    !s.is_empty() && s.chars().all(|c| c.is_ascii_hexdigit())
}

fn lacks_vowels(s: &str) -> bool {
    !s.chars()
        .any(|c| matches!(c.to_ascii_lowercase(), 'a' | 'e' | 'i' | 'o' | 'u'))
}

/// A rename the deobfuscate stage performed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rename {
    /// The obfuscated path
    pub from: PathBuf,
    /// The new path under the display name
    pub to: PathBuf,
}

/// Rename obfuscated files at least `min_size` bytes after the job's display
/// name, keeping their extensions. Multiple candidates get `.1`, `.2`, …
/// inserted before the extension. Returns the renames performed.
pub fn deobfuscate_files(
    dir: &Path,
    display_name: &str,
    min_size: u64,
) -> std::io::Result<Vec<Rename>> {
    let mut renames = Vec::new();
    let mut counter = 0usize;

    let mut entries: Vec<PathBuf> = std::fs::read_dir(dir)?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.is_file())
        .collect();
    entries.sort();

    for path in entries {
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if !is_obfuscated(name) {
            continue;
        }
        let size = std::fs::metadata(&path)?.len();
        if size < min_size {
            continue;
        }

        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| format!(".{e}"))
            .unwrap_or_default();
        let new_name = if counter == 0 {
            format!("{display_name}{ext}")
        } else {
            format!("{display_name}.{counter}{ext}")
        };
        counter += 1;

        let to = dir.join(crate::utils::sanitize_filename(&new_name));
        if to.exists() {
            continue;
        }
        std::fs::rename(&path, &to)?;
        tracing::info!(from = %path.display(), to = %to.display(), "deobfuscated filename");
        renames.push(Rename { from: path, to });
    }

    Ok(renames)
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn real_release_names_are_not_flagged() {
        for name in [
            "Movie.Name.2024.1080p.BluRay.x264.mkv",
            "Show.S01E01.WEB-DL.mkv",
            "soundtrack.flac",
            "readme.txt",
        ] {
            assert!(!is_obfuscated(name), "{name} wrongly flagged");
        }
    }

    #[test]
    fn random_names_are_flagged() {
        for name in [
            "a3f8b2c9d1e5f7a4b6c8d0e2f4a6b8c0.mkv", // 32 hex
            "550e8400-e29b-41d4-a716-446655440000.mkv", // uuid
            "bcdfghjklm.bin",                       // no vowels
        ] {
            assert!(is_obfuscated(name), "{name} not flagged");
        }
    }

    #[test]
    fn short_hex_is_not_flagged() {
        // Could be a legitimate CRC tag in a filename
        assert!(!is_obfuscated("deadbeef.mkv"));
    }

    #[test]
    fn deobfuscate_renames_large_random_files_only() {
        let dir = tempfile::tempdir().unwrap();
        let obfuscated = dir
            .path()
            .join("a3f8b2c9d1e5f7a4b6c8d0e2f4a6b8c0.mkv");
        std::fs::write(&obfuscated, vec![0u8; 2048]).unwrap();
        let normal = dir.path().join("My.Show.mkv");
        std::fs::write(&normal, vec![0u8; 2048]).unwrap();
        let tiny = dir.path().join("550e8400e29b41d4a716446655440000.nfo");
        std::fs::write(&tiny, b"small").unwrap();

        let renames = deobfuscate_files(dir.path(), "My Show S01", 1024).unwrap();

        assert_eq!(renames.len(), 1);
        assert_eq!(renames[0].to, dir.path().join("My Show S01.mkv"));
        assert!(dir.path().join("My Show S01.mkv").exists());
        assert!(normal.exists(), "non-obfuscated names stay put");
        assert!(tiny.exists(), "files below the size floor stay put");
    }

    #[test]
    fn multiple_candidates_get_numbered() {
        let dir = tempfile::tempdir().unwrap();
        for name in [
            "0123456789abcdef0123456789abcdef.mkv",
            "fedcba9876543210fedcba9876543210.mkv",
        ] {
            std::fs::write(dir.path().join(name), vec![0u8; 64]).unwrap();
        }

        let renames = deobfuscate_files(dir.path(), "Named", 1).unwrap();
        assert_eq!(renames.len(), 2);
        assert!(dir.path().join("Named.mkv").exists());
        assert!(dir.path().join("Named.1.mkv").exists());
    }
}
