//! Utility functions for filename hygiene, path collisions, and disk space

use crate::error::{Error, PostProcessError, Result};
use std::path::{Path, PathBuf};

/// Maximum number of rename attempts when resolving path collisions
const MAX_RENAME_ATTEMPTS: u32 = 9999;

/// Characters never allowed in output filenames, regardless of platform.
///
/// The set covers Windows-forbidden characters so that output remains
/// portable to case-insensitive filesystems.
const FORBIDDEN_CHARS: &[char] = &['\\', '/', ':', '*', '?', '"', '<', '>', '|', '\0'];

/// Device names reserved on case-insensitive filesystems
const RESERVED_NAMES: &[&str] = &[
    "con", "prn", "aux", "nul", "com1", "com2", "com3", "com4", "com5", "com6", "com7", "com8",
    "com9", "lpt1", "lpt2", "lpt3", "lpt4", "lpt5", "lpt6", "lpt7", "lpt8", "lpt9",
];

/// Longest filename (in bytes) we will write; beyond this the stem is clamped
const MAX_FILENAME_LEN: usize = 240;

/// Sanitize a declared filename before it touches the filesystem.
///
/// Replaces forbidden characters with `_`, strips leading/trailing dots and
/// whitespace, prefixes reserved device names, and clamps overlong names
/// while keeping the extension. The function is idempotent:
/// `sanitize_filename(sanitize_filename(x)) == sanitize_filename(x)`.
pub fn sanitize_filename(name: &str) -> String {
    let mut cleaned: String = name
        .chars()
        .map(|c| {
            if FORBIDDEN_CHARS.contains(&c) || c.is_control() {
                '_'
            } else {
                c
            }
        })
        .collect();

    // Leading/trailing dots and spaces confuse both shells and Windows
    cleaned = cleaned.trim_matches([' ', '.']).to_string();

    if cleaned.is_empty() {
        return "unnamed".to_string();
    }

    // Reserved device names: "con", "con.txt" are both unusable on Windows
    let stem_lower = cleaned
        .split('.')
        .next()
        .unwrap_or_default()
        .to_lowercase();
    if RESERVED_NAMES.contains(&stem_lower.as_str()) {
        cleaned = format!("_{cleaned}");
    }

    if cleaned.len() > MAX_FILENAME_LEN {
        cleaned = clamp_filename(&cleaned);
    }

    cleaned
}

/// Clamp an overlong filename, preserving the extension when there is one.
fn clamp_filename(name: &str) -> String {
    let (stem, ext) = match name.rfind('.') {
        // Keep extensions of reasonable length; a "dot late in the name" is
        // not an extension
        Some(idx) if name.len() - idx <= 8 && idx > 0 => (&name[..idx], &name[idx..]),
        _ => (name, ""),
    };

    let budget = MAX_FILENAME_LEN.saturating_sub(ext.len());
    let mut clamped: String = String::with_capacity(MAX_FILENAME_LEN);
    for c in stem.chars() {
        if clamped.len() + c.len_utf8() > budget {
            break;
        }
        clamped.push(c);
    }
    clamped.push_str(ext);
    clamped
}

/// Find a collision-free variant of `path` by appending ` (1)`, ` (2)`, …
///
/// Returns the original path unchanged when nothing occupies it.
pub fn get_unique_path(path: &Path) -> Result<PathBuf> {
    if !path.exists() {
        return Ok(path.to_path_buf());
    }

    let stem = path.file_stem().and_then(|s| s.to_str()).ok_or_else(|| {
        Error::PostProcess(PostProcessError::InvalidPath {
            path: path.to_path_buf(),
            reason: "cannot extract file stem".to_string(),
        })
    })?;

    let extension = path.extension().and_then(|e| e.to_str());

    let parent = path.parent().ok_or_else(|| {
        Error::PostProcess(PostProcessError::InvalidPath {
            path: path.to_path_buf(),
            reason: "cannot extract parent directory".to_string(),
        })
    })?;

    for i in 1..=MAX_RENAME_ATTEMPTS {
        let new_name = match extension {
            Some(ext) => format!("{stem} ({i}).{ext}"),
            None => format!("{stem} ({i})"),
        };
        let new_path = parent.join(new_name);
        if !new_path.exists() {
            return Ok(new_path);
        }
    }

    Err(Error::PostProcess(PostProcessError::InvalidPath {
        path: path.to_path_buf(),
        reason: format!("no unique filename after {MAX_RENAME_ATTEMPTS} attempts"),
    }))
}

/// Format a duration canonically as `HH:MM:SS`.
///
/// Hours are not wrapped: 26 hours renders as `26:00:00`.
pub fn format_hms(duration: std::time::Duration) -> String {
    let total = duration.as_secs();
    let hours = total / 3600;
    let minutes = (total % 3600) / 60;
    let seconds = total % 60;
    format!("{hours:02}:{minutes:02}:{seconds:02}")
}

/// Get available disk space for a given path
///
/// Uses platform-specific APIs to query filesystem statistics:
/// - Unix: statvfs
/// - Windows: GetDiskFreeSpaceExW
pub fn get_available_space(path: &Path) -> std::io::Result<u64> {
    #[cfg(unix)]
    {
        use std::ffi::CString;
        use std::os::unix::ffi::OsStrExt;

        let c_path = CString::new(path.as_os_str().as_bytes())
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;

        // SAFETY: c_path is a valid null-terminated C string, stat is zeroed
        // before the call, the return value is checked, and the struct is
        // only read after success.
        unsafe {
            let mut stat: libc::statvfs = std::mem::zeroed();
            if libc::statvfs(c_path.as_ptr(), &mut stat) != 0 {
                return Err(std::io::Error::last_os_error());
            }

            // f_bavail is blocks available to unprivileged users; f_frsize is
            // the fragment size (preferred over f_bsize)
            let available_bytes = stat.f_bavail.saturating_mul(stat.f_frsize);
            Ok(available_bytes)
        }
    }

    #[cfg(windows)]
    {
        use std::os::windows::ffi::OsStrExt;
        use winapi::um::fileapi::GetDiskFreeSpaceExW;

        let wide_path: Vec<u16> = path
            .as_os_str()
            .encode_wide()
            .chain(std::iter::once(0))
            .collect();

        // SAFETY: wide_path is a valid null-terminated wide string, the
        // output pointers are valid aligned u64s, and the return value is
        // checked before any output is read.
        unsafe {
            let mut free_bytes_available: u64 = 0;
            let mut _total_bytes: u64 = 0;
            let mut _total_free_bytes: u64 = 0;

            if GetDiskFreeSpaceExW(
                wide_path.as_ptr(),
                &mut free_bytes_available as *mut u64 as *mut _,
                &mut _total_bytes as *mut u64 as *mut _,
                &mut _total_free_bytes as *mut u64 as *mut _,
            ) == 0
            {
                return Err(std::io::Error::last_os_error());
            }

            Ok(free_bytes_available)
        }
    }

    #[cfg(not(any(unix, windows)))]
    {
        let _ = path;
        Err(std::io::Error::new(
            std::io::ErrorKind::Unsupported,
            "disk space checking not supported on this platform",
        ))
    }
}
