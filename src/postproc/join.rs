//! Join stage: concatenate split-file sets
//!
//! Posts sometimes split large files into `name.001`, `name.002`, … parts
//! (or numeric `.ts` style splits). The join stage glues contiguous sets
//! back into the base file and removes the parts. RAR volumes that merely
//! look like splits are left for the unpack stage.

use crate::error::{Error, PostProcessError, Result};
use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

/// Magic bytes opening every RAR archive
const RAR_MAGIC: &[u8] = b"Rar!";

/// One reassembled split set
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinedSet {
    /// The output file the parts were joined into
    pub output: PathBuf,
    /// How many parts went in
    pub parts: usize,
}

/// Join every complete split set found in `dir`. Parts are removed after a
/// successful join; incomplete sets (gaps, missing `.001`) are left alone.
pub fn join_split_sets(dir: &Path) -> Result<Vec<JoinedSet>> {
    let mut sets: BTreeMap<String, BTreeMap<u32, PathBuf>> = BTreeMap::new();

    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if !path.is_file() {
            continue;
        }
        let Some((base, number)) = split_part(&path) else {
            continue;
        };
        sets.entry(base).or_default().insert(number, path);
    }

    let mut joined = Vec::new();
    for (base, parts) in sets {
        if !is_contiguous_from_one(&parts) {
            tracing::debug!(base = %base, "split set incomplete, skipping join");
            continue;
        }
        // A .001 that opens with the RAR magic is a disguised volume set;
        // the unpack stage owns those
        #[allow(clippy::expect_used)]
        let first = parts.values().next().expect("non-empty set");
        if starts_with_magic(first, RAR_MAGIC)? {
            tracing::debug!(base = %base, "split set is RAR volumes, leaving for unpack");
            continue;
        }

        let output = dir.join(&base);
        concat_parts(&output, parts.values())?;
        for part in parts.values() {
            std::fs::remove_file(part)?;
        }
        tracing::info!(output = %output.display(), parts = parts.len(), "joined split set");
        joined.push(JoinedSet {
            output,
            parts: parts.len(),
        });
    }

    Ok(joined)
}

/// `movie.mkv.001` → `("movie.mkv", 1)`; None for non-numeric extensions
fn split_part(path: &Path) -> Option<(String, u32)> {
    let name = path.file_name()?.to_str()?;
    let (base, ext) = name.rsplit_once('.')?;
    if base.is_empty() || ext.len() < 2 || ext.len() > 4 {
        return None;
    }
    let number: u32 = ext.parse().ok()?;
    Some((base.to_string(), number))
}

fn is_contiguous_from_one(parts: &BTreeMap<u32, PathBuf>) -> bool {
    if !parts.contains_key(&1) {
        return false;
    }
    parts
        .keys()
        .zip(1u32..)
        .all(|(found, expected)| *found == expected)
}

fn starts_with_magic(path: &Path, magic: &[u8]) -> Result<bool> {
    let mut file = std::fs::File::open(path)?;
    let mut head = vec![0u8; magic.len()];
    match file.read_exact(&mut head) {
        Ok(()) => Ok(head == magic),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e.into()),
    }
}

fn concat_parts<'a>(
    output: &Path,
    parts: impl Iterator<Item = &'a PathBuf>,
) -> Result<()> {
    let mut out = std::fs::File::create(output)?;
    for part in parts {
        let mut input = std::fs::File::open(part).map_err(|e| {
            Error::PostProcess(PostProcessError::JoinFailed {
                base: output.display().to_string(),
                reason: format!("cannot open {}: {e}", part.display()),
            })
        })?;
        std::io::copy(&mut input, &mut out)?;
    }
    out.flush()?;
    Ok(())
}
