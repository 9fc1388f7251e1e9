//! Pure Rust reader for PAR2 File Description packets
//!
//! PAR2 sets carry the real filenames of the files they protect, which is
//! how obfuscated releases get their names back: match each downloaded file
//! against the packet's 16 KB MD5 and rename it to the packet's filename.
//!
//! Packet layout (all little-endian):
//! magic `PAR2\0PKT` (8) | packet length (8) | packet hash (16) |
//! set id (16) | type (16) | body. A File Description body is
//! file id (16) | file MD5 (16) | 16 KB MD5 (16) | file length (8) |
//! null-padded UTF-8 filename.

use std::path::Path;

const PACKET_MAGIC: &[u8; 8] = b"PAR2\0PKT";
const FILE_DESC_TYPE: &[u8; 16] = b"PAR 2.0\0FileDesc";

const HEADER_LEN: usize = 8 + 8 + 16 + 16 + 16;
const TYPE_OFFSET: usize = 8 + 8 + 16 + 16;
const BODY_FIXED_LEN: usize = 16 + 16 + 16 + 8;
const MD5_16K_OFFSET: usize = 16 + 16;

/// One file the PAR2 set describes
#[derive(Debug, Clone)]
pub struct Par2FileEntry {
    /// The real filename carried by the recovery set
    pub filename: String,
    /// MD5 of the file's first 16 KB, used for matching
    pub hash_16k: [u8; 16],
}

/// Read every File Description packet from a PAR2 file.
///
/// A file without such packets yields an empty list, not an error.
pub fn parse_par2_file_entries(par2_path: &Path) -> crate::error::Result<Vec<Par2FileEntry>> {
    let data = std::fs::read(par2_path)?;
    Ok(scan_packets(&data))
}

fn scan_packets(data: &[u8]) -> Vec<Par2FileEntry> {
    let mut entries = Vec::new();
    let mut pos = 0;

    while let Some(start) = next_magic(data, pos) {
        if start + HEADER_LEN > data.len() {
            break;
        }

        let packet_len = u64::from_le_bytes(
            data[start + 8..start + 16].try_into().unwrap_or_default(),
        ) as usize;

        // A corrupt length would walk us off the buffer; resync past this
        // magic instead
        if packet_len < HEADER_LEN || start + packet_len > data.len() {
            pos = start + 8;
            continue;
        }

        if &data[start + TYPE_OFFSET..start + TYPE_OFFSET + 16] == FILE_DESC_TYPE {
            if let Some(entry) = decode_file_desc(&data[start + HEADER_LEN..start + packet_len]) {
                entries.push(entry);
            }
        }
        pos = start + packet_len;
    }

    entries
}

fn next_magic(data: &[u8], from: usize) -> Option<usize> {
    if from + PACKET_MAGIC.len() > data.len() {
        return None;
    }
    data[from..]
        .windows(PACKET_MAGIC.len())
        .position(|w| w == PACKET_MAGIC)
        .map(|offset| from + offset)
}

fn decode_file_desc(body: &[u8]) -> Option<Par2FileEntry> {
    if body.len() < BODY_FIXED_LEN {
        return None;
    }
    let mut hash_16k = [0u8; 16];
    hash_16k.copy_from_slice(&body[MD5_16K_OFFSET..MD5_16K_OFFSET + 16]);

    let name_bytes = &body[BODY_FIXED_LEN..];
    let end = name_bytes
        .iter()
        .position(|&b| b == 0)
        .unwrap_or(name_bytes.len());
    let filename = String::from_utf8_lossy(&name_bytes[..end]).into_owned();
    if filename.is_empty() {
        return None;
    }
    Some(Par2FileEntry { filename, hash_16k })
}

/// MD5 of the first 16 KB of a file, for matching against
/// [`Par2FileEntry::hash_16k`].
pub fn compute_16k_md5(file_path: &Path) -> crate::error::Result<[u8; 16]> {
    use std::io::Read;

    let mut file = std::fs::File::open(file_path)?;
    let mut buffer = [0u8; 16384];
    let bytes_read = file.read(&mut buffer)?;
    Ok(md5::compute(&buffer[..bytes_read]).0)
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    fn file_desc_packet(filename: &str, hash_16k: [u8; 16]) -> Vec<u8> {
        let name = filename.as_bytes();
        let padded_len = (name.len() + 3) & !3;
        let packet_len = (HEADER_LEN + BODY_FIXED_LEN + padded_len) as u64;

        let mut packet = Vec::new();
        packet.extend_from_slice(PACKET_MAGIC);
        packet.extend_from_slice(&packet_len.to_le_bytes());
        packet.extend_from_slice(&[0u8; 16]); // packet hash
        packet.extend_from_slice(&[0u8; 16]); // set id
        packet.extend_from_slice(FILE_DESC_TYPE);
        packet.extend_from_slice(&[0u8; 16]); // file id
        packet.extend_from_slice(&[0u8; 16]); // file md5
        packet.extend_from_slice(&hash_16k);
        packet.extend_from_slice(&4096u64.to_le_bytes());
        packet.extend_from_slice(name);
        packet.extend_from_slice(&vec![0u8; padded_len - name.len()]);
        packet
    }

    #[test]
    fn extracts_filenames_and_hashes() {
        let mut data = file_desc_packet("episode.mkv", [7u8; 16]);
        data.extend_from_slice(&file_desc_packet("episode.nfo", [9u8; 16]));

        let entries = scan_packets(&data);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].filename, "episode.mkv");
        assert_eq!(entries[0].hash_16k, [7u8; 16]);
        assert_eq!(entries[1].filename, "episode.nfo");
    }

    #[test]
    fn skips_non_file_desc_packets() {
        let mut data = Vec::new();
        let body_len = 12usize;
        let packet_len = (HEADER_LEN + body_len) as u64;
        data.extend_from_slice(PACKET_MAGIC);
        data.extend_from_slice(&packet_len.to_le_bytes());
        data.extend_from_slice(&[0u8; 16]);
        data.extend_from_slice(&[0u8; 16]);
        data.extend_from_slice(b"PAR 2.0\0Main\0\0\0\0");
        data.extend_from_slice(&vec![0u8; body_len]);
        data.extend_from_slice(&file_desc_packet("kept.rar", [1u8; 16]));

        let entries = scan_packets(&data);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].filename, "kept.rar");
    }

    #[test]
    fn survives_garbage_and_truncation() {
        assert!(scan_packets(&[]).is_empty());
        assert!(scan_packets(&[0xFF; 512]).is_empty());

        let full = file_desc_packet("cut.bin", [2u8; 16]);
        assert!(scan_packets(&full[..HEADER_LEN]).is_empty());
    }

    #[test]
    fn resyncs_past_corrupt_packet_length() {
        // First packet claims an absurd length; the scanner must still find
        // the intact packet after it
        let mut corrupt = Vec::new();
        corrupt.extend_from_slice(PACKET_MAGIC);
        corrupt.extend_from_slice(&u64::MAX.to_le_bytes());
        corrupt.extend_from_slice(&[0u8; 48]);
        corrupt.extend_from_slice(&file_desc_packet("after.bin", [3u8; 16]));

        let entries = scan_packets(&corrupt);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].filename, "after.bin");
    }

    #[test]
    fn sixteen_k_md5_matches_manual_digest() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sample.bin");
        std::fs::write(&path, b"hello par2 world").unwrap();

        let hash = compute_16k_md5(&path).unwrap();
        assert_eq!(hash, md5::compute(b"hello par2 world").0);
    }
}
