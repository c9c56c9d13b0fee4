//! Content hashing for change detection.
//!
//! The hash is an MD5 hex digest. Text content is hashed with CRLF folded to
//! LF so that a checkout with different line endings does not look changed.

use md5::{Digest, Md5};
use std::fs::{self, File};
use std::io;
use std::path::Path;

/// Files above this size are hashed as raw bytes, streamed from disk.
pub const LARGE_FILE_THRESHOLD: u64 = 5_000_000;

/// Hash the file at `path`.
pub fn hash_file(path: &Path) -> io::Result<String> {
    if fs::metadata(path)?.len() > LARGE_FILE_THRESHOLD {
        let mut file = File::open(path)?;
        let mut hasher = Md5::new();
        io::copy(&mut file, &mut hasher)?;
        return Ok(hex::encode(hasher.finalize()));
    }

    let content = fs::read(path)?;
    Ok(hash_bytes(&content))
}

/// Hash in-memory content with the same normalization as [`hash_file`].
pub fn hash_bytes(content: &[u8]) -> String {
    if looks_textual(content) {
        hex::encode(Md5::digest(normalize_line_endings(content)))
    } else {
        hex::encode(Md5::digest(content))
    }
}

fn looks_textual(content: &[u8]) -> bool {
    content
        .iter()
        .all(|&b| matches!(b, 0x09 | 0x0A | 0x0D | 0x20..=0x7E | 0x80..=0xFF))
}

fn normalize_line_endings(content: &[u8]) -> Vec<u8> {
    let mut normalized = Vec::with_capacity(content.len());
    let mut bytes = content.iter().peekable();
    while let Some(&b) = bytes.next() {
        if b == b'\r' && bytes.peek() == Some(&&b'\n') {
            continue;
        }
        normalized.push(b);
    }
    normalized
}
