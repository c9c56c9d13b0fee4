//! Wire format of the remote deployment file.
//!
//! The payload is one `value=path` record per line, where `value` is the
//! content hash or `1` for a directory, compressed as a whole. Raw DEFLATE is
//! the default and matches manifests written by earlier deployments; zstd
//! frames are recognised by their magic number when decoding.

use super::{Manifest, ManifestEntry};
use crate::utils::errors::ManifestError;
use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};

/// Value written for directory entries.
pub const DIRECTORY_FLAG: &str = "1";

const ZSTD_MAGIC: [u8; 4] = [0x28, 0xB5, 0x2F, 0xFD];
const DEFLATE_LEVEL: u32 = 9;
const ZSTD_LEVEL: i32 = 3;

/// Compression applied to an encoded manifest.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    #[default]
    Deflate,
    Zstd,
}

/// Serialize and compress `manifest`.
pub fn encode(manifest: &Manifest, compression: Compression) -> Result<Vec<u8>, ManifestError> {
    let mut text = String::new();
    for (path, entry) in manifest.iter() {
        let value = match entry {
            ManifestEntry::Directory => DIRECTORY_FLAG,
            ManifestEntry::File(hash) => hash.as_str(),
        };
        text.push_str(value);
        text.push('=');
        text.push_str(path);
        text.push('\n');
    }

    match compression {
        Compression::Deflate => {
            let mut encoder =
                DeflateEncoder::new(Vec::new(), flate2::Compression::new(DEFLATE_LEVEL));
            encoder
                .write_all(text.as_bytes())
                .map_err(ManifestError::Compress)?;
            encoder.finish().map_err(ManifestError::Compress)
        }
        Compression::Zstd => {
            zstd::stream::encode_all(text.as_bytes(), ZSTD_LEVEL).map_err(ManifestError::Compress)
        }
    }
}

/// Decompress and parse a manifest. Lines without `=` are ignored.
pub fn decode(bytes: &[u8]) -> Result<Manifest, ManifestError> {
    let raw = if bytes.starts_with(&ZSTD_MAGIC) {
        zstd::stream::decode_all(bytes).map_err(ManifestError::Decompress)?
    } else {
        let mut raw = Vec::new();
        DeflateDecoder::new(bytes)
            .read_to_end(&mut raw)
            .map_err(ManifestError::Decompress)?;
        raw
    };
    let text = String::from_utf8(raw)?;

    Ok(text
        .lines()
        .filter_map(|line| line.split_once('='))
        .map(|(value, path)| {
            let entry = if value == DIRECTORY_FLAG {
                ManifestEntry::Directory
            } else {
                ManifestEntry::File(value.to_string())
            };
            (path.to_string(), entry)
        })
        .collect())
}
