//! The METADATA record embedded as the last entry of every archive.
//!
//! Retention never trusts filesystem timestamps: an archive's age comes from
//! the `timestamp` recorded here, and an archive whose record cannot be read
//! is treated as corrupt.

use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Read;
use std::path::Path;
use thiserror::Error;

/// Name of the metadata entry inside the tar stream.
pub const METADATA_ENTRY: &str = "METADATA";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    /// Build start time (seconds since Unix epoch)
    pub timestamp: i64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Hex SHA-256 over all payload bytes, in archive order
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,

    /// Total payload bytes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub len: Option<u64>,
}

impl Metadata {
    pub fn new(timestamp: i64) -> Self {
        Self {
            timestamp,
            description: None,
            sha256: None,
            len: None,
        }
    }
}

/// Why an archive's metadata could not be read.
#[derive(Error, Debug)]
pub enum MetadataError {
    #[error("unreadable archive: {0}")]
    Unreadable(#[from] std::io::Error),

    #[error("no {METADATA_ENTRY} entry")]
    Missing,

    #[error("invalid {METADATA_ENTRY} entry: {0}")]
    Invalid(#[from] serde_json::Error),
}

/// Read the METADATA record from an archive on disk.
///
/// The whole stream is decoded: a truncated or otherwise damaged archive
/// fails here even if its metadata entry happens to be intact.
pub fn read_archive_metadata(path: &Path) -> Result<Metadata, MetadataError> {
    let file = File::open(path)?;
    let decoder = zstd::stream::read::Decoder::new(file)?;
    let mut archive = tar::Archive::new(decoder);

    let mut raw = None;
    for entry in archive.entries()? {
        let mut entry = entry?;
        if entry.path()?.as_ref() == Path::new(METADATA_ENTRY) {
            let mut buf = Vec::new();
            entry.read_to_end(&mut buf)?;
            raw = Some(buf);
        }
    }

    let raw = raw.ok_or(MetadataError::Missing)?;
    Ok(serde_json::from_slice(&raw)?)
}
