//! Discovery of a job's archives and their recorded build times.

use crate::archive::{read_archive_metadata, ArchiveNaming};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

/// What retention knows about one archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArchiveStatus {
    /// METADATA parsed; `timestamp` is the build start time
    Valid { timestamp: i64 },

    /// METADATA missing or unreadable
    Corrupt(String),
}

/// An archive in the backup set.
#[derive(Debug, Clone)]
pub struct ArchiveCandidate {
    pub path: PathBuf,
    pub file_name: String,
    pub status: ArchiveStatus,
}

/// List the job's archives in `dir`, sorted by file name, reading each one's
/// METADATA. Encrypted siblings, staging files and anything not named like
/// one of this job's archives are skipped.
pub fn scan_backup_set(dir: &Path, naming: &ArchiveNaming) -> std::io::Result<Vec<ArchiveCandidate>> {
    let mut candidates = Vec::new();

    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let Ok(file_name) = entry.file_name().into_string() else {
            continue;
        };
        if !naming.matches(&file_name) || !entry.file_type()?.is_file() {
            continue;
        }

        let path = entry.path();
        let status = match read_archive_metadata(&path) {
            Ok(metadata) => ArchiveStatus::Valid {
                timestamp: metadata.timestamp,
            },
            Err(e) => ArchiveStatus::Corrupt(e.to_string()),
        };
        debug!(archive = %file_name, ?status, "Found backup");

        candidates.push(ArchiveCandidate {
            path,
            file_name,
            status,
        });
    }

    candidates.sort_by(|a, b| a.file_name.cmp(&b.file_name));
    Ok(candidates)
}
