//! Backup archives: naming on disk, the embedded METADATA record, and the
//! builder that produces them.
//!
//! An archive is a zstd-compressed tar stream named
//! `job-<name>[-<timestamp>].tar.zst` inside the job's backup directory.

pub mod builder;
pub mod metadata;

pub use builder::{sweep_staging, ArchiveBuilder, BuiltArchive};
pub use metadata::{read_archive_metadata, Metadata, MetadataError, METADATA_ENTRY};

use std::ffi::OsString;
use std::path::{Path, PathBuf};

pub const ARCHIVE_PREFIX: &str = "job-";
pub const ARCHIVE_EXTENSION: &str = ".tar.zst";

/// Suffix appended to an archive path for its encrypted sibling.
pub const ENCRYPTED_SUFFIX: &str = ".gpg";

/// File naming rules for one job's archives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveNaming {
    job: String,
    timestamped: bool,
}

impl ArchiveNaming {
    pub fn new(job: &str, timestamped: bool) -> Self {
        Self {
            job: job.to_string(),
            timestamped,
        }
    }

    pub fn is_timestamped(&self) -> bool {
        self.timestamped
    }

    /// File name for an archive built at `timestamp`.
    pub fn file_name(&self, timestamp: i64) -> String {
        if self.timestamped {
            format!("{ARCHIVE_PREFIX}{}-{timestamp}{ARCHIVE_EXTENSION}", self.job)
        } else {
            format!("{ARCHIVE_PREFIX}{}{ARCHIVE_EXTENSION}", self.job)
        }
    }

    /// Whether `file_name` belongs to this job's backup set.
    ///
    /// Both the fixed and the timestamped form match regardless of the
    /// current mode, so archives left over from a mode switch still count.
    pub fn matches(&self, file_name: &str) -> bool {
        let Some(rest) = file_name
            .strip_prefix(ARCHIVE_PREFIX)
            .and_then(|rest| rest.strip_prefix(self.job.as_str()))
            .and_then(|rest| rest.strip_suffix(ARCHIVE_EXTENSION))
        else {
            return false;
        };

        match rest.strip_prefix('-') {
            None => rest.is_empty(),
            Some(ts) => !ts.is_empty() && ts.bytes().all(|b| b.is_ascii_digit()),
        }
    }
}

/// Path of the encrypted sibling for `archive`.
pub fn encrypted_sibling(archive: &Path) -> PathBuf {
    let mut path = OsString::from(archive.as_os_str());
    path.push(ENCRYPTED_SUFFIX);
    PathBuf::from(path)
}
