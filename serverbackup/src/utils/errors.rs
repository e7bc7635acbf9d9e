//! Custom error types for the backup runner.

use std::path::PathBuf;
use std::process::ExitStatus;
use std::time::Duration;
use thiserror::Error;

/// Failure of a single external program invocation (dump, encrypt, upload).
#[derive(Error, Debug)]
pub enum CapabilityError {
    #[error("failed to start {capability}: {source}")]
    Spawn {
        capability: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("{capability} exited with {status}: {stderr}")]
    Exit {
        capability: &'static str,
        status: ExitStatus,
        stderr: String,
    },

    #[error("{capability} did not finish within {}s", .timeout.as_secs())]
    Timeout {
        capability: &'static str,
        timeout: Duration,
    },
}

#[derive(Error, Debug)]
pub enum BackupError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Another run holds the lock for job {job} ({})", .lock_path.display())]
    LockContention { job: String, lock_path: PathBuf },

    #[error("Dump of database {database} failed: {source}")]
    DumpFailed {
        database: String,
        #[source]
        source: CapabilityError,
    },

    #[error("Source directory {} unavailable: {source}", .path.display())]
    SourceUnavailable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Encryption failed: {0}")]
    EncryptFailed(#[source] CapabilityError),

    #[error("Upload failed: {0}")]
    UploadFailed(#[source] CapabilityError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl BackupError {
    /// Process exit status for this failure. Success is always 0.
    pub fn exit_code(&self) -> u8 {
        match self {
            BackupError::Config(_) => 2,
            BackupError::LockContention { .. } => 3,
            _ => 1,
        }
    }
}

impl From<config::ConfigError> for BackupError {
    fn from(err: config::ConfigError) -> Self {
        BackupError::Config(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, BackupError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes_distinguish_fatal_conditions() {
        assert_eq!(BackupError::Config("x".into()).exit_code(), 2);
        let lock = BackupError::LockContention {
            job: "web".into(),
            lock_path: PathBuf::from("/var/backups/web/.serverbackup.lock"),
        };
        assert_eq!(lock.exit_code(), 3);
        let io = BackupError::Io(std::io::Error::other("disk full"));
        assert_eq!(io.exit_code(), 1);
    }

    #[test]
    fn test_timeout_message() {
        let err = CapabilityError::Timeout {
            capability: "mysqldump",
            timeout: Duration::from_secs(30),
        };
        assert_eq!(err.to_string(), "mysqldump did not finish within 30s");
    }
}
