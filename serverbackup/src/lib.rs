//! serverbackup library
//!
//! Runs one configured backup job: database dumps and directory trees are
//! packed into a zstd-compressed tar archive, old archives are rotated, and
//! the result is optionally encrypted and uploaded with s3cmd.

pub mod archive;
pub mod capability;
pub mod config;
pub mod encrypt;
pub mod executor;
pub mod fs;
pub mod lock;
pub mod retention;
pub mod upload;
pub mod utils;

// Re-export commonly used types
pub use config::{Config, JobPlan};
pub use executor::{BackupExecutor, RunReport};
pub use utils::errors::BackupError;
pub type Result<T> = std::result::Result<T, BackupError>;
