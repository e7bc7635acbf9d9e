//! Per-job run lock.
//!
//! Two runs of the same job would both scan the backup set before either
//! deletes anything, so the count accounting races. A run therefore holds an
//! exclusive `flock` on a file in the job's backup directory for its whole
//! duration; a second run fails immediately instead of waiting.

use crate::utils::errors::{BackupError, Result};
use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::debug;

pub const LOCK_FILE_NAME: &str = ".serverbackup.lock";

/// Held for the duration of a run; released on drop.
pub struct JobLock {
    _lock: Flock<File>,
    path: PathBuf,
}

impl JobLock {
    /// Take the lock for `job` in `backup_dir` without blocking.
    pub fn acquire(backup_dir: &Path, job: &str) -> Result<Self> {
        let path = backup_dir.join(LOCK_FILE_NAME);
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&path)?;

        let lock = match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
            Ok(lock) => lock,
            Err((_, errno)) if errno == Errno::EWOULDBLOCK => {
                return Err(BackupError::LockContention {
                    job: job.to_string(),
                    lock_path: path,
                })
            }
            Err((_, errno)) => return Err(BackupError::Io(errno.into())),
        };

        // Record the holder for operators; the lock itself is the flock
        let mut holder: &File = &lock;
        holder.set_len(0)?;
        writeln!(holder, "{}", std::process::id())?;

        debug!(job, lock = %path.display(), "Acquired job lock");
        Ok(Self { _lock: lock, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl std::fmt::Debug for JobLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobLock").field("path", &self.path).finish()
    }
}
