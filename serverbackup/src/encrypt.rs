//! Symmetric encryption of an archive before upload.
//!
//! gpg writes `<archive>.gpg` next to the plaintext. The passphrase is handed
//! over on an inherited pipe (`--passphrase-fd`), so it never appears in the
//! process list and gpg never prompts on a terminal.

use crate::archive::encrypted_sibling;
use crate::capability::Capability;
use crate::config::{EncryptionSettings, JobPlan};
use crate::executor::context::RunContext;
use crate::retention::remove_if_present;
use crate::utils::errors::{BackupError, Result};
use std::fs::File;
use std::io::{self, Write};
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// What happened to the encrypted sibling after the upload step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SiblingFate {
    Deleted,
    Kept,
}

pub struct EncryptionGate {
    gpg: Capability,
    settings: EncryptionSettings,
}

impl EncryptionGate {
    pub fn new(plan: &JobPlan, settings: EncryptionSettings) -> Self {
        Self {
            gpg: Capability::new("gpg", &plan.tools.gpg, plan.timeouts.encrypt()),
            settings,
        }
    }

    /// Encrypt `archive` into its sibling. The plaintext is left untouched.
    pub async fn encrypt(&self, ctx: &RunContext, archive: &Path) -> Result<PathBuf> {
        let sibling = encrypted_sibling(archive);
        info!(job = %ctx.job, output = %sibling.display(), "Encrypting before upload");

        // A sibling left by an interrupted run must not be mistaken for ours
        remove_if_present(&sibling)?;

        let (read_end, write_end) = nix::unistd::pipe().map_err(io::Error::from)?;
        {
            let mut writer = File::from(write_end);
            writer.write_all(self.settings.passphrase.expose().as_bytes())?;
            writer.write_all(b"\n")?;
        }

        let mut cmd = self.gpg.command();
        cmd.arg("--passphrase-fd")
            .arg(read_end.as_raw_fd().to_string())
            .args(["--quiet", "--batch", "--yes", "--output"])
            .arg(&sibling)
            .arg("--symmetric")
            .arg(archive);

        let result = self.gpg.run(cmd).await;
        drop(read_end);

        if let Err(e) = result {
            if let Err(cleanup) = remove_if_present(&sibling) {
                warn!(sibling = %sibling.display(), error = %cleanup, "Failed to remove partial encrypted backup");
            }
            return Err(BackupError::EncryptFailed(e));
        }

        debug!(job = %ctx.job, sibling = %sibling.display(), "Encryption complete");
        Ok(sibling)
    }

    /// Dispose of the sibling once the upload step is over. It is only
    /// deleted after a successful upload, and only when not configured to keep it.
    pub fn after_upload(&self, sibling: &Path, uploaded: bool) -> Result<SiblingFate> {
        if !uploaded || self.settings.keep_after_upload {
            debug!(sibling = %sibling.display(), uploaded, "Keeping encrypted backup");
            return Ok(SiblingFate::Kept);
        }

        debug!(sibling = %sibling.display(), "Deleting encrypted backup");
        remove_if_present(sibling)?;
        Ok(SiblingFate::Deleted)
    }
}
