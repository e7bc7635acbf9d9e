//! Shipping a finished archive to object storage with s3cmd.

use crate::capability::Capability;
use crate::config::{JobPlan, UploadTarget};
use crate::executor::context::RunContext;
use crate::utils::errors::{BackupError, Result};
use std::path::Path;
use tracing::{error, info};

pub struct UploadCoordinator {
    s3cmd: Capability,
    target: UploadTarget,
}

impl UploadCoordinator {
    pub fn new(plan: &JobPlan, target: UploadTarget) -> Self {
        Self {
            s3cmd: Capability::new("s3cmd", &plan.tools.s3cmd, plan.timeouts.upload()),
            target,
        }
    }

    pub fn destination(&self) -> String {
        self.target.destination()
    }

    /// Upload `path`. A failure is returned as [`BackupError::UploadFailed`];
    /// the local file is never touched here.
    pub async fn upload(&self, ctx: &RunContext, path: &Path) -> Result<()> {
        let destination = self.destination();
        info!(job = %ctx.job, file = %path.display(), %destination, "Uploading");

        let mut cmd = self.s3cmd.command();
        cmd.arg("--config")
            .arg(&self.target.s3config)
            .arg("put")
            .arg(path)
            .arg(&destination);

        match self.s3cmd.run(cmd).await {
            Ok(_) => {
                info!(job = %ctx.job, %destination, "Upload complete");
                Ok(())
            }
            Err(e) => {
                error!(job = %ctx.job, file = %path.display(), error = %e, "Upload failed; keeping local copy");
                Err(BackupError::UploadFailed(e))
            }
        }
    }
}
