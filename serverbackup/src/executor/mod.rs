//! Backup job executor - sequences one run of a job.
//!
//! Order of stages:
//! - acquire the job lock, then sweep staging files of interrupted runs
//! - retention (pre-build)
//! - archive build
//! - encryption (when uploading with a password)
//! - upload
//! - retention (post-upload, count policy only)
//!
//! A failed build aborts the run. Encryption and upload failures are
//! recorded in the [`RunReport`] and the remaining local cleanup still runs,
//! so the archive stays on disk for the next attempt.

pub mod context;

use crate::archive::{sweep_staging, ArchiveBuilder, BuiltArchive};
use crate::config::JobPlan;
use crate::encrypt::{EncryptionGate, SiblingFate};
use crate::lock::JobLock;
use crate::retention::{RetentionEnforcer, RetentionPass, RetentionReport};
use crate::upload::UploadCoordinator;
use crate::utils::errors::{BackupError, Result};
use context::RunContext;
use std::path::PathBuf;
use tracing::{error, info, info_span, Instrument};

/// What happened in the upload stage
#[derive(Debug)]
pub enum UploadOutcome {
    /// No upload target configured
    Skipped,
    Uploaded { path: PathBuf },
    /// Encryption or upload failed; see [`RunReport::failure`]
    Failed,
}

/// Backup run result
#[derive(Debug)]
pub struct RunReport {
    pub archive: BuiltArchive,
    pub pre_retention: Option<RetentionReport>,
    pub post_retention: Option<RetentionReport>,
    /// Encrypted sibling, if one was produced and is still on disk
    pub encrypted: Option<PathBuf>,
    pub upload: UploadOutcome,
    /// First non-fatal stage failure (encryption or upload)
    pub failure: Option<BackupError>,
    pub duration_secs: u64,
}

impl RunReport {
    pub fn is_success(&self) -> bool {
        self.failure.is_none()
    }

    pub fn exit_code(&self) -> u8 {
        self.failure.as_ref().map_or(0, BackupError::exit_code)
    }
}

/// Main backup executor
pub struct BackupExecutor {
    plan: JobPlan,
}

impl BackupExecutor {
    pub fn new(plan: JobPlan) -> Self {
        Self { plan }
    }

    /// Execute one run of the job
    pub async fn execute(&self) -> Result<RunReport> {
        let ctx = RunContext::start(&self.plan.name);
        let span = info_span!("backup_run", job = %ctx.job, run = ctx.started_at);
        self.run(&ctx).instrument(span).await
    }

    async fn run(&self, ctx: &RunContext) -> Result<RunReport> {
        let start_time = std::time::Instant::now();
        let plan = &self.plan;

        tokio::fs::create_dir_all(&plan.backup_dir).await?;
        let _lock = JobLock::acquire(&plan.backup_dir, &plan.name)?;

        let backup_dir = plan.backup_dir.clone();
        tokio::task::spawn_blocking(move || sweep_staging(&backup_dir))
            .await
            .map_err(std::io::Error::other)??;

        let retention = plan
            .retention
            .map(|policy| RetentionEnforcer::new(&plan.backup_dir, &plan.naming, policy));

        let pre_retention = match &retention {
            Some(enforcer) => Some(enforcer.enforce(ctx, RetentionPass::PreBuild).await?),
            None => None,
        };

        let build_started_at = chrono::Utc::now().timestamp();
        let archive = match ArchiveBuilder::new(plan).build(ctx, build_started_at).await {
            Ok(archive) => archive,
            Err(e) => {
                error!(job = %ctx.job, error = %e, "Archive build failed");
                return Err(e);
            }
        };

        let mut report = RunReport {
            archive,
            pre_retention,
            post_retention: None,
            encrypted: None,
            upload: UploadOutcome::Skipped,
            failure: None,
            duration_secs: 0,
        };

        if let Some(target) = &plan.upload {
            self.encrypt_and_upload(ctx, target.clone(), &mut report).await?;
        }

        if let Some(enforcer) = retention.filter(|e| e.policy().runs_after_upload()) {
            report.post_retention = Some(enforcer.enforce(ctx, RetentionPass::PostUpload).await?);
        }

        report.duration_secs = start_time.elapsed().as_secs();
        match &report.failure {
            None => info!(
                job = %ctx.job,
                archive = %report.archive.path.display(),
                duration_secs = report.duration_secs,
                "Backup completed"
            ),
            Some(e) => error!(job = %ctx.job, error = %e, "Backup finished with errors"),
        }

        Ok(report)
    }

    /// Encryption and upload. Their failures land in `report.failure`; only
    /// local I/O errors while cleaning up propagate.
    async fn encrypt_and_upload(
        &self,
        ctx: &RunContext,
        target: crate::config::UploadTarget,
        report: &mut RunReport,
    ) -> Result<()> {
        let plan = &self.plan;
        let gate = plan
            .encryption
            .clone()
            .map(|settings| EncryptionGate::new(plan, settings));

        let upload_path = match &gate {
            Some(gate) => match gate.encrypt(ctx, &report.archive.path).await {
                Ok(sibling) => {
                    report.encrypted = Some(sibling.clone());
                    sibling
                }
                Err(e) => {
                    error!(job = %ctx.job, error = %e, "Encryption failed; skipping upload");
                    report.upload = UploadOutcome::Failed;
                    report.failure = Some(e);
                    return Ok(());
                }
            },
            None => report.archive.path.clone(),
        };

        let coordinator = UploadCoordinator::new(plan, target);
        let uploaded = match coordinator.upload(ctx, &upload_path).await {
            Ok(()) => {
                report.upload = UploadOutcome::Uploaded {
                    path: upload_path.clone(),
                };
                true
            }
            Err(e) => {
                report.upload = UploadOutcome::Failed;
                report.failure = Some(e);
                false
            }
        };

        if let (Some(gate), Some(sibling)) = (&gate, &report.encrypted) {
            if gate.after_upload(sibling, uploaded)? == SiblingFate::Deleted {
                report.encrypted = None;
            }
        }

        Ok(())
    }
}
