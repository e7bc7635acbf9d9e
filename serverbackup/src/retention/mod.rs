//! Local retention over a job's backup set.
//!
//! Two mutually exclusive policies exist: the deprecated age policy
//! (`retention_days`) and the count policy (`max_local_copies`). Both measure
//! age in 23-hour units taken from each archive's METADATA, so a daily run
//! with `retention_days = N` reliably clears archives that are due even when
//! the schedule drifts. Archives without readable metadata are always deleted.

pub mod backup_set;

pub use backup_set::{scan_backup_set, ArchiveCandidate, ArchiveStatus};

use crate::archive::{encrypted_sibling, ArchiveNaming};
use crate::executor::context::RunContext;
use crate::utils::errors::Result;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Length of one age unit: 23 hours.
pub const AGE_UNIT_SECS: i64 = 23 * 60 * 60;

/// Age of an archive in whole 23-hour units, rounded down. `None` when the
/// recorded timestamp is so far off that the difference overflows.
pub fn age_units(now: i64, timestamp: i64) -> Option<i64> {
    now.checked_sub(timestamp).map(|secs| secs.div_euclid(AGE_UNIT_SECS))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetentionPolicy {
    /// Delete archives older than `retention_days` age units (deprecated)
    AgeBased { retention_days: u32 },

    /// Keep the `max_local_copies` youngest archives
    CountBased { max_local_copies: u32 },
}

impl RetentionPolicy {
    /// `retention_days` wins when both are configured.
    pub fn from_settings(retention_days: Option<u32>, max_local_copies: Option<u32>) -> Option<Self> {
        match (retention_days, max_local_copies) {
            (Some(retention_days), _) => Some(RetentionPolicy::AgeBased { retention_days }),
            (None, Some(max_local_copies)) => Some(RetentionPolicy::CountBased { max_local_copies }),
            (None, None) => None,
        }
    }

    /// Only the count policy reconciles again once the new archive exists.
    pub fn runs_after_upload(&self) -> bool {
        matches!(self, RetentionPolicy::CountBased { .. })
    }

    /// The policy as applied in `pass`. Before the build the count policy
    /// leaves a slot for the archive about to be written, but never prunes
    /// the last copy.
    pub fn for_pass(self, pass: RetentionPass) -> Self {
        match (self, pass) {
            (RetentionPolicy::CountBased { max_local_copies }, RetentionPass::PreBuild) => {
                RetentionPolicy::CountBased {
                    max_local_copies: max_local_copies.saturating_sub(1).max(1),
                }
            }
            (policy, _) => policy,
        }
    }
}

/// When in the run a retention pass happens.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetentionPass {
    PreBuild,
    PostUpload,
}

impl fmt::Display for RetentionPass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetentionPass::PreBuild => f.write_str("pre-build"),
            RetentionPass::PostUpload => f.write_str("post-upload"),
        }
    }
}

/// Why an archive was selected for deletion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeleteReason {
    Corrupt(String),
    Expired { age_units: i64, retention_days: u32 },
    OverLimit { rank: usize, max_local_copies: u32 },
}

impl fmt::Display for DeleteReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeleteReason::Corrupt(reason) => write!(f, "corrupt ({reason})"),
            DeleteReason::Expired {
                age_units,
                retention_days,
            } => write!(f, "{age_units} days old, retention is {retention_days}"),
            DeleteReason::OverLimit {
                rank,
                max_local_copies,
            } => write!(f, "copy #{rank} exceeds limit of {max_local_copies}"),
        }
    }
}

/// Outcome of applying a policy to a backup set, before anything is deleted.
#[derive(Debug, Default)]
pub struct RetentionPlan {
    pub keep: Vec<ArchiveCandidate>,
    pub delete: Vec<(ArchiveCandidate, DeleteReason)>,
}

/// Decide which archives to keep. Pure: no filesystem access.
pub fn plan(policy: RetentionPolicy, candidates: Vec<ArchiveCandidate>, now: i64) -> RetentionPlan {
    let mut result = RetentionPlan::default();
    let mut valid = Vec::with_capacity(candidates.len());

    for candidate in candidates {
        match &candidate.status {
            ArchiveStatus::Corrupt(reason) => {
                let reason = DeleteReason::Corrupt(reason.clone());
                result.delete.push((candidate, reason));
            }
            ArchiveStatus::Valid { timestamp } => match age_units(now, *timestamp) {
                Some(age) => valid.push((age, candidate)),
                None => {
                    let reason = DeleteReason::Corrupt(format!("timestamp {timestamp} out of range"));
                    result.delete.push((candidate, reason));
                }
            },
        }
    }

    match policy {
        RetentionPolicy::AgeBased { retention_days } => {
            for (age, candidate) in valid {
                if age > i64::from(retention_days) {
                    let reason = DeleteReason::Expired {
                        age_units: age,
                        retention_days,
                    };
                    result.delete.push((candidate, reason));
                } else {
                    result.keep.push(candidate);
                }
            }
        }
        RetentionPolicy::CountBased { max_local_copies } => {
            valid.sort_by(|(age_a, a), (age_b, b)| {
                age_a.cmp(age_b).then_with(|| a.file_name.cmp(&b.file_name))
            });
            for (index, (_, candidate)) in valid.into_iter().enumerate() {
                if index < max_local_copies as usize {
                    result.keep.push(candidate);
                } else {
                    let reason = DeleteReason::OverLimit {
                        rank: index + 1,
                        max_local_copies,
                    };
                    result.delete.push((candidate, reason));
                }
            }
        }
    }

    result
}

/// Summary of one retention pass.
#[derive(Debug, Clone, Default)]
pub struct RetentionReport {
    pub retained: Vec<PathBuf>,
    pub deleted: Vec<PathBuf>,
    /// Encrypted siblings removed alongside their archives
    pub deleted_siblings: Vec<PathBuf>,
    pub corrupt: usize,
}

/// Applies a retention policy to one job's backup directory.
#[derive(Debug, Clone)]
pub struct RetentionEnforcer {
    backup_dir: PathBuf,
    naming: ArchiveNaming,
    policy: RetentionPolicy,
}

impl RetentionEnforcer {
    pub fn new(backup_dir: &Path, naming: &ArchiveNaming, policy: RetentionPolicy) -> Self {
        Self {
            backup_dir: backup_dir.to_path_buf(),
            naming: naming.clone(),
            policy,
        }
    }

    pub fn policy(&self) -> RetentionPolicy {
        self.policy
    }

    /// Run one pass against the current wall clock.
    pub async fn enforce(&self, ctx: &RunContext, pass: RetentionPass) -> Result<RetentionReport> {
        let enforcer = self.clone();
        let job = ctx.job.clone();
        let now = chrono::Utc::now().timestamp();
        tokio::task::spawn_blocking(move || enforcer.enforce_at(&job, pass, now))
            .await
            .map_err(io::Error::other)?
    }

    /// Run one pass with an explicit `now` (unix seconds).
    pub fn enforce_at(&self, job: &str, pass: RetentionPass, now: i64) -> Result<RetentionReport> {
        let policy = self.policy.for_pass(pass);
        info!(job, %pass, ?policy, dir = %self.backup_dir.display(), "Enforcing retention");

        let candidates = scan_backup_set(&self.backup_dir, &self.naming)?;
        let plan = plan(policy, candidates, now);

        let mut report = RetentionReport {
            retained: plan.keep.iter().map(|c| c.path.clone()).collect(),
            ..Default::default()
        };

        for (candidate, reason) in plan.delete {
            if matches!(reason, DeleteReason::Corrupt(_)) {
                warn!(job, %pass, archive = %candidate.file_name, %reason, "Backup corrupt - deleting");
                report.corrupt += 1;
            } else {
                info!(job, %pass, archive = %candidate.file_name, %reason, "Deleting backup");
            }

            if let Some(sibling) = remove_archive(&candidate.path)? {
                report.deleted_siblings.push(sibling);
            }
            report.deleted.push(candidate.path);
        }

        debug!(
            job,
            %pass,
            retained = report.retained.len(),
            deleted = report.deleted.len(),
            "Retention pass complete"
        );
        Ok(report)
    }
}

/// Delete an archive and its encrypted sibling. Returns the sibling path if
/// one was removed. Already-missing files are not an error.
fn remove_archive(path: &Path) -> io::Result<Option<PathBuf>> {
    remove_if_present(path)?;

    let sibling = encrypted_sibling(path);
    if remove_if_present(&sibling)? {
        debug!(sibling = %sibling.display(), "Deleted encrypted backup");
        return Ok(Some(sibling));
    }
    Ok(None)
}

pub(crate) fn remove_if_present(path: &Path) -> io::Result<bool> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}
