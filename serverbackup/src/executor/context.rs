//! Per-run context handed to every stage.

/// Identity of one invocation, passed explicitly instead of living in
/// process-wide state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunContext {
    /// Job name from the configuration
    pub job: String,

    /// Run start (seconds since Unix epoch)
    pub started_at: i64,
}

impl RunContext {
    pub fn new(job: &str, started_at: i64) -> Self {
        Self {
            job: job.to_string(),
            started_at,
        }
    }

    /// Context for a run starting now.
    pub fn start(job: &str) -> Self {
        Self::new(job, chrono::Utc::now().timestamp())
    }
}
