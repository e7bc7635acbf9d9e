//! External program invocation.
//!
//! Every tool the runner depends on (mysqldump, gpg, s3cmd) is spawned
//! through a [`Capability`]: the child is bounded by a timeout, killed when
//! the timeout elapses, and its exit status is always checked.

use crate::utils::errors::CapabilityError;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

/// Longest stderr excerpt carried in an error.
const STDERR_EXCERPT: usize = 512;

/// Captured output of a successful invocation.
#[derive(Debug, Default)]
pub struct CapabilityOutput {
    /// Empty when stdout was redirected elsewhere
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

/// An external tool with its argv prefix and time budget.
#[derive(Debug, Clone)]
pub struct Capability {
    name: &'static str,
    argv: Vec<String>,
    timeout: Duration,
}

impl Capability {
    pub fn new(name: &'static str, argv: &[String], timeout: Duration) -> Self {
        Self {
            name,
            argv: argv.to_vec(),
            timeout,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// A command for this tool, ready for call-specific arguments.
    ///
    /// stdin is closed, stdout and stderr are piped. Callers may redirect
    /// stdout before passing the command to [`Capability::run`].
    pub fn command(&self) -> Command {
        let (program, prefix) = match self.argv.split_first() {
            Some((program, prefix)) => (program.as_str(), prefix),
            None => (self.name, &[][..]),
        };

        let mut cmd = Command::new(program);
        cmd.args(prefix)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }

    /// Run a command built from [`Capability::command`] to completion.
    pub async fn run(&self, mut cmd: Command) -> Result<CapabilityOutput, CapabilityError> {
        let child = cmd.spawn().map_err(|source| CapabilityError::Spawn {
            capability: self.name,
            source,
        })?;

        // Dropping the wait future on timeout kills the child (kill_on_drop)
        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(result) => result.map_err(|source| CapabilityError::Spawn {
                capability: self.name,
                source,
            })?,
            Err(_) => {
                return Err(CapabilityError::Timeout {
                    capability: self.name,
                    timeout: self.timeout,
                })
            }
        };

        if !output.status.success() {
            return Err(CapabilityError::Exit {
                capability: self.name,
                status: output.status,
                stderr: stderr_excerpt(&output.stderr),
            });
        }

        if !output.stderr.is_empty() {
            debug!(capability = self.name, stderr = %stderr_excerpt(&output.stderr), "Tool wrote to stderr");
        }

        Ok(CapabilityOutput {
            stdout: output.stdout,
            stderr: output.stderr,
        })
    }
}

/// Trimmed tail of a tool's stderr, where the actual error usually is.
fn stderr_excerpt(stderr: &[u8]) -> String {
    let text = String::from_utf8_lossy(stderr);
    let text = text.trim();
    if text.len() <= STDERR_EXCERPT {
        return text.to_string();
    }
    let mut start = text.len() - STDERR_EXCERPT;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    format!("...{}", &text[start..])
}
