//! Syntax-only validation of persisted candidates.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{debug, instrument};

use crate::io::process::run_command_with_timeout;
use crate::io::runtime::RuntimeProfile;

/// Result of a syntax check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyntaxVerdict {
    Valid,
    Invalid { detail: String },
}

/// Checks a candidate file without running it.
pub trait SyntaxChecker {
    /// `Err` is reserved for failures of the checker itself, not of the candidate.
    fn check(&self, file: &Path) -> Result<SyntaxVerdict>;
}

/// Runs the runtime's syntax check command in a child process.
pub struct CommandSyntaxChecker<'a> {
    runtime: &'a RuntimeProfile,
    timeout: Duration,
    output_limit_bytes: usize,
}

impl<'a> CommandSyntaxChecker<'a> {
    pub fn new(runtime: &'a RuntimeProfile, timeout: Duration, output_limit_bytes: usize) -> Self {
        Self {
            runtime,
            timeout,
            output_limit_bytes,
        }
    }
}

impl SyntaxChecker for CommandSyntaxChecker<'_> {
    #[instrument(skip_all, fields(file = %file.display()))]
    fn check(&self, file: &Path) -> Result<SyntaxVerdict> {
        let cmd = self.runtime.syntax_command(file)?;
        let output = run_command_with_timeout(cmd, None, self.timeout, self.output_limit_bytes)
            .context("run syntax check")?;

        if output.timed_out {
            return Ok(SyntaxVerdict::Invalid {
                detail: format!(
                    "syntax check did not finish within {}ms",
                    self.timeout.as_millis()
                ),
            });
        }
        if output.status.success() {
            debug!("syntax check passed");
            return Ok(SyntaxVerdict::Valid);
        }

        let mut detail = output.stderr_lossy().trim().to_string();
        if detail.is_empty() {
            detail = output.stdout_lossy().trim().to_string();
        }
        if detail.is_empty() {
            detail = format!("syntax check exited with {:?}", output.status.code());
        }
        debug!(exit_code = ?output.status.code(), "syntax check failed");
        Ok(SyntaxVerdict::Invalid { detail })
    }
}
