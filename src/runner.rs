//! External process execution.
//!
//! Every tool call is described by an [`ExternalCommand`] (program plus an
//! ordered argument list) and spawned directly, never through a shell.
//! Calls are awaited one at a time and have no timeout.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::error::ToolError;

/// A program invocation with its arguments and working directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalCommand {
    /// Executable to spawn.
    pub program: PathBuf,
    /// Positional arguments, in order.
    pub args: Vec<String>,
    /// Directory the process runs in.
    pub working_dir: Option<PathBuf>,
}

impl ExternalCommand {
    /// Creates a command with no arguments.
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            working_dir: None,
        }
    }

    /// Appends one argument.
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Appends a path argument.
    pub fn path_arg(self, path: &Path) -> Self {
        self.arg(path.to_string_lossy().to_string())
    }

    /// Sets the working directory.
    pub fn in_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Program name for log and error messages.
    pub fn program_name(&self) -> String {
        self.program
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| self.program.display().to_string())
    }

    /// The full command line, quoted for display. Used for audit only; it is
    /// never handed to a shell.
    pub fn command_line(&self) -> String {
        std::iter::once(self.program.to_string_lossy().to_string())
            .chain(self.args.iter().cloned())
            .map(|part| shell_quote(&part))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

fn shell_quote(s: &str) -> String {
    if s.is_empty() {
        "''".to_string()
    } else if s
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || "-_./:=+,".contains(c))
    {
        s.to_string()
    } else {
        format!("'{}'", s.replace('\'', "'\"'\"'"))
    }
}

/// Captured result of a finished process.
#[derive(Debug, Clone)]
pub struct ToolOutput {
    /// Exit code; `None` when the process was killed by a signal.
    pub exit_code: Option<i32>,
    /// Standard output captured.
    pub stdout: String,
    /// Standard error captured.
    pub stderr: String,
    /// Wall-clock duration.
    pub duration: Duration,
    /// Whether the command was only logged (dry run).
    pub dry_run: bool,
}

impl ToolOutput {
    /// Output of a command that was skipped in dry-run mode.
    pub fn skipped() -> Self {
        Self {
            exit_code: Some(0),
            stdout: String::new(),
            stderr: String::new(),
            duration: Duration::ZERO,
            dry_run: true,
        }
    }

    /// Checks if the process exited with status 0.
    pub fn is_success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// Why this output counts as a failure, if it does.
    ///
    /// A non-zero exit always fails. With `scan_stderr` the word "error"
    /// anywhere in stderr (case-insensitive) fails too, which can misreport
    /// tools that print the word in warnings.
    pub fn failure_reason(&self, scan_stderr: bool) -> Option<String> {
        if !self.is_success() {
            return Some(match self.exit_code {
                Some(code) => format!("exited with code {}", code),
                None => "terminated by signal".to_string(),
            });
        }
        if scan_stderr && self.stderr.to_lowercase().contains("error") {
            return Some("reported an error on stderr".to_string());
        }
        None
    }

    /// Last non-empty stderr line, for compact error messages.
    pub fn stderr_tail(&self) -> String {
        self.stderr
            .lines()
            .rev()
            .find(|l| !l.trim().is_empty())
            .unwrap_or_default()
            .trim()
            .to_string()
    }

    /// Converts a failed output into a [`ToolError`].
    pub fn into_error(self, program: String, reason: String) -> ToolError {
        let tail = self.stderr_tail();
        ToolError::Failed {
            program,
            exit_code: self.exit_code,
            detail: if tail.is_empty() {
                reason
            } else {
                format!("{}: {}", reason, tail)
            },
        }
    }
}

/// Trait for executing external commands.
#[async_trait]
pub trait ToolRunner: Send + Sync {
    /// Runs the command to completion and captures its output.
    ///
    /// Only failure to spawn is an error here; exit status is left to the caller.
    async fn run(&self, command: &ExternalCommand) -> Result<ToolOutput, ToolError>;

    /// Runs the command and fails on a non-zero exit status.
    async fn run_checked(&self, command: &ExternalCommand) -> Result<ToolOutput, ToolError> {
        let output = self.run(command).await?;
        match output.failure_reason(false) {
            Some(reason) => Err(output.into_error(command.program_name(), reason)),
            None => Ok(output),
        }
    }
}

/// Runs commands as local child processes.
#[derive(Debug, Clone, Default)]
pub struct ProcessRunner {
    dry_run: bool,
}

impl ProcessRunner {
    /// Creates a runner that spawns processes.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets whether commands are only logged.
    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }
}

#[async_trait]
impl ToolRunner for ProcessRunner {
    async fn run(&self, command: &ExternalCommand) -> Result<ToolOutput, ToolError> {
        info!("\n {}", command.command_line());
        if self.dry_run {
            info!("Dry run: not executing {}", command.program_name());
            return Ok(ToolOutput::skipped());
        }

        let mut cmd = Command::new(&command.program);
        cmd.args(&command.args);
        if let Some(dir) = &command.working_dir {
            cmd.current_dir(dir);
        }
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());

        let start = Instant::now();
        let output = cmd.output().await.map_err(|e| ToolError::Spawn {
            program: command.program.display().to_string(),
            message: e.to_string(),
        })?;
        let duration = start.elapsed();

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        let exit_code = output.status.code();

        debug!(
            "{} finished in {:?} with exit code {:?}",
            command.program_name(),
            duration,
            exit_code
        );
        if !stdout.trim().is_empty() {
            info!("\n {}", stdout.trim_end());
        }
        if !stderr.trim().is_empty() {
            if output.status.success() {
                info!("\n {}", stderr.trim_end());
            } else {
                warn!("\n {}", stderr.trim_end());
            }
        }

        Ok(ToolOutput {
            exit_code,
            stdout,
            stderr,
            duration,
            dry_run: false,
        })
    }
}
