//! Local process invocation used by steps.

use async_trait::async_trait;
use kumitate_core::{CancellationToken, InstallerError};
use std::fmt::Debug;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

/// Default timeout for short helper commands.
pub const DEFAULT_SHELL_TIMEOUT: Duration = Duration::from_secs(10);

/// A process invocation request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellInput {
    /// Program followed by its arguments.
    pub command: Vec<String>,
    pub timeout: Duration,
    /// Report a non-zero exit through [`ShellOutput::status`] instead of an
    /// error.
    pub skip_error: bool,
    /// Spawn detached and return immediately with the pid.
    pub run_in_background: bool,
}

impl ShellInput {
    pub fn new<I, S>(command: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            command: command.into_iter().map(Into::into).collect(),
            timeout: DEFAULT_SHELL_TIMEOUT,
            skip_error: false,
            run_in_background: false,
        }
    }

    /// Runs `script` through `bash -c`.
    pub fn bash(script: impl Into<String>) -> Self {
        Self::new(["bash".to_string(), "-c".to_string(), script.into()])
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn skip_error(mut self) -> Self {
        self.skip_error = true;
        self
    }

    pub fn in_background(mut self) -> Self {
        self.run_in_background = true;
        self
    }

    fn command_line(&self) -> String {
        self.command.join(" ")
    }
}

/// Result of a process invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShellOutput {
    pub stdout: String,
    pub stderr: String,
    /// Exit code. `None` for background processes or when killed by a
    /// signal.
    pub status: Option<i32>,
    pub pid: Option<u32>,
}

impl ShellOutput {
    pub fn success(&self) -> bool {
        self.status == Some(0)
    }
}

/// Runs local processes on behalf of steps.
#[async_trait]
pub trait ShellUtility: Send + Sync + Debug {
    /// Runs `input` to completion, or until its timeout elapses or `cancel`
    /// fires, whichever comes first.
    async fn run(
        &self,
        input: ShellInput,
        cancel: &CancellationToken,
    ) -> Result<ShellOutput, InstallerError>;
}

/// [`ShellUtility`] backed by `tokio::process`.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalShell;

#[async_trait]
impl ShellUtility for LocalShell {
    async fn run(
        &self,
        input: ShellInput,
        cancel: &CancellationToken,
    ) -> Result<ShellOutput, InstallerError> {
        let (program, args) = input
            .command
            .split_first()
            .ok_or_else(|| InstallerError::invalid_argument("empty shell command"))?;
        let shown = input.command_line();

        if cancel.is_cancelled() {
            return Err(InstallerError::cancelled(format!(
                "cancelled before running `{shown}`"
            )));
        }

        let mut command = Command::new(program);
        command.args(args);

        if input.run_in_background {
            let child = command
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .spawn()
                .map_err(|e| {
                    InstallerError::internal(format!("failed to start `{shown}`: {e}"))
                })?;
            debug!(pid = ?child.id(), "Started background command `{}`", shown);
            // Dropping the handle leaves the process running.
            return Ok(ShellOutput {
                pid: child.id(),
                ..ShellOutput::default()
            });
        }

        let child = command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| InstallerError::internal(format!("failed to start `{shown}`: {e}")))?;
        let pid = child.id();

        let output = tokio::select! {
            result = tokio::time::timeout(input.timeout, child.wait_with_output()) => match result {
                Ok(Ok(output)) => output,
                Ok(Err(e)) => {
                    return Err(InstallerError::internal(format!(
                        "failed to wait for `{shown}`: {e}"
                    )))
                }
                Err(_) => {
                    return Err(InstallerError::internal(format!(
                        "`{shown}` timed out after {:?}",
                        input.timeout
                    )))
                }
            },
            _ = cancel.cancelled() => {
                return Err(InstallerError::cancelled(format!("`{shown}` was cancelled")));
            }
        };

        let result = ShellOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            status: output.status.code(),
            pid,
        };

        if !output.status.success() && !input.skip_error {
            return Err(InstallerError::internal(format!(
                "`{shown}` exited with {}: {}",
                output.status,
                result.stderr.trim()
            )));
        }

        Ok(result)
    }
}

/// Quotes `arg` for a POSIX shell. Plain words are returned unchanged.
pub fn quote(arg: &str) -> String {
    let plain = !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "_./:@%+=,-".contains(c));
    if plain {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', r"'\''"))
    }
}

/// Returns `true` if `name` resolves to an executable on `PATH`.
pub async fn command_exists(
    shell: &dyn ShellUtility,
    name: &str,
    cancel: &CancellationToken,
) -> bool {
    let lookup = ShellInput::new(["sh", "-c", r#"command -v "$1""#, "sh", name]).skip_error();
    shell
        .run(lookup, cancel)
        .await
        .map(|output| output.success())
        .unwrap_or(false)
}

/// Stops the process with `pid`.
///
/// Returns `Ok(false)` when no such process exists, so stale handles from
/// an earlier run are harmless.
pub async fn stop_process(
    shell: &dyn ShellUtility,
    pid: &str,
    cancel: &CancellationToken,
) -> Result<bool, InstallerError> {
    let pid = pid.trim();
    if pid.is_empty() || !pid.chars().all(|c| c.is_ascii_digit()) {
        return Err(InstallerError::invalid_argument(format!(
            "invalid process id {pid:?}"
        )));
    }

    let listed = shell
        .run(ShellInput::new(["ps", "-p", pid]).skip_error(), cancel)
        .await?;
    if !listed.success() {
        debug!(pid, "Process already gone");
        return Ok(false);
    }

    shell
        .run(ShellInput::new(["sudo", "kill", pid]), cancel)
        .await?;
    Ok(true)
}
