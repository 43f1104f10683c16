//! Typed wrappers around the external toolchain.
//!
//! All shell-outs go through [`run_tool`], which captures output and
//! enforces an optional hard timeout. Parsing of tool output lives in
//! pure functions over the captured text so tests can inject fake
//! captures without spawning anything.

/// `hdiutil` mount/detach wrappers.
pub mod dmg;
/// AppleDB Git repository management.
pub mod git;
/// `ipsw` invocations and output contracts.
pub mod ipsw;
/// `symsorter` invocation.
pub mod symsorter;

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use thiserror::Error;

/// Errors raised by subprocess invocations.
#[derive(Error, Debug)]
pub enum ToolError {
    /// A required tool is missing from the host.
    #[error("required tool '{0}' is not installed")]
    NotInstalled(String),

    /// The process could not be started.
    #[error("failed to spawn '{tool}': {source}")]
    Spawn {
        /// The tool we tried to start.
        tool: String,
        /// The OS-level failure.
        #[source]
        source: std::io::Error,
    },

    /// The process ran into its hard deadline.
    #[error("'{tool}' did not finish within {}s and was killed", timeout.as_secs())]
    Timeout {
        /// The tool that was killed.
        tool: String,
        /// The deadline it blew through.
        timeout: Duration,
    },

    /// The process exited non-zero where success was required.
    #[error("'{tool}' failed with status {status}: {stderr}")]
    Failed {
        /// The failing tool.
        tool: String,
        /// Its exit status.
        status: i32,
        /// Its captured stderr.
        stderr: String,
    },

    /// Captured output did not match the tool's documented contract.
    #[error("could not parse '{tool}' output: {message}")]
    Parse {
        /// The tool whose output we read.
        tool: String,
        /// What went wrong.
        message: String,
    },

    /// IO trouble while talking to the process.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Captured result of a finished subprocess.
#[derive(Debug, Clone)]
pub struct ToolOutput {
    /// Exit code; `None` when the process died to a signal.
    pub code: Option<i32>,
    /// Captured stdout, lossily decoded.
    pub stdout: String,
    /// Captured stderr, lossily decoded.
    pub stderr: String,
}

impl ToolOutput {
    /// Whether the process exited zero.
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// Promote a non-zero exit into [`ToolError::Failed`].
    pub fn require_success(self, tool: &str) -> Result<ToolOutput, ToolError> {
        if self.success() {
            Ok(self)
        } else {
            Err(ToolError::Failed {
                tool: tool.to_string(),
                status: self.code.unwrap_or(-1),
                stderr: self.stderr,
            })
        }
    }
}

/// Run a tool to completion with captured output.
///
/// A non-zero exit is not an error here -- several `ipsw` subcommands use
/// exit codes to report conditions the callers classify themselves. With
/// a `timeout`, the process is killed when the deadline passes and
/// [`ToolError::Timeout`] is returned.
pub async fn run_tool<I, S>(
    program: &str,
    args: I,
    cwd: Option<&Path>,
    timeout: Option<Duration>,
) -> Result<ToolOutput, ToolError>
where
    I: IntoIterator<Item = S>,
    S: AsRef<std::ffi::OsStr>,
{
    let mut command = tokio::process::Command::new(program);
    command
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        // Reaps the child if the future is dropped on timeout.
        .kill_on_drop(true);
    if let Some(dir) = cwd {
        command.current_dir(dir);
    }

    let child = command.spawn().map_err(|source| ToolError::Spawn {
        tool: program.to_string(),
        source,
    })?;

    let wait = child.wait_with_output();
    let output = match timeout {
        Some(limit) => match tokio::time::timeout(limit, wait).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(ToolError::Timeout {
                    tool: program.to_string(),
                    timeout: limit,
                })
            }
        },
        None => wait.await?,
    };

    Ok(ToolOutput {
        code: output.status.code(),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}

/// Verify the external toolchain is present before a mirror/extract run.
///
/// Missing tools are a whole-worker failure: there is no point pulling
/// multi-gigabyte artifacts we cannot process.
pub async fn validate_shell_deps() -> Result<(), ToolError> {
    let version = ipsw::ipsw_version().await?;
    tracing::info!(%version, "using ipsw");

    which::which("symsorter").map_err(|_| ToolError::NotInstalled("symsorter".to_string()))?;
    let output = run_tool("symsorter", ["--version"], None, None).await?;
    if output.success() {
        tracing::info!(version = %output.stdout.trim(), "using symsorter");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn captures_stdout_and_exit_code() {
        let output = run_tool("sh", ["-c", "echo hi; exit 3"], None, None)
            .await
            .unwrap();
        assert_eq!(output.code, Some(3));
        assert_eq!(output.stdout.trim(), "hi");
        assert!(!output.success());
    }

    #[tokio::test]
    async fn timeout_kills_the_process() {
        let err = run_tool(
            "sh",
            ["-c", "sleep 30"],
            None,
            Some(Duration::from_millis(100)),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, ToolError::Timeout { .. }));
    }

    #[tokio::test]
    async fn missing_binary_is_a_spawn_error() {
        let err = run_tool("definitely-not-a-real-tool", [""; 0], None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::Spawn { .. }));
    }

    #[test]
    fn require_success_surfaces_stderr() {
        let output = ToolOutput {
            code: Some(1),
            stdout: String::new(),
            stderr: "boom".to_string(),
        };
        let err = output.require_success("ipsw").unwrap_err();
        assert!(matches!(err, ToolError::Failed { status: 1, .. }));
    }
}
