//! Local executor, used by the Test Gate.
//!
//! Scripts are piped to `sh -s` on stdin and output is collected once the
//! child exits. The SSH executor reuses the same subprocess plumbing.

use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::debug;

use crate::core::actions::Action;

use super::{CommandOutput, Executor, ExecError};

/// Executor running scripts on this machine
pub struct LocalExecutor {
    /// Shell used to run scripts (default: "sh")
    shell: String,
}

impl Default for LocalExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalExecutor {
    pub fn new() -> Self {
        Self {
            shell: "sh".to_string(),
        }
    }

    /// Use a different shell binary
    pub fn with_shell(shell: impl Into<String>) -> Self {
        Self {
            shell: shell.into(),
        }
    }
}

#[async_trait]
impl Executor for LocalExecutor {
    fn name(&self) -> &str {
        "local"
    }

    async fn run(&self, action: &Action, step_timeout: Duration) -> Result<CommandOutput, ExecError> {
        let mut cmd = Command::new(&self.shell);
        cmd.arg("-s");
        run_script(cmd, &self.shell, action.label(), &action.script(), step_timeout).await
    }

    async fn health_check(&self) -> Result<()> {
        let output = Command::new(&self.shell)
            .args(["-c", "true"])
            .output()
            .await
            .with_context(|| format!("Failed to run {}", self.shell))?;

        if !output.status.success() {
            anyhow::bail!("{} health check failed", self.shell);
        }

        Ok(())
    }
}

/// Spawn `cmd`, feed `script` on stdin, and wait up to `step_timeout`.
///
/// The child is killed if the timeout fires.
pub(crate) async fn run_script(
    mut cmd: Command,
    program: &str,
    label: &str,
    script: &str,
    step_timeout: Duration,
) -> Result<CommandOutput, ExecError> {
    debug!(program, label, "Spawning script");

    let mut child = cmd
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|source| ExecError::Spawn {
            program: program.to_string(),
            source,
        })?;

    if let Some(mut stdin) = child.stdin.take() {
        stdin
            .write_all(script.as_bytes())
            .await
            .map_err(|source| ExecError::Io {
                label: label.to_string(),
                source,
            })?;
        // Drop stdin to signal EOF
    }

    let output = timeout(step_timeout, child.wait_with_output())
        .await
        .map_err(|_| ExecError::Timeout {
            label: label.to_string(),
            timeout: step_timeout,
        })?
        .map_err(|source| ExecError::Io {
            label: label.to_string(),
            source,
        })?;

    Ok(CommandOutput {
        exit_code: output.status.code().unwrap_or(-1),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}
