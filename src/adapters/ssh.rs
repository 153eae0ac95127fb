//! Remote executor over the OpenSSH client.
//!
//! Every action is sent as a script on stdin to `bash -s` on the host, so
//! secrets never show up in a process listing. Each script appends its
//! output to the deployment log on the host before returning it.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::process::Command;
use tracing::warn;

use crate::core::actions::{host_path, Action};
use crate::core::pipeline::TargetConfig;

use super::local::run_script;
use super::{CommandOutput, Executor, ExecError};

/// ssh exits with 255 when the connection itself failed, but a remote
/// command may exit 255 too
const SSH_CONNECTION_FAILED: i32 = 255;
const HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(30);

/// Executor running scripts on one fixed host
pub struct SshExecutor {
    host: String,
    user: String,
    port: u16,
    identity_file: Option<String>,
    ssh_args: Vec<String>,
    connect_timeout_seconds: u64,
    deploy_log: Option<String>,
    binary_path: String,
}

impl SshExecutor {
    /// Executor for a pipeline target
    pub fn from_target(target: &TargetConfig) -> Self {
        Self {
            host: target.host.clone(),
            user: target.user.clone(),
            port: target.ssh_port,
            identity_file: target.identity_file.as_deref().map(expand_home),
            ssh_args: target.ssh_args.clone(),
            connect_timeout_seconds: target.connect_timeout_seconds,
            deploy_log: None,
            binary_path: "ssh".to_string(),
        }
    }

    /// Append every script's output to this log on the host
    pub fn with_deploy_log(mut self, path: impl Into<String>) -> Self {
        self.deploy_log = Some(path.into());
        self
    }

    /// Use a custom ssh binary
    pub fn with_binary_path(mut self, binary_path: impl Into<String>) -> Self {
        self.binary_path = binary_path.into();
        self
    }

    /// `user@host`
    pub fn destination(&self) -> String {
        format!("{}@{}", self.user, self.host)
    }

    /// ssh arguments up to (and including) the destination
    pub fn base_args(&self) -> Vec<String> {
        let mut args = vec![
            "-p".to_string(),
            self.port.to_string(),
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            "StrictHostKeyChecking=accept-new".to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={}", self.connect_timeout_seconds),
            "-o".to_string(),
            "ServerAliveInterval=30".to_string(),
            "-o".to_string(),
            "ServerAliveCountMax=3".to_string(),
        ];
        if let Some(identity) = &self.identity_file {
            args.push("-i".to_string());
            args.push(identity.clone());
            args.push("-o".to_string());
            args.push("IdentitiesOnly=yes".to_string());
        }
        args.extend(self.ssh_args.iter().cloned());
        args.push(self.destination());
        args
    }

    /// Prefix the action script with strict mode and deployment logging
    pub fn wrap_script(&self, action: &Action) -> String {
        let mut s = String::from("set -eu\n");
        if let Some(log) = &self.deploy_log {
            let log = host_path(log);
            s.push_str(&format!("deploy_log={}\n", log));
            s.push_str("mkdir -p \"$(dirname \"$deploy_log\")\"\n");
            s.push_str("exec > >(tee -a \"$deploy_log\") 2>&1\n");
        }
        s.push_str(&format!(
            "echo \"[egsa-deploy] $(date -u +%Y-%m-%dT%H:%M:%SZ) {}\"\n",
            action.label()
        ));
        s.push_str(&action.script());
        s
    }

    fn connection_error(&self, output: &CommandOutput) -> ExecError {
        ExecError::Connection {
            host: self.host.clone(),
            detail: output.last_line().to_string(),
        }
    }
}

#[async_trait]
impl Executor for SshExecutor {
    fn name(&self) -> &str {
        "ssh"
    }

    async fn run(&self, action: &Action, step_timeout: Duration) -> Result<CommandOutput, ExecError> {
        let mut cmd = Command::new(&self.binary_path);
        cmd.args(self.base_args()).args(["bash", "-s"]);

        let output = run_script(
            cmd,
            &self.binary_path,
            action.label(),
            &self.wrap_script(action),
            step_timeout,
        )
        .await?;

        // Every wrapped script echoes its banner first, so a session that
        // reached the host always has stdout
        if output.exit_code == SSH_CONNECTION_FAILED && output.stdout.trim().is_empty() {
            warn!(host = %self.host, action = action.label(), "SSH connection failed");
            return Err(self.connection_error(&output));
        }

        Ok(output)
    }

    async fn health_check(&self) -> Result<()> {
        let mut cmd = Command::new(&self.binary_path);
        cmd.args(self.base_args()).arg("true");

        let output = tokio::time::timeout(HEALTH_CHECK_TIMEOUT, cmd.output())
            .await
            .with_context(|| format!("SSH health check to {} timed out", self.host))?
            .with_context(|| format!("Failed to run {}", self.binary_path))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!(
                "Cannot reach {} over SSH: {}",
                self.destination(),
                stderr.trim()
            );
        }

        Ok(())
    }
}

/// Expand a leading `~/` against the local home directory
fn expand_home(path: &str) -> String {
    match (path.strip_prefix("~/"), dirs::home_dir()) {
        (Some(rest), Some(home)) => home.join(rest).display().to_string(),
        _ => path.to_string(),
    }
}
