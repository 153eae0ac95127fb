//! Adapter interfaces for external systems.
//!
//! Adapters give the orchestrator one interface per concern:
//! - `Executor`: runs an action's script locally or on the host over SSH
//! - `Probe`: liveness check against the application port
//! - `Notifier`: reports run outcomes

pub mod local;
pub mod notify;
pub mod probe;
pub mod ssh;

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use thiserror::Error;

use crate::core::actions::Action;

pub use local::LocalExecutor;
pub use notify::{LogNotifier, Notification, Notifier, Topic, WebhookNotifier};
pub use probe::{HttpProbe, Probe, ProbeOutcome};
pub use ssh::SshExecutor;

/// Output of a finished script
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    /// Exit code (-1 if killed by a signal)
    pub exit_code: i32,

    pub stdout: String,

    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// stdout and stderr joined, for logs
    pub fn combined(&self) -> String {
        match (self.stdout.trim().is_empty(), self.stderr.trim().is_empty()) {
            (_, true) => self.stdout.clone(),
            (true, false) => self.stderr.clone(),
            (false, false) => format!("{}\n{}", self.stdout.trim_end(), self.stderr),
        }
    }

    /// Last non-empty line of stderr (or stdout), for one-line summaries
    pub fn last_line(&self) -> &str {
        [&self.stderr, &self.stdout]
            .into_iter()
            .find_map(|s| s.lines().rev().map(str::trim).find(|l| !l.is_empty()))
            .unwrap_or("")
    }
}

/// Failures that prevent an action from producing an exit status
#[derive(Debug, Error)]
pub enum ExecError {
    #[error("Failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{label} timed out after {}s", .timeout.as_secs())]
    Timeout { label: String, timeout: Duration },

    #[error("Connection to {host} failed: {detail}")]
    Connection { host: String, detail: String },

    #[error("I/O error while running {label}: {source}")]
    Io {
        label: String,
        #[source]
        source: std::io::Error,
    },
}

/// Trait for script executors
#[async_trait]
pub trait Executor: Send + Sync {
    /// Human-readable executor name
    fn name(&self) -> &str;

    /// Run an action to completion, or until `timeout`
    async fn run(&self, action: &Action, timeout: Duration) -> Result<CommandOutput, ExecError>;

    /// Cheap reachability check
    async fn health_check(&self) -> Result<()>;
}
