//! Deployment pipeline definitions and loading.
//!
//! A pipeline is defined in YAML and describes one target host, one
//! application checkout, the commands each phase runs, and the limits the
//! run is held to. The phase order itself is fixed and not configurable.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::domain::environment::{self, EnvironmentError, EnvironmentSnapshot};

use super::safety::SafetyLimits;

/// A complete deployment pipeline definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pipeline {
    /// Pipeline name (used in CLI)
    pub name: String,

    /// Human-readable description
    #[serde(default)]
    pub description: String,

    /// Only commits on this branch are deployed
    #[serde(default = "default_branch")]
    pub branch: String,

    /// Host the application runs on
    pub target: TargetConfig,

    /// Checkout and process layout on the host
    pub app: AppConfig,

    /// Commands run by each phase
    #[serde(default)]
    pub commands: CommandsConfig,

    /// Environment file materialized before each start
    #[serde(default)]
    pub environment: EnvironmentSpec,

    /// Liveness probe used by Verification
    #[serde(default)]
    pub probe: ProbeSpec,

    /// Safety limits for this pipeline
    #[serde(default)]
    pub safety_limits: SafetyLimits,

    /// Where run outcomes are reported
    #[serde(default)]
    pub notify: Option<NotifySpec>,
}

fn default_branch() -> String {
    "main".to_string()
}

impl Pipeline {
    /// Load a pipeline from a YAML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read pipeline file: {}", path.display()))?;

        Self::from_yaml(&content)
    }

    /// Parse a pipeline from YAML content
    pub fn from_yaml(content: &str) -> Result<Self> {
        serde_yaml::from_str(content).context("Failed to parse pipeline YAML")
    }

    /// Validate the pipeline definition
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            anyhow::bail!("Pipeline name cannot be empty");
        }

        if self.branch.trim().is_empty() {
            anyhow::bail!("Pipeline '{}' has no tracked branch", self.name);
        }

        if self.target.host.trim().is_empty() {
            anyhow::bail!("Pipeline '{}' has no target host", self.name);
        }

        if self.app.repo_url.trim().is_empty() {
            anyhow::bail!("Pipeline '{}' has no repository URL", self.name);
        }

        let app_dir = self.app.app_dir.trim_end_matches('/');
        if !self.app.app_dir.starts_with('/') || app_dir.is_empty() {
            anyhow::bail!(
                "app_dir must be an absolute path below the root, got '{}'",
                self.app.app_dir
            );
        }

        if self.app.port == 0 {
            anyhow::bail!("Application port cannot be 0");
        }

        // The checkout is deleted on every run; anything that must survive
        // it cannot live inside it.
        for (label, path) in [
            ("pid_file", &self.app.pid_file),
            ("app_log", &self.app.app_log),
            ("deploy_log", &self.app.deploy_log),
        ] {
            if path.trim().is_empty() {
                anyhow::bail!("{} cannot be empty", label);
            }
            if path == app_dir || path.starts_with(&format!("{}/", app_dir)) {
                anyhow::bail!(
                    "{} '{}' is inside app_dir and would be removed by the re-clone",
                    label,
                    path
                );
            }
        }

        for (label, command) in [
            ("test", &self.commands.test),
            ("install", &self.commands.install),
            ("migrate", &self.commands.migrate),
            ("start", &self.commands.start),
        ] {
            if command.trim().is_empty() {
                anyhow::bail!("Command '{}' cannot be empty", label);
            }
        }

        if !self.probe.path.starts_with('/') {
            anyhow::bail!("Probe path must start with '/', got '{}'", self.probe.path);
        }

        if self.probe.policy.max_attempts == 0 {
            anyhow::bail!("Probe policy needs at least one attempt");
        }

        for pattern in &self.safety_limits.secret_patterns {
            glob::Pattern::new(pattern)
                .with_context(|| format!("Invalid secret pattern: {}", pattern))?;
        }

        Ok(())
    }

    /// Start command with `{port}` substituted
    pub fn start_command(&self) -> String {
        self.commands
            .start
            .replace("{port}", &self.app.port.to_string())
    }

    /// Path of the environment file on the host
    pub fn env_file(&self) -> String {
        self.environment
            .path
            .clone()
            .unwrap_or_else(|| format!("{}/.env", self.app.app_dir.trim_end_matches('/')))
    }

    /// URL the liveness probe requests
    pub fn probe_url(&self) -> String {
        let host = self.probe.host.as_deref().unwrap_or(&self.target.host);
        format!("http://{}:{}{}", host, self.app.port, self.probe.path)
    }

    /// Resolve the environment snapshot from the process environment
    pub fn resolve_environment(&self) -> Result<EnvironmentSnapshot, EnvironmentError> {
        self.environment
            .resolve(&self.target.host, |key| std::env::var(key).ok())
    }
}

/// SSH target
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetConfig {
    /// Static address of the host
    pub host: String,

    /// Login user
    #[serde(default = "default_user")]
    pub user: String,

    #[serde(default = "default_ssh_port")]
    pub ssh_port: u16,

    /// Private key used for authentication
    #[serde(default)]
    pub identity_file: Option<String>,

    /// Extra arguments passed to ssh verbatim
    #[serde(default)]
    pub ssh_args: Vec<String>,

    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_seconds: u64,
}

fn default_user() -> String {
    "ubuntu".to_string()
}
fn default_ssh_port() -> u16 {
    22
}
fn default_connect_timeout() -> u64 {
    10
}

/// Application layout on the host
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Repository cloned on every run
    pub repo_url: String,

    /// Absolute checkout directory, deleted and re-cloned each run
    pub app_dir: String,

    /// Port the process binds (traffic and probe)
    #[serde(default = "default_port")]
    pub port: u16,

    /// Pid file of the live process (relative paths are under $HOME)
    #[serde(default = "default_pid_file")]
    pub pid_file: String,

    /// Application stdout/stderr log
    #[serde(default = "default_app_log")]
    pub app_log: String,

    /// Deployment log appended by every remote phase
    #[serde(default = "default_deploy_log")]
    pub deploy_log: String,

    /// Process command-line pattern also killed on stop (e.g. "gunicorn")
    #[serde(default)]
    pub process_pattern: Option<String>,

    /// Seconds to wait for the port to free up before SIGKILL
    #[serde(default = "default_stop_grace")]
    pub stop_grace_seconds: u64,
}

fn default_port() -> u16 {
    8000
}
fn default_pid_file() -> String {
    "egsa.pid".to_string()
}
fn default_app_log() -> String {
    "app.log".to_string()
}
fn default_deploy_log() -> String {
    "deploy.log".to_string()
}
fn default_stop_grace() -> u64 {
    10
}

/// Commands executed by the phases
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandsConfig {
    /// Test Gate command, run locally
    #[serde(default = "default_test_command")]
    pub test: String,

    /// Local working directory for the test command
    #[serde(default = "default_test_workdir")]
    pub test_workdir: String,

    /// Dependency installation, run in the fresh checkout
    #[serde(default = "default_install_command")]
    pub install: String,

    #[serde(default = "default_migrate_command")]
    pub migrate: String,

    /// Static asset collection (empty to skip)
    #[serde(default = "default_collect_static_command")]
    pub collect_static: String,

    /// Management commands run after migrations (seed data, admin fixes)
    #[serde(default)]
    pub post_migrate: Vec<String>,

    /// Long-running process; `{port}` is replaced with `app.port`
    #[serde(default = "default_start_command")]
    pub start: String,
}

fn default_test_command() -> String {
    "python3 manage.py test".to_string()
}
fn default_test_workdir() -> String {
    ".".to_string()
}
fn default_install_command() -> String {
    "python3 -m pip install --user -r requirements.txt".to_string()
}
fn default_migrate_command() -> String {
    "python3 manage.py migrate --noinput".to_string()
}
fn default_collect_static_command() -> String {
    "python3 manage.py collectstatic --noinput".to_string()
}
fn default_start_command() -> String {
    "gunicorn --bind 0.0.0.0:{port} myproject.wsgi:application".to_string()
}

impl Default for CommandsConfig {
    fn default() -> Self {
        Self {
            test: default_test_command(),
            test_workdir: default_test_workdir(),
            install: default_install_command(),
            migrate: default_migrate_command(),
            collect_static: default_collect_static_command(),
            post_migrate: Vec::new(),
            start: default_start_command(),
        }
    }
}

/// Source of one environment value
///
/// Supports two YAML formats:
/// - Literal: `DEBUG: "False"`
/// - Indirect: `SECRET_KEY: { env: DJANGO_SECRET_KEY }`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum EnvValue {
    Literal(String),
    FromEnv { env: String },
}

/// How the environment file is assembled
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EnvironmentSpec {
    /// File path on the host (default: `<app_dir>/.env`)
    #[serde(default)]
    pub path: Option<String>,

    /// Explicit values; recognized keys not listed here are read from the
    /// same-named variable of the orchestrator's environment
    #[serde(default)]
    pub values: BTreeMap<String, EnvValue>,

    /// Keys that must be present (default: secret key and DB credentials)
    #[serde(default)]
    pub required: Option<Vec<String>>,
}

impl EnvironmentSpec {
    pub fn required_keys(&self) -> Vec<String> {
        self.required.clone().unwrap_or_else(|| {
            environment::DEFAULT_REQUIRED_KEYS
                .iter()
                .map(|k| k.to_string())
                .collect()
        })
    }

    /// Build and validate a snapshot, reading out-of-band values via `lookup`
    pub fn resolve<F>(&self, host: &str, lookup: F) -> Result<EnvironmentSnapshot, EnvironmentError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut snapshot = EnvironmentSnapshot::new();

        for key in environment::RECOGNIZED_KEYS {
            if !self.values.contains_key(key) {
                if let Some(value) = lookup(key) {
                    snapshot.insert(key, value);
                }
            }
        }

        for (key, source) in &self.values {
            let value = match source {
                EnvValue::Literal(value) => Some(value.clone()),
                EnvValue::FromEnv { env } => lookup(env),
            };
            if let Some(value) = value {
                snapshot.insert(key.clone(), value);
            }
        }

        if !snapshot.contains(environment::DEBUG) {
            snapshot.insert(environment::DEBUG, "False");
        }
        if !snapshot.contains(environment::ALLOWED_HOSTS) {
            snapshot.insert(environment::ALLOWED_HOSTS, host);
        }

        snapshot.validate(&self.required_keys())?;
        Ok(snapshot)
    }
}

/// Liveness probe settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeSpec {
    /// Host to probe (default: the target host)
    #[serde(default)]
    pub host: Option<String>,

    #[serde(default = "default_probe_path")]
    pub path: String,

    #[serde(default = "default_request_timeout")]
    pub request_timeout_seconds: u64,

    /// How long to keep polling while the process starts
    #[serde(default)]
    pub policy: ProbePolicy,
}

fn default_probe_path() -> String {
    "/".to_string()
}
fn default_request_timeout() -> u64 {
    5
}

impl Default for ProbeSpec {
    fn default() -> Self {
        Self {
            host: None,
            path: default_probe_path(),
            request_timeout_seconds: default_request_timeout(),
            policy: ProbePolicy::default(),
        }
    }
}

impl ProbeSpec {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_seconds)
    }
}

/// Polling schedule for the liveness probe
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbePolicy {
    /// Maximum number of probe requests (including the first)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Delay before the first request, and initial delay between requests
    #[serde(default = "default_initial_delay")]
    pub initial_delay_ms: u64,

    /// Maximum delay between requests in milliseconds
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,

    /// Backoff multiplier (delay *= multiplier after each request)
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
}

fn default_max_attempts() -> u32 {
    10
}
fn default_initial_delay() -> u64 {
    1000
}
fn default_max_delay() -> u64 {
    10000
}
fn default_backoff_multiplier() -> f64 {
    2.0
}

impl Default for ProbePolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay(),
            max_delay_ms: default_max_delay(),
            backoff_multiplier: default_backoff_multiplier(),
        }
    }
}

impl ProbePolicy {
    /// Calculate delay before a specific attempt (1-indexed)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::from_millis(self.initial_delay_ms);
        }

        let delay = self.initial_delay_ms as f64
            * self.backoff_multiplier.powi((attempt - 1) as i32);

        let capped = delay.min(self.max_delay_ms as f64) as u64;
        Duration::from_millis(capped)
    }

    /// Check if another request is allowed after `attempt`
    pub fn should_poll_again(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

/// Outcome reporting
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NotifySpec {
    /// JSON webhook receiving every outcome
    #[serde(default)]
    pub webhook_url: Option<String>,

    /// Topic for failed runs
    #[serde(default)]
    pub critical_topic: Option<String>,

    /// Topic for successful runs
    #[serde(default)]
    pub general_topic: Option<String>,

    /// Address copied on every report
    #[serde(default)]
    pub email: Option<String>,
}
