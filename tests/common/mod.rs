//! Shared fakes for orchestrator tests.
//!
//! `FakeHost` interprets typed actions against an in-memory host: a
//! checkout, an environment file and a table of processes bound to the
//! application port. `FakeProbe` reports healthy while a process is bound.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use egsa_deploy::adapters::{
    CommandOutput, ExecError, Executor, Notification, Notifier, Probe, ProbeOutcome,
};
use egsa_deploy::core::{Action, Orchestrator, Pipeline};

pub const SECRET: &str = "s3cr3t-django-key-value";
pub const DB_PASSWORD: &str = "hunter2-db-password";

/// A process bound to the application port
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveProcess {
    pub pid: u32,
    pub commit: String,
}

#[derive(Debug, Default)]
pub struct HostState {
    pub live: Vec<LiveProcess>,
    pub checkout: Option<String>,
    pub env_file: Option<String>,
    /// Labels of every action run on the host, in order
    pub actions: Vec<String>,
    next_pid: u32,
}

impl HostState {
    /// Host already running an old release
    pub fn running(commit: &str) -> Self {
        Self {
            live: vec![LiveProcess {
                pid: 100,
                commit: commit.to_string(),
            }],
            checkout: Some(commit.to_string()),
            next_pid: 100,
            ..Default::default()
        }
    }
}

pub type SharedHost = Arc<Mutex<HostState>>;

pub fn shared(state: HostState) -> SharedHost {
    Arc::new(Mutex::new(state))
}

/// In-memory remote host
pub struct FakeHost {
    state: SharedHost,
    fail_on: Option<(&'static str, String)>,
    reachable: bool,
    delay: Option<Duration>,
}

impl FakeHost {
    pub fn new(state: SharedHost) -> Self {
        Self {
            state,
            fail_on: None,
            reachable: true,
            delay: None,
        }
    }

    /// Make the action with this label exit 1 with `stderr`
    pub fn failing(mut self, label: &'static str, stderr: impl Into<String>) -> Self {
        self.fail_on = Some((label, stderr.into()));
        self
    }

    pub fn unreachable(mut self) -> Self {
        self.reachable = false;
        self
    }

    /// Every action takes this long
    pub fn slow(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    fn ok(stdout: impl Into<String>) -> CommandOutput {
        CommandOutput {
            exit_code: 0,
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    fn apply(&self, action: &Action) -> CommandOutput {
        let mut host = self.state.lock().unwrap();
        host.actions.push(action.label().to_string());

        if let Some((label, stderr)) = &self.fail_on {
            if *label == action.label() {
                return CommandOutput {
                    exit_code: 1,
                    stdout: String::new(),
                    stderr: stderr.clone(),
                };
            }
        }

        match action {
            Action::StopProcess { port, .. } => {
                host.live.clear();
                Self::ok(format!("port {} is free\n", port))
            }
            Action::Checkout { commit, .. } => {
                host.checkout = Some(commit.clone());
                Self::ok(format!("checked out {}\n", commit))
            }
            Action::WriteEnvironment { contents, .. } => {
                host.env_file = Some(contents.clone());
                Self::ok(format!("wrote {} keys\n", contents.lines().count()))
            }
            Action::StartProcess { .. } => {
                let Some(commit) = host.checkout.clone() else {
                    return CommandOutput {
                        exit_code: 1,
                        stdout: String::new(),
                        stderr: "no checkout".to_string(),
                    };
                };
                host.next_pid += 1;
                let pid = host.next_pid;
                host.live.push(LiveProcess { pid, commit });
                Self::ok(format!("pid={}\n", pid))
            }
            _ => Self::ok("ok\n"),
        }
    }
}

#[async_trait]
impl Executor for FakeHost {
    fn name(&self) -> &str {
        "fake-host"
    }

    async fn run(&self, action: &Action, timeout: Duration) -> Result<CommandOutput, ExecError> {
        if !self.reachable {
            return Err(ExecError::Connection {
                host: "10.0.0.5".to_string(),
                detail: "ssh: connect to host 10.0.0.5 port 22: Connection timed out".to_string(),
            });
        }
        if let Some(delay) = self.delay {
            if tokio::time::timeout(timeout, tokio::time::sleep(delay))
                .await
                .is_err()
            {
                return Err(ExecError::Timeout {
                    label: action.label().to_string(),
                    timeout,
                });
            }
        }
        Ok(self.apply(action))
    }

    async fn health_check(&self) -> Result<()> {
        if !self.reachable {
            anyhow::bail!("unreachable");
        }
        Ok(())
    }
}

/// Local test runner with a fixed verdict
pub struct FakeTests {
    pub passing: bool,
    pub runs: Arc<Mutex<u32>>,
}

impl FakeTests {
    pub fn passing() -> Self {
        Self {
            passing: true,
            runs: Arc::new(Mutex::new(0)),
        }
    }

    pub fn failing() -> Self {
        Self {
            passing: false,
            runs: Arc::new(Mutex::new(0)),
        }
    }
}

#[async_trait]
impl Executor for FakeTests {
    fn name(&self) -> &str {
        "fake-tests"
    }

    async fn run(&self, _action: &Action, _timeout: Duration) -> Result<CommandOutput, ExecError> {
        *self.runs.lock().unwrap() += 1;
        Ok(if self.passing {
            CommandOutput {
                exit_code: 0,
                stdout: "Ran 42 tests in 1.337s\n\nOK\n".to_string(),
                stderr: String::new(),
            }
        } else {
            CommandOutput {
                exit_code: 1,
                stdout: String::new(),
                stderr: "Ran 42 tests in 1.337s\n\nFAILED (failures=1)\n".to_string(),
            }
        })
    }

    async fn health_check(&self) -> Result<()> {
        Ok(())
    }
}

/// Healthy while a process is bound on the fake host
pub struct FakeProbe {
    state: SharedHost,
    force_status: Option<u16>,
}

impl FakeProbe {
    pub fn new(state: SharedHost) -> Self {
        Self {
            state,
            force_status: None,
        }
    }

    /// Always answer with this status while a process is bound
    pub fn answering(mut self, status: u16) -> Self {
        self.force_status = Some(status);
        self
    }
}

#[async_trait]
impl Probe for FakeProbe {
    async fn check(&self, _url: &str) -> ProbeOutcome {
        let bound = !self.state.lock().unwrap().live.is_empty();
        match (bound, self.force_status) {
            (false, _) => ProbeOutcome::Unreachable {
                error: "connection refused".to_string(),
            },
            (true, Some(status)) if status >= 400 => ProbeOutcome::Unhealthy { status },
            (true, Some(status)) => ProbeOutcome::Healthy { status },
            (true, None) => ProbeOutcome::Healthy { status: 200 },
        }
    }
}

/// Keeps every notification it receives
#[derive(Default)]
pub struct RecordingNotifier {
    pub sent: Arc<Mutex<Vec<Notification>>>,
    pub fail: bool,
}

#[async_trait]
impl Notifier for RecordingNotifier {
    fn name(&self) -> &str {
        "recording"
    }

    async fn notify(&self, notification: &Notification) -> Result<()> {
        if self.fail {
            anyhow::bail!("SNS publish failed: AccessDenied");
        }
        self.sent.lock().unwrap().push(notification.clone());
        Ok(())
    }
}

pub const PIPELINE_YAML: &str = r#"
name: egsa
description: EGSA utility tracker on EC2
branch: main

target:
  host: 10.0.0.5
  user: ubuntu
  identity_file: ~/.ssh/egsa.pem

app:
  repo_url: https://github.com/example/egsa.git
  app_dir: /home/ubuntu/egsa
  port: 8000
  process_pattern: gunicorn

commands:
  post_migrate:
    - python3 manage.py shell -c "import setup_data"

environment:
  values:
    SECRET_KEY: s3cr3t-django-key-value
    DB_HOST: egsa.cluster.eu-north-1.rds.amazonaws.com
    DB_USER: egsa
    DB_PASSWORD: hunter2-db-password
    DB_NAME: egsa
    AWS_DEFAULT_REGION: eu-north-1

probe:
  policy:
    max_attempts: 3
    initial_delay_ms: 1
    max_delay_ms: 5

notify:
  critical_topic: arn:aws:sns:eu-north-1:123456789012:egsa-critical
  general_topic: arn:aws:sns:eu-north-1:123456789012:egsa-general
"#;

pub fn pipeline() -> Pipeline {
    let pipeline = Pipeline::from_yaml(PIPELINE_YAML).unwrap();
    pipeline.validate().unwrap();
    pipeline
}

/// Orchestrator over fakes, ignoring the test process environment
pub fn orchestrator(
    tests: FakeTests,
    host: FakeHost,
    probe: FakeProbe,
    runs_dir: &std::path::Path,
) -> Orchestrator {
    Orchestrator::new(Arc::new(tests), Arc::new(host), Arc::new(probe), runs_dir)
        .with_env_lookup(|_| None)
}
