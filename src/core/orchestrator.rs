//! Main orchestrator for deployment runs.
//!
//! Drives the run state machine one phase at a time, logs every transition
//! to the event store, enforces safety limits and reports the outcome.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::adapters::probe::poll;
use crate::adapters::{
    ExecError, Executor, HttpProbe, LocalExecutor, LogNotifier, Notification, Notifier, Probe,
    SshExecutor, WebhookNotifier,
};
use crate::domain::{
    DeploymentRun, EnvironmentSnapshot, Event, EventType, FailureKind, Phase, PhaseFailure,
    PhaseStatus, ProcessHandle, RunState, Trigger,
};

use super::actions::{phase_actions, Action};
use super::event_store::{generate_idempotency_key, EventStore};
use super::lock::DeployLock;
use super::pipeline::Pipeline;
use super::safety::{Redactor, SafetyTracker, SafetyViolation};

/// Reads out-of-band environment values by name
pub type EnvLookup = Arc<dyn Fn(&str) -> Option<String> + Send + Sync>;

/// Main deployment orchestrator
pub struct Orchestrator {
    /// Runs the Test Gate
    local: Arc<dyn Executor>,

    /// Runs every phase that touches the host
    remote: Arc<dyn Executor>,

    /// Verification probe
    probe: Arc<dyn Probe>,

    notifiers: Vec<Arc<dyn Notifier>>,

    env_lookup: EnvLookup,

    /// Where run logs and the deploy lock live
    runs_dir: PathBuf,
}

/// What a phase leaves behind besides its output
struct PhaseCapture {
    output: String,
    result: std::result::Result<(), PhaseFailure>,
}

impl Orchestrator {
    /// Create an orchestrator over explicit adapters
    pub fn new(
        local: Arc<dyn Executor>,
        remote: Arc<dyn Executor>,
        probe: Arc<dyn Probe>,
        runs_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            local,
            remote,
            probe,
            notifiers: Vec::new(),
            env_lookup: Arc::new(|key| std::env::var(key).ok()),
            runs_dir: runs_dir.into(),
        }
    }

    /// Production wiring for a pipeline: local shell, SSH, HTTP probe,
    /// log notifier plus a webhook when one is configured
    pub fn for_pipeline(pipeline: &Pipeline) -> Result<Self> {
        let remote = SshExecutor::from_target(&pipeline.target)
            .with_deploy_log(pipeline.app.deploy_log.clone());
        let probe = HttpProbe::new(pipeline.probe.request_timeout())?;

        let mut orchestrator = Self::new(
            Arc::new(LocalExecutor::new()),
            Arc::new(remote),
            Arc::new(probe),
            crate::config::runs_dir()?,
        )
        .with_notifier(Arc::new(LogNotifier));

        let webhook = pipeline
            .notify
            .as_ref()
            .and_then(|n| n.webhook_url.clone())
            .or_else(crate::config::webhook_url);
        if let Some(url) = webhook {
            orchestrator = orchestrator.with_notifier(Arc::new(WebhookNotifier::new(url)?));
        }

        Ok(orchestrator)
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifiers.push(notifier);
        self
    }

    /// Drop every notifier (runs then end without a Notify stage)
    pub fn without_notifiers(mut self) -> Self {
        self.notifiers.clear();
        self
    }

    /// Replace the source of out-of-band environment values
    pub fn with_env_lookup<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String> + Send + Sync + 'static,
    {
        self.env_lookup = Arc::new(lookup);
        self
    }

    pub fn runs_dir(&self) -> &Path {
        &self.runs_dir
    }

    /// Resolve the environment snapshot for a pipeline
    pub fn resolve_environment(&self, pipeline: &Pipeline) -> Result<EnvironmentSnapshot> {
        let lookup = self.env_lookup.clone();
        pipeline
            .environment
            .resolve(&pipeline.target.host, |key| lookup(key))
            .with_context(|| format!("Environment for pipeline '{}' is incomplete", pipeline.name))
    }

    /// Deploy a commit. Returns the finished run; `Err` only for local
    /// failures (event log, lock) or a refused trigger.
    #[instrument(skip(self, pipeline), fields(pipeline = %pipeline.name, commit = %trigger.commit))]
    pub async fn deploy(&self, pipeline: &Pipeline, trigger: Trigger) -> Result<DeploymentRun> {
        if trigger.commit.trim().is_empty() {
            anyhow::bail!("No commit given to deploy");
        }
        if trigger.branch != pipeline.branch {
            anyhow::bail!(
                "Refusing to deploy branch '{}': pipeline '{}' tracks '{}'",
                trigger.branch,
                pipeline.name,
                pipeline.branch
            );
        }

        let _lock = DeployLock::acquire(&self.runs_dir)?;

        let run_id = Uuid::new_v4();
        info!(%run_id, host = %pipeline.target.host, "Starting deployment");

        let store = EventStore::open_in(&self.runs_dir, run_id).await?;

        let mut run = DeploymentRun::new(
            run_id,
            pipeline.name.clone(),
            trigger.clone(),
            pipeline.target.host.clone(),
        );
        run.log_path = Some(store.events_path().to_path_buf());

        let start_event = Event::new(
            run_id,
            None,
            EventType::RunStarted,
            format!("{}:start", run_id),
            format!(
                "Deploying {} to {} ({})",
                trigger.short_commit(),
                pipeline.target.host,
                pipeline.name
            ),
            PhaseStatus::Running,
        )
        .with_metadata(serde_json::json!({
            "pipeline": pipeline.name,
            "host": pipeline.target.host,
            "trigger": trigger,
        }));
        run.state = run.state.start()?;
        store.append(&start_event).await?;
        run.apply_event(&start_event);

        let limits = &pipeline.safety_limits;
        let tracker = SafetyTracker::new();
        let mut env: Option<EnvironmentSnapshot> = None;
        let mut redactor = Redactor::default();

        while let Some(phase) = run.state.current_phase() {
            let idem_key = generate_idempotency_key(run_id, phase, &trigger.commit);

            if let Err(violation) = limits.check(&tracker) {
                self.handle_safety_violation(&store, &mut run, phase, violation)
                    .await?;
                break;
            }

            let started = Event::new(
                run_id,
                Some(phase),
                EventType::PhaseStarted,
                idem_key.clone(),
                format!("Phase '{}' started", phase),
                PhaseStatus::Running,
            );
            store.append(&started).await?;
            run.apply_event(&started);
            info!(%phase, "Phase started");

            let phase_start = Instant::now();

            // The host is not touched until every required value is known
            if phase.is_remote() && env.is_none() {
                match self.resolve_environment(pipeline) {
                    Ok(snapshot) => {
                        redactor = limits.redactor(&snapshot);
                        env = Some(snapshot);
                    }
                    Err(e) => {
                        let failure = PhaseFailure::new(FailureKind::Environment, format!("{:#}", e));
                        self.fail_phase(&store, &mut run, phase, &idem_key, phase_start, failure)
                            .await?;
                        break;
                    }
                }
            }
            let snapshot = env.clone().unwrap_or_default();

            let capture = if phase == Phase::Verification {
                self.verify(pipeline, phase).await
            } else {
                self.execute_phase(&store, &mut run, pipeline, phase, &snapshot, &redactor)
                    .await?
            };

            let output = limits.clamp_output(&redactor.redact(&capture.output));
            if !output.is_empty() {
                store.store_phase_output(phase, &output).await?;
            }

            match capture.result {
                Ok(()) => {
                    let duration_ms = phase_start.elapsed().as_millis() as u64;
                    let completed = Event::new(
                        run_id,
                        Some(phase),
                        EventType::PhaseCompleted,
                        idem_key,
                        format!("Phase '{}' completed in {}ms", phase, duration_ms),
                        PhaseStatus::Completed,
                    )
                    .with_duration(duration_ms);
                    store.append(&completed).await?;
                    run.apply_event(&completed);
                    info!(%phase, duration_ms, "Phase completed");

                    run.state = run.state.advance()?;
                }
                Err(failure) => {
                    let failure = PhaseFailure::new(failure.kind, redactor.redact(&failure.message));
                    self.fail_phase(&store, &mut run, phase, &idem_key, phase_start, failure)
                        .await?;
                    break;
                }
            }
        }

        if run.state == RunState::Succeeded {
            self.complete_run(&store, &mut run).await?;
        }

        self.notify(&store, &mut run, pipeline).await?;

        Ok(run)
    }

    /// Run every action of a phase in order, stopping at the first failure
    async fn execute_phase(
        &self,
        store: &EventStore,
        run: &mut DeploymentRun,
        pipeline: &Pipeline,
        phase: Phase,
        env: &EnvironmentSnapshot,
        redactor: &Redactor,
    ) -> Result<PhaseCapture> {
        let executor = if phase.is_remote() {
            &self.remote
        } else {
            &self.local
        };
        let phase_timeout = pipeline.safety_limits.phase_timeout(phase);
        let deadline = Instant::now() + phase_timeout;
        let mut output = String::new();

        for action in phase_actions(pipeline, phase, &run.trigger, env) {
            let remaining = deadline.saturating_duration_since(Instant::now());
            debug!(%phase, action = action.label(), executor = executor.name(), "Running action");

            let result = if remaining.is_zero() {
                Err(ExecError::Timeout {
                    label: action.label().to_string(),
                    timeout: phase_timeout,
                })
            } else {
                executor.run(&action, remaining).await
            };

            let out = match result {
                Ok(out) => out,
                Err(e) => {
                    let failure = classify_exec_error(&e, &action, phase, phase_timeout);
                    warn!(%phase, action = action.label(), error = %redactor.redact(&e.to_string()), "Action failed to complete");
                    return Ok(PhaseCapture {
                        output,
                        result: Err(failure),
                    });
                }
            };

            output.push_str(&format!("== {} (exit {}) ==\n", action.label(), out.exit_code));
            output.push_str(&out.combined());
            if !output.ends_with('\n') {
                output.push('\n');
            }

            if !out.success() {
                let failure = PhaseFailure::new(
                    action.failure_kind(),
                    format!(
                        "{} exited with status {}: {}",
                        action.label(),
                        out.exit_code,
                        out.last_line()
                    ),
                );
                return Ok(PhaseCapture {
                    output,
                    result: Err(failure),
                });
            }

            if let Err(failure) = self
                .record_action_effects(store, run, pipeline, phase, &action, &out.stdout, env)
                .await?
            {
                return Ok(PhaseCapture {
                    output,
                    result: Err(failure),
                });
            }
        }

        Ok(PhaseCapture {
            output,
            result: Ok(()),
        })
    }

    /// Log the side effects of a successful action
    #[allow(clippy::too_many_arguments)]
    async fn record_action_effects(
        &self,
        store: &EventStore,
        run: &mut DeploymentRun,
        pipeline: &Pipeline,
        phase: Phase,
        action: &Action,
        stdout: &str,
        env: &EnvironmentSnapshot,
    ) -> Result<std::result::Result<(), PhaseFailure>> {
        let key = |suffix: &str| format!("{}:{}:{}", run.id, phase.as_str(), suffix);

        let event = match action {
            Action::StopProcess { port, .. } => Event::new(
                run.id,
                Some(phase),
                EventType::ProcessStopped,
                key("stop"),
                format!("Previous process stopped, port {} free", port),
                PhaseStatus::Running,
            ),
            Action::WriteEnvironment { path, .. } => {
                let fingerprint = env.fingerprint();
                Event::new(
                    run.id,
                    Some(phase),
                    EventType::EnvironmentMaterialized,
                    key("env"),
                    format!("Wrote {} keys to {}", env.len(), path),
                    PhaseStatus::Running,
                )
                .with_metadata(serde_json::json!({
                    "fingerprint": fingerprint,
                    "keys": env.keys().collect::<Vec<_>>(),
                }))
            }
            Action::StartProcess { app_log, .. } => {
                let Some(pid) = ProcessHandle::parse_pid(stdout) else {
                    return Ok(Err(PhaseFailure::new(
                        FailureKind::ProcessStart,
                        "start script did not report a pid",
                    )));
                };
                let handle = ProcessHandle::new(pid, pipeline.app.port, app_log.clone());
                info!(pid, port = pipeline.app.port, "New process started");
                Event::new(
                    run.id,
                    Some(phase),
                    EventType::ProcessStarted,
                    key("start"),
                    format!("Started pid {} on port {}", pid, pipeline.app.port),
                    PhaseStatus::Running,
                )
                .with_metadata(serde_json::to_value(&handle).context("Failed to serialize process handle")?)
            }
            _ => return Ok(Ok(())),
        };

        store.append(&event).await?;
        run.apply_event(&event);
        Ok(Ok(()))
    }

    /// Poll the liveness probe within the phase timeout
    async fn verify(&self, pipeline: &Pipeline, phase: Phase) -> PhaseCapture {
        let url = pipeline.probe_url();
        let phase_timeout = pipeline.safety_limits.phase_timeout(phase);

        match tokio::time::timeout(
            phase_timeout,
            poll(self.probe.as_ref(), &url, &pipeline.probe.policy),
        )
        .await
        {
            Ok(poll_result) => {
                let output = format!(
                    "GET {}: {} after {} attempt(s)\n",
                    url,
                    poll_result.outcome.describe(),
                    poll_result.attempts
                );
                let result = if poll_result.outcome.is_healthy() {
                    Ok(())
                } else {
                    Err(PhaseFailure::new(
                        FailureKind::Verification,
                        format!(
                            "Probe {} failed after {} attempt(s): {}",
                            url,
                            poll_result.attempts,
                            poll_result.outcome.describe()
                        ),
                    ))
                };
                PhaseCapture { output, result }
            }
            Err(_) => {
                let violation = SafetyViolation::PhaseTimeout {
                    phase,
                    limit_seconds: phase_timeout.as_secs(),
                };
                PhaseCapture {
                    output: format!("GET {}: no healthy response before timeout\n", url),
                    result: Err(PhaseFailure::new(
                        FailureKind::Verification,
                        violation.to_string(),
                    )),
                }
            }
        }
    }

    /// Record a phase failure, skip the remaining phases and fail the run
    async fn fail_phase(
        &self,
        store: &EventStore,
        run: &mut DeploymentRun,
        phase: Phase,
        idem_key: &str,
        phase_start: Instant,
        failure: PhaseFailure,
    ) -> Result<()> {
        let duration_ms = phase_start.elapsed().as_millis() as u64;
        error!(%phase, kind = %failure.kind, error = %failure.message, "Phase failed");

        let failed = Event::new(
            run.id,
            Some(phase),
            EventType::PhaseFailed,
            idem_key.to_string(),
            format!("Phase '{}' failed: {}", phase, failure.kind),
            PhaseStatus::Failed,
        )
        .with_duration(duration_ms)
        .with_failure(failure.kind, failure.message.clone());
        store.append(&failed).await?;
        run.apply_event(&failed);

        self.fail_run(store, run, phase, failure, EventType::RunFailed)
            .await
    }

    /// Handle a safety violation by logging and updating run state
    async fn handle_safety_violation(
        &self,
        store: &EventStore,
        run: &mut DeploymentRun,
        phase: Phase,
        violation: SafetyViolation,
    ) -> Result<()> {
        error!(%violation, "Safety limit reached");
        let failure = PhaseFailure::new(FailureKind::SafetyLimit, violation.to_string());
        self.fail_run(store, run, phase, failure, EventType::SafetyLimitReached)
            .await
    }

    async fn fail_run(
        &self,
        store: &EventStore,
        run: &mut DeploymentRun,
        phase: Phase,
        failure: PhaseFailure,
        event_type: EventType,
    ) -> Result<()> {
        // Later phases never run
        let mut next = phase.next();
        while let Some(skipped_phase) = next {
            let skipped = Event::new(
                run.id,
                Some(skipped_phase),
                EventType::PhaseSkipped,
                generate_idempotency_key(run.id, skipped_phase, &run.trigger.commit),
                format!("Phase '{}' skipped after {} failed", skipped_phase, phase),
                PhaseStatus::Skipped,
            );
            store.append(&skipped).await?;
            run.apply_event(&skipped);
            next = skipped_phase.next();
        }

        let message = failure.message.clone();
        let kind = failure.kind;
        run.state = run.state.fail(failure)?;

        let event = Event::new(
            run.id,
            Some(phase),
            event_type,
            format!("{}:complete", run.id),
            format!("Run failed at {}: {}", phase, kind),
            PhaseStatus::Failed,
        )
        .with_failure(kind, message);
        store.append(&event).await?;
        run.apply_event(&event);

        Ok(())
    }

    /// Complete a successful run
    async fn complete_run(&self, store: &EventStore, run: &mut DeploymentRun) -> Result<()> {
        info!(run_id = %run.id, "Deployment verified live");

        let event = Event::new(
            run.id,
            None,
            EventType::RunCompleted,
            format!("{}:complete", run.id),
            format!(
                "Commit {} live on {}",
                run.trigger.short_commit(),
                run.host
            ),
            PhaseStatus::Completed,
        );
        store.append(&event).await?;
        run.apply_event(&event);

        Ok(())
    }

    /// Report the outcome. Notifier errors are logged, never raised.
    async fn notify(
        &self,
        store: &EventStore,
        run: &mut DeploymentRun,
        pipeline: &Pipeline,
    ) -> Result<()> {
        if self.notifiers.is_empty() {
            return Ok(());
        }
        let Some(notification) = Notification::for_run(run, pipeline.notify.as_ref()) else {
            return Ok(());
        };

        for notifier in &self.notifiers {
            let (event_type, summary, error) = match notifier.notify(&notification).await {
                Ok(()) => (
                    EventType::NotificationSent,
                    format!("Notified via {}", notifier.name()),
                    None,
                ),
                Err(e) => {
                    warn!(notifier = notifier.name(), error = %e, "Notification failed");
                    (
                        EventType::NotificationFailed,
                        format!("Notification via {} failed", notifier.name()),
                        Some(format!("{:#}", e)),
                    )
                }
            };

            let mut event = Event::new(
                run.id,
                None,
                event_type,
                format!("{}:notify:{}", run.id, notifier.name()),
                summary,
                PhaseStatus::Completed,
            );
            if let Some(error) = error {
                event = event.with_error(error);
            }
            store.append(&event).await?;
            run.apply_event(&event);
        }

        Ok(())
    }

    /// Get status of a run by ID
    pub async fn get_run_status(&self, run_id: Uuid) -> Result<DeploymentRun> {
        EventStore::load_run_in(&self.runs_dir, run_id).await
    }

    /// List recent runs, most recent first
    pub async fn list_runs(&self, limit: usize) -> Result<Vec<DeploymentRun>> {
        EventStore::recent_runs_in(&self.runs_dir, limit).await
    }

    /// Probe a pipeline's endpoint once through the polling policy
    pub async fn verify_only(&self, pipeline: &Pipeline) -> Result<String> {
        let capture = self.verify(pipeline, Phase::Verification).await;
        match capture.result {
            Ok(()) => Ok(capture.output.trim_end().to_string()),
            Err(failure) => Err(anyhow::anyhow!(failure.message)),
        }
    }

    /// Check the host is reachable
    pub async fn check_remote(&self) -> Result<()> {
        self.remote.health_check().await
    }
}

/// Map an executor error onto the failure taxonomy
fn classify_exec_error(
    error: &ExecError,
    action: &Action,
    phase: Phase,
    phase_timeout: Duration,
) -> PhaseFailure {
    match error {
        ExecError::Connection { .. } => {
            PhaseFailure::new(FailureKind::Connectivity, error.to_string())
        }
        ExecError::Timeout { .. } => PhaseFailure::new(
            FailureKind::SafetyLimit,
            SafetyViolation::PhaseTimeout {
                phase,
                limit_seconds: phase_timeout.as_secs(),
            }
            .to_string(),
        ),
        // The remote session itself could not be set up
        ExecError::Spawn { .. } | ExecError::Io { .. } if phase.is_remote() => {
            PhaseFailure::new(FailureKind::Connectivity, error.to_string())
        }
        ExecError::Spawn { .. } | ExecError::Io { .. } => {
            PhaseFailure::new(action.failure_kind(), error.to_string())
        }
    }
}
