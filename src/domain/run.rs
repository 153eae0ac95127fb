//! Deployment run state and reconstruction from events.
//!
//! A run moves through an explicit state machine: each `Running` state has
//! exactly one forward transition and one failure transition. Terminal
//! states accept neither.

use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use super::events::{Event, EventType, PhaseStatus};
use super::phase::{FailureKind, Phase, PhaseFailure, Stage};
use super::process::ProcessHandle;

/// What started a run
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Trigger {
    /// Commit to deploy
    pub commit: String,

    /// Branch the commit was pushed to
    pub branch: String,
}

impl Trigger {
    pub fn new(commit: impl Into<String>, branch: impl Into<String>) -> Self {
        Self {
            commit: commit.into(),
            branch: branch.into(),
        }
    }

    /// First 7 characters of the commit, for display
    pub fn short_commit(&self) -> &str {
        let end = self
            .commit
            .char_indices()
            .nth(7)
            .map(|(i, _)| i)
            .unwrap_or(self.commit.len());
        &self.commit[..end]
    }
}

/// Binary result reported to the triggering system
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Success,
    Failure,
}

/// Rejected state transition
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionError {
    #[error("Run has not started")]
    NotStarted,

    #[error("Run already finished in state {0:?}")]
    AlreadyFinished(RunState),
}

/// State of a deployment run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "status")]
pub enum RunState {
    /// Created, no phase entered yet
    Pending,

    /// Executing the given phase
    Running { phase: Phase },

    /// Every phase passed, new process verified live
    Succeeded,

    /// Stopped at `phase`
    Failed {
        phase: Phase,
        kind: FailureKind,
        error: String,
    },
}

impl Default for RunState {
    fn default() -> Self {
        Self::Pending
    }
}

impl RunState {
    /// Enter the first phase
    pub fn start(&self) -> Result<RunState, TransitionError> {
        match self {
            RunState::Pending => Ok(RunState::Running {
                phase: Phase::first(),
            }),
            other => Err(TransitionError::AlreadyFinished(other.clone())),
        }
    }

    /// Move past the current phase
    pub fn advance(&self) -> Result<RunState, TransitionError> {
        match self {
            RunState::Pending => Err(TransitionError::NotStarted),
            RunState::Running { phase } => Ok(match phase.next() {
                Some(next) => RunState::Running { phase: next },
                None => RunState::Succeeded,
            }),
            other => Err(TransitionError::AlreadyFinished(other.clone())),
        }
    }

    /// Stop the run at the current phase
    pub fn fail(&self, failure: PhaseFailure) -> Result<RunState, TransitionError> {
        match self {
            RunState::Pending => Err(TransitionError::NotStarted),
            RunState::Running { phase } => Ok(RunState::Failed {
                phase: *phase,
                kind: failure.kind,
                error: failure.message,
            }),
            other => Err(TransitionError::AlreadyFinished(other.clone())),
        }
    }

    pub fn current_phase(&self) -> Option<Phase> {
        match self {
            RunState::Running { phase } => Some(*phase),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RunState::Succeeded | RunState::Failed { .. })
    }

    pub fn outcome(&self) -> Option<Outcome> {
        match self {
            RunState::Succeeded => Some(Outcome::Success),
            RunState::Failed { .. } => Some(Outcome::Failure),
            _ => None,
        }
    }

    /// Short lowercase label for tables
    pub fn label(&self) -> &'static str {
        match self {
            RunState::Pending => "pending",
            RunState::Running { .. } => "running",
            RunState::Succeeded => "succeeded",
            RunState::Failed { .. } => "failed",
        }
    }
}

/// One execution of the deployment pipeline
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentRun {
    /// Unique identifier for this run
    pub id: Uuid,

    /// Name of the pipeline being executed
    pub pipeline_name: String,

    /// Commit and branch that triggered the run
    pub trigger: Trigger,

    /// Target host
    pub host: String,

    /// Current state of the run
    pub state: RunState,

    /// When the run started
    pub started_at: DateTime<Utc>,

    /// When the run reached a terminal state
    pub completed_at: Option<DateTime<Utc>>,

    /// Status of each phase
    pub phase_statuses: BTreeMap<Phase, PhaseStatus>,

    /// Process spawned by Process Restart, if it got that far
    pub process: Option<ProcessHandle>,

    /// Fingerprint of the environment file written this run
    pub environment_fingerprint: Option<String>,

    /// Whether the outcome notification went out (None: not attempted)
    pub notified: Option<bool>,

    /// Local event log for this run
    pub log_path: Option<PathBuf>,
}

impl DeploymentRun {
    /// Create a new pending run
    pub fn new(id: Uuid, pipeline_name: String, trigger: Trigger, host: String) -> Self {
        let phase_statuses = Phase::ALL
            .into_iter()
            .map(|p| (p, PhaseStatus::Pending))
            .collect();

        Self {
            id,
            pipeline_name,
            trigger,
            host,
            state: RunState::Pending,
            started_at: Utc::now(),
            completed_at: None,
            phase_statuses,
            process: None,
            environment_fingerprint: None,
            notified: None,
            log_path: None,
        }
    }

    /// Reconstruct run state from a sequence of events
    pub fn from_events(events: &[Event]) -> Option<Self> {
        let first_event = events.first()?;

        let mut run = Self::new(
            first_event.run_id,
            String::new(),
            Trigger::default(),
            String::new(),
        );
        run.started_at = first_event.timestamp;

        for event in events {
            run.apply_event(event);
        }

        Some(run)
    }

    /// Apply a single event to update run state
    pub fn apply_event(&mut self, event: &Event) {
        match event.event_type {
            EventType::RunStarted => {
                // A live run has already taken the transition
                if let Ok(next) = self.state.start() {
                    self.state = next;
                }
                self.started_at = event.timestamp;
                if let Some(meta) = &event.metadata {
                    if let Some(name) = meta.get("pipeline").and_then(|v| v.as_str()) {
                        self.pipeline_name = name.to_string();
                    }
                    if let Some(host) = meta.get("host").and_then(|v| v.as_str()) {
                        self.host = host.to_string();
                    }
                    if let Some(trigger) = meta
                        .get("trigger")
                        .and_then(|v| serde_json::from_value(v.clone()).ok())
                    {
                        self.trigger = trigger;
                    }
                }
            }
            EventType::PhaseStarted => {
                if let Some(phase) = event.phase {
                    self.phase_statuses.insert(phase, PhaseStatus::Running);
                    self.state = RunState::Running { phase };
                }
            }
            EventType::PhaseCompleted => {
                if let Some(phase) = event.phase {
                    self.phase_statuses.insert(phase, PhaseStatus::Completed);
                }
            }
            EventType::PhaseFailed => {
                if let Some(phase) = event.phase {
                    self.phase_statuses.insert(phase, PhaseStatus::Failed);
                }
            }
            EventType::PhaseSkipped => {
                if let Some(phase) = event.phase {
                    self.phase_statuses.insert(phase, PhaseStatus::Skipped);
                }
            }
            EventType::ProcessStopped => {
                self.process = None;
            }
            EventType::ProcessStarted => {
                self.process = event
                    .metadata
                    .as_ref()
                    .and_then(|m| serde_json::from_value(m.clone()).ok());
            }
            EventType::EnvironmentMaterialized => {
                self.environment_fingerprint = event
                    .metadata
                    .as_ref()
                    .and_then(|m| m.get("fingerprint"))
                    .and_then(|v| v.as_str())
                    .map(str::to_string);
            }
            EventType::RunCompleted => {
                self.state = RunState::Succeeded;
                self.completed_at = Some(event.timestamp);
            }
            EventType::RunFailed | EventType::SafetyLimitReached => {
                let phase = event
                    .phase
                    .or_else(|| self.state.current_phase())
                    .unwrap_or_else(Phase::first);
                let default_kind = if event.event_type == EventType::SafetyLimitReached {
                    FailureKind::SafetyLimit
                } else {
                    FailureKind::Verification
                };
                self.state = RunState::Failed {
                    phase,
                    kind: event.failure_kind.unwrap_or(default_kind),
                    error: event.error.clone().unwrap_or_default(),
                };
                self.completed_at = Some(event.timestamp);
            }
            EventType::NotificationSent => {
                self.notified = Some(true);
            }
            EventType::NotificationFailed => {
                self.notified = Some(false);
            }
        }
    }

    /// Coarse stage, as reported to the triggering system
    pub fn stage(&self) -> Stage {
        if self.notified.is_some() {
            return Stage::Notify;
        }
        match &self.state {
            RunState::Pending => Stage::Test,
            RunState::Running { phase } => phase.stage(),
            RunState::Succeeded => Stage::Verify,
            RunState::Failed { phase, .. } => phase.stage(),
        }
    }

    pub fn outcome(&self) -> Option<Outcome> {
        self.state.outcome()
    }

    pub fn phase_status(&self, phase: Phase) -> PhaseStatus {
        self.phase_statuses.get(&phase).copied().unwrap_or_default()
    }
}
