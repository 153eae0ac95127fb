//! Deployment phases and the failure taxonomy.
//!
//! Phases run in a fixed order. Each phase has exactly one successor, so a
//! run can only ever move forward or stop.

use std::fmt;

use serde::{Deserialize, Serialize};

/// One phase of a deployment run, in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// Run the application's test suite locally
    TestGate,

    /// Stop the old process, re-clone the code, install dependencies
    RemoteSync,

    /// Write a fresh environment file on the host
    EnvironmentMaterialization,

    /// Apply migrations and republish static assets
    MigrationAndAssets,

    /// Start the new process detached from the session
    ProcessRestart,

    /// Probe the new process's listening port
    Verification,
}

impl Phase {
    /// All phases in execution order
    pub const ALL: [Phase; 6] = [
        Phase::TestGate,
        Phase::RemoteSync,
        Phase::EnvironmentMaterialization,
        Phase::MigrationAndAssets,
        Phase::ProcessRestart,
        Phase::Verification,
    ];

    /// The first phase of every run
    pub fn first() -> Self {
        Phase::TestGate
    }

    /// The phase that follows this one, or `None` after Verification
    pub fn next(self) -> Option<Phase> {
        match self {
            Phase::TestGate => Some(Phase::RemoteSync),
            Phase::RemoteSync => Some(Phase::EnvironmentMaterialization),
            Phase::EnvironmentMaterialization => Some(Phase::MigrationAndAssets),
            Phase::MigrationAndAssets => Some(Phase::ProcessRestart),
            Phase::ProcessRestart => Some(Phase::Verification),
            Phase::Verification => None,
        }
    }

    /// Zero-based position in the execution order
    pub fn index(self) -> usize {
        match self {
            Phase::TestGate => 0,
            Phase::RemoteSync => 1,
            Phase::EnvironmentMaterialization => 2,
            Phase::MigrationAndAssets => 3,
            Phase::ProcessRestart => 4,
            Phase::Verification => 5,
        }
    }

    /// Coarse stage this phase belongs to
    pub fn stage(self) -> Stage {
        match self {
            Phase::TestGate => Stage::Test,
            Phase::RemoteSync
            | Phase::EnvironmentMaterialization
            | Phase::MigrationAndAssets
            | Phase::ProcessRestart => Stage::Deploy,
            Phase::Verification => Stage::Verify,
        }
    }

    /// Whether this phase touches the remote host
    pub fn is_remote(self) -> bool {
        !matches!(self, Phase::TestGate)
    }

    /// Stable snake_case name, used in file names and idempotency keys
    pub fn as_str(self) -> &'static str {
        match self {
            Phase::TestGate => "test_gate",
            Phase::RemoteSync => "remote_sync",
            Phase::EnvironmentMaterialization => "environment_materialization",
            Phase::MigrationAndAssets => "migration_and_assets",
            Phase::ProcessRestart => "process_restart",
            Phase::Verification => "verification",
        }
    }

    /// Parse a phase from its snake_case name
    pub fn parse(name: &str) -> Option<Phase> {
        Phase::ALL.into_iter().find(|p| p.as_str() == name)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Coarse stage of a run as reported to the triggering system
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Test,
    Deploy,
    Verify,
    Notify,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Stage::Test => "test",
            Stage::Deploy => "deploy",
            Stage::Verify => "verify",
            Stage::Notify => "notify",
        };
        f.write_str(s)
    }
}

/// Why a run failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The test suite failed
    Test,

    /// Host unreachable, authentication refused, or the session dropped
    Connectivity,

    /// The previous process could not be stopped or its port stayed busy
    ProcessStop,

    /// Dependency installation failed on the host
    DependencyInstall,

    /// Environment values missing or the file could not be written
    Environment,

    /// Migrations, static collection or a management command failed
    Migration,

    /// The new process could not be launched
    ProcessStart,

    /// The liveness probe never got a non-error response
    Verification,

    /// A run-level limit (e.g. the run timeout) was reached
    SafetyLimit,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FailureKind::Test => "test failure",
            FailureKind::Connectivity => "connectivity failure",
            FailureKind::ProcessStop => "process stop failure",
            FailureKind::DependencyInstall => "dependency-install failure",
            FailureKind::Environment => "environment failure",
            FailureKind::Migration => "migration failure",
            FailureKind::ProcessStart => "process start failure",
            FailureKind::Verification => "verification failure",
            FailureKind::SafetyLimit => "safety limit reached",
        };
        f.write_str(s)
    }
}

/// A typed phase failure, carried into the run's terminal state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhaseFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl PhaseFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for PhaseFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for PhaseFailure {}
