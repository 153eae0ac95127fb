//! Domain types for the deployment orchestrator.
//!
//! This module contains the core data structures:
//! - Events: Immutable records of state changes
//! - Phase: The fixed phase sequence and failure taxonomy
//! - Run: Deployment run state machine
//! - Process: Handle of the live application process
//! - Environment: Configuration snapshot written to the host

pub mod environment;
pub mod events;
pub mod phase;
pub mod process;
pub mod run;

// Re-export commonly used types
pub use environment::{EnvironmentError, EnvironmentSnapshot};
pub use events::{Event, EventType, PhaseStatus};
pub use phase::{FailureKind, Phase, PhaseFailure, Stage};
pub use process::ProcessHandle;
pub use run::{DeploymentRun, Outcome, RunState, Trigger, TransitionError};
