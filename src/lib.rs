//! egsa-deploy - Event-sourced deployment orchestrator
//!
//! Takes the EGSA Django application on one fixed host from "not running,
//! or running an old version" to "running a new version" without leaving
//! dangling processes behind.
//!
//! # Architecture
//!
//! The system is built around event sourcing:
//! - All state changes are recorded as immutable events
//! - Current state is derived by replaying events
//! - A run moves through a fixed phase sequence and stops at the first
//!   failure: Test Gate, Remote Sync, Environment Materialization,
//!   Migration & Assets, Process Restart, Verification
//!
//! # Modules
//!
//! - `adapters`: External systems (local shell, SSH, HTTP probe, notifiers)
//! - `core`: Orchestration logic (EventStore, Pipeline, Actions, Safety)
//! - `domain`: Data structures (Event, Phase, DeploymentRun, Environment)
//! - `cli`: Command-line interface
//!
//! # Usage
//!
//! ```bash
//! # Deploy a commit
//! egsa-deploy deploy egsa --commit abc123
//!
//! # Check run status
//! egsa-deploy status <run-id>
//!
//! # Captured output of one phase
//! egsa-deploy logs <run-id> --phase migration_and_assets
//! ```

pub mod adapters;
pub mod cli;
pub mod config;
pub mod core;
pub mod domain;

// Re-export main types at crate root for convenience
pub use core::{Orchestrator, Pipeline};
pub use domain::{DeploymentRun, Event, EventType, FailureKind, Phase, RunState, Trigger};
