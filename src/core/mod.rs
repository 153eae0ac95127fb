//! Core orchestration logic.
//!
//! This module contains:
//! - EventStore: Append-only event logging
//! - Pipeline: Pipeline definitions and loading
//! - Actions: Typed phase actions and their shell rendering
//! - Safety: Safety limits, secret redaction
//! - Lock: Local exclusive deploy lock
//! - Orchestrator: Main execution engine

pub mod actions;
pub mod event_store;
pub mod lock;
pub mod orchestrator;
pub mod pipeline;
pub mod safety;

// Re-export commonly used types
pub use actions::{phase_actions, Action};
pub use event_store::{generate_idempotency_key, hash_input, EventStore};
pub use lock::DeployLock;
pub use orchestrator::Orchestrator;
pub use pipeline::{
    AppConfig, CommandsConfig, EnvValue, EnvironmentSpec, NotifySpec, Pipeline, ProbePolicy,
    ProbeSpec, TargetConfig,
};
pub use safety::{Redactor, SafetyLimits, SafetyTracker, SafetyViolation};
