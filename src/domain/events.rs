//! Event types for the event-sourced deployment log.
//!
//! Every state change of a deployment run is recorded as an immutable event
//! in an append-only log.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::phase::{FailureKind, Phase};

/// A single event in the append-only event log.
///
/// Events are the source of truth for run state. The current state of any run
/// can be reconstructed by replaying its events in order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Unique identifier for this event
    pub id: Uuid,

    /// When this event occurred (ISO 8601)
    pub timestamp: DateTime<Utc>,

    /// The run this event belongs to
    pub run_id: Uuid,

    /// Phase this event concerns (if any)
    pub phase: Option<Phase>,

    /// Type of event
    pub event_type: EventType,

    /// Idempotency key format: "{run_id}:{phase}:{commit_hash}"
    pub idempotency_key: String,

    /// Human-readable summary (NO secrets)
    pub payload_summary: String,

    /// Status of the phase/run after this event
    pub status: PhaseStatus,

    /// Time taken in milliseconds (for finished phases)
    pub duration_ms: Option<u64>,

    /// Failure classification, if failed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_kind: Option<FailureKind>,

    /// Error message if failed
    pub error: Option<String>,

    /// Structured details (run trigger, process handle, env fingerprint)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

impl Event {
    /// Create a new event with the current timestamp
    pub fn new(
        run_id: Uuid,
        phase: Option<Phase>,
        event_type: EventType,
        idempotency_key: String,
        payload_summary: String,
        status: PhaseStatus,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            run_id,
            phase,
            event_type,
            idempotency_key,
            payload_summary,
            status,
            duration_ms: None,
            failure_kind: None,
            error: None,
            metadata: None,
        }
    }

    /// Create an event with duration information
    pub fn with_duration(mut self, duration_ms: u64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }

    /// Create an event with error information
    pub fn with_error(mut self, error: String) -> Self {
        self.error = Some(error);
        self
    }

    pub fn with_failure(mut self, kind: FailureKind, error: String) -> Self {
        self.failure_kind = Some(kind);
        self.error = Some(error);
        self
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// Types of events that can occur during a deployment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    /// A new run has started (metadata: trigger)
    RunStarted,

    /// The run finished with the new process verified live
    RunCompleted,

    /// The run failed
    RunFailed,

    /// A phase has started execution
    PhaseStarted,

    /// A phase completed successfully
    PhaseCompleted,

    /// A phase failed; the run stops here
    PhaseFailed,

    /// A phase never ran because an earlier one failed
    PhaseSkipped,

    /// The previous process was stopped
    ProcessStopped,

    /// A new process was spawned (metadata: process handle)
    ProcessStarted,

    /// Environment file written (metadata: fingerprint and keys)
    EnvironmentMaterialized,

    /// Outcome reported to the notification channel
    NotificationSent,

    /// Reporting the outcome failed (does not change the outcome)
    NotificationFailed,

    /// A safety limit was reached, halting execution
    SafetyLimitReached,
}

/// Status of a phase or run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    /// Not yet started
    Pending,

    /// Currently executing
    Running,

    /// Completed successfully
    Completed,

    /// Failed (with error)
    Failed,

    /// Not run because an earlier phase failed
    Skipped,
}

impl Default for PhaseStatus {
    fn default() -> Self {
        Self::Pending
    }
}
