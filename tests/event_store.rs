//! Event Store Integration Tests
//!
//! Tests for event log format, append operations, and replay order.

use egsa_deploy::core::{generate_idempotency_key, EventStore};
use egsa_deploy::domain::{
    DeploymentRun, Event, EventType, FailureKind, Phase, PhaseStatus, ProcessHandle, RunState,
    Trigger,
};
use tempfile::TempDir;
use uuid::Uuid;

fn started(run_id: Uuid) -> Event {
    Event::new(
        run_id,
        None,
        EventType::RunStarted,
        format!("{}:start", run_id),
        "Deploying abc123 to 10.0.0.5 (egsa)".to_string(),
        PhaseStatus::Running,
    )
    .with_metadata(serde_json::json!({
        "pipeline": "egsa",
        "host": "10.0.0.5",
        "trigger": Trigger::new("abc123", "main"),
    }))
}

fn phase_event(run_id: Uuid, phase: Phase, event_type: EventType, status: PhaseStatus) -> Event {
    Event::new(
        run_id,
        Some(phase),
        event_type,
        generate_idempotency_key(run_id, phase, "abc123"),
        format!("Phase '{}'", phase),
        status,
    )
}

#[tokio::test]
async fn test_event_log_is_jsonl() {
    let temp_dir = TempDir::new().unwrap();
    let run_id = Uuid::new_v4();
    let store = EventStore::open_in(temp_dir.path(), run_id).await.unwrap();

    store.append(&started(run_id)).await.unwrap();
    store
        .append(&phase_event(
            run_id,
            Phase::TestGate,
            EventType::PhaseStarted,
            PhaseStatus::Running,
        ))
        .await
        .unwrap();

    let raw = std::fs::read_to_string(store.events_path()).unwrap();
    let lines: Vec<&str> = raw.lines().collect();
    assert_eq!(lines.len(), 2);

    // One self-contained JSON object per line
    let second: serde_json::Value = serde_json::from_str(lines[1]).unwrap();
    assert_eq!(second["event_type"], "phase_started");
    assert_eq!(second["phase"], "test_gate");
    assert_eq!(second["status"], "running");
    assert_eq!(second["run_id"], run_id.to_string());
    assert!(second["timestamp"].as_str().unwrap().contains('T'));
}

#[tokio::test]
async fn test_replay_preserves_append_order() {
    let temp_dir = TempDir::new().unwrap();
    let run_id = Uuid::new_v4();
    let store = EventStore::open_in(temp_dir.path(), run_id).await.unwrap();

    store.append(&started(run_id)).await.unwrap();
    for phase in Phase::ALL {
        store
            .append(&phase_event(
                run_id,
                phase,
                EventType::PhaseStarted,
                PhaseStatus::Running,
            ))
            .await
            .unwrap();
        store
            .append(&phase_event(
                run_id,
                phase,
                EventType::PhaseCompleted,
                PhaseStatus::Completed,
            ))
            .await
            .unwrap();
    }

    let events = store.replay().await.unwrap();
    assert_eq!(events.len(), 1 + 2 * Phase::ALL.len());
    assert_eq!(events[0].event_type, EventType::RunStarted);

    let completed: Vec<Phase> = events
        .iter()
        .filter(|e| e.event_type == EventType::PhaseCompleted)
        .filter_map(|e| e.phase)
        .collect();
    assert_eq!(completed, Phase::ALL.to_vec());
}

#[tokio::test]
async fn test_interrupted_run_replays_as_running() {
    let temp_dir = TempDir::new().unwrap();
    let run_id = Uuid::new_v4();
    let store = EventStore::open_in(temp_dir.path(), run_id).await.unwrap();

    store.append(&started(run_id)).await.unwrap();
    store
        .append(&phase_event(
            run_id,
            Phase::TestGate,
            EventType::PhaseCompleted,
            PhaseStatus::Completed,
        ))
        .await
        .unwrap();
    store
        .append(&phase_event(
            run_id,
            Phase::RemoteSync,
            EventType::PhaseStarted,
            PhaseStatus::Running,
        ))
        .await
        .unwrap();

    let run = store.load_run().await.unwrap().unwrap();
    assert_eq!(run.pipeline_name, "egsa");
    assert_eq!(run.trigger.commit, "abc123");
    assert_eq!(
        run.state,
        RunState::Running {
            phase: Phase::RemoteSync
        }
    );
    assert!(run.outcome().is_none());
    assert_eq!(run.log_path.as_deref(), Some(store.events_path()));
}

#[tokio::test]
async fn test_failed_run_replays_failure_and_skips() {
    let temp_dir = TempDir::new().unwrap();
    let run_id = Uuid::new_v4();
    let store = EventStore::open_in(temp_dir.path(), run_id).await.unwrap();

    let handle = ProcessHandle::new(4242, 8000, "~/egsa.log");
    let events = vec![
        started(run_id),
        phase_event(run_id, Phase::TestGate, EventType::PhaseCompleted, PhaseStatus::Completed),
        phase_event(run_id, Phase::RemoteSync, EventType::PhaseCompleted, PhaseStatus::Completed),
        phase_event(
            run_id,
            Phase::EnvironmentMaterialization,
            EventType::PhaseCompleted,
            PhaseStatus::Completed,
        ),
        phase_event(
            run_id,
            Phase::MigrationAndAssets,
            EventType::PhaseCompleted,
            PhaseStatus::Completed,
        ),
        phase_event(run_id, Phase::ProcessRestart, EventType::ProcessStarted, PhaseStatus::Running)
            .with_metadata(serde_json::to_value(&handle).unwrap()),
        phase_event(run_id, Phase::ProcessRestart, EventType::PhaseCompleted, PhaseStatus::Completed),
        phase_event(run_id, Phase::Verification, EventType::PhaseStarted, PhaseStatus::Running),
        phase_event(run_id, Phase::Verification, EventType::PhaseFailed, PhaseStatus::Failed)
            .with_failure(FailureKind::Verification, "HTTP 502".to_string()),
        phase_event(run_id, Phase::Verification, EventType::RunFailed, PhaseStatus::Failed)
            .with_failure(FailureKind::Verification, "HTTP 502".to_string()),
    ];
    for event in &events {
        store.append(event).await.unwrap();
    }

    let run = store.load_run().await.unwrap().unwrap();
    assert_eq!(
        run.state,
        RunState::Failed {
            phase: Phase::Verification,
            kind: FailureKind::Verification,
            error: "HTTP 502".to_string(),
        }
    );
    assert_eq!(run.process, Some(handle));
    assert!(run.completed_at.is_some());
    assert_eq!(run.phase_status(Phase::Verification), PhaseStatus::Failed);
    assert_eq!(run.phase_status(Phase::ProcessRestart), PhaseStatus::Completed);

    // The in-memory fold and the replayed fold agree
    let folded = DeploymentRun::from_events(&events).unwrap();
    assert_eq!(folded.state, run.state);
    assert_eq!(folded.phase_statuses, run.phase_statuses);
}

#[tokio::test]
async fn test_lookup_helpers() {
    let temp_dir = TempDir::new().unwrap();
    let run_id = Uuid::new_v4();
    let store = EventStore::open_in(temp_dir.path(), run_id).await.unwrap();

    store.append(&started(run_id)).await.unwrap();
    for phase in [Phase::TestGate, Phase::RemoteSync] {
        store
            .append(&phase_event(
                run_id,
                phase,
                EventType::PhaseStarted,
                PhaseStatus::Running,
            ))
            .await
            .unwrap();
    }

    let last = store
        .last_event_of_type(EventType::PhaseStarted)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(last.phase, Some(Phase::RemoteSync));

    assert!(store
        .last_event_of_type(EventType::RunCompleted)
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn test_phase_outputs_listed_in_phase_order() {
    let temp_dir = TempDir::new().unwrap();
    let run_id = Uuid::new_v4();
    let store = EventStore::open_in(temp_dir.path(), run_id).await.unwrap();

    store
        .store_phase_output(Phase::MigrationAndAssets, "Applying tracker.0001_initial... OK\n")
        .await
        .unwrap();
    store
        .store_phase_output(Phase::TestGate, "Ran 42 tests\n\nOK\n")
        .await
        .unwrap();

    assert_eq!(
        store.phases_with_output().await.unwrap(),
        vec![Phase::TestGate, Phase::MigrationAndAssets]
    );
    assert!(store
        .load_phase_output(Phase::Verification)
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn test_recent_runs_skip_empty_logs() {
    let temp_dir = TempDir::new().unwrap();

    let finished = Uuid::new_v4();
    let store = EventStore::open_in(temp_dir.path(), finished).await.unwrap();
    store.append(&started(finished)).await.unwrap();

    // Directory with no events yet
    EventStore::open_in(temp_dir.path(), Uuid::new_v4())
        .await
        .unwrap();

    let runs = EventStore::recent_runs_in(temp_dir.path(), 10).await.unwrap();
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].id, finished);
}

#[test]
fn test_idempotency_key_varies_with_phase_and_commit() {
    let run_id = Uuid::new_v4();

    let key = generate_idempotency_key(run_id, Phase::RemoteSync, "abc123");
    assert_eq!(key, generate_idempotency_key(run_id, Phase::RemoteSync, "abc123"));
    assert_ne!(key, generate_idempotency_key(run_id, Phase::ProcessRestart, "abc123"));
    assert_ne!(key, generate_idempotency_key(run_id, Phase::RemoteSync, "def456"));
    assert_ne!(key, generate_idempotency_key(Uuid::new_v4(), Phase::RemoteSync, "abc123"));
}

#[test]
fn test_repeated_run_started_keeps_position() {
    let run_id = Uuid::new_v4();
    let events = vec![
        started(run_id),
        phase_event(run_id, Phase::RemoteSync, EventType::PhaseStarted, PhaseStatus::Running),
        started(run_id),
    ];

    let run = DeploymentRun::from_events(&events).unwrap();
    assert_eq!(
        run.state,
        RunState::Running {
            phase: Phase::RemoteSync
        }
    );
}
