//! Safety Limits Integration Tests
//!
//! Tests for run limits, secret detection and output redaction.

mod common;

use common::*;
use egsa_deploy::core::{
    EventStore, Pipeline, Redactor, SafetyLimits, SafetyTracker, SafetyViolation,
};
use egsa_deploy::domain::{EventType, FailureKind, Phase, PhaseStatus, RunState, Trigger};
use tempfile::TempDir;

#[test]
fn test_safety_limits_yaml_parsing() {
    let yaml = format!(
        "{}\n{}",
        PIPELINE_YAML,
        r#"
safety_limits:
  phase_timeout_seconds: 120
  run_timeout_seconds: 900
  max_output_bytes: 65536
  phase_timeouts:
    test_gate: 1800
  secret_patterns:
    - "*PASSWORD*"
    - "*_TOKEN"
"#
    );

    let pipeline = Pipeline::from_yaml(&yaml).unwrap();
    let limits = &pipeline.safety_limits;

    assert_eq!(limits.phase_timeout_seconds, 120);
    assert_eq!(limits.run_timeout_seconds, 900);
    assert_eq!(limits.max_output_bytes, 65536);
    assert_eq!(limits.phase_timeouts.get(&Phase::TestGate), Some(&1800));
    assert_eq!(limits.secret_patterns.len(), 2);

    // Custom patterns replace the defaults
    assert!(limits.is_secret_key("DB_PASSWORD"));
    assert!(limits.is_secret_key("GITHUB_TOKEN"));
    assert!(!limits.is_secret_key("SECRET_KEY"));
}

#[test]
fn test_unknown_phase_in_timeouts_is_rejected() {
    let yaml = format!(
        "{}\n{}",
        PIPELINE_YAML,
        r#"
safety_limits:
  phase_timeouts:
    rollback: 60
"#
    );

    assert!(Pipeline::from_yaml(&yaml).is_err());
}

#[test]
fn test_redactor_from_environment() {
    let pipeline = pipeline();
    let env = pipeline.environment.resolve("10.0.0.5", |_| None).unwrap();
    let redactor = pipeline.safety_limits.redactor(&env);

    let log = format!(
        "SECRET_KEY={} DB_PASSWORD={} DB_HOST=egsa.cluster.eu-north-1.rds.amazonaws.com",
        SECRET, DB_PASSWORD
    );
    let redacted = redactor.redact(&log);

    assert!(!redacted.contains(SECRET));
    assert!(!redacted.contains(DB_PASSWORD));
    // Non-secret values stay readable
    assert!(redacted.contains("egsa.cluster.eu-north-1.rds.amazonaws.com"));
    assert_eq!(redacted.matches("[REDACTED]").count(), 2);
}

#[test]
fn test_empty_redactor_is_identity() {
    let redactor = Redactor::default();
    assert_eq!(redactor.redact("Ran 42 tests\nOK"), "Ran 42 tests\nOK");
}

#[test]
fn test_run_timeout_check() {
    let limits = SafetyLimits {
        run_timeout_seconds: 3600,
        ..Default::default()
    };
    let tracker = SafetyTracker::new();
    assert!(limits.check(&tracker).is_ok());
    assert!(tracker.elapsed_seconds() < 1);

    let exhausted = SafetyLimits {
        run_timeout_seconds: 0,
        ..Default::default()
    };
    match exhausted.check(&tracker) {
        Err(SafetyViolation::RunTimeout { limit_seconds, .. }) => assert_eq!(limit_seconds, 0),
        other => panic!("Expected RunTimeout violation, got {:?}", other),
    }
}

#[tokio::test]
async fn test_exhausted_run_budget_halts_before_tests() {
    let temp = TempDir::new().unwrap();
    let host = shared(HostState::running("0ld0ld0"));
    let tests = FakeTests::passing();
    let test_runs = tests.runs.clone();

    let mut pipeline = pipeline();
    pipeline.safety_limits.run_timeout_seconds = 0;

    let orchestrator = orchestrator(
        tests,
        FakeHost::new(host.clone()),
        FakeProbe::new(host.clone()),
        temp.path(),
    );
    let run = orchestrator
        .deploy(&pipeline, Trigger::new("abc123", "main"))
        .await
        .unwrap();

    match &run.state {
        RunState::Failed { phase, kind, error } => {
            assert_eq!(*phase, Phase::TestGate);
            assert_eq!(*kind, FailureKind::SafetyLimit);
            assert!(error.contains("Run timeout"));
        }
        other => panic!("expected failure, got {:?}", other),
    }
    assert_eq!(*test_runs.lock().unwrap(), 0);
    assert!(host.lock().unwrap().actions.is_empty());
    assert_eq!(run.phase_status(Phase::Verification), PhaseStatus::Skipped);

    let store = EventStore::open_in(temp.path(), run.id).await.unwrap();
    assert!(store
        .last_event_of_type(EventType::SafetyLimitReached)
        .await
        .unwrap()
        .is_some());
}

#[tokio::test]
async fn test_large_output_is_clamped() {
    let temp = TempDir::new().unwrap();
    let host = shared(HostState::default());

    let mut pipeline = pipeline();
    pipeline.safety_limits.max_output_bytes = 64;

    let orchestrator = orchestrator(
        FakeTests::passing(),
        FakeHost::new(host.clone()).failing("migrate", "E".repeat(10_000)),
        FakeProbe::new(host.clone()),
        temp.path(),
    );
    let run = orchestrator
        .deploy(&pipeline, Trigger::new("abc123", "main"))
        .await
        .unwrap();
    assert!(run.outcome().is_some());

    let store = EventStore::open_in(temp.path(), run.id).await.unwrap();
    let output = store
        .load_phase_output(Phase::MigrationAndAssets)
        .await
        .unwrap()
        .unwrap();
    assert!(output.starts_with("[... "));
    assert!(output.len() < 128);
}

#[test]
fn test_pipeline_validation_guards_state_paths() {
    let yaml = PIPELINE_YAML.replace(
        "port: 8000",
        "port: 8000\n  pid_file: /home/ubuntu/egsa/gunicorn.pid",
    );
    let pipeline = Pipeline::from_yaml(&yaml).unwrap();

    tokio_test::assert_err!(pipeline.validate());
}
