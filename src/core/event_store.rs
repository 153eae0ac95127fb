//! Append-only event store with file-based persistence.
//!
//! Events are stored as newline-delimited JSON (JSONL) for simplicity
//! and easy debugging/inspection. Captured phase output is kept next to
//! the log, already redacted by the caller.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use uuid::Uuid;

use crate::domain::{DeploymentRun, Event, EventType, Phase};

/// File-based event store using JSONL format
pub struct EventStore {
    /// Directory containing the run
    run_dir: PathBuf,

    /// Path to the events.jsonl file
    events_path: PathBuf,

    /// Per-phase captured output
    output_dir: PathBuf,
}

impl EventStore {
    /// Create or open an event store for a run
    pub async fn open(run_id: Uuid) -> Result<Self> {
        let base_dir = Self::base_directory()?;
        Self::open_in(&base_dir, run_id).await
    }

    /// Create or open an event store under an explicit runs directory
    pub async fn open_in(base_dir: &Path, run_id: Uuid) -> Result<Self> {
        let run_dir = base_dir.join(run_id.to_string());
        let output_dir = run_dir.join("phases");

        fs::create_dir_all(&output_dir)
            .await
            .with_context(|| format!("Failed to create run directory: {}", output_dir.display()))?;

        let events_path = run_dir.join("events.jsonl");

        Ok(Self {
            run_dir,
            events_path,
            output_dir,
        })
    }

    /// Get the base directory for all runs (~/.egsa-deploy/runs or $EGSA_DEPLOY_HOME/runs)
    pub fn base_directory() -> Result<PathBuf> {
        crate::config::runs_dir()
    }

    /// Get the path to the events file
    pub fn events_path(&self) -> &Path {
        &self.events_path
    }

    /// Get the run directory
    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    fn output_path(&self, phase: Phase) -> PathBuf {
        self.output_dir.join(format!("{}.log", phase.as_str()))
    }

    /// Store the (redacted) output captured during a phase
    pub async fn store_phase_output(&self, phase: Phase, content: &str) -> Result<PathBuf> {
        let path = self.output_path(phase);

        fs::write(&path, content)
            .await
            .with_context(|| format!("Failed to write phase output: {}", path.display()))?;

        Ok(path)
    }

    /// Load the output captured during a phase
    pub async fn load_phase_output(&self, phase: Phase) -> Result<Option<String>> {
        let path = self.output_path(phase);

        if !path.exists() {
            return Ok(None);
        }

        let content = fs::read_to_string(&path)
            .await
            .with_context(|| format!("Failed to read phase output: {}", path.display()))?;

        Ok(Some(content))
    }

    /// Phases that have captured output, in pipeline order
    pub async fn phases_with_output(&self) -> Result<Vec<Phase>> {
        let mut phases = Vec::new();
        for phase in Phase::ALL {
            if fs::try_exists(self.output_path(phase)).await.unwrap_or(false) {
                phases.push(phase);
            }
        }
        Ok(phases)
    }

    /// Append an event to the log
    pub async fn append(&self, event: &Event) -> Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.events_path)
            .await
            .with_context(|| {
                format!(
                    "Failed to open events file: {}",
                    self.events_path.display()
                )
            })?;

        let json = serde_json::to_string(event).context("Failed to serialize event")?;
        file.write_all(format!("{}\n", json).as_bytes())
            .await
            .context("Failed to write event")?;
        file.flush().await.context("Failed to flush event")?;

        Ok(())
    }

    /// Replay all events in order
    pub async fn replay(&self) -> Result<Vec<Event>> {
        if !self.events_path.exists() {
            return Ok(Vec::new());
        }

        let file = File::open(&self.events_path)
            .await
            .with_context(|| format!("Failed to open events file: {}", self.events_path.display()))?;

        let reader = BufReader::new(file);
        let mut lines = reader.lines();
        let mut events = Vec::new();

        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            let event: Event = serde_json::from_str(&line)
                .with_context(|| format!("Failed to parse event: {}", line))?;
            events.push(event);
        }

        Ok(events)
    }

    /// Rebuild the run from its log (None if nothing was recorded)
    pub async fn load_run(&self) -> Result<Option<DeploymentRun>> {
        let events = self.replay().await?;
        Ok(DeploymentRun::from_events(&events).map(|mut run| {
            run.log_path = Some(self.events_path.clone());
            run
        }))
    }

    /// Get the last event of a specific type
    pub async fn last_event_of_type(&self, event_type: EventType) -> Result<Option<Event>> {
        let events = self.replay().await?;
        Ok(events.into_iter().rev().find(|e| e.event_type == event_type))
    }

    /// Rebuild an existing run under a runs directory
    pub async fn load_run_in(base_dir: &Path, run_id: Uuid) -> Result<DeploymentRun> {
        if !base_dir.join(run_id.to_string()).is_dir() {
            anyhow::bail!("Run {} not found", run_id);
        }
        let store = Self::open_in(base_dir, run_id).await?;
        store
            .load_run()
            .await?
            .with_context(|| format!("Run {} has no events", run_id))
    }

    /// Most recent runs first, skipping unreadable ones
    pub async fn recent_runs_in(base_dir: &Path, limit: usize) -> Result<Vec<DeploymentRun>> {
        let mut runs = Vec::new();

        for run_id in Self::list_runs_in(base_dir).await? {
            match Self::load_run_in(base_dir, run_id).await {
                Ok(run) => runs.push(run),
                Err(e) => tracing::debug!(%run_id, error = %e, "Skipping unreadable run"),
            }
        }

        runs.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        runs.truncate(limit);

        Ok(runs)
    }

    /// List all run IDs in the base directory
    pub async fn list_runs() -> Result<Vec<Uuid>> {
        let base_dir = Self::base_directory()?;
        Self::list_runs_in(&base_dir).await
    }

    /// List all run IDs under an explicit runs directory
    pub async fn list_runs_in(base_dir: &Path) -> Result<Vec<Uuid>> {
        if !base_dir.exists() {
            return Ok(Vec::new());
        }

        let mut runs = Vec::new();
        let mut entries = fs::read_dir(base_dir)
            .await
            .with_context(|| format!("Failed to read runs directory: {}", base_dir.display()))?;

        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_dir() {
                if let Some(name) = entry.file_name().to_str() {
                    if let Ok(uuid) = Uuid::parse_str(name) {
                        runs.push(uuid);
                    }
                }
            }
        }

        Ok(runs)
    }
}

/// Generate an idempotency key for a phase: `{run_id}:{phase}:{hash16(commit)}`
pub fn generate_idempotency_key(run_id: Uuid, phase: Phase, commit: &str) -> String {
    format!("{}:{}:{}", run_id, phase.as_str(), hash_input(commit))
}

/// Hash input content (first 16 chars of SHA256)
pub fn hash_input(input: &str) -> String {
    let digest = Sha256::digest(input.as_bytes());
    hex::encode(&digest[..8])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::PhaseStatus;
    use tempfile::TempDir;

    async fn create_test_store() -> (EventStore, Uuid, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let run_id = Uuid::new_v4();
        let store = EventStore::open_in(temp_dir.path(), run_id).await.unwrap();
        (store, run_id, temp_dir)
    }

    fn phase_event(run_id: Uuid, phase: Phase, event_type: EventType, status: PhaseStatus) -> Event {
        Event::new(
            run_id,
            Some(phase),
            event_type,
            generate_idempotency_key(run_id, phase, "abc123"),
            format!("{} {:?}", phase, event_type),
            status,
        )
    }

    #[tokio::test]
    async fn test_event_append_and_replay() {
        let (store, run_id, _temp) = create_test_store().await;

        let started = Event::new(
            run_id,
            None,
            EventType::RunStarted,
            format!("{}:start", run_id),
            "Run started".to_string(),
            PhaseStatus::Running,
        );
        store.append(&started).await.unwrap();
        store
            .append(&phase_event(run_id, Phase::TestGate, EventType::PhaseStarted, PhaseStatus::Running))
            .await
            .unwrap();

        let events = store.replay().await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event_type, EventType::RunStarted);
        assert_eq!(events[1].phase, Some(Phase::TestGate));
    }

    #[tokio::test]
    async fn test_phase_output_roundtrip() {
        let (store, _run_id, _temp) = create_test_store().await;

        assert!(store.load_phase_output(Phase::RemoteSync).await.unwrap().is_none());

        store
            .store_phase_output(Phase::RemoteSync, "port 8000 is free\n")
            .await
            .unwrap();

        assert_eq!(
            store.load_phase_output(Phase::RemoteSync).await.unwrap().as_deref(),
            Some("port 8000 is free\n")
        );
        assert_eq!(store.phases_with_output().await.unwrap(), vec![Phase::RemoteSync]);
    }

    #[tokio::test]
    async fn test_list_runs_ignores_stray_entries() {
        let temp_dir = TempDir::new().unwrap();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        EventStore::open_in(temp_dir.path(), a).await.unwrap();
        EventStore::open_in(temp_dir.path(), b).await.unwrap();
        std::fs::create_dir(temp_dir.path().join("not-a-run")).unwrap();
        std::fs::write(temp_dir.path().join("deploy.lock"), "").unwrap();

        let mut runs = EventStore::list_runs_in(temp_dir.path()).await.unwrap();
        runs.sort();
        let mut expected = vec![a, b];
        expected.sort();
        assert_eq!(runs, expected);
    }

    #[tokio::test]
    async fn test_load_run_in_unknown_run() {
        let temp_dir = TempDir::new().unwrap();
        let missing = Uuid::new_v4();

        let err = EventStore::load_run_in(temp_dir.path(), missing).await.unwrap_err();
        assert!(err.to_string().contains("not found"));
        // Looking a run up must not create it
        assert!(!temp_dir.path().join(missing.to_string()).exists());
    }

    #[test]
    fn test_idempotency_key_format() {
        let run_id = Uuid::parse_str("550e8400-e29b-41d4-a716-446655440000").unwrap();
        let key = generate_idempotency_key(run_id, Phase::RemoteSync, "abc123");

        assert!(key.starts_with("550e8400-e29b-41d4-a716-446655440000:remote_sync:"));

        let parts: Vec<&str> = key.split(':').collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[2].len(), 16);
    }

    #[test]
    fn test_input_hash_consistency() {
        assert_eq!(hash_input("abc123"), hash_input("abc123"));
        assert_ne!(hash_input("abc123"), hash_input("def456"));
        assert_eq!(hash_input("abc123").len(), 16);
    }
}
