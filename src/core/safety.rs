//! Safety limits and enforcement for deployment runs.
//!
//! Bounds a run through configurable limits on:
//! - Per-phase and whole-run timeouts
//! - Captured output size
//! - Secret leakage (values of secret-looking keys are redacted from
//!   everything that is logged or stored)

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use glob::Pattern;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::{EnvironmentSnapshot, Phase};

const REDACTED: &str = "[REDACTED]";

/// Safety limits for a deployment pipeline
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SafetyLimits {
    /// Default timeout for each phase in seconds (default: 600 = 10 min)
    #[serde(default = "default_phase_timeout")]
    pub phase_timeout_seconds: u64,

    /// Per-phase overrides of `phase_timeout_seconds`
    #[serde(default)]
    pub phase_timeouts: BTreeMap<Phase, u64>,

    /// Total run timeout in seconds (default: 3600 = 1 hour)
    #[serde(default = "default_run_timeout")]
    pub run_timeout_seconds: u64,

    /// Captured output kept per phase, in bytes (default: 1MB)
    #[serde(default = "default_max_output_bytes")]
    pub max_output_bytes: u64,

    /// Glob patterns over environment keys whose values are secret
    #[serde(default = "default_secret_patterns")]
    pub secret_patterns: Vec<String>,
}

fn default_phase_timeout() -> u64 {
    600
} // 10 min
fn default_run_timeout() -> u64 {
    3600
} // 1 hour
fn default_max_output_bytes() -> u64 {
    1024 * 1024
} // 1MB

fn default_secret_patterns() -> Vec<String> {
    vec![
        "*SECRET*".to_string(),
        "*PASSWORD*".to_string(),
        "*ACCESS_KEY*".to_string(),
        "*TOKEN*".to_string(),
    ]
}

impl Default for SafetyLimits {
    fn default() -> Self {
        Self {
            phase_timeout_seconds: default_phase_timeout(),
            phase_timeouts: BTreeMap::new(),
            run_timeout_seconds: default_run_timeout(),
            max_output_bytes: default_max_output_bytes(),
            secret_patterns: default_secret_patterns(),
        }
    }
}

impl SafetyLimits {
    /// Effective timeout for a phase
    pub fn phase_timeout(&self, phase: Phase) -> Duration {
        let seconds = self
            .phase_timeouts
            .get(&phase)
            .copied()
            .unwrap_or(self.phase_timeout_seconds);
        Duration::from_secs(seconds)
    }

    /// Check if an environment key holds a secret
    pub fn is_secret_key(&self, key: &str) -> bool {
        self.secret_patterns
            .iter()
            .filter_map(|p| Pattern::new(p).ok())
            .any(|pattern| pattern.matches(key))
    }

    /// Build a redactor for the secret values of a snapshot
    pub fn redactor(&self, env: &EnvironmentSnapshot) -> Redactor {
        Redactor::new(env.secret_values(|k| self.is_secret_key(k)))
    }

    /// Trim captured output to `max_output_bytes`, keeping the tail
    pub fn clamp_output(&self, output: &str) -> String {
        let limit = self.max_output_bytes as usize;
        if output.len() <= limit {
            return output.to_string();
        }
        let mut start = output.len() - limit;
        while !output.is_char_boundary(start) {
            start += 1;
        }
        format!("[... {} bytes truncated]\n{}", start, &output[start..])
    }

    /// Check current tracker state against limits
    pub fn check(&self, tracker: &SafetyTracker) -> Result<(), SafetyViolation> {
        let elapsed = tracker.started_at.elapsed().as_secs();
        if elapsed >= self.run_timeout_seconds {
            return Err(SafetyViolation::RunTimeout {
                elapsed_seconds: elapsed,
                limit_seconds: self.run_timeout_seconds,
            });
        }

        Ok(())
    }
}

/// Replaces known secret values in text
#[derive(Debug, Clone, Default)]
pub struct Redactor {
    secrets: Vec<String>,
}

impl Redactor {
    pub fn new<S: AsRef<str>>(secrets: impl IntoIterator<Item = S>) -> Self {
        let mut secrets: Vec<String> = secrets
            .into_iter()
            .map(|s| s.as_ref().to_string())
            .filter(|s| !s.is_empty())
            .collect();
        // Longest first so a secret containing another is masked whole
        secrets.sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));
        secrets.dedup();
        Self { secrets }
    }

    pub fn redact(&self, text: &str) -> String {
        let mut out = text.to_string();
        for secret in &self.secrets {
            if out.contains(secret.as_str()) {
                out = out.replace(secret.as_str(), REDACTED);
            }
        }
        out
    }
}

/// Tracks the run clock against the run timeout
#[derive(Debug, Clone)]
pub struct SafetyTracker {
    /// When the run started
    pub started_at: Instant,
}

impl Default for SafetyTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl SafetyTracker {
    /// Create a new tracker
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
        }
    }

    /// Get elapsed time in seconds
    pub fn elapsed_seconds(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }
}

/// Safety violation errors
#[derive(Debug, Clone, Error)]
pub enum SafetyViolation {
    #[error("Phase timeout: {phase} exceeded {limit_seconds}s")]
    PhaseTimeout { phase: Phase, limit_seconds: u64 },

    #[error("Run timeout: {elapsed_seconds}s >= {limit_seconds}s")]
    RunTimeout {
        elapsed_seconds: u64,
        limit_seconds: u64,
    },
}
