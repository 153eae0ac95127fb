//! Liveness probe against the application port.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::debug;

use crate::core::pipeline::ProbePolicy;

/// Result of one probe request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// The application answered with a status below 400
    Healthy { status: u16 },

    /// The application answered, but with an error status
    Unhealthy { status: u16 },

    /// No HTTP response at all (refused, timed out, reset)
    Unreachable { error: String },
}

impl ProbeOutcome {
    pub fn is_healthy(&self) -> bool {
        matches!(self, ProbeOutcome::Healthy { .. })
    }

    pub fn describe(&self) -> String {
        match self {
            ProbeOutcome::Healthy { status } => format!("HTTP {}", status),
            ProbeOutcome::Unhealthy { status } => format!("HTTP {}", status),
            ProbeOutcome::Unreachable { error } => format!("unreachable: {}", error),
        }
    }
}

/// Trait for liveness probes
#[async_trait]
pub trait Probe: Send + Sync {
    async fn check(&self, url: &str) -> ProbeOutcome;
}

/// HTTP GET probe
pub struct HttpProbe {
    client: reqwest::Client,
}

impl HttpProbe {
    pub fn new(request_timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Probe for HttpProbe {
    async fn check(&self, url: &str) -> ProbeOutcome {
        match self.client.get(url).send().await {
            Ok(response) => {
                let status = response.status().as_u16();
                if status < 400 {
                    ProbeOutcome::Healthy { status }
                } else {
                    ProbeOutcome::Unhealthy { status }
                }
            }
            Err(e) => ProbeOutcome::Unreachable {
                error: e.to_string(),
            },
        }
    }
}

/// Final result of a polling loop
#[derive(Debug, Clone)]
pub struct PollResult {
    pub outcome: ProbeOutcome,
    pub attempts: u32,
}

/// Poll until healthy or the policy runs out of attempts.
///
/// Waits `delay_for_attempt(n)` before request `n`, so the application gets
/// the initial delay to bind its port.
pub async fn poll(probe: &dyn Probe, url: &str, policy: &ProbePolicy) -> PollResult {
    let mut attempt = 1;
    loop {
        tokio::time::sleep(policy.delay_for_attempt(attempt)).await;

        let outcome = probe.check(url).await;
        debug!(url, attempt, outcome = %outcome.describe(), "Probe request");

        if outcome.is_healthy() || !policy.should_poll_again(attempt) {
            return PollResult {
                outcome,
                attempts: attempt,
            };
        }
        attempt += 1;
    }
}
