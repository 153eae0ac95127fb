//! Outcome notifications.
//!
//! Failed runs go to the critical topic, successful ones to the general
//! topic. A notifier error is reported to the caller, which only logs it.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{error, info};
use uuid::Uuid;

use crate::core::pipeline::NotifySpec;
use crate::domain::{DeploymentRun, FailureKind, Outcome, Phase, RunState};

/// Notification channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Topic {
    /// Failed deployments
    Critical,
    /// Successful deployments
    General,
}

/// Outcome report for one finished run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub run_id: Uuid,
    pub pipeline: String,
    pub host: String,
    pub commit: String,
    pub branch: String,
    pub outcome: Outcome,
    pub topic: Topic,

    /// Topic identifier from the pipeline (e.g. an SNS ARN)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub topic_id: Option<String>,

    /// Address copied on the report
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_phase: Option<Phase>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_kind: Option<FailureKind>,

    pub subject: String,
    pub message: String,
}

impl Notification {
    /// Build the report for a run in a terminal state
    pub fn for_run(run: &DeploymentRun, spec: Option<&NotifySpec>) -> Option<Self> {
        let outcome = run.outcome()?;
        let short = run.trigger.short_commit();

        let (topic, failed_phase, failure_kind, subject, message) = match &run.state {
            RunState::Failed { phase, kind, error } => (
                Topic::Critical,
                Some(*phase),
                Some(*kind),
                format!("Deployment FAILED: {} at {}", run.pipeline_name, phase),
                format!(
                    "Commit {} on {} failed during {} ({}): {}",
                    short, run.host, phase, kind, error
                ),
            ),
            _ => {
                let process = run
                    .process
                    .as_ref()
                    .map(|p| format!(" (pid {}, port {})", p.pid, p.port))
                    .unwrap_or_default();
                (
                    Topic::General,
                    None,
                    None,
                    format!("Deployment succeeded: {} @ {}", run.pipeline_name, short),
                    format!("Commit {} is live on {}{}", short, run.host, process),
                )
            }
        };

        let topic_id = spec.and_then(|s| match topic {
            Topic::Critical => s.critical_topic.clone(),
            Topic::General => s.general_topic.clone(),
        });

        Some(Self {
            run_id: run.id,
            pipeline: run.pipeline_name.clone(),
            host: run.host.clone(),
            commit: run.trigger.commit.clone(),
            branch: run.trigger.branch.clone(),
            outcome,
            topic,
            topic_id,
            email: spec.and_then(|s| s.email.clone()),
            failed_phase,
            failure_kind,
            subject,
            message,
        })
    }
}

/// Trait for outcome reporters
#[async_trait]
pub trait Notifier: Send + Sync {
    fn name(&self) -> &str;

    async fn notify(&self, notification: &Notification) -> Result<()>;
}

/// Writes notifications to the log only
#[derive(Debug, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    fn name(&self) -> &str {
        "log"
    }

    async fn notify(&self, n: &Notification) -> Result<()> {
        match n.topic {
            Topic::Critical => error!(
                run_id = %n.run_id,
                commit = %n.commit,
                subject = %n.subject,
                "{}",
                n.message
            ),
            Topic::General => info!(
                run_id = %n.run_id,
                commit = %n.commit,
                subject = %n.subject,
                "{}",
                n.message
            ),
        }
        Ok(())
    }
}

/// Posts notifications as JSON to a webhook
pub struct WebhookNotifier {
    url: String,
    client: reqwest::Client,
}

/// Upper bound on one webhook request, connect included
pub const DEFAULT_WEBHOOK_TIMEOUT: Duration = Duration::from_secs(10);

impl WebhookNotifier {
    pub fn new(url: impl Into<String>) -> Result<Self> {
        Self::with_timeout(url, DEFAULT_WEBHOOK_TIMEOUT)
    }

    pub fn with_timeout(url: impl Into<String>, request_timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            url: url.into(),
            client,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    fn name(&self) -> &str {
        "webhook"
    }

    async fn notify(&self, notification: &Notification) -> Result<()> {
        let response = self
            .client
            .post(&self.url)
            .json(notification)
            .send()
            .await
            .context("Failed to send notification webhook")?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            anyhow::bail!("Webhook error ({}): {}", status, text);
        }

        Ok(())
    }
}
