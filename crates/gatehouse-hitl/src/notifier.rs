//! Approver notification channels.
//!
//! Notifications are best-effort.  The controller spawns them and only logs
//! a failure; an approval is valid whether or not anyone was told about it.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use gatehouse_kernel::ApprovalRequest;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::error::{HitlError, Result};

const WEBHOOK_TIMEOUT_SECS: u64 = 10;

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, approval: &ApprovalRequest) -> Result<()>;

    fn name(&self) -> &str;
}

/// Writes the approval to the log.  The default when no channel is
/// configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, approval: &ApprovalRequest) -> Result<()> {
        info!(
            approval_id = %approval.approval_id,
            request_id = %approval.request_id,
            tier = %approval.tier,
            risk = %approval.risk.level,
            score = approval.risk.score,
            expires_at = %approval.expires_at,
            summary = %approval.decision.summary(),
            "approval required"
        );
        Ok(())
    }

    fn name(&self) -> &str {
        "log"
    }
}

/// POSTs a JSON summary of the approval to a fixed URL.
pub struct WebhookNotifier {
    url: String,
    http: reqwest::Client,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>) -> Self {
        let http = reqwest::Client::builder()
            .user_agent("Gatehouse/0.1")
            .timeout(Duration::from_secs(WEBHOOK_TIMEOUT_SECS))
            .build()
            .unwrap_or_default();
        Self {
            url: url.into(),
            http,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, approval: &ApprovalRequest) -> Result<()> {
        let body = json!({
            "approvalId": approval.approval_id,
            "requestId": approval.request_id,
            "tier": approval.tier,
            "riskLevel": approval.risk.level,
            "riskScore": approval.risk.score,
            "intent": approval.decision.intent,
            "subIntent": approval.decision.sub_intent,
            "workflowType": approval.decision.workflow_type,
            "text": approval.decision.text,
            "expiresAt": approval.expires_at,
            "escalationCount": approval.escalation_count,
        });

        debug!(url = %self.url, approval_id = %approval.approval_id, "posting approval webhook");
        let response = self
            .http
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .map_err(|e| HitlError::Notify {
                reason: format!("webhook request failed: {e}"),
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(HitlError::Notify {
                reason: format!("webhook returned {status}"),
            });
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "webhook"
    }
}

/// Sends to every inner notifier concurrently.  Succeeds if at least one
/// channel accepted the notification.
pub struct FanoutNotifier {
    channels: Vec<Arc<dyn Notifier>>,
}

impl FanoutNotifier {
    pub fn new(channels: Vec<Arc<dyn Notifier>>) -> Self {
        Self { channels }
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }
}

#[async_trait]
impl Notifier for FanoutNotifier {
    async fn notify(&self, approval: &ApprovalRequest) -> Result<()> {
        if self.channels.is_empty() {
            return Ok(());
        }
        let results =
            futures::future::join_all(self.channels.iter().map(|c| c.notify(approval))).await;

        let mut failures = Vec::new();
        for (channel, result) in self.channels.iter().zip(results) {
            if let Err(e) = result {
                warn!(channel = channel.name(), error = %e, "notification channel failed");
                failures.push(format!("{}: {e}", channel.name()));
            }
        }
        if failures.len() == self.channels.len() {
            return Err(HitlError::Notify {
                reason: failures.join("; "),
            });
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "fanout"
    }
}
