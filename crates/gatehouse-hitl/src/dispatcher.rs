//! Hand-off to the workflow engine.
//!
//! Gatehouse does not run workflows.  A [`WorkflowDispatcher`] receives the
//! final (possibly edited) decision and returns the engine's instance id,
//! which is stored on the request context.

use std::time::Duration;

use async_trait::async_trait;
use gatehouse_kernel::RoutingDecision;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info};

use crate::error::{HitlError, Result};

const DISPATCH_TIMEOUT_SECS: u64 = 30;

#[async_trait]
pub trait WorkflowDispatcher: Send + Sync {
    /// Returns the workflow instance id.
    async fn dispatch(&self, decision: &RoutingDecision) -> Result<String>;
}

/// Accepts everything and logs it.  Instance ids are fresh UUIDs.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingDispatcher;

#[async_trait]
impl WorkflowDispatcher for LoggingDispatcher {
    async fn dispatch(&self, decision: &RoutingDecision) -> Result<String> {
        let instance_id = format!("wf-{}", uuid::Uuid::now_v7());
        info!(
            request_id = %decision.request_id,
            workflow = %decision.workflow_type,
            summary = %decision.summary(),
            instance_id = %instance_id,
            "workflow dispatched"
        );
        Ok(instance_id)
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DispatchResponse {
    #[serde(alias = "instance_id", alias = "id")]
    instance_id: String,
}

/// POSTs the decision to a workflow engine endpoint.
///
/// The engine must answer 2xx with `{"instanceId": "..."}`.
pub struct HttpDispatcher {
    url: String,
    http: reqwest::Client,
}

impl HttpDispatcher {
    pub fn new(url: impl Into<String>) -> Self {
        let http = reqwest::Client::builder()
            .user_agent("Gatehouse/0.1")
            .timeout(Duration::from_secs(DISPATCH_TIMEOUT_SECS))
            .build()
            .unwrap_or_default();
        Self {
            url: url.into(),
            http,
        }
    }
}

#[async_trait]
impl WorkflowDispatcher for HttpDispatcher {
    async fn dispatch(&self, decision: &RoutingDecision) -> Result<String> {
        let body = json!({
            "requestId": decision.request_id,
            "workflowType": decision.workflow_type,
            "intent": decision.intent,
            "subIntent": decision.sub_intent,
            "text": decision.text,
            "confidence": decision.confidence,
            "layer": decision.layer,
            "metadata": decision.metadata,
        });

        debug!(url = %self.url, request_id = %decision.request_id, "dispatching workflow");
        let response = self
            .http
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .map_err(|e| HitlError::Dispatch {
                reason: format!("request failed: {e}"),
            })?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(HitlError::Dispatch {
                reason: format!("engine returned {status}: {text}"),
            });
        }

        let parsed: DispatchResponse = response.json().await.map_err(|e| HitlError::Dispatch {
            reason: format!("malformed engine response: {e}"),
        })?;
        Ok(parsed.instance_id)
    }
}
