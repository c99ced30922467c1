//! REST API route handlers.
//!
//! Request bodies use camelCase; domain records are returned as the
//! pipeline stores them.

use std::sync::Arc;

use axum::Json;
use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use gatehouse_hitl::DryRunReport;
use gatehouse_intent::ContextMap;
use gatehouse_kernel::{
    ApprovalTier, DecisionAction, DecisionEdit, Priority, RequestContext, RequestPayload,
};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

type Shared = State<Arc<AppState>>;

/// Turn an optional JSON value into a context map.  Anything but an object
/// (or null) is malformed.
fn context_map(value: Option<Value>) -> ApiResult<ContextMap> {
    match value {
        None | Some(Value::Null) => Ok(ContextMap::new()),
        Some(Value::Object(map)) => Ok(map.into_iter().collect()),
        Some(other) => Err(ApiError::bad_request(format!(
            "context must be an object, got {}",
            json_kind(&other)
        ))),
    }
}

fn json_kind(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

// ---------------------------------------------------------------------------
// POST /requests
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitBody {
    pub text: String,
    #[serde(default)]
    pub context: Option<Value>,
    #[serde(default)]
    pub priority: Option<String>,
    #[serde(default)]
    pub channel: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Accepted {
    pub request_id: String,
    pub status: &'static str,
    /// Milliseconds, from the observed mean cascade latency.
    pub estimated_processing_time: u64,
}

pub async fn submit_request(
    State(state): Shared,
    body: Result<Json<SubmitBody>, JsonRejection>,
) -> ApiResult<impl IntoResponse> {
    let Json(body) = body?;

    let priority = match body.priority.as_deref() {
        None => Priority::default(),
        Some(raw) => raw
            .parse::<Priority>()
            .map_err(|e| ApiError::bad_request(e.to_string()))?,
    };
    let mut payload = RequestPayload::new(body.text);
    payload.context = context_map(body.context)?;
    payload.priority = priority;
    if let Some(channel) = body.channel.filter(|c| !c.trim().is_empty()) {
        payload.channel = channel;
    }

    let ctx = state.pipeline.submit(payload).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(Accepted {
            request_id: ctx.request_id,
            status: "accepted",
            estimated_processing_time: estimate_ms(&state),
        }),
    ))
}

fn estimate_ms(state: &AppState) -> u64 {
    let stats = state.pipeline.stats();
    let micros: f64 = stats.layers.values().map(|l| l.mean_latency_us).sum();
    ((micros / 1000.0).ceil() as u64).max(1)
}

// ---------------------------------------------------------------------------
// GET /requests/{id}, POST /requests/{id}/cancel
// ---------------------------------------------------------------------------

pub async fn get_request(
    State(state): Shared,
    Path(id): Path<String>,
) -> ApiResult<Json<RequestContext>> {
    Ok(Json(state.pipeline.get_request(&id).await?))
}

#[derive(Debug, Default, Deserialize)]
pub struct CancelBody {
    #[serde(default)]
    pub actor: Option<String>,
}

pub async fn cancel_request(
    State(state): Shared,
    Path(id): Path<String>,
    body: Option<Json<CancelBody>>,
) -> ApiResult<Json<RequestContext>> {
    let actor = body
        .and_then(|Json(b)| b.actor)
        .filter(|a| !a.trim().is_empty())
        .unwrap_or_else(|| "api".to_string());
    Ok(Json(state.pipeline.cancel(&id, &actor).await?))
}

// ---------------------------------------------------------------------------
// GET /approvals?tier=
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct ApprovalQuery {
    pub tier: Option<String>,
}

pub async fn list_approvals(
    State(state): Shared,
    query: Result<Query<ApprovalQuery>, QueryRejection>,
) -> ApiResult<Json<Value>> {
    let Query(query) = query?;
    let tier = match query.tier.as_deref().map(str::trim) {
        None | Some("") => None,
        Some(raw) => Some(
            raw.parse::<ApprovalTier>()
                .map_err(|e| ApiError::bad_request(e.to_string()))?,
        ),
    };
    let approvals = state.pipeline.list_pending(tier).await?;
    Ok(Json(json!({
        "count": approvals.len(),
        "approvals": approvals,
    })))
}

// ---------------------------------------------------------------------------
// POST /approvals/{id}/decision
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct DecisionBody {
    pub action: String,
    pub actor: String,
    #[serde(default)]
    pub comment: Option<String>,
    #[serde(default)]
    pub edit: Option<DecisionEdit>,
}

pub async fn submit_decision(
    State(state): Shared,
    Path(id): Path<String>,
    body: Result<Json<DecisionBody>, JsonRejection>,
) -> ApiResult<impl IntoResponse> {
    let Json(body) = body?;
    let action = body
        .action
        .parse::<DecisionAction>()
        .map_err(|e| ApiError::bad_request(e.to_string()))?;
    let outcome = state
        .pipeline
        .decide(&id, action, &body.actor, body.comment, body.edit)
        .await?;
    Ok(Json(outcome))
}

// ---------------------------------------------------------------------------
// POST /routing/test
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct RoutingTestBody {
    pub text: String,
    #[serde(default)]
    pub context: Option<Value>,
}

pub async fn routing_test(
    State(state): Shared,
    body: Result<Json<RoutingTestBody>, JsonRejection>,
) -> ApiResult<Json<DryRunReport>> {
    let Json(body) = body?;
    let context = context_map(body.context)?;
    Ok(Json(state.pipeline.dry_run(&body.text, &context).await?))
}

// ---------------------------------------------------------------------------
// GET /stats
// ---------------------------------------------------------------------------

pub async fn stats(State(state): Shared) -> ApiResult<Json<Value>> {
    let pending = state.pipeline.list_pending(None).await?.len();
    Ok(Json(json!({
        "routing": state.pipeline.stats(),
        "pendingApprovals": pending,
        "uptimeSeconds": state.started_at.elapsed().as_secs(),
    })))
}

// ---------------------------------------------------------------------------
// GET /health
// ---------------------------------------------------------------------------

pub async fn health(State(state): Shared) -> impl IntoResponse {
    let database = match state.pipeline.states().repository().ping().await {
        Ok(()) => true,
        Err(e) => {
            tracing::warn!(error = %e, "database health check failed");
            false
        }
    };
    let status = if database {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        status,
        Json(json!({
            "status": if database { "ok" } else { "degraded" },
            "database": database,
            "version": env!("CARGO_PKG_VERSION"),
        })),
    )
}
