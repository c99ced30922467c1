//! The per-request state graph and the context record it governs.
//!
//! Every inbound request owns exactly one [`RequestContext`].  Its `state`
//! only ever moves along the edges returned by
//! [`RequestState::can_transition_to`]; each accepted move is appended to
//! `history` so the full path can be audited afterwards.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{KernelError, Result};
use crate::intent::RoutingDecision;
use crate::risk::RiskAssessment;

// ---------------------------------------------------------------------------
// RequestState
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestState {
    Received,
    Routing,
    RiskAssessing,
    AwaitingApproval,
    Approved,
    Rejected,
    Edited,
    Expired,
    Dispatching,
    Completed,
    Failed,
}

impl RequestState {
    pub const ALL: [RequestState; 11] = [
        RequestState::Received,
        RequestState::Routing,
        RequestState::RiskAssessing,
        RequestState::AwaitingApproval,
        RequestState::Approved,
        RequestState::Rejected,
        RequestState::Edited,
        RequestState::Expired,
        RequestState::Dispatching,
        RequestState::Completed,
        RequestState::Failed,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Received => "received",
            Self::Routing => "routing",
            Self::RiskAssessing => "risk_assessing",
            Self::AwaitingApproval => "awaiting_approval",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::Edited => "edited",
            Self::Expired => "expired",
            Self::Dispatching => "dispatching",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// Whether `self -> next` is an edge of the state graph.
    pub fn can_transition_to(self, next: RequestState) -> bool {
        use RequestState::*;
        matches!(
            (self, next),
            (Received, Routing | Failed)
                | (Routing, RiskAssessing | Failed)
                | (RiskAssessing, AwaitingApproval | Dispatching | Failed)
                | (AwaitingApproval, Approved | Rejected | Edited | Expired | Failed)
                | (Approved, Dispatching | Failed)
                | (Edited, Dispatching | Failed)
                | (Rejected, Failed)
                | (Expired, Failed)
                | (Dispatching, Completed | Failed)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// States from which a request may still be cancelled.
    pub fn is_pre_dispatch(self) -> bool {
        !matches!(self, Self::Dispatching | Self::Completed | Self::Failed)
    }
}

impl FromStr for RequestState {
    type Err = KernelError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|st| st.as_str() == s)
            .ok_or_else(|| KernelError::UnknownValue {
                kind: "request state",
                value: s.to_string(),
            })
    }
}

impl fmt::Display for RequestState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Payload
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Urgent,
}

impl Priority {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Normal => "normal",
            Self::High => "high",
            Self::Urgent => "urgent",
        }
    }
}

impl FromStr for Priority {
    type Err = KernelError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "low" => Ok(Self::Low),
            "normal" | "medium" => Ok(Self::Normal),
            "high" => Ok(Self::High),
            "urgent" | "critical" => Ok(Self::Urgent),
            other => Err(KernelError::UnknownValue {
                kind: "priority",
                value: other.to_string(),
            }),
        }
    }
}

/// What the caller originally submitted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestPayload {
    pub text: String,
    #[serde(default)]
    pub context: BTreeMap<String, Value>,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default = "default_channel")]
    pub channel: String,
}

fn default_channel() -> String {
    "api".into()
}

impl RequestPayload {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            context: BTreeMap::new(),
            priority: Priority::Normal,
            channel: default_channel(),
        }
    }
}

// ---------------------------------------------------------------------------
// RequestContext
// ---------------------------------------------------------------------------

/// One accepted edge of the state graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionRecord {
    pub from: RequestState,
    pub to: RequestState,
    pub reason: String,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestContext {
    pub request_id: String,
    pub state: RequestState,
    pub payload: RequestPayload,
    #[serde(default)]
    pub decision: Option<RoutingDecision>,
    #[serde(default)]
    pub edited_decision: Option<RoutingDecision>,
    #[serde(default)]
    pub risk: Option<RiskAssessment>,
    #[serde(default)]
    pub approval_id: Option<String>,
    #[serde(default)]
    pub workflow_instance_id: Option<String>,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub version: i64,
    #[serde(default)]
    pub history: Vec<TransitionRecord>,
}

impl RequestContext {
    pub fn new(request_id: impl Into<String>, payload: RequestPayload, now: DateTime<Utc>) -> Self {
        Self {
            request_id: request_id.into(),
            state: RequestState::Received,
            payload,
            decision: None,
            edited_decision: None,
            risk: None,
            approval_id: None,
            workflow_instance_id: None,
            result: None,
            error: None,
            created_at: now,
            updated_at: now,
            version: 0,
            history: Vec::new(),
        }
    }

    /// The decision that should be dispatched: the edited one if present.
    pub fn effective_decision(&self) -> Option<&RoutingDecision> {
        self.edited_decision.as_ref().or(self.decision.as_ref())
    }

    /// Move to `next`, recording the edge.  Does not touch `version`; the
    /// store bumps it when the write lands.
    pub fn advance(&mut self, next: RequestState, reason: &str, at: DateTime<Utc>) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(KernelError::IllegalTransition {
                request_id: self.request_id.clone(),
                from: self.state,
                to: next,
            });
        }
        self.history.push(TransitionRecord {
            from: self.state,
            to: next,
            reason: reason.to_string(),
            at,
        });
        self.state = next;
        self.updated_at = at;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
