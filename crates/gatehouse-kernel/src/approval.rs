//! Approval records.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::KernelError;
use crate::intent::RoutingDecision;
use crate::risk::{ApprovalTier, RiskAssessment};

/// Lifecycle of a single approval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Rejected,
    Edited,
    Expired,
    /// Superseded by a new approval at a higher tier.
    Escalated,
    /// The owning request was cancelled.
    Cancelled,
}

impl ApprovalStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::Edited => "edited",
            Self::Expired => "expired",
            Self::Escalated => "escalated",
            Self::Cancelled => "cancelled",
        }
    }

    /// Everything except `pending` is final.
    pub fn is_resolved(self) -> bool {
        !matches!(self, Self::Pending)
    }
}

impl FromStr for ApprovalStatus {
    type Err = KernelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "approved" => Ok(Self::Approved),
            "rejected" => Ok(Self::Rejected),
            "edited" => Ok(Self::Edited),
            "expired" => Ok(Self::Expired),
            "escalated" => Ok(Self::Escalated),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(KernelError::UnknownValue {
                kind: "approval status",
                value: other.to_string(),
            }),
        }
    }
}

impl fmt::Display for ApprovalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a reviewer can do with a pending approval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionAction {
    Approve,
    Reject,
    Edit,
    Escalate,
}

impl DecisionAction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Approve => "approve",
            Self::Reject => "reject",
            Self::Edit => "edit",
            Self::Escalate => "escalate",
        }
    }
}

impl FromStr for DecisionAction {
    type Err = KernelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "approve" => Ok(Self::Approve),
            "reject" => Ok(Self::Reject),
            "edit" => Ok(Self::Edit),
            "escalate" => Ok(Self::Escalate),
            other => Err(KernelError::UnknownValue {
                kind: "decision action",
                value: other.to_string(),
            }),
        }
    }
}

impl fmt::Display for DecisionAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Who resolved an approval, how and when.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionRecord {
    pub actor: String,
    pub action: DecisionAction,
    #[serde(default)]
    pub comment: Option<String>,
    pub decided_at: DateTime<Utc>,
}

/// A persisted request for human sign-off.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub approval_id: String,
    pub request_id: String,
    pub risk: RiskAssessment,
    pub decision: RoutingDecision,
    pub tier: ApprovalTier,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub status: ApprovalStatus,
    /// How many escalations preceded this approval.
    pub escalation_count: u32,
    /// Set on an escalated approval; points at its successor.
    #[serde(default)]
    pub escalated_to: Option<String>,
    #[serde(default)]
    pub resolution: Option<DecisionRecord>,
    /// Optimistic concurrency token, bumped on every write.
    pub version: i64,
}

impl ApprovalRequest {
    pub fn is_pending(&self) -> bool {
        self.status == ApprovalStatus::Pending
    }

    /// Pending but past its deadline.
    pub fn is_overdue(&self, now: DateTime<Utc>) -> bool {
        self.is_pending() && now >= self.expires_at
    }
}
