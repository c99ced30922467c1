//! Risk levels, approval tiers and the assessment record.
//!
//! The scoring function itself lives in `gatehouse-hitl`; these are the
//! values it produces and that the approval records snapshot.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::KernelError;

/// Discretized risk level.  Ordered from least to most dangerous.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

impl FromStr for RiskLevel {
    type Err = KernelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            "critical" => Ok(Self::Critical),
            other => Err(KernelError::UnknownValue {
                kind: "risk level",
                value: other.to_string(),
            }),
        }
    }
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Who must sign off on a request.  Ordered by authority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalTier {
    /// No approval needed.
    None,
    /// The requester confirms their own action.
    #[serde(rename = "self")]
    SelfService,
    Manager,
    Security,
    Executive,
}

impl ApprovalTier {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::SelfService => "self",
            Self::Manager => "manager",
            Self::Security => "security",
            Self::Executive => "executive",
        }
    }

    /// The tier an escalation moves to, or `None` at the top of the chain.
    pub fn next(self) -> Option<Self> {
        match self {
            Self::None => Some(Self::SelfService),
            Self::SelfService => Some(Self::Manager),
            Self::Manager => Some(Self::Security),
            Self::Security => Some(Self::Executive),
            Self::Executive => None,
        }
    }
}

impl FromStr for ApprovalTier {
    type Err = KernelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" => Ok(Self::None),
            "self" => Ok(Self::SelfService),
            "manager" => Ok(Self::Manager),
            "security" => Ok(Self::Security),
            "executive" => Ok(Self::Executive),
            other => Err(KernelError::UnknownValue {
                kind: "approval tier",
                value: other.to_string(),
            }),
        }
    }
}

impl fmt::Display for ApprovalTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One factor's share of the final score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FactorContribution {
    /// Factor name (`action_type`, `impact_scope`, ...).
    pub factor: String,
    /// The resolved value (`delete`, `multi_system`, `true`, ...).
    pub value: String,
    /// Whether the value came from the request context or a default.
    pub from_context: bool,
    pub weight: f64,
    /// Factor score in [0, 1] before weighting.
    pub score: f64,
    /// `weight * score`.
    pub contribution: f64,
}

/// Deterministic output of the risk assessor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskAssessment {
    pub level: RiskLevel,
    /// Weighted score in [0, 1].
    pub score: f64,
    pub requires_approval: bool,
    pub tier: ApprovalTier,
    pub factors: Vec<FactorContribution>,
}
