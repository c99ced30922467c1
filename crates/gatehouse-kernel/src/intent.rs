//! Intent classification types shared by every routing layer.
//!
//! A request is classified into a closed [`IntentCategory`], a free-form
//! sub-intent and a [`WorkflowType`].  Each layer of the cascade produces a
//! layer-local [`ClassificationResult`]; the coordinator then freezes exactly
//! one [`RoutingDecision`] per request.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::KernelError;
use crate::risk::RiskLevel;

// ---------------------------------------------------------------------------
// Closed enumerations
// ---------------------------------------------------------------------------

/// Top-level category a request is classified into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntentCategory {
    /// Something is broken and needs restoring.
    Incident,
    /// A service request (access, password reset, provisioning).
    Request,
    /// A planned modification to a system.
    Change,
    /// An informational question.
    Query,
    /// Produced only by the fallback path; never accepted from a classifier.
    Unknown,
}

impl IntentCategory {
    /// Categories a classifier is allowed to emit.
    pub const CLASSIFIABLE: [IntentCategory; 4] = [
        IntentCategory::Incident,
        IntentCategory::Request,
        IntentCategory::Change,
        IntentCategory::Query,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Incident => "incident",
            Self::Request => "request",
            Self::Change => "change",
            Self::Query => "query",
            Self::Unknown => "unknown",
        }
    }
}

impl FromStr for IntentCategory {
    type Err = KernelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "incident" => Ok(Self::Incident),
            "request" => Ok(Self::Request),
            "change" => Ok(Self::Change),
            "query" => Ok(Self::Query),
            "unknown" => Ok(Self::Unknown),
            other => Err(KernelError::UnknownValue {
                kind: "intent category",
                value: other.to_string(),
            }),
        }
    }
}

impl fmt::Display for IntentCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The execution pattern the external dispatcher should use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowType {
    /// Single-step handler.
    Simple,
    /// Ordered chain of agents.
    Sequential,
    /// Fan-out to parallel agents.
    Concurrent,
    /// Multi-agent discussion.
    GroupChat,
    /// Agent-to-agent hand-off.
    Handoff,
    /// Manager-led dynamic planning.
    Magentic,
    /// No automation; a human picks the request up.
    HumanQueue,
}

impl WorkflowType {
    pub const ALL: [WorkflowType; 7] = [
        WorkflowType::Simple,
        WorkflowType::Sequential,
        WorkflowType::Concurrent,
        WorkflowType::GroupChat,
        WorkflowType::Handoff,
        WorkflowType::Magentic,
        WorkflowType::HumanQueue,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Simple => "simple",
            Self::Sequential => "sequential",
            Self::Concurrent => "concurrent",
            Self::GroupChat => "group_chat",
            Self::Handoff => "handoff",
            Self::Magentic => "magentic",
            Self::HumanQueue => "human_queue",
        }
    }
}

impl FromStr for WorkflowType {
    type Err = KernelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lowered = s.trim().to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|w| w.as_str() == lowered)
            .ok_or(KernelError::UnknownValue {
                kind: "workflow type",
                value: lowered,
            })
    }
}

impl fmt::Display for WorkflowType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which layer of the cascade produced a decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutingLayer {
    Pattern,
    Semantic,
    Llm,
    Fallback,
}

impl RoutingLayer {
    pub const ALL: [RoutingLayer; 4] = [
        RoutingLayer::Pattern,
        RoutingLayer::Semantic,
        RoutingLayer::Llm,
        RoutingLayer::Fallback,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pattern => "pattern",
            Self::Semantic => "semantic",
            Self::Llm => "llm",
            Self::Fallback => "fallback",
        }
    }
}

impl fmt::Display for RoutingLayer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Layer-local result
// ---------------------------------------------------------------------------

/// Raw evidence backing a layer's classification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Evidence {
    /// A pattern rule fired.
    Rule { rule_id: String, rule_name: String },
    /// A semantic route was the nearest neighbour.
    Similarity { route: String, similarity: f64 },
    /// The LLM explained its judgement.
    Rationale {
        reasoning: String,
        risk_hint: Option<RiskLevel>,
        requires_approval: bool,
    },
}

/// Output of a single classification layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassificationResult {
    pub matched: bool,
    pub intent: IntentCategory,
    pub sub_intent: String,
    pub workflow: WorkflowType,
    /// Confidence between 0.0 and 1.0.
    pub confidence: f64,
    pub layer: RoutingLayer,
    pub evidence: Evidence,
}

// ---------------------------------------------------------------------------
// Final decision
// ---------------------------------------------------------------------------

/// Reviewer corrections applied through an `edit` decision.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DecisionEdit {
    #[serde(default)]
    pub intent: Option<IntentCategory>,
    #[serde(default)]
    pub sub_intent: Option<String>,
    #[serde(default)]
    pub workflow_type: Option<WorkflowType>,
}

impl DecisionEdit {
    /// True when the edit would not change anything.
    pub fn is_empty(&self) -> bool {
        self.intent.is_none() && self.sub_intent.is_none() && self.workflow_type.is_none()
    }
}

/// The frozen outcome of the routing cascade for one request.
///
/// Never mutated after construction.  Human corrections go through
/// [`RoutingDecision::edited`], which returns a fresh value linked by
/// `request_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingDecision {
    pub request_id: String,
    pub text: String,
    pub timestamp: DateTime<Utc>,
    pub intent: IntentCategory,
    pub sub_intent: String,
    pub workflow_type: WorkflowType,
    pub confidence: f64,
    pub layer: RoutingLayer,
    /// Set by the fallback path and by LLM judgements that ask for review.
    pub requires_approval: bool,
    /// Sum of the per-layer latencies, in microseconds.
    pub latency_us: u64,
    #[serde(default)]
    pub metadata: BTreeMap<String, Value>,
}

impl RoutingDecision {
    /// Freeze a successful layer result into a decision.
    pub fn from_classification(
        request_id: impl Into<String>,
        text: impl Into<String>,
        result: &ClassificationResult,
        latency_us: u64,
        metadata: BTreeMap<String, Value>,
    ) -> Self {
        let requires_approval = matches!(
            result.evidence,
            Evidence::Rationale {
                requires_approval: true,
                ..
            }
        );
        Self {
            request_id: request_id.into(),
            text: text.into(),
            timestamp: Utc::now(),
            intent: result.intent,
            sub_intent: result.sub_intent.clone(),
            workflow_type: result.workflow,
            confidence: result.confidence,
            layer: result.layer,
            requires_approval,
            latency_us,
            metadata,
        }
    }

    /// The guaranteed non-null decision when every layer failed.
    pub fn fallback(
        request_id: impl Into<String>,
        text: impl Into<String>,
        latency_us: u64,
        metadata: BTreeMap<String, Value>,
    ) -> Self {
        Self {
            request_id: request_id.into(),
            text: text.into(),
            timestamp: Utc::now(),
            intent: IntentCategory::Unknown,
            sub_intent: "unclassified".into(),
            workflow_type: WorkflowType::HumanQueue,
            confidence: 0.0,
            layer: RoutingLayer::Fallback,
            requires_approval: true,
            latency_us,
            metadata,
        }
    }

    /// Produce the corrected variant of this decision.
    pub fn edited(&self, edit: &DecisionEdit, actor: &str, at: DateTime<Utc>) -> Self {
        let mut metadata = self.metadata.clone();
        metadata.insert("edited_from".into(), Value::String(self.summary()));
        metadata.insert("edited_by".into(), Value::String(actor.to_string()));
        metadata.insert("original_layer".into(), Value::String(self.layer.to_string()));

        Self {
            request_id: self.request_id.clone(),
            text: self.text.clone(),
            timestamp: at,
            intent: edit.intent.unwrap_or(self.intent),
            sub_intent: edit
                .sub_intent
                .clone()
                .unwrap_or_else(|| self.sub_intent.clone()),
            workflow_type: edit.workflow_type.unwrap_or(self.workflow_type),
            confidence: 1.0,
            layer: self.layer,
            requires_approval: false,
            latency_us: self.latency_us,
            metadata,
        }
    }

    /// `intent/sub_intent/workflow` shorthand used in logs.
    pub fn summary(&self) -> String {
        format!("{}/{}/{}", self.intent, self.sub_intent, self.workflow_type)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn pattern_result() -> ClassificationResult {
        ClassificationResult {
            matched: true,
            intent: IntentCategory::Incident,
            sub_intent: "etl_failure".into(),
            workflow: WorkflowType::Magentic,
            confidence: 0.95,
            layer: RoutingLayer::Pattern,
            evidence: Evidence::Rule {
                rule_id: "INC-001".into(),
                rule_name: "etl failure".into(),
            },
        }
    }

    #[test]
    fn category_parsing_is_closed() {
        assert_eq!(
            "Incident".parse::<IntentCategory>().unwrap(),
            IntentCategory::Incident
        );
        assert!("billing".parse::<IntentCategory>().is_err());
    }

    #[test]
    fn workflow_type_round_trips_through_str() {
        for w in WorkflowType::ALL {
            assert_eq!(w.as_str().parse::<WorkflowType>().unwrap(), w);
        }
        assert!("waterfall".parse::<WorkflowType>().is_err());
    }

    #[test]
    fn fallback_forces_approval() {
        let d = RoutingDecision::fallback("r1", "???", 10, BTreeMap::new());
        assert_eq!(d.layer, RoutingLayer::Fallback);
        assert_eq!(d.workflow_type, WorkflowType::HumanQueue);
        assert!(d.requires_approval);
    }

    #[test]
    fn pattern_decision_does_not_require_approval() {
        let d = RoutingDecision::from_classification(
            "r1",
            "etl failing",
            &pattern_result(),
            42,
            BTreeMap::new(),
        );
        assert_eq!(d.summary(), "incident/etl_failure/magentic");
        assert!(!d.requires_approval);
        assert_eq!(d.latency_us, 42);
    }

    #[test]
    fn edited_decision_links_to_original() {
        let original = RoutingDecision::from_classification(
            "r1",
            "etl failing",
            &pattern_result(),
            42,
            BTreeMap::new(),
        );
        let edit = DecisionEdit {
            workflow_type: Some(WorkflowType::Sequential),
            ..Default::default()
        };
        let edited = original.edited(&edit, "alice", Utc::now());

        assert_eq!(edited.request_id, original.request_id);
        assert_eq!(edited.workflow_type, WorkflowType::Sequential);
        assert_eq!(edited.intent, IntentCategory::Incident);
        assert_eq!(
            edited.metadata.get("edited_from"),
            Some(&Value::String("incident/etl_failure/magentic".into()))
        );
        assert_eq!(original.workflow_type, WorkflowType::Magentic);
    }
}
