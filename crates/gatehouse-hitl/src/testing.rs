//! Shared fixtures for unit tests.

use std::collections::BTreeMap;

use chrono::{Duration, Utc};
use gatehouse_kernel::{
    ApprovalRequest, ApprovalStatus, ApprovalTier, ClassificationResult, Evidence, IntentCategory,
    RequestPayload, RequestState, RiskAssessment, RiskLevel, RoutingDecision, RoutingLayer,
    WorkflowType,
};
use gatehouse_store::StateManager;

pub(crate) fn decision(request_id: &str) -> RoutingDecision {
    let result = ClassificationResult {
        matched: true,
        intent: IntentCategory::Incident,
        sub_intent: "etl_failure".into(),
        workflow: WorkflowType::Magentic,
        confidence: 0.92,
        layer: RoutingLayer::Pattern,
        evidence: Evidence::Rule {
            rule_id: "INC-001".into(),
            rule_name: "ETL or batch pipeline failure".into(),
        },
    };
    RoutingDecision::from_classification(
        request_id,
        "ETL pipeline failing",
        &result,
        120,
        BTreeMap::new(),
    )
}

pub(crate) fn assessment(level: RiskLevel, tier: ApprovalTier) -> RiskAssessment {
    RiskAssessment {
        level,
        score: 0.625,
        requires_approval: tier != ApprovalTier::None,
        tier,
        factors: Vec::new(),
    }
}

/// A request moved to `risk_assessing` with a decision attached.
pub(crate) async fn parked_request(states: &StateManager) -> String {
    let id = states
        .create(RequestPayload::new("ETL pipeline failing"))
        .await
        .unwrap()
        .request_id;
    states
        .transition(&id, RequestState::Routing, "routing", |_| {})
        .await
        .unwrap();
    let routed = decision(&id);
    states
        .transition(&id, RequestState::RiskAssessing, "routed", move |ctx| {
            ctx.decision = Some(routed.clone());
        })
        .await
        .unwrap();
    id
}

pub(crate) fn pending_approval(approval_id: &str, request_id: &str) -> ApprovalRequest {
    let now = Utc::now();
    ApprovalRequest {
        approval_id: approval_id.into(),
        request_id: request_id.into(),
        risk: assessment(RiskLevel::High, ApprovalTier::Manager),
        decision: decision(request_id),
        tier: ApprovalTier::Manager,
        created_at: now,
        expires_at: now + Duration::hours(24),
        status: ApprovalStatus::Pending,
        escalation_count: 0,
        escalated_to: None,
        resolution: None,
        version: 0,
    }
}
