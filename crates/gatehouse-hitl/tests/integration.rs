//! End-to-end pipeline tests over SQLite, with a fake workflow engine and a
//! fake webhook receiver served by axum on ephemeral ports.

use std::sync::Arc;
use std::time::Duration;

use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use gatehouse_hitl::{
    ApprovalPolicy, HitlController, HitlError, HttpDispatcher, ManualClock, Pipeline,
    RiskAssessor, WebhookNotifier,
};
use gatehouse_intent::{IntentRouter, default_rules};
use gatehouse_kernel::{
    ApprovalStatus, ApprovalTier, DecisionAction, EventBus, GateEvent, PatternMatcher,
    RequestPayload, RequestState, RiskLevel, RoutingLayer, WorkflowType,
};
use gatehouse_store::{Database, SqliteRepository, StateManager};
use serde_json::{Value, json};
use tokio::sync::mpsc;

// ═══════════════════════════════════════════════════════════════════════
//  Harness
// ═══════════════════════════════════════════════════════════════════════

async fn serve(app: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

/// Workflow engine that echoes the sub-intent back as the instance id.
async fn fake_engine() -> String {
    let app = Router::new().route(
        "/workflows",
        post(|Json(body): Json<Value>| async move {
            let sub = body["subIntent"].as_str().unwrap_or("none").to_string();
            Json(json!({ "instanceId": format!("wf-{sub}") }))
        }),
    );
    format!("{}/workflows", serve(app).await)
}

/// Webhook receiver forwarding every body to a channel.
async fn fake_webhook() -> (String, mpsc::Receiver<Value>) {
    let (tx, rx) = mpsc::channel(16);
    let app = Router::new().route(
        "/hook",
        post(move |Json(body): Json<Value>| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(body).await;
                StatusCode::NO_CONTENT
            }
        }),
    );
    (format!("{}/hook", serve(app).await), rx)
}

struct Harness {
    pipeline: Pipeline,
    clock: Arc<ManualClock>,
    bus: EventBus,
    hooks: mpsc::Receiver<Value>,
}

async fn harness(policy: ApprovalPolicy) -> Harness {
    let db = Database::in_memory_migrated().await.unwrap();
    let bus = EventBus::new(1024);
    let states = StateManager::new(Arc::new(SqliteRepository::new(db)), bus.clone());

    let (hook_url, hooks) = fake_webhook().await;
    let clock = Arc::new(ManualClock::default());
    let controller = HitlController::new(states)
        .with_notifier(Arc::new(WebhookNotifier::new(hook_url)))
        .with_clock(clock.clone())
        .with_policy(policy);

    let router = IntentRouter::new(Arc::new(PatternMatcher::new(default_rules().unwrap()).unwrap()));
    let pipeline = Pipeline::new(
        Arc::new(router),
        RiskAssessor::default(),
        controller,
        Arc::new(HttpDispatcher::new(fake_engine().await)),
    );
    Harness {
        pipeline,
        clock,
        bus,
        hooks,
    }
}

fn etl_incident() -> RequestPayload {
    let mut p = RequestPayload::new("ETL pipeline failing, nightly report missing");
    p.context.insert("production".into(), json!(true));
    p.context.insert("impact_scope".into(), json!("multi_system"));
    p
}

async fn parked(h: &Harness) -> (String, String) {
    let ctx = h.pipeline.accept(etl_incident()).await.unwrap();
    let parked = h.pipeline.process(&ctx.request_id).await.unwrap();
    assert_eq!(parked.state, RequestState::AwaitingApproval);
    (ctx.request_id, parked.approval_id.unwrap())
}

// ═══════════════════════════════════════════════════════════════════════
//  Scenarios
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn password_reset_flows_straight_through() {
    let h = harness(ApprovalPolicy::default()).await;
    let ctx = h
        .pipeline
        .accept(RequestPayload::new("reset my password"))
        .await
        .unwrap();
    let done = h.pipeline.process(&ctx.request_id).await.unwrap();

    assert_eq!(done.state, RequestState::Completed);
    assert_eq!(done.workflow_instance_id.as_deref(), Some("wf-password_reset"));
    let decision = done.decision.as_ref().unwrap();
    assert_eq!(decision.layer, RoutingLayer::Pattern);
    assert_eq!(decision.workflow_type, WorkflowType::Simple);
    let risk = done.risk.as_ref().unwrap();
    assert!((risk.score - 0.10).abs() < 1e-9);
    assert_eq!(risk.level, RiskLevel::Low);
    assert!(!risk.requires_approval);

    let path: Vec<_> = done.history.iter().map(|t| t.to).collect();
    assert_eq!(
        path,
        vec![
            RequestState::Routing,
            RequestState::RiskAssessing,
            RequestState::Dispatching,
            RequestState::Completed,
        ]
    );
}

#[tokio::test]
async fn etl_incident_waits_for_a_manager_and_notifies() {
    let mut h = harness(ApprovalPolicy::default()).await;
    let mut events = h.bus.subscribe();
    let (request_id, approval_id) = parked(&h).await;

    let approval = h.pipeline.controller().get_approval(&approval_id).await.unwrap();
    assert_eq!(approval.tier, ApprovalTier::Manager);
    assert_eq!(approval.risk.level, RiskLevel::High);
    assert!((approval.risk.score - 0.625).abs() < 1e-9);
    assert_eq!(approval.decision.summary(), "incident/etl_failure/magentic");

    let hook = tokio::time::timeout(Duration::from_secs(5), h.hooks.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(hook["approvalId"], approval_id.as_str());
    assert_eq!(hook["tier"], "manager");

    let out = h
        .pipeline
        .decide(&approval_id, DecisionAction::Approve, "manager@example.com", None, None)
        .await
        .unwrap();
    assert_eq!(out.context.state, RequestState::Completed);
    assert_eq!(out.context.workflow_instance_id.as_deref(), Some("wf-etl_failure"));

    let mut saw_created = false;
    let mut saw_resolved = false;
    while let Ok(event) = events.try_recv() {
        assert_eq!(event.request_id(), Some(request_id.as_str()));
        match &*event {
            GateEvent::ApprovalCreated { .. } => saw_created = true,
            GateEvent::ApprovalResolved { status, .. } => {
                assert_eq!(*status, ApprovalStatus::Approved);
                saw_resolved = true;
            }
            _ => {}
        }
    }
    assert!(saw_created && saw_resolved);
}

#[tokio::test]
async fn late_decision_is_rejected_as_expired() {
    let h = harness(ApprovalPolicy {
        ttl_secs: 1,
        ..Default::default()
    })
    .await;
    let (request_id, approval_id) = parked(&h).await;
    h.clock.advance(chrono::Duration::seconds(2));

    let err = h
        .pipeline
        .decide(&approval_id, DecisionAction::Approve, "manager", None, None)
        .await
        .unwrap_err();
    assert!(matches!(err, HitlError::Expired { .. }));

    let ctx = h.pipeline.get_request(&request_id).await.unwrap();
    assert_eq!(ctx.state, RequestState::Failed);
    assert!(ctx.workflow_instance_id.is_none());
}

#[tokio::test]
async fn concurrent_approve_and_reject_have_one_winner() {
    let h = harness(ApprovalPolicy::default()).await;
    let (request_id, approval_id) = parked(&h).await;

    let (a, r) = tokio::join!(
        h.pipeline
            .decide(&approval_id, DecisionAction::Approve, "alice", None, None),
        h.pipeline
            .decide(&approval_id, DecisionAction::Reject, "bob", None, None),
    );
    assert_eq!(a.is_ok() as u8 + r.is_ok() as u8, 1, "approve={a:?} reject={r:?}");
    let loser = if a.is_ok() { r.unwrap_err() } else { a.unwrap_err() };
    assert!(matches!(
        loser,
        HitlError::Conflict { .. } | HitlError::IllegalTransition { .. }
    ));

    let approval = h.pipeline.controller().get_approval(&approval_id).await.unwrap();
    let ctx = h.pipeline.get_request(&request_id).await.unwrap();
    match approval.status {
        ApprovalStatus::Approved => assert_eq!(ctx.state, RequestState::Completed),
        ApprovalStatus::Rejected => assert_eq!(ctx.state, RequestState::Failed),
        other => panic!("unexpected approval status {other}"),
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Edit, escalate, cancel
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn edited_decision_is_what_gets_dispatched() {
    let h = harness(ApprovalPolicy::default()).await;
    let (_, approval_id) = parked(&h).await;
    let edit = gatehouse_kernel::DecisionEdit {
        sub_intent: Some("warehouse_backfill".into()),
        ..Default::default()
    };
    let out = h
        .pipeline
        .decide(&approval_id, DecisionAction::Edit, "alice", None, Some(edit))
        .await
        .unwrap();
    assert_eq!(out.context.state, RequestState::Completed);
    assert_eq!(
        out.context.workflow_instance_id.as_deref(),
        Some("wf-warehouse_backfill")
    );
    assert_eq!(out.context.decision.unwrap().sub_intent, "etl_failure");
}

#[tokio::test]
async fn escalation_then_approval_at_the_new_tier() {
    let h = harness(ApprovalPolicy::default()).await;
    let (request_id, approval_id) = parked(&h).await;
    h.clock.advance(chrono::Duration::seconds(1));

    let out = h
        .pipeline
        .decide(
            &approval_id,
            DecisionAction::Escalate,
            "alice",
            Some("above my pay grade".into()),
            None,
        )
        .await
        .unwrap();
    let successor = out.successor.unwrap();
    assert_eq!(successor.tier, ApprovalTier::Security);

    let err = h
        .pipeline
        .decide(&approval_id, DecisionAction::Approve, "alice", None, None)
        .await
        .unwrap_err();
    assert!(matches!(err, HitlError::Conflict { .. }));

    let done = h
        .pipeline
        .decide(&successor.approval_id, DecisionAction::Approve, "ciso", None, None)
        .await
        .unwrap();
    assert_eq!(done.context.state, RequestState::Completed);

    let history = h.pipeline.controller().history(&request_id).await.unwrap();
    let statuses: Vec<_> = history.iter().map(|a| a.status).collect();
    assert_eq!(statuses, vec![ApprovalStatus::Escalated, ApprovalStatus::Approved]);
}

#[tokio::test]
async fn cancelled_request_ignores_late_approval() {
    let h = harness(ApprovalPolicy::default()).await;
    let (request_id, approval_id) = parked(&h).await;

    h.pipeline.cancel(&request_id, "requester").await.unwrap();
    let err = h
        .pipeline
        .decide(&approval_id, DecisionAction::Approve, "manager", None, None)
        .await
        .unwrap_err();
    assert!(matches!(err, HitlError::Conflict { .. }));

    let approval = h.pipeline.controller().get_approval(&approval_id).await.unwrap();
    assert_eq!(approval.status, ApprovalStatus::Cancelled);
}

#[tokio::test]
async fn sweep_expires_every_overdue_request() {
    let h = harness(ApprovalPolicy {
        ttl_secs: 30,
        ..Default::default()
    })
    .await;
    let (first, _) = parked(&h).await;
    let (second, _) = parked(&h).await;
    h.clock.advance(chrono::Duration::seconds(31));

    let report = h.pipeline.sweep().await.unwrap();
    assert_eq!(report.expired, 2);
    for id in [first, second] {
        let ctx = h.pipeline.get_request(&id).await.unwrap();
        assert_eq!(ctx.state, RequestState::Failed);
        let path: Vec<_> = ctx.history.iter().map(|t| t.to).collect();
        assert!(path.ends_with(&[RequestState::Expired, RequestState::Failed]));
    }
}

#[tokio::test]
async fn submit_processes_in_the_background() {
    let h = harness(ApprovalPolicy::default()).await;
    let accepted = h
        .pipeline
        .submit(RequestPayload::new("reset my password"))
        .await
        .unwrap();
    assert_eq!(accepted.state, RequestState::Received);

    let mut state = accepted.state;
    for _ in 0..100 {
        state = h.pipeline.get_request(&accepted.request_id).await.unwrap().state;
        if state.is_terminal() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(state, RequestState::Completed);
}
