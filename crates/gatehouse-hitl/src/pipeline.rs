//! Ingress-to-dispatch orchestration.
//!
//! ```text
//! submit ─► received ─► routing ─► risk_assessing ─┬─► dispatching ─► completed
//!                                                  └─► awaiting_approval
//!                                                        │ decide / sweep
//!                                                        ▼
//!                                          approved|edited ─► dispatching
//! ```
//!
//! [`Pipeline::submit`] validates and persists synchronously, then runs the
//! rest of the flow on a spawned task.  Callers that need the outcome (the
//! CLI, tests) use [`Pipeline::accept`] followed by [`Pipeline::process`].
//!
//! Work in flight when the process stops is picked up again by
//! [`Pipeline::recover`], which must run before new requests are accepted.

use std::sync::Arc;

use gatehouse_intent::{ContextMap, IntentRouter, RouterStats};
use gatehouse_kernel::{
    ApprovalTier, DecisionAction, DecisionEdit, GateEvent, RequestContext, RequestPayload,
    RequestState, RiskAssessment, RoutingDecision,
};
use gatehouse_store::StateManager;
use serde::Serialize;
use serde_json::json;
use tracing::{Instrument, error, info, info_span, instrument, warn};

use crate::controller::{DecisionOutcome, HitlController, SweepReport};
use crate::dispatcher::WorkflowDispatcher;
use crate::error::{HitlError, Result};
use crate::risk::RiskAssessor;

/// Longest accepted request text, in bytes.
pub const MAX_TEXT_BYTES: usize = 8 * 1024;

/// Result of a side-effect-free routing run.
#[derive(Debug, Clone, Serialize)]
pub struct DryRunReport {
    pub decision: RoutingDecision,
    pub risk: RiskAssessment,
}

/// What [`Pipeline::recover`] did with requests left in flight.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RecoveryReport {
    /// `received` requests processed again.
    pub resumed: usize,
    /// `approved` and `edited` requests handed to the dispatcher.
    pub dispatched: usize,
    /// Requests stopped mid-step and failed.
    pub abandoned: usize,
    pub errors: usize,
}

impl RecoveryReport {
    pub fn touched(&self) -> usize {
        self.resumed + self.dispatched + self.abandoned
    }
}

/// States a stopped process can leave behind mid-step.  Routing and risk
/// assessment are not resumable and a dispatch may already have reached
/// the engine, so these are failed rather than retried.
const INTERRUPTED: [RequestState; 3] = [
    RequestState::Routing,
    RequestState::RiskAssessing,
    RequestState::Dispatching,
];

const CLEARED: [RequestState; 2] = [RequestState::Approved, RequestState::Edited];

#[derive(Clone)]
pub struct Pipeline {
    router: Arc<IntentRouter>,
    assessor: Arc<RiskAssessor>,
    controller: HitlController,
    dispatcher: Arc<dyn WorkflowDispatcher>,
}

impl Pipeline {
    pub fn new(
        router: Arc<IntentRouter>,
        assessor: RiskAssessor,
        controller: HitlController,
        dispatcher: Arc<dyn WorkflowDispatcher>,
    ) -> Self {
        Self {
            router,
            assessor: Arc::new(assessor),
            controller,
            dispatcher,
        }
    }

    pub fn router(&self) -> &Arc<IntentRouter> {
        &self.router
    }

    pub fn assessor(&self) -> &RiskAssessor {
        &self.assessor
    }

    pub fn controller(&self) -> &HitlController {
        &self.controller
    }

    pub fn states(&self) -> &StateManager {
        self.controller.states()
    }

    pub fn stats(&self) -> RouterStats {
        self.router.stats()
    }

    // ── ingress ────────────────────────────────────────────────────────

    /// Reject payloads that must never become a request.
    pub fn validate_payload(payload: &RequestPayload) -> Result<()> {
        validate_text(&payload.text)?;
        RiskAssessor::validate_context(&payload.context)
    }

    /// Validate and persist in `received`.  Nothing is stored on error.
    pub async fn accept(&self, payload: RequestPayload) -> Result<RequestContext> {
        Self::validate_payload(&payload)?;
        Ok(self.states().create(payload).await?)
    }

    /// [`accept`](Self::accept), then process in the background.
    pub async fn submit(&self, payload: RequestPayload) -> Result<RequestContext> {
        let ctx = self.accept(payload).await?;
        let pipeline = self.clone();
        let request_id = ctx.request_id.clone();
        let span = info_span!("process", request_id = %request_id);
        tokio::spawn(
            async move {
                if let Err(e) = pipeline.process(&request_id).await {
                    warn!(error = %e, "request processing ended with an error");
                }
            }
            .instrument(span),
        );
        Ok(ctx)
    }

    // ── processing ─────────────────────────────────────────────────────

    /// Route, assess, then either dispatch or park for approval.
    #[instrument(skip(self))]
    pub async fn process(&self, request_id: &str) -> Result<RequestContext> {
        let ctx = self
            .states()
            .claim(request_id, RequestState::Routing, "routing started", |_| {})
            .await?;

        let decision = self
            .router
            .route(request_id, &ctx.payload.text, &ctx.payload.context)
            .await;
        self.states().bus().publish(GateEvent::Routed {
            request_id: request_id.to_string(),
            layer: decision.layer,
            summary: decision.summary(),
            confidence: decision.confidence,
            latency_us: decision.latency_us,
        });

        let routed = decision.clone();
        self.states()
            .transition(
                request_id,
                RequestState::RiskAssessing,
                &format!("routed by {} layer", decision.layer),
                move |c| c.decision = Some(routed.clone()),
            )
            .await?;

        let assessment = match self.assessor.assess(&decision, &ctx.payload.context) {
            Ok(a) => a,
            Err(e) => {
                self.states().fail(request_id, &e.to_string()).await?;
                return Err(e);
            }
        };
        let risk = assessment.clone();
        self.states()
            .update(request_id, move |c| c.risk = Some(risk.clone()))
            .await?;

        info!(
            layer = %decision.layer,
            summary = %decision.summary(),
            risk = %assessment.level,
            score = assessment.score,
            tier = %assessment.tier,
            "request assessed"
        );

        if assessment.requires_approval {
            self.controller.create_approval(&decision, &assessment).await?;
            return Ok(self.states().get(request_id).await?);
        }
        self.dispatch(request_id).await
    }

    /// Hand the effective decision to the workflow engine.
    ///
    /// Only one caller can move a request into `dispatching`, so a request
    /// is never dispatched twice.
    #[instrument(skip(self))]
    pub async fn dispatch(&self, request_id: &str) -> Result<RequestContext> {
        let ctx = self
            .states()
            .claim(request_id, RequestState::Dispatching, "dispatching", |_| {})
            .await?;
        let Some(decision) = ctx.effective_decision().cloned() else {
            let reason = "no routing decision to dispatch";
            self.states().fail(request_id, reason).await?;
            return Err(HitlError::Dispatch {
                reason: reason.into(),
            });
        };

        match self.dispatcher.dispatch(&decision).await {
            Ok(instance_id) => {
                info!(%instance_id, workflow = %decision.workflow_type, "request dispatched");
                let result = json!({ "workflowInstanceId": instance_id });
                Ok(self
                    .states()
                    .transition(
                        request_id,
                        RequestState::Completed,
                        "workflow dispatched",
                        move |c| {
                            c.workflow_instance_id = Some(instance_id.clone());
                            c.result = Some(result.clone());
                        },
                    )
                    .await?)
            }
            Err(e) => {
                error!(error = %e, "dispatch failed");
                self.states().fail(request_id, &e.to_string()).await?;
                Err(e)
            }
        }
    }

    // ── recovery ───────────────────────────────────────────────────────

    /// Drive requests left behind by a previous run to a resting state.
    ///
    /// Requests caught mid-step are failed, cleared requests are
    /// dispatched and `received` ones are processed from the start.
    /// Requests awaiting approval are left to the sweeper.  A failure on
    /// one request is counted and does not stop the rest.
    #[instrument(skip(self))]
    pub async fn recover(&self) -> Result<RecoveryReport> {
        let repo = self.states().repository();
        let mut report = RecoveryReport::default();

        for ctx in repo.list_contexts_in(&INTERRUPTED).await? {
            let reason = format!("interrupted while {}", ctx.state);
            match self.states().fail(&ctx.request_id, &reason).await {
                Ok(_) => {
                    warn!(request_id = %ctx.request_id, from = %ctx.state, "abandoned interrupted request");
                    report.abandoned += 1;
                }
                Err(e) => {
                    warn!(request_id = %ctx.request_id, error = %e, "could not fail interrupted request");
                    report.errors += 1;
                }
            }
        }

        for ctx in repo.list_contexts_in(&CLEARED).await? {
            match self.dispatch(&ctx.request_id).await {
                Ok(_) => report.dispatched += 1,
                Err(e) => {
                    warn!(request_id = %ctx.request_id, error = %e, "dispatch on recovery failed");
                    report.errors += 1;
                }
            }
        }

        for ctx in repo.list_contexts_in(&[RequestState::Received]).await? {
            match self.process(&ctx.request_id).await {
                Ok(_) => report.resumed += 1,
                Err(e) => {
                    warn!(request_id = %ctx.request_id, error = %e, "processing on recovery failed");
                    report.errors += 1;
                }
            }
        }

        if report.touched() + report.errors > 0 {
            info!(?report, "recovered in-flight requests");
        }
        Ok(report)
    }

    // ── approvals ──────────────────────────────────────────────────────

    /// Record a human decision; approved and edited requests are dispatched
    /// before returning.
    ///
    /// A dispatch failure does not undo the decision.  It is recorded on the
    /// request, which the returned outcome reflects.
    pub async fn decide(
        &self,
        approval_id: &str,
        action: DecisionAction,
        actor: &str,
        comment: Option<String>,
        edit: Option<DecisionEdit>,
    ) -> Result<DecisionOutcome> {
        let mut outcome = self
            .controller
            .submit_decision(approval_id, action, actor, comment, edit)
            .await?;
        if outcome.ready_to_dispatch() {
            let request_id = outcome.context.request_id.clone();
            outcome.context = match self.dispatch(&request_id).await {
                Ok(ctx) => ctx,
                Err(e) => {
                    warn!(%request_id, error = %e, "dispatch after approval failed");
                    self.states().get(&request_id).await?
                }
            };
        }
        Ok(outcome)
    }

    pub async fn cancel(&self, request_id: &str, actor: &str) -> Result<RequestContext> {
        self.controller.cancel(request_id, actor).await
    }

    pub async fn sweep(&self) -> Result<SweepReport> {
        self.controller.sweep_expired().await
    }

    pub async fn list_pending(
        &self,
        tier: Option<ApprovalTier>,
    ) -> Result<Vec<gatehouse_kernel::ApprovalRequest>> {
        self.controller.list_pending(tier).await
    }

    pub async fn get_request(&self, request_id: &str) -> Result<RequestContext> {
        Ok(self.states().get(request_id).await?)
    }

    // ── dry run ────────────────────────────────────────────────────────

    /// Cascade plus risk, with no persistence, events or counters.
    pub async fn dry_run(&self, text: &str, context: &ContextMap) -> Result<DryRunReport> {
        validate_text(text)?;
        let decision = self.router.dry_run("dry-run", text, context).await;
        let risk = self.assessor.assess(&decision, context)?;
        Ok(DryRunReport { decision, risk })
    }
}

fn validate_text(text: &str) -> Result<()> {
    if text.trim().is_empty() {
        return Err(HitlError::validation("text must not be empty"));
    }
    if text.len() > MAX_TEXT_BYTES {
        return Err(HitlError::validation(format!(
            "text is {} bytes, limit is {MAX_TEXT_BYTES}",
            text.len()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use gatehouse_intent::default_rules;
    use gatehouse_kernel::{EventBus, PatternMatcher, RiskLevel, RoutingLayer};
    use gatehouse_store::MemoryRepository;
    use serde_json::Value;

    use super::*;

    #[derive(Default)]
    struct CountingDispatcher {
        calls: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl WorkflowDispatcher for CountingDispatcher {
        async fn dispatch(&self, decision: &RoutingDecision) -> Result<String> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(HitlError::Dispatch {
                    reason: "engine down".into(),
                });
            }
            Ok(format!("wf-{}-{n}", decision.sub_intent))
        }
    }

    fn pipeline(dispatcher: Arc<CountingDispatcher>) -> Pipeline {
        let router = IntentRouter::new(Arc::new(PatternMatcher::new(default_rules().unwrap()).unwrap()));
        let states = StateManager::new(Arc::new(MemoryRepository::new()), EventBus::new(256));
        Pipeline::new(
            Arc::new(router),
            RiskAssessor::default(),
            HitlController::new(states),
            dispatcher,
        )
    }

    fn payload(text: &str, ctx: &[(&str, Value)]) -> RequestPayload {
        let mut p = RequestPayload::new(text);
        p.context = ctx.iter().map(|(k, v)| (k.to_string(), v.clone())).collect();
        p
    }

    #[tokio::test]
    async fn low_risk_request_is_dispatched_directly() {
        let dispatcher = Arc::new(CountingDispatcher::default());
        let p = pipeline(dispatcher.clone());
        let ctx = p.accept(payload("reset my password", &[])).await.unwrap();
        let done = p.process(&ctx.request_id).await.unwrap();

        assert_eq!(done.state, RequestState::Completed);
        assert_eq!(done.workflow_instance_id.as_deref(), Some("wf-password_reset-0"));
        let risk = done.risk.unwrap();
        assert!((risk.score - 0.10).abs() < 1e-9);
        assert_eq!(risk.level, RiskLevel::Low);
        assert_eq!(dispatcher.calls.load(Ordering::SeqCst), 1);
        assert!(done.approval_id.is_none());
    }

    #[tokio::test]
    async fn high_risk_request_waits_for_manager() {
        let dispatcher = Arc::new(CountingDispatcher::default());
        let p = pipeline(dispatcher.clone());
        let ctx = p
            .accept(payload(
                "ETL pipeline failing, nightly report missing",
                &[
                    ("production", Value::Bool(true)),
                    ("impact_scope", Value::String("multi_system".into())),
                ],
            ))
            .await
            .unwrap();
        let parked = p.process(&ctx.request_id).await.unwrap();
        assert_eq!(parked.state, RequestState::AwaitingApproval);
        assert_eq!(dispatcher.calls.load(Ordering::SeqCst), 0);

        let pending = p.list_pending(Some(ApprovalTier::Manager)).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert!((pending[0].risk.score - 0.625).abs() < 1e-9);

        let out = p
            .decide(&pending[0].approval_id, DecisionAction::Approve, "mgr", None, None)
            .await
            .unwrap();
        assert_eq!(out.context.state, RequestState::Completed);
        assert_eq!(dispatcher.calls.load(Ordering::SeqCst), 1);

        // A second dispatch attempt is refused.
        let err = p.dispatch(&ctx.request_id).await.unwrap_err();
        assert!(matches!(err, HitlError::IllegalTransition { .. }));
        assert_eq!(dispatcher.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn fallback_decision_always_needs_approval() {
        let p = pipeline(Arc::new(CountingDispatcher::default()));
        let ctx = p.accept(payload("good morning team", &[])).await.unwrap();
        let parked = p.process(&ctx.request_id).await.unwrap();
        assert_eq!(parked.decision.unwrap().layer, RoutingLayer::Fallback);
        assert_eq!(parked.state, RequestState::AwaitingApproval);
    }

    #[tokio::test]
    async fn dispatch_failure_fails_the_request() {
        let p = pipeline(Arc::new(CountingDispatcher {
            fail: true,
            ..Default::default()
        }));
        let ctx = p.accept(payload("reset my password", &[])).await.unwrap();
        let err = p.process(&ctx.request_id).await.unwrap_err();
        assert!(matches!(err, HitlError::Dispatch { .. }));
        let stored = p.get_request(&ctx.request_id).await.unwrap();
        assert_eq!(stored.state, RequestState::Failed);
        assert!(stored.error.unwrap().contains("engine down"));
    }

    #[tokio::test]
    async fn invalid_payloads_never_persist() {
        let p = pipeline(Arc::new(CountingDispatcher::default()));
        for bad in [
            payload("   ", &[]),
            payload(&"x".repeat(MAX_TEXT_BYTES + 1), &[]),
            payload("delete it", &[("action_type", Value::String("nuke".into()))]),
        ] {
            let err = p.accept(bad).await.unwrap_err();
            assert!(matches!(err, HitlError::Validation { .. }));
        }
        assert!(p.list_pending(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn processing_twice_is_refused() {
        let p = pipeline(Arc::new(CountingDispatcher::default()));
        let ctx = p.accept(payload("reset my password", &[])).await.unwrap();
        p.process(&ctx.request_id).await.unwrap();
        assert!(p.process(&ctx.request_id).await.is_err());
    }

    #[tokio::test]
    async fn dry_run_leaves_no_trace() {
        let p = pipeline(Arc::new(CountingDispatcher::default()));
        let report = p.dry_run("reset my password", &ContextMap::new()).await.unwrap();
        assert_eq!(report.decision.sub_intent, "password_reset");
        assert!(!report.risk.requires_approval);
        assert_eq!(p.stats().total_routed, 0);
    }

    #[tokio::test]
    async fn recover_settles_requests_left_in_flight() {
        let dispatcher = Arc::new(CountingDispatcher::default());
        let p = pipeline(dispatcher.clone());
        let states = p.states().clone();

        // Accepted but never picked up.
        let queued = p.accept(payload("reset my password", &[])).await.unwrap();

        // Stopped while routing.
        let routing = p.accept(payload("reset my password", &[])).await.unwrap();
        states
            .claim(&routing.request_id, RequestState::Routing, "routing started", |_| {})
            .await
            .unwrap();

        // Approved, but the dispatch never happened.
        let parked = p.accept(payload("good morning team", &[])).await.unwrap();
        p.process(&parked.request_id).await.unwrap();
        let approval = p.list_pending(None).await.unwrap().remove(0);
        p.controller()
            .submit_decision(&approval.approval_id, DecisionAction::Approve, "mgr", None, None)
            .await
            .unwrap();

        // Stopped inside the dispatcher call.
        let dispatching = p.accept(payload("reset my password", &[])).await.unwrap();
        for to in [RequestState::Routing, RequestState::RiskAssessing] {
            states
                .transition(&dispatching.request_id, to, "step", |_| {})
                .await
                .unwrap();
        }
        states
            .claim(&dispatching.request_id, RequestState::Dispatching, "dispatching", |_| {})
            .await
            .unwrap();

        let report = p.recover().await.unwrap();
        assert_eq!(
            report,
            RecoveryReport {
                resumed: 1,
                dispatched: 1,
                abandoned: 2,
                errors: 0,
            }
        );
        assert_eq!(dispatcher.calls.load(Ordering::SeqCst), 2);

        let queued = p.get_request(&queued.request_id).await.unwrap();
        assert_eq!(queued.state, RequestState::Completed);
        let parked = p.get_request(&parked.request_id).await.unwrap();
        assert_eq!(parked.state, RequestState::Completed);
        let routing = p.get_request(&routing.request_id).await.unwrap();
        assert_eq!(routing.state, RequestState::Failed);
        assert_eq!(routing.error.as_deref(), Some("interrupted while routing"));
        let dispatching = p.get_request(&dispatching.request_id).await.unwrap();
        assert_eq!(dispatching.state, RequestState::Failed);
        assert!(dispatching.workflow_instance_id.is_none());

        // Nothing left to do on a second pass.
        assert_eq!(p.recover().await.unwrap(), RecoveryReport::default());
    }

    #[tokio::test]
    async fn recover_leaves_pending_approvals_alone() {
        let p = pipeline(Arc::new(CountingDispatcher::default()));
        let ctx = p.accept(payload("good morning team", &[])).await.unwrap();
        p.process(&ctx.request_id).await.unwrap();

        assert_eq!(p.recover().await.unwrap().touched(), 0);
        let stored = p.get_request(&ctx.request_id).await.unwrap();
        assert_eq!(stored.state, RequestState::AwaitingApproval);
        assert_eq!(p.list_pending(None).await.unwrap().len(), 1);
    }
}
