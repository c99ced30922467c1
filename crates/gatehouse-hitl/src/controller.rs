//! Approval lifecycle.
//!
//! The approval wait is persisted state, not a parked task.  A request sits
//! in `awaiting_approval` until one of two re-entry points moves it on:
//! [`HitlController::submit_decision`] (a human) or
//! [`HitlController::sweep_expired`] (the deadline).
//!
//! Every approval write is a compare-and-swap on its `version`, so of two
//! concurrent decisions exactly one lands and the other sees `Conflict`.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use gatehouse_kernel::{
    ApprovalRequest, ApprovalStatus, ApprovalTier, DecisionAction, DecisionEdit, DecisionRecord,
    EventBus, GateEvent, RequestContext, RequestState, RiskAssessment, RoutingDecision,
};
use gatehouse_store::{ApprovalFilter, Repository, StateManager};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::clock::{Clock, SystemClock};
use crate::error::{HitlError, Result};
use crate::notifier::{LogNotifier, Notifier};

// ═══════════════════════════════════════════════════════════════════════
//  Policy
// ═══════════════════════════════════════════════════════════════════════

/// Ten years.
const MAX_TTL_SECS: u64 = 10 * 365 * 24 * 60 * 60;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApprovalPolicy {
    /// Lifetime of a fresh approval, in seconds.
    pub ttl_secs: u64,
    /// Escalate instead of expiring when the deadline passes.
    pub auto_escalate: bool,
    /// Upper bound on automatic escalations per request.
    pub max_escalations: u32,
}

impl Default for ApprovalPolicy {
    fn default() -> Self {
        Self {
            ttl_secs: 24 * 60 * 60,
            auto_escalate: false,
            max_escalations: 2,
        }
    }
}

impl ApprovalPolicy {
    pub fn ttl(&self) -> Duration {
        Duration::seconds(self.ttl_secs.min(MAX_TTL_SECS) as i64)
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Outcomes
// ═══════════════════════════════════════════════════════════════════════

/// What [`HitlController::submit_decision`] changed.
#[derive(Debug, Clone, Serialize)]
pub struct DecisionOutcome {
    /// The resolved approval as stored.
    pub approval: ApprovalRequest,
    /// The request context after the decision.
    pub context: RequestContext,
    /// The replacement approval, for `escalate`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub successor: Option<ApprovalRequest>,
}

impl DecisionOutcome {
    /// Whether the request is now cleared for dispatch.
    pub fn ready_to_dispatch(&self) -> bool {
        matches!(
            self.context.state,
            RequestState::Approved | RequestState::Edited
        )
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub expired: usize,
    pub escalated: usize,
    /// Overdue approvals someone else resolved mid-sweep.
    pub skipped: usize,
    pub errors: usize,
}

impl SweepReport {
    pub fn touched(&self) -> usize {
        self.expired + self.escalated
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Controller
// ═══════════════════════════════════════════════════════════════════════

#[derive(Clone)]
pub struct HitlController {
    states: StateManager,
    notifier: Arc<dyn Notifier>,
    clock: Arc<dyn Clock>,
    policy: ApprovalPolicy,
}

impl HitlController {
    pub fn new(states: StateManager) -> Self {
        Self {
            states,
            notifier: Arc::new(LogNotifier),
            clock: Arc::new(SystemClock),
            policy: ApprovalPolicy::default(),
        }
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_policy(mut self, policy: ApprovalPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn policy(&self) -> &ApprovalPolicy {
        &self.policy
    }

    pub fn states(&self) -> &StateManager {
        &self.states
    }

    fn repo(&self) -> &Arc<dyn Repository> {
        self.states.repository()
    }

    fn bus(&self) -> &EventBus {
        self.states.bus()
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    // ── create ─────────────────────────────────────────────────────────

    /// Persist a pending approval for `decision` and park the request in
    /// `awaiting_approval`.
    #[instrument(skip(self, decision, assessment), fields(request_id = %decision.request_id))]
    pub async fn create_approval(
        &self,
        decision: &RoutingDecision,
        assessment: &RiskAssessment,
    ) -> Result<ApprovalRequest> {
        if assessment.tier == ApprovalTier::None {
            return Err(HitlError::validation(
                "cannot create an approval at tier `none`",
            ));
        }

        let now = self.now();
        let approval = ApprovalRequest {
            approval_id: new_approval_id(),
            request_id: decision.request_id.clone(),
            risk: assessment.clone(),
            decision: decision.clone(),
            tier: assessment.tier,
            created_at: now,
            expires_at: now + self.policy.ttl(),
            status: ApprovalStatus::Pending,
            escalation_count: 0,
            escalated_to: None,
            resolution: None,
            version: 0,
        };
        self.repo().insert_approval(&approval).await?;

        let approval_id = approval.approval_id.clone();
        let parked = self
            .states
            .transition(
                &approval.request_id,
                RequestState::AwaitingApproval,
                &format!("{} approval required", approval.tier),
                move |ctx| ctx.approval_id = Some(approval_id.clone()),
            )
            .await;
        if let Err(err) = parked {
            // Do not leave an approval that nobody can act on.
            let mut orphan = approval.clone();
            orphan.status = ApprovalStatus::Cancelled;
            if let Err(e) = self.repo().update_approval(&orphan).await {
                warn!(approval_id = %approval.approval_id, error = %e, "failed to cancel orphaned approval");
            }
            return Err(err.into());
        }

        info!(
            approval_id = %approval.approval_id,
            tier = %approval.tier,
            expires_at = %approval.expires_at,
            "approval created"
        );
        self.bus().publish(GateEvent::ApprovalCreated {
            approval_id: approval.approval_id.clone(),
            request_id: approval.request_id.clone(),
            tier: approval.tier,
            expires_at: approval.expires_at,
        });
        self.spawn_notify(approval.clone());
        Ok(approval)
    }

    fn spawn_notify(&self, approval: ApprovalRequest) {
        let notifier = Arc::clone(&self.notifier);
        tokio::spawn(async move {
            if let Err(e) = notifier.notify(&approval).await {
                warn!(
                    approval_id = %approval.approval_id,
                    channel = notifier.name(),
                    error = %e,
                    "approval notification failed"
                );
            }
        });
    }

    // ── decide ─────────────────────────────────────────────────────────

    /// Resolve a pending approval.
    ///
    /// The approval must be pending and inside its deadline.  A decision
    /// that arrives late expires the approval on the spot and reports
    /// [`HitlError::Expired`].
    #[instrument(skip(self, comment, edit))]
    pub async fn submit_decision(
        &self,
        approval_id: &str,
        action: DecisionAction,
        actor: &str,
        comment: Option<String>,
        edit: Option<DecisionEdit>,
    ) -> Result<DecisionOutcome> {
        let actor = actor.trim();
        if actor.is_empty() {
            return Err(HitlError::validation("actor must not be empty"));
        }
        let edit = match (action, edit) {
            (DecisionAction::Edit, Some(edit)) if !edit.is_empty() => Some(edit),
            (DecisionAction::Edit, _) => {
                return Err(HitlError::validation(
                    "an edit decision needs at least one changed field",
                ));
            }
            (_, _) => None,
        };

        let approval = self.get_approval(approval_id).await?;
        match approval.status {
            ApprovalStatus::Pending => {}
            ApprovalStatus::Expired => {
                return Err(HitlError::Expired {
                    approval_id: approval_id.to_string(),
                });
            }
            resolved => {
                return Err(HitlError::Conflict {
                    entity: "approval",
                    id: approval_id.to_string(),
                    reason: format!("already {resolved}"),
                });
            }
        }

        let now = self.now();
        if approval.is_overdue(now) {
            info!(approval_id, "decision arrived after deadline");
            self.expire(approval, now).await?;
            return Err(HitlError::Expired {
                approval_id: approval_id.to_string(),
            });
        }

        let record = DecisionRecord {
            actor: actor.to_string(),
            action,
            comment,
            decided_at: now,
        };

        if action == DecisionAction::Escalate {
            let (stored, successor, context) = self.escalate(approval, Some(record), now).await?;
            return Ok(DecisionOutcome {
                approval: stored,
                context,
                successor: Some(successor),
            });
        }

        let status = match action {
            DecisionAction::Approve => ApprovalStatus::Approved,
            DecisionAction::Reject => ApprovalStatus::Rejected,
            DecisionAction::Edit => ApprovalStatus::Edited,
            DecisionAction::Escalate => ApprovalStatus::Escalated,
        };
        let edited_decision = edit
            .as_ref()
            .map(|e| approval.decision.edited(e, actor, now));

        let mut resolved = approval;
        resolved.status = status;
        resolved.resolution = Some(record);
        let stored = self.repo().update_approval(&resolved).await?;
        let request_id = stored.request_id.clone();

        let applied = async {
            Ok::<_, HitlError>(match action {
                DecisionAction::Approve => {
                    self.states
                        .transition(
                            &request_id,
                            RequestState::Approved,
                            &format!("approved by {actor}"),
                            |_| {},
                        )
                        .await?
                }
                DecisionAction::Reject => {
                    let reason = format!("rejected by {actor}");
                    self.states
                        .transition(&request_id, RequestState::Rejected, &reason, |_| {})
                        .await?;
                    let detail = match stored.resolution.as_ref().and_then(|r| r.comment.as_deref()) {
                        Some(c) => format!("{reason}: {c}"),
                        None => reason,
                    };
                    self.states.fail(&request_id, &detail).await?
                }
                DecisionAction::Edit | DecisionAction::Escalate => {
                    let edited = edited_decision.clone();
                    self.states
                        .transition(
                            &request_id,
                            RequestState::Edited,
                            &format!("edited by {actor}"),
                            move |ctx| ctx.edited_decision = edited.clone(),
                        )
                        .await?
                }
            })
        }
        .await;

        let context = match applied {
            Ok(context) => context,
            Err(HitlError::IllegalTransition { from, .. }) => {
                self.withdraw(stored, actor, from).await?;
                return Err(HitlError::Conflict {
                    entity: "request",
                    id: request_id,
                    reason: format!("request is {from}, decision withdrawn"),
                });
            }
            Err(err) => return Err(err),
        };

        info!(approval_id, %status, actor, "approval resolved");
        self.bus().publish(GateEvent::ApprovalResolved {
            approval_id: stored.approval_id.clone(),
            request_id,
            status,
            action: Some(action),
            actor: Some(actor.to_string()),
        });

        Ok(DecisionOutcome {
            approval: stored,
            context,
            successor: None,
        })
    }

    /// Undo a resolution whose request moved on (cancelled or failed)
    /// before the decision could be applied to it.
    async fn withdraw(
        &self,
        mut approval: ApprovalRequest,
        actor: &str,
        request_state: RequestState,
    ) -> Result<ApprovalRequest> {
        warn!(
            approval_id = %approval.approval_id,
            request_id = %approval.request_id,
            %request_state,
            "request left awaiting approval before the decision landed"
        );
        approval.status = ApprovalStatus::Cancelled;
        let stored = self.repo().update_approval(&approval).await?;
        self.bus().publish(GateEvent::ApprovalResolved {
            approval_id: stored.approval_id.clone(),
            request_id: stored.request_id.clone(),
            status: ApprovalStatus::Cancelled,
            action: None,
            actor: Some(actor.to_string()),
        });
        Ok(stored)
    }

    /// Supersede `approval` with a fresh one at the next tier and rebind the
    /// request to it.
    async fn escalate(
        &self,
        approval: ApprovalRequest,
        resolution: Option<DecisionRecord>,
        now: DateTime<Utc>,
    ) -> Result<(ApprovalRequest, ApprovalRequest, RequestContext)> {
        let Some(next_tier) = approval.tier.next() else {
            return Err(HitlError::Conflict {
                entity: "approval",
                id: approval.approval_id.clone(),
                reason: format!("tier {} has no higher tier", approval.tier),
            });
        };

        let successor = ApprovalRequest {
            approval_id: new_approval_id(),
            request_id: approval.request_id.clone(),
            risk: approval.risk.clone(),
            decision: approval.decision.clone(),
            tier: next_tier,
            created_at: now,
            expires_at: now + self.policy.ttl(),
            status: ApprovalStatus::Pending,
            escalation_count: approval.escalation_count + 1,
            escalated_to: None,
            resolution: None,
            version: 0,
        };

        let actor = resolution.as_ref().map(|r| r.actor.clone());
        let mut old = approval;
        old.status = ApprovalStatus::Escalated;
        old.escalated_to = Some(successor.approval_id.clone());
        old.resolution = resolution;
        let stored = self.repo().supersede_approval(&old, &successor).await?;

        let successor_id = successor.approval_id.clone();
        let context = self
            .states
            .update(&successor.request_id, move |ctx| {
                ctx.approval_id = Some(successor_id.clone());
            })
            .await?;

        info!(
            from = %stored.approval_id,
            to = %successor.approval_id,
            tier = %successor.tier,
            escalations = successor.escalation_count,
            "approval escalated"
        );
        self.bus().publish(GateEvent::ApprovalResolved {
            approval_id: stored.approval_id.clone(),
            request_id: stored.request_id.clone(),
            status: ApprovalStatus::Escalated,
            action: actor.as_ref().map(|_| DecisionAction::Escalate),
            actor,
        });
        self.bus().publish(GateEvent::ApprovalEscalated {
            request_id: successor.request_id.clone(),
            from_approval: stored.approval_id.clone(),
            to_approval: successor.approval_id.clone(),
            tier: successor.tier,
        });
        self.spawn_notify(successor.clone());
        Ok((stored, successor, context))
    }

    /// Mark `approval` expired and fail its request.
    async fn expire(&self, approval: ApprovalRequest, now: DateTime<Utc>) -> Result<RequestContext> {
        let mut expired = approval;
        expired.status = ApprovalStatus::Expired;
        let stored = self.repo().update_approval(&expired).await?;

        let reason = format!("approval {} expired at {}", stored.approval_id, stored.expires_at);
        self.states
            .transition(&stored.request_id, RequestState::Expired, &reason, |_| {})
            .await?;
        let context = self.states.fail(&stored.request_id, &reason).await?;

        debug!(approval_id = %stored.approval_id, late_by = %(now - stored.expires_at), "approval expired");
        self.bus().publish(GateEvent::ApprovalResolved {
            approval_id: stored.approval_id.clone(),
            request_id: stored.request_id.clone(),
            status: ApprovalStatus::Expired,
            action: None,
            actor: None,
        });
        Ok(context)
    }

    // ── sweep ──────────────────────────────────────────────────────────

    /// Expire (or, by policy, escalate) every pending approval past its
    /// deadline.
    #[instrument(skip(self))]
    pub async fn sweep_expired(&self) -> Result<SweepReport> {
        let now = self.now();
        let overdue = self.repo().list_overdue(now).await?;
        let mut report = SweepReport::default();

        for approval in overdue {
            let approval_id = approval.approval_id.clone();
            let escalate = self.policy.auto_escalate
                && approval.escalation_count < self.policy.max_escalations
                && approval.tier.next().is_some();

            let result = if escalate {
                self.escalate(approval, None, now).await.map(|_| ())
            } else {
                self.expire(approval, now).await.map(|_| ())
            };

            match result {
                Ok(()) if escalate => report.escalated += 1,
                Ok(()) => report.expired += 1,
                Err(HitlError::Conflict { .. }) => {
                    debug!(%approval_id, "overdue approval resolved concurrently");
                    report.skipped += 1;
                }
                Err(e) => {
                    warn!(%approval_id, error = %e, "failed to sweep approval");
                    report.errors += 1;
                }
            }
        }

        if report.touched() > 0 || report.errors > 0 {
            info!(
                expired = report.expired,
                escalated = report.escalated,
                errors = report.errors,
                "approval sweep finished"
            );
        }
        Ok(report)
    }

    // ── cancel ─────────────────────────────────────────────────────────

    /// Fail a request that has not been dispatched yet.  A pending approval
    /// is cancelled first so late decisions against it are rejected.  The
    /// pre-dispatch check is repeated on the write, so a request that
    /// reaches `dispatching` meanwhile is left to finish.
    #[instrument(skip(self))]
    pub async fn cancel(&self, request_id: &str, actor: &str) -> Result<RequestContext> {
        let ctx = self.states.get(request_id).await?;
        if !ctx.state.is_pre_dispatch() {
            return Err(HitlError::IllegalTransition {
                request_id: request_id.to_string(),
                from: ctx.state,
                to: RequestState::Failed,
            });
        }

        let filter = ApprovalFilter {
            request_id: Some(request_id.to_string()),
            ..ApprovalFilter::pending()
        };
        for approval in self.repo().list_approvals(&filter).await? {
            let mut cancelled = approval;
            cancelled.status = ApprovalStatus::Cancelled;
            cancelled.resolution = Some(DecisionRecord {
                actor: actor.to_string(),
                action: DecisionAction::Reject,
                comment: Some("request cancelled".into()),
                decided_at: self.now(),
            });
            let stored = self.repo().update_approval(&cancelled).await?;
            self.bus().publish(GateEvent::ApprovalResolved {
                approval_id: stored.approval_id.clone(),
                request_id: request_id.to_string(),
                status: ApprovalStatus::Cancelled,
                action: None,
                actor: Some(actor.to_string()),
            });
        }

        let ctx = self
            .states
            .fail_before_dispatch(request_id, &format!("cancelled by {actor}"))
            .await?;
        info!(request_id, actor, "request cancelled");
        Ok(ctx)
    }

    // ── queries ────────────────────────────────────────────────────────

    /// Pending approvals, oldest first.
    pub async fn list_pending(&self, tier: Option<ApprovalTier>) -> Result<Vec<ApprovalRequest>> {
        Ok(self
            .repo()
            .list_approvals(&ApprovalFilter::pending().with_tier(tier))
            .await?)
    }

    /// Every approval ever raised for `request_id`, oldest first.
    pub async fn history(&self, request_id: &str) -> Result<Vec<ApprovalRequest>> {
        let filter = ApprovalFilter {
            request_id: Some(request_id.to_string()),
            ..Default::default()
        };
        Ok(self.repo().list_approvals(&filter).await?)
    }

    pub async fn get_approval(&self, approval_id: &str) -> Result<ApprovalRequest> {
        self.repo()
            .get_approval(approval_id)
            .await?
            .ok_or_else(|| HitlError::NotFound {
                entity: "approval",
                id: approval_id.to_string(),
            })
    }
}

fn new_approval_id() -> String {
    format!("apr-{}", uuid::Uuid::now_v7())
}

// ═══════════════════════════════════════════════════════════════════════
//  Tests
// ═══════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::testing::{assessment, decision, parked_request};
    use gatehouse_kernel::{IntentCategory, RiskLevel, WorkflowType};
    use gatehouse_store::MemoryRepository;

    struct Fixture {
        controller: HitlController,
        clock: Arc<ManualClock>,
    }

    fn fixture(policy: ApprovalPolicy) -> Fixture {
        let states = StateManager::new(Arc::new(MemoryRepository::new()), EventBus::new(256));
        let clock = Arc::new(ManualClock::default());
        let controller = HitlController::new(states)
            .with_clock(clock.clone())
            .with_policy(policy);
        Fixture { controller, clock }
    }

    async fn pending(f: &Fixture, tier: ApprovalTier) -> ApprovalRequest {
        let id = parked_request(f.controller.states()).await;
        f.controller
            .create_approval(&decision(&id), &assessment(RiskLevel::High, tier))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn create_parks_request() {
        let f = fixture(ApprovalPolicy::default());
        let approval = pending(&f, ApprovalTier::Manager).await;
        assert!(approval.is_pending());
        assert_eq!(approval.expires_at - approval.created_at, Duration::hours(24));

        let ctx = f.controller.states().get(&approval.request_id).await.unwrap();
        assert_eq!(ctx.state, RequestState::AwaitingApproval);
        assert_eq!(ctx.approval_id.as_deref(), Some(approval.approval_id.as_str()));
    }

    #[tokio::test]
    async fn tier_none_is_refused() {
        let f = fixture(ApprovalPolicy::default());
        let id = parked_request(f.controller.states()).await;
        let err = f
            .controller
            .create_approval(&decision(&id), &assessment(RiskLevel::Low, ApprovalTier::None))
            .await
            .unwrap_err();
        assert!(matches!(err, HitlError::Validation { .. }));
    }

    #[tokio::test]
    async fn approve_then_second_decision_conflicts() {
        let f = fixture(ApprovalPolicy::default());
        let a = pending(&f, ApprovalTier::Manager).await;

        let out = f
            .controller
            .submit_decision(&a.approval_id, DecisionAction::Approve, "alice", None, None)
            .await
            .unwrap();
        assert!(out.ready_to_dispatch());
        assert_eq!(out.approval.status, ApprovalStatus::Approved);

        let err = f
            .controller
            .submit_decision(&a.approval_id, DecisionAction::Reject, "bob", None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, HitlError::Conflict { .. }));

        let stored = f.controller.get_approval(&a.approval_id).await.unwrap();
        assert_eq!(stored.status, ApprovalStatus::Approved);
        assert_eq!(stored.resolution.unwrap().actor, "alice");
    }

    #[tokio::test]
    async fn reject_fails_the_request() {
        let f = fixture(ApprovalPolicy::default());
        let a = pending(&f, ApprovalTier::Manager).await;
        let out = f
            .controller
            .submit_decision(
                &a.approval_id,
                DecisionAction::Reject,
                "alice",
                Some("not during freeze".into()),
                None,
            )
            .await
            .unwrap();
        assert_eq!(out.context.state, RequestState::Failed);
        assert!(out.context.error.unwrap().contains("not during freeze"));
        let path: Vec<_> = out.context.history.iter().map(|t| t.to).collect();
        assert!(path.ends_with(&[RequestState::Rejected, RequestState::Failed]));
    }

    #[tokio::test]
    async fn edit_stores_a_new_decision() {
        let f = fixture(ApprovalPolicy::default());
        let a = pending(&f, ApprovalTier::Manager).await;
        let edit = DecisionEdit {
            intent: Some(IntentCategory::Change),
            workflow_type: Some(WorkflowType::Sequential),
            ..Default::default()
        };
        let out = f
            .controller
            .submit_decision(&a.approval_id, DecisionAction::Edit, "alice", None, Some(edit))
            .await
            .unwrap();
        assert_eq!(out.context.state, RequestState::Edited);
        let edited = out.context.edited_decision.as_ref().unwrap();
        assert_eq!(edited.intent, IntentCategory::Change);
        assert_eq!(edited.metadata["edited_by"], "alice");
        // The original stays untouched.
        assert_eq!(out.context.decision.as_ref().unwrap().intent, IntentCategory::Incident);
        assert_eq!(
            out.context.effective_decision().unwrap().workflow_type,
            WorkflowType::Sequential
        );
    }

    #[tokio::test]
    async fn empty_edit_is_rejected() {
        let f = fixture(ApprovalPolicy::default());
        let a = pending(&f, ApprovalTier::Manager).await;
        let err = f
            .controller
            .submit_decision(&a.approval_id, DecisionAction::Edit, "alice", None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, HitlError::Validation { .. }));
        assert!(f.controller.get_approval(&a.approval_id).await.unwrap().is_pending());
    }

    #[tokio::test]
    async fn escalate_rebinds_to_next_tier() {
        let f = fixture(ApprovalPolicy::default());
        let a = pending(&f, ApprovalTier::Manager).await;
        let out = f
            .controller
            .submit_decision(&a.approval_id, DecisionAction::Escalate, "alice", None, None)
            .await
            .unwrap();
        let successor = out.successor.unwrap();
        assert_eq!(successor.tier, ApprovalTier::Security);
        assert_eq!(successor.escalation_count, 1);
        assert_eq!(out.approval.status, ApprovalStatus::Escalated);
        assert_eq!(out.approval.escalated_to.as_deref(), Some(successor.approval_id.as_str()));
        assert_eq!(out.context.state, RequestState::AwaitingApproval);
        assert_eq!(out.context.approval_id.as_deref(), Some(successor.approval_id.as_str()));

        let pending = f.controller.list_pending(None).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].approval_id, successor.approval_id);
    }

    #[tokio::test]
    async fn executive_cannot_escalate() {
        let f = fixture(ApprovalPolicy::default());
        let a = pending(&f, ApprovalTier::Executive).await;
        let err = f
            .controller
            .submit_decision(&a.approval_id, DecisionAction::Escalate, "alice", None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, HitlError::Conflict { .. }));
    }

    #[tokio::test]
    async fn late_decision_expires_inline() {
        let f = fixture(ApprovalPolicy {
            ttl_secs: 1,
            ..Default::default()
        });
        let a = pending(&f, ApprovalTier::Manager).await;
        f.clock.advance(Duration::seconds(2));

        let err = f
            .controller
            .submit_decision(&a.approval_id, DecisionAction::Approve, "alice", None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, HitlError::Expired { .. }));

        let ctx = f.controller.states().get(&a.request_id).await.unwrap();
        assert_eq!(ctx.state, RequestState::Failed);
        assert_eq!(
            f.controller.get_approval(&a.approval_id).await.unwrap().status,
            ApprovalStatus::Expired
        );

        // Asking again still reports expiry, not a generic conflict.
        let again = f
            .controller
            .submit_decision(&a.approval_id, DecisionAction::Approve, "alice", None, None)
            .await
            .unwrap_err();
        assert!(matches!(again, HitlError::Expired { .. }));
    }

    #[tokio::test]
    async fn sweep_expires_overdue_only() {
        let f = fixture(ApprovalPolicy {
            ttl_secs: 60,
            ..Default::default()
        });
        let old = pending(&f, ApprovalTier::Manager).await;
        f.clock.advance(Duration::seconds(45));
        let fresh = pending(&f, ApprovalTier::Manager).await;
        f.clock.advance(Duration::seconds(30));

        let report = f.controller.sweep_expired().await.unwrap();
        assert_eq!(report.expired, 1);
        assert_eq!(report.escalated, 0);

        assert_eq!(
            f.controller.get_approval(&old.approval_id).await.unwrap().status,
            ApprovalStatus::Expired
        );
        assert!(f.controller.get_approval(&fresh.approval_id).await.unwrap().is_pending());

        // A second sweep has nothing left to do.
        assert_eq!(f.controller.sweep_expired().await.unwrap().touched(), 0);
    }

    #[tokio::test]
    async fn sweep_auto_escalates_up_to_the_bound() {
        let f = fixture(ApprovalPolicy {
            ttl_secs: 10,
            auto_escalate: true,
            max_escalations: 1,
        });
        let a = pending(&f, ApprovalTier::Manager).await;

        f.clock.advance(Duration::seconds(11));
        let first = f.controller.sweep_expired().await.unwrap();
        assert_eq!(first.escalated, 1);
        let ctx = f.controller.states().get(&a.request_id).await.unwrap();
        assert_eq!(ctx.state, RequestState::AwaitingApproval);

        f.clock.advance(Duration::seconds(11));
        let second = f.controller.sweep_expired().await.unwrap();
        assert_eq!(second.expired, 1);
        let ctx = f.controller.states().get(&a.request_id).await.unwrap();
        assert_eq!(ctx.state, RequestState::Failed);
    }

    #[tokio::test]
    async fn cancel_blocks_late_decisions() {
        let f = fixture(ApprovalPolicy::default());
        let a = pending(&f, ApprovalTier::Manager).await;

        let ctx = f.controller.cancel(&a.request_id, "requester").await.unwrap();
        assert_eq!(ctx.state, RequestState::Failed);

        let err = f
            .controller
            .submit_decision(&a.approval_id, DecisionAction::Approve, "alice", None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, HitlError::Conflict { .. }));

        // Terminal requests cannot be cancelled again.
        let err = f.controller.cancel(&a.request_id, "requester").await.unwrap_err();
        assert!(matches!(err, HitlError::IllegalTransition { .. }));
    }

    #[tokio::test]
    async fn cancel_leaves_a_dispatching_request_alone() {
        let f = fixture(ApprovalPolicy::default());
        let a = pending(&f, ApprovalTier::Manager).await;
        f.controller
            .submit_decision(&a.approval_id, DecisionAction::Approve, "alice", None, None)
            .await
            .unwrap();
        f.controller
            .states()
            .claim(&a.request_id, RequestState::Dispatching, "cleared", |_| {})
            .await
            .unwrap();

        let err = f.controller.cancel(&a.request_id, "requester").await.unwrap_err();
        assert!(matches!(
            err,
            HitlError::IllegalTransition {
                from: RequestState::Dispatching,
                ..
            }
        ));
        let ctx = f.controller.states().get(&a.request_id).await.unwrap();
        assert_eq!(ctx.state, RequestState::Dispatching);
        assert!(ctx.error.is_none());
    }

    #[tokio::test]
    async fn decision_on_a_failed_request_is_withdrawn() {
        let f = fixture(ApprovalPolicy::default());
        let a = pending(&f, ApprovalTier::Manager).await;
        // The request is failed behind the approval's back.
        f.controller
            .states()
            .fail(&a.request_id, "cancelled by requester")
            .await
            .unwrap();

        let err = f
            .controller
            .submit_decision(&a.approval_id, DecisionAction::Approve, "alice", None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, HitlError::Conflict { entity: "request", .. }));

        let stored = f.controller.get_approval(&a.approval_id).await.unwrap();
        assert_eq!(stored.status, ApprovalStatus::Cancelled);
        assert_eq!(stored.resolution.unwrap().actor, "alice");
        let ctx = f.controller.states().get(&a.request_id).await.unwrap();
        assert_eq!(ctx.state, RequestState::Failed);
        assert!(f.controller.list_pending(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn list_pending_filters_by_tier() {
        let f = fixture(ApprovalPolicy::default());
        pending(&f, ApprovalTier::Manager).await;
        pending(&f, ApprovalTier::Security).await;
        let managers = f
            .controller
            .list_pending(Some(ApprovalTier::Manager))
            .await
            .unwrap();
        assert_eq!(managers.len(), 1);
        assert_eq!(f.controller.list_pending(None).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn unknown_approval_is_not_found() {
        let f = fixture(ApprovalPolicy::default());
        let err = f
            .controller
            .submit_decision("apr-missing", DecisionAction::Approve, "alice", None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, HitlError::NotFound { .. }));
    }
}
