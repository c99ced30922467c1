//! Gatehouse kernel.
//!
//! Shared domain types and the synchronous building blocks of the routing
//! and approval pipeline:
//!
//! - **[`intent`]** -- intent categories, workflow types, layer results and
//!   the immutable [`RoutingDecision`].
//! - **[`risk`]** -- risk levels, approval tiers and [`RiskAssessment`].
//! - **[`approval`]** -- [`ApprovalRequest`] records and decisions.
//! - **[`state`]** -- the request state graph and [`RequestContext`].
//! - **[`pattern`]** -- the regex/keyword rule engine ([`PatternMatcher`])
//!   with atomically swapped rule snapshots.
//! - **[`bus`]** -- broadcast event bus for audit subscribers.
//! - **[`error`]** -- [`KernelError`] via [`thiserror`].
//!
//! Everything here is `Send + Sync` and free of I/O apart from reading rule
//! files.

pub mod approval;
pub mod bus;
pub mod error;
pub mod intent;
pub mod pattern;
pub mod risk;
pub mod state;

pub use approval::{ApprovalRequest, ApprovalStatus, DecisionAction, DecisionRecord};
pub use bus::{EventBus, GateEvent};
pub use error::{KernelError, Result};
pub use intent::{
    ClassificationResult, DecisionEdit, Evidence, IntentCategory, RoutingDecision, RoutingLayer,
    WorkflowType,
};
pub use pattern::{MatchResult, PatternMatcher, PatternRule, PatternStats, RuleFile, RuleSet, RuleSpec};
pub use risk::{ApprovalTier, FactorContribution, RiskAssessment, RiskLevel};
pub use state::{Priority, RequestContext, RequestPayload, RequestState, TransitionRecord};
