//! Human-in-the-loop approvals for Gatehouse.
//!
//! - **Risk**: [`RiskAssessor`] scores a routing decision against the
//!   request context and picks an approval tier.
//! - **Approvals**: [`HitlController`] creates, resolves, escalates, expires
//!   and cancels [`ApprovalRequest`](gatehouse_kernel::ApprovalRequest)s.
//! - **Collaborators**: [`Notifier`] tells approvers, [`WorkflowDispatcher`]
//!   hands cleared decisions to the workflow engine.
//! - **Orchestration**: [`Pipeline`] ties routing, risk, approval and
//!   dispatch together; [`Sweeper`] enforces deadlines in the background.

pub mod clock;
pub mod controller;
pub mod dispatcher;
pub mod error;
pub mod notifier;
pub mod pipeline;
pub mod risk;
pub mod sweeper;

#[cfg(test)]
mod testing;

pub use clock::{Clock, ManualClock, SystemClock};
pub use controller::{ApprovalPolicy, DecisionOutcome, HitlController, SweepReport};
pub use dispatcher::{HttpDispatcher, LoggingDispatcher, WorkflowDispatcher};
pub use error::{HitlError, Result};
pub use notifier::{FanoutNotifier, LogNotifier, Notifier, WebhookNotifier};
pub use pipeline::{DryRunReport, MAX_TEXT_BYTES, Pipeline, RecoveryReport};
pub use risk::{LevelBoundaries, RiskAssessor, RiskConfig, RiskWeights, TierMapping};
pub use sweeper::Sweeper;
