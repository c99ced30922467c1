//! The trait every cascade layer implements.

use std::collections::BTreeMap;

use async_trait::async_trait;
use gatehouse_kernel::{ClassificationResult, MatchResult, PatternMatcher, RoutingLayer};
use serde_json::Value;

use crate::error::IntentError;

/// Request context as submitted by the caller (`production`, `pii`, ...).
pub type ContextMap = BTreeMap<String, Value>;

/// What a single layer concluded about a text.
#[derive(Debug, Clone)]
pub enum LayerOutcome {
    /// The layer is confident; the cascade stops here.
    Matched(ClassificationResult),
    /// The layer ran and found nothing good enough.
    NoMatch { reason: String },
    /// The layer could not run (provider error, invalid output, timeout).
    Failed { reason: String, timed_out: bool },
}

impl LayerOutcome {
    pub fn failed(err: &IntentError) -> Self {
        Self::Failed {
            reason: err.to_string(),
            timed_out: err.is_timeout(),
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Failed { timed_out: true, .. })
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            Self::Matched(_) => None,
            Self::NoMatch { reason } | Self::Failed { reason, .. } => Some(reason),
        }
    }
}

/// One stage of the routing cascade.
#[async_trait]
pub trait ClassificationLayer: Send + Sync {
    fn layer(&self) -> RoutingLayer;

    /// Never returns an error: failures are reported as
    /// [`LayerOutcome::Failed`] so the cascade can move on.
    async fn classify(&self, text: &str, context: &ContextMap) -> LayerOutcome;
}

/// Convert a rule-engine result into a layer outcome.
pub fn pattern_outcome(result: MatchResult) -> LayerOutcome {
    match result.rule {
        Some(rule) if result.matched => LayerOutcome::Matched(rule.classification()),
        _ => LayerOutcome::NoMatch {
            reason: "no rule matched".into(),
        },
    }
}

#[async_trait]
impl ClassificationLayer for PatternMatcher {
    fn layer(&self) -> RoutingLayer {
        RoutingLayer::Pattern
    }

    async fn classify(&self, text: &str, _context: &ContextMap) -> LayerOutcome {
        pattern_outcome(self.match_text(text))
    }
}
