//! Kernel error types.
//!
//! All kernel subsystems surface errors through [`KernelError`], which is the
//! single error type returned by every public API in this crate.  Each variant
//! carries enough context for callers to decide how to handle the failure
//! without inspecting opaque strings.

use crate::state::RequestState;

/// Unified error type for the Gatehouse kernel.
#[derive(Debug, thiserror::Error)]
pub enum KernelError {
    // -- Pattern matcher errors ----------------------------------------------
    /// A regex pattern supplied to the matcher is invalid.
    #[error("invalid pattern `{pattern}` in rule {rule_id}: {reason}")]
    InvalidPattern {
        rule_id: String,
        pattern: String,
        reason: String,
    },

    /// A rule definition is structurally invalid (empty id, no matcher,
    /// confidence out of range, duplicate id).
    #[error("invalid rule {rule_id}: {reason}")]
    InvalidRule { rule_id: String, reason: String },

    /// A rule file could not be parsed.
    #[error("rule file parse error: {reason}")]
    RuleFileParse { reason: String },

    // -- State machine errors -------------------------------------------------
    /// A request attempted a transition that is not an edge of the state
    /// graph.
    #[error("illegal transition for request {request_id}: {from} -> {to}")]
    IllegalTransition {
        request_id: String,
        from: RequestState,
        to: RequestState,
    },

    // -- Domain value errors --------------------------------------------------
    /// A string could not be parsed into one of the closed domain enums.
    #[error("unknown {kind} `{value}`")]
    UnknownValue { kind: &'static str, value: String },

    // -- Generic ------------------------------------------------------------
    /// Catch-all for unexpected internal errors that don't fit a specific
    /// variant.  Prefer a typed variant whenever possible.
    #[error("internal kernel error: {0}")]
    Internal(String),
}

/// Convenience alias used throughout the kernel crate.
pub type Result<T> = std::result::Result<T, KernelError>;
