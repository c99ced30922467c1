//! Approval pipeline error types.
//!
//! [`HitlError`] is what the REST surface ultimately maps to status codes,
//! so the variants follow the caller-visible taxonomy: validation, not
//! found, conflict, expired, dispatch.  Store errors are translated into
//! those categories where they have a meaning for the caller.

use gatehouse_kernel::{KernelError, RequestState};
use gatehouse_store::StoreError;

/// Unified error type for the approval pipeline.
#[derive(Debug, thiserror::Error)]
pub enum HitlError {
    /// The input was rejected before anything was persisted.
    #[error("validation failed: {reason}")]
    Validation { reason: String },

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    /// Lost a race, or the record is already resolved.
    #[error("conflict on {entity} {id}: {reason}")]
    Conflict {
        entity: &'static str,
        id: String,
        reason: String,
    },

    /// The state graph has no edge for the attempted move.
    #[error("illegal transition for request {request_id}: {from} -> {to}")]
    IllegalTransition {
        request_id: String,
        from: RequestState,
        to: RequestState,
    },

    /// The approval deadline has passed.
    #[error("approval {approval_id} expired")]
    Expired { approval_id: String },

    /// The workflow engine refused or failed the hand-off.
    #[error("dispatch failed: {reason}")]
    Dispatch { reason: String },

    /// Best-effort notification failed; only ever logged.
    #[error("notification failed: {reason}")]
    Notify { reason: String },

    /// Any other storage failure.
    #[error("store error: {0}")]
    Store(StoreError),

    #[error("invalid configuration: {reason}")]
    Config { reason: String },
}

impl HitlError {
    pub fn validation(reason: impl Into<String>) -> Self {
        Self::Validation {
            reason: reason.into(),
        }
    }
}

impl From<StoreError> for HitlError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound { entity, id } => Self::NotFound { entity, id },
            StoreError::Conflict {
                entity,
                id,
                expected,
            } => Self::Conflict {
                entity,
                id,
                reason: format!("modified concurrently (expected version {expected})"),
            },
            StoreError::AlreadyExists { entity, id } => Self::Conflict {
                entity,
                id,
                reason: "already exists".into(),
            },
            StoreError::IllegalTransition {
                request_id,
                from,
                to,
            } => Self::IllegalTransition {
                request_id,
                from,
                to,
            },
            other => Self::Store(other),
        }
    }
}

impl From<KernelError> for HitlError {
    fn from(err: KernelError) -> Self {
        match err {
            KernelError::IllegalTransition {
                request_id,
                from,
                to,
            } => Self::IllegalTransition {
                request_id,
                from,
                to,
            },
            other => Self::Validation {
                reason: other.to_string(),
            },
        }
    }
}

/// Convenience alias used throughout the hitl crate.
pub type Result<T> = std::result::Result<T, HitlError>;
