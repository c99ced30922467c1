//! Error types for the gatehouse-store crate.
//!
//! All storage operations return [`StoreError`] via [`StoreResult`].

use gatehouse_kernel::{KernelError, RequestState};
use thiserror::Error;

/// Alias for `Result<T, StoreError>`.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors that can occur in the storage layer.
#[derive(Debug, Error)]
pub enum StoreError {
    /// SQLite operation failed.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// JSON serialization or deserialization failed.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// A schema migration failed.
    #[error("migration v{version} failed: {message}")]
    Migration { version: u32, message: String },

    /// The requested record was not found.
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    /// An insert collided with an existing primary key.
    #[error("{entity} already exists: {id}")]
    AlreadyExists { entity: &'static str, id: String },

    /// Compare-and-swap on the `version` column lost a race.
    #[error("{entity} {id} was modified concurrently (expected version {expected})")]
    Conflict {
        entity: &'static str,
        id: String,
        expected: i64,
    },

    /// The state graph has no edge for the attempted move.
    #[error("illegal transition for request {request_id}: {from} -> {to}")]
    IllegalTransition {
        request_id: String,
        from: RequestState,
        to: RequestState,
    },

    /// A stored value could not be decoded back into a domain type.
    #[error("corrupt {entity} record {id}: {reason}")]
    Corrupt {
        entity: &'static str,
        id: String,
        reason: String,
    },

    /// A blocking task was cancelled or panicked.
    #[error("background task failed: {0}")]
    TaskJoin(String),
}

impl From<tokio::task::JoinError> for StoreError {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::TaskJoin(err.to_string())
    }
}

impl From<KernelError> for StoreError {
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
            other => Self::Corrupt {
                entity: "domain value",
                id: String::new(),
                reason: other.to_string(),
            },
        }
    }
}
