//! Intent routing error types.
//!
//! The cascade itself never fails: every [`IntentError`] raised by a layer is
//! absorbed, counted and turned into a miss.  The variants matter to callers
//! driving a layer directly (loading routes, reindexing, tests).

use gatehouse_kernel::KernelError;
use gatehouse_llm::ProviderError;
use gatehouse_store::StoreError;

/// Unified error type for the routing layers.
#[derive(Debug, thiserror::Error)]
pub enum IntentError {
    // -- Semantic router -----------------------------------------------------
    /// `route()` was called before `initialize()` built the index.
    #[error("semantic router is not initialized")]
    NotInitialized,

    /// A route definition failed validation.
    #[error("invalid route `{route}`: {reason}")]
    InvalidRoute { route: String, reason: String },

    /// A route file could not be read or parsed.
    #[error("failed to parse route file: {reason}")]
    RouteFileParse { reason: String },

    /// The provider returned a vector of unexpected length.
    #[error("embedding dimension mismatch: index has {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    // -- LLM classifier ------------------------------------------------------
    /// The model answered, but the answer is unusable.
    #[error("invalid classification: {reason}")]
    InvalidClassification { reason: String },

    // -- Upstream crate errors -----------------------------------------------
    /// An error propagated from a model provider.
    #[error("provider error: {0}")]
    Provider(#[from] ProviderError),

    /// An error propagated from the store crate.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// An error propagated from the kernel crate.
    #[error("kernel error: {0}")]
    Kernel(#[from] KernelError),

    // -- Generic -------------------------------------------------------------
    /// Catch-all for unexpected internal errors.
    #[error("internal intent error: {0}")]
    Internal(String),
}

impl IntentError {
    /// Provider timeouts are the only failures the cascade retries.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Provider(e) if e.is_timeout())
    }
}

/// Convenience alias used throughout the intent crate.
pub type Result<T> = std::result::Result<T, IntentError>;
