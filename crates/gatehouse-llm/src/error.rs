//! Provider error types.
//!
//! Everything that can go wrong talking to an LLM or embedding endpoint
//! surfaces as a [`ProviderError`].  The routing cascade distinguishes
//! timeouts (retried once) from every other failure (next layer).

/// Unified error type for provider calls.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    // -- Configuration ---------------------------------------------------------
    /// The API key is missing for a provider that requires one.
    #[error("missing api key for provider: {provider}")]
    MissingApiKey { provider: String },

    /// The JSON schema handed to the provider does not compile.
    #[error("invalid json schema: {reason}")]
    InvalidSchema { reason: String },

    // -- Transport -------------------------------------------------------------
    /// The HTTP request could not be sent or the body could not be read.
    #[error("provider request failed: {reason}")]
    RequestFailed { reason: String },

    /// The provider answered with a non-success status.
    #[error("provider returned {status}: {body}")]
    Status { status: u16, body: String },

    /// The call did not complete in time.
    #[error("provider call timed out after {after_ms} ms")]
    Timeout { after_ms: u64 },

    // -- Response --------------------------------------------------------------
    /// The response could not be parsed into the expected shape.
    #[error("provider response parse error: {reason}")]
    ParseFailed { reason: String },

    /// The structured output parsed but does not satisfy the schema.
    #[error("structured output violates schema: {reason}")]
    SchemaViolation { reason: String },
}

impl ProviderError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Map a reqwest transport error, keeping timeouts distinguishable.
    pub(crate) fn from_reqwest(err: reqwest::Error, timeout_ms: u64) -> Self {
        if err.is_timeout() {
            Self::Timeout {
                after_ms: timeout_ms,
            }
        } else {
            Self::RequestFailed {
                reason: err.to_string(),
            }
        }
    }
}

/// Convenience alias used throughout the provider crate.
pub type Result<T> = std::result::Result<T, ProviderError>;
