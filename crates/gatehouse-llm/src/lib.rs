//! Model backends for Gatehouse.
//!
//! - **[`provider`]** -- the [`LlmProvider`] and [`EmbeddingProvider`]
//!   collaborator traits the routing layers depend on.
//! - **[`client`]** -- [`LlmClient`], speaking the Anthropic Messages and
//!   OpenAI Chat Completions formats, with schema-validated structured output.
//! - **[`embedding`]** -- [`EmbeddingClient`] for OpenAI-compatible
//!   `/embeddings` endpoints.
//! - **[`structured`]** -- JSON extraction and draft-7 schema validation.

pub mod client;
pub mod embedding;
pub mod error;
pub mod provider;
pub mod structured;
pub mod types;

pub use client::{LlmClient, LlmClientConfig, ProviderKind};
pub use embedding::{EmbeddingClient, EmbeddingClientConfig};
pub use error::{ProviderError, Result};
pub use provider::{EmbeddingProvider, LlmProvider};
pub use types::{ChatRequest, LlmResponse, Message, Role, StructuredPrompt, Usage};
