//! Wire-agnostic request and response types.
//!
//! The [`super::client`] module translates these into the Anthropic Messages
//! or OpenAI Chat Completions formats.

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Instructions that shape model behavior.
    System,
    User,
    Assistant,
}

/// A single message in a conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    #[serde(default)]
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Chat request / response
// ---------------------------------------------------------------------------

/// A full request to send to an LLM provider.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ChatRequest {
    /// Empty means "use the client's default model".
    pub model: String,

    pub messages: Vec<Message>,

    /// Sampling temperature (0.0 = deterministic).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,

    /// Ask OpenAI-compatible endpoints for a JSON object response.
    #[serde(skip)]
    pub json_mode: bool,
}

/// The text a model produced, plus billing info when the provider sent it.
#[derive(Debug, Clone, Default)]
pub struct LlmResponse {
    pub text: String,
    pub usage: Option<Usage>,
}

// ---------------------------------------------------------------------------
// Structured output
// ---------------------------------------------------------------------------

/// Input to [`crate::LlmProvider::generate_structured`].
#[derive(Debug, Clone)]
pub struct StructuredPrompt {
    /// Fixed instruction describing the task and the allowed values.
    pub system: String,
    /// The per-call payload.
    pub user: String,
}

// ---------------------------------------------------------------------------
// Usage tracking
// ---------------------------------------------------------------------------

/// Token usage information returned by the LLM.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}
