//! Collaborator traits for model backends.
//!
//! The routing layers only ever see these traits, so concrete HTTP clients
//! can be swapped for in-process fakes in tests.

use async_trait::async_trait;
use serde_json::Value;

use crate::error::Result;
use crate::types::StructuredPrompt;

/// A model that can answer with JSON conforming to a schema.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Returns a value that already passed validation against `schema`.
    async fn generate_structured(&self, prompt: &StructuredPrompt, schema: &Value)
    -> Result<Value>;

    /// Identifier used in logs (`anthropic:claude-...`).
    fn name(&self) -> String;
}

/// Turns text into fixed-length vectors.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// Embed several texts.  The default issues one call per text.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut out = Vec::with_capacity(texts.len());
        for t in texts {
            out.push(self.embed(t).await?);
        }
        Ok(out)
    }

    /// Vectors from different models are never compared; stored embeddings
    /// are keyed by this id.
    fn model_id(&self) -> &str;
}
