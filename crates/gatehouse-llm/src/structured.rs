//! Extracting and validating JSON from model text output.

use jsonschema::{Draft, JSONSchema};
use serde_json::Value;

use crate::error::{ProviderError, Result};

/// Compile a draft-7 schema.
pub fn compile_schema(schema: &Value) -> Result<JSONSchema> {
    JSONSchema::options()
        .with_draft(Draft::Draft7)
        .compile(schema)
        .map_err(|e| ProviderError::InvalidSchema {
            reason: e.to_string(),
        })
}

/// Parse the first JSON object out of a model reply.
///
/// Models often wrap JSON in markdown fences or add a sentence around it;
/// both are tolerated.
pub fn extract_json(text: &str) -> Result<Value> {
    let cleaned = text.trim();
    let cleaned = cleaned.strip_prefix("```json").unwrap_or(cleaned);
    let cleaned = cleaned.strip_prefix("```").unwrap_or(cleaned);
    let cleaned = cleaned.strip_suffix("```").unwrap_or(cleaned);
    let cleaned = cleaned.trim();

    if let Ok(v) = serde_json::from_str::<Value>(cleaned) {
        return Ok(v);
    }

    let start = cleaned.find('{');
    let end = cleaned.rfind('}');
    match (start, end) {
        (Some(s), Some(e)) if s < e => {
            serde_json::from_str(&cleaned[s..=e]).map_err(|err| ProviderError::ParseFailed {
                reason: format!("no valid JSON object in model output: {err}"),
            })
        }
        _ => Err(ProviderError::ParseFailed {
            reason: "model output contains no JSON object".into(),
        }),
    }
}

/// Validate `value` against a compiled schema, joining every violation.
pub fn validate(schema: &JSONSchema, value: &Value) -> Result<()> {
    if let Err(errors) = schema.validate(value) {
        let messages: Vec<String> = errors
            .map(|e| {
                let path = e.instance_path.to_string();
                if path.is_empty() {
                    e.to_string()
                } else {
                    format!("{path}: {e}")
                }
            })
            .collect();
        return Err(ProviderError::SchemaViolation {
            reason: messages.join(", "),
        });
    }
    Ok(())
}
