//! Structured-output LLM classifier: the last layer before fallback.
//!
//! The model receives a fixed instruction that enumerates the closed set of
//! intent categories and workflow types, plus a JSON schema.  Whatever comes
//! back is checked field by field here as well, because not every provider
//! enforces the schema: an unknown category, workflow or risk level, a
//! confidence out of range or below `min_confidence`, or a missing field all
//! produce `success = false` with the reason recorded.

use std::sync::{Arc, LazyLock};

use async_trait::async_trait;
use gatehouse_kernel::{
    ClassificationResult, Evidence, IntentCategory, RiskLevel, RoutingLayer, WorkflowType,
};
use gatehouse_llm::{LlmProvider, ProviderError, StructuredPrompt};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, warn};

use crate::error::{IntentError, Result};
use crate::layer::{ClassificationLayer, ContextMap, LayerOutcome};

/// Default floor below which a model answer is discarded.
pub const DEFAULT_MIN_CONFIDENCE: f64 = 0.5;

static SYSTEM_PROMPT: LazyLock<String> = LazyLock::new(|| {
    let intents: Vec<&str> = IntentCategory::CLASSIFIABLE
        .iter()
        .map(|c| c.as_str())
        .collect();
    let workflows: Vec<&str> = WorkflowType::ALL.iter().map(|w| w.as_str()).collect();
    format!(
        "You classify inbound IT operations requests.\n\
         \n\
         Respond ONLY with a JSON object with these fields:\n\
         - intent_category: one of {intents}\n\
         - sub_intent: short snake_case label (e.g. password_reset, etl_failure)\n\
         - workflow_type: one of {workflows}\n\
         - confidence: number between 0.0 and 1.0\n\
         - risk_level: one of low, medium, high, critical\n\
         - requires_approval: true if a human should review before anything runs\n\
         - reasoning: one or two sentences explaining the judgement\n\
         \n\
         Use human_queue when no automated workflow fits.",
        intents = intents.join(", "),
        workflows = workflows.join(", "),
    )
});

static RESPONSE_SCHEMA: LazyLock<Value> = LazyLock::new(|| {
    let intents: Vec<&str> = IntentCategory::CLASSIFIABLE
        .iter()
        .map(|c| c.as_str())
        .collect();
    let workflows: Vec<&str> = WorkflowType::ALL.iter().map(|w| w.as_str()).collect();
    json!({
        "type": "object",
        "required": [
            "intent_category", "sub_intent", "workflow_type", "confidence",
            "risk_level", "requires_approval", "reasoning"
        ],
        "properties": {
            "intent_category": { "type": "string", "enum": intents },
            "sub_intent": { "type": "string", "minLength": 1 },
            "workflow_type": { "type": "string", "enum": workflows },
            "confidence": { "type": "number", "minimum": 0.0, "maximum": 1.0 },
            "risk_level": { "type": "string", "enum": ["low", "medium", "high", "critical"] },
            "requires_approval": { "type": "boolean" },
            "reasoning": { "type": "string" }
        }
    })
});

/// The schema sent with every classification prompt.
pub fn response_schema() -> &'static Value {
    &RESPONSE_SCHEMA
}

/// Validated (or rejected) model answer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LlmClassificationResult {
    pub success: bool,
    pub intent_category: IntentCategory,
    pub sub_intent: String,
    pub workflow_type: WorkflowType,
    pub confidence: f64,
    pub risk_level: Option<RiskLevel>,
    pub requires_approval: bool,
    pub reasoning: String,
    /// Why the answer was rejected, when `success` is false.
    pub failure: Option<String>,
}

impl LlmClassificationResult {
    fn rejected(reason: impl Into<String>) -> Self {
        Self {
            success: false,
            intent_category: IntentCategory::Unknown,
            sub_intent: String::new(),
            workflow_type: WorkflowType::HumanQueue,
            confidence: 0.0,
            risk_level: None,
            requires_approval: true,
            reasoning: String::new(),
            failure: Some(reason.into()),
        }
    }

    pub fn classification(&self) -> Option<ClassificationResult> {
        if !self.success {
            return None;
        }
        Some(ClassificationResult {
            matched: true,
            intent: self.intent_category,
            sub_intent: self.sub_intent.clone(),
            workflow: self.workflow_type,
            confidence: self.confidence,
            layer: RoutingLayer::Llm,
            evidence: Evidence::Rationale {
                reasoning: self.reasoning.clone(),
                risk_hint: self.risk_level,
                requires_approval: self.requires_approval,
            },
        })
    }
}

pub struct LlmClassifier {
    provider: Arc<dyn LlmProvider>,
    min_confidence: f64,
}

impl LlmClassifier {
    pub fn new(provider: Arc<dyn LlmProvider>) -> Self {
        Self {
            provider,
            min_confidence: DEFAULT_MIN_CONFIDENCE,
        }
    }

    pub fn with_min_confidence(mut self, min_confidence: f64) -> Self {
        self.min_confidence = min_confidence.clamp(0.0, 1.0);
        self
    }

    /// Transport errors (including timeouts) are returned as `Err`; an
    /// answer that fails validation is `Ok` with `success = false`.
    pub async fn classify_text(&self, text: &str, context: &ContextMap) -> Result<LlmClassificationResult> {
        let prompt = StructuredPrompt {
            system: SYSTEM_PROMPT.clone(),
            user: build_user_prompt(text, context),
        };

        let value = match self
            .provider
            .generate_structured(&prompt, response_schema())
            .await
        {
            Ok(v) => v,
            Err(
                e @ (ProviderError::SchemaViolation { .. } | ProviderError::ParseFailed { .. }),
            ) => {
                warn!(provider = %self.provider.name(), error = %e, "llm answer rejected");
                return Ok(LlmClassificationResult::rejected(e.to_string()));
            }
            Err(e) => return Err(e.into()),
        };

        let result = match self.validate(&value) {
            Ok(r) => r,
            Err(IntentError::InvalidClassification { reason }) => {
                warn!(provider = %self.provider.name(), %reason, "llm answer rejected");
                LlmClassificationResult::rejected(reason)
            }
            Err(other) => return Err(other),
        };
        debug!(
            success = result.success,
            intent = %result.intent_category,
            confidence = result.confidence,
            "llm classification"
        );
        Ok(result)
    }

    fn validate(&self, value: &Value) -> Result<LlmClassificationResult> {
        let invalid = |reason: String| IntentError::InvalidClassification { reason };
        let obj = value
            .as_object()
            .ok_or_else(|| invalid("answer is not a JSON object".into()))?;
        let field = |name: &str| {
            obj.get(name)
                .ok_or_else(|| invalid(format!("missing field `{name}`")))
        };
        let string = |name: &str| -> Result<String> {
            field(name)?
                .as_str()
                .map(str::to_string)
                .ok_or_else(|| invalid(format!("`{name}` must be a string")))
        };

        let intent_category: IntentCategory = string("intent_category")?
            .parse()
            .map_err(|e| invalid(format!("{e}")))?;
        if !IntentCategory::CLASSIFIABLE.contains(&intent_category) {
            return Err(invalid(format!(
                "intent_category `{intent_category}` is outside the allowed set"
            )));
        }
        let workflow_type: WorkflowType = string("workflow_type")?
            .parse()
            .map_err(|e| invalid(format!("{e}")))?;
        let risk_level: RiskLevel = string("risk_level")?
            .parse()
            .map_err(|e| invalid(format!("{e}")))?;
        let sub_intent = string("sub_intent")?.trim().to_string();
        if sub_intent.is_empty() {
            return Err(invalid("sub_intent must not be empty".into()));
        }
        let confidence = field("confidence")?
            .as_f64()
            .ok_or_else(|| invalid("`confidence` must be a number".into()))?;
        if !(0.0..=1.0).contains(&confidence) {
            return Err(invalid(format!("confidence {confidence} outside [0, 1]")));
        }
        if confidence < self.min_confidence {
            return Err(invalid(format!(
                "confidence {confidence:.2} below minimum {:.2}",
                self.min_confidence
            )));
        }
        let requires_approval = field("requires_approval")?
            .as_bool()
            .ok_or_else(|| invalid("`requires_approval` must be a boolean".into()))?;
        let reasoning = string("reasoning")?;

        Ok(LlmClassificationResult {
            success: true,
            intent_category,
            sub_intent,
            workflow_type,
            confidence,
            risk_level: Some(risk_level),
            requires_approval,
            reasoning,
            failure: None,
        })
    }
}

fn build_user_prompt(text: &str, context: &ContextMap) -> String {
    if context.is_empty() {
        return format!("Request:\n{text}");
    }
    let ctx = serde_json::to_string(context).unwrap_or_default();
    format!("Request:\n{text}\n\nContext:\n{ctx}")
}

#[async_trait]
impl ClassificationLayer for LlmClassifier {
    fn layer(&self) -> RoutingLayer {
        RoutingLayer::Llm
    }

    async fn classify(&self, text: &str, context: &ContextMap) -> LayerOutcome {
        match self.classify_text(text, context).await {
            Ok(result) => match result.classification() {
                Some(c) => LayerOutcome::Matched(c),
                None => LayerOutcome::Failed {
                    reason: result
                        .failure
                        .unwrap_or_else(|| "classification rejected".into()),
                    timed_out: false,
                },
            },
            Err(err) => LayerOutcome::failed(&err),
        }
    }
}
