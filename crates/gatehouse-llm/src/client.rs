//! Multi-provider LLM client.
//!
//! Supports the **Anthropic Messages API** and the **OpenAI Chat Completions
//! API** (including OpenAI-compatible endpoints such as Ollama and vLLM) in
//! non-streaming mode.  Classification only needs a single JSON answer, so
//! there is no SSE handling here.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderValue};
use serde_json::{Value, json};

use crate::error::{ProviderError, Result};
use crate::provider::LlmProvider;
use crate::structured::{compile_schema, extract_json, validate};
use crate::types::{ChatRequest, LlmResponse, Message, Role, StructuredPrompt, Usage};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

const ANTHROPIC_BASE_URL: &str = "https://api.anthropic.com";

const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";

const ANTHROPIC_VERSION: &str = "2023-06-01";

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Which wire format the client speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    Anthropic,
    /// OpenAI and every OpenAI-compatible endpoint.
    OpenAi,
}

impl ProviderKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Anthropic => "anthropic",
            Self::OpenAi => "openai",
        }
    }
}

#[derive(Debug, Clone)]
pub struct LlmClientConfig {
    pub provider: ProviderKind,
    pub api_key: String,
    /// Base URL for the API (e.g. `https://api.anthropic.com`).
    pub base_url: String,
    pub default_model: String,
    pub max_tokens: u32,
    /// Upper bound for a single HTTP round trip.
    pub request_timeout: Duration,
}

impl LlmClientConfig {
    pub fn anthropic(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            provider: ProviderKind::Anthropic,
            api_key: api_key.into(),
            base_url: ANTHROPIC_BASE_URL.to_owned(),
            default_model: model.into(),
            max_tokens: 1024,
            request_timeout: Duration::from_secs(30),
        }
    }

    pub fn openai(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            provider: ProviderKind::OpenAi,
            api_key: api_key.into(),
            base_url: OPENAI_BASE_URL.to_owned(),
            default_model: model.into(),
            max_tokens: 1024,
            request_timeout: Duration::from_secs(30),
        }
    }

    /// Any OpenAI-compatible API (Ollama, Together, vLLM).
    pub fn openai_compatible(
        api_key: impl Into<String>,
        model: impl Into<String>,
        base_url: impl Into<String>,
    ) -> Self {
        Self {
            base_url: base_url.into(),
            ..Self::openai(api_key, model)
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// A chat client for either the Anthropic or the OpenAI wire format.
#[derive(Debug, Clone)]
pub struct LlmClient {
    config: LlmClientConfig,
    http: reqwest::Client,
}

impl LlmClient {
    pub fn new(config: LlmClientConfig) -> Result<Self> {
        if config.api_key.is_empty() {
            return Err(ProviderError::MissingApiKey {
                provider: config.provider.as_str().into(),
            });
        }

        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| ProviderError::RequestFailed {
                reason: format!("failed to build HTTP client: {e}"),
            })?;

        Ok(Self { config, http })
    }

    pub fn provider(&self) -> ProviderKind {
        self.config.provider
    }

    pub fn default_model(&self) -> &str {
        &self.config.default_model
    }

    /// Send a chat request and return the full text response.
    pub async fn chat(&self, request: &ChatRequest) -> Result<LlmResponse> {
        let (url, headers, body) = match self.config.provider {
            ProviderKind::Anthropic => (
                format!("{}/v1/messages", self.config.base_url),
                self.anthropic_headers()?,
                self.build_anthropic_request_body(request),
            ),
            ProviderKind::OpenAi => (
                format!("{}/chat/completions", self.config.base_url),
                self.openai_headers()?,
                self.build_openai_request_body(request),
            ),
        };

        tracing::debug!(
            url = %url,
            model = %body["model"],
            provider = self.config.provider.as_str(),
            "sending LLM request"
        );

        let v = self.post_json(&url, headers, &body).await?;
        match self.config.provider {
            ProviderKind::Anthropic => parse_anthropic_response(&v),
            ProviderKind::OpenAi => parse_openai_response(&v),
        }
    }

    async fn post_json(&self, url: &str, headers: HeaderMap, body: &Value) -> Result<Value> {
        let timeout_ms = self.config.request_timeout.as_millis() as u64;
        let resp = self
            .http
            .post(url)
            .headers(headers)
            .json(body)
            .send()
            .await
            .map_err(|e| ProviderError::from_reqwest(e, timeout_ms))?;

        let status = resp.status();
        let text = resp
            .text()
            .await
            .map_err(|e| ProviderError::from_reqwest(e, timeout_ms))?;

        if !status.is_success() {
            return Err(ProviderError::Status {
                status: status.as_u16(),
                body: text,
            });
        }

        serde_json::from_str(&text).map_err(|e| ProviderError::ParseFailed {
            reason: format!("invalid JSON response: {e}"),
        })
    }

    // -- Anthropic -------------------------------------------------------------

    fn anthropic_headers(&self) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-api-key",
            HeaderValue::from_str(&self.config.api_key).map_err(|e| {
                ProviderError::RequestFailed {
                    reason: format!("invalid API key header: {e}"),
                }
            })?,
        );
        headers.insert(
            "anthropic-version",
            HeaderValue::from_static(ANTHROPIC_VERSION),
        );
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        Ok(headers)
    }

    /// Anthropic takes the system prompt as a top-level field.
    fn build_anthropic_request_body(&self, request: &ChatRequest) -> Value {
        let mut system_parts = Vec::new();
        let mut messages = Vec::new();
        for msg in &request.messages {
            match msg.role {
                Role::System => system_parts.push(msg.content.as_str()),
                Role::User => messages.push(json!({"role": "user", "content": msg.content})),
                Role::Assistant => {
                    messages.push(json!({"role": "assistant", "content": msg.content}))
                }
            }
        }

        let mut body = json!({
            "model": self.model_for(request),
            "max_tokens": request.max_tokens.unwrap_or(self.config.max_tokens),
            "messages": messages,
        });
        if !system_parts.is_empty() {
            body["system"] = json!(system_parts.join("\n\n"));
        }
        if let Some(temp) = request.temperature {
            body["temperature"] = json!(temp);
        }
        body
    }

    // -- OpenAI ----------------------------------------------------------------

    fn openai_headers(&self) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        let auth_value = format!("Bearer {}", self.config.api_key);
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&auth_value).map_err(|e| ProviderError::RequestFailed {
                reason: format!("invalid authorization header: {e}"),
            })?,
        );
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        Ok(headers)
    }

    fn build_openai_request_body(&self, request: &ChatRequest) -> Value {
        let messages: Vec<Value> = request
            .messages
            .iter()
            .map(|m| json!({"role": m.role, "content": m.content}))
            .collect();

        let mut body = json!({
            "model": self.model_for(request),
            "max_tokens": request.max_tokens.unwrap_or(self.config.max_tokens),
            "messages": messages,
        });
        if let Some(temp) = request.temperature {
            body["temperature"] = json!(temp);
        }
        if request.json_mode {
            body["response_format"] = json!({"type": "json_object"});
        }
        body
    }

    fn model_for<'a>(&'a self, request: &'a ChatRequest) -> &'a str {
        if request.model.is_empty() {
            &self.config.default_model
        } else {
            &request.model
        }
    }
}

#[async_trait]
impl LlmProvider for LlmClient {
    async fn generate_structured(
        &self,
        prompt: &StructuredPrompt,
        schema: &Value,
    ) -> Result<Value> {
        let compiled = compile_schema(schema)?;

        let system = format!(
            "{}\n\nRespond with a single JSON object that validates against this JSON schema \
             and nothing else:\n{}",
            prompt.system, schema
        );
        let request = ChatRequest {
            messages: vec![Message::system(system), Message::user(prompt.user.clone())],
            temperature: Some(0.0),
            json_mode: true,
            ..Default::default()
        };

        let response = self.chat(&request).await?;
        let value = extract_json(&response.text)?;
        validate(&compiled, &value)?;
        Ok(value)
    }

    fn name(&self) -> String {
        format!("{}:{}", self.config.provider.as_str(), self.config.default_model)
    }
}

// ===========================================================================
// Response parsing (free functions)
// ===========================================================================

/// Parse a non-streaming Anthropic Messages API response.
fn parse_anthropic_response(v: &Value) -> Result<LlmResponse> {
    let content = v["content"]
        .as_array()
        .ok_or_else(|| ProviderError::ParseFailed {
            reason: "missing `content` array in response".into(),
        })?;

    let text: String = content
        .iter()
        .filter(|block| block["type"] == "text")
        .filter_map(|block| block["text"].as_str())
        .collect();

    let usage = v["usage"].as_object().map(|u| Usage {
        input_tokens: u.get("input_tokens").and_then(Value::as_u64).unwrap_or(0) as u32,
        output_tokens: u.get("output_tokens").and_then(Value::as_u64).unwrap_or(0) as u32,
    });

    Ok(LlmResponse { text, usage })
}

/// Parse a non-streaming OpenAI Chat Completions API response.
pub fn parse_openai_response(v: &Value) -> Result<LlmResponse> {
    let message = &v["choices"][0]["message"];
    if message.is_null() {
        return Err(ProviderError::ParseFailed {
            reason: "missing `choices[0].message` in response".into(),
        });
    }

    let usage = v["usage"].as_object().map(|u| Usage {
        input_tokens: u.get("prompt_tokens").and_then(Value::as_u64).unwrap_or(0) as u32,
        output_tokens: u
            .get("completion_tokens")
            .and_then(Value::as_u64)
            .unwrap_or(0) as u32,
    });

    Ok(LlmResponse {
        text: message["content"].as_str().unwrap_or_default().to_owned(),
        usage,
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
