//! End-to-end tests for the provider clients.
//!
//! A stub Axum server on an ephemeral port stands in for the provider, so
//! the full request/response cycle (headers, body, parsing, validation) is
//! exercised without network access.

use std::net::SocketAddr;
use std::time::Duration;

use axum::Json;
use axum::Router;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::post;
use serde_json::{Value, json};
use tokio::net::TcpListener;

use gatehouse_llm::{
    EmbeddingClient, EmbeddingClientConfig, EmbeddingProvider, LlmClient, LlmClientConfig,
    LlmProvider, ProviderError, StructuredPrompt,
};

// ── helpers ──────────────────────────────────────────────────────────────────

async fn start_stub(app: Router) -> String {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind to port 0");
    let addr: SocketAddr = listener.local_addr().expect("get local addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.ok();
    });
    tokio::time::sleep(Duration::from_millis(10)).await;
    format!("http://127.0.0.1:{}", addr.port())
}

fn classification_schema() -> Value {
    json!({
        "type": "object",
        "required": ["intent_category", "confidence"],
        "properties": {
            "intent_category": {"type": "string", "enum": ["incident", "request", "change", "query"]},
            "confidence": {"type": "number", "minimum": 0, "maximum": 1}
        }
    })
}

fn prompt() -> StructuredPrompt {
    StructuredPrompt {
        system: "Classify the request.".into(),
        user: "reset my password".into(),
    }
}

// ── chat completions ─────────────────────────────────────────────────────────

#[tokio::test]
async fn openai_structured_output_is_parsed_and_validated() {
    let app = Router::new().route(
        "/chat/completions",
        post(|headers: HeaderMap, Json(body): Json<Value>| async move {
            assert_eq!(
                headers.get("authorization").and_then(|v| v.to_str().ok()),
                Some("Bearer sk-test")
            );
            assert_eq!(body["response_format"]["type"], "json_object");
            let content = "```json\n{\"intent_category\": \"request\", \"confidence\": 0.8}\n```";
            Json(json!({"choices": [{"message": {"role": "assistant", "content": content}}]}))
        }),
    );
    let base = start_stub(app).await;

    let client =
        LlmClient::new(LlmClientConfig::openai_compatible("sk-test", "stub-model", base)).unwrap();
    let value = client
        .generate_structured(&prompt(), &classification_schema())
        .await
        .unwrap();
    assert_eq!(value["intent_category"], "request");
}

#[tokio::test]
async fn schema_violations_are_reported() {
    let app = Router::new().route(
        "/chat/completions",
        post(|| async {
            let content = "{\"intent_category\": \"billing\", \"confidence\": 0.8}";
            Json(json!({"choices": [{"message": {"content": content}}]}))
        }),
    );
    let base = start_stub(app).await;

    let client = LlmClient::new(LlmClientConfig::openai_compatible("k", "m", base)).unwrap();
    let err = client
        .generate_structured(&prompt(), &classification_schema())
        .await
        .unwrap_err();
    assert!(matches!(err, ProviderError::SchemaViolation { .. }), "{err:?}");
}

#[tokio::test]
async fn anthropic_messages_round_trip() {
    let app = Router::new().route(
        "/v1/messages",
        post(|headers: HeaderMap, Json(body): Json<Value>| async move {
            assert_eq!(
                headers.get("x-api-key").and_then(|v| v.to_str().ok()),
                Some("ak-test")
            );
            assert!(body["system"].as_str().unwrap().contains("JSON schema"));
            Json(json!({
                "content": [{"type": "text", "text": "{\"intent_category\": \"incident\", \"confidence\": 0.9}"}]
            }))
        }),
    );
    let base = start_stub(app).await;

    let mut cfg = LlmClientConfig::anthropic("ak-test", "claude-stub");
    cfg.base_url = base;
    let client = LlmClient::new(cfg).unwrap();
    let value = client
        .generate_structured(&prompt(), &classification_schema())
        .await
        .unwrap();
    assert_eq!(value["intent_category"], "incident");
}

#[tokio::test]
async fn non_success_status_is_surfaced() {
    let app = Router::new().route(
        "/chat/completions",
        post(|| async { (StatusCode::TOO_MANY_REQUESTS, "slow down") }),
    );
    let base = start_stub(app).await;

    let client = LlmClient::new(LlmClientConfig::openai_compatible("k", "m", base)).unwrap();
    match client
        .generate_structured(&prompt(), &classification_schema())
        .await
    {
        Err(ProviderError::Status { status, body }) => {
            assert_eq!(status, 429);
            assert_eq!(body, "slow down");
        }
        other => panic!("expected Status error, got {other:?}"),
    }
}

#[tokio::test]
async fn slow_provider_times_out() {
    let app = Router::new().route(
        "/chat/completions",
        post(|| async {
            tokio::time::sleep(Duration::from_millis(500)).await;
            Json(json!({"choices": [{"message": {"content": "{}"}}]}))
        }),
    );
    let base = start_stub(app).await;

    let cfg = LlmClientConfig::openai_compatible("k", "m", base)
        .with_timeout(Duration::from_millis(50));
    let client = LlmClient::new(cfg).unwrap();
    let err = client
        .generate_structured(&prompt(), &classification_schema())
        .await
        .unwrap_err();
    assert!(err.is_timeout(), "{err:?}");
}

// ── embeddings ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn embeddings_are_returned_in_input_order() {
    let app = Router::new().route(
        "/embeddings",
        post(|Json(body): Json<Value>| async move {
            assert_eq!(body["model"], "embed-stub");
            let n = body["input"].as_array().map(Vec::len).unwrap_or(0);
            // Reverse order on the wire; the client must sort by index.
            let data: Vec<Value> = (0..n)
                .rev()
                .map(|i| json!({"index": i, "embedding": [i as f32, 1.0]}))
                .collect();
            Json(json!({"data": data}))
        }),
    );
    let base = start_stub(app).await;

    let client = EmbeddingClient::new(EmbeddingClientConfig::new(base, "embed-stub")).unwrap();
    assert_eq!(client.model_id(), "embed-stub");

    let vectors = client
        .embed_batch(&["a".to_string(), "b".to_string(), "c".to_string()])
        .await
        .unwrap();
    assert_eq!(vectors, vec![vec![0.0, 1.0], vec![1.0, 1.0], vec![2.0, 1.0]]);

    let single = client.embed("hello").await.unwrap();
    assert_eq!(single, vec![0.0, 1.0]);
}
