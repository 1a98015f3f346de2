//! Integration tests for the her server.
//!
//! Drives the full HTTP API: streamed chat turns, history, storage
//! administration, health and the local-storage fallback.

use async_trait::async_trait;
use axum::{
    body::Body,
    http::{header, Method, Request, StatusCode},
    Router,
};
use futures_util::stream::{self, StreamExt};
use her_common::{LlmConfig, StorageBackend, StorageConfig};
use her_server::{
    build_router, build_stores,
    connection::{Availability, StorageTier},
    provider::{ChatResponse, ChunkStream, TokenUsage},
    routes::{ClearStorageResponse, ErrorResponse, HealthResponse, HistoryResponse},
    session::{
        MemoryTranscriptStore, RemoteTier, Role, StoreError, StoreResult, TranscriptStore,
    },
    AppState, ChatRequest, Conversation, ConversationSettings, Provider, ProviderError,
    SessionKey, StoreRouter, Turn,
};
use serde_json::{json, Value};
use std::sync::Arc;
use tempfile::TempDir;
use tower::ServiceExt;

// ─────────────────────────────────────────────────────────────────────────────
// Test doubles
// ─────────────────────────────────────────────────────────────────────────────

/// Answers arithmetic questions in two chunks, or fails on demand.
struct TestModel {
    fail: bool,
}

#[async_trait]
impl Provider for TestModel {
    fn name(&self) -> &str {
        "test-model"
    }

    async fn chat(&self, request: ChatRequest) -> Result<ChatResponse, ProviderError> {
        Ok(ChatResponse {
            provider: "test-model".into(),
            model: request.model,
            content: "2+2 is 4.".into(),
            usage: TokenUsage::default(),
            finish_reason: Some("stop".into()),
            latency_ms: 1,
        })
    }

    async fn chat_stream(&self, request: ChatRequest) -> Result<ChunkStream, ProviderError> {
        if self.fail {
            return Err(ProviderError::new("test-model", &request.model, "API error (503): overloaded"));
        }
        Ok(stream::iter(vec![Ok("2+2 ".to_string()), Ok("is 4.".to_string())]).boxed())
    }
}

/// Remote tier that claims to be active but answers nothing.
struct DownRemote;

#[async_trait]
impl Availability for DownRemote {
    async fn ensure_available(&self) -> bool {
        false
    }

    fn tier(&self) -> StorageTier {
        StorageTier::Remote
    }
}

#[async_trait]
impl TranscriptStore for DownRemote {
    fn name(&self) -> &str {
        "down"
    }

    async fn append(&self, _key: &SessionKey, _turns: &[Turn]) -> StoreResult<()> {
        Err(StoreError::Unavailable("connection refused".into()))
    }

    async fn read_all(&self, _key: &SessionKey) -> StoreResult<Vec<Turn>> {
        Err(StoreError::Unavailable("connection refused".into()))
    }

    async fn clear(&self, _key: &SessionKey) -> StoreResult<()> {
        Err(StoreError::Unavailable("connection refused".into()))
    }

    async fn clear_all(&self) -> StoreResult<usize> {
        Err(StoreError::Unavailable("connection refused".into()))
    }

    async fn health_check(&self) -> bool {
        false
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Helpers
// ─────────────────────────────────────────────────────────────────────────────

fn app_with(stores: StoreRouter, provider: Arc<dyn Provider>) -> Router {
    let conversation = Arc::new(Conversation::new(
        Arc::new(stores),
        provider,
        ConversationSettings::from(&LlmConfig::default()),
    ));
    build_router(AppState::new(conversation))
}

fn memory_app() -> Router {
    app_with(
        StoreRouter::local_only(Arc::new(MemoryTranscriptStore::default())),
        Arc::new(TestModel { fail: false }),
    )
}

async fn send(app: &Router, method: Method, uri: &str, body: Option<&str>) -> (StatusCode, Option<String>, String) {
    let request = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(b) => request
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(b.to_string()))
            .unwrap(),
        None => request.body(Body::empty()).unwrap(),
    };

    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let content_type = response
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(ToString::to_string);
    let body = axum::body::to_bytes(response.into_body(), 1024 * 1024)
        .await
        .unwrap();

    (status, content_type, String::from_utf8(body.to_vec()).unwrap())
}

async fn chat(app: &Router, body: Value) -> (StatusCode, Vec<String>) {
    let (status, content_type, body) = send(app, Method::POST, "/chat", Some(&body.to_string())).await;
    if status == StatusCode::OK {
        assert!(content_type.unwrap_or_default().starts_with("text/event-stream"));
    }
    (status, sse_data(&body))
}

/// Data payloads of every event in an SSE body.
fn sse_data(body: &str) -> Vec<String> {
    body.lines()
        .filter_map(|line| line.strip_prefix("data:"))
        .map(|data| data.strip_prefix(' ').unwrap_or(data).to_string())
        .collect()
}

async fn get_json<T: serde::de::DeserializeOwned>(app: &Router, method: Method, uri: &str) -> (StatusCode, T) {
    let (status, _, body) = send(app, method, uri, None).await;
    (status, serde_json::from_str(&body).unwrap())
}

async fn history(app: &Router, user_host: &str, session_id: &str) -> Vec<Turn> {
    let uri = format!("/history?user_host={user_host}&session_id={session_id}");
    let (status, response): (_, HistoryResponse) = get_json(app, Method::GET, &uri).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(response.session_id, session_id);
    response.messages
}

// ─────────────────────────────────────────────────────────────────────────────
// Health Check Tests
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_health_check() {
    let app = memory_app();
    let (status, health): (_, HealthResponse) = get_json(&app, Method::GET, "/health").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(health.status, "healthy");
    assert_eq!(health.service, "her-server");
    assert_eq!(health.storage_tier, "local");
    assert!(!health.version.is_empty());
}

// ─────────────────────────────────────────────────────────────────────────────
// Chat Tests
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_chat_streams_and_records_history() {
    let app = memory_app();

    let (status, events) = chat(
        &app,
        json!({"user_host": "host1", "session_id": "s1", "message": "What is 2+2?"}),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(!events.is_empty());
    assert_eq!(events.concat(), "2+2 is 4.");

    let turns = history(&app, "host1", "s1").await;
    assert_eq!(turns.len(), 2);
    assert_eq!(turns[0], Turn::human("What is 2+2?"));
    assert_eq!(turns[1].role, Role::Assistant);
    assert!(!turns[1].content.is_empty());
}

#[tokio::test]
async fn test_sessions_are_isolated_by_host_and_id() {
    let app = memory_app();
    chat(&app, json!({"user_host": "host1", "session_id": "s1", "message": "hi"})).await;

    assert_eq!(history(&app, "host1", "s1").await.len(), 2);
    assert!(history(&app, "host2", "s1").await.is_empty());
    assert!(history(&app, "host1", "s2").await.is_empty());
}

#[tokio::test]
async fn test_defaults_for_missing_identifiers() {
    let app = memory_app();
    let (status, _) = chat(&app, json!({"message": "anonymous"})).await;
    assert_eq!(status, StatusCode::OK);

    let (_, response): (_, HistoryResponse) = get_json(&app, Method::GET, "/history").await;
    assert_eq!(response.session_id, "");
    assert_eq!(response.messages.len(), 2);
}

#[tokio::test]
async fn test_new_session_replaces_history() {
    let app = memory_app();
    for message in ["one", "two"] {
        chat(&app, json!({"user_host": "h", "session_id": "s", "message": message})).await;
    }
    assert_eq!(history(&app, "h", "s").await.len(), 4);

    chat(
        &app,
        json!({"user_host": "h", "session_id": "s", "message": "restart", "new_session": true}),
    )
    .await;

    let turns = history(&app, "h", "s").await;
    assert_eq!(turns.len(), 2);
    assert_eq!(turns[0], Turn::human("restart"));
}

#[tokio::test]
async fn test_model_failure_is_reported_in_band() {
    let app = app_with(
        StoreRouter::local_only(Arc::new(MemoryTranscriptStore::default())),
        Arc::new(TestModel { fail: true }),
    );

    let (status, events) = chat(&app, json!({"user_host": "h", "session_id": "s", "message": "hi"})).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(events, vec!["[ERROR] API error (503): overloaded".to_string()]);
    assert!(history(&app, "h", "s").await.is_empty());
}

#[tokio::test]
async fn test_chat_rejects_bad_requests() {
    let app = memory_app();

    for body in [
        json!({"session_id": "s1"}).to_string(),
        json!({"message": 42}).to_string(),
        "{ not json".to_string(),
    ] {
        let (status, _, body) = send(&app, Method::POST, "/chat", Some(&body)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        let error: ErrorResponse = serde_json::from_str(&body).unwrap();
        assert_eq!(error.code, "invalid_input");
        assert!(!error.error.is_empty());
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Storage Tier Tests
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_unreachable_remote_falls_back_to_local() {
    let mut config = StorageConfig::default();
    config.redis.host = Some("127.0.0.1".into());
    config.redis.port = 1;
    config.redis.tls = false;
    config.redis.retries = 2;
    config.redis.retry_delay_secs = 0;

    let stores = build_stores(&config).await;
    assert_eq!(stores.tier(), StorageTier::Local);
    let app = app_with(stores, Arc::new(TestModel { fail: false }));

    let (status, events) = chat(
        &app,
        json!({"user_host": "host1", "session_id": "s1", "message": "What is 2+2?"}),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(events.concat(), "2+2 is 4.");
    assert_eq!(history(&app, "host1", "s1").await.len(), 2);

    let (_, health): (_, HealthResponse) = get_json(&app, Method::GET, "/health").await;
    assert_eq!(health.storage_tier, "local");
}

#[tokio::test]
async fn test_file_backend_persists_transcripts() {
    let dir = TempDir::new().unwrap();
    let config = StorageConfig {
        backend: StorageBackend::File,
        file_dir: dir.path().to_path_buf(),
        ..Default::default()
    };

    let app = app_with(build_stores(&config).await, Arc::new(TestModel { fail: false }));
    chat(&app, json!({"user_host": "host1", "session_id": "s1", "message": "remember me"})).await;

    let file = dir
        .path()
        .join(format!("{}.json", SessionKey::derive("host1", "s1")));
    let stored: Vec<Turn> = serde_json::from_slice(&std::fs::read(file).unwrap()).unwrap();
    assert_eq!(stored[0], Turn::human("remember me"));

    // A fresh process sees the same transcript.
    let reopened = app_with(build_stores(&config).await, Arc::new(TestModel { fail: false }));
    assert_eq!(history(&reopened, "host1", "s1").await.len(), 2);
}

// ─────────────────────────────────────────────────────────────────────────────
// Admin Tests
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_clear_storage_removes_everything() {
    let app = memory_app();
    for session in ["a", "b", "c"] {
        chat(&app, json!({"user_host": "h", "session_id": session, "message": "hi"})).await;
    }

    let (status, cleared): (_, ClearStorageResponse) =
        get_json(&app, Method::DELETE, "/admin/storage").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(cleared.removed, 3);
    assert_eq!(cleared.tier, "local");

    assert!(history(&app, "h", "a").await.is_empty());
}

#[tokio::test]
async fn test_clear_storage_unavailable_when_remote_is_down() {
    let stores = StoreRouter::with_remote(
        RemoteTier {
            store: Arc::new(DownRemote),
            availability: Arc::new(DownRemote),
        },
        Arc::new(MemoryTranscriptStore::default()),
    );
    let app = app_with(stores, Arc::new(TestModel { fail: false }));

    let (status, error): (_, ErrorResponse) = get_json(&app, Method::DELETE, "/admin/storage").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(error.code, "store_unavailable");
}

// ─────────────────────────────────────────────────────────────────────────────
// Model API Tests
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_chat_against_compatible_model_api() {
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "text/event-stream")
                .set_body_string(concat!(
                    "data: {\"choices\":[{\"delta\":{\"content\":\"Four\"}}]}\n\n",
                    "data: {\"choices\":[{\"delta\":{\"content\":\".\"}}]}\n\n",
                    "data: [DONE]\n\n",
                )),
        )
        .mount(&server)
        .await;

    let llm = LlmConfig {
        base_url: server.uri(),
        api_key: Some("test-key".into()),
        ..Default::default()
    };
    let app = app_with(
        StoreRouter::local_only(Arc::new(MemoryTranscriptStore::default())),
        her_server::create_provider(&llm),
    );

    let (status, events) = chat(&app, json!({"user_host": "h", "session_id": "s", "message": "2+2?"})).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(events, vec!["Four".to_string(), ".".to_string()]);

    let turns = history(&app, "h", "s").await;
    assert_eq!(turns[1], Turn::assistant("Four."));
}

#[tokio::test]
async fn test_chat_without_streaming_sends_whole_answer() {
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "choices": [{"message": {"content": "Four.\r"}, "finish_reason": "stop"}],
            "usage": {"prompt_tokens": 12, "completion_tokens": 3, "total_tokens": 15}
        })))
        .expect(1)
        .mount(&server)
        .await;

    let mut config = her_common::Config::default();
    config.storage.backend = StorageBackend::Memory;
    config.llm.base_url = server.uri();
    config.llm.api_key = Some("test-key".into());
    config.llm.stream = false;
    let app = build_router(her_server::build_state(&config).await);

    let (status, events) = chat(&app, json!({"user_host": "h", "session_id": "s", "message": "2+2?"})).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(events, vec!["Four.".to_string()]);

    let turns = history(&app, "h", "s").await;
    assert_eq!(turns[1], Turn::assistant("Four."));
}
