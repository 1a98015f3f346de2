//! Route definitions for the her chat backend.
//!
//! Provides the streamed chat endpoint, transcript lookup, storage
//! administration and health checks.

use crate::conversation::{Conversation, TurnEvent, TurnRequest};
use crate::session::{StoreRouter, Turn};
use axum::{
    body::Bytes,
    extract::{Query, State},
    http::StatusCode,
    response::sse::{Event, KeepAlive, Sse},
    response::Json,
    routing::{delete, get, post},
    Router,
};
use futures_util::stream::{Stream, StreamExt};
use her_common::logging::generate_trace_id;
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::sync::Arc;

/// Marker prefixed to in-band error events on the chat stream.
pub const ERROR_MARKER: &str = "[ERROR]";

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub conversation: Arc<Conversation>,
    pub stores: Arc<StoreRouter>,
}

impl AppState {
    pub fn new(conversation: Arc<Conversation>) -> Self {
        let stores = conversation.stores().clone();
        Self {
            conversation,
            stores,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Request / Response Types
// ─────────────────────────────────────────────────────────────────────────────

/// Body of `POST /chat`.
#[derive(Debug, Deserialize)]
pub struct ChatBody {
    #[serde(default)]
    pub session_id: String,
    #[serde(default)]
    pub user_host: String,
    pub message: String,
    #[serde(default, alias = "is_new_session")]
    pub new_session: bool,
}

/// Query of `GET /history`.
#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    #[serde(default)]
    pub session_id: String,
    #[serde(default)]
    pub user_host: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HistoryResponse {
    pub session_id: String,
    pub messages: Vec<Turn>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ClearStorageResponse {
    pub removed: usize,
    pub tier: String,
}

/// Health check response.
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub service: String,
    pub storage_tier: String,
}

/// Error response.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn api_error(err: her_common::Error) -> ApiError {
    let status = StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (
        status,
        Json(ErrorResponse {
            error: err.to_string(),
            code: err.code().into(),
        }),
    )
}

// ─────────────────────────────────────────────────────────────────────────────
// Router
// ─────────────────────────────────────────────────────────────────────────────

/// All routes with state attached.
pub fn build_routes(state: AppState) -> Router {
    Router::new()
        .route("/chat", post(chat_handler))
        .route("/history", get(history_handler))
        .route("/admin/storage", delete(clear_storage_handler))
        .route("/health", get(health_handler))
        .with_state(state)
}

// ─────────────────────────────────────────────────────────────────────────────
// Handlers
// ─────────────────────────────────────────────────────────────────────────────

/// Submit a chat turn; the answer streams back as server-sent events.
///
/// Model failures arrive in-band as a `[ERROR] ...` event with status 200.
async fn chat_handler(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let body: ChatBody = serde_json::from_slice(&body).map_err(|e| {
        tracing::warn!(error = %e, "Rejected malformed chat request");
        api_error(her_common::Error::InvalidInput(format!(
            "request body must be a JSON object with a string `message`: {e}"
        )))
    })?;

    let request = TurnRequest {
        client_host: body.user_host,
        session_id: body.session_id,
        message: body.message,
        new_session: body.new_session,
    };
    let trace_id = generate_trace_id();
    let span = her_common::request_span!("chat_turn", trace_id, session_id = %request.session_id);

    let turn = span.in_scope(|| {
        tracing::info!(new_session = request.new_session, "Chat turn received");
        state.conversation.handle_turn(request)
    });

    let events = turn.map(|event| {
        let data = match event {
            TurnEvent::Chunk(text) => text,
            TurnEvent::Error(message) => format!("{ERROR_MARKER} {message}"),
        };
        // Turn text is already free of carriage returns.
        Ok::<_, Infallible>(Event::default().data(data))
    });

    Ok(Sse::new(events).keep_alive(KeepAlive::default()))
}

/// Stored transcript for a client/session pair.
async fn history_handler(
    State(state): State<AppState>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<HistoryResponse>, ApiError> {
    let messages = state
        .conversation
        .history(&query.user_host, &query.session_id)
        .await
        .map_err(|e| {
            tracing::error!(error = %e, "Failed to read transcript");
            api_error(her_common::Error::from(e).with_context("reading transcript"))
        })?;

    Ok(Json(HistoryResponse {
        session_id: query.session_id,
        messages,
    }))
}

/// Remove every stored transcript from the active tier.
async fn clear_storage_handler(
    State(state): State<AppState>,
) -> Result<Json<ClearStorageResponse>, ApiError> {
    let (removed, tier) = state.stores.clear_all().await.map_err(|e| {
        tracing::error!(error = %e, "Failed to clear storage");
        api_error(her_common::Error::from(e).with_context("clearing storage"))
    })?;

    Ok(Json(ClearStorageResponse {
        removed,
        tier: tier.as_str().into(),
    }))
}

async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    let status = if state.stores.health_check().await {
        "healthy"
    } else {
        "degraded"
    };

    Json(HealthResponse {
        status: status.into(),
        version: env!("CARGO_PKG_VERSION").into(),
        service: "her-server".into(),
        storage_tier: state.stores.tier().as_str().into(),
    })
}
