//! Conversation orchestration: one chat turn from request to persisted transcript.
//!
//! ```text
//!  lock(key) ─▶ select store ─▶ [clear] ─▶ read transcript ─▶ model stream ─┬─▶ chunks to client
//!                                                                           └─▶ append(human, assistant)
//! ```
//!
//! Turns on the same session key run one at a time; different keys run
//! concurrently. Each turn runs in its own task, so a client that goes away
//! does not cancel the model call or the write-back.

use crate::provider::{ChatRequest, Message, Provider};
use crate::session::{SessionKey, StoreResult, StoreRouter, Turn};
use futures_util::stream::{self, BoxStream, StreamExt};
use her_common::LlmConfig;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{mpsc, OwnedMutexGuard};
use tracing::Instrument;

const EVENT_BUFFER: usize = 32;

/// One submitted chat turn.
#[derive(Debug, Clone)]
pub struct TurnRequest {
    pub client_host: String,
    pub session_id: String,
    pub message: String,
    /// Discard the existing transcript before this turn.
    pub new_session: bool,
}

impl TurnRequest {
    pub fn key(&self) -> SessionKey {
        SessionKey::derive(&self.client_host, &self.session_id)
    }
}

/// Output of a turn, in order.
///
/// Carriage returns are stripped from model text before it is sent or stored,
/// so event text never contains `\r` and matches the persisted transcript.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnEvent {
    /// Assistant text as it is generated.
    Chunk(String),
    /// The model failed; the turn was not persisted.
    Error(String),
}

pub type TurnStream = BoxStream<'static, TurnEvent>;

/// Model parameters used for every turn.
#[derive(Debug, Clone)]
pub struct ConversationSettings {
    pub model: String,
    pub temperature: f64,
    pub system_prompt: String,
    /// Stream the answer; otherwise request it whole and send one chunk.
    pub stream: bool,
}

impl From<&LlmConfig> for ConversationSettings {
    fn from(config: &LlmConfig) -> Self {
        Self {
            model: config.model.clone(),
            temperature: config.temperature,
            system_prompt: config.system_prompt.clone(),
            stream: config.stream,
        }
    }
}

/// Per-key async locks. Entries nobody holds are pruned on the next lookup.
#[derive(Default)]
struct SessionLocks {
    inner: Mutex<HashMap<SessionKey, Arc<tokio::sync::Mutex<()>>>>,
}

impl SessionLocks {
    async fn lock(&self, key: &SessionKey) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            locks.entry(key.clone()).or_default().clone()
        };
        lock.lock_owned().await
    }

    fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

/// Runs chat turns against the model and the transcript stores.
pub struct Conversation {
    stores: Arc<StoreRouter>,
    provider: Arc<dyn Provider>,
    settings: ConversationSettings,
    locks: SessionLocks,
}

impl Conversation {
    pub fn new(
        stores: Arc<StoreRouter>,
        provider: Arc<dyn Provider>,
        settings: ConversationSettings,
    ) -> Self {
        Self {
            stores,
            provider,
            settings,
            locks: SessionLocks::default(),
        }
    }

    pub fn stores(&self) -> &Arc<StoreRouter> {
        &self.stores
    }

    /// Start a turn and return its output stream.
    ///
    /// The stream ends after the transcript has been written back.
    pub fn handle_turn(self: &Arc<Self>, request: TurnRequest) -> TurnStream {
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let this = Arc::clone(self);

        tokio::spawn(
            async move { this.run_turn(request, tx).await }.in_current_span(),
        );

        stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|event| (event, rx)) })
            .boxed()
    }

    /// Stored transcript for a client/session pair.
    pub async fn history(&self, client_host: &str, session_id: &str) -> StoreResult<Vec<Turn>> {
        let key = SessionKey::derive(client_host, session_id);
        self.stores.select().await.read_all(&key).await
    }

    fn build_request(&self, history: &[Turn], message: &str) -> ChatRequest {
        let mut messages: Vec<Message> = history
            .iter()
            .map(|turn| Message {
                role: turn.role.chat_role().to_string(),
                content: turn.content.clone(),
            })
            .collect();
        messages.push(Message::user(message));

        ChatRequest {
            model: self.settings.model.clone(),
            messages,
            max_tokens: None,
            temperature: Some(self.settings.temperature),
            system: Some(self.settings.system_prompt.clone()).filter(|s| !s.is_empty()),
        }
    }

    /// Forward the model's answer chunk by chunk. `None` when the model failed.
    async fn stream_answer(
        &self,
        key: &SessionKey,
        request: ChatRequest,
        tx: &mpsc::Sender<TurnEvent>,
    ) -> Option<String> {
        let mut chunks = match self.provider.chat_stream(request).await {
            Ok(chunks) => chunks,
            Err(e) => {
                tracing::error!(session_key = %key, error = %e, "Model request failed");
                let _ = tx.send(TurnEvent::Error(strip_cr(&e.message))).await;
                return None;
            }
        };

        let mut answer = String::new();
        while let Some(item) = chunks.next().await {
            match item {
                Ok(chunk) => {
                    let chunk = strip_cr(&chunk);
                    answer.push_str(&chunk);
                    // A closed receiver means the client left; the turn still completes.
                    let _ = tx.send(TurnEvent::Chunk(chunk)).await;
                }
                Err(e) => {
                    tracing::error!(session_key = %key, error = %e, "Model stream failed");
                    let _ = tx.send(TurnEvent::Error(strip_cr(&e.message))).await;
                    return None;
                }
            }
        }
        Some(answer)
    }

    /// Request the whole answer and send it as one chunk. `None` when the model failed.
    async fn whole_answer(
        &self,
        key: &SessionKey,
        request: ChatRequest,
        tx: &mpsc::Sender<TurnEvent>,
    ) -> Option<String> {
        match self.provider.chat(request).await {
            Ok(response) => {
                tracing::debug!(
                    session_key = %key,
                    input_tokens = response.usage.input_tokens,
                    output_tokens = response.usage.output_tokens,
                    latency_ms = response.latency_ms,
                    finish_reason = response.finish_reason.as_deref().unwrap_or("unknown"),
                    "Model answered"
                );
                let answer = strip_cr(&response.content);
                if !answer.is_empty() {
                    let _ = tx.send(TurnEvent::Chunk(answer.clone())).await;
                }
                Some(answer)
            }
            Err(e) => {
                tracing::error!(session_key = %key, error = %e, "Model request failed");
                let _ = tx.send(TurnEvent::Error(strip_cr(&e.message))).await;
                None
            }
        }
    }

    async fn run_turn(&self, request: TurnRequest, tx: mpsc::Sender<TurnEvent>) {
        let key = request.key();
        let _guard = self.locks.lock(&key).await;
        let store = self.stores.select().await;

        if request.new_session {
            match store.clear(&key).await {
                Ok(()) => tracing::info!(session_key = %key, "Started new session"),
                Err(e) => tracing::warn!(session_key = %key, error = %e, "Failed to clear transcript"),
            }
        }

        let history = match store.read_all(&key).await {
            Ok(turns) => turns,
            Err(e) => {
                tracing::warn!(session_key = %key, error = %e, "Failed to read transcript, continuing without history");
                Vec::new()
            }
        };

        tracing::debug!(
            session_key = %key,
            store = store.name(),
            history_len = history.len(),
            "Running chat turn"
        );

        let chat_request = self.build_request(&history, &request.message);
        let answer = if self.settings.stream {
            self.stream_answer(&key, chat_request, &tx).await
        } else {
            self.whole_answer(&key, chat_request, &tx).await
        };
        let Some(answer) = answer else {
            return;
        };

        let turns = [Turn::human(request.message), Turn::assistant(answer)];
        match store.append(&key, &turns).await {
            Ok(()) => tracing::info!(session_key = %key, store = store.name(), "Turn persisted"),
            Err(e) => tracing::error!(session_key = %key, error = %e, "Failed to persist turn"),
        }
    }
}

/// SSE data cannot carry `\r`.
fn strip_cr(text: &str) -> String {
    text.replace('\r', "")
}
