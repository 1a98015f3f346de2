//! Chat model abstraction.
//!
//! The conversation layer only sees the [`Provider`] trait; the concrete
//! backend is an OpenAI-compatible `/v1/chat/completions` client.

mod compatible;

pub use compatible::CompatibleProvider;

use async_trait::async_trait;
use futures_util::stream::{self, BoxStream, StreamExt};
use her_common::LlmConfig;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

// ============================================================================
// Provider Trait
// ============================================================================

/// Incremental assistant text. Ends after the last chunk or the first error.
pub type ChunkStream = BoxStream<'static, Result<String, ProviderError>>;

/// Unified interface for chat models.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Get the provider name.
    fn name(&self) -> &str;

    /// Send a chat completion request and wait for the whole answer.
    async fn chat(&self, request: ChatRequest) -> Result<ChatResponse, ProviderError>;

    /// Send a chat completion request and stream the answer as it is generated.
    ///
    /// Providers without streaming yield the whole answer as one chunk.
    async fn chat_stream(&self, request: ChatRequest) -> Result<ChunkStream, ProviderError> {
        let response = self.chat(request).await?;
        Ok(stream::once(async move { Ok(response.content) }).boxed())
    }
}

/// Error from a provider.
#[derive(Debug, Clone)]
pub struct ProviderError {
    pub provider: String,
    pub model: String,
    pub message: String,
    pub status_code: Option<u16>,
}

impl ProviderError {
    pub fn new(provider: &str, model: &str, message: impl Into<String>) -> Self {
        Self {
            provider: provider.to_string(),
            model: model.to_string(),
            message: message.into(),
            status_code: None,
        }
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status_code = Some(status);
        self
    }
}

impl std::fmt::Display for ProviderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}:{}] {}", self.provider, self.model, self.message)
    }
}

impl std::error::Error for ProviderError {}

impl From<ProviderError> for her_common::Error {
    fn from(err: ProviderError) -> Self {
        Self::External(err.to_string())
    }
}

// ============================================================================
// Request/Response Types
// ============================================================================

/// Unified chat request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRequest {
    /// Model to use
    pub model: String,
    /// Messages in the conversation, oldest first
    pub messages: Vec<Message>,
    /// Maximum tokens to generate
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<i64>,
    /// Sampling temperature (0.0 - 2.0)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    /// System prompt (if not in messages)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
}

/// A message in the conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: String,
    pub content: String,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".into(),
            content: content.into(),
        }
    }
}

/// Unified chat response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatResponse {
    /// Provider name
    pub provider: String,
    /// Model used
    pub model: String,
    /// Response content
    pub content: String,
    /// Token usage
    pub usage: TokenUsage,
    /// Finish reason
    pub finish_reason: Option<String>,
    /// Response latency in milliseconds
    pub latency_ms: u64,
}

/// Token usage information.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub total_tokens: i64,
}

/// Build the configured provider.
pub fn create_provider(config: &LlmConfig) -> Arc<dyn Provider> {
    let api_key = config.api_key.as_deref().filter(|k| !k.is_empty());
    if api_key.is_none() {
        tracing::warn!(
            provider = %config.provider,
            "No model API key configured; chat turns will report an error"
        );
    }

    Arc::new(CompatibleProvider::new(
        &config.provider,
        &config.base_url,
        api_key,
        std::time::Duration::from_secs(config.timeout_secs),
    ))
}
