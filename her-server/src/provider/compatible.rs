//! OpenAI-compatible chat completions client.
//!
//! DeepSeek, OpenAI and most hosted models speak the same
//! `/v1/chat/completions` format, including the `stream: true` variant that
//! answers with server-sent events:
//!
//! ```text
//! data: {"choices":[{"delta":{"content":"Hel"}}]}
//!
//! data: {"choices":[{"delta":{"content":"lo"}}]}
//!
//! data: [DONE]
//! ```

use super::{ChatRequest, ChatResponse, ChunkStream, Provider, ProviderError, TokenUsage};
use async_trait::async_trait;
use futures_util::stream::{self, Stream, StreamExt};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// A provider that speaks the OpenAI-compatible chat completions API.
pub struct CompatibleProvider {
    name: String,
    base_url: String,
    api_key: Option<String>,
    client: Client,
}

#[derive(Debug, Serialize)]
struct CompatibleRequest {
    model: String,
    messages: Vec<CompatibleMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<i64>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    stream: bool,
}

#[derive(Debug, Serialize)]
struct CompatibleMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct CompatibleResponse {
    choices: Vec<CompatibleChoice>,
    #[serde(default)]
    usage: Option<CompatibleUsage>,
}

#[derive(Debug, Deserialize)]
struct CompatibleChoice {
    message: CompatibleResponseMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CompatibleResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CompatibleUsage {
    prompt_tokens: Option<i64>,
    completion_tokens: Option<i64>,
    total_tokens: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    #[serde(default)]
    error: Option<StreamError>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: StreamDelta,
}

#[derive(Debug, Default, Deserialize)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StreamError {
    message: String,
}

/// One decoded line of an event stream.
#[derive(Debug, PartialEq, Eq)]
enum StreamLine {
    Content(String),
    Error(String),
    Done,
    Skip,
}

fn parse_stream_line(line: &str) -> StreamLine {
    let line = line.trim_end_matches(['\r', '\n']);
    let Some(data) = line.strip_prefix("data:") else {
        return StreamLine::Skip;
    };
    let data = data.trim_start();

    if data == "[DONE]" {
        return StreamLine::Done;
    }

    match serde_json::from_str::<StreamChunk>(data) {
        Ok(StreamChunk {
            error: Some(error), ..
        }) => StreamLine::Error(error.message),
        Ok(chunk) => chunk
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.delta.content)
            .filter(|content| !content.is_empty())
            .map_or(StreamLine::Skip, StreamLine::Content),
        Err(e) => {
            tracing::debug!(error = %e, "Skipping undecodable stream event");
            StreamLine::Skip
        }
    }
}

struct Decoder<S> {
    body: S,
    buffer: Vec<u8>,
    pending: VecDeque<Result<String, ProviderError>>,
    finished: bool,
    origin: ProviderError,
}

impl<S> Decoder<S> {
    fn error(&self, message: String) -> ProviderError {
        ProviderError {
            message,
            ..self.origin.clone()
        }
    }

    /// Decode every complete line in the buffer.
    fn drain_lines(&mut self, flush: bool) {
        while !self.finished {
            let line = match self.buffer.iter().position(|b| *b == b'\n') {
                Some(pos) => self.buffer.drain(..=pos).collect::<Vec<_>>(),
                None if flush && !self.buffer.is_empty() => std::mem::take(&mut self.buffer),
                None => break,
            };

            match parse_stream_line(&String::from_utf8_lossy(&line)) {
                StreamLine::Content(content) => self.pending.push_back(Ok(content)),
                StreamLine::Error(message) => {
                    let err = self.error(message);
                    self.pending.push_back(Err(err));
                    self.finished = true;
                }
                StreamLine::Done => self.finished = true,
                StreamLine::Skip => {}
            }
        }
    }
}

/// Turn a raw SSE body into a stream of content deltas.
fn decode_event_stream<S, B, E>(body: S, origin: ProviderError) -> ChunkStream
where
    S: Stream<Item = Result<B, E>> + Unpin + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    let decoder = Decoder {
        body,
        buffer: Vec::new(),
        pending: VecDeque::new(),
        finished: false,
        origin,
    };

    stream::unfold(decoder, |mut decoder| async move {
        loop {
            if let Some(item) = decoder.pending.pop_front() {
                return Some((item, decoder));
            }
            if decoder.finished {
                return None;
            }

            match decoder.body.next().await {
                Some(Ok(bytes)) => {
                    decoder.buffer.extend_from_slice(bytes.as_ref());
                    decoder.drain_lines(false);
                }
                Some(Err(e)) => {
                    let err = decoder.error(format!("Stream interrupted: {e}"));
                    decoder.finished = true;
                    return Some((Err(err), decoder));
                }
                None => {
                    decoder.drain_lines(true);
                    decoder.finished = true;
                }
            }
        }
    })
    .boxed()
}

impl CompatibleProvider {
    /// Create a new OpenAI-compatible provider.
    pub fn new(name: &str, base_url: &str, api_key: Option<&str>, timeout: Duration) -> Self {
        Self {
            name: name.to_string(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.map(ToString::to_string),
            client: Client::builder()
                .timeout(timeout)
                .connect_timeout(Duration::from_secs(10))
                .build()
                .unwrap_or_else(|_| Client::new()),
        }
    }

    /// Create DeepSeek provider.
    pub fn deepseek(api_key: Option<&str>) -> Self {
        Self::new(
            "deepseek",
            "https://api.deepseek.com",
            api_key,
            Duration::from_secs(120),
        )
    }

    fn error(&self, model: &str, message: impl Into<String>) -> ProviderError {
        ProviderError::new(&self.name, model, message)
    }

    /// Send the request and check the status, returning the raw response.
    async fn send(&self, request: &ChatRequest, stream: bool) -> Result<reqwest::Response, ProviderError> {
        let api_key = self.api_key.as_ref().ok_or_else(|| {
            self.error(
                &request.model,
                format!("{} API key not set. Set the appropriate env var.", self.name),
            )
        })?;

        let mut messages: Vec<CompatibleMessage> = Vec::new();

        if let Some(ref system) = request.system {
            messages.push(CompatibleMessage {
                role: "system".to_string(),
                content: system.clone(),
            });
        }

        for msg in &request.messages {
            messages.push(CompatibleMessage {
                role: msg.role.clone(),
                content: msg.content.clone(),
            });
        }

        let compatible_request = CompatibleRequest {
            model: request.model.clone(),
            messages,
            temperature: request.temperature,
            max_tokens: request.max_tokens,
            stream,
        };

        let url = format!("{}/v1/chat/completions", self.base_url);

        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", api_key))
            .json(&compatible_request)
            .send()
            .await
            .map_err(|e| self.error(&request.model, format!("Request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(self
                .error(
                    &request.model,
                    format!("API error ({}): {}", status.as_u16(), error_text),
                )
                .with_status(status.as_u16()));
        }

        Ok(response)
    }
}

#[async_trait]
impl Provider for CompatibleProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn chat(&self, request: ChatRequest) -> Result<ChatResponse, ProviderError> {
        let start = Instant::now();
        let response = self.send(&request, false).await?;

        let result: CompatibleResponse = response
            .json()
            .await
            .map_err(|e| self.error(&request.model, format!("Failed to parse response: {}", e)))?;

        let choice = result
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| self.error(&request.model, format!("No response from {}", self.name)))?;

        let usage = result.usage.map_or(TokenUsage::default(), |u| TokenUsage {
            input_tokens: u.prompt_tokens.unwrap_or(0),
            output_tokens: u.completion_tokens.unwrap_or(0),
            total_tokens: u.total_tokens.unwrap_or(0),
        });

        Ok(ChatResponse {
            provider: self.name.clone(),
            model: request.model,
            content: choice.message.content.unwrap_or_default(),
            usage,
            finish_reason: choice.finish_reason,
            latency_ms: start.elapsed().as_millis() as u64,
        })
    }

    async fn chat_stream(&self, request: ChatRequest) -> Result<ChunkStream, ProviderError> {
        let response = self.send(&request, true).await?;
        tracing::debug!(provider = %self.name, model = %request.model, "Model stream opened");
        Ok(decode_event_stream(
            Box::pin(response.bytes_stream()),
            self.error(&request.model, String::new()),
        ))
    }
}
