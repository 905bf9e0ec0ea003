//! OpenRouter-compatible hosted backend
//!
//! Streams chat completions as server-sent events from any endpoint that
//! speaks the OpenAI `chat/completions` dialect.

use async_trait::async_trait;
use bytes::BytesMut;
use futures_util::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::config::HostedConfig;
use crate::llm_engine::model_manager::AuthProvider;
use crate::llm_engine::provider::{
    ChunkCallback, GenerationOptions, InferenceHandle, LlmError, ModelBackend, ModelSource,
    TokenChunk,
};

// ============================================================================
// Wire types
// ============================================================================

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    stream: bool,
    max_tokens: u32,
    temperature: f32,
    top_k: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    seed: Option<u64>,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct StreamResponse {
    #[serde(default)]
    choices: Vec<StreamingChoice>,
    #[serde(default)]
    error: Option<StreamError>,
}

#[derive(Debug, Deserialize)]
struct StreamingChoice {
    #[serde(default)]
    delta: Option<Delta>,
    #[serde(default)]
    error: Option<StreamError>,
}

#[derive(Debug, Deserialize)]
struct Delta {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StreamError {
    #[serde(default)]
    message: String,
}

/// What one SSE line means for the caller
#[derive(Debug, PartialEq)]
enum SseEvent {
    Token(String),
    Done,
    Skip,
}

/// Interpret one line of the event stream
fn parse_sse_line(line: &str) -> Result<SseEvent, LlmError> {
    let line = line.trim_end_matches('\r');
    let Some(data) = line.strip_prefix("data:") else {
        // Comments (": OPENROUTER PROCESSING"), event names, blank separators
        return Ok(SseEvent::Skip);
    };

    let data = data.trim();
    if data.is_empty() {
        return Ok(SseEvent::Skip);
    }
    if data == "[DONE]" {
        return Ok(SseEvent::Done);
    }

    let parsed: StreamResponse = match serde_json::from_str(data) {
        Ok(parsed) => parsed,
        Err(e) => {
            log::warn!("Skipping unparseable stream event: {}", e);
            return Ok(SseEvent::Skip);
        }
    };

    if let Some(error) = parsed.error {
        return Err(LlmError::Generation(error.message));
    }

    let Some(choice) = parsed.choices.into_iter().next() else {
        return Ok(SseEvent::Skip);
    };
    if let Some(error) = choice.error {
        return Err(LlmError::Generation(error.message));
    }

    match choice.delta.and_then(|d| d.content) {
        Some(content) if !content.is_empty() => Ok(SseEvent::Token(content)),
        _ => Ok(SseEvent::Skip),
    }
}

// ============================================================================
// Backend
// ============================================================================

pub struct HostedBackend {
    config: HostedConfig,
    client: Client,
    auth: Arc<dyn AuthProvider>,
}

impl HostedBackend {
    pub fn new(config: HostedConfig, auth: Arc<dyn AuthProvider>) -> Result<Self, LlmError> {
        // No total timeout: long generations stream for minutes
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| LlmError::Other(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self { config, client, auth })
    }
}

#[async_trait]
impl ModelBackend for HostedBackend {
    fn backend_name(&self) -> &'static str {
        "openrouter"
    }

    async fn create_handle(
        &self,
        source: &ModelSource,
        options: &GenerationOptions,
    ) -> Result<Arc<dyn InferenceHandle>, LlmError> {
        let model = match source {
            ModelSource::Hosted { model } => model.clone(),
            ModelSource::File(path) => {
                return Err(LlmError::BackendLoad(format!(
                    "{} is a local file, not a hosted model",
                    path.display()
                )))
            }
        };

        // Fail the activation early rather than on the first prompt
        if self.auth.bearer_token().is_none() {
            return Err(LlmError::AuthenticationFailed(
                "No API token configured for the hosted backend".to_string(),
            ));
        }

        log::info!("Hosted model {} ready", model);
        Ok(Arc::new(HostedHandle {
            url: format!("{}/chat/completions", self.config.base_url.trim_end_matches('/')),
            model,
            options: options.clone(),
            idle_timeout: Duration::from_secs(self.config.idle_timeout_secs),
            client: self.client.clone(),
            auth: self.auth.clone(),
            released: AtomicBool::new(false),
        }))
    }
}

struct HostedHandle {
    url: String,
    model: String,
    options: GenerationOptions,
    idle_timeout: Duration,
    client: Client,
    auth: Arc<dyn AuthProvider>,
    released: AtomicBool,
}

impl HostedHandle {
    async fn stream(&self, prompt: &str, on_chunk: &ChunkCallback) -> Result<(), LlmError> {
        let token = self.auth.bearer_token().ok_or_else(|| {
            LlmError::AuthenticationFailed("No API token configured for the hosted backend".to_string())
        })?;

        let request = ChatRequest {
            model: &self.model,
            messages: vec![ChatMessage {
                role: "user",
                content: prompt,
            }],
            stream: true,
            max_tokens: self.options.max_tokens,
            temperature: self.options.temperature,
            top_k: self.options.top_k,
            seed: self.options.seed,
        };

        let response = self
            .client
            .post(&self.url)
            .bearer_auth(token)
            .header("Accept", "text/event-stream")
            .json(&request)
            .send()
            .await
            .map_err(|e| LlmError::RequestFailed(format!("Request failed: {}", e)))?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(LlmError::AuthenticationFailed(format!("Hosted API returned {}", status)));
        }
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(LlmError::Generation(format!(
                "Hosted API returned {}: {}",
                status, error_text
            )));
        }

        let mut stream = response.bytes_stream();
        // Bytes, not text: a chunk may end inside a multi-byte character
        let mut buffer = BytesMut::new();

        loop {
            let next = tokio::time::timeout(self.idle_timeout, stream.next())
                .await
                .map_err(|_| {
                    LlmError::Generation(format!(
                        "Hosted API sent nothing for {}s",
                        self.idle_timeout.as_secs()
                    ))
                })?;
            let Some(chunk_result) = next else {
                break;
            };
            let chunk = chunk_result
                .map_err(|e| LlmError::Generation(format!("Stream error: {}", e)))?;
            buffer.extend_from_slice(&chunk);

            while let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
                let line = buffer.split_to(pos + 1);
                let line = String::from_utf8_lossy(&line);
                match parse_sse_line(line.trim_end_matches('\n'))? {
                    SseEvent::Token(text) => {
                        perf_trace!("Hosted token ({} bytes)", text.len());
                        on_chunk(TokenChunk::partial(text));
                    }
                    SseEvent::Done => {
                        on_chunk(TokenChunk::last(""));
                        return Ok(());
                    }
                    SseEvent::Skip => {}
                }
            }
        }

        // Some servers close without [DONE]
        on_chunk(TokenChunk::last(""));
        Ok(())
    }
}

#[async_trait]
impl InferenceHandle for HostedHandle {
    async fn generate(
        &self,
        prompt: &str,
        on_chunk: ChunkCallback,
        cancel: CancellationToken,
    ) -> Result<(), LlmError> {
        if self.is_released() {
            return Err(LlmError::Generation("Model handle was released".to_string()));
        }

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(LlmError::Cancelled),
            result = self.stream(prompt, &on_chunk) => result,
        }
    }

    async fn release(&self) {
        self.released.store(true, Ordering::SeqCst);
    }

    fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }
}
