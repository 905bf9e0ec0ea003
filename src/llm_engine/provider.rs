//! Backend contract and error types
//!
//! Defines the narrow interface every model backend implements: turn a model
//! source into a handle, then stream tokens out of that handle.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Error types for session, transfer and backend operations
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum LlmError {
    /// Network or disk failure while moving model bytes
    Transfer(String),
    /// Handle creation failed (corrupt file, unsupported format, missing file)
    BackendLoad(String),
    /// Failure while streaming a response
    Generation(String),
    /// Conflicting operation already running
    Busy(String),
    /// `generate` called without a selected model
    NoModelSelected,
    /// Artifact or model does not exist
    NotFound(String),
    /// Backend not reachable (sidecar missing, server down)
    ProviderUnavailable(String),
    /// API token missing or rejected
    AuthenticationFailed(String),
    /// Request failed (network, timeout, protocol)
    RequestFailed(String),
    /// Operation cancelled by the caller
    Cancelled,
    /// Metadata store failure
    Storage(String),
    /// Generic error
    Other(String),
}

impl fmt::Display for LlmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LlmError::Transfer(msg) => write!(f, "Transfer failed: {}", msg),
            LlmError::BackendLoad(msg) => write!(f, "Failed to load model: {}", msg),
            LlmError::Generation(msg) => write!(f, "Generation failed: {}", msg),
            LlmError::Busy(msg) => write!(f, "Session busy: {}", msg),
            LlmError::NoModelSelected => write!(f, "No model selected"),
            LlmError::NotFound(msg) => write!(f, "Not found: {}", msg),
            LlmError::ProviderUnavailable(msg) => write!(f, "Provider unavailable: {}", msg),
            LlmError::AuthenticationFailed(msg) => write!(f, "Authentication failed: {}", msg),
            LlmError::RequestFailed(msg) => write!(f, "Request failed: {}", msg),
            LlmError::Cancelled => write!(f, "Cancelled"),
            LlmError::Storage(msg) => write!(f, "Storage error: {}", msg),
            LlmError::Other(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for LlmError {}

impl From<anyhow::Error> for LlmError {
    fn from(e: anyhow::Error) -> Self {
        LlmError::Storage(format!("{:#}", e))
    }
}

/// Sampling options handed to the backend when a handle is created
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct GenerationOptions {
    /// Maximum tokens per response
    pub max_tokens: u32,
    /// Top-k sampling
    pub top_k: u32,
    /// Sampling temperature (0.0 = deterministic)
    pub temperature: f32,
    /// Random seed, None lets the backend pick
    pub seed: Option<u64>,
}

impl Default for GenerationOptions {
    fn default() -> Self {
        Self {
            max_tokens: 1000,
            top_k: 40,
            temperature: 0.8,
            seed: Some(101),
        }
    }
}

/// Where a backend should load a model from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelSource {
    /// Weights on local disk
    File(PathBuf),
    /// Model served by a remote streaming API
    Hosted { model: String },
}

/// Incremental piece of generated text
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenChunk {
    pub text: String,
    pub is_final: bool,
}

impl TokenChunk {
    pub fn partial(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            is_final: false,
        }
    }

    pub fn last(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            is_final: true,
        }
    }
}

/// Callback for streamed chunks
pub type ChunkCallback = Box<dyn Fn(TokenChunk) + Send + Sync>;

/// A loaded, ready-to-run model instance
#[async_trait]
pub trait InferenceHandle: Send + Sync {
    /// Stream a response for `prompt`.
    ///
    /// Every chunk goes through `on_chunk`; the last one has `is_final` set.
    /// Backends that can stop early watch `cancel`; others drain normally.
    async fn generate(
        &self,
        prompt: &str,
        on_chunk: ChunkCallback,
        cancel: CancellationToken,
    ) -> Result<(), LlmError>;

    /// Release backend resources. After this `generate` must fail.
    async fn release(&self);

    fn is_released(&self) -> bool;
}

/// Which registered backend serves a model
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// On-device engine
    Local,
    /// Remote streaming API
    Hosted,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::Local => write!(f, "local"),
            BackendKind::Hosted => write!(f, "hosted"),
        }
    }
}

/// Factory for inference handles
#[async_trait]
pub trait ModelBackend: Send + Sync {
    /// Backend name used in logs
    fn backend_name(&self) -> &'static str;

    /// Create a handle for `source`
    async fn create_handle(
        &self,
        source: &ModelSource,
        options: &GenerationOptions,
    ) -> Result<Arc<dyn InferenceHandle>, LlmError>;
}
