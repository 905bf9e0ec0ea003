//! LLM Engine module for on-device and hosted text generation
//!
//! Supports multiple backends:
//! - Local inference through the llm-sidecar process (model files on disk)
//! - OpenRouter-compatible streaming APIs
//!
//! `InferenceSession` owns the active model and serializes every load,
//! removal and generation against it.

pub mod provider;
pub mod types;
pub mod prompt;
pub mod stop_flag;
pub mod session;
pub mod model_manager;
pub mod providers;

pub use provider::{
    BackendKind, ChunkCallback, GenerationOptions, InferenceHandle, LlmError, ModelBackend,
    ModelSource, TokenChunk,
};
pub use types::{
    GenerationOutcome, HandleId, ModelDescriptor, ModelOrigin, OperationStatus, SessionNotice,
    SessionState, TargetId,
};
pub use prompt::{compose_prompt, PromptKind};
pub use stop_flag::StopFlag;
pub use session::InferenceSession;
