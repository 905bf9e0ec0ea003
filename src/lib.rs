// llm-session - Inference session manager for on-device and hosted models
//
// Owns the lifecycle of the active language model:
// - Downloading and importing model artifacts
// - Loading them into a local or hosted backend
// - Streaming one generation at a time, with interruption
// - Persisting which model was chosen

// Performance logging macros - exported for use by other modules
#[macro_use]
pub mod macros;

pub mod config;
pub mod database;
pub mod llm_engine;
pub mod media;
pub mod state;

pub use config::SessionConfig;
pub use database::DatabaseManager;
pub use llm_engine::{
    GenerationOutcome, InferenceSession, LlmError, ModelDescriptor, ModelOrigin, OperationStatus,
    PromptKind, SessionNotice, SessionState,
};
pub use media::MediaManager;
pub use state::AppState;

/// Initialize logging. `RUST_LOG` overrides the default `info` filter.
/// Safe to call more than once.
pub fn init_logging() {
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .try_init();
}
