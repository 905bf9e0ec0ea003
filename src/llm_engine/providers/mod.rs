//! Model backend implementations
//!
//! Each backend implements the ModelBackend trait for one kind of model

pub mod openrouter_provider;
pub mod sidecar_provider;

pub use openrouter_provider::HostedBackend;
pub use sidecar_provider::SidecarBackend;
