//! LLM Model Manager
//!
//! Moves model artifacts onto the device and keeps track of them.
//!
//! Module structure:
//! - types.rs: OpenedSource, TransferProgress, LocalArtifactInfo
//! - transfer.rs: chunked, cancellable byte transfer
//! - downloader.rs: remote model server (download + catalog)
//! - importer.rs: content sources for user-picked files
//! - manager.rs: LlmModelManager struct

pub mod types;
pub mod transfer;
pub mod downloader;
pub mod importer;
pub mod manager;

pub use types::{ByteReader, LocalArtifactInfo, OpenedSource, TransferProgress};
pub use transfer::{partial_path, TransferEngine};
pub use downloader::{download_artifact, ArtifactSource, AuthProvider, RemoteSource, StaticToken};
pub use importer::{media_extension, model_display_name, ContentSource, FsContentSource};
pub use manager::LlmModelManager;
