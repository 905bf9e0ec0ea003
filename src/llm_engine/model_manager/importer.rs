//! Content sources for user-picked files

use async_trait::async_trait;
use std::path::PathBuf;

use crate::llm_engine::provider::LlmError;
use super::types::OpenedSource;

/// Resolves user-supplied URIs to names and byte streams
#[async_trait]
pub trait ContentSource: Send + Sync {
    /// File name the user would recognise, e.g. `gemma-2b.bin`
    fn resolve_display_name(&self, uri: &str) -> Result<String, LlmError>;

    async fn open_read_stream(&self, uri: &str) -> Result<OpenedSource, LlmError>;
}

/// Local filesystem, accepting plain paths and `file://` URIs
#[derive(Debug, Clone, Default)]
pub struct FsContentSource;

impl FsContentSource {
    fn to_path(uri: &str) -> PathBuf {
        PathBuf::from(uri.strip_prefix("file://").unwrap_or(uri))
    }
}

#[async_trait]
impl ContentSource for FsContentSource {
    fn resolve_display_name(&self, uri: &str) -> Result<String, LlmError> {
        Self::to_path(uri)
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .ok_or_else(|| LlmError::NotFound(format!("No file name in {:?}", uri)))
    }

    async fn open_read_stream(&self, uri: &str) -> Result<OpenedSource, LlmError> {
        let path = Self::to_path(uri);
        let file = tokio::fs::File::open(&path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                LlmError::NotFound(format!("{:?}", path))
            } else {
                LlmError::Transfer(format!("Failed to open {:?}: {}", path, e))
            }
        })?;
        let content_length = file.metadata().await.ok().map(|m| m.len());

        Ok(OpenedSource {
            reader: Box::pin(file),
            content_length,
        })
    }
}

/// Display name for an imported model file: the file name without `.bin`
pub fn model_display_name(file_name: &str) -> String {
    let base = file_name.rsplit(['/', '\\']).next().unwrap_or(file_name);
    base.strip_suffix(".bin").unwrap_or(base).to_string()
}

/// Extension used when storing an imported media file
pub fn media_extension(file_name: &str) -> Option<&str> {
    let (_, ext) = file_name.rsplit_once('.')?;
    if ext.is_empty() || ext.contains(['/', '\\']) {
        None
    } else {
        Some(ext)
    }
}
