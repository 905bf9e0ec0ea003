//! Model Manager Types

use serde::{Deserialize, Serialize};
use std::pin::Pin;
use tokio::io::AsyncRead;

/// Byte stream handed to the transfer engine
pub type ByteReader = Pin<Box<dyn AsyncRead + Send>>;

/// An opened source of bytes plus its size when the source knows it
pub struct OpenedSource {
    pub reader: ByteReader,
    pub content_length: Option<u64>,
}

/// Transfer progress information
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct TransferProgress {
    pub bytes_read: u64,
    pub total_bytes: Option<u64>,
    /// `bytes_read / total_bytes` clamped to [0, 1], None when the total is unknown
    pub fraction: Option<f32>,
}

impl TransferProgress {
    pub fn new(bytes_read: u64, total_bytes: Option<u64>) -> Self {
        let fraction = match total_bytes {
            Some(0) => Some(1.0),
            Some(total) => Some((bytes_read as f64 / total as f64).clamp(0.0, 1.0) as f32),
            None => None,
        };
        Self {
            bytes_read,
            total_bytes,
            fraction,
        }
    }
}

/// Information about a model artifact on disk
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LocalArtifactInfo {
    pub name: String,
    pub size_bytes: u64,
}
