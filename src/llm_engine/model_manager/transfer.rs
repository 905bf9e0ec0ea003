//! Chunked byte transfer into local storage

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

use crate::config::TransferConfig;
use crate::llm_engine::provider::LlmError;
use super::types::TransferProgress;

/// Moves bytes from a source into a local file in fixed-size chunks
#[derive(Debug, Clone)]
pub struct TransferEngine {
    config: TransferConfig,
}

impl TransferEngine {
    pub fn new(config: TransferConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &TransferConfig {
        &self.config
    }

    /// Transfer a model artifact using the model chunk size
    pub async fn transfer_model<R, F>(
        &self,
        source: R,
        dest: &Path,
        expected_total: Option<u64>,
        cancel: &CancellationToken,
        on_progress: F,
    ) -> Result<PathBuf, LlmError>
    where
        R: AsyncRead + Unpin + Send,
        F: FnMut(TransferProgress) + Send,
    {
        self.transfer(source, dest, expected_total, self.config.model_chunk_size, cancel, on_progress)
            .await
    }

    /// Transfer a media file using the media chunk size
    pub async fn transfer_media<R>(
        &self,
        source: R,
        dest: &Path,
        cancel: &CancellationToken,
    ) -> Result<PathBuf, LlmError>
    where
        R: AsyncRead + Unpin + Send,
    {
        self.transfer(source, dest, None, self.config.media_chunk_size, cancel, |_| {})
            .await
    }

    /// Copy `source` into `dest`, reporting progress after every chunk.
    ///
    /// Bytes land in `<dest>.part` first and are renamed into place once the
    /// source is exhausted. On error or cancellation the partial file is
    /// removed. Returns the final path.
    pub async fn transfer<R, F>(
        &self,
        mut source: R,
        dest: &Path,
        expected_total: Option<u64>,
        chunk_size: usize,
        cancel: &CancellationToken,
        mut on_progress: F,
    ) -> Result<PathBuf, LlmError>
    where
        R: AsyncRead + Unpin + Send,
        F: FnMut(TransferProgress) + Send,
    {
        if chunk_size == 0 {
            return Err(LlmError::Transfer("chunk size must be positive".to_string()));
        }

        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| LlmError::Transfer(format!("Failed to create {}: {}", parent.display(), e)))?;
        }

        let part_path = partial_path(dest);
        let result = copy_chunks(
            &mut source,
            &part_path,
            expected_total,
            chunk_size,
            cancel,
            &mut on_progress,
        )
        .await;

        match result {
            Ok(bytes) => {
                if let Err(e) = tokio::fs::rename(&part_path, dest).await {
                    tokio::fs::remove_file(&part_path).await.ok();
                    return Err(LlmError::Transfer(format!(
                        "Failed to move {} into place: {}",
                        dest.display(),
                        e
                    )));
                }
                perf_debug!("Transferred {} bytes to {}", bytes, dest.display());
                Ok(dest.to_path_buf())
            }
            Err(e) => {
                if let Err(remove_err) = tokio::fs::remove_file(&part_path).await {
                    if remove_err.kind() != std::io::ErrorKind::NotFound {
                        log::warn!(
                            "Failed to remove partial file {}: {}",
                            part_path.display(),
                            remove_err
                        );
                    }
                }
                Err(e)
            }
        }
    }
}

impl Default for TransferEngine {
    fn default() -> Self {
        Self::new(TransferConfig::default())
    }
}

/// `<dest>.part`
pub fn partial_path(dest: &Path) -> PathBuf {
    let mut name = OsString::from(dest.as_os_str());
    name.push(".part");
    PathBuf::from(name)
}

async fn copy_chunks<R, F>(
    source: &mut R,
    part_path: &Path,
    expected_total: Option<u64>,
    chunk_size: usize,
    cancel: &CancellationToken,
    on_progress: &mut F,
) -> Result<u64, LlmError>
where
    R: AsyncRead + Unpin + Send,
    F: FnMut(TransferProgress) + Send,
{
    let mut file = tokio::fs::File::create(part_path)
        .await
        .map_err(|e| LlmError::Transfer(format!("Failed to create {}: {}", part_path.display(), e)))?;

    let mut buf = vec![0u8; chunk_size];
    let mut bytes_read: u64 = 0;

    loop {
        if cancel.is_cancelled() {
            return Err(LlmError::Cancelled);
        }

        let read = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(LlmError::Cancelled),
            read = read_chunk(source, &mut buf) => read,
        }
        .map_err(|e| LlmError::Transfer(format!("Read failed: {}", e)))?;

        if read == 0 {
            break;
        }

        file.write_all(&buf[..read])
            .await
            .map_err(|e| LlmError::Transfer(format!("Write failed: {}", e)))?;

        bytes_read += read as u64;
        perf_trace!("Transfer progress: {} bytes", bytes_read);

        if expected_total.is_some() {
            on_progress(TransferProgress::new(bytes_read, expected_total));
        }
    }

    file.flush()
        .await
        .map_err(|e| LlmError::Transfer(format!("Failed to flush file: {}", e)))?;

    // An empty artifact still completes its progress
    if bytes_read == 0 && expected_total == Some(0) {
        on_progress(TransferProgress::new(0, expected_total));
    }

    if let Some(total) = expected_total {
        if bytes_read < total {
            return Err(LlmError::Transfer(format!(
                "Source ended early: expected {} bytes, got {}",
                total, bytes_read
            )));
        }
    }

    Ok(bytes_read)
}

/// Fill `buf` unless the source ends first. Returns the number of bytes read.
async fn read_chunk<R>(source: &mut R, buf: &mut [u8]) -> std::io::Result<usize>
where
    R: AsyncRead + Unpin + Send,
{
    let mut filled = 0;
    while filled < buf.len() {
        let n = source.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}
