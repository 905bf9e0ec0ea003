//! Media attachments
//!
//! Copies user-picked media (images, audio) into app storage so prompts can
//! reference them after the original file is gone.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::llm_engine::model_manager::{media_extension, ContentSource, TransferEngine};
use crate::llm_engine::LlmError;

pub struct MediaManager {
    dir: PathBuf,
    engine: TransferEngine,
    content: Arc<dyn ContentSource>,
}

impl MediaManager {
    pub fn new(dir: PathBuf, engine: TransferEngine, content: Arc<dyn ContentSource>) -> Self {
        Self { dir, engine, content }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Copy the item at `uri` into `<dir>/<unix millis>.<ext>` and return the new path
    pub async fn import_media(&self, uri: &str) -> Result<PathBuf, LlmError> {
        let file_name = self.content.resolve_display_name(uri)?;
        let dest = self.unique_path(media_extension(&file_name));

        let opened = self.content.open_read_stream(uri).await?;
        let path = self
            .engine
            .transfer_media(opened.reader, &dest, &CancellationToken::new())
            .await?;

        log::info!("Imported media {} as {}", file_name, path.display());
        Ok(path)
    }

    /// Delete an imported media file. Missing files are not an error.
    pub async fn remove_media(&self, path: &Path) -> Result<(), LlmError> {
        match tokio::fs::remove_file(path).await {
            Ok(()) => {
                log::info!("Removed media {}", path.display());
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(LlmError::Transfer(format!(
                "Failed to remove {}: {}",
                path.display(),
                e
            ))),
        }
    }

    fn unique_path(&self, ext: Option<&str>) -> PathBuf {
        let millis = chrono::Utc::now().timestamp_millis();
        let name = |n: u32| {
            let stem = if n == 0 {
                millis.to_string()
            } else {
                format!("{}-{}", millis, n)
            };
            match ext {
                Some(ext) => format!("{}.{}", stem, ext),
                None => stem,
            }
        };

        // Two imports in the same millisecond
        let mut n = 0;
        let mut path = self.dir.join(name(n));
        while path.exists() {
            n += 1;
            path = self.dir.join(name(n));
        }
        path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm_engine::model_manager::FsContentSource;
    use tempfile::tempdir;

    fn manager(dir: &Path) -> MediaManager {
        MediaManager::new(
            dir.join("media"),
            TransferEngine::default(),
            Arc::new(FsContentSource),
        )
    }

    #[tokio::test]
    async fn test_import_copies_with_extension() {
        let dir = tempdir().unwrap();
        let picked = dir.path().join("photo.final.jpg");
        std::fs::write(&picked, vec![9u8; 1500]).unwrap();
        let media = manager(dir.path());

        let first = media.import_media(picked.to_str().unwrap()).await.unwrap();
        let second = media.import_media(picked.to_str().unwrap()).await.unwrap();

        assert_ne!(first, second);
        for path in [&first, &second] {
            assert_eq!(path.parent().unwrap(), dir.path().join("media"));
            assert_eq!(path.extension().unwrap(), "jpg");
            assert_eq!(std::fs::read(path).unwrap(), vec![9u8; 1500]);
        }
    }

    #[tokio::test]
    async fn test_import_missing_file() {
        let dir = tempdir().unwrap();
        let media = manager(dir.path());

        let err = media.import_media("/no/such/clip.wav").await.unwrap_err();
        assert!(matches!(err, LlmError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_remove_is_idempotent() {
        let dir = tempdir().unwrap();
        let picked = dir.path().join("clip.wav");
        std::fs::write(&picked, b"RIFF").unwrap();
        let media = manager(dir.path());

        let path = media.import_media(picked.to_str().unwrap()).await.unwrap();
        media.remove_media(&path).await.unwrap();
        assert!(!path.exists());
        media.remove_media(&path).await.unwrap();
        assert!(picked.exists());
    }
}
