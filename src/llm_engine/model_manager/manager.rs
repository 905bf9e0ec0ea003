//! LLM Model Manager - Core struct and local artifact operations

use std::path::{Path, PathBuf};

use crate::llm_engine::provider::LlmError;
use super::transfer::partial_path;
use super::types::LocalArtifactInfo;

/// Owns the directory where model artifacts live
#[derive(Debug, Clone)]
pub struct LlmModelManager {
    /// Directory where models are stored
    models_dir: PathBuf,
}

impl LlmModelManager {
    /// Create a new model manager rooted at `models_dir`
    pub fn new(models_dir: PathBuf) -> Self {
        if !models_dir.exists() {
            if let Err(e) = std::fs::create_dir_all(&models_dir) {
                log::warn!("Failed to create models directory {:?}: {}", models_dir, e);
            }
        }

        Self { models_dir }
    }

    /// Get the models directory path
    pub fn models_dir(&self) -> &PathBuf {
        &self.models_dir
    }

    /// Path of the artifact called `name`.
    ///
    /// Names are bare file names; anything that would escape the models
    /// directory is rejected.
    pub fn model_path(&self, name: &str) -> Result<PathBuf, LlmError> {
        let valid = !name.is_empty()
            && name != "."
            && name != ".."
            && !name.contains('/')
            && !name.contains('\\');
        if !valid {
            return Err(LlmError::Other(format!("Invalid model artifact name: {:?}", name)));
        }
        Ok(self.models_dir.join(name))
    }

    /// Check if an artifact is present
    pub fn is_downloaded(&self, name: &str) -> bool {
        self.model_path(name).map(|p| p.is_file()).unwrap_or(false)
    }

    /// Delete an artifact. Missing files count as deleted.
    pub fn delete_artifact(&self, path: &Path) -> Result<(), LlmError> {
        for candidate in [path.to_path_buf(), partial_path(path)] {
            match std::fs::remove_file(&candidate) {
                Ok(()) => log::info!("Deleted model artifact {:?}", candidate),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(LlmError::Other(format!(
                        "Failed to delete {:?}: {}",
                        candidate, e
                    )))
                }
            }
        }
        Ok(())
    }

    /// Artifacts currently on disk, excluding unfinished transfers
    pub fn local_artifacts(&self) -> Result<Vec<LocalArtifactInfo>, LlmError> {
        let mut artifacts = Vec::new();

        if !self.models_dir.exists() {
            return Ok(artifacts);
        }

        let entries = std::fs::read_dir(&self.models_dir)
            .map_err(|e| LlmError::Other(format!("Failed to read models directory: {}", e)))?;

        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_file() || path.extension().map(|e| e == "part").unwrap_or(false) {
                continue;
            }
            if let Some(name) = path.file_name() {
                let size_bytes = std::fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
                artifacts.push(LocalArtifactInfo {
                    name: name.to_string_lossy().to_string(),
                    size_bytes,
                });
            }
        }

        artifacts.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(artifacts)
    }
}
