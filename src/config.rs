//! Session configuration
//!
//! Every section has defaults, so a partial (or missing) JSON file is fine.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::llm_engine::provider::GenerationOptions;

/// Chunk sizes used by the transfer engine
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TransferConfig {
    /// Bytes per read when importing or downloading model artifacts
    pub model_chunk_size: usize,
    /// Bytes per read when importing media files
    pub media_chunk_size: usize,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            model_chunk_size: 2048,
            media_chunk_size: 512,
        }
    }
}

/// Model server for downloadable artifacts
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RemoteSourceConfig {
    pub base_url: String,
    pub timeout_secs: u64,
}

impl Default for RemoteSourceConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8000".to_string(),
            timeout_secs: 30,
        }
    }
}

/// Hosted streaming API
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct HostedConfig {
    pub base_url: String,
    /// Connection setup limit
    pub timeout_secs: u64,
    /// Longest silence allowed between streamed chunks
    pub idle_timeout_secs: u64,
}

impl Default for HostedConfig {
    fn default() -> Self {
        Self {
            base_url: "https://openrouter.ai/api/v1".to_string(),
            timeout_secs: 30,
            idle_timeout_secs: 120,
        }
    }
}

/// On-device engine process
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SidecarConfig {
    /// Explicit binary path; searched for next to the executable otherwise
    pub sidecar_path: Option<PathBuf>,
    pub binary_name: String,
}

impl Default for SidecarConfig {
    fn default() -> Self {
        Self {
            sidecar_path: None,
            binary_name: "llm-sidecar".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SessionConfig {
    /// Root for models, media and the metadata database
    pub data_dir: PathBuf,
    pub transfer: TransferConfig,
    pub generation: GenerationOptions,
    pub remote: RemoteSourceConfig,
    pub hosted: HostedConfig,
    pub sidecar: SidecarConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        let data_dir = dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("llm-session");

        Self {
            data_dir,
            transfer: TransferConfig::default(),
            generation: GenerationOptions::default(),
            remote: RemoteSourceConfig::default(),
            hosted: HostedConfig::default(),
            sidecar: SidecarConfig::default(),
        }
    }
}

impl SessionConfig {
    /// Load from a JSON file. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            log::info!("No config at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {:?}", path))?;
        let config: SessionConfig = serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse config {:?}", path))?;

        Ok(config)
    }

    /// Config rooted at `data_dir`, everything else default
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Self::default()
        }
    }

    pub fn models_dir(&self) -> PathBuf {
        self.data_dir.join("models")
    }

    pub fn media_dir(&self) -> PathBuf {
        self.data_dir.join("media")
    }

    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("models.db")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempdir().unwrap();
        let config = SessionConfig::load(&dir.path().join("absent.json")).unwrap();
        assert_eq!(config.transfer.model_chunk_size, 2048);
        assert_eq!(config.transfer.media_chunk_size, 512);
        assert_eq!(config.hosted.base_url, "https://openrouter.ai/api/v1");
    }

    #[test]
    fn test_partial_file_keeps_other_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{"data_dir": "/tmp/notes", "transfer": {"media_chunk_size": 1024}, "generation": {"temperature": 0.2}}"#,
        )
        .unwrap();

        let config = SessionConfig::load(&path).unwrap();
        assert_eq!(config.data_dir, PathBuf::from("/tmp/notes"));
        assert_eq!(config.transfer.model_chunk_size, 2048);
        assert_eq!(config.transfer.media_chunk_size, 1024);
        assert_eq!(config.generation.temperature, 0.2);
        assert_eq!(config.generation.max_tokens, 1000);
        assert_eq!(config.db_path(), PathBuf::from("/tmp/notes/models.db"));
    }

    #[test]
    fn test_malformed_file_is_an_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert!(SessionConfig::load(&path).is_err());
    }
}
