//! Remote model artifact download

use async_trait::async_trait;
use futures_util::TryStreamExt;
use serde::Deserialize;
use std::path::Path;
use std::sync::Arc;
use tokio_util::io::StreamReader;
use tokio_util::sync::CancellationToken;

use crate::config::RemoteSourceConfig;
use crate::llm_engine::provider::LlmError;
use crate::llm_engine::types::ModelDescriptor;
use super::transfer::TransferEngine;
use super::types::{OpenedSource, TransferProgress};

/// Supplies the bearer token for remote requests
pub trait AuthProvider: Send + Sync {
    fn bearer_token(&self) -> Option<String>;
}

/// Fixed token, handy for configuration-driven setups
#[derive(Debug, Clone, Default)]
pub struct StaticToken(pub Option<String>);

impl AuthProvider for StaticToken {
    fn bearer_token(&self) -> Option<String> {
        self.0.clone()
    }
}

/// Where downloadable model artifacts come from
#[async_trait]
pub trait ArtifactSource: Send + Sync {
    /// Open a byte stream for the artifact called `name`
    async fn open(&self, name: &str) -> Result<OpenedSource, LlmError>;
}

/// Catalog entry served by the model server
#[derive(Debug, Deserialize)]
struct CatalogEntry {
    name: String,
    #[serde(default, alias = "displayName")]
    display_name: Option<String>,
}

/// HTTP model server
pub struct RemoteSource {
    config: RemoteSourceConfig,
    client: reqwest::Client,
    auth: Arc<dyn AuthProvider>,
}

impl RemoteSource {
    pub fn new(config: RemoteSourceConfig, auth: Arc<dyn AuthProvider>) -> Result<Self, LlmError> {
        let client = reqwest::Client::builder()
            .connect_timeout(std::time::Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| LlmError::Other(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self { config, client, auth })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.config.base_url.trim_end_matches('/'), path)
    }

    fn authorized(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match self.auth.bearer_token() {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    /// List the models the server offers for download
    pub async fn fetch_catalog(&self) -> Result<Vec<ModelDescriptor>, LlmError> {
        let response = self
            .authorized(self.client.get(self.url("models")))
            .send()
            .await
            .map_err(|e| LlmError::RequestFailed(format!("Failed to fetch model catalog: {}", e)))?;

        check_status(&response, "models")?;

        let entries: Vec<CatalogEntry> = response
            .json()
            .await
            .map_err(|e| LlmError::RequestFailed(format!("Invalid catalog response: {}", e)))?;

        Ok(entries
            .into_iter()
            .map(|entry| {
                let display_name = entry.display_name.unwrap_or_else(|| entry.name.clone());
                ModelDescriptor::downloadable(entry.name).with_display_name(display_name)
            })
            .collect())
    }
}

#[async_trait]
impl ArtifactSource for RemoteSource {
    async fn open(&self, name: &str) -> Result<OpenedSource, LlmError> {
        let url = self.url(&format!("models/{}", name));
        log::info!("Downloading model artifact from {}", url);

        let response = self
            .authorized(self.client.get(&url))
            .send()
            .await
            .map_err(|e| LlmError::Transfer(format!("Failed to start download: {}", e)))?;

        check_status(&response, name)?;

        let content_length = response.content_length();
        let stream = response
            .bytes_stream()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e));

        Ok(OpenedSource {
            reader: Box::pin(StreamReader::new(stream)),
            content_length,
        })
    }
}

fn check_status(response: &reqwest::Response, what: &str) -> Result<(), LlmError> {
    let status = response.status();
    if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
        return Err(LlmError::AuthenticationFailed(format!(
            "Model server rejected the request for '{}' ({})",
            what, status
        )));
    }
    if status == reqwest::StatusCode::NOT_FOUND {
        return Err(LlmError::NotFound(format!("'{}' is not on the model server", what)));
    }
    if !status.is_success() {
        return Err(LlmError::Transfer(format!(
            "Download failed with status: {}",
            status
        )));
    }
    Ok(())
}

/// Download the artifact `name` into `dest`
pub async fn download_artifact<F>(
    source: &dyn ArtifactSource,
    engine: &TransferEngine,
    name: &str,
    dest: &Path,
    cancel: &CancellationToken,
    on_progress: F,
) -> Result<std::path::PathBuf, LlmError>
where
    F: FnMut(TransferProgress) + Send,
{
    let opened = source.open(name).await?;
    engine
        .transfer_model(opened.reader, dest, opened.content_length, cancel, on_progress)
        .await
}
