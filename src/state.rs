// Application state: wires the session to its backends, storage and the
// metadata store

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::config::SessionConfig;
use crate::database::DatabaseManager;
use crate::llm_engine::model_manager::{
    AuthProvider, ContentSource, FsContentSource, LlmModelManager, RemoteSource, TransferEngine,
};
use crate::llm_engine::providers::{HostedBackend, SidecarBackend};
use crate::llm_engine::{BackendKind, InferenceSession, LlmError, ModelDescriptor};
use crate::media::MediaManager;

pub struct AppState {
    /// Database manager for SQLite persistence
    database: Arc<DatabaseManager>,
    /// Owns the active model
    session: Arc<InferenceSession>,
    /// Imported media attachments
    media: MediaManager,
    /// Model server, None when downloads are not configured
    remote: Option<Arc<RemoteSource>>,
}

impl AppState {
    /// Build the production stack: sidecar for local files, hosted API for
    /// remote models, remote server for downloads
    pub fn new(config: SessionConfig, auth: Arc<dyn AuthProvider>) -> Result<Self, LlmError> {
        let database = DatabaseManager::init_with_config(&config)?;
        let remote = Arc::new(RemoteSource::new(config.remote.clone(), auth.clone())?);
        let hosted = HostedBackend::new(config.hosted.clone(), auth)?;
        let content: Arc<dyn ContentSource> = Arc::new(FsContentSource);

        let session = InferenceSession::new(
            LlmModelManager::new(config.models_dir()),
            TransferEngine::new(config.transfer.clone()),
            content,
            config.generation.clone(),
        )
        .with_backend(BackendKind::Local, Arc::new(SidecarBackend::new(config.sidecar.clone())))
        .with_backend(BackendKind::Hosted, Arc::new(hosted))
        .with_artifact_source(remote.clone());

        Ok(Self::with_session(&config, database, session, Some(remote)))
    }

    /// Assemble around an already configured session
    pub fn with_session(
        config: &SessionConfig,
        database: DatabaseManager,
        session: InferenceSession,
        remote: Option<Arc<RemoteSource>>,
    ) -> Self {
        let media = MediaManager::new(
            config.media_dir(),
            TransferEngine::new(config.transfer.clone()),
            Arc::new(FsContentSource),
        );

        Self {
            database: Arc::new(database),
            session: Arc::new(session),
            media,
            remote,
        }
    }

    pub fn database(&self) -> &DatabaseManager {
        &self.database
    }

    pub fn session(&self) -> Arc<InferenceSession> {
        self.session.clone()
    }

    pub fn media(&self) -> &MediaManager {
        &self.media
    }

    pub fn models(&self) -> &LlmModelManager {
        self.session.models()
    }

    /// Load `descriptor` and record it as the chosen model
    pub async fn activate(&self, descriptor: ModelDescriptor) -> Result<ModelDescriptor, LlmError> {
        let mut saved_id = None;
        let mut loaded = self
            .session
            .load_model(descriptor, |loaded| saved_id = self.persist_chosen(loaded))
            .await?;

        if let Some(id) = saved_id {
            loaded.id = id;
            loaded.is_chosen = true;
        }
        Ok(loaded)
    }

    /// Reload whichever model was chosen when the app last ran
    pub async fn restore_last_chosen(&self) -> Result<Option<ModelDescriptor>, LlmError> {
        let Some(last) = self.database.get_last_chosen()? else {
            log::info!("No previously chosen model");
            return Ok(None);
        };

        log::info!("Restoring last chosen model {}", last.display_name);
        self.activate(last).await.map(Some)
    }

    /// Import a model file and record it as the chosen model
    pub async fn import_local(&self, uri: &str) -> Result<ModelDescriptor, LlmError> {
        let mut saved_id = None;
        let mut imported = self
            .session
            .add_local_model(uri, |imported| saved_id = self.persist_chosen(imported))
            .await?;

        if let Some(id) = saved_id {
            imported.id = id;
            imported.is_chosen = true;
        }
        Ok(imported)
    }

    /// Delete the model's artifact, then forget it
    pub async fn remove(&self, descriptor: &ModelDescriptor) -> Result<(), LlmError> {
        self.session.remove_model(descriptor).await?;
        self.database.delete_model(descriptor)?;
        Ok(())
    }

    /// Every model the store knows about
    pub fn list_models(&self) -> Result<Vec<ModelDescriptor>, LlmError> {
        Ok(self.database.list_models()?)
    }

    /// Merge the server's catalog into the store. Known models keep their
    /// row and local path.
    pub async fn refresh_catalog(&self) -> Result<Vec<ModelDescriptor>, LlmError> {
        let remote = self.remote.as_ref().ok_or_else(|| {
            LlmError::ProviderUnavailable("No model server configured".to_string())
        })?;
        let catalog = remote.fetch_catalog().await?;

        let known = self.database.list_models()?;
        for entry in catalog {
            if !known.iter().any(|model| model.same_model(&entry)) {
                self.database.upsert_model(&entry)?;
            }
        }

        self.list_models()
    }

    pub async fn import_media(&self, uri: &str) -> Result<PathBuf, LlmError> {
        self.media.import_media(uri).await
    }

    pub async fn remove_media(&self, path: &Path) -> Result<(), LlmError> {
        self.media.remove_media(path).await
    }

    /// Mark `descriptor` as the one chosen model. Failures are logged: the
    /// model is loaded either way.
    fn persist_chosen(&self, descriptor: &ModelDescriptor) -> Option<i64> {
        let chosen = ModelDescriptor {
            is_chosen: true,
            ..descriptor.clone()
        };

        let result = self
            .database
            .clear_chosen_flag()
            .and_then(|_| self.database.upsert_model(&chosen));

        match result {
            Ok(id) => Some(id),
            Err(e) => {
                log::error!("Failed to persist chosen model {}: {:#}", descriptor.display_name, e);
                None
            }
        }
    }
}
