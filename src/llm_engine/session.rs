//! Inference session
//!
//! Single authority over the active model: which model is selected, the live
//! backend handle, and what the session is doing right now. Every change is
//! committed under one lock and published to observers in commit order.
//! Transfers, backend loads and token streams run outside the lock.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;

use crate::llm_engine::model_manager::{
    download_artifact, model_display_name, ArtifactSource, ContentSource, LlmModelManager,
    TransferEngine,
};
use crate::llm_engine::prompt::{compose_prompt, PromptKind};
use crate::llm_engine::provider::{
    BackendKind, ChunkCallback, GenerationOptions, InferenceHandle, LlmError, ModelBackend,
    ModelSource, TokenChunk,
};
use crate::llm_engine::stop_flag::StopFlag;
use crate::llm_engine::types::{
    GenerationOutcome, HandleId, ModelDescriptor, ModelOrigin, OperationStatus, SessionNotice,
    SessionState, TargetId,
};

const NOTICE_CAPACITY: usize = 16;
const TRANSITION_CAPACITY: usize = 256;

/// Session bookkeeping, only touched while holding `InferenceSession::inner`
struct Inner {
    selected: Option<ModelDescriptor>,
    handle: Option<Arc<dyn InferenceHandle>>,
    handle_id: Option<HandleId>,
    next_handle_id: u64,
    /// Status underneath a running removal
    underlying: OperationStatus,
    removing: bool,
    /// Model a load or import is bringing up
    pending_load: Option<ModelDescriptor>,
    transfer_cancel: Option<CancellationToken>,
    /// Generation still allowed to commit
    active_run: Option<u64>,
    next_run: u64,
    generation_cancel: Option<CancellationToken>,
}

impl Inner {
    fn new() -> Self {
        Self {
            selected: None,
            handle: None,
            handle_id: None,
            next_handle_id: 0,
            underlying: OperationStatus::Idle,
            removing: false,
            pending_load: None,
            transfer_cancel: None,
            active_run: None,
            next_run: 0,
            generation_cancel: None,
        }
    }

    fn published_status(&self) -> OperationStatus {
        if self.removing {
            OperationStatus::Removing
        } else {
            self.underlying
        }
    }

    fn is_busy(&self) -> bool {
        self.removing || !self.underlying.is_stable()
    }

    fn is_loading(&self) -> bool {
        match self.underlying {
            OperationStatus::Loading
            | OperationStatus::Activating
            | OperationStatus::Downloading { .. } => true,
            OperationStatus::Idle
            | OperationStatus::Ready
            | OperationStatus::Removing
            | OperationStatus::Responding { .. } => false,
        }
    }

    /// Where the session settles once nothing is running
    fn stable_status(&self) -> OperationStatus {
        if self.handle.is_some() {
            OperationStatus::Ready
        } else {
            OperationStatus::Idle
        }
    }

    fn busy_error(&self, what: &str) -> LlmError {
        LlmError::Busy(format!("cannot {} while {}", what, self.published_status().label()))
    }

    /// Stop the running generation so it commits nothing. Returns whether one was running.
    fn abandon_generation(&mut self, stop: &StopFlag) -> bool {
        stop.raise();
        if let Some(cancel) = self.generation_cancel.take() {
            cancel.cancel();
        }
        self.active_run.take().is_some()
    }

    /// Drop the selection and hand back the handle for release
    fn clear_selection(&mut self, stop: &StopFlag) -> Option<Arc<dyn InferenceHandle>> {
        self.abandon_generation(stop);
        self.selected = None;
        self.handle_id = None;
        let handle = self.handle.take();
        // A load in flight owns the status and will settle it
        if !self.is_loading() {
            self.underlying = OperationStatus::Idle;
        }
        handle
    }
}

/// Owns the model lifecycle and the single in-flight generation
pub struct InferenceSession {
    /// Registered backends, one per kind
    backends: HashMap<BackendKind, Arc<dyn ModelBackend>>,
    options: GenerationOptions,
    models: LlmModelManager,
    transfer: TransferEngine,
    artifacts: Option<Arc<dyn ArtifactSource>>,
    content: Arc<dyn ContentSource>,
    stop: Arc<StopFlag>,
    inner: Mutex<Inner>,
    state_tx: watch::Sender<SessionState>,
    transitions: broadcast::Sender<SessionState>,
    notices: broadcast::Sender<SessionNotice>,
}

impl InferenceSession {
    pub fn new(
        models: LlmModelManager,
        transfer: TransferEngine,
        content: Arc<dyn ContentSource>,
        options: GenerationOptions,
    ) -> Self {
        let (state_tx, _) = watch::channel(SessionState::default());
        let (transitions, _) = broadcast::channel(TRANSITION_CAPACITY);
        let (notices, _) = broadcast::channel(NOTICE_CAPACITY);

        Self {
            backends: HashMap::new(),
            options,
            models,
            transfer,
            artifacts: None,
            content,
            stop: Arc::new(StopFlag::new()),
            inner: Mutex::new(Inner::new()),
            state_tx,
            transitions,
            notices,
        }
    }

    /// Register the backend serving `kind`
    pub fn with_backend(mut self, kind: BackendKind, backend: Arc<dyn ModelBackend>) -> Self {
        log::info!("Registered {} backend ({})", kind, backend.backend_name());
        self.backends.insert(kind, backend);
        self
    }

    /// Where downloadable models are fetched from
    pub fn with_artifact_source(mut self, source: Arc<dyn ArtifactSource>) -> Self {
        self.artifacts = Some(source);
        self
    }

    pub fn has_backend(&self, kind: BackendKind) -> bool {
        self.backends.contains_key(&kind)
    }

    pub fn models(&self) -> &LlmModelManager {
        &self.models
    }

    // ------------------------------------------------------------------
    // Observers
    // ------------------------------------------------------------------

    /// Current state plus change notifications
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state_tx.subscribe()
    }

    pub fn snapshot(&self) -> SessionState {
        self.state_tx.borrow().clone()
    }

    /// Every committed state, in commit order
    pub fn subscribe_transitions(&self) -> broadcast::Receiver<SessionState> {
        self.transitions.subscribe()
    }

    /// User-visible error messages
    pub fn subscribe_notices(&self) -> broadcast::Receiver<SessionNotice> {
        self.notices.subscribe()
    }

    pub fn stop_requested(&self) -> bool {
        self.stop.is_raised()
    }

    // ------------------------------------------------------------------
    // Operations
    // ------------------------------------------------------------------

    /// Make `descriptor` the active model.
    ///
    /// Downloadable models without local bytes are fetched first. On success
    /// `on_loaded` receives the descriptor with its resolved local path and
    /// the previous handle is released.
    pub async fn load_model<F>(
        &self,
        descriptor: ModelDescriptor,
        on_loaded: F,
    ) -> Result<ModelDescriptor, LlmError>
    where
        F: FnOnce(&ModelDescriptor) + Send,
    {
        let backend = self.backend_for(descriptor.origin)?;
        let mut descriptor = descriptor;

        let needs_download = match descriptor.origin {
            ModelOrigin::Downloadable => {
                let present = descriptor
                    .local_path
                    .as_ref()
                    .map(|p| p.is_file())
                    .unwrap_or(false);
                if present {
                    false
                } else {
                    let cached = self.models.model_path(&descriptor.name)?;
                    if cached.is_file() {
                        descriptor.local_path = Some(cached);
                        false
                    } else {
                        true
                    }
                }
            }
            ModelOrigin::OnDevice | ModelOrigin::Hosted => false,
        };

        if needs_download && self.artifacts.is_none() {
            return Err(LlmError::ProviderUnavailable(
                "No model server configured for downloads".to_string(),
            ));
        }

        let status = if needs_download {
            OperationStatus::Downloading { progress: 0.0 }
        } else {
            OperationStatus::Activating
        };
        let cancel = self.begin_load(&descriptor, status, needs_download, None)?;
        log::info!(
            "Loading model {} ({})",
            descriptor.display_name,
            descriptor.origin.as_str()
        );

        let mut fresh_artifact = None;
        if let Some(cancel) = cancel {
            match self.download(&descriptor, &cancel).await {
                Ok(path) => {
                    descriptor.local_path = Some(path.clone());
                    fresh_artifact = Some(path);
                    self.set_status(OperationStatus::Activating);
                }
                Err(e) => {
                    self.finish_failed_load(&e);
                    return Err(e);
                }
            }
        }

        match self.activate(backend, &descriptor).await {
            Ok(handle) => {
                self.commit_loaded(descriptor.clone(), handle).await;
                on_loaded(&descriptor);
                Ok(descriptor)
            }
            Err(e) => {
                if let Some(path) = fresh_artifact {
                    self.discard_artifact(&path);
                }
                self.finish_failed_load(&e);
                Err(e)
            }
        }
    }

    /// Import a user-picked model file and make it the active model
    pub async fn add_local_model<F>(
        &self,
        uri: &str,
        on_imported: F,
    ) -> Result<ModelDescriptor, LlmError>
    where
        F: FnOnce(&ModelDescriptor) + Send,
    {
        let backend = self.backend_for(ModelOrigin::OnDevice)?;
        let file_name = self.content.resolve_display_name(uri)?;
        let dest = self.models.model_path(&file_name)?;
        let descriptor = ModelDescriptor::on_device(file_name.clone(), dest.clone())
            .with_display_name(model_display_name(&file_name));

        let cancel = self
            .begin_load(&descriptor, OperationStatus::Loading, true, Some(&dest))?
            .unwrap_or_default();
        log::info!("Importing model {} from {}", descriptor.display_name, uri);

        let imported = match self.content.open_read_stream(uri).await {
            Ok(opened) => {
                self.transfer
                    .transfer_model(opened.reader, &dest, opened.content_length, &cancel, |_| {})
                    .await
            }
            Err(e) => Err(e),
        };
        if let Err(e) = imported {
            self.finish_failed_load(&e);
            return Err(e);
        }

        match self.activate(backend, &descriptor).await {
            Ok(handle) => {
                self.commit_loaded(descriptor.clone(), handle).await;
                on_imported(&descriptor);
                Ok(descriptor)
            }
            Err(e) => {
                // Unusable import, don't leave it around. `dest` did not
                // exist before this call.
                self.discard_artifact(&dest);
                self.finish_failed_load(&e);
                Err(e)
            }
        }
    }

    /// Stream a response for `parts` interpolated into the `kind` template.
    ///
    /// `on_update` receives the text delivered so far after every chunk.
    pub async fn generate<F>(
        &self,
        kind: PromptKind,
        parts: Vec<String>,
        on_update: F,
        target: TargetId,
    ) -> Result<GenerationOutcome, LlmError>
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        let (run, handle, cancel) = {
            let mut inner = self.lock();
            if inner.is_busy() {
                return Err(inner.busy_error("generate"));
            }
            let handle = match (&inner.selected, &inner.handle) {
                (Some(_), Some(handle)) => handle.clone(),
                _ => return Err(LlmError::NoModelSelected),
            };

            inner.next_run += 1;
            let run = inner.next_run;
            let cancel = CancellationToken::new();
            inner.active_run = Some(run);
            inner.generation_cancel = Some(cancel.clone());
            inner.underlying = OperationStatus::Responding { target };
            self.stop.reset();
            self.publish(&inner);
            (run, handle, cancel)
        };

        let prompt = compose_prompt(kind, &parts);
        perf_debug!("Generation {} for target {} ({} prompt bytes)", run, target, prompt.len());

        let delivered = Arc::new(Mutex::new(String::new()));
        let on_chunk: ChunkCallback = {
            let stop = self.stop.clone();
            let cancel = cancel.clone();
            let delivered = delivered.clone();
            Box::new(move |chunk: TokenChunk| {
                if stop.is_raised() || cancel.is_cancelled() {
                    perf_trace!("Suppressed chunk after stop");
                    return;
                }
                if chunk.text.is_empty() {
                    return;
                }
                let text = {
                    let mut text = delivered.lock().unwrap_or_else(PoisonError::into_inner);
                    text.push_str(&chunk.text);
                    text.clone()
                };
                on_update(&text);
            })
        };

        let result = handle.generate(&prompt, on_chunk, cancel).await;
        let text = delivered
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        let mut inner = self.lock();
        if inner.active_run != Some(run) {
            log::info!("Generation {} stopped before it finished", run);
            return Ok(GenerationOutcome {
                text,
                interrupted: true,
            });
        }

        inner.active_run = None;
        inner.generation_cancel = None;
        inner.underlying = inner.stable_status();

        match result {
            Ok(()) => {
                self.stop.reset();
                self.publish(&inner);
                Ok(GenerationOutcome {
                    text,
                    interrupted: false,
                })
            }
            Err(e) => {
                self.stop.raise();
                self.publish(&inner);
                drop(inner);
                self.notify(&e);
                Err(e)
            }
        }
    }

    /// Stop delivering tokens and surface `error`, if any
    pub fn interrupt(&self, error: Option<LlmError>) {
        {
            let mut inner = self.lock();
            if inner.abandon_generation(&self.stop) {
                inner.underlying = inner.stable_status();
                self.publish(&inner);
                log::info!("Generation interrupted");
            }
        }

        if let Some(e) = error {
            self.notify(&e);
        }
    }

    /// Delete a model's local artifact.
    ///
    /// Removing the selected model drops the selection and releases its
    /// handle. Removing any other model leaves the running operation alone.
    pub async fn remove_model(&self, descriptor: &ModelDescriptor) -> Result<(), LlmError> {
        {
            let mut inner = self.lock();
            if inner.removing {
                return Err(LlmError::Busy("another model is being removed".to_string()));
            }
            let is_loading_it = inner
                .pending_load
                .as_ref()
                .map(|pending| pending.same_model(descriptor))
                .unwrap_or(false);
            if is_loading_it {
                return Err(LlmError::Busy(format!(
                    "{} is being loaded",
                    descriptor.display_name
                )));
            }
            inner.removing = true;
            self.publish(&inner);
        }

        log::info!("Removing model {}", descriptor.display_name);
        let deleted = self.delete_files(descriptor).await;

        let released = {
            let mut inner = self.lock();
            inner.removing = false;
            let was_selected = inner
                .selected
                .as_ref()
                .map(|selected| selected.same_model(descriptor))
                .unwrap_or(false);
            let released = if was_selected && deleted.is_ok() {
                inner.clear_selection(&self.stop)
            } else {
                None
            };
            self.publish(&inner);
            released
        };

        if let Some(handle) = released {
            handle.release().await;
        }
        if let Err(e) = &deleted {
            self.notify(e);
        }
        deleted
    }

    /// Release the handle and clear the selection. Safe when already idle.
    pub async fn unload_model(&self) -> Result<(), LlmError> {
        let released = {
            let mut inner = self.lock();
            if inner.removing || inner.is_loading() {
                return Err(inner.busy_error("unload"));
            }
            let released = inner.clear_selection(&self.stop);
            self.publish(&inner);
            released
        };

        if let Some(handle) = released {
            handle.release().await;
            log::info!("Model unloaded");
        }
        Ok(())
    }

    /// Cancel a running download or import. Returns whether one was running.
    pub fn cancel_transfer(&self) -> bool {
        let inner = self.lock();
        match &inner.transfer_cancel {
            Some(cancel) => {
                log::info!("Cancelling model transfer");
                cancel.cancel();
                true
            }
            None => false,
        }
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Publish the committed state. Callers hold the lock, which keeps
    /// publication in commit order.
    fn publish(&self, inner: &Inner) {
        let state = SessionState {
            selected_model: inner.selected.clone(),
            handle: inner.handle_id,
            operation: inner.published_status(),
        };
        perf_debug!("Session state -> {}", state.operation.label());
        let _ = self.transitions.send(state.clone());
        self.state_tx.send_replace(state);
    }

    fn notify(&self, error: &LlmError) {
        log::error!("{}", error);
        let _ = self.notices.send(SessionNotice {
            message: error.to_string(),
        });
    }

    fn backend_for(&self, origin: ModelOrigin) -> Result<Arc<dyn ModelBackend>, LlmError> {
        let kind = origin.backend();
        self.backends.get(&kind).cloned().ok_or_else(|| {
            LlmError::ProviderUnavailable(format!("No {} backend registered", kind))
        })
    }

    /// Enter a load status. Returns the transfer token when bytes must move.
    fn begin_load(
        &self,
        descriptor: &ModelDescriptor,
        status: OperationStatus,
        with_transfer: bool,
        claim: Option<&Path>,
    ) -> Result<Option<CancellationToken>, LlmError> {
        let mut inner = self.lock();
        if inner.is_busy() {
            return Err(inner.busy_error("load a model"));
        }

        // An import may only create a new file, never replace an existing one
        if let Some(dest) = claim {
            let in_use = inner
                .selected
                .as_ref()
                .and_then(|selected| selected.local_path.as_deref())
                .map(|path| path == dest)
                .unwrap_or(false);
            if in_use {
                return Err(LlmError::Busy(format!(
                    "{} is the active model",
                    dest.display()
                )));
            }
            if dest.exists() {
                return Err(LlmError::Other(format!(
                    "A model file named {:?} is already installed",
                    dest.file_name().unwrap_or(dest.as_os_str())
                )));
            }
        }

        let cancel = with_transfer.then(CancellationToken::new);
        inner.underlying = status;
        inner.pending_load = Some(descriptor.clone());
        inner.transfer_cancel = cancel.clone();
        self.publish(&inner);
        Ok(cancel)
    }

    fn set_status(&self, status: OperationStatus) {
        let mut inner = self.lock();
        inner.underlying = status;
        inner.transfer_cancel = None;
        self.publish(&inner);
    }

    /// Progress only moves forward
    fn set_progress(&self, fraction: f32) {
        let mut inner = self.lock();
        if let OperationStatus::Downloading { progress } = inner.underlying {
            if fraction > progress {
                inner.underlying = OperationStatus::Downloading { progress: fraction };
                self.publish(&inner);
            }
        }
    }

    fn finish_failed_load(&self, error: &LlmError) {
        {
            let mut inner = self.lock();
            inner.pending_load = None;
            inner.transfer_cancel = None;
            inner.underlying = inner.stable_status();
            self.publish(&inner);
        }

        if *error == LlmError::Cancelled {
            log::info!("Model load cancelled");
        } else {
            self.notify(error);
        }
    }

    async fn commit_loaded(&self, descriptor: ModelDescriptor, handle: Arc<dyn InferenceHandle>) {
        let previous = {
            let mut inner = self.lock();
            inner.next_handle_id += 1;
            inner.handle_id = Some(HandleId(inner.next_handle_id));
            let previous = inner.handle.replace(handle);
            inner.selected = Some(descriptor);
            inner.underlying = OperationStatus::Ready;
            inner.pending_load = None;
            inner.transfer_cancel = None;
            self.publish(&inner);
            previous
        };

        if let Some(previous) = previous {
            previous.release().await;
        }
    }

    async fn download(
        &self,
        descriptor: &ModelDescriptor,
        cancel: &CancellationToken,
    ) -> Result<PathBuf, LlmError> {
        let source = self.artifacts.as_ref().ok_or_else(|| {
            LlmError::ProviderUnavailable("No model server configured for downloads".to_string())
        })?;
        let dest = self.models.model_path(&descriptor.name)?;

        download_artifact(
            source.as_ref(),
            &self.transfer,
            &descriptor.name,
            &dest,
            cancel,
            |progress| {
                if let Some(fraction) = progress.fraction {
                    self.set_progress(fraction);
                }
            },
        )
        .await
    }

    async fn activate(
        &self,
        backend: Arc<dyn ModelBackend>,
        descriptor: &ModelDescriptor,
    ) -> Result<Arc<dyn InferenceHandle>, LlmError> {
        let source = descriptor.source().ok_or_else(|| {
            LlmError::BackendLoad(format!("{} has no local file", descriptor.display_name))
        })?;

        // The file may have been deleted since it was picked
        if let ModelSource::File(path) = &source {
            if !path.is_file() {
                return Err(LlmError::BackendLoad(format!(
                    "Model file not found: {}",
                    path.display()
                )));
            }
        }

        backend.create_handle(&source, &self.options).await
    }

    async fn delete_files(&self, descriptor: &ModelDescriptor) -> Result<(), LlmError> {
        let path = match descriptor.origin {
            ModelOrigin::Hosted => return Ok(()),
            ModelOrigin::OnDevice | ModelOrigin::Downloadable => match &descriptor.local_path {
                Some(path) => path.clone(),
                None => self.models.model_path(&descriptor.name)?,
            },
        };

        let models = self.models.clone();
        tokio::task::spawn_blocking(move || models.delete_artifact(&path))
            .await
            .map_err(|e| LlmError::Other(format!("Delete task failed: {}", e)))?
    }

    fn discard_artifact(&self, path: &Path) {
        if let Err(e) = self.models.delete_artifact(path) {
            log::warn!("Failed to discard {}: {}", path.display(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TransferConfig;
    use crate::llm_engine::model_manager::{FsContentSource, OpenedSource};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tempfile::{tempdir, TempDir};
    use tokio::io::{AsyncWriteExt, DuplexStream};
    use tokio::sync::{mpsc, Notify};

    // ------------------------------------------------------------------
    // Test doubles
    // ------------------------------------------------------------------

    enum Step {
        Chunk(TokenChunk),
        Fail(String),
    }

    /// Backend whose token streams are fed from a channel
    struct ScriptedBackend {
        steps: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<Step>>>,
        load_gate: Option<Arc<Notify>>,
        fail_loads: AtomicBool,
        handles: Mutex<Vec<Arc<ScriptedHandle>>>,
    }

    impl ScriptedBackend {
        fn new() -> (Arc<Self>, mpsc::UnboundedSender<Step>) {
            Self::build(None)
        }

        fn gated(gate: Arc<Notify>) -> (Arc<Self>, mpsc::UnboundedSender<Step>) {
            Self::build(Some(gate))
        }

        fn build(load_gate: Option<Arc<Notify>>) -> (Arc<Self>, mpsc::UnboundedSender<Step>) {
            let (tx, rx) = mpsc::unbounded_channel();
            let backend = Arc::new(Self {
                steps: Arc::new(tokio::sync::Mutex::new(rx)),
                load_gate,
                fail_loads: AtomicBool::new(false),
                handles: Mutex::new(Vec::new()),
            });
            (backend, tx)
        }

        fn handles(&self) -> Vec<Arc<ScriptedHandle>> {
            self.handles.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ModelBackend for ScriptedBackend {
        fn backend_name(&self) -> &'static str {
            "scripted"
        }

        async fn create_handle(
            &self,
            source: &ModelSource,
            _options: &GenerationOptions,
        ) -> Result<Arc<dyn InferenceHandle>, LlmError> {
            if let Some(gate) = &self.load_gate {
                gate.notified().await;
            }
            if self.fail_loads.load(Ordering::SeqCst) {
                return Err(LlmError::BackendLoad("unsupported format".to_string()));
            }
            let handle = Arc::new(ScriptedHandle {
                source: source.clone(),
                steps: self.steps.clone(),
                released: AtomicBool::new(false),
            });
            self.handles.lock().unwrap().push(handle.clone());
            Ok(handle)
        }
    }

    struct ScriptedHandle {
        source: ModelSource,
        steps: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<Step>>>,
        released: AtomicBool,
    }

    #[async_trait]
    impl InferenceHandle for ScriptedHandle {
        // Ignores `cancel` on purpose: suppression must come from the session
        async fn generate(
            &self,
            _prompt: &str,
            on_chunk: ChunkCallback,
            _cancel: CancellationToken,
        ) -> Result<(), LlmError> {
            let mut steps = self.steps.lock().await;
            while let Some(step) = steps.recv().await {
                match step {
                    Step::Chunk(chunk) => {
                        let last = chunk.is_final;
                        on_chunk(chunk);
                        if last {
                            return Ok(());
                        }
                    }
                    Step::Fail(message) => return Err(LlmError::Generation(message)),
                }
            }
            Ok(())
        }

        async fn release(&self) {
            self.released.store(true, Ordering::SeqCst);
        }

        fn is_released(&self) -> bool {
            self.released.load(Ordering::SeqCst)
        }
    }

    /// Artifact source fed through an in-memory pipe
    struct PipeSource {
        reader: Mutex<Option<DuplexStream>>,
        total: u64,
    }

    impl PipeSource {
        fn new(total: u64) -> (Arc<Self>, DuplexStream) {
            let (writer, reader) = tokio::io::duplex(4096);
            let source = Arc::new(Self {
                reader: Mutex::new(Some(reader)),
                total,
            });
            (source, writer)
        }
    }

    #[async_trait]
    impl ArtifactSource for PipeSource {
        async fn open(&self, name: &str) -> Result<OpenedSource, LlmError> {
            let reader = self
                .reader
                .lock()
                .unwrap()
                .take()
                .ok_or_else(|| LlmError::NotFound(name.to_string()))?;
            Ok(OpenedSource {
                reader: Box::pin(reader),
                content_length: Some(self.total),
            })
        }
    }

    struct BytesSource(Vec<u8>);

    #[async_trait]
    impl ArtifactSource for BytesSource {
        async fn open(&self, _name: &str) -> Result<OpenedSource, LlmError> {
            Ok(OpenedSource {
                reader: Box::pin(std::io::Cursor::new(self.0.clone())),
                content_length: Some(self.0.len() as u64),
            })
        }
    }

    // ------------------------------------------------------------------
    // Helpers
    // ------------------------------------------------------------------

    fn session_with(dir: &TempDir, backend: Arc<ScriptedBackend>, chunk: usize) -> InferenceSession {
        InferenceSession::new(
            LlmModelManager::new(dir.path().join("models")),
            TransferEngine::new(TransferConfig {
                model_chunk_size: chunk,
                media_chunk_size: 512,
            }),
            Arc::new(FsContentSource),
            GenerationOptions::default(),
        )
        .with_backend(BackendKind::Local, backend)
    }

    fn model_file(dir: &TempDir, name: &str) -> ModelDescriptor {
        let path = dir.path().join("models").join(name);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, b"weights").unwrap();
        ModelDescriptor::on_device(name, path)
    }

    fn statuses(rx: &mut broadcast::Receiver<SessionState>) -> Vec<OperationStatus> {
        let mut seen = Vec::new();
        while let Ok(state) = rx.try_recv() {
            seen.push(state.operation);
        }
        seen
    }

    fn chunk(text: &str) -> Step {
        Step::Chunk(TokenChunk::partial(text))
    }

    fn last(text: &str) -> Step {
        Step::Chunk(TokenChunk::last(text))
    }

    // ------------------------------------------------------------------
    // Loading
    // ------------------------------------------------------------------

    #[tokio::test]
    async fn test_load_on_device_model_becomes_ready() {
        let dir = tempdir().unwrap();
        let (backend, _steps) = ScriptedBackend::new();
        let session = session_with(&dir, backend.clone(), 2048);
        let a = model_file(&dir, "a.bin");
        let mut transitions = session.subscribe_transitions();

        let mut persisted = None;
        session
            .load_model(a.clone(), |d| persisted = Some(d.clone()))
            .await
            .unwrap();

        let state = session.snapshot();
        assert_eq!(state.selected_model, Some(a.clone()));
        assert_eq!(state.operation, OperationStatus::Ready);
        assert!(state.handle.is_some());
        assert_eq!(persisted, Some(a.clone()));
        assert_eq!(
            statuses(&mut transitions),
            vec![OperationStatus::Activating, OperationStatus::Ready]
        );
        assert_eq!(
            backend.handles()[0].source,
            ModelSource::File(a.local_path.unwrap())
        );
    }

    #[tokio::test]
    async fn test_new_load_releases_previous_handle() {
        let dir = tempdir().unwrap();
        let (backend, _steps) = ScriptedBackend::new();
        let session = session_with(&dir, backend.clone(), 2048);

        session.load_model(model_file(&dir, "a.bin"), |_| {}).await.unwrap();
        let first_id = session.snapshot().handle;
        session.load_model(model_file(&dir, "b.bin"), |_| {}).await.unwrap();

        let handles = backend.handles();
        assert_eq!(handles.len(), 2);
        assert!(handles[0].is_released());
        assert!(!handles[1].is_released());
        assert_ne!(session.snapshot().handle, first_id);
        assert_eq!(session.snapshot().selected_model.unwrap().name, "b.bin");
    }

    #[tokio::test]
    async fn test_failed_load_keeps_previous_model() {
        let dir = tempdir().unwrap();
        let (backend, _steps) = ScriptedBackend::new();
        let session = session_with(&dir, backend.clone(), 2048);
        let mut notices = session.subscribe_notices();

        let a = model_file(&dir, "a.bin");
        session.load_model(a.clone(), |_| {}).await.unwrap();

        backend.fail_loads.store(true, Ordering::SeqCst);
        let mut called = false;
        let err = session
            .load_model(model_file(&dir, "b.bin"), |_| called = true)
            .await
            .unwrap_err();

        assert!(matches!(err, LlmError::BackendLoad(_)));
        assert!(!called);
        let state = session.snapshot();
        assert_eq!(state.operation, OperationStatus::Ready);
        assert_eq!(state.selected_model, Some(a));
        assert!(!backend.handles()[0].is_released());
        assert!(notices.try_recv().unwrap().message.contains("unsupported format"));
    }

    #[tokio::test]
    async fn test_missing_file_is_recoverable() {
        let dir = tempdir().unwrap();
        let (backend, _steps) = ScriptedBackend::new();
        let session = session_with(&dir, backend.clone(), 2048);

        let gone = ModelDescriptor::on_device("gone.bin", dir.path().join("gone.bin"));
        let err = session.load_model(gone, |_| {}).await.unwrap_err();

        assert!(matches!(err, LlmError::BackendLoad(_)));
        assert_eq!(session.snapshot(), SessionState::default());
        assert!(backend.handles().is_empty());
    }

    #[tokio::test]
    async fn test_unregistered_backend_is_rejected_without_state_change() {
        let dir = tempdir().unwrap();
        let (backend, _steps) = ScriptedBackend::new();
        let session = session_with(&dir, backend, 2048);
        let mut transitions = session.subscribe_transitions();

        let err = session
            .load_model(ModelDescriptor::hosted("openai/gpt-4o-mini"), |_| {})
            .await
            .unwrap_err();

        assert!(matches!(err, LlmError::ProviderUnavailable(_)));
        assert!(statuses(&mut transitions).is_empty());
    }

    #[tokio::test]
    async fn test_download_publishes_progress_then_activates() {
        let dir = tempdir().unwrap();
        let (backend, _steps) = ScriptedBackend::new();
        let session = session_with(&dir, backend, 50)
            .with_artifact_source(Arc::new(BytesSource(vec![3u8; 100])));
        let mut transitions = session.subscribe_transitions();

        let mut persisted = None;
        let loaded = session
            .load_model(ModelDescriptor::downloadable("m.bin"), |d| {
                persisted = d.local_path.clone()
            })
            .await
            .unwrap();

        assert_eq!(
            statuses(&mut transitions),
            vec![
                OperationStatus::Downloading { progress: 0.0 },
                OperationStatus::Downloading { progress: 0.5 },
                OperationStatus::Downloading { progress: 1.0 },
                OperationStatus::Activating,
                OperationStatus::Ready,
            ]
        );
        let path = dir.path().join("models").join("m.bin");
        assert_eq!(loaded.local_path, Some(path.clone()));
        assert_eq!(persisted, Some(path.clone()));
        assert_eq!(std::fs::read(&path).unwrap().len(), 100);
    }

    #[tokio::test]
    async fn test_empty_download_still_reaches_full_progress() {
        let dir = tempdir().unwrap();
        let (backend, _steps) = ScriptedBackend::new();
        let session = session_with(&dir, backend, 50)
            .with_artifact_source(Arc::new(BytesSource(Vec::new())));
        let mut transitions = session.subscribe_transitions();

        session
            .load_model(ModelDescriptor::downloadable("empty.bin"), |_| {})
            .await
            .unwrap();

        assert_eq!(
            statuses(&mut transitions),
            vec![
                OperationStatus::Downloading { progress: 0.0 },
                OperationStatus::Downloading { progress: 1.0 },
                OperationStatus::Activating,
                OperationStatus::Ready,
            ]
        );
    }

    #[tokio::test]
    async fn test_cached_download_skips_transfer() {
        let dir = tempdir().unwrap();
        let (backend, _steps) = ScriptedBackend::new();
        let session = session_with(&dir, backend, 2048);
        model_file(&dir, "m.bin");
        let mut transitions = session.subscribe_transitions();

        // No artifact source: a download attempt would fail
        let loaded = session
            .load_model(ModelDescriptor::downloadable("m.bin"), |_| {})
            .await
            .unwrap();

        assert_eq!(loaded.local_path, Some(dir.path().join("models").join("m.bin")));
        assert_eq!(
            statuses(&mut transitions),
            vec![OperationStatus::Activating, OperationStatus::Ready]
        );
    }

    #[tokio::test]
    async fn test_generate_during_download_is_busy() {
        let dir = tempdir().unwrap();
        let (backend, _steps) = ScriptedBackend::new();
        let (source, mut writer) = PipeSource::new(100);
        let session = Arc::new(session_with(&dir, backend, 40).with_artifact_source(source));
        let mut states = session.subscribe();

        let loader = tokio::spawn({
            let session = session.clone();
            async move {
                session
                    .load_model(ModelDescriptor::downloadable("m.bin"), |_| {})
                    .await
            }
        });

        writer.write_all(&[1u8; 40]).await.unwrap();
        states
            .wait_for(|s| s.operation == OperationStatus::Downloading { progress: 0.4 })
            .await
            .unwrap();

        let before = session.snapshot();
        let err = session
            .generate(PromptKind::Summarize, vec!["note".to_string()], |_| {}, 1)
            .await
            .unwrap_err();
        assert!(matches!(err, LlmError::Busy(_)));
        assert_eq!(session.snapshot(), before);

        writer.write_all(&[1u8; 60]).await.unwrap();
        drop(writer);
        let loaded = loader.await.unwrap().unwrap();
        assert!(loaded.local_path.unwrap().is_file());
        assert_eq!(session.snapshot().operation, OperationStatus::Ready);
    }

    #[tokio::test]
    async fn test_cancelled_download_returns_to_idle() {
        let dir = tempdir().unwrap();
        let (backend, _steps) = ScriptedBackend::new();
        let (source, mut writer) = PipeSource::new(100);
        let session = Arc::new(session_with(&dir, backend, 40).with_artifact_source(source));
        let mut states = session.subscribe();
        let mut notices = session.subscribe_notices();

        let loader = tokio::spawn({
            let session = session.clone();
            async move {
                session
                    .load_model(ModelDescriptor::downloadable("m.bin"), |_| {})
                    .await
            }
        });

        writer.write_all(&[1u8; 40]).await.unwrap();
        states
            .wait_for(|s| matches!(s.operation, OperationStatus::Downloading { progress } if progress > 0.0))
            .await
            .unwrap();

        assert!(session.cancel_transfer());
        assert_eq!(loader.await.unwrap().unwrap_err(), LlmError::Cancelled);

        assert_eq!(session.snapshot(), SessionState::default());
        assert!(!session.cancel_transfer());
        assert!(std::fs::read_dir(dir.path().join("models")).unwrap().next().is_none());
        assert!(notices.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_truncated_download_is_a_transfer_error() {
        let dir = tempdir().unwrap();
        let (backend, _steps) = ScriptedBackend::new();
        let (source, mut writer) = PipeSource::new(100);
        let session = session_with(&dir, backend, 40).with_artifact_source(source);
        let mut notices = session.subscribe_notices();

        writer.write_all(&[1u8; 40]).await.unwrap();
        drop(writer);

        let err = session
            .load_model(ModelDescriptor::downloadable("m.bin"), |_| {})
            .await
            .unwrap_err();

        assert!(matches!(err, LlmError::Transfer(_)));
        assert_eq!(session.snapshot().operation, OperationStatus::Idle);
        assert!(!dir.path().join("models").join("m.bin").exists());
        assert!(notices.try_recv().is_ok());
    }

    #[tokio::test]
    async fn test_second_load_while_activating_is_busy() {
        let dir = tempdir().unwrap();
        let gate = Arc::new(Notify::new());
        let (backend, _steps) = ScriptedBackend::gated(gate.clone());
        let session = Arc::new(session_with(&dir, backend, 2048));
        let mut states = session.subscribe();
        let a = model_file(&dir, "a.bin");

        let loader = tokio::spawn({
            let session = session.clone();
            let a = a.clone();
            async move { session.load_model(a, |_| {}).await }
        });
        states
            .wait_for(|s| s.operation == OperationStatus::Activating)
            .await
            .unwrap();

        let err = session.load_model(model_file(&dir, "b.bin"), |_| {}).await.unwrap_err();
        assert!(matches!(err, LlmError::Busy(_)));
        let err = session.remove_model(&a).await.unwrap_err();
        assert!(matches!(err, LlmError::Busy(_)));
        let err = session.unload_model().await.unwrap_err();
        assert!(matches!(err, LlmError::Busy(_)));
        assert!(a.local_path.as_ref().unwrap().exists());

        gate.notify_one();
        loader.await.unwrap().unwrap();
        assert_eq!(session.snapshot().operation, OperationStatus::Ready);
    }

    // ------------------------------------------------------------------
    // Import
    // ------------------------------------------------------------------

    #[tokio::test]
    async fn test_add_local_model_copies_and_activates() {
        let dir = tempdir().unwrap();
        let (backend, _steps) = ScriptedBackend::new();
        let session = session_with(&dir, backend, 3);
        let picked = dir.path().join("Download").join("phi-2.bin");
        std::fs::create_dir_all(picked.parent().unwrap()).unwrap();
        std::fs::write(&picked, b"imported weights").unwrap();
        let mut transitions = session.subscribe_transitions();

        let mut persisted = None;
        let imported = session
            .add_local_model(&format!("file://{}", picked.display()), |d| {
                persisted = Some(d.clone())
            })
            .await
            .unwrap();

        let dest = dir.path().join("models").join("phi-2.bin");
        assert_eq!(imported.display_name, "phi-2");
        assert_eq!(imported.origin, ModelOrigin::OnDevice);
        assert_eq!(imported.local_path, Some(dest.clone()));
        assert_eq!(std::fs::read(&dest).unwrap(), b"imported weights");
        assert_eq!(persisted, Some(imported.clone()));
        assert_eq!(session.snapshot().selected_model, Some(imported));
        assert_eq!(
            statuses(&mut transitions),
            vec![OperationStatus::Loading, OperationStatus::Ready]
        );
    }

    #[tokio::test]
    async fn test_unusable_import_is_deleted() {
        let dir = tempdir().unwrap();
        let (backend, _steps) = ScriptedBackend::new();
        backend.fail_loads.store(true, Ordering::SeqCst);
        let session = session_with(&dir, backend, 2048);
        let picked = dir.path().join("broken.bin");
        std::fs::write(&picked, b"garbage").unwrap();

        let err = session
            .add_local_model(picked.to_str().unwrap(), |_| {})
            .await
            .unwrap_err();

        assert!(matches!(err, LlmError::BackendLoad(_)));
        assert!(!dir.path().join("models").join("broken.bin").exists());
        assert_eq!(session.snapshot(), SessionState::default());
    }

    #[tokio::test]
    async fn test_import_of_missing_file_fails_cleanly() {
        let dir = tempdir().unwrap();
        let (backend, _steps) = ScriptedBackend::new();
        let session = session_with(&dir, backend, 2048);

        let err = session
            .add_local_model("/no/such/model.bin", |_| {})
            .await
            .unwrap_err();

        assert!(matches!(err, LlmError::NotFound(_)));
        assert_eq!(session.snapshot().operation, OperationStatus::Idle);
    }

    #[tokio::test]
    async fn test_import_cannot_replace_active_model() {
        let dir = tempdir().unwrap();
        let (backend, _steps) = ScriptedBackend::new();
        let session = session_with(&dir, backend.clone(), 2048);
        let a = model_file(&dir, "a.bin");
        session.load_model(a.clone(), |_| {}).await.unwrap();
        backend.fail_loads.store(true, Ordering::SeqCst);

        let picked = dir.path().join("Download").join("a.bin");
        std::fs::create_dir_all(picked.parent().unwrap()).unwrap();
        std::fs::write(&picked, b"other weights").unwrap();
        let mut transitions = session.subscribe_transitions();

        let err = session
            .add_local_model(picked.to_str().unwrap(), |_| {})
            .await
            .unwrap_err();

        assert!(matches!(err, LlmError::Busy(_)));
        let path = a.local_path.clone().unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"weights");
        let state = session.snapshot();
        assert_eq!(state.operation, OperationStatus::Ready);
        assert_eq!(state.selected_model, Some(a));
        assert!(statuses(&mut transitions).is_empty());
    }

    #[tokio::test]
    async fn test_import_keeps_existing_installed_file() {
        let dir = tempdir().unwrap();
        let (backend, _steps) = ScriptedBackend::new();
        backend.fail_loads.store(true, Ordering::SeqCst);
        let session = session_with(&dir, backend, 2048);
        let installed = model_file(&dir, "b.bin");

        let picked = dir.path().join("b.bin");
        std::fs::write(&picked, b"other weights").unwrap();

        let err = session
            .add_local_model(picked.to_str().unwrap(), |_| {})
            .await
            .unwrap_err();

        assert!(matches!(err, LlmError::Other(_)));
        assert_eq!(std::fs::read(installed.local_path.unwrap()).unwrap(), b"weights");
        assert_eq!(session.snapshot(), SessionState::default());
    }

    // ------------------------------------------------------------------
    // Generation
    // ------------------------------------------------------------------

    #[tokio::test]
    async fn test_generate_without_model_is_rejected() {
        let dir = tempdir().unwrap();
        let (backend, _steps) = ScriptedBackend::new();
        let session = session_with(&dir, backend, 2048);

        let err = session
            .generate(PromptKind::Continue, vec![], |_| {}, 1)
            .await
            .unwrap_err();
        assert_eq!(err, LlmError::NoModelSelected);
        assert_eq!(session.snapshot(), SessionState::default());
    }

    #[tokio::test]
    async fn test_generate_streams_accumulated_text() {
        let dir = tempdir().unwrap();
        let (backend, steps) = ScriptedBackend::new();
        let session = session_with(&dir, backend, 2048);
        session.load_model(model_file(&dir, "a.bin"), |_| {}).await.unwrap();
        let mut transitions = session.subscribe_transitions();

        steps.send(chunk("Buy ")).unwrap();
        steps.send(chunk("milk")).unwrap();
        steps.send(last(".")).unwrap();

        let updates = Arc::new(Mutex::new(Vec::new()));
        let sink = updates.clone();
        let outcome = session
            .generate(
                PromptKind::Summarize,
                vec!["note".to_string()],
                move |text| sink.lock().unwrap().push(text.to_string()),
                3,
            )
            .await
            .unwrap();

        assert_eq!(outcome.text, "Buy milk.");
        assert!(!outcome.interrupted);
        assert_eq!(*updates.lock().unwrap(), vec!["Buy ", "Buy milk", "Buy milk."]);
        assert_eq!(
            statuses(&mut transitions),
            vec![OperationStatus::Responding { target: 3 }, OperationStatus::Ready]
        );
        assert!(!session.stop_requested());
    }

    #[tokio::test]
    async fn test_second_generate_is_busy() {
        let dir = tempdir().unwrap();
        let (backend, steps) = ScriptedBackend::new();
        let session = Arc::new(session_with(&dir, backend, 2048));
        session.load_model(model_file(&dir, "a.bin"), |_| {}).await.unwrap();
        let mut states = session.subscribe();

        let first = tokio::spawn({
            let session = session.clone();
            async move {
                session
                    .generate(PromptKind::Continue, vec!["a".to_string()], |_| {}, 1)
                    .await
            }
        });
        states
            .wait_for(|s| s.operation == OperationStatus::Responding { target: 1 })
            .await
            .unwrap();

        let err = session
            .generate(PromptKind::Continue, vec!["b".to_string()], |_| {}, 2)
            .await
            .unwrap_err();
        assert!(matches!(err, LlmError::Busy(_)));
        assert_eq!(session.snapshot().operation, OperationStatus::Responding { target: 1 });

        steps.send(last("done")).unwrap();
        assert_eq!(first.await.unwrap().unwrap().text, "done");
    }

    #[tokio::test]
    async fn test_interrupt_suppresses_remaining_chunks() {
        let dir = tempdir().unwrap();
        let (backend, steps) = ScriptedBackend::new();
        let session = Arc::new(session_with(&dir, backend, 2048));
        session.load_model(model_file(&dir, "a.bin"), |_| {}).await.unwrap();

        let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn({
            let session = session.clone();
            async move {
                session
                    .generate(
                        PromptKind::FillIn,
                        vec!["note".to_string()],
                        move |text| {
                            let _ = seen_tx.send(text.to_string());
                        },
                        7,
                    )
                    .await
            }
        });

        steps.send(chunk("one")).unwrap();
        assert_eq!(seen_rx.recv().await.as_deref(), Some("one"));

        session.interrupt(None);
        assert_eq!(session.snapshot().operation, OperationStatus::Ready);

        steps.send(chunk(" two")).unwrap();
        steps.send(last(" three")).unwrap();

        let outcome = task.await.unwrap().unwrap();
        assert_eq!(outcome.text, "one");
        assert!(outcome.interrupted);
        assert_eq!(seen_rx.recv().await, None);
        assert_eq!(session.snapshot().operation, OperationStatus::Ready);
        assert!(session.stop_requested());
    }

    #[tokio::test]
    async fn test_interrupt_is_idempotent() {
        let dir = tempdir().unwrap();
        let (backend, steps) = ScriptedBackend::new();
        let session = session_with(&dir, backend, 2048);
        session.load_model(model_file(&dir, "a.bin"), |_| {}).await.unwrap();
        let mut transitions = session.subscribe_transitions();
        let mut notices = session.subscribe_notices();

        session.interrupt(None);
        session.interrupt(None);
        session.interrupt(Some(LlmError::Generation("user gave up".to_string())));

        assert_eq!(session.snapshot().operation, OperationStatus::Ready);
        assert!(session.stop_requested());
        assert!(statuses(&mut transitions).is_empty());
        assert_eq!(notices.try_recv().unwrap().message, "Generation failed: user gave up");

        // The next generation starts with a cleared flag
        steps.send(last("ok")).unwrap();
        let outcome = session
            .generate(PromptKind::Rephrase, vec!["x".to_string()], |_| {}, 1)
            .await
            .unwrap();
        assert_eq!(outcome.text, "ok");
        assert!(!session.stop_requested());
    }

    #[tokio::test]
    async fn test_generation_failure_returns_to_ready() {
        let dir = tempdir().unwrap();
        let (backend, steps) = ScriptedBackend::new();
        let session = session_with(&dir, backend, 2048);
        session.load_model(model_file(&dir, "a.bin"), |_| {}).await.unwrap();
        let mut notices = session.subscribe_notices();

        steps.send(chunk("par")).unwrap();
        steps.send(Step::Fail("out of memory".to_string())).unwrap();

        let err = session
            .generate(PromptKind::Summarize, vec!["n".to_string()], |_| {}, 4)
            .await
            .unwrap_err();

        assert_eq!(err, LlmError::Generation("out of memory".to_string()));
        assert_eq!(session.snapshot().operation, OperationStatus::Ready);
        assert!(session.stop_requested());
        assert!(notices.try_recv().unwrap().message.contains("out of memory"));
    }

    // ------------------------------------------------------------------
    // Removal and unload
    // ------------------------------------------------------------------

    #[tokio::test]
    async fn test_removing_other_model_keeps_generation_running() {
        let dir = tempdir().unwrap();
        let (backend, steps) = ScriptedBackend::new();
        let session = Arc::new(session_with(&dir, backend, 2048));
        let a = model_file(&dir, "a.bin");
        let b = model_file(&dir, "b.bin");
        session.load_model(a.clone(), |_| {}).await.unwrap();
        let mut states = session.subscribe();

        let task = tokio::spawn({
            let session = session.clone();
            async move {
                session
                    .generate(PromptKind::Summarize, vec!["n".to_string()], |_| {}, 7)
                    .await
            }
        });
        states
            .wait_for(|s| s.operation == OperationStatus::Responding { target: 7 })
            .await
            .unwrap();

        let mut transitions = session.subscribe_transitions();
        session.remove_model(&b).await.unwrap();

        assert!(!b.local_path.as_ref().unwrap().exists());
        let state = session.snapshot();
        assert_eq!(state.selected_model, Some(a.clone()));
        assert_eq!(state.operation, OperationStatus::Responding { target: 7 });
        assert_eq!(
            statuses(&mut transitions),
            vec![OperationStatus::Removing, OperationStatus::Responding { target: 7 }]
        );

        steps.send(last("fine")).unwrap();
        assert!(!task.await.unwrap().unwrap().interrupted);
        assert_eq!(session.snapshot().operation, OperationStatus::Ready);
        assert!(a.local_path.unwrap().exists());
    }

    #[tokio::test]
    async fn test_removing_selected_model_goes_idle() {
        let dir = tempdir().unwrap();
        let (backend, _steps) = ScriptedBackend::new();
        let session = session_with(&dir, backend.clone(), 2048);
        let a = model_file(&dir, "a.bin");
        session.load_model(a.clone(), |_| {}).await.unwrap();

        // Stored copy carries a row id, the session's copy may not
        let stored = ModelDescriptor { id: 12, ..a.clone() };
        session.remove_model(&stored).await.unwrap();

        assert!(!a.local_path.unwrap().exists());
        assert_eq!(session.snapshot(), SessionState::default());
        assert!(backend.handles()[0].is_released());
    }

    #[tokio::test]
    async fn test_remove_is_idempotent() {
        let dir = tempdir().unwrap();
        let (backend, _steps) = ScriptedBackend::new();
        let session = session_with(&dir, backend, 2048);

        let ghost = ModelDescriptor::on_device("ghost.bin", dir.path().join("ghost.bin"));
        session.remove_model(&ghost).await.unwrap();
        session.remove_model(&ModelDescriptor::hosted("openai/gpt-4o")).await.unwrap();
        assert_eq!(session.snapshot().operation, OperationStatus::Idle);
    }

    #[tokio::test]
    async fn test_unload_releases_and_is_safe_when_idle() {
        let dir = tempdir().unwrap();
        let (backend, _steps) = ScriptedBackend::new();
        let session = session_with(&dir, backend.clone(), 2048);

        session.unload_model().await.unwrap();
        assert_eq!(session.snapshot(), SessionState::default());

        session.load_model(model_file(&dir, "a.bin"), |_| {}).await.unwrap();
        session.unload_model().await.unwrap();
        assert_eq!(session.snapshot(), SessionState::default());
        assert!(backend.handles()[0].is_released());
        session.unload_model().await.unwrap();
    }

    #[tokio::test]
    async fn test_unload_during_generation_discards_it() {
        let dir = tempdir().unwrap();
        let (backend, steps) = ScriptedBackend::new();
        let session = Arc::new(session_with(&dir, backend, 2048));
        session.load_model(model_file(&dir, "a.bin"), |_| {}).await.unwrap();
        let mut states = session.subscribe();

        let task = tokio::spawn({
            let session = session.clone();
            async move {
                session
                    .generate(PromptKind::Continue, vec!["n".to_string()], |_| {}, 2)
                    .await
            }
        });
        states
            .wait_for(|s| s.operation == OperationStatus::Responding { target: 2 })
            .await
            .unwrap();

        session.unload_model().await.unwrap();
        steps.send(last("late")).unwrap();

        let outcome = task.await.unwrap().unwrap();
        assert!(outcome.interrupted);
        assert_eq!(outcome.text, "");
        assert_eq!(session.snapshot(), SessionState::default());
    }
}
