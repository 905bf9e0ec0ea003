//! Sidecar LLM backend
//!
//! Runs on-device inference in a separate process. Communicates via
//! JSON-RPC over stdin/stdout, one request per line.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

#[cfg(target_os = "windows")]
use std::os::windows::process::CommandExt;

/// Windows flag to prevent console window from appearing
#[cfg(target_os = "windows")]
const CREATE_NO_WINDOW: u32 = 0x08000000;

const SHUTDOWN_GRACE: std::time::Duration = std::time::Duration::from_secs(2);

use crate::config::SidecarConfig;
use crate::llm_engine::provider::{
    ChunkCallback, GenerationOptions, InferenceHandle, LlmError, ModelBackend, ModelSource,
    TokenChunk,
};

// ============================================================================
// JSON-RPC Types (matching sidecar)
// ============================================================================

#[derive(Debug, Serialize)]
struct JsonRpcRequest {
    jsonrpc: String,
    id: u64,
    method: String,
    params: serde_json::Value,
}

impl JsonRpcRequest {
    fn new(id: u64, method: &str, params: serde_json::Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            method: method.to_string(),
            params,
        }
    }
}

#[derive(Debug, Deserialize)]
struct JsonRpcResponse {
    result: Option<serde_json::Value>,
    error: Option<JsonRpcError>,
}

#[derive(Debug, Deserialize)]
struct JsonRpcError {
    message: String,
}

// ============================================================================
// Sidecar Process
// ============================================================================

struct SidecarProcess {
    child: Child,
    stdin: tokio::process::ChildStdin,
    stdout: BufReader<tokio::process::ChildStdout>,
    request_id: u64,
}

impl SidecarProcess {
    async fn spawn(sidecar_path: &Path) -> Result<Self, LlmError> {
        log::info!("Starting LLM sidecar: {}", sidecar_path.display());

        let mut cmd = Command::new(sidecar_path);
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit()) // Let sidecar logs go to our stderr
            .kill_on_drop(true);

        // Hide console window on Windows
        #[cfg(target_os = "windows")]
        cmd.creation_flags(CREATE_NO_WINDOW);

        let mut child = cmd
            .spawn()
            .map_err(|e| LlmError::ProviderUnavailable(format!("Failed to start sidecar: {}", e)))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| LlmError::ProviderUnavailable("Failed to get sidecar stdin".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| LlmError::ProviderUnavailable("Failed to get sidecar stdout".to_string()))?;

        Ok(Self {
            child,
            stdin,
            stdout: BufReader::new(stdout),
            request_id: 0,
        })
    }

    async fn write_request(&mut self, method: &str, params: serde_json::Value) -> Result<(), LlmError> {
        self.request_id += 1;
        let request = JsonRpcRequest::new(self.request_id, method, params);

        let mut request_json = serde_json::to_string(&request)
            .map_err(|e| LlmError::RequestFailed(format!("Failed to serialize request: {}", e)))?;
        request_json.push('\n');

        self.stdin
            .write_all(request_json.as_bytes())
            .await
            .map_err(|e| LlmError::RequestFailed(format!("Failed to write to sidecar: {}", e)))?;
        self.stdin
            .flush()
            .await
            .map_err(|e| LlmError::RequestFailed(format!("Failed to flush: {}", e)))
    }

    async fn read_response(&mut self) -> Result<serde_json::Value, LlmError> {
        let mut line = String::new();
        let read = self
            .stdout
            .read_line(&mut line)
            .await
            .map_err(|e| LlmError::RequestFailed(format!("Failed to read from sidecar: {}", e)))?;
        if read == 0 {
            return Err(LlmError::ProviderUnavailable("Sidecar closed its output".to_string()));
        }

        let response: JsonRpcResponse = serde_json::from_str(&line)
            .map_err(|e| LlmError::RequestFailed(format!("Failed to parse response: {}", e)))?;

        if let Some(error) = response.error {
            return Err(LlmError::RequestFailed(error.message));
        }

        response
            .result
            .ok_or_else(|| LlmError::RequestFailed("Empty response".to_string()))
    }

    async fn send_request(&mut self, method: &str, params: serde_json::Value) -> Result<serde_json::Value, LlmError> {
        self.write_request(method, params).await?;
        self.read_response().await
    }

    /// Stream `{token, done}` results until `done` or cancellation
    async fn send_streaming_request(
        &mut self,
        method: &str,
        params: serde_json::Value,
        on_chunk: &ChunkCallback,
        cancel: &CancellationToken,
    ) -> Result<(), LlmError> {
        self.write_request(method, params).await?;

        loop {
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(LlmError::Cancelled),
                result = self.read_response() => result?,
            };

            let token = result.get("token").and_then(|t| t.as_str()).unwrap_or("");
            let done = result.get("done").and_then(|d| d.as_bool()).unwrap_or(false);
            perf_trace!("Sidecar token ({} bytes, done={})", token.len(), done);

            on_chunk(TokenChunk {
                text: token.to_string(),
                is_final: done,
            });

            if done {
                return Ok(());
            }
        }
    }

    /// Ask the sidecar to exit, then make sure it does
    async fn shutdown(mut self) {
        let polite = self.send_request("shutdown", serde_json::json!({}));
        if tokio::time::timeout(SHUTDOWN_GRACE, polite).await.is_err() {
            log::warn!("Sidecar did not answer shutdown, killing it");
        }
        let _ = self.child.kill().await;
    }

    /// Kill this sidecar process (used for cancellation)
    fn kill(&mut self) {
        let _ = self.child.start_kill();
    }
}

// ============================================================================
// Backend
// ============================================================================

/// Creates handles backed by a sidecar process each
pub struct SidecarBackend {
    config: SidecarConfig,
}

impl SidecarBackend {
    pub fn new(config: SidecarConfig) -> Self {
        Self { config }
    }

    /// Find the sidecar binary path
    fn find_sidecar_path(&self) -> Result<PathBuf, LlmError> {
        // Check configured path first
        if let Some(ref path) = self.config.sidecar_path {
            if path.exists() {
                return Ok(path.clone());
            }
            log::warn!("Configured sidecar path {} does not exist", path.display());
        }

        let sidecar_name = if cfg!(windows) {
            format!("{}.exe", self.config.binary_name)
        } else {
            self.config.binary_name.clone()
        };

        // Check relative to executable
        if let Ok(exe_path) = std::env::current_exe() {
            let exe_dir = exe_path.parent().unwrap_or(Path::new("."));

            // 1. Same directory as the executable
            let path = exe_dir.join(&sidecar_name);
            if path.exists() {
                log::debug!("Found sidecar in exe dir: {}", path.display());
                return Ok(path);
            }

            // 2. Parent directories (dev builds run from target/debug)
            let mut current = exe_dir;
            for _ in 0..3 {
                if let Some(parent) = current.parent() {
                    for profile in &["debug", "release"] {
                        let path = parent.join("target").join(profile).join(&sidecar_name);
                        if path.exists() {
                            log::debug!("Found sidecar at: {}", path.display());
                            return Ok(path);
                        }
                    }
                    current = parent;
                }
            }
        }

        Err(LlmError::ProviderUnavailable(format!(
            "LLM sidecar binary '{}' not found",
            sidecar_name
        )))
    }
}

#[async_trait]
impl ModelBackend for SidecarBackend {
    fn backend_name(&self) -> &'static str {
        "sidecar"
    }

    async fn create_handle(
        &self,
        source: &ModelSource,
        options: &GenerationOptions,
    ) -> Result<Arc<dyn InferenceHandle>, LlmError> {
        let model_path = match source {
            ModelSource::File(path) => path.clone(),
            ModelSource::Hosted { model } => {
                return Err(LlmError::BackendLoad(format!(
                    "'{}' is a hosted model, not a local file",
                    model
                )))
            }
        };

        if !model_path.is_file() {
            return Err(LlmError::BackendLoad(format!(
                "Model file not found: {}",
                model_path.display()
            )));
        }

        let handle = SidecarHandle {
            sidecar_path: self.find_sidecar_path()?,
            model_path,
            options: options.clone(),
            process: Mutex::new(None),
            released: AtomicBool::new(false),
        };

        // Load eagerly so a bad file fails the load, not the first prompt
        {
            let mut guard = handle.process.lock().await;
            *guard = Some(handle.start_and_initialize().await?);
        }

        log::info!("Model {} loaded in sidecar", handle.model_path.display());
        Ok(Arc::new(handle))
    }
}

/// One loaded model living in one sidecar process
struct SidecarHandle {
    sidecar_path: PathBuf,
    model_path: PathBuf,
    options: GenerationOptions,
    process: Mutex<Option<SidecarProcess>>,
    released: AtomicBool,
}

impl SidecarHandle {
    async fn start_and_initialize(&self) -> Result<SidecarProcess, LlmError> {
        let mut process = SidecarProcess::spawn(&self.sidecar_path).await?;

        let params = serde_json::json!({
            "model_path": self.model_path.to_string_lossy(),
            "max_tokens": self.options.max_tokens,
            "top_k": self.options.top_k,
            "temperature": self.options.temperature,
            "seed": self.options.seed,
        });

        let result = match process.send_request("initialize", params).await {
            Ok(result) => result,
            Err(e) => {
                process.kill();
                return Err(LlmError::BackendLoad(e.to_string()));
            }
        };

        if result.get("success").and_then(|s| s.as_bool()).unwrap_or(false) {
            Ok(process)
        } else {
            process.kill();
            let reason = result
                .get("error")
                .and_then(|e| e.as_str())
                .unwrap_or("sidecar failed to load model");
            Err(LlmError::BackendLoad(reason.to_string()))
        }
    }
}

#[async_trait]
impl InferenceHandle for SidecarHandle {
    async fn generate(
        &self,
        prompt: &str,
        on_chunk: ChunkCallback,
        cancel: CancellationToken,
    ) -> Result<(), LlmError> {
        if self.is_released() {
            return Err(LlmError::Generation("Model handle was released".to_string()));
        }

        let mut guard = self.process.lock().await;

        // A cancelled generation leaves no process behind; bring it back
        if guard.is_none() {
            *guard = Some(
                self.start_and_initialize()
                    .await
                    .map_err(|e| LlmError::Generation(e.to_string()))?,
            );
        }
        let process = guard
            .as_mut()
            .ok_or_else(|| LlmError::Generation("Sidecar not running".to_string()))?;

        let params = serde_json::json!({
            "prompt": prompt,
            "max_tokens": self.options.max_tokens,
            "stream": true,
        });

        let result = process
            .send_streaming_request("complete", params, &on_chunk, &cancel)
            .await;

        match result {
            Ok(()) => Ok(()),
            Err(LlmError::Cancelled) => {
                // Generation can't be stopped cleanly mid-stream
                log::info!("Streaming cancelled, stopping sidecar");
                if let Some(mut process) = guard.take() {
                    process.kill();
                }
                Err(LlmError::Cancelled)
            }
            Err(e) => {
                if let Some(mut process) = guard.take() {
                    process.kill();
                }
                Err(LlmError::Generation(e.to_string()))
            }
        }
    }

    async fn release(&self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        let process = self.process.lock().await.take();
        if let Some(process) = process {
            process.shutdown().await;
        }
        log::info!("Released sidecar handle for {}", self.model_path.display());
    }

    fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }
}
