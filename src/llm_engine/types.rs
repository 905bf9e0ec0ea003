//! Session data model

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::llm_engine::provider::{BackendKind, ModelSource};

/// Where a model's weights come from
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ModelOrigin {
    /// Imported file already on the device
    OnDevice,
    /// Fetched from the remote model source, then cached locally
    Downloadable,
    /// Served by a remote streaming API, no local artifact
    Hosted,
}

impl ModelOrigin {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelOrigin::OnDevice => "on_device",
            ModelOrigin::Downloadable => "downloadable",
            ModelOrigin::Hosted => "hosted",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "on_device" => Some(ModelOrigin::OnDevice),
            "downloadable" => Some(ModelOrigin::Downloadable),
            "hosted" => Some(ModelOrigin::Hosted),
            _ => None,
        }
    }

    pub fn backend(&self) -> BackendKind {
        match self {
            ModelOrigin::OnDevice | ModelOrigin::Downloadable => BackendKind::Local,
            ModelOrigin::Hosted => BackendKind::Hosted,
        }
    }
}

/// Identifies a model known to the app
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModelDescriptor {
    /// Store row id, -1 until persisted
    pub id: i64,
    pub origin: ModelOrigin,
    /// Artifact name (downloadable), file name (on-device) or API slug (hosted)
    pub name: String,
    pub display_name: String,
    /// Absent until the bytes exist locally
    pub local_path: Option<PathBuf>,
    pub is_chosen: bool,
}

impl ModelDescriptor {
    pub const UNSAVED_ID: i64 = -1;

    pub fn on_device(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        let name = name.into();
        Self {
            id: Self::UNSAVED_ID,
            origin: ModelOrigin::OnDevice,
            display_name: name.clone(),
            name,
            local_path: Some(path.into()),
            is_chosen: false,
        }
    }

    pub fn downloadable(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            id: Self::UNSAVED_ID,
            origin: ModelOrigin::Downloadable,
            display_name: name.clone(),
            name,
            local_path: None,
            is_chosen: false,
        }
    }

    pub fn hosted(model: impl Into<String>) -> Self {
        let name = model.into();
        Self {
            id: Self::UNSAVED_ID,
            origin: ModelOrigin::Hosted,
            display_name: name.clone(),
            name,
            local_path: None,
            is_chosen: false,
        }
    }

    pub fn with_display_name(mut self, display_name: impl Into<String>) -> Self {
        self.display_name = display_name.into();
        self
    }

    /// Two descriptors refer to the same model.
    ///
    /// Unsaved descriptors carry no row id, so identity falls back to
    /// origin and name.
    pub fn same_model(&self, other: &ModelDescriptor) -> bool {
        if self.id != Self::UNSAVED_ID && other.id != Self::UNSAVED_ID {
            return self.id == other.id;
        }
        self.origin == other.origin && self.name == other.name
    }

    /// Source to hand to the backend, None when the bytes are not local yet
    pub fn source(&self) -> Option<ModelSource> {
        match self.origin {
            ModelOrigin::Hosted => Some(ModelSource::Hosted {
                model: self.name.clone(),
            }),
            ModelOrigin::OnDevice | ModelOrigin::Downloadable => {
                self.local_path.clone().map(ModelSource::File)
            }
        }
    }
}

/// Opaque identifier of the UI slot receiving tokens
pub type TargetId = i64;

/// Identifies the live handle in published snapshots
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct HandleId(pub u64);

/// What the session is doing right now
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum OperationStatus {
    Idle,
    Loading,
    Activating,
    Downloading { progress: f32 },
    Ready,
    Removing,
    Responding { target: TargetId },
}

impl OperationStatus {
    /// Idle and Ready are the only states a session may settle in
    pub fn is_stable(&self) -> bool {
        match self {
            OperationStatus::Idle | OperationStatus::Ready => true,
            OperationStatus::Loading
            | OperationStatus::Activating
            | OperationStatus::Downloading { .. }
            | OperationStatus::Removing
            | OperationStatus::Responding { .. } => false,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            OperationStatus::Idle => "idle",
            OperationStatus::Loading => "loading",
            OperationStatus::Activating => "activating",
            OperationStatus::Downloading { .. } => "downloading",
            OperationStatus::Ready => "ready",
            OperationStatus::Removing => "removing",
            OperationStatus::Responding { .. } => "responding",
        }
    }
}

/// Immutable snapshot published to observers
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionState {
    pub selected_model: Option<ModelDescriptor>,
    pub handle: Option<HandleId>,
    pub operation: OperationStatus,
}

impl Default for SessionState {
    fn default() -> Self {
        Self {
            selected_model: None,
            handle: None,
            operation: OperationStatus::Idle,
        }
    }
}

/// Transient user-visible message
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionNotice {
    pub message: String,
}

/// Result of a finished `generate` call
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GenerationOutcome {
    /// Text delivered to the caller
    pub text: String,
    /// Stopped by `interrupt` before the stream finished
    pub interrupted: bool,
}
