// Model metadata rows

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::llm_engine::{ModelDescriptor, ModelOrigin};

/// A row of the `model` table
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelRow {
    pub id: i64,
    /// Column value of `ModelOrigin` ("on_device", "downloadable", "hosted")
    pub origin: String,
    pub name: String,
    pub display_name: String,
    pub local_path: Option<String>,
    pub is_chosen: bool,
    pub created_at: String,
    pub updated_at: String,
}

impl ModelRow {
    /// Convert to a descriptor, None when the origin column is not recognised
    pub fn to_descriptor(&self) -> Option<ModelDescriptor> {
        let origin = ModelOrigin::parse(&self.origin)?;
        Some(ModelDescriptor {
            id: self.id,
            origin,
            name: self.name.clone(),
            display_name: self.display_name.clone(),
            local_path: self.local_path.as_ref().map(PathBuf::from),
            is_chosen: self.is_chosen,
        })
    }
}
