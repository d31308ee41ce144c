//! Read-only table of loaded model variants.
//!
//! Built once during startup and handed to the router as state. There is no
//! way to add, replace or evict an entry afterwards.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::{error, info};

use crate::backend::{BackendError, LoadConfig, ModelLoader, Tokenizer, VisionModel};

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("model key '{0}' is configured more than once")]
    DuplicateKey(String),

    #[error("failed to load model '{model_id}' for '{key}': {source}")]
    Load {
        key: String,
        model_id: String,
        #[source]
        source: BackendError,
    },
}

/// Which backend model serves a variant key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelSpec {
    pub key: String,
    pub model_id: String,
}

impl ModelSpec {
    pub fn new(key: impl Into<String>, model_id: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            model_id: model_id.into(),
        }
    }
}

pub struct ModelEntry {
    pub key: String,
    pub model_id: String,
    pub model: Arc<dyn VisionModel>,
    pub tokenizer: Arc<dyn Tokenizer>,
    pub loaded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ModelSummary {
    pub key: String,
    pub model_id: String,
    pub loaded_at: DateTime<Utc>,
}

pub struct ModelRegistry {
    entries: HashMap<String, Arc<ModelEntry>>,
}

impl ModelRegistry {
    /// Load every spec in order. The first failure aborts the whole load.
    pub async fn load(
        loader: &dyn ModelLoader,
        specs: &[ModelSpec],
        config: &LoadConfig,
    ) -> Result<Self, RegistryError> {
        let mut entries = HashMap::with_capacity(specs.len());

        for spec in specs {
            if entries.contains_key(&spec.key) {
                return Err(RegistryError::DuplicateKey(spec.key.clone()));
            }

            info!(key = %spec.key, model = %spec.model_id, "loading model");
            let loaded = loader
                .load(&spec.model_id, config)
                .await
                .map_err(|source| {
                    error!(key = %spec.key, model = %spec.model_id, "failed to load model: {}", source);
                    RegistryError::Load {
                        key: spec.key.clone(),
                        model_id: spec.model_id.clone(),
                        source,
                    }
                })?;

            entries.insert(
                spec.key.clone(),
                Arc::new(ModelEntry {
                    key: spec.key.clone(),
                    model_id: spec.model_id.clone(),
                    model: loaded.model,
                    tokenizer: loaded.tokenizer,
                    loaded_at: Utc::now(),
                }),
            );
        }

        info!(count = entries.len(), "models loaded");
        Ok(Self { entries })
    }

    pub fn get(&self, key: &str) -> Option<Arc<ModelEntry>> {
        self.entries.get(key).cloned()
    }

    pub fn keys(&self) -> Vec<&str> {
        let mut keys: Vec<&str> = self.entries.keys().map(String::as_str).collect();
        keys.sort_unstable();
        keys
    }

    pub fn summaries(&self) -> Vec<ModelSummary> {
        self.keys()
            .into_iter()
            .filter_map(|key| self.entries.get(key))
            .map(|entry| ModelSummary {
                key: entry.key.clone(),
                model_id: entry.model_id.clone(),
                loaded_at: entry.loaded_at,
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}
