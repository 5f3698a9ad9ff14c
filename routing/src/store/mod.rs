//! Persistence boundary for model configurations.
//!
//! The registry treats the backing document store as a plain keyed store:
//! load everything at startup, write one config at a time, delete by id.
//! Writes carry the version the caller last saw so that two processes sharing
//! one store cannot silently overwrite each other.

mod file;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::registry::ModelConfig;

pub use file::JsonFileConfigStore;

/// Error type for persistence operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Version conflict for '{id}': expected {expected:?}, found {found:?}")]
    VersionConflict {
        id: String,
        expected: Option<u64>,
        found: Option<u64>,
    },
}

/// Result type for persistence operations
pub type StoreResult<T> = Result<T, StoreError>;

/// Shared reference to a config store
pub type SharedConfigStore = Arc<dyn ConfigStore>;

#[async_trait]
pub trait ConfigStore: Send + Sync {
    async fn load_all(&self) -> StoreResult<Vec<ModelConfig>>;

    /// Persist `config`. `expected_version` is the version currently stored
    /// (`None` when creating); a mismatch yields [`StoreError::VersionConflict`].
    async fn save(&self, config: &ModelConfig, expected_version: Option<u64>) -> StoreResult<()>;

    async fn delete(&self, id: &str) -> StoreResult<()>;
}

pub(crate) fn check_version(
    id: &str,
    stored: Option<&ModelConfig>,
    expected_version: Option<u64>,
) -> StoreResult<()> {
    let found = stored.map(|c| c.version);
    if found != expected_version {
        return Err(StoreError::VersionConflict {
            id: id.to_string(),
            expected: expected_version,
            found,
        });
    }
    Ok(())
}

/// Volatile store for tests and single-process deployments without a
/// document database.
#[derive(Default)]
pub struct MemoryConfigStore {
    docs: RwLock<HashMap<String, ModelConfig>>,
}

impl MemoryConfigStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared(self) -> SharedConfigStore {
        Arc::new(self)
    }

    pub fn with_configs(configs: impl IntoIterator<Item = ModelConfig>) -> Self {
        let docs = configs.into_iter().map(|c| (c.id.clone(), c)).collect();
        Self {
            docs: RwLock::new(docs),
        }
    }
}

#[async_trait]
impl ConfigStore for MemoryConfigStore {
    async fn load_all(&self) -> StoreResult<Vec<ModelConfig>> {
        Ok(self.docs.read().await.values().cloned().collect())
    }

    async fn save(&self, config: &ModelConfig, expected_version: Option<u64>) -> StoreResult<()> {
        let mut docs = self.docs.write().await;
        check_version(&config.id, docs.get(&config.id), expected_version)?;
        docs.insert(config.id.clone(), config.clone());
        Ok(())
    }

    async fn delete(&self, id: &str) -> StoreResult<()> {
        self.docs.write().await.remove(id);
        Ok(())
    }
}
