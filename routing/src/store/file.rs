//! JSON document store backed by a single file.
//!
//! The whole collection is rewritten on each mutation through a temp file and
//! an atomic rename, so a crash never leaves a half-written document.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::debug;

use super::{check_version, ConfigStore, StoreError, StoreResult};
use crate::registry::ModelConfig;

pub struct JsonFileConfigStore {
    path: PathBuf,
    // Serializes read-modify-write cycles within this process.
    write_lock: Mutex<()>,
}

impl JsonFileConfigStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn shared(self) -> super::SharedConfigStore {
        std::sync::Arc::new(self)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read_docs(&self) -> StoreResult<BTreeMap<String, ModelConfig>> {
        if !tokio::fs::try_exists(&self.path).await? {
            return Ok(BTreeMap::new());
        }
        let json = tokio::fs::read_to_string(&self.path).await?;
        if json.trim().is_empty() {
            return Ok(BTreeMap::new());
        }
        serde_json::from_str(&json).map_err(|e| StoreError::Deserialization(e.to_string()))
    }

    async fn write_docs(&self, docs: &BTreeMap<String, ModelConfig>) -> StoreResult<()> {
        let json = serde_json::to_string_pretty(docs)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        debug!(path = %self.path.display(), docs = docs.len(), "Model store written");
        Ok(())
    }
}

#[async_trait]
impl ConfigStore for JsonFileConfigStore {
    async fn load_all(&self) -> StoreResult<Vec<ModelConfig>> {
        Ok(self.read_docs().await?.into_values().collect())
    }

    async fn save(&self, config: &ModelConfig, expected_version: Option<u64>) -> StoreResult<()> {
        let _guard = self.write_lock.lock().await;
        // Re-read so a writer in another process is detected by version.
        let mut docs = self.read_docs().await?;
        check_version(&config.id, docs.get(&config.id), expected_version)?;
        docs.insert(config.id.clone(), config.clone());
        self.write_docs(&docs).await
    }

    async fn delete(&self, id: &str) -> StoreResult<()> {
        let _guard = self.write_lock.lock().await;
        let mut docs = self.read_docs().await?;
        if docs.remove(id).is_some() {
            self.write_docs(&docs).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::NewModel;
    use chrono::Utc;

    fn config(id: &str) -> ModelConfig {
        NewModel {
            id: id.into(),
            provider: "local".into(),
            model_name: id.into(),
            display_name: id.into(),
            quality_score: 0.5,
            ..NewModel::default()
        }
        .into_config(Utc::now())
    }

    #[tokio::test]
    async fn test_missing_file_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileConfigStore::new(dir.path().join("models.json"));
        assert!(store.load_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_file_store_persists_across_instances() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("models.json");

        let store = JsonFileConfigStore::new(&path);
        store.save(&config("a"), None).await.unwrap();
        store.save(&config("b"), None).await.unwrap();
        store.delete("a").await.unwrap();

        let reopened = JsonFileConfigStore::new(&path);
        let all = reopened.load_all().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].id, "b");
    }

    #[tokio::test]
    async fn test_file_store_detects_concurrent_writer() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("models.json");
        let first = JsonFileConfigStore::new(&path);
        let second = JsonFileConfigStore::new(&path);

        let mut c = config("a");
        first.save(&c, None).await.unwrap();

        c.version = 2;
        first.save(&c, Some(1)).await.unwrap();
        // The second instance still believes version 1 is current.
        let err = second.save(&c, Some(1)).await.unwrap_err();
        assert!(matches!(err, StoreError::VersionConflict { .. }));
    }
}
