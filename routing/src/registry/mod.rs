//! Model registry: the persistent catalog of model backends.
//!
//! Reads are served from an in-memory catalog so that routing never touches
//! storage. Mutations are serialized, validated against the catalog
//! invariants, written through to the [`ConfigStore`] and only then applied
//! in memory. A storage failure leaves the catalog untouched. Deletion is the
//! exception: the model leaves the catalog before the store call, atomically
//! with the lease check, and is put back if the store refuses.
//!
//! Invariants enforced here:
//! - ids are unique and immutable
//! - at most one `is_default` model per role
//! - default models cannot be deleted, and cannot be disabled or
//!   un-defaulted without `admin_override`
//! - models referenced by a live [`SelectionLease`] cannot be deleted

mod lease;
mod types;

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use chrono::Utc;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::{RoutingError, RoutingResult};
use crate::events::{CreateSource, RoutingEvent, SharedEventBus};
use crate::store::{SharedConfigStore, StoreError};

pub use lease::{InFlightLeases, SelectionLease};
pub use types::{ModelConfig, ModelFilter, ModelPatch, NewModel, SortKey, DEFAULT_ROLE};

/// Shared reference to ModelRegistry
pub type SharedModelRegistry = Arc<ModelRegistry>;

pub struct ModelRegistry {
    models: RwLock<HashMap<String, ModelConfig>>,
    store: SharedConfigStore,
    events: Option<SharedEventBus>,
    leases: Arc<InFlightLeases>,
    mutation_lock: Mutex<()>,
}

fn from_store(err: StoreError) -> RoutingError {
    match err {
        StoreError::VersionConflict { id, .. } => RoutingError::conflict(format!(
            "model '{id}' was modified concurrently; reload and retry"
        )),
        other => RoutingError::Storage(other),
    }
}

impl ModelRegistry {
    /// Hydrate the catalog from `store`.
    pub async fn load(
        store: SharedConfigStore,
        events: Option<SharedEventBus>,
    ) -> RoutingResult<Self> {
        let configs = store.load_all().await?;
        info!(count = configs.len(), "Model registry loaded");
        let models = configs.into_iter().map(|c| (c.id.clone(), c)).collect();
        Ok(Self {
            models: RwLock::new(models),
            store,
            events,
            leases: Arc::new(InFlightLeases::new()),
            mutation_lock: Mutex::new(()),
        })
    }

    pub fn shared(self) -> SharedModelRegistry {
        Arc::new(self)
    }

    pub fn leases(&self) -> &Arc<InFlightLeases> {
        &self.leases
    }

    pub fn get(&self, id: &str) -> RoutingResult<ModelConfig> {
        self.read()
            .get(id)
            .cloned()
            .ok_or_else(|| RoutingError::not_found(format!("model '{id}'")))
    }

    /// Lease `id` if it is still catalogued. Taken under the catalog lock so
    /// it cannot interleave with the removal step of [`Self::delete`].
    pub fn lease(&self, id: &str) -> Option<SelectionLease> {
        let models = self.read();
        models.contains_key(id).then(|| self.leases.acquire(id))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.read().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Models matching `filter`, ordered by display name unless the filter
    /// names another sort key.
    pub fn list(&self, filter: &ModelFilter) -> Vec<ModelConfig> {
        let mut models: Vec<ModelConfig> = self
            .read()
            .values()
            .filter(|m| filter.matches(m))
            .cloned()
            .collect();
        types::sort_models(&mut models, filter.sort.unwrap_or_default());
        models
    }

    /// The default model for `role`, if one is registered.
    pub fn default_for(&self, role: &str) -> Option<ModelConfig> {
        self.read()
            .values()
            .find(|m| m.is_default && m.role == role)
            .cloned()
    }

    pub async fn create(&self, new: NewModel) -> RoutingResult<ModelConfig> {
        self.create_from(new, CreateSource::Direct).await
    }

    pub(crate) async fn create_from(
        &self,
        new: NewModel,
        source: CreateSource,
    ) -> RoutingResult<ModelConfig> {
        let _guard = self.mutation_lock.lock().await;
        let config = new.into_config(Utc::now());
        config.validate()?;

        {
            let models = self.read();
            if models.contains_key(&config.id) {
                return Err(RoutingError::conflict(format!(
                    "model '{}' already exists",
                    config.id
                )));
            }
            if config.is_default {
                Self::ensure_no_other_default(&models, &config.role, &config.id)?;
            }
        }

        self.store.save(&config, None).await.map_err(from_store)?;
        self.write().insert(config.id.clone(), config.clone());
        info!(model_id = %config.id, provider = %config.provider, "Model registered");
        self.publish(RoutingEvent::ModelCreated {
            model_id: config.id.clone(),
            source,
            timestamp: config.created_at,
        });
        Ok(config)
    }

    pub async fn update(&self, id: &str, patch: ModelPatch) -> RoutingResult<ModelConfig> {
        let _guard = self.mutation_lock.lock().await;
        let current = self.get(id)?;

        if let Some(expected) = patch.expected_version {
            if expected != current.version {
                return Err(RoutingError::conflict(format!(
                    "model '{id}' is at version {}, patch expected {expected}",
                    current.version
                )));
            }
        }
        if patch.weakens_default(&current) && !patch.admin_override {
            return Err(RoutingError::protected(format!(
                "model '{id}' is the default for role '{}'; disabling or un-defaulting it requires admin_override",
                current.role
            )));
        }

        let admin_override = patch.admin_override;
        let next = patch.apply(&current, Utc::now());
        next.validate()?;
        if next.is_default && (!current.is_default || next.role != current.role) {
            Self::ensure_no_other_default(&self.read(), &next.role, id)?;
        }

        self.store
            .save(&next, Some(current.version))
            .await
            .map_err(from_store)?;
        self.write().insert(next.id.clone(), next.clone());
        debug!(model_id = %id, version = next.version, "Model updated");
        self.publish(RoutingEvent::ModelUpdated {
            model_id: id.to_string(),
            version: next.version,
            admin_override,
            timestamp: next.updated_at,
        });
        Ok(next)
    }

    /// Remove a model. Defaults and models with in-flight leases are refused.
    pub async fn delete(&self, id: &str) -> RoutingResult<ModelConfig> {
        let _guard = self.mutation_lock.lock().await;
        let current = self.get(id)?;

        if current.is_default {
            return Err(RoutingError::protected(format!(
                "model '{id}' is the default for role '{}' and cannot be deleted",
                current.role
            )));
        }
        {
            let mut models = self.write();
            let in_flight = self.leases.count(id);
            if in_flight > 0 {
                return Err(RoutingError::protected(format!(
                    "model '{id}' is referenced by {in_flight} in-flight routing decision(s)"
                )));
            }
            models.remove(id);
        }

        if let Err(err) = self.store.delete(id).await {
            self.write().insert(id.to_string(), current.clone());
            return Err(from_store(err));
        }
        info!(model_id = %id, "Model deleted");
        self.publish(RoutingEvent::ModelDeleted {
            model_id: id.to_string(),
            timestamp: Utc::now(),
        });
        Ok(current)
    }

    fn ensure_no_other_default(
        models: &HashMap<String, ModelConfig>,
        role: &str,
        id: &str,
    ) -> RoutingResult<()> {
        if let Some(existing) = models
            .values()
            .find(|m| m.is_default && m.role == role && m.id != id)
        {
            return Err(RoutingError::conflict(format!(
                "role '{role}' already has default model '{}'",
                existing.id
            )));
        }
        Ok(())
    }

    fn publish(&self, event: RoutingEvent) {
        if let Some(bus) = &self.events {
            bus.publish(event);
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, ModelConfig>> {
        self.models.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, ModelConfig>> {
        self.models.write().unwrap_or_else(PoisonError::into_inner)
    }
}
