//! Routing service facade.
//!
//! Wires registry, breakers, tracker, balancer, recommender and template
//! catalog together and owns the provider call path. Mutations keep the
//! derived state in step: create and update drop cached snapshots, delete
//! also drops the model's breaker.
//!
//! # Provider calls
//!
//! A call runs in its own task under the caller's timeout. The task reports
//! the outcome to the breaker and the usage sink exactly once and only then
//! releases the selection lease, so a caller that gives up early neither
//! cancels the call nor loses its outcome.

use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::RoutingConfig;
use crate::error::{RoutingError, RoutingResult};
use crate::events::{EventBus, SharedEventBus};
use crate::provider::{AdapterSet, ProviderRequest, ProviderResponse};
use crate::registry::{
    ModelConfig, ModelFilter, ModelPatch, ModelRegistry, NewModel, SharedModelRegistry,
};
use crate::router::{
    Admission, CandidateFilter, CircuitBreaker, CircuitState, CircuitStatus, LoadBalancer,
    RecommendationEngine, RecommendationRequest, RecommendationResult, Selection,
    SharedCircuitBreaker,
};
use crate::store::SharedConfigStore;
use crate::templates::{Template, TemplateCatalog, TemplateOverrides};
use crate::tracker::{
    PerformanceSnapshot, PerformanceTracker, SharedPerformanceTracker, UsageRecord, UsageSink,
    Window,
};

/// Shared reference to RoutingService
pub type SharedRoutingService = Arc<RoutingService>;

/// Result of a routed provider call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Execution {
    pub model_id: String,
    pub content: String,
    pub tokens: u64,
    pub cost: f64,
    pub latency_ms: u64,
    /// The call was the breaker's half-open trial.
    pub trial: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionTest {
    pub model_id: String,
    pub success: bool,
    pub latency_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Breaker status after the outcome was recorded.
    pub circuit: CircuitStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitHealth {
    pub model_id: String,
    #[serde(flatten)]
    pub state: CircuitState,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    /// "ok", or "degraded" while any circuit is not closed.
    pub status: String,
    pub models: usize,
    pub enabled_models: usize,
    pub open_circuits: usize,
    pub usage_dropped: u64,
    pub circuits: Vec<CircuitHealth>,
}

pub struct RoutingService {
    registry: SharedModelRegistry,
    breakers: SharedCircuitBreaker,
    tracker: SharedPerformanceTracker,
    usage: UsageSink,
    balancer: Arc<LoadBalancer>,
    recommender: RecommendationEngine,
    templates: RwLock<Arc<TemplateCatalog>>,
    adapters: AdapterSet,
    events: SharedEventBus,
    ingest: JoinHandle<()>,
}

impl RoutingService {
    /// Hydrate the registry from `store` and start the usage ingest task.
    pub async fn start(
        config: RoutingConfig,
        store: SharedConfigStore,
        adapters: AdapterSet,
        templates: TemplateCatalog,
    ) -> RoutingResult<Self> {
        let events = EventBus::new().shared();
        let registry = ModelRegistry::load(store, Some(Arc::clone(&events)))
            .await?
            .shared();
        let breakers = CircuitBreaker::new(config.breaker.clone())
            .with_events(Arc::clone(&events))
            .shared();
        let tracker = PerformanceTracker::new(config.tracker.clone()).shared();
        let (usage, ingest) = UsageSink::spawn(Arc::clone(&tracker), config.tracker.buffer_capacity);
        let balancer = Arc::new(LoadBalancer::new(
            Arc::clone(&registry),
            Arc::clone(&breakers),
            Arc::clone(&tracker),
            config.scoring.clone(),
        ));
        let recommender = RecommendationEngine::new(Arc::clone(&balancer), config.recommendation);

        info!(
            models = registry.len(),
            templates = templates.len(),
            providers = ?adapters.providers(),
            "Routing service started"
        );

        Ok(Self {
            registry,
            breakers,
            tracker,
            usage,
            balancer,
            recommender,
            templates: RwLock::new(Arc::new(templates)),
            adapters,
            events,
            ingest,
        })
    }

    pub fn shared(self) -> SharedRoutingService {
        Arc::new(self)
    }

    pub fn events(&self) -> &SharedEventBus {
        &self.events
    }

    pub fn registry(&self) -> &SharedModelRegistry {
        &self.registry
    }

    pub fn breakers(&self) -> &SharedCircuitBreaker {
        &self.breakers
    }

    pub fn tracker(&self) -> &SharedPerformanceTracker {
        &self.tracker
    }

    pub fn balancer(&self) -> &LoadBalancer {
        &self.balancer
    }

    // ── Registry ─────────────────────────────────────────────────────

    pub async fn create_model(&self, new: NewModel) -> RoutingResult<ModelConfig> {
        let model = self.registry.create(new).await?;
        self.tracker.invalidate(&model.id);
        Ok(model)
    }

    pub async fn update_model(&self, id: &str, patch: ModelPatch) -> RoutingResult<ModelConfig> {
        let model = self.registry.update(id, patch).await?;
        self.tracker.invalidate(id);
        Ok(model)
    }

    pub async fn delete_model(&self, id: &str) -> RoutingResult<ModelConfig> {
        let model = self.registry.delete(id).await?;
        self.breakers.remove(id);
        self.tracker.invalidate(id);
        Ok(model)
    }

    pub fn get_model(&self, id: &str) -> RoutingResult<ModelConfig> {
        self.registry.get(id)
    }

    pub fn list_models(&self, filter: &ModelFilter) -> Vec<ModelConfig> {
        self.registry.list(filter)
    }

    // ── Routing ──────────────────────────────────────────────────────

    pub fn recommend(&self, request: &RecommendationRequest) -> RoutingResult<RecommendationResult> {
        self.recommender.recommend(request)
    }

    pub fn select(&self, filter: &CandidateFilter) -> RoutingResult<Selection> {
        self.balancer.select(filter)
    }

    /// Select a model and call it. Failures are reported, never retried.
    pub async fn execute(
        &self,
        filter: &CandidateFilter,
        request: ProviderRequest,
        timeout: Duration,
    ) -> RoutingResult<Execution> {
        let selection = self.balancer.select(filter)?;
        self.invoke(selection, request, timeout).await
    }

    /// Call the model held by `selection`. The lease is released once the
    /// outcome has been recorded.
    pub async fn invoke(
        &self,
        selection: Selection,
        request: ProviderRequest,
        timeout: Duration,
    ) -> RoutingResult<Execution> {
        let model_id = selection.model.id.clone();
        let adapter = self.adapters.for_model(&selection.model);
        let breakers = Arc::clone(&self.breakers);
        let usage = self.usage.clone();

        let task = tokio::spawn(async move {
            let started = Instant::now();
            let outcome = match adapter {
                Ok(adapter) => {
                    match tokio::time::timeout(timeout, adapter.invoke(&selection.model, &request))
                        .await
                    {
                        Ok(result) => result.map_err(|f| f.into_routing_error(&selection.model.id)),
                        Err(_) => Err(RoutingError::Timeout {
                            model_id: selection.model.id.clone(),
                            timeout_ms: timeout.as_millis() as u64,
                        }),
                    }
                }
                Err(failure) => Err(failure.into_routing_error(&selection.model.id)),
            };
            let latency_ms = started.elapsed().as_millis() as u64;
            let result = report(
                &breakers,
                &usage,
                &selection.model,
                selection.trial,
                outcome,
                latency_ms,
            );
            drop(selection);
            result
        });

        match task.await {
            Ok(result) => result,
            Err(join_error) => {
                // The adapter panicked before the outcome was reported.
                warn!(model_id = %model_id, error = %join_error, "Provider task aborted");
                self.breakers.record_failure(&model_id);
                self.usage.record(UsageRecord::failure(&model_id, 0));
                Err(RoutingError::Provider {
                    model_id,
                    message: format!("provider task aborted: {join_error}"),
                    retry_elsewhere: true,
                })
            }
        }
    }

    /// Send a minimal request to one model outside normal selection. The
    /// call goes out whatever the breaker says; its outcome is reported to
    /// the breaker and the ledger like any routed call. A trial that is due
    /// is claimed first, so a passing test closes a recovering breaker.
    pub async fn test_connection(&self, id: &str, timeout: Duration) -> RoutingResult<ConnectionTest> {
        let model = self.registry.get(id)?;
        let lease = self
            .registry
            .lease(id)
            .ok_or_else(|| RoutingError::not_found(format!("model '{id}'")))?;
        let trial = self.breakers.try_acquire(id) == Admission::Trial;

        let started = Instant::now();
        let outcome = match self.adapters.for_model(&model) {
            Ok(adapter) => {
                match tokio::time::timeout(timeout, adapter.invoke(&model, &ProviderRequest::ping()))
                    .await
                {
                    Ok(result) => result.map_err(|f| f.into_routing_error(id)),
                    Err(_) => Err(RoutingError::Timeout {
                        model_id: id.to_string(),
                        timeout_ms: timeout.as_millis() as u64,
                    }),
                }
            }
            Err(failure) => Err(failure.into_routing_error(id)),
        };
        let latency_ms = started.elapsed().as_millis() as u64;
        let result = report(&self.breakers, &self.usage, &model, trial, outcome, latency_ms);
        drop(lease);

        let circuit = self.breakers.status(id);
        info!(model_id = %id, success = result.is_ok(), trial, %circuit, latency_ms, "Connection test");
        Ok(ConnectionTest {
            model_id: id.to_string(),
            success: result.is_ok(),
            latency_ms,
            error: result.err().map(|e| e.to_string()),
            circuit,
        })
    }

    // ── Observability ────────────────────────────────────────────────

    pub fn performance(&self, id: &str, window: Window) -> RoutingResult<PerformanceSnapshot> {
        self.registry.get(id)?;
        Ok(self.tracker.snapshot(id, window))
    }

    pub fn health(&self) -> HealthReport {
        let circuits: Vec<CircuitHealth> = self
            .breakers
            .states()
            .into_iter()
            .map(|(model_id, state)| CircuitHealth { model_id, state })
            .collect();
        let open_circuits = circuits
            .iter()
            .filter(|c| c.state.status != CircuitStatus::Closed)
            .count();
        let models = self.registry.list(&ModelFilter::default());
        HealthReport {
            status: if open_circuits == 0 { "ok" } else { "degraded" }.to_string(),
            models: models.len(),
            enabled_models: models.iter().filter(|m| m.enabled).count(),
            open_circuits,
            usage_dropped: self.usage.dropped(),
            circuits,
        }
    }

    /// Periodic snapshot eviction and ledger compaction.
    pub fn spawn_sweeper(&self) -> JoinHandle<()> {
        self.tracker.spawn_sweeper()
    }

    // ── Templates ────────────────────────────────────────────────────

    pub fn templates(&self) -> Arc<TemplateCatalog> {
        Arc::clone(&self.templates.read().unwrap_or_else(PoisonError::into_inner))
    }

    pub fn list_templates(&self) -> Vec<Template> {
        self.templates().list()
    }

    /// Swap in a new catalog. Models already instantiated are unaffected.
    pub fn reload_templates(&self, catalog: TemplateCatalog) {
        info!(count = catalog.len(), "Template catalog replaced");
        *self.templates.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(catalog);
    }

    pub async fn instantiate_template(
        &self,
        name: &str,
        overrides: TemplateOverrides,
    ) -> RoutingResult<ModelConfig> {
        let catalog = self.templates();
        let model = catalog.instantiate(name, overrides, &self.registry).await?;
        self.tracker.invalidate(&model.id);
        Ok(model)
    }
}

impl Drop for RoutingService {
    fn drop(&mut self) {
        self.ingest.abort();
    }
}

fn report(
    breakers: &CircuitBreaker,
    usage: &UsageSink,
    model: &ModelConfig,
    trial: bool,
    outcome: RoutingResult<ProviderResponse>,
    latency_ms: u64,
) -> RoutingResult<Execution> {
    match outcome {
        Ok(response) => {
            let cost = response
                .cost
                .filter(|c| c.is_finite() && *c >= 0.0)
                .unwrap_or_else(|| model.cost_for_tokens(response.tokens));
            breakers.record_success(&model.id);
            usage.record(UsageRecord::success(&model.id, response.tokens, cost, latency_ms));
            Ok(Execution {
                model_id: model.id.clone(),
                content: response.content,
                tokens: response.tokens,
                cost,
                latency_ms,
                trial,
            })
        }
        Err(err) => {
            let status = breakers.record_failure(&model.id);
            usage.record(UsageRecord::failure(&model.id, latency_ms));
            warn!(
                model_id = %model.id,
                error = %err,
                circuit = %status,
                latency_ms,
                "Provider call failed"
            );
            Err(err)
        }
    }
}
