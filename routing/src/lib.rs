//! Model Routing Library
//!
//! This library provides:
//! - A persistent registry of model backends with default/role protection
//! - Per-model circuit breakers with exponential cooldown
//! - A usage ledger with cached, windowed performance snapshots
//! - A weighted load balancer and a context-aware recommendation engine
//! - A template catalog for instantiating curated model presets
//!
//! # Request Flow
//!
//! ```text
//! caller ──► RoutingService::execute
//!              │
//!              ├─ LoadBalancer::select ── registry ∩ enabled ∩ breaker-admitted
//!              │                          scored, weighted draw, lease taken
//!              ├─ ProviderAdapter::invoke (own task, caller timeout)
//!              └─ outcome ──► CircuitBreaker + UsageSink ──► PerformanceTracker
//! ```
//!
//! # Usage
//!
//! ```rust,ignore
//! let service = RoutingService::start(
//!     RoutingConfig::load(None)?,
//!     MemoryConfigStore::new().shared(),
//!     AdapterSet::new().with(my_adapter),
//!     TemplateCatalog::builtin(),
//! )
//! .await?;
//!
//! service.instantiate_template("gpt-4o-mini", TemplateOverrides::default()).await?;
//! let best = service.recommend(&RecommendationRequest::default())?;
//! ```

pub mod config;
pub mod error;
pub mod events;
pub mod provider;
pub mod registry;
pub mod router;
pub mod service;
pub mod store;
pub mod templates;
pub mod tracker;

pub use config::{ConfigError, RoutingConfig};
pub use error::{RoutingError, RoutingResult};
pub use events::{spawn_audit_logger, CreateSource, EventBus, RoutingEvent, SharedEventBus};
pub use provider::{
    AdapterSet, ChatMessage, ProviderAdapter, ProviderFailure, ProviderRequest, ProviderResponse,
    SharedProviderAdapter,
};
pub use registry::{
    ModelConfig, ModelFilter, ModelPatch, ModelRegistry, NewModel, SharedModelRegistry, SortKey,
};
pub use router::{
    CandidateFilter, CircuitBreaker, CircuitBreakerConfig, CircuitState, CircuitStatus, Level,
    LoadBalancer, RecommendationConfig, RecommendationEngine, RecommendationRequest,
    RecommendationResult, RunnerUp, ScoreWeights, Selection,
};
pub use service::{
    CircuitHealth, ConnectionTest, Execution, HealthReport, RoutingService, SharedRoutingService,
};
pub use store::{ConfigStore, JsonFileConfigStore, MemoryConfigStore, SharedConfigStore, StoreError};
pub use templates::{Template, TemplateCatalog, TemplateOverrides};
pub use tracker::{PerformanceSnapshot, PerformanceTracker, TrackerConfig, UsageRecord, UsageSink, Window};
