//! Registry data model: model configurations, patches and list filters.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{RoutingError, RoutingResult};

/// Role assigned when a caller does not name one.
pub const DEFAULT_ROLE: &str = "general";

fn default_role() -> String {
    DEFAULT_ROLE.to_string()
}

fn default_true() -> bool {
    true
}

fn default_max_tokens() -> u32 {
    2048
}

fn default_temperature() -> f32 {
    0.3
}

/// A registered model backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Unique, immutable identifier.
    pub id: String,
    /// Provider key used to pick a [`crate::provider::ProviderAdapter`].
    pub provider: String,
    /// Provider-side model name sent on the wire.
    pub model_name: String,
    pub display_name: String,

    pub quality_score: f64,
    pub speed_score: f64,
    pub cost_efficiency: f64,
    pub reliability_score: f64,

    /// Price per 1000 tokens, in the deployment's billing currency.
    #[serde(default)]
    pub cost_per_1k_tokens: f64,

    #[serde(default)]
    pub capabilities: BTreeSet<String>,

    /// Logical role; at most one default model exists per role.
    #[serde(default = "default_role")]
    pub role: String,
    #[serde(default)]
    pub is_default: bool,
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Base URL of the provider endpoint, if the adapter needs one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    /// Name of the environment variable holding the API key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,

    /// Optimistic concurrency token, bumped on every update.
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ModelConfig {
    pub fn has_capabilities<'a>(&self, required: impl IntoIterator<Item = &'a String>) -> bool {
        required.into_iter().all(|c| self.capabilities.contains(c))
    }

    /// Projected spend for `tokens` tokens.
    pub fn cost_for_tokens(&self, tokens: u64) -> f64 {
        tokens as f64 * self.cost_per_1k_tokens / 1000.0
    }

    pub(crate) fn validate(&self) -> RoutingResult<()> {
        for (field, value) in [
            ("id", &self.id),
            ("provider", &self.provider),
            ("model_name", &self.model_name),
            ("display_name", &self.display_name),
            ("role", &self.role),
        ] {
            if value.trim().is_empty() {
                return Err(RoutingError::validation(format!("'{field}' is required")));
            }
        }
        if self.id.contains('/') || self.id.chars().any(char::is_whitespace) {
            return Err(RoutingError::validation(format!(
                "id '{}' must not contain '/' or whitespace",
                self.id
            )));
        }
        for (field, value) in [
            ("quality_score", self.quality_score),
            ("speed_score", self.speed_score),
            ("cost_efficiency", self.cost_efficiency),
            ("reliability_score", self.reliability_score),
        ] {
            if !value.is_finite() || !(0.0..=1.0).contains(&value) {
                return Err(RoutingError::validation(format!(
                    "'{field}' must be within [0, 1], got {value}"
                )));
            }
        }
        if !self.cost_per_1k_tokens.is_finite() || self.cost_per_1k_tokens < 0.0 {
            return Err(RoutingError::validation(
                "'cost_per_1k_tokens' must be a non-negative number",
            ));
        }
        if !self.temperature.is_finite() || !(0.0..=2.0).contains(&self.temperature) {
            return Err(RoutingError::validation("'temperature' must be within [0, 2]"));
        }
        if self.max_tokens == 0 {
            return Err(RoutingError::validation("'max_tokens' must be positive"));
        }
        Ok(())
    }
}

/// Input for creating a model. Timestamps and version are assigned by the
/// registry.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewModel {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub provider: String,
    #[serde(default)]
    pub model_name: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub quality_score: f64,
    #[serde(default)]
    pub speed_score: f64,
    #[serde(default)]
    pub cost_efficiency: f64,
    #[serde(default)]
    pub reliability_score: f64,
    #[serde(default)]
    pub cost_per_1k_tokens: f64,
    #[serde(default)]
    pub capabilities: BTreeSet<String>,
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub is_default: bool,
    #[serde(default)]
    pub enabled: Option<bool>,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub api_key_env: Option<String>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub temperature: Option<f32>,
}

impl NewModel {
    pub(crate) fn into_config(self, now: DateTime<Utc>) -> ModelConfig {
        ModelConfig {
            id: self.id.trim().to_string(),
            provider: self.provider.trim().to_string(),
            model_name: self.model_name,
            display_name: self.display_name,
            quality_score: self.quality_score,
            speed_score: self.speed_score,
            cost_efficiency: self.cost_efficiency,
            reliability_score: self.reliability_score,
            cost_per_1k_tokens: self.cost_per_1k_tokens,
            capabilities: self.capabilities,
            role: self.role.unwrap_or_else(default_role),
            is_default: self.is_default,
            enabled: self.enabled.unwrap_or(true),
            endpoint: self.endpoint,
            api_key_env: self.api_key_env,
            max_tokens: self.max_tokens.unwrap_or_else(default_max_tokens),
            temperature: self.temperature.unwrap_or_else(default_temperature),
            version: 1,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Partial update. `None` leaves a field untouched; `id` is never patchable.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelPatch {
    pub provider: Option<String>,
    pub model_name: Option<String>,
    pub display_name: Option<String>,
    pub quality_score: Option<f64>,
    pub speed_score: Option<f64>,
    pub cost_efficiency: Option<f64>,
    pub reliability_score: Option<f64>,
    pub cost_per_1k_tokens: Option<f64>,
    pub capabilities: Option<BTreeSet<String>>,
    pub role: Option<String>,
    pub is_default: Option<bool>,
    pub enabled: Option<bool>,
    pub endpoint: Option<String>,
    pub api_key_env: Option<String>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,

    /// Reject the update unless the stored version still matches.
    #[serde(default)]
    pub expected_version: Option<u64>,
    /// Allows disabling or un-defaulting a protected default model.
    #[serde(default)]
    pub admin_override: bool,
}

impl ModelPatch {
    /// Whether applying this patch to `current` would strip its protection.
    pub(crate) fn weakens_default(&self, current: &ModelConfig) -> bool {
        current.is_default
            && (self.enabled == Some(false) || self.is_default == Some(false))
    }

    pub(crate) fn apply(self, current: &ModelConfig, now: DateTime<Utc>) -> ModelConfig {
        let mut next = current.clone();
        if let Some(v) = self.provider {
            next.provider = v;
        }
        if let Some(v) = self.model_name {
            next.model_name = v;
        }
        if let Some(v) = self.display_name {
            next.display_name = v;
        }
        if let Some(v) = self.quality_score {
            next.quality_score = v;
        }
        if let Some(v) = self.speed_score {
            next.speed_score = v;
        }
        if let Some(v) = self.cost_efficiency {
            next.cost_efficiency = v;
        }
        if let Some(v) = self.reliability_score {
            next.reliability_score = v;
        }
        if let Some(v) = self.cost_per_1k_tokens {
            next.cost_per_1k_tokens = v;
        }
        if let Some(v) = self.capabilities {
            next.capabilities = v;
        }
        if let Some(v) = self.role {
            next.role = v;
        }
        if let Some(v) = self.is_default {
            next.is_default = v;
        }
        if let Some(v) = self.enabled {
            next.enabled = v;
        }
        if let Some(v) = self.endpoint {
            next.endpoint = Some(v);
        }
        if let Some(v) = self.api_key_env {
            next.api_key_env = Some(v);
        }
        if let Some(v) = self.max_tokens {
            next.max_tokens = v;
        }
        if let Some(v) = self.temperature {
            next.temperature = v;
        }
        next.version = current.version + 1;
        next.updated_at = now;
        next
    }
}

/// Sort key for [`ModelFilter`]. Score keys sort best-first.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortKey {
    #[default]
    DisplayName,
    Id,
    Provider,
    Quality,
    Speed,
    CostEfficiency,
    Reliability,
    CreatedAt,
}

/// Filter for [`crate::registry::ModelRegistry::list`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelFilter {
    #[serde(default)]
    pub enabled: Option<bool>,
    /// Every listed capability must be present.
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default)]
    pub sort: Option<SortKey>,
}

impl ModelFilter {
    pub fn enabled_only() -> Self {
        Self {
            enabled: Some(true),
            ..Self::default()
        }
    }

    pub fn with_capability(mut self, capability: impl Into<String>) -> Self {
        self.capabilities.push(capability.into());
        self
    }

    pub fn with_provider(mut self, provider: impl Into<String>) -> Self {
        self.provider = Some(provider.into());
        self
    }

    pub fn sorted_by(mut self, key: SortKey) -> Self {
        self.sort = Some(key);
        self
    }

    pub fn matches(&self, model: &ModelConfig) -> bool {
        if let Some(enabled) = self.enabled {
            if model.enabled != enabled {
                return false;
            }
        }
        if let Some(provider) = &self.provider {
            if !model.provider.eq_ignore_ascii_case(provider) {
                return false;
            }
        }
        model.has_capabilities(&self.capabilities)
    }
}

pub(crate) fn sort_models(models: &mut [ModelConfig], key: SortKey) {
    use std::cmp::Ordering;

    let desc = |a: f64, b: f64| b.partial_cmp(&a).unwrap_or(Ordering::Equal);
    models.sort_by(|a, b| {
        let primary = match key {
            SortKey::DisplayName => a.display_name.cmp(&b.display_name),
            SortKey::Id => a.id.cmp(&b.id),
            SortKey::Provider => a.provider.cmp(&b.provider),
            SortKey::Quality => desc(a.quality_score, b.quality_score),
            SortKey::Speed => desc(a.speed_score, b.speed_score),
            SortKey::CostEfficiency => desc(a.cost_efficiency, b.cost_efficiency),
            SortKey::Reliability => desc(a.reliability_score, b.reliability_score),
            SortKey::CreatedAt => a.created_at.cmp(&b.created_at),
        };
        primary.then_with(|| a.id.cmp(&b.id))
    });
}
