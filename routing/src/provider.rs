//! Provider dispatch seam.
//!
//! Each upstream vendor is reached through one [`ProviderAdapter`], chosen by
//! `ModelConfig::provider`. Routing code never branches on provider names;
//! it only sees adapters, requests and [`ProviderFailure`]s.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::RoutingError;
use crate::registry::ModelConfig;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

/// Provider-agnostic request. Unset sampling fields fall back to the
/// model's configured values.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProviderRequest {
    pub messages: Vec<ChatMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
}

impl ProviderRequest {
    pub fn prompt(text: impl Into<String>) -> Self {
        Self {
            messages: vec![ChatMessage::user(text)],
            ..Self::default()
        }
    }

    /// Minimal request used by connection tests.
    pub fn ping() -> Self {
        Self {
            messages: vec![ChatMessage::user("ping")],
            max_tokens: Some(1),
            temperature: Some(0.0),
        }
    }

    pub fn max_tokens_for(&self, model: &ModelConfig) -> u32 {
        self.max_tokens.unwrap_or(model.max_tokens)
    }

    pub fn temperature_for(&self, model: &ModelConfig) -> f32 {
        self.temperature.unwrap_or(model.temperature)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderResponse {
    pub content: String,
    /// Total tokens billed for the call.
    pub tokens: u64,
    /// Cost reported by the provider; derived from the model's price when
    /// absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost: Option<f64>,
}

#[derive(Debug, Clone, Error)]
pub enum ProviderFailure {
    #[error("credentials rejected: {0}")]
    Unauthorized(String),

    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("provider unavailable: {0}")]
    Unavailable(String),

    /// The request itself is unacceptable; another model will refuse it too.
    #[error("request rejected: {0}")]
    InvalidRequest(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("malformed response: {0}")]
    Malformed(String),

    #[error("no adapter registered for provider '{0}'")]
    NoAdapter(String),
}

impl ProviderFailure {
    /// Whether falling back to a different model could help.
    pub fn retry_elsewhere(&self) -> bool {
        !matches!(self, Self::InvalidRequest(_))
    }

    pub fn into_routing_error(self, model_id: &str) -> RoutingError {
        RoutingError::Provider {
            model_id: model_id.to_string(),
            retry_elsewhere: self.retry_elsewhere(),
            message: self.to_string(),
        }
    }
}

/// One upstream vendor.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    /// Value of `ModelConfig::provider` this adapter serves.
    fn provider(&self) -> &str;

    async fn invoke(
        &self,
        model: &ModelConfig,
        request: &ProviderRequest,
    ) -> Result<ProviderResponse, ProviderFailure>;
}

/// Shared reference to a ProviderAdapter
pub type SharedProviderAdapter = Arc<dyn ProviderAdapter>;

/// Adapters keyed by provider name (case-insensitive).
#[derive(Clone, Default)]
pub struct AdapterSet {
    adapters: HashMap<String, SharedProviderAdapter>,
}

impl AdapterSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, adapter: SharedProviderAdapter) -> Self {
        self.register(adapter);
        self
    }

    /// Register `adapter`, replacing any adapter for the same provider.
    pub fn register(&mut self, adapter: SharedProviderAdapter) {
        self.adapters
            .insert(adapter.provider().to_ascii_lowercase(), adapter);
    }

    pub fn get(&self, provider: &str) -> Option<SharedProviderAdapter> {
        self.adapters.get(&provider.to_ascii_lowercase()).cloned()
    }

    pub fn for_model(&self, model: &ModelConfig) -> Result<SharedProviderAdapter, ProviderFailure> {
        self.get(&model.provider)
            .ok_or_else(|| ProviderFailure::NoAdapter(model.provider.clone()))
    }

    pub fn providers(&self) -> Vec<String> {
        let mut names: Vec<String> = self.adapters.keys().cloned().collect();
        names.sort();
        names
    }
}

impl std::fmt::Debug for AdapterSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdapterSet")
            .field("providers", &self.providers())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo;

    #[async_trait]
    impl ProviderAdapter for Echo {
        fn provider(&self) -> &str {
            "OpenAI"
        }

        async fn invoke(
            &self,
            _model: &ModelConfig,
            request: &ProviderRequest,
        ) -> Result<ProviderResponse, ProviderFailure> {
            Ok(ProviderResponse {
                content: request.messages[0].content.clone(),
                tokens: 1,
                cost: None,
            })
        }
    }

    #[test]
    fn test_lookup_is_case_insensitive() {
        let set = AdapterSet::new().with(Arc::new(Echo));
        assert!(set.get("openai").is_some());
        assert!(set.get("OPENAI").is_some());
        assert!(set.get("anthropic").is_none());
        assert_eq!(set.providers(), vec!["openai"]);
    }

    #[test]
    fn test_invalid_request_not_retried_elsewhere() {
        let err = ProviderFailure::InvalidRequest("context too long".into()).into_routing_error("m");
        assert!(!err.is_retriable());
        let err = ProviderFailure::RateLimited("429".into()).into_routing_error("m");
        assert!(err.is_retriable());
        assert_eq!(err.code(), "PROVIDER_ERROR");
    }
}
