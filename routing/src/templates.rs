//! Template catalog: curated presets that become registry entries.
//!
//! Templates are read-only values. Instantiation copies the preset, applies
//! caller overrides, assigns a fresh id and hands the result to
//! [`ModelRegistry`]; the new model keeps no link to its template.
//!
//! A catalog file is TOML keyed by template name:
//!
//! ```toml
//! [templates.gpt-4o]
//! description = "OpenAI flagship"
//! provider = "openai"
//! model_name = "gpt-4o"
//! display_name = "GPT-4o"
//! quality_score = 0.92
//! speed_score = 0.7
//! cost_efficiency = 0.45
//! reliability_score = 0.95
//! cost_per_1k_tokens = 0.005
//! capabilities = ["korean", "evaluation", "analysis"]
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::error::{RoutingError, RoutingResult};
use crate::events::CreateSource;
use crate::registry::{ModelConfig, ModelRegistry, NewModel};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Template {
    /// Filled from the catalog key when loaded from TOML.
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub provider: String,
    pub model_name: String,
    pub display_name: String,
    pub quality_score: f64,
    pub speed_score: f64,
    pub cost_efficiency: f64,
    pub reliability_score: f64,
    #[serde(default)]
    pub cost_per_1k_tokens: f64,
    #[serde(default)]
    pub capabilities: BTreeSet<String>,
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub api_key_env: Option<String>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub temperature: Option<f32>,
}

/// Caller-supplied changes applied on top of a template.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TemplateOverrides {
    /// Explicit id; generated from the template name when absent.
    pub id: Option<String>,
    pub display_name: Option<String>,
    pub model_name: Option<String>,
    pub quality_score: Option<f64>,
    pub speed_score: Option<f64>,
    pub cost_efficiency: Option<f64>,
    pub reliability_score: Option<f64>,
    pub cost_per_1k_tokens: Option<f64>,
    /// Replaces the template's capability set.
    pub capabilities: Option<BTreeSet<String>>,
    pub role: Option<String>,
    pub is_default: Option<bool>,
    pub enabled: Option<bool>,
    pub endpoint: Option<String>,
    pub api_key_env: Option<String>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
}

impl Template {
    fn validate(&self) -> RoutingResult<()> {
        if self.name.trim().is_empty()
            || self.name.contains('/')
            || self.name.chars().any(char::is_whitespace)
        {
            return Err(RoutingError::validation(format!(
                "template name '{}' must be non-empty without '/' or whitespace",
                self.name
            )));
        }
        // Reuse the registry's field checks on a throwaway instance.
        self.to_new_model(format!("{}-check", self.name), TemplateOverrides::default())
            .into_config(chrono::Utc::now())
            .validate()
            .map_err(|e| RoutingError::validation(format!("template '{}': {e}", self.name)))
    }

    fn to_new_model(&self, id: String, o: TemplateOverrides) -> NewModel {
        NewModel {
            id,
            provider: self.provider.clone(),
            model_name: o.model_name.unwrap_or_else(|| self.model_name.clone()),
            display_name: o.display_name.unwrap_or_else(|| self.display_name.clone()),
            quality_score: o.quality_score.unwrap_or(self.quality_score),
            speed_score: o.speed_score.unwrap_or(self.speed_score),
            cost_efficiency: o.cost_efficiency.unwrap_or(self.cost_efficiency),
            reliability_score: o.reliability_score.unwrap_or(self.reliability_score),
            cost_per_1k_tokens: o.cost_per_1k_tokens.unwrap_or(self.cost_per_1k_tokens),
            capabilities: o.capabilities.unwrap_or_else(|| self.capabilities.clone()),
            role: o.role.or_else(|| self.role.clone()),
            is_default: o.is_default.unwrap_or(false),
            enabled: o.enabled,
            endpoint: o.endpoint.or_else(|| self.endpoint.clone()),
            api_key_env: o.api_key_env.or_else(|| self.api_key_env.clone()),
            max_tokens: o.max_tokens.or(self.max_tokens),
            temperature: o.temperature.or(self.temperature),
        }
    }
}

#[derive(Debug, Deserialize)]
struct CatalogFile {
    #[serde(default)]
    templates: BTreeMap<String, Template>,
}

#[derive(Debug, Clone, Default)]
pub struct TemplateCatalog {
    templates: BTreeMap<String, Template>,
}

impl TemplateCatalog {
    pub fn new(templates: impl IntoIterator<Item = Template>) -> RoutingResult<Self> {
        let mut map = BTreeMap::new();
        for template in templates {
            template.validate()?;
            if map.contains_key(&template.name) {
                return Err(RoutingError::conflict(format!(
                    "template '{}' defined twice",
                    template.name
                )));
            }
            map.insert(template.name.clone(), template);
        }
        Ok(Self { templates: map })
    }

    /// Curated presets shipped with the crate.
    pub fn builtin() -> Self {
        let preset = |name: &str,
                      description: &str,
                      provider: &str,
                      display_name: &str,
                      scores: [f64; 4],
                      cost_per_1k_tokens: f64,
                      capabilities: &[&str]| Template {
            name: name.to_string(),
            description: description.to_string(),
            provider: provider.to_string(),
            model_name: name.to_string(),
            display_name: display_name.to_string(),
            quality_score: scores[0],
            speed_score: scores[1],
            cost_efficiency: scores[2],
            reliability_score: scores[3],
            cost_per_1k_tokens,
            capabilities: capabilities.iter().map(|c| c.to_string()).collect(),
            role: None,
            endpoint: None,
            api_key_env: None,
            max_tokens: None,
            temperature: None,
        };

        let mut local = preset(
            "llama3.1",
            "Self-hosted Llama 3.1 behind an OpenAI-compatible server",
            "openai",
            "Llama 3.1 (local)",
            [0.6, 0.6, 1.0, 0.8],
            0.0,
            &["evaluation"],
        );
        local.endpoint = Some("http://localhost:11434/v1".to_string());

        let mut openai = [
            preset(
                "gpt-4o",
                "OpenAI flagship multimodal model",
                "openai",
                "GPT-4o",
                [0.92, 0.7, 0.45, 0.95],
                0.005,
                &["korean", "evaluation", "analysis"],
            ),
            preset(
                "gpt-4o-mini",
                "Fast, inexpensive OpenAI model",
                "openai",
                "GPT-4o mini",
                [0.72, 0.9, 0.92, 0.93],
                0.0006,
                &["korean", "evaluation"],
            ),
        ];
        for t in &mut openai {
            t.api_key_env = Some("OPENAI_API_KEY".to_string());
        }

        let mut anthropic = preset(
            "claude-3-5-sonnet",
            "Anthropic model strong at long-form analysis",
            "anthropic",
            "Claude 3.5 Sonnet",
            [0.93, 0.68, 0.5, 0.94],
            0.003,
            &["korean", "evaluation", "analysis"],
        );
        anthropic.api_key_env = Some("ANTHROPIC_API_KEY".to_string());

        let mut google = preset(
            "gemini-1.5-flash",
            "Google low-latency model",
            "google",
            "Gemini 1.5 Flash",
            [0.7, 0.92, 0.9, 0.9],
            0.00035,
            &["korean", "analysis"],
        );
        google.api_key_env = Some("GOOGLE_API_KEY".to_string());

        let templates = openai
            .into_iter()
            .chain([anthropic, google, local])
            .map(|t| (t.name.clone(), t))
            .collect();
        Self { templates }
    }

    pub fn from_toml_str(content: &str) -> RoutingResult<Self> {
        let file: CatalogFile = toml::from_str(content)
            .map_err(|e| RoutingError::validation(format!("invalid template catalog: {e}")))?;
        Self::new(file.templates.into_iter().map(|(name, mut template)| {
            template.name = name;
            template
        }))
    }

    pub fn load(path: &Path) -> RoutingResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            RoutingError::validation(format!(
                "cannot read template catalog {}: {e}",
                path.display()
            ))
        })?;
        let catalog = Self::from_toml_str(&content)?;
        info!(path = %path.display(), count = catalog.len(), "Template catalog loaded");
        Ok(catalog)
    }

    pub fn list(&self) -> Vec<Template> {
        self.templates.values().cloned().collect()
    }

    pub fn get(&self, name: &str) -> RoutingResult<&Template> {
        self.templates
            .get(name)
            .ok_or_else(|| RoutingError::not_found(format!("template '{name}'")))
    }

    pub fn len(&self) -> usize {
        self.templates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }

    /// Create a registry entry from `name`, with `overrides` applied.
    pub async fn instantiate(
        &self,
        name: &str,
        overrides: TemplateOverrides,
        registry: &ModelRegistry,
    ) -> RoutingResult<ModelConfig> {
        let template = self.get(name)?;
        let id = match overrides.id.clone() {
            Some(id) => {
                if registry.contains(&id) {
                    return Err(RoutingError::conflict(format!("model '{id}' already exists")));
                }
                id
            }
            None => fresh_id(name, registry),
        };
        let new = template.to_new_model(id, overrides);
        registry
            .create_from(new, CreateSource::Template(name.to_string()))
            .await
    }
}

fn fresh_id(name: &str, registry: &ModelRegistry) -> String {
    loop {
        let suffix = Uuid::new_v4().simple().to_string();
        let id = format!("{name}-{}", &suffix[..8]);
        if !registry.contains(&id) {
            return id;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{EventBus, RoutingEvent};
    use crate::store::MemoryConfigStore;

    async fn registry() -> ModelRegistry {
        ModelRegistry::load(MemoryConfigStore::new().shared(), None)
            .await
            .unwrap()
    }

    #[test]
    fn test_builtin_catalog_is_valid() {
        let catalog = TemplateCatalog::builtin();
        assert!(catalog.len() >= 5);
        for template in catalog.list() {
            template.validate().unwrap();
        }
        assert!(catalog.get("gpt-4o").is_ok());
    }

    #[tokio::test]
    async fn test_instantiate_assigns_fresh_ids() {
        let catalog = TemplateCatalog::builtin();
        let reg = registry().await;
        let a = catalog
            .instantiate("gpt-4o", TemplateOverrides::default(), &reg)
            .await
            .unwrap();
        let b = catalog
            .instantiate("gpt-4o", TemplateOverrides::default(), &reg)
            .await
            .unwrap();
        assert_ne!(a.id, b.id);
        assert!(a.id.starts_with("gpt-4o-"));
        assert_eq!(a.quality_score, 0.92);
        assert_eq!(reg.len(), 2);
    }

    #[tokio::test]
    async fn test_overrides_applied() {
        let catalog = TemplateCatalog::builtin();
        let reg = registry().await;
        let model = catalog
            .instantiate(
                "gpt-4o-mini",
                TemplateOverrides {
                    id: Some("reviewer".into()),
                    display_name: Some("Korean reviewer".into()),
                    quality_score: Some(0.8),
                    role: Some("korean-review".into()),
                    is_default: Some(true),
                    ..TemplateOverrides::default()
                },
                &reg,
            )
            .await
            .unwrap();
        assert_eq!(model.id, "reviewer");
        assert_eq!(model.display_name, "Korean reviewer");
        assert_eq!(model.quality_score, 0.8);
        assert_eq!(model.model_name, "gpt-4o-mini");
        assert!(model.is_default);
        assert_eq!(reg.default_for("korean-review").unwrap().id, "reviewer");
    }

    #[tokio::test]
    async fn test_colliding_id_conflicts() {
        let catalog = TemplateCatalog::builtin();
        let reg = registry().await;
        let overrides = TemplateOverrides {
            id: Some("taken".into()),
            ..TemplateOverrides::default()
        };
        catalog
            .instantiate("gpt-4o", overrides.clone(), &reg)
            .await
            .unwrap();
        let err = catalog
            .instantiate("gpt-4o", overrides, &reg)
            .await
            .unwrap_err();
        assert!(matches!(err, RoutingError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_unknown_template_not_found() {
        let reg = registry().await;
        let err = TemplateCatalog::builtin()
            .instantiate("nope", TemplateOverrides::default(), &reg)
            .await
            .unwrap_err();
        assert!(matches!(err, RoutingError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_instance_is_a_copy() {
        let catalog = TemplateCatalog::builtin();
        let reg = registry().await;
        let model = catalog
            .instantiate(
                "gpt-4o",
                TemplateOverrides {
                    capabilities: Some(["vision".to_string()].into()),
                    ..TemplateOverrides::default()
                },
                &reg,
            )
            .await
            .unwrap();
        assert!(model.capabilities.contains("vision"));
        assert!(!catalog
            .get("gpt-4o")
            .unwrap()
            .capabilities
            .contains("vision"));
    }

    #[tokio::test]
    async fn test_instantiation_audited_with_template_source() {
        let bus = EventBus::new().shared();
        let mut rx = bus.subscribe();
        let reg = ModelRegistry::load(MemoryConfigStore::new().shared(), Some(bus))
            .await
            .unwrap();
        TemplateCatalog::builtin()
            .instantiate("llama3.1", TemplateOverrides::default(), &reg)
            .await
            .unwrap();
        match rx.recv().await.unwrap() {
            RoutingEvent::ModelCreated { source, .. } => {
                assert_eq!(source, CreateSource::Template("llama3.1".into()))
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn test_from_toml_str() {
        let catalog = TemplateCatalog::from_toml_str(
            r#"
[templates.house-model]
description = "In-house fine-tune"
provider = "openai"
model_name = "house-v2"
display_name = "House v2"
quality_score = 0.7
speed_score = 0.8
cost_efficiency = 0.9
reliability_score = 0.85
capabilities = ["korean"]
endpoint = "http://models.internal/v1"
"#,
        )
        .unwrap();
        let template = catalog.get("house-model").unwrap();
        assert_eq!(template.name, "house-model");
        assert_eq!(template.endpoint.as_deref(), Some("http://models.internal/v1"));
    }

    #[test]
    fn test_invalid_toml_template_rejected() {
        let err = TemplateCatalog::from_toml_str(
            r#"
[templates.broken]
provider = "openai"
model_name = "x"
display_name = "X"
quality_score = 3.0
speed_score = 0.5
cost_efficiency = 0.5
reliability_score = 0.5
"#,
        )
        .unwrap_err();
        assert!(matches!(err, RoutingError::Validation(_)));
    }
}
