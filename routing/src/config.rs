//! Routing configuration.
//!
//! Resolution order: built-in defaults, then an optional TOML file (missing
//! sections and keys keep their defaults), then `ROUTING_*` environment
//! variables. Malformed environment values are ignored with a warning.
//!
//! | Variable                              | Field                                   |
//! |---------------------------------------|-----------------------------------------|
//! | `ROUTING_BREAKER_FAILURE_THRESHOLD`   | `breaker.failure_threshold`             |
//! | `ROUTING_BREAKER_WINDOW_SECS`         | `breaker.failure_window_secs`           |
//! | `ROUTING_BREAKER_COOLDOWN_SECS`       | `breaker.cooldown_secs`                 |
//! | `ROUTING_BREAKER_MAX_COOLDOWN_SECS`   | `breaker.max_cooldown_secs`             |
//! | `ROUTING_SNAPSHOT_TTL_SECS`           | `tracker.snapshot_ttl_secs`             |
//! | `ROUTING_RETENTION_DAYS`              | `tracker.retention_days`                |
//! | `ROUTING_USAGE_BUFFER`                | `tracker.buffer_capacity`               |
//! | `ROUTING_SWEEP_INTERVAL_SECS`         | `tracker.sweep_interval_secs`           |
//! | `ROUTING_MIN_RELIABILITY`             | `recommendation.min_reliability`        |
//! | `ROUTING_ERROR_PENALTY`               | `scoring.error_penalty`                 |

use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono::Duration;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::router::{CircuitBreakerConfig, RecommendationConfig, ScoreWeights};
use crate::tracker::TrackerConfig;

/// Upper bound for every configured duration (ten years).
pub const MAX_DURATION_SECS: u64 = 10 * 365 * 86_400;

/// `secs` as a chrono duration, clamped to [`MAX_DURATION_SECS`].
pub(crate) fn bounded_secs(secs: u64) -> Duration {
    Duration::seconds(secs.min(MAX_DURATION_SECS) as i64)
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingConfig {
    pub breaker: CircuitBreakerConfig,
    pub tracker: TrackerConfig,
    pub scoring: ScoreWeights,
    pub recommendation: RecommendationConfig,
}

impl RoutingConfig {
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults, overlaid by `path` when given, overlaid by the environment.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => {
                let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
                    path: path.to_path_buf(),
                    source,
                })?;
                toml::from_str(&content)?
            }
            None => Self::default(),
        };
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    pub fn apply_env(&mut self) {
        self.apply_env_from(|key| std::env::var(key).ok());
    }

    /// Apply overrides from an arbitrary variable source.
    pub fn apply_env_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let breaker = &mut self.breaker;
        override_from(&lookup, "ROUTING_BREAKER_FAILURE_THRESHOLD", &mut breaker.failure_threshold);
        override_from(&lookup, "ROUTING_BREAKER_WINDOW_SECS", &mut breaker.failure_window_secs);
        override_from(&lookup, "ROUTING_BREAKER_COOLDOWN_SECS", &mut breaker.cooldown_secs);
        override_from(&lookup, "ROUTING_BREAKER_MAX_COOLDOWN_SECS", &mut breaker.max_cooldown_secs);

        let tracker = &mut self.tracker;
        override_from(&lookup, "ROUTING_SNAPSHOT_TTL_SECS", &mut tracker.snapshot_ttl_secs);
        override_from(&lookup, "ROUTING_RETENTION_DAYS", &mut tracker.retention_days);
        override_from(&lookup, "ROUTING_USAGE_BUFFER", &mut tracker.buffer_capacity);
        override_from(&lookup, "ROUTING_SWEEP_INTERVAL_SECS", &mut tracker.sweep_interval_secs);

        override_from(
            &lookup,
            "ROUTING_MIN_RELIABILITY",
            &mut self.recommendation.min_reliability,
        );
        override_from(&lookup, "ROUTING_ERROR_PENALTY", &mut self.scoring.error_penalty);
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let b = &self.breaker;
        if b.failure_threshold == 0 {
            return Err(ConfigError::Invalid(
                "breaker.failure_threshold must be at least 1".into(),
            ));
        }
        if b.cooldown_secs == 0 || b.max_cooldown_secs < b.cooldown_secs {
            return Err(ConfigError::Invalid(format!(
                "breaker cooldown must satisfy 0 < cooldown_secs ({}) <= max_cooldown_secs ({})",
                b.cooldown_secs, b.max_cooldown_secs
            )));
        }
        let t = &self.tracker;
        for (field, secs) in [
            ("breaker.failure_window_secs", b.failure_window_secs),
            ("breaker.cooldown_secs", b.cooldown_secs),
            ("breaker.max_cooldown_secs", b.max_cooldown_secs),
            ("tracker.snapshot_ttl_secs", t.snapshot_ttl_secs),
            ("tracker.sweep_interval_secs", t.sweep_interval_secs),
            ("tracker.retention_days", t.retention_days.saturating_mul(86_400)),
        ] {
            if secs > MAX_DURATION_SECS {
                return Err(ConfigError::Invalid(format!(
                    "{field} exceeds the {MAX_DURATION_SECS}s limit"
                )));
            }
        }
        if self.tracker.buffer_capacity == 0 {
            return Err(ConfigError::Invalid(
                "tracker.buffer_capacity must be positive".into(),
            ));
        }
        self.scoring
            .validate()
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;
        self.recommendation
            .validate()
            .map_err(|e| ConfigError::Invalid(e.to_string()))?;
        Ok(())
    }
}

fn override_from<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, slot: &mut T) {
    let Some(raw) = lookup(key) else {
        return;
    };
    match raw.trim().parse::<T>() {
        Ok(value) => *slot = value,
        Err(_) => warn!(key, value = %raw, "Ignoring malformed environment override"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults_are_valid() {
        let config = RoutingConfig::default();
        config.validate().unwrap();
        assert_eq!(config.breaker.failure_threshold, 5);
        assert_eq!(config.breaker.failure_window_secs, 60);
        assert_eq!(config.breaker.cooldown_secs, 30);
        assert_eq!(config.breaker.max_cooldown_secs, 600);
        assert_eq!(config.tracker.snapshot_ttl_secs, 3_600);
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = RoutingConfig::from_toml_str(
            r#"
[breaker]
failure_threshold = 3

[scoring]
quality = 0.5
"#,
        )
        .unwrap();
        assert_eq!(config.breaker.failure_threshold, 3);
        assert_eq!(config.breaker.cooldown_secs, 30);
        assert_eq!(config.scoring.quality, 0.5);
        assert_eq!(config.scoring.speed, 0.2);
        assert_eq!(config.recommendation.max_runner_ups, 3);
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [
            ("ROUTING_BREAKER_COOLDOWN_SECS", "10"),
            ("ROUTING_RETENTION_DAYS", "7"),
            ("ROUTING_MIN_RELIABILITY", "0.75"),
            ("ROUTING_USAGE_BUFFER", "not-a-number"),
        ]
        .into();
        let mut config = RoutingConfig::default();
        config.apply_env_from(|k| vars.get(k).map(|v| v.to_string()));

        assert_eq!(config.breaker.cooldown_secs, 10);
        assert_eq!(config.tracker.retention_days, 7);
        assert_eq!(config.recommendation.min_reliability, 0.75);
        assert_eq!(config.tracker.buffer_capacity, 4_096);
    }

    #[test]
    fn test_inverted_cooldown_rejected() {
        let err = RoutingConfig::from_toml_str(
            r#"
[breaker]
cooldown_secs = 900
max_cooldown_secs = 60
"#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_out_of_range_durations_rejected() {
        for toml in [
            "[breaker]\nmax_cooldown_secs = 9223372036854775807\n",
            "[tracker]\nsnapshot_ttl_secs = 9223372036854775807\n",
            "[tracker]\nretention_days = 1000000000000\n",
        ] {
            let err = RoutingConfig::from_toml_str(toml).unwrap_err();
            assert!(matches!(err, ConfigError::Invalid(_)), "{toml}");
        }
    }

    #[test]
    fn test_bounded_secs_clamps() {
        assert_eq!(bounded_secs(30), Duration::seconds(30));
        assert_eq!(
            bounded_secs(u64::MAX),
            Duration::seconds(MAX_DURATION_SECS as i64)
        );
    }

    #[test]
    fn test_unparseable_toml() {
        assert!(matches!(
            RoutingConfig::from_toml_str("breaker = ["),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("routing.toml");
        std::fs::write(&path, "[tracker]\nretention_days = 90\n").unwrap();
        let config = RoutingConfig::load(Some(&path)).unwrap();
        assert_eq!(config.tracker.retention_days, 90);
    }
}
