//! Composite model scoring.
//!
//! ```text
//! base  = (wq*quality + ws*speed + wc*cost_efficiency + wr*reliability) / (wq + ws + wc + wr)
//! score = max(0, base * (1 - error_penalty * error_rate))
//! ```
//!
//! The result is in [0, 1] for valid weights and is non-increasing in
//! `error_rate`.

use serde::{Deserialize, Serialize};

use crate::error::{RoutingError, RoutingResult};
use crate::registry::ModelConfig;
use crate::tracker::Window;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoreWeights {
    pub quality: f64,
    pub speed: f64,
    pub cost_efficiency: f64,
    pub reliability: f64,
    /// Multiplier on the observed error rate; 1.0 drives a model that always
    /// fails to zero.
    pub error_penalty: f64,
    /// Snapshot window the error rate is read from.
    pub error_window: Window,
    /// Minimum draw weight for a model whose breaker is due a half-open
    /// trial, so a penalised model still gets a trial draw.
    pub trial_weight: f64,
}

impl Default for ScoreWeights {
    fn default() -> Self {
        Self {
            quality: 0.30,
            speed: 0.20,
            cost_efficiency: 0.25,
            reliability: 0.25,
            error_penalty: 1.0,
            error_window: Window::Day,
            trial_weight: 0.05,
        }
    }
}

impl ScoreWeights {
    pub fn validate(&self) -> RoutingResult<()> {
        for (field, value) in [
            ("quality", self.quality),
            ("speed", self.speed),
            ("cost_efficiency", self.cost_efficiency),
            ("reliability", self.reliability),
            ("error_penalty", self.error_penalty),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(RoutingError::validation(format!(
                    "score weight '{field}' must be a non-negative number, got {value}"
                )));
            }
        }
        if !(0.0..=1.0).contains(&self.trial_weight) {
            return Err(RoutingError::validation(format!(
                "trial_weight must be within [0, 1], got {}",
                self.trial_weight
            )));
        }
        if self.total() <= 0.0 {
            return Err(RoutingError::validation(
                "at least one attribute weight must be positive",
            ));
        }
        Ok(())
    }

    fn total(&self) -> f64 {
        self.quality + self.speed + self.cost_efficiency + self.reliability
    }

    /// Copy with the quality, speed and cost dimensions multiplied.
    pub fn emphasize(&self, quality: f64, speed: f64, cost: f64) -> Self {
        Self {
            quality: self.quality * quality,
            speed: self.speed * speed,
            cost_efficiency: self.cost_efficiency * cost,
            ..self.clone()
        }
    }

    /// Static attribute blend, before the error penalty.
    pub fn base_score(&self, model: &ModelConfig) -> f64 {
        let total = self.total();
        if total <= 0.0 {
            return 0.0;
        }
        (self.quality * model.quality_score
            + self.speed * model.speed_score
            + self.cost_efficiency * model.cost_efficiency
            + self.reliability * model.reliability_score)
            / total
    }

    pub fn composite(&self, model: &ModelConfig, error_rate: f64) -> f64 {
        let error_rate = if error_rate.is_finite() {
            error_rate.clamp(0.0, 1.0)
        } else {
            0.0
        };
        let factor = (1.0 - self.error_penalty * error_rate).max(0.0);
        (self.base_score(model) * factor).max(0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::NewModel;
    use chrono::Utc;

    fn model(quality: f64, speed: f64, cost: f64, reliability: f64) -> ModelConfig {
        NewModel {
            id: "m".into(),
            provider: "openai".into(),
            model_name: "m".into(),
            display_name: "M".into(),
            quality_score: quality,
            speed_score: speed,
            cost_efficiency: cost,
            reliability_score: reliability,
            ..NewModel::default()
        }
        .into_config(Utc::now())
    }

    #[test]
    fn test_perfect_model_scores_one() {
        let weights = ScoreWeights::default();
        let score = weights.composite(&model(1.0, 1.0, 1.0, 1.0), 0.0);
        assert!((score - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_error_rate_is_monotone_penalty() {
        let weights = ScoreWeights::default();
        let m = model(0.8, 0.6, 0.5, 0.9);
        let mut previous = f64::MAX;
        for rate in [0.0, 0.1, 0.25, 0.5, 0.9, 1.0] {
            let score = weights.composite(&m, rate);
            assert!(score <= previous);
            previous = score;
        }
        assert_eq!(weights.composite(&m, 1.0), 0.0);
    }

    #[test]
    fn test_cost_emphasis_favors_cheap_model() {
        let weights = ScoreWeights::default().emphasize(0.7, 1.0, 2.0);
        let a = model(0.9, 0.5, 0.3, 0.8);
        let b = model(0.5, 0.5, 0.9, 0.8);
        assert!(weights.composite(&b, 0.0) > weights.composite(&a, 0.0));
    }

    #[test]
    fn test_validate_rejects_degenerate_weights() {
        let mut weights = ScoreWeights::default();
        weights.speed = -1.0;
        assert!(weights.validate().is_err());

        let zero = ScoreWeights {
            quality: 0.0,
            speed: 0.0,
            cost_efficiency: 0.0,
            reliability: 0.0,
            ..ScoreWeights::default()
        };
        assert!(zero.validate().is_err());
        assert!(ScoreWeights::default().validate().is_ok());

        let oversized = ScoreWeights {
            trial_weight: 1.5,
            ..ScoreWeights::default()
        };
        assert!(oversized.validate().is_err());
    }
}
