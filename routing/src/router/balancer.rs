//! Weighted load balancer.
//!
//! Candidates come from the registry (enabled only), minus caller exclusions
//! and models whose breaker refuses traffic. Survivors are scored with
//! [`ScoreWeights::composite`] and one is drawn with probability
//! proportional to its score. A model whose breaker is due a half-open trial
//! draws with at least [`ScoreWeights::trial_weight`], since its recent
//! failures may have penalised its score to zero. The breaker has the final
//! say: if the drawn model's half-open trial was taken by a concurrent
//! caller, it is removed and the draw repeats over the rest.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::circuit_breaker::{Admission, SharedCircuitBreaker};
use super::scoring::ScoreWeights;
use crate::error::{RoutingError, RoutingResult};
use crate::registry::{ModelConfig, ModelFilter, SelectionLease, SharedModelRegistry};
use crate::tracker::SharedPerformanceTracker;

/// Registry filter plus ids the caller wants skipped.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CandidateFilter {
    #[serde(flatten)]
    pub models: ModelFilter,
    #[serde(default)]
    pub exclude: HashSet<String>,
}

impl CandidateFilter {
    pub fn with_capability(mut self, capability: impl Into<String>) -> Self {
        self.models = self.models.with_capability(capability);
        self
    }

    pub fn excluding(mut self, id: impl Into<String>) -> Self {
        self.exclude.insert(id.into());
        self
    }
}

impl From<ModelFilter> for CandidateFilter {
    fn from(models: ModelFilter) -> Self {
        Self {
            models,
            exclude: HashSet::new(),
        }
    }
}

/// A candidate with its composite score.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoredModel {
    pub model: ModelConfig,
    pub score: f64,
    pub error_rate: f64,
}

/// The outcome of [`LoadBalancer::select`]. Holding it keeps the model
/// protected from deletion.
#[derive(Debug)]
pub struct Selection {
    pub model: ModelConfig,
    pub score: f64,
    /// This request is the breaker's half-open trial.
    pub trial: bool,
    lease: SelectionLease,
}

impl Selection {
    pub fn model_id(&self) -> &str {
        self.lease.model_id()
    }

    /// Release the lease and keep the config.
    pub fn into_model(self) -> ModelConfig {
        self.model
    }
}

pub struct LoadBalancer {
    registry: SharedModelRegistry,
    breakers: SharedCircuitBreaker,
    tracker: SharedPerformanceTracker,
    weights: ScoreWeights,
}

impl LoadBalancer {
    pub fn new(
        registry: SharedModelRegistry,
        breakers: SharedCircuitBreaker,
        tracker: SharedPerformanceTracker,
        weights: ScoreWeights,
    ) -> Self {
        Self {
            registry,
            breakers,
            tracker,
            weights,
        }
    }

    pub fn weights(&self) -> &ScoreWeights {
        &self.weights
    }

    /// Enabled, non-excluded models the breaker would currently admit,
    /// paired with their recent error rate. Unordered.
    pub(crate) fn eligible_at(
        &self,
        filter: &CandidateFilter,
        now: DateTime<Utc>,
    ) -> Vec<(ModelConfig, f64)> {
        let mut models = filter.models.clone();
        models.enabled = Some(true);
        self.registry
            .list(&models)
            .into_iter()
            .filter(|m| !filter.exclude.contains(&m.id))
            .filter(|m| self.breakers.is_selectable_at(&m.id, now))
            .map(|m| {
                let error_rate = self
                    .tracker
                    .snapshot_at(&m.id, self.weights.error_window, now)
                    .error_rate;
                (m, error_rate)
            })
            .collect()
    }

    pub fn rank(&self, filter: &CandidateFilter) -> Vec<ScoredModel> {
        self.rank_at(filter, Utc::now())
    }

    /// Eligible candidates, best first: score desc, reliability desc, id asc.
    pub fn rank_at(&self, filter: &CandidateFilter, now: DateTime<Utc>) -> Vec<ScoredModel> {
        let mut ranked: Vec<ScoredModel> = self
            .eligible_at(filter, now)
            .into_iter()
            .map(|(model, error_rate)| ScoredModel {
                score: self.weights.composite(&model, error_rate),
                model,
                error_rate,
            })
            .collect();
        sort_ranked(&mut ranked);
        ranked
    }

    pub fn select(&self, filter: &CandidateFilter) -> RoutingResult<Selection> {
        self.select_with_rng_at(filter, &mut rand::thread_rng(), Utc::now())
    }

    pub fn select_with_rng<R: Rng + ?Sized>(
        &self,
        filter: &CandidateFilter,
        rng: &mut R,
    ) -> RoutingResult<Selection> {
        self.select_with_rng_at(filter, rng, Utc::now())
    }

    pub fn select_with_rng_at<R: Rng + ?Sized>(
        &self,
        filter: &CandidateFilter,
        rng: &mut R,
        now: DateTime<Utc>,
    ) -> RoutingResult<Selection> {
        let mut ranked = self.rank_at(filter, now);
        let mut weights: Vec<f64> = ranked
            .iter()
            .map(|c| self.draw_weight(c, now))
            .collect();
        let considered = ranked.len();

        while !ranked.is_empty() {
            let index = weighted_index(&weights, rng);
            weights.remove(index);
            let candidate = ranked.remove(index);
            let id = candidate.model.id.clone();

            let admission = self.breakers.try_acquire_at(&id, now);
            if !admission.is_admitted() {
                debug!(model_id = %id, "Breaker refused selection, redrawing");
                continue;
            }

            let Some(lease) = self.registry.lease(&id) else {
                debug!(model_id = %id, "Model removed during selection, redrawing");
                continue;
            };

            debug!(
                model_id = %id,
                score = candidate.score,
                trial = admission == Admission::Trial,
                "Model selected"
            );
            return Ok(Selection {
                model: candidate.model,
                score: candidate.score,
                trial: admission == Admission::Trial,
                lease,
            });
        }

        Err(RoutingError::NoAvailableModel(if considered == 0 {
            "no enabled model matches the filter with a closed or probing circuit".to_string()
        } else {
            format!("all {considered} candidate(s) were refused by their circuit breaker")
        }))
    }

    fn draw_weight(&self, candidate: &ScoredModel, now: DateTime<Utc>) -> f64 {
        let score = candidate.score.max(0.0);
        if self.breakers.is_trial_due_at(&candidate.model.id, now) {
            score.max(self.weights.trial_weight)
        } else {
            score
        }
    }
}

pub(crate) fn sort_ranked(ranked: &mut [ScoredModel]) {
    use std::cmp::Ordering;

    ranked.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(Ordering::Equal)
            .then_with(|| {
                b.model
                    .reliability_score
                    .partial_cmp(&a.model.reliability_score)
                    .unwrap_or(Ordering::Equal)
            })
            .then_with(|| a.model.id.cmp(&b.model.id))
    });
}

/// Index drawn with probability proportional to weight. Falls back to the
/// first (best) entry when every weight is zero.
fn weighted_index<R: Rng + ?Sized>(weights: &[f64], rng: &mut R) -> usize {
    let total: f64 = weights.iter().map(|w| w.max(0.0)).sum();
    if total <= 0.0 || !total.is_finite() {
        return 0;
    }
    let mut point = rng.gen::<f64>() * total;
    for (index, weight) in weights.iter().enumerate() {
        let weight = weight.max(0.0);
        if point < weight {
            return index;
        }
        point -= weight;
    }
    weights.len() - 1
}
