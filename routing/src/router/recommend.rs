//! Context-aware recommendation.
//!
//! Ranks the balancer's eligible candidates with request-specific weights:
//! `budget_level` trades cost efficiency against quality, the quality and
//! speed requirements scale their own dimensions. With a low budget and a
//! low quality requirement the engine switches to economy mode and ranks by
//! projected monthly spend instead.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::balancer::{CandidateFilter, LoadBalancer};
use super::scoring::ScoreWeights;
use crate::error::{RoutingError, RoutingResult};
use crate::registry::{ModelConfig, ModelFilter};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Level {
    Low,
    #[default]
    Medium,
    High,
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Low => write!(f, "low"),
            Self::Medium => write!(f, "medium"),
            Self::High => write!(f, "high"),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RecommendationRequest {
    /// How strongly cost drives the choice.
    pub budget_level: Level,
    pub quality_requirement: Level,
    pub speed_requirement: Level,
    /// Treated as a required capability tag when present.
    pub task_type: Option<String>,
    pub expected_tokens: u64,
    pub expected_monthly_requests: u64,
    pub required_capabilities: Vec<String>,
    /// Overrides [`RecommendationConfig::min_reliability`].
    pub min_reliability: Option<f64>,
}

impl RecommendationRequest {
    fn validate(&self) -> RoutingResult<()> {
        if let Some(min) = self.min_reliability {
            if !min.is_finite() || !(0.0..=1.0).contains(&min) {
                return Err(RoutingError::validation(format!(
                    "'min_reliability' must be within [0, 1], got {min}"
                )));
            }
        }
        if matches!(&self.task_type, Some(t) if t.trim().is_empty()) {
            return Err(RoutingError::validation("'task_type' must not be blank"));
        }
        Ok(())
    }

    fn is_economy(&self) -> bool {
        self.budget_level == Level::Low && self.quality_requirement == Level::Low
    }

    fn monthly_tokens(&self) -> u64 {
        self.expected_tokens
            .saturating_mul(self.expected_monthly_requests)
    }

    fn candidate_filter(&self) -> CandidateFilter {
        let mut models = ModelFilter::enabled_only();
        models.capabilities = self.required_capabilities.clone();
        if let Some(task) = &self.task_type {
            if !models.capabilities.contains(task) {
                models.capabilities.push(task.clone());
            }
        }
        CandidateFilter::from(models)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunnerUp {
    pub model_id: String,
    pub display_name: String,
    pub score: f64,
    pub estimated_cost: f64,
    /// Comparison against the winner, e.g. "lower cost, comparable quality".
    pub reasoning: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecommendationResult {
    pub model_id: String,
    pub display_name: String,
    pub score: f64,
    pub confidence: f64,
    pub estimated_cost: f64,
    pub reasoning: String,
    pub economy_mode: bool,
    pub runner_ups: Vec<RunnerUp>,
}

/// Cost and quality multipliers applied for one budget level.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BudgetEmphasis {
    pub cost: f64,
    pub quality: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecommendationConfig {
    pub budget_low: BudgetEmphasis,
    pub budget_medium: BudgetEmphasis,
    pub budget_high: BudgetEmphasis,
    /// Multipliers for quality and speed requirements.
    pub requirement_low: f64,
    pub requirement_medium: f64,
    pub requirement_high: f64,
    /// Floor applied when a request does not set its own.
    pub min_reliability: f64,
    pub max_runner_ups: usize,
    /// Attribute differences up to this are reported as "comparable".
    pub comparable_margin: f64,
}

impl Default for RecommendationConfig {
    fn default() -> Self {
        Self {
            budget_low: BudgetEmphasis {
                cost: 1.0,
                quality: 1.0,
            },
            budget_medium: BudgetEmphasis {
                cost: 1.25,
                quality: 0.9,
            },
            budget_high: BudgetEmphasis {
                cost: 2.0,
                quality: 0.7,
            },
            requirement_low: 0.5,
            requirement_medium: 1.0,
            requirement_high: 1.75,
            min_reliability: 0.0,
            max_runner_ups: 3,
            comparable_margin: 0.05,
        }
    }
}

impl RecommendationConfig {
    pub fn validate(&self) -> RoutingResult<()> {
        let multipliers = [
            ("budget_low.cost", self.budget_low.cost),
            ("budget_low.quality", self.budget_low.quality),
            ("budget_medium.cost", self.budget_medium.cost),
            ("budget_medium.quality", self.budget_medium.quality),
            ("budget_high.cost", self.budget_high.cost),
            ("budget_high.quality", self.budget_high.quality),
            ("requirement_low", self.requirement_low),
            ("requirement_medium", self.requirement_medium),
            ("requirement_high", self.requirement_high),
            ("comparable_margin", self.comparable_margin),
        ];
        for (field, value) in multipliers {
            if !value.is_finite() || value < 0.0 {
                return Err(RoutingError::validation(format!(
                    "recommendation '{field}' must be a non-negative number, got {value}"
                )));
            }
        }
        if !(0.0..=1.0).contains(&self.min_reliability) {
            return Err(RoutingError::validation(
                "recommendation 'min_reliability' must be within [0, 1]",
            ));
        }
        Ok(())
    }

    fn budget(&self, level: Level) -> BudgetEmphasis {
        match level {
            Level::Low => self.budget_low,
            Level::Medium => self.budget_medium,
            Level::High => self.budget_high,
        }
    }

    fn requirement(&self, level: Level) -> f64 {
        match level {
            Level::Low => self.requirement_low,
            Level::Medium => self.requirement_medium,
            Level::High => self.requirement_high,
        }
    }

    /// Base weights reshaped for one request.
    pub fn weights_for(&self, base: &ScoreWeights, request: &RecommendationRequest) -> ScoreWeights {
        let budget = self.budget(request.budget_level);
        base.emphasize(
            budget.quality * self.requirement(request.quality_requirement),
            self.requirement(request.speed_requirement),
            budget.cost,
        )
    }
}

#[derive(Debug, Clone)]
struct Ranked {
    model: ModelConfig,
    score: f64,
    estimated_cost: f64,
}

pub struct RecommendationEngine {
    balancer: Arc<LoadBalancer>,
    config: RecommendationConfig,
}

impl RecommendationEngine {
    pub fn new(balancer: Arc<LoadBalancer>, config: RecommendationConfig) -> Self {
        Self { balancer, config }
    }

    pub fn config(&self) -> &RecommendationConfig {
        &self.config
    }

    pub fn recommend(&self, request: &RecommendationRequest) -> RoutingResult<RecommendationResult> {
        self.recommend_at(request, Utc::now())
    }

    pub fn recommend_at(
        &self,
        request: &RecommendationRequest,
        now: DateTime<Utc>,
    ) -> RoutingResult<RecommendationResult> {
        request.validate()?;
        let filter = request.candidate_filter();
        let min_reliability = request
            .min_reliability
            .unwrap_or(self.config.min_reliability);
        let weights = self.config.weights_for(self.balancer.weights(), request);
        let tokens = request.monthly_tokens();

        let mut ranked: Vec<Ranked> = self
            .balancer
            .eligible_at(&filter, now)
            .into_iter()
            .filter(|(m, _)| m.reliability_score >= min_reliability)
            .map(|(model, error_rate)| Ranked {
                score: weights.composite(&model, error_rate),
                estimated_cost: model.cost_for_tokens(tokens),
                model,
            })
            .collect();

        if ranked.is_empty() {
            return Err(RoutingError::NoMatch(format!(
                "no available model has capabilities [{}] with reliability >= {min_reliability}",
                filter.models.capabilities.join(", ")
            )));
        }

        let economy = request.is_economy();
        sort_for_request(&mut ranked, economy);

        let winner = &ranked[0];
        let confidence = confidence(winner, ranked.get(1), economy);
        let runner_ups = ranked
            .iter()
            .skip(1)
            .take(self.config.max_runner_ups)
            .map(|c| RunnerUp {
                model_id: c.model.id.clone(),
                display_name: c.model.display_name.clone(),
                score: c.score,
                estimated_cost: c.estimated_cost,
                reasoning: self.compare(c, winner, tokens),
            })
            .collect();

        let reasoning = if economy {
            format!(
                "lowest estimated cost ({:.4}) among {} eligible model(s)",
                winner.estimated_cost,
                ranked.len()
            )
        } else {
            format!(
                "highest score ({:.3}) for budget={}, quality={}, speed={} among {} eligible model(s)",
                winner.score,
                request.budget_level,
                request.quality_requirement,
                request.speed_requirement,
                ranked.len()
            )
        };

        debug!(
            model_id = %winner.model.id,
            score = winner.score,
            confidence,
            economy,
            candidates = ranked.len(),
            "Recommendation computed"
        );

        Ok(RecommendationResult {
            model_id: winner.model.id.clone(),
            display_name: winner.model.display_name.clone(),
            score: winner.score,
            confidence,
            estimated_cost: winner.estimated_cost,
            reasoning,
            economy_mode: economy,
            runner_ups,
        })
    }

    /// Describe `candidate` relative to `winner`.
    fn compare(&self, candidate: &Ranked, winner: &Ranked, tokens: u64) -> String {
        let margin = self.config.comparable_margin;
        let a = &candidate.model;
        let b = &winner.model;

        let cost = if tokens > 0 && (candidate.estimated_cost > 0.0 || winner.estimated_cost > 0.0) {
            let scale = candidate.estimated_cost.max(winner.estimated_cost);
            let diff = (candidate.estimated_cost - winner.estimated_cost) / scale;
            describe(-diff, margin, "lower cost", "higher cost", "comparable cost")
        } else {
            describe(
                a.cost_efficiency - b.cost_efficiency,
                margin,
                "lower cost",
                "higher cost",
                "comparable cost",
            )
        };
        let quality = describe(
            a.quality_score - b.quality_score,
            margin,
            "higher quality",
            "lower quality",
            "comparable quality",
        );
        let speed = describe(
            a.speed_score - b.speed_score,
            margin,
            "faster",
            "slower",
            "comparable speed",
        );
        format!("{cost}, {quality}, {speed}")
    }
}

fn describe(
    diff: f64,
    margin: f64,
    better: &'static str,
    worse: &'static str,
    same: &'static str,
) -> &'static str {
    if diff > margin {
        better
    } else if diff < -margin {
        worse
    } else {
        same
    }
}

fn sort_for_request(ranked: &mut [Ranked], economy: bool) {
    use std::cmp::Ordering;

    let desc = |a: f64, b: f64| b.partial_cmp(&a).unwrap_or(Ordering::Equal);
    ranked.sort_by(|a, b| {
        let by_score = || {
            desc(a.score, b.score)
                .then_with(|| desc(a.model.reliability_score, b.model.reliability_score))
                .then_with(|| a.model.id.cmp(&b.model.id))
        };
        if economy {
            a.estimated_cost
                .partial_cmp(&b.estimated_cost)
                .unwrap_or(Ordering::Equal)
                .then_with(by_score)
        } else {
            by_score()
        }
    });
}

/// 0.5 plus the winner's relative margin over the runner-up, in [0, 1].
/// A sole candidate is a certain pick.
fn confidence(winner: &Ranked, runner_up: Option<&Ranked>, economy: bool) -> f64 {
    let Some(runner_up) = runner_up else {
        return 1.0;
    };
    let margin = if economy {
        if runner_up.estimated_cost > 0.0 {
            (runner_up.estimated_cost - winner.estimated_cost) / runner_up.estimated_cost
        } else {
            0.0
        }
    } else if winner.score > 0.0 {
        (winner.score - runner_up.score) / winner.score
    } else {
        0.0
    };
    (0.5 + margin).clamp(0.0, 1.0)
}
