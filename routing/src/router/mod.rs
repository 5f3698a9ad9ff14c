//! Model Router Module
//!
//! Picks a backend for each request from the registry's enabled models.
//!
//! # Selection Pipeline
//!
//! ```text
//! Stage            | Component             | Drops / orders by
//! -----------------|-----------------------|-------------------------------
//! Candidates       | ModelRegistry::list   | disabled, filter mismatch
//! Health           | CircuitBreaker        | OPEN, HALF_OPEN with live trial
//! Scoring          | ScoreWeights          | attributes x (1 - error rate)
//! Choice (select)  | LoadBalancer          | weighted random draw
//! Choice (advise)  | RecommendationEngine  | request-weighted rank
//! ```

pub mod balancer;
pub mod circuit_breaker;
pub mod recommend;
pub mod scoring;

pub use balancer::{CandidateFilter, LoadBalancer, ScoredModel, Selection};
pub use circuit_breaker::{
    Admission, CircuitBreaker, CircuitBreakerConfig, CircuitState, CircuitStatus,
    SharedCircuitBreaker,
};
pub use recommend::{
    BudgetEmphasis, Level, RecommendationConfig, RecommendationEngine, RecommendationRequest,
    RecommendationResult, RunnerUp,
};
pub use scoring::ScoreWeights;
