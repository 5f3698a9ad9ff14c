//! Per-model circuit breakers.
//!
//! Each model gets its own breaker, created lazily on the first reported
//! failure. A breaker *opens* once `failure_threshold` consecutive failures
//! land inside the rolling window; the model is then skipped by routing.
//! When the cooldown expires, the next selection attempt moves the breaker
//! to *half-open* and admits exactly one trial request. A successful trial
//! closes the breaker; a failed trial re-opens it with the cooldown doubled,
//! up to `max_cooldown_secs`.
//!
//! ```text
//!            failures >= threshold             now >= next_probe_at
//!  Closed ───────────────────────────▶ Open ───────────────────────▶ HalfOpen
//!    ▲                                   ▲    (on selection attempt)     │
//!    │                                   └──── trial failed, cooldown×2 ─┤
//!    └────────────────────────────────────────── trial succeeded ───────┘
//! ```
//!
//! State for one model lives behind its own mutex, so reports for different
//! models never contend.

use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::bounded_secs;
use crate::events::{RoutingEvent, SharedEventBus};

/// Circuit breaker state for a single model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitStatus {
    /// Healthy: requests allowed.
    Closed,
    /// Tripped: requests blocked until cooldown expires.
    Open,
    /// Cooldown expired: one trial request allowed.
    HalfOpen,
}

impl std::fmt::Display for CircuitStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half_open"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before the circuit opens.
    pub failure_threshold: u32,
    /// Failures further apart than this start a new streak.
    pub failure_window_secs: u64,
    /// Initial Open → HalfOpen cooldown.
    pub cooldown_secs: u64,
    /// Upper bound for the doubled cooldown.
    pub max_cooldown_secs: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            failure_window_secs: 60,
            cooldown_secs: 30,
            max_cooldown_secs: 600,
        }
    }
}

/// Snapshot of one model's breaker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitState {
    pub status: CircuitStatus,
    pub consecutive_failures: u32,
    pub opened_at: Option<DateTime<Utc>>,
    pub next_probe_at: Option<DateTime<Utc>>,
    /// Cooldown applied the last time the breaker opened.
    pub cooldown_secs: u64,
    /// First failure of the current streak.
    pub streak_started_at: Option<DateTime<Utc>>,
    /// When the outstanding half-open trial was admitted.
    pub trial_started_at: Option<DateTime<Utc>>,
}

impl CircuitState {
    fn closed(config: &CircuitBreakerConfig) -> Self {
        Self {
            status: CircuitStatus::Closed,
            consecutive_failures: 0,
            opened_at: None,
            next_probe_at: None,
            cooldown_secs: config.cooldown_secs,
            streak_started_at: None,
            trial_started_at: None,
        }
    }

    /// A trial admitted more than one cooldown ago is treated as abandoned.
    fn trial_outstanding(&self, now: DateTime<Utc>) -> bool {
        self.trial_started_at
            .is_some_and(|t| now < t + bounded_secs(self.cooldown_secs))
    }

    fn selectable(&self, now: DateTime<Utc>) -> bool {
        match self.status {
            CircuitStatus::Closed => true,
            CircuitStatus::Open => self.next_probe_at.is_some_and(|t| now >= t),
            CircuitStatus::HalfOpen => !self.trial_outstanding(now),
        }
    }
}

/// Outcome of asking the breaker whether a request may go through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Circuit closed; no restriction.
    Allowed,
    /// The single half-open trial was granted to this caller.
    Trial,
    /// Circuit open, or a trial is already outstanding.
    Rejected { retry_at: Option<DateTime<Utc>> },
}

impl Admission {
    pub fn is_admitted(&self) -> bool {
        !matches!(self, Self::Rejected { .. })
    }
}

/// Shared reference to CircuitBreaker
pub type SharedCircuitBreaker = Arc<CircuitBreaker>;

pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    states: DashMap<String, Arc<Mutex<CircuitState>>>,
    events: Option<SharedEventBus>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            states: DashMap::new(),
            events: None,
        }
    }

    pub fn with_events(mut self, events: SharedEventBus) -> Self {
        self.events = Some(events);
        self
    }

    pub fn shared(self) -> SharedCircuitBreaker {
        Arc::new(self)
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    fn slot(&self, model_id: &str) -> Option<Arc<Mutex<CircuitState>>> {
        self.states.get(model_id).map(|s| Arc::clone(s.value()))
    }

    fn slot_or_create(&self, model_id: &str) -> Arc<Mutex<CircuitState>> {
        let entry = self
            .states
            .entry(model_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(CircuitState::closed(&self.config))));
        Arc::clone(entry.value())
    }

    pub fn record_success(&self, model_id: &str) {
        self.record_success_at(model_id, Utc::now());
    }

    /// Record a success. Closes a half-open breaker; on a closed breaker it
    /// only resets the failure streak.
    pub fn record_success_at(&self, model_id: &str, now: DateTime<Utc>) {
        let Some(slot) = self.slot(model_id) else {
            return;
        };
        let mut state = slot.lock().unwrap_or_else(PoisonError::into_inner);
        match state.status {
            CircuitStatus::Closed => {
                state.consecutive_failures = 0;
                state.streak_started_at = None;
            }
            CircuitStatus::HalfOpen => {
                let failures = state.consecutive_failures;
                *state = CircuitState::closed(&self.config);
                self.announce(model_id, CircuitStatus::HalfOpen, CircuitStatus::Closed, failures, now);
            }
            CircuitStatus::Open => {
                // Late outcome of a call admitted before the breaker opened.
                debug!(model_id, "Ignoring success reported while circuit is open");
            }
        }
    }

    pub fn record_failure(&self, model_id: &str) -> CircuitStatus {
        self.record_failure_at(model_id, Utc::now())
    }

    /// Record a failure and return the resulting status.
    pub fn record_failure_at(&self, model_id: &str, now: DateTime<Utc>) -> CircuitStatus {
        let slot = self.slot_or_create(model_id);
        let mut state = slot.lock().unwrap_or_else(PoisonError::into_inner);
        match state.status {
            CircuitStatus::Closed => {
                let window = bounded_secs(self.config.failure_window_secs);
                match state.streak_started_at {
                    Some(start) if now - start <= window => {}
                    _ => {
                        state.consecutive_failures = 0;
                        state.streak_started_at = Some(now);
                    }
                }
                state.consecutive_failures += 1;
                if state.consecutive_failures >= self.config.failure_threshold {
                    let cooldown = self.config.cooldown_secs;
                    self.open(model_id, &mut state, cooldown, CircuitStatus::Closed, now);
                }
            }
            CircuitStatus::HalfOpen => {
                state.consecutive_failures += 1;
                let cooldown = state
                    .cooldown_secs
                    .saturating_mul(2)
                    .min(self.config.max_cooldown_secs);
                self.open(model_id, &mut state, cooldown, CircuitStatus::HalfOpen, now);
            }
            CircuitStatus::Open => {
                state.consecutive_failures += 1;
            }
        }
        state.status
    }

    fn open(
        &self,
        model_id: &str,
        state: &mut CircuitState,
        cooldown_secs: u64,
        from: CircuitStatus,
        now: DateTime<Utc>,
    ) {
        state.status = CircuitStatus::Open;
        state.opened_at = Some(now);
        state.cooldown_secs = cooldown_secs;
        state.next_probe_at = Some(now + bounded_secs(cooldown_secs));
        state.trial_started_at = None;
        state.streak_started_at = None;
        self.announce(model_id, from, CircuitStatus::Open, state.consecutive_failures, now);
    }

    pub fn try_acquire(&self, model_id: &str) -> Admission {
        self.try_acquire_at(model_id, Utc::now())
    }

    /// Ask to send a request to `model_id`. An open breaker whose cooldown
    /// has elapsed moves to half-open here and hands out its single trial.
    pub fn try_acquire_at(&self, model_id: &str, now: DateTime<Utc>) -> Admission {
        let Some(slot) = self.slot(model_id) else {
            return Admission::Allowed;
        };
        let mut state = slot.lock().unwrap_or_else(PoisonError::into_inner);
        match state.status {
            CircuitStatus::Closed => Admission::Allowed,
            CircuitStatus::Open => match state.next_probe_at {
                Some(due) if now >= due => {
                    state.status = CircuitStatus::HalfOpen;
                    state.trial_started_at = Some(now);
                    let failures = state.consecutive_failures;
                    self.announce(model_id, CircuitStatus::Open, CircuitStatus::HalfOpen, failures, now);
                    Admission::Trial
                }
                retry_at => Admission::Rejected { retry_at },
            },
            CircuitStatus::HalfOpen => {
                if state.trial_outstanding(now) {
                    Admission::Rejected { retry_at: None }
                } else {
                    state.trial_started_at = Some(now);
                    Admission::Trial
                }
            }
        }
    }

    /// Whether a selection attempt could currently be admitted. Read-only.
    pub fn is_selectable_at(&self, model_id: &str, now: DateTime<Utc>) -> bool {
        self.slot(model_id).map_or(true, |slot| {
            slot.lock()
                .unwrap_or_else(PoisonError::into_inner)
                .selectable(now)
        })
    }

    /// Whether `model_id` is recovering and its next admission would be the
    /// half-open trial. Read-only.
    pub fn is_trial_due_at(&self, model_id: &str, now: DateTime<Utc>) -> bool {
        self.slot(model_id).is_some_and(|slot| {
            let state = slot.lock().unwrap_or_else(PoisonError::into_inner);
            state.status != CircuitStatus::Closed && state.selectable(now)
        })
    }

    pub fn status(&self, model_id: &str) -> CircuitStatus {
        self.state(model_id)
            .map_or(CircuitStatus::Closed, |s| s.status)
    }

    pub fn state(&self, model_id: &str) -> Option<CircuitState> {
        self.slot(model_id)
            .map(|slot| slot.lock().unwrap_or_else(PoisonError::into_inner).clone())
    }

    /// Every tracked breaker, ordered by model id.
    pub fn states(&self) -> Vec<(String, CircuitState)> {
        let slots: Vec<(String, Arc<Mutex<CircuitState>>)> = self
            .states
            .iter()
            .map(|e| (e.key().clone(), Arc::clone(e.value())))
            .collect();
        let mut out: Vec<(String, CircuitState)> = slots
            .into_iter()
            .map(|(id, slot)| {
                let state = slot.lock().unwrap_or_else(PoisonError::into_inner).clone();
                (id, state)
            })
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    /// Drop the breaker for a deleted model.
    pub fn remove(&self, model_id: &str) -> Option<CircuitState> {
        self.states.remove(model_id).map(|(_, slot)| {
            slot.lock().unwrap_or_else(PoisonError::into_inner).clone()
        })
    }

    fn announce(
        &self,
        model_id: &str,
        from: CircuitStatus,
        to: CircuitStatus,
        consecutive_failures: u32,
        now: DateTime<Utc>,
    ) {
        match to {
            CircuitStatus::Open => {
                warn!(model_id, %from, consecutive_failures, "Circuit opened")
            }
            CircuitStatus::HalfOpen => info!(model_id, "Circuit half-open, admitting trial"),
            CircuitStatus::Closed => info!(model_id, "Circuit closed"),
        }
        if let Some(bus) = &self.events {
            bus.publish(RoutingEvent::CircuitTransition {
                model_id: model_id.to_string(),
                from,
                to,
                consecutive_failures,
                timestamp: now,
            });
        }
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}
