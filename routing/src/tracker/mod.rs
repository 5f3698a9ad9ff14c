//! Usage ledger and windowed performance snapshots.
//!
//! Every provider call produces one immutable [`UsageRecord`]. Records are
//! appended to a per-model ledger and only ever removed by retention
//! compaction. A [`PerformanceSnapshot`] is a pure aggregation of the records
//! inside a window; snapshots are cached with a TTL and recomputed from the
//! ledger once stale. Concurrent recomputation for the same key is harmless:
//! the inputs are immutable, so the last writer stores an identical value.
//!
//! # Usage
//!
//! ```rust,ignore
//! let tracker = PerformanceTracker::new(TrackerConfig::default()).shared();
//! tracker.record(UsageRecord::success("gpt-4o", 812, 0.004, 950))?;
//! let week = tracker.snapshot("gpt-4o", Window::Week);
//! println!("{:.1}% errors", week.error_rate * 100.0);
//! ```

mod sink;

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::config::{bounded_secs, MAX_DURATION_SECS};
use crate::error::{RoutingError, RoutingResult};

pub use sink::UsageSink;

/// Aggregation window for snapshots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Window {
    #[serde(rename = "1d")]
    Day,
    #[serde(rename = "7d")]
    Week,
    #[serde(rename = "30d")]
    Month,
}

impl Window {
    pub const ALL: [Window; 3] = [Window::Day, Window::Week, Window::Month];

    pub fn duration(&self) -> Duration {
        match self {
            Self::Day => Duration::days(1),
            Self::Week => Duration::days(7),
            Self::Month => Duration::days(30),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Day => "1d",
            Self::Week => "7d",
            Self::Month => "30d",
        }
    }
}

impl fmt::Display for Window {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Window {
    type Err = RoutingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "1d" => Ok(Self::Day),
            "7d" => Ok(Self::Week),
            "30d" => Ok(Self::Month),
            other => Err(RoutingError::validation(format!(
                "unknown window '{other}', expected 1d, 7d or 30d"
            ))),
        }
    }
}

/// One provider call, as seen by the ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageRecord {
    pub model_id: String,
    pub timestamp: DateTime<Utc>,
    pub tokens: u64,
    pub cost: f64,
    pub latency_ms: u64,
    pub success: bool,
}

impl UsageRecord {
    pub fn success(model_id: impl Into<String>, tokens: u64, cost: f64, latency_ms: u64) -> Self {
        Self {
            model_id: model_id.into(),
            timestamp: Utc::now(),
            tokens,
            cost,
            latency_ms,
            success: true,
        }
    }

    pub fn failure(model_id: impl Into<String>, latency_ms: u64) -> Self {
        Self {
            model_id: model_id.into(),
            timestamp: Utc::now(),
            tokens: 0,
            cost: 0.0,
            latency_ms,
            success: false,
        }
    }

    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    fn validate(&self) -> RoutingResult<()> {
        if self.model_id.trim().is_empty() {
            return Err(RoutingError::validation("usage record without model_id"));
        }
        if !self.cost.is_finite() || self.cost < 0.0 {
            return Err(RoutingError::validation(format!(
                "usage record cost must be a non-negative number, got {}",
                self.cost
            )));
        }
        Ok(())
    }
}

/// Aggregated performance of one model over one window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceSnapshot {
    pub model_id: String,
    pub window: Window,
    pub avg_latency_ms: f64,
    pub error_rate: f64,
    pub total_cost: f64,
    pub total_requests: u64,
    pub total_tokens: u64,
    pub computed_at: DateTime<Utc>,
}

impl PerformanceSnapshot {
    /// Aggregate the records of `model_id` that fall inside
    /// `[computed_at - window, computed_at]`.
    pub fn from_records<'a>(
        model_id: &str,
        window: Window,
        records: impl IntoIterator<Item = &'a UsageRecord>,
        computed_at: DateTime<Utc>,
    ) -> Self {
        let start = computed_at - window.duration();
        let mut total_requests = 0u64;
        let mut failures = 0u64;
        let mut latency_sum = 0u128;
        let mut total_cost = 0.0;
        let mut total_tokens = 0u64;

        for record in records.into_iter().filter(|r| {
            r.model_id == model_id && r.timestamp >= start && r.timestamp <= computed_at
        }) {
            total_requests += 1;
            if !record.success {
                failures += 1;
            }
            latency_sum += u128::from(record.latency_ms);
            total_cost += record.cost;
            total_tokens = total_tokens.saturating_add(record.tokens);
        }

        let (avg_latency_ms, error_rate) = if total_requests == 0 {
            (0.0, 0.0)
        } else {
            (
                latency_sum as f64 / total_requests as f64,
                failures as f64 / total_requests as f64,
            )
        };

        Self {
            model_id: model_id.to_string(),
            window,
            avg_latency_ms,
            error_rate,
            total_cost,
            total_requests,
            total_tokens,
            computed_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    /// How long a cached snapshot stays fresh.
    pub snapshot_ttl_secs: u64,
    /// Records older than this are removed by compaction.
    pub retention_days: u64,
    /// Capacity of the fire-and-forget usage buffer.
    pub buffer_capacity: usize,
    /// Period of the background sweep (cache eviction and compaction).
    pub sweep_interval_secs: u64,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            snapshot_ttl_secs: 3_600,
            retention_days: 30,
            buffer_capacity: 4_096,
            sweep_interval_secs: 300,
        }
    }
}

impl TrackerConfig {
    fn ttl(&self) -> Duration {
        bounded_secs(self.snapshot_ttl_secs)
    }

    fn retention(&self) -> Duration {
        bounded_secs(self.retention_days.saturating_mul(86_400))
    }
}

/// Shared reference to PerformanceTracker
pub type SharedPerformanceTracker = Arc<PerformanceTracker>;

pub struct PerformanceTracker {
    config: TrackerConfig,
    ledger: DashMap<String, Vec<UsageRecord>>,
    cache: DashMap<(String, Window), PerformanceSnapshot>,
}

impl PerformanceTracker {
    pub fn new(config: TrackerConfig) -> Self {
        Self {
            config,
            ledger: DashMap::new(),
            cache: DashMap::new(),
        }
    }

    pub fn shared(self) -> SharedPerformanceTracker {
        Arc::new(self)
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    /// Append a record. Only structural validation applies.
    pub fn record(&self, record: UsageRecord) -> RoutingResult<()> {
        record.validate()?;
        self.ledger
            .entry(record.model_id.clone())
            .or_default()
            .push(record);
        Ok(())
    }

    pub fn record_count(&self, model_id: &str) -> usize {
        self.ledger.get(model_id).map_or(0, |r| r.len())
    }

    pub fn snapshot(&self, model_id: &str, window: Window) -> PerformanceSnapshot {
        self.snapshot_at(model_id, window, Utc::now())
    }

    /// Cached snapshot if younger than the TTL, otherwise a fresh aggregation.
    pub fn snapshot_at(
        &self,
        model_id: &str,
        window: Window,
        now: DateTime<Utc>,
    ) -> PerformanceSnapshot {
        let key = (model_id.to_string(), window);
        if let Some(cached) = self.cache.get(&key) {
            if now - cached.computed_at < self.config.ttl() && cached.computed_at <= now {
                return cached.clone();
            }
        }
        let snapshot = self.compute_at(model_id, window, now);
        self.cache.insert(key, snapshot.clone());
        snapshot
    }

    /// Aggregate straight from the ledger, bypassing the cache.
    pub fn compute_at(
        &self,
        model_id: &str,
        window: Window,
        now: DateTime<Utc>,
    ) -> PerformanceSnapshot {
        match self.ledger.get(model_id) {
            Some(records) => PerformanceSnapshot::from_records(model_id, window, records.iter(), now),
            None => PerformanceSnapshot::from_records(model_id, window, std::iter::empty(), now),
        }
    }

    /// Drop cached snapshots for one model.
    pub fn invalidate(&self, model_id: &str) {
        for window in Window::ALL {
            self.cache.remove(&(model_id.to_string(), window));
        }
    }

    /// Evict cache entries past their TTL. Returns the number evicted.
    pub fn sweep_expired_at(&self, now: DateTime<Utc>) -> usize {
        let ttl = self.config.ttl();
        let before = self.cache.len();
        self.cache.retain(|_, snap| now - snap.computed_at < ttl);
        before - self.cache.len()
    }

    /// Retention: remove records older than the horizon. Returns the number
    /// removed.
    pub fn compact_at(&self, now: DateTime<Utc>) -> usize {
        let horizon = now - self.config.retention();
        let mut removed = 0;
        for mut entry in self.ledger.iter_mut() {
            let before = entry.len();
            entry.retain(|r| r.timestamp >= horizon);
            removed += before - entry.len();
        }
        self.ledger.retain(|_, records| !records.is_empty());
        removed
    }

    /// Periodic cache sweep and ledger compaction.
    pub fn spawn_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let tracker = Arc::clone(self);
        let period = StdDuration::from_secs(self.config.sweep_interval_secs.clamp(1, MAX_DURATION_SECS));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let now = Utc::now();
                let evicted = tracker.sweep_expired_at(now);
                let compacted = tracker.compact_at(now);
                debug!(evicted, compacted, "Performance tracker sweep");
            }
        })
    }
}

impl Default for PerformanceTracker {
    fn default() -> Self {
        Self::new(TrackerConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t0() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-03-01T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    fn seeded() -> PerformanceTracker {
        let tracker = PerformanceTracker::default();
        let now = t0();
        tracker
            .record(UsageRecord::success("m", 100, 0.5, 200).at(now - Duration::hours(1)))
            .unwrap();
        tracker
            .record(UsageRecord::success("m", 300, 1.5, 400).at(now - Duration::hours(2)))
            .unwrap();
        tracker
            .record(UsageRecord::failure("m", 900).at(now - Duration::hours(3)))
            .unwrap();
        tracker
            .record(UsageRecord::failure("m", 50).at(now - Duration::days(3)))
            .unwrap();
        tracker
    }

    #[test]
    fn test_window_parse() {
        assert_eq!("7d".parse::<Window>().unwrap(), Window::Week);
        assert!(matches!(
            "2w".parse::<Window>(),
            Err(RoutingError::Validation(_))
        ));
        assert_eq!(serde_json::to_string(&Window::Month).unwrap(), "\"30d\"");
    }

    #[test]
    fn test_snapshot_aggregates_window() {
        let tracker = seeded();
        let day = tracker.snapshot_at("m", Window::Day, t0());
        assert_eq!(day.total_requests, 3);
        assert!((day.avg_latency_ms - 500.0).abs() < 1e-9);
        assert!((day.error_rate - 1.0 / 3.0).abs() < 1e-9);
        assert!((day.total_cost - 2.0).abs() < 1e-9);
        assert_eq!(day.total_tokens, 400);

        let week = tracker.snapshot_at("m", Window::Week, t0());
        assert_eq!(week.total_requests, 4);
        assert!((week.error_rate - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_empty_window_is_zeroed() {
        let tracker = PerformanceTracker::default();
        let snap = tracker.snapshot_at("unknown", Window::Day, t0());
        assert_eq!(snap.total_requests, 0);
        assert_eq!(snap.error_rate, 0.0);
        assert_eq!(snap.avg_latency_ms, 0.0);
        assert_eq!(snap.total_cost, 0.0);
    }

    #[test]
    fn test_snapshot_is_deterministic() {
        let tracker = seeded();
        let a = tracker.compute_at("m", Window::Week, t0());
        let b = tracker.compute_at("m", Window::Week, t0());
        assert_eq!(a, b);
    }

    #[test]
    fn test_cached_snapshot_served_within_ttl() {
        let tracker = seeded();
        let first = tracker.snapshot_at("m", Window::Day, t0());
        tracker
            .record(UsageRecord::failure("m", 10).at(t0()))
            .unwrap();

        let cached = tracker.snapshot_at("m", Window::Day, t0() + Duration::minutes(30));
        assert_eq!(cached, first);

        let refreshed = tracker.snapshot_at("m", Window::Day, t0() + Duration::minutes(61));
        assert_eq!(refreshed.total_requests, 4);
    }

    #[test]
    fn test_invalidate_forces_recompute() {
        let tracker = seeded();
        tracker.snapshot_at("m", Window::Day, t0());
        tracker.record(UsageRecord::failure("m", 10).at(t0())).unwrap();
        tracker.invalidate("m");
        assert_eq!(tracker.snapshot_at("m", Window::Day, t0()).total_requests, 4);
    }

    #[test]
    fn test_record_rejects_malformed() {
        let tracker = PerformanceTracker::default();
        assert!(tracker.record(UsageRecord::success("", 1, 0.0, 1)).is_err());
        assert!(tracker.record(UsageRecord::success("m", 1, -1.0, 1)).is_err());
        assert!(tracker
            .record(UsageRecord::success("m", 1, f64::NAN, 1))
            .is_err());
        assert_eq!(tracker.record_count("m"), 0);
    }

    #[test]
    fn test_sweep_evicts_stale_cache() {
        let tracker = seeded();
        tracker.snapshot_at("m", Window::Day, t0());
        tracker.snapshot_at("m", Window::Week, t0());
        assert_eq!(tracker.sweep_expired_at(t0() + Duration::minutes(10)), 0);
        assert_eq!(tracker.sweep_expired_at(t0() + Duration::hours(2)), 2);
    }

    #[test]
    fn test_compact_applies_retention() {
        let tracker = seeded();
        tracker
            .record(UsageRecord::success("old", 1, 0.0, 1).at(t0() - Duration::days(45)))
            .unwrap();
        let removed = tracker.compact_at(t0());
        assert_eq!(removed, 1);
        assert_eq!(tracker.record_count("old"), 0);
        assert_eq!(tracker.record_count("m"), 4);
    }

    #[test]
    fn test_unbounded_ttl_and_retention_do_not_overflow() {
        let tracker = PerformanceTracker::new(TrackerConfig {
            snapshot_ttl_secs: u64::MAX,
            retention_days: u64::MAX,
            ..TrackerConfig::default()
        });
        tracker
            .record(UsageRecord::success("m", 1, 0.0, 1).at(t0() - Duration::days(400)))
            .unwrap();
        assert_eq!(tracker.snapshot_at("m", Window::Month, t0()).total_requests, 0);
        assert_eq!(tracker.sweep_expired_at(t0() + Duration::days(30)), 0);
        assert_eq!(tracker.compact_at(t0()), 0);
        assert_eq!(tracker.record_count("m"), 1);
    }
}
