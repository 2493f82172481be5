//! # Adaptive Rate Limit Controller
//!
//! Periodically re-derives limits from observed traffic and system health.
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────┐
//! │                      AdaptiveController                        │
//! ├────────────────────────────────────────────────────────────────┤
//! │                                                                │
//! │  hot path ──► per-key event ring (≤10 000, O(1) ingest)        │
//! │                                                                │
//! │  evaluator tick (default every 5 min), per active key:         │
//! │    1. manual override present? → report, touch nothing         │
//! │    2. derive traffic pattern  (trend, volatility, seasonality) │
//! │    3. read system health      (CPU, P95, error rate, Redis)    │
//! │    4. score anomaly           (z vs rolling baseline)          │
//! │    5. first matching rule wins:                                │
//! │         CPU>0.8 ∨ P95>2s          → ×0.7  conf 0.85            │
//! │         anomaly CRITICAL          → ×0.6  conf 0.90            │
//! │         anomaly HIGH/MEDIUM       → ×0.8  conf 0.75            │
//! │         CPU<0.3 ∧ err<0.1% ∧ calm → ×1.3  conf 0.75            │
//! │         CPU<0.5 ∧ err<0.5% ∧ calm → ×1.1  conf 0.65            │
//! │    6. confidence gate, then clamp to                           │
//! │         [orig/F, orig·F] ∩ [min_capacity, max_capacity]        │
//! │                                                                │
//! └────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The controller owns its state; the resolver reads it through the
//! read-only accessors and never the other way around, which keeps the
//! dependency between the two one-directional.

use crate::error::{Error, Result};
use crate::limits::RateLimitConfig;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

/// Hard bound on the per-key event ring.
pub const RING_CAPACITY: usize = 10_000;

/// Points of per-second rate history feeding the anomaly baseline.
const BASELINE_POINTS: usize = 1_000;

/// Points of recent history compared against the baseline.
const CURRENT_POINTS: usize = 10;

/// Baseline points required before anomaly scoring says anything.
const MIN_BASELINE_POINTS: usize = 30;

/// Events required before a key leaves LEARNING mode.
const MIN_EVENTS_FOR_ADAPTATION: usize = 100;

/// Tunables for the controller, part of the service configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdaptiveParams {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "default_evaluation_interval_ms")]
    pub evaluation_interval_ms: u64,
    #[serde(default = "default_min_confidence")]
    pub min_confidence_threshold: f64,
    #[serde(default = "default_max_adjustment_factor")]
    pub max_adjustment_factor: f64,
    #[serde(default = "default_min_capacity")]
    pub min_capacity: u64,
    #[serde(default = "default_max_capacity")]
    pub max_capacity: u64,
}

fn default_enabled() -> bool {
    true
}
fn default_evaluation_interval_ms() -> u64 {
    300_000
}
fn default_min_confidence() -> f64 {
    0.7
}
fn default_max_adjustment_factor() -> f64 {
    2.0
}
fn default_min_capacity() -> u64 {
    1
}
fn default_max_capacity() -> u64 {
    crate::limits::MAX_CAPACITY
}

impl Default for AdaptiveParams {
    fn default() -> Self {
        Self {
            enabled: true,
            evaluation_interval_ms: default_evaluation_interval_ms(),
            min_confidence_threshold: default_min_confidence(),
            max_adjustment_factor: default_max_adjustment_factor(),
            min_capacity: default_min_capacity(),
            max_capacity: default_max_capacity(),
        }
    }
}

/// One observed check, as ingested by the hot path.
#[derive(Debug, Clone, Copy)]
pub struct TrafficEvent {
    pub at_ms: i64,
    pub tokens: u64,
    pub allowed: bool,
}

/// Host and dependency health read at evaluation time. The probes feeding
/// this live outside the core; absent signals default to values that fire
/// no rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthSignals {
    pub cpu_load: f64,
    pub memory_used: u64,
    pub memory_max: u64,
    pub http_p95_ms: f64,
    pub error_rate: f64,
    pub redis_healthy: bool,
}

impl Default for HealthSignals {
    fn default() -> Self {
        Self {
            cpu_load: 0.5,
            memory_used: 0,
            memory_max: 0,
            http_p95_ms: 0.0,
            error_rate: 0.01,
            redis_healthy: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Trend {
    Increasing,
    Decreasing,
    Stable,
}

/// Traffic shape derived from one key's event ring.
#[derive(Debug, Clone, Serialize)]
pub struct TrafficPattern {
    pub trend: Trend,
    pub volatility: f64,
    pub hourly_seasonality: bool,
    pub avg_rate_per_sec: f64,
    pub burstiness: f64,
    pub session_span_ms: i64,
    pub sample_count: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AnomalySeverity {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AnomalyKind {
    Spike,
    SustainedHigh,
    Drop,
    SustainedLow,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct AnomalyReport {
    pub z_score: f64,
    pub severity: AnomalySeverity,
    pub kind: AnomalyKind,
}

/// An operator-set limit that shadows all adaptation until removed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManualOverride {
    pub capacity: u64,
    pub refill_rate: u64,
    pub reason: String,
}

/// The adaptation currently in force for one key.
#[derive(Debug, Clone, Serialize)]
pub struct AdaptedEntry {
    pub original: RateLimitConfig,
    pub adapted: RateLimitConfig,
    pub decided_at_ms: i64,
    pub confidence: f64,
    pub reasoning: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AdaptiveMode {
    Static,
    Adaptive,
    Learning,
    Override,
}

/// Per-key adaptive status for the status endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct KeyAdaptiveStatus {
    pub key: String,
    pub mode: AdaptiveMode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    pub original_limits: RateLimitConfig,
    pub current_limits: RateLimitConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
}

struct KeyTraffic {
    events: VecDeque<TrafficEvent>,
}

impl KeyTraffic {
    fn new() -> Self {
        Self {
            events: VecDeque::with_capacity(64),
        }
    }

    fn push(&mut self, event: TrafficEvent) {
        if self.events.len() == RING_CAPACITY {
            self.events.pop_front();
        }
        self.events.push_back(event);
    }
}

/// Collects signals and revises limits under safety constraints.
pub struct AdaptiveController {
    params: AdaptiveParams,
    traffic: RwLock<HashMap<String, Arc<Mutex<KeyTraffic>>>>,
    health: RwLock<HealthSignals>,
    adapted: RwLock<HashMap<String, AdaptedEntry>>,
    overrides: RwLock<HashMap<String, ManualOverride>>,
}

impl AdaptiveController {
    pub fn new(params: AdaptiveParams) -> Self {
        Self {
            params,
            traffic: RwLock::new(HashMap::new()),
            health: RwLock::new(HealthSignals::default()),
            adapted: RwLock::new(HashMap::new()),
            overrides: RwLock::new(HashMap::new()),
        }
    }

    pub fn params(&self) -> &AdaptiveParams {
        &self.params
    }

    /// Hot-path ingest: one O(1) ring push. Never blocks the check longer
    /// than the per-key mutex.
    pub fn record(&self, key: &str, event: TrafficEvent) {
        if !self.params.enabled {
            return;
        }
        let ring = {
            let traffic = self.traffic.read();
            traffic.get(key).cloned()
        };
        let ring = match ring {
            Some(ring) => ring,
            None => {
                let mut traffic = self.traffic.write();
                Arc::clone(
                    traffic
                        .entry(key.to_string())
                        .or_insert_with(|| Arc::new(Mutex::new(KeyTraffic::new()))),
                )
            }
        };
        ring.lock().push(event);
    }

    pub fn set_health(&self, signals: HealthSignals) {
        *self.health.write() = signals;
    }

    pub fn health(&self) -> HealthSignals {
        self.health.read().clone()
    }

    // ---- read-only view consumed by the resolver ----

    pub fn manual_override(&self, key: &str) -> Option<ManualOverride> {
        self.overrides.read().get(key).cloned()
    }

    pub fn adapted_config(&self, key: &str) -> Option<RateLimitConfig> {
        self.adapted.read().get(key).map(|e| e.adapted.clone())
    }

    pub fn adapted_entry(&self, key: &str) -> Option<AdaptedEntry> {
        self.adapted.read().get(key).cloned()
    }

    // ---- manual overrides ----

    pub fn set_override(&self, key: &str, override_: ManualOverride) -> Result<()> {
        if override_.capacity < 1 || override_.refill_rate < 1 {
            return Err(Error::ConfigViolation(
                "override capacity and refill_rate must be at least 1".to_string(),
            ));
        }
        tracing::info!(key = %key, capacity = override_.capacity, reason = %override_.reason,
            "manual override set");
        self.overrides.write().insert(key.to_string(), override_);
        Ok(())
    }

    pub fn remove_override(&self, key: &str) -> bool {
        self.overrides.write().remove(key).is_some()
    }

    /// Status for the adaptive API. `static_config` is the config the key
    /// resolves to without any adaptive influence.
    pub fn status(&self, key: &str, static_config: &RateLimitConfig) -> KeyAdaptiveStatus {
        if let Some(override_) = self.manual_override(key) {
            let mut current = static_config.clone();
            current.capacity = override_.capacity;
            current.refill_rate = override_.refill_rate;
            return KeyAdaptiveStatus {
                key: key.to_string(),
                mode: AdaptiveMode::Override,
                confidence: None,
                original_limits: static_config.clone(),
                current_limits: current,
                reasoning: Some(override_.reason),
            };
        }
        if let Some(entry) = self.adapted_entry(key) {
            return KeyAdaptiveStatus {
                key: key.to_string(),
                mode: AdaptiveMode::Adaptive,
                confidence: Some(entry.confidence),
                original_limits: entry.original,
                current_limits: entry.adapted,
                reasoning: Some(entry.reasoning),
            };
        }
        let samples = {
            let traffic = self.traffic.read();
            traffic.get(key).map(|r| r.lock().events.len()).unwrap_or(0)
        };
        let mode = if self.params.enabled && samples > 0 && samples < MIN_EVENTS_FOR_ADAPTATION {
            AdaptiveMode::Learning
        } else {
            AdaptiveMode::Static
        };
        KeyAdaptiveStatus {
            key: key.to_string(),
            mode,
            confidence: None,
            original_limits: static_config.clone(),
            current_limits: static_config.clone(),
            reasoning: None,
        }
    }

    pub fn tracked_keys(&self) -> Vec<String> {
        self.traffic.read().keys().cloned().collect()
    }

    /// Installs an adapted entry directly, bypassing signal gathering.
    #[cfg(test)]
    pub fn force_adapted_for_tests(&self, key: &str, original: &RateLimitConfig, capacity: u64) {
        let mut adapted = original.clone();
        adapted.capacity = capacity;
        self.adapted.write().insert(
            key.to_string(),
            AdaptedEntry {
                original: original.clone(),
                adapted,
                decided_at_ms: 0,
                confidence: 1.0,
                reasoning: "test fixture".to_string(),
            },
        );
    }

    // ---- evaluation ----

    /// One evaluator tick over every tracked key. `resolve_original` maps a
    /// key to its static config (the precedence chain without adaptive or
    /// override overlays). Returns the keys whose adapted state changed, so
    /// the caller can invalidate the resolver cache for them.
    pub fn evaluate_all<F>(&self, resolve_original: F, now_ms: i64) -> Vec<String>
    where
        F: Fn(&str) -> RateLimitConfig,
    {
        if !self.params.enabled {
            return Vec::new();
        }
        let keys = self.tracked_keys();
        let health = self.health();
        let mut changed = Vec::new();
        for key in keys {
            if self.manual_override(&key).is_some() {
                tracing::debug!(key = %key, "adaptive evaluation skipped: manual override");
                continue;
            }
            let original = resolve_original(&key);
            if self.evaluate_key(&key, &original, &health, now_ms) {
                changed.push(key);
            }
        }
        changed
    }

    /// Evaluates one key. Returns true when the stored adaptation changed.
    fn evaluate_key(
        &self,
        key: &str,
        original: &RateLimitConfig,
        health: &HealthSignals,
        now_ms: i64,
    ) -> bool {
        let (series, pattern) = {
            let traffic = self.traffic.read();
            let Some(ring) = traffic.get(key) else {
                return false;
            };
            let ring = ring.lock();
            if ring.events.len() < MIN_EVENTS_FOR_ADAPTATION {
                return false;
            }
            (rate_series(&ring.events), derive_pattern(&ring.events))
        };
        if let Some(pattern) = &pattern {
            tracing::debug!(
                key = %key,
                trend = ?pattern.trend,
                volatility = pattern.volatility,
                burstiness = pattern.burstiness,
                seasonal = pattern.hourly_seasonality,
                rate = pattern.avg_rate_per_sec,
                "traffic pattern"
            );
        }

        let anomaly = score_anomaly(&series);
        let current = self
            .adapted_config(key)
            .unwrap_or_else(|| original.clone());

        let Some((factor, confidence, reasoning)) = decide(health, anomaly.as_ref()) else {
            return false;
        };
        if confidence < self.params.min_confidence_threshold {
            tracing::debug!(key = %key, confidence, "adaptive decision below confidence gate");
            return false;
        }

        let adapted = self.clamp(original, &current, factor);
        if adapted.capacity == original.capacity && adapted.refill_rate == original.refill_rate {
            // adaptation has converged back to the original limits
            let removed = self.adapted.write().remove(key).is_some();
            return removed;
        }

        let entry = AdaptedEntry {
            original: original.clone(),
            adapted: adapted.clone(),
            decided_at_ms: now_ms,
            confidence,
            reasoning: reasoning.clone(),
        };
        let changed = {
            let mut adapted_map = self.adapted.write();
            let previous = adapted_map.insert(key.to_string(), entry);
            previous.map_or(true, |p| p.adapted != adapted)
        };
        if changed {
            tracing::info!(
                key = %key,
                capacity = adapted.capacity,
                refill_rate = adapted.refill_rate,
                confidence,
                %reasoning,
                "adaptive limits revised"
            );
        }
        changed
    }

    /// Applies the safety constraints: the factor moves the *current*
    /// limits, the result is clamped to the allowed band around the
    /// *original* limits and to the global capacity bounds.
    fn clamp(
        &self,
        original: &RateLimitConfig,
        current: &RateLimitConfig,
        factor: f64,
    ) -> RateLimitConfig {
        let f = self.params.max_adjustment_factor;
        let clamp_one = |orig: u64, cur: u64, lo: u64, hi: u64| -> u64 {
            let floor = (((orig as f64) / f).ceil() as u64).max(lo).max(1);
            let ceiling = (((orig as f64) * f).floor() as u64).min(hi).max(1);
            let scaled = ((cur as f64) * factor).floor() as u64;
            if floor > ceiling {
                return ceiling;
            }
            scaled.clamp(floor, ceiling)
        };
        let mut adapted = original.clone();
        adapted.capacity = clamp_one(
            original.capacity,
            current.capacity,
            self.params.min_capacity,
            self.params.max_capacity,
        );
        adapted.refill_rate = clamp_one(original.refill_rate, current.refill_rate, 1, u64::MAX);
        adapted
    }
}

/// The ordered rule table. First rule that fires wins; `None` means no
/// change this round.
fn decide(health: &HealthSignals, anomaly: Option<&AnomalyReport>) -> Option<(f64, f64, String)> {
    if health.cpu_load > 0.8 || health.http_p95_ms > 2000.0 {
        return Some((
            0.7,
            0.85,
            format!(
                "system under stress (cpu {:.2}, p95 {:.0}ms); reducing limits 30%",
                health.cpu_load, health.http_p95_ms
            ),
        ));
    }
    if let Some(report) = anomaly {
        match report.severity {
            AnomalySeverity::Critical => {
                return Some((
                    0.6,
                    0.90,
                    format!(
                        "critical {:?} anomaly (z = {:.1}); reducing limits 40%",
                        report.kind, report.z_score
                    ),
                ));
            }
            AnomalySeverity::High | AnomalySeverity::Medium => {
                return Some((
                    0.8,
                    0.75,
                    format!(
                        "{:?} anomaly (z = {:.1}); reducing limits 20%",
                        report.kind, report.z_score
                    ),
                ));
            }
            AnomalySeverity::Low => {}
        }
    }
    let calm = anomaly.is_none();
    if calm && health.cpu_load < 0.3 && health.error_rate < 0.001 {
        return Some((
            1.3,
            0.75,
            format!(
                "healthy headroom (cpu {:.2}, errors {:.4}); raising limits 30%",
                health.cpu_load, health.error_rate
            ),
        ));
    }
    if calm && health.cpu_load < 0.5 && health.error_rate < 0.005 {
        return Some((
            1.1,
            0.65,
            format!(
                "mild headroom (cpu {:.2}, errors {:.4}); raising limits 10%",
                health.cpu_load, health.error_rate
            ),
        ));
    }
    None
}

/// Per-second request counts over the trailing span of the ring, capped at
/// the baseline length.
fn rate_series(events: &VecDeque<TrafficEvent>) -> Vec<f64> {
    let Some(last) = events.back() else {
        return Vec::new();
    };
    let first = events.front().unwrap();
    let span_start = first.at_ms.max(last.at_ms - (BASELINE_POINTS as i64 - 1) * 1000);
    let cells = ((last.at_ms - span_start) / 1000 + 1).max(1) as usize;
    let mut series = vec![0.0f64; cells];
    for event in events {
        if event.at_ms < span_start {
            continue;
        }
        let index = ((event.at_ms - span_start) / 1000) as usize;
        series[index.min(cells - 1)] += 1.0;
    }
    series
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

fn std_dev(values: &[f64], mean: f64) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let variance =
        values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (values.len() - 1) as f64;
    variance.sqrt()
}

/// Z-scores the last [`CURRENT_POINTS`] of the series against the whole of
/// it. `|z| > 3` is an anomaly; severity tiers at 3/4/5/6.
fn score_anomaly(series: &[f64]) -> Option<AnomalyReport> {
    if series.len() < MIN_BASELINE_POINTS + CURRENT_POINTS {
        return None;
    }
    let (baseline, current) = series.split_at(series.len() - CURRENT_POINTS);
    let baseline_mean = mean(baseline);
    let sigma = std_dev(baseline, baseline_mean);
    if sigma < f64::EPSILON {
        return None;
    }
    let current_mean = mean(current);
    let z = (current_mean - baseline_mean) / sigma;
    if z.abs() <= 3.0 {
        return None;
    }
    let severity = match z.abs() {
        v if v > 6.0 => AnomalySeverity::Critical,
        v if v > 5.0 => AnomalySeverity::High,
        v if v > 4.0 => AnomalySeverity::Medium,
        _ => AnomalySeverity::Low,
    };
    let kind = if z > 0.0 {
        if z > 5.0 {
            AnomalyKind::Spike
        } else {
            AnomalyKind::SustainedHigh
        }
    } else if z < -5.0 {
        AnomalyKind::Drop
    } else {
        AnomalyKind::SustainedLow
    };
    Some(AnomalyReport {
        z_score: z,
        severity,
        kind,
    })
}

/// Derives the descriptive traffic pattern for one key's ring. Feeds the
/// status API; the decision rules use the anomaly score and health signals.
pub fn derive_pattern(events: &VecDeque<TrafficEvent>) -> Option<TrafficPattern> {
    if events.len() < 2 {
        return None;
    }
    let series = rate_series(events);
    let overall_mean = mean(&series);
    let half = series.len() / 2;
    let first_half = mean(&series[..half.max(1)]);
    let second_half = mean(&series[half..]);
    let trend = if first_half < f64::EPSILON {
        Trend::Stable
    } else {
        let ratio = second_half / first_half;
        if ratio > 1.2 {
            Trend::Increasing
        } else if ratio < 0.8 {
            Trend::Decreasing
        } else {
            Trend::Stable
        }
    };
    let volatility = if overall_mean > f64::EPSILON {
        std_dev(&series, overall_mean) / overall_mean
    } else {
        0.0
    };

    let first = events.front().unwrap();
    let last = events.back().unwrap();
    let span_ms = (last.at_ms - first.at_ms).max(1);
    let avg_rate = events.len() as f64 / (span_ms as f64 / 1000.0).max(0.001);

    // inter-arrival coefficient of variation as the burstiness measure
    let gaps: Vec<f64> = events
        .iter()
        .zip(events.iter().skip(1))
        .map(|(a, b)| (b.at_ms - a.at_ms) as f64)
        .collect();
    let gap_mean = mean(&gaps);
    let burstiness = if gap_mean > f64::EPSILON {
        std_dev(&gaps, gap_mean) / gap_mean
    } else {
        0.0
    };

    // crude hourly seasonality: one hour of day dominating the traffic,
    // observable only once the ring spans multiple hours
    let hourly_seasonality = if span_ms >= 2 * 3_600_000 {
        let mut by_hour = [0u64; 24];
        for event in events {
            let hour = ((event.at_ms / 3_600_000) % 24) as usize;
            by_hour[hour] += 1;
        }
        let populated = by_hour.iter().filter(|&&c| c > 0).count().max(1);
        let hour_mean = events.len() as f64 / populated as f64;
        let hour_max = *by_hour.iter().max().unwrap() as f64;
        hour_max > 2.0 * hour_mean
    } else {
        false
    };

    Some(TrafficPattern {
        trend,
        volatility,
        hourly_seasonality,
        avg_rate_per_sec: avg_rate,
        burstiness,
        session_span_ms: span_ms,
        sample_count: events.len(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::limits::Algorithm;

    fn controller() -> AdaptiveController {
        AdaptiveController::new(AdaptiveParams::default())
    }

    fn stressed() -> HealthSignals {
        HealthSignals {
            cpu_load: 0.9,
            ..HealthSignals::default()
        }
    }

    fn fill_ring(controller: &AdaptiveController, key: &str, events: usize) {
        for i in 0..events {
            controller.record(
                key,
                TrafficEvent {
                    at_ms: (i as i64) * 50,
                    tokens: 1,
                    allowed: true,
                },
            );
        }
    }

    #[test]
    fn test_ring_is_bounded() {
        let controller = controller();
        fill_ring(&controller, "k", RING_CAPACITY + 500);
        let traffic = controller.traffic.read();
        assert_eq!(traffic.get("k").unwrap().lock().events.len(), RING_CAPACITY);
    }

    #[test]
    fn test_stress_reduces_capacity_to_seventy_percent() {
        let controller = controller();
        fill_ring(&controller, "k", 200);
        controller.set_health(stressed());

        let original = RateLimitConfig::new(100, 10, Algorithm::TokenBucket);
        let changed = controller.evaluate_all(|_| original.clone(), 0);
        assert_eq!(changed, vec!["k".to_string()]);

        let adapted = controller.adapted_config("k").unwrap();
        assert_eq!(adapted.capacity, 70);
        assert_eq!(adapted.refill_rate, 7);
    }

    #[test]
    fn test_clamp_bounds_adaptation_around_original() {
        let controller = controller();
        let original = RateLimitConfig::new(100, 10, Algorithm::TokenBucket);
        // a tiny current config cannot be pushed below original / factor
        let shrunk = RateLimitConfig::new(51, 6, Algorithm::TokenBucket);
        let adapted = controller.clamp(&original, &shrunk, 0.7);
        assert_eq!(adapted.capacity, 50); // ceil(100 / 2.0)
        // nor above original * factor
        let grown = RateLimitConfig::new(190, 19, Algorithm::TokenBucket);
        let adapted = controller.clamp(&original, &grown, 1.3);
        assert_eq!(adapted.capacity, 200); // floor(100 * 2.0)
    }

    #[test]
    fn test_clamp_honors_global_bounds() {
        let params = AdaptiveParams {
            max_capacity: 120,
            ..AdaptiveParams::default()
        };
        let controller = AdaptiveController::new(params);
        let original = RateLimitConfig::new(100, 10, Algorithm::TokenBucket);
        let adapted = controller.clamp(&original, &original, 1.3);
        assert_eq!(adapted.capacity, 120);
    }

    #[test]
    fn test_manual_override_skips_evaluation() {
        let controller = controller();
        fill_ring(&controller, "k", 200);
        controller.set_health(stressed());
        controller
            .set_override(
                "k",
                ManualOverride {
                    capacity: 500,
                    refill_rate: 100,
                    reason: "load test".to_string(),
                },
            )
            .unwrap();

        let original = RateLimitConfig::new(100, 10, Algorithm::TokenBucket);
        let changed = controller.evaluate_all(|_| original.clone(), 0);
        assert!(changed.is_empty());
        assert!(controller.adapted_config("k").is_none());
    }

    #[test]
    fn test_learning_mode_before_enough_samples() {
        let controller = controller();
        fill_ring(&controller, "k", 10);
        let config = RateLimitConfig::default();
        assert_eq!(controller.status("k", &config).mode, AdaptiveMode::Learning);

        let unseen = controller.status("other", &config);
        assert_eq!(unseen.mode, AdaptiveMode::Static);
    }

    #[test]
    fn test_override_mode_and_round_trip() {
        let controller = controller();
        let config = RateLimitConfig::new(100, 10, Algorithm::TokenBucket);
        controller
            .set_override(
                "k",
                ManualOverride {
                    capacity: 500,
                    refill_rate: 100,
                    reason: "incident 4711".to_string(),
                },
            )
            .unwrap();
        let status = controller.status("k", &config);
        assert_eq!(status.mode, AdaptiveMode::Override);
        assert_eq!(status.current_limits.capacity, 500);

        assert!(controller.remove_override("k"));
        let status = controller.status("k", &config);
        assert_ne!(status.mode, AdaptiveMode::Override);
    }

    #[test]
    fn test_rejects_invalid_override() {
        let controller = controller();
        let result = controller.set_override(
            "k",
            ManualOverride {
                capacity: 0,
                refill_rate: 10,
                reason: "typo".to_string(),
            },
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_spike_scores_as_anomaly() {
        // 60s of quiet baseline with slight noise, then a hard spike
        let mut series: Vec<f64> = (0..60).map(|i| if i % 2 == 0 { 1.0 } else { 2.0 }).collect();
        for slot in series.iter_mut().rev().take(CURRENT_POINTS) {
            *slot = 40.0;
        }
        let report = score_anomaly(&series).expect("spike must score");
        assert!(report.z_score > 3.0);
        assert_eq!(report.kind, AnomalyKind::Spike);
    }

    #[test]
    fn test_flat_series_is_not_anomalous() {
        let series = vec![5.0; 120];
        assert!(score_anomaly(&series).is_none());
    }

    #[test]
    fn test_decision_rule_order() {
        // stress beats anomaly: rule one fires first
        let report = AnomalyReport {
            z_score: 7.0,
            severity: AnomalySeverity::Critical,
            kind: AnomalyKind::Spike,
        };
        let (factor, confidence, _) = decide(&stressed(), Some(&report)).unwrap();
        assert_eq!(factor, 0.7);
        assert_eq!(confidence, 0.85);

        // without stress the critical anomaly drives the decision
        let calm_host = HealthSignals {
            cpu_load: 0.4,
            ..HealthSignals::default()
        };
        let (factor, confidence, _) = decide(&calm_host, Some(&report)).unwrap();
        assert_eq!(factor, 0.6);
        assert_eq!(confidence, 0.90);
    }

    #[test]
    fn test_healthy_headroom_scales_up() {
        let controller = controller();
        fill_ring(&controller, "k", 200);
        controller.set_health(HealthSignals {
            cpu_load: 0.2,
            error_rate: 0.0005,
            ..HealthSignals::default()
        });
        let original = RateLimitConfig::new(100, 10, Algorithm::TokenBucket);
        controller.evaluate_all(|_| original.clone(), 0);
        let adapted = controller.adapted_config("k").unwrap();
        assert_eq!(adapted.capacity, 130);
    }

    #[test]
    fn test_low_confidence_rule_is_gated() {
        // cpu 0.4 / errors 0.002 fires the 1.1x rule at confidence 0.65,
        // which the default 0.7 gate swallows
        let controller = controller();
        fill_ring(&controller, "k", 200);
        controller.set_health(HealthSignals {
            cpu_load: 0.4,
            error_rate: 0.002,
            ..HealthSignals::default()
        });
        let original = RateLimitConfig::new(100, 10, Algorithm::TokenBucket);
        let changed = controller.evaluate_all(|_| original.clone(), 0);
        assert!(changed.is_empty());
    }

    #[test]
    fn test_pattern_trend_detection() {
        let mut events = VecDeque::new();
        // quiet first half, busy second half
        for i in 0..30 {
            events.push_back(TrafficEvent {
                at_ms: i * 1000,
                tokens: 1,
                allowed: true,
            });
        }
        for i in 30..60 {
            for j in 0..5 {
                events.push_back(TrafficEvent {
                    at_ms: i * 1000 + j * 100,
                    tokens: 1,
                    allowed: true,
                });
            }
        }
        let pattern = derive_pattern(&events).unwrap();
        assert_eq!(pattern.trend, Trend::Increasing);
        assert!(pattern.volatility > 0.0);
    }
}
