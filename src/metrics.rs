//! Request counters, latency percentiles, and the two metric expositions
//! (Prometheus text and JSON). Read programmatically by the adaptive
//! controller, scraped externally by whoever runs the fleet.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Upper bounds (ms) of the check-duration histogram buckets.
const LATENCY_BOUNDS_MS: [f64; 12] = [
    1.0, 2.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 2500.0, 5000.0,
];

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KeyCounters {
    pub requests: u64,
    pub allowed: u64,
    pub denied: u64,
    pub last_access_ms: i64,
}

/// Fixed-bucket latency histogram; P95 comes from a cumulative walk.
struct LatencyHistogram {
    counts: Vec<AtomicU64>,
    overflow: AtomicU64,
    sum_micros: AtomicU64,
    total: AtomicU64,
}

impl LatencyHistogram {
    fn new() -> Self {
        Self {
            counts: (0..LATENCY_BOUNDS_MS.len())
                .map(|_| AtomicU64::new(0))
                .collect(),
            overflow: AtomicU64::new(0),
            sum_micros: AtomicU64::new(0),
            total: AtomicU64::new(0),
        }
    }

    fn observe(&self, ms: f64) {
        match LATENCY_BOUNDS_MS.iter().position(|&bound| ms <= bound) {
            Some(index) => self.counts[index].fetch_add(1, Ordering::Relaxed),
            None => self.overflow.fetch_add(1, Ordering::Relaxed),
        };
        self.sum_micros
            .fetch_add((ms * 1000.0) as u64, Ordering::Relaxed);
        self.total.fetch_add(1, Ordering::Relaxed);
    }

    fn percentile(&self, quantile: f64) -> f64 {
        let total = self.total.load(Ordering::Relaxed);
        if total == 0 {
            return 0.0;
        }
        let target = ((total as f64) * quantile).ceil() as u64;
        let mut cumulative = 0;
        for (index, counter) in self.counts.iter().enumerate() {
            cumulative += counter.load(Ordering::Relaxed);
            if cumulative >= target {
                return LATENCY_BOUNDS_MS[index];
            }
        }
        // beyond the last bound
        LATENCY_BOUNDS_MS[LATENCY_BOUNDS_MS.len() - 1] * 2.0
    }
}

/// The service-wide metrics registry.
pub struct MetricsRegistry {
    per_key: RwLock<HashMap<String, KeyCounters>>,
    total_requests: AtomicU64,
    total_allowed: AtomicU64,
    total_denied: AtomicU64,
    backend_failures: AtomicU64,
    latency: LatencyHistogram,
    redis_connected: AtomicBool,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self {
            per_key: RwLock::new(HashMap::new()),
            total_requests: AtomicU64::new(0),
            total_allowed: AtomicU64::new(0),
            total_denied: AtomicU64::new(0),
            backend_failures: AtomicU64::new(0),
            latency: LatencyHistogram::new(),
            redis_connected: AtomicBool::new(false),
        }
    }

    pub fn record_check(&self, key: &str, allowed: bool, duration_ms: f64, now_wall_ms: i64) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        if allowed {
            self.total_allowed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.total_denied.fetch_add(1, Ordering::Relaxed);
        }
        self.latency.observe(duration_ms);

        let mut per_key = self.per_key.write();
        let counters = per_key.entry(key.to_string()).or_default();
        counters.requests += 1;
        if allowed {
            counters.allowed += 1;
        } else {
            counters.denied += 1;
        }
        counters.last_access_ms = now_wall_ms;
    }

    pub fn record_backend_failure(&self) {
        self.backend_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_redis_connected(&self, connected: bool) {
        self.redis_connected.store(connected, Ordering::Relaxed);
    }

    pub fn redis_connected(&self) -> bool {
        self.redis_connected.load(Ordering::Relaxed)
    }

    pub fn p95_ms(&self) -> f64 {
        self.latency.percentile(0.95)
    }

    pub fn total_requests(&self) -> u64 {
        self.total_requests.load(Ordering::Relaxed)
    }

    pub fn error_rate(&self) -> f64 {
        let total = self.total_requests.load(Ordering::Relaxed);
        if total == 0 {
            return 0.0;
        }
        self.backend_failures.load(Ordering::Relaxed) as f64 / total as f64
    }

    pub fn keys(&self) -> Vec<String> {
        self.per_key.read().keys().cloned().collect()
    }

    pub fn key_counters(&self, key: &str) -> Option<KeyCounters> {
        self.per_key.read().get(key).cloned()
    }

    /// JSON exposition: totals plus the per-key table.
    pub fn json(&self) -> serde_json::Value {
        let per_key = self.per_key.read().clone();
        serde_json::json!({
            "total_requests": self.total_requests.load(Ordering::Relaxed),
            "allowed_requests": self.total_allowed.load(Ordering::Relaxed),
            "denied_requests": self.total_denied.load(Ordering::Relaxed),
            "backend_failures": self.backend_failures.load(Ordering::Relaxed),
            "p95_latency_ms": self.p95_ms(),
            "redis_connected": self.redis_connected(),
            "keys": per_key,
        })
    }

    /// Prometheus text exposition. Per-key counters stay out of here;
    /// unbounded label cardinality belongs in the JSON endpoint.
    pub fn prometheus(&self) -> String {
        let mut out = String::with_capacity(1024);
        let counter = |out: &mut String, name: &str, help: &str, value: u64| {
            out.push_str(&format!(
                "# HELP {name} {help}\n# TYPE {name} counter\n{name} {value}\n"
            ));
        };
        counter(
            &mut out,
            "ratelimitd_requests_total",
            "Total rate limit checks.",
            self.total_requests.load(Ordering::Relaxed),
        );
        counter(
            &mut out,
            "ratelimitd_requests_allowed_total",
            "Checks that were allowed.",
            self.total_allowed.load(Ordering::Relaxed),
        );
        counter(
            &mut out,
            "ratelimitd_requests_denied_total",
            "Checks that were denied.",
            self.total_denied.load(Ordering::Relaxed),
        );
        counter(
            &mut out,
            "ratelimitd_backend_failures_total",
            "Backend (Redis) failures observed.",
            self.backend_failures.load(Ordering::Relaxed),
        );
        out.push_str(&format!(
            "# HELP ratelimitd_redis_connected Redis connectivity flag.\n\
             # TYPE ratelimitd_redis_connected gauge\n\
             ratelimitd_redis_connected {}\n",
            if self.redis_connected() { 1 } else { 0 }
        ));
        out.push_str(&format!(
            "# HELP ratelimitd_tracked_keys Keys with recorded activity.\n\
             # TYPE ratelimitd_tracked_keys gauge\n\
             ratelimitd_tracked_keys {}\n",
            self.per_key.read().len()
        ));

        out.push_str(
            "# HELP ratelimitd_check_duration_ms Rate limit check duration.\n\
             # TYPE ratelimitd_check_duration_ms histogram\n",
        );
        let mut cumulative = 0;
        for (index, bound) in LATENCY_BOUNDS_MS.iter().enumerate() {
            cumulative += self.latency.counts[index].load(Ordering::Relaxed);
            out.push_str(&format!(
                "ratelimitd_check_duration_ms_bucket{{le=\"{bound}\"}} {cumulative}\n"
            ));
        }
        cumulative += self.latency.overflow.load(Ordering::Relaxed);
        out.push_str(&format!(
            "ratelimitd_check_duration_ms_bucket{{le=\"+Inf\"}} {cumulative}\n"
        ));
        out.push_str(&format!(
            "ratelimitd_check_duration_ms_sum {}\n",
            self.latency.sum_micros.load(Ordering::Relaxed) as f64 / 1000.0
        ));
        out.push_str(&format!(
            "ratelimitd_check_duration_ms_count {}\n",
            self.latency.total.load(Ordering::Relaxed)
        ));
        out
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}
