//! # Service Orchestrator
//!
//! Wires the resolver, store, composite limiter, adaptive controller,
//! schedule and geo managers, and metrics into the one call the HTTP
//! surface cares about: "may `n` tokens be consumed for this key, now?"
//!
//! ```text
//! check(key, n, ctx)
//!    │
//!    ├── resolver  → effective RateLimitConfig (cached)
//!    ├── store     → atomic per-key algorithm step
//!    ├── metrics   → counters + latency histogram
//!    └── adaptive  → O(1) event ingest (async with respect to the verdict)
//! ```
//!
//! Backend failures honor the fail-open flag: open means the request is
//! allowed, counted and logged; closed means the `Unavailable` error
//! propagates to the caller.

use crate::adaptive::{AdaptiveController, TrafficEvent};
use crate::clock::Clock;
use crate::composite::{CompositeConfig, CompositeLimiter, ComponentResult};
use crate::config::{Config, LimitsHandle};
use crate::error::{Error, Result};
use crate::geo::GeoManager;
use crate::metrics::MetricsRegistry;
use crate::resolver::{ConfigSource, RequestContext, Resolver};
use crate::schedule::ScheduleManager;
use crate::store::{MemoryStore, RedisStore, Store};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;

/// The verdict handed to the HTTP layer.
#[derive(Debug, Clone, Serialize)]
pub struct CheckOutcome {
    pub key: String,
    pub tokens_requested: u64,
    pub allowed: bool,
    pub remaining: u64,
    pub limit: u64,
    pub retry_after_ms: u64,
    pub source: ConfigSource,
    /// True when the verdict came from the fail-open policy rather than a
    /// bucket.
    pub degraded: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub components: Option<Vec<ComponentResult>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limiting_component: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BenchmarkRequest {
    pub concurrent_tasks: usize,
    pub requests_per_task: usize,
    #[serde(default = "default_key_space")]
    pub key_space: usize,
    #[serde(default = "default_benchmark_tokens")]
    pub tokens: u64,
}

fn default_key_space() -> usize {
    64
}

fn default_benchmark_tokens() -> u64 {
    1
}

#[derive(Debug, Clone, Serialize)]
pub struct BenchmarkReport {
    pub total_requests: u64,
    pub allowed: u64,
    pub denied: u64,
    pub duration_ms: u64,
    pub throughput_per_sec: f64,
    pub p95_latency_ms: f64,
}

pub struct RateLimitService {
    clock: Clock,
    store: Arc<Store>,
    composite: CompositeLimiter,
    pub limits: Arc<LimitsHandle>,
    pub resolver: Arc<Resolver>,
    pub adaptive: Arc<AdaptiveController>,
    pub schedules: Arc<ScheduleManager>,
    pub geo: Arc<GeoManager>,
    pub metrics: Arc<MetricsRegistry>,
    fail_open: bool,
}

impl RateLimitService {
    /// Builds the full component graph from configuration. The backend is
    /// chosen here and never changes for the life of the process.
    pub async fn build(config: &Config) -> Result<Self> {
        config.validate()?;

        let store = if config.uses_redis() {
            let redis = RedisStore::connect(
                &config.redis_url,
                config.redis_pool_size,
                config.redis_max_wait,
            )
            .await?;
            Arc::new(Store::Redis(redis))
        } else {
            Arc::new(Store::Memory(MemoryStore::new(
                config.idle_threshold.as_nanos() as u64,
            )))
        };

        let limits = Arc::new(LimitsHandle::new(config)?);
        let schedules = Arc::new(ScheduleManager::new());
        let geo = Arc::new(GeoManager::new());
        let adaptive = Arc::new(AdaptiveController::new(config.adaptive.clone()));
        let resolver = Arc::new(Resolver::new(
            Arc::clone(&limits),
            Arc::clone(&schedules),
            Arc::clone(&geo),
            Arc::clone(&adaptive),
            config.resolver_cache_size,
        ));
        let metrics = Arc::new(MetricsRegistry::new());
        metrics.set_redis_connected(store.is_distributed());

        Ok(Self {
            clock: Clock::new(),
            composite: CompositeLimiter::new(Arc::clone(&store)),
            store,
            limits,
            resolver,
            adaptive,
            schedules,
            geo,
            metrics,
            fail_open: config.fail_open,
        })
    }

    pub fn clock(&self) -> Clock {
        self.clock
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    /// The single-limit hot path.
    pub async fn check(
        &self,
        key: &str,
        tokens: u64,
        context: &RequestContext,
    ) -> Result<CheckOutcome> {
        let started = Instant::now();
        let now_ns = self.clock.now_ns();
        let resolved = self.resolver.resolve(key, context);

        let outcome = match self.store.apply(key, &resolved.limits, tokens, now_ns).await {
            Ok(applied) => CheckOutcome {
                key: key.to_string(),
                tokens_requested: tokens,
                allowed: applied.allowed,
                remaining: applied.remaining,
                limit: resolved.limits.capacity,
                retry_after_ms: applied.retry_after_ms,
                source: resolved.source.clone(),
                degraded: false,
                components: None,
                limiting_component: None,
            },
            Err(Error::Unavailable(message)) => {
                self.metrics.record_backend_failure();
                if !self.fail_open {
                    tracing::warn!(key = %key, %message, "backend unavailable; failing closed");
                    return Err(Error::Unavailable(message));
                }
                tracing::warn!(key = %key, %message, "backend unavailable; failing open");
                CheckOutcome {
                    key: key.to_string(),
                    tokens_requested: tokens,
                    allowed: true,
                    remaining: 0,
                    limit: resolved.limits.capacity,
                    retry_after_ms: 0,
                    source: resolved.source.clone(),
                    degraded: true,
                    components: None,
                    limiting_component: None,
                }
            }
            Err(other) => return Err(other),
        };

        self.finish_check(key, tokens, &outcome, started);
        Ok(outcome)
    }

    /// The composite fan-out path.
    pub async fn check_composite(
        &self,
        key: &str,
        tokens: u64,
        config: &CompositeConfig,
    ) -> Result<CheckOutcome> {
        let started = Instant::now();
        let now_ns = self.clock.now_ns();

        let result = self.composite.try_consume(key, tokens, config, now_ns).await;
        let outcome = match result {
            Ok(composite) => CheckOutcome {
                key: key.to_string(),
                tokens_requested: tokens,
                allowed: composite.allowed,
                remaining: composite
                    .components
                    .iter()
                    .map(|c| c.current_tokens)
                    .min()
                    .unwrap_or(0),
                limit: config
                    .limits
                    .iter()
                    .map(|l| l.limits.capacity)
                    .min()
                    .unwrap_or(0),
                retry_after_ms: composite.retry_after_ms,
                source: ConfigSource::Default,
                degraded: false,
                components: Some(composite.components),
                limiting_component: composite.limiting_component,
            },
            Err(Error::Unavailable(message)) => {
                self.metrics.record_backend_failure();
                if !self.fail_open {
                    tracing::warn!(key = %key, %message, "backend unavailable; failing closed");
                    return Err(Error::Unavailable(message));
                }
                tracing::warn!(key = %key, %message, "backend unavailable; failing open");
                CheckOutcome {
                    key: key.to_string(),
                    tokens_requested: tokens,
                    allowed: true,
                    remaining: 0,
                    limit: 0,
                    retry_after_ms: 0,
                    source: ConfigSource::Default,
                    degraded: true,
                    components: None,
                    limiting_component: None,
                }
            }
            Err(other) => return Err(other),
        };

        self.finish_check(key, tokens, &outcome, started);
        Ok(outcome)
    }

    fn finish_check(&self, key: &str, tokens: u64, outcome: &CheckOutcome, started: Instant) {
        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
        let now_wall = self.clock.now_wall_ms();
        self.metrics
            .record_check(key, outcome.allowed, elapsed_ms, now_wall);
        self.adaptive.record(
            key,
            TrafficEvent {
                at_ms: now_wall,
                tokens,
                allowed: outcome.allowed,
            },
        );
        tracing::debug!(
            key = %key,
            allowed = outcome.allowed,
            remaining = outcome.remaining,
            "rate limit check"
        );
    }

    /// Drops the bucket for a key so the next check rebuilds it from the
    /// then-effective config.
    pub async fn reset_key(&self, key: &str) -> Result<()> {
        let limits = self.resolver.resolve_static(key);
        self.store.evict(key, &limits).await
    }

    /// Keys with live state: bucket registry when local, metrics registry
    /// when the keyspace lives in Redis.
    pub fn active_keys(&self) -> Vec<String> {
        match self.store.active_keys() {
            Some(keys) => keys,
            None => self.metrics.keys(),
        }
    }

    pub async fn healthy(&self) -> bool {
        let healthy = self.store.healthy().await;
        if self.store.is_distributed() {
            self.metrics.set_redis_connected(healthy);
        }
        healthy
    }

    pub fn fail_open(&self) -> bool {
        self.fail_open
    }

    // ---- background worker ticks ----

    /// Idle-bucket sweep (local backend; Redis buckets expire by TTL).
    pub fn sweep_tick(&self) -> usize {
        match self.store.as_ref() {
            Store::Memory(memory) => memory.sweep_idle(self.clock.now_ns()),
            Store::Redis(_) => 0,
        }
    }

    /// Schedule evaluator tick; invalidates the resolver on transitions.
    pub fn schedule_tick(&self) {
        if self.schedules.evaluate(Utc::now()) {
            self.resolver.invalidate();
        }
    }

    /// Adaptive evaluator tick: refreshes the health snapshot from observed
    /// metrics, then lets the controller revise limits.
    pub async fn adaptive_tick(&self) {
        let mut health = self.adaptive.health();
        health.http_p95_ms = self.metrics.p95_ms();
        health.error_rate = self.metrics.error_rate();
        health.redis_healthy = !self.store.is_distributed() || self.store.healthy().await;
        self.adaptive.set_health(health);

        let resolver = Arc::clone(&self.resolver);
        let changed = self
            .adaptive
            .evaluate_all(move |key| resolver.resolve_static(key), self.clock.now_wall_ms());
        if !changed.is_empty() {
            tracing::info!(keys = changed.len(), "adaptive revisions applied");
            self.resolver.invalidate();
        }
    }

    /// Synthetic load driver behind the benchmark endpoint. Exercises the
    /// real check path; memory stays bounded because the key space is.
    pub async fn run_benchmark(self: Arc<Self>, request: BenchmarkRequest) -> BenchmarkReport {
        let started = Instant::now();
        let mut handles = Vec::with_capacity(request.concurrent_tasks);
        for task in 0..request.concurrent_tasks {
            let service = Arc::clone(&self);
            let request = request.clone();
            handles.push(tokio::spawn(async move {
                let mut allowed = 0u64;
                let mut denied = 0u64;
                for i in 0..request.requests_per_task {
                    let key = format!(
                        "bench:{}",
                        (task * request.requests_per_task + i) % request.key_space.max(1)
                    );
                    match service
                        .check(&key, request.tokens, &RequestContext::default())
                        .await
                    {
                        Ok(outcome) if outcome.allowed => allowed += 1,
                        Ok(_) => denied += 1,
                        Err(_) => denied += 1,
                    }
                }
                (allowed, denied)
            }));
        }

        let mut allowed = 0;
        let mut denied = 0;
        for handle in handles {
            if let Ok((a, d)) = handle.await {
                allowed += a;
                denied += d;
            }
        }
        let duration = started.elapsed();
        let total = allowed + denied;
        BenchmarkReport {
            total_requests: total,
            allowed,
            denied,
            duration_ms: duration.as_millis() as u64,
            throughput_per_sec: total as f64 / duration.as_secs_f64().max(0.001),
            p95_latency_ms: self.metrics.p95_ms(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::limits::{Algorithm, RateLimitConfig};

    async fn service() -> Arc<RateLimitService> {
        Arc::new(RateLimitService::build(&Config::default()).await.unwrap())
    }

    #[tokio::test]
    async fn test_check_consumes_and_reports() {
        let service = service().await;
        let outcome = service
            .check("user:1", 1, &RequestContext::default())
            .await
            .unwrap();
        assert!(outcome.allowed);
        assert_eq!(outcome.remaining, 99);
        assert_eq!(outcome.limit, 100);
        assert_eq!(service.metrics.total_requests(), 1);
    }

    #[tokio::test]
    async fn test_zero_tokens_is_allowed_noop() {
        let service = service().await;
        service
            .check("user:1", 5, &RequestContext::default())
            .await
            .unwrap();
        let outcome = service
            .check("user:1", 0, &RequestContext::default())
            .await
            .unwrap();
        assert!(outcome.allowed);
        assert_eq!(outcome.remaining, 95);
    }

    #[tokio::test]
    async fn test_reset_key_rebuilds_bucket() {
        let service = service().await;
        service
            .limits
            .set_key_limit("k", RateLimitConfig::new(2, 1, Algorithm::TokenBucket))
            .unwrap();
        service.resolver.invalidate();

        let context = RequestContext::default();
        service.check("k", 2, &context).await.unwrap();
        assert!(!service.check("k", 1, &context).await.unwrap().allowed);

        service.reset_key("k").await.unwrap();
        assert!(service.check("k", 1, &context).await.unwrap().allowed);
    }

    #[tokio::test]
    async fn test_active_keys_lists_live_buckets() {
        let service = service().await;
        service
            .check("user:1", 1, &RequestContext::default())
            .await
            .unwrap();
        let keys = service.active_keys();
        assert_eq!(keys, vec!["user:1".to_string()]);
    }

    #[tokio::test]
    async fn test_benchmark_is_bounded_and_counted() {
        let service = service().await;
        let report = Arc::clone(&service)
            .run_benchmark(BenchmarkRequest {
                concurrent_tasks: 4,
                requests_per_task: 50,
                key_space: 8,
                tokens: 1,
            })
            .await;
        assert_eq!(report.total_requests, 200);
        assert_eq!(report.allowed + report.denied, 200);
        // the bucket registry holds at most the benchmark key space
        assert!(service.active_keys().len() <= 8);
    }
}
