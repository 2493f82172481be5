//! # Effective Configuration Resolver
//!
//! For every `(key, context)` the resolver walks a fixed precedence chain
//! and returns the limit actually in force. Highest wins, first match
//! stops the search:
//!
//! ```text
//! 1. manual adaptive override          (operator said so)
//! 2. active schedule overlay           (time window, priority desc)
//! 3. geographic rule                   (location match, priority desc)
//! 4. adaptive-adjusted config          (controller's current revision)
//! 5. per-key static config
//! 6. pattern rule                      (longest literal prefix wins)
//! 7. global default
//! ```
//!
//! Every consulted component is a snapshot read: the schedule index and
//! limit tables are atomically swapped pointers, adaptive state is behind a
//! short read lock. Resolution is pure given those snapshots and never does
//! I/O, so after cache warm-up the hot path costs one LRU probe.
//!
//! Invalidation is generation-based: any admin write, schedule transition,
//! or adaptive update bumps a counter that is part of the cache key, which
//! orphans every stale entry at once without walking the cache. Stale reads
//! between a change and the next resolve are bounded by one evaluator tick.

use crate::adaptive::AdaptiveController;
use crate::config::LimitsHandle;
use crate::geo::{GeoLocation, GeoManager};
use crate::limits::{select_pattern, RateLimitConfig};
use crate::schedule::ScheduleManager;
use chrono::{DateTime, Utc};
use lru::LruCache;
use parking_lot::Mutex;
use serde::Serialize;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use uuid::Uuid;

/// Per-request inputs that can steer resolution.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    pub location: GeoLocation,
    /// Evaluation instant for geo validity windows; wall clock when absent.
    pub at: Option<DateTime<Utc>>,
}

impl RequestContext {
    pub fn with_location(location: GeoLocation) -> Self {
        Self {
            location,
            at: None,
        }
    }
}

/// Which rung of the chain produced the effective config.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConfigSource {
    ManualOverride,
    Schedule { id: Uuid },
    Geo { id: Uuid },
    Adaptive,
    PerKey,
    Pattern { pattern: String },
    Default,
}

#[derive(Debug, Clone, Serialize)]
pub struct Resolved {
    pub limits: RateLimitConfig,
    pub source: ConfigSource,
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub capacity: usize,
    pub hits: u64,
    pub misses: u64,
    pub generation: u64,
}

pub struct Resolver {
    limits: Arc<LimitsHandle>,
    schedules: Arc<ScheduleManager>,
    geo: Arc<GeoManager>,
    adaptive: Arc<AdaptiveController>,
    cache: Mutex<LruCache<String, Arc<Resolved>>>,
    generation: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl Resolver {
    pub fn new(
        limits: Arc<LimitsHandle>,
        schedules: Arc<ScheduleManager>,
        geo: Arc<GeoManager>,
        adaptive: Arc<AdaptiveController>,
        cache_size: usize,
    ) -> Self {
        let capacity = NonZeroUsize::new(cache_size.max(1)).expect("cache size is nonzero");
        Self {
            limits,
            schedules,
            geo,
            adaptive,
            cache: Mutex::new(LruCache::new(capacity)),
            generation: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// The effective config for `(key, context)`.
    pub fn resolve(&self, key: &str, context: &RequestContext) -> Arc<Resolved> {
        let generation = self.generation.load(Ordering::Acquire);
        let cache_key = format!("{}|{}|{}", generation, key, context.location.fingerprint());

        if let Some(cached) = self.cache.lock().get(&cache_key) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Arc::clone(cached);
        }
        self.misses.fetch_add(1, Ordering::Relaxed);

        let resolved = Arc::new(self.resolve_uncached(key, context));
        self.cache.lock().put(cache_key, Arc::clone(&resolved));
        resolved
    }

    fn resolve_uncached(&self, key: &str, context: &RequestContext) -> Resolved {
        // 1. manual override shadows everything, shaped on the static config
        if let Some(override_) = self.adaptive.manual_override(key) {
            let (mut limits, _) = self.static_chain(key);
            limits.capacity = override_.capacity;
            limits.refill_rate = override_.refill_rate;
            return Resolved {
                limits,
                source: ConfigSource::ManualOverride,
            };
        }

        // 2. active schedule window
        if let Some((id, limits)) = self.schedules.active_for(key) {
            return Resolved {
                limits,
                source: ConfigSource::Schedule { id },
            };
        }

        // 3. geographic overlay
        let now = context.at.unwrap_or_else(Utc::now);
        if let Some((id, limits)) = self.geo.resolve(key, &context.location, now) {
            return Resolved {
                limits,
                source: ConfigSource::Geo { id },
            };
        }

        // 4. adaptive revision
        if let Some(limits) = self.adaptive.adapted_config(key) {
            return Resolved {
                limits,
                source: ConfigSource::Adaptive,
            };
        }

        // 5..7. static tables
        let (limits, source) = self.static_chain(key);
        Resolved { limits, source }
    }

    fn static_chain(&self, key: &str) -> (RateLimitConfig, ConfigSource) {
        let snapshot = self.limits.load();
        if let Some(limits) = snapshot.key_limits.get(key) {
            return (limits.clone(), ConfigSource::PerKey);
        }
        if let Some(pattern) = select_pattern(&snapshot.patterns, key) {
            return (
                pattern.rule.limits.clone(),
                ConfigSource::Pattern {
                    pattern: pattern.rule.pattern.clone(),
                },
            );
        }
        (snapshot.defaults.clone(), ConfigSource::Default)
    }

    /// The config a key resolves to with no adaptive, schedule, geo or
    /// override influence. The adaptive controller anchors its safety
    /// clamps to this.
    pub fn resolve_static(&self, key: &str) -> RateLimitConfig {
        self.static_chain(key).0
    }

    /// Orphans every cached entry. Called on admin writes, schedule
    /// transitions, and adaptive updates.
    pub fn invalidate(&self) {
        self.generation.fetch_add(1, Ordering::Release);
    }

    pub fn cache_stats(&self) -> CacheStats {
        let cache = self.cache.lock();
        CacheStats {
            entries: cache.len(),
            capacity: cache.cap().get(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            generation: self.generation.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adaptive::{AdaptiveParams, ManualOverride};
    use crate::config::Config;
    use crate::geo::GeoRule;
    use crate::limits::Algorithm;
    use crate::schedule::{Schedule, ScheduleType};
    use chrono::Duration as ChronoDuration;

    struct Fixture {
        limits: Arc<LimitsHandle>,
        schedules: Arc<ScheduleManager>,
        geo: Arc<GeoManager>,
        adaptive: Arc<AdaptiveController>,
        resolver: Resolver,
    }

    fn fixture() -> Fixture {
        let limits = Arc::new(LimitsHandle::new(&Config::default()).unwrap());
        let schedules = Arc::new(ScheduleManager::new());
        let geo = Arc::new(GeoManager::new());
        let adaptive = Arc::new(AdaptiveController::new(AdaptiveParams::default()));
        let resolver = Resolver::new(
            Arc::clone(&limits),
            Arc::clone(&schedules),
            Arc::clone(&geo),
            Arc::clone(&adaptive),
            128,
        );
        Fixture {
            limits,
            schedules,
            geo,
            adaptive,
            resolver,
        }
    }

    fn german_context() -> RequestContext {
        RequestContext::with_location(GeoLocation {
            country_code: Some("DE".to_string()),
            region: None,
            compliance_zone: Some("GDPR".to_string()),
        })
    }

    fn active_schedule() -> Schedule {
        let now = Utc::now();
        Schedule {
            id: Uuid::new_v4(),
            name: "peak".to_string(),
            key_pattern: "user:*".to_string(),
            schedule_type: ScheduleType::OneTime,
            cron: None,
            timezone: "UTC".to_string(),
            start_time: Some(now - ChronoDuration::minutes(1)),
            end_time: Some(now + ChronoDuration::minutes(9)),
            priority: 0,
            enabled: true,
            active_limits: RateLimitConfig::new(11, 1, Algorithm::TokenBucket),
            fallback_limits: None,
            transition: None,
            created_at: now,
        }
    }

    fn geo_rule() -> GeoRule {
        GeoRule {
            id: Uuid::new_v4(),
            key_pattern: "user:*".to_string(),
            country_code: Some("DE".to_string()),
            region: None,
            compliance_zone: None,
            limits: RateLimitConfig::new(22, 2, Algorithm::TokenBucket),
            priority: 0,
            valid_from: None,
            valid_until: None,
            enabled: true,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_default_when_nothing_else_matches() {
        let f = fixture();
        let resolved = f.resolver.resolve("user:1", &RequestContext::default());
        assert_eq!(resolved.source, ConfigSource::Default);
        assert_eq!(resolved.limits.capacity, 100);
    }

    #[test]
    fn test_full_precedence_chain_peels_off_in_order() {
        let f = fixture();
        let context = german_context();

        // 7 → 6: pattern beats default
        f.limits
            .set_pattern_limit("user:*", RateLimitConfig::new(33, 3, Algorithm::TokenBucket))
            .unwrap();
        f.resolver.invalidate();
        let resolved = f.resolver.resolve("user:1", &context);
        assert!(matches!(resolved.source, ConfigSource::Pattern { .. }));

        // 6 → 5: per-key beats pattern
        f.limits
            .set_key_limit("user:1", RateLimitConfig::new(44, 4, Algorithm::TokenBucket))
            .unwrap();
        f.resolver.invalidate();
        let resolved = f.resolver.resolve("user:1", &context);
        assert_eq!(resolved.source, ConfigSource::PerKey);

        // 5 → 4: adaptive beats per-key
        let original = f.resolver.resolve_static("user:1");
        f.adaptive.force_adapted_for_tests("user:1", &original, 35);
        f.resolver.invalidate();
        let resolved = f.resolver.resolve("user:1", &context);
        assert_eq!(resolved.source, ConfigSource::Adaptive);
        assert_eq!(resolved.limits.capacity, 35);

        // 4 → 3: geo beats adaptive
        f.geo.upsert(geo_rule()).unwrap();
        f.resolver.invalidate();
        let resolved = f.resolver.resolve("user:1", &context);
        assert!(matches!(resolved.source, ConfigSource::Geo { .. }));
        assert_eq!(resolved.limits.capacity, 22);

        // 3 → 2: schedule beats geo
        f.schedules.create(active_schedule()).unwrap();
        f.schedules.evaluate(Utc::now());
        f.resolver.invalidate();
        let resolved = f.resolver.resolve("user:1", &context);
        assert!(matches!(resolved.source, ConfigSource::Schedule { .. }));
        assert_eq!(resolved.limits.capacity, 11);

        // 2 → 1: manual override beats everything
        f.adaptive
            .set_override(
                "user:1",
                ManualOverride {
                    capacity: 500,
                    refill_rate: 100,
                    reason: "incident".to_string(),
                },
            )
            .unwrap();
        f.resolver.invalidate();
        let resolved = f.resolver.resolve("user:1", &context);
        assert_eq!(resolved.source, ConfigSource::ManualOverride);
        assert_eq!(resolved.limits.capacity, 500);
        assert_eq!(resolved.limits.refill_rate, 100);
    }

    #[test]
    fn test_resolution_is_deterministic() {
        let f = fixture();
        let context = german_context();
        f.geo.upsert(geo_rule()).unwrap();
        let first = f.resolver.resolve("user:1", &context);
        let second = f.resolver.resolve("user:1", &context);
        assert_eq!(first.limits, second.limits);
        assert_eq!(first.source, second.source);
    }

    #[test]
    fn test_cache_hit_until_invalidated() {
        let f = fixture();
        let context = RequestContext::default();
        f.resolver.resolve("user:1", &context);
        f.resolver.resolve("user:1", &context);
        let stats = f.resolver.cache_stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);

        f.resolver.invalidate();
        f.resolver.resolve("user:1", &context);
        let stats = f.resolver.cache_stats();
        assert_eq!(stats.misses, 2);
    }

    #[test]
    fn test_contexts_cache_independently() {
        let f = fixture();
        f.geo.upsert(geo_rule()).unwrap();
        let at_home = f.resolver.resolve("user:1", &RequestContext::default());
        let in_germany = f.resolver.resolve("user:1", &german_context());
        assert_eq!(at_home.source, ConfigSource::Default);
        assert!(matches!(in_germany.source, ConfigSource::Geo { .. }));
    }

    #[test]
    fn test_deleting_key_limit_restores_prior_resolution() {
        let f = fixture();
        let context = RequestContext::default();
        let before = f.resolver.resolve("user:1", &context).limits.clone();

        f.limits
            .set_key_limit("user:1", RateLimitConfig::new(9, 9, Algorithm::TokenBucket))
            .unwrap();
        f.resolver.invalidate();
        assert_eq!(f.resolver.resolve("user:1", &context).limits.capacity, 9);

        f.limits.remove_key_limit("user:1");
        f.resolver.invalidate();
        let after = f.resolver.resolve("user:1", &context).limits.clone();
        assert_eq!(before, after);
    }
}
