//! Service configuration.
//!
//! Two layers live here. [`Config`] is the startup shape: bind address,
//! backend selection, pool sizing, adaptive tunables, and the seed limit
//! tables, loaded from the environment with sane defaults. [`LimitsHandle`]
//! is the runtime shape the resolver reads on every request: an immutable
//! snapshot of default/per-key/pattern limits behind an atomic pointer.
//! Admin writes and the reload endpoint build a fresh snapshot and swap the
//! pointer; readers never block and never see a half-applied change.

use crate::adaptive::AdaptiveParams;
use crate::error::{Error, Result};
use crate::limits::{Algorithm, CompiledPattern, PatternRule, RateLimitConfig};
use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::env;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub bind_address: String,
    /// Empty string selects the in-process backend.
    pub redis_url: String,
    /// Allow requests when the backend is unreachable (the default), or
    /// deny them.
    pub fail_open: bool,
    pub redis_pool_size: usize,
    #[serde(with = "humantime_serde")]
    pub redis_max_wait: Duration,
    #[serde(with = "humantime_serde")]
    pub idle_threshold: Duration,
    #[serde(with = "humantime_serde")]
    pub cleanup_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub schedule_tick: Duration,
    pub resolver_cache_size: usize,
    pub default_limits: RateLimitConfig,
    pub key_limits: HashMap<String, RateLimitConfig>,
    pub pattern_limits: Vec<PatternRule>,
    pub adaptive: AdaptiveParams,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1:8080".to_string(),
            redis_url: String::new(),
            fail_open: true,
            redis_pool_size: 10,
            redis_max_wait: Duration::from_millis(5000),
            idle_threshold: Duration::from_secs(600),
            cleanup_interval: Duration::from_secs(60),
            schedule_tick: Duration::from_secs(1),
            resolver_cache_size: 10_000,
            default_limits: RateLimitConfig::new(100, 10, Algorithm::TokenBucket),
            key_limits: HashMap::new(),
            pattern_limits: Vec::new(),
            adaptive: AdaptiveParams::default(),
        }
    }
}

impl Config {
    /// Loads configuration from `RATELIMITD_*` environment variables,
    /// falling back to defaults for anything unset.
    pub fn from_env() -> Result<Self> {
        let mut config = Config::default();

        if let Ok(bind) = env::var("RATELIMITD_BIND_ADDRESS") {
            config.bind_address = bind;
        }
        if let Ok(url) = env::var("RATELIMITD_REDIS_URL") {
            config.redis_url = url;
        }
        if let Ok(flag) = env::var("RATELIMITD_FAIL_OPEN") {
            config.fail_open = parse_env("RATELIMITD_FAIL_OPEN", &flag)?;
        }
        if let Ok(size) = env::var("RATELIMITD_REDIS_POOL_SIZE") {
            config.redis_pool_size = parse_env("RATELIMITD_REDIS_POOL_SIZE", &size)?;
        }
        if let Ok(ms) = env::var("RATELIMITD_REDIS_MAX_WAIT_MS") {
            config.redis_max_wait =
                Duration::from_millis(parse_env("RATELIMITD_REDIS_MAX_WAIT_MS", &ms)?);
        }
        if let Ok(ms) = env::var("RATELIMITD_IDLE_THRESHOLD_MS") {
            config.idle_threshold =
                Duration::from_millis(parse_env("RATELIMITD_IDLE_THRESHOLD_MS", &ms)?);
        }
        if let Ok(ms) = env::var("RATELIMITD_CLEANUP_INTERVAL_MS") {
            config.cleanup_interval =
                Duration::from_millis(parse_env("RATELIMITD_CLEANUP_INTERVAL_MS", &ms)?);
        }
        if let Ok(capacity) = env::var("RATELIMITD_DEFAULT_CAPACITY") {
            config.default_limits.capacity = parse_env("RATELIMITD_DEFAULT_CAPACITY", &capacity)?;
        }
        if let Ok(rate) = env::var("RATELIMITD_DEFAULT_REFILL_RATE") {
            config.default_limits.refill_rate = parse_env("RATELIMITD_DEFAULT_REFILL_RATE", &rate)?;
        }
        if let Ok(algorithm) = env::var("RATELIMITD_DEFAULT_ALGORITHM") {
            config.default_limits.algorithm = Algorithm::from_str(&algorithm)?;
        }
        if let Ok(flag) = env::var("RATELIMITD_ADAPTIVE_ENABLED") {
            config.adaptive.enabled = parse_env("RATELIMITD_ADAPTIVE_ENABLED", &flag)?;
        }
        if let Ok(ms) = env::var("RATELIMITD_ADAPTIVE_INTERVAL_MS") {
            config.adaptive.evaluation_interval_ms =
                parse_env("RATELIMITD_ADAPTIVE_INTERVAL_MS", &ms)?;
        }
        if let Ok(confidence) = env::var("RATELIMITD_ADAPTIVE_MIN_CONFIDENCE") {
            config.adaptive.min_confidence_threshold =
                parse_env("RATELIMITD_ADAPTIVE_MIN_CONFIDENCE", &confidence)?;
        }
        if let Ok(factor) = env::var("RATELIMITD_ADAPTIVE_MAX_FACTOR") {
            config.adaptive.max_adjustment_factor =
                parse_env("RATELIMITD_ADAPTIVE_MAX_FACTOR", &factor)?;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.default_limits.validate()?;
        for (key, limits) in &self.key_limits {
            limits
                .validate()
                .map_err(|e| Error::ConfigViolation(format!("key '{}': {}", key, e)))?;
        }
        for rule in &self.pattern_limits {
            rule.limits
                .validate()
                .map_err(|e| Error::ConfigViolation(format!("pattern '{}': {}", rule.pattern, e)))?;
        }
        if self.adaptive.max_adjustment_factor < 1.0 {
            return Err(Error::ConfigViolation(
                "adaptive max_adjustment_factor must be >= 1.0".to_string(),
            ));
        }
        if self.adaptive.min_capacity > self.adaptive.max_capacity {
            return Err(Error::ConfigViolation(
                "adaptive min_capacity must not exceed max_capacity".to_string(),
            ));
        }
        Ok(())
    }

    pub fn uses_redis(&self) -> bool {
        !self.redis_url.is_empty()
    }
}

fn parse_env<T: FromStr>(name: &str, value: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| Error::ConfigViolation(format!("cannot parse {}='{}'", name, value)))
}

/// The immutable limit tables the resolver walks.
pub struct LimitsSnapshot {
    pub defaults: RateLimitConfig,
    pub key_limits: HashMap<String, RateLimitConfig>,
    pub patterns: Vec<CompiledPattern>,
    next_pattern_seq: u64,
}

impl LimitsSnapshot {
    fn from_config(config: &Config) -> Result<Self> {
        let mut patterns = Vec::with_capacity(config.pattern_limits.len());
        let mut next_seq = 0;
        for (index, rule) in config.pattern_limits.iter().enumerate() {
            let mut rule = rule.clone();
            if rule.created_seq == 0 {
                rule.created_seq = index as u64 + 1;
            }
            next_seq = next_seq.max(rule.created_seq);
            patterns.push(CompiledPattern::compile(rule)?);
        }
        Ok(Self {
            defaults: config.default_limits.clone(),
            key_limits: config.key_limits.clone(),
            patterns,
            next_pattern_seq: next_seq + 1,
        })
    }
}

/// Shared handle to the active limit tables. Writers rebuild and swap;
/// readers load a consistent snapshot pointer.
pub struct LimitsHandle {
    snapshot: ArcSwap<LimitsSnapshot>,
}

impl LimitsHandle {
    pub fn new(config: &Config) -> Result<Self> {
        Ok(Self {
            snapshot: ArcSwap::from_pointee(LimitsSnapshot::from_config(config)?),
        })
    }

    pub fn load(&self) -> Arc<LimitsSnapshot> {
        self.snapshot.load_full()
    }

    /// Atomically replaces the whole table set (the reload endpoint).
    pub fn replace(&self, config: &Config) -> Result<()> {
        self.snapshot
            .store(Arc::new(LimitsSnapshot::from_config(config)?));
        Ok(())
    }

    pub fn set_key_limit(&self, key: &str, limits: RateLimitConfig) -> Result<()> {
        limits.validate()?;
        self.rcu(|snapshot| {
            snapshot.key_limits.insert(key.to_string(), limits.clone());
        });
        Ok(())
    }

    pub fn remove_key_limit(&self, key: &str) -> bool {
        let existed = self.load().key_limits.contains_key(key);
        if existed {
            self.rcu(|snapshot| {
                snapshot.key_limits.remove(key);
            });
        }
        existed
    }

    pub fn key_limit(&self, key: &str) -> Option<RateLimitConfig> {
        self.load().key_limits.get(key).cloned()
    }

    pub fn set_pattern_limit(&self, pattern: &str, limits: RateLimitConfig) -> Result<()> {
        limits.validate()?;
        // compile up front so a bad glob never reaches the snapshot
        let current = self.load();
        let seq = current
            .patterns
            .iter()
            .find(|p| p.rule.pattern == pattern)
            .map(|p| p.rule.created_seq)
            .unwrap_or(current.next_pattern_seq);
        let compiled = CompiledPattern::compile(PatternRule {
            pattern: pattern.to_string(),
            limits,
            created_seq: seq,
        })?;
        self.rcu(move |snapshot| {
            snapshot.patterns.retain(|p| p.rule.pattern != pattern);
            snapshot.next_pattern_seq = snapshot.next_pattern_seq.max(seq + 1);
            snapshot.patterns.push(compiled.clone());
        });
        Ok(())
    }

    pub fn remove_pattern_limit(&self, pattern: &str) -> bool {
        let existed = self
            .load()
            .patterns
            .iter()
            .any(|p| p.rule.pattern == pattern);
        if existed {
            self.rcu(|snapshot| {
                snapshot.patterns.retain(|p| p.rule.pattern != pattern);
            });
        }
        existed
    }

    pub fn set_defaults(&self, limits: RateLimitConfig) -> Result<()> {
        limits.validate()?;
        self.rcu(|snapshot| {
            snapshot.defaults = limits.clone();
        });
        Ok(())
    }

    /// Read-copy-update: admin writes are rare, cloning the tables is fine.
    fn rcu<F>(&self, mutate: F)
    where
        F: Fn(&mut MutableSnapshot),
    {
        let current = self.snapshot.load_full();
        let mut draft = MutableSnapshot {
            defaults: current.defaults.clone(),
            key_limits: current.key_limits.clone(),
            patterns: current.patterns.clone(),
            next_pattern_seq: current.next_pattern_seq,
        };
        mutate(&mut draft);
        self.snapshot.store(Arc::new(LimitsSnapshot {
            defaults: draft.defaults,
            key_limits: draft.key_limits,
            patterns: draft.patterns,
            next_pattern_seq: draft.next_pattern_seq,
        }));
    }
}

struct MutableSnapshot {
    defaults: RateLimitConfig,
    key_limits: HashMap<String, RateLimitConfig>,
    patterns: Vec<CompiledPattern>,
    next_pattern_seq: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert!(!config.uses_redis());
    }

    #[test]
    fn test_set_then_delete_key_limit_round_trip() {
        let handle = LimitsHandle::new(&Config::default()).unwrap();
        assert!(handle.key_limit("k").is_none());

        let limits = RateLimitConfig::new(7, 3, Algorithm::FixedWindow).with_window_ms(1000);
        handle.set_key_limit("k", limits.clone()).unwrap();
        assert_eq!(handle.key_limit("k").unwrap().capacity, 7);

        assert!(handle.remove_key_limit("k"));
        assert!(handle.key_limit("k").is_none());
    }

    #[test]
    fn test_invalid_limit_rejected_before_any_change() {
        let handle = LimitsHandle::new(&Config::default()).unwrap();
        let bad = RateLimitConfig::new(0, 1, Algorithm::TokenBucket);
        assert!(handle.set_key_limit("k", bad).is_err());
        assert!(handle.key_limit("k").is_none());
    }

    #[test]
    fn test_pattern_updates_keep_creation_order() {
        let handle = LimitsHandle::new(&Config::default()).unwrap();
        handle
            .set_pattern_limit("api:*", RateLimitConfig::default())
            .unwrap();
        handle
            .set_pattern_limit("user:*", RateLimitConfig::default())
            .unwrap();
        // re-setting the first pattern keeps its original sequence number
        handle
            .set_pattern_limit("api:*", RateLimitConfig::new(5, 5, Algorithm::TokenBucket))
            .unwrap();
        let snapshot = handle.load();
        let api = snapshot
            .patterns
            .iter()
            .find(|p| p.rule.pattern == "api:*")
            .unwrap();
        let user = snapshot
            .patterns
            .iter()
            .find(|p| p.rule.pattern == "user:*")
            .unwrap();
        assert!(api.rule.created_seq < user.rule.created_seq);
    }

    #[test]
    fn test_reload_swaps_whole_snapshot() {
        let handle = LimitsHandle::new(&Config::default()).unwrap();
        handle
            .set_key_limit("k", RateLimitConfig::default())
            .unwrap();

        let mut fresh = Config::default();
        fresh.default_limits.capacity = 42;
        handle.replace(&fresh).unwrap();

        let snapshot = handle.load();
        assert_eq!(snapshot.defaults.capacity, 42);
        assert!(snapshot.key_limits.is_empty());
    }
}
