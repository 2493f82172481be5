//! Rate limit configuration values and pattern rules.
//!
//! A [`RateLimitConfig`] is an immutable value describing one limit: which
//! algorithm, how many tokens, how fast they come back. Buckets remember the
//! fingerprint of the config they were built from so the registry can detect
//! config changes and rebuild atomically.

use crate::error::{Error, Result};
use globset::{Glob, GlobMatcher};
use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

/// Largest capacity accepted at admin time. Sliding-window memory is bounded
/// by capacity, so absurd values are rejected before they can hurt.
pub const MAX_CAPACITY: u64 = 1_000_000;

/// Default window for the windowed algorithms when none is configured.
pub const DEFAULT_WINDOW_MS: u64 = 60_000;

/// Default idle-sweep interval for buckets built from this config.
pub const DEFAULT_CLEANUP_INTERVAL_MS: u64 = 60_000;

/// The rate limiting algorithms the service can run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Algorithm {
    TokenBucket,
    SlidingWindow,
    FixedWindow,
    LeakyBucket,
}

impl Algorithm {
    /// Short name used in Redis key namespaces (`rl:{algo}:{key}`) and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            Algorithm::TokenBucket => "token_bucket",
            Algorithm::SlidingWindow => "sliding_window",
            Algorithm::FixedWindow => "fixed_window",
            Algorithm::LeakyBucket => "leaky_bucket",
        }
    }
}

impl std::str::FromStr for Algorithm {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.to_ascii_uppercase().as_str() {
            "TOKEN_BUCKET" => Ok(Algorithm::TokenBucket),
            "SLIDING_WINDOW" => Ok(Algorithm::SlidingWindow),
            "FIXED_WINDOW" => Ok(Algorithm::FixedWindow),
            "LEAKY_BUCKET" => Ok(Algorithm::LeakyBucket),
            other => Err(Error::InvalidInput(format!("unknown algorithm '{}'", other))),
        }
    }
}

/// An immutable rate limit description.
///
/// # Example
///
/// ```rust
/// use ratelimitd::limits::{Algorithm, RateLimitConfig};
///
/// let config = RateLimitConfig::new(100, 10, Algorithm::TokenBucket);
/// assert!(config.validate().is_ok());
/// assert_eq!(config.capacity, 100);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Maximum tokens/requests the bucket may hold.
    pub capacity: u64,
    /// Tokens added (or leaked) per second.
    pub refill_rate: u64,
    /// Which algorithm interprets this config.
    pub algorithm: Algorithm,
    /// Window size for the windowed algorithms, milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub window_ms: Option<u64>,
    /// How often the idle sweeper visits buckets built from this config.
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval_ms: u64,
}

fn default_cleanup_interval() -> u64 {
    DEFAULT_CLEANUP_INTERVAL_MS
}

impl RateLimitConfig {
    pub fn new(capacity: u64, refill_rate: u64, algorithm: Algorithm) -> Self {
        Self {
            capacity,
            refill_rate,
            algorithm,
            window_ms: None,
            cleanup_interval_ms: DEFAULT_CLEANUP_INTERVAL_MS,
        }
    }

    pub fn with_window_ms(mut self, window_ms: u64) -> Self {
        self.window_ms = Some(window_ms);
        self
    }

    /// Window size, falling back to the default for windowed algorithms.
    pub fn window_ms_or_default(&self) -> u64 {
        self.window_ms.unwrap_or(DEFAULT_WINDOW_MS)
    }

    /// Checks the configuration invariants. Called before any admin write
    /// takes effect, so invalid configs never reach a bucket.
    pub fn validate(&self) -> Result<()> {
        if self.capacity < 1 {
            return Err(Error::ConfigViolation(
                "capacity must be at least 1".to_string(),
            ));
        }
        if self.capacity > MAX_CAPACITY {
            return Err(Error::ConfigViolation(format!(
                "capacity {} exceeds maximum {}",
                self.capacity, MAX_CAPACITY
            )));
        }
        if self.refill_rate < 1 {
            return Err(Error::ConfigViolation(
                "refill_rate must be at least 1 per second".to_string(),
            ));
        }
        if self.cleanup_interval_ms < 1 {
            return Err(Error::ConfigViolation(
                "cleanup_interval_ms must be at least 1".to_string(),
            ));
        }
        if let Some(window) = self.window_ms {
            if window < 1 {
                return Err(Error::ConfigViolation(
                    "window_ms must be at least 1".to_string(),
                ));
            }
        }
        Ok(())
    }

    /// Stable fingerprint of the limit parameters. A bucket created under one
    /// fingerprint is replaced when the effective config resolves to another.
    pub fn fingerprint(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.capacity.hash(&mut hasher);
        self.refill_rate.hash(&mut hasher);
        self.algorithm.hash(&mut hasher);
        self.window_ms.hash(&mut hasher);
        hasher.finish()
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self::new(100, 10, Algorithm::TokenBucket)
    }
}

/// A glob rule mapping keys like `api:*` to a shared limit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatternRule {
    pub pattern: String,
    pub limits: RateLimitConfig,
    /// Creation order, used as the final tie-break between matching rules.
    #[serde(default)]
    pub created_seq: u64,
}

/// A pattern rule with its compiled matcher and precomputed specificity.
///
/// Rules are compiled once per admin write, never on the hot path.
#[derive(Debug, Clone)]
pub struct CompiledPattern {
    pub rule: PatternRule,
    matcher: GlobMatcher,
    literal_prefix: usize,
    wildcards: usize,
}

impl CompiledPattern {
    pub fn compile(rule: PatternRule) -> Result<Self> {
        let glob = Glob::new(&rule.pattern)
            .map_err(|e| Error::InvalidInput(format!("bad pattern '{}': {}", rule.pattern, e)))?;
        let literal_prefix = rule
            .pattern
            .find(['*', '?', '['])
            .unwrap_or(rule.pattern.len());
        let wildcards = rule
            .pattern
            .chars()
            .filter(|c| matches!(c, '*' | '?'))
            .count();
        Ok(Self {
            matcher: glob.compile_matcher(),
            rule,
            literal_prefix,
            wildcards,
        })
    }

    pub fn matches(&self, key: &str) -> bool {
        self.matcher.is_match(key)
    }
}

/// Picks the winning pattern for a key: longest literal prefix first, then
/// fewest wildcards, then earliest creation.
pub fn select_pattern<'a>(patterns: &'a [CompiledPattern], key: &str) -> Option<&'a CompiledPattern> {
    patterns
        .iter()
        .filter(|p| p.matches(key))
        .min_by(|a, b| {
            b.literal_prefix
                .cmp(&a.literal_prefix)
                .then(a.wildcards.cmp(&b.wildcards))
                .then(a.rule.created_seq.cmp(&b.rule.created_seq))
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pattern(p: &str, seq: u64) -> CompiledPattern {
        CompiledPattern::compile(PatternRule {
            pattern: p.to_string(),
            limits: RateLimitConfig::default(),
            created_seq: seq,
        })
        .unwrap()
    }

    #[test]
    fn test_validate_rejects_zero_capacity() {
        let mut config = RateLimitConfig::default();
        config.capacity = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_absurd_capacity() {
        let mut config = RateLimitConfig::new(MAX_CAPACITY + 1, 10, Algorithm::SlidingWindow);
        config.window_ms = Some(1000);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_fingerprint_changes_with_parameters() {
        let a = RateLimitConfig::new(100, 10, Algorithm::TokenBucket);
        let mut b = a.clone();
        assert_eq!(a.fingerprint(), b.fingerprint());
        b.capacity = 200;
        assert_ne!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn test_longest_literal_prefix_wins() {
        let patterns = vec![pattern("api:*", 0), pattern("api:checkout:*", 1)];
        let selected = select_pattern(&patterns, "api:checkout:eu").unwrap();
        assert_eq!(selected.rule.pattern, "api:checkout:*");
    }

    #[test]
    fn test_fewest_wildcards_breaks_prefix_tie() {
        let patterns = vec![pattern("user:*:*", 0), pattern("user:*", 1)];
        let selected = select_pattern(&patterns, "user:42:eu").unwrap();
        assert_eq!(selected.rule.pattern, "user:*");
    }

    #[test]
    fn test_creation_order_is_final_tie_break() {
        let patterns = vec![pattern("k*:a*", 7), pattern("k*:b*", 3)];
        // Both have equal prefix length and wildcard count but only one matches.
        let selected = select_pattern(&patterns, "k1:a2").unwrap();
        assert_eq!(selected.rule.pattern, "k*:a*");

        let ambiguous = vec![pattern("api:*", 7), pattern("api:*", 3)];
        let selected = select_pattern(&ambiguous, "api:x").unwrap();
        assert_eq!(selected.rule.created_seq, 3);
    }

    #[test]
    fn test_no_match_returns_none() {
        let patterns = vec![pattern("api:*", 0)];
        assert!(select_pattern(&patterns, "user:1").is_none());
    }
}
