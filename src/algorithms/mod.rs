//! Rate limiting algorithms module
//!
//! The four bucket state machines live here. Each exposes the same atomic
//! primitive, `try_consume(n, now_ns)`, plus a pure `check` (dry run, no
//! mutation), a `credit` used by the composite limiter to undo a commit, and
//! a `snapshot` for admin and adaptive inspection.
//!
//! All time flows in as monotonic nanoseconds; the machines never read a
//! clock themselves, which keeps every step deterministic and testable.
//! Algorithm steps cannot fail; storage failures are a different layer.

pub mod fixed_window;
pub mod leaky_bucket;
pub mod sliding_window;
pub mod token_bucket;

pub use fixed_window::FixedWindowCounter;
pub use leaky_bucket::LeakyBucket;
pub use sliding_window::SlidingWindowLog;
pub use token_bucket::TokenBucket;

use crate::limits::{Algorithm, RateLimitConfig};
use serde::{Deserialize, Serialize};

pub const NANOS_PER_SEC: u64 = 1_000_000_000;
pub const NANOS_PER_MS: u64 = 1_000_000;

/// Outcome of one `try_consume` step.
///
/// Denials carry a retry hint; the leaky bucket also uses the hint on
/// allowed requests to report the expected queue delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Decision {
    pub allowed: bool,
    pub remaining: u64,
    pub retry_after_ms: u64,
}

impl Decision {
    pub fn allowed(remaining: u64) -> Self {
        Self {
            allowed: true,
            remaining,
            retry_after_ms: 0,
        }
    }

    pub fn denied(remaining: u64, retry_after_ms: u64) -> Self {
        Self {
            allowed: false,
            remaining,
            retry_after_ms,
        }
    }
}

/// Algorithm-specific state for one key.
#[derive(Debug, Clone)]
pub enum Bucket {
    TokenBucket(TokenBucket),
    SlidingWindow(SlidingWindowLog),
    FixedWindow(FixedWindowCounter),
    LeakyBucket(LeakyBucket),
}

impl Bucket {
    /// Builds the bucket shape the config calls for, full/empty as the
    /// algorithm defines its fresh state.
    pub fn for_config(config: &RateLimitConfig, now_ns: u64) -> Self {
        match config.algorithm {
            Algorithm::TokenBucket => {
                Bucket::TokenBucket(TokenBucket::new(config.capacity, config.refill_rate, now_ns))
            }
            Algorithm::SlidingWindow => Bucket::SlidingWindow(SlidingWindowLog::new(
                config.capacity,
                config.window_ms_or_default(),
            )),
            Algorithm::FixedWindow => Bucket::FixedWindow(FixedWindowCounter::new(
                config.capacity,
                config.window_ms_or_default(),
            )),
            Algorithm::LeakyBucket => {
                Bucket::LeakyBucket(LeakyBucket::new(config.capacity, config.refill_rate, now_ns))
            }
        }
    }

    /// The atomic consume step. Idempotent with respect to `now_ns`.
    pub fn try_consume(&mut self, n: u64, now_ns: u64) -> Decision {
        match self {
            Bucket::TokenBucket(b) => b.try_consume(n, now_ns),
            Bucket::SlidingWindow(b) => b.try_consume(n, now_ns),
            Bucket::FixedWindow(b) => b.try_consume(n, now_ns),
            Bucket::LeakyBucket(b) => b.try_consume(n, now_ns),
        }
    }

    /// Dry run: what `try_consume` would decide, with no state change.
    pub fn check(&self, n: u64, now_ns: u64) -> Decision {
        match self {
            Bucket::TokenBucket(b) => b.check(n, now_ns),
            Bucket::SlidingWindow(b) => b.check(n, now_ns),
            Bucket::FixedWindow(b) => b.check(n, now_ns),
            Bucket::LeakyBucket(b) => b.check(n, now_ns),
        }
    }

    /// Restores `n` previously consumed tokens. Used only to compensate a
    /// composite commit that lost a race; capped at the bucket's bounds.
    pub fn credit(&mut self, n: u64) {
        match self {
            Bucket::TokenBucket(b) => b.credit(n),
            Bucket::SlidingWindow(b) => b.credit(n),
            Bucket::FixedWindow(b) => b.credit(n),
            Bucket::LeakyBucket(b) => b.credit(n),
        }
    }

    /// Pure read of the current state.
    pub fn snapshot(&self) -> BucketSnapshot {
        match self {
            Bucket::TokenBucket(b) => b.snapshot(),
            Bucket::SlidingWindow(b) => b.snapshot(),
            Bucket::FixedWindow(b) => b.snapshot(),
            Bucket::LeakyBucket(b) => b.snapshot(),
        }
    }
}

/// Serializable view of a bucket's internals.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "algorithm", rename_all = "snake_case")]
pub enum BucketSnapshot {
    TokenBucket { tokens: u64, last_refill_ns: u64 },
    SlidingWindow { in_window: u64, oldest_ns: Option<u64> },
    FixedWindow { window_start_ms: u64, count: u64 },
    LeakyBucket { queued: u64, last_leak_ns: u64 },
}

/// Ceiling division in u128 to avoid overflow on large deficits.
pub(crate) fn ceil_div_u128(num: u128, den: u128) -> u64 {
    if den == 0 {
        return u64::MAX;
    }
    ((num + den - 1) / den) as u64
}
