//! # Token Bucket Algorithm Implementation
//!
//! This module implements the [token bucket algorithm](https://en.wikipedia.org/wiki/Token_bucket)
//! for rate limiting. The token bucket is a simple, efficient algorithm that
//! allows controlled bursts while maintaining a long-term average rate.
//!
//! ## How It Works
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────────┐
//! │                         TOKEN BUCKET VISUALIZATION                          │
//! ├─────────────────────────────────────────────────────────────────────────────┤
//! │                                                                             │
//! │   Bucket State Over Time (capacity=10, refill_rate=2/sec):                  │
//! │                                                                             │
//! │   Time 0s:   [██████████] 10/10 tokens (full)                               │
//! │              ↓ 10 requests arrive, each consumes 1 token                    │
//! │                                                                             │
//! │   Time 0s:   [          ] 0/10 tokens (next request DENIED, retry 500ms)    │
//! │              ↓ 1 second passes (refill = 1 × 2 = 2 tokens)                  │
//! │                                                                             │
//! │   Time 1s:   [██        ] 2/10 tokens (two more allowed, third denied)      │
//! │                                                                             │
//! └─────────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Integer-Token Policy
//!
//! Tokens are whole units. The refill step grants `⌊elapsed × rate / 1s⌋`
//! tokens and advances the refill anchor by exactly the nanoseconds those
//! tokens cost, so the fractional remainder is never lost and never double
//! counted. When the bucket tops out, the anchor snaps to `now`: a full
//! bucket does not bank future credit.
//!
//! ## Edge Case Handling
//!
//! - **Overflow**: refill math runs in u128 before narrowing
//! - **Time skew**: saturating subtraction prevents anchor underflow
//! - **Boundary tie-break**: a request landing exactly when its tokens
//!   become available is allowed

use super::{ceil_div_u128, BucketSnapshot, Decision, NANOS_PER_SEC};
use serde::{Deserialize, Serialize};

/// A token bucket with time-based refill.
///
/// # Example
///
/// ```rust
/// use ratelimitd::algorithms::TokenBucket;
///
/// // 100 tokens max, refill at 10/second, created at t=0
/// let mut bucket = TokenBucket::new(100, 10, 0);
///
/// assert!(bucket.try_consume(1, 0).allowed);   // 99 remaining
/// assert!(bucket.try_consume(99, 0).allowed);  // 0 remaining
/// assert!(!bucket.try_consume(1, 0).allowed);  // denied, empty
/// ```
///
/// # Thread Safety
///
/// `TokenBucket` is `Clone` and serializable but not internally
/// synchronized; the store serializes access per key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenBucket {
    capacity: u64,
    refill_rate: u64,
    tokens: u64,
    last_refill_ns: u64,
}

impl TokenBucket {
    /// Creates a bucket at full capacity, anchored at `now_ns`.
    pub fn new(capacity: u64, refill_rate: u64, now_ns: u64) -> Self {
        Self {
            capacity,
            refill_rate,
            tokens: capacity,
            last_refill_ns: now_ns,
        }
    }

    /// Tokens and anchor as they would stand after refilling at `now_ns`.
    fn projected(&self, now_ns: u64) -> (u64, u64) {
        let elapsed = now_ns.saturating_sub(self.last_refill_ns);
        let earned =
            (elapsed as u128 * self.refill_rate as u128 / NANOS_PER_SEC as u128) as u64;
        if earned == 0 {
            return (self.tokens, self.last_refill_ns);
        }
        if self.tokens.saturating_add(earned) >= self.capacity {
            (self.capacity, now_ns)
        } else {
            let consumed_ns =
                (earned as u128 * NANOS_PER_SEC as u128 / self.refill_rate as u128) as u64;
            (self.tokens + earned, self.last_refill_ns + consumed_ns)
        }
    }

    fn refill(&mut self, now_ns: u64) {
        let (tokens, anchor) = self.projected(now_ns);
        self.tokens = tokens;
        self.last_refill_ns = anchor;
    }

    /// Attempts to consume `n` tokens at `now_ns`.
    ///
    /// Refills first, then consumes if `n` whole tokens are available.
    /// Denials report how long until the deficit refills.
    pub fn try_consume(&mut self, n: u64, now_ns: u64) -> Decision {
        self.refill(now_ns);

        if n <= self.tokens {
            self.tokens -= n;
            Decision::allowed(self.tokens)
        } else {
            let deficit = n - self.tokens;
            let retry_ms = ceil_div_u128(deficit as u128 * 1000, self.refill_rate as u128);
            Decision::denied(self.tokens, retry_ms)
        }
    }

    /// What `try_consume` would decide at `now_ns`, without mutating.
    pub fn check(&self, n: u64, now_ns: u64) -> Decision {
        let (tokens, _) = self.projected(now_ns);
        if n <= tokens {
            Decision::allowed(tokens - n)
        } else {
            let deficit = n - tokens;
            let retry_ms = ceil_div_u128(deficit as u128 * 1000, self.refill_rate as u128);
            Decision::denied(tokens, retry_ms)
        }
    }

    /// Restores `n` tokens, capped at capacity.
    pub fn credit(&mut self, n: u64) {
        self.tokens = self.tokens.saturating_add(n).min(self.capacity);
    }

    pub fn snapshot(&self) -> BucketSnapshot {
        BucketSnapshot::TokenBucket {
            tokens: self.tokens,
            last_refill_ns: self.last_refill_ns,
        }
    }
}
