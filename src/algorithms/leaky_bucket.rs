//! Leaky bucket rate limiting algorithm.
//!
//! Arrivals queue in the bucket and drain at a constant rate. A request is
//! accepted while the queue has room for all `n` arrivals, and the caller
//! gets a wait hint describing how far back in the queue it landed; a full
//! queue denies synchronously. Nothing is deferred: the decision is final
//! at call time in both storage backends.

use super::{ceil_div_u128, BucketSnapshot, Decision, NANOS_PER_SEC};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Queue of pending arrivals, served at `leak_rate` per second.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeakyBucket {
    capacity: u64,
    leak_rate: u64,
    queue: VecDeque<u64>,
    last_leak_ns: u64,
}

impl LeakyBucket {
    pub fn new(capacity: u64, leak_rate: u64, now_ns: u64) -> Self {
        Self {
            capacity,
            leak_rate,
            queue: VecDeque::new(),
            last_leak_ns: now_ns,
        }
    }

    /// How many arrivals have drained by `now_ns`, without mutating.
    fn drained_by(&self, now_ns: u64) -> u64 {
        let elapsed = now_ns.saturating_sub(self.last_leak_ns);
        (elapsed as u128 * self.leak_rate as u128 / NANOS_PER_SEC as u128) as u64
    }

    fn leak(&mut self, now_ns: u64) {
        let drained = self.drained_by(now_ns);
        if drained == 0 {
            return;
        }
        if drained >= self.queue.len() as u64 {
            self.queue.clear();
            // an empty bucket does not bank leak credit
            self.last_leak_ns = now_ns;
        } else {
            for _ in 0..drained {
                self.queue.pop_front();
            }
            let consumed_ns =
                (drained as u128 * NANOS_PER_SEC as u128 / self.leak_rate as u128) as u64;
            self.last_leak_ns += consumed_ns;
        }
    }

    pub fn try_consume(&mut self, n: u64, now_ns: u64) -> Decision {
        self.leak(now_ns);
        let depth = self.queue.len() as u64;

        if depth + n <= self.capacity {
            for _ in 0..n {
                self.queue.push_back(now_ns);
            }
            // wait hint: time until the new arrivals reach the head
            let hint = (depth as u128 * 1000 / self.leak_rate as u128) as u64;
            Decision {
                allowed: true,
                remaining: self.capacity - self.queue.len() as u64,
                retry_after_ms: hint,
            }
        } else {
            let overflow = depth + n - self.capacity;
            Decision::denied(
                self.capacity - depth,
                ceil_div_u128(overflow as u128 * 1000, self.leak_rate as u128),
            )
        }
    }

    pub fn check(&self, n: u64, now_ns: u64) -> Decision {
        let drained = self.drained_by(now_ns).min(self.queue.len() as u64);
        let depth = self.queue.len() as u64 - drained;
        if depth + n <= self.capacity {
            let hint = (depth as u128 * 1000 / self.leak_rate as u128) as u64;
            Decision {
                allowed: true,
                remaining: self.capacity - depth - n,
                retry_after_ms: hint,
            }
        } else {
            let overflow = depth + n - self.capacity;
            Decision::denied(
                self.capacity - depth,
                ceil_div_u128(overflow as u128 * 1000, self.leak_rate as u128),
            )
        }
    }

    /// Removes the `n` most recent arrivals.
    pub fn credit(&mut self, n: u64) {
        for _ in 0..n {
            if self.queue.pop_back().is_none() {
                break;
            }
        }
    }

    pub fn snapshot(&self) -> BucketSnapshot {
        BucketSnapshot::LeakyBucket {
            queued: self.queue.len() as u64,
            last_leak_ns: self.last_leak_ns,
        }
    }
}
