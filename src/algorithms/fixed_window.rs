//! Fixed window counter rate limiting algorithm.
//!
//! The timeline is divided into windows aligned at multiples of `window_ms`;
//! each window carries an independent counter that resets exactly at the
//! boundary. Cheap and O(1), at the cost of permitting up to 2× capacity
//! across a boundary straddle, the classic trade against the sliding log.

use super::{BucketSnapshot, Decision, NANOS_PER_MS};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixedWindowCounter {
    capacity: u64,
    window_ms: u64,
    window_start_ms: u64,
    count: u64,
}

impl FixedWindowCounter {
    pub fn new(capacity: u64, window_ms: u64) -> Self {
        Self {
            capacity,
            window_ms: window_ms.max(1),
            window_start_ms: 0,
            count: 0,
        }
    }

    fn aligned(&self, now_ms: u64) -> u64 {
        now_ms / self.window_ms * self.window_ms
    }

    /// Resets the counter when `now` has crossed into a new window.
    fn roll(&mut self, now_ms: u64) {
        let current = self.aligned(now_ms);
        if current != self.window_start_ms {
            self.window_start_ms = current;
            self.count = 0;
        }
    }

    pub fn try_consume(&mut self, n: u64, now_ns: u64) -> Decision {
        let now_ms = now_ns / NANOS_PER_MS;
        self.roll(now_ms);

        if self.count + n <= self.capacity {
            self.count += n;
            Decision::allowed(self.capacity - self.count)
        } else {
            let retry = self.window_start_ms + self.window_ms - now_ms;
            Decision::denied(self.capacity - self.count, retry)
        }
    }

    pub fn check(&self, n: u64, now_ns: u64) -> Decision {
        let now_ms = now_ns / NANOS_PER_MS;
        let current = self.aligned(now_ms);
        let count = if current != self.window_start_ms {
            0
        } else {
            self.count
        };
        if count + n <= self.capacity {
            Decision::allowed(self.capacity - count - n)
        } else {
            Decision::denied(self.capacity - count, current + self.window_ms - now_ms)
        }
    }

    pub fn credit(&mut self, n: u64) {
        self.count = self.count.saturating_sub(n);
    }

    pub fn snapshot(&self) -> BucketSnapshot {
        BucketSnapshot::FixedWindow {
            window_start_ms: self.window_start_ms,
            count: self.count,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MS: u64 = NANOS_PER_MS;

    #[test]
    fn test_counts_within_one_window() {
        // capacity 2, window 1000ms
        let mut counter = FixedWindowCounter::new(2, 1000);
        assert!(counter.try_consume(1, 999 * MS).allowed);
        assert!(counter.try_consume(1, 999 * MS).allowed);
        assert!(!counter.try_consume(1, 999 * MS).allowed);
    }

    #[test]
    fn test_boundary_resets_exactly() {
        let mut counter = FixedWindowCounter::new(2, 1000);
        counter.try_consume(2, 999 * MS);
        assert!(!counter.try_consume(1, 999 * MS).allowed);
        // t=1000 starts a fresh window
        assert!(counter.try_consume(1, 1000 * MS).allowed);
        assert!(counter.try_consume(1, 1000 * MS).allowed);
        assert!(!counter.try_consume(1, 1000 * MS).allowed);
    }

    #[test]
    fn test_retry_hint_is_time_to_window_end() {
        let mut counter = FixedWindowCounter::new(1, 1000);
        counter.try_consume(1, 200 * MS);
        let denied = counter.try_consume(1, 600 * MS);
        assert!(!denied.allowed);
        assert_eq!(denied.retry_after_ms, 400);
    }

    #[test]
    fn test_count_never_exceeds_capacity() {
        let mut counter = FixedWindowCounter::new(3, 1000);
        for _ in 0..10 {
            counter.try_consume(1, 500 * MS);
        }
        assert_eq!(counter.count, 3);
    }

    #[test]
    fn test_check_does_not_advance_window() {
        let mut counter = FixedWindowCounter::new(2, 1000);
        counter.try_consume(2, 100 * MS);
        // a dry run in the next window sees a fresh counter
        let decision = counter.check(2, 1100 * MS);
        assert!(decision.allowed);
        // but the stored state is untouched
        assert_eq!(counter.window_start_ms, 0);
        assert_eq!(counter.count, 2);
    }

    #[test]
    fn test_credit_decrements() {
        let mut counter = FixedWindowCounter::new(5, 1000);
        counter.try_consume(3, 0);
        counter.credit(2);
        assert_eq!(counter.count, 1);
        counter.credit(10);
        assert_eq!(counter.count, 0);
    }
}
