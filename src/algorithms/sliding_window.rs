//! Sliding window log rate limiting algorithm.
//!
//! Tracks the individual timestamps of admitted requests and admits a new
//! one only while fewer than `capacity` live within the trailing window.
//! Memory is bounded by `capacity`; the log can never grow past it.
//!
//! The window is half-open: a timestamp exactly `window` old has aged out,
//! which is what makes the boundary tie-break an "allow".

use super::{BucketSnapshot, Decision, NANOS_PER_MS};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Ordered log of admitted request timestamps within the trailing window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlidingWindowLog {
    capacity: u64,
    window_ns: u64,
    timestamps: VecDeque<u64>,
}

impl SlidingWindowLog {
    pub fn new(capacity: u64, window_ms: u64) -> Self {
        Self {
            capacity,
            window_ns: window_ms.saturating_mul(NANOS_PER_MS),
            timestamps: VecDeque::new(),
        }
    }

    /// Drops timestamps that have aged out of the window ending at `now_ns`.
    fn expire(&mut self, now_ns: u64) {
        while let Some(&oldest) = self.timestamps.front() {
            if oldest + self.window_ns <= now_ns {
                self.timestamps.pop_front();
            } else {
                break;
            }
        }
    }

    pub fn try_consume(&mut self, n: u64, now_ns: u64) -> Decision {
        self.expire(now_ns);
        let in_window = self.timestamps.len() as u64;

        if in_window + n <= self.capacity {
            for _ in 0..n {
                self.timestamps.push_back(now_ns);
            }
            Decision::allowed(self.capacity - self.timestamps.len() as u64)
        } else {
            Decision::denied(
                self.capacity.saturating_sub(in_window),
                self.retry_hint(n, now_ns, in_window),
            )
        }
    }

    /// Time until enough of the oldest entries age out to admit `n` more.
    fn retry_hint(&self, n: u64, now_ns: u64, in_window: u64) -> u64 {
        if n > self.capacity {
            // never satisfiable; report a full window as the hint
            return self.window_ns / NANOS_PER_MS;
        }
        let must_expire = (in_window + n - self.capacity) as usize;
        match self.timestamps.get(must_expire - 1) {
            Some(&ts) => {
                let ready_ns = (ts + self.window_ns).saturating_sub(now_ns);
                ready_ns.div_ceil(NANOS_PER_MS)
            }
            None => self.window_ns / NANOS_PER_MS,
        }
    }

    pub fn check(&self, n: u64, now_ns: u64) -> Decision {
        let expired = self
            .timestamps
            .iter()
            .take_while(|&&ts| ts + self.window_ns <= now_ns)
            .count();
        let live = (self.timestamps.len() - expired) as u64;
        if live + n <= self.capacity {
            Decision::allowed(self.capacity - live - n)
        } else {
            let retry = if n > self.capacity {
                self.window_ns / NANOS_PER_MS
            } else {
                let must_expire = (live + n - self.capacity) as usize;
                match self.timestamps.get(expired + must_expire - 1) {
                    Some(&ts) => (ts + self.window_ns)
                        .saturating_sub(now_ns)
                        .div_ceil(NANOS_PER_MS),
                    None => self.window_ns / NANOS_PER_MS,
                }
            };
            Decision::denied(self.capacity.saturating_sub(live), retry)
        }
    }

    /// Removes the `n` most recent entries (a compensated composite commit).
    pub fn credit(&mut self, n: u64) {
        for _ in 0..n {
            if self.timestamps.pop_back().is_none() {
                break;
            }
        }
    }

    pub fn snapshot(&self) -> BucketSnapshot {
        BucketSnapshot::SlidingWindow {
            in_window: self.timestamps.len() as u64,
            oldest_ns: self.timestamps.front().copied(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MS: u64 = NANOS_PER_MS;

    #[test]
    fn test_window_admits_up_to_capacity() {
        // capacity 3, window 1000ms
        let mut log = SlidingWindowLog::new(3, 1000);
        assert!(log.try_consume(1, 0).allowed);
        assert!(log.try_consume(1, 100 * MS).allowed);
        assert!(log.try_consume(1, 200 * MS).allowed);
        assert!(!log.try_consume(1, 300 * MS).allowed);
    }

    #[test]
    fn test_oldest_expiry_admits_again() {
        let mut log = SlidingWindowLog::new(3, 1000);
        log.try_consume(1, 0);
        log.try_consume(1, 100 * MS);
        log.try_consume(1, 200 * MS);
        assert!(!log.try_consume(1, 300 * MS).allowed);
        // at t=1001 the t=0 entry has aged out
        assert!(log.try_consume(1, 1001 * MS).allowed);
        // but the next is blocked until t=100 ages out
        assert!(!log.try_consume(1, 1050 * MS).allowed);
    }

    #[test]
    fn test_exact_window_boundary_allows() {
        let mut log = SlidingWindowLog::new(1, 1000);
        assert!(log.try_consume(1, 0).allowed);
        // exactly one window later the old entry is out
        assert!(log.try_consume(1, 1000 * MS).allowed);
    }

    #[test]
    fn test_retry_hint_points_at_oldest() {
        let mut log = SlidingWindowLog::new(2, 1000);
        log.try_consume(1, 0);
        log.try_consume(1, 400 * MS);
        let denied = log.try_consume(1, 500 * MS);
        assert!(!denied.allowed);
        // the oldest entry (t=0) ages out at t=1000 -> 500ms away
        assert_eq!(denied.retry_after_ms, 500);
    }

    #[test]
    fn test_batch_request_needs_room_for_all() {
        let mut log = SlidingWindowLog::new(5, 1000);
        log.try_consume(3, 0);
        assert!(!log.try_consume(3, 1 * MS).allowed);
        assert!(log.try_consume(2, 1 * MS).allowed);
    }

    #[test]
    fn test_log_never_exceeds_capacity() {
        let mut log = SlidingWindowLog::new(4, 1000);
        for i in 0..50 {
            log.try_consume(1, i * 10 * MS);
            assert!(log.timestamps.len() as u64 <= 4);
        }
    }

    #[test]
    fn test_check_is_pure() {
        let mut log = SlidingWindowLog::new(2, 1000);
        log.try_consume(2, 0);
        let before = log.timestamps.clone();
        let decision = log.check(1, 100 * MS);
        assert!(!decision.allowed);
        assert_eq!(log.timestamps, before);
    }

    #[test]
    fn test_credit_removes_newest() {
        let mut log = SlidingWindowLog::new(3, 1000);
        log.try_consume(1, 0);
        log.try_consume(2, 100 * MS);
        log.credit(2);
        assert_eq!(log.timestamps.len(), 1);
        assert_eq!(*log.timestamps.front().unwrap(), 0);
    }
}
