//! Time sources for the rate limiting engine.
//!
//! Algorithm state (refill anchors, window starts, queue arrivals) is kept in
//! monotonic nanoseconds anchored at process start, so clock jumps never move
//! buckets backwards. Wall-clock time is used only where calendars matter:
//! schedule windows, geo-rule validity, and reporting timestamps.

use std::time::{Instant, SystemTime, UNIX_EPOCH};

/// Process-anchored time source.
///
/// `now_ns` is monotonic and starts near zero at process start; all bucket
/// state compares instants from the same anchor. Cloning shares the anchor.
#[derive(Debug, Clone, Copy)]
pub struct Clock {
    anchor: Instant,
}

impl Clock {
    pub fn new() -> Self {
        Self {
            anchor: Instant::now(),
        }
    }

    /// Monotonic nanoseconds since the process anchor.
    pub fn now_ns(&self) -> u64 {
        self.anchor.elapsed().as_nanos() as u64
    }

    /// Wall-clock milliseconds since the UNIX epoch.
    pub fn now_wall_ms(&self) -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as i64
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}
