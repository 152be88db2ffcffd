//! Loop clocks.
//!
//! Timers run on the monotonic clock so wall-clock jumps do not stretch or
//! shrink them; periodics and `now()` use wall-clock time.

use std::time::{Instant, SystemTime, UNIX_EPOCH};

use evapi_core::Tstamp;

/// Wall-clock time in seconds since the epoch.
pub fn wall_now() -> Tstamp {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// Monotonic seconds since an arbitrary, loop-private origin.
#[derive(Debug, Clone, Copy)]
pub struct MonoClock {
    origin: Instant,
}

impl MonoClock {
    pub fn new() -> Self {
        Self { origin: Instant::now() }
    }

    #[inline]
    pub fn now(&self) -> Tstamp {
        self.origin.elapsed().as_secs_f64()
    }
}

impl Default for MonoClock {
    fn default() -> Self {
        Self::new()
    }
}
