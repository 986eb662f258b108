//! Exponential backoff between apply attempts.

use std::thread;
use std::time::{Duration, Instant};

use crate::context::CancelToken;

/// Granularity of cancellation checks while sleeping
const SLEEP_SLICE: Duration = Duration::from_millis(100);

/// Exponential backoff schedule
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Backoff {
    /// Delay after the first failed attempt
    pub base_delay: Duration,
    /// Multiplier applied per further attempt
    pub factor: f64,
    /// Upper bound for a single delay
    pub max_delay: Duration,
}

impl Backoff {
    pub fn new(base_delay: Duration) -> Self {
        Self {
            base_delay,
            factor: 2.0,
            max_delay: Duration::from_secs(300),
        }
    }

    /// Delay after the given failed attempt (1-indexed)
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31) as i32;
        let delay = self.base_delay.as_secs_f64() * self.factor.powi(exponent);
        Duration::from_secs_f64(delay.min(self.max_delay.as_secs_f64()))
    }
}

/// Sleep for `delay`, waking early if the run is cancelled
///
/// Returns `false` if cancellation cut the sleep short.
pub fn sleep_unless_cancelled(delay: Duration, cancel: &CancelToken) -> bool {
    let until = Instant::now() + delay;
    loop {
        if cancel.is_cancelled() {
            return false;
        }
        let left = until.saturating_duration_since(Instant::now());
        if left.is_zero() {
            return true;
        }
        thread::sleep(left.min(SLEEP_SLICE));
    }
}
