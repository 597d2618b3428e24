//! Loop-rate limiter.
//!
//! [`Rate`] keeps a polling loop at a target frequency by sleeping away
//! whatever is left of the period after the loop body ran. Periods are whole
//! milliseconds measured on the monotonic clock.

use std::thread;
use std::time::{Duration, Instant};

/// Default frequency in Hz.
pub const DEFAULT_RATE_HZ: f64 = 10.0;

const MIN_PERIOD_MS: u64 = 1;
const MAX_PERIOD_MS: u64 = i32::MAX as u64;

/// Sleeps to hold a loop at a fixed frequency.
///
/// ```ignore
/// let mut rate = Rate::new(50.0);
/// loop {
///     poll_something();
///     rate.sleep();
/// }
/// ```
#[derive(Debug, Clone)]
pub struct Rate {
    period: Duration,
    start: Instant,
}

impl Rate {
    /// Creates a limiter for `hz` iterations per second.
    ///
    /// The period is clamped to at least 1 ms, so very high or non-positive
    /// frequencies degrade to 1 kHz rather than spinning.
    #[must_use]
    pub fn new(hz: f64) -> Self {
        Self {
            period: period_for(hz),
            start: Instant::now(),
        }
    }

    /// Returns the period between iterations.
    #[must_use]
    pub fn period(&self) -> Duration {
        self.period
    }

    /// Restarts the current period from now.
    pub fn reset(&mut self) {
        self.start = Instant::now();
    }

    /// Sleeps for the rest of the current period and starts the next one.
    ///
    /// Returns how long it slept, which is zero if the loop body already
    /// overran the period and never more than [`period`](Self::period).
    pub fn sleep(&mut self) -> Duration {
        let left = self.remaining();
        if !left.is_zero() {
            thread::sleep(left);
        }
        self.start = Instant::now();
        left
    }

    /// Returns what is left of the current period, clamped to `[0, period]`.
    #[must_use]
    pub fn remaining(&self) -> Duration {
        let elapsed_ms = u64::try_from(self.start.elapsed().as_millis()).unwrap_or(u64::MAX);
        let elapsed = Duration::from_millis(elapsed_ms);
        self.period.saturating_sub(elapsed).min(self.period)
    }
}

impl Default for Rate {
    fn default() -> Self {
        Self::new(DEFAULT_RATE_HZ)
    }
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn period_for(hz: f64) -> Duration {
    let millis = 1000.0 / hz;
    let millis = if millis.is_nan() || millis < MIN_PERIOD_MS as f64 {
        MIN_PERIOD_MS
    } else if millis > MAX_PERIOD_MS as f64 {
        MAX_PERIOD_MS
    } else {
        millis as u64
    };
    Duration::from_millis(millis)
}
