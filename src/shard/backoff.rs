//! Reconnect backoff
//!
//! Exponential with additive jitter. Successive delays never shrink until
//! [`Backoff::reset`] is called, and never exceed the cap.

use std::time::Duration;

/// Largest exponent applied to the base delay.
const MAX_EXPONENT: u32 = 16;

#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    attempt: u32,
    last: Duration,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max: max.max(base),
            attempt: 0,
            last: Duration::ZERO,
        }
    }

    /// Delay before the next reconnect attempt.
    pub fn next_delay(&mut self) -> Duration {
        let exponential = self
            .base
            .saturating_mul(2u32.saturating_pow(self.attempt.min(MAX_EXPONENT)));
        let jitter = self.base.mul_f64(rand::random::<f64>());
        let delay = exponential
            .saturating_add(jitter)
            .max(self.last)
            .min(self.max);

        self.attempt = self.attempt.saturating_add(1);
        self.last = delay;
        delay
    }

    /// Back to the base delay, after a stable session or a server-requested reconnect.
    pub fn reset(&mut self) {
        self.attempt = 0;
        self.last = Duration::ZERO;
    }

    pub fn attempts(&self) -> u32 {
        self.attempt
    }
}
