//! Capped exponential backoff for broker reconnects.

use std::time::Duration;

use rand::Rng;

/// Delay schedule: `initial`, doubling per failed attempt up to `max`, with
/// optional additive jitter that never exceeds `max`.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
    jitter_ratio: f64,
    attempts: u32,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        let max = max.max(initial);
        Self {
            initial,
            max,
            current: initial,
            jitter_ratio: 0.0,
            attempts: 0,
        }
    }

    /// Add up to `ratio * delay` of random extra wait to each delay. A
    /// ratio that is not a finite number disables jitter.
    pub fn with_jitter(mut self, ratio: f64) -> Self {
        self.jitter_ratio = if ratio.is_finite() {
            ratio.clamp(0.0, 1.0)
        } else {
            0.0
        };
        self
    }

    /// Delay before the next attempt. Advances the schedule.
    pub fn next_delay(&mut self) -> Duration {
        let base = self.current;
        self.current = self.current.saturating_mul(2).min(self.max);
        self.attempts = self.attempts.saturating_add(1);

        if self.jitter_ratio <= 0.0 || base >= self.max {
            return base;
        }
        let spread = base.mul_f64(self.jitter_ratio);
        let extra = spread.mul_f64(rand::thread_rng().gen_range(0.0..=1.0));
        base.saturating_add(extra).min(self.max)
    }

    /// Back to the initial delay after a successful attempt.
    pub fn reset(&mut self) {
        self.current = self.initial;
        self.attempts = 0;
    }

    /// Failed attempts since the last reset.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}
