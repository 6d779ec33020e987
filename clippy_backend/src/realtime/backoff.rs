//! Randomized exponential backoff for reconnects and supervised restarts.
//!
//! `base_delay(n) = min(cap, base * 2^n)`; the delay actually slept is the base
//! delay shrunk by a random fraction in `[0, randomization_factor]`, so it can
//! never exceed the cap.

use std::time::Duration;

use rand::Rng;

#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    randomization_factor: f64,
    attempt: u32,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration, randomization_factor: f64) -> Self {
        Self {
            base,
            max: max.max(base),
            randomization_factor: randomization_factor.clamp(0.0, 1.0),
            attempt: 0,
        }
    }

    /// Delay before jitter for a given attempt (0-indexed).
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base
            .checked_mul(factor)
            .unwrap_or(self.max)
            .min(self.max)
    }

    /// Compute the next jittered delay and advance the attempt counter.
    pub fn next_delay(&mut self) -> Duration {
        let base = self.base_delay(self.attempt);
        let shrink = if self.randomization_factor > 0.0 {
            rand::thread_rng().gen_range(0.0..=self.randomization_factor)
        } else {
            0.0
        };
        self.attempt = self.attempt.saturating_add(1);
        base.mul_f64(1.0 - shrink)
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn max(&self) -> Duration {
        self.max
    }
}
