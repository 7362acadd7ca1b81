//! Bounded exponential backoff shared by the ledger writer and the anchorer.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Upper bound for a single attempt of the guarded call.
    pub attempt_timeout: Duration,
    /// Fraction (0.0 to 1.0) of the delay randomised in either direction.
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(2),
            attempt_timeout: Duration::from_secs(5),
            jitter_factor: 0.25,
        }
    }
}

impl RetryPolicy {
    /// Delay to wait after the given (1-based) failed attempt.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(20);
        let base = self.base_delay.saturating_mul(1u32 << exponent);
        let capped = base.min(self.max_delay);

        if self.jitter_factor <= 0.0 || capped.is_zero() {
            return capped;
        }

        let jitter = self.jitter_factor.min(1.0);
        let factor = rand::thread_rng().gen_range((1.0 - jitter)..=(1.0 + jitter));
        capped.mul_f64(factor).min(self.max_delay)
    }
}
