//! Retry configuration and backoff calculation for transient failures.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Exponential-backoff retry configuration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Number of retries after the initial attempt.
    pub max_retries: u32,
    /// Delay before the first retry.
    pub initial_delay_ms: u64,
    /// Upper bound on any single delay.
    pub max_delay_ms: u64,
    /// Multiplier applied per attempt.
    pub backoff_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            initial_delay_ms: 5_000,
            max_delay_ms: 60_000,
            backoff_factor: 2.0,
        }
    }
}

impl RetryConfig {
    /// Backoff delay for a 0-based attempt index, with jitter in the
    /// 10%–50% band to avoid thundering herds.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.initial_delay_ms as f64 * self.backoff_factor.powi(attempt as i32);
        let jitter_frac = rand::rng().random_range(0.1..0.5);
        let with_jitter = base + base * jitter_frac;
        Duration::from_millis((with_jitter as u64).min(self.max_delay_ms))
    }
}
