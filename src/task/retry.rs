// src/task/retry.rs
//! Retry policy with exponential backoff
//!
//! A failed attempt is retried only when the error is retryable and attempts
//! remain. `CircuitOpen` failures wait at least `circuit_open_delay`, since
//! the breaker will keep rejecting until its reset timeout elapses.

use crate::utils::config::RetryConfig;
use crate::utils::errors::OrchestratorError;
use rand::Rng;
use std::time::Duration;

/// Backoff policy applied between attempts
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    base_delay: Duration,
    max_delay: Duration,
    multiplier: f64,
    jitter: bool,
    circuit_open_delay: Duration,
}

impl RetryPolicy {
    pub fn new(config: &RetryConfig) -> Self {
        Self {
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            multiplier: config.multiplier,
            jitter: config.jitter,
            circuit_open_delay: Duration::from_millis(config.circuit_open_delay_ms),
        }
    }

    /// Fixed delay between attempts, no jitter
    pub fn fixed(delay: Duration) -> Self {
        Self {
            base_delay: delay,
            max_delay: delay,
            multiplier: 1.0,
            jitter: false,
            circuit_open_delay: delay,
        }
    }

    /// Whether another attempt should follow `attempt` (1-based)
    pub fn should_retry(&self, error: &OrchestratorError, attempt: u32, max_attempts: u32) -> bool {
        attempt < max_attempts && error.is_retryable()
    }

    /// Delay before the attempt following `attempt` (1-based).
    ///
    /// Never shorter than the deterministic backoff; jitter only adds.
    pub fn delay_for(&self, attempt: u32, error: &OrchestratorError) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32) as i32;
        let scaled = self.base_delay.as_nanos() as f64 * self.multiplier.powi(exponent);
        let capped = scaled.min(self.max_delay.as_nanos() as f64);
        let mut delay = Duration::from_nanos(capped.round() as u64);

        if matches!(error, OrchestratorError::CircuitOpen { .. }) {
            delay = delay.max(self.circuit_open_delay);
        }

        if self.jitter && !delay.is_zero() {
            let extra = rand::thread_rng().gen_range(0.0..=0.25);
            delay += delay.mul_f64(extra);
        }

        delay
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(&RetryConfig::default())
    }
}
