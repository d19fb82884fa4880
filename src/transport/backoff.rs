//! Retry backoff for shard requests

use std::time::Duration;

/// Exponential backoff helper
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    base_delay: Duration,
    max_delay: Duration,
    max_attempts: u32,
    current_attempt: u32,
}

impl ExponentialBackoff {
    /// Create a new exponential backoff
    ///
    /// # Arguments
    /// * `base_delay` - Delay before the first retry
    /// * `max_delay` - Ceiling for any single delay
    /// * `max_attempts` - Retries granted before the source counts as exhausted
    pub fn new(base_delay: Duration, max_delay: Duration, max_attempts: u32) -> Self {
        ExponentialBackoff {
            base_delay,
            max_delay,
            max_attempts,
            current_attempt: 0,
        }
    }

    /// Get the next delay, or None if max attempts reached
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.current_attempt >= self.max_attempts {
            return None;
        }

        let factor = 2u32.saturating_pow(self.current_attempt);
        self.current_attempt += 1;

        let delay = self.base_delay.checked_mul(factor).unwrap_or(self.max_delay);
        Some(delay.min(self.max_delay))
    }

    /// Reset after a successful read
    pub fn reset(&mut self) {
        self.current_attempt = 0;
    }

    /// Consecutive failures recorded so far
    pub fn attempts(&self) -> u32 {
        self.current_attempt
    }
}
