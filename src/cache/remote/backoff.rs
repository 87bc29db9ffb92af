//! Reconnect backoff policy

use std::time::Duration;

/// Exponential backoff: `base * 2^attempt`, capped at `max_delay`, for at
/// most `max_retries` attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub base: Duration,
    pub max_delay: Duration,
    pub max_retries: u32,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(1_000),
            max_delay: Duration::from_secs(30),
            max_retries: 5,
        }
    }
}

impl Backoff {
    /// Delay before reconnect attempt number `attempt` (0-based), or `None`
    /// once the retry budget is spent.
    pub fn delay(&self, attempt: u32) -> Option<Duration> {
        if attempt >= self.max_retries {
            return None;
        }
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        let delay = self
            .base
            .checked_mul(factor)
            .unwrap_or(self.max_delay);
        Some(delay.min(self.max_delay))
    }
}
