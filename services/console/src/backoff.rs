//! Reconnect backoff policy.

use std::time::Duration;

/// Exponential backoff with a hard delay ceiling and an attempt ceiling.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    pub initial: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
    pub max_attempts: u32,
    pub jitter: bool,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(3_000),
            multiplier: 1.5,
            max_delay: Duration::from_secs(30),
            max_attempts: 5,
            jitter: true,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before reconnect attempt `attempt` (1-based):
    /// `min(initial * multiplier^(attempt-1), max_delay)`, with jitter pulling
    /// the result down to no less than half the capped value.
    pub fn delay(&self, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        #[allow(clippy::cast_precision_loss)]
        let base = self.initial.as_millis() as f64
            * self.multiplier.powi(i32::try_from(attempt - 1).unwrap_or(i32::MAX));
        #[allow(clippy::cast_precision_loss)]
        let capped = base.min(self.max_delay.as_millis() as f64);
        let ms = if self.jitter {
            capped * (0.5 + rand::random::<f64>() * 0.5)
        } else {
            capped
        };
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        Duration::from_millis(ms as u64)
    }
}
