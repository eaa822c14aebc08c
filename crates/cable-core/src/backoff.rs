//! Exponential backoff with jitter.

use std::time::Duration;

/// Exponential backoff schedule.
#[derive(Debug, Clone, PartialEq)]
pub struct Backoff {
    /// Delay before the first retry.
    pub initial: Duration,
    /// Upper bound for any delay, jitter included.
    pub max: Duration,
    /// Growth factor between attempts.
    pub multiplier: f64,
    /// Maximum extra fraction added at random (0.0 disables jitter).
    pub jitter: f64,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(100),
            max: Duration::from_secs(5),
            multiplier: 2.0,
            jitter: 0.25,
        }
    }
}

impl Backoff {
    /// Create a schedule without jitter.
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            jitter: 0.0,
            ..Default::default()
        }
    }

    /// Set the jitter fraction.
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.max(0.0);
        self
    }

    /// Delay before retry number `attempt` (0-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let max_ms = self.max.as_millis() as f64;
        let base_ms = self.initial.as_millis() as f64;
        let exponent = attempt.min(64) as i32;
        let delay_ms = (base_ms * self.multiplier.powi(exponent)).min(max_ms);

        let delay_ms = if self.jitter > 0.0 {
            let jitter_factor = 1.0 + rand::random::<f64>() * self.jitter;
            (delay_ms * jitter_factor).min(max_ms)
        } else {
            delay_ms
        };

        Duration::from_millis(delay_ms as u64)
    }
}
