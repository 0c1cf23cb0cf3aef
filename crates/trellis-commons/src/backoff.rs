//! Reusable retry backoff policy.
//!
//! Used by the notification listener's reconnect loop; kept generic so any
//! retrying component shares one policy shape instead of inlined loops.

use rand::Rng;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    /// Maximum number of attempts; `None` retries forever.
    pub max_attempts: Option<u32>,
    pub base_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
    /// Fraction of the computed delay added/subtracted at random (0.0..1.0).
    pub jitter: f64,
}

impl BackoffPolicy {
    /// Policy for long-lived listeners: retry forever, 1s..60s.
    pub fn listener() -> Self {
        BackoffPolicy {
            max_attempts: None,
            base_delay: Duration::from_secs(1),
            multiplier: 2.0,
            max_delay: Duration::from_secs(60),
            jitter: 0.25,
        }
    }

    /// Delay before the given retry attempt (0-based), or `None` when the
    /// attempt budget is exhausted.
    pub fn delay_for(&self, attempt: u32) -> Option<Duration> {
        if let Some(max) = self.max_attempts {
            if attempt >= max {
                return None;
            }
        }
        let exp = self.multiplier.powi(attempt.min(30) as i32);
        let mut millis = (self.base_delay.as_millis() as f64 * exp)
            .min(self.max_delay.as_millis() as f64);
        if self.jitter > 0.0 {
            let spread = millis * self.jitter;
            let offset = rand::thread_rng().gen_range(-spread..=spread);
            millis = (millis + offset).max(0.0);
        }
        Some(Duration::from_millis(millis as u64))
    }
}
