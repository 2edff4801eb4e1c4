//! Exponential backoff delays.
//!
//! The delay for attempt `n` (0-indexed) is `first × factor^n`, clamped to
//! `max`. The base is derived from the attempt number alone, so the delay
//! sequence is deterministic and never shrinks.

use std::time::Duration;

/// Exponential backoff parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    /// Delay before the first retry.
    pub first: Duration,
    /// Upper bound for any delay.
    pub max: Duration,
    /// Multiplicative growth factor.
    pub factor: f64,
}

impl BackoffPolicy {
    /// Doubling backoff from `first`, capped at `max`.
    pub fn doubling(first: Duration, max: Duration) -> Self {
        Self {
            first,
            max,
            factor: 2.0,
        }
    }

    /// Delay for the given attempt number (0-indexed).
    pub fn next(&self, attempt: u32) -> Duration {
        let exponent = attempt.min(i32::MAX as u32) as i32;
        let secs = self.first.as_secs_f64() * self.factor.powi(exponent);

        if !secs.is_finite() || secs < 0.0 || secs > self.max.as_secs_f64() {
            self.max
        } else {
            Duration::from_secs_f64(secs)
        }
    }
}

impl Default for BackoffPolicy {
    /// 1s doubling, capped at 30s.
    fn default() -> Self {
        Self::doubling(Duration::from_secs(1), Duration::from_secs(30))
    }
}
