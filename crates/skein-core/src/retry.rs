//! Retry policy: decides backoff delays.

use std::time::Duration;

use rand::Rng;

/// Delay schedule for retries.
///
/// `multiplier == 1.0` gives a constant delay; anything above grows the delay
/// exponentially up to `max_delay`.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Delay before the first retry.
    pub base_delay: Duration,

    /// Backoff multiplier.
    pub multiplier: f64,

    /// Upper bound for any single delay.
    pub max_delay: Duration,

    /// Pick a uniformly random delay in `[0, computed]` (full jitter).
    pub jitter: bool,
}

impl RetryPolicy {
    pub fn constant(delay: Duration) -> Self {
        Self {
            base_delay: delay,
            multiplier: 1.0,
            max_delay: delay,
            jitter: false,
        }
    }

    pub fn exponential(base_delay: Duration, multiplier: f64, max_delay: Duration) -> Self {
        Self {
            base_delay,
            multiplier,
            max_delay,
            jitter: false,
        }
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Delay before retry number `attempt` (1-indexed).
    ///
    /// `delay = base_delay * multiplier^(attempt - 1)`, capped at `max_delay`.
    /// With base=2s, multiplier=2.0: 2s, 4s, 8s, ...
    pub fn next_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let secs = self.base_delay.as_secs_f64() * self.multiplier.max(1.0).powi(exponent);
        let cap = self.max_delay.max(self.base_delay).as_secs_f64();
        let secs = if secs.is_finite() { secs.min(cap) } else { cap };

        let secs = if self.jitter && secs > 0.0 {
            rand::thread_rng().gen_range(0.0..=secs)
        } else {
            secs
        };
        // `cap` can sit exactly at the edge of what a Duration holds
        Duration::try_from_secs_f64(secs).unwrap_or(self.max_delay.max(self.base_delay))
    }
}

impl Default for RetryPolicy {
    /// Transport-level default: 100ms doubling up to 5s.
    fn default() -> Self {
        Self::exponential(Duration::from_millis(100), 2.0, Duration::from_secs(5))
    }
}
