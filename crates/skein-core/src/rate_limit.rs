//! Per-task-type token buckets.
//!
//! A bucket holds up to `capacity` tokens and refills continuously at
//! `tokens / period`. Starting a task costs one token. When the bucket is
//! empty the caller learns how long until the next token exists and defers
//! the task by that much.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::TaskType;
use crate::ports::Clock;

/// Rate in the `"<n>/<unit>"` form (`s`, `m`, `h`); a bare number means per second.
///
/// Capacity defaults to `n`, so a full bucket allows a burst of one period's
/// worth of tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RateLimitSpec {
    tokens: u32,
    period: Duration,
    capacity: u32,
}

impl RateLimitSpec {
    pub fn new(tokens: u32, period: Duration) -> Result<Self, RateLimitParseError> {
        if tokens == 0 {
            return Err(RateLimitParseError::new(format!("{tokens}/{period:?}"), "rate must be positive"));
        }
        if period.is_zero() {
            return Err(RateLimitParseError::new(format!("{tokens}/{period:?}"), "period must be positive"));
        }
        Ok(Self {
            tokens,
            period,
            capacity: tokens,
        })
    }

    pub fn per_second(tokens: u32) -> Result<Self, RateLimitParseError> {
        Self::new(tokens, Duration::from_secs(1))
    }

    pub fn per_minute(tokens: u32) -> Result<Self, RateLimitParseError> {
        Self::new(tokens, Duration::from_secs(60))
    }

    pub fn per_hour(tokens: u32) -> Result<Self, RateLimitParseError> {
        Self::new(tokens, Duration::from_secs(3600))
    }

    /// Override the burst size. Clamped to at least one token.
    pub fn with_capacity(mut self, capacity: u32) -> Self {
        self.capacity = capacity.max(1);
        self
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Tokens added per second.
    pub fn refill_rate(&self) -> f64 {
        f64::from(self.tokens) / self.period.as_secs_f64()
    }
}

impl FromStr for RateLimitSpec {
    type Err = RateLimitParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let (count, unit) = match trimmed.split_once('/') {
            Some((count, unit)) => (count.trim(), unit.trim()),
            None => (trimmed, "s"),
        };
        let tokens: u32 = count
            .parse()
            .map_err(|_| RateLimitParseError::new(s, "rate is not a whole number"))?;
        let period = match unit {
            "s" | "sec" | "second" => Duration::from_secs(1),
            "m" | "min" | "minute" => Duration::from_secs(60),
            "h" | "hour" => Duration::from_secs(3600),
            _ => return Err(RateLimitParseError::new(s, "unit must be s, m or h")),
        };
        Self::new(tokens, period).map_err(|e| RateLimitParseError::new(s, e.reason))
    }
}

impl TryFrom<String> for RateLimitSpec {
    type Error = RateLimitParseError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<RateLimitSpec> for String {
    fn from(spec: RateLimitSpec) -> Self {
        spec.to_string()
    }
}

impl fmt::Display for RateLimitSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.period.as_secs() {
            1 => write!(f, "{}/s", self.tokens),
            60 => write!(f, "{}/m", self.tokens),
            3600 => write!(f, "{}/h", self.tokens),
            _ => write!(f, "{}/{}s", self.tokens, self.period.as_secs_f64()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid rate limit {input:?}: {reason}")]
pub struct RateLimitParseError {
    pub input: String,
    pub reason: String,
}

impl RateLimitParseError {
    fn new(input: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            input: input.into(),
            reason: reason.into(),
        }
    }
}

/// Returned when a task type has no token left. Transient: the task is
/// deferred, never failed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("rate limited: {task_type} may run again in {wait:?}")]
pub struct RateLimited {
    pub task_type: TaskType,
    pub wait: Duration,
}

/// One bucket. Token count stays within `[0, capacity]`.
#[derive(Debug, Clone)]
pub struct TokenBucket {
    spec: RateLimitSpec,
    tokens: f64,
    last_refill: DateTime<Utc>,
}

impl TokenBucket {
    /// A full bucket.
    pub fn new(spec: RateLimitSpec, now: DateTime<Utc>) -> Self {
        Self {
            spec,
            tokens: f64::from(spec.capacity),
            last_refill: now,
        }
    }

    pub fn tokens(&self) -> f64 {
        self.tokens
    }

    pub fn spec(&self) -> &RateLimitSpec {
        &self.spec
    }

    /// Switch to a new rate. Tokens earned so far are settled under the old
    /// rate, then clamped to the new capacity. The bucket is never topped up.
    pub fn reconfigure(&mut self, spec: RateLimitSpec, now: DateTime<Utc>) {
        if self.spec == spec {
            return;
        }
        self.refill(now);
        self.spec = spec;
        self.tokens = self.tokens.min(f64::from(spec.capacity));
    }

    fn refill(&mut self, now: DateTime<Utc>) {
        if now <= self.last_refill {
            return;
        }
        let elapsed = (now - self.last_refill)
            .to_std()
            .unwrap_or(Duration::ZERO)
            .as_secs_f64();
        let added = elapsed * f64::from(self.spec.tokens) / self.spec.period.as_secs_f64();
        self.tokens = (self.tokens + added).min(f64::from(self.spec.capacity));
        self.last_refill = now;
    }

    /// Take one token, or return the wait until one is available.
    pub fn try_take(&mut self, now: DateTime<Utc>) -> Result<(), Duration> {
        self.refill(now);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            return Ok(());
        }
        let missing = 1.0 - self.tokens;
        // Round up to the millisecond so waiting exactly `wait` always suffices.
        let wait_secs = missing * self.spec.period.as_secs_f64() / f64::from(self.spec.tokens);
        let wait_ms = (wait_secs * 1000.0).ceil().max(1.0);
        Err(Duration::from_millis(wait_ms as u64))
    }
}

/// Buckets for every rate-limited task type, shared by all worker slots.
pub struct RateLimiter {
    clock: Arc<dyn Clock>,
    buckets: RwLock<HashMap<TaskType, Arc<Mutex<TokenBucket>>>>,
}

impl RateLimiter {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            buckets: RwLock::new(HashMap::new()),
        }
    }

    /// Take a token for `task_type` under `spec`.
    ///
    /// There is one bucket per task type. It is created full on first use. A
    /// different `spec` for the same task type (a per-signature override)
    /// reconfigures that bucket without refilling it.
    pub fn try_acquire(&self, task_type: &TaskType, spec: &RateLimitSpec) -> Result<(), RateLimited> {
        let now = self.clock.now();
        let bucket = self.bucket(task_type, spec, now);
        let mut bucket = bucket.lock().unwrap_or_else(|e| e.into_inner());
        bucket.reconfigure(*spec, now);
        bucket.try_take(now).map_err(|wait| RateLimited {
            task_type: task_type.clone(),
            wait,
        })
    }

    fn bucket(
        &self,
        task_type: &TaskType,
        spec: &RateLimitSpec,
        now: DateTime<Utc>,
    ) -> Arc<Mutex<TokenBucket>> {
        {
            let buckets = self.buckets.read().unwrap_or_else(|e| e.into_inner());
            if let Some(bucket) = buckets.get(task_type) {
                return Arc::clone(bucket);
            }
        }
        let mut buckets = self.buckets.write().unwrap_or_else(|e| e.into_inner());
        Arc::clone(
            buckets
                .entry(task_type.clone())
                .or_insert_with(|| Arc::new(Mutex::new(TokenBucket::new(*spec, now)))),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::ManualClock;
    use chrono::TimeZone;
    use rstest::rstest;

    fn clock() -> Arc<ManualClock> {
        Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        ))
    }

    #[rstest]
    #[case("10/m", 10, 60)]
    #[case("5/s", 5, 1)]
    #[case("100/h", 100, 3600)]
    #[case("3", 3, 1)]
    #[case(" 7 / m ", 7, 60)]
    fn parses_rate_strings(#[case] input: &str, #[case] tokens: u32, #[case] secs: u64) {
        let spec: RateLimitSpec = input.parse().unwrap();
        assert_eq!(spec.capacity(), tokens);
        assert_eq!(spec, RateLimitSpec::new(tokens, Duration::from_secs(secs)).unwrap());
    }

    #[rstest]
    #[case("")]
    #[case("0/m")]
    #[case("ten/m")]
    #[case("10/d")]
    fn rejects_bad_rate_strings(#[case] input: &str) {
        assert!(input.parse::<RateLimitSpec>().is_err());
    }

    #[test]
    fn serde_uses_string_form() {
        let spec = RateLimitSpec::per_minute(10).unwrap();
        assert_eq!(serde_json::to_string(&spec).unwrap(), "\"10/m\"");
        let back: RateLimitSpec = serde_json::from_str("\"10/m\"").unwrap();
        assert_eq!(back, spec);
    }

    #[test]
    fn eleventh_acquire_in_a_minute_is_denied_until_refill() {
        let clock = clock();
        let limiter = RateLimiter::new(clock.clone());
        let task = TaskType::new("add");
        let spec = RateLimitSpec::per_minute(10).unwrap();

        for _ in 0..10 {
            limiter.try_acquire(&task, &spec).unwrap();
        }
        let denied = limiter.try_acquire(&task, &spec).unwrap_err();
        assert!(denied.wait > Duration::ZERO);
        assert_eq!(denied.wait, Duration::from_secs(6));

        clock.advance(denied.wait);
        limiter.try_acquire(&task, &spec).unwrap();
        assert!(limiter.try_acquire(&task, &spec).is_err());
    }

    #[test]
    fn buckets_are_per_task_type() {
        let limiter = RateLimiter::new(clock());
        let spec = RateLimitSpec::per_minute(1).unwrap();

        limiter.try_acquire(&TaskType::new("a"), &spec).unwrap();
        assert!(limiter.try_acquire(&TaskType::new("a"), &spec).is_err());
        limiter.try_acquire(&TaskType::new("b"), &spec).unwrap();
    }

    #[test]
    fn alternating_rates_share_one_bucket() {
        let limiter = RateLimiter::new(clock());
        let task = TaskType::new("add");
        let one = RateLimitSpec::per_minute(1).unwrap();
        let two = RateLimitSpec::per_minute(2).unwrap();

        let granted = (0..100)
            .filter(|i| {
                let spec = if i % 2 == 0 { &one } else { &two };
                limiter.try_acquire(&task, spec).is_ok()
            })
            .count();
        assert_eq!(granted, 1);
    }

    #[test]
    fn reconfigure_keeps_earned_tokens_and_clamps_to_capacity() {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let mut bucket = TokenBucket::new(RateLimitSpec::per_second(10).unwrap(), start);
        for _ in 0..10 {
            bucket.try_take(start).unwrap();
        }

        // half a second at 10/s earns 5 tokens, clamped to the new capacity of 2
        let later = start + chrono::Duration::milliseconds(500);
        bucket.reconfigure(RateLimitSpec::per_minute(2).unwrap(), later);
        assert_eq!(bucket.tokens(), 2.0);
        assert_eq!(bucket.spec(), &RateLimitSpec::per_minute(2).unwrap());

        // switching to a larger rate does not top the bucket up
        bucket.try_take(later).unwrap();
        bucket.reconfigure(RateLimitSpec::per_second(100).unwrap(), later);
        assert_eq!(bucket.tokens(), 1.0);
    }

    #[test]
    fn tokens_never_exceed_capacity() {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let spec = RateLimitSpec::per_second(2).unwrap();
        let mut bucket = TokenBucket::new(spec, start);

        bucket.try_take(start).unwrap();
        bucket.refill(start + chrono::Duration::hours(1));
        assert_eq!(bucket.tokens(), 2.0);
    }

    #[test]
    fn concurrent_acquires_never_overspend() {
        let limiter = Arc::new(RateLimiter::new(clock()));
        let spec = RateLimitSpec::per_hour(50).unwrap();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let limiter = Arc::clone(&limiter);
                std::thread::spawn(move || {
                    (0..20)
                        .filter(|_| limiter.try_acquire(&TaskType::new("t"), &spec).is_ok())
                        .count()
                })
            })
            .collect();
        let granted: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(granted, 50);
    }
}
