//! Token-bucket rate limiting for mutating and expensive operations.
//!
//! Each operation class gets its own bucket so that, for example, a burst of
//! record edits cannot starve a manual reload. Checks never block: a refused
//! request gets a `retry_after_ms` hint computed from the token deficit.

use std::fmt;
use std::sync::{Mutex, PoisonError};
use std::time::Instant;

use serde::Serialize;

use crate::config::{BucketConfig, RateLimitConfig};

/// Operation classes with independent budgets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationClass {
    /// Bulk CSV imports.
    Import,
    /// Record mutations.
    Mutation,
    /// Manual full reloads.
    Reload,
    /// Opening user-chosen files.
    FsOpen,
}

impl fmt::Display for OperationClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OperationClass::Import => "import",
            OperationClass::Mutation => "mutation",
            OperationClass::Reload => "reload",
            OperationClass::FsOpen => "fs-open",
        };
        f.write_str(s)
    }
}

/// Outcome of a rate limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitDecision {
    /// Whether the tokens were consumed.
    pub allowed: bool,
    /// How long until enough tokens will be available. `None` when allowed,
    /// or when the cost exceeds the bucket capacity and can never succeed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
}

impl RateLimitDecision {
    fn allowed() -> Self {
        Self {
            allowed: true,
            retry_after_ms: None,
        }
    }

    fn denied(retry_after_ms: Option<u64>) -> Self {
        Self {
            allowed: false,
            retry_after_ms,
        }
    }
}

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// A single token bucket.
#[derive(Debug)]
pub struct RateLimiter {
    capacity: f64,
    refill_per_sec: f64,
    bucket: Mutex<Bucket>,
}

impl RateLimiter {
    /// Create a full bucket.
    pub fn new(capacity: f64, refill_per_sec: f64) -> Self {
        Self {
            capacity,
            refill_per_sec,
            bucket: Mutex::new(Bucket {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Create a full bucket from configuration.
    pub fn from_config(config: &BucketConfig) -> Self {
        Self::new(config.capacity, config.refill_per_sec)
    }

    /// Maximum burst size.
    pub fn capacity(&self) -> f64 {
        self.capacity
    }

    /// Tokens restored per second.
    pub fn refill_per_sec(&self) -> f64 {
        self.refill_per_sec
    }

    /// Try to take `cost` tokens now.
    pub fn try_consume(&self, cost: u32) -> RateLimitDecision {
        self.try_consume_at(cost, Instant::now())
    }

    /// Try to take `cost` tokens as of `now`.
    pub fn try_consume_at(&self, cost: u32, now: Instant) -> RateLimitDecision {
        let cost = f64::from(cost);
        let mut bucket = self.bucket.lock().unwrap_or_else(PoisonError::into_inner);
        self.refill(&mut bucket, now);

        if cost > self.capacity {
            return RateLimitDecision::denied(None);
        }
        if bucket.tokens >= cost {
            bucket.tokens -= cost;
            return RateLimitDecision::allowed();
        }

        let deficit = cost - bucket.tokens;
        let retry_after_ms = (deficit / self.refill_per_sec * 1000.0).ceil() as u64;
        RateLimitDecision::denied(Some(retry_after_ms))
    }

    /// Current balance, after refilling.
    pub fn tokens(&self) -> f64 {
        self.tokens_at(Instant::now())
    }

    /// Balance as of `now`, after refilling.
    pub fn tokens_at(&self, now: Instant) -> f64 {
        let mut bucket = self.bucket.lock().unwrap_or_else(PoisonError::into_inner);
        self.refill(&mut bucket, now);
        bucket.tokens
    }

    fn refill(&self, bucket: &mut Bucket, now: Instant) {
        let elapsed = now.saturating_duration_since(bucket.last_refill).as_secs_f64();
        if elapsed > 0.0 {
            bucket.tokens = (bucket.tokens + elapsed * self.refill_per_sec).min(self.capacity);
            bucket.last_refill = now;
        }
    }
}

/// One limiter per operation class.
#[derive(Debug)]
pub struct RateLimiters {
    import: RateLimiter,
    mutation: RateLimiter,
    reload: RateLimiter,
    fs_open: RateLimiter,
}

impl RateLimiters {
    /// Build the limiters from configuration.
    pub fn from_config(config: &RateLimitConfig) -> Self {
        Self {
            import: RateLimiter::from_config(&config.import),
            mutation: RateLimiter::from_config(&config.mutation),
            reload: RateLimiter::from_config(&config.reload),
            fs_open: RateLimiter::from_config(&config.fs_open),
        }
    }

    /// The limiter for `class`.
    pub fn get(&self, class: OperationClass) -> &RateLimiter {
        match class {
            OperationClass::Import => &self.import,
            OperationClass::Mutation => &self.mutation,
            OperationClass::Reload => &self.reload,
            OperationClass::FsOpen => &self.fs_open,
        }
    }

    /// Take one token from `class`.
    pub fn try_consume(&self, class: OperationClass) -> RateLimitDecision {
        let decision = self.get(class).try_consume(1);
        if !decision.allowed {
            tracing::debug!(
                class = %class,
                retry_after_ms = ?decision.retry_after_ms,
                "Rate limit reached"
            );
        }
        decision
    }
}

impl Default for RateLimiters {
    fn default() -> Self {
        Self::from_config(&RateLimitConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::time::Duration;

    #[test]
    fn test_burst_then_refusal() {
        let limiter = RateLimiter::new(5.0, 0.1);
        let now = Instant::now();

        for i in 0..5 {
            assert!(limiter.try_consume_at(1, now).allowed, "request {i} should pass");
        }

        let sixth = limiter.try_consume_at(1, now);
        assert!(!sixth.allowed);
        assert_eq!(sixth.retry_after_ms, Some(10_000));
    }

    #[test]
    fn test_refill_restores_tokens() {
        let limiter = RateLimiter::new(2.0, 1.0);
        let start = Instant::now();

        assert!(limiter.try_consume_at(2, start).allowed);
        assert!(!limiter.try_consume_at(1, start).allowed);

        let later = start + Duration::from_millis(1_500);
        assert!(limiter.try_consume_at(1, later).allowed);
        assert!((limiter.tokens_at(later) - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_refill_is_capped_at_capacity() {
        let limiter = RateLimiter::new(3.0, 10.0);
        let later = Instant::now() + Duration::from_secs(60);
        assert_eq!(limiter.tokens_at(later), 3.0);
    }

    #[test]
    fn test_cost_above_capacity_never_succeeds() {
        let limiter = RateLimiter::new(2.0, 1.0);
        let decision = limiter.try_consume(3);
        assert!(!decision.allowed);
        assert_eq!(decision.retry_after_ms, None);
        assert_eq!(limiter.tokens_at(Instant::now()), 2.0);
    }

    #[test]
    fn test_retry_hint_uses_deficit() {
        let limiter = RateLimiter::new(4.0, 2.0);
        let now = Instant::now();
        assert!(limiter.try_consume_at(3, now).allowed);

        let decision = limiter.try_consume_at(4, now);
        assert!(!decision.allowed);
        // 3 tokens short at 2 tokens/s
        assert_eq!(decision.retry_after_ms, Some(1_500));
    }

    #[test]
    fn test_classes_are_independent() {
        let limiters = RateLimiters::from_config(&RateLimitConfig {
            import: BucketConfig::new(1.0, 0.1),
            ..RateLimitConfig::default()
        });

        assert!(limiters.try_consume(OperationClass::Import).allowed);
        assert!(!limiters.try_consume(OperationClass::Import).allowed);
        assert!(limiters.try_consume(OperationClass::Mutation).allowed);
        assert!(limiters.try_consume(OperationClass::Reload).allowed);
    }

    #[test]
    fn test_decision_serializes_camel_case() {
        let json = serde_json::to_value(RateLimitDecision::denied(Some(250))).unwrap();
        assert_eq!(json["allowed"], false);
        assert_eq!(json["retryAfterMs"], 250);
    }

    proptest! {
        #[test]
        fn prop_tokens_follow_refill_formula(
            capacity in 1u32..100,
            refill in 0.01f64..50.0,
            consumed_fraction in 0.0f64..=1.0,
            wait_ms in 0u64..120_000,
        ) {
            let limiter = RateLimiter::new(f64::from(capacity), refill);
            let start = Instant::now();
            let n = (f64::from(capacity) * consumed_fraction).floor() as u32;

            prop_assert!(limiter.try_consume_at(n, start).allowed);

            let waited = Duration::from_millis(wait_ms);
            let expected = (f64::from(capacity) - f64::from(n) + waited.as_secs_f64() * refill)
                .min(f64::from(capacity));
            let actual = limiter.tokens_at(start + waited);
            prop_assert!((actual - expected).abs() < 1e-6, "expected {expected}, got {actual}");
        }
    }
}
