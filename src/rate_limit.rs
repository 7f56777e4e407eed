//! Per-key token bucket admission control
//!
//! Buckets are kept in a bounded `moka` cache: keys idle longer than the configured
//! window, or beyond the maximum key count, are evicted. An evicted key comes back as
//! a full bucket, which is what a long-idle bucket would have refilled to anyway.

use moka::sync::Cache;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use crate::config::RateLimitConfig;

#[derive(Debug, Clone, Copy)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

impl Bucket {
    const fn full(
        capacity: f64,
        now: Instant,
    ) -> Self {
        Self {
            tokens: capacity,
            last_refill: now,
        }
    }

    fn refill(
        &mut self,
        capacity: f64,
        refill_per_second: f64,
        now: Instant,
    ) {
        // a non-finite rate would turn the balance into NaN, which never denies
        let rate = if refill_per_second.is_finite() { refill_per_second.max(0.0) } else { 0.0 };
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * rate).clamp(0.0, capacity);
        self.last_refill = now;
    }
}

/// In-memory token bucket limiter keyed by client identifier
pub struct RateLimiter {
    buckets: Cache<String, Arc<Mutex<Bucket>>>,
    capacity: u32,
    refill_per_second: f64,
}

impl RateLimiter {
    #[must_use]
    pub fn new(config: &RateLimitConfig) -> Self {
        let buckets = Cache::builder()
            .max_capacity(config.max_keys)
            .time_to_idle(config.idle_ttl)
            .build();

        Self {
            buckets,
            capacity: config.capacity,
            refill_per_second: config.refill_per_second,
        }
    }

    /// Admission check with the configured capacity and refill rate
    pub fn check(
        &self,
        key: &str,
    ) -> bool {
        self.allow(key, self.capacity, self.refill_per_second)
    }

    /// Take one token from `key`'s bucket if at least one is available.
    pub fn allow(
        &self,
        key: &str,
        capacity: u32,
        refill_per_second: f64,
    ) -> bool {
        self.allow_at(key, capacity, refill_per_second, Instant::now())
    }

    /// Same as [`RateLimiter::allow`] with an explicit clock reading.
    pub fn allow_at(
        &self,
        key: &str,
        capacity: u32,
        refill_per_second: f64,
        now: Instant,
    ) -> bool {
        let capacity = f64::from(capacity);
        let bucket = self
            .buckets
            .get_with(key.to_string(), || Arc::new(Mutex::new(Bucket::full(capacity, now))));

        let mut bucket = bucket.lock().unwrap_or_else(PoisonError::into_inner);
        bucket.refill(capacity, refill_per_second, now);

        if bucket.tokens < 1.0 {
            tracing::debug!(key, tokens = bucket.tokens, "rate limit bucket empty");
            return false;
        }

        bucket.tokens -= 1.0;
        true
    }

    /// Tokens currently stored for `key`, without refilling
    #[must_use]
    pub fn tokens(
        &self,
        key: &str,
    ) -> Option<f64> {
        self.buckets
            .get(key)
            .map(|bucket| bucket.lock().unwrap_or_else(PoisonError::into_inner).tokens)
    }

    /// Drop the bucket for `key`, as eviction would.
    pub fn reset(
        &self,
        key: &str,
    ) {
        self.buckets.invalidate(key);
    }

    /// Time until `key` regains one token at the configured rate
    #[must_use]
    pub fn retry_after(
        &self,
        key: &str,
    ) -> Duration {
        let missing = 1.0 - self.tokens(key).unwrap_or(f64::from(self.capacity));
        if missing <= 0.0 || self.refill_per_second <= 0.0 {
            return Duration::ZERO;
        }
        Duration::try_from_secs_f64(missing / self.refill_per_second).unwrap_or(Duration::MAX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(capacity: u32) -> RateLimiter {
        RateLimiter::new(&RateLimitConfig {
            capacity,
            refill_per_second: 1.0,
            max_keys: 1_000,
            idle_ttl: Duration::from_secs(600),
        })
    }

    #[test]
    fn test_fresh_key_allows_burst_up_to_capacity() {
        let limiter = limiter(30);
        let now = Instant::now();

        for i in 0..30 {
            assert!(limiter.allow_at("1.2.3.4", 30, 1.0, now), "call {i} should pass");
        }
        assert!(!limiter.allow_at("1.2.3.4", 30, 1.0, now));
    }

    #[test]
    fn test_denial_does_not_consume() {
        let limiter = limiter(1);
        let now = Instant::now();

        assert!(limiter.allow_at("k", 1, 2.0, now));
        assert!(!limiter.allow_at("k", 1, 2.0, now));
        assert!(!limiter.allow_at("k", 1, 2.0, now + Duration::from_millis(250)));
        // 0.5 tokens from the first wait were kept, 0.5 more arrive here
        assert!(limiter.allow_at("k", 1, 2.0, now + Duration::from_millis(500)));
    }

    #[test]
    fn test_keys_are_independent() {
        let limiter = limiter(1);
        let now = Instant::now();

        assert!(limiter.allow_at("a", 1, 0.0, now));
        assert!(!limiter.allow_at("a", 1, 0.0, now));
        assert!(limiter.allow_at("b", 1, 0.0, now));
    }

    #[test]
    fn test_refill_is_proportional_and_capped() {
        let capacity = 5;
        let rate = 2.0;

        for millis in [0_u64, 400, 500, 1_250, 2_000, 2_600, 10_000] {
            let limiter = limiter(capacity);
            let start = Instant::now();
            while limiter.allow_at("k", capacity, rate, start) {}
            assert!(limiter.tokens("k").unwrap() < 1.0);

            let later = start + Duration::from_millis(millis);
            let expected = (millis as f64 / 1000.0 * rate).min(f64::from(capacity));

            let mut admitted = 0;
            while limiter.allow_at("k", capacity, rate, later) {
                admitted += 1;
            }
            assert_eq!(admitted, expected.floor() as u32, "after {millis}ms");

            let tokens = limiter.tokens("k").unwrap();
            assert!((0.0..=f64::from(capacity)).contains(&tokens));
        }
    }

    #[test]
    fn test_reset_key_starts_full() {
        let limiter = limiter(2);
        let now = Instant::now();

        assert!(limiter.allow_at("k", 2, 0.0, now));
        assert!(limiter.allow_at("k", 2, 0.0, now));
        assert!(!limiter.allow_at("k", 2, 0.0, now));

        limiter.reset("k");
        assert!(limiter.allow_at("k", 2, 0.0, now));
        assert_eq!(limiter.tokens("k"), Some(1.0));
    }

    #[test]
    fn test_tiny_refill_rate_saturates_retry_after() {
        let limiter = RateLimiter::new(&RateLimitConfig {
            capacity: 1,
            refill_per_second: 1e-20,
            max_keys: 1_000,
            idle_ttl: Duration::from_secs(600),
        });
        assert!(limiter.check("k"));
        assert!(!limiter.check("k"));
        assert_eq!(limiter.retry_after("k"), Duration::MAX);
    }

    #[test]
    fn test_non_finite_refill_rate_still_denies() {
        let limiter = limiter(1);
        let now = Instant::now();

        for rate in [f64::INFINITY, f64::NAN] {
            limiter.reset("k");
            assert!(limiter.allow_at("k", 1, rate, now));
            assert!(!limiter.allow_at("k", 1, rate, now + Duration::from_secs(1)));
            let tokens = limiter.tokens("k").unwrap();
            assert!(tokens.is_finite() && tokens < 1.0);
        }
    }

    #[test]
    fn test_retry_after_reflects_deficit() {
        let limiter = limiter(1);
        assert_eq!(limiter.retry_after("nobody"), Duration::ZERO);
        assert!(limiter.check("k"));
        let wait = limiter.retry_after("k");
        assert!(wait > Duration::from_millis(900) && wait <= Duration::from_secs(1));
    }
}
