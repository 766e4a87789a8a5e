//! Token bucket.
//!
//! A bucket holds up to `limit` tokens and refills continuously at
//! `limit / window_secs` tokens per second. A request of cost `n` needs `n`
//! tokens at once, which lets a full bucket absorb a burst while an empty
//! one has to wait for the refill.
//!
//! A cost above `limit` can never be admitted since the bucket is capped at
//! `limit`. Such requests are denied with a full window as `retry_after`,
//! the same answer the sliding window gives.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, trace};

use crate::clock::Clock;
use crate::error::{Result, TollgateError};

use super::limit::Algorithm;
use super::limiter::{Limiter, MAX_SWAP_ATTEMPTS};
use super::result::RateLimitResult;
use super::storage::Storage;

/// Stored state of one bucket.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
struct BucketState {
    tokens: f64,
    last_refill: i64,
}

impl BucketState {
    fn full(limit: u64, now: i64) -> Self {
        Self {
            tokens: limit as f64,
            last_refill: now,
        }
    }

    fn decode(value: Option<&Value>, limit: u64, now: i64) -> Result<Self> {
        match value {
            Some(value) => Ok(serde_json::from_value(value.clone())?),
            None => Ok(Self::full(limit, now)),
        }
    }

    /// Tokens available at `now`, capped at `limit`.
    fn refilled(&self, now: i64, refill: Refill) -> f64 {
        let elapsed = now.saturating_sub(self.last_refill).max(0) as f64;
        (self.tokens + refill.tokens_after(elapsed)).min(refill.limit as f64)
    }
}

/// Refill schedule: `limit` tokens every `window_secs` seconds.
///
/// Multiplying before dividing keeps whole-second refills exact.
#[derive(Debug, Clone, Copy)]
struct Refill {
    limit: u64,
    window_secs: u64,
}

impl Refill {
    fn new(limit: u64, window_secs: u64) -> Self {
        Self {
            limit,
            window_secs: window_secs.max(1),
        }
    }

    fn tokens_after(&self, elapsed_secs: f64) -> f64 {
        elapsed_secs * self.limit as f64 / self.window_secs as f64
    }

    /// Whole seconds needed to accumulate `deficit` tokens.
    fn seconds_to_accumulate(&self, deficit: f64) -> u64 {
        if deficit <= 0.0 || self.limit == 0 {
            return 0;
        }
        (deficit * self.window_secs as f64 / self.limit as f64).ceil() as u64
    }

    /// When a bucket holding `tokens` at `now` is full again.
    fn full_at(&self, now: i64, tokens: f64) -> i64 {
        now + self.seconds_to_accumulate(self.limit as f64 - tokens) as i64
    }
}

/// Token bucket limiter.
pub struct TokenBucketLimiter {
    storage: Arc<dyn Storage>,
    clock: Arc<dyn Clock>,
}

impl TokenBucketLimiter {
    pub fn new(storage: Arc<dyn Storage>, clock: Arc<dyn Clock>) -> Self {
        Self { storage, clock }
    }

    fn bucket_key(key: &str) -> String {
        format!("{}:bucket", key)
    }
}

impl Limiter for TokenBucketLimiter {
    fn algorithm(&self) -> Algorithm {
        Algorithm::TokenBucket
    }

    fn attempt(
        &self,
        key: &str,
        limit: u64,
        window_secs: u64,
        cost: u64,
    ) -> Result<RateLimitResult> {
        let bucket_key = Self::bucket_key(key);
        let refill = Refill::new(limit, window_secs);

        for _ in 0..MAX_SWAP_ATTEMPTS {
            let now = self.clock.now();
            let stored = self.storage.get(&bucket_key)?;
            let state = BucketState::decode(stored.as_ref(), limit, now)?;
            let tokens = state.refilled(now, refill);

            if cost > limit || tokens < cost as f64 {
                let retry_after = if cost > limit {
                    window_secs.max(1)
                } else {
                    refill.seconds_to_accumulate(cost as f64 - tokens).max(1)
                };
                debug!(
                    key = %bucket_key,
                    tokens = tokens,
                    cost = cost,
                    retry_after = retry_after,
                    "Token bucket empty"
                );
                return Ok(RateLimitResult::denied(
                    limit,
                    tokens.floor() as u64,
                    refill.full_at(now, tokens),
                    Some(retry_after),
                )
                .with_cost(cost));
            }

            let next = BucketState {
                tokens: tokens - cost as f64,
                last_refill: now,
            };
            let updated = serde_json::to_value(next)?;
            if self
                .storage
                .compare_and_swap(&bucket_key, stored.as_ref(), updated, window_secs)?
            {
                trace!(key = %bucket_key, tokens = next.tokens, "Token bucket attempt");
                return Ok(RateLimitResult::allowed(
                    limit,
                    next.tokens.floor() as u64,
                    refill.full_at(now, next.tokens),
                )
                .with_cost(cost));
            }

            trace!(key = %bucket_key, "Token bucket changed concurrently, retrying");
        }

        Err(TollgateError::Storage(format!(
            "too much contention on '{}'",
            bucket_key
        )))
    }

    fn check(&self, key: &str, limit: u64, window_secs: u64) -> Result<RateLimitResult> {
        let now = self.clock.now();
        let refill = Refill::new(limit, window_secs);
        let stored = self.storage.get(&Self::bucket_key(key))?;
        let tokens = BucketState::decode(stored.as_ref(), limit, now)?.refilled(now, refill);
        let reset_at = refill.full_at(now, tokens);

        if tokens < 1.0 {
            return Ok(RateLimitResult::denied(
                limit,
                0,
                reset_at,
                Some(refill.seconds_to_accumulate(1.0 - tokens).max(1)),
            ));
        }

        Ok(RateLimitResult::allowed(limit, tokens.floor() as u64, reset_at))
    }

    fn reset(&self, key: &str, _window_secs: u64) -> Result<()> {
        self.storage.delete(&Self::bucket_key(key))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::ratelimit::storage::MemoryStorage;

    fn create_limiter() -> (Arc<ManualClock>, TokenBucketLimiter) {
        let clock = Arc::new(ManualClock::new(50_000));
        let storage = Arc::new(MemoryStorage::new(clock.clone()));
        (clock.clone(), TokenBucketLimiter::new(storage, clock))
    }

    #[test]
    fn test_new_bucket_starts_full() {
        let (_, limiter) = create_limiter();

        let result = limiter.check("ip:1", 10, 10).unwrap();
        assert!(result.is_allowed());
        assert_eq!(result.remaining(), 10);
        assert_eq!(result.reset_at(), 50_000);
    }

    #[test]
    fn test_full_bucket_absorbs_burst() {
        let (_, limiter) = create_limiter();

        let result = limiter.attempt("ip:1", 10, 10, 8).unwrap();
        assert!(result.is_allowed());
        assert_eq!(result.remaining(), 2);
        assert_eq!(result.cost(), 8);

        let result = limiter.attempt("ip:1", 10, 10, 3).unwrap();
        assert!(!result.is_allowed());
        assert_eq!(result.remaining(), 2);
        assert_eq!(result.retry_after(), Some(1));
    }

    #[test]
    fn test_cost_larger_than_limit_is_denied() {
        let (clock, limiter) = create_limiter();

        let result = limiter.attempt("ip:1", 10, 20, 11).unwrap();
        assert!(!result.is_allowed());
        assert_eq!(result.remaining(), 10);
        assert_eq!(result.retry_after(), Some(20));

        // Waiting never helps, and nothing was taken from the bucket.
        clock.advance(1_000);
        assert!(!limiter.attempt("ip:1", 10, 20, 11).unwrap().is_allowed());
        assert!(limiter.attempt("ip:1", 10, 20, 10).unwrap().is_allowed());
    }

    #[test]
    fn test_refill_after_empty() {
        let (clock, limiter) = create_limiter();

        assert!(limiter.attempt("ip:1", 10, 10, 10).unwrap().is_allowed());

        let result = limiter.attempt("ip:1", 10, 10, 1).unwrap();
        assert!(!result.is_allowed());
        assert_eq!(result.retry_after(), Some(1));

        clock.advance(5);
        for _ in 0..5 {
            assert!(limiter.attempt("ip:1", 10, 10, 1).unwrap().is_allowed());
        }
        assert!(!limiter.attempt("ip:1", 10, 10, 1).unwrap().is_allowed());
    }

    #[test]
    fn test_refill_is_capped_at_limit() {
        let (clock, limiter) = create_limiter();
        limiter.attempt("ip:1", 10, 10, 4).unwrap();

        clock.advance(1_000);
        let result = limiter.check("ip:1", 10, 10).unwrap();
        assert_eq!(result.remaining(), 10);
    }

    #[test]
    fn test_fractional_refill_rate() {
        let (clock, limiter) = create_limiter();

        // One token every 30 seconds.
        limiter.attempt("ip:1", 2, 60, 2).unwrap();
        let result = limiter.attempt("ip:1", 2, 60, 1).unwrap();
        assert!(!result.is_allowed());
        assert_eq!(result.retry_after(), Some(30));
        assert_eq!(result.reset_at(), 50_060);

        clock.advance(29);
        assert!(!limiter.attempt("ip:1", 2, 60, 1).unwrap().is_allowed());
        clock.advance(1);
        assert!(limiter.attempt("ip:1", 2, 60, 1).unwrap().is_allowed());
    }

    #[test]
    fn test_check_does_not_consume() {
        let (_, limiter) = create_limiter();
        limiter.attempt("ip:1", 10, 10, 3).unwrap();

        for _ in 0..5 {
            assert_eq!(limiter.check("ip:1", 10, 10).unwrap().remaining(), 7);
        }
    }

    #[test]
    fn test_reset_refills_bucket() {
        let (_, limiter) = create_limiter();
        limiter.attempt("ip:1", 5, 60, 5).unwrap();

        limiter.reset("ip:1", 60).unwrap();
        assert_eq!(limiter.check("ip:1", 5, 60).unwrap().remaining(), 5);
    }
}
