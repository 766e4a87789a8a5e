//! Fixed window counter.
//!
//! Time is cut into epoch-aligned windows of `window_secs`. Each window has
//! its own counter key with the window start baked in, so old windows
//! simply expire out of storage. Bursts of up to twice the limit are
//! possible across a window boundary.

use std::sync::Arc;

use tracing::{debug, trace};

use crate::clock::Clock;
use crate::error::Result;

use super::limit::Algorithm;
use super::limiter::{seconds_until, Limiter};
use super::result::RateLimitResult;
use super::storage::Storage;

/// Fixed window limiter.
pub struct FixedWindowLimiter {
    storage: Arc<dyn Storage>,
    clock: Arc<dyn Clock>,
}

impl FixedWindowLimiter {
    pub fn new(storage: Arc<dyn Storage>, clock: Arc<dyn Clock>) -> Self {
        Self { storage, clock }
    }

    /// Start and end of the window containing `now`.
    fn window_bounds(now: i64, window_secs: u64) -> (i64, i64) {
        let window = window_secs.max(1) as i64;
        let start = now - now.rem_euclid(window);
        (start, start + window)
    }

    fn bucket_key(key: &str, window_start: i64) -> String {
        format!("{}:{}", key, window_start)
    }

    fn current_count(&self, bucket_key: &str) -> Result<i64> {
        Ok(self
            .storage
            .get(bucket_key)?
            .and_then(|value| value.as_i64())
            .unwrap_or(0))
    }
}

impl Limiter for FixedWindowLimiter {
    fn algorithm(&self) -> Algorithm {
        Algorithm::Fixed
    }

    fn attempt(
        &self,
        key: &str,
        limit: u64,
        window_secs: u64,
        cost: u64,
    ) -> Result<RateLimitResult> {
        let now = self.clock.now();
        let (start, end) = Self::window_bounds(now, window_secs);
        let bucket_key = Self::bucket_key(key, start);

        let count = self
            .storage
            .increment(&bucket_key, cost as i64, seconds_until(end, now))?;

        trace!(key = %bucket_key, count = count, limit = limit, "Fixed window attempt");

        let remaining = (limit as i64).saturating_sub(count).max(0) as u64;
        if count > limit as i64 {
            debug!(key = %bucket_key, count = count, limit = limit, "Fixed window limit exceeded");
            return Ok(
                RateLimitResult::denied(limit, remaining, end, Some(seconds_until(end, now)))
                    .with_cost(cost),
            );
        }

        Ok(RateLimitResult::allowed(limit, remaining, end).with_cost(cost))
    }

    fn check(&self, key: &str, limit: u64, window_secs: u64) -> Result<RateLimitResult> {
        let now = self.clock.now();
        let (start, end) = Self::window_bounds(now, window_secs);
        let count = self.current_count(&Self::bucket_key(key, start))?;

        let remaining = (limit as i64).saturating_sub(count).max(0) as u64;
        if count >= limit as i64 {
            return Ok(RateLimitResult::denied(
                limit,
                0,
                end,
                Some(seconds_until(end, now)),
            ));
        }

        Ok(RateLimitResult::allowed(limit, remaining, end))
    }

    fn reset(&self, key: &str, window_secs: u64) -> Result<()> {
        let (start, _) = Self::window_bounds(self.clock.now(), window_secs);
        self.storage.delete(&Self::bucket_key(key, start))?;
        Ok(())
    }
}
