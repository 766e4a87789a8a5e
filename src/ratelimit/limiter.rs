//! Common contract for the throttling algorithms.

use std::sync::Arc;

use crate::clock::Clock;
use crate::error::Result;

use super::fixed_window::FixedWindowLimiter;
use super::limit::Algorithm;
use super::result::RateLimitResult;
use super::sliding_window::SlidingWindowLimiter;
use super::storage::Storage;
use super::token_bucket::TokenBucketLimiter;

/// Number of compare-and-swap rounds a limiter tries before giving up on a
/// contended key.
pub(crate) const MAX_SWAP_ATTEMPTS: usize = 16;

/// A throttling algorithm evaluated against shared storage.
///
/// Implementations hold no per-key state of their own; everything lives in
/// the [`Storage`] backend so that several workers can share one limit.
pub trait Limiter: Send + Sync {
    /// The algorithm this limiter implements.
    fn algorithm(&self) -> Algorithm;

    /// Consume `cost` units of quota for `key`.
    fn attempt(&self, key: &str, limit: u64, window_secs: u64, cost: u64)
        -> Result<RateLimitResult>;

    /// Report the state of `key` without consuming anything.
    fn check(&self, key: &str, limit: u64, window_secs: u64) -> Result<RateLimitResult>;

    /// Forget everything stored for `key`.
    fn reset(&self, key: &str, window_secs: u64) -> Result<()>;
}

/// Build the limiter for `algorithm` on top of `storage`.
pub fn create_limiter(
    algorithm: Algorithm,
    storage: Arc<dyn Storage>,
    clock: Arc<dyn Clock>,
) -> Arc<dyn Limiter> {
    match algorithm {
        Algorithm::Fixed => Arc::new(FixedWindowLimiter::new(storage, clock)),
        Algorithm::Sliding => Arc::new(SlidingWindowLimiter::new(storage, clock)),
        Algorithm::TokenBucket => Arc::new(TokenBucketLimiter::new(storage, clock)),
    }
}

/// Seconds from `now` until `at`, never less than one.
pub(crate) fn seconds_until(at: i64, now: i64) -> u64 {
    at.saturating_sub(now).max(1) as u64
}
