//! Sliding window log.
//!
//! Each key stores a short log of `(timestamp, weight)` pairs. Entries older
//! than the window are pruned on every read, and requests landing in the
//! same second are merged into one entry, so a log never holds more than
//! `min(limit, window_secs)` entries.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, trace};

use crate::clock::Clock;
use crate::error::{Result, TollgateError};

use super::limit::Algorithm;
use super::limiter::{seconds_until, Limiter, MAX_SWAP_ATTEMPTS};
use super::result::RateLimitResult;
use super::storage::Storage;

/// Stored request log for one key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
struct RequestLog {
    /// `(timestamp, weight)` pairs in ascending timestamp order
    entries: Vec<(i64, u64)>,
}

impl RequestLog {
    fn decode(value: Option<&Value>) -> Result<Self> {
        match value {
            Some(value) => Ok(serde_json::from_value(value.clone())?),
            None => Ok(Self::default()),
        }
    }

    /// Drop entries that fell out of the window ending at `now`.
    fn prune(&mut self, now: i64, window_secs: u64) {
        let cutoff = now - window_secs as i64;
        self.entries.retain(|(at, _)| *at > cutoff);
    }

    fn used(&self) -> u64 {
        self.entries.iter().map(|(_, weight)| *weight).sum()
    }

    fn record(&mut self, now: i64, cost: u64) {
        match self.entries.last_mut() {
            Some((at, weight)) if *at == now => *weight += cost,
            _ => self.entries.push((now, cost)),
        }
    }

    /// When the oldest live entry leaves the window.
    fn reset_at(&self, now: i64, window_secs: u64) -> i64 {
        let oldest = self.entries.first().map(|(at, _)| *at).unwrap_or(now);
        oldest + window_secs as i64
    }

    /// Seconds until enough weight has left the window for `cost` to fit.
    fn retry_after(&self, now: i64, limit: u64, window_secs: u64, cost: u64) -> u64 {
        if cost > limit {
            return window_secs.max(1);
        }

        let excess = (self.used() + cost).saturating_sub(limit);
        let mut freed = 0;
        for (at, weight) in &self.entries {
            freed += weight;
            if freed >= excess {
                return seconds_until(at + window_secs as i64, now);
            }
        }
        window_secs.max(1)
    }
}

/// Sliding window limiter.
pub struct SlidingWindowLimiter {
    storage: Arc<dyn Storage>,
    clock: Arc<dyn Clock>,
}

impl SlidingWindowLimiter {
    pub fn new(storage: Arc<dyn Storage>, clock: Arc<dyn Clock>) -> Self {
        Self { storage, clock }
    }

    fn log_key(key: &str) -> String {
        format!("{}:log", key)
    }
}

impl Limiter for SlidingWindowLimiter {
    fn algorithm(&self) -> Algorithm {
        Algorithm::Sliding
    }

    fn attempt(
        &self,
        key: &str,
        limit: u64,
        window_secs: u64,
        cost: u64,
    ) -> Result<RateLimitResult> {
        let log_key = Self::log_key(key);

        for _ in 0..MAX_SWAP_ATTEMPTS {
            let now = self.clock.now();
            let stored = self.storage.get(&log_key)?;
            let mut log = RequestLog::decode(stored.as_ref())?;
            log.prune(now, window_secs);

            let used = log.used();
            if used + cost > limit {
                debug!(key = %log_key, used = used, limit = limit, "Sliding window limit exceeded");
                let retry_after = log.retry_after(now, limit, window_secs, cost);
                return Ok(RateLimitResult::denied(
                    limit,
                    limit.saturating_sub(used),
                    log.reset_at(now, window_secs),
                    Some(retry_after),
                )
                .with_cost(cost));
            }

            log.record(now, cost);
            let updated = serde_json::to_value(&log)?;
            if self
                .storage
                .compare_and_swap(&log_key, stored.as_ref(), updated, window_secs)?
            {
                trace!(key = %log_key, used = used + cost, limit = limit, "Sliding window attempt");
                return Ok(RateLimitResult::allowed(
                    limit,
                    limit - used - cost,
                    log.reset_at(now, window_secs),
                )
                .with_cost(cost));
            }

            trace!(key = %log_key, "Sliding window log changed concurrently, retrying");
        }

        Err(TollgateError::Storage(format!(
            "too much contention on '{}'",
            log_key
        )))
    }

    fn check(&self, key: &str, limit: u64, window_secs: u64) -> Result<RateLimitResult> {
        let now = self.clock.now();
        let stored = self.storage.get(&Self::log_key(key))?;
        let mut log = RequestLog::decode(stored.as_ref())?;
        log.prune(now, window_secs);

        let used = log.used();
        let reset_at = log.reset_at(now, window_secs);
        if used >= limit {
            return Ok(RateLimitResult::denied(
                limit,
                0,
                reset_at,
                Some(log.retry_after(now, limit, window_secs, 1)),
            ));
        }

        Ok(RateLimitResult::allowed(limit, limit - used, reset_at))
    }

    fn reset(&self, key: &str, _window_secs: u64) -> Result<()> {
        self.storage.delete(&Self::log_key(key))?;
        Ok(())
    }
}
