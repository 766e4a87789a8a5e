//! Evaluating a request against a set of declared limits.
//!
//! Declared limits are AND-ed: every one of them must pass, and the most
//! restrictive outcome is what the caller sees. Quota is charged in
//! declaration order and evaluation stops at the first denial, so limits
//! after a denying one are never charged.

use std::borrow::Cow;
use std::sync::Arc;

use dashmap::DashMap;
use tracing::{debug, error, trace, warn};

use crate::clock::{Clock, SystemClock};
use crate::config::{FailurePolicy, HeaderConfig, TollgateConfig};
use crate::error::{Result, TollgateError};
use crate::headers::{self, ExceededResponse};
use crate::request::RequestContext;
use crate::tier::{normalize_tier, TierManager, TierResolver};

use super::key::KeyBuilder;
use super::limit::{Algorithm, LimitConfig};
use super::limiter::{create_limiter, Limiter};
use super::result::RateLimitResult;
use super::storage::{MemoryStorage, Storage};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    /// Consume quota, stop at the first denial
    Attempt,
    /// Read-only preview of every limit
    Check,
}

/// Orchestrates tier resolution, key derivation and limiter evaluation.
pub struct RateLimitManager {
    storage: Arc<dyn Storage>,
    clock: Arc<dyn Clock>,
    tiers: TierManager,
    resolver: TierResolver,
    keys: KeyBuilder,
    default_limit: LimitConfig,
    failure_policy: FailurePolicy,
    headers: HeaderConfig,
    /// One limiter per algorithm, created on first use
    limiters: DashMap<Algorithm, Arc<dyn Limiter>>,
}

impl RateLimitManager {
    /// Create a manager with built-in tiers and a 60 requests per minute
    /// IP fallback.
    pub fn new(storage: Arc<dyn Storage>, clock: Arc<dyn Clock>) -> Self {
        Self {
            storage,
            clock,
            tiers: TierManager::default(),
            resolver: TierResolver::default(),
            keys: KeyBuilder::default(),
            default_limit: LimitConfig::per_minute(60),
            failure_policy: FailurePolicy::default(),
            headers: HeaderConfig::default(),
            limiters: DashMap::new(),
        }
    }

    /// Create a manager from validated configuration.
    pub fn from_config(
        config: &TollgateConfig,
        storage: Arc<dyn Storage>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self::new(storage, clock)
            .with_tier_manager(config.tier_manager()?)
            .with_default_limit(config.default_limit()?)
            .with_failure_policy(config.failure_policy)
            .with_header_config(config.headers)
            .with_key_prefix(config.key_prefix.clone()))
    }

    /// Create a manager backed by in-process storage and the system clock.
    pub fn with_memory_storage(config: &TollgateConfig) -> Result<Self> {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let storage = Arc::new(MemoryStorage::new(clock.clone()));
        Self::from_config(config, storage, clock)
    }

    pub fn with_tier_manager(mut self, tiers: TierManager) -> Self {
        self.tiers = tiers;
        self
    }

    pub fn with_resolver(mut self, resolver: TierResolver) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn with_default_limit(mut self, limit: LimitConfig) -> Self {
        self.default_limit = limit;
        self
    }

    pub fn with_failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }

    pub fn with_header_config(mut self, headers: HeaderConfig) -> Self {
        self.headers = headers;
        self
    }

    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.keys = KeyBuilder::new(prefix);
        self
    }

    pub fn tier_manager(&self) -> &TierManager {
        &self.tiers
    }

    /// Tier the request would be evaluated under.
    pub fn resolve_tier<R: RequestContext + ?Sized>(&self, request: &R) -> String {
        self.resolver.resolve(request)
    }

    /// Charge `cost` against every applicable limit and return the most
    /// restrictive outcome.
    pub fn attempt<R: RequestContext + ?Sized>(
        &self,
        request: &R,
        limits: &[LimitConfig],
        cost: u64,
    ) -> RateLimitResult {
        self.evaluate(request, limits, cost, Mode::Attempt)
    }

    /// Preview every applicable limit without consuming quota.
    pub fn check<R: RequestContext + ?Sized>(
        &self,
        request: &R,
        limits: &[LimitConfig],
    ) -> RateLimitResult {
        self.evaluate(request, limits, 1, Mode::Check)
    }

    /// Clear the stored state of every limit that applies to `request`.
    pub fn reset<R: RequestContext + ?Sized>(
        &self,
        request: &R,
        limits: &[LimitConfig],
    ) -> Result<()> {
        let tier = self.resolver.resolve(request);
        for (limit, key) in self.targets(request, &tier, limits) {
            debug!(key = %key, "Resetting rate limit");
            self.limiter(limit.algorithm).reset(&key, limit.window_secs)?;
        }
        Ok(())
    }

    /// Response headers for `result`.
    pub fn headers(&self, result: &RateLimitResult) -> Vec<(String, String)> {
        headers::generate_headers(result, &self.headers, self.clock.now())
    }

    /// The 429 response for a denied `result`.
    pub fn exceeded_response(&self, result: &RateLimitResult) -> ExceededResponse {
        headers::create_exceeded_response(result, &self.headers, self.clock.now())
    }

    fn evaluate<R: RequestContext + ?Sized>(
        &self,
        request: &R,
        limits: &[LimitConfig],
        cost: u64,
        mode: Mode,
    ) -> RateLimitResult {
        let tier = self.resolver.resolve(request);

        if self.tiers.is_completely_unlimited(&tier) {
            trace!(tier = %tier, "Tier is unlimited, skipping rate limiting");
            return RateLimitResult::unlimited(Some(tier));
        }

        let mut most_restrictive: Option<RateLimitResult> = None;

        for (limit, key) in self.targets(request, &tier, limits) {
            let limiter = self.limiter(limit.algorithm);
            let outcome = match mode {
                Mode::Attempt => {
                    let effective_cost = limit.cost.saturating_mul(cost.max(1));
                    limiter.attempt(&key, limit.attempts, limit.window_secs, effective_cost)
                }
                Mode::Check => limiter.check(&key, limit.attempts, limit.window_secs),
            };

            let result = match outcome {
                Ok(result) => result,
                Err(e) => self.degrade(&key, &limit, e),
            }
            .with_tier(tier.as_str())
            .with_policy(headers::format_policy(
                limit.attempts,
                limit.window_secs,
                None,
            ));

            let denied = !result.is_allowed();
            let stricter = most_restrictive
                .as_ref()
                .map_or(true, |current| result.is_more_restrictive_than(current));
            if stricter {
                most_restrictive = Some(result);
            }

            if denied && mode == Mode::Attempt {
                debug!(
                    key = %key,
                    tier = %tier,
                    limit = limit.attempts,
                    window = limit.window_secs,
                    "Rate limit exceeded"
                );
                break;
            }
        }

        most_restrictive.unwrap_or_else(|| RateLimitResult::unlimited(Some(tier)))
    }

    /// Limits evaluated for `request` in `tier`, each paired with its key.
    ///
    /// Unlimited entries, entries scoped to another tier and entries that
    /// fail validation are left out.
    fn targets<R: RequestContext + ?Sized>(
        &self,
        request: &R,
        tier: &str,
        limits: &[LimitConfig],
    ) -> Vec<(LimitConfig, String)> {
        self.applicable(tier, limits)
            .iter()
            .filter(|limit| Self::applies_to(limit, tier))
            .filter(|limit| match limit.validate() {
                Ok(()) => true,
                Err(e) => {
                    warn!(tier = %tier, error = %e, "Skipping invalid rate limit");
                    false
                }
            })
            .map(|limit| (limit.clone(), self.keys.build(request, limit, tier)))
            .collect()
    }

    /// Declared limits, or the tier defaults, or the global default.
    fn applicable<'a>(&self, tier: &str, limits: &'a [LimitConfig]) -> Cow<'a, [LimitConfig]> {
        if !limits.is_empty() {
            return Cow::Borrowed(limits);
        }

        let defaults = self.tiers.create_default_limits(tier);
        if !defaults.is_empty() {
            return Cow::Owned(defaults);
        }

        Cow::Owned(vec![self.default_limit.clone()])
    }

    /// Whether `limit` is evaluated for a request in `tier`.
    fn applies_to(limit: &LimitConfig, tier: &str) -> bool {
        if limit.is_unlimited() {
            return false;
        }
        match &limit.tier {
            Some(scope) => normalize_tier(scope) == tier,
            None => true,
        }
    }

    fn limiter(&self, algorithm: Algorithm) -> Arc<dyn Limiter> {
        self.limiters
            .entry(algorithm)
            .or_insert_with(|| {
                debug!(algorithm = %algorithm, "Creating limiter");
                create_limiter(algorithm, self.storage.clone(), self.clock.clone())
            })
            .clone()
    }

    /// Result to use when the limiter could not reach storage.
    fn degrade(&self, key: &str, limit: &LimitConfig, e: TollgateError) -> RateLimitResult {
        let now = self.clock.now();
        let reset_at = now + limit.window_secs as i64;

        match self.failure_policy {
            FailurePolicy::Open => {
                warn!(key = %key, error = %e, "Rate limit storage failed, allowing request");
                RateLimitResult::allowed(limit.attempts, limit.attempts, reset_at)
            }
            FailurePolicy::Closed => {
                error!(key = %key, error = %e, "Rate limit storage failed, denying request");
                RateLimitResult::denied(limit.attempts, 0, reset_at, Some(limit.window_secs))
            }
        }
    }
}
