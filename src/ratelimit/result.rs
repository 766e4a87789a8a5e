//! Outcome of a single rate limit evaluation.

use serde::Serialize;

/// Sentinel limit carried by results that were never metered.
pub const UNLIMITED: u64 = u64::MAX;

/// Immutable outcome of evaluating one request against one limit.
///
/// Results are built fresh on every evaluation. The `with_*` methods
/// return modified copies rather than mutating in place.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RateLimitResult {
    allowed: bool,
    limit: u64,
    remaining: u64,
    reset_at: i64,
    retry_after: Option<u64>,
    cost: u64,
    tier: Option<String>,
    policy: Option<String>,
}

impl RateLimitResult {
    /// A request that fits in the current window.
    pub fn allowed(limit: u64, remaining: u64, reset_at: i64) -> Self {
        Self {
            allowed: true,
            limit,
            remaining: remaining.min(limit),
            reset_at,
            retry_after: None,
            cost: 1,
            tier: None,
            policy: None,
        }
    }

    /// A request that exceeds the current window.
    pub fn denied(limit: u64, remaining: u64, reset_at: i64, retry_after: Option<u64>) -> Self {
        Self {
            allowed: false,
            limit,
            remaining: remaining.min(limit),
            reset_at,
            retry_after,
            cost: 1,
            tier: None,
            policy: None,
        }
    }

    /// A result for requests that are not metered at all.
    pub fn unlimited(tier: Option<String>) -> Self {
        Self {
            allowed: true,
            limit: UNLIMITED,
            remaining: UNLIMITED,
            reset_at: 0,
            retry_after: None,
            cost: 0,
            tier,
            policy: None,
        }
    }

    /// Copy of this result evaluated under `tier`.
    pub fn with_tier(&self, tier: impl Into<String>) -> Self {
        Self {
            tier: Some(tier.into()),
            ..self.clone()
        }
    }

    /// Copy of this result carrying a `RateLimit-Policy` descriptor.
    pub fn with_policy(&self, policy: impl Into<String>) -> Self {
        Self {
            policy: Some(policy.into()),
            ..self.clone()
        }
    }

    /// Copy of this result charged at `cost`.
    pub fn with_cost(&self, cost: u64) -> Self {
        Self {
            cost,
            ..self.clone()
        }
    }

    pub fn is_allowed(&self) -> bool {
        self.allowed
    }

    pub fn limit(&self) -> u64 {
        self.limit
    }

    pub fn remaining(&self) -> u64 {
        self.remaining
    }

    /// Absolute Unix timestamp at which the window or bucket resets.
    pub fn reset_at(&self) -> i64 {
        self.reset_at
    }

    /// Seconds to wait before retrying. Only set on denials.
    pub fn retry_after(&self) -> Option<u64> {
        self.retry_after
    }

    pub fn cost(&self) -> u64 {
        self.cost
    }

    pub fn tier(&self) -> Option<&str> {
        self.tier.as_deref()
    }

    pub fn policy(&self) -> Option<&str> {
        self.policy.as_deref()
    }

    /// Whether this result carries one of the "no limit" sentinels.
    pub fn is_unlimited(&self) -> bool {
        self.limit == 0 || self.limit == UNLIMITED
    }

    /// Whether `self` is stricter than `other`.
    ///
    /// A denial beats an allowance; between results with the same outcome
    /// the one with less quota left wins. Ties keep `other`.
    pub fn is_more_restrictive_than(&self, other: &RateLimitResult) -> bool {
        match (self.allowed, other.allowed) {
            (false, true) => true,
            (true, false) => false,
            _ => self.remaining < other.remaining,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remaining_is_clamped_to_limit() {
        let result = RateLimitResult::allowed(10, 25, 100);
        assert_eq!(result.remaining(), 10);
    }

    #[test]
    fn test_unlimited_result() {
        let result = RateLimitResult::unlimited(Some("enterprise".to_string()));
        assert!(result.is_allowed());
        assert!(result.is_unlimited());
        assert_eq!(result.limit(), UNLIMITED);
        assert_eq!(result.tier(), Some("enterprise"));
        assert_eq!(result.retry_after(), None);
    }

    #[test]
    fn test_with_methods_return_new_instances() {
        let original = RateLimitResult::allowed(10, 5, 100);
        let tagged = original.with_tier("pro").with_policy("10;w=60");

        assert_eq!(original.tier(), None);
        assert_eq!(original.policy(), None);
        assert_eq!(tagged.tier(), Some("pro"));
        assert_eq!(tagged.policy(), Some("10;w=60"));
        assert_eq!(tagged.remaining(), 5);
    }

    #[test]
    fn test_denial_is_more_restrictive_than_allowance() {
        let denied = RateLimitResult::denied(100, 50, 100, Some(10));
        let allowed = RateLimitResult::allowed(5, 0, 100);

        assert!(denied.is_more_restrictive_than(&allowed));
        assert!(!allowed.is_more_restrictive_than(&denied));
    }

    #[test]
    fn test_lower_remaining_is_more_restrictive() {
        let tight = RateLimitResult::allowed(5, 1, 100);
        let loose = RateLimitResult::allowed(100, 90, 100);

        assert!(tight.is_more_restrictive_than(&loose));
        assert!(!loose.is_more_restrictive_than(&tight));
        assert!(!tight.is_more_restrictive_than(&tight.clone()));
    }

    #[test]
    fn test_zero_limit_counts_as_unlimited() {
        assert!(RateLimitResult::allowed(0, 0, 0).is_unlimited());
        assert!(!RateLimitResult::allowed(1, 0, 0).is_unlimited());
    }
}
