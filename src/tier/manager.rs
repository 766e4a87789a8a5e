//! Per-tier quota policy.
//!
//! A tier is either completely unmetered or carries a list of default
//! limits used when a route declares none. Unknown tiers get the baseline
//! tier's limits.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Result, TollgateError};
use crate::ratelimit::{parse_limits, LimitConfig, LimitDeclaration};

use super::resolver::{normalize_tier, ANONYMOUS, ENTERPRISE, FREE, PRO};

/// Declared policy for one tier.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierDefinition {
    /// Skip rate limiting entirely for this tier
    #[serde(default)]
    pub unlimited: bool,
    /// Limits applied when a route declares none
    #[serde(default)]
    pub limits: Vec<LimitDeclaration>,
}

impl TierDefinition {
    pub fn unlimited() -> Self {
        Self {
            unlimited: true,
            limits: Vec::new(),
        }
    }

    pub fn with_limits(limits: Vec<LimitDeclaration>) -> Self {
        Self {
            unlimited: false,
            limits,
        }
    }
}

/// Built-in tier table.
pub fn default_tiers() -> BTreeMap<String, TierDefinition> {
    let per_minute = |attempts| LimitDeclaration {
        attempts,
        per_minutes: Some(1),
        ..LimitDeclaration::default()
    };
    let per_hour = |attempts| LimitDeclaration {
        attempts,
        per_hours: Some(1),
        ..LimitDeclaration::default()
    };

    BTreeMap::from([
        (
            ANONYMOUS.to_string(),
            TierDefinition::with_limits(vec![per_minute(30)]),
        ),
        (
            FREE.to_string(),
            TierDefinition::with_limits(vec![per_minute(60), per_hour(1_000)]),
        ),
        (
            PRO.to_string(),
            TierDefinition::with_limits(vec![per_minute(300), per_hour(10_000)]),
        ),
        (ENTERPRISE.to_string(), TierDefinition::unlimited()),
    ])
}

#[derive(Debug, Clone)]
struct TierPolicy {
    unlimited: bool,
    limits: Vec<LimitConfig>,
}

/// Answers which tiers are unmetered and what their default limits are.
#[derive(Debug, Clone)]
pub struct TierManager {
    tiers: BTreeMap<String, TierPolicy>,
    baseline: String,
}

impl TierManager {
    /// Validate `definitions` into a manager. `baseline` names the tier whose
    /// limits apply to tiers that are not defined.
    pub fn new(definitions: &BTreeMap<String, TierDefinition>, baseline: &str) -> Result<Self> {
        let mut tiers = BTreeMap::new();
        for (name, definition) in definitions {
            let limits = parse_limits(definition.limits.clone())
                .map_err(|e| TollgateError::Config(format!("tier '{}': {}", name, e)))?;
            tiers.insert(
                normalize_tier(name),
                TierPolicy {
                    unlimited: definition.unlimited,
                    limits,
                },
            );
        }

        let baseline = normalize_tier(baseline);
        if !tiers.contains_key(&baseline) {
            return Err(TollgateError::Config(format!(
                "baseline tier '{}' is not defined",
                baseline
            )));
        }

        Ok(Self { tiers, baseline })
    }

    /// Whether requests in `tier` bypass rate limiting altogether.
    pub fn is_completely_unlimited(&self, tier: &str) -> bool {
        self.tiers
            .get(&normalize_tier(tier))
            .map(|policy| policy.unlimited)
            .unwrap_or(false)
    }

    /// Default limits for `tier`, falling back to the baseline tier.
    pub fn create_default_limits(&self, tier: &str) -> Vec<LimitConfig> {
        let tier = normalize_tier(tier);
        let policy = match self.tiers.get(&tier) {
            Some(policy) => policy,
            None => {
                debug!(tier = %tier, baseline = %self.baseline, "Unknown tier, using baseline limits");
                &self.tiers[&self.baseline]
            }
        };

        if policy.unlimited {
            return Vec::new();
        }
        policy.limits.clone()
    }

    pub fn has_tier(&self, tier: &str) -> bool {
        self.tiers.contains_key(&normalize_tier(tier))
    }

    /// Defined tier names in sorted order.
    pub fn tier_names(&self) -> Vec<&str> {
        self.tiers.keys().map(String::as_str).collect()
    }

    pub fn baseline(&self) -> &str {
        &self.baseline
    }
}

impl Default for TierManager {
    fn default() -> Self {
        let tiers = default_tiers()
            .into_iter()
            .map(|(name, definition)| {
                let limits = definition
                    .limits
                    .into_iter()
                    .filter_map(|declaration| declaration.into_limit().ok())
                    .collect();
                (
                    name,
                    TierPolicy {
                        unlimited: definition.unlimited,
                        limits,
                    },
                )
            })
            .collect();

        Self {
            tiers,
            baseline: FREE.to_string(),
        }
    }
}
