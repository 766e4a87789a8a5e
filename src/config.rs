//! Configuration management for Tollgate.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{Result, TollgateError};
use crate::ratelimit::{LimitConfig, LimitDeclaration, DEFAULT_KEY_PREFIX};
use crate::tier::{default_tiers, TierDefinition, TierManager, FREE};

/// Prefix of environment variables that override file settings.
pub const ENV_PREFIX: &str = "TOLLGATE";

/// Main configuration for Tollgate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TollgateConfig {
    /// Limit applied when neither the route nor the tier declares any
    #[serde(default = "default_fallback_limit")]
    pub default_limit: LimitDeclaration,

    /// Tier policies, keyed by tier name
    #[serde(default = "default_tiers")]
    pub tiers: BTreeMap<String, TierDefinition>,

    /// Tier whose limits apply to undefined tiers
    #[serde(default = "default_baseline_tier")]
    pub baseline_tier: String,

    /// Which header families to emit
    #[serde(default)]
    pub headers: HeaderConfig,

    /// What to do when storage fails during evaluation
    #[serde(default)]
    pub failure_policy: FailurePolicy,

    /// Namespace for every storage key
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
}

impl Default for TollgateConfig {
    fn default() -> Self {
        Self {
            default_limit: default_fallback_limit(),
            tiers: default_tiers(),
            baseline_tier: default_baseline_tier(),
            headers: HeaderConfig::default(),
            failure_policy: FailurePolicy::default(),
            key_prefix: default_key_prefix(),
        }
    }
}

fn default_fallback_limit() -> LimitDeclaration {
    LimitDeclaration::new(60, 60)
}

fn default_baseline_tier() -> String {
    FREE.to_string()
}

fn default_key_prefix() -> String {
    DEFAULT_KEY_PREFIX.to_string()
}

/// Header families written on responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeaderConfig {
    /// `X-RateLimit-*`
    #[serde(default = "default_true")]
    pub include_legacy: bool,

    /// `RateLimit-*` and `RateLimit-Policy`
    #[serde(default = "default_true")]
    pub include_ietf: bool,
}

impl Default for HeaderConfig {
    fn default() -> Self {
        Self {
            include_legacy: true,
            include_ietf: true,
        }
    }
}

fn default_true() -> bool {
    true
}

/// Behaviour when the storage backend fails mid-evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailurePolicy {
    /// Let the request through and log the failure
    #[default]
    Open,
    /// Deny the request until storage recovers
    Closed,
}

impl TollgateConfig {
    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: TollgateConfig = serde_yaml::from_str(yaml)
            .map_err(|e| TollgateError::Config(format!("Failed to parse configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading rate limit configuration");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load a file and layer `TOLLGATE__*` environment variables on top,
    /// e.g. `TOLLGATE__FAILURE_POLICY=closed`.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading layered configuration");

        let config: TollgateConfig = ::config::Config::builder()
            .add_source(::config::File::from(path).format(::config::FileFormat::Yaml))
            .add_source(::config::Environment::with_prefix(ENV_PREFIX).separator("__"))
            .build()
            .and_then(|layered| layered.try_deserialize())
            .map_err(|e| TollgateError::Config(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Check every declared limit so that bad configuration fails at load
    /// time rather than per request.
    pub fn validate(&self) -> Result<()> {
        self.default_limit()?;
        self.tier_manager()?;
        if self.key_prefix.trim().is_empty() {
            return Err(TollgateError::Config("key_prefix must not be empty".to_string()));
        }
        Ok(())
    }

    /// The validated global fallback limit.
    pub fn default_limit(&self) -> Result<LimitConfig> {
        self.default_limit
            .clone()
            .into_limit()
            .map_err(|e| TollgateError::Config(format!("default_limit: {}", e)))
    }

    /// Build the tier manager described by this configuration.
    pub fn tier_manager(&self) -> Result<TierManager> {
        TierManager::new(&self.tiers, &self.baseline_tier)
    }
}
