//! Limit declarations and their validated form.
//!
//! A [`LimitDeclaration`] is what route metadata or a config file carries.
//! It is validated once into a [`LimitConfig`], which is what the manager
//! evaluates. Algorithm names are parsed here and nowhere else.

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Result, TollgateError};

/// Window used when a declaration names none.
pub const DEFAULT_WINDOW_SECS: u64 = 60;

/// Throttling algorithm applied to a limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Algorithm {
    /// Epoch-aligned, non-overlapping windows
    Fixed,
    /// Rolling window over the last `window` seconds
    #[default]
    Sliding,
    /// Continuously refilling token bucket
    TokenBucket,
}

impl Algorithm {
    /// Parse an algorithm name. Unknown names fall back to [`Algorithm::Sliding`].
    pub fn parse(name: &str) -> Self {
        match name.trim().to_ascii_lowercase().as_str() {
            "fixed" | "fixed_window" => Algorithm::Fixed,
            "sliding" | "sliding_window" => Algorithm::Sliding,
            "bucket" | "token_bucket" | "token" => Algorithm::TokenBucket,
            other => {
                debug!(algorithm = %other, "Unknown algorithm, using sliding window");
                Algorithm::Sliding
            }
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Algorithm::Fixed => "fixed",
            Algorithm::Sliding => "sliding",
            Algorithm::TokenBucket => "bucket",
        }
    }
}

impl From<String> for Algorithm {
    fn from(name: String) -> Self {
        Algorithm::parse(&name)
    }
}

impl From<Algorithm> for String {
    fn from(algorithm: Algorithm) -> Self {
        algorithm.as_str().to_string()
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What identifies the caller a limit is counted against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyBy {
    /// Client IP address
    #[default]
    Ip,
    /// Authenticated principal id, falling back to the IP
    User,
    /// Method and path plus the caller identifier
    Endpoint,
    /// The declaration's own `key` pattern
    Custom,
}

/// A validated limit, ready for evaluation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimitConfig {
    /// Requests allowed per window. Zero means unlimited.
    pub attempts: u64,
    /// Window length in seconds
    pub window_secs: u64,
    /// Only apply when the request resolves to this tier
    #[serde(default)]
    pub tier: Option<String>,
    /// Custom key pattern with `{ip}`, `{user}`, `{path}`, `{method}`, `{tier}`
    #[serde(default)]
    pub key: Option<String>,
    #[serde(default)]
    pub algorithm: Algorithm,
    #[serde(default)]
    pub by: KeyBy,
    /// Cost multiplier applied to every request
    #[serde(default = "default_cost")]
    pub cost: u64,
}

fn default_cost() -> u64 {
    1
}

impl LimitConfig {
    /// `attempts` requests every `window_secs` seconds, keyed by IP.
    pub fn per_seconds(attempts: u64, window_secs: u64) -> Self {
        Self {
            attempts,
            window_secs,
            tier: None,
            key: None,
            algorithm: Algorithm::default(),
            by: KeyBy::default(),
            cost: default_cost(),
        }
    }

    pub fn per_minute(attempts: u64) -> Self {
        Self::per_seconds(attempts, 60)
    }

    pub fn per_hour(attempts: u64) -> Self {
        Self::per_seconds(attempts, 3_600)
    }

    pub fn per_day(attempts: u64) -> Self {
        Self::per_seconds(attempts, 86_400)
    }

    pub fn with_algorithm(mut self, algorithm: Algorithm) -> Self {
        self.algorithm = algorithm;
        self
    }

    pub fn by(mut self, by: KeyBy) -> Self {
        self.by = by;
        self
    }

    pub fn for_tier(mut self, tier: impl Into<String>) -> Self {
        self.tier = Some(tier.into());
        self
    }

    pub fn with_key(mut self, pattern: impl Into<String>) -> Self {
        self.key = Some(pattern.into());
        self.by = KeyBy::Custom;
        self
    }

    pub fn with_cost(mut self, cost: u64) -> Self {
        self.cost = cost;
        self
    }

    /// Whether this entry disables limiting.
    pub fn is_unlimited(&self) -> bool {
        self.attempts == 0
    }

    /// Check the invariants the limiters rely on.
    pub fn validate(&self) -> Result<()> {
        if self.attempts > i64::MAX as u64 {
            return Err(TollgateError::InvalidLimit(format!(
                "attempts must not exceed {}, got {}",
                i64::MAX,
                self.attempts
            )));
        }
        if self.window_secs == 0 && !self.is_unlimited() {
            return Err(TollgateError::InvalidLimit(format!(
                "window must be at least one second (attempts = {})",
                self.attempts
            )));
        }
        if self.cost == 0 {
            return Err(TollgateError::InvalidLimit(
                "cost multiplier must be at least 1".to_string(),
            ));
        }
        if matches!(&self.key, Some(pattern) if pattern.trim().is_empty()) {
            return Err(TollgateError::InvalidLimit(
                "custom key pattern must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// A limit as written in route metadata or configuration.
///
/// The window can be given with several fields; the most specific one
/// present wins: `decay_seconds`, then `per_minutes`, `per_hours`,
/// `per_days`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimitDeclaration {
    /// Requests allowed per window. Zero means unlimited.
    pub attempts: i64,
    #[serde(default, alias = "window")]
    pub decay_seconds: Option<i64>,
    #[serde(default)]
    pub per_minutes: Option<i64>,
    #[serde(default)]
    pub per_hours: Option<i64>,
    #[serde(default)]
    pub per_days: Option<i64>,
    #[serde(default)]
    pub tier: Option<String>,
    #[serde(default)]
    pub key: Option<String>,
    #[serde(default)]
    pub algorithm: Option<Algorithm>,
    #[serde(default)]
    pub by: Option<KeyBy>,
    #[serde(default)]
    pub cost: Option<i64>,
}

impl LimitDeclaration {
    /// `attempts` requests every `window_secs` seconds.
    pub fn new(attempts: i64, window_secs: i64) -> Self {
        Self {
            attempts,
            decay_seconds: Some(window_secs),
            ..Self::default()
        }
    }

    /// Resolve the window length in seconds.
    pub fn window_secs(&self) -> Result<u64> {
        let candidates = [
            (self.decay_seconds, 1, "decay_seconds"),
            (self.per_minutes, 60, "per_minutes"),
            (self.per_hours, 3_600, "per_hours"),
            (self.per_days, 86_400, "per_days"),
        ];

        for (value, unit, field) in candidates {
            if let Some(value) = value {
                if value <= 0 {
                    return Err(TollgateError::InvalidLimit(format!(
                        "{} must be positive, got {}",
                        field, value
                    )));
                }
                return (value as u64).checked_mul(unit).ok_or_else(|| {
                    TollgateError::InvalidLimit(format!("{} overflows: {}", field, value))
                });
            }
        }

        Ok(DEFAULT_WINDOW_SECS)
    }

    /// Validate this declaration into an evaluable [`LimitConfig`].
    pub fn into_limit(self) -> Result<LimitConfig> {
        if self.attempts < 0 {
            return Err(TollgateError::InvalidLimit(format!(
                "attempts must not be negative, got {}",
                self.attempts
            )));
        }

        let cost = match self.cost {
            Some(cost) if cost < 1 => {
                return Err(TollgateError::InvalidLimit(format!(
                    "cost must be at least 1, got {}",
                    cost
                )))
            }
            Some(cost) => cost as u64,
            None => default_cost(),
        };

        let window_secs = self.window_secs()?;
        let by = match (self.by, &self.key) {
            (Some(by), _) => by,
            (None, Some(_)) => KeyBy::Custom,
            (None, None) => KeyBy::Ip,
        };

        let limit = LimitConfig {
            attempts: self.attempts as u64,
            window_secs,
            tier: self.tier.map(|tier| tier.trim().to_ascii_lowercase()),
            key: self.key,
            algorithm: self.algorithm.unwrap_or_default(),
            by,
            cost,
        };
        limit.validate()?;
        Ok(limit)
    }
}

impl TryFrom<LimitDeclaration> for LimitConfig {
    type Error = TollgateError;

    fn try_from(declaration: LimitDeclaration) -> Result<Self> {
        declaration.into_limit()
    }
}

/// Validate a list of declarations, failing on the first bad one.
pub fn parse_limits(declarations: Vec<LimitDeclaration>) -> Result<Vec<LimitConfig>> {
    declarations
        .into_iter()
        .enumerate()
        .map(|(index, declaration)| {
            declaration.into_limit().map_err(|e| {
                TollgateError::Config(format!("limit #{}: {}", index + 1, e))
            })
        })
        .collect()
}
