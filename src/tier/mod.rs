//! Tier resolution and per-tier default limits.

mod manager;
mod resolver;

pub use manager::{default_tiers, TierDefinition, TierManager};
pub use resolver::{normalize_tier, TierResolver, ANONYMOUS, ENTERPRISE, FREE, PRO};
