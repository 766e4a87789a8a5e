//! Tollgate - Tiered Request Rate Limiting
//!
//! This crate decides whether an inbound request may proceed based on how
//! many requests the same caller made recently. Callers are grouped into
//! subscription tiers with their own quotas, limits are evaluated with a
//! fixed window, sliding window or token bucket algorithm over pluggable
//! storage, and results are rendered as standard rate limit headers.

pub mod clock;
pub mod config;
pub mod error;
pub mod headers;
pub mod ratelimit;
pub mod request;
pub mod tier;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{FailurePolicy, HeaderConfig, TollgateConfig};
pub use error::{Result, TollgateError};
pub use ratelimit::{LimitConfig, RateLimitManager, RateLimitResult};
pub use request::{Identity, Principal, RequestContext, RequestInfo};
pub use tier::{TierManager, TierResolver};
