//! Rate limiting logic and state management.

mod fixed_window;
mod key;
mod limit;
mod limiter;
mod manager;
mod result;
mod sliding_window;
mod storage;
mod token_bucket;

pub use fixed_window::FixedWindowLimiter;
pub use key::{resolve_pattern, KeyBuilder, DEFAULT_KEY_PREFIX};
pub use limit::{parse_limits, Algorithm, KeyBy, LimitConfig, LimitDeclaration, DEFAULT_WINDOW_SECS};
pub use limiter::{create_limiter, Limiter};
pub use manager::RateLimitManager;
pub use result::{RateLimitResult, UNLIMITED};
pub use sliding_window::SlidingWindowLimiter;
pub use storage::{MemoryStorage, Storage, DEFAULT_PURGE_INTERVAL};
pub use token_bucket::TokenBucketLimiter;
