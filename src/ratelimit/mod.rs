//! Token bucket rate limiting.

mod backend;
mod bucket;
mod limit;
mod result;

pub use backend::RateLimiter;
pub use bucket::Bucket;
pub use limit::LimitConfig;
pub use result::RateLimitResult;
