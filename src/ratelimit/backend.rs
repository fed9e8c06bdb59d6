//! Rate limiter trait consumed by request-handling layers.

use async_trait::async_trait;

use super::result::RateLimitResult;
use crate::error::Result;

/// Trait for rate limiter implementations.
///
/// Request-handling layers (HTTP middleware, gRPC interceptors) depend on this
/// trait, not on a concrete limiter, so the backing store can be swapped freely.
#[async_trait]
pub trait RateLimiter: Send + Sync {
    /// Try to take a single token for `key`.
    async fn allow(&self, key: &str) -> Result<RateLimitResult> {
        self.allow_n(key, 1).await
    }

    /// Try to take `n` tokens for `key`.
    async fn allow_n(&self, key: &str, n: i64) -> Result<RateLimitResult>;
}
