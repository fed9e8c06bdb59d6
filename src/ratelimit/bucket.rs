//! Token bucket rate limiter front end.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, trace};

use super::backend::RateLimiter;
use super::limit::LimitConfig;
use super::result::RateLimitResult;
use crate::error::{RateBucketError, Result};
use crate::store::Store;

/// A token bucket rate limiter over a pluggable [`Store`].
///
/// The bucket holds no per-key state of its own: every call is delegated to
/// the store, so a single `Bucket` can be shared freely across tasks.
pub struct Bucket<S: Store + ?Sized> {
    /// Backing store for per-key state
    store: Arc<S>,
    /// Limit applied to every key
    config: LimitConfig,
}

impl<S: Store + ?Sized> Bucket<S> {
    /// Create a new bucket limiter.
    ///
    /// Fails with [`RateBucketError::InvalidConfig`] unless capacity, refill
    /// rate and refill interval are all positive.
    pub fn new(store: Arc<S>, config: LimitConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { store, config })
    }

    /// Try to take `n` tokens for `key`.
    ///
    /// A denied request is still charged, leaving the bucket in debt.
    /// Nothing is retried or awaited beyond the store call itself.
    pub async fn allow_n(&self, key: &str, n: i64) -> Result<RateLimitResult> {
        if n < 1 {
            return Err(RateBucketError::InvalidTokenCount(n));
        }
        let result = self.consume(key, n).await?;

        if !result.allowed() {
            debug!(
                key = %key,
                tokens = n,
                remaining = result.remaining(),
                "Rate limit exceeded"
            );
        }
        Ok(result)
    }

    /// Try to take a single token for `key`.
    pub async fn allow(&self, key: &str) -> Result<RateLimitResult> {
        self.allow_n(key, 1).await
    }

    /// Report the current state of `key` without consuming tokens.
    ///
    /// Pending refill is applied and the key counts as accessed, so this is
    /// not a side-effect-free peek.
    pub async fn status(&self, key: &str) -> Result<RateLimitResult> {
        self.consume(key, 0).await
    }

    /// Discard all state for `key`, restoring full capacity.
    pub async fn reset(&self, key: &str) -> Result<()> {
        debug!(key = %key, "Resetting bucket");
        self.store.reset(key).await.map_err(RateBucketError::Backend)
    }

    /// Get the limit applied by this bucket.
    pub fn config(&self) -> &LimitConfig {
        &self.config
    }

    /// Get the backing store.
    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    async fn consume(&self, key: &str, n: i64) -> Result<RateLimitResult> {
        trace!(key = %key, tokens = n, "Checking rate limit");

        let (remaining, reset_at) = self
            .store
            .consume_tokens(key, n, &self.config)
            .await
            .map_err(RateBucketError::Backend)?;

        Ok(RateLimitResult::new(remaining, self.config.capacity, reset_at))
    }
}

impl<S: Store + ?Sized> Clone for Bucket<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            config: self.config,
        }
    }
}

#[async_trait]
impl<S: Store + ?Sized> RateLimiter for Bucket<S> {
    async fn allow_n(&self, key: &str, n: i64) -> Result<RateLimitResult> {
        Bucket::allow_n(self, key, n).await
    }
}
