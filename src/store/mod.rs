//! Storage backends for token bucket state.
//!
//! The [`Store`] trait is the persistence contract consumed by
//! [`Bucket`](crate::ratelimit::Bucket). [`MemoryStore`] is the in-process
//! implementation, with its own background cleanup lifecycle.

mod lifecycle;
mod memory;
mod state;

use async_trait::async_trait;
use tokio::time::Instant;

use crate::ratelimit::LimitConfig;

pub use lifecycle::{LifecycleError, Service};
pub use memory::{MemoryStore, MemoryStoreConfig, StoreStats};
pub use state::BucketState;

/// Error surfaced by a storage backend.
///
/// Propagated unchanged to callers of the rate limiter.
pub type BackendError = Box<dyn std::error::Error + Send + Sync>;

/// Persistence contract for token bucket state.
///
/// Implementations must be safe under arbitrary concurrent callers and
/// linearizable per key: concurrent calls for the same key never lose updates.
#[async_trait]
pub trait Store: Send + Sync {
    /// Apply pending refill for `key`, then subtract `n` tokens.
    ///
    /// A bucket is created at full capacity on the first call for an unseen
    /// key. `n` may be zero to read the current state, which still
    /// materializes pending refill. Returns the remaining tokens (negative
    /// when in debt) and the instant the next refill interval completes.
    async fn consume_tokens(
        &self,
        key: &str,
        n: i64,
        config: &LimitConfig,
    ) -> Result<(i64, Instant), BackendError>;

    /// Discard all state for `key`. The next access starts at full capacity.
    async fn reset(&self, key: &str) -> Result<(), BackendError>;
}
