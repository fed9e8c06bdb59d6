//! Outcome of a token consumption.

use std::time::Duration;
use tokio::time::Instant;

/// Read-only view of a rate limit check.
///
/// `remaining` may be negative: the request was charged and the bucket is in
/// debt until refill brings it back to zero or above.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitResult {
    remaining: i64,
    limit: i64,
    reset_at: Instant,
}

impl RateLimitResult {
    pub fn new(remaining: i64, limit: i64, reset_at: Instant) -> Self {
        Self {
            remaining,
            limit,
            reset_at,
        }
    }

    /// Whether the request was admitted.
    pub fn allowed(&self) -> bool {
        self.remaining >= 0
    }

    /// Tokens left after this request. Negative values are debt.
    pub fn remaining(&self) -> i64 {
        self.remaining
    }

    /// The bucket capacity.
    pub fn limit(&self) -> i64 {
        self.limit
    }

    /// When the next refill interval completes.
    pub fn reset_at(&self) -> Instant {
        self.reset_at
    }

    /// Suggested delay before retrying, zero once `reset_at` has passed.
    pub fn retry_after(&self) -> Duration {
        self.retry_after_from(Instant::now())
    }

    /// Suggested delay before retrying, measured from `now`.
    pub fn retry_after_from(&self, now: Instant) -> Duration {
        self.reset_at.saturating_duration_since(now)
    }
}
