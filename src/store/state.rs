//! Per-key token bucket state and the refill algorithm.

use tokio::time::Instant;

use crate::ratelimit::LimitConfig;

/// Token bucket state for a single key.
///
/// Owned by whichever store created it. `tokens` is signed so that
/// over-consumption is recorded as debt rather than clamped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BucketState {
    tokens: i64,
    last_refill: Instant,
    last_access: Instant,
}

impl BucketState {
    /// Create a full bucket.
    pub fn new(config: &LimitConfig, now: Instant) -> Self {
        Self {
            tokens: config.capacity,
            last_refill: now,
            last_access: now,
        }
    }

    /// Apply pending refill, then subtract `n` tokens.
    ///
    /// `n == 0` still materializes refill and touches `last_access`.
    /// Returns the remaining tokens and the instant the next refill
    /// interval completes.
    pub fn consume(&mut self, n: i64, config: &LimitConfig, now: Instant) -> (i64, Instant) {
        self.refill(config, now);

        self.tokens = self.tokens.saturating_sub(n);
        self.last_access = now;

        (self.tokens, self.last_refill + config.refill_interval)
    }

    fn refill(&mut self, config: &LimitConfig, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill);
        let interval = config.refill_interval.as_nanos();
        if interval == 0 {
            return;
        }

        // Capped so a long idle span cannot overflow the credit.
        let max_intervals = config.max_refill_intervals().max(0) as u128;
        let intervals = (elapsed.as_nanos() / interval).min(max_intervals) as i64;

        if intervals > 0 {
            let credit = intervals.saturating_mul(config.refill_rate);
            self.tokens = self.tokens.saturating_add(credit).min(config.capacity);
            // Reset to now, discarding any partial interval.
            self.last_refill = now;
        }
    }

    pub fn tokens(&self) -> i64 {
        self.tokens
    }

    pub fn last_refill(&self) -> Instant {
        self.last_refill
    }

    pub fn last_access(&self) -> Instant {
        self.last_access
    }

    /// Whether the bucket has gone untouched for longer than `threshold`.
    pub fn is_stale(&self, now: Instant, threshold: std::time::Duration) -> bool {
        now.saturating_duration_since(self.last_access) > threshold
    }
}
