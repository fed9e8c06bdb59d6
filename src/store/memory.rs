//! In-memory token bucket store with background cleanup.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use super::lifecycle::{LifecycleError, LoopControl, Registration, Service};
use super::state::BucketState;
use super::{BackendError, Store};
use crate::ratelimit::LimitConfig;

/// Construction options for a [`MemoryStore`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryStoreConfig {
    /// How often stale buckets are evicted, in milliseconds (0 disables cleanup)
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval_ms: u64,

    /// Upper bound on how long `stop` waits for the cleanup loop, in milliseconds
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_ms: u64,

    /// Buckets untouched for longer than this are evicted, in milliseconds
    #[serde(default = "default_stale_threshold")]
    pub stale_threshold_ms: u64,
}

impl Default for MemoryStoreConfig {
    fn default() -> Self {
        Self {
            cleanup_interval_ms: default_cleanup_interval(),
            shutdown_timeout_ms: default_shutdown_timeout(),
            stale_threshold_ms: default_stale_threshold(),
        }
    }
}

fn default_cleanup_interval() -> u64 {
    60_000
}

fn default_shutdown_timeout() -> u64 {
    5_000
}

fn default_stale_threshold() -> u64 {
    3_600_000
}

/// Point-in-time snapshot of store counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    pub buckets_created: u64,
    pub buckets_removed: u64,
    pub active_buckets: u64,
    pub cleanup_running: bool,
}

/// A [`Store`] that keeps every bucket in process memory.
///
/// All bucket mutations are serialized behind a single lock. Stale buckets
/// are evicted by a background loop driven by [`MemoryStore::start`] or
/// [`MemoryStore::run`]; without it, the map only shrinks on `reset`.
pub struct MemoryStore {
    /// Bucket state indexed by key
    buckets: RwLock<HashMap<String, BucketState>>,
    cleanup_interval: Duration,
    shutdown_timeout: Duration,
    stale_threshold: Duration,
    control: Arc<LoopControl>,
    buckets_created: AtomicU64,
    buckets_removed: AtomicU64,
    active_buckets: AtomicU64,
    /// Holds each cleanup pass open until notified.
    #[cfg(test)]
    pass_gate: Option<Arc<tokio::sync::Notify>>,
}

impl MemoryStore {
    /// Create a store with default options.
    pub fn new() -> Self {
        Self::with_config(MemoryStoreConfig::default())
    }

    /// Create a store from construction options.
    pub fn with_config(config: MemoryStoreConfig) -> Self {
        Self {
            buckets: RwLock::new(HashMap::new()),
            cleanup_interval: Duration::from_millis(config.cleanup_interval_ms),
            shutdown_timeout: Duration::from_millis(config.shutdown_timeout_ms),
            stale_threshold: Duration::from_millis(config.stale_threshold_ms),
            control: Arc::new(LoopControl::default()),
            buckets_created: AtomicU64::new(0),
            buckets_removed: AtomicU64::new(0),
            active_buckets: AtomicU64::new(0),
            #[cfg(test)]
            pass_gate: None,
        }
    }

    /// Set the cleanup interval. `Duration::ZERO` disables cleanup.
    pub fn with_cleanup_interval(mut self, interval: Duration) -> Self {
        self.cleanup_interval = interval;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    pub fn with_stale_threshold(mut self, threshold: Duration) -> Self {
        self.stale_threshold = threshold;
        self
    }

    #[cfg(test)]
    fn with_pass_gate(mut self, gate: Arc<tokio::sync::Notify>) -> Self {
        self.pass_gate = Some(gate);
        self
    }

    #[cfg(test)]
    async fn hold_pass(&self) {
        if let Some(gate) = &self.pass_gate {
            gate.notified().await;
        }
    }

    /// Run the cleanup loop until `shutdown` resolves or [`MemoryStore::stop`] is called.
    ///
    /// Fails immediately if a loop is already registered or cleanup is
    /// disabled. Returns `Ok(())` once the loop has exited. Dropping the
    /// returned future also tears the loop down.
    pub async fn start<F>(&self, shutdown: F) -> Result<(), LifecycleError>
    where
        F: Future<Output = ()> + Send,
    {
        let registration = self.register()?;
        self.cleanup_loop(registration, shutdown).await;
        Ok(())
    }

    /// Stop the cleanup loop and wait, up to the shutdown timeout, for it to drain.
    ///
    /// On timeout the loop is still cancelled and will exit on its own; the
    /// store remains usable.
    pub async fn stop(&self) -> Result<(), LifecycleError> {
        self.control.cancel()?;
        info!(timeout = ?self.shutdown_timeout, "Stopping bucket cleanup");

        match tokio::time::timeout(self.shutdown_timeout, self.control.wait_idle()).await {
            Ok(()) => Ok(()),
            Err(_) => {
                warn!(
                    timeout = ?self.shutdown_timeout,
                    "Bucket cleanup did not stop within the shutdown timeout"
                );
                Err(LifecycleError::ShutdownTimeout(self.shutdown_timeout))
            }
        }
    }

    /// Run the cleanup loop in the background until `shutdown` resolves,
    /// then stop it gracefully.
    ///
    /// The loop is registered when `run` is called, before the returned
    /// future is first polled. The future is `'static` so it can be handed to
    /// `tokio::spawn` or a `JoinSet`; dropping it aborts the background loop.
    pub fn run<F>(
        self: Arc<Self>,
        shutdown: F,
    ) -> impl Future<Output = Result<(), LifecycleError>> + Send + 'static
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let registration = self.register();

        async move {
            let registration = registration?;

            let store = Arc::clone(&self);
            let mut task = AbortOnDrop(tokio::spawn(async move {
                store
                    .cleanup_loop(registration, std::future::pending::<()>())
                    .await
            }));

            tokio::select! {
                joined = &mut task.0 => {
                    joined.map_err(|e| LifecycleError::Task(e.to_string()))
                }
                _ = shutdown => {
                    match self.stop().await {
                        // The loop already exited through an external stop.
                        Ok(()) | Err(LifecycleError::NotStarted) => {}
                        Err(e) => return Err(e),
                    }
                    (&mut task.0)
                        .await
                        .map_err(|e| LifecycleError::Task(e.to_string()))
                }
            }
        }
    }

    /// Evict every bucket untouched for longer than the stale threshold.
    ///
    /// Returns the number of buckets removed.
    pub fn remove_stale(&self) -> usize {
        let removed = {
            let mut buckets = self.buckets.write();
            let now = Instant::now();
            let before = buckets.len();
            buckets.retain(|_, state| !state.is_stale(now, self.stale_threshold));
            let removed = before - buckets.len();

            self.buckets_removed.fetch_add(removed as u64, Ordering::Relaxed);
            self.active_buckets.fetch_sub(removed as u64, Ordering::Relaxed);
            removed
        };

        if removed > 0 {
            debug!(
                removed = removed,
                threshold = ?self.stale_threshold,
                "Evicted stale buckets"
            );
        }
        removed
    }

    /// Get a snapshot of the store counters.
    pub fn stats(&self) -> StoreStats {
        StoreStats {
            buckets_created: self.buckets_created.load(Ordering::Relaxed),
            buckets_removed: self.buckets_removed.load(Ordering::Relaxed),
            active_buckets: self.active_buckets.load(Ordering::Relaxed),
            cleanup_running: self.control.is_running(),
        }
    }

    /// Report whether background maintenance is in the expected state.
    ///
    /// Disabled cleanup is healthy; enabled cleanup must be running.
    pub fn healthcheck(&self) -> Result<(), LifecycleError> {
        if self.cleanup_interval.is_zero() || self.control.is_running() {
            Ok(())
        } else {
            Err(LifecycleError::NotRunning)
        }
    }

    /// Get the number of buckets currently held.
    pub fn bucket_count(&self) -> usize {
        self.buckets.read().len()
    }

    fn register(&self) -> Result<Registration, LifecycleError> {
        if self.cleanup_interval.is_zero() {
            return Err(LifecycleError::CleanupNotConfigured);
        }
        self.control.register()
    }

    async fn cleanup_loop<F>(&self, mut registration: Registration, shutdown: F)
    where
        F: Future<Output = ()> + Send,
    {
        tokio::pin!(shutdown);

        registration.mark_running();
        info!(
            interval = ?self.cleanup_interval,
            stale_threshold = ?self.stale_threshold,
            "Starting bucket cleanup"
        );

        let mut ticker =
            tokio::time::interval_at(Instant::now() + self.cleanup_interval, self.cleanup_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            // Stop requests win over a due cleanup pass.
            tokio::select! {
                biased;

                _ = &mut shutdown => {
                    debug!("Shutdown signal received");
                    break;
                }
                _ = registration.cancelled() => {
                    debug!("Stop requested");
                    break;
                }
                _ = ticker.tick() => {
                    #[cfg(test)]
                    self.hold_pass().await;
                    self.remove_stale();
                }
            }
        }

        drop(registration);
        info!("Bucket cleanup stopped");
    }
}

/// Aborts the wrapped task when dropped.
struct AbortOnDrop<T>(JoinHandle<T>);

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore")
            .field("cleanup_interval", &self.cleanup_interval)
            .field("shutdown_timeout", &self.shutdown_timeout)
            .field("stale_threshold", &self.stale_threshold)
            .field("stats", &self.stats())
            .finish()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn consume_tokens(
        &self,
        key: &str,
        n: i64,
        config: &LimitConfig,
    ) -> Result<(i64, Instant), BackendError> {
        let mut buckets = self.buckets.write();
        let now = Instant::now();

        let (remaining, reset_at) = match buckets.get_mut(key) {
            Some(state) => state.consume(n, config, now),
            None => {
                let mut state = BucketState::new(config, now);
                let outcome = state.consume(n, config, now);
                buckets.insert(key.to_owned(), state);

                self.buckets_created.fetch_add(1, Ordering::Relaxed);
                self.active_buckets.fetch_add(1, Ordering::Relaxed);
                debug!(
                    key = %key,
                    capacity = config.capacity,
                    refill_rate = config.refill_rate,
                    refill_interval = ?config.refill_interval,
                    "Creating new bucket"
                );
                outcome
            }
        };

        trace!(key = %key, tokens = n, remaining = remaining, "Consumed tokens");
        Ok((remaining, reset_at))
    }

    async fn reset(&self, key: &str) -> Result<(), BackendError> {
        let mut buckets = self.buckets.write();
        if buckets.remove(key).is_some() {
            self.buckets_removed.fetch_add(1, Ordering::Relaxed);
            self.active_buckets.fetch_sub(1, Ordering::Relaxed);
            debug!(key = %key, "Reset bucket");
        }
        Ok(())
    }
}

#[async_trait]
impl Service for MemoryStore {
    async fn start(&self, shutdown: BoxFuture<'static, ()>) -> Result<(), LifecycleError> {
        MemoryStore::start(self, shutdown).await
    }

    async fn stop(&self) -> Result<(), LifecycleError> {
        MemoryStore::stop(self).await
    }
}
