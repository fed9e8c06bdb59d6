//! Start/stop plumbing for background store maintenance.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::{watch, Notify};

/// Errors that can occur while starting or stopping a store's background task.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum LifecycleError {
    #[error("store cleanup already started")]
    AlreadyStarted,
    #[error("store cleanup not started")]
    NotStarted,
    #[error("store cleanup not configured (cleanup interval must be positive)")]
    CleanupNotConfigured,
    #[error("store shutdown timed out after {0:?}")]
    ShutdownTimeout(Duration),
    #[error("store cleanup is configured but not running")]
    NotRunning,
    #[error("store cleanup task failed: {0}")]
    Task(String),
}

/// A long-running background service that starts once and stops gracefully.
#[async_trait]
pub trait Service: Send + Sync {
    /// Run until `shutdown` resolves or [`Service::stop`] is called.
    async fn start(&self, shutdown: BoxFuture<'static, ()>) -> Result<(), LifecycleError>;

    /// Signal the running service to stop and wait, bounded, for it to drain.
    async fn stop(&self) -> Result<(), LifecycleError>;
}

/// Counts in-flight background work so shutdown can wait for it to drain.
#[derive(Debug, Default)]
pub(crate) struct InFlight {
    count: AtomicUsize,
    idle: Notify,
}

impl InFlight {
    /// Register a unit of work; it completes when the guard is dropped.
    pub(crate) fn enter(self: &Arc<Self>) -> InFlightGuard {
        self.count.fetch_add(1, Ordering::SeqCst);
        InFlightGuard {
            tracker: Arc::clone(self),
        }
    }

    pub(crate) fn count(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }

    /// Wait until no work is in flight.
    pub(crate) async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            // Register interest before checking, so a concurrent exit is not missed.
            notified.as_mut().enable();
            if self.count() == 0 {
                return;
            }
            notified.await;
        }
    }
}

/// Marks one unit of in-flight work. Owned so it can move into spawned tasks.
#[derive(Debug)]
pub(crate) struct InFlightGuard {
    tracker: Arc<InFlight>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if self.tracker.count.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.tracker.idle.notify_waiters();
        }
    }
}

/// Shared registration state for a single background loop.
#[derive(Debug, Default)]
pub(crate) struct LoopControl {
    /// Cancels the registered loop. `Some` while a loop is registered.
    cancel: Mutex<Option<watch::Sender<bool>>>,
    running: AtomicBool,
    in_flight: Arc<InFlight>,
}

impl LoopControl {
    /// Register a new loop, failing if one is already registered.
    pub(crate) fn register(self: &Arc<Self>) -> Result<Registration, LifecycleError> {
        let mut cancel = self.cancel.lock();
        if cancel.is_some() {
            return Err(LifecycleError::AlreadyStarted);
        }

        let (sender, receiver) = watch::channel(false);
        *cancel = Some(sender);
        Ok(Registration {
            control: Arc::clone(self),
            cancelled: receiver,
            _in_flight: self.in_flight.enter(),
        })
    }

    /// Signal the registered loop to stop.
    pub(crate) fn cancel(&self) -> Result<(), LifecycleError> {
        match self.cancel.lock().as_ref() {
            Some(sender) => {
                sender.send_replace(true);
                Ok(())
            }
            None => Err(LifecycleError::NotStarted),
        }
    }

    pub(crate) fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Wait until the registered loop, if any, has been torn down.
    pub(crate) async fn wait_idle(&self) {
        self.in_flight.wait_idle().await
    }
}

/// A registered loop. Dropping it, whether the loop returned or its future
/// was dropped, clears the registration and releases `stop` waiters.
#[derive(Debug)]
pub(crate) struct Registration {
    control: Arc<LoopControl>,
    cancelled: watch::Receiver<bool>,
    // Dropped after `Drop::drop` runs, so waiters see a clean state.
    _in_flight: InFlightGuard,
}

impl Registration {
    pub(crate) fn mark_running(&self) {
        self.control.running.store(true, Ordering::SeqCst);
    }

    /// Resolves once the loop has been asked to stop.
    pub(crate) async fn cancelled(&mut self) {
        while !*self.cancelled.borrow_and_update() {
            // The sender only goes away on teardown.
            if self.cancelled.changed().await.is_err() {
                return;
            }
        }
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.control.running.store(false, Ordering::SeqCst);
        *self.control.cancel.lock() = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_wait_idle_returns_immediately_when_empty() {
        let tracker = Arc::new(InFlight::default());
        tokio::time::timeout(Duration::from_millis(50), tracker.wait_idle())
            .await
            .expect("idle tracker should not block");
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_idle_waits_for_guard() {
        let tracker = Arc::new(InFlight::default());

        let worker = {
            let tracker = Arc::clone(&tracker);
            tokio::spawn(async move {
                let _guard = tracker.enter();
                tokio::time::sleep(Duration::from_millis(100)).await;
            })
        };
        tokio::task::yield_now().await;
        assert_eq!(tracker.count(), 1);

        let started = tokio::time::Instant::now();
        tracker.wait_idle().await;
        assert!(started.elapsed() >= Duration::from_millis(100));
        assert_eq!(tracker.count(), 0);

        worker.await.unwrap();
    }

    #[test]
    fn test_registration_is_exclusive() {
        let control = Arc::new(LoopControl::default());
        let registration = control.register().unwrap();
        assert_eq!(
            control.register().unwrap_err(),
            LifecycleError::AlreadyStarted
        );

        registration.mark_running();
        assert!(control.is_running());

        drop(registration);
        assert!(!control.is_running());
        assert_eq!(control.cancel(), Err(LifecycleError::NotStarted));
        assert!(control.register().is_ok());
    }

    #[tokio::test]
    async fn test_cancel_wakes_registration() {
        let control = Arc::new(LoopControl::default());
        let mut registration = control.register().unwrap();

        control.cancel().unwrap();
        tokio::time::timeout(Duration::from_millis(50), registration.cancelled())
            .await
            .expect("cancellation should be observed");
    }

    #[test]
    fn test_error_messages() {
        assert_eq!(
            LifecycleError::AlreadyStarted.to_string(),
            "store cleanup already started"
        );
        assert_eq!(
            LifecycleError::ShutdownTimeout(Duration::from_secs(5)).to_string(),
            "store shutdown timed out after 5s"
        );
    }
}
