//! Engine lifecycle and submission draining.
//!
//! State machine: Starting -> Ready -> Draining -> Stopped. Submissions are
//! admitted only while Ready; each admitted submission holds a
//! [`SubmissionGuard`] until it returns, so shutdown can wait for in-flight
//! work before cancelling whatever is left.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use serde::Serialize;
use tokio::sync::{watch, Notify};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Starting,
    Ready,
    Draining,
    Stopped,
}

impl Phase {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Ready => "ready",
            Self::Draining => "draining",
            Self::Stopped => "stopped",
        }
    }
}

#[derive(Debug)]
struct Counter {
    in_flight: AtomicU64,
    idle: Notify,
}

#[derive(Debug)]
pub struct LifecycleController {
    phase: ArcSwap<Phase>,
    counter: Arc<Counter>,
    draining: watch::Sender<bool>,
}

impl LifecycleController {
    #[must_use]
    pub fn new() -> Self {
        let (draining, _rx) = watch::channel(false);
        Self {
            phase: ArcSwap::from_pointee(Phase::Starting),
            counter: Arc::new(Counter {
                in_flight: AtomicU64::new(0),
                idle: Notify::new(),
            }),
            draining,
        }
    }

    #[must_use]
    pub fn phase(&self) -> Phase {
        **self.phase.load()
    }

    pub fn set_ready(&self) {
        self.phase.store(Arc::new(Phase::Ready));
    }

    /// Stops admitting submissions and notifies drain listeners.
    pub fn begin_drain(&self) {
        self.phase.store(Arc::new(Phase::Draining));
        let _ = self.draining.send(true);
    }

    /// Flips to `true` once draining starts. The HTTP server uses it as its
    /// graceful-shutdown trigger.
    #[must_use]
    pub fn drain_receiver(&self) -> watch::Receiver<bool> {
        self.draining.subscribe()
    }

    /// Admits one submission, or `None` unless the engine is Ready.
    #[must_use]
    pub fn admit(&self) -> Option<SubmissionGuard> {
        // Count first so a concurrent drain cannot miss this submission.
        self.counter.in_flight.fetch_add(1, Ordering::SeqCst);
        let guard = SubmissionGuard {
            counter: Arc::clone(&self.counter),
        };
        (self.phase() == Phase::Ready).then_some(guard)
    }

    #[must_use]
    pub fn in_flight(&self) -> u64 {
        self.counter.in_flight.load(Ordering::SeqCst)
    }

    /// Waits until no submission is in flight, up to `timeout`. On success
    /// the phase becomes Stopped.
    pub async fn wait_for_drain(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let idle = self.counter.idle.notified();
            if self.in_flight() == 0 {
                self.mark_stopped();
                return true;
            }
            let timed_out = tokio::time::timeout_at(deadline, idle).await.is_err();
            if timed_out && self.in_flight() != 0 {
                return false;
            }
        }
    }

    pub fn mark_stopped(&self) {
        self.phase.store(Arc::new(Phase::Stopped));
    }
}

impl Default for LifecycleController {
    fn default() -> Self {
        Self::new()
    }
}

/// Held for the duration of one admitted submission.
#[derive(Debug)]
pub struct SubmissionGuard {
    counter: Arc<Counter>,
}

impl Drop for SubmissionGuard {
    fn drop(&mut self) {
        if self.counter.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.counter.idle.notify_waiters();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admission_follows_the_phase() {
        let lifecycle = LifecycleController::new();
        assert!(lifecycle.admit().is_none());
        assert_eq!(lifecycle.in_flight(), 0);

        lifecycle.set_ready();
        let guard = lifecycle.admit().unwrap();
        assert_eq!(lifecycle.in_flight(), 1);

        lifecycle.begin_drain();
        assert_eq!(lifecycle.phase(), Phase::Draining);
        assert!(lifecycle.admit().is_none());
        drop(guard);
        assert_eq!(lifecycle.in_flight(), 0);
    }

    #[tokio::test]
    async fn drain_waits_for_guards() {
        let lifecycle = Arc::new(LifecycleController::new());
        lifecycle.set_ready();
        let guard = lifecycle.admit().unwrap();
        lifecycle.begin_drain();
        assert!(*lifecycle.drain_receiver().borrow());

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            drop(guard);
        });
        assert!(lifecycle.wait_for_drain(Duration::from_secs(5)).await);
        assert_eq!(lifecycle.phase(), Phase::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn drain_gives_up_after_the_timeout() {
        let lifecycle = LifecycleController::new();
        lifecycle.set_ready();
        let _guard = lifecycle.admit().unwrap();
        lifecycle.begin_drain();

        assert!(!lifecycle.wait_for_drain(Duration::from_millis(100)).await);
        assert_eq!(lifecycle.phase(), Phase::Draining);
    }
}
