use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::Notify;

use crate::error::AgentError;

/// Process-wide emergency stop. Cloned handles share one flag; the flag is
/// set at most once and never reset while runs are active. Components must
/// observe it at every suspension point, polling at least once per second
/// when they cannot select on it directly.
///
/// This is explicit shared state injected into every component constructor,
/// not an ambient global, so tests get a fresh token per run.
#[derive(Debug, Clone, Default)]
pub struct EmergencyStop {
    inner: Arc<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    stopped: AtomicBool,
    notify: Notify,
}

impl EmergencyStop {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raise the stop. Idempotent.
    pub fn trigger(&self) {
        if !self.inner.stopped.swap(true, Ordering::SeqCst) {
            tracing::warn!("emergency stop triggered");
        }
        self.inner.notify.notify_waiters();
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::SeqCst)
    }

    /// Fail fast when the stop has been raised.
    pub fn check(&self) -> Result<(), AgentError> {
        if self.is_stopped() {
            Err(AgentError::CancellationRequested)
        } else {
            Ok(())
        }
    }

    /// Resolve once the stop is raised. Re-arms the waiter at most every
    /// second so a missed notification cannot delay observation beyond the
    /// polling bound.
    pub async fn cancelled(&self) {
        while !self.is_stopped() {
            let notified = self.inner.notify.notified();
            if self.is_stopped() {
                break;
            }
            let _ = tokio::time::timeout(Duration::from_secs(1), notified).await;
        }
    }

    /// Sleep that wakes early on cancellation.
    pub async fn sleep(&self, duration: Duration) -> Result<(), AgentError> {
        tokio::select! {
            _ = tokio::time::sleep(duration) => Ok(()),
            _ = self.cancelled() => Err(AgentError::CancellationRequested),
        }
    }

    /// Blocking sleep for driver-side code, sliced so the stop is observed
    /// within the polling bound.
    pub fn blocking_sleep(&self, duration: Duration) -> Result<(), AgentError> {
        let slice = Duration::from_millis(250);
        let mut remaining = duration;
        while remaining > Duration::ZERO {
            self.check()?;
            let nap = remaining.min(slice);
            std::thread::sleep(nap);
            remaining -= nap;
        }
        self.check()
    }
}
