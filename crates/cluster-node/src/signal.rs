//! One-shot quit signal.
//!
//! Closing is a single compare-and-swap, so any number of tasks may race to
//! close the same signal: exactly one of them wins, the rest are no-ops.

use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Notify;

#[derive(Debug, Default)]
pub struct QuitSignal {
    closed: AtomicBool,
    notify: Notify,
}

impl QuitSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Close the signal and wake every waiter.
    ///
    /// Returns `true` only for the call that actually closed it.
    pub fn close(&self) -> bool {
        let first = self
            .closed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if first {
            self.notify.notify_waiters();
        }
        first
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Resolve once the signal is closed (immediately if it already is).
    pub async fn wait(&self) {
        // A `Notified` receives `notify_waiters` from the moment it is created,
        // so creating it before checking the flag cannot miss a close.
        let notified = self.notify.notified();
        if self.is_closed() {
            return;
        }
        notified.await;
    }
}
