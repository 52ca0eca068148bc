//! Process-wide shutdown signal shared by the scheduler and the sinks.

use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Notify;

/// One-way latch: once triggered it stays triggered. Waiters are woken
/// exactly once per `triggered().await` call.
#[derive(Default)]
pub struct ShutdownSignal {
    flag: AtomicBool,
    notify: Notify,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        self.flag.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_triggered(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Resolve when the signal fires (immediately if it already has).
    pub async fn triggered(&self) {
        if self.is_triggered() {
            return;
        }
        let notified = self.notify.notified();
        if self.is_triggered() {
            return;
        }
        notified.await;
    }
}
