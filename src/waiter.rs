//! Interruptible sleep between retry attempts.

use std::time::Duration;

use tokio::sync::Notify;

/// A sleep primitive that can be woken early.
///
/// Interruption is a signal, not an error: a woken sleeper proceeds exactly
/// as if the full duration had elapsed. The caller re-checks resource state
/// after every wait, so there is nothing for the waiter itself to report.
#[derive(Debug, Default)]
pub struct Waiter {
    notify: Notify,
}

impl Waiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleep up to `duration`, returning early if interrupted.
    pub async fn wait_for(&self, duration: Duration) {
        let _ = tokio::time::timeout(duration, self.notify.notified()).await;
    }

    /// Wake every current sleeper.
    pub fn interrupt_waiters(&self) {
        self.notify.notify_waiters();
    }
}
