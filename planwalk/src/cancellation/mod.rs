//! Cooperative cancellation for pipeline runs.

use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Notify;

/// A cancellation handle shared by every branch of one run.
///
/// Cancellation is idempotent; only the first reason is kept.
#[derive(Default)]
pub struct RunCancellation {
    cancelled: AtomicBool,
    reason: RwLock<Option<String>>,
    notify: Notify,
}

impl RunCancellation {
    /// Creates a fresh, uncancelled handle.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation with a reason; the first reason wins.
    pub fn cancel(&self, reason: impl Into<String>) {
        if self
            .cancelled
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            *self.reason.write() = Some(reason.into());
        }
        self.notify.notify_waiters();
    }

    /// Returns whether cancellation has been requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Returns the cancellation reason, if any.
    #[must_use]
    pub fn reason(&self) -> Option<String> {
        self.reason.read().clone()
    }

    /// Completes when cancellation is requested.
    pub async fn cancelled(&self) {
        loop {
            // Arm the notification before checking the flag so a concurrent
            // cancel between the check and the await cannot be missed.
            let notified = self.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

impl std::fmt::Debug for RunCancellation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunCancellation")
            .field("cancelled", &self.is_cancelled())
            .field("reason", &self.reason())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_first_reason_wins() {
        let cancellation = RunCancellation::new();
        cancellation.cancel("user abort");
        cancellation.cancel("second reason");

        assert!(cancellation.is_cancelled());
        assert_eq!(cancellation.reason(), Some("user abort".to_string()));
    }

    #[tokio::test]
    async fn test_cancelled_wakes_waiters() {
        let cancellation = Arc::new(RunCancellation::new());
        let waiter = {
            let cancellation = Arc::clone(&cancellation);
            tokio::spawn(async move { cancellation.cancelled().await })
        };

        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        cancellation.cancel("abort");
        waiter.await.unwrap();
    }

    #[tokio::test]
    async fn test_already_cancelled_returns_immediately() {
        let cancellation = RunCancellation::new();
        cancellation.cancel("abort");
        cancellation.cancelled().await;
    }
}
