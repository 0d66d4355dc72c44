//! Poll wake-up signal.
//!
//! The notifier carries a single message to the scheduler loop: "a new due job
//! may exist, check now". Any number of notifications sent while the loop is
//! busy collapse into one immediate poll.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Notify;

use crate::storage::JobTransaction;

/// Commit-hook key under which the wake-up is registered on a transaction.
pub const WAKE_HOOK_KEY: &str = "jobq.scheduler-wake";

#[derive(Debug, Default)]
struct NotifierState {
    skip_wait: AtomicBool,
    notify: Notify,
}

/// Coalescing, transaction-aware wake-up for the scheduler loop.
///
/// Clones share the same signal.
#[derive(Debug, Clone, Default)]
pub struct Notifier {
    state: Arc<NotifierState>,
}

impl Notifier {
    /// Create a new notifier.
    pub fn new() -> Self {
        Self::default()
    }

    /// Wake the loop now. The next wait returns immediately.
    pub fn notify(&self) {
        self.state.skip_wait.store(true, Ordering::SeqCst);
        self.state.notify.notify_waiters();
    }

    /// Defer the wake-up until `tx` commits.
    ///
    /// Registered at most once per transaction; a rolled back transaction never
    /// wakes the loop.
    pub fn notify_on_commit(&self, tx: &mut dyn JobTransaction) {
        let notifier = self.clone();
        tx.on_commit_once(WAKE_HOOK_KEY, Box::new(move || notifier.notify()));
    }

    /// Wake inside `tx` if one is open, otherwise immediately.
    pub fn poll_now(&self, tx: Option<&mut dyn JobTransaction>) {
        match tx {
            Some(tx) => self.notify_on_commit(tx),
            None => self.notify(),
        }
    }

    /// Check if a wake-up is pending.
    pub fn is_pending(&self) -> bool {
        self.state.skip_wait.load(Ordering::SeqCst)
    }

    /// Sleep for `timeout` or until notified, whichever comes first.
    ///
    /// Returns `true` if woken by a notification. Consumes the pending flag.
    pub async fn wait(&self, timeout: Duration) -> bool {
        let notified = self.state.notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        if self.state.skip_wait.swap(false, Ordering::SeqCst) {
            return true;
        }

        tokio::select! {
            _ = &mut notified => {
                self.state.skip_wait.store(false, Ordering::SeqCst);
                true
            }
            _ = tokio::time::sleep(timeout) => false,
        }
    }
}
