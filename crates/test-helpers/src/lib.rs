//! Test helpers for the transaction-link crates.
//!
//! Provides a listener that records finalized transactions and can block
//! until a given number have finished, for tests where the last claim is
//! released on another thread or runtime.

use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use txlink_core::{ClaimConfig, FinishedTransaction, PriorGuard, Transaction, TransactionListener};
use txlink_types::TransactionId;

/// Records every [`FinishedTransaction`] it is notified about.
#[derive(Debug, Default)]
pub struct RecordingListener {
    finished: Mutex<Vec<FinishedTransaction>>,
    changed: Condvar,
    late_usage_errors: AtomicU64,
}

impl RecordingListener {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Everything recorded so far, in notification order.
    pub fn finished(&self) -> Vec<FinishedTransaction> {
        self.finished.lock().clone()
    }

    pub fn count(&self) -> usize {
        self.finished.lock().len()
    }

    /// Usage errors reported after their transaction finished.
    pub fn late_usage_errors(&self) -> u64 {
        self.late_usage_errors.load(Ordering::Acquire)
    }

    /// Block until at least `count` transactions have finished.
    ///
    /// Returns false if `timeout` elapses first.
    pub fn wait_for(&self, count: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut finished = self.finished.lock();
        while finished.len() < count {
            if self.changed.wait_until(&mut finished, deadline).timed_out() {
                return finished.len() >= count;
            }
        }
        true
    }
}

impl TransactionListener for RecordingListener {
    fn on_finished(&self, transaction: &FinishedTransaction) {
        self.finished.lock().push(transaction.clone());
        self.changed.notify_all();
    }

    fn on_late_usage_error(&self, _transaction: TransactionId) {
        self.late_usage_errors.fetch_add(1, Ordering::AcqRel);
    }
}

/// Start a transaction on the calling thread with a fresh recording
/// listener attached.
pub fn begin_recorded(
    config: ClaimConfig,
) -> (Arc<Transaction>, PriorGuard, Arc<RecordingListener>) {
    let listener = RecordingListener::new();
    let (transaction, root) = Transaction::begin(config, vec![listener.clone()]);
    (transaction, root, listener)
}

/// [`begin_recorded`] with the default config.
pub fn begin_default() -> (Arc<Transaction>, PriorGuard, Arc<RecordingListener>) {
    begin_recorded(ClaimConfig::default())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wait_for_cross_thread_finish() {
        let (tx, root, listener) = begin_default();
        let token = tx.issue_token().unwrap();
        drop(root);

        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            token.expire().unwrap();
        });

        assert!(listener.wait_for(1, Duration::from_secs(5)));
        assert_eq!(listener.finished()[0].id, tx.id());
        handle.join().unwrap();
    }

    #[test]
    fn test_wait_for_times_out() {
        let (_tx, _root, listener) = begin_default();
        assert!(!listener.wait_for(1, Duration::from_millis(10)));
        assert_eq!(listener.count(), 0);
    }
}
