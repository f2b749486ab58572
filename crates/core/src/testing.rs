//! Fixtures for this crate's unit tests.
//!
//! These mirror `txlink-test-helpers`, which cannot be used here: it depends
//! on this crate, so a dev-dependency on it would link a second copy of
//! `txlink-core` whose types do not match the ones under test.

use crate::config::ClaimConfig;
use crate::listener::{FinishedTransaction, TransactionListener};
use crate::registry::PriorGuard;
use crate::transaction::Transaction;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use txlink_types::TransactionId;

#[derive(Debug, Default)]
pub(crate) struct RecordingListener {
    finished: Mutex<Vec<FinishedTransaction>>,
    late_usage_errors: AtomicU64,
}

impl RecordingListener {
    pub(crate) fn finished(&self) -> Vec<FinishedTransaction> {
        self.finished.lock().clone()
    }

    pub(crate) fn late_usage_errors(&self) -> u64 {
        self.late_usage_errors.load(Ordering::Acquire)
    }
}

impl TransactionListener for RecordingListener {
    fn on_finished(&self, transaction: &FinishedTransaction) {
        self.finished.lock().push(transaction.clone());
    }

    fn on_late_usage_error(&self, _transaction: TransactionId) {
        self.late_usage_errors.fetch_add(1, Ordering::AcqRel);
    }
}

pub(crate) fn begin_recorded(
    config: ClaimConfig,
) -> (Arc<Transaction>, PriorGuard, Arc<RecordingListener>) {
    let listener = Arc::new(RecordingListener::default());
    let (transaction, root) = Transaction::begin(config, vec![listener.clone()]);
    (transaction, root, listener)
}
