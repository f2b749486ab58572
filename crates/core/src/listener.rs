//! Finalization callbacks.

use std::time::Duration;
use txlink_types::{TimeoutCause, TokenStats, TransactionId};

/// Summary handed to listeners when a transaction finalizes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinishedTransaction {
    pub id: TransactionId,
    /// Token counters at the moment the last claim was released.
    pub stats: TokenStats,
    /// Set when the timeout sweep had to release tokens.
    pub timeout_cause: Option<TimeoutCause>,
    /// Wall time from `begin` to finalization.
    pub duration: Duration,
}

/// Observer notified exactly once per transaction, on the thread that
/// released the last outstanding claim.
///
/// Implementations must not block: they run inside whatever completion
/// handler happened to release the final claim.
pub trait TransactionListener: Send + Sync {
    fn on_finished(&self, transaction: &FinishedTransaction);

    /// A usage error detected after `on_finished` took its stats snapshot,
    /// such as expiring a token the transaction already released. Called
    /// once per error, on the offending thread.
    fn on_late_usage_error(&self, _transaction: TransactionId) {}
}

impl<F> TransactionListener for F
where
    F: Fn(&FinishedTransaction) + Send + Sync,
{
    fn on_finished(&self, transaction: &FinishedTransaction) {
        self(transaction)
    }
}
