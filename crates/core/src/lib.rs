//! Transaction-lifetime claims that survive thread hand-offs.
//!
//! A transaction runs as a series of fragments, possibly on many threads.
//! Whenever work is handed off (queued, scheduled, or parked as a
//! continuation), the handing-off thread mints a [`Token`] and moves it into
//! the deferred work. While any token is unreleased the transaction cannot
//! finish. The worker that picks the work up links the token, which makes
//! the transaction its thread's active claim for the duration of the
//! fragment, and expires it when done.
//!
//! # Architecture
//!
//! ```text
//! producer thread                      worker thread
//! ───────────────                      ─────────────
//! Transaction::begin()  ─► registry slot = tx
//! issue_token() ─► Token ──(queue)──►  token.link() ─► PriorGuard
//!                                       │   registry slot = tx
//!                                       │   ... fragment runs ...
//!                                       ▼
//!                                      token.expire(); guard dropped
//!                                          registry slot = prior value
//! ```
//!
//! - [`Token`]: a single-use claim. Released by `expire`, `link_and_expire`,
//!   or by being dropped.
//! - [`RefCountedClaim`]: one token shared by a fan-out of branches,
//!   released once when the last branch completes.
//! - [`ActiveClaimRegistry`]: the per-thread slot holding the current claim,
//!   restored by [`PriorGuard`] on every exit path.
//!
//! Minting is best effort. With no transaction on the current thread,
//! [`issue_token`] returns `None` and every consumer treats that as "no
//! claim to carry".

mod claim;
mod config;
mod counters;
mod error;
mod listener;
mod registry;
mod token;
mod transaction;

#[cfg(test)]
mod testing;

pub use claim::RefCountedClaim;
pub use config::{ClaimConfig, DEFAULT_TOKEN_LIMIT, DEFAULT_TOKEN_TIMEOUT};
pub use error::ClaimError;
pub use listener::{FinishedTransaction, TransactionListener};
pub use registry::{ActiveClaimRegistry, ClaimRef, PriorGuard};
pub use token::Token;
pub use transaction::Transaction;

use std::sync::Arc;

/// Mint a token for whatever transaction the calling thread is working for.
///
/// Returns `None` when no transaction is active on this thread, or when the
/// active transaction refuses (finishing, or over its token limit).
pub fn issue_token() -> Option<Token> {
    match ActiveClaimRegistry::current_transaction() {
        Some(transaction) => transaction.mint(),
        None => {
            tracing::trace!("No active transaction, not creating token");
            None
        }
    }
}

/// The transaction the calling thread is working for, if any.
pub fn current_transaction() -> Option<Arc<Transaction>> {
    ActiveClaimRegistry::current_transaction()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::begin_recorded;

    #[test]
    fn test_issue_token_without_transaction() {
        assert!(current_transaction().is_none());
        assert!(issue_token().is_none());
    }

    #[test]
    fn test_issue_token_from_linked_worker() {
        let (tx, root, listener) = begin_recorded(ClaimConfig::default());
        let token = issue_token().unwrap();
        drop(root);

        // A linked worker can hand work off again.
        let nested = std::thread::spawn(move || {
            let _guard = token.link_and_expire().unwrap();
            issue_token()
        })
        .join()
        .unwrap()
        .unwrap();

        assert!(!tx.is_finished());
        assert_eq!(nested.transaction_id(), Some(tx.id()));
        nested.expire().unwrap();

        assert!(tx.is_finished());
        assert_eq!(listener.finished()[0].stats.created, 2);
    }
}
