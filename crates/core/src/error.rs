//! Usage errors detected by the claim primitives.
//!
//! None of these are faults of the host application. They are returned so
//! adapters can react, and are always logged where they are detected.

use thiserror::Error;
use txlink_types::{TokenId, TransactionId};

/// Errors reported by tokens, ref-counted claims and transactions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ClaimError {
    /// The token's claim was already released (expired, timed out, or
    /// force-expired by its transaction).
    #[error("{token} has already expired")]
    AlreadyExpired { token: TokenId },

    /// A ref-counted claim was used after its token was released.
    #[error("claim has already been released")]
    AlreadyReleased { token: Option<TokenId> },

    /// More decrements than increments.
    #[error("claim reference count would drop below zero")]
    NegativeRefCount { token: Option<TokenId> },

    /// The transaction has started finalizing and accepts no new work.
    #[error("{transaction} is no longer accepting claims")]
    TransactionFinished { transaction: TransactionId },
}

impl ClaimError {
    /// Whether this error indicates a programming error at the call site,
    /// as opposed to a benign race with finalization.
    pub fn is_usage_error(&self) -> bool {
        !matches!(self, ClaimError::TransactionFinished { .. })
    }
}
