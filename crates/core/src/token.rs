//! Single-use claims on a transaction's lifetime.

use crate::error::ClaimError;
use crate::registry::{ActiveClaimRegistry, ClaimRef, PriorGuard};
use crate::transaction::{ReleaseOrigin, Transaction};
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use tracing::{debug, trace, warn};
use txlink_types::{TokenId, TokenState, TransactionId};

/// A claim that keeps a transaction alive across a concurrency boundary.
///
/// Minted on a thread that is working for the transaction, moved into
/// whatever deferred-work object carries it, and released exactly once:
///
/// - [`expire`](Token::expire) consumes the token, so it cannot be released
///   twice through the same value.
/// - Dropping an unreleased token releases its claim, so a cancelled
///   deferred-work object never keeps the transaction open.
/// - [`link`](Token::link) may be called any number of times before that,
///   once per resumption.
pub struct Token {
    id: TokenId,
    /// Taken (set to `None`) on release.
    transaction: Option<Arc<Transaction>>,
    state: AtomicU8,
}

impl Token {
    pub(crate) fn new(id: TokenId, transaction: Arc<Transaction>) -> Self {
        Self {
            id,
            transaction: Some(transaction),
            state: AtomicU8::new(TokenState::Active.as_u8()),
        }
    }

    pub fn id(&self) -> TokenId {
        self.id
    }

    pub fn state(&self) -> TokenState {
        TokenState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn transaction_id(&self) -> Option<TransactionId> {
        self.transaction.as_ref().map(|tx| tx.id())
    }

    pub(crate) fn transaction(&self) -> Option<&Arc<Transaction>> {
        self.transaction.as_ref()
    }

    /// Whether linking would currently succeed.
    ///
    /// A token can go inactive without being touched, when its transaction
    /// times it out or force-expires it.
    pub fn is_active(&self) -> bool {
        match &self.transaction {
            Some(tx) => !self.state().is_expired() && tx.holds_token(self.id),
            None => false,
        }
    }

    /// Attach the calling thread to this token's transaction.
    ///
    /// Until the returned guard is dropped, work on this thread is
    /// attributed to the transaction and the transaction cannot finish.
    /// Dropping the guard restores whatever claim the thread held before.
    ///
    /// Fails, without touching the thread's registry slot, when the token
    /// has already been released.
    pub fn link(&self) -> Result<PriorGuard, ClaimError> {
        let tx = match &self.transaction {
            Some(tx) if !self.state().is_expired() => tx,
            _ => {
                if let Some(tx) = &self.transaction {
                    tx.counters().record_link_ignored();
                }
                warn!(token = %self.id, "Ignoring link call on expired token");
                return Err(ClaimError::AlreadyExpired { token: self.id });
            }
        };

        let lease = match tx.link_token(self.id) {
            Ok(lease) => lease,
            Err(err) => {
                self.state
                    .store(TokenState::Expired.as_u8(), Ordering::Release);
                tx.counters().record_link_ignored();
                debug!(
                    transaction = %tx.id(),
                    token = %self.id,
                    error = %err,
                    "Ignoring link call because token is no longer active"
                );
                return Err(err);
            }
        };

        let _ = self.state.compare_exchange(
            TokenState::Active.as_u8(),
            TokenState::Linked.as_u8(),
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        tx.counters().record_link_succeeded();
        trace!(transaction = %tx.id(), token = %self.id, "Linked token");

        Ok(ActiveClaimRegistry::enter_with_lease(
            Some(ClaimRef::new(Arc::clone(tx), Some(self.id))),
            Some(lease),
        ))
    }

    /// Release the claim.
    ///
    /// If this was the last outstanding claim and nothing is running, the
    /// transaction finalizes on this thread.
    pub fn expire(mut self) -> Result<(), ClaimError> {
        self.release(ReleaseOrigin::Explicit)
    }

    /// Link and release in one step, for the common "resume once" case.
    ///
    /// The claim is handed over to the fragment the returned guard
    /// represents, so the transaction stays open until the guard drops but
    /// no longer counts this token.
    pub fn link_and_expire(mut self) -> Result<PriorGuard, ClaimError> {
        let previous = TokenState::from_u8(
            self.state
                .swap(TokenState::Expired.as_u8(), Ordering::AcqRel),
        );
        let tx = match self.transaction.take() {
            Some(tx) if !previous.is_expired() => tx,
            stale => {
                if let Some(tx) = stale {
                    tx.counters().record_link_ignored();
                }
                warn!(token = %self.id, "Ignoring link call on expired token");
                return Err(ClaimError::AlreadyExpired { token: self.id });
            }
        };

        match tx.link_and_release_token(self.id) {
            Ok(lease) => {
                tx.counters().record_link_succeeded();
                trace!(transaction = %tx.id(), token = %self.id, "Linked and expired token");
                Ok(ActiveClaimRegistry::enter_with_lease(
                    Some(ClaimRef::new(tx, Some(self.id))),
                    Some(lease),
                ))
            }
            Err(err) => {
                tx.counters().record_link_ignored();
                debug!(
                    transaction = %tx.id(),
                    token = %self.id,
                    error = %err,
                    "Ignoring link call because token is no longer active"
                );
                Err(err)
            }
        }
    }

    /// Release on behalf of a [`RefCountedClaim`](crate::RefCountedClaim)
    /// whose last branch completed. Finding the claim already timed out or
    /// force-expired is not an error here.
    pub(crate) fn release_for_claim(mut self) -> Result<(), ClaimError> {
        self.release(ReleaseOrigin::Claim)
    }

    fn release(&mut self, origin: ReleaseOrigin) -> Result<(), ClaimError> {
        let previous = TokenState::from_u8(
            self.state
                .swap(TokenState::Expired.as_u8(), Ordering::AcqRel),
        );
        let Some(tx) = self.transaction.take() else {
            return Err(ClaimError::AlreadyExpired { token: self.id });
        };

        if previous.is_expired() {
            // A link already found the claim gone.
            if origin == ReleaseOrigin::Explicit {
                tx.record_usage_error();
                warn!(
                    transaction = %tx.id(),
                    token = %self.id,
                    "Token is not active and so cannot be expired"
                );
                return Err(ClaimError::AlreadyExpired { token: self.id });
            }
            return Ok(());
        }

        tx.release_token(self.id, origin)
    }
}

impl Drop for Token {
    fn drop(&mut self) {
        if self.transaction.is_some() {
            debug!(token = %self.id, "Token dropped without expire, releasing claim");
            let _ = self.release(ReleaseOrigin::Dropped);
        }
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Token")
            .field("id", &self.id)
            .field("transaction", &self.transaction_id())
            .field("state", &self.state())
            .finish()
    }
}
