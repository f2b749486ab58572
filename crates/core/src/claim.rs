//! One token shared by several concurrent completion paths.
//!
//! When a hand-off fans out (a batch of sub-tasks, several listeners on one
//! upstream future), each branch needs the transaction kept alive until it
//! completes, but there is only one token. [`RefCountedClaim`] counts the
//! branches and expires the token when the last one completes.
//!
//! # Protocol
//!
//! ```text
//! new(token)            count = 1  (the creator's share)
//! increment()           count += 1 before each extra branch is handed off
//! decrement()           count -= 1 when a branch is done, however it ended
//! try_release()         0 -> RELEASED, exactly once; winner expires the token
//! ```
//!
//! Release is a compare-and-swap from 0 to a sentinel, so two threads that
//! both decrement to zero cannot both release. The count never returns from
//! the sentinel: a claim is released at most once.

use crate::error::ClaimError;
use crate::registry::PriorGuard;
use crate::token::Token;
use crate::transaction::Transaction;
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, trace, warn};
use txlink_types::TokenId;

/// Count value once the token has been taken out and expired.
const RELEASED: usize = usize::MAX;

/// A [`Token`] shared between branches, released when the branch count
/// reaches zero.
///
/// Built from `Option<Token>` so call sites can pass along whatever
/// [`issue_token`](crate::issue_token) returned. A claim built from `None`
/// is empty: every operation on it succeeds without effect.
pub struct RefCountedClaim {
    count: AtomicUsize,
    token: Mutex<Option<Token>>,
    token_id: Option<TokenId>,
    /// Kept for reporting usage errors after the token is gone.
    transaction: Option<Arc<Transaction>>,
}

impl RefCountedClaim {
    pub fn new(token: Option<Token>) -> Self {
        let token_id = token.as_ref().map(Token::id);
        let transaction = token.as_ref().and_then(|t| t.transaction().cloned());
        Self {
            count: AtomicUsize::new(1),
            token: Mutex::new(token),
            token_id,
            transaction,
        }
    }

    pub fn token_id(&self) -> Option<TokenId> {
        self.token_id
    }

    pub fn is_empty(&self) -> bool {
        self.token_id.is_none()
    }

    /// Current branch count. Reads zero once released.
    pub fn count(&self) -> usize {
        match self.count.load(Ordering::Acquire) {
            RELEASED => 0,
            count => count,
        }
    }

    pub fn is_released(&self) -> bool {
        self.count.load(Ordering::Acquire) == RELEASED
    }

    /// Register one more branch. Call before the branch is handed off.
    pub fn increment(&self) -> Result<(), ClaimError> {
        if self.is_empty() {
            return Ok(());
        }
        let updated = self
            .count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| {
                count.checked_add(1).filter(|next| *next != RELEASED)
            });
        match updated {
            Ok(_) => Ok(()),
            Err(_) => {
                self.report_usage_error("Claim incremented after release");
                Err(ClaimError::AlreadyReleased {
                    token: self.token_id,
                })
            }
        }
    }

    /// Mark one branch done.
    ///
    /// Decrementing at zero is reported and leaves the count at zero.
    pub fn decrement(&self) -> Result<(), ClaimError> {
        if self.is_empty() {
            return Ok(());
        }
        let updated = self
            .count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| match count {
                0 | RELEASED => None,
                count => Some(count - 1),
            });
        match updated {
            Ok(_) => Ok(()),
            Err(RELEASED) => {
                self.report_usage_error("Claim decremented after release");
                Err(ClaimError::AlreadyReleased {
                    token: self.token_id,
                })
            }
            Err(_) => {
                self.report_usage_error("Claim reference count would drop below zero");
                Err(ClaimError::NegativeRefCount {
                    token: self.token_id,
                })
            }
        }
    }

    /// Expire the token if the count has reached zero.
    ///
    /// Returns `Ok(true)` to the single caller that released, `Ok(false)`
    /// while branches remain, and `AlreadyReleased` to anyone arriving after
    /// the release. A token the transaction already released by timeout or
    /// expire-all still counts as released here.
    pub fn try_release(&self) -> Result<bool, ClaimError> {
        if self.is_empty() {
            return Ok(false);
        }
        match self
            .count
            .compare_exchange(0, RELEASED, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => {}
            Err(RELEASED) => {
                // Concurrent decrementers legitimately race to here.
                debug!(token = ?self.token_id, "Claim already released");
                return Err(ClaimError::AlreadyReleased {
                    token: self.token_id,
                });
            }
            Err(_) => return Ok(false),
        }

        let token = self.token.lock().take();
        match token {
            Some(token) => {
                trace!(token = %token.id(), "Releasing ref-counted claim");
                // The transaction may have timed the token out while
                // branches ran; the count still completed normally.
                token.release_for_claim()?;
                Ok(true)
            }
            None => Err(ClaimError::AlreadyReleased {
                token: self.token_id,
            }),
        }
    }

    /// [`decrement`](Self::decrement) followed by
    /// [`try_release`](Self::try_release): what a branch calls on every exit
    /// path.
    pub fn complete_branch(&self) -> Result<bool, ClaimError> {
        self.decrement()?;
        self.try_release()
    }

    /// Link the shared token on the calling thread for one branch's
    /// fragment. `Ok(None)` for an empty claim.
    pub fn link(&self) -> Result<Option<PriorGuard>, ClaimError> {
        if self.is_empty() {
            return Ok(None);
        }
        match self.token.lock().as_ref() {
            Some(token) => token.link().map(Some),
            None => Err(ClaimError::AlreadyReleased {
                token: self.token_id,
            }),
        }
    }

    fn report_usage_error(&self, message: &'static str) {
        if let Some(tx) = &self.transaction {
            tx.record_usage_error();
        }
        warn!(token = ?self.token_id, "{}", message);
    }
}

impl fmt::Debug for RefCountedClaim {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RefCountedClaim")
            .field("token", &self.token_id)
            .field("count", &self.count())
            .field("released", &self.is_released())
            .finish()
    }
}
