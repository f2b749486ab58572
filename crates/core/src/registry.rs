//! Per-thread record of the claim a thread is currently working under.
//!
//! Each thread owns a single slot. Entering a claim overwrites the slot and
//! hands back a [`PriorGuard`] holding the previous value; dropping the
//! guard writes that value back. Only the top of the stack is stored, but
//! because every guard restores exactly what it replaced, correctly nested
//! enters and restores compose like a stack:
//!
//! ```text
//! slot: None
//!   enter(A)      slot: A       guard_a.prior = None
//!     enter(B)    slot: B       guard_b.prior = A
//!     drop(b)     slot: A
//!   drop(a)       slot: None
//! ```
//!
//! The slot is never shared across threads, so none of this needs
//! synchronization.

use crate::transaction::{FragmentLease, Transaction};
use std::cell::RefCell;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;
use tracing::warn;
use txlink_types::{TokenId, TransactionId};

thread_local! {
    static ACTIVE_CLAIM: RefCell<Option<ClaimRef>> = const { RefCell::new(None) };
}

/// Reference to the transaction a thread is working for, and the token (if
/// any) through which it joined.
#[derive(Clone)]
pub struct ClaimRef {
    transaction: Arc<Transaction>,
    token: Option<TokenId>,
}

impl ClaimRef {
    pub fn new(transaction: Arc<Transaction>, token: Option<TokenId>) -> Self {
        Self { transaction, token }
    }

    pub fn transaction(&self) -> &Arc<Transaction> {
        &self.transaction
    }

    pub fn transaction_id(&self) -> TransactionId {
        self.transaction.id()
    }

    /// `None` for the thread that started the transaction and for plain
    /// [`Transaction::enter`] fragments.
    pub fn token_id(&self) -> Option<TokenId> {
        self.token
    }
}

impl PartialEq for ClaimRef {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.transaction, &other.transaction) && self.token == other.token
    }
}

impl Eq for ClaimRef {}

impl fmt::Debug for ClaimRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClaimRef")
            .field("transaction", &self.transaction.id())
            .field("token", &self.token)
            .finish()
    }
}

/// Access to the calling thread's active-claim slot.
pub struct ActiveClaimRegistry;

impl ActiveClaimRegistry {
    /// The claim the calling thread last entered, if any.
    pub fn current() -> Option<ClaimRef> {
        ACTIVE_CLAIM
            .try_with(|slot| slot.borrow().clone())
            .ok()
            .flatten()
    }

    /// The transaction the calling thread is working for, if any.
    pub fn current_transaction() -> Option<Arc<Transaction>> {
        ACTIVE_CLAIM
            .try_with(|slot| {
                slot.borrow()
                    .as_ref()
                    .map(|claim| Arc::clone(&claim.transaction))
            })
            .ok()
            .flatten()
    }

    /// Make `claim` the calling thread's active claim until the guard drops.
    ///
    /// `None` is a valid claim: it masks whatever the thread held, so work
    /// inside the guard is attributed to no transaction.
    pub fn enter(claim: Option<ClaimRef>) -> PriorGuard {
        Self::enter_with_lease(claim, None)
    }

    /// Like [`enter`](Self::enter), also holding a fragment of the claim's
    /// transaction open until the guard drops.
    pub(crate) fn enter_with_lease(
        claim: Option<ClaimRef>,
        lease: Option<FragmentLease>,
    ) -> PriorGuard {
        let installed = claim.clone();
        let prior = ACTIVE_CLAIM
            .try_with(|slot| slot.replace(claim))
            .ok()
            .flatten();
        PriorGuard {
            prior,
            installed,
            lease,
            _not_send: PhantomData,
        }
    }
}

/// Restores the calling thread's previous claim when dropped.
///
/// Must be dropped on the thread that created it; the type is `!Send` to
/// enforce that. Guards should be dropped in reverse order of creation.
/// Dropping out of order is reported but still writes back the value this
/// guard replaced.
#[must_use = "dropping the guard immediately restores the previous claim"]
pub struct PriorGuard {
    prior: Option<ClaimRef>,
    installed: Option<ClaimRef>,
    /// Dropped after the slot is restored, since releasing the last
    /// fragment may finalize the transaction.
    lease: Option<FragmentLease>,
    _not_send: PhantomData<*const ()>,
}

impl PriorGuard {
    /// The claim this guard installed.
    pub fn claim(&self) -> Option<&ClaimRef> {
        self.installed.as_ref()
    }

    /// The claim that will be restored.
    pub fn prior(&self) -> Option<&ClaimRef> {
        self.prior.as_ref()
    }

    /// Restore now. Equivalent to dropping the guard.
    pub fn restore(self) {}
}

impl Drop for PriorGuard {
    fn drop(&mut self) {
        let prior = self.prior.take();
        let installed = self.installed.take();
        let displaced = ACTIVE_CLAIM.try_with(|slot| slot.replace(prior)).ok();

        if let Some(displaced) = displaced {
            if displaced != installed {
                warn!(
                    expected = ?installed,
                    found = ?displaced,
                    "Active claim restored out of order"
                );
                if let Some(tx) = installed.as_ref().map(ClaimRef::transaction) {
                    tx.record_usage_error();
                }
            }
        }

        drop(self.lease.take());
    }
}

impl fmt::Debug for PriorGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PriorGuard")
            .field("installed", &self.installed)
            .field("prior", &self.prior)
            .field("holds_fragment", &self.lease.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClaimConfig;
    use crate::testing::begin_recorded;
    use tracing_test::traced_test;

    #[test]
    fn test_empty_by_default() {
        assert!(ActiveClaimRegistry::current().is_none());
        assert!(ActiveClaimRegistry::current_transaction().is_none());
    }

    #[test]
    fn test_nested_enter_restore() {
        let (tx1, root1, _l1) = begin_recorded(ClaimConfig::default());
        let (tx2, root2, _l2) = begin_recorded(ClaimConfig::default());
        drop(root2);
        drop(root1);
        let claim1 = ClaimRef::new(tx1, None);
        let claim2 = ClaimRef::new(tx2, None);

        assert!(ActiveClaimRegistry::current().is_none());

        let outer = ActiveClaimRegistry::enter(Some(claim1.clone()));
        assert_eq!(ActiveClaimRegistry::current(), Some(claim1.clone()));

        let inner = ActiveClaimRegistry::enter(Some(claim2.clone()));
        assert_eq!(ActiveClaimRegistry::current(), Some(claim2));
        assert_eq!(inner.prior(), Some(&claim1));

        inner.restore();
        assert_eq!(ActiveClaimRegistry::current(), Some(claim1));

        outer.restore();
        assert!(ActiveClaimRegistry::current().is_none());
    }

    #[test]
    fn test_deep_nesting_restores_each_level() {
        let claims: Vec<ClaimRef> = (0..16)
            .map(|_| {
                let (tx, _root, _listener) = begin_recorded(ClaimConfig::default());
                ClaimRef::new(tx, None)
            })
            .collect();

        let mut guards = Vec::new();
        for claim in &claims {
            let before = ActiveClaimRegistry::current();
            let guard = ActiveClaimRegistry::enter(Some(claim.clone()));
            assert_eq!(guard.prior().cloned(), before);
            guards.push(guard);
        }

        for depth in (0..claims.len()).rev() {
            assert_eq!(ActiveClaimRegistry::current().as_ref(), Some(&claims[depth]));
            drop(guards.pop());
        }
        assert!(ActiveClaimRegistry::current().is_none());
    }

    #[test]
    fn test_enter_none_masks_outer_claim() {
        let (tx, _root, _listener) = begin_recorded(ClaimConfig::default());
        assert!(ActiveClaimRegistry::current().is_some());

        {
            let _masked = ActiveClaimRegistry::enter(None);
            assert!(ActiveClaimRegistry::current().is_none());
            assert!(crate::issue_token().is_none());
        }

        assert_eq!(
            ActiveClaimRegistry::current_transaction().map(|t| t.id()),
            Some(tx.id())
        );
    }

    #[test]
    fn test_slots_are_per_thread() {
        let (_tx, _root, _listener) = begin_recorded(ClaimConfig::default());
        assert!(ActiveClaimRegistry::current().is_some());

        std::thread::spawn(|| assert!(ActiveClaimRegistry::current().is_none()))
            .join()
            .unwrap();
    }

    #[test]
    fn test_restore_on_panic() {
        let (tx, _root, _listener) = begin_recorded(ClaimConfig::default());
        let token = tx.issue_token().unwrap();
        let before = ActiveClaimRegistry::current();

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _guard = token.link().unwrap();
            panic!("fragment failed");
        }));

        assert!(result.is_err());
        assert_eq!(ActiveClaimRegistry::current(), before);
        assert_eq!(tx.running_fragments(), 1);
    }

    #[traced_test]
    #[test]
    fn test_out_of_order_restore_is_reported() {
        let (tx, _root, _listener) = begin_recorded(ClaimConfig::default());
        let root_claim = ActiveClaimRegistry::current();
        let other = {
            let (other, other_root, _other_listener) = begin_recorded(ClaimConfig::default());
            drop(other_root);
            ClaimRef::new(other, None)
        };

        let first = tx.enter().unwrap();
        let second = ActiveClaimRegistry::enter(Some(other));
        drop(first);
        assert!(logs_contain("restored out of order"));

        // The second guard still writes back what it replaced.
        drop(second);
        assert_eq!(ActiveClaimRegistry::current(), root_claim);
        assert_eq!(tx.running_fragments(), 1);
        assert_eq!(tx.stats().usage_errors, 1);
    }
}
