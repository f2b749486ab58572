//! The transaction whose lifetime tokens protect.
//!
//! A transaction stays alive while it has outstanding work: live tokens plus
//! running fragments. A fragment is one synchronous stretch of execution on
//! some thread (the root stretch opened by [`Transaction::begin`], or a
//! resumption opened by linking a token). When both counts reach zero the
//! transaction moves to `Finishing`, notifies its listeners exactly once and
//! then becomes `Finished`.
//!
//! ```text
//!   begin() ──► root fragment ─┐
//!                              ├─ mint ──► Token ──(hand-off)──► link() ──► fragment
//!                              │                                   │
//!                              ▼                                   ▼
//!                     guard dropped                      expire / guard dropped
//!                              │                                   │
//!                              └──────────► outstanding == 0 ◄─────┘
//!                                                  │
//!                                                  ▼
//!                                      Finishing ─► listeners ─► Finished
//! ```

use crate::config::ClaimConfig;
use crate::counters::TokenCounters;
use crate::error::ClaimError;
use crate::listener::{FinishedTransaction, TransactionListener};
use crate::registry::{ActiveClaimRegistry, ClaimRef, PriorGuard};
use crate::token::Token;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, trace, warn};
use txlink_types::{TimeoutCause, TokenId, TokenStats, TransactionId, TransactionPhase};

/// How a token's claim is being given back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ReleaseOrigin {
    /// `expire` or `link_and_expire`. Releasing a missing token is a usage
    /// error.
    Explicit,
    /// The token was dropped. A missing token means the transaction already
    /// released it, which is fine.
    Dropped,
    /// The last branch of a ref-counted claim completed. The transaction may
    /// have timed the shared token out while branches ran, which is fine.
    Claim,
}

#[derive(Debug)]
struct TransactionState {
    phase: TransactionPhase,
    /// Live tokens and the instant each was last minted or linked.
    tokens: HashMap<TokenId, Instant>,
    running_fragments: usize,
    timeout_cause: Option<TimeoutCause>,
    /// Set when finalization snapshots the counters. Usage errors detected
    /// afterwards go to the listeners instead.
    stats_reported: bool,
}

impl TransactionState {
    fn is_idle(&self) -> bool {
        self.tokens.is_empty() && self.running_fragments == 0
    }

    /// Move to `Finishing` if nothing is outstanding. Returns true for the
    /// single caller that made the transition.
    fn begin_finish_if_idle(&mut self) -> bool {
        if self.phase == TransactionPhase::Active && self.is_idle() {
            self.phase = TransactionPhase::Finishing;
            true
        } else {
            false
        }
    }
}

/// A logical unit of work followed across threads.
pub struct Transaction {
    id: TransactionId,
    config: ClaimConfig,
    started_at: Instant,
    state: Mutex<TransactionState>,
    next_token: AtomicU64,
    counters: TokenCounters,
    listeners: Vec<Arc<dyn TransactionListener>>,
}

impl Transaction {
    /// Start a transaction on the calling thread.
    ///
    /// The returned guard is the root fragment: the transaction cannot
    /// finish before it is dropped, and while it is alive the calling thread
    /// reports this transaction from [`ActiveClaimRegistry::current`].
    pub fn begin(
        config: ClaimConfig,
        listeners: Vec<Arc<dyn TransactionListener>>,
    ) -> (Arc<Transaction>, PriorGuard) {
        let transaction = Arc::new(Transaction {
            id: TransactionId::allocate(),
            config,
            started_at: Instant::now(),
            state: Mutex::new(TransactionState {
                phase: TransactionPhase::Active,
                tokens: HashMap::new(),
                running_fragments: 1,
                timeout_cause: None,
                stats_reported: false,
            }),
            next_token: AtomicU64::new(1),
            counters: TokenCounters::default(),
            listeners,
        });

        debug!(transaction = %transaction.id, "Transaction started");

        let lease = FragmentLease {
            transaction: Arc::clone(&transaction),
        };
        let guard = ActiveClaimRegistry::enter_with_lease(
            Some(ClaimRef::new(Arc::clone(&transaction), None)),
            Some(lease),
        );
        (transaction, guard)
    }

    pub fn id(&self) -> TransactionId {
        self.id
    }

    pub fn config(&self) -> &ClaimConfig {
        &self.config
    }

    pub fn phase(&self) -> TransactionPhase {
        self.state.lock().phase
    }

    /// Whether finalization has started.
    pub fn is_finished(&self) -> bool {
        self.phase().is_finished()
    }

    /// Live tokens plus running fragments.
    pub fn outstanding(&self) -> usize {
        let state = self.state.lock();
        state.tokens.len() + state.running_fragments
    }

    pub fn active_token_count(&self) -> usize {
        self.state.lock().tokens.len()
    }

    pub fn running_fragments(&self) -> usize {
        self.state.lock().running_fragments
    }

    pub fn timeout_cause(&self) -> Option<TimeoutCause> {
        self.state.lock().timeout_cause
    }

    /// Snapshot of this transaction's token counters.
    pub fn stats(&self) -> TokenStats {
        self.counters.snapshot()
    }

    /// Mint a token that keeps this transaction alive across a hand-off.
    ///
    /// Returns `None` when the calling thread is not currently working for
    /// this transaction, when the transaction is finishing, or when the
    /// token limit has been reached. Absence is a normal outcome: callers
    /// hand off the work without a claim.
    pub fn issue_token(self: &Arc<Self>) -> Option<Token> {
        let on_this_thread = ActiveClaimRegistry::current()
            .is_some_and(|claim| Arc::ptr_eq(claim.transaction(), self));
        if !on_this_thread {
            debug!(
                transaction = %self.id,
                "Cannot create token, transaction is not active on this thread"
            );
            return None;
        }
        self.mint()
    }

    /// Open a fragment on the calling thread without a token.
    ///
    /// Used by code that already holds the transaction (for example, the
    /// thread that started it re-entering after a nested claim). Returns
    /// `None` once the transaction is finishing.
    pub fn enter(self: &Arc<Self>) -> Option<PriorGuard> {
        let lease = self.acquire_fragment()?;
        Some(ActiveClaimRegistry::enter_with_lease(
            Some(ClaimRef::new(Arc::clone(self), None)),
            Some(lease),
        ))
    }

    /// Forcibly release every live token. Returns the number released.
    pub fn expire_all_tokens(&self) -> usize {
        let (count, finishing) = {
            let mut state = self.state.lock();
            if state.phase != TransactionPhase::Active || state.tokens.is_empty() {
                return 0;
            }
            let count = state.tokens.len();
            state.tokens.clear();
            (count, state.begin_finish_if_idle())
        };

        debug!(transaction = %self.id, count, "Forcibly expired all active tokens");
        self.counters.record_expired(count as u64);
        if finishing {
            self.finish();
        }
        count
    }

    /// Release tokens that have not been minted or linked within the
    /// configured timeout. Returns the number released.
    ///
    /// Nothing is released while a fragment is running: a running fragment
    /// may still link or expire its tokens.
    pub fn expire_timed_out_tokens(&self, now: Instant) -> usize {
        let timeout = self.config.token_timeout;
        let (count, finishing) = {
            let mut state = self.state.lock();
            if state.phase != TransactionPhase::Active || state.running_fragments > 0 {
                return 0;
            }
            let before = state.tokens.len();
            state
                .tokens
                .retain(|_, last_access| now.saturating_duration_since(*last_access) < timeout);
            let count = before - state.tokens.len();
            if count == 0 {
                return 0;
            }
            state.timeout_cause = Some(TimeoutCause::Token);
            (count, state.begin_finish_if_idle())
        };

        info!(
            transaction = %self.id,
            count,
            timeout = ?timeout,
            "Forcibly expiring tokens due to time out"
        );
        self.counters.record_timed_out(count as u64);
        if finishing {
            self.finish();
        }
        count
    }

    /// Mint without checking which thread is asking. Callers must already be
    /// working for this transaction.
    pub(crate) fn mint(self: &Arc<Self>) -> Option<Token> {
        let id = {
            let mut state = self.state.lock();
            if !state.phase.accepts_claims() {
                debug!(transaction = %self.id, "Already finished, cannot create token");
                return None;
            }
            if self.counters.created() >= self.config.token_limit as u64 {
                debug!(
                    transaction = %self.id,
                    limit = self.config.token_limit,
                    "Token limit exceeded, ignoring further async activity"
                );
                return None;
            }
            let id = TokenId(self.next_token.fetch_add(1, Ordering::Relaxed));
            state.tokens.insert(id, Instant::now());
            self.counters.record_created();
            id
        };

        trace!(transaction = %self.id, token = %id, "Created token");
        Some(Token::new(id, Arc::clone(self)))
    }

    /// Whether the transaction still holds the token's claim.
    pub(crate) fn holds_token(&self, token: TokenId) -> bool {
        self.state.lock().tokens.contains_key(&token)
    }

    /// Refresh the token and open a fragment for it, in one step.
    pub(crate) fn link_token(self: &Arc<Self>, token: TokenId) -> Result<FragmentLease, ClaimError> {
        let mut state = self.state.lock();
        if !state.phase.accepts_claims() {
            return Err(ClaimError::TransactionFinished {
                transaction: self.id,
            });
        }
        match state.tokens.get_mut(&token) {
            Some(last_access) => *last_access = Instant::now(),
            None => return Err(ClaimError::AlreadyExpired { token }),
        }
        state.running_fragments += 1;
        Ok(FragmentLease {
            transaction: Arc::clone(self),
        })
    }

    /// Give the token's claim back and open a fragment, in one step, so
    /// there is no instant where the token is linked but not yet releasing.
    pub(crate) fn link_and_release_token(
        self: &Arc<Self>,
        token: TokenId,
    ) -> Result<FragmentLease, ClaimError> {
        {
            let mut state = self.state.lock();
            if !state.phase.accepts_claims() {
                return Err(ClaimError::TransactionFinished {
                    transaction: self.id,
                });
            }
            if state.tokens.remove(&token).is_none() {
                return Err(ClaimError::AlreadyExpired { token });
            }
            state.running_fragments += 1;
        }
        self.counters.record_expired(1);
        Ok(FragmentLease {
            transaction: Arc::clone(self),
        })
    }

    /// Give a token's claim back. Finalizes the transaction if this was the
    /// last outstanding claim.
    pub(crate) fn release_token(
        &self,
        token: TokenId,
        origin: ReleaseOrigin,
    ) -> Result<(), ClaimError> {
        let finishing = {
            let mut state = self.state.lock();
            if state.tokens.remove(&token).is_none() {
                drop(state);
                return match origin {
                    ReleaseOrigin::Explicit => {
                        self.record_usage_error();
                        warn!(
                            transaction = %self.id,
                            token = %token,
                            "Token is not active and so cannot be expired"
                        );
                        Err(ClaimError::AlreadyExpired { token })
                    }
                    ReleaseOrigin::Dropped | ReleaseOrigin::Claim => Ok(()),
                };
            }
            state.begin_finish_if_idle()
        };

        self.counters.record_expired(1);
        trace!(transaction = %self.id, token = %token, ?origin, "Expired token");
        if finishing {
            self.finish();
        }
        Ok(())
    }

    pub(crate) fn counters(&self) -> &TokenCounters {
        &self.counters
    }

    /// Count a usage error. Errors detected after finalization has reported
    /// the counters are forwarded to the listeners so they are not lost.
    pub(crate) fn record_usage_error(&self) {
        let reported = {
            let state = self.state.lock();
            self.counters.record_usage_error();
            state.stats_reported
        };
        if reported {
            for listener in &self.listeners {
                listener.on_late_usage_error(self.id);
            }
        }
    }

    fn acquire_fragment(self: &Arc<Self>) -> Option<FragmentLease> {
        let mut state = self.state.lock();
        if !state.phase.accepts_claims() {
            debug!(transaction = %self.id, "Already finished, cannot enter");
            return None;
        }
        state.running_fragments += 1;
        Some(FragmentLease {
            transaction: Arc::clone(self),
        })
    }

    fn release_fragment(&self) {
        let finishing = {
            let mut state = self.state.lock();
            match state.running_fragments.checked_sub(1) {
                Some(remaining) => state.running_fragments = remaining,
                None => {
                    drop(state);
                    self.record_usage_error();
                    warn!(transaction = %self.id, "Fragment released more often than entered");
                    return;
                }
            }
            state.begin_finish_if_idle()
        };
        if finishing {
            self.finish();
        }
    }

    /// Runs once, on the thread that made the `Active -> Finishing`
    /// transition.
    fn finish(&self) {
        let finished = {
            let mut state = self.state.lock();
            state.stats_reported = true;
            FinishedTransaction {
                id: self.id,
                stats: self.counters.snapshot(),
                timeout_cause: state.timeout_cause,
                duration: self.started_at.elapsed(),
            }
        };

        debug!(
            transaction = %self.id,
            duration = ?finished.duration,
            tokens_created = finished.stats.created,
            "Transaction finished"
        );

        for listener in &self.listeners {
            listener.on_finished(&finished);
        }

        self.state.lock().phase = TransactionPhase::Finished;
    }
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("phase", &state.phase)
            .field("tokens", &state.tokens.len())
            .field("running_fragments", &state.running_fragments)
            .finish()
    }
}

/// One running fragment's share of a transaction's outstanding work.
pub(crate) struct FragmentLease {
    transaction: Arc<Transaction>,
}

impl Drop for FragmentLease {
    fn drop(&mut self) {
        self.transaction.release_fragment();
    }
}
