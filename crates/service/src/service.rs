//! Tracks running transactions and sweeps their token timeouts.
//!
//! # Architecture
//!
//! ```text
//! begin() ──► Transaction ──► running: DashMap<TransactionId, Arc<Transaction>>
//!                                   │                       ▲
//!            reaper tick ──► process_queue(now)             │ remove on finish
//!                                   │                       │
//!                                   ▼                       │
//!                    expire_timed_out_tokens(now) ──► ServiceListener
//!                                                           │
//!                                                           ▼
//!                                              totals: TokenStats ──► harvest()
//! ```
//!
//! The finish listener holds only a weak reference back to the service, so
//! the running table never forms a reference cycle with its transactions.

use crate::config::ServiceConfig;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};
use txlink_core::{FinishedTransaction, PriorGuard, Transaction, TransactionListener};
use txlink_types::{TokenStats, TransactionId};

struct ServiceInner {
    config: ServiceConfig,
    running: DashMap<TransactionId, Arc<Transaction>>,
    totals: Mutex<TokenStats>,
    finished: AtomicU64,
    timed_out_transactions: AtomicU64,
    listeners: Vec<Arc<dyn TransactionListener>>,
}

/// Removes finished transactions from the running table and folds their
/// counters into the service totals.
struct ServiceListener {
    inner: Weak<ServiceInner>,
}

impl TransactionListener for ServiceListener {
    fn on_finished(&self, transaction: &FinishedTransaction) {
        let Some(inner) = self.inner.upgrade() else {
            return;
        };
        inner.running.remove(&transaction.id);
        inner.totals.lock().merge(&transaction.stats);
        inner.finished.fetch_add(1, Ordering::Relaxed);
        if transaction.timeout_cause.is_some() {
            inner.timed_out_transactions.fetch_add(1, Ordering::Relaxed);
        }
        trace!(
            transaction = %transaction.id,
            running = inner.running.len(),
            "Removed finished transaction"
        );
    }

    fn on_late_usage_error(&self, transaction: TransactionId) {
        let Some(inner) = self.inner.upgrade() else {
            return;
        };
        inner.totals.lock().usage_errors += 1;
        trace!(%transaction, "Counted usage error on finished transaction");
    }
}

/// Entry point for starting transactions and keeping their claims bounded.
#[derive(Clone)]
pub struct TransactionService {
    inner: Arc<ServiceInner>,
}

impl TransactionService {
    pub fn new(config: ServiceConfig) -> Self {
        Self::with_listeners(config, Vec::new())
    }

    /// Create a service whose transactions also notify `listeners` when
    /// they finish, after the service has recorded them.
    pub fn with_listeners(
        config: ServiceConfig,
        listeners: Vec<Arc<dyn TransactionListener>>,
    ) -> Self {
        Self {
            inner: Arc::new(ServiceInner {
                config,
                running: DashMap::new(),
                totals: Mutex::new(TokenStats::default()),
                finished: AtomicU64::new(0),
                timed_out_transactions: AtomicU64::new(0),
                listeners,
            }),
        }
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.inner.config
    }

    /// Start a transaction on the calling thread and track it until it
    /// finishes.
    pub fn begin(&self) -> (Arc<Transaction>, PriorGuard) {
        let mut listeners: Vec<Arc<dyn TransactionListener>> = Vec::with_capacity(
            1 + self.inner.listeners.len(),
        );
        listeners.push(Arc::new(ServiceListener {
            inner: Arc::downgrade(&self.inner),
        }));
        listeners.extend(self.inner.listeners.iter().cloned());

        let (transaction, root) = Transaction::begin(self.inner.config.claims.clone(), listeners);
        // The root fragment is open, so the transaction cannot finish before
        // it is in the table.
        self.inner
            .running
            .insert(transaction.id(), Arc::clone(&transaction));
        (transaction, root)
    }

    pub fn get(&self, id: TransactionId) -> Option<Arc<Transaction>> {
        self.inner.running.get(&id).map(|entry| Arc::clone(entry.value()))
    }

    pub fn running_count(&self) -> usize {
        self.inner.running.len()
    }

    /// Transactions finished since the service started.
    pub fn finished_count(&self) -> u64 {
        self.inner.finished.load(Ordering::Relaxed)
    }

    /// Finished transactions that needed the timeout sweep to finish.
    pub fn timed_out_count(&self) -> u64 {
        self.inner.timed_out_transactions.load(Ordering::Relaxed)
    }

    /// Release timed-out tokens across every running transaction. Returns the
    /// number of tokens released.
    pub fn process_queue(&self, now: Instant) -> usize {
        // Snapshot first: a sweep can finish a transaction, and its listener
        // removes it from the table.
        let running: Vec<Arc<Transaction>> = self
            .inner
            .running
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();

        let released: usize = running
            .iter()
            .map(|transaction| transaction.expire_timed_out_tokens(now))
            .sum();

        if released > 0 {
            debug!(
                released,
                scanned = running.len(),
                running = self.running_count(),
                "Swept timed-out tokens"
            );
        }
        released
    }

    /// Take the counters accumulated from finished transactions since the
    /// last harvest.
    pub fn harvest(&self) -> TokenStats {
        std::mem::take(&mut *self.inner.totals.lock())
    }

    /// Run [`process_queue`](Self::process_queue) every `sweep_interval`
    /// until `shutdown` is cancelled.
    pub fn spawn_reaper(&self, shutdown: CancellationToken) -> JoinHandle<()> {
        let service = self.clone();
        tokio::spawn(async move { service.run_reaper(shutdown).await })
    }

    async fn run_reaper(self, shutdown: CancellationToken) {
        let sweep_interval = self.inner.config.sweep_interval;
        let mut ticker = interval(sweep_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(
            interval_ms = sweep_interval.as_millis() as u64,
            token_timeout_secs = self.inner.config.claims.token_timeout.as_secs(),
            "Token reaper started"
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!(running = self.running_count(), "Token reaper shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    self.process_queue(Instant::now());
                }
            }
        }
    }
}

impl std::fmt::Debug for TransactionService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionService")
            .field("config", &self.inner.config)
            .field("running", &self.running_count())
            .field("finished", &self.finished_count())
            .finish()
    }
}
