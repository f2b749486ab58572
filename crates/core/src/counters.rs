//! Lock-free token counters kept per transaction.

use std::sync::atomic::{AtomicU64, Ordering};
use txlink_types::TokenStats;

#[derive(Debug, Default)]
pub(crate) struct TokenCounters {
    created: AtomicU64,
    expired: AtomicU64,
    timed_out: AtomicU64,
    link_succeeded: AtomicU64,
    link_ignored: AtomicU64,
    usage_errors: AtomicU64,
}

impl TokenCounters {
    pub(crate) fn created(&self) -> u64 {
        self.created.load(Ordering::Relaxed)
    }

    pub(crate) fn record_created(&self) {
        self.created.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_expired(&self, count: u64) {
        self.expired.fetch_add(count, Ordering::Relaxed);
    }

    pub(crate) fn record_timed_out(&self, count: u64) {
        self.timed_out.fetch_add(count, Ordering::Relaxed);
    }

    pub(crate) fn record_link_succeeded(&self) {
        self.link_succeeded.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_link_ignored(&self) {
        self.link_ignored.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_usage_error(&self) {
        self.usage_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> TokenStats {
        TokenStats {
            created: self.created.load(Ordering::Relaxed),
            expired: self.expired.load(Ordering::Relaxed),
            timed_out: self.timed_out.load(Ordering::Relaxed),
            link_succeeded: self.link_succeeded.load(Ordering::Relaxed),
            link_ignored: self.link_ignored.load(Ordering::Relaxed),
            usage_errors: self.usage_errors.load(Ordering::Relaxed),
        }
    }
}
