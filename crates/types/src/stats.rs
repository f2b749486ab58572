//! Supportability counters for token usage.

use serde::{Deserialize, Serialize};

/// Metric names under which token counters are reported.
pub mod metric_names {
    pub const TOKEN_CREATE: &str = "Supportability/Async/Token/Create";
    pub const TOKEN_EXPIRE: &str = "Supportability/Async/Token/Expire";
    pub const TOKEN_TIMEOUT: &str = "Supportability/Async/Token/Timeout";
    pub const TOKEN_LINK_SUCCESS: &str = "Supportability/Async/Token/Link/Success";
    pub const TOKEN_LINK_IGNORE: &str = "Supportability/Async/Token/Link/Ignore";
    pub const TOKEN_USAGE_ERROR: &str = "Supportability/Async/Token/UsageError";
}

/// Point-in-time snapshot of a transaction's token counters.
///
/// Snapshots from many transactions are folded together with [`merge`]
/// before being harvested.
///
/// [`merge`]: TokenStats::merge
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenStats {
    /// Tokens minted.
    pub created: u64,
    /// Tokens released by `expire`, `link_and_expire`, drop, or a forced
    /// expire-all.
    pub expired: u64,
    /// Tokens released by the timeout sweep.
    pub timed_out: u64,
    /// Successful links.
    pub link_succeeded: u64,
    /// Links refused because the token was no longer active.
    pub link_ignored: u64,
    /// Double releases, count underflows and similar programming errors.
    pub usage_errors: u64,
}

impl TokenStats {
    /// Fold another snapshot into this one.
    pub fn merge(&mut self, other: &TokenStats) {
        self.created += other.created;
        self.expired += other.expired;
        self.timed_out += other.timed_out;
        self.link_succeeded += other.link_succeeded;
        self.link_ignored += other.link_ignored;
        self.usage_errors += other.usage_errors;
    }

    /// Tokens minted but not yet released, as far as these counters can
    /// tell. Saturates at zero.
    pub fn unreleased(&self) -> u64 {
        self.created
            .saturating_sub(self.expired)
            .saturating_sub(self.timed_out)
    }

    /// Counters paired with their metric names.
    pub fn as_metrics(&self) -> [(&'static str, u64); 6] {
        [
            (metric_names::TOKEN_CREATE, self.created),
            (metric_names::TOKEN_EXPIRE, self.expired),
            (metric_names::TOKEN_TIMEOUT, self.timed_out),
            (metric_names::TOKEN_LINK_SUCCESS, self.link_succeeded),
            (metric_names::TOKEN_LINK_IGNORE, self.link_ignored),
            (metric_names::TOKEN_USAGE_ERROR, self.usage_errors),
        ]
    }
}
