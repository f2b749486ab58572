//! Per-transaction claim limits.

use std::time::Duration;

/// Default cap on tokens minted by a single transaction.
pub const DEFAULT_TOKEN_LIMIT: usize = 3000;

/// Default idle time after which an unlinked token is released by the
/// timeout sweep.
pub const DEFAULT_TOKEN_TIMEOUT: Duration = Duration::from_secs(180);

/// Configuration applied to every token a transaction mints.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimConfig {
    /// Maximum tokens a transaction may mint over its lifetime.
    ///
    /// Once reached, further mints return no token and async work is no
    /// longer attributed to the transaction.
    pub token_limit: usize,

    /// How long a token may sit without being minted or linked before the
    /// timeout sweep releases it.
    ///
    /// The sweep only runs while no fragment of the transaction is executing.
    pub token_timeout: Duration,
}

impl Default for ClaimConfig {
    fn default() -> Self {
        Self {
            token_limit: DEFAULT_TOKEN_LIMIT,
            token_timeout: DEFAULT_TOKEN_TIMEOUT,
        }
    }
}

impl ClaimConfig {
    /// Create a config with a custom token limit.
    pub fn with_token_limit(token_limit: usize) -> Self {
        Self {
            token_limit,
            ..Default::default()
        }
    }

    /// Create a config with a custom token timeout.
    pub fn with_token_timeout(token_timeout: Duration) -> Self {
        Self {
            token_timeout,
            ..Default::default()
        }
    }
}
