//! Lifecycle states for transactions and tokens.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle of a transaction. Only ever advances.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum TransactionPhase {
    /// Work is running or claims are outstanding. Tokens may be minted.
    Active,
    /// The last claim was released and listeners are being notified.
    /// No further tokens or fragments are accepted.
    Finishing,
    /// Terminal.
    Finished,
}

impl TransactionPhase {
    /// Whether new tokens and fragments may still attach to the transaction.
    pub fn accepts_claims(self) -> bool {
        self == TransactionPhase::Active
    }

    /// Whether finalization has started or completed.
    pub fn is_finished(self) -> bool {
        self != TransactionPhase::Active
    }
}

impl fmt::Display for TransactionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransactionPhase::Active => write!(f, "active"),
            TransactionPhase::Finishing => write!(f, "finishing"),
            TransactionPhase::Finished => write!(f, "finished"),
        }
    }
}

/// Lifecycle of a single token.
///
/// `Active -> Linked` may repeat any number of times (linking is
/// idempotent); `Expired` is terminal and reached exactly once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum TokenState {
    Active = 0,
    Linked = 1,
    Expired = 2,
}

impl TokenState {
    /// Raw encoding, for storage in an atomic.
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    /// Decode from the raw encoding. Unknown values decode as `Expired`
    /// so a corrupted state can never be linked.
    pub const fn from_u8(raw: u8) -> Self {
        match raw {
            0 => TokenState::Active,
            1 => TokenState::Linked,
            _ => TokenState::Expired,
        }
    }

    pub fn is_expired(self) -> bool {
        self == TokenState::Expired
    }
}

/// Why a transaction was finished by something other than its own work
/// completing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TimeoutCause {
    /// At least one token was released by the timeout sweep.
    Token,
}
