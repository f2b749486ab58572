//! Shared types for cross-thread transaction propagation.
//!
//! Nothing in this crate carries behavior beyond simple value semantics:
//! the lifecycle rules live in `txlink-core`. Keeping the identifiers and
//! counters here lets the adapter and service crates name them without
//! depending on each other.

mod identifiers;
mod lifecycle;
mod stats;

pub use identifiers::{TokenId, TransactionId};
pub use lifecycle::{TimeoutCause, TokenState, TransactionPhase};
pub use stats::{metric_names, TokenStats};
