//! Adapters that carry transaction claims across concurrency boundaries.
//!
//! Each adapter follows the same three steps:
//!
//! 1. At hand-off, on the submitting thread, mint a token (or ref-counted
//!    claim) from the current transaction.
//! 2. At the start of each resumed fragment, link it and hold the guard for
//!    the fragment's duration.
//! 3. On every exit path, release it. Releasing happens in `Drop`, so
//!    panics and cancellation are covered.
//!
//! | Boundary                  | Adapter                              |
//! |---------------------------|--------------------------------------|
//! | `Future` on any executor  | [`PropagateExt::propagate`]          |
//! | closure on a thread pool  | [`wrap_task`], [`spawn_propagated`]  |
//! | one hand-off, N branches  | [`FanOut`], [`FanOut::run_all`]      |

mod fan_out;
mod future;
mod task;

pub use fan_out::{Branch, FanOut};
pub use future::{PropagateExt, TokenFuture};
pub use task::{spawn_propagated, wrap_task, PropagatedTask};
