//! Claim propagation for closures handed to a thread pool.

use rayon::ThreadPool;
use std::fmt;
use txlink_core::{issue_token, Token};

/// A closure carrying the submitting thread's transaction claim.
///
/// Running it links and expires the token in one step, then runs the
/// closure with the transaction active on the worker. Dropping it unrun
/// releases the claim.
pub struct PropagatedTask<F> {
    task: F,
    token: Option<Token>,
}

impl<F, R> PropagatedTask<F>
where
    F: FnOnce() -> R,
{
    pub fn has_claim(&self) -> bool {
        self.token.is_some()
    }

    pub fn run(self) -> R {
        let PropagatedTask { task, token } = self;
        let _guard = token.and_then(|token| token.link_and_expire().ok());
        task()
    }
}

impl<F> fmt::Debug for PropagatedTask<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PropagatedTask")
            .field("token", &self.token)
            .finish_non_exhaustive()
    }
}

/// Capture the calling thread's transaction for `task`.
///
/// Call on the submitting thread, at the moment of hand-off.
pub fn wrap_task<F, R>(task: F) -> PropagatedTask<F>
where
    F: FnOnce() -> R,
{
    PropagatedTask {
        task,
        token: issue_token(),
    }
}

/// Spawn `task` on `pool` under the calling thread's transaction.
pub fn spawn_propagated<F>(pool: &ThreadPool, task: F)
where
    F: FnOnce() + Send + 'static,
{
    let task = wrap_task(task);
    pool.spawn(move || task.run());
}
