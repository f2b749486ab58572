//! Claim propagation for one hand-off that splits into many branches.
//!
//! ```text
//!            FanOut::new()            count = 1 (registration share)
//!           /      |      \
//!    branch()  branch()  branch()     count = 4, each before hand-off
//!        │        │        │
//!        │      seal()     │          count = 3
//!        ▼        ▼        ▼
//!    Branch dropped on each worker    count -> 0, token expired once
//! ```
//!
//! A [`Branch`] completes its share when it is dropped, whether its work
//! returned, failed, panicked or was never run at all.

use rayon::prelude::*;
use rayon::ThreadPool;
use std::sync::Arc;
use tracing::{debug, warn};
use txlink_core::{issue_token, ClaimError, RefCountedClaim, Token};

/// Shares one token among a dynamic set of branches.
#[derive(Debug)]
pub struct FanOut {
    claim: Arc<RefCountedClaim>,
    sealed: bool,
}

impl FanOut {
    /// Fan out from the calling thread's transaction, if any.
    pub fn new() -> Self {
        Self::from_token(issue_token())
    }

    pub fn from_token(token: Option<Token>) -> Self {
        Self {
            claim: Arc::new(RefCountedClaim::new(token)),
            sealed: false,
        }
    }

    pub fn claim(&self) -> &RefCountedClaim {
        &self.claim
    }

    /// Register one more branch. Hand the result to the branch's worker.
    pub fn branch(&self) -> Branch {
        let counted = match self.claim.increment() {
            Ok(()) => true,
            Err(err) => {
                warn!(error = %err, "Branch registered after fan-out released");
                false
            }
        };
        Branch {
            claim: Arc::clone(&self.claim),
            counted,
        }
    }

    /// Stop registering branches and give up the registration share.
    ///
    /// Returns true if this released the claim (every branch had already
    /// completed).
    pub fn seal(mut self) -> Result<bool, ClaimError> {
        self.sealed = true;
        self.claim.complete_branch()
    }

    /// Run `tasks` concurrently on `pool`, each as one branch of a fan-out
    /// from the calling thread's transaction. Results keep the order of
    /// `tasks`.
    pub fn run_all<T, R>(pool: &ThreadPool, tasks: Vec<T>) -> Vec<R>
    where
        T: FnOnce() -> R + Send,
        R: Send,
    {
        let fan_out = FanOut::new();
        let branches: Vec<(Branch, T)> = tasks
            .into_iter()
            .map(|task| (fan_out.branch(), task))
            .collect();
        if let Err(err) = fan_out.seal() {
            debug!(error = %err, "Fan-out seal failed");
        }

        pool.install(|| {
            branches
                .into_par_iter()
                .map(|(branch, task)| branch.run(task))
                .collect()
        })
    }
}

impl Default for FanOut {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for FanOut {
    fn drop(&mut self) {
        if !self.sealed {
            let _ = self.claim.complete_branch();
        }
    }
}

/// One branch's share of a [`FanOut`].
#[derive(Debug)]
#[must_use = "dropping a branch completes it immediately"]
pub struct Branch {
    claim: Arc<RefCountedClaim>,
    counted: bool,
}

impl Branch {
    /// Run `work` with the fan-out's transaction active on this thread,
    /// then complete the branch.
    pub fn run<R>(self, work: impl FnOnce() -> R) -> R {
        let guard = match self.claim.link() {
            Ok(guard) => guard,
            Err(err) => {
                debug!(error = %err, "Running branch without claim");
                None
            }
        };
        let result = work();
        drop(guard);
        result
    }
}

impl Drop for Branch {
    fn drop(&mut self) {
        if self.counted {
            if let Err(err) = self.claim.complete_branch() {
                debug!(error = %err, "Branch completion reported an error");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rayon::ThreadPoolBuilder;
    use std::time::{Duration, Instant};
    use tracing_test::traced_test;
    use txlink_core::{current_transaction, ClaimConfig};
    use txlink_test_helpers::{begin_default, begin_recorded};

    fn pool(threads: usize) -> ThreadPool {
        ThreadPoolBuilder::new().num_threads(threads).build().unwrap()
    }

    #[test]
    fn test_run_all_keeps_transaction_alive() {
        let pool = pool(4);
        let (tx, root, listener) = begin_default();
        let tx_id = tx.id();

        let tasks: Vec<_> = (0..64)
            .map(|i| move || (i, current_transaction().map(|t| t.id())))
            .collect();
        let results = FanOut::run_all(&pool, tasks);

        assert_eq!(results.len(), 64);
        for (expected, (i, seen)) in results.into_iter().enumerate() {
            assert_eq!(i, expected);
            assert_eq!(seen, Some(tx_id));
        }
        assert!(!tx.is_finished(), "root fragment still open");

        drop(root);
        assert!(tx.is_finished());
        let stats = listener.finished()[0].stats;
        assert_eq!(stats.created, 1);
        assert_eq!(stats.expired, 1);
        assert_eq!(stats.link_succeeded, 64);
    }

    #[test]
    fn test_release_after_last_branch() {
        let (tx, root, listener) = begin_default();
        let fan_out = FanOut::new();
        let first = fan_out.branch();
        let second = fan_out.branch();
        assert_eq!(fan_out.seal(), Ok(false));
        drop(root);

        let worker = std::thread::spawn(move || second.run(|| ()));
        worker.join().unwrap();
        assert!(!tx.is_finished());

        drop(first);
        assert!(listener.wait_for(1, Duration::from_secs(5)));
    }

    #[test]
    fn test_panicking_branch_completes() {
        let (tx, root, _listener) = begin_default();
        let fan_out = FanOut::new();
        let branch = fan_out.branch();
        drop(fan_out);
        drop(root);

        let worker = std::thread::spawn(move || branch.run(|| panic!("branch failed")));
        assert!(worker.join().is_err());
        assert!(tx.is_finished());
    }

    #[traced_test]
    #[test]
    fn test_branch_after_timeout_completes_cleanly() {
        let config = ClaimConfig::with_token_timeout(Duration::from_millis(1));
        let (tx, root, listener) = begin_recorded(config);
        let fan_out = FanOut::new();
        let claim = Arc::clone(&fan_out.claim);
        let branch = fan_out.branch();
        assert_eq!(fan_out.seal(), Ok(false));
        drop(root);

        tx.expire_timed_out_tokens(Instant::now() + Duration::from_secs(1));
        assert!(tx.is_finished());

        assert!(!branch.run(|| current_transaction().is_some()));
        assert!(claim.is_released());
        assert!(!logs_contain("Branch completion reported an error"));
        assert_eq!(tx.stats().usage_errors, 0);
        assert_eq!(listener.finished()[0].stats.timed_out, 1);
        assert_eq!(listener.late_usage_errors(), 0);
    }

    #[test]
    fn test_unsealed_drop_releases() {
        let (tx, root, listener) = begin_default();
        let fan_out = FanOut::new();
        drop(root);
        assert!(!tx.is_finished());

        drop(fan_out);
        assert!(tx.is_finished());
        assert_eq!(listener.finished()[0].stats.usage_errors, 0);
    }

    #[traced_test]
    #[test]
    fn test_branch_after_release_is_uncounted() {
        let (tx, _root, _listener) = begin_default();
        let fan_out = FanOut::new();
        let claim = Arc::clone(&fan_out.claim);
        assert_eq!(fan_out.seal(), Ok(true));

        let late = FanOut {
            claim,
            sealed: true,
        }
        .branch();
        assert!(logs_contain("registered after fan-out released"));
        drop(late);
        assert_eq!(tx.stats().usage_errors, 1);
    }

    #[test]
    fn test_run_all_without_transaction() {
        let pool = pool(2);
        let tasks: Vec<_> = (0..8).map(|i| move || i * 2).collect();
        assert_eq!(FanOut::run_all(&pool, tasks), vec![0, 2, 4, 6, 8, 10, 12, 14]);
    }
}
