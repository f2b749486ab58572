//! Claim propagation for futures.
//!
//! An async task may be polled on any worker thread, and each poll is a
//! separate fragment. [`TokenFuture`] carries one token for the whole life
//! of the future, links it around every poll and expires it on completion.
//! A future dropped before completion (aborted, timed out, raced and lost)
//! drops its token, which releases the claim.

use pin_project::pin_project;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use tracing::debug;
use txlink_core::{issue_token, Token};
use txlink_types::TokenId;

/// A future that runs every poll under its transaction's claim.
#[pin_project]
#[derive(Debug)]
pub struct TokenFuture<F> {
    #[pin]
    inner: F,
    token: Option<Token>,
}

impl<F> TokenFuture<F> {
    /// Wrap `inner`, carrying `token` (if any) until it completes.
    pub fn new(inner: F, token: Option<Token>) -> Self {
        Self { inner, token }
    }

    /// The carried token, until the future completes or the token is found
    /// to have been released elsewhere.
    pub fn token_id(&self) -> Option<TokenId> {
        self.token.as_ref().map(Token::id)
    }

    pub fn into_inner(self) -> F {
        self.inner
    }
}

impl<F: Future> Future for TokenFuture<F> {
    type Output = F::Output;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();

        let guard = match this.token.as_ref().map(Token::link) {
            Some(Ok(guard)) => Some(guard),
            Some(Err(err)) => {
                // Timed out or force-expired. Keep running without a claim.
                debug!(error = %err, "Polling without claim");
                *this.token = None;
                None
            }
            None => None,
        };

        let poll = this.inner.poll(cx);

        if poll.is_ready() {
            if let Some(token) = this.token.take() {
                let _ = token.expire();
            }
        }
        drop(guard);
        poll
    }
}

/// Extension for attaching the current thread's transaction to a future.
pub trait PropagateExt: Future + Sized {
    /// Mint a token now, on the creating thread, and carry it through every
    /// poll of this future.
    ///
    /// With no transaction active the future is wrapped without a claim and
    /// behaves exactly like the unwrapped future.
    fn propagate(self) -> TokenFuture<Self> {
        TokenFuture::new(self, issue_token())
    }
}

impl<F: Future> PropagateExt for F {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::sync::oneshot;
    use txlink_core::{current_transaction, ActiveClaimRegistry, ClaimConfig};
    use txlink_test_helpers::{begin_default, begin_recorded};

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_spawned_future_runs_under_claim() {
        let (tx, root, listener) = begin_default();
        let tx_id = tx.id();

        let (release, released) = oneshot::channel::<()>();
        let handle = tokio::spawn(
            async move {
                let before = current_transaction().map(|t| t.id());
                released.await.unwrap();
                // Possibly resumed on a different worker.
                let after = current_transaction().map(|t| t.id());
                (before, after)
            }
            .propagate(),
        );
        drop(root);
        assert!(!tx.is_finished());

        release.send(()).unwrap();
        let (before, after) = handle.await.unwrap();
        assert_eq!(before, Some(tx_id));
        assert_eq!(after, Some(tx_id));

        assert!(listener.wait_for(1, Duration::from_secs(5)));
        let stats = listener.finished()[0].stats;
        assert_eq!(stats.created, 1);
        assert_eq!(stats.expired, 1);
        assert!(stats.link_succeeded >= 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_aborted_future_releases_claim() {
        let (tx, root, listener) = begin_default();
        let handle = tokio::spawn(std::future::pending::<()>().propagate());
        drop(root);

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!tx.is_finished());

        handle.abort();
        assert!(handle.await.unwrap_err().is_cancelled());

        assert!(listener.wait_for(1, Duration::from_secs(5)));
        assert_eq!(listener.finished()[0].stats.expired, 1);
        assert_eq!(listener.finished()[0].stats.usage_errors, 0);
    }

    #[tokio::test]
    async fn test_propagate_without_transaction() {
        let future = async { current_transaction().is_none() }.propagate();
        assert!(future.token_id().is_none());
        assert!(future.await);
    }

    #[tokio::test]
    async fn test_poll_restores_thread_claim() {
        let (tx, _root, _listener) = begin_default();
        let (future, other_id) = {
            let (other, other_root, _other_listener) = begin_default();
            let future = async { current_transaction().map(|t| t.id()) }.propagate();
            drop(other_root);
            (future, other.id())
        };

        assert_eq!(future.await, Some(other_id));
        assert_eq!(
            ActiveClaimRegistry::current().map(|c| c.transaction_id()),
            Some(tx.id())
        );
    }

    #[tokio::test]
    async fn test_timed_out_token_polls_without_claim() {
        let config = ClaimConfig::with_token_timeout(Duration::from_millis(1));
        let (tx, root, listener) = begin_recorded(config);
        let future = async { current_transaction().is_some() }.propagate();
        drop(root);

        tx.expire_timed_out_tokens(std::time::Instant::now() + Duration::from_secs(1));
        assert!(tx.is_finished());

        assert!(!future.await);
        let stats = listener.finished()[0].stats;
        assert_eq!(stats.timed_out, 1);
        assert_eq!(stats.usage_errors, 0);
    }
}
