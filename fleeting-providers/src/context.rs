use futures_util::future::{self, BoxFuture};
use std::future::Future;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

use crate::ProviderError;

/// Deadline and cancellation signal threaded through every provider call.
///
/// Cloning is cheap; clones observe the same signals. A context never
/// outlives its deadline, so long-running teardown after a cancellation must
/// use [`CallContext::detached`].
#[derive(Clone, Debug, Default)]
pub struct CallContext {
    deadline: Option<Instant>,
    cancel: Vec<watch::Receiver<bool>>,
}

/// Cancels every context derived from the one returned alongside it.
#[derive(Debug)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }
}

impl CallContext {
    pub fn background() -> Self {
        Self::default()
    }

    /// Tightens the deadline; an earlier existing deadline wins.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        let candidate = Instant::now() + timeout;
        self.deadline = Some(match self.deadline {
            Some(existing) if existing < candidate => existing,
            _ => candidate,
        });
        self
    }

    pub fn with_cancel(mut self) -> (Self, CancelHandle) {
        let (tx, rx) = watch::channel(false);
        self.cancel.push(rx);
        (self, CancelHandle { tx })
    }

    /// Fresh context unaffected by this one's cancellation, bounded by `grace`.
    pub fn detached(&self, grace: Duration) -> Self {
        Self::background().with_timeout(grace)
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.iter().any(|rx| *rx.borrow())
    }

    pub fn is_done(&self) -> bool {
        self.is_cancelled() || self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    async fn cancelled(&self) {
        if self.cancel.is_empty() {
            return future::pending().await;
        }
        let waits: Vec<BoxFuture<'static, ()>> = self
            .cancel
            .iter()
            .cloned()
            .map(|mut rx| -> BoxFuture<'static, ()> {
                Box::pin(async move {
                    // A dropped handle can no longer cancel.
                    if rx.wait_for(|cancelled| *cancelled).await.is_err() {
                        future::pending::<()>().await;
                    }
                })
            })
            .collect();
        future::select_all(waits).await;
    }

    async fn expired(&self) {
        match self.deadline {
            Some(deadline) => tokio::time::sleep_until(deadline).await,
            None => future::pending().await,
        }
    }

    /// Races `fut` against cancellation and the deadline.
    pub async fn run<T, F>(&self, fut: F) -> Result<T, ProviderError>
    where
        F: Future<Output = Result<T, ProviderError>>,
    {
        if self.is_cancelled() {
            return Err(ProviderError::Cancelled);
        }
        if self.deadline.is_some_and(|d| Instant::now() >= d) {
            return Err(ProviderError::DeadlineExceeded);
        }
        tokio::select! {
            biased;
            _ = self.cancelled() => Err(ProviderError::Cancelled),
            _ = self.expired() => Err(ProviderError::DeadlineExceeded),
            res = fut => res,
        }
    }

    /// Sleeps for `duration` unless the context ends first.
    pub async fn sleep(&self, duration: Duration) -> Result<(), ProviderError> {
        self.run(async {
            tokio::time::sleep(duration).await;
            Ok::<(), ProviderError>(())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_err, assert_ok};

    #[tokio::test]
    async fn background_context_runs_to_completion() {
        let ctx = CallContext::background();
        let v = ctx.run(async { Ok::<_, ProviderError>(7) }).await;
        assert_eq!(assert_ok!(v), 7);
        assert!(!ctx.is_done());
    }

    #[tokio::test]
    async fn cancelled_context_rejects_calls() {
        let (ctx, handle) = CallContext::background().with_cancel();
        let child = ctx.clone();
        handle.cancel();
        assert!(child.is_cancelled());
        let res = child.run(async { Ok::<_, ProviderError>(()) }).await;
        assert!(matches!(assert_err!(res), ProviderError::Cancelled));
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_interrupts_pending_call() {
        let (ctx, handle) = CallContext::background().with_cancel();
        let waiter = tokio::spawn(async move { ctx.sleep(Duration::from_secs(3600)).await });
        tokio::time::sleep(Duration::from_secs(1)).await;
        handle.cancel();
        let res = waiter.await.unwrap();
        assert!(matches!(res, Err(ProviderError::Cancelled)));
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_expires_long_call() {
        let ctx = CallContext::background().with_timeout(Duration::from_secs(5));
        let res = ctx.sleep(Duration::from_secs(60)).await;
        assert!(matches!(res, Err(ProviderError::DeadlineExceeded)));
        assert!(ctx.is_done());
    }

    #[tokio::test(start_paused = true)]
    async fn detached_context_ignores_parent_cancellation() {
        let (ctx, handle) = CallContext::background().with_cancel();
        handle.cancel();
        let cleanup = ctx.detached(Duration::from_secs(30));
        assert!(!cleanup.is_done());
        assert_ok!(cleanup.sleep(Duration::from_secs(1)).await);
    }

    #[test]
    fn earlier_deadline_wins() {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .unwrap();
        rt.block_on(async {
            let ctx = CallContext::background()
                .with_timeout(Duration::from_secs(5))
                .with_timeout(Duration::from_secs(60));
            let remaining = ctx.deadline().unwrap() - Instant::now();
            assert!(remaining <= Duration::from_secs(5));
        });
    }
}
