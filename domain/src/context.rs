//! Per-call cancellation and deadline carrier.
//!
//! Every store and cache call receives a `Context`. Long calls are raced
//! against it through [`Context::run`], so a cancelled or timed-out request
//! returns promptly instead of finishing the operation silently.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::CoreError;

#[derive(Clone, Debug)]
pub struct Context {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl Context {
    /// A context that is never cancelled and has no deadline.
    pub fn background() -> Self {
        Self {
            token: CancellationToken::new(),
            deadline: None,
        }
    }

    /// A fresh context that expires `timeout` from now.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self::background().timeout(timeout)
    }

    /// Derive a context that also expires after `timeout`. The earlier of the
    /// two deadlines wins; cancelling the parent cancels the child. A timeout
    /// too large to represent adds no deadline of its own.
    pub fn timeout(&self, timeout: Duration) -> Self {
        let deadline = match (self.deadline, Instant::now().checked_add(timeout)) {
            (Some(existing), Some(candidate)) => Some(existing.min(candidate)),
            (existing, None) => existing,
            (None, candidate) => candidate,
        };
        Self {
            token: self.token.child_token(),
            deadline,
        }
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Fail fast if the context is already done.
    pub fn check(&self) -> Result<(), CoreError> {
        if self.token.is_cancelled() {
            return Err(CoreError::Cancelled);
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Err(CoreError::DeadlineExceeded),
            _ => Ok(()),
        }
    }

    /// Drive `fut` to completion unless the context is cancelled or its
    /// deadline passes first. The future is dropped in that case.
    pub async fn run<F, T>(&self, fut: F) -> Result<T, CoreError>
    where
        F: Future<Output = Result<T, CoreError>>,
    {
        self.check()?;
        let expired = async {
            match self.deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::select! {
            biased;
            _ = self.token.cancelled() => Err(CoreError::Cancelled),
            _ = expired => Err(CoreError::DeadlineExceeded),
            res = fut => res,
        }
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::background()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn run_returns_the_future_result() {
        let ctx = Context::background();
        let v = ctx.run(async { Ok::<_, CoreError>(7) }).await.unwrap();
        assert_eq!(v, 7);
    }

    #[tokio::test]
    async fn cancelled_context_fails_before_polling() {
        let ctx = Context::background();
        ctx.cancel();
        let err = ctx
            .run(async { Ok::<_, CoreError>(()) })
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Cancelled));
    }

    #[tokio::test]
    async fn cancel_interrupts_a_pending_call() {
        let ctx = Context::background();
        let canceller = ctx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            canceller.cancel();
        });
        let err = ctx
            .run(std::future::pending::<Result<(), CoreError>>())
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Cancelled));
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_interrupts_a_slow_call() {
        let ctx = Context::with_timeout(Duration::from_millis(50));
        let err = ctx
            .run(async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok::<_, CoreError>(())
            })
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::DeadlineExceeded));
    }

    #[tokio::test(start_paused = true)]
    async fn child_keeps_the_earlier_deadline() {
        let parent = Context::with_timeout(Duration::from_secs(1));
        let child = parent.timeout(Duration::from_secs(30));
        assert_eq!(child.deadline(), parent.deadline());

        parent.cancel();
        assert!(child.is_cancelled());
    }

    #[tokio::test]
    async fn unrepresentable_timeout_sets_no_deadline() {
        let ctx = Context::with_timeout(Duration::from_secs(u64::MAX));
        assert_eq!(ctx.deadline(), None);
        let v = ctx.run(async { Ok::<_, CoreError>(1) }).await.unwrap();
        assert_eq!(v, 1);

        let parent = Context::with_timeout(Duration::from_secs(5));
        let child = parent.timeout(Duration::from_secs(u64::MAX));
        assert_eq!(child.deadline(), parent.deadline());
    }
}
