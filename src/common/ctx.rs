//! Cancellation context and structured task scopes.

use std::future::Future;
use std::time::Duration;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::error::{Error, Result};

/// Cancellation context passed to every blocking operation.
pub type Ctx = CancellationToken;

/// Sleeps for `d`, or returns `Error::Canceled` if `ctx` is canceled first.
pub async fn sleep(ctx: &Ctx, d: Duration) -> Result<()> {
    tokio::select! {
        _ = ctx.cancelled() => Err(Error::Canceled),
        _ = tokio::time::sleep(d) => Ok(()),
    }
}

/// Runs `fut` until it completes or `ctx` is canceled.
pub async fn run<T>(ctx: &Ctx, fut: impl Future<Output = Result<T>>) -> Result<T> {
    tokio::select! {
        biased;
        _ = ctx.cancelled() => Err(Error::Canceled),
        res = fut => res,
    }
}

/// A group of tasks sharing one lifetime.
///
/// Every task gets a child of the parent context. The first task to fail
/// cancels the whole group; `join` waits for every task and returns the
/// first error that is not a cancellation.
pub struct Scope {
    ctx: Ctx,
    tasks: JoinSet<Result<()>>,
}

impl Scope {
    pub fn new(parent: &Ctx) -> Self {
        Scope {
            ctx: parent.child_token(),
            tasks: JoinSet::new(),
        }
    }

    /// The context shared by tasks in this scope.
    pub fn ctx(&self) -> Ctx {
        self.ctx.clone()
    }

    pub fn spawn<F>(&mut self, name: &'static str, task: F)
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        self.tasks.spawn(async move {
            let res = task.await;
            match &res {
                Ok(()) => debug!(task = name, "task finished"),
                Err(e) if e.is_canceled() => debug!(task = name, "task canceled"),
                Err(e) => warn!(task = name, error = %e, "task failed"),
            }
            res
        });
    }

    pub fn cancel(&self) {
        self.ctx.cancel();
    }

    pub async fn join(mut self) -> Result<()> {
        let mut first_err = None;
        while let Some(res) = self.tasks.join_next().await {
            let res = match res {
                Ok(res) => res,
                Err(join_err) if join_err.is_panic() => std::panic::resume_unwind(join_err.into_panic()),
                Err(_) => Err(Error::Canceled),
            };
            if let Err(e) = res {
                self.ctx.cancel();
                if !e.is_canceled() && first_err.is_none() {
                    first_err = Some(e);
                }
            }
        }
        match first_err {
            Some(e) => Err(e),
            None if self.ctx.is_cancelled() => Err(Error::Canceled),
            None => Ok(()),
        }
    }
}
