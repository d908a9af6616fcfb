//! Shared state that waiters can block on.

use tokio::sync::watch;

use super::ctx::Ctx;
use super::error::{Error, Result};

/// State behind a lock that wakes every waiter on each mutation.
///
/// Built on a `watch` channel: mutators run under the channel's write lock
/// and bump its version, waiters subscribe and re-check their predicate each
/// time the version moves. Closures passed in here run under the lock and
/// must not call back into the same `Guarded`.
pub struct Guarded<T> {
    tx: watch::Sender<T>,
}

impl<T> Guarded<T> {
    pub fn new(value: T) -> Self {
        let (tx, _) = watch::channel(value);
        Guarded { tx }
    }

    /// Reads the state without waking anyone.
    pub fn read<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        f(&self.tx.borrow())
    }

    /// Mutates the state and wakes all waiters.
    pub fn update<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        let mut out = None;
        self.tx.send_modify(|v| out = Some(f(v)));
        out.unwrap_or_else(|| unreachable!("send_modify runs its closure exactly once"))
    }

    /// Blocks until `f` returns `Some`, then returns that value.
    ///
    /// `f` runs under the write lock so it may mutate the state, but only on
    /// the call that returns `Some`: a canceled wait leaves the state exactly
    /// as it found it.
    pub async fn wait<R>(&self, ctx: &Ctx, mut f: impl FnMut(&mut T) -> Option<R>) -> Result<R> {
        let mut rx = self.tx.subscribe();
        loop {
            let mut out = None;
            self.tx.send_if_modified(|v| {
                out = f(v);
                out.is_some()
            });
            if let Some(r) = out {
                return Ok(r);
            }
            Self::changed(ctx, &mut rx).await?;
        }
    }

    /// Like `wait`, but the predicate only reads, so no waiters are woken.
    pub async fn wait_for<R>(&self, ctx: &Ctx, mut f: impl FnMut(&T) -> Option<R>) -> Result<R> {
        let mut rx = self.tx.subscribe();
        loop {
            let out = f(&rx.borrow_and_update());
            if let Some(r) = out {
                return Ok(r);
            }
            Self::changed(ctx, &mut rx).await?;
        }
    }

    async fn changed(ctx: &Ctx, rx: &mut watch::Receiver<T>) -> Result<()> {
        tokio::select! {
            _ = ctx.cancelled() => Err(Error::Canceled),
            // The sender lives as long as `self`, so this never errors.
            res = rx.changed() => res.map_err(|_| Error::Canceled),
        }
    }
}
