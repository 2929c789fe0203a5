//! Cooperative coroutines over a current-thread tokio runtime.
//!
//! Every connection and background job in the server is a named coroutine:
//! a `spawn_local` task paired with a cancellation token. The scheduler is
//! the tokio current-thread executor driving one `LocalSet`, so between two
//! suspension points no other coroutine observes intermediate state and no
//! lock is ever taken.
//!
//! The only suspension points are socket I/O with a timeout, timed sleeps,
//! condition waits and explicit yields; all of them are cancellable through
//! the token, which is what `interrupt()` and `stop()` trip.

use log::{debug, warn};
use shared::error::{Error, Result};
use std::cell::{Cell, RefCell};
use std::future::Future;
use std::rc::Rc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

thread_local! {
    static NEXT_CID: Cell<u64> = const { Cell::new(1) };
}

/// Mints a fresh context id for log correlation.
///
/// Context ids are per-process and monotone; a coroutine carries its cid for
/// its whole life, and async hand-offs capture the originating cid so the
/// trace survives the jump.
pub fn generate_cid() -> u64 {
    NEXT_CID.with(|c| {
        let v = c.get();
        c.set(v + 1);
        v
    })
}

/// Execution context handed to a coroutine body.
///
/// `pull()` is the cooperation point: bodies test it once per loop and
/// return [Error::CoroutineInterrupted] when a stop was requested.
#[derive(Clone)]
pub struct CoroutineContext {
    cid: u64,
    name: Rc<str>,
    token: CancellationToken,
}

impl CoroutineContext {
    pub fn cid(&self) -> u64 {
        self.cid
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Errors once `interrupt()` or `stop()` was called on the coroutine.
    pub fn pull(&self) -> Result<()> {
        if self.token.is_cancelled() {
            return Err(Error::CoroutineInterrupted);
        }
        Ok(())
    }

    /// Interruptible sleep; an interrupt cuts the sleep short with an error.
    pub async fn sleep(&self, d: Duration) -> Result<()> {
        tokio::select! {
            biased;
            _ = self.token.cancelled() => Err(Error::CoroutineInterrupted),
            _ = tokio::time::sleep(d) => Ok(()),
        }
    }

    /// Runs `fut` under `timeout`, mapping elapse to [Error::SocketTimeout]
    /// and interrupt to [Error::CoroutineInterrupted].
    pub async fn timeout<F, T>(&self, timeout: Duration, fut: F) -> Result<T>
    where
        F: Future<Output = std::io::Result<T>>,
    {
        tokio::select! {
            biased;
            _ = self.token.cancelled() => Err(Error::CoroutineInterrupted),
            r = tokio::time::timeout(timeout, fut) => match r {
                Ok(Ok(v)) => Ok(v),
                Ok(Err(e)) => Err(e.into()),
                Err(_) => Err(Error::SocketTimeout),
            },
        }
    }

    /// Explicit yield for tight loops (the publish receive loop yields every
    /// 15 messages so one hot publisher cannot starve its consumers).
    pub async fn yield_now(&self) {
        tokio::task::yield_now().await;
    }
}

/// A named cooperative task with stop/interrupt semantics.
///
/// `stop()` must never be called from inside the coroutine's own body; a
/// body that wants to die returns instead, and the owner reaps it through
/// the resource manager.
pub struct Coroutine {
    cid: u64,
    name: Rc<str>,
    token: CancellationToken,
    handle: RefCell<Option<JoinHandle<()>>>,
}

impl Coroutine {
    pub fn new(name: &str) -> Self {
        Self {
            cid: generate_cid(),
            name: Rc::from(name),
            token: CancellationToken::new(),
            handle: RefCell::new(None),
        }
    }

    pub fn cid(&self) -> u64 {
        self.cid
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Launches the handler on the local set. The handler result is logged,
    /// not propagated: a coroutine owns its error handling up to the point
    /// of returning.
    pub fn start<F, Fut>(&self, f: F)
    where
        F: FnOnce(CoroutineContext) -> Fut + 'static,
        Fut: Future<Output = Result<()>> + 'static,
    {
        let ctx = CoroutineContext {
            cid: self.cid,
            name: Rc::clone(&self.name),
            token: self.token.clone(),
        };
        let name = Rc::clone(&self.name);
        let cid = self.cid;
        let handle = tokio::task::spawn_local(async move {
            match f(ctx).await {
                Ok(()) => debug!("[{cid}] coroutine {name} done"),
                Err(e) if e.is_interrupt() => debug!("[{cid}] coroutine {name} interrupted"),
                Err(e) => warn!("[{cid}] coroutine {name} failed: {e}"),
            }
        });
        *self.handle.borrow_mut() = Some(handle);
    }

    /// Wakes the coroutine out of any blocking wait; the next `pull()` or
    /// suspension errors with [Error::CoroutineInterrupted].
    pub fn interrupt(&self) {
        self.token.cancel();
    }

    pub fn is_interrupted(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Interrupt then join.
    pub async fn stop(&self) {
        self.interrupt();
        let handle = self.handle.borrow_mut().take();
        if let Some(h) = handle {
            let _ = h.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use tokio::task::LocalSet;

    #[tokio::test]
    async fn test_cid_monotone() {
        let a = generate_cid();
        let b = generate_cid();
        assert!(b > a);
    }

    #[tokio::test]
    async fn test_start_runs_handler() {
        let local = LocalSet::new();
        local
            .run_until(async {
                let ran = Rc::new(Cell::new(false));
                let co = Coroutine::new("t");
                let r = ran.clone();
                co.start(move |_ctx| async move {
                    r.set(true);
                    Ok(())
                });
                co.stop().await;
                assert!(ran.get());
            })
            .await;
    }

    #[tokio::test]
    async fn test_stop_interrupts_sleep() {
        let local = LocalSet::new();
        local
            .run_until(async {
                let co = Coroutine::new("sleeper");
                let hit = Rc::new(Cell::new(false));
                let h = hit.clone();
                co.start(move |ctx| async move {
                    let r = ctx.sleep(Duration::from_secs(3600)).await;
                    assert!(r.is_err());
                    h.set(true);
                    r
                });
                tokio::task::yield_now().await;
                co.stop().await;
                // after stop() returns the handler is no longer executing
                assert!(hit.get());
            })
            .await;
    }

    #[tokio::test]
    async fn test_pull_after_interrupt() {
        let local = LocalSet::new();
        local
            .run_until(async {
                let co = Coroutine::new("loop");
                let iterations = Rc::new(Cell::new(0u32));
                let n = iterations.clone();
                co.start(move |ctx| async move {
                    loop {
                        ctx.pull()?;
                        n.set(n.get() + 1);
                        ctx.sleep(Duration::from_millis(1)).await?;
                    }
                });
                tokio::time::sleep(Duration::from_millis(10)).await;
                co.stop().await;
                assert!(iterations.get() > 0);
            })
            .await;
    }

    #[tokio::test]
    async fn test_timeout_maps_to_socket_timeout() {
        let local = LocalSet::new();
        local
            .run_until(async {
                let co = Coroutine::new("t");
                co.start(|ctx| async move {
                    let r: Result<()> = ctx
                        .timeout(Duration::from_millis(5), std::future::pending())
                        .await;
                    assert!(matches!(r, Err(Error::SocketTimeout)));
                    Ok(())
                });
                co.stop().await;
            })
            .await;
    }
}
