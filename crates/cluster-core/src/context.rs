//! Cancellation contexts that carry a cause.
//!
//! Every long-running wait in the crate (session confirmation, join
//! completion, multicast lookup) is bound to a [`Context`]. A context is
//! cancelled at most once, and the first cause wins. Contexts derived with
//! [`Context::with_cancel`] or [`Context::with_timeout`] are cancelled with
//! their parent's cause when the parent ends.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::watch;

/// Reason a context ended.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct Cancelled(Arc<str>);

impl Cancelled {
    pub fn new(cause: impl Into<String>) -> Self {
        Self(Arc::from(cause.into()))
    }

    pub fn message(&self) -> &str {
        &self.0
    }
}

/// A cancellable scope. Cheap to clone; clones observe the same state.
#[derive(Clone)]
pub struct Context {
    state: watch::Receiver<Option<Cancelled>>,
}

/// Cancels the context it was created with.
#[derive(Clone)]
pub struct CancelHandle {
    tx: Arc<watch::Sender<Option<Cancelled>>>,
}

impl CancelHandle {
    /// Cancel with the given cause. Returns false if already cancelled.
    pub fn cancel(&self, cause: Cancelled) -> bool {
        self.tx.send_if_modified(|state| {
            if state.is_none() {
                *state = Some(cause);
                true
            } else {
                false
            }
        })
    }

    /// Shorthand for `cancel(Cancelled::new(cause))`.
    pub fn cancel_with(&self, cause: impl Into<String>) -> bool {
        self.cancel(Cancelled::new(cause))
    }
}

impl Context {
    /// A context that is never cancelled.
    pub fn background() -> Self {
        let (_tx, state) = watch::channel(None);
        Self { state }
    }

    /// Derive a child context that can be cancelled independently.
    ///
    /// Must be called from within a tokio runtime when `self` can still be
    /// cancelled, since parent cancellation is forwarded by a small task.
    pub fn with_cancel(&self) -> (Context, CancelHandle) {
        let inherited = self.cause();
        let (tx, state) = watch::channel(inherited.clone());
        let handle = CancelHandle { tx: Arc::new(tx) };

        // The parent's sender is gone once it can no longer change.
        let parent_live = self.state.has_changed().is_ok();
        if inherited.is_none() && parent_live {
            let parent = self.clone();
            let forward = handle.clone();
            tokio::spawn(async move {
                tokio::select! {
                    cause = parent.cancelled_cause() => {
                        forward.cancel(cause);
                    }
                    _ = forward.tx.closed() => {}
                }
            });
        }

        (Context { state }, handle)
    }

    /// Derive a child context that is cancelled with `cause` after `timeout`.
    pub fn with_timeout(
        &self,
        timeout: Duration,
        cause: impl Into<String>,
    ) -> (Context, CancelHandle) {
        let (child, handle) = self.with_cancel();
        let cause = Cancelled::new(cause);
        let timer = handle.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(timeout) => {
                    timer.cancel(cause);
                }
                _ = timer.tx.closed() => {}
            }
        });

        (child, handle)
    }

    /// The cause, if the context has ended.
    pub fn cause(&self) -> Option<Cancelled> {
        self.state.borrow().clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.borrow().is_some()
    }

    /// Resolves with the cause once the context is cancelled.
    ///
    /// Never resolves for a context that cannot be cancelled.
    pub async fn cancelled(&self) {
        let _ = self.cancelled_cause().await;
    }

    /// Like [`Context::cancelled`] but yields the cause.
    pub async fn cancelled_cause(&self) -> Cancelled {
        let mut state = self.state.clone();
        let cause = match state.wait_for(Option::is_some).await {
            Ok(cause) => cause.clone(),
            Err(_) => None,
        };

        match cause {
            Some(cause) => cause,
            None => std::future::pending().await,
        }
    }

    /// Run `fut` until it completes or the context ends.
    pub async fn run<F: Future>(&self, fut: F) -> Result<F::Output, Cancelled> {
        if let Some(cause) = self.cause() {
            return Err(cause);
        }

        tokio::select! {
            output = fut => Ok(output),
            cause = self.cancelled_cause() => Err(cause),
        }
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("cause", &self.cause())
            .finish()
    }
}
