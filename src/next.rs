//! The continuation handed to every handler.
//!
//! A handler advances its chain by calling one method on its [`Next`]:
//!
//! | call | effect |
//! |---|---|
//! | `next.proceed()` | run the next handler |
//! | `next.stop()` | end the chain quietly; the handler already responded |
//! | `next.fail(err)` | send `err` to the client and end the chain |
//! | `next.jump("name")` | continue with another route's chain |
//!
//! Only the first call counts. `Next` can be cloned and moved into spawned
//! tasks, but all clones share one slot: once it is consumed, every later
//! call is logged and ignored, so the following handler never runs twice.
//!
//! A clone dropped while its thread is panicking fails the chain with an
//! internal error, so a panic inside a task that owns the continuation still
//! reaches the client.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::oneshot;
use tracing::warn;

use crate::error::HttpError;

/// What a continuation was invoked with.
#[derive(Debug)]
pub(crate) enum Signal {
    Continue,
    Stop,
    Fail(HttpError),
    Jump(String),
}

#[derive(Clone)]
pub struct Next {
    slot: Arc<Slot>,
}

struct Slot {
    handler: Arc<str>,
    tx: Mutex<Option<oneshot::Sender<Signal>>>,
    /// Set when the slot was consumed by a clone dropped during a panic.
    faulted: AtomicBool,
}

impl Next {
    /// A fresh continuation for `handler` and the receiving end the
    /// executor waits on.
    pub(crate) fn channel(handler: Arc<str>) -> (Self, oneshot::Receiver<Signal>) {
        let (tx, rx) = oneshot::channel();
        let slot = Slot { handler, tx: Mutex::new(Some(tx)), faulted: AtomicBool::new(false) };
        (Self { slot: Arc::new(slot) }, rx)
    }

    /// Runs the next handler.
    pub fn proceed(&self) {
        self.deliver(Signal::Continue);
    }

    /// Ends the chain without an error.
    pub fn stop(&self) {
        self.deliver(Signal::Stop);
    }

    /// Delivers `err` to the client and ends the chain.
    pub fn fail(&self, err: impl Into<HttpError>) {
        self.deliver(Signal::Fail(err.into()));
    }

    /// Abandons the rest of this chain and continues with the chain of the
    /// route mounted under `route`.
    pub fn jump(&self, route: &str) {
        self.deliver(Signal::Jump(route.to_owned()));
    }

    /// Fails the chain if `result` is an error, otherwise hands back the value
    /// without consuming the continuation.
    ///
    /// ```rust,ignore
    /// let Some(user) = next.if_error(load(&req).await) else { return };
    /// ```
    pub fn if_error<T, E: Into<HttpError>>(&self, result: Result<T, E>) -> Option<T> {
        match result {
            Ok(value) => Some(value),
            Err(err) => {
                self.fail(err);
                None
            }
        }
    }

    /// Whether one of the calls above has already happened.
    pub fn is_consumed(&self) -> bool {
        self.slot.tx.lock().unwrap_or_else(PoisonError::into_inner).is_none()
    }

    /// Whether the slot was consumed by unwinding rather than by a call.
    pub(crate) fn is_faulted(&self) -> bool {
        self.slot.faulted.load(Ordering::Acquire)
    }

    /// Hands `signal` to the executor. `false` if the slot was already used.
    pub(crate) fn deliver(&self, signal: Signal) -> bool {
        match self.try_deliver(signal) {
            Ok(()) => true,
            Err(signal) => {
                warn!(handler = %self.slot.handler, ?signal, "continuation invoked more than once; ignoring");
                false
            }
        }
    }

    /// Like [`deliver`](Self::deliver), silent; hands the signal back when
    /// the slot was already used.
    pub(crate) fn try_deliver(&self, signal: Signal) -> Result<(), Signal> {
        let tx = self.slot.tx.lock().unwrap_or_else(PoisonError::into_inner).take();
        match tx {
            // The receiver is gone only if the run itself was dropped.
            Some(tx) => {
                let _ = tx.send(signal);
                Ok(())
            }
            None => Err(signal),
        }
    }
}

impl Drop for Next {
    fn drop(&mut self) {
        if !std::thread::panicking() {
            return;
        }
        if self.try_deliver(Signal::Fail(HttpError::fault())).is_ok() {
            self.slot.faulted.store(true, Ordering::Release);
            warn!(handler = %self.slot.handler, "continuation dropped during a panic; failing the chain");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn first_call_wins() {
        let (next, rx) = Next::channel(Arc::from("h"));
        let clone = next.clone();

        assert!(!next.is_consumed());
        next.stop();
        clone.proceed();
        assert!(next.is_consumed());
        assert!(!clone.deliver(Signal::Continue));

        assert!(matches!(rx.await, Ok(Signal::Stop)));
    }

    #[tokio::test]
    async fn if_error_passes_values_through() {
        let (next, rx) = Next::channel(Arc::from("h"));
        assert_eq!(next.if_error(Ok::<_, HttpError>(3)), Some(3));
        assert!(!next.is_consumed());

        assert_eq!(next.if_error(Err::<u8, _>(HttpError::internal("boom"))), None);
        match rx.await {
            Ok(Signal::Fail(err)) => assert_eq!(err.message(), "boom"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn dropped_while_panicking_fails() {
        let (next, rx) = Next::channel(Arc::from("h"));
        let observer = next.clone();

        let unwound = std::thread::spawn(move || {
            let _held = next;
            panic!("worker died");
        })
        .join();

        assert!(unwound.is_err());
        assert!(observer.is_faulted());
        match rx.await {
            Ok(Signal::Fail(err)) => assert_eq!(err.message(), "internal error"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn dropping_every_clone_closes_the_channel() {
        let (next, rx) = Next::channel(Arc::from("h"));
        drop(next.clone());
        drop(next);
        assert!(rx.await.is_err());
    }
}
