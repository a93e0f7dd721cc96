//! A convenient shutdown signal.
//!
//! [`Shutdown`] owns the trigger; [`ShutdownSignal`] is a cheaply cloneable
//! future that resolves once triggered. Every long-lived task in this
//! workspace (the AM poll loop, Firehose's background mover, the exit
//! coordinator's own teardown alarm) is handed a clone of the same signal at
//! spawn time and selects on it alongside its real work, rather than
//! polling an `AtomicBool`.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures::channel::oneshot;
use futures::future::{FutureExt, Shared};

/// Owns the one-shot trigger. Dropping a `Shutdown` without calling
/// [`Shutdown::trigger`] also resolves every outstanding `ShutdownSignal`
/// (the sender half of a `oneshot` channel signals cancellation on drop).
pub struct Shutdown {
    trigger: Option<oneshot::Sender<()>>,
    signal: ShutdownSignal,
}

impl Shutdown {
    pub fn new() -> Self {
        let (trigger, rx) = oneshot::channel();
        Shutdown {
            trigger: Some(trigger),
            signal: ShutdownSignal { inner: rx.shared() },
        }
    }

    /// Fire the signal. Idempotent: a second call is a no-op.
    pub fn trigger(&mut self) {
        if let Some(trigger) = self.trigger.take() {
            let _ = trigger.send(());
        }
    }

    pub fn is_triggered(&self) -> bool {
        self.trigger.is_none()
    }

    /// Obtain a clone of the signal to hand to a spawned task.
    pub fn to_signal(&self) -> ShutdownSignal {
        self.signal.clone()
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

/// A cloneable future that resolves once the originating [`Shutdown`] is
/// triggered (or dropped).
#[derive(Clone)]
pub struct ShutdownSignal {
    inner: Shared<oneshot::Receiver<()>>,
}

impl ShutdownSignal {
    /// True once the signal has already fired, without polling it.
    pub fn is_triggered(&self) -> bool {
        self.inner.peek().is_some()
    }
}

impl Future for ShutdownSignal {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        match Pin::new(&mut self.inner).poll(cx) {
            Poll::Ready(_) => Poll::Ready(()),
            Poll::Pending => Poll::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn signal_resolves_once_triggered() {
        let mut shutdown = Shutdown::new();
        let signal = shutdown.to_signal();
        assert!(!signal.is_triggered());
        shutdown.trigger();
        signal.clone().await;
        assert!(signal.is_triggered());
    }

    #[tokio::test]
    async fn dropping_shutdown_also_resolves_signals() {
        let shutdown = Shutdown::new();
        let signal = shutdown.to_signal();
        drop(shutdown);
        signal.await;
    }

    #[tokio::test]
    async fn multiple_clones_all_observe_the_trigger() {
        let mut shutdown = Shutdown::new();
        let a = shutdown.to_signal();
        let b = shutdown.to_signal();
        shutdown.trigger();
        a.await;
        b.await;
    }

    #[test]
    fn trigger_is_idempotent() {
        let mut shutdown = Shutdown::new();
        shutdown.trigger();
        shutdown.trigger();
        assert!(shutdown.is_triggered());
    }
}
