use pin_project_lite::pin_project;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio_util::sync::{
    CancellationToken, WaitForCancellationFuture, WaitForCancellationFutureOwned,
};

/// Fire-once signal.
///
/// Setting it any number of times is equivalent to setting it once, and every waiter observes
/// it regardless of whether it started waiting before or after the signal was set.
#[derive(Clone)]
pub(crate) struct Signal {
    token: CancellationToken,
    fired: Arc<AtomicBool>,
}

impl Signal {
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            fired: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Sets the signal, returns `true` only for the call which actually fired it.
    pub fn set(&self) -> bool {
        let first = !self.fired.swap(true, Ordering::AcqRel);
        self.token.cancel();
        first
    }

    pub fn is_set(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn wait(&self) -> WaitForSignalFuture<'_> {
        WaitForSignalFuture {
            inner: WaitForSignal::Borrowed {
                f: self.token.cancelled(),
            },
        }
    }

    pub fn wait_owned(&self) -> WaitForSignalFuture<'static> {
        WaitForSignalFuture {
            inner: WaitForSignal::Owned {
                f: self.token.clone().cancelled_owned(),
            },
        }
    }
}

impl Default for Signal {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Signal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Signal")
            .field("is_set", &self.is_set())
            .finish()
    }
}

pin_project! {
    #[project = WaitForSignalProj]
    enum WaitForSignal<'a> {
        Borrowed { #[pin] f: WaitForCancellationFuture<'a> },
        Owned { #[pin] f: WaitForCancellationFutureOwned },
    }
}

pin_project! {
    pub(crate) struct WaitForSignalFuture<'a> {
        #[pin]
        inner: WaitForSignal<'a>,
    }
}

impl<'a> std::fmt::Debug for WaitForSignalFuture<'a> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WaitForSignalFuture").finish()
    }
}

impl<'a> std::future::Future for WaitForSignalFuture<'a> {
    type Output = ();

    fn poll(self: std::pin::Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        match this.inner.project() {
            WaitForSignalProj::Borrowed { f } => f.poll(cx),
            WaitForSignalProj::Owned { f } => f.poll(cx),
        }
    }
}
