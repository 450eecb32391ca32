//! Connection-accepting listeners and the closeable wrapper used for shutdown.

use arc_swap::ArcSwapOption;
use futures::future::{select, Either};
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::pin::pin;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};

use crate::signal::Signal;
use crate::Error;

/// A source of incoming connections.
pub trait Listener: Send + Sync + 'static {
    /// The connection type handed out by [`accept`](Listener::accept).
    type Io: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    /// Waits for the next connection.
    fn accept(&self) -> impl Future<Output = io::Result<(Self::Io, SocketAddr)>> + Send;

    /// The address this listener is bound to.
    fn local_addr(&self) -> io::Result<SocketAddr>;
}

impl Listener for TcpListener {
    type Io = TcpStream;

    fn accept(&self) -> impl Future<Output = io::Result<(Self::Io, SocketAddr)>> + Send {
        TcpListener::accept(self)
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        TcpListener::local_addr(self)
    }
}

/// A listener which can be closed exactly once.
///
/// Once closed, pending and future calls to [`accept`](GracefulListener::accept) return
/// [`Error::ListenerClosed`] instead of an I/O error. Clones share the closed state and the
/// wrapped listener, closing releases it for all of them.
pub struct GracefulListener<L> {
    inner: Arc<ArcSwapOption<L>>,
    closed: Signal,
}

impl<L: Listener> GracefulListener<L> {
    pub fn new(listener: L) -> Self {
        Self {
            inner: Arc::new(ArcSwapOption::from_pointee(listener)),
            closed: Signal::new(),
        }
    }

    /// Waits for the next connection or for the listener to be closed.
    pub async fn accept(&self) -> Result<(L::Io, SocketAddr), Error> {
        if self.closed.is_set() {
            return Err(Error::ListenerClosed);
        }
        let Some(inner) = self.inner.load_full() else {
            return Err(Error::ListenerClosed);
        };

        // the closed signal is polled first, a close always wins over a ready connection
        let closed = pin!(self.closed.wait());
        let accept = pin!(inner.accept());

        match select(closed, accept).await {
            Either::Left(_) => Err(Error::ListenerClosed),
            Either::Right((Ok(accepted), _)) => Ok(accepted),
            Either::Right((Err(_), _)) if self.closed.is_set() => Err(Error::ListenerClosed),
            Either::Right((Err(err), _)) => Err(Error::Accept(err)),
        }
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        let inner = self.inner.load();
        match &*inner {
            Some(inner) => inner.local_addr(),
            None => Err(io::Error::new(io::ErrorKind::NotConnected, "listener closed")),
        }
    }

    /// Returns a handle which can close this listener from elsewhere.
    pub fn handle(&self) -> ListenerHandle {
        ListenerHandle {
            addr: self.local_addr().ok(),
            closed: self.closed.clone(),
            slot: self.inner.clone(),
        }
    }

    /// Closes the listener and releases the wrapped one.
    ///
    /// The socket is dropped as soon as a pending [`accept`](GracefulListener::accept) has
    /// returned, even while clones of this listener are still around. Idempotent, closing an
    /// already closed listener does nothing.
    pub fn close(&self) {
        close(&self.closed, &*self.inner);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_set()
    }
}

impl<L> Clone for GracefulListener<L> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            closed: self.closed.clone(),
        }
    }
}

impl<L> std::fmt::Debug for GracefulListener<L> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GracefulListener")
            .field("closed", &self.closed.is_set())
            .finish()
    }
}

/// Address and close switch of a live [`GracefulListener`].
#[derive(Clone)]
pub struct ListenerHandle {
    addr: Option<SocketAddr>,
    closed: Signal,
    slot: Arc<dyn Release>,
}

impl ListenerHandle {
    /// The address the listener was bound to, if it could be determined.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.addr
    }

    /// Closes the listener, see [`GracefulListener::close`].
    pub fn close(&self) {
        close(&self.closed, &*self.slot);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_set()
    }
}

impl std::fmt::Debug for ListenerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerHandle")
            .field("addr", &self.addr)
            .field("closed", &self.closed.is_set())
            .finish()
    }
}

/// Type erased slot of the wrapped listener.
trait Release: Send + Sync {
    fn release(&self);
}

impl<L: Send + Sync> Release for ArcSwapOption<L> {
    fn release(&self) {
        self.store(None);
    }
}

fn close(closed: &Signal, slot: &dyn Release) {
    // wake pending accepts first so they let go of the listener
    if closed.set() {
        tracing::debug!("listener closed");
    }
    slot.release();
}

/// Conversion into a [`GracefulListener`].
///
/// Every [`Listener`] is wrapped, an existing [`GracefulListener`] is passed through so closing
/// it from the outside still stops the server.
pub trait IntoGracefulListener {
    type Listener: Listener;

    fn into_graceful(self) -> GracefulListener<Self::Listener>;
}

impl<L: Listener> IntoGracefulListener for L {
    type Listener = L;

    fn into_graceful(self) -> GracefulListener<L> {
        GracefulListener::new(self)
    }
}

impl<L: Listener> IntoGracefulListener for GracefulListener<L> {
    type Listener = L;

    fn into_graceful(self) -> GracefulListener<L> {
        self
    }
}
