use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use http::{Request, Response};
use http_body::Body;
use hyper::body::Incoming;
use hyper::service::Service;
use tokio::net::TcpListener;
use tokio::sync::mpsc;

use crate::counter::Routines;
use crate::listener::{IntoGracefulListener, ListenerHandle};
use crate::server::{Server, SharedHook};
use crate::signal::Signal;
use crate::tls::{self, TlsListener};
use crate::tracker::ConnTracker;
use crate::Error;

const DEFAULT_HTTP_ADDR: &str = "0.0.0.0:80";
const DEFAULT_HTTPS_ADDR: &str = "0.0.0.0:443";

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// An HTTP server which finishes in-flight requests before it stops.
///
/// After [`close`](GracefulServer::close) the server stops accepting connections, disables
/// keep-alive and [`serve`](GracefulServer::serve) returns once every request in progress and
/// every registered [routine](Routines) has completed. There is no deadline on this wait.
///
/// # Example:
///
/// ```no_run
/// # use std::convert::Infallible;
/// # use std::sync::Arc;
/// # use graceful_serve::GracefulServer;
/// # use hyper::{body::Incoming, service::service_fn, Request, Response};
/// # async fn hello(_: Request<Incoming>) -> Result<Response<String>, Infallible> {
/// #     Ok(Response::new("hello".to_owned()))
/// # }
/// # async fn fun() -> Result<(), graceful_serve::Error> {
/// let server = GracefulServer::new("127.0.0.1:8080", service_fn(hello));
///
/// let shutdown = server.shutdown_handle();
/// tokio::spawn(async move {
///     let _ = tokio::signal::ctrl_c().await;
///     shutdown.close();
/// });
///
/// server.listen_and_serve().await
/// # }
/// ```
pub struct GracefulServer<S> {
    server: Server<S>,
    shutdown: Signal,
    routines: Routines,
    closing: Arc<AtomicBool>,
    user_hook: Option<SharedHook>,
    ready: Option<mpsc::UnboundedSender<ListenerHandle>>,
}

impl<S> GracefulServer<S> {
    /// Creates a server for `addr` with default settings.
    pub fn new(addr: impl Into<String>, service: S) -> Self {
        Self::with_server(Server::new(addr, service))
    }

    /// Wraps a configured server.
    ///
    /// Its settings are kept, a connection state hook installed on it keeps receiving every
    /// transition.
    pub fn with_server(server: Server<S>) -> Self {
        let user_hook = server.replace_conn_state_hook(None);

        Self {
            server,
            shutdown: Signal::new(),
            routines: Routines::new(),
            closing: Arc::new(AtomicBool::new(false)),
            user_hook,
            ready: None,
        }
    }

    /// Sends the listener's handle to `tx` once serving begins.
    ///
    /// Intended for tests which need the bound address or want to drive the listener.
    pub fn with_ready_hook(mut self, tx: mpsc::UnboundedSender<ListenerHandle>) -> Self {
        self.ready = Some(tx);
        self
    }

    pub fn server(&self) -> &Server<S> {
        &self.server
    }

    /// Requests a shutdown.
    ///
    /// Does not wait for the shutdown to complete, that is signalled by
    /// [`serve`](GracefulServer::serve) returning. Calling it more than once has no further
    /// effect.
    pub fn close(&self) {
        request_shutdown(&self.shutdown);
    }

    /// Returns a handle which requests a shutdown from anywhere.
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            signal: self.shutdown.clone(),
        }
    }

    /// `true` once a running [`serve`](GracefulServer::serve) has begun shutting down.
    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    /// Registers work which has to finish before shutdown completes.
    pub fn start_routine(&self) {
        self.routines.start();
    }

    /// Completes work registered with [`start_routine`](GracefulServer::start_routine).
    ///
    /// # Panics
    ///
    /// Panics when called more often than
    /// [`start_routine`](GracefulServer::start_routine).
    pub fn finish_routine(&self) {
        self.routines.finish();
    }

    /// The drain counter, also available to handlers as a request extension.
    pub fn routines(&self) -> Routines {
        self.routines.clone()
    }

    /// Number of busy connections plus registered routines.
    pub fn in_flight(&self) -> usize {
        self.routines.in_flight()
    }
}

impl<S, B> GracefulServer<S>
where
    S: Service<Request<Incoming>, Response = Response<B>> + Clone + Send + Sync + 'static,
    S::Future: Send + 'static,
    S::Error: Into<BoxError>,
    B: Body + Send + 'static,
    B::Data: Send,
    B::Error: Into<BoxError>,
{
    /// Listens on the configured address and serves plain HTTP.
    pub async fn listen_and_serve(&self) -> Result<(), Error> {
        let listener = self.bind(DEFAULT_HTTP_ADDR).await?;
        self.serve(listener).await
    }

    /// Listens on the configured address and serves HTTPS with the given PEM files.
    ///
    /// The server's [`TlsSettings`](crate::TlsSettings) are used, options left unset receive
    /// defaults.
    pub async fn listen_and_serve_tls(
        &self,
        cert_path: impl AsRef<Path>,
        key_path: impl AsRef<Path>,
    ) -> Result<(), Error> {
        let settings = self.server.tls_settings().cloned().unwrap_or_default();
        let config = tls::load_server_config(&settings, cert_path.as_ref(), key_path.as_ref())?;

        let listener = self.bind(DEFAULT_HTTPS_ADDR).await?;
        self.serve(TlsListener::new(listener, Arc::new(config))).await
    }

    async fn bind(&self, default_addr: &str) -> Result<TcpListener, Error> {
        let addr = match self.server.addr() {
            "" => default_addr,
            addr => addr,
        };

        TcpListener::bind(addr).await.map_err(|source| Error::Bind {
            addr: addr.to_owned(),
            source,
        })
    }

    /// Serves connections from `listener` until shutdown.
    ///
    /// Listeners which are not a [`GracefulListener`](crate::GracefulListener) yet are
    /// wrapped. After a shutdown request this returns `Ok` once all in-flight work is done.
    /// Any other failure of the accept loop is returned immediately.
    pub async fn serve<L: IntoGracefulListener>(&self, listener: L) -> Result<(), Error> {
        let listener = listener.into_graceful();

        let tracker = ConnTracker::new(
            self.routines.counter(),
            Arc::clone(&self.closing),
            self.user_hook.clone(),
        );
        self.server.set_conn_state_hook(tracker);
        self.server.insert_request_extension(self.routines.clone());

        let watcher = tokio::spawn({
            let shutdown = self.shutdown.wait_owned();
            let closing = Arc::clone(&self.closing);
            let keep_alive = self.server.keep_alive_switch();
            let listener = listener.handle();

            async move {
                shutdown.await;
                closing.store(true, Ordering::Release);
                keep_alive.disable();
                listener.close();
            }
        });

        if let Some(ready) = &self.ready {
            let _ = ready.send(listener.handle());
        }

        match listener.local_addr() {
            Ok(addr) => tracing::info!(address = %addr, "serving"),
            Err(err) => tracing::info!(error = %err, "serving on listener without address"),
        }

        let result = self.server.serve(&listener).await;
        watcher.abort();
        // stop the socket from taking connections while draining
        drop(listener);

        match result {
            Ok(()) | Err(Error::ListenerClosed) => {
                tracing::info!(in_flight = self.in_flight(), "draining in-flight requests");
                self.routines.wait().await;
                tracing::info!("shutdown complete");
                Ok(())
            }
            Err(err) => {
                tracing::error!(error = %err, "server stopped unexpectedly");
                Err(err)
            }
        }
    }
}

impl<S> std::fmt::Debug for GracefulServer<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GracefulServer")
            .field("server", &self.server)
            .field("shutdown_requested", &self.shutdown.is_set())
            .field("closing", &self.is_closing())
            .field("in_flight", &self.in_flight())
            .finish()
    }
}

/// Requests the shutdown of a [`GracefulServer`].
///
/// Cheap to clone and can be moved to other tasks, e.g. a signal handler.
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    signal: Signal,
}

impl ShutdownHandle {
    /// Requests a shutdown, see [`GracefulServer::close`].
    pub fn close(&self) {
        request_shutdown(&self.signal);
    }

    pub fn is_requested(&self) -> bool {
        self.signal.is_set()
    }
}

fn request_shutdown(signal: &Signal) {
    if signal.set() {
        tracing::info!("shutdown requested");
    }
}
