//! Minimal HTTP/1 host server built on hyper.
//!
//! Runs the accept loop, reports connection state transitions to a [`ConnStateHook`] and can
//! switch keep-alive off for new and live connections. Request handling is entirely up to the
//! wrapped service.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{ready, Context, Poll};
use std::time::Duration;

use arc_swap::{ArcSwap, ArcSwapOption};
use http::{Extensions, Request, Response, StatusCode};
use http_body::{Body, Frame, SizeHint};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::Service;
use hyper_util::rt::{TokioIo, TokioTimer};
use pin_project_lite::pin_project;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::watch;

use crate::conn::{Conn, ConnState, ConnStateHook};
use crate::listener::{GracefulListener, Listener};
use crate::tls::TlsSettings;
use crate::Error;

pub(crate) type SharedHook = Arc<Box<dyn ConnStateHook>>;

type BoxError = Box<dyn std::error::Error + Send + Sync>;
type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

const MIN_ACCEPT_BACKOFF: Duration = Duration::from_millis(5);
const MAX_ACCEPT_BACKOFF: Duration = Duration::from_secs(1);
// hyper rejects smaller read buffers
const MIN_BUF_SIZE: usize = 8192;

/// HTTP server configuration and accept loop.
///
/// # Example:
///
/// ```no_run
/// # use std::convert::Infallible;
/// # use std::time::Duration;
/// # use graceful_serve::Server;
/// # use hyper::{body::Incoming, service::service_fn, Request, Response};
/// # async fn hello(_: Request<Incoming>) -> Result<Response<String>, Infallible> {
/// #     Ok(Response::new("hello".to_owned()))
/// # }
/// let server = Server::new("127.0.0.1:8080", service_fn(hello))
///     .with_header_read_timeout(Duration::from_secs(10))
///     .with_max_buf_size(1 << 20);
/// ```
pub struct Server<S> {
    addr: String,
    service: S,
    header_read_timeout: Option<Duration>,
    max_buf_size: Option<usize>,
    tls: Option<TlsSettings>,
    hook: ArcSwapOption<Box<dyn ConnStateHook>>,
    keep_alive: KeepAliveSwitch,
    extensions: ArcSwap<Extensions>,
}

impl<S> Server<S> {
    /// Creates a server for `addr` handing requests to `service`.
    ///
    /// An empty address listens on all interfaces on the default port.
    pub fn new(addr: impl Into<String>, service: S) -> Self {
        Self {
            addr: addr.into(),
            service,
            header_read_timeout: None,
            max_buf_size: None,
            tls: None,
            hook: ArcSwapOption::empty(),
            keep_alive: KeepAliveSwitch::new(),
            extensions: ArcSwap::from_pointee(Extensions::new()),
        }
    }

    /// Closes connections which do not send a complete request head in time.
    pub fn with_header_read_timeout(mut self, timeout: Duration) -> Self {
        self.header_read_timeout = Some(timeout);
        self
    }

    /// Limits the connection read buffer, and with it the size of request heads.
    ///
    /// Values below 8192 bytes are ignored.
    pub fn with_max_buf_size(mut self, size: usize) -> Self {
        if size < MIN_BUF_SIZE {
            tracing::warn!(size, minimum = MIN_BUF_SIZE, "ignoring too small max_buf_size");
            return self;
        }
        self.max_buf_size = Some(size);
        self
    }

    /// TLS options used when serving TLS.
    pub fn with_tls(mut self, settings: TlsSettings) -> Self {
        self.tls = Some(settings);
        self
    }

    /// Installs a connection state hook.
    pub fn with_conn_state_hook(self, hook: impl ConnStateHook) -> Self {
        self.set_conn_state_hook(hook);
        self
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn service(&self) -> &S {
        &self.service
    }

    pub fn header_read_timeout(&self) -> Option<Duration> {
        self.header_read_timeout
    }

    pub fn max_buf_size(&self) -> Option<usize> {
        self.max_buf_size
    }

    pub fn tls_settings(&self) -> Option<&TlsSettings> {
        self.tls.as_ref()
    }

    /// Replaces the connection state hook.
    ///
    /// Connections keep reporting to the hook that was installed when they were accepted.
    pub fn set_conn_state_hook(&self, hook: impl ConnStateHook) {
        self.hook.store(Some(Arc::new(Box::new(hook))));
    }

    pub(crate) fn replace_conn_state_hook(&self, hook: Option<SharedHook>) -> Option<SharedHook> {
        self.hook.swap(hook)
    }

    /// Enables or disables HTTP keep-alive.
    ///
    /// Disabling affects live connections too: they finish the response in progress and
    /// close, idle ones close right away.
    pub fn set_keep_alives_enabled(&self, enabled: bool) {
        self.keep_alive.set(enabled);
    }

    pub fn keep_alives_enabled(&self) -> bool {
        self.keep_alive.enabled()
    }

    pub(crate) fn keep_alive_switch(&self) -> KeepAliveSwitch {
        self.keep_alive.clone()
    }

    /// Adds a value to the extensions of every request accepted from now on.
    pub fn insert_request_extension<T>(&self, value: T)
    where
        T: Clone + Send + Sync + 'static,
    {
        self.extensions.rcu(|current| {
            let mut extensions = Extensions::clone(current);
            extensions.insert(value.clone());
            extensions
        });
    }
}

impl<S, B> Server<S>
where
    S: Service<Request<Incoming>, Response = Response<B>> + Clone + Send + Sync + 'static,
    S::Future: Send + 'static,
    S::Error: Into<BoxError>,
    B: Body + Send + 'static,
    B::Data: Send,
    B::Error: Into<BoxError>,
{
    /// Runs the accept loop until the listener is closed or fails.
    ///
    /// Transient accept errors are retried with backoff. Always returns an error, closing the
    /// listener yields [`Error::ListenerClosed`].
    pub async fn serve<L: Listener>(&self, listener: &GracefulListener<L>) -> Result<(), Error> {
        let mut backoff: Option<Duration> = None;

        loop {
            let (io, peer_addr) = match listener.accept().await {
                Ok(accepted) => {
                    backoff = None;
                    accepted
                }
                Err(Error::Accept(err)) if is_transient(&err) => {
                    let delay = backoff.map_or(MIN_ACCEPT_BACKOFF, |d| (d * 2).min(MAX_ACCEPT_BACKOFF));
                    backoff = Some(delay);
                    tracing::warn!(error = %err, retry_in = ?delay, "accept failed, retrying");
                    tokio::time::sleep(delay).await;
                    continue;
                }
                Err(err) => return Err(err),
            };

            let ctx = Arc::new(ConnContext::new(Conn::new(peer_addr), self.hook.load_full()));
            tracing::debug!(connection_id = %ctx.conn.id(), %peer_addr, "accepted connection");

            // reported before the task exists, an accepted connection is always counted by the
            // time the accept loop returns
            ctx.emit(ConnState::New);
            self.spawn_connection(io, ctx);
        }
    }

    fn spawn_connection<IO>(&self, io: IO, ctx: Arc<ConnContext>)
    where
        IO: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let mut keep_alive = self.keep_alive.subscribe();

        let mut builder = http1::Builder::new();
        builder
            .timer(TokioTimer::new())
            .keep_alive(*keep_alive.borrow_and_update());
        if let Some(timeout) = self.header_read_timeout {
            builder.header_read_timeout(timeout);
        }
        if let Some(size) = self.max_buf_size {
            builder.max_buf_size(size);
        }

        let io = FlushTracked {
            inner: io,
            ctx: Arc::clone(&ctx),
        };
        let service = TrackedService {
            inner: self.service.clone(),
            ctx: Arc::clone(&ctx),
            extensions: self.extensions.load_full(),
        };

        tokio::spawn(async move {
            let mut connection = Box::pin(
                builder
                    .serve_connection(TokioIo::new(io), service)
                    .with_upgrades(),
            );

            let mut watch_closed = true;
            let mut watch_keep_alive = true;
            loop {
                tokio::select! {
                    biased;
                    _ = ctx.conn.closed().wait(), if watch_closed => {
                        // finishes a response still being written, then closes
                        connection.as_mut().graceful_shutdown();
                        watch_closed = false;
                    }
                    result = connection.as_mut() => {
                        if let Err(err) = result {
                            tracing::debug!(connection_id = %ctx.conn.id(), error = %err, "connection error");
                        }
                        break;
                    }
                    changed = keep_alive.changed(), if watch_keep_alive => {
                        if changed.is_err() {
                            watch_keep_alive = false;
                        } else if !*keep_alive.borrow_and_update() {
                            connection.as_mut().graceful_shutdown();
                            watch_keep_alive = false;
                        }
                    }
                }
            }

            // drop the socket before reporting the final state
            drop(connection);
            if ctx.upgraded.load(Ordering::Acquire) {
                ctx.emit(ConnState::Hijacked);
            } else {
                ctx.emit(ConnState::Closed);
            }
        });
    }
}

impl<S> std::fmt::Debug for Server<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("addr", &self.addr)
            .field("header_read_timeout", &self.header_read_timeout)
            .field("max_buf_size", &self.max_buf_size)
            .field("tls", &self.tls)
            .field("keep_alive", &self.keep_alive.enabled())
            .finish()
    }
}

fn is_transient(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
    ) || is_fd_exhaustion(err)
}

fn is_fd_exhaustion(err: &io::Error) -> bool {
    // EMFILE and ENFILE on linux and the BSDs
    matches!(err.raw_os_error(), Some(23) | Some(24))
}

/// Shared keep-alive flag, observed by every live connection.
#[derive(Clone)]
pub(crate) struct KeepAliveSwitch {
    tx: Arc<watch::Sender<bool>>,
}

impl KeepAliveSwitch {
    fn new() -> Self {
        Self {
            tx: Arc::new(watch::Sender::new(true)),
        }
    }

    pub fn set(&self, enabled: bool) {
        self.tx.send_replace(enabled);
    }

    pub fn disable(&self) {
        self.set(false);
    }

    pub fn enabled(&self) -> bool {
        *self.tx.borrow()
    }

    fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

struct ConnContext {
    conn: Conn,
    hook: Option<SharedHook>,
    upgraded: AtomicBool,
    // response body finished, waiting for its bytes to leave hyper's write buffer
    idle_pending: AtomicBool,
}

impl ConnContext {
    fn new(conn: Conn, hook: Option<SharedHook>) -> Self {
        Self {
            conn,
            hook,
            upgraded: AtomicBool::new(false),
            idle_pending: AtomicBool::new(false),
        }
    }

    fn emit(&self, state: ConnState) {
        if let Some(hook) = &self.hook {
            hook.on_state(&self.conn, state);
        }
    }

    fn activate(&self) {
        // a pipelined request can arrive before the previous response was flushed, the
        // connection never went idle in between
        self.idle_pending.store(false, Ordering::Release);
        self.emit(ConnState::Active);
    }

    fn response_done(&self) {
        self.idle_pending.store(true, Ordering::Release);
    }

    /// Reports `Idle` if a finished response was waiting for this flush.
    fn flushed(&self) {
        if self.idle_pending.swap(false, Ordering::AcqRel) {
            self.emit(ConnState::Idle);
        }
    }
}

/// Wraps the user's service to report `Active` and mark finished responses.
struct TrackedService<S> {
    inner: S,
    ctx: Arc<ConnContext>,
    extensions: Arc<Extensions>,
}

impl<S, B> Service<Request<Incoming>> for TrackedService<S>
where
    S: Service<Request<Incoming>, Response = Response<B>>,
    S::Future: Send + 'static,
    S::Error: Into<BoxError>,
    B: Body + Send + 'static,
{
    type Response = Response<TrackedBody<B>>;
    type Error = BoxError;
    type Future = BoxFuture<Result<Self::Response, Self::Error>>;

    fn call(&self, mut req: Request<Incoming>) -> Self::Future {
        if self.ctx.conn.is_closed() {
            // the connection was closed while idle, refuse whatever slipped in
            let err: BoxError =
                io::Error::new(io::ErrorKind::ConnectionAborted, "connection closed").into();
            return Box::pin(async move { Err::<Self::Response, _>(err) });
        }

        self.ctx.activate();
        req.extensions_mut().extend(Extensions::clone(&self.extensions));

        let response = self.inner.call(req);
        let ctx = Arc::clone(&self.ctx);
        Box::pin(async move {
            let response = response.await.map_err(Into::<BoxError>::into)?;

            let upgrade = response.status() == StatusCode::SWITCHING_PROTOCOLS;
            if upgrade {
                ctx.upgraded.store(true, Ordering::Release);
            }

            Ok::<_, BoxError>(response.map(|body| TrackedBody {
                inner: body,
                idle: IdleNotice {
                    ctx: (!upgrade).then_some(ctx),
                },
            }))
        })
    }
}

pin_project! {
    /// Response body which marks the response finished once hyper is done with it.
    struct TrackedBody<B> {
        #[pin]
        inner: B,
        idle: IdleNotice,
    }
}

struct IdleNotice {
    ctx: Option<Arc<ConnContext>>,
}

impl Drop for IdleNotice {
    fn drop(&mut self) {
        if let Some(ctx) = self.ctx.take() {
            ctx.response_done();
        }
    }
}

impl<B: Body> Body for TrackedBody<B> {
    type Data = B::Data;
    type Error = B::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        self.project().inner.poll_frame(cx)
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

pin_project! {
    /// Connection IO which reports the connection idle once a finished response is flushed.
    ///
    /// hyper drops the response body as soon as the last frame is queued, the bytes may still
    /// sit in its write buffer. A successful flush or shutdown means they were handed to the
    /// socket.
    struct FlushTracked<IO> {
        #[pin]
        inner: IO,
        ctx: Arc<ConnContext>,
    }
}

impl<IO: AsyncRead> AsyncRead for FlushTracked<IO> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        self.project().inner.poll_read(cx, buf)
    }
}

impl<IO: AsyncWrite> AsyncWrite for FlushTracked<IO> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.project().inner.poll_write(cx, buf)
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        self.project().inner.poll_write_vectored(cx, bufs)
    }

    fn is_write_vectored(&self) -> bool {
        self.inner.is_write_vectored()
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.project();
        ready!(this.inner.poll_flush(cx))?;
        this.ctx.flushed();
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.project();
        ready!(this.inner.poll_shutdown(cx))?;
        this.ctx.flushed();
        Poll::Ready(Ok(()))
    }
}
