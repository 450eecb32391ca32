//! TLS listener and certificate loading.

use std::fs::File;
use std::future::Future;
use std::io::{self, BufReader};
use std::net::SocketAddr;
use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::ServerConfig;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio_rustls::{server, Accept, TlsAcceptor};

use crate::listener::Listener;
use crate::Error;

const DEFAULT_ALPN: &[u8] = b"http/1.1";

/// TLS options of a [`Server`](crate::Server).
///
/// Unset options receive defaults when the configuration is built, explicitly set ones are
/// kept as they are.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TlsSettings {
    /// Protocols offered during ALPN negotiation, defaults to `http/1.1`.
    pub alpn_protocols: Option<Vec<Vec<u8>>>,
    /// Prefer the server's cipher suite order over the client's.
    pub ignore_client_order: bool,
    /// Maximum TLS record size.
    pub max_fragment_size: Option<usize>,
}

impl TlsSettings {
    /// Returns a copy with defaults filled into unset options.
    pub fn resolve(&self) -> TlsSettings {
        let mut settings = self.clone();
        if settings.alpn_protocols.is_none() {
            settings.alpn_protocols = Some(vec![DEFAULT_ALPN.to_vec()]);
        }
        settings
    }
}

/// Builds a server configuration from `settings` and a PEM encoded certificate chain and
/// private key.
pub fn load_server_config(
    settings: &TlsSettings,
    cert_path: &Path,
    key_path: &Path,
) -> Result<ServerConfig, Error> {
    let settings = settings.resolve();
    let certs = load_certs(cert_path)?;
    let key = load_private_key(key_path)?;

    let mut config =
        ServerConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
            .with_safe_default_protocol_versions()?
            .with_no_client_auth()
            .with_single_cert(certs, key)?;

    config.alpn_protocols = settings.alpn_protocols.unwrap_or_default();
    config.ignore_client_order = settings.ignore_client_order;
    config.max_fragment_size = settings.max_fragment_size;

    Ok(config)
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, Error> {
    let certificate_error = |source| Error::Certificate {
        path: path.to_owned(),
        source,
    };

    let file = File::open(path).map_err(certificate_error)?;
    let certs = rustls_pemfile::certs(&mut BufReader::new(file))
        .collect::<Result<Vec<_>, _>>()
        .map_err(certificate_error)?;

    if certs.is_empty() {
        return Err(certificate_error(io::Error::new(
            io::ErrorKind::InvalidData,
            "no certificates found",
        )));
    }

    Ok(certs)
}

fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, Error> {
    let key_error = |message: String| Error::PrivateKey {
        path: path.to_owned(),
        message,
    };

    let file = File::open(path).map_err(|e| key_error(e.to_string()))?;
    rustls_pemfile::private_key(&mut BufReader::new(file))
        .map_err(|e| key_error(e.to_string()))?
        .ok_or_else(|| key_error("no private key found".to_owned()))
}

/// A listener which serves TLS on top of another listener.
///
/// The handshake is not part of [`accept`](Listener::accept), it runs on the first read or
/// write of the connection. A slow client therefore never holds up the accept loop.
pub struct TlsListener<L> {
    inner: L,
    acceptor: TlsAcceptor,
}

impl<L: Listener> TlsListener<L> {
    pub fn new(inner: L, config: Arc<ServerConfig>) -> Self {
        Self {
            inner,
            acceptor: TlsAcceptor::from(config),
        }
    }
}

impl<L: Listener> Listener for TlsListener<L> {
    type Io = LazyTlsStream<L::Io>;

    fn accept(&self) -> impl Future<Output = io::Result<(Self::Io, SocketAddr)>> + Send {
        async move {
            let (io, addr) = self.inner.accept().await?;
            Ok((LazyTlsStream::new(self.acceptor.accept(io)), addr))
        }
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }
}

/// Server side TLS stream which completes its handshake on first use.
pub struct LazyTlsStream<IO> {
    state: State<IO>,
}

enum State<IO> {
    Handshaking(Accept<IO>),
    Streaming(server::TlsStream<IO>),
    Failed,
}

impl<IO> LazyTlsStream<IO>
where
    IO: AsyncRead + AsyncWrite + Unpin,
{
    fn new(accept: Accept<IO>) -> Self {
        Self {
            state: State::Handshaking(accept),
        }
    }

    fn poll_handshake(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match &mut self.state {
            State::Handshaking(accept) => match ready!(Pin::new(accept).poll(cx)) {
                Ok(stream) => {
                    self.state = State::Streaming(stream);
                    Poll::Ready(Ok(()))
                }
                Err(err) => {
                    tracing::debug!(error = %err, "TLS handshake failed");
                    self.state = State::Failed;
                    Poll::Ready(Err(err))
                }
            },
            State::Streaming(_) => Poll::Ready(Ok(())),
            State::Failed => Poll::Ready(Err(handshake_failed())),
        }
    }

    fn stream(&mut self) -> io::Result<Pin<&mut server::TlsStream<IO>>> {
        match &mut self.state {
            State::Streaming(stream) => Ok(Pin::new(stream)),
            _ => Err(handshake_failed()),
        }
    }
}

fn handshake_failed() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "TLS handshake did not complete")
}

impl<IO> AsyncRead for LazyTlsStream<IO>
where
    IO: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_handshake(cx))?;
        this.stream()?.poll_read(cx, buf)
    }
}

impl<IO> AsyncWrite for LazyTlsStream<IO>
where
    IO: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        ready!(this.poll_handshake(cx))?;
        this.stream()?.poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_handshake(cx))?;
        this.stream()?.poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match &mut self.get_mut().state {
            State::Streaming(stream) => Pin::new(stream).poll_shutdown(cx),
            // nothing was ever sent, dropping the socket is enough
            State::Handshaking(_) | State::Failed => Poll::Ready(Ok(())),
        }
    }
}
