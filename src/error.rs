use std::io;
use std::path::PathBuf;

/// Errors returned while listening and serving.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The listener was closed, usually because a shutdown was requested.
    ///
    /// [`GracefulServer::serve`](crate::GracefulServer::serve) treats this as a clean stop and
    /// never returns it.
    #[error("listener already closed")]
    ListenerClosed,
    /// Failed to bind the listen address.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },
    /// Accepting a connection failed with a non transient error.
    #[error("failed to accept connection: {0}")]
    Accept(#[source] io::Error),
    /// The certificate chain could not be read.
    #[error("failed to load certificate {}: {source}", .path.display())]
    Certificate {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    /// The private key could not be read or is missing.
    #[error("failed to load private key {}: {message}", .path.display())]
    PrivateKey { path: PathBuf, message: String },
    /// The TLS configuration was rejected.
    #[error("invalid TLS configuration: {0}")]
    Tls(#[from] rustls::Error),
}

impl Error {
    /// Returns `true` if the error signals a closed listener rather than a fault.
    pub fn is_listener_closed(&self) -> bool {
        matches!(self, Error::ListenerClosed)
    }
}
