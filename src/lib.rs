//! HTTP server which drains in-flight requests before shutting down.
//!
//! A [`GracefulServer`] wraps a hyper based [`Server`]. When a shutdown is requested it stops
//! accepting connections, disables keep-alive and waits until every request in progress, and
//! every piece of work registered through [`Routines`], has finished. Only then does
//! [`serve`](GracefulServer::serve) return.
//!
//! # Example:
//!
//! ```no_run
//! use bytes::Bytes;
//! use graceful_serve::GracefulServer;
//! use http_body_util::Full;
//! use hyper::{body::Incoming, service::service_fn, Request, Response};
//! use std::convert::Infallible;
//!
//! async fn hello(_: Request<Incoming>) -> Result<Response<Full<Bytes>>, Infallible> {
//!     Ok(Response::new(Full::new(Bytes::from("Hello World!"))))
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), graceful_serve::Error> {
//!     let server = GracefulServer::new("127.0.0.1:3000", service_fn(hello));
//!
//!     let shutdown = server.shutdown_handle();
//!     tokio::spawn(async move {
//!         let _ = tokio::signal::ctrl_c().await;
//!         shutdown.close();
//!     });
//!
//!     server.listen_and_serve().await
//! }
//! ```

mod conn;
mod counter;
mod error;
mod graceful;
pub mod listener;
mod server;
mod signal;
pub mod tls;
mod tracker;

pub use self::conn::{Conn, ConnState, ConnStateHook, ConnectionId};
pub use self::counter::{RoutineGuard, Routines};
pub use self::error::Error;
pub use self::graceful::{GracefulServer, ShutdownHandle};
pub use self::listener::{GracefulListener, IntoGracefulListener, Listener, ListenerHandle};
pub use self::server::Server;
pub use self::tls::{TlsListener, TlsSettings};
