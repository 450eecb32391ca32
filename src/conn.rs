//! Connection handles and lifecycle states.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::signal::Signal;
use crate::tracker::TrackedState;

static CONNECTION_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    fn next() -> Self {
        Self(CONNECTION_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Lifecycle state of a connection.
///
/// A connection starts as `New`, alternates between `Active` and `Idle` for every request and
/// ends in exactly one of `Closed` or `Hijacked`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ConnState {
    /// Accepted, no request read yet.
    New = 0,
    /// A request is being handled.
    Active = 1,
    /// The last response was written, waiting for another request.
    Idle = 2,
    /// The connection is gone.
    Closed = 3,
    /// The connection was upgraded and handed over to the handler.
    Hijacked = 4,
}

impl ConnState {
    pub(crate) fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::New,
            1 => Self::Active,
            2 => Self::Idle,
            3 => Self::Closed,
            _ => Self::Hijacked,
        }
    }
}

impl std::fmt::Display for ConnState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::New => "new",
            Self::Active => "active",
            Self::Idle => "idle",
            Self::Closed => "closed",
            Self::Hijacked => "hijacked",
        };
        f.write_str(name)
    }
}

/// Handle of one accepted connection, passed to [`ConnStateHook`]s.
pub struct Conn {
    id: ConnectionId,
    peer_addr: SocketAddr,
    closed: Signal,
    pub(crate) tracked: TrackedState,
}

impl Conn {
    pub(crate) fn new(peer_addr: SocketAddr) -> Self {
        Self {
            id: ConnectionId::next(),
            peer_addr,
            closed: Signal::new(),
            tracked: TrackedState::new(),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Closes the connection.
    ///
    /// A response still being written is finished, then the socket is dropped. No further
    /// request is handled on it. Closing twice has no additional effect.
    pub fn close(&self) {
        if self.closed.set() {
            tracing::debug!(connection_id = %self.id, "closing connection");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_set()
    }

    pub(crate) fn closed(&self) -> &Signal {
        &self.closed
    }
}

impl std::fmt::Debug for Conn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Conn")
            .field("id", &self.id)
            .field("peer_addr", &self.peer_addr)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Callback invoked on every connection state transition.
///
/// Runs synchronously on the connection's task, transitions of one connection are never
/// delivered concurrently and always in order. Implementations must not block.
pub trait ConnStateHook: Send + Sync + 'static {
    fn on_state(&self, conn: &Conn, state: ConnState);
}

impl<F> ConnStateHook for F
where
    F: Fn(&Conn, ConnState) + Send + Sync + 'static,
{
    fn on_state(&self, conn: &Conn, state: ConnState) {
        self(conn, state)
    }
}
