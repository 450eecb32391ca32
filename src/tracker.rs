use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;

use crate::conn::{Conn, ConnState, ConnStateHook};
use crate::counter::WorkCounter;
use crate::server::SharedHook;

/// Last state the tracker observed for a connection.
///
/// Only the tracker reads or writes it, it decides whether a `Closed` needs to release work
/// that an earlier `Idle` already released.
#[derive(Debug)]
pub(crate) struct TrackedState {
    last: AtomicU8,
}

impl TrackedState {
    pub fn new() -> Self {
        Self {
            last: AtomicU8::new(ConnState::New as u8),
        }
    }
}

/// Turns connection state transitions into work counter updates.
///
/// A connection counts as in progress from `New` until it goes `Idle`, and again from every
/// `Idle -> Active`. Idle connections are not counted, closing one releases nothing.
pub(crate) struct ConnTracker {
    counter: Arc<WorkCounter>,
    closing: Arc<AtomicBool>,
    previous: Option<SharedHook>,
}

impl ConnTracker {
    pub fn new(
        counter: Arc<WorkCounter>,
        closing: Arc<AtomicBool>,
        previous: Option<SharedHook>,
    ) -> Self {
        Self {
            counter,
            closing,
            previous,
        }
    }
}

impl ConnStateHook for ConnTracker {
    fn on_state(&self, conn: &Conn, state: ConnState) {
        let last = ConnState::from_u8(conn.tracked.last.load(Ordering::Acquire));

        match state {
            ConnState::New => self.counter.increment(),
            ConnState::Active => {
                if last == ConnState::Idle {
                    self.counter.increment();
                }
            }
            ConnState::Idle => {
                // keep-alive may not be disabled on this connection yet, close it before it
                // picks up another request
                if self.closing.load(Ordering::Acquire) {
                    conn.close();
                }
                self.counter.decrement();
            }
            ConnState::Closed | ConnState::Hijacked => {
                if last != ConnState::Idle {
                    self.counter.decrement();
                }
            }
        }

        conn.tracked.last.store(state as u8, Ordering::Release);
        tracing::debug!(
            connection_id = %conn.id(),
            from = %last,
            to = %state,
            in_flight = self.counter.get(),
            "connection state changed"
        );

        if let Some(previous) = &self.previous {
            previous.on_state(conn, state);
        }
    }
}
