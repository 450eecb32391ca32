use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

/// Number of units of work still in progress.
///
/// Incremented when a connection becomes busy or a handler registers extra work, decremented
/// when that work completes. Decrementing past zero means a transition was missed somewhere
/// and panics.
#[derive(Debug, Default)]
pub(crate) struct WorkCounter {
    count: AtomicUsize,
    zero: Notify,
}

impl WorkCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment(&self) {
        self.count.fetch_add(1, Ordering::AcqRel);
    }

    pub fn decrement(&self) {
        match self
            .count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
        {
            Ok(1) => self.zero.notify_waiters(),
            Ok(_) => {}
            Err(_) => panic!("work counter decremented below zero: finished work that was never started"),
        }
    }

    pub fn get(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    /// Waits until the counter reaches zero.
    ///
    /// Returns immediately when there is no outstanding work.
    pub async fn wait(&self) {
        loop {
            let notified = self.zero.notified();
            tokio::pin!(notified);
            // register before checking, a decrement racing with the load still wakes us
            notified.as_mut().enable();

            if self.get() == 0 {
                return;
            }

            notified.await;
        }
    }
}

/// Handle for registering work that must finish before shutdown completes.
///
/// Request handlers use it for work that outlives the request/response cycle, e.g. a task
/// spawned from a handler. Every request served by a
/// [`GracefulServer`](crate::GracefulServer) carries a clone in its extensions.
///
/// # Example:
///
/// ```no_run
/// # use graceful_serve::Routines;
/// # async fn flush() {}
/// # fn handler(req: http::Request<hyper::body::Incoming>) {
/// if let Some(routines) = req.extensions().get::<Routines>() {
///     let guard = routines.guard();
///     tokio::spawn(async move {
///         flush().await;
///         drop(guard);
///     });
/// }
/// # }
/// ```
#[derive(Clone, Default)]
pub struct Routines {
    counter: Arc<WorkCounter>,
}

impl Routines {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Registers one unit of outstanding work.
    pub fn start(&self) {
        self.counter.increment();
    }

    /// Completes one unit of work registered with [`start`](Routines::start).
    ///
    /// # Panics
    ///
    /// Panics when called more often than [`start`](Routines::start).
    pub fn finish(&self) {
        self.counter.decrement();
    }

    /// Registers one unit of work which is completed when the returned guard is dropped.
    pub fn guard(&self) -> RoutineGuard {
        self.counter.increment();
        RoutineGuard {
            counter: Arc::clone(&self.counter),
        }
    }

    /// Number of connections and routines currently in progress.
    pub fn in_flight(&self) -> usize {
        self.counter.get()
    }

    pub(crate) fn counter(&self) -> Arc<WorkCounter> {
        Arc::clone(&self.counter)
    }

    pub(crate) async fn wait(&self) {
        self.counter.wait().await
    }
}

impl std::fmt::Debug for Routines {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Routines")
            .field("in_flight", &self.in_flight())
            .finish()
    }
}

/// A guard which delays shutdown until it is dropped.
///
/// Created by [`Routines::guard`].
pub struct RoutineGuard {
    counter: Arc<WorkCounter>,
}

impl std::fmt::Debug for RoutineGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoutineGuard").finish()
    }
}

impl Drop for RoutineGuard {
    fn drop(&mut self) {
        self.counter.decrement();
    }
}
