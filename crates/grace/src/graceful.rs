//! In-flight connection tracking.
//!
//! [`GracefulListener`] counts every connection it hands out and refuses to
//! accept once closed. Closing waits until each [`TrackedConnection`] has been
//! closed or dropped.

use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::task::{Context, Poll};
use std::time::Instant;

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::Notify;
use tracing::{debug, info};

use crate::error::{GraceError, Result};
use crate::listener::{is_closed_error, is_timeout_error, GraceListener};
use crate::restart;

/// Counter of in-flight connections that can be waited on until it drops
/// to zero.
#[derive(Debug, Default)]
pub struct InFlight {
    count: AtomicUsize,
    drained: Notify,
}

impl InFlight {
    /// Create an empty counter.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register one more in-flight connection.
    pub fn add(&self) {
        self.count.fetch_add(1, Ordering::SeqCst);
    }

    /// Mark one in-flight connection finished.
    pub fn done(&self) {
        let prev = self.count.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(prev > 0, "in-flight counter underflow");
        if prev == 1 {
            self.drained.notify_waiters();
        }
    }

    /// Current number of in-flight connections.
    pub fn count(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }

    /// Wait until no connection is in flight.
    pub async fn wait(&self) {
        loop {
            let drained = self.drained.notified();
            tokio::pin!(drained);
            // Register before checking so a concurrent `done` is not missed.
            drained.as_mut().enable();

            if self.count() == 0 {
                return;
            }
            drained.await;
        }
    }
}

/// Reverses a speculative [`InFlight::add`] unless disarmed.
struct PendingSlot<'a> {
    inflight: &'a InFlight,
    armed: bool,
}

impl<'a> PendingSlot<'a> {
    fn reserve(inflight: &'a InFlight) -> Self {
        inflight.add();
        Self {
            inflight,
            armed: true,
        }
    }

    fn commit(mut self) {
        self.armed = false;
    }
}

impl Drop for PendingSlot<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.inflight.done();
        }
    }
}

/// An accepted connection counted as in flight until closed.
///
/// Closing is idempotent: however often [`close`](TrackedConnection::close)
/// is called, and whether or not the connection is also dropped, the owning
/// listener's counter is decremented once.
#[derive(Debug)]
pub struct TrackedConnection<C> {
    conn: C,
    inflight: Arc<InFlight>,
    closed: AtomicBool,
}

impl<C> TrackedConnection<C> {
    fn new(conn: C, inflight: Arc<InFlight>) -> Self {
        Self {
            conn,
            inflight,
            closed: AtomicBool::new(false),
        }
    }

    /// Mark this connection finished.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.inflight.done();
        }
    }

    /// Whether [`close`](TrackedConnection::close) has run.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// The wrapped connection.
    pub fn get_ref(&self) -> &C {
        &self.conn
    }
}

impl<C> Drop for TrackedConnection<C> {
    fn drop(&mut self) {
        self.close();
    }
}

impl<C: AsyncRead + Unpin> AsyncRead for TrackedConnection<C> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.conn).poll_read(cx, buf)
    }
}

impl<C: AsyncWrite + Unpin> AsyncWrite for TrackedConnection<C> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.conn).poll_write(cx, buf)
    }

    fn poll_write_vectored(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.conn).poll_write_vectored(cx, bufs)
    }

    fn is_write_vectored(&self) -> bool {
        self.conn.is_write_vectored()
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.conn).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.conn).poll_shutdown(cx)
    }
}

/// How [`GracefulListener::close`] stops the underlying listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Teardown {
    /// Interrupt with a deadline when the parent process is init, close
    /// otherwise.
    ///
    /// Being re-parented to init is only a proxy for "another generation may
    /// share this socket"; pick [`Teardown::Close`] or
    /// [`Teardown::Deadline`] when the handoff state is known.
    #[default]
    Auto,
    /// Close the underlying listener.
    Close,
    /// Interrupt pending accepts with an immediate deadline, leaving the
    /// socket open.
    Deadline,
}

impl Teardown {
    fn resolve(self) -> Teardown {
        match self {
            Teardown::Auto if restart::parent_is_init() => Teardown::Deadline,
            Teardown::Auto => Teardown::Close,
            explicit => explicit,
        }
    }
}

/// Listener wrapper that refuses to accept once closed and whose close
/// waits for every accepted connection to finish.
#[derive(Debug)]
pub struct GracefulListener<L> {
    inner: L,
    closed: RwLock<bool>,
    inflight: Arc<InFlight>,
    teardown: Teardown,
}

impl<L: GraceListener> GracefulListener<L> {
    /// Wrap `inner` with the default [`Teardown::Auto`] policy.
    pub fn new(inner: L) -> Self {
        Self {
            inner,
            closed: RwLock::new(false),
            inflight: Arc::new(InFlight::new()),
            teardown: Teardown::default(),
        }
    }

    /// Override how the underlying listener is stopped on close.
    pub fn with_teardown(mut self, teardown: Teardown) -> Self {
        self.teardown = teardown;
        self
    }

    /// The wrapped listener.
    pub fn get_ref(&self) -> &L {
        &self.inner
    }

    /// Connections accepted but not yet closed.
    pub fn inflight(&self) -> usize {
        self.inflight.count()
    }

    /// Whether [`close`](GracefulListener::close) has been called.
    pub fn is_closed(&self) -> bool {
        *self.closed.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Accept the next connection and count it as in flight.
    pub async fn accept(&self) -> Result<TrackedConnection<L::Conn>> {
        // Count the connection before it exists so a concurrent close waits
        // for it.
        let slot = PendingSlot::reserve(&self.inflight);

        if self.is_closed() {
            return Err(GraceError::AlreadyClosed);
        }

        match self.inner.accept().await {
            Ok(conn) => {
                slot.commit();
                Ok(TrackedConnection::new(conn, Arc::clone(&self.inflight)))
            }
            Err(e) if is_closed_error(&e) => Err(GraceError::AlreadyClosed),
            Err(e) if is_timeout_error(&e) && self.is_closed() => Err(GraceError::AlreadyClosed),
            Err(e) => Err(GraceError::Io(e)),
        }
    }

    /// Stop accepting and wait for all in-flight connections to finish.
    ///
    /// Returns the result of stopping the underlying listener. A closed-kind
    /// error here only means the listener was already stopped.
    pub async fn close(&self) -> io::Result<()> {
        *self.closed.write().unwrap_or_else(PoisonError::into_inner) = true;

        let teardown = self.teardown.resolve();
        let result = match teardown {
            Teardown::Deadline => self.inner.set_deadline(Instant::now()),
            _ => self.inner.close(),
        };

        info!(
            ?teardown,
            inflight = self.inflight.count(),
            "Listener closed, waiting for in-flight connections"
        );
        self.inflight.wait().await;
        debug!("In-flight connections drained");

        result
    }
}
