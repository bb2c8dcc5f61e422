//! Serve-and-wait orchestration.
//!
//! [`GraceServer::serve`] runs the request-serving loop and the signal-wait
//! loop side by side and returns as soon as either finishes:
//!
//! - `SIGTERM` / `SIGINT` → return at once, without draining
//! - `SIGQUIT` → stop accepting, drain in-flight connections (bounded by the
//!   drain timeout), return; `SIGTERM` / `SIGINT` during the drain cut it
//!   short
//! - `SIGHUP` → spawn a replacement process that inherits the listener; the
//!   replacement later sends `SIGQUIT` to drain this one

use std::io;
use std::os::unix::io::AsRawFd;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use hyper::body::{Body, Incoming};
use hyper::{Request, Response};
use tokio::task::JoinError;
use tower::Service;
use tracing::{debug, error, info, warn};

use crate::error::{GraceError, Result};
use crate::graceful::{GracefulListener, Teardown};
use crate::http::{BoxError, Engine, HttpOptions};
use crate::listener::{acquire_listener, is_closed_error, GraceListener};
use crate::restart;
use crate::signals::{SignalAction, SignalQueue};

/// Environment variable read by [`GraceServer::from_env`].
pub const DRAIN_TIMEOUT_ENV: &str = "GRACE_DRAIN_TIMEOUT_SECS";

static DEFAULT_DRAIN_TIMEOUT_SECS: AtomicU64 = AtomicU64::new(60);

/// Set the drain timeout used by [`GraceServer::default`] and the free
/// [`listen_and_serve`] and [`serve`] functions. Zero waits forever.
pub fn set_global_drain_timeout(seconds: u64) {
    DEFAULT_DRAIN_TIMEOUT_SECS.store(seconds, Ordering::Relaxed);
}

/// The current process-wide default drain timeout.
pub fn global_drain_timeout() -> Duration {
    Duration::from_secs(DEFAULT_DRAIN_TIMEOUT_SECS.load(Ordering::Relaxed))
}

/// Acquire a listener for `addr` and serve `service` on it with a default
/// [`GraceServer`].
pub async fn listen_and_serve<S, B>(addr: &str, service: S) -> Result<()>
where
    S: Service<Request<Incoming>, Response = Response<B>> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Error: Into<BoxError>,
    B: Body + Send + 'static,
    B::Data: Send,
    B::Error: Into<BoxError>,
{
    GraceServer::default().listen_and_serve(addr, service).await
}

/// Serve `service` on `listener` with a default [`GraceServer`].
pub async fn serve<L, S, B>(listener: L, service: S) -> Result<()>
where
    L: GraceListener,
    S: Service<Request<Incoming>, Response = Response<B>> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Error: Into<BoxError>,
    B: Body + Send + 'static,
    B::Data: Send,
    B::Error: Into<BoxError>,
{
    GraceServer::default().serve(listener, service).await
}

/// Orchestrates serving, signal handling, restart and drain for one
/// listener.
#[derive(Debug, Clone)]
pub struct GraceServer {
    drain_timeout: Duration,
    http: HttpOptions,
    teardown: Teardown,
}

impl Default for GraceServer {
    fn default() -> Self {
        Self::new(global_drain_timeout())
    }
}

impl GraceServer {
    /// Create an orchestrator. A zero `drain_timeout` waits forever.
    pub fn new(drain_timeout: Duration) -> Self {
        Self {
            drain_timeout,
            http: HttpOptions::default(),
            teardown: Teardown::default(),
        }
    }

    /// Create with the drain timeout from `GRACE_DRAIN_TIMEOUT_SECS`, or the
    /// global default when unset or invalid.
    pub fn from_env() -> Self {
        let drain_timeout = std::env::var(DRAIN_TIMEOUT_ENV)
            .ok()
            .and_then(|v| v.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or_else(global_drain_timeout);

        Self::new(drain_timeout)
    }

    /// Time allowed for clients to send request headers.
    pub fn with_header_read_timeout(mut self, timeout: Duration) -> Self {
        self.http.header_read_timeout = Some(timeout);
        self
    }

    /// Upper bound on request header size.
    pub fn with_max_header_bytes(mut self, max: usize) -> Self {
        self.http.max_header_bytes = Some(max);
        self
    }

    /// Longest a connection read may stay pending, covering the whole
    /// request as well as idle keep-alive waits.
    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.http.read_timeout = Some(timeout);
        self
    }

    /// Longest a connection write may stay pending.
    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.http.write_timeout = Some(timeout);
        self
    }

    /// How the listener is stopped when draining.
    pub fn with_teardown(mut self, teardown: Teardown) -> Self {
        self.teardown = teardown;
        self
    }

    /// The configured drain bound. Zero means unbounded.
    pub fn drain_timeout(&self) -> Duration {
        self.drain_timeout
    }

    /// Acquire a listener for `addr`, then [`serve`](GraceServer::serve).
    pub async fn listen_and_serve<S, B>(self, addr: &str, service: S) -> Result<()>
    where
        S: Service<Request<Incoming>, Response = Response<B>> + Clone + Send + 'static,
        S::Future: Send + 'static,
        S::Error: Into<BoxError>,
        B: Body + Send + 'static,
        B::Data: Send,
        B::Error: Into<BoxError>,
    {
        let listener = acquire_listener(addr).await?;
        self.serve(listener, service).await
    }

    /// Serve `service` on `listener` until a signal or a fatal error stops it.
    ///
    /// Returns `Ok(())` after a clean drain or an immediate-exit signal,
    /// [`GraceError::DrainTimeout`] if draining overran, or the first fatal
    /// error from serving or from spawning a replacement.
    pub async fn serve<L, S, B>(self, listener: L, service: S) -> Result<()>
    where
        L: GraceListener,
        S: Service<Request<Incoming>, Response = Response<B>> + Clone + Send + 'static,
        S::Future: Send + 'static,
        S::Error: Into<BoxError>,
        B: Body + Send + 'static,
        B::Data: Send,
        B::Error: Into<BoxError>,
    {
        let signals = SignalQueue::register()?;
        self.serve_with_signals(listener, service, signals).await
    }

    /// Like [`serve`](GraceServer::serve), with signals taken from `signals`.
    pub async fn serve_with_signals<L, S, B>(
        self,
        listener: L,
        service: S,
        signals: SignalQueue,
    ) -> Result<()>
    where
        L: GraceListener,
        S: Service<Request<Incoming>, Response = Response<B>> + Clone + Send + 'static,
        S::Future: Send + 'static,
        S::Error: Into<BoxError>,
        B: Body + Send + 'static,
        B::Data: Send,
        B::Error: Into<BoxError>,
    {
        let listener = Arc::new(GracefulListener::new(listener).with_teardown(self.teardown));
        let engine = Arc::new(Engine::new(self.http.clone()));

        let mut serving = tokio::spawn({
            let listener = Arc::clone(&listener);
            let engine = Arc::clone(&engine);
            async move { engine.run(listener, service).await }
        });
        info!(pid = std::process::id(), "Serving");

        if restart::is_restart() {
            if let Err(e) = restart::notify_parent() {
                warn!(error = %e, "Failed to notify parent process");
            }
        }

        let waiting = self.wait_signals(signals, &listener, &engine);
        tokio::pin!(waiting);

        tokio::select! {
            joined = &mut serving => {
                match joined.unwrap_or_else(|e| Err(join_error(e))) {
                    // The listener was closed by a drain; report its outcome.
                    Err(GraceError::AlreadyClosed) if engine.keep_alive_disabled() => waiting.await,
                    Err(GraceError::AlreadyClosed) => Ok(()),
                    Err(e) => {
                        error!(error = %e, "Serving stopped");
                        Err(e)
                    }
                    Ok(()) => Ok(()),
                }
            }
            result = &mut waiting => {
                serving.abort();
                result
            }
        }
    }

    async fn wait_signals<L: GraceListener>(
        &self,
        mut signals: SignalQueue,
        listener: &Arc<GracefulListener<L>>,
        engine: &Engine,
    ) -> Result<()> {
        loop {
            let Some(signal) = signals.recv().await else {
                debug!("Signal queue closed");
                return std::future::pending().await;
            };

            match signal.action() {
                SignalAction::Exit => {
                    drop(signals);
                    info!(inflight = listener.inflight(), "Exiting without draining");
                    return Ok(());
                }
                SignalAction::Drain => return self.drain_or_exit(signals, listener, engine).await,
                SignalAction::Reload => self.restart(listener)?,
            }
        }
    }

    /// Drain, unless an immediate-exit signal arrives first. Other signals
    /// are ignored while draining.
    async fn drain_or_exit<L: GraceListener>(
        &self,
        mut signals: SignalQueue,
        listener: &Arc<GracefulListener<L>>,
        engine: &Engine,
    ) -> Result<()> {
        let draining = self.drain(listener, engine);
        tokio::pin!(draining);

        loop {
            tokio::select! {
                result = &mut draining => return result,
                received = signals.recv() => match received {
                    Some(signal) if signal.action() == SignalAction::Exit => {
                        warn!(
                            %signal,
                            remaining = listener.inflight(),
                            "Drain interrupted, exiting without waiting"
                        );
                        return Ok(());
                    }
                    Some(signal) => debug!(%signal, "Ignoring signal while draining"),
                    None => return (&mut draining).await,
                },
            }
        }
    }

    /// Hand the listener to a new process. The new process asks for the drain
    /// once it is serving.
    fn restart<L: GraceListener>(&self, listener: &GracefulListener<L>) -> Result<()> {
        if listener.is_closed() {
            return Err(GraceError::NoListenerForRestart);
        }

        let fd = listener.get_ref().try_clone_fd().map_err(|e| {
            if is_closed_error(&e) {
                GraceError::NoListenerForRestart
            } else {
                GraceError::Io(e)
            }
        })?;
        let raw_fd = fd.as_raw_fd();

        match restart::spawn_replacement(fd) {
            Ok(pid) => {
                info!(pid, fd = raw_fd, "Replacement spawned, waiting for it to take over");
                Ok(())
            }
            Err(e) => {
                error!(error = %e, "Restart failed, still serving");
                Err(GraceError::Spawn(e))
            }
        }
    }

    /// Disable keep-alive, close the listener and wait for in-flight
    /// connections, bounded by the drain timeout.
    async fn drain<L: GraceListener>(
        &self,
        listener: &Arc<GracefulListener<L>>,
        engine: &Engine,
    ) -> Result<()> {
        engine.disable_keep_alive();
        info!(
            inflight = listener.inflight(),
            timeout = ?self.drain_timeout,
            "Draining connections"
        );

        let closing = tokio::spawn({
            let listener = Arc::clone(listener);
            async move { listener.close().await }
        });

        let closed = if self.drain_timeout.is_zero() {
            closing.await
        } else {
            match tokio::time::timeout(self.drain_timeout, closing).await {
                Ok(joined) => joined,
                Err(_) => {
                    error!(
                        remaining = listener.inflight(),
                        timeout = ?self.drain_timeout,
                        "Drain timed out, abandoning remaining connections"
                    );
                    return Err(GraceError::DrainTimeout {
                        timeout: self.drain_timeout,
                    });
                }
            }
        };

        match closed.map_err(join_error)? {
            Ok(()) => {
                info!("Drain complete");
                Ok(())
            }
            Err(e) if is_closed_error(&e) => Ok(()),
            Err(e) => Err(GraceError::Io(e)),
        }
    }
}

fn join_error(err: JoinError) -> GraceError {
    GraceError::Io(io::Error::other(err))
}
