//! HTTP/1 serving loop over a [`GracefulListener`].
//!
//! Every accepted connection is driven by hyper in its own task. When
//! keep-alive is disabled, live connections finish their current request
//! and close. A connection that has not sent its first request yet still
//! gets that request served.

use std::io;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use hyper::body::{Body, Incoming};
use hyper::server::conn::http1;
use hyper::{Request, Response};
use hyper_util::rt::{TokioIo, TokioTimer};
use hyper_util::service::TowerToHyperService;
use tokio_util::sync::CancellationToken;
use tower::Service;
use tracing::{debug, warn};

use crate::error::{GraceError, Result};
use crate::graceful::{GracefulListener, TrackedConnection};
use crate::listener::GraceListener;
use crate::timeout::TimeoutIo;

/// Boxed error accepted from services and bodies.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Smallest read buffer hyper accepts.
const MIN_BUF_SIZE: usize = 8192;

const MIN_ACCEPT_BACKOFF: Duration = Duration::from_millis(5);
const MAX_ACCEPT_BACKOFF: Duration = Duration::from_secs(1);

/// Per-connection HTTP settings.
#[derive(Debug, Clone, Default)]
pub struct HttpOptions {
    /// Time allowed for a client to send the request headers.
    pub header_read_timeout: Option<Duration>,
    /// Longest a read from the connection may stay pending, idle keep-alive
    /// waits included.
    pub read_timeout: Option<Duration>,
    /// Longest a write to the connection may stay pending.
    pub write_timeout: Option<Duration>,
    /// Upper bound on the read buffer, which bounds header size.
    pub max_header_bytes: Option<usize>,
}

/// The request-serving engine shared by the accept loop and the drain.
#[derive(Debug)]
pub(crate) struct Engine {
    options: HttpOptions,
    keep_alive_off: CancellationToken,
}

impl Engine {
    pub(crate) fn new(options: HttpOptions) -> Self {
        Self {
            options,
            keep_alive_off: CancellationToken::new(),
        }
    }

    /// Tell every live connection to close after its current request, and
    /// serve new ones without keep-alive.
    pub(crate) fn disable_keep_alive(&self) {
        self.keep_alive_off.cancel();
    }

    pub(crate) fn keep_alive_disabled(&self) -> bool {
        self.keep_alive_off.is_cancelled()
    }

    fn builder(&self) -> http1::Builder {
        let mut builder = http1::Builder::new();
        builder
            .timer(TokioTimer::new())
            .keep_alive(!self.keep_alive_disabled());
        if let Some(timeout) = self.options.header_read_timeout {
            builder.header_read_timeout(timeout);
        }
        if let Some(max) = self.options.max_header_bytes {
            builder.max_buf_size(max.max(MIN_BUF_SIZE));
        }
        builder
    }

    /// Accept and serve connections until the listener is closed or fails.
    ///
    /// Transient accept errors are retried with exponential backoff.
    pub(crate) async fn run<L, S, B>(
        &self,
        listener: Arc<GracefulListener<L>>,
        service: S,
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
        let mut backoff: Option<Duration> = None;

        loop {
            let conn = match listener.accept().await {
                Ok(conn) => {
                    backoff = None;
                    conn
                }
                Err(GraceError::Io(e)) if is_transient(&e) => {
                    let delay = backoff.map_or(MIN_ACCEPT_BACKOFF, |d| (d * 2).min(MAX_ACCEPT_BACKOFF));
                    backoff = Some(delay);
                    warn!(error = %e, retry_in = ?delay, "Accept error, retrying");
                    tokio::time::sleep(delay).await;
                    continue;
                }
                Err(e) => return Err(e),
            };

            let builder = self.builder();
            let conn = TimeoutIo::new(conn, self.options.read_timeout, self.options.write_timeout);
            let started = CancellationToken::new();
            let service = TowerToHyperService::new(FirstRequest {
                inner: service.clone(),
                started: started.clone(),
            });
            let keep_alive_off = self.keep_alive_off.clone();
            tokio::spawn(serve_connection(builder, conn, service, keep_alive_off, started));
        }
    }
}

/// Marks the connection as started once hyper hands over its first request.
#[derive(Debug, Clone)]
struct FirstRequest<S> {
    inner: S,
    started: CancellationToken,
}

impl<S, R> Service<R> for FirstRequest<S>
where
    S: Service<R>,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = S::Future;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<std::result::Result<(), S::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: R) -> Self::Future {
        self.started.cancel();
        self.inner.call(req)
    }
}

/// Resolves once the connection should stop after its current request.
///
/// A connection that has not delivered a request yet is left alone until it
/// does, bounded by the read timeouts and the drain timeout.
async fn shutdown_requested(keep_alive_off: &CancellationToken, started: &CancellationToken) {
    keep_alive_off.cancelled().await;
    started.cancelled().await;
}

async fn serve_connection<C, S, B>(
    builder: http1::Builder,
    conn: TimeoutIo<TrackedConnection<C>>,
    service: TowerToHyperService<FirstRequest<S>>,
    keep_alive_off: CancellationToken,
    started: CancellationToken,
) where
    C: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
    S: Service<Request<Incoming>, Response = Response<B>> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Error: Into<BoxError>,
    B: Body + Send + 'static,
    B::Data: Send,
    B::Error: Into<BoxError>,
{
    let connection = builder.serve_connection(TokioIo::new(conn), service);
    tokio::pin!(connection);

    let served = tokio::select! {
        served = connection.as_mut() => served,
        _ = shutdown_requested(&keep_alive_off, &started) => {
            connection.as_mut().graceful_shutdown();
            connection.await
        }
    };

    if let Err(e) = served {
        debug!(error = %e, "Connection ended with error");
    }
}

/// Accept errors that say nothing about the listener itself.
fn is_transient(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::Interrupted
            | io::ErrorKind::TimedOut
            | io::ErrorKind::WouldBlock
    ) || matches!(
        err.raw_os_error(),
        Some(libc::EMFILE | libc::ENFILE | libc::ENOBUFS | libc::ENOMEM)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_errors() {
        assert!(is_transient(&io::Error::from(io::ErrorKind::ConnectionAborted)));
        assert!(is_transient(&io::Error::from_raw_os_error(libc::EMFILE)));
        assert!(!is_transient(&io::Error::from(io::ErrorKind::PermissionDenied)));
        assert!(!is_transient(&io::Error::from_raw_os_error(libc::EBADF)));
    }

    #[test]
    fn test_keep_alive_toggle() {
        let engine = Engine::new(HttpOptions {
            header_read_timeout: Some(Duration::from_secs(5)),
            max_header_bytes: Some(1024),
            ..HttpOptions::default()
        });
        assert!(!engine.keep_alive_disabled());
        let _ = engine.builder();

        engine.disable_keep_alive();
        assert!(engine.keep_alive_disabled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_waits_for_first_request() {
        let keep_alive_off = CancellationToken::new();
        let started = CancellationToken::new();
        keep_alive_off.cancel();

        let waiting = tokio::spawn({
            let keep_alive_off = keep_alive_off.clone();
            let started = started.clone();
            async move { shutdown_requested(&keep_alive_off, &started).await }
        });
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(!waiting.is_finished());

        let mut service = FirstRequest {
            inner: tower::service_fn(|n: u32| async move { Ok::<_, std::convert::Infallible>(n + 1) }),
            started: started.clone(),
        };
        assert_eq!(service.call(1).await.unwrap(), 2);
        assert!(started.is_cancelled());
        waiting.await.unwrap();
    }
}
