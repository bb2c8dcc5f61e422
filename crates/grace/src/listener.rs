//! Listener capabilities and listener acquisition.
//!
//! A [`GraceListener`] is anything that can accept connections, be closed,
//! have its pending accepts interrupted by a deadline, and hand out a
//! duplicate of its OS descriptor. [`TcpGraceListener`] is the TCP
//! implementation used by [`acquire_listener`], which either adopts the
//! descriptor inherited from the parent process or binds a fresh socket.

use std::borrow::Cow;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::os::unix::io::{AsFd, FromRawFd, OwnedFd, RawFd};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{GraceError, Result};
use crate::restart;

/// Descriptor slot the listener occupies in a restarted child: the first
/// one after stdin, stdout and stderr.
pub const INHERITED_FD: RawFd = 3;

/// The capabilities a listener needs to take part in a graceful handover.
pub trait GraceListener: Send + Sync + 'static {
    /// Connection type produced by [`accept`](GraceListener::accept).
    type Conn: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    /// Wait for the next connection.
    ///
    /// After [`close`](GraceListener::close) this fails with an error for
    /// which [`is_closed_error`] holds. After the deadline set by
    /// [`set_deadline`](GraceListener::set_deadline) passes it fails with
    /// [`io::ErrorKind::TimedOut`].
    fn accept(&self) -> impl Future<Output = io::Result<Self::Conn>> + Send;

    /// Close the listener, waking any pending accept.
    fn close(&self) -> io::Result<()>;

    /// Make pending and future accepts fail once `deadline` has passed,
    /// without closing the socket.
    fn set_deadline(&self, deadline: Instant) -> io::Result<()>;

    /// Duplicate the underlying OS descriptor.
    fn try_clone_fd(&self) -> io::Result<OwnedFd>;
}

/// Error returned by a listener that has been closed.
pub(crate) fn closed_error() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "use of closed network listener")
}

/// Whether an accept error means the socket has been closed.
pub fn is_closed_error(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::NotConnected || err.raw_os_error() == Some(libc::EBADF)
}

/// Whether an accept error is a deadline expiry.
pub fn is_timeout_error(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::TimedOut
}

/// TCP listener with close and deadline support usable from shared references.
#[derive(Debug)]
pub struct TcpGraceListener {
    listener: Mutex<Option<Arc<TcpListener>>>,
    closed: CancellationToken,
    deadline: watch::Sender<Option<Instant>>,
    local_addr: SocketAddr,
}

impl TcpGraceListener {
    /// Wrap a bound tokio listener.
    pub fn new(listener: TcpListener) -> io::Result<Self> {
        let local_addr = listener.local_addr()?;
        let (deadline, _) = watch::channel(None);

        Ok(Self {
            listener: Mutex::new(Some(Arc::new(listener))),
            closed: CancellationToken::new(),
            deadline,
            local_addr,
        })
    }

    /// Wrap a std listener, switching it to non-blocking mode.
    ///
    /// Must be called from within a tokio runtime.
    pub fn from_std(listener: std::net::TcpListener) -> io::Result<Self> {
        listener.set_nonblocking(true)?;
        Self::new(TcpListener::from_std(listener)?)
    }

    /// Address the socket is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    fn current(&self) -> io::Result<Arc<TcpListener>> {
        self.listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or_else(closed_error)
    }
}

impl GraceListener for TcpGraceListener {
    type Conn = TcpStream;

    async fn accept(&self) -> io::Result<TcpStream> {
        let listener = self.current()?;
        let deadline = self.deadline.subscribe();

        tokio::select! {
            biased;
            _ = self.closed.cancelled() => Err(closed_error()),
            _ = deadline_expired(deadline) => Err(io::Error::new(
                io::ErrorKind::TimedOut,
                "accept deadline exceeded",
            )),
            accepted = listener.accept() => {
                let (stream, peer) = accepted?;
                debug!(%peer, "Accepted connection");
                Ok(stream)
            }
        }
    }

    fn close(&self) -> io::Result<()> {
        let taken = self
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        self.closed.cancel();

        match taken {
            Some(_) => Ok(()),
            None => Err(closed_error()),
        }
    }

    fn set_deadline(&self, deadline: Instant) -> io::Result<()> {
        if self.closed.is_cancelled() {
            return Err(closed_error());
        }
        self.deadline.send_replace(Some(deadline));
        Ok(())
    }

    fn try_clone_fd(&self) -> io::Result<OwnedFd> {
        self.current()?.as_fd().try_clone_to_owned()
    }
}

/// Resolves once the watched deadline has passed.
async fn deadline_expired(mut deadline: watch::Receiver<Option<Instant>>) {
    loop {
        let current = *deadline.borrow_and_update();
        let expiry = async move {
            match current {
                Some(at) => tokio::time::sleep_until(at.into()).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            _ = expiry => return,
            changed = deadline.changed() => {
                if changed.is_err() {
                    return std::future::pending().await;
                }
            }
        }
    }
}

/// Acquire the listener for `addr`.
///
/// A child started by a live restart adopts the descriptor at
/// [`INHERITED_FD`]. Any other process, or a child whose descriptor turns
/// out to be unusable, binds `addr` afresh.
pub async fn acquire_listener(addr: &str) -> Result<TcpGraceListener> {
    if restart::is_restart() {
        match inherit(INHERITED_FD) {
            Ok(listener) => {
                info!(
                    fd = INHERITED_FD,
                    addr = %listener.local_addr(),
                    "Inherited listener from parent process"
                );
                return Ok(listener);
            }
            Err(e) => {
                warn!(fd = INHERITED_FD, error = %e, "Could not inherit listener, binding fresh");
            }
        }
    }

    bind(addr).await
}

/// Resolve `addr` and bind a new listener on it.
pub(crate) async fn bind(addr: &str) -> Result<TcpGraceListener> {
    let resolved: Vec<SocketAddr> = tokio::net::lookup_host(normalize_addr(addr).as_ref())
        .await
        .map_err(|source| GraceError::Resolve {
            addr: addr.to_string(),
            source,
        })?
        .collect();

    if resolved.is_empty() {
        return Err(GraceError::Resolve {
            addr: addr.to_string(),
            source: io::Error::new(io::ErrorKind::NotFound, "no addresses found"),
        });
    }

    let listener = TcpListener::bind(resolved.as_slice())
        .await
        .and_then(TcpGraceListener::new)
        .map_err(|source| GraceError::Bind {
            addr: addr.to_string(),
            source,
        })?;

    info!(addr = %listener.local_addr(), "Bound fresh listener");
    Ok(listener)
}

/// A host-less address such as `":8080"` means every IPv4 interface.
fn normalize_addr(addr: &str) -> Cow<'_, str> {
    if addr.starts_with(':') {
        Cow::Owned(format!("0.0.0.0{addr}"))
    } else {
        Cow::Borrowed(addr)
    }
}

/// Adopt an inherited listening socket.
pub(crate) fn inherit(fd: RawFd) -> io::Result<TcpGraceListener> {
    if !is_socket(fd) {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("inherited fd {fd} is not a socket"),
        ));
    }

    // SAFETY: fd was checked to be an open socket and was handed to this
    // process for its exclusive use by the parent.
    let listener = unsafe { std::net::TcpListener::from_raw_fd(fd) };
    TcpGraceListener::from_std(listener)
}

fn is_socket(fd: RawFd) -> bool {
    let mut stat: libc::stat = unsafe { std::mem::zeroed() };
    if unsafe { libc::fstat(fd, &mut stat) } != 0 {
        return false;
    }
    (stat.st_mode & libc::S_IFMT) == libc::S_IFSOCK
}
