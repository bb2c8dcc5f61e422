//! OS signal protocol.
//!
//! | Signal               | Action                                       |
//! |----------------------|----------------------------------------------|
//! | `SIGTERM`, `SIGINT`  | exit immediately, abandoning connections     |
//! | `SIGQUIT`            | drain in-flight connections, then exit       |
//! | `SIGHUP`             | spawn a replacement that inherits the socket |

use std::fmt;

use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::error::{GraceError, Result};

/// Capacity of the queue between the OS and the wait loop.
pub const SIGNAL_QUEUE_DEPTH: usize = 6;

/// A signal recognised by the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// `SIGTERM`
    Terminate,
    /// `SIGINT`
    Interrupt,
    /// `SIGQUIT`
    Quit,
    /// `SIGHUP`
    Hangup,
}

/// What the orchestrator does in response to a [`Signal`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalAction {
    /// Stop without draining.
    Exit,
    /// Drain in-flight connections, then stop.
    Drain,
    /// Spawn a replacement process and keep serving.
    Reload,
}

impl Signal {
    /// The fixed action for this signal.
    pub fn action(self) -> SignalAction {
        match self {
            Signal::Terminate | Signal::Interrupt => SignalAction::Exit,
            Signal::Quit => SignalAction::Drain,
            Signal::Hangup => SignalAction::Reload,
        }
    }

    /// The OS signal number.
    pub fn as_raw(self) -> libc::c_int {
        match self {
            Signal::Terminate => libc::SIGTERM,
            Signal::Interrupt => libc::SIGINT,
            Signal::Quit => libc::SIGQUIT,
            Signal::Hangup => libc::SIGHUP,
        }
    }
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Signal::Terminate => "SIGTERM",
            Signal::Interrupt => "SIGINT",
            Signal::Quit => "SIGQUIT",
            Signal::Hangup => "SIGHUP",
        };
        f.write_str(name)
    }
}

/// Bounded queue of delivered signals.
///
/// Dropping the queue stops watching.
#[derive(Debug)]
pub struct SignalQueue {
    rx: mpsc::Receiver<Signal>,
    forwarder: Option<JoinHandle<()>>,
}

impl SignalQueue {
    /// Register handlers for the OS signals of the protocol.
    ///
    /// Must be called from within a tokio runtime. Handlers are installed
    /// before this returns, so no signal delivered afterwards is lost.
    pub fn register() -> Result<Self> {
        let mut terminate = signal(SignalKind::terminate()).map_err(GraceError::Signal)?;
        let mut interrupt = signal(SignalKind::interrupt()).map_err(GraceError::Signal)?;
        let mut quit = signal(SignalKind::quit()).map_err(GraceError::Signal)?;
        let mut hangup = signal(SignalKind::hangup()).map_err(GraceError::Signal)?;

        let (tx, rx) = mpsc::channel(SIGNAL_QUEUE_DEPTH);
        let forwarder = tokio::spawn(async move {
            loop {
                let received = tokio::select! {
                    Some(()) = terminate.recv() => Signal::Terminate,
                    Some(()) = interrupt.recv() => Signal::Interrupt,
                    Some(()) = quit.recv() => Signal::Quit,
                    Some(()) = hangup.recv() => Signal::Hangup,
                    else => break,
                };

                debug!(signal = %received, "Signal delivered");
                if tx.send(received).await.is_err() {
                    break;
                }
            }
        });

        Ok(Self {
            rx,
            forwarder: Some(forwarder),
        })
    }

    /// A queue fed by the returned sender instead of the OS.
    pub fn channel() -> (mpsc::Sender<Signal>, Self) {
        let (tx, rx) = mpsc::channel(SIGNAL_QUEUE_DEPTH);
        (tx, Self { rx, forwarder: None })
    }

    /// Wait for the next signal. `None` once no more signals can arrive.
    pub async fn recv(&mut self) -> Option<Signal> {
        let signal = self.rx.recv().await?;
        info!(%signal, action = ?signal.action(), "Received signal");
        Some(signal)
    }
}

impl Drop for SignalQueue {
    fn drop(&mut self) {
        if let Some(forwarder) = self.forwarder.take() {
            forwarder.abort();
        }
    }
}
