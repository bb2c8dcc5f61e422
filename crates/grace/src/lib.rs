//! # grace
//!
//! Zero-downtime restart and graceful shutdown for a listening socket.
//!
//! ## Overview
//!
//! A restart hands the open listener to a new process instead of rebinding:
//! 1. The old process spawns its own binary again with the listener at fd 3
//!    and `GRACE_RESTART=1` in the environment
//! 2. The new process adopts fd 3 and starts accepting immediately
//! 3. The new process sends `SIGQUIT` to the old one
//! 4. The old process stops accepting, drains in-flight connections (or
//!    gives up after the drain timeout) and exits
//!
//! ## Signal Conventions
//!
//! - `SIGTERM`, `SIGINT`: exit immediately, without draining
//! - `SIGQUIT`: graceful stop (drain connections, then exit)
//! - `SIGHUP`: graceful restart (spawn a replacement that inherits the listener)
//!
//! ## Environment Variables
//!
//! - `GRACE_RESTART`: set to `1` in processes spawned by a restart
//! - `GRACE_DRAIN_TIMEOUT_SECS`: drain timeout for [`GraceServer::from_env`]
//!
//! ## Example
//!
//! ```no_run
//! # async fn run<S>(service: S) -> grace::Result<()>
//! # where
//! #     S: tower::Service<
//! #             hyper::Request<hyper::body::Incoming>,
//! #             Response = hyper::Response<http_body_util::Full<hyper::body::Bytes>>,
//! #             Error = std::convert::Infallible,
//! #         > + Clone + Send + 'static,
//! #     S::Future: Send + 'static,
//! # {
//! let listener = grace::acquire_listener(":8080").await?;
//! grace::GraceServer::new(std::time::Duration::from_secs(30))
//!     .serve(listener, service)
//!     .await
//! # }
//! ```
//!
//! ## Platform
//!
//! This crate requires Unix (Linux / macOS). It will not compile on other platforms.

#[cfg(not(unix))]
compile_error!("grace requires a Unix platform (Linux or macOS)");

mod control;
mod error;
mod graceful;
mod http;
mod listener;
mod restart;
mod server;
mod signals;
mod timeout;

pub use control::{control_handler, ControlAction};
pub use error::{GraceError, Result};
pub use graceful::{GracefulListener, InFlight, Teardown, TrackedConnection};
pub use http::{BoxError, HttpOptions};
pub use listener::{
    acquire_listener, is_closed_error, is_timeout_error, GraceListener, TcpGraceListener,
    INHERITED_FD,
};
pub use restart::{is_restart, notify_parent, parent_is_init, spawn_replacement, RESTART_ENV};
pub use server::{
    global_drain_timeout, listen_and_serve, serve, set_global_drain_timeout, GraceServer,
    DRAIN_TIMEOUT_ENV,
};
pub use signals::{Signal, SignalAction, SignalQueue, SIGNAL_QUEUE_DEPTH};
