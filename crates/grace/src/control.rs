//! HTTP control endpoint.
//!
//! Lets tooling trigger the same transitions as the OS signals:
//! `?action=restart` sends `SIGHUP` to this process, `?action=stop` sends
//! `SIGQUIT`. Other actions are accepted and ignored.

use std::fmt;
use std::io;

use http_body_util::{BodyExt, Full};
use hyper::body::{Body, Bytes};
use hyper::header::CONTENT_TYPE;
use hyper::{Method, Request, Response};
use tracing::{info, warn};

use crate::restart::send_signal;
use crate::signals::Signal;

/// An action understood by [`control_handler`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlAction {
    /// Spawn a replacement process.
    Restart,
    /// Drain and stop.
    Stop,
}

impl ControlAction {
    /// Parse the `action` parameter.
    pub fn parse(action: &str) -> Option<Self> {
        match action {
            "restart" => Some(ControlAction::Restart),
            "stop" => Some(ControlAction::Stop),
            _ => None,
        }
    }

    /// Signal sent to this process for the action.
    pub fn signal(self) -> Signal {
        match self {
            ControlAction::Restart => Signal::Hangup,
            ControlAction::Stop => Signal::Quit,
        }
    }

    /// Send the action's signal to this process.
    pub fn trigger(self) -> io::Result<()> {
        let pid = std::process::id() as libc::pid_t;
        send_signal(pid, self.signal().as_raw())
    }
}

/// Handle a control request.
///
/// The `action` is read from the query string and, for form-encoded
/// `POST`, `PUT` and `PATCH` requests, from the body, which takes precedence.
/// The response body is `"<action> success"` or the error message.
pub async fn control_handler<B>(req: Request<B>) -> Response<Full<Bytes>>
where
    B: Body,
    B::Error: fmt::Display,
{
    let (parts, body) = req.into_parts();
    let mut action = parts
        .uri
        .query()
        .and_then(|query| form_value(query.as_bytes(), "action"));

    let has_form_body = matches!(parts.method, Method::POST | Method::PUT | Method::PATCH)
        && parts
            .headers
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.starts_with("application/x-www-form-urlencoded"));

    if has_form_body {
        match body.collect().await {
            Ok(collected) => {
                if let Some(from_body) = form_value(&collected.to_bytes(), "action") {
                    action = Some(from_body);
                }
            }
            Err(e) => return text(e.to_string()),
        }
    }

    let action = action.unwrap_or_default();
    let triggered = match ControlAction::parse(&action) {
        Some(control) => {
            info!(action = ?control, "Control endpoint triggered");
            control.trigger()
        }
        None => Ok(()),
    };

    match triggered {
        Ok(()) => text(format!("{action} success")),
        Err(e) => {
            warn!(%action, error = %e, "Control action failed");
            text(e.to_string())
        }
    }
}

fn form_value(input: &[u8], key: &str) -> Option<String> {
    url::form_urlencoded::parse(input)
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.into_owned())
}

fn text(body: String) -> Response<Full<Bytes>> {
    Response::new(Full::new(Bytes::from(body)))
}
