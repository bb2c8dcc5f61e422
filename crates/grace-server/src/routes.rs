//! HTTP routes.

use axum::extract::Request;
use axum::routing::{any, get};
use axum::Router;

/// `/` greets with the pid of the serving process; `/ctrl` is the control
/// endpoint.
pub fn create_router() -> Router {
    Router::new()
        .route("/", get(home_handler))
        .route("/ctrl", any(control_handler))
}

async fn home_handler() -> String {
    format!("Welcome to the home page! {}", std::process::id())
}

async fn control_handler(req: Request) -> impl axum::response::IntoResponse {
    grace::control_handler(req).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use tower::ServiceExt;

    #[tokio::test]
    async fn test_home_reports_pid() {
        let response = create_router()
            .oneshot(axum::http::Request::get("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(
            String::from_utf8(body.to_vec()).unwrap(),
            format!("Welcome to the home page! {}", std::process::id())
        );
    }

    #[tokio::test]
    async fn test_ctrl_ignores_unknown_action() {
        let response = create_router()
            .oneshot(axum::http::Request::get("/ctrl?action=noop").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], b"noop success");
    }
}
