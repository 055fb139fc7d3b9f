pub mod cli;
pub mod config;
pub mod handlers;
pub mod websocket;

use axum::{routing::get, Router};
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::handlers::{health_check, list_peers, peer_status};
use crate::websocket::{websocket_handler, SignalingState};

pub fn app(state: SignalingState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/peers", get(list_peers))
        .route("/peers/:code", get(peer_status))
        .route("/ws", get(websocket_handler))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

/// Serve until the listener fails. The websocket route needs the peer
/// address, so the app is served with connect info.
pub async fn serve(listener: TcpListener, state: SignalingState) -> std::io::Result<()> {
    axum::serve(
        listener,
        app(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use serde_json::Value;
    use tower::ServiceExt;

    async fn get_json(state: &SignalingState, uri: &str) -> (StatusCode, Value) {
        let response = app(state.clone())
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&body).unwrap())
    }

    #[test_timeout::tokio_timeout_test]
    async fn health_and_peer_lookups() {
        let state = SignalingState::new(&Config::default());

        let (status, body) = get_json(&state, "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, serde_json::json!({"status": "ok", "peers": 0}));

        let (status, body) = get_json(&state, "/peers").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, serde_json::json!({"peers": []}));

        let (status, body) = get_json(&state, "/peers/7f3k2q").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["peer_id"], "7F3K2Q");
        assert_eq!(body["online"], false);

        let (status, _) = get_json(&state, "/peers/bad-code").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }
}
