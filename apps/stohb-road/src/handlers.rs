use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde::Serialize;
use serde_json::json;
use stohb_core::identity::PeerCode;
use tracing::debug;

use crate::websocket::SignalingState;

#[derive(Debug, Serialize)]
pub struct HealthStatus {
    status: &'static str,
    peers: usize,
}

pub async fn health_check(State(state): State<SignalingState>) -> Json<HealthStatus> {
    Json(HealthStatus {
        status: "ok",
        peers: state.peer_count(),
    })
}

#[derive(Debug, Serialize)]
pub struct PeerList {
    peers: Vec<PeerCode>,
}

/// Registered codes, for discovery
pub async fn list_peers(State(state): State<SignalingState>) -> Json<PeerList> {
    Json(PeerList {
        peers: state.peer_codes(),
    })
}

pub async fn peer_status(
    Path(raw): Path<String>,
    State(state): State<SignalingState>,
) -> Response {
    let code = match PeerCode::parse(&raw) {
        Ok(code) => code,
        Err(err) => {
            debug!("rejecting peer lookup for {:?}: {}", raw, err);
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({ "error": err.to_string() })),
            )
                .into_response();
        }
    };
    if state.is_registered(&code) {
        Json(json!({ "peer_id": code, "online": true })).into_response()
    } else {
        (
            StatusCode::NOT_FOUND,
            Json(json!({ "peer_id": code, "online": false })),
        )
            .into_response()
    }
}
