//! Privileged broadcast endpoint (shared-secret bearer).

use crate::auth::authorize_admin;
use crate::state::AppState;
use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use pulse_protocol::{error_codes, ErrorData, MessageType, Priority, ServerEvent};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

#[derive(Debug, Deserialize)]
pub struct BroadcastRequest {
    #[serde(rename = "type")]
    pub kind: MessageType,
    pub event: ServerEvent,
    #[serde(default)]
    pub data: Value,
    #[serde(default)]
    pub priority: Priority,
}

#[derive(Debug, Serialize)]
pub struct BroadcastResponse {
    pub accepted: bool,
}

pub async fn post_broadcast(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<BroadcastRequest>,
) -> Response {
    if !authorize_admin(&headers, state.config.server.admin_token.as_deref()) {
        return error_response(
            StatusCode::UNAUTHORIZED,
            error_codes::UNAUTHORIZED,
            "missing or invalid bearer token",
        );
    }
    if request.kind.is_reserved() || request.kind == MessageType::All {
        return error_response(
            StatusCode::BAD_REQUEST,
            error_codes::INVALID_TYPE,
            "type is not broadcastable",
        );
    }

    info!(kind = %request.kind.as_str(), event = ?request.event, "admin broadcast");
    let accepted = state
        .scheduler
        .broadcast(request.kind, request.event, request.data, request.priority);
    (StatusCode::ACCEPTED, Json(BroadcastResponse { accepted })).into_response()
}

fn error_response(status: StatusCode, code: &str, message: &str) -> Response {
    (
        status,
        Json(ErrorData {
            code: code.to_owned(),
            message: message.to_owned(),
        }),
    )
        .into_response()
}
