pub mod auth;
pub mod config;
pub mod detector;
pub mod history;
pub mod http;
pub mod registry;
pub mod router;
pub mod sampler;
pub mod scheduler;
pub mod state;
pub mod ws_client;
pub mod ws_common;

pub use state::AppState;

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::trace::TraceLayer;

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_client::ws_hub_handler))
        .route("/healthz", get(health::healthz))
        .route("/readyz", get(health::readyz))
        .route("/api/v1/stats", get(http::stats::get_stats))
        .route("/api/v1/queue", get(http::stats::get_queue))
        .route("/api/v1/broadcast", post(http::broadcast::post_broadcast))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

mod health {
    use axum::response::IntoResponse;
    pub async fn healthz() -> impl IntoResponse {
        "ok"
    }
    pub async fn readyz() -> impl IntoResponse {
        "ok"
    }
}
