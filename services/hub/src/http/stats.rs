//! Read-only stats endpoints for the registry and the broadcast queue.

use crate::state::AppState;
use axum::{extract::State, Json};
use serde::Serialize;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionStatsResponse {
    pub total_connections: usize,
    pub unique_users: usize,
    pub average_subscriptions: f64,
}

pub async fn get_stats(State(state): State<AppState>) -> Json<ConnectionStatsResponse> {
    let stats = state.registry.stats().await;
    Json(ConnectionStatsResponse {
        total_connections: stats.total,
        unique_users: stats.unique_identities,
        average_subscriptions: stats.average_subscriptions,
    })
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStatsResponse {
    pub length: usize,
    pub is_processing: bool,
}

pub async fn get_queue(State(state): State<AppState>) -> Json<QueueStatsResponse> {
    let stats = state.scheduler.queue_stats();
    Json(QueueStatsResponse {
        length: stats.length,
        is_processing: stats.is_processing,
    })
}
