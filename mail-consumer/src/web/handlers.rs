//! Health endpoint handlers.

use std::sync::Arc;

use axum::{extract::State, Json};
use serde::Serialize;

use crate::consumer::{QueueStats, QueueStatsSnapshot};

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub stats: Arc<Vec<Arc<QueueStats>>>,
}

impl AppState {
    pub fn new(stats: Vec<Arc<QueueStats>>) -> Self {
        Self {
            stats: Arc::new(stats),
        }
    }
}

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub queues: Vec<QueueStatsSnapshot>,
}

/// Health check endpoint.
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        queues: state.stats.iter().map(|s| s.snapshot()).collect(),
    })
}
