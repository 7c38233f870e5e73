//! Health check endpoint.

use std::sync::Arc;

use axum::Json;
use axum::extract::State;
use serde::Serialize;

use crate::AppState;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    /// Deliveries queued or being handled.
    pub in_flight: usize,
    pub dead_letters: usize,
}

/// GET /health: returns system health status.
pub async fn check(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        in_flight: state.channel.in_flight(),
        dead_letters: state.channel.dead_letters().await.len(),
    })
}
