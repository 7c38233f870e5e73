//! Prometheus metrics endpoint.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;

use crate::AppState;

/// GET /metrics: returns Prometheus-formatted metrics.
pub async fn get(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    metrics::gauge!("channel_in_flight").set(state.channel.in_flight() as f64);
    metrics::gauge!("channel_dead_letters").set(state.channel.dead_letters().await.len() as f64);

    (
        StatusCode::OK,
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        state.metrics.render(),
    )
}
