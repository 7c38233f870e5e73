//! Circuit breaker inspection endpoint.

use std::sync::Arc;

use axum::Json;
use axum::extract::State;
use circuit_breaker::BreakerSnapshot;

use crate::AppState;

/// GET /breakers: current state of every breaker created so far.
pub async fn list(State(state): State<Arc<AppState>>) -> Json<Vec<BreakerSnapshot>> {
    Json(state.breakers.snapshots())
}
