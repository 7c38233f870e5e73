//! Saga inspection endpoint.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, State};
use common::CorrelationId;
use saga::order_fulfillment;
use saga::{SagaInstance, SagaStatus, StepLogEntry};
use serde::Serialize;

use crate::AppState;
use crate::error::ApiError;

#[derive(Serialize)]
pub struct SagaResponse {
    pub correlation_id: String,
    pub saga_type: String,
    pub status: SagaStatus,
    pub completed_steps: Vec<String>,
    pub compensated_steps: Vec<String>,
    pub failure_reason: Option<String>,
    pub entries: Vec<StepLogEntry>,
}

/// GET /sagas/{id}: derived status and step log entries of a saga.
#[tracing::instrument(skip(state))]
pub async fn get(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<SagaResponse>, ApiError> {
    let correlation_id = CorrelationId::from(id);
    let saga = SagaInstance::load(
        state.step_log.as_ref(),
        &order_fulfillment::definition(),
        &correlation_id,
    )
    .await?;

    if saga.is_empty() {
        return Err(ApiError::NotFound(format!(
            "Saga {correlation_id} not found"
        )));
    }

    Ok(Json(SagaResponse {
        correlation_id: correlation_id.into_inner(),
        saga_type: saga.saga_type().to_string(),
        status: saga.status().clone(),
        completed_steps: saga.completed_steps().into_iter().map(String::from).collect(),
        compensated_steps: saga
            .compensated_steps()
            .into_iter()
            .map(String::from)
            .collect(),
        failure_reason: saga.failure_reason(),
        entries: saga.entries().to_vec(),
    }))
}
