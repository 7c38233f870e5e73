//! Order placement and lookup endpoints.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use common::CorrelationId;
use saga::order_fulfillment::{self, place_order};
use saga::{LineItem, Order, OrderStatus, SagaInstance, SagaStatus};
use serde::{Deserialize, Serialize};

use crate::AppState;
use crate::error::ApiError;

// -- Request types --

#[derive(Deserialize)]
pub struct PlaceOrderRequest {
    /// Client-chosen order id; generated when absent.
    pub order_id: Option<String>,
    pub customer_id: String,
    pub items: Vec<OrderItemRequest>,
}

#[derive(Deserialize)]
pub struct OrderItemRequest {
    pub sku: String,
    pub quantity: u32,
    pub unit_price_cents: i64,
}

// -- Response types --

#[derive(Serialize)]
pub struct OrderAcceptedResponse {
    pub order_id: String,
    pub status: OrderStatus,
}

#[derive(Serialize)]
pub struct OrderResponse {
    #[serde(flatten)]
    pub order: Order,
    /// Status of the order's fulfillment saga.
    pub saga: SagaStatus,
}

// -- Handlers --

/// POST /orders: record an order and start its fulfillment saga.
///
/// The saga runs asynchronously; poll `GET /orders/{id}` for the outcome.
#[tracing::instrument(skip(state, req))]
pub async fn create(
    State(state): State<Arc<AppState>>,
    Json(req): Json<PlaceOrderRequest>,
) -> Result<(StatusCode, Json<OrderAcceptedResponse>), ApiError> {
    let items = req
        .items
        .into_iter()
        .map(|item| LineItem::new(item.sku, item.quantity, item.unit_price_cents))
        .collect();
    let order = match req.order_id {
        Some(id) if id.trim().is_empty() => {
            return Err(ApiError::BadRequest("order_id must not be blank".into()));
        }
        Some(id) => Order::with_id(CorrelationId::from(id), req.customer_id, items),
        None => Order::new(req.customer_id, items),
    };

    let order = place_order(&state.channel, state.orders.as_ref(), order).await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(OrderAcceptedResponse {
            order_id: order.order_id.into_inner(),
            status: order.status,
        }),
    ))
}

/// GET /orders/{id}: the order record with its derived saga status.
#[tracing::instrument(skip(state))]
pub async fn get(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<OrderResponse>, ApiError> {
    let order_id = CorrelationId::from(id);
    let order = state
        .orders
        .get(&order_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Order {order_id} not found")))?;

    let saga = SagaInstance::load(
        state.step_log.as_ref(),
        &order_fulfillment::definition(),
        &order_id,
    )
    .await?;

    Ok(Json(OrderResponse {
        order,
        saga: saga.status().clone(),
    }))
}
