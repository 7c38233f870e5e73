//! Order store trait and in-memory implementation.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::CorrelationId;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::events::LineItem;

/// Lifecycle of an order as seen by the orders service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    /// Placed; the saga is running.
    Pending,
    Confirmed,
    /// The saga failed and every completed step was undone.
    Cancelled,
    /// Compensation gave up; an operator has to step in.
    RequiresIntervention,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "PENDING",
            OrderStatus::Confirmed => "CONFIRMED",
            OrderStatus::Cancelled => "CANCELLED",
            OrderStatus::RequiresIntervention => "REQUIRES_INTERVENTION",
        }
    }

    /// Returns true if the order can no longer change.
    pub fn is_final(&self) -> bool {
        !matches!(self, OrderStatus::Pending)
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An order; its id doubles as the saga correlation id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    pub order_id: CorrelationId,
    pub customer_id: String,
    pub items: Vec<LineItem>,
    pub total_cents: i64,
    pub status: OrderStatus,
    /// Why the order was cancelled or needs intervention.
    pub reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Order {
    /// Creates a pending order with a fresh id.
    pub fn new(customer_id: impl Into<String>, items: Vec<LineItem>) -> Self {
        Self::with_id(CorrelationId::new(), customer_id, items)
    }

    /// Creates a pending order with the given id.
    pub fn with_id(
        order_id: CorrelationId,
        customer_id: impl Into<String>,
        items: Vec<LineItem>,
    ) -> Self {
        let now = Utc::now();
        // Overflowing totals saturate here and are rejected by `place_order`
        let total_cents = LineItem::checked_total(&items).unwrap_or(i64::MAX);
        Self {
            order_id,
            customer_id: customer_id.into(),
            items,
            total_cents,
            status: OrderStatus::Pending,
            reason: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Errors reported by the order store.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OrderError {
    #[error("order '{0}' not found")]
    NotFound(CorrelationId),

    #[error("order '{0}' already exists")]
    AlreadyExists(CorrelationId),

    #[error("order '{order_id}' cannot move from {from} to {to}")]
    InvalidTransition {
        order_id: CorrelationId,
        from: OrderStatus,
        to: OrderStatus,
    },

    /// The store refused the change for a business reason.
    #[error("{0}")]
    Rejected(String),
}

/// Storage of the orders service's own records.
#[async_trait]
pub trait OrderStore: Send + Sync {
    /// Records a new order.
    async fn create(&self, order: Order) -> Result<Order, OrderError>;

    async fn get(&self, order_id: &CorrelationId) -> Result<Option<Order>, OrderError>;

    /// Confirms a pending order. Confirming a confirmed order is a no-op.
    async fn confirm(&self, order_id: &CorrelationId) -> Result<Order, OrderError>;

    /// Moves a pending order to a final status. Repeating the same update
    /// is a no-op.
    async fn update_status(
        &self,
        order_id: &CorrelationId,
        status: OrderStatus,
        reason: Option<String>,
    ) -> Result<Order, OrderError>;
}

#[derive(Debug, Default)]
struct OrderState {
    orders: HashMap<CorrelationId, Order>,
    confirm_rejection: Option<String>,
    confirm_calls: u32,
}

/// In-memory order store for testing and the demo binary.
#[derive(Debug, Clone, Default)]
pub struct InMemoryOrderStore {
    state: Arc<RwLock<OrderState>>,
}

impl InMemoryOrderStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rejects every confirmation with `reason` until cleared with `None`.
    pub fn reject_confirmations(&self, reason: Option<String>) {
        self.write().confirm_rejection = reason;
    }

    pub fn confirm_calls(&self) -> u32 {
        self.read().confirm_calls
    }

    pub fn len(&self) -> usize {
        self.read().orders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, OrderState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, OrderState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn transition(
        state: &mut OrderState,
        order_id: &CorrelationId,
        to: OrderStatus,
        reason: Option<String>,
    ) -> Result<Order, OrderError> {
        let order = state
            .orders
            .get_mut(order_id)
            .ok_or_else(|| OrderError::NotFound(order_id.clone()))?;

        if order.status == to {
            return Ok(order.clone());
        }
        if order.status.is_final() {
            return Err(OrderError::InvalidTransition {
                order_id: order_id.clone(),
                from: order.status,
                to,
            });
        }

        order.status = to;
        order.reason = reason;
        order.updated_at = Utc::now();
        Ok(order.clone())
    }
}

#[async_trait]
impl OrderStore for InMemoryOrderStore {
    async fn create(&self, order: Order) -> Result<Order, OrderError> {
        let mut state = self.write();
        if state.orders.contains_key(&order.order_id) {
            return Err(OrderError::AlreadyExists(order.order_id));
        }
        state.orders.insert(order.order_id.clone(), order.clone());
        Ok(order)
    }

    async fn get(&self, order_id: &CorrelationId) -> Result<Option<Order>, OrderError> {
        Ok(self.read().orders.get(order_id).cloned())
    }

    async fn confirm(&self, order_id: &CorrelationId) -> Result<Order, OrderError> {
        let mut state = self.write();
        state.confirm_calls += 1;
        if let Some(reason) = state.confirm_rejection.clone() {
            return Err(OrderError::Rejected(reason));
        }
        Self::transition(&mut state, order_id, OrderStatus::Confirmed, None)
    }

    async fn update_status(
        &self,
        order_id: &CorrelationId,
        status: OrderStatus,
        reason: Option<String>,
    ) -> Result<Order, OrderError> {
        Self::transition(&mut self.write(), order_id, status, reason)
    }
}
