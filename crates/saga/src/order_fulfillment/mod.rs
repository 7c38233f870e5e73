//! The order-fulfillment saga.
//!
//! | step                | owner     | trigger              | compensation       |
//! |---------------------|-----------|----------------------|--------------------|
//! | `reserve-inventory` | inventory | `order.placed`       | release reservation |
//! | `charge-payment`    | payment   | `inventory.reserved` | refund via gateway |
//! | `confirm-order`     | orders    | `payment.charged`    | none               |
//!
//! Each compensation executor listens for the failure or compensated event
//! of the step right after its own, so compensation runs backwards through
//! the services without a coordinator.

mod compensations;
mod outcome;
mod steps;

pub use compensations::{RefundPayment, ReleaseInventory};
pub use outcome::OrderOutcomeTracker;
pub use steps::{ChargePaymentStep, ConfirmOrderStep, ReserveInventoryStep};

use std::sync::Arc;
use std::time::Duration;

use circuit_breaker::{BreakerError, BreakerRegistry};
use event_channel::EventChannel;
use thiserror::Error;

use crate::aggregate::SagaDefinition;
use crate::backoff::BackoffPolicy;
use crate::compensation::CompensationExecutor;
use crate::error::{Result, SagaError};
use crate::events::{EventKind, LineItem, SagaEvent};
use crate::participant::{SagaParticipant, SagaStep};
use crate::services::{InventoryService, Order, OrderError, OrderStore, PaymentGateway};
use crate::step_log::StepLog;

/// The saga type identifier for order fulfillment.
pub const SAGA_TYPE: &str = "order-fulfillment";

pub const STEP_RESERVE_INVENTORY: &str = "reserve-inventory";
pub const STEP_CHARGE_PAYMENT: &str = "charge-payment";
pub const STEP_CONFIRM_ORDER: &str = "confirm-order";

/// Breaker target of the external payment gateway.
pub const PAYMENT_GATEWAY: &str = "payment-gateway";

pub const SERVICE_INVENTORY: &str = "inventory";
pub const SERVICE_PAYMENT: &str = "payment";
pub const SERVICE_ORDERS: &str = "orders";

/// Step definition of the order-fulfillment saga.
pub fn definition() -> SagaDefinition {
    SagaDefinition::new(
        SAGA_TYPE,
        [STEP_RESERVE_INVENTORY, STEP_CHARGE_PAYMENT, STEP_CONFIRM_ORDER],
    )
}

/// Retry policies of the saga's participants and executors.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SagaSettings {
    /// Retries of transient step errors.
    pub step_retry: BackoffPolicy,
    /// Retries of failed compensating actions.
    pub compensation: BackoffPolicy,
}

impl Default for SagaSettings {
    fn default() -> Self {
        Self {
            step_retry: BackoffPolicy::fixed(3, Duration::from_millis(100)),
            compensation: BackoffPolicy::default(),
        }
    }
}

/// Services the saga steps act on.
#[derive(Clone)]
pub struct Collaborators {
    pub inventory: Arc<dyn InventoryService>,
    pub payments: Arc<dyn PaymentGateway>,
    pub orders: Arc<dyn OrderStore>,
}

/// Subscribes every participant, compensation executor and the outcome
/// tracker of the saga to `channel`.
///
/// Fails if the payment gateway has no breaker configuration.
pub async fn install(
    channel: Arc<dyn EventChannel>,
    log: Arc<dyn StepLog>,
    breakers: Arc<BreakerRegistry>,
    collaborators: &Collaborators,
    settings: SagaSettings,
) -> Result<()> {
    if !breakers.is_configured(PAYMENT_GATEWAY) {
        return Err(BreakerError::Unconfigured(PAYMENT_GATEWAY.to_string()).into());
    }

    let participants: [(&str, Arc<dyn SagaStep>); 3] = [
        (
            SERVICE_INVENTORY,
            Arc::new(ReserveInventoryStep::new(collaborators.inventory.clone())),
        ),
        (
            SERVICE_PAYMENT,
            Arc::new(ChargePaymentStep::new(
                collaborators.payments.clone(),
                breakers.clone(),
            )),
        ),
        (
            SERVICE_ORDERS,
            Arc::new(ConfirmOrderStep::new(collaborators.orders.clone())),
        ),
    ];
    for (service, step) in participants {
        let participant = Arc::new(
            SagaParticipant::new(service, step, log.clone(), channel.clone())
                .with_retry(settings.step_retry),
        );
        channel.subscribe(participant.subscription()).await?;
    }

    let payment = Arc::new(
        CompensationExecutor::new(SERVICE_PAYMENT, log.clone(), channel.clone())
            .with_action(Arc::new(RefundPayment::new(
                collaborators.payments.clone(),
                breakers.clone(),
            )))
            .triggered_by(EventKind::OrderConfirmationFailed)
            .with_backoff(settings.compensation),
    );
    channel.subscribe(payment.subscription()).await?;

    let inventory = Arc::new(
        CompensationExecutor::new(SERVICE_INVENTORY, log.clone(), channel.clone())
            .with_action(Arc::new(ReleaseInventory::new(
                collaborators.inventory.clone(),
            )))
            .triggered_by(EventKind::PaymentFailed)
            .triggered_by(EventKind::PaymentRefunded)
            .with_backoff(settings.compensation),
    );
    channel.subscribe(inventory.subscription()).await?;

    let tracker = Arc::new(OrderOutcomeTracker::new(
        log,
        collaborators.orders.clone(),
        channel.clone(),
    ));
    channel.subscribe(tracker.subscription()).await?;

    tracing::info!(saga_type = SAGA_TYPE, "order fulfillment saga installed");
    Ok(())
}

/// Errors raised when placing an order.
#[derive(Debug, Error)]
pub enum PlaceOrderError {
    /// The order was rejected before anything was stored.
    #[error("Invalid order: {0}")]
    Invalid(String),

    #[error(transparent)]
    Order(#[from] OrderError),

    #[error(transparent)]
    Saga(#[from] SagaError),
}

/// Records a new order and starts its saga by publishing `order.placed`.
///
/// The order id is the saga's correlation id.
#[tracing::instrument(skip(channel, orders, order), fields(correlation_id = %order.order_id))]
pub async fn place_order(
    channel: &dyn EventChannel,
    orders: &dyn OrderStore,
    order: Order,
) -> std::result::Result<Order, PlaceOrderError> {
    validate(&order)?;
    let order = orders.create(order).await?;

    let placed = SagaEvent::OrderPlaced {
        customer_id: order.customer_id.clone(),
        items: order.items.clone(),
        total_cents: order.total_cents,
    }
    .to_event(&order.order_id, None)
    .map_err(PlaceOrderError::Saga)?;
    channel.publish(placed).await.map_err(SagaError::from)?;

    metrics::counter!("orders_placed_total").increment(1);
    tracing::info!(total_cents = order.total_cents, "order placed");
    Ok(order)
}

fn validate(order: &Order) -> std::result::Result<(), PlaceOrderError> {
    if order.customer_id.trim().is_empty() {
        return Err(PlaceOrderError::Invalid("customer_id is required".into()));
    }
    if order.items.is_empty() {
        return Err(PlaceOrderError::Invalid(
            "order must contain at least one item".into(),
        ));
    }
    for item in &order.items {
        if item.sku.trim().is_empty() {
            return Err(PlaceOrderError::Invalid("sku is required".into()));
        }
        if item.quantity == 0 {
            return Err(PlaceOrderError::Invalid(format!(
                "quantity for '{}' must be positive",
                item.sku
            )));
        }
        if item.unit_price_cents < 0 {
            return Err(PlaceOrderError::Invalid(format!(
                "unit price for '{}' must not be negative",
                item.sku
            )));
        }
    }
    if LineItem::checked_total(&order.items).is_none() {
        return Err(PlaceOrderError::Invalid(
            "order total exceeds the supported amount".into(),
        ));
    }
    Ok(())
}
