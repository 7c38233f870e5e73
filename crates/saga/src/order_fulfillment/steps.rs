use std::sync::Arc;

use async_trait::async_trait;
use circuit_breaker::BreakerRegistry;
use common::CorrelationId;

use super::{PAYMENT_GATEWAY, STEP_CHARGE_PAYMENT, STEP_CONFIRM_ORDER, STEP_RESERVE_INVENTORY};
use crate::error::StepError;
use crate::events::{EventKind, SagaEvent, StepFailure};
use crate::participant::SagaStep;
use crate::services::{InventoryError, InventoryService, OrderStore, PaymentGateway};

fn unexpected(step: &str, trigger: &SagaEvent) -> StepError {
    StepError::Permanent(format!("{step} cannot start from '{}'", trigger.kind()))
}

/// Step 1: reserve stock for every line of the order.
pub struct ReserveInventoryStep {
    inventory: Arc<dyn InventoryService>,
}

impl ReserveInventoryStep {
    pub fn new(inventory: Arc<dyn InventoryService>) -> Self {
        Self { inventory }
    }
}

#[async_trait]
impl SagaStep for ReserveInventoryStep {
    fn name(&self) -> &str {
        STEP_RESERVE_INVENTORY
    }

    fn trigger(&self) -> EventKind {
        EventKind::OrderPlaced
    }

    async fn execute(
        &self,
        correlation_id: &CorrelationId,
        trigger: &SagaEvent,
    ) -> Result<SagaEvent, StepError> {
        let SagaEvent::OrderPlaced {
            customer_id,
            items,
            total_cents,
        } = trigger
        else {
            return Err(unexpected(self.name(), trigger));
        };

        let reservation = self
            .inventory
            .reserve(correlation_id, items)
            .await
            .map_err(|err| match err {
                InventoryError::OutOfStock { .. } => StepError::Business(err.to_string()),
                InventoryError::Unavailable(_) => StepError::Transient(err.to_string()),
            })?;

        Ok(SagaEvent::InventoryReserved {
            reservation_id: reservation.reservation_id,
            customer_id: customer_id.clone(),
            total_cents: *total_cents,
        })
    }

    fn failed(&self, failure: StepFailure) -> SagaEvent {
        SagaEvent::InventoryReservationFailed(failure)
    }
}

/// Step 2: charge the customer through the external payment gateway.
pub struct ChargePaymentStep {
    gateway: Arc<dyn PaymentGateway>,
    breakers: Arc<BreakerRegistry>,
}

impl ChargePaymentStep {
    pub fn new(gateway: Arc<dyn PaymentGateway>, breakers: Arc<BreakerRegistry>) -> Self {
        Self { gateway, breakers }
    }
}

#[async_trait]
impl SagaStep for ChargePaymentStep {
    fn name(&self) -> &str {
        STEP_CHARGE_PAYMENT
    }

    fn trigger(&self) -> EventKind {
        EventKind::InventoryReserved
    }

    async fn execute(
        &self,
        correlation_id: &CorrelationId,
        trigger: &SagaEvent,
    ) -> Result<SagaEvent, StepError> {
        let SagaEvent::InventoryReserved {
            customer_id,
            total_cents,
            ..
        } = trigger
        else {
            return Err(unexpected(self.name(), trigger));
        };

        let gateway = &self.gateway;
        let receipt = self
            .breakers
            .invoke(PAYMENT_GATEWAY, || {
                gateway.charge(correlation_id, customer_id, *total_cents)
            })
            .await?;

        Ok(SagaEvent::PaymentCharged {
            payment_id: receipt.payment_id,
            amount_cents: receipt.amount_cents,
        })
    }

    fn failed(&self, failure: StepFailure) -> SagaEvent {
        SagaEvent::PaymentFailed(failure)
    }
}

/// Step 3: confirm the order in the orders service's own store.
pub struct ConfirmOrderStep {
    orders: Arc<dyn OrderStore>,
}

impl ConfirmOrderStep {
    pub fn new(orders: Arc<dyn OrderStore>) -> Self {
        Self { orders }
    }
}

#[async_trait]
impl SagaStep for ConfirmOrderStep {
    fn name(&self) -> &str {
        STEP_CONFIRM_ORDER
    }

    fn trigger(&self) -> EventKind {
        EventKind::PaymentCharged
    }

    async fn execute(
        &self,
        correlation_id: &CorrelationId,
        trigger: &SagaEvent,
    ) -> Result<SagaEvent, StepError> {
        let SagaEvent::PaymentCharged { payment_id, .. } = trigger else {
            return Err(unexpected(self.name(), trigger));
        };

        self.orders
            .confirm(correlation_id)
            .await
            .map_err(|err| StepError::Business(err.to_string()))?;

        Ok(SagaEvent::OrderConfirmed {
            payment_id: payment_id.clone(),
        })
    }

    fn failed(&self, failure: StepFailure) -> SagaEvent {
        SagaEvent::OrderConfirmationFailed(failure)
    }
}
