use std::sync::Arc;

use async_trait::async_trait;
use circuit_breaker::BreakerRegistry;
use common::CorrelationId;

use super::{PAYMENT_GATEWAY, STEP_CHARGE_PAYMENT, STEP_RESERVE_INVENTORY};
use crate::compensation::CompensatingAction;
use crate::error::CompensationError;
use crate::events::SagaEvent;
use crate::services::{InventoryService, PaymentGateway};
use crate::step_log::StepLogEntry;

/// Decodes the success event the step recorded when it ran.
fn recorded(entry: &StepLogEntry) -> Result<SagaEvent, CompensationError> {
    let emitted = entry.emitted.as_ref().ok_or_else(|| {
        CompensationError::new(format!("no event recorded for '{}'", entry.step_name))
    })?;
    SagaEvent::from_event(emitted).map_err(|err| CompensationError::new(err.to_string()))
}

/// Undoes `reserve-inventory` by releasing the reservation.
pub struct ReleaseInventory {
    inventory: Arc<dyn InventoryService>,
}

impl ReleaseInventory {
    pub fn new(inventory: Arc<dyn InventoryService>) -> Self {
        Self { inventory }
    }
}

#[async_trait]
impl CompensatingAction for ReleaseInventory {
    fn step(&self) -> &str {
        STEP_RESERVE_INVENTORY
    }

    async fn compensate(
        &self,
        correlation_id: &CorrelationId,
        entry: &StepLogEntry,
    ) -> Result<SagaEvent, CompensationError> {
        let SagaEvent::InventoryReserved { reservation_id, .. } = recorded(entry)? else {
            return Err(CompensationError::new("recorded event is not a reservation"));
        };

        self.inventory
            .release(correlation_id, &reservation_id)
            .await
            .map_err(|err| CompensationError::new(err.to_string()))?;

        Ok(SagaEvent::InventoryReleased { reservation_id })
    }
}

/// Undoes `charge-payment` by refunding through the payment gateway.
pub struct RefundPayment {
    gateway: Arc<dyn PaymentGateway>,
    breakers: Arc<BreakerRegistry>,
}

impl RefundPayment {
    pub fn new(gateway: Arc<dyn PaymentGateway>, breakers: Arc<BreakerRegistry>) -> Self {
        Self { gateway, breakers }
    }
}

#[async_trait]
impl CompensatingAction for RefundPayment {
    fn step(&self) -> &str {
        STEP_CHARGE_PAYMENT
    }

    async fn compensate(
        &self,
        correlation_id: &CorrelationId,
        entry: &StepLogEntry,
    ) -> Result<SagaEvent, CompensationError> {
        let SagaEvent::PaymentCharged {
            payment_id,
            amount_cents,
        } = recorded(entry)?
        else {
            return Err(CompensationError::new("recorded event is not a charge"));
        };

        let gateway = &self.gateway;
        self.breakers
            .invoke(PAYMENT_GATEWAY, || {
                gateway.refund(correlation_id, &payment_id, amount_cents)
            })
            .await?;

        Ok(SagaEvent::PaymentRefunded {
            payment_id,
            amount_cents,
        })
    }
}
