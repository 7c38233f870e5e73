//! Saga events: the closed vocabulary participants exchange over the channel.

use std::str::FromStr;

use common::CorrelationId;
use event_channel::{Event, EventId, SCHEMA_VERSION};
use serde::{Deserialize, Serialize};

use crate::error::{FailureKind, Result, SagaError};

/// Event type tags, as they appear on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EventKind {
    OrderPlaced,
    InventoryReserved,
    InventoryReservationFailed,
    PaymentCharged,
    PaymentFailed,
    OrderConfirmed,
    OrderConfirmationFailed,
    PaymentRefunded,
    InventoryReleased,
    OrderCompensated,
    SagaFailed,
}

impl EventKind {
    pub const ALL: [EventKind; 11] = [
        EventKind::OrderPlaced,
        EventKind::InventoryReserved,
        EventKind::InventoryReservationFailed,
        EventKind::PaymentCharged,
        EventKind::PaymentFailed,
        EventKind::OrderConfirmed,
        EventKind::OrderConfirmationFailed,
        EventKind::PaymentRefunded,
        EventKind::InventoryReleased,
        EventKind::OrderCompensated,
        EventKind::SagaFailed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::OrderPlaced => "order.placed",
            EventKind::InventoryReserved => "inventory.reserved",
            EventKind::InventoryReservationFailed => "inventory.reservation_failed",
            EventKind::PaymentCharged => "payment.charged",
            EventKind::PaymentFailed => "payment.failed",
            EventKind::OrderConfirmed => "order.confirmed",
            EventKind::OrderConfirmationFailed => "order.confirmation_failed",
            EventKind::PaymentRefunded => "payment.refunded",
            EventKind::InventoryReleased => "inventory.released",
            EventKind::OrderCompensated => "order.compensated",
            EventKind::SagaFailed => "saga.failed",
        }
    }
}

impl FromStr for EventKind {
    type Err = SagaError;

    fn from_str(s: &str) -> Result<Self> {
        EventKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| SagaError::UnknownEventType(s.to_string()))
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One line of an order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineItem {
    pub sku: String,
    pub quantity: u32,
    pub unit_price_cents: i64,
}

impl LineItem {
    pub fn new(sku: impl Into<String>, quantity: u32, unit_price_cents: i64) -> Self {
        Self {
            sku: sku.into(),
            quantity,
            unit_price_cents,
        }
    }

    /// Line total, or `None` when it does not fit in an `i64`.
    pub fn total_cents(&self) -> Option<i64> {
        self.unit_price_cents.checked_mul(i64::from(self.quantity))
    }

    /// Sum of the line totals, or `None` on overflow.
    pub fn checked_total(items: &[LineItem]) -> Option<i64> {
        items
            .iter()
            .try_fold(0i64, |sum, item| sum.checked_add(item.total_cents()?))
    }
}

/// Payload of every step failure event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepFailure {
    /// The step that failed.
    pub step: String,
    pub kind: FailureKind,
    pub reason: String,
}

/// Typed saga events.
///
/// The saga instance is identified by the correlation id on the envelope;
/// for the order-fulfillment saga that is the order id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum SagaEvent {
    #[serde(rename = "order.placed")]
    OrderPlaced {
        customer_id: String,
        items: Vec<LineItem>,
        total_cents: i64,
    },

    #[serde(rename = "inventory.reserved")]
    InventoryReserved {
        reservation_id: String,
        customer_id: String,
        total_cents: i64,
    },

    #[serde(rename = "inventory.reservation_failed")]
    InventoryReservationFailed(StepFailure),

    #[serde(rename = "payment.charged")]
    PaymentCharged {
        payment_id: String,
        amount_cents: i64,
    },

    #[serde(rename = "payment.failed")]
    PaymentFailed(StepFailure),

    #[serde(rename = "order.confirmed")]
    OrderConfirmed { payment_id: String },

    #[serde(rename = "order.confirmation_failed")]
    OrderConfirmationFailed(StepFailure),

    #[serde(rename = "payment.refunded")]
    PaymentRefunded {
        payment_id: String,
        amount_cents: i64,
    },

    #[serde(rename = "inventory.released")]
    InventoryReleased { reservation_id: String },

    #[serde(rename = "order.compensated")]
    OrderCompensated { failed_step: String, reason: String },

    /// Compensation exhausted its retries; operator attention required.
    #[serde(rename = "saga.failed")]
    SagaFailed {
        step: String,
        reason: String,
        attempts: u32,
    },
}

impl SagaEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            SagaEvent::OrderPlaced { .. } => EventKind::OrderPlaced,
            SagaEvent::InventoryReserved { .. } => EventKind::InventoryReserved,
            SagaEvent::InventoryReservationFailed(_) => EventKind::InventoryReservationFailed,
            SagaEvent::PaymentCharged { .. } => EventKind::PaymentCharged,
            SagaEvent::PaymentFailed(_) => EventKind::PaymentFailed,
            SagaEvent::OrderConfirmed { .. } => EventKind::OrderConfirmed,
            SagaEvent::OrderConfirmationFailed(_) => EventKind::OrderConfirmationFailed,
            SagaEvent::PaymentRefunded { .. } => EventKind::PaymentRefunded,
            SagaEvent::InventoryReleased { .. } => EventKind::InventoryReleased,
            SagaEvent::OrderCompensated { .. } => EventKind::OrderCompensated,
            SagaEvent::SagaFailed { .. } => EventKind::SagaFailed,
        }
    }

    /// Returns the failure details if this is a step failure event.
    pub fn failure(&self) -> Option<&StepFailure> {
        match self {
            SagaEvent::InventoryReservationFailed(failure)
            | SagaEvent::PaymentFailed(failure)
            | SagaEvent::OrderConfirmationFailed(failure) => Some(failure),
            _ => None,
        }
    }

    /// Wraps the event in a channel envelope.
    pub fn to_event(
        &self,
        correlation_id: &CorrelationId,
        causation_id: Option<EventId>,
    ) -> Result<Event> {
        let mut tagged = serde_json::to_value(self)?;
        let payload = tagged
            .get_mut("payload")
            .map(serde_json::Value::take)
            .unwrap_or(serde_json::Value::Null);

        let event = Event::new(self.kind().as_str(), correlation_id.clone(), payload);
        Ok(match causation_id {
            Some(cause) => event.caused_by(cause),
            None => event,
        })
    }

    /// Decodes a channel envelope, rejecting unknown types and schema versions.
    pub fn from_event(event: &Event) -> Result<Self> {
        let kind = EventKind::from_str(&event.event_type)?;
        if event.schema_version != SCHEMA_VERSION {
            return Err(SagaError::UnsupportedSchema {
                event_type: kind.as_str().to_string(),
                version: event.schema_version,
            });
        }

        let tagged = serde_json::json!({
            "type": kind.as_str(),
            "payload": event.payload,
        });
        Ok(serde_json::from_value(tagged)?)
    }
}
