use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use event_channel::{Event, EventChannel, EventHandler, HandlerResult, Subscription};

use super::{SERVICE_ORDERS, definition};
use crate::aggregate::{SagaDefinition, SagaInstance};
use crate::error::Result;
use crate::events::{EventKind, SagaEvent};
use crate::services::{OrderStatus, OrderStore};
use crate::state::{SagaStatus, StepOutcome};
use crate::step_log::StepLog;

const TRIGGERS: [EventKind; 4] = [
    EventKind::InventoryReservationFailed,
    EventKind::InventoryReleased,
    EventKind::OrderConfirmed,
    EventKind::SagaFailed,
];

/// Closes the loop in the orders service, the saga's origin.
///
/// On each event that can end a saga it replays the step log and, once the
/// saga reached a terminal status, moves the order to the matching final
/// status. A compensated saga also gets its `order.compensated` event.
pub struct OrderOutcomeTracker<L: StepLog> {
    log: L,
    orders: Arc<dyn OrderStore>,
    channel: Arc<dyn EventChannel>,
    definition: SagaDefinition,
}

impl<L: StepLog> OrderOutcomeTracker<L> {
    pub fn new(log: L, orders: Arc<dyn OrderStore>, channel: Arc<dyn EventChannel>) -> Self {
        Self {
            log,
            orders,
            channel,
            definition: definition(),
        }
    }

    pub fn consumer_group(&self) -> String {
        format!("{SERVICE_ORDERS}.outcome")
    }

    /// Handles one delivered event; returns the order status it settled on.
    #[tracing::instrument(
        skip(self, event),
        fields(correlation_id = %event.correlation_id, event_type = %event.event_type)
    )]
    pub async fn on_event(&self, event: &Event) -> Result<Option<OrderStatus>> {
        let kind = EventKind::from_str(&event.event_type)?;
        if !TRIGGERS.contains(&kind) {
            return Ok(None);
        }
        let correlation_id = &event.correlation_id;
        let saga = SagaInstance::load(&self.log, &self.definition, correlation_id).await?;

        let settled = match saga.status() {
            SagaStatus::Completed => {
                self.orders
                    .update_status(correlation_id, OrderStatus::Confirmed, None)
                    .await?;
                OrderStatus::Confirmed
            }
            SagaStatus::Compensated => {
                let failed_step = saga
                    .failed_step()
                    .map(|entry| entry.step_name.clone())
                    .unwrap_or_default();
                let reason = saga
                    .failure_reason()
                    .unwrap_or_else(|| format!("{failed_step} failed"));

                self.orders
                    .update_status(correlation_id, OrderStatus::Cancelled, Some(reason.clone()))
                    .await?;

                let compensated = SagaEvent::OrderCompensated {
                    failed_step,
                    reason,
                }
                .to_event(correlation_id, Some(event.event_id))?;
                self.channel.publish(compensated).await?;
                OrderStatus::Cancelled
            }
            SagaStatus::Failed => {
                let reason = intervention_reason(&saga);
                tracing::error!(%reason, "saga failed, order requires manual intervention");
                self.orders
                    .update_status(
                        correlation_id,
                        OrderStatus::RequiresIntervention,
                        Some(reason),
                    )
                    .await?;
                OrderStatus::RequiresIntervention
            }
            status => {
                tracing::debug!(%status, "saga not finished yet");
                return Ok(None);
            }
        };

        metrics::counter!("saga_outcomes_total", "status" => saga.status().as_str()).increment(1);
        tracing::info!(status = %saga.status(), order_status = %settled, "saga finished");
        Ok(Some(settled))
    }
}

fn intervention_reason(saga: &SagaInstance) -> String {
    saga.entries()
        .iter()
        .filter(|entry| entry.outcome == StepOutcome::CompensationFailed)
        .filter_map(|entry| entry.emitted.as_ref())
        .find_map(|emitted| match SagaEvent::from_event(emitted) {
            Ok(SagaEvent::SagaFailed { step, reason, .. }) => {
                Some(format!("compensation of {step} failed: {reason}"))
            }
            _ => None,
        })
        .unwrap_or_else(|| "compensation failed".to_string())
}

impl<L: StepLog + 'static> OrderOutcomeTracker<L> {
    /// Subscription delivering saga-ending events to the tracker.
    pub fn subscription(self: &Arc<Self>) -> Subscription {
        Subscription::new(self.consumer_group(), Arc::clone(self) as Arc<dyn EventHandler>)
            .event_types(TRIGGERS.iter().map(|kind| kind.as_str()))
    }
}

#[async_trait]
impl<L: StepLog> EventHandler for OrderOutcomeTracker<L> {
    async fn handle(&self, event: &Event) -> HandlerResult {
        self.on_event(event).await?;
        Ok(())
    }
}
