//! Choreographed sagas with compensation.
//!
//! Each service runs a [`SagaParticipant`] per step it owns and a
//! [`CompensationExecutor`] for undoing those steps. Participants react to
//! events on the channel, record the step in the [`StepLog`] and publish a
//! success or failure event. Failure events travel backwards and trigger the
//! executors of earlier steps in reverse order, each publishing its own
//! compensated event for the next one upstream.
//!
//! The order fulfillment saga in [`order_fulfillment`] chains three steps:
//! 1. Reserve inventory
//! 2. Charge payment (through the payment gateway's circuit breaker)
//! 3. Confirm the order
//!
//! A saga's status is never stored; [`SagaInstance`] derives it from the
//! step log.

pub mod aggregate;
pub mod backoff;
pub mod compensation;
pub mod error;
pub mod events;
pub mod order_fulfillment;
pub mod participant;
pub mod services;
pub mod state;
pub mod step_log;

pub use aggregate::{SagaDefinition, SagaInstance};
pub use backoff::BackoffPolicy;
pub use compensation::{CompensatingAction, CompensationExecutor, CompensationOutcome};
pub use error::{CompensationError, FailureKind, Result, SagaError, StepError};
pub use events::{EventKind, LineItem, SagaEvent, StepFailure};
pub use participant::{Handled, SagaParticipant, SagaStep};
pub use services::{
    InMemoryInventoryService, InMemoryOrderStore, InMemoryPaymentGateway, InventoryError,
    InventoryService, Order, OrderError, OrderStatus, OrderStore, PaymentGateway, PaymentReceipt,
    Reservation,
};
pub use state::{ParticipantState, SagaStatus, StepOutcome};
pub use step_log::{InMemoryStepLog, PostgresStepLog, StepLog, StepLogEntry};
