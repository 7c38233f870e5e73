//! Saga error types.

use circuit_breaker::BreakerError;
use event_channel::{ChannelError, HandlerError};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::services::OrderError;

/// Infrastructure errors raised while running a saga.
///
/// These never become failure events. A handler that hits one fails, and
/// the channel redelivers the triggering event.
#[derive(Debug, Error)]
pub enum SagaError {
    /// Step log database error.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A database migration error occurred.
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// Publishing or subscribing failed.
    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Circuit breaker misconfiguration.
    #[error("Circuit breaker error: {0}")]
    Breaker(#[from] BreakerError),

    /// The orders service's own store failed.
    #[error("Order store error: {0}")]
    Order(#[from] OrderError),

    /// An event carried a type outside the saga's vocabulary.
    #[error("Unknown event type: {0}")]
    UnknownEventType(String),

    /// An event carried a schema version this build cannot read.
    #[error("Unsupported schema version {version} for event type '{event_type}'")]
    UnsupportedSchema { event_type: String, version: u16 },

    /// A stored step log entry could not be interpreted.
    #[error("Corrupt step log entry for '{correlation_id}/{step}': {reason}")]
    CorruptEntry {
        correlation_id: String,
        step: String,
        reason: String,
    },
}

impl From<SagaError> for HandlerError {
    fn from(err: SagaError) -> Self {
        HandlerError::new(err)
    }
}

/// Convenience type alias for saga results.
pub type Result<T> = std::result::Result<T, SagaError>;

/// How a saga step failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The business rules rejected the step (out of stock, card declined).
    Business,
    /// The downstream service stayed unavailable through every retry.
    Transient,
    /// The downstream service rejected the request.
    Permanent,
    /// The circuit to the downstream service was open.
    CircuitOpen,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::Business => "business",
            FailureKind::Transient => "transient",
            FailureKind::Permanent => "permanent",
            FailureKind::CircuitOpen => "circuit_open",
        }
    }
}

/// Error returned by a step's local effect.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StepError {
    /// Business failure; always triggers compensation, never retried.
    #[error("{0}")]
    Business(String),

    /// Unavailability of a dependency; retried a bounded number of times.
    #[error("service unavailable: {0}")]
    Transient(String),

    /// The dependency rejected the request; never retried.
    #[error("request rejected: {0}")]
    Permanent(String),

    /// The circuit to the dependency is open.
    #[error("circuit open for '{0}'")]
    CircuitOpen(String),
}

impl StepError {
    /// Returns true if the participant should retry the effect.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StepError::Transient(_))
    }

    pub fn kind(&self) -> FailureKind {
        match self {
            StepError::Business(_) => FailureKind::Business,
            StepError::Transient(_) => FailureKind::Transient,
            StepError::Permanent(_) => FailureKind::Permanent,
            StepError::CircuitOpen(_) => FailureKind::CircuitOpen,
        }
    }
}

impl From<BreakerError> for StepError {
    fn from(err: BreakerError) -> Self {
        match err {
            BreakerError::CircuitOpen { target } => StepError::CircuitOpen(target),
            BreakerError::Permanent { reason, .. } => StepError::Permanent(reason),
            err @ (BreakerError::Timeout { .. } | BreakerError::Transient { .. }) => {
                StepError::Transient(err.to_string())
            }
            // Misconfiguration will not fix itself on retry
            err @ (BreakerError::Unconfigured(_) | BreakerError::InvalidConfig(_)) => {
                StepError::Permanent(err.to_string())
            }
        }
    }
}

/// A compensating action failed; retried with backoff by the executor.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("compensation failed: {0}")]
pub struct CompensationError(pub String);

impl CompensationError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self(reason.into())
    }
}

impl From<BreakerError> for CompensationError {
    fn from(err: BreakerError) -> Self {
        Self(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn breaker_errors_map_to_step_errors() {
        let open = StepError::from(BreakerError::CircuitOpen {
            target: "payment-gateway".into(),
        });
        assert_eq!(open, StepError::CircuitOpen("payment-gateway".into()));
        assert!(!open.is_retryable());

        let transient = StepError::from(BreakerError::Transient {
            target: "payment-gateway".into(),
            reason: "503".into(),
        });
        assert!(transient.is_retryable());

        let permanent = StepError::from(BreakerError::Permanent {
            target: "payment-gateway".into(),
            reason: "card declined".into(),
        });
        assert_eq!(permanent, StepError::Permanent("card declined".into()));
        assert_eq!(permanent.kind(), FailureKind::Permanent);
    }

    #[test]
    fn failure_kind_serializes_snake_case() {
        let json = serde_json::to_value(FailureKind::CircuitOpen).unwrap();
        assert_eq!(json, "circuit_open");
    }

    #[test]
    fn saga_error_converts_to_handler_error() {
        let err: HandlerError = SagaError::UnknownEventType("order.shipped".into()).into();
        assert_eq!(
            err.to_string(),
            "Handler error: Unknown event type: order.shipped"
        );
    }
}
