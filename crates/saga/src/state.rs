//! Saga and step state machines.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::SagaError;

/// The derived status of a saga instance.
///
/// Status transitions:
/// ```text
/// Pending ──► StepCompleted(step) ──┬──► Completed
///                                   └──► Compensating ──┬──► Compensated
///                                                       └──► Failed
/// ```
///
/// `Completed`, `Compensated` and `Failed` are terminal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(tag = "status", content = "step", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SagaStatus {
    /// No step has completed yet.
    #[default]
    Pending,

    /// The named step is the latest to have succeeded.
    StepCompleted(String),

    /// A step failed and completed steps are being undone.
    Compensating,

    /// Every completed step was undone (terminal state).
    Compensated,

    /// Compensation gave up; needs manual intervention (terminal state).
    Failed,

    /// All steps succeeded (terminal state).
    Completed,
}

impl SagaStatus {
    /// Returns true if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SagaStatus::Completed | SagaStatus::Compensated | SagaStatus::Failed
        )
    }

    /// Returns the status name as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            SagaStatus::Pending => "PENDING",
            SagaStatus::StepCompleted(_) => "STEP_COMPLETED",
            SagaStatus::Compensating => "COMPENSATING",
            SagaStatus::Compensated => "COMPENSATED",
            SagaStatus::Failed => "FAILED",
            SagaStatus::Completed => "COMPLETED",
        }
    }
}

impl std::fmt::Display for SagaStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SagaStatus::StepCompleted(step) => write!(f, "STEP_COMPLETED({step})"),
            other => f.write_str(other.as_str()),
        }
    }
}

/// Outcome recorded for one step in the step log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepOutcome {
    Succeeded,
    Failed,
    Compensated,
    /// The compensating action exhausted its retries.
    CompensationFailed,
}

impl StepOutcome {
    /// Returns the name stored in the step log.
    pub fn as_str(&self) -> &'static str {
        match self {
            StepOutcome::Succeeded => "succeeded",
            StepOutcome::Failed => "failed",
            StepOutcome::Compensated => "compensated",
            StepOutcome::CompensationFailed => "compensation_failed",
        }
    }
}

impl FromStr for StepOutcome {
    type Err = SagaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "succeeded" => Ok(StepOutcome::Succeeded),
            "failed" => Ok(StepOutcome::Failed),
            "compensated" => Ok(StepOutcome::Compensated),
            "compensation_failed" => Ok(StepOutcome::CompensationFailed),
            other => Err(SagaError::CorruptEntry {
                correlation_id: String::new(),
                step: String::new(),
                reason: format!("unknown outcome '{other}'"),
            }),
        }
    }
}

impl std::fmt::Display for StepOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A participant's progress on its step for one saga instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum ParticipantState {
    #[default]
    NotStarted,
    Running,
    Succeeded,
    Failed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_status_is_pending() {
        assert_eq!(SagaStatus::default(), SagaStatus::Pending);
    }

    #[test]
    fn test_terminal_states() {
        assert!(!SagaStatus::Pending.is_terminal());
        assert!(!SagaStatus::StepCompleted("reserve-inventory".into()).is_terminal());
        assert!(!SagaStatus::Compensating.is_terminal());
        assert!(SagaStatus::Compensated.is_terminal());
        assert!(SagaStatus::Failed.is_terminal());
        assert!(SagaStatus::Completed.is_terminal());
    }

    #[test]
    fn test_display() {
        assert_eq!(SagaStatus::Pending.to_string(), "PENDING");
        assert_eq!(
            SagaStatus::StepCompleted("charge-payment".into()).to_string(),
            "STEP_COMPLETED(charge-payment)"
        );
        assert_eq!(SagaStatus::Compensated.to_string(), "COMPENSATED");
    }

    #[test]
    fn test_status_serialization() {
        let json = serde_json::to_value(SagaStatus::StepCompleted("reserve-inventory".into())).unwrap();
        assert_eq!(json["status"], "STEP_COMPLETED");
        assert_eq!(json["step"], "reserve-inventory");

        let json = serde_json::to_value(SagaStatus::Failed).unwrap();
        assert_eq!(json["status"], "FAILED");
    }

    #[test]
    fn test_outcome_round_trips_through_storage_name() {
        for outcome in [
            StepOutcome::Succeeded,
            StepOutcome::Failed,
            StepOutcome::Compensated,
            StepOutcome::CompensationFailed,
        ] {
            assert_eq!(outcome.as_str().parse::<StepOutcome>().unwrap(), outcome);
        }
        assert!("done".parse::<StepOutcome>().is_err());
    }
}
