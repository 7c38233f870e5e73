//! Saga instance aggregate.

use common::CorrelationId;
use serde::Serialize;

use crate::error::Result;
use crate::events::SagaEvent;
use crate::state::{SagaStatus, StepOutcome};
use crate::step_log::{StepLog, StepLogEntry};

/// The ordered steps making up a saga type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SagaDefinition {
    pub saga_type: String,
    pub steps: Vec<String>,
}

impl SagaDefinition {
    pub fn new<I, S>(saga_type: impl Into<String>, steps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            saga_type: saga_type.into(),
            steps: steps.into_iter().map(Into::into).collect(),
        }
    }
}

/// A saga instance, rebuilt from its step log entries.
///
/// Status is derived from the durable log only:
/// - any `CompensationFailed` entry makes the saga `Failed`;
/// - otherwise, once a step failed, it is `Compensating` while any
///   succeeded step is still uncompensated and `Compensated` after;
/// - otherwise it is `Completed` when every step succeeded, or
///   `StepCompleted` for the latest succeeded step, or `Pending`.
#[derive(Debug, Clone, Serialize)]
pub struct SagaInstance {
    correlation_id: CorrelationId,
    saga_type: String,
    #[serde(skip)]
    steps: Vec<String>,
    status: SagaStatus,
    entries: Vec<StepLogEntry>,
}

impl SagaInstance {
    /// Creates an instance with no entries.
    pub fn new(definition: &SagaDefinition, correlation_id: CorrelationId) -> Self {
        Self {
            correlation_id,
            saga_type: definition.saga_type.clone(),
            steps: definition.steps.clone(),
            status: SagaStatus::Pending,
            entries: Vec::new(),
        }
    }

    /// Rebuilds an instance from entries ordered by sequence.
    pub fn replay(
        definition: &SagaDefinition,
        correlation_id: CorrelationId,
        entries: impl IntoIterator<Item = StepLogEntry>,
    ) -> Self {
        let mut instance = Self::new(definition, correlation_id);
        for entry in entries {
            instance.apply(entry);
        }
        instance
    }

    /// Loads the instance for a correlation id from the step log.
    pub async fn load<L: StepLog + ?Sized>(
        log: &L,
        definition: &SagaDefinition,
        correlation_id: &CorrelationId,
    ) -> Result<Self> {
        let entries = log.entries(correlation_id).await?;
        Ok(Self::replay(definition, correlation_id.clone(), entries))
    }

    /// Applies a new or rewritten entry.
    pub fn apply(&mut self, entry: StepLogEntry) {
        match self
            .entries
            .iter_mut()
            .find(|e| e.step_name == entry.step_name)
        {
            Some(existing) => *existing = entry,
            None => {
                self.entries.push(entry);
                self.entries.sort_by_key(|e| e.sequence);
            }
        }
        self.status = self.derive_status();
    }

    fn derive_status(&self) -> SagaStatus {
        let has = |outcome: StepOutcome| self.entries.iter().any(|e| e.outcome == outcome);

        if has(StepOutcome::CompensationFailed) {
            return SagaStatus::Failed;
        }

        if has(StepOutcome::Failed) || has(StepOutcome::Compensated) {
            return if has(StepOutcome::Succeeded) {
                SagaStatus::Compensating
            } else {
                SagaStatus::Compensated
            };
        }

        let succeeded = |step: &String| {
            self.entries
                .iter()
                .any(|e| &e.step_name == step && e.outcome == StepOutcome::Succeeded)
        };

        if !self.steps.is_empty() && self.steps.iter().all(succeeded) {
            return SagaStatus::Completed;
        }

        match self.steps.iter().rev().find(|step| succeeded(*step)) {
            Some(step) => SagaStatus::StepCompleted(step.clone()),
            None => SagaStatus::Pending,
        }
    }
}

// Query methods
impl SagaInstance {
    pub fn correlation_id(&self) -> &CorrelationId {
        &self.correlation_id
    }

    pub fn saga_type(&self) -> &str {
        &self.saga_type
    }

    pub fn status(&self) -> &SagaStatus {
        &self.status
    }

    /// Returns the entries ordered by sequence.
    pub fn entries(&self) -> &[StepLogEntry] {
        &self.entries
    }

    /// Returns true if no entry was recorded yet.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Steps that succeeded at some point, in definition order.
    pub fn completed_steps(&self) -> Vec<&str> {
        self.steps_with(|outcome| {
            matches!(
                outcome,
                StepOutcome::Succeeded | StepOutcome::Compensated | StepOutcome::CompensationFailed
            )
        })
    }

    /// Steps whose compensation succeeded, in definition order.
    pub fn compensated_steps(&self) -> Vec<&str> {
        self.steps_with(|outcome| outcome == StepOutcome::Compensated)
    }

    /// The entry of the step that failed, if any.
    pub fn failed_step(&self) -> Option<&StepLogEntry> {
        self.entries
            .iter()
            .find(|e| e.outcome == StepOutcome::Failed)
    }

    /// Reason carried by the failure event of the failed step.
    pub fn failure_reason(&self) -> Option<String> {
        let emitted = self.failed_step()?.emitted.as_ref()?;
        let event = SagaEvent::from_event(emitted).ok()?;
        event.failure().map(|failure| failure.reason.clone())
    }

    fn steps_with(&self, matches: impl Fn(StepOutcome) -> bool) -> Vec<&str> {
        let mut steps: Vec<(usize, &str)> = self
            .entries
            .iter()
            .filter(|e| matches(e.outcome))
            .map(|e| {
                let position = self.position(&e.step_name);
                (position, e.step_name.as_str())
            })
            .collect();
        steps.sort_by_key(|(position, _)| *position);
        steps.into_iter().map(|(_, step)| step).collect()
    }

    fn position(&self, step: &str) -> usize {
        self.steps
            .iter()
            .position(|s| s == step)
            .unwrap_or(usize::MAX)
    }
}
