//! Reactive unit that performs one saga step for one service.

use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use common::CorrelationId;
use event_channel::{Event, EventChannel, EventHandler, HandlerResult, Subscription};

use crate::backoff::BackoffPolicy;
use crate::error::{Result, StepError};
use crate::events::{EventKind, SagaEvent, StepFailure};
use crate::state::{ParticipantState, StepOutcome};
use crate::step_log::{StepLog, StepLogEntry};

/// A saga step owned by one service.
#[async_trait]
pub trait SagaStep: Send + Sync {
    /// Step name; the step log key.
    fn name(&self) -> &str;

    /// The event kind that starts this step.
    fn trigger(&self) -> EventKind;

    /// Performs the step's local effect and returns its success event.
    ///
    /// Must be idempotent per correlation id.
    async fn execute(
        &self,
        correlation_id: &CorrelationId,
        trigger: &SagaEvent,
    ) -> std::result::Result<SagaEvent, StepError>;

    /// Builds the step's failure event.
    fn failed(&self, failure: StepFailure) -> SagaEvent;
}

/// What a participant did with a delivered event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handled {
    /// The step ran; carries the state it ended in.
    Executed(ParticipantState),
    /// The step had already run; its recorded event was published again.
    Replayed(StepOutcome),
    /// Nothing to do for this event.
    Ignored,
}

/// Runs a [`SagaStep`] in response to its trigger event.
///
/// The step log entry is written before the outcome event is published,
/// so a redelivered trigger re-publishes the recorded event instead of
/// repeating the effect.
pub struct SagaParticipant<L: StepLog> {
    service: String,
    step: Arc<dyn SagaStep>,
    log: L,
    channel: Arc<dyn EventChannel>,
    retry: BackoffPolicy,
}

impl<L: StepLog> SagaParticipant<L> {
    /// Creates a participant that does not retry transient failures.
    pub fn new(
        service: impl Into<String>,
        step: Arc<dyn SagaStep>,
        log: L,
        channel: Arc<dyn EventChannel>,
    ) -> Self {
        Self {
            service: service.into(),
            step,
            log,
            channel,
            retry: BackoffPolicy::none(),
        }
    }

    /// Sets the retry policy for transient step errors.
    pub fn with_retry(mut self, retry: BackoffPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn step_name(&self) -> &str {
        self.step.name()
    }

    /// Name of the consumer group this participant subscribes as.
    pub fn consumer_group(&self) -> String {
        format!("{}.participant", self.service)
    }

    /// Handles one delivered event.
    #[tracing::instrument(
        skip(self, event),
        fields(
            service = %self.service,
            step = %self.step.name(),
            correlation_id = %event.correlation_id,
            event_type = %event.event_type,
        )
    )]
    pub async fn on_event(&self, event: &Event) -> Result<Handled> {
        let kind = EventKind::from_str(&event.event_type)?;
        if kind != self.step.trigger() {
            tracing::debug!("event does not trigger this step");
            return Ok(Handled::Ignored);
        }
        let trigger = SagaEvent::from_event(event)?;
        let correlation_id = &event.correlation_id;

        if let Some(entry) = self.log.get(correlation_id, self.step.name()).await? {
            return self.replay(entry).await;
        }

        tracing::info!(state = ?ParticipantState::Running, "executing saga step");
        let started = std::time::Instant::now();
        let (result, attempts) = self.execute_with_retry(correlation_id, &trigger).await;

        let (outcome, state, saga_event) = match result {
            Ok(success) => (StepOutcome::Succeeded, ParticipantState::Succeeded, success),
            Err(error) => {
                tracing::warn!(%error, attempts, "saga step failed");
                let failure = StepFailure {
                    step: self.step.name().to_string(),
                    kind: error.kind(),
                    reason: error.to_string(),
                };
                (
                    StepOutcome::Failed,
                    ParticipantState::Failed,
                    self.step.failed(failure),
                )
            }
        };

        let outgoing = saga_event.to_event(correlation_id, Some(event.event_id))?;
        let entry = StepLogEntry::new(correlation_id.clone(), self.step.name(), outcome)
            .with_attempts(attempts)
            .with_emitted(outgoing.clone());
        self.log.put(entry).await?;

        metrics::counter!(
            "saga_steps_total",
            "step" => self.step.name().to_string(),
            "outcome" => outcome.as_str()
        )
        .increment(1);
        metrics::histogram!("saga_step_duration_seconds", "step" => self.step.name().to_string())
            .record(started.elapsed().as_secs_f64());

        self.channel.publish(outgoing).await?;
        tracing::info!(%outcome, attempts, emitted = %saga_event.kind(), "saga step recorded");

        Ok(Handled::Executed(state))
    }

    async fn replay(&self, entry: StepLogEntry) -> Result<Handled> {
        match entry.outcome {
            StepOutcome::Succeeded | StepOutcome::Failed => {
                match entry.emitted {
                    Some(emitted) => {
                        tracing::info!(
                            outcome = %entry.outcome,
                            event_id = %emitted.event_id,
                            "step already recorded, re-publishing its event"
                        );
                        self.channel.publish(emitted).await?;
                    }
                    None => tracing::warn!(
                        outcome = %entry.outcome,
                        "step already recorded without an event to re-publish"
                    ),
                }
                Ok(Handled::Replayed(entry.outcome))
            }
            StepOutcome::Compensated | StepOutcome::CompensationFailed => {
                tracing::debug!(outcome = %entry.outcome, "step already compensated");
                Ok(Handled::Ignored)
            }
        }
    }

    async fn execute_with_retry(
        &self,
        correlation_id: &CorrelationId,
        trigger: &SagaEvent,
    ) -> (std::result::Result<SagaEvent, StepError>, u32) {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.step.execute(correlation_id, trigger).await {
                Err(error) if error.is_retryable() => match self.retry.delay_after(attempt) {
                    Some(delay) => {
                        tracing::warn!(%error, attempt, ?delay, "transient step failure, retrying");
                        tokio::time::sleep(delay).await;
                    }
                    None => return (Err(error), attempt),
                },
                result => return (result, attempt),
            }
        }
    }
}

impl<L: StepLog + 'static> SagaParticipant<L> {
    /// Subscription delivering this participant's trigger events to it.
    pub fn subscription(self: &Arc<Self>) -> Subscription {
        Subscription::new(self.consumer_group(), Arc::clone(self) as Arc<dyn EventHandler>)
            .event_type(self.step.trigger().as_str())
    }
}

#[async_trait]
impl<L: StepLog> EventHandler for SagaParticipant<L> {
    async fn handle(&self, event: &Event) -> HandlerResult {
        self.on_event(event).await?;
        Ok(())
    }
}
