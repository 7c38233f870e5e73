//! Undoing a service's completed steps after a downstream failure.

use std::collections::{BTreeSet, HashMap};
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use common::CorrelationId;
use event_channel::{Event, EventChannel, EventHandler, HandlerResult, Subscription};

use crate::backoff::BackoffPolicy;
use crate::error::{CompensationError, Result};
use crate::events::{EventKind, SagaEvent};
use crate::state::StepOutcome;
use crate::step_log::{StepLog, StepLogEntry};

/// Semantic undo of one step. Must be idempotent per correlation id.
#[async_trait]
pub trait CompensatingAction: Send + Sync {
    /// The step this action undoes.
    fn step(&self) -> &str;

    /// Undoes the step recorded in `entry` and returns its compensated event.
    async fn compensate(
        &self,
        correlation_id: &CorrelationId,
        entry: &StepLogEntry,
    ) -> std::result::Result<SagaEvent, CompensationError>;
}

/// What an executor did with a delivered event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompensationOutcome {
    /// Not a trigger for this executor.
    Ignored,
    /// Every owned step that had succeeded is now compensated.
    Completed {
        /// Steps compensated during this delivery, latest first.
        compensated: Vec<String>,
        /// Steps compensated earlier whose events were published again.
        replayed: Vec<String>,
    },
    /// A compensating action exhausted its retries during this delivery.
    Exhausted { step: String, attempts: u32 },
    /// A previous delivery already gave up; nothing was retried.
    Halted { step: String },
}

/// Runs a service's compensating actions when a downstream step fails or
/// is itself compensated.
///
/// Owned entries are walked latest first. Each `Succeeded` entry is undone
/// with bounded exponential backoff and rewritten as `Compensated` before
/// its compensated event is published, which in turn triggers the
/// upstream service's executor. Exhausting the budget records
/// `CompensationFailed`, publishes `saga.failed` and stops the chain.
pub struct CompensationExecutor<L: StepLog> {
    service: String,
    log: L,
    channel: Arc<dyn EventChannel>,
    actions: HashMap<String, Arc<dyn CompensatingAction>>,
    triggers: BTreeSet<EventKind>,
    backoff: BackoffPolicy,
}

impl<L: StepLog> CompensationExecutor<L> {
    /// Creates an executor with no actions or triggers.
    pub fn new(service: impl Into<String>, log: L, channel: Arc<dyn EventChannel>) -> Self {
        Self {
            service: service.into(),
            log,
            channel,
            actions: HashMap::new(),
            triggers: BTreeSet::new(),
            backoff: BackoffPolicy::default(),
        }
    }

    /// Registers the compensating action for a step this service owns.
    pub fn with_action(mut self, action: Arc<dyn CompensatingAction>) -> Self {
        self.actions.insert(action.step().to_string(), action);
        self
    }

    /// Adds an event kind that starts compensation.
    pub fn triggered_by(mut self, kind: EventKind) -> Self {
        self.triggers.insert(kind);
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    /// Name of the consumer group this executor subscribes as.
    pub fn consumer_group(&self) -> String {
        format!("{}.compensation", self.service)
    }

    /// Handles one delivered event.
    #[tracing::instrument(
        skip(self, event),
        fields(
            service = %self.service,
            correlation_id = %event.correlation_id,
            event_type = %event.event_type,
        )
    )]
    pub async fn on_event(&self, event: &Event) -> Result<CompensationOutcome> {
        let kind = EventKind::from_str(&event.event_type)?;
        if !self.triggers.contains(&kind) {
            return Ok(CompensationOutcome::Ignored);
        }
        let trigger = SagaEvent::from_event(event)?;
        let correlation_id = &event.correlation_id;

        let mut owned: Vec<StepLogEntry> = self
            .log
            .entries(correlation_id)
            .await?
            .into_iter()
            .filter(|entry| self.actions.contains_key(&entry.step_name))
            .collect();
        owned.sort_by_key(|entry| std::cmp::Reverse(entry.sequence));

        if let Some(failed) = owned
            .iter()
            .find(|entry| entry.outcome == StepOutcome::CompensationFailed)
        {
            tracing::warn!(step = %failed.step_name, "compensation already exhausted, not retrying");
            if let Some(emitted) = failed.emitted.clone() {
                self.channel.publish(emitted).await?;
            }
            return Ok(CompensationOutcome::Halted {
                step: failed.step_name.clone(),
            });
        }

        if let Some(failure) = trigger.failure() {
            tracing::info!(failed_step = %failure.step, reason = %failure.reason, "compensation triggered");
        } else {
            tracing::info!("compensation triggered");
        }

        let mut compensated = Vec::new();
        let mut replayed = Vec::new();

        for entry in owned {
            match entry.outcome {
                StepOutcome::Succeeded => {
                    let Some(action) = self.actions.get(&entry.step_name) else {
                        continue;
                    };
                    match self.run_action(action.as_ref(), correlation_id, &entry).await {
                        Ok((undone, attempts)) => {
                            let outgoing = undone.to_event(correlation_id, Some(event.event_id))?;
                            let step = entry.step_name.clone();
                            self.log
                                .put(
                                    entry
                                        .compensation(StepOutcome::Compensated, attempts)
                                        .with_emitted(outgoing.clone()),
                                )
                                .await?;
                            self.record(&step, "compensated");
                            self.channel.publish(outgoing).await?;
                            tracing::info!(%step, attempts, "step compensated");
                            compensated.push(step);
                        }
                        Err((error, attempts)) => {
                            return self.give_up(event, entry, error, attempts).await;
                        }
                    }
                }
                StepOutcome::Compensated => {
                    if let Some(emitted) = entry.emitted.clone() {
                        self.channel.publish(emitted).await?;
                    }
                    replayed.push(entry.step_name);
                }
                // The step itself failed; there is no effect to undo
                StepOutcome::Failed | StepOutcome::CompensationFailed => {}
            }
        }

        Ok(CompensationOutcome::Completed {
            compensated,
            replayed,
        })
    }

    async fn run_action(
        &self,
        action: &dyn CompensatingAction,
        correlation_id: &CorrelationId,
        entry: &StepLogEntry,
    ) -> std::result::Result<(SagaEvent, u32), (CompensationError, u32)> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match action.compensate(correlation_id, entry).await {
                Ok(undone) => return Ok((undone, attempt)),
                Err(error) => match self.backoff.delay_after(attempt) {
                    Some(delay) => {
                        tracing::warn!(step = %entry.step_name, %error, attempt, ?delay, "compensation failed, retrying");
                        self.record(&entry.step_name, "retried");
                        tokio::time::sleep(delay).await;
                    }
                    None => return Err((error, attempt)),
                },
            }
        }
    }

    async fn give_up(
        &self,
        trigger: &Event,
        entry: StepLogEntry,
        error: CompensationError,
        attempts: u32,
    ) -> Result<CompensationOutcome> {
        let step = entry.step_name.clone();
        tracing::error!(
            %step,
            %error,
            attempts,
            "compensation exhausted its retries, saga requires manual intervention"
        );

        let failed = SagaEvent::SagaFailed {
            step: step.clone(),
            reason: error.to_string(),
            attempts,
        }
        .to_event(&trigger.correlation_id, Some(trigger.event_id))?;

        self.log
            .put(
                entry
                    .compensation(StepOutcome::CompensationFailed, attempts)
                    .with_emitted(failed.clone()),
            )
            .await?;
        self.record(&step, "failed");
        self.channel.publish(failed).await?;

        Ok(CompensationOutcome::Exhausted { step, attempts })
    }

    fn record(&self, step: &str, outcome: &'static str) {
        metrics::counter!(
            "saga_compensations_total",
            "step" => step.to_string(),
            "outcome" => outcome
        )
        .increment(1);
    }
}

impl<L: StepLog + 'static> CompensationExecutor<L> {
    /// Subscription delivering this executor's trigger events to it.
    pub fn subscription(self: &Arc<Self>) -> Subscription {
        Subscription::new(self.consumer_group(), Arc::clone(self) as Arc<dyn EventHandler>)
            .event_types(self.triggers.iter().map(|kind| kind.as_str()))
    }
}

#[async_trait]
impl<L: StepLog> EventHandler for CompensationExecutor<L> {
    async fn handle(&self, event: &Event) -> HandlerResult {
        self.on_event(event).await?;
        Ok(())
    }
}
