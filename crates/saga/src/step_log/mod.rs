//! Write-ahead record of saga steps.
//!
//! Each participant writes its step's entry *before* publishing the event
//! that announces the outcome, and stores that event in the entry. A
//! redelivered trigger is answered by re-publishing the stored event, so a
//! step's effect runs at most once per saga while its event is emitted at
//! least once.

mod memory;
mod postgres;

pub use memory::InMemoryStepLog;
pub use postgres::PostgresStepLog;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::CorrelationId;
use event_channel::{Event, EventId};
use serde::Serialize;

use crate::error::Result;
use crate::state::StepOutcome;

/// One step of one saga instance, keyed by (`correlation_id`, `step_name`).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StepLogEntry {
    pub correlation_id: CorrelationId,
    pub step_name: String,
    pub outcome: StepOutcome,
    /// Attempts spent executing the step's effect.
    pub attempt_count: u32,
    /// Attempts spent by the compensating action.
    pub compensation_attempts: u32,
    /// Id of the last event published for this step.
    pub last_event_id: Option<EventId>,
    /// The exact event published after the last write.
    pub emitted: Option<Event>,
    /// Insertion order, assigned on first write and never changed.
    pub sequence: i64,
    pub recorded_at: DateTime<Utc>,
}

impl StepLogEntry {
    /// Creates an entry; `sequence` is assigned by the log on first write.
    pub fn new(
        correlation_id: CorrelationId,
        step_name: impl Into<String>,
        outcome: StepOutcome,
    ) -> Self {
        Self {
            correlation_id,
            step_name: step_name.into(),
            outcome,
            attempt_count: 0,
            compensation_attempts: 0,
            last_event_id: None,
            emitted: None,
            sequence: 0,
            recorded_at: Utc::now(),
        }
    }

    pub fn with_attempts(mut self, attempt_count: u32) -> Self {
        self.attempt_count = attempt_count;
        self
    }

    /// Records the event about to be published for this entry.
    pub fn with_emitted(mut self, event: Event) -> Self {
        self.last_event_id = Some(event.event_id);
        self.emitted = Some(event);
        self
    }

    /// Moves the entry to a compensation outcome, keeping its sequence.
    pub fn compensation(mut self, outcome: StepOutcome, attempts: u32) -> Self {
        self.outcome = outcome;
        self.compensation_attempts = attempts;
        self.recorded_at = Utc::now();
        self
    }
}

/// Durable storage for step log entries.
///
/// All implementations must be thread-safe (Send + Sync).
#[async_trait]
pub trait StepLog: Send + Sync {
    /// Looks up the entry for a step of a saga instance.
    async fn get(&self, correlation_id: &CorrelationId, step_name: &str)
    -> Result<Option<StepLogEntry>>;

    /// Inserts or replaces an entry and returns it as stored.
    ///
    /// The first write of a key assigns its `sequence`; later writes keep it.
    async fn put(&self, entry: StepLogEntry) -> Result<StepLogEntry>;

    /// All entries of a saga instance, oldest first.
    async fn entries(&self, correlation_id: &CorrelationId) -> Result<Vec<StepLogEntry>>;
}

#[async_trait]
impl<T: StepLog + ?Sized> StepLog for Arc<T> {
    async fn get(
        &self,
        correlation_id: &CorrelationId,
        step_name: &str,
    ) -> Result<Option<StepLogEntry>> {
        (**self).get(correlation_id, step_name).await
    }

    async fn put(&self, entry: StepLogEntry) -> Result<StepLogEntry> {
        (**self).put(entry).await
    }

    async fn entries(&self, correlation_id: &CorrelationId) -> Result<Vec<StepLogEntry>> {
        (**self).entries(correlation_id).await
    }
}
