use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use common::CorrelationId;
use tokio::sync::RwLock;

use super::{StepLog, StepLogEntry};
use crate::error::Result;

#[derive(Debug, Default)]
struct LogState {
    next_sequence: i64,
    entries: HashMap<(CorrelationId, String), StepLogEntry>,
}

/// In-memory step log for testing and single-process deployments.
#[derive(Clone, Default)]
pub struct InMemoryStepLog {
    state: Arc<RwLock<LogState>>,
}

impl InMemoryStepLog {
    /// Creates a new empty in-memory step log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the total number of entries across all sagas.
    pub async fn len(&self) -> usize {
        self.state.read().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl StepLog for InMemoryStepLog {
    async fn get(
        &self,
        correlation_id: &CorrelationId,
        step_name: &str,
    ) -> Result<Option<StepLogEntry>> {
        let state = self.state.read().await;
        Ok(state
            .entries
            .get(&(correlation_id.clone(), step_name.to_string()))
            .cloned())
    }

    async fn put(&self, mut entry: StepLogEntry) -> Result<StepLogEntry> {
        let mut state = self.state.write().await;
        let key = (entry.correlation_id.clone(), entry.step_name.clone());

        entry.sequence = match state.entries.get(&key) {
            Some(existing) => existing.sequence,
            None => {
                state.next_sequence += 1;
                state.next_sequence
            }
        };

        state.entries.insert(key, entry.clone());
        Ok(entry)
    }

    async fn entries(&self, correlation_id: &CorrelationId) -> Result<Vec<StepLogEntry>> {
        let state = self.state.read().await;
        let mut entries: Vec<_> = state
            .entries
            .values()
            .filter(|entry| &entry.correlation_id == correlation_id)
            .cloned()
            .collect();
        entries.sort_by_key(|entry| entry.sequence);
        Ok(entries)
    }
}
