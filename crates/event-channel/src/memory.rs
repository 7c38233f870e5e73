use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::{Event, EventId, Result, log::EventLog};

#[derive(Debug)]
struct StoredEvent {
    event: Event,
    awaiting: HashSet<String>,
}

#[derive(Debug, Default)]
struct LogState {
    next_sequence: u64,
    events: BTreeMap<u64, StoredEvent>,
    index: HashMap<EventId, u64>,
}

/// In-memory event log for testing and single-process deployments.
///
/// Provides the same interface as the PostgreSQL implementation; "durable"
/// here means durable for the lifetime of the process.
#[derive(Clone, Default)]
pub struct InMemoryEventLog {
    state: Arc<RwLock<LogState>>,
}

impl InMemoryEventLog {
    /// Creates a new empty in-memory event log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the total number of events currently stored.
    pub async fn event_count(&self) -> usize {
        self.state.read().await.events.len()
    }

    /// Clears all stored events.
    pub async fn clear(&self) {
        let mut state = self.state.write().await;
        state.events.clear();
        state.index.clear();
    }
}

#[async_trait]
impl EventLog for InMemoryEventLog {
    async fn append(&self, event: &Event, consumer_groups: &[String]) -> Result<()> {
        if consumer_groups.is_empty() {
            return Ok(());
        }

        let mut state = self.state.write().await;

        // Re-published event: re-arm delivery for the addressed groups
        if let Some(sequence) = state.index.get(&event.event_id).copied()
            && let Some(stored) = state.events.get_mut(&sequence)
        {
            stored.awaiting.extend(consumer_groups.iter().cloned());
            return Ok(());
        }

        state.next_sequence += 1;
        let sequence = state.next_sequence;
        state.index.insert(event.event_id, sequence);
        state.events.insert(
            sequence,
            StoredEvent {
                event: event.clone(),
                awaiting: consumer_groups.iter().cloned().collect(),
            },
        );

        Ok(())
    }

    async fn acknowledge(&self, consumer_group: &str, event_id: EventId) -> Result<()> {
        let mut state = self.state.write().await;

        let Some(sequence) = state.index.get(&event_id).copied() else {
            return Ok(());
        };

        let fully_acknowledged = match state.events.get_mut(&sequence) {
            Some(stored) => {
                stored.awaiting.remove(consumer_group);
                stored.awaiting.is_empty()
            }
            None => false,
        };

        if fully_acknowledged {
            state.events.remove(&sequence);
            state.index.remove(&event_id);
        }

        Ok(())
    }

    async fn pending(&self, consumer_group: &str) -> Result<Vec<Event>> {
        let state = self.state.read().await;
        let events = state
            .events
            .values()
            .filter(|stored| stored.awaiting.contains(consumer_group))
            .map(|stored| stored.event.clone())
            .collect();
        Ok(events)
    }

    async fn pending_count(&self) -> Result<usize> {
        Ok(self.state.read().await.events.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::CorrelationId;

    fn create_test_event(correlation: &str, event_type: &str) -> Event {
        Event::new(
            event_type,
            CorrelationId::from(correlation),
            serde_json::json!({"test": true}),
        )
    }

    fn groups(names: &[&str]) -> Vec<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    #[tokio::test]
    async fn append_stores_event_for_each_group() {
        let log = InMemoryEventLog::new();
        let event = create_test_event("order-1", "order.placed");

        log.append(&event, &groups(&["inventory", "audit"]))
            .await
            .unwrap();

        assert_eq!(log.pending("inventory").await.unwrap(), vec![event.clone()]);
        assert_eq!(log.pending("audit").await.unwrap(), vec![event]);
        assert!(log.pending("payment").await.unwrap().is_empty());
        assert_eq!(log.event_count().await, 1);
    }

    #[tokio::test]
    async fn append_without_groups_stores_nothing() {
        let log = InMemoryEventLog::new();
        log.append(&create_test_event("order-1", "order.placed"), &[])
            .await
            .unwrap();
        assert_eq!(log.event_count().await, 0);
    }

    #[tokio::test]
    async fn event_removed_after_all_groups_acknowledge() {
        let log = InMemoryEventLog::new();
        let event = create_test_event("order-1", "order.placed");
        log.append(&event, &groups(&["inventory", "audit"]))
            .await
            .unwrap();

        log.acknowledge("inventory", event.event_id).await.unwrap();
        assert_eq!(log.pending_count().await.unwrap(), 1);
        assert!(log.pending("inventory").await.unwrap().is_empty());

        log.acknowledge("audit", event.event_id).await.unwrap();
        assert_eq!(log.pending_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn acknowledge_unknown_event_is_noop() {
        let log = InMemoryEventLog::new();
        log.acknowledge("inventory", EventId::new()).await.unwrap();
    }

    #[tokio::test]
    async fn republishing_same_event_rearms_delivery() {
        let log = InMemoryEventLog::new();
        let event = create_test_event("order-1", "inventory.reserved");
        log.append(&event, &groups(&["payment"])).await.unwrap();
        log.acknowledge("payment", event.event_id).await.unwrap();
        assert_eq!(log.event_count().await, 0);

        log.append(&event, &groups(&["payment"])).await.unwrap();
        log.append(&event, &groups(&["payment"])).await.unwrap();

        let pending = log.pending("payment").await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].event_id, event.event_id);
    }

    #[tokio::test]
    async fn pending_preserves_append_order() {
        let log = InMemoryEventLog::new();
        let first = create_test_event("order-1", "a");
        let second = create_test_event("order-2", "b");
        let third = create_test_event("order-1", "c");
        for event in [&first, &second, &third] {
            log.append(event, &groups(&["g"])).await.unwrap();
        }

        let types: Vec<_> = log
            .pending("g")
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.event_type)
            .collect();
        assert_eq!(types, vec!["a", "b", "c"]);
    }
}
