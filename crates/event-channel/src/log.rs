use std::sync::Arc;

use async_trait::async_trait;

use crate::{Event, EventId, Result};

/// Durable storage behind the event channel.
///
/// An event is stored together with the consumer groups it is addressed to
/// and stays in the log until each of those groups has acknowledged it.
/// All implementations must be thread-safe (Send + Sync).
#[async_trait]
pub trait EventLog: Send + Sync {
    /// Durably stores an event for delivery to `consumer_groups`.
    ///
    /// Appending an event whose id is already stored re-arms delivery for the
    /// given groups instead of storing a second copy. Appending with no
    /// consumer groups stores nothing.
    async fn append(&self, event: &Event, consumer_groups: &[String]) -> Result<()>;

    /// Marks an event as processed by a consumer group.
    ///
    /// Once the last addressed group acknowledges, the event is removed.
    /// Acknowledging an unknown event is a no-op.
    async fn acknowledge(&self, consumer_group: &str, event_id: EventId) -> Result<()>;

    /// Returns the events still awaiting acknowledgment by a consumer group,
    /// oldest first.
    async fn pending(&self, consumer_group: &str) -> Result<Vec<Event>>;

    /// Returns the number of stored events awaiting at least one acknowledgment.
    async fn pending_count(&self) -> Result<usize>;
}

#[async_trait]
impl<T: EventLog + ?Sized> EventLog for Arc<T> {
    async fn append(&self, event: &Event, consumer_groups: &[String]) -> Result<()> {
        (**self).append(event, consumer_groups).await
    }

    async fn acknowledge(&self, consumer_group: &str, event_id: EventId) -> Result<()> {
        (**self).acknowledge(consumer_group, event_id).await
    }

    async fn pending(&self, consumer_group: &str) -> Result<Vec<Event>> {
        (**self).pending(consumer_group).await
    }

    async fn pending_count(&self) -> Result<usize> {
        (**self).pending_count().await
    }
}
