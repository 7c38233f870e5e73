use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::CorrelationId;

/// Schema version stamped on events produced by this crate version.
pub const SCHEMA_VERSION: u16 = 1;

/// Unique identifier for an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(Uuid);

impl EventId {
    /// Creates a new random event ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Creates an event ID from an existing UUID.
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Returns the underlying UUID.
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for EventId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for EventId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl From<EventId> for Uuid {
    fn from(id: EventId) -> Self {
        id.0
    }
}

fn default_schema_version() -> u16 {
    SCHEMA_VERSION
}

/// An immutable event as it travels through the channel.
///
/// Produced once by a participant, never mutated, and possibly delivered
/// more than once. Re-publishing the same value (same `event_id`) is how a
/// participant re-emits a prior outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    /// Unique identifier for this event.
    pub event_id: EventId,

    /// The event type tag (e.g., "order.placed").
    #[serde(rename = "type")]
    pub event_type: String,

    /// Version of the payload schema for `event_type`.
    #[serde(default = "default_schema_version")]
    pub schema_version: u16,

    /// The saga instance this event belongs to; also the partition key.
    pub correlation_id: CorrelationId,

    /// The event that caused this one, if any.
    pub causation_id: Option<EventId>,

    /// When the event was produced.
    pub occurred_at: DateTime<Utc>,

    /// The event payload as JSON.
    pub payload: serde_json::Value,
}

impl Event {
    /// Creates a new event with a fresh id and the current time.
    pub fn new(
        event_type: impl Into<String>,
        correlation_id: CorrelationId,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            event_id: EventId::new(),
            event_type: event_type.into(),
            schema_version: SCHEMA_VERSION,
            correlation_id,
            causation_id: None,
            occurred_at: Utc::now(),
            payload,
        }
    }

    /// Records the event that caused this one.
    pub fn caused_by(mut self, causation_id: EventId) -> Self {
        self.causation_id = Some(causation_id);
        self
    }

    /// Overrides the schema version.
    pub fn with_schema_version(mut self, version: u16) -> Self {
        self.schema_version = version;
        self
    }

    /// Overrides the occurrence timestamp.
    pub fn with_occurred_at(mut self, occurred_at: DateTime<Utc>) -> Self {
        self.occurred_at = occurred_at;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_id_new_creates_unique_ids() {
        let id1 = EventId::new();
        let id2 = EventId::new();
        assert_ne!(id1, id2);
    }

    #[test]
    fn new_event_has_no_causation() {
        let event = Event::new(
            "order.placed",
            CorrelationId::from("order-42"),
            serde_json::json!({"total_cents": 100}),
        );
        assert_eq!(event.event_type, "order.placed");
        assert_eq!(event.schema_version, SCHEMA_VERSION);
        assert!(event.causation_id.is_none());
    }

    #[test]
    fn wire_format_uses_camel_case_and_type_tag() {
        let cause = EventId::new();
        let event = Event::new(
            "payment.failed",
            CorrelationId::from("order-42"),
            serde_json::json!({"reason": "declined"}),
        )
        .caused_by(cause);

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "payment.failed");
        assert_eq!(json["correlationId"], "order-42");
        assert_eq!(json["causationId"], cause.to_string());
        assert!(json["occurredAt"].is_string());
        assert_eq!(json["payload"]["reason"], "declined");
    }

    #[test]
    fn missing_schema_version_defaults_to_current() {
        let json = serde_json::json!({
            "eventId": EventId::new(),
            "type": "order.placed",
            "correlationId": "order-1",
            "causationId": null,
            "occurredAt": "2024-05-01T12:00:00Z",
            "payload": {}
        });
        let event: Event = serde_json::from_value(json).unwrap();
        assert_eq!(event.schema_version, SCHEMA_VERSION);
        assert_eq!(event.correlation_id.as_str(), "order-1");
    }
}
