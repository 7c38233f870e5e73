//! Durable event channel for choreographed sagas.
//!
//! Events are stored in an [`EventLog`] before `publish` returns and are
//! delivered at-least-once to every subscribed consumer group. Delivery order
//! is preserved among events sharing a correlation id; events with different
//! correlation ids are processed in parallel.

pub mod channel;
pub mod error;
pub mod event;
pub mod log;
pub mod memory;
pub mod partitioned;
pub mod postgres;

pub use channel::{EventChannel, EventHandler, HandlerError, HandlerResult, Subscription};
pub use common::CorrelationId;
pub use error::{ChannelError, Result};
pub use event::{Event, EventId, SCHEMA_VERSION};
pub use log::EventLog;
pub use memory::InMemoryEventLog;
pub use partitioned::{ChannelConfig, DeadLetter, PartitionedChannel};
pub use postgres::PostgresEventLog;
