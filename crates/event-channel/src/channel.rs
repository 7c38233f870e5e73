use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;

use crate::{Event, Result};

/// Error returned by an event handler.
///
/// Any handler error causes the channel to redeliver the event.
#[derive(Debug)]
pub struct HandlerError {
    message: String,
    source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl HandlerError {
    /// Wraps an underlying error.
    pub fn new(source: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self {
            message: source.to_string(),
            source: Some(Box::new(source)),
        }
    }

    /// Creates an error from a message alone.
    pub fn msg(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            source: None,
        }
    }

    /// Returns the underlying error, if any.
    pub fn source_error(&self) -> Option<&(dyn std::error::Error + Send + Sync + 'static)> {
        self.source.as_deref()
    }
}

impl std::fmt::Display for HandlerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Handler error: {}", self.message)
    }
}

/// Result type returned by event handlers.
pub type HandlerResult = std::result::Result<(), HandlerError>;

/// A consumer of channel events.
///
/// Handlers must tolerate redelivery: the same event may be handled more
/// than once.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Handles one event. Returning `Ok` acknowledges it.
    async fn handle(&self, event: &Event) -> HandlerResult;
}

/// A consumer group's registration with the channel.
#[derive(Clone)]
pub struct Subscription {
    /// Name of the consumer group; acknowledgments are tracked per group.
    pub consumer_group: String,
    /// Event types delivered to this group.
    pub event_types: HashSet<String>,
    /// The handler invoked for each delivery.
    pub handler: Arc<dyn EventHandler>,
}

impl Subscription {
    /// Creates a subscription with no event types yet.
    pub fn new(consumer_group: impl Into<String>, handler: Arc<dyn EventHandler>) -> Self {
        Self {
            consumer_group: consumer_group.into(),
            event_types: HashSet::new(),
            handler,
        }
    }

    /// Adds an event type to the subscription.
    pub fn event_type(mut self, event_type: impl Into<String>) -> Self {
        self.event_types.insert(event_type.into());
        self
    }

    /// Adds several event types to the subscription.
    pub fn event_types<I, S>(mut self, event_types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.event_types
            .extend(event_types.into_iter().map(Into::into));
        self
    }

    /// Returns true if this subscription wants events of the given type.
    pub fn matches(&self, event_type: &str) -> bool {
        self.event_types.contains(event_type)
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("consumer_group", &self.consumer_group)
            .field("event_types", &self.event_types)
            .finish_non_exhaustive()
    }
}

/// Publish/subscribe transport for saga events.
///
/// `publish` returns only once the event is durably stored. Delivery is
/// at-least-once and ordered among events sharing a correlation id.
#[async_trait]
pub trait EventChannel: Send + Sync {
    /// Durably stores an event and schedules it for every matching subscription.
    async fn publish(&self, event: Event) -> Result<()>;

    /// Registers a consumer group.
    ///
    /// Events still pending for the group in the log are redelivered.
    async fn subscribe(&self, subscription: Subscription) -> Result<()>;
}

#[async_trait]
impl<T: EventChannel + ?Sized> EventChannel for Arc<T> {
    async fn publish(&self, event: Event) -> Result<()> {
        (**self).publish(event).await
    }

    async fn subscribe(&self, subscription: Subscription) -> Result<()> {
        (**self).subscribe(subscription).await
    }
}
