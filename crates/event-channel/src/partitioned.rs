//! Channel dispatcher with one worker per (consumer group, correlation id).

use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::FutureExt;
use tokio::sync::{Mutex, Notify, RwLock, mpsc};

use crate::channel::{EventChannel, EventHandler, Subscription};
use crate::log::EventLog;
use crate::{ChannelError, CorrelationId, Event, Result};

/// Delivery tuning for a [`PartitionedChannel`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelConfig {
    /// How long a handler may take before the delivery is considered lost
    /// and the event is redelivered.
    pub visibility_timeout: Duration,
    /// Delivery attempts per event before it is dead-lettered.
    pub max_deliveries: u32,
    /// Pause between a failed delivery and its redelivery.
    pub redelivery_delay: Duration,
    /// How long an empty partition worker lingers before exiting.
    pub partition_idle_timeout: Duration,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            visibility_timeout: Duration::from_secs(30),
            max_deliveries: 5,
            redelivery_delay: Duration::from_millis(100),
            partition_idle_timeout: Duration::from_secs(60),
        }
    }
}

/// An event a consumer group failed to process within its delivery budget.
#[derive(Debug, Clone)]
pub struct DeadLetter {
    pub consumer_group: String,
    pub event: Event,
    pub reason: String,
    pub deliveries: u32,
}

struct ConsumerGroup {
    subscription: Subscription,
    partitions: Mutex<HashMap<CorrelationId, mpsc::UnboundedSender<Event>>>,
}

struct Inner<L> {
    log: L,
    config: ChannelConfig,
    groups: RwLock<HashMap<String, Arc<ConsumerGroup>>>,
    in_flight: AtomicUsize,
    idle: Notify,
    dead_letters: Mutex<Vec<DeadLetter>>,
}

/// Event channel that serializes deliveries per correlation id.
///
/// Every consumer group gets one logical worker per correlation id
/// partition. A worker handles its events strictly in order and retries an
/// event until it is acknowledged or dead-lettered before moving on.
/// Partitions for different correlation ids run concurrently.
pub struct PartitionedChannel<L: EventLog + 'static> {
    inner: Arc<Inner<L>>,
}

impl<L: EventLog + 'static> Clone for PartitionedChannel<L> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<L: EventLog + 'static> PartitionedChannel<L> {
    /// Creates a channel on top of the given log.
    pub fn new(log: L, config: ChannelConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                log,
                config,
                groups: RwLock::new(HashMap::new()),
                in_flight: AtomicUsize::new(0),
                idle: Notify::new(),
                dead_letters: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Returns the underlying event log.
    pub fn log(&self) -> &L {
        &self.inner.log
    }

    /// Returns the channel configuration.
    pub fn config(&self) -> &ChannelConfig {
        &self.inner.config
    }

    /// Number of deliveries queued or currently being handled.
    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.load(Ordering::SeqCst)
    }

    /// Events that exhausted their delivery budget.
    pub async fn dead_letters(&self) -> Vec<DeadLetter> {
        self.inner.dead_letters.lock().await.clone()
    }

    /// Waits until no delivery is queued or in flight.
    ///
    /// Events published by handlers are counted before the delivery that
    /// produced them completes, so a whole cascade settles before this returns.
    pub async fn wait_until_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            if self.inner.in_flight.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }
}

impl<L: EventLog + 'static> Inner<L> {
    async fn enqueue(self: &Arc<Self>, group: &Arc<ConsumerGroup>, event: Event) {
        self.in_flight.fetch_add(1, Ordering::SeqCst);

        let key = event.correlation_id.clone();
        let mut partitions = group.partitions.lock().await;

        let event = match partitions.get(&key) {
            Some(sender) => match sender.send(event) {
                Ok(()) => return,
                Err(mpsc::error::SendError(event)) => event,
            },
            None => event,
        };

        let (sender, receiver) = mpsc::unbounded_channel();
        // The receiver is alive, so this cannot fail
        let _ = sender.send(event);
        partitions.insert(key.clone(), sender);

        tracing::debug!(
            consumer_group = %group.subscription.consumer_group,
            correlation_id = %key,
            "partition worker started"
        );
        tokio::spawn(run_partition(
            Arc::clone(self),
            Arc::clone(group),
            key,
            receiver,
        ));
    }

    fn finish_delivery(&self) {
        if self.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.idle.notify_waiters();
        }
    }

    #[tracing::instrument(
        skip(self, group, event),
        fields(
            consumer_group = %group.subscription.consumer_group,
            correlation_id = %event.correlation_id,
            event_type = %event.event_type,
            event_id = %event.event_id,
        )
    )]
    async fn deliver(&self, group: &ConsumerGroup, event: Event) {
        let handler: &dyn EventHandler = group.subscription.handler.as_ref();
        let consumer_group = group.subscription.consumer_group.as_str();
        let mut deliveries = 0;

        loop {
            deliveries += 1;
            metrics::counter!("channel_deliveries_total", "consumer_group" => consumer_group.to_string())
                .increment(1);

            let attempt = AssertUnwindSafe(handler.handle(&event)).catch_unwind();
            let reason =
                match tokio::time::timeout(self.config.visibility_timeout, attempt).await {
                    Ok(Ok(Ok(()))) => {
                        if let Err(e) = self.log.acknowledge(consumer_group, event.event_id).await {
                            // The event stays pending in the log and is replayed on resubscribe
                            tracing::warn!(error = %e, "failed to acknowledge event");
                        }
                        return;
                    }
                    Ok(Ok(Err(e))) => e.to_string(),
                    Ok(Err(panic)) => format!("handler panicked: {}", panic_message(panic.as_ref())),
                    Err(_) => format!(
                        "not acknowledged within visibility timeout of {:?}",
                        self.config.visibility_timeout
                    ),
                };

            if deliveries >= self.config.max_deliveries {
                tracing::error!(deliveries, %reason, "delivery budget exhausted, dead-lettering event");
                metrics::counter!("channel_dead_letters_total", "consumer_group" => consumer_group.to_string())
                    .increment(1);
                self.dead_letters.lock().await.push(DeadLetter {
                    consumer_group: consumer_group.to_string(),
                    event,
                    reason,
                    deliveries,
                });
                return;
            }

            tracing::warn!(deliveries, %reason, "delivery failed, scheduling redelivery");
            tokio::time::sleep(self.config.redelivery_delay).await;
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic payload")
}

async fn run_partition<L: EventLog + 'static>(
    inner: Arc<Inner<L>>,
    group: Arc<ConsumerGroup>,
    key: CorrelationId,
    mut receiver: mpsc::UnboundedReceiver<Event>,
) {
    loop {
        let event =
            match tokio::time::timeout(inner.config.partition_idle_timeout, receiver.recv()).await
            {
                Ok(Some(event)) => event,
                Ok(None) => break,
                Err(_) => {
                    // Senders only push while holding this lock, so an empty
                    // queue observed under it stays empty once we deregister.
                    let mut partitions = group.partitions.lock().await;
                    if receiver.is_empty() {
                        partitions.remove(&key);
                        break;
                    }
                    continue;
                }
            };

        inner.deliver(&group, event).await;
        inner.finish_delivery();
    }

    tracing::debug!(
        consumer_group = %group.subscription.consumer_group,
        correlation_id = %key,
        "partition worker stopped"
    );
}

#[async_trait]
impl<L: EventLog + 'static> EventChannel for PartitionedChannel<L> {
    #[tracing::instrument(
        skip(self, event),
        fields(event_type = %event.event_type, correlation_id = %event.correlation_id)
    )]
    async fn publish(&self, event: Event) -> Result<()> {
        let targets: Vec<Arc<ConsumerGroup>> = self
            .inner
            .groups
            .read()
            .await
            .values()
            .filter(|group| group.subscription.matches(&event.event_type))
            .cloned()
            .collect();

        let names: Vec<String> = targets
            .iter()
            .map(|group| group.subscription.consumer_group.clone())
            .collect();

        self.inner.log.append(&event, &names).await?;
        metrics::counter!("channel_events_published_total", "event_type" => event.event_type.clone())
            .increment(1);

        if targets.is_empty() {
            tracing::debug!("no subscribers for event");
            return Ok(());
        }

        for group in &targets {
            self.inner.enqueue(group, event.clone()).await;
        }

        Ok(())
    }

    async fn subscribe(&self, subscription: Subscription) -> Result<()> {
        let name = subscription.consumer_group.clone();
        let group = Arc::new(ConsumerGroup {
            subscription,
            partitions: Mutex::new(HashMap::new()),
        });

        {
            let mut groups = self.inner.groups.write().await;
            if groups.contains_key(&name) {
                return Err(ChannelError::DuplicateGroup(name));
            }
            groups.insert(name.clone(), Arc::clone(&group));
        }

        let pending = self.inner.log.pending(&name).await?;
        if !pending.is_empty() {
            tracing::info!(consumer_group = %name, pending = pending.len(), "replaying pending events");
        }
        for event in pending {
            self.inner.enqueue(&group, event).await;
        }

        tracing::info!(consumer_group = %name, event_types = ?group.subscription.event_types, "consumer group subscribed");
        Ok(())
    }
}
