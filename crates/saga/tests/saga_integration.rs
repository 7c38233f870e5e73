//! End-to-end runs of the order fulfillment saga over the partitioned
//! channel with in-memory collaborators.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use circuit_breaker::{BreakerConfig, BreakerRegistry, CallError, CircuitState};
use common::CorrelationId;
use event_channel::{
    ChannelConfig, Event, EventChannel, EventHandler, HandlerResult, InMemoryEventLog,
    PartitionedChannel, Subscription,
};
use saga::order_fulfillment::{
    self, Collaborators, PAYMENT_GATEWAY, STEP_CHARGE_PAYMENT, STEP_CONFIRM_ORDER,
    STEP_RESERVE_INVENTORY, SagaSettings,
};
use saga::{
    BackoffPolicy, EventKind, FailureKind, InMemoryInventoryService, InMemoryOrderStore,
    InMemoryPaymentGateway, InMemoryStepLog, LineItem, Order, OrderStatus, OrderStore, SagaEvent,
    SagaInstance, SagaStatus, StepLog, StepOutcome,
};
use tokio::sync::Mutex;

/// Records every saga event in publish order.
#[derive(Default)]
struct Audit {
    events: Mutex<Vec<Event>>,
}

#[async_trait]
impl EventHandler for Audit {
    async fn handle(&self, event: &Event) -> HandlerResult {
        self.events.lock().await.push(event.clone());
        Ok(())
    }
}

struct TestHarness {
    channel: PartitionedChannel<InMemoryEventLog>,
    log: InMemoryStepLog,
    breakers: Arc<BreakerRegistry>,
    inventory: InMemoryInventoryService,
    payments: InMemoryPaymentGateway,
    orders: InMemoryOrderStore,
    audit: Arc<Audit>,
}

impl TestHarness {
    async fn new() -> Self {
        Self::with_breaker(3, Duration::from_secs(30)).await
    }

    async fn with_breaker(failure_threshold: u32, recovery_timeout: Duration) -> Self {
        let channel = PartitionedChannel::new(
            InMemoryEventLog::new(),
            ChannelConfig {
                visibility_timeout: Duration::from_secs(60),
                max_deliveries: 5,
                redelivery_delay: Duration::from_millis(100),
                partition_idle_timeout: Duration::from_secs(600),
            },
        );
        let log = InMemoryStepLog::new();
        let config =
            BreakerConfig::new(failure_threshold, recovery_timeout, Duration::from_secs(2))
                .unwrap();
        let breakers =
            Arc::new(BreakerRegistry::new("payment").with_target(PAYMENT_GATEWAY, config));
        let inventory = InMemoryInventoryService::new();
        let payments = InMemoryPaymentGateway::new();
        let orders = InMemoryOrderStore::new();

        let audit = Arc::new(Audit::default());
        channel
            .subscribe(
                Subscription::new("audit", audit.clone())
                    .event_types(EventKind::ALL.iter().map(|kind| kind.as_str())),
            )
            .await
            .unwrap();

        let collaborators = Collaborators {
            inventory: Arc::new(inventory.clone()),
            payments: Arc::new(payments.clone()),
            orders: Arc::new(orders.clone()),
        };
        let settings = SagaSettings {
            step_retry: BackoffPolicy::fixed(3, Duration::from_millis(100)),
            compensation: BackoffPolicy::exponential(
                5,
                Duration::from_millis(200),
                Duration::from_secs(5),
            ),
        };
        order_fulfillment::install(
            Arc::new(channel.clone()),
            Arc::new(log.clone()),
            breakers.clone(),
            &collaborators,
            settings,
        )
        .await
        .unwrap();

        Self {
            channel,
            log,
            breakers,
            inventory,
            payments,
            orders,
            audit,
        }
    }

    async fn place(&self, order_id: &str) -> CorrelationId {
        let order = Order::with_id(
            CorrelationId::from(order_id),
            "cust-1",
            vec![
                LineItem::new("SKU-001", 2, 1000),
                LineItem::new("SKU-002", 1, 2500),
            ],
        );
        let placed = order_fulfillment::place_order(&self.channel, &self.orders, order)
            .await
            .unwrap();
        placed.order_id
    }

    async fn run(&self, order_id: &str) -> CorrelationId {
        let id = self.place(order_id).await;
        self.channel.wait_until_idle().await;
        id
    }

    async fn saga(&self, id: &CorrelationId) -> SagaInstance {
        SagaInstance::load(&self.log, &order_fulfillment::definition(), id)
            .await
            .unwrap()
    }

    async fn order(&self, id: &CorrelationId) -> Order {
        self.orders.get(id).await.unwrap().unwrap()
    }

    async fn outcome(&self, id: &CorrelationId, step: &str) -> StepOutcome {
        self.log.get(id, step).await.unwrap().unwrap().outcome
    }

    async fn event_types(&self, id: &CorrelationId) -> Vec<String> {
        self.audit
            .events
            .lock()
            .await
            .iter()
            .filter(|event| &event.correlation_id == id)
            .map(|event| event.event_type.clone())
            .collect()
    }

    async fn failure_kind(&self, id: &CorrelationId, step: &str) -> FailureKind {
        let entry = self.log.get(id, step).await.unwrap().unwrap();
        let event = SagaEvent::from_event(entry.emitted.as_ref().unwrap()).unwrap();
        event.failure().unwrap().kind
    }
}

#[tokio::test(start_paused = true)]
async fn test_happy_path_completes_saga_and_confirms_order() {
    let h = TestHarness::new().await;
    h.inventory.set_stock("SKU-001", 10);

    let id = h.run("order-1").await;

    let saga = h.saga(&id).await;
    assert_eq!(saga.status(), &SagaStatus::Completed);
    assert_eq!(
        saga.completed_steps(),
        vec![STEP_RESERVE_INVENTORY, STEP_CHARGE_PAYMENT, STEP_CONFIRM_ORDER]
    );
    assert_eq!(h.order(&id).await.status, OrderStatus::Confirmed);
    assert_eq!(h.inventory.stock("SKU-001"), Some(8));
    assert_eq!(h.payments.payment_count(), 1);
    assert_eq!(
        h.event_types(&id).await,
        vec![
            "order.placed",
            "inventory.reserved",
            "payment.charged",
            "order.confirmed"
        ]
    );
    assert!(h.channel.dead_letters().await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_each_event_is_caused_by_the_previous_one() {
    let h = TestHarness::new().await;
    let id = h.run("order-1").await;

    let events = h.audit.events.lock().await;
    let chain: Vec<&Event> = events.iter().filter(|e| e.correlation_id == id).collect();
    assert_eq!(chain[0].causation_id, None);
    for pair in chain.windows(2) {
        assert_eq!(pair[1].causation_id, Some(pair[0].event_id));
    }
}

#[tokio::test(start_paused = true)]
async fn test_permanent_payment_failure_releases_inventory_once() {
    let h = TestHarness::new().await;
    h.inventory.set_stock("SKU-001", 10);
    h.payments
        .script_charges([CallError::Permanent("card declined".into())]);

    let id = h.run("order-42").await;

    assert_eq!(h.inventory.release_calls(), 1);
    assert_eq!(h.inventory.stock("SKU-001"), Some(10));
    assert_eq!(
        h.outcome(&id, STEP_RESERVE_INVENTORY).await,
        StepOutcome::Compensated
    );
    assert_eq!(h.outcome(&id, STEP_CHARGE_PAYMENT).await, StepOutcome::Failed);
    assert_eq!(
        h.failure_kind(&id, STEP_CHARGE_PAYMENT).await,
        FailureKind::Permanent
    );

    let saga = h.saga(&id).await;
    assert_eq!(saga.status(), &SagaStatus::Compensated);
    assert_eq!(saga.compensated_steps(), vec![STEP_RESERVE_INVENTORY]);

    let order = h.order(&id).await;
    assert_eq!(order.status, OrderStatus::Cancelled);
    assert!(order.reason.unwrap().contains("card declined"));

    assert_eq!(
        h.event_types(&id).await,
        vec![
            "order.placed",
            "inventory.reserved",
            "payment.failed",
            "inventory.released",
            "order.compensated"
        ]
    );

    // A rejected request never counts against the circuit
    let snapshot = &h.breakers.snapshots()[0];
    assert_eq!(snapshot.state, CircuitState::Closed);
    assert_eq!(snapshot.consecutive_failures, 0);
}

#[tokio::test(start_paused = true)]
async fn test_confirmation_failure_compensates_in_reverse_order() {
    let h = TestHarness::new().await;
    h.inventory.set_stock("SKU-001", 10);
    h.orders
        .reject_confirmations(Some("fraud check failed".into()));

    let id = h.run("order-7").await;

    let saga = h.saga(&id).await;
    assert_eq!(saga.status(), &SagaStatus::Compensated);
    assert_eq!(
        saga.compensated_steps(),
        vec![STEP_RESERVE_INVENTORY, STEP_CHARGE_PAYMENT]
    );
    assert!(h.payments.is_refunded(&id));
    assert_eq!(h.inventory.stock("SKU-001"), Some(10));

    // Refund is published before the release it triggers
    assert_eq!(
        h.event_types(&id).await,
        vec![
            "order.placed",
            "inventory.reserved",
            "payment.charged",
            "order.confirmation_failed",
            "payment.refunded",
            "inventory.released",
            "order.compensated"
        ]
    );

    let order = h.order(&id).await;
    assert_eq!(order.status, OrderStatus::Cancelled);
    assert_eq!(order.reason.as_deref(), Some("fraud check failed"));
}

#[tokio::test(start_paused = true)]
async fn test_out_of_stock_cancels_without_compensation() {
    let h = TestHarness::new().await;
    h.inventory.set_stock("SKU-002", 0);

    let id = h.run("order-1").await;

    assert_eq!(h.saga(&id).await.status(), &SagaStatus::Compensated);
    assert_eq!(h.inventory.release_calls(), 0);
    assert_eq!(h.payments.charge_calls(), 0);
    assert_eq!(
        h.failure_kind(&id, STEP_RESERVE_INVENTORY).await,
        FailureKind::Business
    );
    assert_eq!(h.order(&id).await.status, OrderStatus::Cancelled);
    assert_eq!(
        h.event_types(&id).await,
        vec![
            "order.placed",
            "inventory.reservation_failed",
            "order.compensated"
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_repeated_sku_over_stock_cancels_order() {
    let h = TestHarness::new().await;
    h.inventory.set_stock("SKU-001", 5);
    let order = Order::with_id(
        CorrelationId::from("order-1"),
        "cust-1",
        vec![
            LineItem::new("SKU-001", 3, 1000),
            LineItem::new("SKU-001", 3, 1000),
        ],
    );

    let placed = order_fulfillment::place_order(&h.channel, &h.orders, order)
        .await
        .unwrap();
    h.channel.wait_until_idle().await;

    let id = placed.order_id;
    assert_eq!(h.channel.in_flight(), 0);
    assert_eq!(h.saga(&id).await.status(), &SagaStatus::Compensated);
    assert_eq!(h.order(&id).await.status, OrderStatus::Cancelled);
    assert_eq!(
        h.failure_kind(&id, STEP_RESERVE_INVENTORY).await,
        FailureKind::Business
    );
    assert_eq!(h.inventory.stock("SKU-001"), Some(5));
    assert_eq!(h.payments.charge_calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_compensation_exhausting_its_budget_fails_the_saga() {
    let h = TestHarness::new().await;
    h.payments
        .script_charges([CallError::Permanent("card declined".into())]);
    h.inventory.fail_next_releases(5);

    let id = h.run("order-42").await;

    assert_eq!(h.inventory.release_calls(), 5);
    assert_eq!(
        h.outcome(&id, STEP_RESERVE_INVENTORY).await,
        StepOutcome::CompensationFailed
    );
    assert_eq!(h.saga(&id).await.status(), &SagaStatus::Failed);

    let order = h.order(&id).await;
    assert_eq!(order.status, OrderStatus::RequiresIntervention);

    let types = h.event_types(&id).await;
    assert_eq!(types.last().map(String::as_str), Some("saga.failed"));
    assert!(!types.iter().any(|t| t == "inventory.released"));
    assert!(!types.iter().any(|t| t == "order.compensated"));
}

#[tokio::test(start_paused = true)]
async fn test_compensation_recovering_within_budget_still_compensates() {
    let h = TestHarness::new().await;
    h.payments
        .script_charges([CallError::Permanent("card declined".into())]);
    h.inventory.fail_next_releases(4);

    let id = h.run("order-42").await;

    let entry = h
        .log
        .get(&id, STEP_RESERVE_INVENTORY)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(entry.outcome, StepOutcome::Compensated);
    assert_eq!(entry.compensation_attempts, 5);
    assert_eq!(h.saga(&id).await.status(), &SagaStatus::Compensated);
}

#[tokio::test(start_paused = true)]
async fn test_redelivered_trigger_has_no_duplicate_effect() {
    let h = TestHarness::new().await;
    let id = h.run("order-1").await;

    let placed = h.audit.events.lock().await[0].clone();
    let reserved_before = h.log.get(&id, STEP_RESERVE_INVENTORY).await.unwrap().unwrap();

    h.channel.publish(placed).await.unwrap();
    h.channel.wait_until_idle().await;

    assert_eq!(h.inventory.reserve_calls(), 1);
    assert_eq!(h.payments.charge_calls(), 1);
    assert_eq!(h.orders.confirm_calls(), 1);

    // The recorded success event goes out again with the same identity
    let events = h.audit.events.lock().await;
    let reserved: Vec<&Event> = events
        .iter()
        .filter(|e| e.event_type == "inventory.reserved")
        .collect();
    assert_eq!(reserved.len(), 2);
    assert_eq!(reserved[0].event_id, reserved[1].event_id);
    assert_eq!(reserved_before.last_event_id, Some(reserved[0].event_id));
    drop(events);

    assert_eq!(h.saga(&id).await.status(), &SagaStatus::Completed);
}

#[tokio::test(start_paused = true)]
async fn test_transient_inventory_outage_is_retried() {
    let h = TestHarness::new().await;
    h.inventory.fail_next_reserves(2);

    let id = h.run("order-1").await;

    let entry = h
        .log
        .get(&id, STEP_RESERVE_INVENTORY)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(entry.outcome, StepOutcome::Succeeded);
    assert_eq!(entry.attempt_count, 3);
    assert_eq!(h.saga(&id).await.status(), &SagaStatus::Completed);
}

#[tokio::test(start_paused = true)]
async fn test_gateway_outage_opens_circuit_and_fails_fast() {
    let h = TestHarness::new().await;
    h.payments
        .set_charge_failure(Some(CallError::Transient("503 service unavailable".into())));

    let first = h.run("order-1").await;
    assert_eq!(h.payments.charge_calls(), 3);
    assert_eq!(
        h.failure_kind(&first, STEP_CHARGE_PAYMENT).await,
        FailureKind::Transient
    );
    assert_eq!(h.breakers.snapshots()[0].state, CircuitState::Open);

    // The open circuit rejects without calling the gateway
    let second = h.run("order-2").await;
    assert_eq!(h.payments.charge_calls(), 3);
    assert_eq!(
        h.failure_kind(&second, STEP_CHARGE_PAYMENT).await,
        FailureKind::CircuitOpen
    );

    for id in [&first, &second] {
        assert_eq!(h.saga(id).await.status(), &SagaStatus::Compensated);
        assert_eq!(h.order(id).await.status, OrderStatus::Cancelled);
    }
}

#[tokio::test(start_paused = true)]
async fn test_circuit_recovers_after_recovery_timeout() {
    let h = TestHarness::with_breaker(3, Duration::from_secs(30)).await;
    h.payments
        .set_charge_failure(Some(CallError::Transient("503".into())));
    h.run("order-1").await;
    assert_eq!(h.breakers.snapshots()[0].state, CircuitState::Open);

    h.payments.set_charge_failure(None);
    tokio::time::sleep(Duration::from_secs(31)).await;

    let id = h.run("order-2").await;
    assert_eq!(h.saga(&id).await.status(), &SagaStatus::Completed);

    let snapshot = &h.breakers.snapshots()[0];
    assert_eq!(snapshot.state, CircuitState::Closed);
    assert_eq!(snapshot.consecutive_failures, 0);
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_sagas_complete_independently() {
    let h = TestHarness::new().await;

    let mut ids = Vec::new();
    for n in 0..20 {
        ids.push(h.place(&format!("order-{n}")).await);
    }
    h.channel.wait_until_idle().await;

    for id in &ids {
        assert_eq!(h.saga(id).await.status(), &SagaStatus::Completed);
        assert_eq!(h.order(id).await.status, OrderStatus::Confirmed);
    }
    assert_eq!(h.payments.payment_count(), 20);
}
