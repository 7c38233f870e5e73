//! PostgreSQL integration tests
//!
//! These tests use a shared PostgreSQL container for efficiency.
//! Run with:
//!
//! ```bash
//! cargo test -p event-channel --test postgres_integration -- --test-threads=1
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use event_channel::{
    ChannelConfig, ChannelError, CorrelationId, Event, EventChannel, EventHandler, EventId, EventLog,
    HandlerResult, PartitionedChannel, PostgresEventLog, Subscription,
};
use serial_test::serial;
use sqlx::PgPool;
use testcontainers::{ContainerAsync, runners::AsyncRunner};
use testcontainers_modules::postgres::Postgres;
use tokio::sync::OnceCell;

/// Shared container info - container stays alive for all tests
struct ContainerInfo {
    #[allow(dead_code)] // Container must stay alive for tests
    container: ContainerAsync<Postgres>,
    connection_string: String,
}

/// Global shared container
static CONTAINER: OnceCell<Arc<ContainerInfo>> = OnceCell::const_new();

async fn get_container_info() -> Arc<ContainerInfo> {
    CONTAINER
        .get_or_init(|| async {
            let container = Postgres::default().start().await.unwrap();

            let host = container.get_host().await.unwrap();
            let port = container.get_host_port_ipv4(5432).await.unwrap();

            let connection_string =
                format!("postgres://postgres:postgres@{}:{}/postgres", host, port);

            let temp_pool = PgPool::connect(&connection_string).await.unwrap();
            sqlx::raw_sql(include_str!(
                "../../../migrations/001_create_channel_tables.sql"
            ))
            .execute(&temp_pool)
            .await
            .unwrap();
            temp_pool.close().await;

            Arc::new(ContainerInfo {
                container,
                connection_string,
            })
        })
        .await
        .clone()
}

/// Get a fresh log with its own pool and cleared tables
async fn get_test_log() -> PostgresEventLog {
    let info = get_container_info().await;

    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(5)
        .connect(&info.connection_string)
        .await
        .unwrap();

    sqlx::query("TRUNCATE TABLE channel_deliveries, channel_events")
        .execute(&pool)
        .await
        .unwrap();

    PostgresEventLog::new(pool)
}

fn create_test_event(correlation: &str, event_type: &str) -> Event {
    Event::new(
        event_type,
        CorrelationId::from(correlation),
        serde_json::json!({"sku": "SKU-1", "quantity": 2}),
    )
}

fn groups(names: &[&str]) -> Vec<String> {
    names.iter().map(|n| n.to_string()).collect()
}

#[tokio::test]
#[serial]
async fn append_and_read_pending() {
    let log = get_test_log().await;
    let event = create_test_event("order-1", "order.placed").caused_by(EventId::new());

    log.append(&event, &groups(&["inventory", "orders"]))
        .await
        .unwrap();

    let pending = log.pending("inventory").await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].event_id, event.event_id);
    assert_eq!(pending[0].event_type, "order.placed");
    assert_eq!(pending[0].correlation_id, event.correlation_id);
    assert_eq!(pending[0].causation_id, event.causation_id);
    assert_eq!(pending[0].payload, event.payload);
    assert_eq!(log.pending_count().await.unwrap(), 1);
}

#[tokio::test]
#[serial]
async fn acknowledge_removes_event_once_all_groups_are_done() {
    let log = get_test_log().await;
    let event = create_test_event("order-1", "payment.failed");
    log.append(&event, &groups(&["inventory", "orders"]))
        .await
        .unwrap();

    log.acknowledge("inventory", event.event_id).await.unwrap();
    assert!(log.pending("inventory").await.unwrap().is_empty());
    assert_eq!(log.pending("orders").await.unwrap().len(), 1);
    assert_eq!(log.pending_count().await.unwrap(), 1);

    log.acknowledge("orders", event.event_id).await.unwrap();
    assert_eq!(log.pending_count().await.unwrap(), 0);
}

#[tokio::test]
#[serial]
async fn duplicate_append_is_idempotent() {
    let log = get_test_log().await;
    let event = create_test_event("order-1", "inventory.reserved");

    log.append(&event, &groups(&["payment"])).await.unwrap();
    log.append(&event, &groups(&["payment"])).await.unwrap();

    assert_eq!(log.pending("payment").await.unwrap().len(), 1);
}

#[tokio::test]
#[serial]
async fn pending_is_ordered_by_append_sequence() {
    let log = get_test_log().await;
    let first = create_test_event("order-2", "a");
    let second = create_test_event("order-1", "b");
    let third = create_test_event("order-2", "c");
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

#[tokio::test]
#[serial]
async fn schema_version_outside_smallint_is_rejected_on_append() {
    let log = get_test_log().await;
    let event = create_test_event("order-3", "order.placed").with_schema_version(40_000);

    let result = log.append(&event, &groups(&["inventory"])).await;

    assert!(matches!(result, Err(ChannelError::Database(_))));
    assert_eq!(log.pending_count().await.unwrap(), 0);
}

#[tokio::test]
#[serial]
async fn negative_stored_schema_version_fails_to_decode() {
    let log = get_test_log().await;
    let event = create_test_event("order-4", "order.placed");
    sqlx::query(
        r#"
        INSERT INTO channel_events (id, event_type, schema_version, correlation_id, occurred_at, payload)
        VALUES ($1, $2, -1, $3, $4, $5)
        "#,
    )
    .bind(event.event_id.as_uuid())
    .bind(&event.event_type)
    .bind(event.correlation_id.as_str())
    .bind(event.occurred_at)
    .bind(&event.payload)
    .execute(log.pool())
    .await
    .unwrap();
    sqlx::query("INSERT INTO channel_deliveries (event_id, consumer_group) VALUES ($1, 'inventory')")
        .bind(event.event_id.as_uuid())
        .execute(log.pool())
        .await
        .unwrap();

    let result = log.pending("inventory").await;

    assert!(matches!(
        result,
        Err(ChannelError::Database(sqlx::Error::ColumnDecode { .. }))
    ));
}

struct Counting {
    calls: AtomicUsize,
}

#[async_trait]
impl EventHandler for Counting {
    async fn handle(&self, _event: &Event) -> HandlerResult {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[tokio::test]
#[serial]
async fn unacknowledged_events_survive_a_restart() {
    let log = get_test_log().await;
    let event = create_test_event("order-7", "order.placed");
    // Stored by a previous process that crashed before delivering
    log.append(&event, &groups(&["inventory"])).await.unwrap();

    let channel = PartitionedChannel::new(
        log.clone(),
        ChannelConfig {
            redelivery_delay: Duration::from_millis(10),
            ..ChannelConfig::default()
        },
    );
    let handler = Arc::new(Counting {
        calls: AtomicUsize::new(0),
    });
    channel
        .subscribe(Subscription::new("inventory", handler.clone()).event_type("order.placed"))
        .await
        .unwrap();
    channel.wait_until_idle().await;

    assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
    assert_eq!(log.pending_count().await.unwrap(), 0);
}
