//! HTTP API of the order service.
//!
//! Places orders (starting their fulfillment saga) and exposes the derived
//! saga status, the circuit breakers and Prometheus metrics. Every saga
//! participant runs in-process on one [`PartitionedChannel`].

pub mod config;
pub mod error;
pub mod routes;
pub mod telemetry;

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};
use circuit_breaker::BreakerRegistry;
use event_channel::{EventChannel, EventLog, InMemoryEventLog, PartitionedChannel, PostgresEventLog};
use metrics_exporter_prometheus::PrometheusHandle;
use saga::order_fulfillment::{self, Collaborators, SERVICE_PAYMENT};
use saga::{
    InMemoryInventoryService, InMemoryOrderStore, InMemoryPaymentGateway, InMemoryStepLog,
    OrderStore, PostgresStepLog, SagaError, StepLog,
};
use thiserror::Error;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use config::Config;

/// Shared application state accessible from all handlers.
pub struct AppState {
    pub channel: PartitionedChannel<Arc<dyn EventLog>>,
    pub step_log: Arc<dyn StepLog>,
    pub orders: Arc<dyn OrderStore>,
    pub breakers: Arc<BreakerRegistry>,
    pub metrics: PrometheusHandle,
}

/// Errors that stop the server from starting.
#[derive(Debug, Error)]
pub enum StartupError {
    #[error(transparent)]
    Config(#[from] config::ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error(transparent)]
    Saga(#[from] SagaError),
}

/// Creates the Axum application router with all routes and shared state.
pub fn create_app(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(routes::health::check))
        .route("/metrics", get(routes::metrics::get))
        .route("/orders", post(routes::orders::create))
        .route("/orders/{id}", get(routes::orders::get))
        .route("/sagas/{id}", get(routes::sagas::get))
        .route("/breakers", get(routes::breakers::list))
        .with_state(state)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
}

/// In-memory inventory, payment gateway and order store.
pub fn in_memory_collaborators() -> Collaborators {
    Collaborators {
        inventory: Arc::new(InMemoryInventoryService::new()),
        payments: Arc::new(InMemoryPaymentGateway::new()),
        orders: Arc::new(InMemoryOrderStore::new()),
    }
}

/// Wires the channel, the step log and the collaborators together and
/// installs the order fulfillment saga.
pub async fn build_state(
    config: &Config,
    event_log: Arc<dyn EventLog>,
    step_log: Arc<dyn StepLog>,
    collaborators: Collaborators,
    metrics: PrometheusHandle,
) -> Result<Arc<AppState>, SagaError> {
    let compensation_budget = config.saga.compensation.worst_case_delay();
    if config.channel.visibility_timeout <= compensation_budget {
        tracing::warn!(
            visibility_timeout_ms = config.channel.visibility_timeout.as_millis() as u64,
            compensation_budget_ms = compensation_budget.as_millis() as u64,
            "visibility timeout does not cover the compensation retry budget; \
             compensations may be redelivered while still running"
        );
    }

    let channel = PartitionedChannel::new(event_log, config.channel.clone());
    let breakers = Arc::new(config.breaker_registry(SERVICE_PAYMENT));

    order_fulfillment::install(
        Arc::new(channel.clone()) as Arc<dyn EventChannel>,
        step_log.clone(),
        breakers.clone(),
        &collaborators,
        config.saga,
    )
    .await?;

    Ok(Arc::new(AppState {
        channel,
        step_log,
        orders: collaborators.orders,
        breakers,
        metrics,
    }))
}

/// Builds the application state from configuration.
///
/// With `DATABASE_URL` set, the event log and the step log live in
/// PostgreSQL and pending deliveries are replayed on startup. Otherwise
/// everything is kept in memory.
pub async fn bootstrap(
    config: &Config,
    metrics: PrometheusHandle,
) -> Result<Arc<AppState>, StartupError> {
    let (event_log, step_log): (Arc<dyn EventLog>, Arc<dyn StepLog>) =
        match &config.database_url {
            Some(url) => {
                let pool = sqlx::postgres::PgPoolOptions::new()
                    .max_connections(10)
                    .connect(url)
                    .await?;
                let event_log = PostgresEventLog::new(pool.clone());
                event_log.run_migrations().await?;
                tracing::info!("using PostgreSQL event log and step log");
                (Arc::new(event_log), Arc::new(PostgresStepLog::new(pool)))
            }
            None => {
                tracing::info!("DATABASE_URL not set, using in-memory storage");
                (
                    Arc::new(InMemoryEventLog::new()),
                    Arc::new(InMemoryStepLog::new()),
                )
            }
        };

    let state = build_state(
        config,
        event_log,
        step_log,
        in_memory_collaborators(),
        metrics,
    )
    .await?;
    Ok(state)
}
