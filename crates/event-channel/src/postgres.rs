use async_trait::async_trait;
use futures_util::TryStreamExt;
use sqlx::{PgPool, Row, postgres::PgRow};
use uuid::Uuid;

use crate::{CorrelationId, Event, EventId, Result, log::EventLog};

/// PostgreSQL-backed event log.
///
/// Events live in `channel_events`; one `channel_deliveries` row per
/// addressed consumer group tracks what is still unacknowledged.
#[derive(Clone)]
pub struct PostgresEventLog {
    pool: PgPool,
}

impl PostgresEventLog {
    /// Creates a new PostgreSQL event log.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Gets a reference to the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Runs the database migrations.
    pub async fn run_migrations(&self) -> std::result::Result<(), sqlx::migrate::MigrateError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await
    }

    fn row_to_event(row: PgRow) -> Result<Event> {
        let schema_version = u16::try_from(row.try_get::<i16, _>("schema_version")?).map_err(
            |e| sqlx::Error::ColumnDecode {
                index: "schema_version".into(),
                source: Box::new(e),
            },
        )?;
        Ok(Event {
            event_id: EventId::from_uuid(row.try_get::<Uuid, _>("id")?),
            event_type: row.try_get("event_type")?,
            schema_version,
            correlation_id: CorrelationId::from(row.try_get::<String, _>("correlation_id")?),
            causation_id: row
                .try_get::<Option<Uuid>, _>("causation_id")?
                .map(EventId::from_uuid),
            occurred_at: row.try_get("occurred_at")?,
            payload: row.try_get("payload")?,
        })
    }
}

#[async_trait]
impl EventLog for PostgresEventLog {
    async fn append(&self, event: &Event, consumer_groups: &[String]) -> Result<()> {
        if consumer_groups.is_empty() {
            return Ok(());
        }

        // Stored as SMALLINT
        let schema_version =
            i16::try_from(event.schema_version).map_err(|e| sqlx::Error::Encode(Box::new(e)))?;

        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO channel_events (id, event_type, schema_version, correlation_id, causation_id, occurred_at, payload)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(event.event_id.as_uuid())
        .bind(&event.event_type)
        .bind(schema_version)
        .bind(event.correlation_id.as_str())
        .bind(event.causation_id.map(|id| id.as_uuid()))
        .bind(event.occurred_at)
        .bind(&event.payload)
        .execute(&mut *tx)
        .await?;

        for group in consumer_groups {
            sqlx::query(
                r#"
                INSERT INTO channel_deliveries (event_id, consumer_group)
                VALUES ($1, $2)
                ON CONFLICT (event_id, consumer_group) DO NOTHING
                "#,
            )
            .bind(event.event_id.as_uuid())
            .bind(group)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn acknowledge(&self, consumer_group: &str, event_id: EventId) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM channel_deliveries WHERE event_id = $1 AND consumer_group = $2")
            .bind(event_id.as_uuid())
            .bind(consumer_group)
            .execute(&mut *tx)
            .await?;

        sqlx::query(
            r#"
            DELETE FROM channel_events
            WHERE id = $1
              AND NOT EXISTS (SELECT 1 FROM channel_deliveries WHERE event_id = $1)
            "#,
        )
        .bind(event_id.as_uuid())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn pending(&self, consumer_group: &str) -> Result<Vec<Event>> {
        sqlx::query(
            r#"
            SELECT e.id, e.event_type, e.schema_version, e.correlation_id, e.causation_id, e.occurred_at, e.payload
            FROM channel_events e
            JOIN channel_deliveries d ON d.event_id = e.id
            WHERE d.consumer_group = $1
            ORDER BY e.sequence ASC
            "#,
        )
        .bind(consumer_group)
        .fetch(&self.pool)
        .map_err(crate::ChannelError::from)
        .and_then(|row| async move { Self::row_to_event(row) })
        .try_collect()
        .await
    }

    async fn pending_count(&self) -> Result<usize> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM channel_events")
            .fetch_one(&self.pool)
            .await?;
        Ok(count as usize)
    }
}
