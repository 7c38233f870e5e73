use async_trait::async_trait;
use common::CorrelationId;
use event_channel::{Event, EventId};
use sqlx::{PgPool, Row, postgres::PgRow};
use uuid::Uuid;

use super::{StepLog, StepLogEntry};
use crate::error::{Result, SagaError};
use crate::state::StepOutcome;

/// PostgreSQL-backed step log (`saga_step_log` table).
#[derive(Clone)]
pub struct PostgresStepLog {
    pool: PgPool,
}

impl PostgresStepLog {
    /// Creates a new PostgreSQL step log.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Gets a reference to the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Runs the database migrations.
    pub async fn run_migrations(&self) -> Result<()> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }

    fn row_to_entry(row: PgRow) -> Result<StepLogEntry> {
        let correlation_id: String = row.try_get("correlation_id")?;
        let step_name: String = row.try_get("step_name")?;

        let corrupt = |reason: String| SagaError::CorruptEntry {
            correlation_id: correlation_id.clone(),
            step: step_name.clone(),
            reason,
        };

        let outcome: StepOutcome = row
            .try_get::<String, _>("outcome")?
            .parse()
            .map_err(|e: SagaError| corrupt(e.to_string()))?;
        let attempt_count = u32::try_from(row.try_get::<i32, _>("attempt_count")?)
            .map_err(|e| corrupt(format!("attempt_count: {e}")))?;
        let compensation_attempts = u32::try_from(row.try_get::<i32, _>("compensation_attempts")?)
            .map_err(|e| corrupt(format!("compensation_attempts: {e}")))?;
        let emitted = row
            .try_get::<Option<serde_json::Value>, _>("emitted")?
            .map(serde_json::from_value::<Event>)
            .transpose()
            .map_err(|e| corrupt(format!("emitted event: {e}")))?;

        Ok(StepLogEntry {
            correlation_id: CorrelationId::from(correlation_id.clone()),
            step_name: step_name.clone(),
            outcome,
            attempt_count,
            compensation_attempts,
            last_event_id: row
                .try_get::<Option<Uuid>, _>("last_event_id")?
                .map(EventId::from_uuid),
            emitted,
            sequence: row.try_get("sequence")?,
            recorded_at: row.try_get("recorded_at")?,
        })
    }
}

#[async_trait]
impl StepLog for PostgresStepLog {
    async fn get(
        &self,
        correlation_id: &CorrelationId,
        step_name: &str,
    ) -> Result<Option<StepLogEntry>> {
        let row = sqlx::query(
            r#"
            SELECT sequence, correlation_id, step_name, outcome, attempt_count,
                   compensation_attempts, last_event_id, emitted, recorded_at
            FROM saga_step_log
            WHERE correlation_id = $1 AND step_name = $2
            "#,
        )
        .bind(correlation_id.as_str())
        .bind(step_name)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Self::row_to_entry).transpose()
    }

    async fn put(&self, mut entry: StepLogEntry) -> Result<StepLogEntry> {
        let emitted = entry.emitted.as_ref().map(serde_json::to_value).transpose()?;

        let sequence: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO saga_step_log
                (correlation_id, step_name, outcome, attempt_count, compensation_attempts,
                 last_event_id, emitted, recorded_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (correlation_id, step_name) DO UPDATE SET
                outcome = EXCLUDED.outcome,
                attempt_count = EXCLUDED.attempt_count,
                compensation_attempts = EXCLUDED.compensation_attempts,
                last_event_id = EXCLUDED.last_event_id,
                emitted = EXCLUDED.emitted,
                recorded_at = EXCLUDED.recorded_at
            RETURNING sequence
            "#,
        )
        .bind(entry.correlation_id.as_str())
        .bind(&entry.step_name)
        .bind(entry.outcome.as_str())
        .bind(i32::try_from(entry.attempt_count).unwrap_or(i32::MAX))
        .bind(i32::try_from(entry.compensation_attempts).unwrap_or(i32::MAX))
        .bind(entry.last_event_id.map(|id| id.as_uuid()))
        .bind(emitted)
        .bind(entry.recorded_at)
        .fetch_one(&self.pool)
        .await?;

        entry.sequence = sequence;
        Ok(entry)
    }

    async fn entries(&self, correlation_id: &CorrelationId) -> Result<Vec<StepLogEntry>> {
        let rows = sqlx::query(
            r#"
            SELECT sequence, correlation_id, step_name, outcome, attempt_count,
                   compensation_attempts, last_event_id, emitted, recorded_at
            FROM saga_step_log
            WHERE correlation_id = $1
            ORDER BY sequence ASC
            "#,
        )
        .bind(correlation_id.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::row_to_entry).collect()
    }
}
