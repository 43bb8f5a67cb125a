//! Postgres-backed outbox.
//!
//! Claiming and reaping use `FOR UPDATE SKIP LOCKED`: concurrent claimers and
//! reapers partition the candidate rows between them instead of blocking on
//! each other, and no row is ever held by two workers.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | OutboxStoreError | Scenario |
//! |------------|----------------------|------------------|----------|
//! | Database (unique violation) | `23505` | `Duplicate` | Same envelope inserted twice |
//! | Database (check violation) | `23514` | `Storage` | Out-of-range version / retry count |
//! | Database (other) | Any other | `Storage` | Other database errors |
//! | PoolClosed | N/A | `Storage` | Connection pool was closed |
//! | Other | N/A | `Storage` | Network errors, connection failures, etc. |

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{FromRow, PgPool, Postgres, Row, Transaction};
use tracing::{debug, error, instrument};
use uuid::Uuid;

use courier_core::{EventId, TenantId};
use courier_events::IntegrationEventEnvelope;

use super::record::{DeadLetterRecord, OutboxRecord, OutboxStats, OutboxStatus};
use super::retry::{FailureTransition, RetryPolicy};
use super::schema::SCHEMA;
use super::store::{OutboxStore, OutboxStoreError, OutboxWriter};

/// Postgres outbox store.
///
/// `Clone` is cheap; clones share the pool.
#[derive(Debug, Clone)]
pub struct PostgresOutboxStore {
    pool: Arc<PgPool>,
}

impl PostgresOutboxStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Begin a transaction for a business write plus its outbox insert.
    pub async fn begin(&self) -> Result<Transaction<'static, Postgres>, OutboxStoreError> {
        self.pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin", e))
    }

    /// Create the outbox and dead-letter tables if missing.
    #[instrument(skip(self), err)]
    pub async fn ensure_schema(&self) -> Result<(), OutboxStoreError> {
        sqlx::raw_sql(SCHEMA)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("ensure_schema", e))?;
        Ok(())
    }
}

#[async_trait]
impl<'c> OutboxWriter<Transaction<'c, Postgres>> for PostgresOutboxStore {
    #[instrument(
        skip(self, tx, envelope),
        fields(
            event_id = %envelope.event_id(),
            tenant_id = %envelope.tenant_id(),
            event_name = %envelope.event_name()
        ),
        err
    )]
    async fn insert(
        &self,
        tx: &mut Transaction<'c, Postgres>,
        envelope: &IntegrationEventEnvelope,
    ) -> Result<(), OutboxStoreError> {
        let payload = envelope.to_payload()?;
        let event_id = envelope.event_id();

        sqlx::query(
            r#"
            INSERT INTO integration_event_outbox (
                event_id,
                tenant_id,
                event_name,
                event_version,
                partition_key,
                payload,
                status,
                retry_count,
                next_retry_at,
                last_error
            )
            VALUES ($1, $2, $3, $4, $5, $6, 'pending', 0, NULL, NULL)
            "#,
        )
        .bind(event_id.as_uuid())
        .bind(envelope.tenant_id().as_str())
        .bind(envelope.event_name())
        .bind(to_db_int(envelope.event_version()))
        .bind(envelope.partition_key())
        .bind(&payload)
        .execute(&mut **tx)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                OutboxStoreError::Duplicate(event_id)
            } else {
                map_sqlx_error("insert", e)
            }
        })?;

        Ok(())
    }
}

#[async_trait]
impl OutboxStore for PostgresOutboxStore {
    #[instrument(skip(self), err)]
    async fn claim_due(
        &self,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<OutboxRecord>, OutboxStoreError> {
        let rows = sqlx::query(
            r#"
            WITH due AS (
                SELECT event_id
                FROM integration_event_outbox
                WHERE status IN ('pending', 'failed')
                  AND (next_retry_at IS NULL OR next_retry_at <= $1)
                ORDER BY created_at ASC
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            UPDATE integration_event_outbox o
            SET status = 'processing', updated_at = $1
            FROM due
            WHERE o.event_id = due.event_id
            RETURNING
                o.event_id,
                o.tenant_id,
                o.event_name,
                o.event_version,
                o.partition_key,
                o.payload,
                o.status,
                o.retry_count,
                o.next_retry_at,
                o.last_error,
                o.created_at,
                o.updated_at
            "#,
        )
        .bind(now)
        .bind(to_db_limit(limit))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("claim_due", e))?;

        let mut claimed = Vec::with_capacity(rows.len());
        for row in rows {
            let decoded = OutboxRow::from_row(&row)
                .map_err(|e| OutboxStoreError::Serialization(e.to_string()))
                .and_then(OutboxRecord::try_from);
            match decoded {
                Ok(record) => claimed.push(record),
                // Left in `processing`; the reaper will retry and eventually dead-letter it.
                Err(e) => error!(error = %e, "skipping undecodable outbox row"),
            }
        }
        // RETURNING order is unspecified.
        claimed.sort_by_key(|r| r.created_at);
        Ok(claimed)
    }

    #[instrument(skip(self), fields(event_id = %event_id), err)]
    async fn heartbeat(
        &self,
        event_id: EventId,
        now: DateTime<Utc>,
    ) -> Result<bool, OutboxStoreError> {
        let result = sqlx::query(
            r#"
            UPDATE integration_event_outbox
            SET updated_at = $2
            WHERE event_id = $1 AND status = 'processing'
            "#,
        )
        .bind(event_id.as_uuid())
        .bind(now)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("heartbeat", e))?;

        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self), fields(event_id = %event_id), err)]
    async fn complete(&self, event_id: EventId) -> Result<bool, OutboxStoreError> {
        let result = sqlx::query(
            r#"
            DELETE FROM integration_event_outbox
            WHERE event_id = $1 AND status = 'processing'
            "#,
        )
        .bind(event_id.as_uuid())
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("complete", e))?;

        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self, error), fields(event_id = %event_id), err)]
    async fn record_failure(
        &self,
        event_id: EventId,
        error: &str,
        policy: RetryPolicy,
        now: DateTime<Utc>,
    ) -> Result<Option<FailureTransition>, OutboxStoreError> {
        let mut tx = self.begin().await?;

        // SKIP LOCKED: a concurrent reaper holding the row owns its transition.
        let row = sqlx::query(
            r#"
            SELECT retry_count
            FROM integration_event_outbox
            WHERE event_id = $1 AND status = 'processing'
            FOR UPDATE SKIP LOCKED
            "#,
        )
        .bind(event_id.as_uuid())
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("record_failure", e))?;

        let Some(row) = row else {
            tx.rollback()
                .await
                .map_err(|e| map_sqlx_error("rollback_transaction", e))?;
            return Ok(None);
        };

        let retry_count = read_retry_count(&row)?;
        let transition = policy.on_failure(retry_count, now);
        apply_failure(&mut tx, *event_id.as_uuid(), transition, error, now).await?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(Some(transition))
    }

    #[instrument(skip(self, error), err)]
    async fn reclaim_stale(
        &self,
        limit: usize,
        stale_before: DateTime<Utc>,
        policy: RetryPolicy,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<usize, OutboxStoreError> {
        let mut tx = self.begin().await?;

        let rows = sqlx::query(
            r#"
            SELECT event_id, retry_count
            FROM integration_event_outbox
            WHERE status = 'processing' AND updated_at < $1
            ORDER BY updated_at ASC
            LIMIT $2
            FOR UPDATE SKIP LOCKED
            "#,
        )
        .bind(stale_before)
        .bind(to_db_limit(limit))
        .fetch_all(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("reclaim_stale", e))?;

        if rows.is_empty() {
            tx.rollback()
                .await
                .map_err(|e| map_sqlx_error("rollback_transaction", e))?;
            return Ok(0);
        }

        for row in &rows {
            let event_id: Uuid = row
                .try_get("event_id")
                .map_err(|e| OutboxStoreError::Serialization(e.to_string()))?;
            let retry_count = read_retry_count(row)?;
            let transition = policy.on_failure(retry_count, now);
            apply_failure(&mut tx, event_id, transition, error, now).await?;
            debug!(event_id = %event_id, retry_count, ?transition, "reclaimed stale outbox row");
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(rows.len())
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id), err)]
    async fn list_dead_letters(
        &self,
        tenant_id: &TenantId,
        limit: usize,
    ) -> Result<Vec<DeadLetterRecord>, OutboxStoreError> {
        let rows = sqlx::query(
            r#"
            SELECT
                event_id,
                tenant_id,
                event_name,
                event_version,
                payload,
                retry_count,
                error,
                dead_at
            FROM integration_event_dead_letter
            WHERE tenant_id = $1
            ORDER BY dead_at DESC, id DESC
            LIMIT $2
            "#,
        )
        .bind(tenant_id.as_str())
        .bind(to_db_limit(limit))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_dead_letters", e))?;

        rows.iter()
            .map(|row| {
                DeadLetterRow::from_row(row)
                    .map_err(|e| OutboxStoreError::Serialization(e.to_string()))
                    .and_then(DeadLetterRecord::try_from)
            })
            .collect()
    }

    #[instrument(skip(self), fields(event_id = %event_id), err)]
    async fn requeue_dead(
        &self,
        event_id: EventId,
        now: DateTime<Utc>,
    ) -> Result<bool, OutboxStoreError> {
        let result = sqlx::query(
            r#"
            UPDATE integration_event_outbox
            SET status = 'pending',
                retry_count = 0,
                next_retry_at = NULL,
                last_error = NULL,
                updated_at = $2
            WHERE event_id = $1 AND status = 'dead'
            "#,
        )
        .bind(event_id.as_uuid())
        .bind(now)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("requeue_dead", e))?;

        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self), err)]
    async fn stats(&self) -> Result<OutboxStats, OutboxStoreError> {
        let rows = sqlx::query(
            r#"
            SELECT status, COUNT(*) AS n
            FROM integration_event_outbox
            GROUP BY status
            "#,
        )
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("stats", e))?;

        let mut stats = OutboxStats::default();
        for row in &rows {
            let status: String = row
                .try_get("status")
                .map_err(|e| OutboxStoreError::Serialization(e.to_string()))?;
            let n = read_count(row)?;
            match status.parse::<OutboxStatus>() {
                Ok(OutboxStatus::Pending) => stats.pending = n,
                Ok(OutboxStatus::Processing) => stats.processing = n,
                Ok(OutboxStatus::Failed) => stats.failed = n,
                Ok(OutboxStatus::Dead) => stats.dead = n,
                Err(e) => return Err(OutboxStoreError::Serialization(e)),
            }
        }

        let row = sqlx::query("SELECT COUNT(*) AS n FROM integration_event_dead_letter")
            .fetch_one(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("stats", e))?;
        stats.dead_letters = read_count(&row)?;

        Ok(stats)
    }
}

/// Write a failure decision for one locked `processing` row.
async fn apply_failure(
    tx: &mut Transaction<'_, Postgres>,
    event_id: Uuid,
    transition: FailureTransition,
    error: &str,
    now: DateTime<Utc>,
) -> Result<(), OutboxStoreError> {
    match transition {
        FailureTransition::Retry {
            retry_count,
            next_retry_at,
        } => {
            sqlx::query(
                r#"
                UPDATE integration_event_outbox
                SET status = 'failed',
                    retry_count = $2,
                    next_retry_at = $3,
                    last_error = $4,
                    updated_at = $5
                WHERE event_id = $1
                "#,
            )
            .bind(event_id)
            .bind(to_db_int(retry_count))
            .bind(next_retry_at)
            .bind(error)
            .bind(now)
            .execute(&mut **tx)
            .await
            .map_err(|e| map_sqlx_error("mark_failed", e))?;
        }
        FailureTransition::DeadLetter => {
            sqlx::query(
                r#"
                INSERT INTO integration_event_dead_letter (
                    event_id,
                    tenant_id,
                    event_name,
                    event_version,
                    payload,
                    retry_count,
                    error,
                    dead_at
                )
                SELECT event_id, tenant_id, event_name, event_version, payload, retry_count, $2, $3
                FROM integration_event_outbox
                WHERE event_id = $1
                "#,
            )
            .bind(event_id)
            .bind(error)
            .bind(now)
            .execute(&mut **tx)
            .await
            .map_err(|e| map_sqlx_error("insert_dead_letter", e))?;

            sqlx::query(
                r#"
                UPDATE integration_event_outbox
                SET status = 'dead',
                    last_error = $2,
                    updated_at = $3
                WHERE event_id = $1
                "#,
            )
            .bind(event_id)
            .bind(error)
            .bind(now)
            .execute(&mut **tx)
            .await
            .map_err(|e| map_sqlx_error("mark_dead", e))?;
        }
    }
    Ok(())
}

fn read_retry_count(row: &PgRow) -> Result<u32, OutboxStoreError> {
    let raw: i32 = row
        .try_get("retry_count")
        .map_err(|e| OutboxStoreError::Serialization(e.to_string()))?;
    from_db_int("retry_count", raw)
}

fn read_count(row: &PgRow) -> Result<usize, OutboxStoreError> {
    let n: i64 = row
        .try_get("n")
        .map_err(|e| OutboxStoreError::Serialization(e.to_string()))?;
    usize::try_from(n).map_err(|_| OutboxStoreError::Serialization(format!("negative count {n}")))
}

fn to_db_int(value: u32) -> i32 {
    i32::try_from(value).unwrap_or(i32::MAX)
}

fn to_db_limit(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

fn from_db_int(column: &str, value: i32) -> Result<u32, OutboxStoreError> {
    u32::try_from(value)
        .map_err(|_| OutboxStoreError::Serialization(format!("{column} out of range: {value}")))
}

/// Map SQLx errors to `OutboxStoreError`.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> OutboxStoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let code = db_err.code().map(|c| c.to_string()).unwrap_or_default();
            OutboxStoreError::Storage(format!(
                "database error in {operation} ({code}): {}",
                db_err.message()
            ))
        }
        sqlx::Error::PoolClosed => {
            OutboxStoreError::Storage(format!("connection pool closed in {operation}"))
        }
        sqlx::Error::RowNotFound => {
            OutboxStoreError::Storage(format!("unexpected row not found in {operation}"))
        }
        _ => OutboxStoreError::Storage(format!("sqlx error in {operation}: {err}")),
    }
}

/// Check if an error is a unique constraint violation.
fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => db_err.code().as_deref() == Some("23505"),
        _ => false,
    }
}

/// Row shape of `integration_event_outbox`.
#[derive(Debug)]
struct OutboxRow {
    event_id: Uuid,
    tenant_id: String,
    event_name: String,
    event_version: i32,
    partition_key: String,
    payload: serde_json::Value,
    status: String,
    retry_count: i32,
    next_retry_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl<'r> FromRow<'r, PgRow> for OutboxRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            event_id: row.try_get("event_id")?,
            tenant_id: row.try_get("tenant_id")?,
            event_name: row.try_get("event_name")?,
            event_version: row.try_get("event_version")?,
            partition_key: row.try_get("partition_key")?,
            payload: row.try_get("payload")?,
            status: row.try_get("status")?,
            retry_count: row.try_get("retry_count")?,
            next_retry_at: row.try_get("next_retry_at")?,
            last_error: row.try_get("last_error")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

impl TryFrom<OutboxRow> for OutboxRecord {
    type Error = OutboxStoreError;

    fn try_from(row: OutboxRow) -> Result<Self, Self::Error> {
        Ok(Self {
            event_id: EventId::from_uuid(row.event_id),
            tenant_id: TenantId::new(row.tenant_id)
                .map_err(|e| OutboxStoreError::Serialization(e.to_string()))?,
            event_name: row.event_name,
            event_version: from_db_int("event_version", row.event_version)?,
            partition_key: row.partition_key,
            payload: row.payload,
            status: row
                .status
                .parse()
                .map_err(OutboxStoreError::Serialization)?,
            retry_count: from_db_int("retry_count", row.retry_count)?,
            next_retry_at: row.next_retry_at,
            last_error: row.last_error,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

/// Row shape of `integration_event_dead_letter`.
#[derive(Debug)]
struct DeadLetterRow {
    event_id: Uuid,
    tenant_id: String,
    event_name: String,
    event_version: i32,
    payload: serde_json::Value,
    retry_count: i32,
    error: String,
    dead_at: DateTime<Utc>,
}

impl<'r> FromRow<'r, PgRow> for DeadLetterRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            event_id: row.try_get("event_id")?,
            tenant_id: row.try_get("tenant_id")?,
            event_name: row.try_get("event_name")?,
            event_version: row.try_get("event_version")?,
            payload: row.try_get("payload")?,
            retry_count: row.try_get("retry_count")?,
            error: row.try_get("error")?,
            dead_at: row.try_get("dead_at")?,
        })
    }
}

impl TryFrom<DeadLetterRow> for DeadLetterRecord {
    type Error = OutboxStoreError;

    fn try_from(row: DeadLetterRow) -> Result<Self, Self::Error> {
        Ok(Self {
            event_id: EventId::from_uuid(row.event_id),
            tenant_id: TenantId::new(row.tenant_id)
                .map_err(|e| OutboxStoreError::Serialization(e.to_string()))?,
            event_name: row.event_name,
            event_version: from_db_int("event_version", row.event_version)?,
            payload: row.payload,
            retry_count: from_db_int("retry_count", row.retry_count)?,
            error: row.error,
            dead_at: row.dead_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn non_database_errors_map_to_storage_with_operation() {
        let err = map_sqlx_error("claim_due", sqlx::Error::PoolClosed);
        assert_eq!(
            err,
            OutboxStoreError::Storage("connection pool closed in claim_due".to_string())
        );
        assert!(!is_unique_violation(&sqlx::Error::RowNotFound));
    }

    #[test]
    fn row_conversion_validates_columns() {
        let now = Utc::now();
        let row = OutboxRow {
            event_id: Uuid::now_v7(),
            tenant_id: "t-001".to_string(),
            event_name: "order.placed".to_string(),
            event_version: 1,
            partition_key: "t-001".to_string(),
            payload: serde_json::json!({}),
            status: "processing".to_string(),
            retry_count: 2,
            next_retry_at: None,
            last_error: None,
            created_at: now,
            updated_at: now,
        };
        let record = OutboxRecord::try_from(row).unwrap();
        assert_eq!(record.status, OutboxStatus::Processing);
        assert_eq!(record.retry_count, 2);

        let bad = OutboxRow {
            event_id: Uuid::now_v7(),
            tenant_id: String::new(),
            event_name: "order.placed".to_string(),
            event_version: 1,
            partition_key: "t-001".to_string(),
            payload: serde_json::json!({}),
            status: "pending".to_string(),
            retry_count: 0,
            next_retry_at: None,
            last_error: None,
            created_at: now,
            updated_at: now,
        };
        assert!(matches!(
            OutboxRecord::try_from(bad),
            Err(OutboxStoreError::Serialization(_))
        ));
    }

    #[test]
    fn db_integer_conversions_saturate_or_reject() {
        assert_eq!(to_db_int(u32::MAX), i32::MAX);
        assert_eq!(to_db_limit(5), 5);
        assert!(from_db_int("retry_count", -1).is_err());
    }
}
