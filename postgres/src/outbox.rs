//! `PostgreSQL` outbox.
//!
//! Aggregate stores call [`insert_record`] with their open transaction; the
//! relay uses [`PostgresOutboxStore`]. Relay order is the insertion sequence
//! (`seq`), which is commit order for records of the same aggregate because
//! aggregate writes are serialized.

use chrono::{DateTime, Utc};
use gavel_core::outbox::{OutboxError, OutboxRecord, OutboxStore};
use sqlx::{PgConnection, PgPool, Row};
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use uuid::Uuid;

/// Name of the single relay lease row.
const LEASE_NAME: &str = "outbox-relay";

pub(crate) fn storage_error(e: &sqlx::Error) -> OutboxError {
    OutboxError::Storage(e.to_string())
}

/// Append `record` using `conn`, typically a transaction that also writes the
/// aggregate change.
///
/// Returns `false` if a record with the same id already exists.
///
/// # Errors
///
/// Returns [`OutboxError::Storage`] if the insert fails.
pub async fn insert_record(conn: &mut PgConnection, record: &OutboxRecord) -> Result<bool, OutboxError> {
    let result = sqlx::query(
        r"
        INSERT INTO outbox (id, aggregate_id, message_type, payload, enqueued_at, sent_at)
        VALUES ($1, $2, $3, $4, $5, $6)
        ON CONFLICT (id) DO NOTHING
        ",
    )
    .bind(record.id)
    .bind(&record.aggregate_id)
    .bind(&record.message_type)
    .bind(&record.payload)
    .bind(record.enqueued_at)
    .bind(record.sent_at)
    .execute(conn)
    .await
    .map_err(|e| storage_error(&e))?;

    Ok(result.rows_affected() == 1)
}

fn row_to_record(row: &sqlx::postgres::PgRow) -> OutboxRecord {
    OutboxRecord {
        id: row.get("id"),
        aggregate_id: row.get("aggregate_id"),
        message_type: row.get("message_type"),
        payload: row.get("payload"),
        enqueued_at: row.get("enqueued_at"),
        sent_at: row.get("sent_at"),
    }
}

/// Relay-side view of the `outbox` table.
#[derive(Clone)]
pub struct PostgresOutboxStore {
    pool: PgPool,
}

impl PostgresOutboxStore {
    /// Create a store over an existing pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// The underlying pool.
    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }
}

impl OutboxStore for PostgresOutboxStore {
    fn append(
        &self,
        record: OutboxRecord,
    ) -> Pin<Box<dyn Future<Output = Result<bool, OutboxError>> + Send + '_>> {
        Box::pin(async move {
            let mut conn = self.pool.acquire().await.map_err(|e| storage_error(&e))?;
            insert_record(&mut conn, &record).await
        })
    }

    fn fetch_unsent(
        &self,
        limit: usize,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<OutboxRecord>, OutboxError>> + Send + '_>> {
        Box::pin(async move {
            let rows = sqlx::query(
                r"
                SELECT id, aggregate_id, message_type, payload, enqueued_at, sent_at
                FROM outbox
                WHERE sent_at IS NULL
                ORDER BY seq ASC
                LIMIT $1
                ",
            )
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await
            .map_err(|e| storage_error(&e))?;

            Ok(rows.iter().map(row_to_record).collect())
        })
    }

    fn mark_sent(
        &self,
        id: Uuid,
        sent_at: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<(), OutboxError>> + Send + '_>> {
        Box::pin(async move {
            let result = sqlx::query(
                r"
                UPDATE outbox
                SET sent_at = COALESCE(sent_at, $2)
                WHERE id = $1
                ",
            )
            .bind(id)
            .bind(sent_at)
            .execute(&self.pool)
            .await
            .map_err(|e| storage_error(&e))?;

            if result.rows_affected() == 0 {
                return Err(OutboxError::NotFound(id));
            }
            Ok(())
        })
    }

    fn purge_sent_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<u64, OutboxError>> + Send + '_>> {
        Box::pin(async move {
            let result = sqlx::query("DELETE FROM outbox WHERE sent_at IS NOT NULL AND sent_at < $1")
                .bind(cutoff)
                .execute(&self.pool)
                .await
                .map_err(|e| storage_error(&e))?;

            let purged = result.rows_affected();
            if purged > 0 {
                metrics::counter!("outbox.postgres.purged").increment(purged);
            }
            Ok(purged)
        })
    }

    fn try_acquire_lease(
        &self,
        holder: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<bool, OutboxError>> + Send + '_>> {
        let holder = holder.to_string();
        Box::pin(async move {
            let ttl = chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX);
            let expires_at = now.checked_add_signed(ttl).unwrap_or(DateTime::<Utc>::MAX_UTC);

            let row = sqlx::query(
                r"
                INSERT INTO relay_lease (name, holder, expires_at)
                VALUES ($1, $2, $3)
                ON CONFLICT (name) DO UPDATE
                SET holder = EXCLUDED.holder, expires_at = EXCLUDED.expires_at
                WHERE relay_lease.holder = EXCLUDED.holder OR relay_lease.expires_at <= $4
                RETURNING holder
                ",
            )
            .bind(LEASE_NAME)
            .bind(&holder)
            .bind(expires_at)
            .bind(now)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| storage_error(&e))?;

            let held = row.is_some();
            if !held {
                tracing::debug!(holder = %holder, "Relay lease held by another instance");
            }
            Ok(held)
        })
    }
}
