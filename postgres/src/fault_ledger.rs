//! Fault ledger for dead-lettered messages.
//!
//! Persistent storage for dead letters the compensator could not correct,
//! plus the set of dead letters it did correct. Escalated rows carry the full
//! envelope so an operator can inspect, fix and reprocess them.

use chrono::{DateTime, Utc};
use gavel_core::fault::{FaultLedger, FaultLedgerError, FaultRecord, FaultStatus};
use gavel_core::message::MessageEnvelope;
use sqlx::{PgPool, Row};
use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use uuid::Uuid;

fn storage_error(e: &sqlx::Error) -> FaultLedgerError {
    FaultLedgerError::Storage(e.to_string())
}

/// `PostgreSQL`-backed fault ledger.
///
/// Besides the [`FaultLedger`] operations used by the compensator, exposes the
/// operator workflow:
/// - list pending faults, oldest first
/// - move a fault to processing / resolved / discarded
/// - count pending faults for health checks
///
/// # Example
///
/// ```no_run
/// use gavel_postgres::PostgresFaultLedger;
/// use gavel_core::fault::FaultStatus;
///
/// # async fn example(pool: sqlx::PgPool) -> Result<(), Box<dyn std::error::Error>> {
/// let ledger = PostgresFaultLedger::new(pool);
///
/// let pending = ledger.list_pending(100).await?;
/// println!("Pending faults: {}", pending.len());
///
/// if let Some(fault) = pending.first() {
///     ledger.update_status(fault.message_id(), FaultStatus::Processing).await?;
/// }
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct PostgresFaultLedger {
    pool: PgPool,
}

impl PostgresFaultLedger {
    /// Create a ledger with the given connection pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Faults awaiting an operator, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`FaultLedgerError::Storage`] if the query fails.
    pub async fn list_pending(&self, limit: usize) -> Result<Vec<FaultRecord>, FaultLedgerError> {
        self.list_by_status(FaultStatus::Pending, limit).await
    }

    /// Faults in `status`, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`FaultLedgerError::Storage`] if the query fails, or
    /// [`FaultLedgerError::InvalidStatus`] if a row holds an unknown status.
    pub async fn list_by_status(
        &self,
        status: FaultStatus,
        limit: usize,
    ) -> Result<Vec<FaultRecord>, FaultLedgerError> {
        let rows = sqlx::query(
            r"
            SELECT
                message_id, message_type, aggregate_id, payload, sent_at, headers,
                exception_type, attempt_count, first_failed_at, reason, queue,
                status, recorded_at
            FROM failed_messages
            WHERE status = $1
            ORDER BY first_failed_at ASC
            LIMIT $2
            ",
        )
        .bind(status.as_str())
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| storage_error(&e))?;

        rows.iter().map(Self::row_to_fault).collect()
    }

    /// The fault recorded for a dead-lettered message.
    ///
    /// # Errors
    ///
    /// Returns [`FaultLedgerError::NotFound`] if there is none, or
    /// [`FaultLedgerError::Storage`] if the query fails.
    pub async fn get(&self, message_id: Uuid) -> Result<FaultRecord, FaultLedgerError> {
        let row = sqlx::query(
            r"
            SELECT
                message_id, message_type, aggregate_id, payload, sent_at, headers,
                exception_type, attempt_count, first_failed_at, reason, queue,
                status, recorded_at
            FROM failed_messages
            WHERE message_id = $1
            ",
        )
        .bind(message_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| storage_error(&e))?
        .ok_or(FaultLedgerError::NotFound(message_id))?;

        Self::row_to_fault(&row)
    }

    /// Move a fault to `status`.
    ///
    /// # Errors
    ///
    /// Returns [`FaultLedgerError::NotFound`] if there is no such fault, or
    /// [`FaultLedgerError::Storage`] if the update fails.
    pub async fn update_status(&self, message_id: Uuid, status: FaultStatus) -> Result<(), FaultLedgerError> {
        let result = sqlx::query("UPDATE failed_messages SET status = $1 WHERE message_id = $2")
            .bind(status.as_str())
            .bind(message_id)
            .execute(&self.pool)
            .await
            .map_err(|e| storage_error(&e))?;

        if result.rows_affected() == 0 {
            return Err(FaultLedgerError::NotFound(message_id));
        }

        tracing::info!(message_id = %message_id, status = status.as_str(), "Fault status updated");
        Ok(())
    }

    /// Mark a fault resolved by `resolved_by`.
    ///
    /// # Errors
    ///
    /// Returns [`FaultLedgerError::Storage`] if the update fails.
    pub async fn mark_resolved(
        &self,
        message_id: Uuid,
        resolved_by: &str,
        notes: Option<&str>,
    ) -> Result<(), FaultLedgerError> {
        sqlx::query(
            r"
            UPDATE failed_messages
            SET status = 'resolved',
                resolved_at = NOW(),
                resolved_by = $1,
                resolution_notes = $2
            WHERE message_id = $3
            ",
        )
        .bind(resolved_by)
        .bind(notes)
        .bind(message_id)
        .execute(&self.pool)
        .await
        .map_err(|e| storage_error(&e))?;

        tracing::info!(message_id = %message_id, resolved_by, "Fault marked as resolved");
        metrics::counter!("fault_ledger.resolved").increment(1);
        Ok(())
    }

    /// Mark a fault permanently discarded.
    ///
    /// # Errors
    ///
    /// Returns [`FaultLedgerError::Storage`] if the update fails.
    pub async fn mark_discarded(&self, message_id: Uuid, reason: &str) -> Result<(), FaultLedgerError> {
        sqlx::query(
            r"
            UPDATE failed_messages
            SET status = 'discarded',
                resolved_at = NOW(),
                resolution_notes = $1
            WHERE message_id = $2
            ",
        )
        .bind(reason)
        .bind(message_id)
        .execute(&self.pool)
        .await
        .map_err(|e| storage_error(&e))?;

        tracing::warn!(message_id = %message_id, reason, "Fault marked as discarded");
        metrics::counter!("fault_ledger.discarded").increment(1);
        Ok(())
    }

    /// Number of faults awaiting an operator.
    ///
    /// # Errors
    ///
    /// Returns [`FaultLedgerError::Storage`] if the query fails.
    pub async fn count_pending(&self) -> Result<i64, FaultLedgerError> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM failed_messages WHERE status = 'pending'")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| storage_error(&e))?;

        Ok(count)
    }

    /// Id the correction of `message_id` was republished under.
    ///
    /// # Errors
    ///
    /// Returns [`FaultLedgerError::Storage`] if the query fails.
    pub async fn republished_id(&self, message_id: Uuid) -> Result<Option<Uuid>, FaultLedgerError> {
        let row: Option<(Uuid,)> =
            sqlx::query_as("SELECT republished_id FROM corrected_messages WHERE message_id = $1")
                .bind(message_id)
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| storage_error(&e))?;

        Ok(row.map(|(id,)| id))
    }

    fn row_to_fault(row: &sqlx::postgres::PgRow) -> Result<FaultRecord, FaultLedgerError> {
        let status_str: String = row.get("status");
        let status = FaultStatus::parse(&status_str)?;

        let headers_json: serde_json::Value = row.get("headers");
        let headers: BTreeMap<String, String> = serde_json::from_value(headers_json)
            .map_err(|e| FaultLedgerError::Storage(format!("invalid fault headers: {e}")))?;

        let attempt_count: i32 = row.get("attempt_count");

        Ok(FaultRecord {
            original_message: MessageEnvelope {
                message_id: row.get("message_id"),
                message_type: row.get("message_type"),
                aggregate_id: row.get("aggregate_id"),
                payload: row.get("payload"),
                sent_at: row.get("sent_at"),
                headers,
            },
            exception_type: row.get("exception_type"),
            attempt_count: u32::try_from(attempt_count).unwrap_or(0),
            first_failed_at: row.get("first_failed_at"),
            reason: row.get("reason"),
            queue: row.get("queue"),
            status,
            recorded_at: row.get("recorded_at"),
        })
    }
}

impl FaultLedger for PostgresFaultLedger {
    fn is_corrected(
        &self,
        message_id: Uuid,
    ) -> Pin<Box<dyn Future<Output = Result<bool, FaultLedgerError>> + Send + '_>> {
        Box::pin(async move {
            let (exists,): (bool,) =
                sqlx::query_as("SELECT EXISTS (SELECT 1 FROM corrected_messages WHERE message_id = $1)")
                    .bind(message_id)
                    .fetch_one(&self.pool)
                    .await
                    .map_err(|e| storage_error(&e))?;
            Ok(exists)
        })
    }

    fn mark_corrected(
        &self,
        message_id: Uuid,
        republished_id: Uuid,
        corrected_at: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<bool, FaultLedgerError>> + Send + '_>> {
        Box::pin(async move {
            let result = sqlx::query(
                r"
                INSERT INTO corrected_messages (message_id, republished_id, corrected_at)
                VALUES ($1, $2, $3)
                ON CONFLICT (message_id) DO NOTHING
                ",
            )
            .bind(message_id)
            .bind(republished_id)
            .bind(corrected_at)
            .execute(&self.pool)
            .await
            .map_err(|e| storage_error(&e))?;

            Ok(result.rows_affected() == 1)
        })
    }

    fn escalate(
        &self,
        record: FaultRecord,
    ) -> Pin<Box<dyn Future<Output = Result<bool, FaultLedgerError>> + Send + '_>> {
        Box::pin(async move {
            let envelope = &record.original_message;
            let headers = serde_json::to_value(&envelope.headers)
                .map_err(|e| FaultLedgerError::Storage(format!("invalid fault headers: {e}")))?;

            let result = sqlx::query(
                r"
                INSERT INTO failed_messages (
                    message_id, message_type, aggregate_id, payload, sent_at, headers,
                    exception_type, attempt_count, first_failed_at, reason, queue,
                    status, recorded_at
                ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
                ON CONFLICT (message_id) DO NOTHING
                ",
            )
            .bind(envelope.message_id)
            .bind(&envelope.message_type)
            .bind(&envelope.aggregate_id)
            .bind(&envelope.payload)
            .bind(envelope.sent_at)
            .bind(headers)
            .bind(&record.exception_type)
            .bind(i32::try_from(record.attempt_count).unwrap_or(i32::MAX))
            .bind(record.first_failed_at)
            .bind(&record.reason)
            .bind(&record.queue)
            .bind(record.status.as_str())
            .bind(record.recorded_at)
            .execute(&self.pool)
            .await
            .map_err(|e| storage_error(&e))?;

            let inserted = result.rows_affected() == 1;
            if inserted {
                tracing::warn!(
                    message_id = %envelope.message_id,
                    message_type = %envelope.message_type,
                    exception_type = %record.exception_type,
                    attempts = record.attempt_count,
                    "Fault added to ledger"
                );
                metrics::counter!("fault_ledger.added", "message_type" => envelope.message_type.clone())
                    .increment(1);
            }
            Ok(inserted)
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)] // Test code can use unwrap/expect
mod tests {
    use super::*;

    #[test]
    fn fault_status_roundtrip() {
        for status in &[
            FaultStatus::Pending,
            FaultStatus::Processing,
            FaultStatus::Resolved,
            FaultStatus::Discarded,
        ] {
            let parsed = FaultStatus::parse(status.as_str()).expect("valid status should parse");
            assert_eq!(*status, parsed);
        }
    }

    #[test]
    fn headers_survive_json_column() {
        let mut headers = BTreeMap::new();
        headers.insert("fault-exception-type".to_string(), "InvalidArgument".to_string());
        let json = serde_json::to_value(&headers).unwrap();
        let back: BTreeMap<String, String> = serde_json::from_value(json).unwrap();
        assert_eq!(back, headers);
    }
}
