//! `PostgreSQL` inbox.
//!
//! Consumers call [`record`] inside the transaction that applies the message,
//! so the dedup row and the mutation commit together:
//!
//! ```text
//! BEGIN
//!   INSERT INTO inbox ... ON CONFLICT DO NOTHING   -- 0 rows → duplicate, ROLLBACK
//!   UPDATE search_items ...
//! COMMIT
//! ```

use gavel_core::inbox::InboxRecord;
use sqlx::PgConnection;
use uuid::Uuid;

/// Insert the dedup row for `record`.
///
/// Returns `false` if this consumer already processed the message.
///
/// # Errors
///
/// Returns the database error if the insert fails.
pub async fn record(conn: &mut PgConnection, record: &InboxRecord) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        r"
        INSERT INTO inbox (consumer_id, message_id, processed_at)
        VALUES ($1, $2, $3)
        ON CONFLICT (consumer_id, message_id) DO NOTHING
        ",
    )
    .bind(&record.consumer_id)
    .bind(record.message_id)
    .bind(record.processed_at)
    .execute(conn)
    .await?;

    Ok(result.rows_affected() == 1)
}

/// Whether `consumer_id` already processed `message_id`.
///
/// # Errors
///
/// Returns the database error if the query fails.
pub async fn contains(conn: &mut PgConnection, consumer_id: &str, message_id: Uuid) -> Result<bool, sqlx::Error> {
    let (exists,): (bool,) = sqlx::query_as(
        "SELECT EXISTS (SELECT 1 FROM inbox WHERE consumer_id = $1 AND message_id = $2)",
    )
    .bind(consumer_id)
    .bind(message_id)
    .fetch_one(conn)
    .await?;

    Ok(exists)
}
