//! `PostgreSQL` storage for the Gavel consistency protocol.
//!
//! This crate provides the durable halves of the protocol on top of sqlx:
//!
//! - [`PostgresOutboxStore`]: outbox relay view (fetch, mark sent, purge, lease)
//! - [`outbox::insert_record`]: append inside a caller's transaction so the
//!   record commits with the aggregate change
//! - [`inbox`]: `(consumer_id, message_id)` dedup rows, written in the
//!   consumer's transaction
//! - [`PostgresFaultLedger`]: escalated dead letters and corrected-message bookkeeping
//!
//! # Example
//!
//! ```ignore
//! use gavel_postgres::{PostgresOutboxStore, apply_schema};
//!
//! async fn example() -> Result<(), Box<dyn std::error::Error>> {
//!     let pool = sqlx::PgPool::connect("postgres://localhost/auctions").await?;
//!     apply_schema(&pool).await?;
//!     let outbox = PostgresOutboxStore::new(pool);
//!     Ok(())
//! }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod fault_ledger;
pub mod inbox;
pub mod outbox;

pub use fault_ledger::PostgresFaultLedger;
pub use outbox::PostgresOutboxStore;

/// DDL for the outbox, relay lease, inbox and fault ledger tables.
pub const SCHEMA: &str = include_str!("schema.sql");

/// Create the protocol tables if they do not exist.
///
/// # Errors
///
/// Returns the database error if any statement fails.
pub async fn apply_schema(pool: &sqlx::PgPool) -> Result<(), sqlx::Error> {
    sqlx::raw_sql(SCHEMA).execute(pool).await?;
    tracing::info!("Protocol schema applied");
    Ok(())
}
