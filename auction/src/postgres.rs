//! `PostgreSQL` authority and bid stores.
//!
//! `commit` runs the aggregate write and the outbox inserts in one SQL
//! transaction. Updates are a compare-and-swap on `updated_at`; reconciler
//! writes lock the row with `SELECT … FOR UPDATE` and record the inbox entry in
//! the same transaction.
//!
//! The bid store serializes placements per auction with a transaction-scoped
//! advisory lock and writes its records to the same `outbox` table, so one
//! relay drains both sides.

use crate::bids::{BidServiceError, BidStore, BidStoreError, PendingBid};
use crate::model::{Auction, AuctionStatus, Bid, BidStatus, Item};
use crate::reconciler::Reconciliation;
use crate::store::{AuctionChange, AuctionStore, ModificationCursor, ReconcileOutcome, StoreError};
use chrono::{DateTime, Utc};
use gavel_core::inbox::InboxRecord;
use gavel_core::outbox::OutboxRecord;
use gavel_postgres::{inbox, outbox};
use sqlx::{PgConnection, PgPool, Row};
use std::future::Future;
use std::pin::Pin;
use uuid::Uuid;

/// DDL for the `auctions`, `search_items`, `bids` and `finished_auctions` tables.
pub const SCHEMA: &str = include_str!("schema.sql");

/// Create the protocol tables and the auction tables if they do not exist.
///
/// # Errors
///
/// Returns the database error if any statement fails.
pub async fn apply_schema(pool: &PgPool) -> Result<(), sqlx::Error> {
    gavel_postgres::apply_schema(pool).await?;
    sqlx::raw_sql(SCHEMA).execute(pool).await?;
    tracing::info!("Auction schema applied");
    Ok(())
}

pub(crate) const AUCTION_COLUMNS: &str = "id, reserve_price, seller, winner, sold_amount, current_high_bid, \
     created_at, updated_at, auction_end, status, make, model, year, color, mileage, image_url";

fn storage_error(e: &sqlx::Error) -> StoreError {
    StoreError::Storage(e.to_string())
}

pub(crate) fn parse_status(status: &str) -> Result<AuctionStatus, String> {
    AuctionStatus::parse(status).ok_or_else(|| format!("unknown auction status '{status}'"))
}

fn row_to_auction(row: &sqlx::postgres::PgRow) -> Result<Auction, StoreError> {
    let status: String = row.get("status");
    Ok(Auction {
        id: row.get("id"),
        reserve_price: row.get("reserve_price"),
        seller: row.get("seller"),
        winner: row.get("winner"),
        sold_amount: row.get("sold_amount"),
        current_high_bid: row.get("current_high_bid"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
        auction_end: row.get("auction_end"),
        status: parse_status(&status).map_err(StoreError::Storage)?,
        item: Item {
            make: row.get("make"),
            model: row.get("model"),
            year: row.get("year"),
            color: row.get("color"),
            mileage: row.get("mileage"),
            image_url: row.get("image_url"),
        },
    })
}

async fn insert_auction(conn: &mut PgConnection, auction: &Auction) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        r"
        INSERT INTO auctions (id, reserve_price, seller, winner, sold_amount, current_high_bid,
                              created_at, updated_at, auction_end, status,
                              make, model, year, color, mileage, image_url)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
        ON CONFLICT (id) DO NOTHING
        ",
    )
    .bind(auction.id)
    .bind(auction.reserve_price)
    .bind(&auction.seller)
    .bind(&auction.winner)
    .bind(auction.sold_amount)
    .bind(auction.current_high_bid)
    .bind(auction.created_at)
    .bind(auction.updated_at)
    .bind(auction.auction_end)
    .bind(auction.status.as_str())
    .bind(&auction.item.make)
    .bind(&auction.item.model)
    .bind(auction.item.year)
    .bind(&auction.item.color)
    .bind(auction.item.mileage)
    .bind(&auction.item.image_url)
    .execute(conn)
    .await?;

    Ok(result.rows_affected() == 1)
}

/// Item columns and `updated_at` only; the reconciler owns the bidding columns.
async fn update_auction(
    conn: &mut PgConnection,
    auction: &Auction,
    expected_updated_at: DateTime<Utc>,
) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        r"
        UPDATE auctions
        SET updated_at = $2, make = $3, model = $4, year = $5, color = $6, mileage = $7, image_url = $8
        WHERE id = $1 AND updated_at = $9
        ",
    )
    .bind(auction.id)
    .bind(auction.updated_at)
    .bind(&auction.item.make)
    .bind(&auction.item.model)
    .bind(auction.item.year)
    .bind(&auction.item.color)
    .bind(auction.item.mileage)
    .bind(&auction.item.image_url)
    .bind(expected_updated_at)
    .execute(conn)
    .await?;

    Ok(result.rows_affected() == 1)
}

async fn exists(conn: &mut PgConnection, id: Uuid) -> Result<bool, sqlx::Error> {
    let (exists,): (bool,) = sqlx::query_as("SELECT EXISTS (SELECT 1 FROM auctions WHERE id = $1)")
        .bind(id)
        .fetch_one(conn)
        .await?;
    Ok(exists)
}

/// Authority store on a `PgPool`. Also serves the relay through
/// [`gavel_postgres::PostgresOutboxStore`] over the same pool.
#[derive(Clone)]
pub struct PostgresAuctionStore {
    pool: PgPool,
}

impl PostgresAuctionStore {
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

    async fn apply_change(conn: &mut PgConnection, change: &AuctionChange) -> Result<(), StoreError> {
        match change {
            AuctionChange::Create(auction) => {
                if !insert_auction(conn, auction).await.map_err(|e| storage_error(&e))? {
                    return Err(StoreError::AlreadyExists(auction.id));
                }
            }
            AuctionChange::Update {
                auction,
                expected_updated_at,
            } => {
                if !update_auction(conn, auction, *expected_updated_at)
                    .await
                    .map_err(|e| storage_error(&e))?
                {
                    return if exists(conn, auction.id).await.map_err(|e| storage_error(&e))? {
                        Err(StoreError::Conflict(auction.id))
                    } else {
                        Err(StoreError::NotFound(auction.id))
                    };
                }
            }
            AuctionChange::Delete(id) => {
                let result = sqlx::query("DELETE FROM auctions WHERE id = $1")
                    .bind(id)
                    .execute(conn)
                    .await
                    .map_err(|e| storage_error(&e))?;
                if result.rows_affected() == 0 {
                    return Err(StoreError::NotFound(*id));
                }
            }
        }
        Ok(())
    }
}

impl AuctionStore for PostgresAuctionStore {
    fn get(&self, id: Uuid) -> Pin<Box<dyn Future<Output = Result<Option<Auction>, StoreError>> + Send + '_>> {
        Box::pin(async move {
            let row = sqlx::query(&format!("SELECT {AUCTION_COLUMNS} FROM auctions WHERE id = $1"))
                .bind(id)
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| storage_error(&e))?;
            row.as_ref().map(row_to_auction).transpose()
        })
    }

    fn updated_after(
        &self,
        after: Option<ModificationCursor>,
        limit: usize,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<Auction>, StoreError>> + Send + '_>> {
        Box::pin(async move {
            let rows = sqlx::query(&format!(
                "SELECT {AUCTION_COLUMNS} FROM auctions
                 WHERE $1::timestamptz IS NULL OR (updated_at, id) > ($1::timestamptz, $2::uuid)
                 ORDER BY updated_at ASC, id ASC
                 LIMIT $3"
            ))
            .bind(after.map(|(updated_at, _)| updated_at))
            .bind(after.map(|(_, id)| id))
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await
            .map_err(|e| storage_error(&e))?;
            rows.iter().map(row_to_auction).collect()
        })
    }

    fn ended_live(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<Auction>, StoreError>> + Send + '_>> {
        Box::pin(async move {
            let rows = sqlx::query(&format!(
                "SELECT {AUCTION_COLUMNS} FROM auctions
                 WHERE status = 'Live' AND auction_end <= $1
                 ORDER BY auction_end ASC, id ASC
                 LIMIT $2"
            ))
            .bind(now)
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await
            .map_err(|e| storage_error(&e))?;
            rows.iter().map(row_to_auction).collect()
        })
    }

    fn commit(
        &self,
        change: AuctionChange,
        records: Vec<OutboxRecord>,
    ) -> Pin<Box<dyn Future<Output = Result<(), StoreError>> + Send + '_>> {
        Box::pin(async move {
            let mut tx = self.pool.begin().await.map_err(|e| storage_error(&e))?;

            Self::apply_change(&mut tx, &change).await?;
            for record in &records {
                if !outbox::insert_record(&mut tx, record).await? {
                    return Err(StoreError::Storage(format!("duplicate outbox record {}", record.id)));
                }
            }

            tx.commit().await.map_err(|e| storage_error(&e))?;
            Ok(())
        })
    }

    fn reconcile(
        &self,
        inbox: InboxRecord,
        auction_id: Uuid,
        change: Reconciliation,
    ) -> Pin<Box<dyn Future<Output = Result<ReconcileOutcome, StoreError>> + Send + '_>> {
        Box::pin(async move {
            let mut tx = self.pool.begin().await.map_err(|e| storage_error(&e))?;

            if inbox::contains(&mut tx, &inbox.consumer_id, inbox.message_id)
                .await
                .map_err(|e| storage_error(&e))?
            {
                return Ok(ReconcileOutcome::Duplicate);
            }

            let row = sqlx::query(&format!("SELECT {AUCTION_COLUMNS} FROM auctions WHERE id = $1 FOR UPDATE"))
                .bind(auction_id)
                .fetch_optional(&mut *tx)
                .await
                .map_err(|e| storage_error(&e))?;
            let Some(row) = row else {
                return Ok(ReconcileOutcome::Missing);
            };
            let mut auction = row_to_auction(&row)?;

            let changed = change.apply(&mut auction);
            if changed {
                sqlx::query(
                    r"
                    UPDATE auctions
                    SET winner = $2, sold_amount = $3, current_high_bid = $4, status = $5
                    WHERE id = $1
                    ",
                )
                .bind(auction.id)
                .bind(&auction.winner)
                .bind(auction.sold_amount)
                .bind(auction.current_high_bid)
                .bind(auction.status.as_str())
                .execute(&mut *tx)
                .await
                .map_err(|e| storage_error(&e))?;
            }

            if !inbox::record(&mut tx, &inbox).await.map_err(|e| storage_error(&e))? {
                return Ok(ReconcileOutcome::Duplicate);
            }
            tx.commit().await.map_err(|e| storage_error(&e))?;

            Ok(if changed {
                ReconcileOutcome::Applied
            } else {
                ReconcileOutcome::Unchanged
            })
        })
    }
}

fn bid_storage_error(e: &sqlx::Error) -> BidStoreError {
    BidStoreError::Storage(e.to_string())
}

fn row_to_bid(row: &sqlx::postgres::PgRow) -> Result<Bid, BidStoreError> {
    let status: String = row.get("bid_status");
    Ok(Bid {
        id: row.get("id"),
        auction_id: row.get("auction_id"),
        bidder: row.get("bidder"),
        amount: row.get("amount"),
        bid_time: row.get("bid_time"),
        bid_status: BidStatus::parse(&status)
            .ok_or_else(|| BidStoreError::Storage(format!("unknown bid status '{status}'")))?,
    })
}

/// Bid store on a `PgPool`, sharing the authority's `outbox` table.
#[derive(Clone)]
pub struct PostgresBidStore {
    pool: PgPool,
}

impl PostgresBidStore {
    /// Create a store over an existing pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

impl BidStore for PostgresBidStore {
    fn place(&self, pending: PendingBid) -> Pin<Box<dyn Future<Output = Result<Bid, BidServiceError>> + Send + '_>> {
        Box::pin(async move {
            let mut tx = self.pool.begin().await.map_err(|e| bid_storage_error(&e))?;

            // Held until commit or rollback.
            sqlx::query("SELECT pg_advisory_xact_lock(hashtextextended($1, 0))")
                .bind(pending.auction_id.to_string())
                .execute(&mut *tx)
                .await
                .map_err(|e| bid_storage_error(&e))?;

            let known_high: Option<i64> = sqlx::query_scalar(
                "SELECT MAX(amount) FROM bids
                 WHERE auction_id = $1 AND bid_status IN ('Accepted', 'AcceptedBelowReserve')",
            )
            .bind(pending.auction_id)
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| bid_storage_error(&e))?;

            let (bid, record) = pending.decide(known_high)?;
            sqlx::query(
                r"
                INSERT INTO bids (id, auction_id, bidder, amount, bid_time, bid_status)
                VALUES ($1, $2, $3, $4, $5, $6)
                ",
            )
            .bind(bid.id)
            .bind(bid.auction_id)
            .bind(&bid.bidder)
            .bind(bid.amount)
            .bind(bid.bid_time)
            .bind(bid.bid_status.as_str())
            .execute(&mut *tx)
            .await
            .map_err(|e| bid_storage_error(&e))?;

            if !outbox::insert_record(&mut tx, &record).await.map_err(BidStoreError::from)? {
                return Err(BidStoreError::Storage(format!("duplicate outbox record {}", record.id)).into());
            }

            tx.commit().await.map_err(|e| bid_storage_error(&e))?;
            Ok(bid)
        })
    }

    fn bids_for(&self, auction_id: Uuid) -> Pin<Box<dyn Future<Output = Result<Vec<Bid>, BidStoreError>> + Send + '_>> {
        Box::pin(async move {
            let rows = sqlx::query(
                "SELECT id, auction_id, bidder, amount, bid_time, bid_status FROM bids
                 WHERE auction_id = $1
                 ORDER BY amount DESC, bid_time ASC",
            )
            .bind(auction_id)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| bid_storage_error(&e))?;
            rows.iter().map(row_to_bid).collect()
        })
    }

    fn winning_bid(
        &self,
        auction_id: Uuid,
    ) -> Pin<Box<dyn Future<Output = Result<Option<Bid>, BidStoreError>> + Send + '_>> {
        Box::pin(async move {
            let row = sqlx::query(
                "SELECT id, auction_id, bidder, amount, bid_time, bid_status FROM bids
                 WHERE auction_id = $1 AND bid_status = 'Accepted'
                 ORDER BY amount DESC, bid_time ASC
                 LIMIT 1",
            )
            .bind(auction_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| bid_storage_error(&e))?;
            row.as_ref().map(row_to_bid).transpose()
        })
    }

    fn is_finished(&self, auction_id: Uuid) -> Pin<Box<dyn Future<Output = Result<bool, BidStoreError>> + Send + '_>> {
        Box::pin(async move {
            let (finished,): (bool,) =
                sqlx::query_as("SELECT EXISTS (SELECT 1 FROM finished_auctions WHERE auction_id = $1)")
                    .bind(auction_id)
                    .fetch_one(&self.pool)
                    .await
                    .map_err(|e| bid_storage_error(&e))?;
            Ok(finished)
        })
    }

    fn record_finish(
        &self,
        auction_id: Uuid,
        record: OutboxRecord,
    ) -> Pin<Box<dyn Future<Output = Result<bool, BidStoreError>> + Send + '_>> {
        Box::pin(async move {
            let mut tx = self.pool.begin().await.map_err(|e| bid_storage_error(&e))?;

            let marked = sqlx::query(
                "INSERT INTO finished_auctions (auction_id, finished_at) VALUES ($1, $2)
                 ON CONFLICT (auction_id) DO NOTHING",
            )
            .bind(auction_id)
            .bind(record.enqueued_at)
            .execute(&mut *tx)
            .await
            .map_err(|e| bid_storage_error(&e))?;
            if marked.rows_affected() == 0 {
                return Ok(false);
            }

            if !outbox::insert_record(&mut tx, &record).await? {
                return Err(BidStoreError::Storage(format!("duplicate outbox record {}", record.id)));
            }
            tx.commit().await.map_err(|e| bid_storage_error(&e))?;
            Ok(true)
        })
    }
}
