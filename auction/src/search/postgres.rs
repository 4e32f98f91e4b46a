//! `PostgreSQL` search store.
//!
//! `apply` locks the target row, evaluates the change with the same
//! [`apply_change`] the in-memory store uses, writes the result and records the
//! inbox entry, all in one transaction.

use crate::postgres::{AUCTION_COLUMNS, parse_status};
use crate::search::model::SearchItem;
use crate::search::query::{ENDING_SOON_WINDOW, FilterBy, OrderBy, SearchPage, SearchQuery};
use crate::search::store::{ApplyOutcome, SearchChange, SearchError, SearchStore, apply_change};
use chrono::{DateTime, Utc};
use gavel_core::inbox::InboxRecord;
use gavel_postgres::inbox;
use sqlx::{PgConnection, PgPool, Row};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use uuid::Uuid;

const WHERE_CLAUSE: &str = r"
    WHERE ($1::text IS NULL OR make ILIKE $1 OR model ILIKE $1 OR color ILIKE $1)
      AND ($2::text IS NULL OR seller = $2)
      AND ($3::text IS NULL OR winner = $3)
      AND (CASE $4::text
             WHEN 'finished' THEN auction_end < $5
             WHEN 'endingSoon' THEN auction_end > $5 AND auction_end < $6
             WHEN 'live' THEN auction_end > $5
             ELSE TRUE
           END)
";

fn storage_error(e: &sqlx::Error) -> SearchError {
    SearchError::Storage(e.to_string())
}

fn row_to_item(row: &sqlx::postgres::PgRow) -> Result<SearchItem, SearchError> {
    let status: String = row.get("status");
    Ok(SearchItem {
        id: row.get("id"),
        reserve_price: row.get("reserve_price"),
        seller: row.get("seller"),
        winner: row.get("winner"),
        sold_amount: row.get("sold_amount"),
        current_high_bid: row.get("current_high_bid"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
        auction_end: row.get("auction_end"),
        status: parse_status(&status).map_err(SearchError::Storage)?,
        make: row.get("make"),
        model: row.get("model"),
        year: row.get("year"),
        color: row.get("color"),
        mileage: row.get("mileage"),
        image_url: row.get("image_url"),
    })
}

fn like_pattern(term: &str) -> String {
    let escaped = term.replace('\\', "\\\\").replace('%', "\\%").replace('_', "\\_");
    format!("%{escaped}%")
}

const fn filter_name(filter: Option<FilterBy>) -> Option<&'static str> {
    match filter {
        Some(FilterBy::Finished) => Some("finished"),
        Some(FilterBy::EndingSoon) => Some("endingSoon"),
        Some(FilterBy::Live) => Some("live"),
        None => None,
    }
}

const fn order_clause(order: OrderBy) -> &'static str {
    match order {
        OrderBy::Make => "ORDER BY make ASC, model ASC, id ASC",
        OrderBy::New => "ORDER BY created_at DESC, id ASC",
        OrderBy::EndingSoon => "ORDER BY auction_end ASC, id ASC",
    }
}

async fn load_for_update(conn: &mut PgConnection, id: Uuid) -> Result<Option<SearchItem>, SearchError> {
    let row = sqlx::query(&format!("SELECT {AUCTION_COLUMNS} FROM search_items WHERE id = $1 FOR UPDATE"))
        .bind(id)
        .fetch_optional(conn)
        .await
        .map_err(|e| storage_error(&e))?;
    row.as_ref().map(row_to_item).transpose()
}

async fn write_item(conn: &mut PgConnection, item: &SearchItem) -> Result<(), SearchError> {
    sqlx::query(
        r"
        INSERT INTO search_items (id, reserve_price, seller, winner, sold_amount, current_high_bid,
                                  created_at, updated_at, auction_end, status,
                                  make, model, year, color, mileage, image_url)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
        ON CONFLICT (id) DO UPDATE SET
            reserve_price = EXCLUDED.reserve_price, seller = EXCLUDED.seller,
            winner = EXCLUDED.winner, sold_amount = EXCLUDED.sold_amount,
            current_high_bid = EXCLUDED.current_high_bid, created_at = EXCLUDED.created_at,
            updated_at = EXCLUDED.updated_at, auction_end = EXCLUDED.auction_end,
            status = EXCLUDED.status, make = EXCLUDED.make, model = EXCLUDED.model,
            year = EXCLUDED.year, color = EXCLUDED.color, mileage = EXCLUDED.mileage,
            image_url = EXCLUDED.image_url
        ",
    )
    .bind(item.id)
    .bind(item.reserve_price)
    .bind(&item.seller)
    .bind(&item.winner)
    .bind(item.sold_amount)
    .bind(item.current_high_bid)
    .bind(item.created_at)
    .bind(item.updated_at)
    .bind(item.auction_end)
    .bind(item.status.as_str())
    .bind(&item.make)
    .bind(&item.model)
    .bind(item.year)
    .bind(&item.color)
    .bind(item.mileage)
    .bind(&item.image_url)
    .execute(conn)
    .await
    .map_err(|e| storage_error(&e))?;
    Ok(())
}

/// Evaluate `change` against the locked row and persist the result.
async fn apply_locked(conn: &mut PgConnection, change: SearchChange) -> Result<ApplyOutcome, SearchError> {
    let id = change.item_id();
    let mut items = HashMap::new();
    if let Some(current) = load_for_update(conn, id).await? {
        items.insert(id, current);
    }

    let outcome = apply_change(&mut items, change);
    if outcome == ApplyOutcome::Applied {
        match items.get(&id) {
            Some(item) => write_item(conn, item).await?,
            None => {
                sqlx::query("DELETE FROM search_items WHERE id = $1")
                    .bind(id)
                    .execute(conn)
                    .await
                    .map_err(|e| storage_error(&e))?;
            }
        }
    }
    Ok(outcome)
}

/// Search projection on a `PgPool`.
#[derive(Clone)]
pub struct PostgresSearchStore {
    pool: PgPool,
}

impl PostgresSearchStore {
    /// Create a store over an existing pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

impl SearchStore for PostgresSearchStore {
    fn apply(
        &self,
        inbox: InboxRecord,
        change: SearchChange,
    ) -> Pin<Box<dyn Future<Output = Result<ApplyOutcome, SearchError>> + Send + '_>> {
        Box::pin(async move {
            let mut tx = self.pool.begin().await.map_err(|e| storage_error(&e))?;

            if inbox::contains(&mut tx, &inbox.consumer_id, inbox.message_id)
                .await
                .map_err(|e| storage_error(&e))?
            {
                return Ok(ApplyOutcome::Duplicate);
            }

            let outcome = apply_locked(&mut tx, change).await?;
            if !inbox::record(&mut tx, &inbox).await.map_err(|e| storage_error(&e))? {
                return Ok(ApplyOutcome::Duplicate);
            }

            tx.commit().await.map_err(|e| storage_error(&e))?;
            Ok(outcome)
        })
    }

    fn upsert(&self, item: SearchItem) -> Pin<Box<dyn Future<Output = Result<ApplyOutcome, SearchError>> + Send + '_>> {
        Box::pin(async move {
            let mut tx = self.pool.begin().await.map_err(|e| storage_error(&e))?;
            let outcome = apply_locked(&mut tx, SearchChange::Upsert(item)).await?;
            tx.commit().await.map_err(|e| storage_error(&e))?;
            Ok(outcome)
        })
    }

    fn get(&self, id: Uuid) -> Pin<Box<dyn Future<Output = Result<Option<SearchItem>, SearchError>> + Send + '_>> {
        Box::pin(async move {
            let row = sqlx::query(&format!("SELECT {AUCTION_COLUMNS} FROM search_items WHERE id = $1"))
                .bind(id)
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| storage_error(&e))?;
            row.as_ref().map(row_to_item).transpose()
        })
    }

    fn query(
        &self,
        query: SearchQuery,
        now: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<SearchPage, SearchError>> + Send + '_>> {
        Box::pin(async move {
            let term = query
                .search_term
                .as_deref()
                .filter(|t| !t.is_empty())
                .map(like_pattern);
            let filter = filter_name(query.filter_by);
            let soon = now + ENDING_SOON_WINDOW;

            let (total,): (i64,) = sqlx::query_as(&format!("SELECT COUNT(*) FROM search_items {WHERE_CLAUSE}"))
                .bind(&term)
                .bind(&query.seller)
                .bind(&query.winner)
                .bind(filter)
                .bind(now)
                .bind(soon)
                .fetch_one(&self.pool)
                .await
                .map_err(|e| storage_error(&e))?;

            let rows = sqlx::query(&format!(
                "SELECT {AUCTION_COLUMNS} FROM search_items {WHERE_CLAUSE} {} LIMIT $7 OFFSET $8",
                order_clause(query.order_by)
            ))
            .bind(&term)
            .bind(&query.seller)
            .bind(&query.winner)
            .bind(filter)
            .bind(now)
            .bind(soon)
            .bind(i64::from(query.effective_page_size()))
            .bind(i64::try_from(query.offset()).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await
            .map_err(|e| storage_error(&e))?;

            let results = rows.iter().map(row_to_item).collect::<Result<Vec<_>, _>>()?;
            Ok(query.page(results, u64::try_from(total).unwrap_or(0)))
        })
    }

    fn count(&self) -> Pin<Box<dyn Future<Output = Result<u64, SearchError>> + Send + '_>> {
        Box::pin(async move {
            let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM search_items")
                .fetch_one(&self.pool)
                .await
                .map_err(|e| storage_error(&e))?;
            Ok(u64::try_from(count).unwrap_or(0))
        })
    }

    fn latest_updated_at(&self) -> Pin<Box<dyn Future<Output = Result<Option<DateTime<Utc>>, SearchError>> + Send + '_>> {
        Box::pin(async move {
            let (latest,): (Option<DateTime<Utc>>,) = sqlx::query_as("SELECT MAX(updated_at) FROM search_items")
                .fetch_one(&self.pool)
                .await
                .map_err(|e| storage_error(&e))?;
            Ok(latest)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn like_pattern_escapes_wildcards() {
        assert_eq!(like_pattern("GT"), "%GT%");
        assert_eq!(like_pattern("50%_off"), "%50\\%\\_off%");
    }

    #[test]
    fn every_filter_has_a_sql_name() {
        assert_eq!(filter_name(None), None);
        assert_eq!(filter_name(Some(FilterBy::EndingSoon)), Some("endingSoon"));
        assert!(order_clause(OrderBy::New).contains("created_at DESC"));
    }
}
