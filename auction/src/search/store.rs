//! Projection storage.
//!
//! A [`SearchChange`] is applied together with its inbox record:
//!
//! ```text
//! inbox has (consumer, message)?  ── yes → Duplicate, nothing written
//! apply change                    ── stale / missing / unchanged → no mutation
//! record inbox                    ── always, unless Duplicate
//! ```
//!
//! Stale and no-op messages are still recorded so that their redeliveries
//! short-circuit on the inbox.

use crate::events::{AuctionFinished, AuctionUpdated};
use crate::model::AuctionStatus;
use crate::search::model::SearchItem;
use crate::search::query::{SearchPage, SearchQuery};
use chrono::{DateTime, Utc};
use gavel_core::inbox::InboxRecord;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;
use uuid::Uuid;

/// Errors from projection storage.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SearchError {
    /// Backend failure
    #[error("Search store error: {0}")]
    Storage(String),
}

/// A mutation derived from one event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SearchChange {
    /// Insert or replace an item
    Upsert(SearchItem),
    /// Item details changed
    Update(AuctionUpdated),
    /// Item removed
    Delete(Uuid),
    /// Accepted bid
    HighBid {
        /// Auction id
        id: Uuid,
        /// Bid amount
        amount: i64,
    },
    /// Bidding closed
    Finish(AuctionFinished),
}

impl SearchChange {
    /// Id of the item the change touches.
    #[must_use]
    pub const fn item_id(&self) -> Uuid {
        match self {
            Self::Upsert(item) => item.id,
            Self::Update(event) => event.id,
            Self::Delete(id) | Self::HighBid { id, .. } => *id,
            Self::Finish(event) => event.auction_id,
        }
    }
}

/// Result of applying a change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// The projection was mutated
    Applied,
    /// Older than the stored item; discarded
    Stale,
    /// The change would not alter the item
    Unchanged,
    /// No item to change
    Missing,
    /// Already processed by this consumer
    Duplicate,
}

impl ApplyOutcome {
    /// Metric label.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Applied => "applied",
            Self::Stale => "stale",
            Self::Unchanged => "unchanged",
            Self::Missing => "missing",
            Self::Duplicate => "duplicate",
        }
    }
}

/// Apply `change` to `items`.
///
/// `Update` and `Finish` are applied only when the event's timestamp is not
/// older than the stored `updated_at`; an `Upsert` only when its `updated_at`
/// is not older than the stored one.
///
/// Bids and finishing do not move `updated_at`, so an `Upsert` copied from a
/// lagging authority may carry older bidding state. It never lowers
/// `current_high_bid` and never reopens a finished item.
pub fn apply_change(items: &mut HashMap<Uuid, SearchItem>, change: SearchChange) -> ApplyOutcome {
    match change {
        SearchChange::Upsert(mut item) => {
            if let Some(stored) = items.get(&item.id) {
                if item.updated_at < stored.updated_at {
                    return ApplyOutcome::Stale;
                }
                item.current_high_bid = item.current_high_bid.max(stored.current_high_bid);
                if item.status == AuctionStatus::Live && stored.status != AuctionStatus::Live {
                    item.status = stored.status;
                    item.winner.clone_from(&stored.winner);
                    item.sold_amount = stored.sold_amount;
                }
                if *stored == item {
                    return ApplyOutcome::Unchanged;
                }
            }
            items.insert(item.id, item);
            ApplyOutcome::Applied
        }
        SearchChange::Update(event) => {
            let Some(stored) = items.get_mut(&event.id) else {
                return ApplyOutcome::Missing;
            };
            if event.updated_at < stored.updated_at {
                return ApplyOutcome::Stale;
            }
            stored.make = event.make;
            stored.model = event.model;
            stored.year = event.year;
            stored.color = event.color;
            stored.mileage = event.mileage;
            stored.updated_at = event.updated_at;
            ApplyOutcome::Applied
        }
        SearchChange::Delete(id) => {
            if items.remove(&id).is_some() {
                ApplyOutcome::Applied
            } else {
                ApplyOutcome::Missing
            }
        }
        SearchChange::HighBid { id, amount } => {
            let Some(stored) = items.get_mut(&id) else {
                return ApplyOutcome::Missing;
            };
            if stored.current_high_bid.is_some_and(|high| amount <= high) {
                return ApplyOutcome::Unchanged;
            }
            stored.current_high_bid = Some(amount);
            ApplyOutcome::Applied
        }
        SearchChange::Finish(event) => {
            let Some(stored) = items.get_mut(&event.auction_id) else {
                return ApplyOutcome::Missing;
            };
            if event.finished_at < stored.updated_at {
                return ApplyOutcome::Stale;
            }
            if event.item_sold {
                stored.winner = event.winner;
                stored.sold_amount = event.amount;
            }
            stored.status = AuctionStatus::after_finish(stored.sold_amount, stored.reserve_price);
            ApplyOutcome::Applied
        }
    }
}

/// Projection storage.
///
/// # Dyn Compatibility
///
/// Uses explicit boxed futures so it can be held as `Arc<dyn SearchStore>`.
pub trait SearchStore: Send + Sync {
    /// Apply `change`, deduplicated by `inbox`, in one unit.
    ///
    /// # Errors
    ///
    /// Returns [`SearchError::Storage`] if the backend fails; nothing is persisted.
    fn apply(
        &self,
        inbox: InboxRecord,
        change: SearchChange,
    ) -> Pin<Box<dyn Future<Output = Result<ApplyOutcome, SearchError>> + Send + '_>>;

    /// Upsert an item copied from the authority (catch-up). Same staleness rule
    /// as [`SearchChange::Upsert`], without an inbox record.
    ///
    /// # Errors
    ///
    /// Returns [`SearchError::Storage`] if the backend fails.
    fn upsert(&self, item: SearchItem) -> Pin<Box<dyn Future<Output = Result<ApplyOutcome, SearchError>> + Send + '_>>;

    /// Point lookup.
    ///
    /// # Errors
    ///
    /// Returns [`SearchError::Storage`] if the backend fails.
    fn get(&self, id: Uuid) -> Pin<Box<dyn Future<Output = Result<Option<SearchItem>, SearchError>> + Send + '_>>;

    /// Run a paged query evaluated at `now`.
    ///
    /// # Errors
    ///
    /// Returns [`SearchError::Storage`] if the backend fails.
    fn query(
        &self,
        query: SearchQuery,
        now: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<SearchPage, SearchError>> + Send + '_>>;

    /// Number of items.
    ///
    /// # Errors
    ///
    /// Returns [`SearchError::Storage`] if the backend fails.
    fn count(&self) -> Pin<Box<dyn Future<Output = Result<u64, SearchError>> + Send + '_>>;

    /// Newest `updated_at` in the projection; the catch-up cursor.
    ///
    /// # Errors
    ///
    /// Returns [`SearchError::Storage`] if the backend fails.
    fn latest_updated_at(&self) -> Pin<Box<dyn Future<Output = Result<Option<DateTime<Utc>>, SearchError>> + Send + '_>>;
}
