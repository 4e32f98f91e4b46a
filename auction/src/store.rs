//! Authority store for auctions.
//!
//! Every mutation that must be observed by other services goes through
//! [`AuctionStore::commit`], which applies the change and appends its outbox
//! records as one unit: both are visible afterwards, or neither is.
//!
//! ```text
//! commit(change, records)
//!   ├── validate change     ── NotFound / AlreadyExists / Conflict → nothing written
//!   ├── apply change
//!   └── append records      ── same lock / same SQL transaction
//! ```
//!
//! The reconciler's writes go through [`AuctionStore::reconcile`], which checks
//! and records the inbox entry in the same unit as the mutation.

use crate::model::{Auction, AuctionStatus};
use crate::reconciler::Reconciliation;
use chrono::{DateTime, Utc};
use gavel_core::inbox::{InboxLedger, InboxRecord};
use gavel_core::outbox::{OutboxError, OutboxLog, OutboxRecord, OutboxStore};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use uuid::Uuid;

/// Errors from the authority store.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// No auction with this id
    #[error("Auction not found: {0}")]
    NotFound(Uuid),

    /// An auction with this id already exists
    #[error("Auction already exists: {0}")]
    AlreadyExists(Uuid),

    /// The auction changed since it was read
    #[error("Auction {0} was modified concurrently")]
    Conflict(Uuid),

    /// Outbox append failed; the change was rolled back
    #[error(transparent)]
    Outbox(#[from] OutboxError),

    /// Backend failure
    #[error("Auction store error: {0}")]
    Storage(String),
}

impl StoreError {
    /// Whether retrying the same operation later may succeed.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Storage(_) | Self::Outbox(OutboxError::Storage(_)))
    }
}

/// A change to one auction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuctionChange {
    /// Insert a new auction
    Create(Auction),
    /// Replace the item and `updated_at`, provided the stored `updated_at`
    /// still equals `expected_updated_at`.
    ///
    /// Bidding state (`current_high_bid`, `winner`, `sold_amount`, `status`)
    /// belongs to the reconciler, which does not move `updated_at`; it keeps
    /// its stored value whatever `auction` carries.
    Update {
        /// New state; only `item` and `updated_at` are written
        auction: Auction,
        /// `updated_at` the caller read
        expected_updated_at: DateTime<Utc>,
    },
    /// Remove an auction
    Delete(Uuid),
}

impl AuctionChange {
    /// Id of the auction the change touches.
    #[must_use]
    pub const fn auction_id(&self) -> Uuid {
        match self {
            Self::Create(auction) | Self::Update { auction, .. } => auction.id,
            Self::Delete(id) => *id,
        }
    }
}

/// Position in the authority's modification order, `(updated_at, id)`.
///
/// Auctions can share an `updated_at`; the id breaks the tie so paging never
/// skips one.
pub type ModificationCursor = (DateTime<Utc>, Uuid);

/// Result of [`AuctionStore::reconcile`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// The auction was mutated
    Applied,
    /// The message was recorded but left the auction as it was
    Unchanged,
    /// The consumer already processed this message
    Duplicate,
    /// No such auction (deleted, or never created)
    Missing,
}

/// Authority storage.
///
/// # Dyn Compatibility
///
/// Uses explicit boxed futures so it can be held as `Arc<dyn AuctionStore>`.
pub trait AuctionStore: Send + Sync {
    /// Point lookup.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Storage`] if the backend fails.
    fn get(&self, id: Uuid) -> Pin<Box<dyn Future<Output = Result<Option<Auction>, StoreError>> + Send + '_>>;

    /// Auctions whose `(updated_at, id)` is after `after` (all when `None`),
    /// in that order, at most `limit`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Storage`] if the backend fails.
    fn updated_after(
        &self,
        after: Option<ModificationCursor>,
        limit: usize,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<Auction>, StoreError>> + Send + '_>>;

    /// Live auctions whose end is at or before `now`, earliest end first, at
    /// most `limit`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Storage`] if the backend fails.
    fn ended_live(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<Auction>, StoreError>> + Send + '_>>;

    /// Apply `change` and append `records` atomically.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`], [`StoreError::AlreadyExists`] or
    /// [`StoreError::Conflict`] if the change does not fit the stored state, and
    /// a storage error if the backend fails. In every error case neither the
    /// change nor any record is persisted.
    fn commit(
        &self,
        change: AuctionChange,
        records: Vec<OutboxRecord>,
    ) -> Pin<Box<dyn Future<Output = Result<(), StoreError>> + Send + '_>>;

    /// Apply a reconciler change to `auction_id`, deduplicated by `inbox`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Storage`] if the backend fails; nothing is persisted.
    fn reconcile(
        &self,
        inbox: InboxRecord,
        auction_id: Uuid,
        change: Reconciliation,
    ) -> Pin<Box<dyn Future<Output = Result<ReconcileOutcome, StoreError>> + Send + '_>>;
}

#[derive(Default)]
struct State {
    auctions: HashMap<Uuid, Auction>,
    outbox: OutboxLog,
    inbox: InboxLedger,
}

/// In-memory authority store.
///
/// Auctions, outbox and inbox share one lock, which is what makes
/// [`commit`](AuctionStore::commit) atomic. The store is also the relay's
/// [`OutboxStore`]. Cheap to clone; clones share state.
#[derive(Clone, Default)]
pub struct InMemoryAuctionStore {
    state: Arc<Mutex<State>>,
    unavailable: Arc<AtomicBool>,
}

impl InMemoryAuctionStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every operation fail with a storage error.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Every outbox record, in enqueue order.
    pub async fn outbox_records(&self) -> Vec<OutboxRecord> {
        self.state.lock().await.outbox.records().to_vec()
    }

    /// Number of auctions.
    pub async fn len(&self) -> usize {
        self.state.lock().await.auctions.len()
    }

    /// Whether the store holds no auctions.
    pub async fn is_empty(&self) -> bool {
        self.state.lock().await.auctions.is_empty()
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Storage("store unavailable".to_string()));
        }
        Ok(())
    }
}

fn validate(auctions: &HashMap<Uuid, Auction>, change: &AuctionChange) -> Result<(), StoreError> {
    match change {
        AuctionChange::Create(auction) => {
            if auctions.contains_key(&auction.id) {
                return Err(StoreError::AlreadyExists(auction.id));
            }
        }
        AuctionChange::Update {
            auction,
            expected_updated_at,
        } => {
            let stored = auctions.get(&auction.id).ok_or(StoreError::NotFound(auction.id))?;
            if stored.updated_at != *expected_updated_at {
                return Err(StoreError::Conflict(auction.id));
            }
        }
        AuctionChange::Delete(id) => {
            if !auctions.contains_key(id) {
                return Err(StoreError::NotFound(*id));
            }
        }
    }
    Ok(())
}

impl AuctionStore for InMemoryAuctionStore {
    fn get(&self, id: Uuid) -> Pin<Box<dyn Future<Output = Result<Option<Auction>, StoreError>> + Send + '_>> {
        Box::pin(async move {
            self.check_available()?;
            Ok(self.state.lock().await.auctions.get(&id).cloned())
        })
    }

    fn updated_after(
        &self,
        after: Option<ModificationCursor>,
        limit: usize,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<Auction>, StoreError>> + Send + '_>> {
        Box::pin(async move {
            self.check_available()?;
            let state = self.state.lock().await;
            let mut auctions: Vec<Auction> = state
                .auctions
                .values()
                .filter(|a| after.is_none_or(|after| (a.updated_at, a.id) > after))
                .cloned()
                .collect();
            auctions.sort_by_key(|a| (a.updated_at, a.id));
            auctions.truncate(limit);
            Ok(auctions)
        })
    }

    fn ended_live(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<Auction>, StoreError>> + Send + '_>> {
        Box::pin(async move {
            self.check_available()?;
            let state = self.state.lock().await;
            let mut auctions: Vec<Auction> = state
                .auctions
                .values()
                .filter(|a| a.status == AuctionStatus::Live && a.has_ended(now))
                .cloned()
                .collect();
            auctions.sort_by_key(|a| (a.auction_end, a.id));
            auctions.truncate(limit);
            Ok(auctions)
        })
    }

    fn commit(
        &self,
        change: AuctionChange,
        records: Vec<OutboxRecord>,
    ) -> Pin<Box<dyn Future<Output = Result<(), StoreError>> + Send + '_>> {
        Box::pin(async move {
            self.check_available()?;
            let mut state = self.state.lock().await;

            validate(&state.auctions, &change)?;
            if let Some(dup) = records.iter().find(|r| state.outbox.contains(r.id)) {
                return Err(StoreError::Storage(format!("duplicate outbox record {}", dup.id)));
            }

            match change {
                AuctionChange::Create(auction) => {
                    state.auctions.insert(auction.id, auction);
                }
                AuctionChange::Update { auction, .. } => {
                    if let Some(stored) = state.auctions.get_mut(&auction.id) {
                        stored.item = auction.item;
                        stored.updated_at = auction.updated_at;
                    }
                }
                AuctionChange::Delete(id) => {
                    state.auctions.remove(&id);
                }
            }
            for record in records {
                state.outbox.append(record);
            }
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
            self.check_available()?;
            let mut state = self.state.lock().await;
            let State { auctions, inbox: ledger, .. } = &mut *state;

            if ledger.contains(&inbox.consumer_id, inbox.message_id) {
                return Ok(ReconcileOutcome::Duplicate);
            }
            let Some(auction) = auctions.get_mut(&auction_id) else {
                return Ok(ReconcileOutcome::Missing);
            };

            let changed = change.apply(auction);
            ledger.record(inbox);
            Ok(if changed {
                ReconcileOutcome::Applied
            } else {
                ReconcileOutcome::Unchanged
            })
        })
    }
}

impl OutboxStore for InMemoryAuctionStore {
    fn append(&self, record: OutboxRecord) -> Pin<Box<dyn Future<Output = Result<bool, OutboxError>> + Send + '_>> {
        Box::pin(async move {
            self.check_available().map_err(|e| OutboxError::Storage(e.to_string()))?;
            Ok(self.state.lock().await.outbox.append(record))
        })
    }

    fn fetch_unsent(
        &self,
        limit: usize,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<OutboxRecord>, OutboxError>> + Send + '_>> {
        Box::pin(async move {
            self.check_available().map_err(|e| OutboxError::Storage(e.to_string()))?;
            Ok(self.state.lock().await.outbox.unsent(limit))
        })
    }

    fn mark_sent(
        &self,
        id: Uuid,
        sent_at: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<(), OutboxError>> + Send + '_>> {
        Box::pin(async move {
            self.check_available().map_err(|e| OutboxError::Storage(e.to_string()))?;
            self.state.lock().await.outbox.mark_sent(id, sent_at)
        })
    }

    fn purge_sent_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<u64, OutboxError>> + Send + '_>> {
        Box::pin(async move {
            self.check_available().map_err(|e| OutboxError::Storage(e.to_string()))?;
            Ok(self.state.lock().await.outbox.purge_sent_before(cutoff))
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
            self.check_available().map_err(|e| OutboxError::Storage(e.to_string()))?;
            Ok(self.state.lock().await.outbox.try_acquire_lease(&holder, ttl, now))
        })
    }
}
