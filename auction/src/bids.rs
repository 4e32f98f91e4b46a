//! Bid placement.
//!
//! ```text
//! place_bid(auction, bidder, amount)
//!   ├── gateway.snapshot(auction)           ── NotFound / Timeout → caller
//!   └── bid store, one critical section per auction:
//!         ├── highest bid accepted so far
//!         ├── evaluate_bid(snapshot, that high)
//!         └── bid + BidPlaced record
//!                      │
//!                      ▼ relay
//!          auction (reconciler), search, notifications
//! ```
//!
//! The bid store is the bidding side's own outbox; the authority learns about
//! accepted bids only through `BidPlaced`. Deciding and recording happen under
//! the same lock (in memory) or transaction (Postgres), so two concurrent bids
//! on one auction never both beat the same high bid.

use crate::events::BidPlaced;
use crate::gateway::{AuctionSnapshot, BidError, BidGateway, GatewayError, evaluate_bid};
use crate::model::{Bid, BidStatus};
use crate::service::on_aggregate_changed;
use chrono::{DateTime, Utc};
use gavel_core::environment::{Clock, SystemClock};
use gavel_core::outbox::{OutboxError, OutboxLog, OutboxRecord, OutboxStore};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::info;
use uuid::Uuid;

/// Errors from a bid store backend.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BidStoreError {
    /// Outbox append failed; nothing was recorded
    #[error(transparent)]
    Outbox(#[from] OutboxError),

    /// Backend failure
    #[error("Bid store error: {0}")]
    Storage(String),
}

/// Errors from bid placement.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BidServiceError {
    /// The authority could not be consulted
    #[error(transparent)]
    Gateway(#[from] GatewayError),

    /// The bid was refused
    #[error(transparent)]
    Rejected(#[from] BidError),

    /// The announcement could not be encoded
    #[error(transparent)]
    Outbox(#[from] OutboxError),

    /// The bid could not be recorded
    #[error(transparent)]
    Store(#[from] BidStoreError),
}

/// A bid waiting to be decided against the highest bid accepted so far.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingBid {
    /// Auction bid on
    pub auction_id: Uuid,
    /// Authority facts read through the gateway
    pub snapshot: AuctionSnapshot,
    /// Bidder username
    pub bidder: String,
    /// Offered amount
    pub amount: i64,
    /// Placement time
    pub at: DateTime<Utc>,
}

impl PendingBid {
    /// Decide the bid given `known_high` and build its `BidPlaced` record.
    ///
    /// Stores call this while holding the auction's lock.
    ///
    /// # Errors
    ///
    /// Returns [`BidServiceError::Rejected`] for a bid that is not evaluated
    /// at all, or [`BidServiceError::Outbox`] if the event cannot be encoded.
    pub fn decide(&self, known_high: Option<i64>) -> Result<(Bid, OutboxRecord), BidServiceError> {
        let bid_status = evaluate_bid(&self.snapshot, &self.bidder, self.amount, known_high, self.at)?;
        let bid = Bid {
            id: Uuid::new_v4(),
            auction_id: self.auction_id,
            bidder: self.bidder.clone(),
            amount: self.amount,
            bid_time: self.at,
            bid_status,
        };
        let record = on_aggregate_changed(&BidPlaced::from(&bid), self.at)?;
        Ok((bid, record))
    }
}

fn counts_as_high(bid: &Bid) -> bool {
    matches!(bid.bid_status, BidStatus::Accepted | BidStatus::AcceptedBelowReserve)
}

/// Bidding-side storage: bids, finished markers and their outbox.
///
/// # Dyn Compatibility
///
/// Uses explicit boxed futures so it can be held as `Arc<dyn BidStore>`.
pub trait BidStore: Send + Sync {
    /// Decide `pending` against the highest accepted bid and record it with
    /// its announcement, serialized with every other placement on the same
    /// auction.
    ///
    /// # Errors
    ///
    /// Returns the decision's error, or [`BidServiceError::Store`] if the
    /// backend fails. Nothing is recorded on error.
    fn place(&self, pending: PendingBid) -> Pin<Box<dyn Future<Output = Result<Bid, BidServiceError>> + Send + '_>>;

    /// Bids for `auction_id`, highest amount first.
    ///
    /// # Errors
    ///
    /// Returns [`BidStoreError::Storage`] if the backend fails.
    fn bids_for(&self, auction_id: Uuid) -> Pin<Box<dyn Future<Output = Result<Vec<Bid>, BidStoreError>> + Send + '_>>;

    /// Highest bid that met the reserve, if any.
    ///
    /// # Errors
    ///
    /// Returns [`BidStoreError::Storage`] if the backend fails.
    fn winning_bid(
        &self,
        auction_id: Uuid,
    ) -> Pin<Box<dyn Future<Output = Result<Option<Bid>, BidStoreError>> + Send + '_>>;

    /// Whether `auction_id` was closed by this bidding service.
    ///
    /// # Errors
    ///
    /// Returns [`BidStoreError::Storage`] if the backend fails.
    fn is_finished(&self, auction_id: Uuid) -> Pin<Box<dyn Future<Output = Result<bool, BidStoreError>> + Send + '_>>;

    /// Record that `auction_id` was closed, together with its announcement.
    ///
    /// Returns `false`, appending nothing, if the auction was already closed.
    ///
    /// # Errors
    ///
    /// Returns [`BidStoreError`] if the backend fails; nothing is recorded.
    fn record_finish(
        &self,
        auction_id: Uuid,
        record: OutboxRecord,
    ) -> Pin<Box<dyn Future<Output = Result<bool, BidStoreError>> + Send + '_>>;
}

#[derive(Default)]
struct State {
    bids: HashMap<Uuid, Vec<Bid>>,
    finished: HashSet<Uuid>,
    outbox: OutboxLog,
}

/// Bids and their outbox behind one lock. Cheap to clone; clones share state.
///
/// Also the bid relay's [`OutboxStore`].
#[derive(Clone, Default)]
pub struct InMemoryBidStore {
    state: Arc<Mutex<State>>,
}

impl InMemoryBidStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl BidStore for InMemoryBidStore {
    fn place(&self, pending: PendingBid) -> Pin<Box<dyn Future<Output = Result<Bid, BidServiceError>> + Send + '_>> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            let known_high = state
                .bids
                .get(&pending.auction_id)
                .and_then(|bids| bids.iter().filter(|bid| counts_as_high(bid)).map(|bid| bid.amount).max());

            let (bid, record) = pending.decide(known_high)?;
            state.bids.entry(bid.auction_id).or_default().push(bid.clone());
            state.outbox.append(record);
            Ok(bid)
        })
    }

    fn bids_for(&self, auction_id: Uuid) -> Pin<Box<dyn Future<Output = Result<Vec<Bid>, BidStoreError>> + Send + '_>> {
        Box::pin(async move {
            let mut bids = self
                .state
                .lock()
                .await
                .bids
                .get(&auction_id)
                .cloned()
                .unwrap_or_default();
            bids.sort_by(|a, b| b.amount.cmp(&a.amount));
            Ok(bids)
        })
    }

    fn winning_bid(
        &self,
        auction_id: Uuid,
    ) -> Pin<Box<dyn Future<Output = Result<Option<Bid>, BidStoreError>> + Send + '_>> {
        Box::pin(async move {
            Ok(self.state.lock().await.bids.get(&auction_id).and_then(|bids| {
                bids.iter()
                    .filter(|bid| bid.bid_status == BidStatus::Accepted)
                    .max_by_key(|bid| bid.amount)
                    .cloned()
            }))
        })
    }

    fn is_finished(&self, auction_id: Uuid) -> Pin<Box<dyn Future<Output = Result<bool, BidStoreError>> + Send + '_>> {
        Box::pin(async move { Ok(self.state.lock().await.finished.contains(&auction_id)) })
    }

    fn record_finish(
        &self,
        auction_id: Uuid,
        record: OutboxRecord,
    ) -> Pin<Box<dyn Future<Output = Result<bool, BidStoreError>> + Send + '_>> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            if !state.finished.insert(auction_id) {
                return Ok(false);
            }
            state.outbox.append(record);
            Ok(true)
        })
    }
}

impl OutboxStore for InMemoryBidStore {
    fn append(&self, record: OutboxRecord) -> Pin<Box<dyn Future<Output = Result<bool, OutboxError>> + Send + '_>> {
        Box::pin(async move { Ok(self.state.lock().await.outbox.append(record)) })
    }

    fn fetch_unsent(
        &self,
        limit: usize,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<OutboxRecord>, OutboxError>> + Send + '_>> {
        Box::pin(async move { Ok(self.state.lock().await.outbox.unsent(limit)) })
    }

    fn mark_sent(
        &self,
        id: Uuid,
        sent_at: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<(), OutboxError>> + Send + '_>> {
        Box::pin(async move { self.state.lock().await.outbox.mark_sent(id, sent_at) })
    }

    fn purge_sent_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<u64, OutboxError>> + Send + '_>> {
        Box::pin(async move { Ok(self.state.lock().await.outbox.purge_sent_before(cutoff)) })
    }

    fn try_acquire_lease(
        &self,
        holder: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<bool, OutboxError>> + Send + '_>> {
        let holder = holder.to_string();
        Box::pin(async move { Ok(self.state.lock().await.outbox.try_acquire_lease(&holder, ttl, now)) })
    }
}

/// Places bids after validating them against the authority.
#[derive(Clone)]
pub struct BidService {
    gateway: BidGateway,
    store: Arc<dyn BidStore>,
    clock: Arc<dyn Clock>,
}

impl BidService {
    /// Create a service.
    #[must_use]
    pub fn new(gateway: BidGateway, store: Arc<dyn BidStore>) -> Self {
        Self {
            gateway,
            store,
            clock: Arc::new(SystemClock),
        }
    }

    /// Use a specific clock.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Bids recorded for `auction_id`, highest amount first.
    ///
    /// # Errors
    ///
    /// Returns [`BidStoreError`] if the store cannot be read.
    pub async fn bids_for(&self, auction_id: Uuid) -> Result<Vec<Bid>, BidStoreError> {
        self.store.bids_for(auction_id).await
    }

    /// Validate, record and announce a bid.
    ///
    /// Refused amounts (`TooLow`, `Finished`) are still recorded and announced
    /// with their status.
    ///
    /// # Errors
    ///
    /// Returns [`BidServiceError::Gateway`] if the authority cannot be
    /// consulted, [`BidServiceError::Rejected`] for a bid that is not
    /// evaluated at all, or [`BidServiceError::Store`] if it cannot be recorded.
    pub async fn place_bid(&self, auction_id: Uuid, bidder: &str, amount: i64) -> Result<Bid, BidServiceError> {
        let snapshot = self.gateway.snapshot(auction_id).await?;
        let pending = PendingBid {
            auction_id,
            snapshot,
            bidder: bidder.to_string(),
            amount,
            at: self.clock.now(),
        };
        let bid = self.store.place(pending).await?;

        info!(auction_id = %auction_id, bidder = %bidder, amount, status = %bid.bid_status, "Bid placed");
        Ok(bid)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::store::{AuctionChange, AuctionStore, InMemoryAuctionStore};
    use crate::test_support::auction;
    use gavel_testing::test_clock;

    async fn setup() -> (BidService, InMemoryBidStore, Uuid) {
        let authority = Arc::new(InMemoryAuctionStore::new());
        let a = auction();
        let id = a.id;
        authority.commit(AuctionChange::Create(a), vec![]).await.unwrap();
        let bids = InMemoryBidStore::new();
        let service = BidService::new(BidGateway::new(authority), Arc::new(bids.clone()))
            .with_clock(Arc::new(test_clock()));
        (service, bids, id)
    }

    #[tokio::test]
    async fn later_lower_bid_is_too_low_before_authority_catches_up() {
        let (service, bids, id) = setup().await;

        let first = service.place_bid(id, "alice", 25_000).await.unwrap();
        let second = service.place_bid(id, "carol", 24_000).await.unwrap();

        assert_eq!(first.bid_status, BidStatus::Accepted);
        assert_eq!(second.bid_status, BidStatus::TooLow);
        assert_eq!(bids.bids_for(id).await.unwrap().len(), 2);
        assert_eq!(bids.fetch_unsent(10).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn unknown_auction_is_not_recorded() {
        let (service, bids, _) = setup().await;
        let missing = Uuid::new_v4();

        let err = service.place_bid(missing, "alice", 10).await.unwrap_err();
        assert_eq!(err, BidServiceError::Gateway(GatewayError::NotFound(missing)));
        assert!(bids.fetch_unsent(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn seller_cannot_bid() {
        let (service, _, id) = setup().await;
        let err = service.place_bid(id, "bob", 30_000).await.unwrap_err();
        assert_eq!(err, BidServiceError::Rejected(BidError::OwnAuction));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_equal_bids_accept_only_one() {
        let (service, bids, id) = setup().await;
        let barrier = Arc::new(tokio::sync::Barrier::new(16));

        let handles: Vec<_> = (0..16)
            .map(|i| {
                let service = service.clone();
                let barrier = barrier.clone();
                tokio::spawn(async move {
                    barrier.wait().await;
                    service.place_bid(id, &format!("bidder-{i}"), 25_000).await.unwrap()
                })
            })
            .collect();

        let mut accepted = 0;
        for handle in handles {
            if handle.await.unwrap().bid_status == BidStatus::Accepted {
                accepted += 1;
            }
        }

        assert_eq!(accepted, 1);
        assert_eq!(bids.bids_for(id).await.unwrap().len(), 16);
        assert_eq!(bids.fetch_unsent(100).await.unwrap().len(), 16);
    }

    #[tokio::test]
    async fn decision_uses_the_high_bid_seen_under_the_lock() {
        let (_, bids, id) = setup().await;
        let pending = |bidder: &str, amount| PendingBid {
            auction_id: id,
            snapshot: AuctionSnapshot {
                reserve_price: 20_000,
                seller: "bob".into(),
                auction_end: gavel_testing::test_epoch() + chrono::Duration::days(1),
                current_high_bid: None,
            },
            bidder: bidder.into(),
            amount,
            at: gavel_testing::test_epoch(),
        };

        // Both read the same stale snapshot; the second is still too low.
        let first = bids.place(pending("alice", 30_000)).await.unwrap();
        let second = bids.place(pending("carol", 26_000)).await.unwrap();

        assert_eq!(first.bid_status, BidStatus::Accepted);
        assert_eq!(second.bid_status, BidStatus::TooLow);
        assert_eq!(bids.winning_bid(id).await.unwrap().unwrap().bidder, "alice");
    }

    #[tokio::test]
    async fn finish_is_recorded_once() {
        let bids = InMemoryBidStore::new();
        let id = Uuid::new_v4();
        let record = |n: u128| OutboxRecord {
            id: Uuid::from_u128(n),
            aggregate_id: id.to_string(),
            message_type: "AuctionFinished".into(),
            payload: b"{}".to_vec(),
            enqueued_at: gavel_testing::test_epoch(),
            sent_at: None,
        };

        assert!(!bids.is_finished(id).await.unwrap());
        assert!(bids.record_finish(id, record(1)).await.unwrap());
        assert!(!bids.record_finish(id, record(2)).await.unwrap());
        assert!(bids.is_finished(id).await.unwrap());
        assert_eq!(bids.fetch_unsent(10).await.unwrap().len(), 1);
    }
}
