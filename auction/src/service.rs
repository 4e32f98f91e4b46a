//! Authority mutation API.
//!
//! Each operation builds the new aggregate state and the event describing it,
//! then hands both to [`AuctionStore::commit`] so the outbox record commits
//! with the change.

use crate::events::{AuctionCreated, AuctionDeleted, AuctionUpdated};
use crate::model::{Auction, AuctionStatus, Item};
use crate::store::{AuctionChange, AuctionStore, StoreError};
use chrono::{DateTime, Utc};
use gavel_core::environment::{Clock, SystemClock};
use gavel_core::message::Message;
use gavel_core::outbox::{OutboxError, OutboxRecord};
use serde::Deserialize;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

/// Update attempts before a concurrent-modification conflict is reported.
const MAX_UPDATE_ATTEMPTS: usize = 3;

/// Errors from authority operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ServiceError {
    /// The request is malformed
    #[error("Invalid request: {0}")]
    Validation(String),

    /// The store refused or failed the change
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<OutboxError> for ServiceError {
    fn from(err: OutboxError) -> Self {
        Self::Store(StoreError::Outbox(err))
    }
}

/// Build the outbox record announcing `message`.
///
/// The record gets a fresh id, which becomes the published message id. Pass
/// the result to [`AuctionStore::commit`] together with the change it
/// describes.
///
/// # Errors
///
/// Returns [`OutboxError::Message`] if the payload cannot be encoded.
pub fn on_aggregate_changed<M: Message>(message: &M, at: DateTime<Utc>) -> Result<OutboxRecord, OutboxError> {
    OutboxRecord::for_message(Uuid::new_v4(), message, at)
}

/// Request to list an auction.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateAuction {
    /// Seller username
    pub seller: String,
    /// Reserve price
    pub reserve_price: i64,
    /// When bidding closes
    pub auction_end: DateTime<Utc>,
    /// Item make
    pub make: String,
    /// Item model
    pub model: String,
    /// Item year
    pub year: i32,
    /// Item color
    pub color: String,
    /// Item mileage
    pub mileage: i32,
    /// Item image
    pub image_url: String,
}

/// Partial item update; absent fields keep their value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateAuction {
    /// New make
    pub make: Option<String>,
    /// New model
    pub model: Option<String>,
    /// New year
    pub year: Option<i32>,
    /// New color
    pub color: Option<String>,
    /// New mileage
    pub mileage: Option<i32>,
}

impl UpdateAuction {
    fn apply(&self, item: &mut Item) {
        if let Some(make) = &self.make {
            item.make.clone_from(make);
        }
        if let Some(model) = &self.model {
            item.model.clone_from(model);
        }
        if let Some(year) = self.year {
            item.year = year;
        }
        if let Some(color) = &self.color {
            item.color.clone_from(color);
        }
        if let Some(mileage) = self.mileage {
            item.mileage = mileage;
        }
    }
}

/// Create, update and delete auctions on the authority store.
#[derive(Clone)]
pub struct AuctionService {
    store: Arc<dyn AuctionStore>,
    clock: Arc<dyn Clock>,
}

impl AuctionService {
    /// Create a service over `store`.
    #[must_use]
    pub fn new(store: Arc<dyn AuctionStore>) -> Self {
        Self {
            store,
            clock: Arc::new(SystemClock),
        }
    }

    /// Use a specific clock for timestamps.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Read one auction.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] if there is no such auction.
    pub async fn get(&self, id: Uuid) -> Result<Auction, ServiceError> {
        Ok(self.store.get(id).await?.ok_or(StoreError::NotFound(id))?)
    }

    /// List an auction and announce `AuctionCreated`.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::Validation`] for a negative reserve price or an
    /// end time in the past, or the store's error.
    pub async fn create(&self, request: CreateAuction) -> Result<Auction, ServiceError> {
        let now = self.clock.now();
        if request.reserve_price < 0 {
            return Err(ServiceError::Validation("reserve price must not be negative".into()));
        }
        if request.auction_end <= now {
            return Err(ServiceError::Validation("auction end must be in the future".into()));
        }

        let auction = Auction {
            id: Uuid::new_v4(),
            reserve_price: request.reserve_price,
            seller: request.seller,
            winner: None,
            sold_amount: None,
            current_high_bid: None,
            created_at: now,
            updated_at: now,
            auction_end: request.auction_end,
            status: AuctionStatus::Live,
            item: Item {
                make: request.make,
                model: request.model,
                year: request.year,
                color: request.color,
                mileage: request.mileage,
                image_url: request.image_url,
            },
        };

        let record = on_aggregate_changed(&AuctionCreated::from(&auction), now)?;
        self.store
            .commit(AuctionChange::Create(auction.clone()), vec![record])
            .await?;

        info!(auction_id = %auction.id, seller = %auction.seller, "Auction created");
        Ok(auction)
    }

    /// Change item details and announce `AuctionUpdated`.
    ///
    /// The update is a compare-and-swap on `updated_at`; a concurrent writer
    /// causes a re-read, up to a small bound.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`], [`StoreError::Conflict`] if the
    /// auction kept changing underneath, or the store's error.
    pub async fn update(&self, id: Uuid, request: UpdateAuction) -> Result<Auction, ServiceError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let current = self.get(id).await?;
            let now = self.clock.now();

            let mut auction = current.clone();
            request.apply(&mut auction.item);
            // updated_at orders updates for the projection, so it must strictly increase.
            auction.updated_at = now.max(current.updated_at + chrono::Duration::microseconds(1));

            let record = on_aggregate_changed(&AuctionUpdated::from(&auction), now)?;
            let change = AuctionChange::Update {
                auction: auction.clone(),
                expected_updated_at: current.updated_at,
            };

            match self.store.commit(change, vec![record]).await {
                Ok(()) => {
                    info!(auction_id = %id, "Auction updated");
                    return Ok(auction);
                }
                Err(StoreError::Conflict(_)) if attempt < MAX_UPDATE_ATTEMPTS => {
                    warn!(auction_id = %id, attempt, "Concurrent update, retrying");
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// Remove an auction and announce `AuctionDeleted`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] or the store's error.
    pub async fn delete(&self, id: Uuid) -> Result<(), ServiceError> {
        let record = on_aggregate_changed(&AuctionDeleted { id }, self.clock.now())?;
        self.store.commit(AuctionChange::Delete(id), vec![record]).await?;
        info!(auction_id = %id, "Auction deleted");
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::reconciler::Reconciliation;
    use crate::store::{InMemoryAuctionStore, ModificationCursor, ReconcileOutcome};
    use crate::test_support::create_request;
    use gavel_core::inbox::InboxRecord;
    use gavel_testing::{ManualClock, test_epoch};
    use std::future::Future;
    use std::pin::Pin;
    use std::sync::Mutex;

    /// Another writer that runs right after the first snapshot is read.
    enum Interference {
        Reconcile(Reconciliation),
        Recolor(&'static str),
    }

    /// Store that lets one concurrent write land between a read and the commit
    /// that follows it.
    struct InterleavedStore {
        inner: InMemoryAuctionStore,
        pending: Mutex<Option<Interference>>,
    }

    impl InterleavedStore {
        fn new(inner: InMemoryAuctionStore, interference: Interference) -> Self {
            Self {
                inner,
                pending: Mutex::new(Some(interference)),
            }
        }
    }

    impl AuctionStore for InterleavedStore {
        fn get(&self, id: Uuid) -> Pin<Box<dyn Future<Output = Result<Option<Auction>, StoreError>> + Send + '_>> {
            Box::pin(async move {
                let snapshot = self.inner.get(id).await?;
                let interference = self.pending.lock().unwrap().take();
                match interference {
                    Some(Interference::Reconcile(change)) => {
                        let inbox = InboxRecord::new("auction", Uuid::new_v4(), test_epoch());
                        self.inner.reconcile(inbox, id, change).await?;
                    }
                    Some(Interference::Recolor(color)) => {
                        let current = self.inner.get(id).await?.ok_or(StoreError::NotFound(id))?;
                        let mut edited = current.clone();
                        edited.item.color = color.into();
                        edited.updated_at = current.updated_at + chrono::Duration::seconds(1);
                        let change = AuctionChange::Update {
                            auction: edited,
                            expected_updated_at: current.updated_at,
                        };
                        self.inner.commit(change, vec![]).await?;
                    }
                    None => {}
                }
                Ok(snapshot)
            })
        }

        fn updated_after(
            &self,
            after: Option<ModificationCursor>,
            limit: usize,
        ) -> Pin<Box<dyn Future<Output = Result<Vec<Auction>, StoreError>> + Send + '_>> {
            self.inner.updated_after(after, limit)
        }

        fn ended_live(
            &self,
            now: DateTime<Utc>,
            limit: usize,
        ) -> Pin<Box<dyn Future<Output = Result<Vec<Auction>, StoreError>> + Send + '_>> {
            self.inner.ended_live(now, limit)
        }

        fn commit(
            &self,
            change: AuctionChange,
            records: Vec<OutboxRecord>,
        ) -> Pin<Box<dyn Future<Output = Result<(), StoreError>> + Send + '_>> {
            self.inner.commit(change, records)
        }

        fn reconcile(
            &self,
            inbox: InboxRecord,
            auction_id: Uuid,
            change: Reconciliation,
        ) -> Pin<Box<dyn Future<Output = Result<ReconcileOutcome, StoreError>> + Send + '_>> {
            self.inner.reconcile(inbox, auction_id, change)
        }
    }

    fn service() -> (Arc<InMemoryAuctionStore>, AuctionService, ManualClock) {
        let store = Arc::new(InMemoryAuctionStore::new());
        let clock = ManualClock::new(test_epoch());
        let service = AuctionService::new(store.clone()).with_clock(Arc::new(clock.clone()));
        (store, service, clock)
    }

    #[tokio::test]
    async fn create_appends_one_created_record() {
        let (store, service, _) = service();

        let auction = service.create(create_request()).await.unwrap();

        let records = store.outbox_records().await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].message_type, "AuctionCreated");
        assert_eq!(records[0].aggregate_id, auction.id.to_string());
        assert_eq!(auction.status, AuctionStatus::Live);
    }

    #[tokio::test]
    async fn invalid_request_writes_nothing() {
        let (store, service, _) = service();
        let mut request = create_request();
        request.auction_end = test_epoch() - chrono::Duration::hours(1);

        assert!(matches!(
            service.create(request).await,
            Err(ServiceError::Validation(_))
        ));
        assert!(store.outbox_records().await.is_empty());
    }

    #[tokio::test]
    async fn update_advances_updated_at_even_within_one_tick() {
        let (store, service, clock) = service();
        let created = service.create(create_request()).await.unwrap();

        let first = service
            .update(created.id, UpdateAuction { color: Some("Red".into()), ..Default::default() })
            .await
            .unwrap();
        assert!(first.updated_at > created.updated_at);
        assert_eq!(first.item.color, "Red");
        assert_eq!(first.item.make, created.item.make);

        clock.advance(chrono::Duration::minutes(5));
        let second = service
            .update(created.id, UpdateAuction { mileage: Some(10), ..Default::default() })
            .await
            .unwrap();
        assert_eq!(second.updated_at, test_epoch() + chrono::Duration::minutes(5));

        let types: Vec<String> = store.outbox_records().await.into_iter().map(|r| r.message_type).collect();
        assert_eq!(types, vec!["AuctionCreated", "AuctionUpdated", "AuctionUpdated"]);
    }

    #[tokio::test]
    async fn delete_of_missing_auction_is_not_found() {
        let (store, service, _) = service();
        let id = Uuid::new_v4();

        assert_eq!(
            service.delete(id).await.unwrap_err(),
            ServiceError::Store(StoreError::NotFound(id))
        );
        assert!(store.outbox_records().await.is_empty());
    }

    #[tokio::test]
    async fn delete_announces_deletion() {
        let (store, service, _) = service();
        let created = service.create(create_request()).await.unwrap();

        service.delete(created.id).await.unwrap();

        assert!(store.is_empty().await);
        let last = store.outbox_records().await.pop().unwrap();
        assert_eq!(last.message_type, "AuctionDeleted");
    }

    #[tokio::test]
    async fn update_racing_the_reconciler_keeps_the_high_bid() {
        let (memory, service, _) = service();
        let created = service.create(create_request()).await.unwrap();

        let store = Arc::new(InterleavedStore::new(
            (*memory).clone(),
            Interference::Reconcile(Reconciliation::HighBid { amount: 30_000 }),
        ));
        let racing = AuctionService::new(store).with_clock(Arc::new(ManualClock::new(test_epoch())));
        racing
            .update(created.id, UpdateAuction { color: Some("Red".into()), ..Default::default() })
            .await
            .unwrap();

        let stored = memory.get(created.id).await.unwrap().unwrap();
        assert_eq!(stored.item.color, "Red");
        assert_eq!(stored.current_high_bid, Some(30_000));
    }

    #[tokio::test]
    async fn update_racing_the_finish_keeps_the_final_status() {
        let (memory, service, _) = service();
        let created = service.create(create_request()).await.unwrap();

        let finish = Reconciliation::Finish {
            item_sold: true,
            winner: Some("alice".into()),
            amount: Some(25_000),
        };
        let store = Arc::new(InterleavedStore::new((*memory).clone(), Interference::Reconcile(finish)));
        let racing = AuctionService::new(store).with_clock(Arc::new(ManualClock::new(test_epoch())));
        racing
            .update(created.id, UpdateAuction { mileage: Some(10), ..Default::default() })
            .await
            .unwrap();

        let stored = memory.get(created.id).await.unwrap().unwrap();
        assert_eq!(stored.item.mileage, 10);
        assert_eq!(stored.status, AuctionStatus::Finished);
        assert_eq!(stored.winner.as_deref(), Some("alice"));
        assert_eq!(stored.sold_amount, Some(25_000));
    }

    #[tokio::test]
    async fn concurrent_edit_is_retried_on_the_fresh_state() {
        let (memory, service, _) = service();
        let created = service.create(create_request()).await.unwrap();

        let store = Arc::new(InterleavedStore::new((*memory).clone(), Interference::Recolor("Blue")));
        let racing = AuctionService::new(store).with_clock(Arc::new(ManualClock::new(test_epoch())));
        let updated = racing
            .update(created.id, UpdateAuction { mileage: Some(10), ..Default::default() })
            .await
            .unwrap();

        assert_eq!(updated.item.color, "Blue");
        assert_eq!(updated.item.mileage, 10);
        let stored = memory.get(created.id).await.unwrap().unwrap();
        assert_eq!(stored.item, updated.item);

        // The conflicting attempt left no record behind.
        let types: Vec<String> = memory.outbox_records().await.into_iter().map(|r| r.message_type).collect();
        assert_eq!(types, vec!["AuctionCreated", "AuctionUpdated"]);
    }
}
