//! High-bid and finish reconciler.
//!
//! Consumes `BidPlaced` and `AuctionFinished` on the authority side and folds
//! them into the auction aggregate:
//!
//! ```text
//! BidPlaced      ── Accepted and amount > current_high_bid → raise high bid
//!                └─ otherwise                              → ack, no change
//! AuctionFinished ── item_sold → winner, sold_amount
//!                 └─ status = Finished if sold_amount > reserve, else ReserveNotMet
//! ```
//!
//! Both writes are deduplicated through the authority store's inbox, and an
//! event for an auction that no longer exists is acknowledged as a no-op.

use crate::events::{AuctionFinished, BidPlaced};
use crate::model::{Auction, AuctionStatus, BidStatus};
use crate::store::{AuctionStore, ReconcileOutcome, StoreError};
use async_trait::async_trait;
use gavel_core::environment::{Clock, SystemClock};
use gavel_core::inbox::InboxRecord;
use gavel_runtime::{Handler, HandlerError, MessageContext};
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

/// A reconciler change to one auction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reconciliation {
    /// An accepted bid of `amount`
    HighBid {
        /// Bid amount
        amount: i64,
    },
    /// Bidding closed
    Finish {
        /// Whether there was a winning bid
        item_sold: bool,
        /// Winning bidder
        winner: Option<String>,
        /// Winning amount
        amount: Option<i64>,
    },
}

impl Reconciliation {
    /// Apply to `auction`. Returns whether anything changed.
    ///
    /// Pure and idempotent: applying the same change twice leaves the auction
    /// as after the first application.
    pub fn apply(&self, auction: &mut Auction) -> bool {
        match self {
            Self::HighBid { amount } => {
                if auction.current_high_bid.is_some_and(|high| *amount <= high) {
                    return false;
                }
                auction.current_high_bid = Some(*amount);
                true
            }
            Self::Finish {
                item_sold,
                winner,
                amount,
            } => {
                let before = (auction.winner.clone(), auction.sold_amount, auction.status);
                if *item_sold {
                    auction.winner.clone_from(winner);
                    auction.sold_amount = *amount;
                }
                auction.status = AuctionStatus::after_finish(auction.sold_amount, auction.reserve_price);
                before != (auction.winner.clone(), auction.sold_amount, auction.status)
            }
        }
    }
}

fn store_failure(err: &StoreError) -> HandlerError {
    if err.is_transient() {
        HandlerError::transient("StoreUnavailable", err.to_string())
    } else {
        HandlerError::rejected("StoreRejected", err.to_string())
    }
}

/// Authority-side consumer of bid and finish events.
pub struct AuctionReconciler {
    store: Arc<dyn AuctionStore>,
    clock: Arc<dyn Clock>,
}

impl AuctionReconciler {
    /// Create a reconciler writing to `store`.
    #[must_use]
    pub fn new(store: Arc<dyn AuctionStore>) -> Self {
        Self {
            store,
            clock: Arc::new(SystemClock),
        }
    }

    /// Use a specific clock for inbox timestamps.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    async fn reconcile(
        &self,
        ctx: &MessageContext,
        auction_id: Uuid,
        change: Reconciliation,
    ) -> Result<ReconcileOutcome, HandlerError> {
        let inbox = InboxRecord::new(&ctx.queue, ctx.message_id, self.clock.now());
        let outcome = self
            .store
            .reconcile(inbox, auction_id, change)
            .await
            .map_err(|e| store_failure(&e))?;

        match outcome {
            ReconcileOutcome::Duplicate => {
                debug!(message_id = %ctx.message_id, "Duplicate message, skipping");
            }
            ReconcileOutcome::Missing => {
                info!(auction_id = %auction_id, message_type = %ctx.message_type, "Auction no longer exists");
            }
            ReconcileOutcome::Applied | ReconcileOutcome::Unchanged => {}
        }
        Ok(outcome)
    }
}

#[async_trait]
impl Handler<BidPlaced> for AuctionReconciler {
    async fn handle(&self, ctx: &MessageContext, bid: BidPlaced) -> Result<(), HandlerError> {
        if bid.bid_status != BidStatus::Accepted {
            debug!(auction_id = %bid.auction_id, status = %bid.bid_status, "Bid does not raise the high bid");
            return Ok(());
        }

        let outcome = self
            .reconcile(ctx, bid.auction_id, Reconciliation::HighBid { amount: bid.amount })
            .await?;
        if outcome == ReconcileOutcome::Applied {
            info!(auction_id = %bid.auction_id, amount = bid.amount, "High bid raised");
        }
        Ok(())
    }
}

#[async_trait]
impl Handler<AuctionFinished> for AuctionReconciler {
    async fn handle(&self, ctx: &MessageContext, finished: AuctionFinished) -> Result<(), HandlerError> {
        let change = Reconciliation::Finish {
            item_sold: finished.item_sold,
            winner: finished.winner,
            amount: finished.amount,
        };
        let outcome = self.reconcile(ctx, finished.auction_id, change).await?;
        if outcome == ReconcileOutcome::Applied {
            info!(auction_id = %finished.auction_id, item_sold = finished.item_sold, "Auction finished");
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::store::{AuctionChange, InMemoryAuctionStore};
    use crate::test_support::{auction, context};
    use gavel_testing::{test_clock, test_epoch};
    use proptest::prelude::*;

    fn finish(amount: Option<i64>) -> Reconciliation {
        Reconciliation::Finish {
            item_sold: amount.is_some(),
            winner: amount.map(|_| "alice".to_string()),
            amount,
        }
    }

    #[test]
    fn sale_above_reserve_finishes() {
        let mut a = auction();
        a.reserve_price = 20_000;
        assert!(finish(Some(25_000)).apply(&mut a));
        assert_eq!(a.status, AuctionStatus::Finished);
        assert_eq!(a.winner.as_deref(), Some("alice"));
        assert_eq!(a.sold_amount, Some(25_000));
    }

    #[test]
    fn sale_below_reserve_is_reserve_not_met() {
        let mut a = auction();
        a.reserve_price = 20_000;
        finish(Some(15_000)).apply(&mut a);
        assert_eq!(a.status, AuctionStatus::ReserveNotMet);

        let mut unsold = auction();
        finish(None).apply(&mut unsold);
        assert_eq!(unsold.status, AuctionStatus::ReserveNotMet);
        assert_eq!(unsold.winner, None);
    }

    #[test]
    fn finish_is_idempotent() {
        let mut a = auction();
        assert!(finish(Some(25_000)).apply(&mut a));
        let once = a.clone();
        assert!(!finish(Some(25_000)).apply(&mut a));
        assert_eq!(a, once);
    }

    #[test]
    fn missing_high_bid_counts_as_no_bid() {
        let mut a = auction();
        assert!(Reconciliation::HighBid { amount: 1 }.apply(&mut a));
        assert!(!Reconciliation::HighBid { amount: 1 }.apply(&mut a));
        assert_eq!(a.current_high_bid, Some(1));
    }

    proptest! {
        #[test]
        fn high_bid_is_max_regardless_of_order(amounts in proptest::collection::vec(1i64..1_000_000, 1..40)) {
            let mut a = auction();
            for amount in &amounts {
                Reconciliation::HighBid { amount: *amount }.apply(&mut a);
            }
            prop_assert_eq!(a.current_high_bid, amounts.iter().copied().max());
        }
    }

    fn bid(auction_id: Uuid, amount: i64, status: BidStatus) -> BidPlaced {
        BidPlaced {
            id: Uuid::new_v4(),
            auction_id,
            bidder: "alice".into(),
            bid_time: test_epoch(),
            amount,
            bid_status: status,
        }
    }

    async fn setup() -> (Arc<InMemoryAuctionStore>, AuctionReconciler, Uuid) {
        let store = Arc::new(InMemoryAuctionStore::new());
        let a = auction();
        let id = a.id;
        store.commit(AuctionChange::Create(a), vec![]).await.unwrap();
        let reconciler = AuctionReconciler::new(store.clone()).with_clock(Arc::new(test_clock()));
        (store, reconciler, id)
    }

    #[tokio::test]
    async fn only_accepted_bids_raise_high_bid() {
        let (store, reconciler, id) = setup().await;

        for status in [BidStatus::AcceptedBelowReserve, BidStatus::TooLow, BidStatus::Finished] {
            reconciler
                .handle(&context("auction", Uuid::new_v4()), bid(id, 90_000, status))
                .await
                .unwrap();
        }
        assert_eq!(store.get(id).await.unwrap().unwrap().current_high_bid, None);

        reconciler
            .handle(&context("auction", Uuid::new_v4()), bid(id, 500, BidStatus::Accepted))
            .await
            .unwrap();
        assert_eq!(store.get(id).await.unwrap().unwrap().current_high_bid, Some(500));
    }

    #[tokio::test]
    async fn redelivered_bid_is_applied_once() {
        let (store, reconciler, id) = setup().await;
        let ctx = context("auction", Uuid::new_v4());

        for _ in 0..3 {
            reconciler.handle(&ctx, bid(id, 700, BidStatus::Accepted)).await.unwrap();
        }
        assert_eq!(store.get(id).await.unwrap().unwrap().current_high_bid, Some(700));
    }

    #[tokio::test]
    async fn event_for_deleted_auction_is_a_noop() {
        let (store, reconciler, _) = setup().await;
        let ghost = Uuid::new_v4();

        reconciler
            .handle(&context("auction", Uuid::new_v4()), bid(ghost, 700, BidStatus::Accepted))
            .await
            .unwrap();
        assert_eq!(store.get(ghost).await.unwrap(), None);
    }

    #[tokio::test]
    async fn store_outage_is_transient() {
        let (store, reconciler, id) = setup().await;
        store.set_unavailable(true);

        let err = reconciler
            .handle(&context("auction", Uuid::new_v4()), bid(id, 700, BidStatus::Accepted))
            .await
            .unwrap_err();
        assert_eq!(err.kind, gavel_core::fault::FaultKind::Transient);
    }
}
