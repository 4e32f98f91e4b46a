//! Auction closing.
//!
//! The bidding side periodically looks for live auctions past their end and
//! announces the result:
//!
//! ```text
//! tick
//!   ├── authority.ended_live(now)
//!   └── for each: winning bid (Accepted, highest) from the bid store
//!         └── bid store: finished marker + AuctionFinished record   ── one lock / transaction
//!                            │
//!                            ▼ relay
//!             auction (reconciler), search, notifications
//! ```
//!
//! An auction stays `Live` on the authority until the reconciler applies the
//! announcement, so later ticks see it again; the finished marker keeps the
//! announcement to one.

use crate::bids::{BidStore, BidStoreError};
use crate::events::AuctionFinished;
use crate::service::on_aggregate_changed;
use crate::store::{AuctionStore, StoreError};
use gavel_core::environment::{Clock, SystemClock};
use gavel_core::outbox::OutboxError;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};

/// Errors from one finisher tick.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FinishError {
    /// The authority could not be read
    #[error(transparent)]
    Authority(#[from] StoreError),

    /// The announcement could not be encoded
    #[error(transparent)]
    Outbox(#[from] OutboxError),

    /// The bid store could not be read or written
    #[error(transparent)]
    Bids(#[from] BidStoreError),
}

/// Closes ended auctions.
pub struct AuctionFinisher {
    authority: Arc<dyn AuctionStore>,
    bids: Arc<dyn BidStore>,
    clock: Arc<dyn Clock>,
    interval: Duration,
    batch_size: usize,
}

impl AuctionFinisher {
    /// Create a finisher ticking every 5 seconds.
    #[must_use]
    pub fn new(authority: Arc<dyn AuctionStore>, bids: Arc<dyn BidStore>) -> Self {
        Self {
            authority,
            bids,
            clock: Arc::new(SystemClock),
            interval: Duration::from_secs(5),
            batch_size: 100,
        }
    }

    /// Use a specific clock.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Set the tick interval.
    #[must_use]
    pub const fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Announce every ended auction not announced yet. Returns how many were
    /// announced.
    ///
    /// # Errors
    ///
    /// Returns [`FinishError`] if the authority or the bid store fails.
    pub async fn run_once(&self) -> Result<usize, FinishError> {
        let now = self.clock.now();
        let mut announced = 0;

        for auction in self.authority.ended_live(now, self.batch_size).await? {
            if self.bids.is_finished(auction.id).await? {
                continue;
            }
            let winning = self.bids.winning_bid(auction.id).await?;
            let event = AuctionFinished {
                auction_id: auction.id,
                item_sold: winning.is_some(),
                winner: winning.as_ref().map(|bid| bid.bidder.clone()),
                seller: auction.seller.clone(),
                amount: winning.as_ref().map(|bid| bid.amount),
                finished_at: now,
            };
            let record = on_aggregate_changed(&event, now)?;
            if self.bids.record_finish(auction.id, record).await? {
                info!(
                    auction_id = %auction.id,
                    item_sold = event.item_sold,
                    amount = ?event.amount,
                    "Auction finished"
                );
                announced += 1;
            }
        }
        Ok(announced)
    }

    /// Spawn the finisher loop as a background task.
    #[must_use]
    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }

    /// Tick until shutdown.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                _ = interval.tick() => {}
            }
            if *shutdown.borrow() {
                break;
            }
            if let Err(e) = self.run_once().await {
                error!(error = %e, "Finisher tick failed");
            }
        }
        info!("Auction finisher stopped");
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::bids::{BidService, InMemoryBidStore};
    use crate::gateway::BidGateway;
    use crate::store::{AuctionChange, InMemoryAuctionStore};
    use crate::test_support::auction;
    use gavel_core::outbox::OutboxStore;
    use gavel_testing::{ManualClock, test_epoch};

    struct Fixture {
        authority: Arc<InMemoryAuctionStore>,
        bids: InMemoryBidStore,
        service: BidService,
        finisher: AuctionFinisher,
        clock: ManualClock,
    }

    fn fixture() -> Fixture {
        let authority = Arc::new(InMemoryAuctionStore::new());
        let bids = InMemoryBidStore::new();
        let clock = ManualClock::new(test_epoch());
        let service = BidService::new(BidGateway::new(authority.clone()), Arc::new(bids.clone()))
            .with_clock(Arc::new(clock.clone()));
        let finisher =
            AuctionFinisher::new(authority.clone(), Arc::new(bids.clone())).with_clock(Arc::new(clock.clone()));
        Fixture {
            authority,
            bids,
            service,
            finisher,
            clock,
        }
    }

    async fn finished_events(bids: &InMemoryBidStore) -> Vec<AuctionFinished> {
        bids.fetch_unsent(100)
            .await
            .unwrap()
            .into_iter()
            .filter(|r| r.message_type == "AuctionFinished")
            .map(|r| r.to_envelope(test_epoch()).decode::<AuctionFinished>().unwrap())
            .collect()
    }

    #[tokio::test]
    async fn ended_auction_is_announced_once_with_the_winning_bid() {
        let f = fixture();
        let a = auction();
        f.authority.commit(AuctionChange::Create(a.clone()), vec![]).await.unwrap();
        f.service.place_bid(a.id, "alice", 25_000).await.unwrap();
        f.service.place_bid(a.id, "carol", 30_000).await.unwrap();

        assert_eq!(f.finisher.run_once().await.unwrap(), 0);

        f.clock.advance(chrono::Duration::days(11));
        assert_eq!(f.finisher.run_once().await.unwrap(), 1);
        assert_eq!(f.finisher.run_once().await.unwrap(), 0);

        let events = finished_events(&f.bids).await;
        assert_eq!(events.len(), 1);
        assert!(events[0].item_sold);
        assert_eq!(events[0].winner.as_deref(), Some("carol"));
        assert_eq!(events[0].amount, Some(30_000));
    }

    #[tokio::test]
    async fn below_reserve_bids_do_not_sell_the_item() {
        let f = fixture();
        let a = auction();
        f.authority.commit(AuctionChange::Create(a.clone()), vec![]).await.unwrap();
        f.service.place_bid(a.id, "alice", 10_000).await.unwrap();

        f.clock.advance(chrono::Duration::days(11));
        f.finisher.run_once().await.unwrap();

        let events = finished_events(&f.bids).await;
        assert!(!events[0].item_sold);
        assert_eq!(events[0].winner, None);
        assert_eq!(events[0].amount, None);
    }

    #[tokio::test]
    async fn unavailable_authority_fails_the_tick() {
        let f = fixture();
        f.authority.set_unavailable(true);
        assert!(matches!(f.finisher.run_once().await, Err(FinishError::Authority(_))));
    }
}
