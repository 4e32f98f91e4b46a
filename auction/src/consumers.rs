//! Queue wiring.
//!
//! | queue            | topics                                   | handler              |
//! |------------------|------------------------------------------|----------------------|
//! | `search`         | every auction and bid event              | [`SearchProjection`] |
//! | `auction`        | `bid-placed`, `auction-finished`         | [`AuctionReconciler`] |
//! | `notifications`  | `auction-created`, `bid-placed`, `auction-finished` | [`NotificationFanout`] |
//! | `auction-faults` | `<queue>-error` of the three above       | [`FaultCompensator`] |
//!
//! The queue name doubles as the inbox consumer id, so each queue deduplicates
//! independently.

use crate::events::{AuctionCreated, AuctionDeleted, AuctionFinished, AuctionUpdated, BidPlaced};
use crate::fanout::NotificationFanout;
use crate::reconciler::AuctionReconciler;
use crate::search::SearchProjection;
use gavel_core::event_bus::EventBus;
use gavel_core::topic::error_topic;
use gavel_runtime::{EventConsumer, FaultCompensator, HandlerRegistry, RedeliveryPolicy};
use std::sync::Arc;
use tokio::sync::watch;

/// Search projection queue.
pub const SEARCH_QUEUE: &str = "search";
/// Authority reconciler queue.
pub const AUCTION_QUEUE: &str = "auction";
/// Notification fan-out queue.
pub const NOTIFICATIONS_QUEUE: &str = "notifications";
/// Dead-letter compensation queue.
pub const FAULTS_QUEUE: &str = "auction-faults";

/// Registry for the search projection.
#[must_use]
pub fn search_registry(projection: Arc<SearchProjection>) -> HandlerRegistry {
    HandlerRegistry::new()
        .on::<AuctionCreated, _>(projection.clone())
        .on::<AuctionUpdated, _>(projection.clone())
        .on::<AuctionDeleted, _>(projection.clone())
        .on::<BidPlaced, _>(projection.clone())
        .on::<AuctionFinished, _>(projection)
}

/// Registry for the authority reconciler.
#[must_use]
pub fn auction_registry(reconciler: Arc<AuctionReconciler>) -> HandlerRegistry {
    HandlerRegistry::new()
        .on::<BidPlaced, _>(reconciler.clone())
        .on::<AuctionFinished, _>(reconciler)
}

/// Registry for the notification fan-out.
#[must_use]
pub fn notifications_registry(fanout: NotificationFanout) -> HandlerRegistry {
    HandlerRegistry::new()
        .on::<AuctionCreated, _>(fanout.clone())
        .on::<BidPlaced, _>(fanout.clone())
        .on::<AuctionFinished, _>(fanout)
}

/// Registry routing every dead letter to `compensator`.
#[must_use]
pub fn faults_registry(compensator: Arc<FaultCompensator>) -> HandlerRegistry {
    HandlerRegistry::new().fallback(compensator)
}

/// Dead-letter topics the compensation queue binds.
#[must_use]
pub fn fault_topics() -> Vec<String> {
    [SEARCH_QUEUE, AUCTION_QUEUE, NOTIFICATIONS_QUEUE]
        .into_iter()
        .map(error_topic)
        .collect()
}

/// The handlers behind the four queues.
pub struct ConsumerSet {
    /// Search projection
    pub projection: Arc<SearchProjection>,
    /// Authority reconciler
    pub reconciler: Arc<AuctionReconciler>,
    /// Live notification fan-out
    pub fanout: NotificationFanout,
    /// Dead-letter compensator
    pub compensator: Arc<FaultCompensator>,
}

impl ConsumerSet {
    /// Build one consumer per queue, all on `event_bus` with the same policy.
    ///
    /// The compensation queue is the last element.
    #[must_use]
    pub fn into_consumers(
        self,
        event_bus: &Arc<dyn EventBus>,
        policy: RedeliveryPolicy,
        prefetch: usize,
        shutdown: &watch::Receiver<bool>,
    ) -> Vec<EventConsumer> {
        let consumer = |queue: &str, registry: HandlerRegistry| {
            EventConsumer::new(queue, Arc::clone(event_bus), registry, shutdown.clone())
                .with_policy(policy)
                .with_prefetch(prefetch)
        };

        vec![
            consumer(SEARCH_QUEUE, search_registry(self.projection)),
            consumer(AUCTION_QUEUE, auction_registry(self.reconciler)),
            consumer(NOTIFICATIONS_QUEUE, notifications_registry(self.fanout)),
            consumer(FAULTS_QUEUE, faults_registry(self.compensator)).with_topics(fault_topics()),
        ]
    }
}
