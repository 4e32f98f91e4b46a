//! Application state shared across HTTP handlers.

use crate::bids::BidService;
use crate::fanout::NotificationFanout;
use crate::gateway::BidGateway;
use crate::search::SearchStore;
use crate::service::AuctionService;
use gavel_core::environment::{Clock, SystemClock};
use gavel_runtime::metrics::MetricsServer;
use std::sync::Arc;

/// Everything the handlers need. Cheap to clone.
#[derive(Clone)]
pub struct AppState {
    /// Authority mutations
    pub auctions: AuctionService,
    /// Bid validation gateway
    pub gateway: BidGateway,
    /// Bid placement
    pub bids: BidService,
    /// Search read model
    pub search: Arc<dyn SearchStore>,
    /// Live notifications
    pub fanout: NotificationFanout,
    /// Prometheus recorder, when metrics are enabled
    pub metrics: Option<Arc<MetricsServer>>,
    /// Clock search filters are evaluated against
    pub clock: Arc<dyn Clock>,
}

impl AppState {
    /// Create the state with metrics disabled and the system clock.
    #[must_use]
    pub fn new(
        auctions: AuctionService,
        gateway: BidGateway,
        bids: BidService,
        search: Arc<dyn SearchStore>,
        fanout: NotificationFanout,
    ) -> Self {
        Self {
            auctions,
            gateway,
            bids,
            search,
            fanout,
            metrics: None,
            clock: Arc::new(SystemClock),
        }
    }

    /// Serve `/metrics` from `metrics`.
    #[must_use]
    pub fn with_metrics(mut self, metrics: Arc<MetricsServer>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Use a specific clock.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }
}
