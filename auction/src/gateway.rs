//! Bid validation gateway.
//!
//! The bidding side needs the authoritative reserve price, seller and end time
//! before it can accept a bid. That read goes straight to the authority store
//! (no projection hop) and is bounded by a short timeout:
//!
//! ```text
//! snapshot(auction_id)
//!   ├── store.get within timeout ── None    → NotFound
//!   │                             └─ elapsed → Timeout
//!   └── AuctionSnapshot ──► evaluate_bid(snapshot, bidder, amount, now) → BidStatus
//! ```

use crate::model::{Auction, BidStatus};
use crate::store::{AuctionStore, StoreError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::warn;
use uuid::Uuid;

/// Default point-query timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(2);

/// Errors surfaced to bidders.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GatewayError {
    /// No such auction
    #[error("Auction not found: {0}")]
    NotFound(Uuid),

    /// The authority did not answer in time
    #[error("Authority did not respond within {0:?}")]
    Timeout(Duration),

    /// The authority answered with an error
    #[error("Authority unavailable: {0}")]
    Unavailable(String),
}

/// Bids refused before evaluation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BidError {
    /// Sellers cannot bid on their own auctions
    #[error("Seller cannot bid on their own auction")]
    OwnAuction,

    /// Amount must be positive
    #[error("Bid amount must be positive, got {0}")]
    InvalidAmount(i64),
}

/// The authority facts a bid is evaluated against.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuctionSnapshot {
    /// Reserve price
    pub reserve_price: i64,
    /// Seller username
    pub seller: String,
    /// When bidding closes
    pub auction_end: DateTime<Utc>,
    /// Highest accepted bid known to the authority
    pub current_high_bid: Option<i64>,
}

impl From<&Auction> for AuctionSnapshot {
    fn from(auction: &Auction) -> Self {
        Self {
            reserve_price: auction.reserve_price,
            seller: auction.seller.clone(),
            auction_end: auction.auction_end,
            current_high_bid: auction.current_high_bid,
        }
    }
}

/// Decide a bid.
///
/// `high_bid` is the highest accepted bid the caller knows of, which may be
/// newer than the snapshot's.
///
/// # Errors
///
/// Returns [`BidError::OwnAuction`] if `bidder` is the seller, or
/// [`BidError::InvalidAmount`] for a non-positive amount.
pub fn evaluate_bid(
    snapshot: &AuctionSnapshot,
    bidder: &str,
    amount: i64,
    high_bid: Option<i64>,
    now: DateTime<Utc>,
) -> Result<BidStatus, BidError> {
    if snapshot.seller == bidder {
        return Err(BidError::OwnAuction);
    }
    if amount <= 0 {
        return Err(BidError::InvalidAmount(amount));
    }
    if snapshot.auction_end <= now {
        return Ok(BidStatus::Finished);
    }

    let high = snapshot.current_high_bid.max(high_bid);
    if high.is_some_and(|high| amount <= high) {
        return Ok(BidStatus::TooLow);
    }
    Ok(if amount > snapshot.reserve_price {
        BidStatus::Accepted
    } else {
        BidStatus::AcceptedBelowReserve
    })
}

/// Point-query of the authority store with a deadline.
#[derive(Clone)]
pub struct BidGateway {
    store: Arc<dyn AuctionStore>,
    timeout: Duration,
}

impl BidGateway {
    /// Create a gateway with the [`DEFAULT_TIMEOUT`].
    #[must_use]
    pub fn new(store: Arc<dyn AuctionStore>) -> Self {
        Self {
            store,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Use a different timeout.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// The configured timeout.
    #[must_use]
    pub const fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Read the bid-relevant facts of `auction_id`.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::NotFound`], [`GatewayError::Timeout`] if the
    /// store does not answer within the timeout, or
    /// [`GatewayError::Unavailable`] if it fails.
    pub async fn snapshot(&self, auction_id: Uuid) -> Result<AuctionSnapshot, GatewayError> {
        let start = Instant::now();
        let result = match tokio::time::timeout(self.timeout, self.store.get(auction_id)).await {
            Err(_) => Err(GatewayError::Timeout(self.timeout)),
            Ok(Err(err)) => Err(unavailable(&err)),
            Ok(Ok(None)) => Err(GatewayError::NotFound(auction_id)),
            Ok(Ok(Some(auction))) => Ok(AuctionSnapshot::from(&auction)),
        };

        let outcome = match &result {
            Ok(_) => "ok",
            Err(GatewayError::NotFound(_)) => "not_found",
            Err(GatewayError::Timeout(_)) => "timeout",
            Err(GatewayError::Unavailable(_)) => "unavailable",
        };
        metrics::counter!("gateway_requests_total", "outcome" => outcome).increment(1);
        metrics::histogram!("gateway_request_duration_seconds").record(start.elapsed().as_secs_f64());

        if let Err(GatewayError::Timeout(timeout)) = &result {
            warn!(auction_id = %auction_id, timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX), "Snapshot timed out");
        }
        result
    }
}

fn unavailable(err: &StoreError) -> GatewayError {
    GatewayError::Unavailable(err.to_string())
}
