//! Auction aggregate and bid vocabulary.
//!
//! Amounts are whole currency units held as `i64`. The [`Item`] is an embedded
//! value: it has no identity of its own and is stored with its auction.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Lifecycle of an auction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AuctionStatus {
    /// Accepting bids
    Live,
    /// Ended with a winning bid above the reserve
    Finished,
    /// Ended without a bid above the reserve
    ReserveNotMet,
}

impl AuctionStatus {
    /// Storage name of the status.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Live => "Live",
            Self::Finished => "Finished",
            Self::ReserveNotMet => "ReserveNotMet",
        }
    }

    /// Status of a closed auction that sold for `sold_amount`.
    ///
    /// The reserve is exclusive: a sale at exactly the reserve does not meet it.
    #[must_use]
    pub fn after_finish(sold_amount: Option<i64>, reserve_price: i64) -> Self {
        if sold_amount.is_some_and(|sold| sold > reserve_price) {
            Self::Finished
        } else {
            Self::ReserveNotMet
        }
    }

    /// Parse a storage name.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "Live" => Some(Self::Live),
            "Finished" => Some(Self::Finished),
            "ReserveNotMet" => Some(Self::ReserveNotMet),
            _ => None,
        }
    }
}

impl fmt::Display for AuctionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The vehicle being sold.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Item {
    /// Manufacturer
    pub make: String,
    /// Model name
    pub model: String,
    /// Model year
    pub year: i32,
    /// Paint color
    pub color: String,
    /// Odometer reading
    pub mileage: i32,
    /// Listing image
    pub image_url: String,
}

/// Authority aggregate.
///
/// Owned by the authority store and mutated only through
/// [`AuctionService`](crate::service::AuctionService) and the
/// [`AuctionReconciler`](crate::reconciler::AuctionReconciler).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Auction {
    /// Aggregate id
    pub id: Uuid,
    /// Minimum winning amount (exclusive)
    pub reserve_price: i64,
    /// Seller username
    pub seller: String,
    /// Winning bidder, once finished
    pub winner: Option<String>,
    /// Winning amount, once finished
    pub sold_amount: Option<i64>,
    /// Highest accepted bid so far
    pub current_high_bid: Option<i64>,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Last authority-side modification; the projection's staleness guard
    pub updated_at: DateTime<Utc>,
    /// When bidding closes
    pub auction_end: DateTime<Utc>,
    /// Lifecycle status
    pub status: AuctionStatus,
    /// Embedded item
    pub item: Item,
}

impl Auction {
    /// Whether bidding has closed at `now`.
    #[must_use]
    pub fn has_ended(&self, now: DateTime<Utc>) -> bool {
        self.auction_end <= now
    }
}

/// Outcome of evaluating a bid against the authority snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BidStatus {
    /// Highest bid and above the reserve
    Accepted,
    /// Highest bid but not above the reserve
    AcceptedBelowReserve,
    /// Not above the current high bid
    TooLow,
    /// Placed after the auction ended
    Finished,
}

impl BidStatus {
    /// Storage name of the status.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Accepted => "Accepted",
            Self::AcceptedBelowReserve => "AcceptedBelowReserve",
            Self::TooLow => "TooLow",
            Self::Finished => "Finished",
        }
    }

    /// Inverse of [`as_str`](Self::as_str).
    #[must_use]
    pub fn parse(status: &str) -> Option<Self> {
        match status {
            "Accepted" => Some(Self::Accepted),
            "AcceptedBelowReserve" => Some(Self::AcceptedBelowReserve),
            "TooLow" => Some(Self::TooLow),
            "Finished" => Some(Self::Finished),
            _ => None,
        }
    }
}

impl fmt::Display for BidStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A bid as recorded by the bidding side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Bid {
    /// Bid id
    pub id: Uuid,
    /// Auction bid on
    pub auction_id: Uuid,
    /// Bidder username
    pub bidder: String,
    /// Offered amount
    pub amount: i64,
    /// When the bid was placed
    pub bid_time: DateTime<Utc>,
    /// Evaluation outcome
    pub bid_status: BidStatus,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_names_roundtrip() {
        for status in [AuctionStatus::Live, AuctionStatus::Finished, AuctionStatus::ReserveNotMet] {
            assert_eq!(AuctionStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(AuctionStatus::parse("Closed"), None);

        for status in [
            BidStatus::Accepted,
            BidStatus::AcceptedBelowReserve,
            BidStatus::TooLow,
            BidStatus::Finished,
        ] {
            assert_eq!(BidStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(BidStatus::parse("Rejected"), None);
    }
}
