//! Domain events exchanged between the auction services.
//!
//! Payloads are camelCase JSON. Correction rules in
//! [`compensation`](crate::compensation) address fields by these wire names.

use crate::model::{Auction, AuctionStatus, Bid, BidStatus};
use chrono::{DateTime, Utc};
use gavel_core::message::Message;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// An auction was listed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuctionCreated {
    /// Auction id
    pub id: Uuid,
    /// Reserve price
    pub reserve_price: i64,
    /// Seller username
    pub seller: String,
    /// Winner, if any
    pub winner: Option<String>,
    /// Sold amount, if any
    pub sold_amount: Option<i64>,
    /// Highest accepted bid
    pub current_high_bid: Option<i64>,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Last modification
    pub updated_at: DateTime<Utc>,
    /// When bidding closes
    pub auction_end: DateTime<Utc>,
    /// Lifecycle status
    pub status: AuctionStatus,
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

impl From<&Auction> for AuctionCreated {
    fn from(auction: &Auction) -> Self {
        Self {
            id: auction.id,
            reserve_price: auction.reserve_price,
            seller: auction.seller.clone(),
            winner: auction.winner.clone(),
            sold_amount: auction.sold_amount,
            current_high_bid: auction.current_high_bid,
            created_at: auction.created_at,
            updated_at: auction.updated_at,
            auction_end: auction.auction_end,
            status: auction.status,
            make: auction.item.make.clone(),
            model: auction.item.model.clone(),
            year: auction.item.year,
            color: auction.item.color.clone(),
            mileage: auction.item.mileage,
            image_url: auction.item.image_url.clone(),
        }
    }
}

impl Message for AuctionCreated {
    const MESSAGE_TYPE: &'static str = "AuctionCreated";

    fn aggregate_id(&self) -> String {
        self.id.to_string()
    }
}

/// Item details of an auction changed.
///
/// Carries the full item after the change so that applying it is idempotent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuctionUpdated {
    /// Auction id
    pub id: Uuid,
    /// Authority `updated_at` after the change
    pub updated_at: DateTime<Utc>,
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
}

impl From<&Auction> for AuctionUpdated {
    fn from(auction: &Auction) -> Self {
        Self {
            id: auction.id,
            updated_at: auction.updated_at,
            make: auction.item.make.clone(),
            model: auction.item.model.clone(),
            year: auction.item.year,
            color: auction.item.color.clone(),
            mileage: auction.item.mileage,
        }
    }
}

impl Message for AuctionUpdated {
    const MESSAGE_TYPE: &'static str = "AuctionUpdated";

    fn aggregate_id(&self) -> String {
        self.id.to_string()
    }
}

/// An auction was removed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuctionDeleted {
    /// Auction id
    pub id: Uuid,
}

impl Message for AuctionDeleted {
    const MESSAGE_TYPE: &'static str = "AuctionDeleted";

    fn aggregate_id(&self) -> String {
        self.id.to_string()
    }
}

/// A bid was evaluated and recorded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BidPlaced {
    /// Bid id
    pub id: Uuid,
    /// Auction bid on
    pub auction_id: Uuid,
    /// Bidder username
    pub bidder: String,
    /// When the bid was placed
    pub bid_time: DateTime<Utc>,
    /// Offered amount
    pub amount: i64,
    /// Evaluation outcome
    pub bid_status: BidStatus,
}

impl From<&Bid> for BidPlaced {
    fn from(bid: &Bid) -> Self {
        Self {
            id: bid.id,
            auction_id: bid.auction_id,
            bidder: bid.bidder.clone(),
            bid_time: bid.bid_time,
            amount: bid.amount,
            bid_status: bid.bid_status,
        }
    }
}

impl Message for BidPlaced {
    const MESSAGE_TYPE: &'static str = "BidPlaced";

    fn aggregate_id(&self) -> String {
        self.auction_id.to_string()
    }
}

/// Bidding closed on an auction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuctionFinished {
    /// Auction id
    pub auction_id: Uuid,
    /// Whether there was a winning bid
    pub item_sold: bool,
    /// Winning bidder
    pub winner: Option<String>,
    /// Seller username
    pub seller: String,
    /// Winning amount
    pub amount: Option<i64>,
    /// When the auction was closed
    pub finished_at: DateTime<Utc>,
}

impl Message for AuctionFinished {
    const MESSAGE_TYPE: &'static str = "AuctionFinished";

    fn aggregate_id(&self) -> String {
        self.auction_id.to_string()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::model::Item;
    use gavel_core::message::MessageEnvelope;
    use gavel_testing::test_epoch;

    fn auction() -> Auction {
        Auction {
            id: Uuid::new_v4(),
            reserve_price: 20_000,
            seller: "bob".into(),
            winner: None,
            sold_amount: None,
            current_high_bid: None,
            created_at: test_epoch(),
            updated_at: test_epoch(),
            auction_end: test_epoch() + chrono::Duration::days(10),
            status: AuctionStatus::Live,
            item: Item {
                make: "Ford".into(),
                model: "GT".into(),
                year: 2020,
                color: "White".into(),
                mileage: 50_000,
                image_url: "https://cdn.example/gt.jpg".into(),
            },
        }
    }

    #[test]
    fn created_payload_uses_wire_field_names() {
        let auction = auction();
        let envelope =
            MessageEnvelope::encode(Uuid::new_v4(), &AuctionCreated::from(&auction), test_epoch()).unwrap();

        let json = envelope.payload_json().unwrap();
        assert_eq!(json["model"], "GT");
        assert_eq!(json["mileage"], 50_000);
        assert_eq!(json["reservePrice"], 20_000);
        assert_eq!(envelope.aggregate_id, auction.id.to_string());
    }

    #[test]
    fn bid_events_are_keyed_by_auction() {
        let auction_id = Uuid::new_v4();
        let bid = BidPlaced {
            id: Uuid::new_v4(),
            auction_id,
            bidder: "alice".into(),
            bid_time: test_epoch(),
            amount: 100,
            bid_status: BidStatus::Accepted,
        };
        assert_eq!(bid.aggregate_id(), auction_id.to_string());
    }
}
