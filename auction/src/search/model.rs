//! Denormalized search read model.

use crate::events::AuctionCreated;
use crate::model::{Auction, AuctionStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Flattened copy of an auction, keyed by the auction id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchItem {
    /// Auction id
    pub id: Uuid,
    /// Reserve price
    pub reserve_price: i64,
    /// Seller username
    pub seller: String,
    /// Winner, once finished
    pub winner: Option<String>,
    /// Sold amount, once finished
    pub sold_amount: Option<i64>,
    /// Highest accepted bid
    pub current_high_bid: Option<i64>,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Authority `updated_at` this copy reflects
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

impl From<&AuctionCreated> for SearchItem {
    fn from(event: &AuctionCreated) -> Self {
        Self {
            id: event.id,
            reserve_price: event.reserve_price,
            seller: event.seller.clone(),
            winner: event.winner.clone(),
            sold_amount: event.sold_amount,
            current_high_bid: event.current_high_bid,
            created_at: event.created_at,
            updated_at: event.updated_at,
            auction_end: event.auction_end,
            status: event.status,
            make: event.make.clone(),
            model: event.model.clone(),
            year: event.year,
            color: event.color.clone(),
            mileage: event.mileage,
            image_url: event.image_url.clone(),
        }
    }
}

impl From<&Auction> for SearchItem {
    fn from(auction: &Auction) -> Self {
        Self::from(&AuctionCreated::from(auction))
    }
}
