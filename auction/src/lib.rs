//! # Gavel Auction
//!
//! The auction marketplace built on the Gavel consistency core.
//!
//! ```text
//!   HTTP (api)
//!     │
//!     ├── AuctionService ──► authority store ─┬─ auction row
//!     │                                       └─ outbox record   (one transaction)
//!     │
//!     ├── BidService ──► BidGateway (snapshot, timeout) ──► authority store
//!     │        └────────► bid store ─┬─ bid
//!     │                              └─ outbox record
//!     │   AuctionFinisher ──► bid store (AuctionFinished record)
//!     │
//!     └── search / snapshot / notifications (read side)
//!
//!   relays ──► event bus ──┬── search        → SearchProjection
//!                          ├── auction       → AuctionReconciler
//!                          ├── notifications → NotificationFanout
//!                          └── auction-faults → FaultCompensator
//! ```
//!
//! Every consumer deduplicates with an inbox record written in the same unit
//! of work as its change, so redelivery never applies a message twice.

pub mod api;
pub mod bids;
pub mod compensation;
pub mod config;
pub mod consumers;
pub mod events;
pub mod fanout;
pub mod finisher;
pub mod gateway;
pub mod model;
pub mod postgres;
pub mod reconciler;
pub mod search;
pub mod service;
pub mod store;

pub use bids::{BidService, BidServiceError, BidStore, BidStoreError, InMemoryBidStore, PendingBid};
pub use config::{Config, ConfigError};
pub use events::{AuctionCreated, AuctionDeleted, AuctionFinished, AuctionUpdated, BidPlaced};
pub use fanout::{Notification, NotificationFanout};
pub use finisher::AuctionFinisher;
pub use gateway::{AuctionSnapshot, BidGateway, GatewayError};
pub use model::{Auction, AuctionStatus, Bid, BidStatus, Item};
pub use postgres::{PostgresAuctionStore, PostgresBidStore};
pub use reconciler::{AuctionReconciler, Reconciliation};
pub use service::{AuctionService, CreateAuction, ServiceError, UpdateAuction};
pub use store::{AuctionChange, AuctionStore, InMemoryAuctionStore, ModificationCursor, StoreError};

/// Fixtures shared by the unit tests.
#[cfg(test)]
pub(crate) mod test_support {
    use crate::model::{Auction, AuctionStatus, Item};
    use crate::service::CreateAuction;
    use gavel_runtime::MessageContext;
    use gavel_testing::test_epoch;
    use uuid::Uuid;

    /// A live auction by `bob` with a 20 000 reserve, ending ten days after the epoch.
    pub fn auction() -> Auction {
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
                image_url: "https://cdn.example.com/ford-gt.jpg".into(),
            },
        }
    }

    pub fn create_request() -> CreateAuction {
        CreateAuction {
            seller: "bob".into(),
            reserve_price: 20_000,
            auction_end: test_epoch() + chrono::Duration::days(10),
            make: "Ford".into(),
            model: "GT".into(),
            year: 2020,
            color: "White".into(),
            mileage: 50_000,
            image_url: "https://cdn.example.com/ford-gt.jpg".into(),
        }
    }

    /// First-attempt context for `message_id` on `queue`.
    pub fn context(queue: &str, message_id: Uuid) -> MessageContext {
        MessageContext {
            message_id,
            message_type: String::new(),
            aggregate_id: String::new(),
            queue: queue.into(),
            topic: String::new(),
            attempt: 1,
            sent_at: test_epoch(),
        }
    }
}
