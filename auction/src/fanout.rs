//! Notification fan-out.
//!
//! Forwards auction events from the `notifications` queue to a
//! `tokio::sync::broadcast` channel. Push delivery is at-most-once: a receiver
//! that lags behind the channel capacity loses notifications and is expected
//! to re-query.

use crate::events::{AuctionCreated, AuctionFinished, BidPlaced};
use async_trait::async_trait;
use gavel_runtime::{Handler, HandlerError, MessageContext};
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::debug;

/// Default channel capacity.
pub const DEFAULT_CAPACITY: usize = 256;

/// A notification pushed to live clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", content = "data")]
pub enum Notification {
    /// An auction was listed
    AuctionCreated(AuctionCreated),
    /// A bid was placed
    BidPlaced(BidPlaced),
    /// An auction closed
    AuctionFinished(AuctionFinished),
}

/// Consumer that republishes events on a broadcast channel.
#[derive(Clone)]
pub struct NotificationFanout {
    sender: broadcast::Sender<Notification>,
}

impl Default for NotificationFanout {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl NotificationFanout {
    /// Create a fan-out buffering up to `capacity` notifications per receiver.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Subscribe a live client.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.sender.subscribe()
    }

    /// Number of live receivers.
    #[must_use]
    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }

    fn push(&self, notification: Notification) {
        // No receivers is not a failure.
        if let Ok(receivers) = self.sender.send(notification) {
            metrics::counter!("notifications_pushed_total").increment(1);
            debug!(receivers, "Notification pushed");
        }
    }
}

#[async_trait]
impl Handler<AuctionCreated> for NotificationFanout {
    async fn handle(&self, _ctx: &MessageContext, event: AuctionCreated) -> Result<(), HandlerError> {
        self.push(Notification::AuctionCreated(event));
        Ok(())
    }
}

#[async_trait]
impl Handler<BidPlaced> for NotificationFanout {
    async fn handle(&self, _ctx: &MessageContext, event: BidPlaced) -> Result<(), HandlerError> {
        self.push(Notification::BidPlaced(event));
        Ok(())
    }
}

#[async_trait]
impl Handler<AuctionFinished> for NotificationFanout {
    async fn handle(&self, _ctx: &MessageContext, event: AuctionFinished) -> Result<(), HandlerError> {
        self.push(Notification::AuctionFinished(event));
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::test_support::{auction, context};
    use tokio::sync::broadcast::error::RecvError;
    use uuid::Uuid;

    #[tokio::test]
    async fn events_reach_every_receiver() {
        let fanout = NotificationFanout::new(8);
        let mut first = fanout.subscribe();
        let mut second = fanout.subscribe();
        let event = AuctionCreated::from(&auction());

        fanout.handle(&context("notifications", Uuid::new_v4()), event.clone()).await.unwrap();

        assert_eq!(first.recv().await.unwrap(), Notification::AuctionCreated(event.clone()));
        assert_eq!(second.recv().await.unwrap(), Notification::AuctionCreated(event));
    }

    #[tokio::test]
    async fn no_receivers_is_acknowledged() {
        let fanout = NotificationFanout::default();
        assert_eq!(fanout.receiver_count(), 0);
        fanout
            .handle(&context("notifications", Uuid::new_v4()), AuctionCreated::from(&auction()))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn lagging_receiver_loses_notifications() {
        let fanout = NotificationFanout::new(1);
        let mut slow = fanout.subscribe();

        for _ in 0..3 {
            fanout
                .handle(&context("notifications", Uuid::new_v4()), AuctionCreated::from(&auction()))
                .await
                .unwrap();
        }

        assert!(matches!(slow.recv().await, Err(RecvError::Lagged(2))));
        assert!(slow.recv().await.is_ok());
    }

    #[test]
    fn notifications_are_tagged_json() {
        let json = serde_json::to_value(Notification::AuctionCreated(AuctionCreated::from(&auction()))).unwrap();
        assert_eq!(json["type"], "AuctionCreated");
        assert_eq!(json["data"]["make"], "Ford");
    }
}
