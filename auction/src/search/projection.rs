//! Idempotent search projection consumer.
//!
//! One handler per auction event. Each validates the payload, turns the event
//! into a [`SearchChange`] and applies it with the delivery's inbox record.
//!
//! Failure classification:
//!
//! - store unreachable → transient; redelivery retries, the handler never loops
//! - business-rule violation → `InvalidArgument`; dead-lettered once redelivery
//!   is exhausted, then corrected by the compensation consumer

use crate::events::{AuctionCreated, AuctionDeleted, AuctionFinished, AuctionUpdated, BidPlaced};
use crate::model::BidStatus;
use crate::search::model::SearchItem;
use crate::search::store::{ApplyOutcome, SearchChange, SearchStore};
use async_trait::async_trait;
use gavel_core::environment::{Clock, SystemClock};
use gavel_core::inbox::InboxRecord;
use gavel_runtime::{Handler, HandlerError, MessageContext};
use std::sync::Arc;
use tracing::{debug, info};

/// Payload rules the projection enforces.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ItemRules {
    blocked_models: Vec<String>,
}

impl ItemRules {
    /// Rules rejecting the given model names (case-insensitive).
    #[must_use]
    pub fn new(blocked_models: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            blocked_models: blocked_models.into_iter().map(Into::into).collect(),
        }
    }

    /// Whether `model` is blocked.
    #[must_use]
    pub fn is_blocked(&self, model: &str) -> bool {
        self.blocked_models.iter().any(|blocked| blocked.eq_ignore_ascii_case(model))
    }

    /// Validate item fields.
    ///
    /// # Errors
    ///
    /// Returns an `InvalidArgument` rejection for a blocked model or a
    /// negative mileage.
    pub fn check(&self, model: &str, mileage: i32) -> Result<(), HandlerError> {
        if self.is_blocked(model) {
            return Err(HandlerError::invalid_argument(format!("model '{model}' is not allowed")));
        }
        if mileage < 0 {
            return Err(HandlerError::invalid_argument(format!("mileage {mileage} is negative")));
        }
        Ok(())
    }
}

/// Search-side consumer of auction and bid events.
pub struct SearchProjection {
    store: Arc<dyn SearchStore>,
    rules: ItemRules,
    clock: Arc<dyn Clock>,
}

impl SearchProjection {
    /// Create a projection writing to `store`.
    #[must_use]
    pub fn new(store: Arc<dyn SearchStore>, rules: ItemRules) -> Self {
        Self {
            store,
            rules,
            clock: Arc::new(SystemClock),
        }
    }

    /// Use a specific clock for inbox timestamps.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    async fn apply(&self, ctx: &MessageContext, change: SearchChange) -> Result<ApplyOutcome, HandlerError> {
        let item_id = change.item_id();
        let inbox = InboxRecord::new(&ctx.queue, ctx.message_id, self.clock.now());
        let outcome = self
            .store
            .apply(inbox, change)
            .await
            .map_err(|e| HandlerError::transient("StoreUnavailable", e.to_string()))?;

        metrics::counter!(
            "search_changes_total",
            "message_type" => ctx.message_type.clone(),
            "outcome" => outcome.as_str()
        )
        .increment(1);

        match outcome {
            ApplyOutcome::Applied => {
                info!(item_id = %item_id, message_type = %ctx.message_type, "Search item updated");
            }
            ApplyOutcome::Stale => {
                info!(item_id = %item_id, message_type = %ctx.message_type, "Stale event discarded");
            }
            other => {
                debug!(item_id = %item_id, message_id = %ctx.message_id, outcome = other.as_str(), "Event left projection unchanged");
            }
        }
        Ok(outcome)
    }
}

#[async_trait]
impl Handler<AuctionCreated> for SearchProjection {
    async fn handle(&self, ctx: &MessageContext, event: AuctionCreated) -> Result<(), HandlerError> {
        self.rules.check(&event.model, event.mileage)?;
        self.apply(ctx, SearchChange::Upsert(SearchItem::from(&event))).await?;
        Ok(())
    }
}

#[async_trait]
impl Handler<AuctionUpdated> for SearchProjection {
    async fn handle(&self, ctx: &MessageContext, event: AuctionUpdated) -> Result<(), HandlerError> {
        self.rules.check(&event.model, event.mileage)?;
        self.apply(ctx, SearchChange::Update(event)).await?;
        Ok(())
    }
}

#[async_trait]
impl Handler<AuctionDeleted> for SearchProjection {
    async fn handle(&self, ctx: &MessageContext, event: AuctionDeleted) -> Result<(), HandlerError> {
        self.apply(ctx, SearchChange::Delete(event.id)).await?;
        Ok(())
    }
}

#[async_trait]
impl Handler<BidPlaced> for SearchProjection {
    async fn handle(&self, ctx: &MessageContext, event: BidPlaced) -> Result<(), HandlerError> {
        if event.bid_status != BidStatus::Accepted {
            return Ok(());
        }
        self.apply(
            ctx,
            SearchChange::HighBid {
                id: event.auction_id,
                amount: event.amount,
            },
        )
        .await?;
        Ok(())
    }
}

#[async_trait]
impl Handler<AuctionFinished> for SearchProjection {
    async fn handle(&self, ctx: &MessageContext, event: AuctionFinished) -> Result<(), HandlerError> {
        self.apply(ctx, SearchChange::Finish(event)).await?;
        Ok(())
    }
}
