//! Message handlers and the explicit registration table.
//!
//! Consumers do not discover handlers; each queue gets a [`HandlerRegistry`]
//! built at startup that maps a message type to the handler for it.
//!
//! ```text
//! "AuctionCreated"  ──► SearchProjection (Handler<AuctionCreated>)
//! "AuctionUpdated"  ──► SearchProjection (Handler<AuctionUpdated>)
//! "BidPlaced"       ──► SearchProjection (Handler<BidPlaced>)
//! <anything else>   ──► fallback (optional)
//! ```
//!
//! Typed handlers implement [`Handler<M>`]; the registry decodes the envelope
//! before calling them. Handlers that work on raw envelopes (the fault
//! compensator) implement [`MessageHandler`] directly.
//!
//! # Example
//!
//! ```rust,ignore
//! let registry = HandlerRegistry::new()
//!     .on::<AuctionCreated, _>(projection.clone())
//!     .on::<AuctionDeleted, _>(projection);
//!
//! assert_eq!(registry.topics(), vec!["auction-created", "auction-deleted"]);
//! ```

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use gavel_core::fault::FaultKind;
use gavel_core::message::{Message, MessageEnvelope, MessageError};
use gavel_core::topic::topic_for;
use std::collections::BTreeMap;
use std::marker::PhantomData;
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

/// Failure returned by a handler.
///
/// `exception_type` names the error so that correction rules can match on it
/// after the message is dead-lettered.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{exception_type}: {message}")]
pub struct HandlerError {
    /// Classification used for logging and fault records
    pub kind: FaultKind,
    /// Error name (e.g. `InvalidArgument`, `StoreUnavailable`)
    pub exception_type: String,
    /// Human-readable detail
    pub message: String,
}

impl HandlerError {
    /// Infrastructure failure; redelivery may succeed.
    #[must_use]
    pub fn transient(exception_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: FaultKind::Transient,
            exception_type: exception_type.into(),
            message: message.into(),
        }
    }

    /// Business-rule violation or malformed payload.
    #[must_use]
    pub fn rejected(exception_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: FaultKind::Rejected,
            exception_type: exception_type.into(),
            message: message.into(),
        }
    }

    /// A payload field holds a value the handler refuses.
    #[must_use]
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::rejected("InvalidArgument", message)
    }

    /// Failure of unknown cause.
    #[must_use]
    pub fn unclassified(message: impl Into<String>) -> Self {
        Self {
            kind: FaultKind::Unclassified,
            exception_type: "Unclassified".to_string(),
            message: message.into(),
        }
    }
}

impl From<MessageError> for HandlerError {
    fn from(err: MessageError) -> Self {
        Self::rejected("MalformedPayload", err.to_string())
    }
}

/// Delivery metadata passed to handlers.
#[derive(Debug, Clone)]
pub struct MessageContext {
    /// Message id; the inbox deduplication key
    pub message_id: Uuid,
    /// Wire name of the message
    pub message_type: String,
    /// Aggregate the message describes
    pub aggregate_id: String,
    /// Queue (consumer id) the message was delivered on
    pub queue: String,
    /// Topic the message was published to
    pub topic: String,
    /// 1-based handler attempt
    pub attempt: u32,
    /// When the message was sent
    pub sent_at: DateTime<Utc>,
}

impl MessageContext {
    /// Build the context for `attempt` of `envelope` on `queue`.
    #[must_use]
    pub fn new(envelope: &MessageEnvelope, queue: &str, topic: &str, attempt: u32) -> Self {
        Self {
            message_id: envelope.message_id,
            message_type: envelope.message_type.clone(),
            aggregate_id: envelope.aggregate_id.clone(),
            queue: queue.to_string(),
            topic: topic.to_string(),
            attempt,
            sent_at: envelope.sent_at,
        }
    }
}

/// Handler over raw envelopes.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Process one delivery attempt.
    ///
    /// # Errors
    ///
    /// Any error triggers redelivery according to the consumer's policy.
    async fn handle(&self, ctx: &MessageContext, envelope: &MessageEnvelope) -> Result<(), HandlerError>;
}

/// Handler for one typed message.
#[async_trait]
pub trait Handler<M: Message>: Send + Sync {
    /// Process one delivery attempt of a decoded message.
    ///
    /// # Errors
    ///
    /// Any error triggers redelivery according to the consumer's policy.
    async fn handle(&self, ctx: &MessageContext, message: M) -> Result<(), HandlerError>;
}

#[async_trait]
impl<T: MessageHandler + ?Sized> MessageHandler for Arc<T> {
    async fn handle(&self, ctx: &MessageContext, envelope: &MessageEnvelope) -> Result<(), HandlerError> {
        (**self).handle(ctx, envelope).await
    }
}

#[async_trait]
impl<M: Message, T: Handler<M> + ?Sized> Handler<M> for Arc<T> {
    async fn handle(&self, ctx: &MessageContext, message: M) -> Result<(), HandlerError> {
        (**self).handle(ctx, message).await
    }
}

struct Typed<M, H> {
    handler: H,
    _message: PhantomData<fn() -> M>,
}

#[async_trait]
impl<M: Message, H: Handler<M>> MessageHandler for Typed<M, H> {
    async fn handle(&self, ctx: &MessageContext, envelope: &MessageEnvelope) -> Result<(), HandlerError> {
        let message = envelope.decode::<M>()?;
        self.handler.handle(ctx, message).await
    }
}

/// Explicit message-type → handler table.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: BTreeMap<String, Arc<dyn MessageHandler>>,
    fallback: Option<Arc<dyn MessageHandler>>,
}

impl HandlerRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Route messages of type `M` to `handler`, replacing any earlier registration.
    #[must_use]
    pub fn on<M: Message, H: Handler<M> + 'static>(mut self, handler: H) -> Self {
        self.handlers.insert(
            M::MESSAGE_TYPE.to_string(),
            Arc::new(Typed {
                handler,
                _message: PhantomData,
            }),
        );
        self
    }

    /// Route a message type to a raw handler.
    #[must_use]
    pub fn on_raw(mut self, message_type: impl Into<String>, handler: Arc<dyn MessageHandler>) -> Self {
        self.handlers.insert(message_type.into(), handler);
        self
    }

    /// Handler for message types with no explicit registration.
    #[must_use]
    pub fn fallback(mut self, handler: Arc<dyn MessageHandler>) -> Self {
        self.fallback = Some(handler);
        self
    }

    /// Handler for `message_type`, or the fallback.
    #[must_use]
    pub fn resolve(&self, message_type: &str) -> Option<Arc<dyn MessageHandler>> {
        self.handlers
            .get(message_type)
            .or(self.fallback.as_ref())
            .cloned()
    }

    /// Registered message types, sorted.
    #[must_use]
    pub fn message_types(&self) -> Vec<&str> {
        self.handlers.keys().map(String::as_str).collect()
    }

    /// Topics for the registered message types, sorted by message type.
    #[must_use]
    pub fn topics(&self) -> Vec<String> {
        self.handlers.keys().map(|t| topic_for(t)).collect()
    }
}
