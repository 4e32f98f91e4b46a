//! Typed domain messages and the envelope they travel in.
//!
//! A [`Message`] is a domain event with a stable wire name. Before it leaves
//! the process it is wrapped in a [`MessageEnvelope`], which carries the
//! identity used for deduplication (`message_id`), the routing information
//! (`message_type`, `aggregate_id`) and free-form `headers`.
//!
//! Payloads are JSON so that a dead-lettered message can be inspected and
//! corrected field by field without knowing its Rust type.
//!
//! # Example
//!
//! ```
//! use gavel_core::message::{Message, MessageEnvelope};
//! use serde::{Deserialize, Serialize};
//! use uuid::Uuid;
//!
//! #[derive(Debug, Serialize, Deserialize, PartialEq)]
//! struct Pinged { id: String }
//!
//! impl Message for Pinged {
//!     const MESSAGE_TYPE: &'static str = "Pinged";
//!     fn aggregate_id(&self) -> String { self.id.clone() }
//! }
//!
//! let msg = Pinged { id: "a-1".into() };
//! let envelope = MessageEnvelope::encode(Uuid::new_v4(), &msg, chrono::Utc::now()).unwrap();
//! assert_eq!(envelope.message_type, "Pinged");
//! assert_eq!(envelope.decode::<Pinged>().unwrap(), msg);
//! ```

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;
use uuid::Uuid;

/// Errors produced while encoding or decoding message payloads.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MessageError {
    /// Payload could not be serialized
    #[error("Failed to encode {message_type}: {reason}")]
    Encode {
        /// Message type being encoded
        message_type: String,
        /// Serializer error
        reason: String,
    },

    /// Payload could not be deserialized into the requested type
    #[error("Failed to decode {message_type}: {reason}")]
    Decode {
        /// Message type being decoded
        message_type: String,
        /// Deserializer error
        reason: String,
    },

    /// The envelope holds a different message type than the one requested
    #[error("Expected message type {expected}, found {found}")]
    TypeMismatch {
        /// Requested type
        expected: &'static str,
        /// Type carried by the envelope
        found: String,
    },
}

/// A domain event with a stable wire name.
///
/// `MESSAGE_TYPE` is the name written to outbox records and envelopes, and the
/// key handlers are registered under. Renaming a Rust type must not change it.
pub trait Message: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Stable wire name (e.g. `"AuctionCreated"`)
    const MESSAGE_TYPE: &'static str;

    /// Id of the aggregate this message describes.
    ///
    /// Used as the broker partition key and for per-aggregate relay ordering.
    fn aggregate_id(&self) -> String;
}

/// Serialize a message payload as JSON.
///
/// # Errors
///
/// Returns [`MessageError::Encode`] if serialization fails.
pub fn encode_payload<M: Message>(message: &M) -> Result<Vec<u8>, MessageError> {
    serde_json::to_vec(message).map_err(|e| MessageError::Encode {
        message_type: M::MESSAGE_TYPE.to_string(),
        reason: e.to_string(),
    })
}

/// A message as it travels through the outbox, the broker and the dead-letter queue.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageEnvelope {
    /// Unique message id; stable across redeliveries and republishes of the same record
    pub message_id: Uuid,
    /// Wire name of the payload type
    pub message_type: String,
    /// Aggregate the message describes
    pub aggregate_id: String,
    /// JSON payload
    pub payload: Vec<u8>,
    /// When the message was handed to the broker (or enqueued, for outbox records)
    pub sent_at: DateTime<Utc>,
    /// Transport metadata (fault classification, original topic, ...)
    pub headers: BTreeMap<String, String>,
}

impl MessageEnvelope {
    /// Wrap a typed message.
    ///
    /// # Errors
    ///
    /// Returns [`MessageError::Encode`] if the payload cannot be serialized.
    pub fn encode<M: Message>(
        message_id: Uuid,
        message: &M,
        sent_at: DateTime<Utc>,
    ) -> Result<Self, MessageError> {
        Ok(Self {
            message_id,
            message_type: M::MESSAGE_TYPE.to_string(),
            aggregate_id: message.aggregate_id(),
            payload: encode_payload(message)?,
            sent_at,
            headers: BTreeMap::new(),
        })
    }

    /// Decode the payload as `M`.
    ///
    /// # Errors
    ///
    /// Returns [`MessageError::TypeMismatch`] if the envelope carries another
    /// message type, or [`MessageError::Decode`] if the JSON does not fit `M`.
    pub fn decode<M: Message>(&self) -> Result<M, MessageError> {
        if self.message_type != M::MESSAGE_TYPE {
            return Err(MessageError::TypeMismatch {
                expected: M::MESSAGE_TYPE,
                found: self.message_type.clone(),
            });
        }
        serde_json::from_slice(&self.payload).map_err(|e| MessageError::Decode {
            message_type: self.message_type.clone(),
            reason: e.to_string(),
        })
    }

    /// Decode the payload as an untyped JSON document.
    ///
    /// # Errors
    ///
    /// Returns [`MessageError::Decode`] if the payload is not valid JSON.
    pub fn payload_json(&self) -> Result<serde_json::Value, MessageError> {
        serde_json::from_slice(&self.payload).map_err(|e| MessageError::Decode {
            message_type: self.message_type.clone(),
            reason: e.to_string(),
        })
    }

    /// Look up a header value.
    #[must_use]
    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(key).map(String::as_str)
    }

    /// Set a header, replacing any previous value.
    #[must_use]
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Opened {
        id: String,
        amount: i64,
    }

    impl Message for Opened {
        const MESSAGE_TYPE: &'static str = "Opened";
        fn aggregate_id(&self) -> String {
            self.id.clone()
        }
    }

    #[derive(Debug, Serialize, Deserialize)]
    struct Closed {
        id: String,
    }

    impl Message for Closed {
        const MESSAGE_TYPE: &'static str = "Closed";
        fn aggregate_id(&self) -> String {
            self.id.clone()
        }
    }

    #[test]
    fn encode_captures_routing_fields() {
        let id = Uuid::new_v4();
        let envelope = MessageEnvelope::encode(
            id,
            &Opened { id: "x".into(), amount: 5 },
            Utc::now(),
        )
        .unwrap();

        assert_eq!(envelope.message_id, id);
        assert_eq!(envelope.aggregate_id, "x");
        assert_eq!(envelope.message_type, "Opened");
        assert!(envelope.headers.is_empty());
    }

    #[test]
    fn decode_rejects_other_message_type() {
        let envelope = MessageEnvelope::encode(
            Uuid::new_v4(),
            &Opened { id: "x".into(), amount: 5 },
            Utc::now(),
        )
        .unwrap();

        let err = envelope.decode::<Closed>().unwrap_err();
        assert!(matches!(err, MessageError::TypeMismatch { expected: "Closed", .. }));
    }

    #[test]
    fn decode_reports_malformed_payload() {
        let mut envelope = MessageEnvelope::encode(
            Uuid::new_v4(),
            &Opened { id: "x".into(), amount: 5 },
            Utc::now(),
        )
        .unwrap();
        envelope.payload = b"{\"id\":\"x\"}".to_vec();

        assert!(matches!(
            envelope.decode::<Opened>(),
            Err(MessageError::Decode { .. })
        ));
    }

    #[test]
    fn envelope_survives_bincode_transport() {
        let envelope = MessageEnvelope::encode(
            Uuid::new_v4(),
            &Opened { id: "x".into(), amount: 5 },
            Utc::now(),
        )
        .unwrap()
        .with_header("fault-kind", "rejected");

        let bytes = bincode::serialize(&envelope).unwrap();
        let back: MessageEnvelope = bincode::deserialize(&bytes).unwrap();
        assert_eq!(back, envelope);
        assert_eq!(back.header("fault-kind"), Some("rejected"));
    }
}
