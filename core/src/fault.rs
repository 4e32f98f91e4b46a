//! Fault classification and the dead-letter bookkeeping types.
//!
//! Failures fall into three classes:
//!
//! | Kind           | Example                          | Recovery                                 |
//! |----------------|----------------------------------|------------------------------------------|
//! | `Transient`    | store or broker unreachable      | redelivery / next relay tick             |
//! | `Rejected`     | payload breaks a business rule   | dead-letter, compensation if a rule fits |
//! | `Unclassified` | anything else                    | dead-letter, escalate to operators       |
//!
//! When redelivery is exhausted the consumer moves the message verbatim to
//! `<queue>-error` and describes the failure in its headers ([`FaultInfo`]).
//! The compensation consumer reads those headers back, and either republishes
//! a corrected copy or writes a [`FaultRecord`] to a [`FaultLedger`].

use crate::message::MessageEnvelope;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;
use uuid::Uuid;

/// Header names used to tag dead-lettered envelopes.
pub mod headers {
    /// Name of the error that caused the final failure (e.g. `InvalidArgument`)
    pub const EXCEPTION_TYPE: &str = "fault-exception-type";
    /// [`FaultKind`](super::FaultKind) as a string
    pub const KIND: &str = "fault-kind";
    /// Human-readable failure message
    pub const REASON: &str = "fault-reason";
    /// Delivery attempts made before dead-lettering
    pub const ATTEMPTS: &str = "fault-attempts";
    /// RFC 3339 timestamp of the first failed attempt
    pub const FIRST_FAILED_AT: &str = "fault-first-failed-at";
    /// Queue whose consumer failed
    pub const QUEUE: &str = "fault-queue";
    /// Topic the message was originally published to
    pub const ORIGINAL_TOPIC: &str = "fault-original-topic";
}

/// Failure classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FaultKind {
    /// Infrastructure unavailable; retrying later may succeed
    Transient,
    /// Business-rule violation or malformed payload
    Rejected,
    /// Unknown failure
    Unclassified,
}

impl FaultKind {
    /// String form used in headers and storage.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Transient => "transient",
            Self::Rejected => "rejected",
            Self::Unclassified => "unclassified",
        }
    }

    /// Parse the string form. Unknown strings are `Unclassified`.
    #[must_use]
    pub fn parse(s: &str) -> Self {
        match s {
            "transient" => Self::Transient,
            "rejected" => Self::Rejected,
            _ => Self::Unclassified,
        }
    }
}

impl fmt::Display for FaultKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure description carried in the headers of a dead-lettered envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FaultInfo {
    /// Classification of the final failure
    pub kind: FaultKind,
    /// Error name, used to look up correction rules
    pub exception_type: String,
    /// Error message
    pub reason: String,
    /// Attempts made
    pub attempts: u32,
    /// First failed attempt
    pub first_failed_at: DateTime<Utc>,
    /// Queue whose consumer failed
    pub queue: String,
    /// Topic the message arrived on
    pub original_topic: String,
}

impl FaultInfo {
    /// Write this description into `envelope`'s headers.
    ///
    /// Payload and identity are left untouched.
    #[must_use]
    pub fn tag(&self, envelope: MessageEnvelope) -> MessageEnvelope {
        envelope
            .with_header(headers::KIND, self.kind.as_str())
            .with_header(headers::EXCEPTION_TYPE, self.exception_type.clone())
            .with_header(headers::REASON, self.reason.clone())
            .with_header(headers::ATTEMPTS, self.attempts.to_string())
            .with_header(headers::FIRST_FAILED_AT, self.first_failed_at.to_rfc3339())
            .with_header(headers::QUEUE, self.queue.clone())
            .with_header(headers::ORIGINAL_TOPIC, self.original_topic.clone())
    }

    /// Read a description back from a dead-lettered envelope.
    ///
    /// Returns `None` if the envelope was never tagged.
    #[must_use]
    pub fn read(envelope: &MessageEnvelope) -> Option<Self> {
        let exception_type = envelope.header(headers::EXCEPTION_TYPE)?.to_string();
        let first_failed_at = envelope
            .header(headers::FIRST_FAILED_AT)
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map_or(envelope.sent_at, |t| t.with_timezone(&Utc));

        Some(Self {
            kind: envelope
                .header(headers::KIND)
                .map_or(FaultKind::Unclassified, FaultKind::parse),
            exception_type,
            reason: envelope.header(headers::REASON).unwrap_or_default().to_string(),
            attempts: envelope
                .header(headers::ATTEMPTS)
                .and_then(|s| s.parse().ok())
                .unwrap_or(0),
            first_failed_at,
            queue: envelope.header(headers::QUEUE).unwrap_or_default().to_string(),
            original_topic: envelope
                .header(headers::ORIGINAL_TOPIC)
                .unwrap_or_default()
                .to_string(),
        })
    }
}

/// Lifecycle of an escalated fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FaultStatus {
    /// Waiting for an operator
    Pending,
    /// An operator is working on it
    Processing,
    /// Fixed and reprocessed
    Resolved,
    /// Permanently dropped
    Discarded,
}

impl FaultStatus {
    /// Convert status to its storage representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Resolved => "resolved",
            Self::Discarded => "discarded",
        }
    }

    /// Parse status from storage.
    ///
    /// # Errors
    ///
    /// Returns [`FaultLedgerError::InvalidStatus`] for unknown strings.
    pub fn parse(s: &str) -> Result<Self, FaultLedgerError> {
        match s {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "resolved" => Ok(Self::Resolved),
            "discarded" => Ok(Self::Discarded),
            _ => Err(FaultLedgerError::InvalidStatus(s.to_string())),
        }
    }
}

/// A dead-lettered message that could not be corrected automatically.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FaultRecord {
    /// The dead-lettered envelope, headers included
    pub original_message: MessageEnvelope,
    /// Error name from the failing consumer
    pub exception_type: String,
    /// Attempts made before dead-lettering
    pub attempt_count: u32,
    /// First failed attempt
    pub first_failed_at: DateTime<Utc>,
    /// Why the fault was escalated
    pub reason: String,
    /// Queue whose consumer failed
    pub queue: String,
    /// Operator workflow status
    pub status: FaultStatus,
    /// When the record was written
    pub recorded_at: DateTime<Utc>,
}

impl FaultRecord {
    /// Build a pending record for a dead-lettered envelope.
    ///
    /// Missing fault headers fall back to `Unknown` / zero attempts.
    #[must_use]
    pub fn pending(
        original_message: MessageEnvelope,
        reason: impl Into<String>,
        recorded_at: DateTime<Utc>,
    ) -> Self {
        let info = FaultInfo::read(&original_message);
        Self {
            exception_type: info
                .as_ref()
                .map_or_else(|| "Unknown".to_string(), |i| i.exception_type.clone()),
            attempt_count: info.as_ref().map_or(0, |i| i.attempts),
            first_failed_at: info
                .as_ref()
                .map_or(original_message.sent_at, |i| i.first_failed_at),
            queue: info.map(|i| i.queue).unwrap_or_default(),
            reason: reason.into(),
            status: FaultStatus::Pending,
            recorded_at,
            original_message,
        }
    }

    /// Id of the dead-lettered message; the record's identity.
    #[must_use]
    pub const fn message_id(&self) -> Uuid {
        self.original_message.message_id
    }
}

/// Errors from fault ledger storage.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FaultLedgerError {
    /// Storage backend failed
    #[error("Fault ledger storage error: {0}")]
    Storage(String),

    /// No fault with this message id
    #[error("Fault not found: {0}")]
    NotFound(Uuid),

    /// Stored status string is not recognised
    #[error("Invalid fault status: {0}")]
    InvalidStatus(String),
}

/// Operational sink for dead-lettered messages.
///
/// Tracks two things: which dead-lettered messages were already corrected
/// (so a duplicate dead letter is not corrected twice) and which were
/// escalated for manual intervention.
pub trait FaultLedger: Send + Sync {
    /// Whether `message_id` was already corrected and republished.
    ///
    /// # Errors
    ///
    /// Returns [`FaultLedgerError::Storage`] if the lookup fails.
    fn is_corrected(
        &self,
        message_id: Uuid,
    ) -> Pin<Box<dyn Future<Output = Result<bool, FaultLedgerError>> + Send + '_>>;

    /// Record that `message_id` was corrected and republished as `republished_id`.
    ///
    /// Returns `false` if it was already recorded.
    ///
    /// # Errors
    ///
    /// Returns [`FaultLedgerError::Storage`] if the write fails.
    fn mark_corrected(
        &self,
        message_id: Uuid,
        republished_id: Uuid,
        corrected_at: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<bool, FaultLedgerError>> + Send + '_>>;

    /// Store an escalated fault. Idempotent on the dead-lettered message id:
    /// returns `false` if that message was already escalated.
    ///
    /// # Errors
    ///
    /// Returns [`FaultLedgerError::Storage`] if the write fails.
    fn escalate(
        &self,
        record: FaultRecord,
    ) -> Pin<Box<dyn Future<Output = Result<bool, FaultLedgerError>> + Send + '_>>;
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn envelope() -> MessageEnvelope {
        MessageEnvelope {
            message_id: Uuid::new_v4(),
            message_type: "AuctionCreated".into(),
            aggregate_id: "a".into(),
            payload: b"{}".to_vec(),
            sent_at: Utc::now(),
            headers: BTreeMap::new(),
        }
    }

    fn info() -> FaultInfo {
        FaultInfo {
            kind: FaultKind::Rejected,
            exception_type: "InvalidArgument".into(),
            reason: "blocked model".into(),
            attempts: 5,
            first_failed_at: DateTime::parse_from_rfc3339("2025-01-01T00:00:00Z")
                .unwrap()
                .with_timezone(&Utc),
            queue: "search".into(),
            original_topic: "auction-created".into(),
        }
    }

    #[test]
    fn tagged_envelope_reads_back() {
        let original = envelope();
        let tagged = info().tag(original.clone());

        assert_eq!(tagged.payload, original.payload);
        assert_eq!(tagged.message_id, original.message_id);
        assert_eq!(FaultInfo::read(&tagged), Some(info()));
    }

    #[test]
    fn untagged_envelope_has_no_fault_info() {
        assert_eq!(FaultInfo::read(&envelope()), None);
    }

    #[test]
    fn pending_record_copies_fault_headers() {
        let tagged = info().tag(envelope());
        let record = FaultRecord::pending(tagged.clone(), "no correction rule", Utc::now());

        assert_eq!(record.exception_type, "InvalidArgument");
        assert_eq!(record.attempt_count, 5);
        assert_eq!(record.queue, "search");
        assert_eq!(record.status, FaultStatus::Pending);
        assert_eq!(record.message_id(), tagged.message_id);
    }

    #[test]
    fn pending_record_without_headers_is_unknown() {
        let record = FaultRecord::pending(envelope(), "untagged", Utc::now());
        assert_eq!(record.exception_type, "Unknown");
        assert_eq!(record.attempt_count, 0);
    }

    #[test]
    fn status_roundtrip() {
        for status in [
            FaultStatus::Pending,
            FaultStatus::Processing,
            FaultStatus::Resolved,
            FaultStatus::Discarded,
        ] {
            assert_eq!(FaultStatus::parse(status.as_str()).unwrap(), status);
        }
        assert!(FaultStatus::parse("invalid").is_err());
    }

    #[test]
    fn unknown_kind_is_unclassified() {
        assert_eq!(FaultKind::parse("weird"), FaultKind::Unclassified);
        assert_eq!(FaultKind::parse(FaultKind::Transient.as_str()), FaultKind::Transient);
    }
}
