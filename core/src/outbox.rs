//! Transactional outbox.
//!
//! Every aggregate change that other services must observe writes an
//! [`OutboxRecord`] in the same transaction as the change itself. A relay later
//! drains unsent records into the event bus and marks them sent. Because the
//! record and the change commit together there is no window where one exists
//! without the other.
//!
//! ```text
//! ┌──────────── one transaction ────────────┐
//! │  UPDATE auctions ...                    │
//! │  INSERT INTO outbox (id, aggregate, ..) │
//! └─────────────────────────────────────────┘
//!                     │
//!                     ▼  relay: fetch_unsent → publish → mark_sent
//! ```
//!
//! Records are never mutated except to set `sent_at`, and are only removed by
//! the relay's retention purge once sent.

use crate::message::{Message, MessageEnvelope, MessageError, encode_payload};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// Errors from outbox storage.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OutboxError {
    /// Storage backend failed
    #[error("Outbox storage error: {0}")]
    Storage(String),

    /// Record id not present in the outbox
    #[error("Outbox record not found: {0}")]
    NotFound(Uuid),

    /// Payload could not be encoded
    #[error(transparent)]
    Message(#[from] MessageError),
}

/// A pending (or sent) domain event.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboxRecord {
    /// Record id; becomes the published `message_id`
    pub id: Uuid,
    /// Aggregate the event describes
    pub aggregate_id: String,
    /// Wire name of the event
    pub message_type: String,
    /// JSON payload
    pub payload: Vec<u8>,
    /// When the record was written
    pub enqueued_at: DateTime<Utc>,
    /// When the relay confirmed publish
    pub sent_at: Option<DateTime<Utc>>,
}

impl OutboxRecord {
    /// Build an unsent record for a typed message.
    ///
    /// # Errors
    ///
    /// Returns [`OutboxError::Message`] if the payload cannot be encoded.
    pub fn for_message<M: Message>(
        id: Uuid,
        message: &M,
        enqueued_at: DateTime<Utc>,
    ) -> Result<Self, OutboxError> {
        Ok(Self {
            id,
            aggregate_id: message.aggregate_id(),
            message_type: M::MESSAGE_TYPE.to_string(),
            payload: encode_payload(message)?,
            enqueued_at,
            sent_at: None,
        })
    }

    /// Whether the relay has published this record.
    #[must_use]
    pub const fn is_sent(&self) -> bool {
        self.sent_at.is_some()
    }

    /// The envelope the relay publishes for this record.
    ///
    /// The envelope's `message_id` is the record id, so re-publishing the same
    /// record after a crash yields a message consumers recognise as a duplicate.
    #[must_use]
    pub fn to_envelope(&self, sent_at: DateTime<Utc>) -> MessageEnvelope {
        MessageEnvelope {
            message_id: self.id,
            message_type: self.message_type.clone(),
            aggregate_id: self.aggregate_id.clone(),
            payload: self.payload.clone(),
            sent_at,
            headers: BTreeMap::new(),
        }
    }
}

/// Storage for outbox records.
///
/// Appending atomically with an aggregate change is the aggregate store's job
/// (it receives the records alongside the change). This trait is what the relay
/// and the compensation path see.
///
/// # Dyn Compatibility
///
/// Uses explicit boxed futures so it can be held as `Arc<dyn OutboxStore>`.
pub trait OutboxStore: Send + Sync {
    /// Append a standalone record.
    ///
    /// Idempotent on `record.id`: returns `Ok(false)` if a record with that id
    /// already exists, leaving it untouched.
    ///
    /// # Errors
    ///
    /// Returns [`OutboxError::Storage`] if the write fails.
    fn append(
        &self,
        record: OutboxRecord,
    ) -> Pin<Box<dyn Future<Output = Result<bool, OutboxError>> + Send + '_>>;

    /// Unsent records, oldest first, at most `limit`.
    ///
    /// # Errors
    ///
    /// Returns [`OutboxError::Storage`] if the read fails.
    fn fetch_unsent(
        &self,
        limit: usize,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<OutboxRecord>, OutboxError>> + Send + '_>>;

    /// Record that `id` was published.
    ///
    /// # Errors
    ///
    /// Returns [`OutboxError::NotFound`] if no such record exists, or
    /// [`OutboxError::Storage`] if the write fails.
    fn mark_sent(
        &self,
        id: Uuid,
        sent_at: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<(), OutboxError>> + Send + '_>>;

    /// Delete sent records whose `sent_at` is before `cutoff`. Returns the count.
    ///
    /// # Errors
    ///
    /// Returns [`OutboxError::Storage`] if the delete fails.
    fn purge_sent_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<u64, OutboxError>> + Send + '_>>;

    /// Take or renew the relay lease for `holder` until `now + ttl`.
    ///
    /// Returns `true` if `holder` owns the lease afterwards.
    ///
    /// # Errors
    ///
    /// Returns [`OutboxError::Storage`] if the lease cannot be read or written.
    fn try_acquire_lease(
        &self,
        holder: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<bool, OutboxError>> + Send + '_>>;
}

/// Relay lease held by one instance.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Lease {
    /// Instance that holds the lease
    pub holder: String,
    /// Lease is free after this instant
    pub expires_at: DateTime<Utc>,
}

/// In-memory append-only outbox log.
///
/// Plain data: callers provide locking. Used by in-memory aggregate stores so
/// that the aggregate map and the log are updated under one lock.
#[derive(Clone, Debug, Default)]
pub struct OutboxLog {
    records: Vec<OutboxRecord>,
    ids: HashSet<Uuid>,
    lease: Option<Lease>,
}

impl OutboxLog {
    /// Create an empty log.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a record unless one with the same id exists.
    pub fn append(&mut self, record: OutboxRecord) -> bool {
        if !self.ids.insert(record.id) {
            return false;
        }
        self.records.push(record);
        true
    }

    /// Whether a record with `id` exists.
    #[must_use]
    pub fn contains(&self, id: Uuid) -> bool {
        self.ids.contains(&id)
    }

    /// Unsent records in enqueue order.
    #[must_use]
    pub fn unsent(&self, limit: usize) -> Vec<OutboxRecord> {
        self.records
            .iter()
            .filter(|r| !r.is_sent())
            .take(limit)
            .cloned()
            .collect()
    }

    /// Mark a record sent. Marking an already-sent record keeps the first timestamp.
    ///
    /// # Errors
    ///
    /// Returns [`OutboxError::NotFound`] if `id` is not in the log.
    pub fn mark_sent(&mut self, id: Uuid, sent_at: DateTime<Utc>) -> Result<(), OutboxError> {
        let record = self
            .records
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or(OutboxError::NotFound(id))?;
        if record.sent_at.is_none() {
            record.sent_at = Some(sent_at);
        }
        Ok(())
    }

    /// Remove sent records older than `cutoff`.
    pub fn purge_sent_before(&mut self, cutoff: DateTime<Utc>) -> u64 {
        let before = self.records.len();
        let ids = &mut self.ids;
        self.records.retain(|r| match r.sent_at {
            Some(sent) if sent < cutoff => {
                ids.remove(&r.id);
                false
            }
            _ => true,
        });
        (before - self.records.len()) as u64
    }

    /// Take or renew the relay lease.
    pub fn try_acquire_lease(&mut self, holder: &str, ttl: Duration, now: DateTime<Utc>) -> bool {
        let ttl = chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX);
        let free = match &self.lease {
            None => true,
            Some(lease) => lease.holder == holder || lease.expires_at <= now,
        };
        if free {
            self.lease = Some(Lease {
                holder: holder.to_string(),
                expires_at: now.checked_add_signed(ttl).unwrap_or(DateTime::<Utc>::MAX_UTC),
            });
        }
        free
    }

    /// All records, sent and unsent, in enqueue order.
    #[must_use]
    pub fn records(&self) -> &[OutboxRecord] {
        &self.records
    }

    /// Number of records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether the log is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
