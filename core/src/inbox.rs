//! Consumer-side deduplication ledger.
//!
//! The event bus delivers at least once. A consumer records
//! `(consumer_id, message_id)` in the same transaction as the state change a
//! message causes; a redelivered message finds its record and is acknowledged
//! without being applied again.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Proof that a consumer has applied a message.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboxRecord {
    /// Consumer (queue) that applied the message
    pub consumer_id: String,
    /// Applied message
    pub message_id: Uuid,
    /// When it was applied
    pub processed_at: DateTime<Utc>,
}

impl InboxRecord {
    /// Create a record.
    #[must_use]
    pub fn new(consumer_id: impl Into<String>, message_id: Uuid, processed_at: DateTime<Utc>) -> Self {
        Self {
            consumer_id: consumer_id.into(),
            message_id,
            processed_at,
        }
    }
}

/// In-memory deduplication set keyed by `(consumer_id, message_id)`.
///
/// Plain data: callers hold it under the same lock as the state it guards.
#[derive(Clone, Debug, Default)]
pub struct InboxLedger {
    entries: HashMap<(String, Uuid), DateTime<Utc>>,
}

impl InboxLedger {
    /// Create an empty ledger.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `consumer_id` already applied `message_id`.
    #[must_use]
    pub fn contains(&self, consumer_id: &str, message_id: Uuid) -> bool {
        self.entries.contains_key(&(consumer_id.to_string(), message_id))
    }

    /// Record a processed message. Returns `false` if it was already present.
    pub fn record(&mut self, record: InboxRecord) -> bool {
        let key = (record.consumer_id, record.message_id);
        if self.entries.contains_key(&key) {
            return false;
        }
        self.entries.insert(key, record.processed_at);
        true
    }

    /// Number of recorded messages across all consumers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing has been recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn same_message_is_recorded_once_per_consumer() {
        let mut ledger = InboxLedger::new();
        let id = Uuid::new_v4();
        let now = Utc::now();

        assert!(ledger.record(InboxRecord::new("search", id, now)));
        assert!(!ledger.record(InboxRecord::new("search", id, now)));
        assert!(ledger.record(InboxRecord::new("auction", id, now)));

        assert!(ledger.contains("search", id));
        assert!(ledger.contains("auction", id));
        assert!(!ledger.contains("notifications", id));
        assert_eq!(ledger.len(), 2);
    }

    proptest! {
        #[test]
        fn redeliveries_record_each_message_once(ids in prop::collection::vec(0u128..8, 0..64)) {
            let mut ledger = InboxLedger::new();
            let now = Utc::now();
            let mut accepted = 0;
            for id in &ids {
                if ledger.record(InboxRecord::new("search", Uuid::from_u128(*id), now)) {
                    accepted += 1;
                }
            }

            let distinct: std::collections::HashSet<_> = ids.iter().collect();
            prop_assert_eq!(accepted, distinct.len());
            prop_assert_eq!(ledger.len(), distinct.len());
        }
    }
}
