//! In-memory projection store.

use crate::search::model::SearchItem;
use crate::search::query::{SearchPage, SearchQuery};
use crate::search::store::{ApplyOutcome, SearchChange, SearchError, SearchStore, apply_change};
use chrono::{DateTime, Utc};
use gavel_core::inbox::{InboxLedger, InboxRecord};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Mutex;
use uuid::Uuid;

#[derive(Default)]
struct State {
    items: HashMap<Uuid, SearchItem>,
    inbox: InboxLedger,
}

/// Items and inbox behind one lock. Cheap to clone; clones share state.
#[derive(Clone, Default)]
pub struct InMemorySearchStore {
    state: Arc<Mutex<State>>,
    unavailable: Arc<AtomicBool>,
}

impl InMemorySearchStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every operation fail with a storage error.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Number of inbox entries.
    pub async fn inbox_len(&self) -> usize {
        self.state.lock().await.inbox.len()
    }

    fn check_available(&self) -> Result<(), SearchError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(SearchError::Storage("search store unavailable".to_string()));
        }
        Ok(())
    }
}

impl SearchStore for InMemorySearchStore {
    fn apply(
        &self,
        inbox: InboxRecord,
        change: SearchChange,
    ) -> Pin<Box<dyn Future<Output = Result<ApplyOutcome, SearchError>> + Send + '_>> {
        Box::pin(async move {
            self.check_available()?;
            let mut state = self.state.lock().await;
            if state.inbox.contains(&inbox.consumer_id, inbox.message_id) {
                return Ok(ApplyOutcome::Duplicate);
            }
            let outcome = apply_change(&mut state.items, change);
            state.inbox.record(inbox);
            Ok(outcome)
        })
    }

    fn upsert(&self, item: SearchItem) -> Pin<Box<dyn Future<Output = Result<ApplyOutcome, SearchError>> + Send + '_>> {
        Box::pin(async move {
            self.check_available()?;
            let mut state = self.state.lock().await;
            Ok(apply_change(&mut state.items, SearchChange::Upsert(item)))
        })
    }

    fn get(&self, id: Uuid) -> Pin<Box<dyn Future<Output = Result<Option<SearchItem>, SearchError>> + Send + '_>> {
        Box::pin(async move {
            self.check_available()?;
            Ok(self.state.lock().await.items.get(&id).cloned())
        })
    }

    fn query(
        &self,
        query: SearchQuery,
        now: DateTime<Utc>,
    ) -> Pin<Box<dyn Future<Output = Result<SearchPage, SearchError>> + Send + '_>> {
        Box::pin(async move {
            self.check_available()?;
            let state = self.state.lock().await;
            Ok(query.run(state.items.values(), now))
        })
    }

    fn count(&self) -> Pin<Box<dyn Future<Output = Result<u64, SearchError>> + Send + '_>> {
        Box::pin(async move {
            self.check_available()?;
            Ok(self.state.lock().await.items.len() as u64)
        })
    }

    fn latest_updated_at(&self) -> Pin<Box<dyn Future<Output = Result<Option<DateTime<Utc>>, SearchError>> + Send + '_>> {
        Box::pin(async move {
            self.check_available()?;
            Ok(self.state.lock().await.items.values().map(|item| item.updated_at).max())
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::test_support::auction;
    use gavel_testing::test_epoch;

    #[tokio::test]
    async fn redelivered_message_applies_once() {
        let store = InMemorySearchStore::new();
        let item = SearchItem::from(&auction());
        let inbox = InboxRecord::new("search", Uuid::new_v4(), test_epoch());

        let first = store
            .apply(inbox.clone(), SearchChange::Upsert(item.clone()))
            .await
            .unwrap();
        let second = store.apply(inbox, SearchChange::Upsert(item.clone())).await.unwrap();

        assert_eq!(first, ApplyOutcome::Applied);
        assert_eq!(second, ApplyOutcome::Duplicate);
        assert_eq!(store.count().await.unwrap(), 1);
        assert_eq!(store.get(item.id).await.unwrap(), Some(item));
    }

    #[tokio::test]
    async fn no_op_messages_are_still_recorded() {
        let store = InMemorySearchStore::new();
        let inbox = InboxRecord::new("search", Uuid::new_v4(), test_epoch());

        let outcome = store.apply(inbox.clone(), SearchChange::Delete(Uuid::new_v4())).await.unwrap();
        assert_eq!(outcome, ApplyOutcome::Missing);
        assert_eq!(store.inbox_len().await, 1);
        assert_eq!(
            store.apply(inbox, SearchChange::Delete(Uuid::new_v4())).await.unwrap(),
            ApplyOutcome::Duplicate
        );
    }

    #[tokio::test]
    async fn outage_writes_nothing() {
        let store = InMemorySearchStore::new();
        store.set_unavailable(true);

        let result = store
            .apply(
                InboxRecord::new("search", Uuid::new_v4(), test_epoch()),
                SearchChange::Upsert(SearchItem::from(&auction())),
            )
            .await;
        assert!(result.is_err());

        store.set_unavailable(false);
        assert_eq!(store.count().await.unwrap(), 0);
        assert_eq!(store.inbox_len().await, 0);
        assert_eq!(store.latest_updated_at().await.unwrap(), None);
    }
}
