//! InMemoryActivityStore - 開発用の activity 置き場

use std::collections::HashMap;

use parking_lot::Mutex;

use crate::domain::activity::ActivityRecord;
use crate::domain::errors::AdminError;
use crate::domain::ids::ActivityId;
use crate::ports::ActivityStore;

#[derive(Debug, Default)]
struct Inner {
    records: HashMap<ActivityId, ActivityRecord>,
    failing_stores: u32,
    resets: u32,
}

/// Keeps the latest version of every record.
#[derive(Debug, Default)]
pub struct InMemoryActivityStore {
    inner: Mutex<Inner>,
}

impl InMemoryActivityStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: ActivityId) -> Option<ActivityRecord> {
        self.inner.lock().records.get(&id).cloned()
    }

    pub fn records(&self) -> Vec<ActivityRecord> {
        self.inner.lock().records.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().records.is_empty()
    }

    /// The next `times` stores fail.
    pub fn fail_stores(&self, times: u32) {
        self.inner.lock().failing_stores = times;
    }

    pub fn resets(&self) -> u32 {
        self.inner.lock().resets
    }
}

#[async_trait::async_trait]
impl ActivityStore for InMemoryActivityStore {
    async fn store(&self, record: ActivityRecord) -> Result<(), AdminError> {
        let mut inner = self.inner.lock();
        if inner.failing_stores > 0 {
            inner.failing_stores -= 1;
            return Err(AdminError::Remote(format!("store of {} failed", record.id())));
        }
        inner.records.insert(record.id(), record);
        Ok(())
    }

    async fn delete(&self, id: ActivityId) -> Result<(), AdminError> {
        self.inner.lock().records.remove(&id);
        Ok(())
    }

    async fn reset(&self, _id: ActivityId) -> Result<(), AdminError> {
        // store は全体を置き換えるので戻す変更はない
        self.inner.lock().resets += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::activity::{ActivityState, TranscodingActivity};
    use crate::domain::profile::ProfileKey;
    use chrono::Utc;

    fn record() -> ActivityRecord {
        ActivityRecord::Transcoding(TranscodingActivity::new(
            ActivityId::generate(),
            "acme/hd/a.mov".into(),
            ProfileKey::new("acme", "hd", "a.mov"),
            Utc::now(),
        ))
    }

    #[tokio::test]
    async fn store_replaces_previous_version() {
        let store = InMemoryActivityStore::new();
        let mut r = record();
        store.store(r.clone()).await.unwrap();

        if let ActivityRecord::Transcoding(a) = &mut r {
            a.mark_done(Utc::now());
        }
        store.store(r.clone()).await.unwrap();

        assert_eq!(store.len(), 1);
        assert_eq!(store.get(r.id()).map(|r| r.state()), Some(ActivityState::Done));

        store.delete(r.id()).await.unwrap();
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn failing_store_keeps_nothing() {
        let store = InMemoryActivityStore::new();
        store.fail_stores(1);
        assert!(store.store(record()).await.is_err());
        assert!(store.is_empty());
        assert!(store.store(record()).await.is_ok());
    }
}
