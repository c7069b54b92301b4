//! The local record cache.
//!
//! Records live in a `DashMap` keyed by `(table, id)`. Every mutation goes
//! through [`LocalRecordStore::modify`], a read-modify-write closure run
//! under the entry's lock, so a push handler and a queue drain touching the
//! same record can never interleave halfway through a change.

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use quill_engine::{RecordId, TableName, Timestamp, VersionedRecord};
use tokio::sync::Mutex;

use crate::error::Result;
use crate::persistence::LocalPersistence;

type RecordKey = (TableName, RecordId);

/// Versioned records keyed by table and id, mirrored to persistence.
pub struct LocalRecordStore {
    records: DashMap<RecordKey, VersionedRecord>,
    persistence: Arc<dyn LocalPersistence>,
    /// Serializes write-back so the last persisted image is the latest one
    flush: Mutex<()>,
}

impl LocalRecordStore {
    /// Load every persisted record.
    pub async fn load(persistence: Arc<dyn LocalPersistence>) -> Result<Self> {
        let records = DashMap::new();
        for record in persistence.list_records().await? {
            records.insert((record.table.clone(), record.id.clone()), record);
        }

        tracing::debug!(records = records.len(), "local record store loaded");

        Ok(Self {
            records,
            persistence,
            flush: Mutex::new(()),
        })
    }

    pub fn get(&self, table: &str, id: &str) -> Option<VersionedRecord> {
        self.records
            .get(&(table.to_string(), id.to_string()))
            .map(|r| r.clone())
    }

    /// Insert or replace a record.
    pub async fn put(&self, record: VersionedRecord) -> Result<()> {
        let (table, id) = (record.table.clone(), record.id.clone());
        self.modify(&table, &id, move |slot| *slot = Some(record))
            .await
    }

    /// Remove a record. Returns the removed record, if any.
    pub async fn remove(&self, table: &str, id: &str) -> Result<Option<VersionedRecord>> {
        self.modify(table, id, Option::take).await
    }

    /// Apply `f` to an existing record. Returns `None` when it is absent.
    pub async fn update<F, R>(&self, table: &str, id: &str, f: F) -> Result<Option<R>>
    where
        F: FnOnce(&mut VersionedRecord) -> R,
    {
        self.modify(table, id, |slot| slot.as_mut().map(f)).await
    }

    /// Atomic read-modify-write of one slot.
    ///
    /// `f` sees `None` for an absent record; leaving `None` in the slot
    /// removes the record. The resulting state is persisted before return.
    pub async fn modify<F, R>(&self, table: &str, id: &str, f: F) -> Result<R>
    where
        F: FnOnce(&mut Option<VersionedRecord>) -> R,
    {
        let key = (table.to_string(), id.to_string());

        let result = match self.records.entry(key.clone()) {
            Entry::Occupied(mut entry) => {
                let mut slot = Some(entry.get().clone());
                let result = f(&mut slot);
                match slot {
                    Some(record) => {
                        entry.insert(record);
                    }
                    None => {
                        entry.remove();
                    }
                }
                result
            }
            Entry::Vacant(entry) => {
                let mut slot = None;
                let result = f(&mut slot);
                if let Some(record) = slot {
                    entry.insert(record);
                }
                result
            }
        };

        self.write_back(&key).await?;
        Ok(result)
    }

    async fn write_back(&self, key: &RecordKey) -> Result<()> {
        let _flush = self.flush.lock().await;
        match self.records.get(key).map(|r| r.clone()) {
            Some(record) => self.persistence.put_record(&record).await?,
            None => self.persistence.remove_record(&key.0, &key.1).await?,
        }
        Ok(())
    }

    /// Flag a record synced if it has not been written since `seen_at`.
    ///
    /// Returns true when the flag was set.
    pub async fn mark_synced(&self, table: &str, id: &str, seen_at: Timestamp) -> Result<bool> {
        let marked = self
            .update(table, id, |record| {
                if record.updated_at == seen_at && !record.deleted {
                    record.is_synced = true;
                    true
                } else {
                    false
                }
            })
            .await?;
        Ok(marked.unwrap_or(false))
    }

    /// Records with local changes not yet acknowledged, ordered by key.
    pub fn list_unsynced(&self) -> Vec<VersionedRecord> {
        let mut records: Vec<_> = self
            .records
            .iter()
            .filter(|entry| !entry.value().is_synced)
            .map(|entry| entry.value().clone())
            .collect();
        records.sort_by(|a, b| (&a.table, &a.id).cmp(&(&b.table, &b.id)));
        records
    }

    /// Active records of a table, ordered by id.
    pub fn list(&self, table: &str) -> Vec<VersionedRecord> {
        let mut records: Vec<_> = self
            .records
            .iter()
            .filter(|entry| entry.key().0 == table && entry.value().is_active())
            .map(|entry| entry.value().clone())
            .collect();
        records.sort_by(|a, b| a.id.cmp(&b.id));
        records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl std::fmt::Debug for LocalRecordStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalRecordStore")
            .field("records", &self.records.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::MemoryPersistence;
    use quill_engine::Row;
    use serde_json::json;

    fn fields(value: serde_json::Value) -> Row {
        value.as_object().cloned().unwrap()
    }

    async fn store() -> (LocalRecordStore, Arc<MemoryPersistence>) {
        let persistence = Arc::new(MemoryPersistence::new());
        let store = LocalRecordStore::load(persistence.clone()).await.unwrap();
        (store, persistence)
    }

    #[tokio::test]
    async fn put_get_and_persist() {
        let (store, persistence) = store().await;
        let record =
            VersionedRecord::new_local("seg-1", "segments", fields(json!({"content": "x"})), 1);
        store.put(record.clone()).await.unwrap();

        assert_eq!(store.get("segments", "seg-1"), Some(record.clone()));
        assert_eq!(
            persistence.get_record("segments", "seg-1").await.unwrap(),
            Some(record)
        );
    }

    #[tokio::test]
    async fn list_unsynced_only_returns_dirty_records() {
        let (store, _) = store().await;
        store
            .put(VersionedRecord::new_remote("b", "segments", Row::new(), 1))
            .await
            .unwrap();
        store
            .put(VersionedRecord::new_local("a", "segments", Row::new(), 1))
            .await
            .unwrap();

        let unsynced: Vec<_> = store.list_unsynced().into_iter().map(|r| r.id).collect();
        assert_eq!(unsynced, vec!["a".to_string()]);
    }

    #[tokio::test]
    async fn mark_synced_respects_newer_writes() {
        let (store, _) = store().await;
        store
            .put(VersionedRecord::new_local("a", "segments", Row::new(), 5))
            .await
            .unwrap();

        assert!(!store.mark_synced("segments", "a", 4).await.unwrap());
        assert!(store.mark_synced("segments", "a", 5).await.unwrap());
        assert!(store.get("segments", "a").unwrap().is_synced);
        assert!(!store.mark_synced("segments", "missing", 5).await.unwrap());
    }

    #[tokio::test]
    async fn modify_can_create_and_remove() {
        let (store, persistence) = store().await;

        let created = store
            .modify("segments", "a", |slot| {
                *slot = Some(VersionedRecord::new_remote("a", "segments", Row::new(), 1));
                true
            })
            .await
            .unwrap();
        assert!(created);
        assert_eq!(store.len(), 1);

        let removed = store.remove("segments", "a").await.unwrap();
        assert!(removed.is_some());
        assert!(store.is_empty());
        assert!(persistence.list_records().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn load_restores_records() {
        let persistence = Arc::new(MemoryPersistence::new());
        persistence
            .put_record(&VersionedRecord::new_local("a", "segments", Row::new(), 1))
            .await
            .unwrap();

        let store = LocalRecordStore::load(persistence).await.unwrap();
        assert!(store.get("segments", "a").is_some());
    }
}
