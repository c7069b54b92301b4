//! Local persistence for cached records and queued operations.
//!
//! Both implementations keep a [`CacheSnapshot`] in memory. The file-backed
//! one rewrites the whole snapshot after every change: the JSON is written
//! to a sibling temp file, fsynced, then renamed over the target so a crash
//! leaves either the old or the new image, never a torn one.

use std::path::{Path, PathBuf};
use std::sync::Mutex as StdMutex;

use async_trait::async_trait;
use quill_engine::{CacheSnapshot, Operation, VersionedRecord};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::error::PersistenceError;

/// Crash-durable key-value storage for records and operations.
#[async_trait]
pub trait LocalPersistence: Send + Sync {
    async fn get_record(
        &self,
        table: &str,
        id: &str,
    ) -> Result<Option<VersionedRecord>, PersistenceError>;

    async fn put_record(&self, record: &VersionedRecord) -> Result<(), PersistenceError>;

    async fn remove_record(&self, table: &str, id: &str) -> Result<(), PersistenceError>;

    async fn list_records(&self) -> Result<Vec<VersionedRecord>, PersistenceError>;

    /// Insert or replace an operation by id.
    async fn put_operation(&self, op: &Operation) -> Result<(), PersistenceError>;

    async fn remove_operation(&self, op_id: &str) -> Result<(), PersistenceError>;

    async fn list_operations(&self) -> Result<Vec<Operation>, PersistenceError>;
}

fn upsert_operation(snapshot: &mut CacheSnapshot, op: &Operation) {
    match snapshot.operations.iter_mut().find(|o| o.id == op.id) {
        Some(existing) => *existing = op.clone(),
        None => snapshot.operations.push(op.clone()),
    }
}

/// Volatile persistence for tests and ephemeral sessions.
#[derive(Debug, Default)]
pub struct MemoryPersistence {
    snapshot: StdMutex<CacheSnapshot>,
}

impl MemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed from an existing snapshot.
    pub fn with_snapshot(snapshot: CacheSnapshot) -> Self {
        Self {
            snapshot: StdMutex::new(snapshot),
        }
    }

    /// Copy of the current image.
    pub fn snapshot(&self) -> CacheSnapshot {
        self.lock().clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, CacheSnapshot> {
        // A poisoned lock still holds a consistent snapshot: every mutation
        // below is a single call that cannot panic halfway.
        self.snapshot
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl LocalPersistence for MemoryPersistence {
    async fn get_record(
        &self,
        table: &str,
        id: &str,
    ) -> Result<Option<VersionedRecord>, PersistenceError> {
        Ok(self.lock().get_record(table, id).cloned())
    }

    async fn put_record(&self, record: &VersionedRecord) -> Result<(), PersistenceError> {
        self.lock().put_record(record.clone());
        Ok(())
    }

    async fn remove_record(&self, table: &str, id: &str) -> Result<(), PersistenceError> {
        self.lock().remove_record(table, id);
        Ok(())
    }

    async fn list_records(&self) -> Result<Vec<VersionedRecord>, PersistenceError> {
        Ok(self.lock().records().cloned().collect())
    }

    async fn put_operation(&self, op: &Operation) -> Result<(), PersistenceError> {
        upsert_operation(&mut self.lock(), op);
        Ok(())
    }

    async fn remove_operation(&self, op_id: &str) -> Result<(), PersistenceError> {
        self.lock().operations.retain(|op| op.id != op_id);
        Ok(())
    }

    async fn list_operations(&self) -> Result<Vec<Operation>, PersistenceError> {
        Ok(self.lock().operations.clone())
    }
}

/// Persistence backed by a single JSON snapshot file.
#[derive(Debug)]
pub struct FilePersistence {
    path: PathBuf,
    snapshot: Mutex<CacheSnapshot>,
}

impl FilePersistence {
    /// Open the snapshot at `path`, starting empty if the file is missing.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, PersistenceError> {
        let path = path.as_ref().to_path_buf();
        let snapshot = match tokio::fs::read_to_string(&path).await {
            Ok(json) => CacheSnapshot::from_json(&json)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => CacheSnapshot::new(),
            Err(e) => return Err(e.into()),
        };

        tracing::info!(
            path = %path.display(),
            records = snapshot.record_count(),
            operations = snapshot.operations.len(),
            "opened local cache"
        );

        Ok(Self {
            path,
            snapshot: Mutex::new(snapshot),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Apply a change and write the result to disk while still holding the
    /// lock, so writes land in the order the changes were made.
    async fn mutate<F>(&self, change: F) -> Result<(), PersistenceError>
    where
        F: FnOnce(&mut CacheSnapshot) + Send,
    {
        let mut snapshot = self.snapshot.lock().await;
        change(&mut snapshot);
        let json = snapshot.to_json()?;
        write_atomic(&self.path, json.as_bytes()).await
    }
}

async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), PersistenceError> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    let mut file = tokio::fs::File::create(&tmp).await?;
    file.write_all(bytes).await?;
    file.sync_all().await?;
    drop(file);

    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

#[async_trait]
impl LocalPersistence for FilePersistence {
    async fn get_record(
        &self,
        table: &str,
        id: &str,
    ) -> Result<Option<VersionedRecord>, PersistenceError> {
        Ok(self.snapshot.lock().await.get_record(table, id).cloned())
    }

    async fn put_record(&self, record: &VersionedRecord) -> Result<(), PersistenceError> {
        let record = record.clone();
        self.mutate(move |s| s.put_record(record)).await
    }

    async fn remove_record(&self, table: &str, id: &str) -> Result<(), PersistenceError> {
        self.mutate(|s| {
            s.remove_record(table, id);
        })
        .await
    }

    async fn list_records(&self) -> Result<Vec<VersionedRecord>, PersistenceError> {
        Ok(self.snapshot.lock().await.records().cloned().collect())
    }

    async fn put_operation(&self, op: &Operation) -> Result<(), PersistenceError> {
        self.mutate(|s| upsert_operation(s, op)).await
    }

    async fn remove_operation(&self, op_id: &str) -> Result<(), PersistenceError> {
        self.mutate(|s| s.operations.retain(|op| op.id != op_id))
            .await
    }

    async fn list_operations(&self) -> Result<Vec<Operation>, PersistenceError> {
        Ok(self.snapshot.lock().await.operations.clone())
    }
}
