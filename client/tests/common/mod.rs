//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use quill_engine::{CacheSnapshot, Row, VersionedRecord};
use quill_sync::{
    ChannelFilter, EventReceiver, MemoryPersistence, MemoryRemoteStore, RemoteError, RemoteStore,
    StaticConnectivity, SyncConfig, SyncEvent, SyncRuntime,
};
use tokio::sync::Semaphore;

pub fn row(value: serde_json::Value) -> Row {
    value.as_object().cloned().expect("fixture must be an object")
}

/// A story segment with a valid choice set.
pub fn valid_segment(id: &str, updated_at: u64) -> VersionedRecord {
    VersionedRecord::new_remote(
        id,
        "segments",
        row(serde_json::json!({
            "content": "Mara waits at the gate of the old mill.",
            "choices": ["Open the gate", "Call out to Mara", "Walk to the mill"],
            "image_url": null
        })),
        updated_at,
    )
}

/// Config with zero retry delay so failed operations are ready at once.
pub fn fast_config() -> SyncConfig {
    SyncConfig {
        retry_base_delay_ms: 0,
        retry_max_delay_ms: 0,
        poll_interval_ms: 3_600_000,
        ..SyncConfig::default()
    }
}

/// Remote store with injectable failures and write counters.
#[derive(Debug, Default)]
pub struct FlakyRemote {
    pub inner: MemoryRemoteStore,
    failing: AtomicBool,
    failing_fetches: Mutex<HashSet<String>>,
    pub writes: AtomicUsize,
}

impl FlakyRemote {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn fail_fetch_for(&self, id: &str) {
        self.failing_fetches.lock().unwrap().insert(id.to_string());
    }

    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    fn check(&self) -> Result<(), RemoteError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(RemoteError::Unavailable("injected failure".into()));
        }
        Ok(())
    }

    fn count_write(&self) -> Result<(), RemoteError> {
        self.check()?;
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl RemoteStore for FlakyRemote {
    async fn fetch(&self, table: &str, id: &str) -> Result<Option<Row>, RemoteError> {
        self.check()?;
        if self.failing_fetches.lock().unwrap().contains(id) {
            return Err(RemoteError::Unavailable(format!("fetch of {id} failed")));
        }
        self.inner.fetch(table, id).await
    }

    async fn insert(&self, table: &str, row: &Row) -> Result<(), RemoteError> {
        self.count_write()?;
        self.inner.insert(table, row).await
    }

    async fn update(&self, table: &str, id: &str, fields: &Row) -> Result<(), RemoteError> {
        self.count_write()?;
        self.inner.update(table, id, fields).await
    }

    async fn delete(&self, table: &str, id: &str) -> Result<(), RemoteError> {
        self.count_write()?;
        self.inner.delete(table, id).await
    }

    async fn select(
        &self,
        table: &str,
        filter: Option<&ChannelFilter>,
    ) -> Result<Vec<Row>, RemoteError> {
        self.check()?;
        self.inner.select(table, filter).await
    }
}

/// Remote store whose inserts wait for a permit.
#[derive(Debug)]
pub struct GatedRemote {
    pub inner: MemoryRemoteStore,
    pub gate: Semaphore,
}

impl GatedRemote {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: MemoryRemoteStore::new(),
            gate: Semaphore::new(0),
        })
    }
}

#[async_trait]
impl RemoteStore for GatedRemote {
    async fn fetch(&self, table: &str, id: &str) -> Result<Option<Row>, RemoteError> {
        self.inner.fetch(table, id).await
    }

    async fn insert(&self, table: &str, row: &Row) -> Result<(), RemoteError> {
        let _permit = self
            .gate
            .acquire()
            .await
            .map_err(|e| RemoteError::Unavailable(e.to_string()))?;
        self.inner.insert(table, row).await
    }

    async fn update(&self, table: &str, id: &str, fields: &Row) -> Result<(), RemoteError> {
        self.inner.update(table, id, fields).await
    }

    async fn delete(&self, table: &str, id: &str) -> Result<(), RemoteError> {
        self.inner.delete(table, id).await
    }

    async fn select(
        &self,
        table: &str,
        filter: Option<&ChannelFilter>,
    ) -> Result<Vec<Row>, RemoteError> {
        self.inner.select(table, filter).await
    }
}

/// A runtime over in-memory persistence seeded with `records`.
pub async fn runtime_with(
    config: SyncConfig,
    remote: Arc<dyn RemoteStore>,
    records: Vec<VersionedRecord>,
) -> (SyncRuntime, Arc<StaticConnectivity>) {
    let mut snapshot = CacheSnapshot::new();
    for record in records {
        snapshot.put_record(record);
    }
    let persistence = Arc::new(MemoryPersistence::with_snapshot(snapshot));
    let connectivity = Arc::new(StaticConnectivity::new(true));
    let runtime = SyncRuntime::start(config, remote, persistence, connectivity.clone())
        .await
        .expect("runtime starts");
    (runtime, connectivity)
}

/// Every event received so far.
pub fn drain_events(rx: &mut EventReceiver) -> Vec<SyncEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

/// Wait until `check` holds, polling every few milliseconds.
pub async fn eventually<F>(mut check: F)
where
    F: FnMut() -> bool,
{
    tokio::time::timeout(Duration::from_secs(5), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}
