//! The sync engine: local writes, queue replay and conflict resolution.
//!
//! A sync pass runs in two steps:
//!
//! 1. Drain the operation queue against the remote store. Records whose
//!    operations all completed are flagged synced (tombstones are purged).
//! 2. For every record still flagged unsynced with no queued work left,
//!    fetch the server copy and reconcile: insert it when absent, accept it
//!    when identical, otherwise resolve the conflict and write the winner
//!    to both sides.
//!
//! Only one pass runs at a time. A second `sync_all` while one is running
//! returns [`SyncOutcome::Busy`] immediately.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use quill_engine::{
    check_identity, resolve_conflict, row_timestamp, ManualResolver, Operation, OperationKind,
    Row, Strategy, TableName, Timestamp, VersionedRecord, ID_FIELD, UPDATED_AT_FIELD,
};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::SyncConfig;
use crate::error::{Result, SyncError};
use crate::events::{EventBus, SyncEvent};
use crate::guard::ContentGuard;
use crate::now_ms;
use crate::queue::OperationQueue;
use crate::remote::RemoteStore;
use crate::store::LocalRecordStore;

/// Online/offline detector.
pub trait Connectivity: Send + Sync {
    fn is_online(&self) -> bool;
}

/// Connectivity flag flipped by the host application.
#[derive(Debug)]
pub struct StaticConnectivity {
    online: AtomicBool,
}

impl StaticConnectivity {
    pub fn new(online: bool) -> Self {
        Self {
            online: AtomicBool::new(online),
        }
    }

    pub fn set_online(&self, online: bool) {
        let was = self.online.swap(online, Ordering::SeqCst);
        if was != online {
            tracing::info!(online, "connectivity changed");
        }
    }
}

impl Connectivity for StaticConnectivity {
    fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }
}

/// How a sync pass ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    /// The pass ran; see `errors` for per-record failures
    Completed,
    /// Another pass was already running
    Busy,
    /// Offline; nothing was attempted
    NotConnected,
}

/// Aggregate result of [`SyncEngine::sync_all`].
#[derive(Debug)]
pub struct SyncResult {
    pub outcome: SyncOutcome,
    /// Operations replayed plus records reconciled
    pub synced_count: usize,
    /// Records that differed on both sides
    pub conflict_count: usize,
    /// Operations that failed and were rescheduled
    pub deferred_count: usize,
    pub errors: Vec<SyncError>,
}

impl SyncResult {
    fn new(outcome: SyncOutcome) -> Self {
        Self {
            outcome,
            synced_count: 0,
            conflict_count: 0,
            deferred_count: 0,
            errors: Vec::new(),
        }
    }

    /// Whether the pass ran without errors.
    pub fn is_success(&self) -> bool {
        self.outcome == SyncOutcome::Completed && self.errors.is_empty()
    }
}

/// Clears the running flag when a pass ends, including by panic.
struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Orchestrates local writes, queue replay and conflict resolution.
pub struct SyncEngine {
    config: SyncConfig,
    store: Arc<LocalRecordStore>,
    queue: Arc<OperationQueue>,
    remote: Arc<dyn RemoteStore>,
    connectivity: Arc<dyn Connectivity>,
    events: Arc<EventBus>,
    guard: Arc<ContentGuard>,
    resolvers: DashMap<TableName, Arc<dyn ManualResolver>>,
    syncing: AtomicBool,
}

impl SyncEngine {
    pub fn new(
        config: SyncConfig,
        store: Arc<LocalRecordStore>,
        queue: Arc<OperationQueue>,
        remote: Arc<dyn RemoteStore>,
        connectivity: Arc<dyn Connectivity>,
        events: Arc<EventBus>,
        guard: Arc<ContentGuard>,
    ) -> Self {
        Self {
            config,
            store,
            queue,
            remote,
            connectivity,
            events,
            guard,
            resolvers: DashMap::new(),
            syncing: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<LocalRecordStore> {
        &self.store
    }

    pub fn queue(&self) -> &Arc<OperationQueue> {
        &self.queue
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    /// Whether a sync pass is running.
    pub fn is_syncing(&self) -> bool {
        self.syncing.load(Ordering::Acquire)
    }

    /// Register the manual resolution callback for a table.
    pub fn register_resolver(&self, table: impl Into<TableName>, resolver: Arc<dyn ManualResolver>) {
        let table = table.into();
        tracing::debug!(table = %table, "manual resolver registered");
        self.resolvers.insert(table, resolver);
    }

    /// Remove a table's manual resolution callback.
    pub fn unregister_resolver(&self, table: &str) -> bool {
        self.resolvers.remove(table).is_some()
    }

    /// An active cached record.
    pub fn get(&self, table: &str, id: &str) -> Option<VersionedRecord> {
        self.store.get(table, id).filter(VersionedRecord::is_active)
    }

    /// Active cached records of a table.
    pub fn list(&self, table: &str) -> Vec<VersionedRecord> {
        self.store.list(table)
    }

    /// Optimistic local write.
    ///
    /// The fields are merged over the cached record and it is flagged
    /// unsynced. A new record enqueues an Insert of the full row; an
    /// existing one enqueues an Update carrying only the written fields.
    pub async fn write(&self, table: &str, id: &str, mut fields: Row) -> Result<VersionedRecord> {
        fields.remove(ID_FIELD);
        fields.remove(UPDATED_AT_FIELD);
        let now = now_ms();

        let (record, created) = self
            .store
            .modify(table, id, |slot| {
                let (record, created) = match slot.take() {
                    Some(mut current) if current.is_active() => {
                        current.apply_delta(&fields, now);
                        current.is_synced = false;
                        (current, false)
                    }
                    _ => (VersionedRecord::new_local(id, table, fields.clone(), now), true),
                };
                *slot = Some(record.clone());
                (record, created)
            })
            .await?;

        // A crash before the enqueue leaves the record unsynced; the
        // reconcile step of the next pass pushes it.
        let op_id = Uuid::new_v4().to_string();
        let op = if created {
            Operation::insert(op_id, table, id, record.to_row(), now)
        } else {
            fields.insert(UPDATED_AT_FIELD.into(), record.updated_at.into());
            Operation::update(op_id, table, id, fields, now)
        };
        self.queue.enqueue(op).await?;

        tracing::debug!(table, record_id = id, created, "local write recorded");
        Ok(record)
    }

    /// Delete a record locally and enqueue the remote delete.
    ///
    /// The record stays as a tombstone until the delete is acknowledged.
    pub async fn delete(&self, table: &str, id: &str) -> Result<()> {
        let now = now_ms();
        let was_active = self
            .store
            .update(table, id, |record| {
                let was_active = record.is_active();
                if was_active {
                    record.mark_deleted(now.max(record.updated_at));
                }
                was_active
            })
            .await?
            .ok_or_else(|| SyncError::NotFound {
                table: table.to_string(),
                record_id: id.to_string(),
            })?;

        if !was_active {
            return Ok(());
        }

        self.queue
            .enqueue(Operation::delete(Uuid::new_v4().to_string(), table, id, now))
            .await?;
        tracing::debug!(table, record_id = id, "local delete recorded");
        Ok(())
    }

    /// Apply one queued operation to the remote store.
    pub async fn execute_operation(&self, op: Operation) -> Result<()> {
        let table = op.target_table.as_str();
        let outcome = match op.kind {
            OperationKind::Insert => self.remote.insert(table, &op.payload).await,
            OperationKind::Update => self.remote.update(table, &op.record_id, &op.payload).await,
            OperationKind::Delete => self.remote.delete(table, &op.record_id).await,
        };

        outcome.map_err(|e| SyncError::RemoteWriteFailed {
            table: op.target_table.clone(),
            record_id: op.record_id.clone(),
            message: e.to_string(),
        })
    }

    /// Run one sync pass.
    pub async fn sync_all(&self) -> SyncResult {
        if self
            .syncing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            tracing::debug!("sync already running");
            return SyncResult::new(SyncOutcome::Busy);
        }
        let _running = RunningGuard(&self.syncing);

        if !self.connectivity.is_online() {
            tracing::info!(reason = %SyncError::NetworkUnavailable, "sync skipped");
            return SyncResult::new(SyncOutcome::NotConnected);
        }

        self.events.emit(SyncEvent::SyncStarted);
        let mut result = SyncResult::new(SyncOutcome::Completed);

        self.replay_queue(&mut result).await;
        self.reconcile_unsynced(&mut result).await;

        let event = if result.errors.is_empty() {
            tracing::info!(
                synced = result.synced_count,
                conflicts = result.conflict_count,
                deferred = result.deferred_count,
                "sync completed"
            );
            SyncEvent::SyncCompleted {
                synced_count: result.synced_count,
                conflict_count: result.conflict_count,
            }
        } else {
            tracing::warn!(
                synced = result.synced_count,
                conflicts = result.conflict_count,
                errors = result.errors.len(),
                "sync finished with errors"
            );
            SyncEvent::SyncFailed {
                synced_count: result.synced_count,
                conflict_count: result.conflict_count,
                errors: result.errors.iter().map(ToString::to_string).collect(),
            }
        };
        self.events.emit(event);

        result
    }

    /// Spawn a background loop running a sync pass every `interval`.
    pub fn run_periodic(self: Arc<Self>, interval: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        let interval = interval.max(Duration::from_millis(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let result = self.sync_all().await;
                        tracing::debug!(
                            outcome = ?result.outcome,
                            synced = result.synced_count,
                            errors = result.errors.len(),
                            "periodic sync finished"
                        );
                    }
                }
            }

            tracing::debug!("periodic sync stopped");
        })
    }

    async fn replay_queue(&self, result: &mut SyncResult) {
        let report = match self.queue.drain(|op| self.execute_operation(op)).await {
            Ok(report) => report,
            Err(error) => {
                tracing::error!(error = %error, "queue replay aborted");
                result.errors.push(error);
                return;
            }
        };

        result.deferred_count += report.retried;
        result.errors.extend(report.exhausted);

        for op in report.completed {
            result.synced_count += 1;
            if let Err(error) = self.settle(&op).await {
                result.errors.push(error);
            }
        }
    }

    /// Flag a record synced once its last operation is acknowledged.
    async fn settle(&self, op: &Operation) -> Result<()> {
        if self.queue.has_unfinished_for(&op.record_id).await {
            return Ok(());
        }

        let table = op.target_table.as_str();
        match op.kind {
            OperationKind::Delete => {
                self.purge_tombstone(table, &op.record_id, None).await?;
            }
            OperationKind::Insert | OperationKind::Update => {
                if let Some(seen_at) = row_timestamp(&op.payload)? {
                    self.store.mark_synced(table, &op.record_id, seen_at).await?;
                }
            }
        }
        Ok(())
    }

    /// Drop a tombstone, optionally only if it has not changed since `seen_at`.
    async fn purge_tombstone(&self, table: &str, id: &str, seen_at: Option<Timestamp>) -> Result<bool> {
        let purged = self
            .store
            .modify(table, id, |slot| {
                let stale = slot
                    .as_ref()
                    .is_some_and(|r| r.deleted && seen_at.map_or(true, |t| t == r.updated_at));
                if stale {
                    *slot = None;
                }
                stale
            })
            .await?;
        Ok(purged)
    }

    async fn reconcile_unsynced(&self, result: &mut SyncResult) {
        for local in self.store.list_unsynced() {
            if self.queue.has_unfinished_for(&local.id).await {
                tracing::debug!(
                    table = %local.table,
                    record_id = %local.id,
                    "record has queued work, reconcile deferred"
                );
                continue;
            }

            let (table, id) = (local.table.clone(), local.id.clone());
            match self.reconcile_record(local, result).await {
                Ok(()) => result.synced_count += 1,
                Err(error) => {
                    if error.is_transient() {
                        tracing::warn!(table = %table, record_id = %id, error = %error, "record reconcile failed, retried next pass");
                    } else {
                        tracing::error!(table = %table, record_id = %id, error = %error, "record reconcile failed");
                    }
                    result.errors.push(error);
                }
            }
        }
    }

    async fn reconcile_record(&self, local: VersionedRecord, result: &mut SyncResult) -> Result<()> {
        let table = local.table.as_str();
        let id = local.id.as_str();
        let write_failed = |e: crate::error::RemoteError| SyncError::RemoteWriteFailed {
            table: table.to_string(),
            record_id: id.to_string(),
            message: e.to_string(),
        };

        let server_row = self.remote.fetch(table, id).await.map_err(|e| {
            SyncError::ConflictFetchFailed {
                table: table.to_string(),
                record_id: id.to_string(),
                message: e.to_string(),
            }
        })?;

        if local.deleted {
            if server_row.is_some() {
                self.remote.delete(table, id).await.map_err(write_failed)?;
            }
            self.purge_tombstone(table, id, Some(local.updated_at)).await?;
            return Ok(());
        }

        let Some(server_row) = server_row else {
            self.remote.insert(table, &local.to_row()).await.map_err(write_failed)?;
            self.store.mark_synced(table, id, local.updated_at).await?;
            return Ok(());
        };

        let server = VersionedRecord::from_row(table, &server_row)?;
        if server.same_content(&local) {
            self.store.mark_synced(table, id, local.updated_at).await?;
            return Ok(());
        }
        check_identity(&server, &local)?;

        result.conflict_count += 1;
        let manual = self.resolvers.get(table).map(|entry| Arc::clone(entry.value()));
        let strategy = Strategy::bind(self.config.conflict_strategy, manual);

        self.events.emit(SyncEvent::ConflictDetected {
            table: table.to_string(),
            record_id: id.to_string(),
            strategy: strategy.kind(),
        });

        let mut resolution = resolve_conflict(&server, &local, &strategy);
        if let Some(reason) = &resolution.fallback_reason {
            tracing::warn!(table, record_id = id, reason = %reason, "manual resolution fell back to client");
        }

        self.guard_resolved_choices(&mut resolution.record, &local);

        tracing::info!(
            table,
            record_id = id,
            strategy = %resolution.strategy,
            winner = ?resolution.winner,
            "conflict resolved"
        );
        self.events.emit(SyncEvent::ConflictResolved {
            table: table.to_string(),
            record_id: id.to_string(),
            strategy: resolution.strategy,
            winner: resolution.winner,
            fallback_reason: resolution.fallback_reason.clone(),
        });

        let mut resolved = resolution.record;
        if resolved.fields != server.fields {
            self.remote.insert(table, &resolved.to_row()).await.map_err(write_failed)?;
        }

        resolved.is_synced = true;
        resolved.deleted = false;
        let seen_at = local.updated_at;
        self.store
            .modify(table, id, |slot| {
                let unchanged = slot
                    .as_ref()
                    .is_some_and(|current| current.updated_at == seen_at && !current.is_synced);
                if unchanged {
                    *slot = Some(resolved);
                } else {
                    tracing::debug!(table, record_id = id, "record changed during reconcile, kept");
                }
            })
            .await?;

        Ok(())
    }

    /// Keep the cached choice set when the winner would replace a valid
    /// one with a set that fails the contract.
    fn guard_resolved_choices(&self, resolved: &mut VersionedRecord, local: &VersionedRecord) {
        let field = self.guard.choices_field();
        if resolved.field(field) == local.field(field) {
            return;
        }

        let mut delta = resolved.fields.clone();
        let rejected = self
            .guard
            .screen(&local.table, &local.id, Some(local), &mut delta)
            .is_some_and(|merge| merge.decision.rejected());
        if rejected {
            match local.field(field).cloned() {
                Some(value) => resolved.fields.insert(field.to_string(), value),
                None => resolved.fields.remove(field),
            };
        }
    }
}

impl std::fmt::Debug for SyncEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncEngine")
            .field("strategy", &self.config.conflict_strategy)
            .field("syncing", &self.is_syncing())
            .field("resolvers", &self.resolvers.len())
            .finish()
    }
}
