//! Push channel subscriptions and delta merging.
//!
//! A [`RealtimeReconciler`] owns one table (optionally filtered). Push deltas
//! are merged field by field into the local cache: only fields present in
//! the delta are written, fields with a queued local write are left alone,
//! and the `choices` field goes through the [`ContentGuard`] first.
//!
//! The supervisor task spawned by [`RealtimeReconciler::spawn`] keeps the
//! subscription alive: lifecycle statuses go to the [`HealthMonitor`], and a
//! failed channel is torn down and resubscribed after the backoff delay until
//! the attempt limit is reached. From then on the fallback poller, which
//! refreshes through the same merge path, is the only source of updates.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use quill_engine::{
    row_id, row_timestamp, ChannelStatus, ChoiceMerge, ReconnectDecision, RecordId, Row,
    TableName, VersionedRecord, ID_FIELD, UPDATED_AT_FIELD,
};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{RemoteError, Result, SyncError};
use crate::events::{EventBus, SyncEvent};
use crate::guard::ContentGuard;
use crate::health::HealthMonitor;
use crate::poller::Refresher;
use crate::queue::OperationQueue;
use crate::remote::{ChannelFilter, RemoteStore};
use crate::store::LocalRecordStore;

/// Kind of row change carried by a push event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PushEventType {
    Insert,
    Update,
    Delete,
}

/// A row change delivered by the push channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushEvent {
    pub event_type: PushEventType,
    pub table: TableName,
    /// Fields present after the change (absent for deletes)
    #[serde(default)]
    pub new: Option<Row>,
    /// Fields before the change; deletes carry at least the id
    #[serde(default)]
    pub old: Option<Row>,
}

impl PushEvent {
    /// Id of the changed row.
    pub fn record_id(&self) -> Option<&str> {
        self.new
            .as_ref()
            .and_then(row_id)
            .or_else(|| self.old.as_ref().and_then(row_id))
    }
}

/// Message received on a subscription.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelMessage {
    Event(PushEvent),
    Status(ChannelStatus),
}

/// A live subscription.
#[derive(Debug)]
pub struct Subscription {
    pub id: String,
    pub messages: mpsc::UnboundedReceiver<ChannelMessage>,
}

/// Server push transport.
#[async_trait]
pub trait PushChannel: Send + Sync {
    async fn subscribe(
        &self,
        table: &str,
        filter: Option<&ChannelFilter>,
    ) -> std::result::Result<Subscription, RemoteError>;

    async fn unsubscribe(&self, subscription_id: &str) -> std::result::Result<(), RemoteError>;
}

#[derive(Debug)]
struct MemorySubscriber {
    table: TableName,
    filter: Option<ChannelFilter>,
    sender: mpsc::UnboundedSender<ChannelMessage>,
}

/// In-process push channel.
///
/// By default every new subscription immediately receives `Subscribed`;
/// [`MemoryPushChannel::unacknowledged`] leaves status delivery to the
/// caller.
#[derive(Debug)]
pub struct MemoryPushChannel {
    subscribers: DashMap<String, MemorySubscriber>,
    acknowledge: bool,
    subscribe_calls: AtomicUsize,
}

impl Default for MemoryPushChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryPushChannel {
    pub fn new() -> Self {
        Self {
            subscribers: DashMap::new(),
            acknowledge: true,
            subscribe_calls: AtomicUsize::new(0),
        }
    }

    pub fn unacknowledged() -> Self {
        Self {
            acknowledge: false,
            ..Self::new()
        }
    }

    /// Deliver an event to matching subscribers. Returns how many got it.
    pub fn publish(&self, event: PushEvent) -> usize {
        let row = event.new.as_ref().or(event.old.as_ref());
        self.send_where(ChannelMessage::Event(event.clone()), |sub| {
            if sub.table != event.table {
                return false;
            }
            match (&sub.filter, row) {
                (None, _) => true,
                (Some(filter), Some(row)) => {
                    filter.matches(row)
                        || (event.event_type == PushEventType::Delete
                            && !row.contains_key(&filter.column))
                }
                (Some(_), None) => false,
            }
        })
    }

    /// Deliver a lifecycle status to every subscriber of `table`.
    pub fn emit_status(&self, table: &str, status: ChannelStatus) -> usize {
        self.send_where(ChannelMessage::Status(status), |sub| sub.table == table)
    }

    /// Close every subscription of `table`, as a dropped socket would.
    pub fn disconnect(&self, table: &str) {
        self.subscribers.retain(|_, sub| sub.table != table);
    }

    /// Live subscriptions.
    pub fn subscription_count(&self) -> usize {
        self.subscribers.len()
    }

    /// Subscribe calls made so far.
    pub fn subscribe_calls(&self) -> usize {
        self.subscribe_calls.load(Ordering::SeqCst)
    }

    fn send_where<F>(&self, message: ChannelMessage, accept: F) -> usize
    where
        F: Fn(&MemorySubscriber) -> bool,
    {
        self.subscribers
            .iter()
            .filter(|entry| accept(entry.value()))
            .filter(|entry| entry.value().sender.send(message.clone()).is_ok())
            .count()
    }
}

#[async_trait]
impl PushChannel for MemoryPushChannel {
    async fn subscribe(
        &self,
        table: &str,
        filter: Option<&ChannelFilter>,
    ) -> std::result::Result<Subscription, RemoteError> {
        self.subscribe_calls.fetch_add(1, Ordering::SeqCst);

        let id = Uuid::new_v4().to_string();
        let (sender, messages) = mpsc::unbounded_channel();
        if self.acknowledge {
            // Receiver is alive, the send cannot fail.
            let _ = sender.send(ChannelMessage::Status(ChannelStatus::Subscribed));
        }
        self.subscribers.insert(
            id.clone(),
            MemorySubscriber {
                table: table.to_string(),
                filter: filter.cloned(),
                sender,
            },
        );

        Ok(Subscription { id, messages })
    }

    async fn unsubscribe(&self, subscription_id: &str) -> std::result::Result<(), RemoteError> {
        self.subscribers.remove(subscription_id);
        Ok(())
    }
}

/// What merging one row did to the cache.
#[derive(Debug, Clone, PartialEq)]
pub struct MergeOutcome {
    pub record_id: RecordId,
    /// The row was not cached before
    pub created: bool,
    /// The row hit a local tombstone and was ignored
    pub skipped: bool,
    /// Fields left untouched because a local write is queued
    pub protected: Vec<String>,
    /// Choice guard decision, when the row carried choices
    pub choices: Option<ChoiceMerge>,
    /// Asset fields that became available
    pub assets: Vec<(String, serde_json::Value)>,
}

/// Merges push deltas and poll results for one table into the cache.
pub struct RealtimeReconciler {
    table: TableName,
    filter: Option<ChannelFilter>,
    store: Arc<LocalRecordStore>,
    queue: Arc<OperationQueue>,
    remote: Arc<dyn RemoteStore>,
    guard: Arc<ContentGuard>,
    events: Arc<EventBus>,
    asset_fields: Vec<String>,
}

impl RealtimeReconciler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        table: impl Into<TableName>,
        filter: Option<ChannelFilter>,
        store: Arc<LocalRecordStore>,
        queue: Arc<OperationQueue>,
        remote: Arc<dyn RemoteStore>,
        guard: Arc<ContentGuard>,
        events: Arc<EventBus>,
        asset_fields: Vec<String>,
    ) -> Self {
        Self {
            table: table.into(),
            filter,
            store,
            queue,
            remote,
            guard,
            events,
            asset_fields,
        }
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn filter(&self) -> Option<&ChannelFilter> {
        self.filter.as_ref()
    }

    /// Apply one push event to the cache.
    pub async fn handle_push_event(&self, event: PushEvent) -> Result<Option<MergeOutcome>> {
        if event.table != self.table {
            tracing::debug!(table = %event.table, watching = %self.table, "push event for another table ignored");
            return Ok(None);
        }

        match event.event_type {
            PushEventType::Delete => {
                let Some(id) = event.record_id().map(str::to_string) else {
                    tracing::warn!(table = %self.table, "delete event without an id ignored");
                    return Ok(None);
                };
                if self.queue.has_unfinished_for(&id).await {
                    tracing::debug!(
                        table = %self.table,
                        record_id = %id,
                        "remote delete deferred, local changes queued"
                    );
                    return Ok(None);
                }
                self.store.remove(&self.table, &id).await?;
                tracing::debug!(table = %self.table, record_id = %id, "remote delete applied");
                Ok(None)
            }
            PushEventType::Insert | PushEventType::Update => {
                let Some(row) = event.new else {
                    tracing::warn!(table = %self.table, "push event without a row ignored");
                    return Ok(None);
                };
                self.merge_row(row).await.map(Some)
            }
        }
    }

    /// Merge a remote row (or partial row) into the cache.
    pub async fn merge_row(&self, mut delta: Row) -> Result<MergeOutcome> {
        let id = row_id(&delta)
            .ok_or(quill_engine::Error::MissingRowId)?
            .to_string();
        let updated_at = row_timestamp(&delta)?.unwrap_or(0);
        delta.remove(ID_FIELD);
        delta.remove(UPDATED_AT_FIELD);

        let pending = self.queue.pending_fields(&id).await;
        let protected: Vec<String> = delta
            .keys()
            .filter(|key| pending.contains(*key))
            .cloned()
            .collect();
        for key in &protected {
            delta.remove(key);
        }
        if !protected.is_empty() {
            tracing::debug!(
                table = %self.table,
                record_id = %id,
                fields = ?protected,
                "fields with queued local writes kept"
            );
        }

        let outcome = self
            .store
            .modify(&self.table, &id, |slot| {
                let mut outcome = MergeOutcome {
                    record_id: id.clone(),
                    created: slot.is_none(),
                    skipped: false,
                    protected,
                    choices: None,
                    assets: Vec::new(),
                };

                if slot.as_ref().is_some_and(|r| r.deleted) {
                    outcome.skipped = true;
                    return outcome;
                }

                outcome.choices = self.guard.screen(&self.table, &id, slot.as_ref(), &mut delta);
                outcome.assets = self
                    .asset_fields
                    .iter()
                    .filter(|field| {
                        let before = slot
                            .as_ref()
                            .and_then(|r| r.field(field))
                            .is_some_and(|v| !v.is_null());
                        !before
                    })
                    .filter_map(|field| {
                        delta
                            .get(field)
                            .filter(|v| !v.is_null())
                            .map(|v| (field.clone(), v.clone()))
                    })
                    .collect();

                match slot {
                    Some(record) => record.apply_delta(&delta, updated_at),
                    None => {
                        *slot = Some(VersionedRecord::new_remote(
                            id.clone(),
                            self.table.clone(),
                            delta.clone(),
                            updated_at,
                        ));
                    }
                }
                outcome
            })
            .await?;

        for (field, value) in &outcome.assets {
            tracing::info!(table = %self.table, record_id = %id, field = %field, "asset ready");
            self.events.emit(SyncEvent::AssetReady {
                table: self.table.clone(),
                record_id: id.clone(),
                field: field.clone(),
                value: value.clone(),
            });
        }

        Ok(outcome)
    }

    /// Pull the watched record set and merge every row.
    pub async fn refresh(&self) -> Result<usize> {
        let rows = self.remote.select(&self.table, self.filter.as_ref()).await?;
        let mut merged = 0;

        for row in rows {
            match self.merge_row(row).await {
                Ok(outcome) if !outcome.skipped => merged += 1,
                Ok(_) => {}
                Err(error) => {
                    tracing::warn!(table = %self.table, error = %error, "refreshed row not merged");
                }
            }
        }

        tracing::debug!(table = %self.table, merged, "table refreshed");
        Ok(merged)
    }

    /// Spawn the subscription supervisor.
    pub fn spawn(
        self: Arc<Self>,
        channel: Arc<dyn PushChannel>,
        monitor: Arc<HealthMonitor>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move { self.supervise(channel.as_ref(), &monitor, &cancel).await })
    }

    async fn supervise(
        &self,
        channel: &dyn PushChannel,
        monitor: &HealthMonitor,
        cancel: &CancellationToken,
    ) {
        let mut current: Option<String> = None;

        'connect: loop {
            // Never hold two subscriptions for one table.
            if let Some(id) = current.take() {
                self.release(channel, &id).await;
            }
            if cancel.is_cancelled() {
                break;
            }

            let mut subscription = match channel.subscribe(&self.table, self.filter.as_ref()).await {
                Ok(subscription) => subscription,
                Err(error) => {
                    let error = SyncError::ChannelError {
                        table: self.table.clone(),
                        message: error.to_string(),
                    };
                    tracing::warn!(error = %error, "subscribe failed");
                    let transition = monitor.observe(ChannelStatus::ChannelError).await;
                    if self.wait_for_reconnect(transition.reconnect, cancel).await {
                        continue 'connect;
                    }
                    break 'connect;
                }
            };
            current = Some(subscription.id.clone());
            tracing::debug!(table = %self.table, subscription = %subscription.id, "subscribed");

            loop {
                let message = tokio::select! {
                    _ = cancel.cancelled() => break 'connect,
                    message = subscription.messages.recv() => message,
                };

                let (status, detail) = match message {
                    Some(ChannelMessage::Event(event)) => {
                        if let Err(error) = self.handle_push_event(event).await {
                            tracing::warn!(table = %self.table, error = %error, "push event not applied");
                        }
                        continue;
                    }
                    Some(ChannelMessage::Status(status)) => (status, "channel reported an error"),
                    None => (ChannelStatus::ChannelError, "subscription stream ended"),
                };
                if let Some(error) = self.channel_failure(status, detail) {
                    tracing::warn!(error = %error, "push channel unhealthy");
                }

                let transition = monitor.observe(status).await;
                match transition.reconnect {
                    ReconnectDecision::None => continue,
                    decision => {
                        if self.wait_for_reconnect(decision, cancel).await {
                            continue 'connect;
                        }
                        break 'connect;
                    }
                }
            }
        }

        if let Some(id) = current {
            self.release(channel, &id).await;
        }
        tracing::debug!(table = %self.table, "subscription supervisor stopped");
    }

    /// The error a failure status stands for.
    fn channel_failure(&self, status: ChannelStatus, detail: &str) -> Option<SyncError> {
        match status {
            ChannelStatus::ChannelError => Some(SyncError::ChannelError {
                table: self.table.clone(),
                message: detail.to_string(),
            }),
            ChannelStatus::TimedOut => Some(SyncError::ChannelTimeout {
                table: self.table.clone(),
            }),
            _ => None,
        }
    }

    /// Sleep out a reconnect delay. Returns false when the supervisor
    /// should stop instead.
    async fn wait_for_reconnect(&self, decision: ReconnectDecision, cancel: &CancellationToken) -> bool {
        match decision {
            ReconnectDecision::None => true,
            ReconnectDecision::After { delay_ms, attempt } => {
                tracing::info!(table = %self.table, attempt, delay_ms, "reconnecting after delay");
                tokio::select! {
                    _ = cancel.cancelled() => false,
                    _ = tokio::time::sleep(Duration::from_millis(delay_ms)) => true,
                }
            }
            ReconnectDecision::GiveUp { attempts } => {
                tracing::warn!(
                    table = %self.table,
                    attempts,
                    "reconnect attempts exhausted, relying on polling"
                );
                false
            }
        }
    }

    async fn release(&self, channel: &dyn PushChannel, subscription_id: &str) {
        if let Err(error) = channel.unsubscribe(subscription_id).await {
            tracing::warn!(table = %self.table, error = %error, "unsubscribe failed");
        }
    }
}

#[async_trait]
impl Refresher for RealtimeReconciler {
    async fn refresh(&self) -> Result<usize> {
        RealtimeReconciler::refresh(self).await
    }
}

impl std::fmt::Debug for RealtimeReconciler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RealtimeReconciler")
            .field("table", &self.table)
            .field("filter", &self.filter)
            .field("asset_fields", &self.asset_fields)
            .finish()
    }
}
