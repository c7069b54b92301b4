//! Lifecycle events and their subscriber registry.
//!
//! Observers subscribe to an [`EventBus`] and receive every event on their
//! own unbounded channel. Subscribing returns a token used to unsubscribe;
//! subscribers whose receiver was dropped are pruned on the next emit.

use std::sync::Arc;

use dashmap::DashMap;
use quill_engine::{
    ConflictStrategy, HealthState, MergeDecision, OperationId, RecordId, TableName, Winner,
};
use serde::Serialize;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Events emitted by the sync runtime.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SyncEvent {
    SyncStarted,
    SyncCompleted {
        synced_count: usize,
        conflict_count: usize,
    },
    SyncFailed {
        synced_count: usize,
        conflict_count: usize,
        errors: Vec<String>,
    },
    ConflictDetected {
        table: TableName,
        record_id: RecordId,
        strategy: ConflictStrategy,
    },
    ConflictResolved {
        table: TableName,
        record_id: RecordId,
        strategy: ConflictStrategy,
        winner: Winner,
        #[serde(skip_serializing_if = "Option::is_none")]
        fallback_reason: Option<String>,
    },
    ChoiceRejected {
        table: TableName,
        segment_id: RecordId,
        decision: MergeDecision,
        incoming: serde_json::Value,
        existing: Option<serde_json::Value>,
        reason: String,
    },
    ConnectionHealthChanged {
        table: TableName,
        previous: HealthState,
        current: HealthState,
    },
    OperationFailed {
        op_id: OperationId,
        table: TableName,
        record_id: RecordId,
        attempts: u32,
        error: String,
    },
    AssetReady {
        table: TableName,
        record_id: RecordId,
        field: String,
        value: serde_json::Value,
    },
}

impl SyncEvent {
    /// Stable event name.
    pub fn name(&self) -> &'static str {
        match self {
            SyncEvent::SyncStarted => "sync_started",
            SyncEvent::SyncCompleted { .. } => "sync_completed",
            SyncEvent::SyncFailed { .. } => "sync_failed",
            SyncEvent::ConflictDetected { .. } => "conflict_detected",
            SyncEvent::ConflictResolved { .. } => "conflict_resolved",
            SyncEvent::ChoiceRejected { .. } => "choice_rejected",
            SyncEvent::ConnectionHealthChanged { .. } => "connection_health_changed",
            SyncEvent::OperationFailed { .. } => "operation_failed",
            SyncEvent::AssetReady { .. } => "asset_ready",
        }
    }
}

/// Token identifying one subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionToken(Uuid);

impl std::fmt::Display for SubscriptionToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Receiving end handed to a subscriber.
pub type EventReceiver = mpsc::UnboundedReceiver<SyncEvent>;

/// Fan-out of [`SyncEvent`]s to subscribers.
///
/// Thread-safe and shared across services via `Arc`.
#[derive(Debug, Default)]
pub struct EventBus {
    subscribers: DashMap<SubscriptionToken, mpsc::UnboundedSender<SyncEvent>>,
}

impl EventBus {
    /// Create a new event bus.
    pub fn new() -> Self {
        Self {
            subscribers: DashMap::new(),
        }
    }

    /// Create a new event bus wrapped in Arc for sharing.
    pub fn new_shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Register a subscriber.
    pub fn subscribe(&self) -> (SubscriptionToken, EventReceiver) {
        let token = SubscriptionToken(Uuid::new_v4());
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.insert(token, tx);

        tracing::debug!(token = %token, "event subscriber registered");
        (token, rx)
    }

    /// Remove a subscriber. Returns false if the token was unknown.
    pub fn unsubscribe(&self, token: SubscriptionToken) -> bool {
        let removed = self.subscribers.remove(&token).is_some();
        if removed {
            tracing::debug!(token = %token, "event subscriber removed");
        }
        removed
    }

    /// Deliver an event to every subscriber.
    ///
    /// Returns the number of subscribers that received it.
    pub fn emit(&self, event: SyncEvent) -> usize {
        let mut sent = 0;
        let mut closed = Vec::new();

        for entry in self.subscribers.iter() {
            if entry.value().send(event.clone()).is_ok() {
                sent += 1;
            } else {
                closed.push(*entry.key());
            }
        }

        for token in closed {
            self.subscribers.remove(&token);
        }

        tracing::trace!(event = event.name(), recipients = sent, "event emitted");
        sent
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }
}
