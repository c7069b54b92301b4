//! Push channel health monitoring.
//!
//! Feeds channel lifecycle signals into the engine's
//! [`ConnectionHealthTracker`] and keeps the fallback poller in step with
//! the result: polling runs exactly while the channel is not healthy.

use std::sync::Arc;

use quill_engine::{
    BackoffConfig, ChannelStatus, ConnectionHealth, ConnectionHealthTracker, HealthTransition,
    TableName,
};
use tokio::sync::Mutex;

use crate::events::{EventBus, SyncEvent};
use crate::now_ms;
use crate::poller::FallbackPoller;

/// Health state of one table's push channel.
#[derive(Debug)]
pub struct HealthMonitor {
    table: TableName,
    tracker: Mutex<ConnectionHealthTracker>,
    poller: Arc<FallbackPoller>,
    events: Arc<EventBus>,
}

impl HealthMonitor {
    pub fn new(
        table: impl Into<TableName>,
        backoff: BackoffConfig,
        poller: Arc<FallbackPoller>,
        events: Arc<EventBus>,
    ) -> Self {
        Self {
            table: table.into(),
            tracker: Mutex::new(ConnectionHealthTracker::new(backoff)),
            poller,
            events,
        }
    }

    /// Process a lifecycle signal from the channel.
    pub async fn observe(&self, status: ChannelStatus) -> HealthTransition {
        let transition = self.tracker.lock().await.observe(status, now_ms());

        tracing::debug!(
            table = %self.table,
            status = ?status,
            state = %transition.current,
            "channel status observed"
        );

        if transition.changed() {
            tracing::info!(
                table = %self.table,
                previous = %transition.previous,
                current = %transition.current,
                "connection health changed"
            );
            self.events.emit(SyncEvent::ConnectionHealthChanged {
                table: self.table.clone(),
                previous: transition.previous,
                current: transition.current,
            });
        }

        if transition.left_healthy() {
            self.poller.activate();
        } else if transition.recovered() {
            self.poller.deactivate();
        }

        if status == ChannelStatus::TimedOut {
            self.poller.force_refresh();
        }

        transition
    }

    /// Current health snapshot.
    pub async fn health(&self) -> ConnectionHealth {
        self.tracker.lock().await.health().clone()
    }

    pub async fn is_healthy(&self) -> bool {
        self.tracker.lock().await.is_healthy()
    }

    pub fn poller(&self) -> &Arc<FallbackPoller> {
        &self.poller
    }

    pub fn table(&self) -> &str {
        &self.table
    }
}
