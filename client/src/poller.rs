//! Fallback polling while the push channel is unhealthy.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::error::Result;

/// Pulls a fresh copy of a record set from the remote store.
#[async_trait]
pub trait Refresher: Send + Sync {
    /// Refresh and return how many rows were merged.
    async fn refresh(&self) -> Result<usize>;
}

/// Periodic pull-refresh that bounds staleness when push delivery fails.
///
/// `activate` and `deactivate` are idempotent. The interval task is aborted
/// on deactivation and when the poller is dropped.
pub struct FallbackPoller {
    refresher: Arc<dyn Refresher>,
    interval: Duration,
    task: Mutex<Option<JoinHandle<()>>>,
    refreshes: Arc<AtomicU64>,
}

impl FallbackPoller {
    /// A zero `interval` is raised to 1 ms.
    pub fn new(refresher: Arc<dyn Refresher>, interval: Duration) -> Self {
        Self {
            refresher,
            interval: interval.max(Duration::from_millis(1)),
            task: Mutex::new(None),
            refreshes: Arc::new(AtomicU64::new(0)),
        }
    }

    fn slot(&self) -> std::sync::MutexGuard<'_, Option<JoinHandle<()>>> {
        self.task.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Start polling. The first refresh runs immediately.
    pub fn activate(&self) {
        let mut task = self.slot();
        if task.as_ref().is_some_and(|t| !t.is_finished()) {
            return;
        }

        let refresher = Arc::clone(&self.refresher);
        let refreshes = Arc::clone(&self.refreshes);
        let period = self.interval;

        *task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                run_refresh(refresher.as_ref(), &refreshes).await;
            }
        }));

        tracing::info!(interval_ms = period.as_millis() as u64, "fallback polling activated");
    }

    /// Stop polling.
    pub fn deactivate(&self) {
        if let Some(task) = self.slot().take() {
            task.abort();
            tracing::info!("fallback polling deactivated");
        }
    }

    pub fn is_active(&self) -> bool {
        self.slot().as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Trigger one refresh now, outside the interval.
    pub fn force_refresh(&self) -> JoinHandle<()> {
        let refresher = Arc::clone(&self.refresher);
        let refreshes = Arc::clone(&self.refreshes);
        tokio::spawn(async move {
            run_refresh(refresher.as_ref(), &refreshes).await;
        })
    }

    /// Refreshes attempted so far.
    pub fn refresh_count(&self) -> u64 {
        self.refreshes.load(Ordering::SeqCst)
    }
}

async fn run_refresh(refresher: &dyn Refresher, refreshes: &AtomicU64) {
    refreshes.fetch_add(1, Ordering::SeqCst);
    match refresher.refresh().await {
        Ok(merged) => tracing::debug!(merged, "poll refresh finished"),
        Err(error) => tracing::warn!(error = %error, "poll refresh failed"),
    }
}

impl Drop for FallbackPoller {
    fn drop(&mut self) {
        if let Some(task) = self.slot().take() {
            task.abort();
        }
    }
}

impl std::fmt::Debug for FallbackPoller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FallbackPoller")
            .field("interval", &self.interval)
            .field("active", &self.is_active())
            .field("refreshes", &self.refresh_count())
            .finish()
    }
}
