//! Wiring of the sync components into one owned runtime.
//!
//! The runtime owns every background task it starts (subscription
//! supervisors, fallback pollers, auto-sync) and tears them all down on
//! [`SyncRuntime::shutdown`].

use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use quill_engine::{ChoiceContract, TableName};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::SyncConfig;
use crate::engine::{Connectivity, SyncEngine};
use crate::error::Result;
use crate::events::EventBus;
use crate::guard::ContentGuard;
use crate::health::HealthMonitor;
use crate::persistence::LocalPersistence;
use crate::poller::{FallbackPoller, Refresher};
use crate::queue::OperationQueue;
use crate::realtime::{PushChannel, RealtimeReconciler};
use crate::remote::{ChannelFilter, RemoteStore};
use crate::store::LocalRecordStore;

/// A running sync client.
pub struct SyncRuntime {
    config: SyncConfig,
    engine: Arc<SyncEngine>,
    remote: Arc<dyn RemoteStore>,
    guard: Arc<ContentGuard>,
    events: Arc<EventBus>,
    monitors: DashMap<TableName, Arc<HealthMonitor>>,
    reconcilers: DashMap<TableName, Arc<RealtimeReconciler>>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl SyncRuntime {
    /// Load local state and build the engine with the default choice contract.
    pub async fn start(
        config: SyncConfig,
        remote: Arc<dyn RemoteStore>,
        persistence: Arc<dyn LocalPersistence>,
        connectivity: Arc<dyn Connectivity>,
    ) -> Result<Self> {
        Self::start_with_contract(
            config,
            remote,
            persistence,
            connectivity,
            Arc::new(ChoiceContract::default()),
        )
        .await
    }

    /// Like [`SyncRuntime::start`] with custom choice rules.
    pub async fn start_with_contract(
        config: SyncConfig,
        remote: Arc<dyn RemoteStore>,
        persistence: Arc<dyn LocalPersistence>,
        connectivity: Arc<dyn Connectivity>,
        contract: Arc<ChoiceContract>,
    ) -> Result<Self> {
        let events = EventBus::new_shared();
        let store = Arc::new(LocalRecordStore::load(persistence.clone()).await?);
        let queue = Arc::new(
            OperationQueue::load(persistence, config.retry_policy(), events.clone()).await?,
        );
        let guard = Arc::new(ContentGuard::new(
            contract,
            config.choices_field.clone(),
            config.story_text_field.clone(),
            events.clone(),
        ));

        let engine = Arc::new(SyncEngine::new(
            config.clone(),
            store,
            queue,
            remote.clone(),
            connectivity,
            events.clone(),
            guard.clone(),
        ));

        tracing::info!(
            records = engine.store().len(),
            queued = engine.queue().len().await,
            strategy = %config.conflict_strategy,
            "sync runtime started"
        );

        Ok(Self {
            config,
            engine,
            remote,
            guard,
            events,
            monitors: DashMap::new(),
            reconcilers: DashMap::new(),
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn engine(&self) -> &Arc<SyncEngine> {
        &self.engine
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Health monitor of a watched table.
    pub fn monitor(&self, table: &str) -> Option<Arc<HealthMonitor>> {
        self.monitors.get(table).map(|m| Arc::clone(m.value()))
    }

    /// Reconciler of a watched table.
    pub fn reconciler(&self, table: &str) -> Option<Arc<RealtimeReconciler>> {
        self.reconcilers.get(table).map(|r| Arc::clone(r.value()))
    }

    /// Keep a table fresh.
    ///
    /// With a push channel, a supervisor subscribes and the poller only runs
    /// while the channel is unhealthy. Without one the poller runs alone.
    /// Watching a table twice returns the existing monitor.
    pub fn watch(
        &self,
        table: impl Into<TableName>,
        filter: Option<ChannelFilter>,
        channel: Option<Arc<dyn PushChannel>>,
    ) -> Arc<HealthMonitor> {
        let table = table.into();
        if let Some(existing) = self.monitor(&table) {
            tracing::warn!(table = %table, "table already watched");
            return existing;
        }

        let reconciler = Arc::new(RealtimeReconciler::new(
            table.clone(),
            filter,
            self.engine.store().clone(),
            self.engine.queue().clone(),
            self.remote.clone(),
            self.guard.clone(),
            self.events.clone(),
            self.config.asset_fields.clone(),
        ));
        let refresher: Arc<dyn Refresher> = reconciler.clone();
        let poller = Arc::new(FallbackPoller::new(refresher, self.config.poll_interval()));
        let monitor = Arc::new(HealthMonitor::new(
            table.clone(),
            self.config.backoff(),
            poller.clone(),
            self.events.clone(),
        ));

        match channel {
            Some(channel) => {
                let handle = reconciler.clone().spawn(channel, monitor.clone(), self.cancel.child_token());
                self.track(handle);
                tracing::info!(table = %table, "watching table over push channel");
            }
            None => {
                poller.activate();
                tracing::info!(table = %table, "watching table by polling");
            }
        }

        self.reconcilers.insert(table.clone(), reconciler);
        self.monitors.insert(table, monitor.clone());
        monitor
    }

    /// Start the periodic background sync.
    pub fn start_auto_sync(&self) {
        let handle = self
            .engine
            .clone()
            .run_periodic(self.config.auto_sync_interval(), self.cancel.child_token());
        self.track(handle);
    }

    fn track(&self, handle: JoinHandle<()>) {
        self.tasks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(handle);
    }

    /// Stop every background task and wait for them to finish.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        for monitor in self.monitors.iter() {
            monitor.value().poller().deactivate();
        }

        let tasks = std::mem::take(
            &mut *self
                .tasks
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner()),
        );
        for task in tasks {
            if let Err(error) = task.await {
                if error.is_panic() {
                    tracing::error!(error = %error, "background task panicked");
                }
            }
        }

        tracing::info!("sync runtime stopped");
    }
}

impl std::fmt::Debug for SyncRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncRuntime")
            .field("engine", &self.engine)
            .field("watched", &self.monitors.len())
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}
