//! # Quill Sync
//!
//! Offline-first sync runtime for Quill stories, built on the decision
//! core in `quill-engine`.
//!
//! Local writes land in a [`LocalRecordStore`] immediately and are queued as
//! operations in a durable [`OperationQueue`]. [`SyncEngine::sync_all`]
//! replays the queue against a [`RemoteStore`] and resolves conflicts for
//! anything still unsynced. Independently, a [`RealtimeReconciler`] merges
//! push deltas into the cache, with a [`FallbackPoller`] covering for the
//! push channel whenever its [`HealthMonitor`] reports it unhealthy.
//!
//! Generated choice sets pass the [`ContentGuard`] on every path into the
//! cache, so a valid set is never replaced by an invalid one.
//!
//! ```no_run
//! use std::sync::Arc;
//! use quill_sync::{
//!     MemoryPushChannel, MemoryRemoteStore, FilePersistence, StaticConnectivity, SyncConfig,
//!     SyncRuntime,
//! };
//! use serde_json::json;
//!
//! # async fn run() -> quill_sync::Result<()> {
//! let runtime = SyncRuntime::start(
//!     SyncConfig::default(),
//!     Arc::new(MemoryRemoteStore::new()),
//!     Arc::new(FilePersistence::open("quill-cache.json").await?),
//!     Arc::new(StaticConnectivity::new(true)),
//! )
//! .await?;
//!
//! runtime.watch("segments", None, Some(Arc::new(MemoryPushChannel::new())));
//!
//! let fields = json!({"content": "The lantern flickers."}).as_object().cloned().unwrap();
//! runtime.engine().write("segments", "seg-1", fields).await?;
//! let result = runtime.engine().sync_all().await;
//! assert!(result.is_success());
//!
//! runtime.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod guard;
pub mod health;
pub mod persistence;
pub mod poller;
pub mod queue;
pub mod realtime;
pub mod remote;
pub mod rest;
pub mod runtime;
pub mod store;

pub use config::{ConfigError, SyncConfig};
pub use engine::{Connectivity, StaticConnectivity, SyncEngine, SyncOutcome, SyncResult};
pub use error::{PersistenceError, RemoteError, Result, SyncError};
pub use events::{EventBus, EventReceiver, SubscriptionToken, SyncEvent};
pub use guard::ContentGuard;
pub use health::HealthMonitor;
pub use persistence::{FilePersistence, LocalPersistence, MemoryPersistence};
pub use poller::{FallbackPoller, Refresher};
pub use queue::{DrainReport, OperationQueue};
pub use realtime::{
    ChannelMessage, MemoryPushChannel, MergeOutcome, PushChannel, PushEvent, PushEventType,
    RealtimeReconciler, Subscription,
};
pub use remote::{ChannelFilter, MemoryRemoteStore, RemoteStore};
pub use rest::RestRemoteStore;
pub use runtime::SyncRuntime;
pub use store::LocalRecordStore;

use quill_engine::Timestamp;

/// Wall clock in milliseconds since the epoch.
pub(crate) fn now_ms() -> Timestamp {
    u64::try_from(chrono::Utc::now().timestamp_millis()).unwrap_or(0)
}
