//! quill-syncd - headless sync daemon.
//!
//! Keeps a local Quill cache in sync with a REST remote: replays queued
//! writes on an interval and polls the watched tables for remote changes.

use std::sync::Arc;

use quill_sync::{FilePersistence, RestRemoteStore, StaticConnectivity, SyncConfig, SyncRuntime};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "quill_sync=debug,quill_syncd=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    dotenvy::dotenv().ok();
    let config = SyncConfig::from_env()?;

    let remote = Arc::new(RestRemoteStore::from_config(&config)?);
    let persistence = Arc::new(FilePersistence::open(&config.cache_path).await?);
    let connectivity = Arc::new(StaticConnectivity::new(true));

    tracing::info!(
        remote = config.remote_url.as_deref().unwrap_or_default(),
        cache = %config.cache_path.display(),
        "starting quill-syncd"
    );

    let runtime = SyncRuntime::start(config.clone(), remote, persistence, connectivity).await?;

    for table in &config.watch_tables {
        runtime.watch(table.as_str(), None, None);
    }
    runtime.start_auto_sync();

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown requested");

    let result = runtime.engine().sync_all().await;
    if !result.is_success() {
        tracing::warn!(
            errors = result.errors.len(),
            outcome = ?result.outcome,
            "final sync incomplete, queued writes stay on disk"
        );
    }
    runtime.shutdown().await;

    Ok(())
}
