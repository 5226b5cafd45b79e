//! Sync manager, scheduling and environment wiring for govmatch.

pub mod clock;
pub mod config;
pub mod manager;
pub mod scheduler;

#[cfg(test)]
mod testing;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use govmatch_adapters::{
    FixtureSourceClient, HttpClientConfig, SamClientConfig, SamGovClient, SourceClient,
};
use govmatch_storage::{PgStore, Store, StoreError};
use thiserror::Error;
use tracing::info;

pub use clock::{Clock, Sleeper, StopSignal, SystemClock, TokioSleeper};
pub use config::{CategoryRegistry, SourceKind, SyncConfig, ThrottleConfig};
pub use manager::{CategorySyncCount, FullSyncReport, IncrementalSyncReport, SyncManager};
pub use scheduler::{ScheduledSync, SyncScheduler, SHUTDOWN_TIMEOUT};

pub const CRATE_NAME: &str = "govmatch-sync";

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("invalid sync request: {0}")]
    Validation(String),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("configuration error: {0}")]
    Config(String),
}

pub fn build_source(config: &SyncConfig) -> anyhow::Result<Arc<dyn SourceClient>> {
    match config.source {
        SourceKind::Fixtures => {
            info!(dir = %config.fixtures_dir.display(), "using recorded fixtures as source");
            Ok(Arc::new(FixtureSourceClient::new(config.fixtures_dir.clone())))
        }
        SourceKind::Sam => {
            let api_key = config
                .sam_api_key
                .clone()
                .context("SAM_API_KEY must be set when GOVMATCH_SOURCE=sam")?;
            let client = SamGovClient::new(SamClientConfig {
                base_url: config.sam_api_url.clone(),
                api_key,
                http: HttpClientConfig {
                    timeout: Duration::from_secs(config.http_timeout_secs),
                    user_agent: Some(config.user_agent.clone()),
                    ..Default::default()
                },
            })?;
            Ok(Arc::new(client))
        }
    }
}

/// Connect to Postgres and apply pending migrations.
pub async fn connect_store(config: &SyncConfig) -> anyhow::Result<Arc<PgStore>> {
    let store = PgStore::connect(&config.database_url, config.database_max_connections)
        .await
        .context("connecting to database")?;
    store.migrate().await.context("running migrations")?;
    Ok(Arc::new(store))
}

pub fn build_manager(config: &SyncConfig, store: Arc<dyn Store>) -> anyhow::Result<SyncManager> {
    let registry = CategoryRegistry::load(&config.categories_path)?;
    let source = build_source(config)?;
    Ok(SyncManager::new(store, source, registry))
}

pub async fn run_incremental_sync_from_env(
    max_opportunities: Option<usize>,
) -> anyhow::Result<IncrementalSyncReport> {
    let config = SyncConfig::from_env()?;
    let store = connect_store(&config).await?;
    let manager = build_manager(&config, store)?;
    let max = max_opportunities.unwrap_or(config.max_opportunities);
    Ok(manager.incremental_sync(max).await?)
}

pub async fn run_full_sync_from_env(
    days_back: u32,
    batch_size: usize,
) -> anyhow::Result<FullSyncReport> {
    let config = SyncConfig::from_env()?;
    let store = connect_store(&config).await?;
    let manager = build_manager(&config, store)?;
    Ok(manager.full_sync(days_back, batch_size).await?)
}

/// Run the interval scheduler until Ctrl-C.
pub async fn run_scheduler_from_env(interval_minutes: Option<u64>) -> anyhow::Result<()> {
    let mut config = SyncConfig::from_env()?;
    if let Some(minutes) = interval_minutes {
        config.sync_interval_minutes = minutes;
    }
    let store = connect_store(&config).await?;
    let manager = Arc::new(build_manager(&config, store)?);
    let job = ScheduledSync::new(manager, config.max_opportunities, config.lease_ttl());
    SyncScheduler::new(job, config.sync_interval())
        .run_until_ctrl_c()
        .await
}
