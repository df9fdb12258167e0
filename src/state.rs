use std::sync::Arc;

use anyhow::Context;
use tracing::info;

use crate::collections::ChangeFeed;
use crate::config::AppConfig;
use crate::db::StoreEngine;
use crate::partition::UserPartition;
use crate::sync::{Filesystem, FolderSync, SyncOutcome};
use crate::user_active::StoreHandle;
use crate::AppResult;

/// Everything a running session needs, wired together once at startup.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub engine: Arc<StoreEngine>,
    pub partition: Arc<UserPartition>,
    pub sync: Arc<FolderSync>,
}

impl AppState {
    /// Open the store and bring the user partition to `Ready`. Folder sync
    /// is wired but not started; see [`AppState::start_sync`].
    pub async fn bootstrap(config: AppConfig, fs: Arc<dyn Filesystem>) -> anyhow::Result<Self> {
        std::fs::create_dir_all(&config.data_dir)
            .with_context(|| format!("create data directory {}", config.data_dir.display()))?;

        let engine = StoreEngine::new(config.store_options());
        engine
            .open()
            .await
            .with_context(|| format!("open database {}", config.db_path().display()))?;

        let prefs = StoreHandle::file(config.prefs_path())?;
        let handles = StoreHandle::file(config.handles_path())?;
        let feed = ChangeFeed::new();
        let partition = Arc::new(UserPartition::new(engine.clone(), prefs, feed));
        partition
            .initialize()
            .await
            .context("prepare user data")?;

        let sync = FolderSync::new(partition.clone(), fs, handles, config.sync_options());
        info!(
            target: "libretto",
            event = "app_bootstrap",
            data_dir = %config.data_dir.display(),
            active_user = partition.active_id().as_deref().unwrap_or("")
        );
        Ok(Self {
            config: Arc::new(config),
            engine,
            partition,
            sync,
        })
    }

    /// Startup reconcile with the linked folder, then background propagation.
    pub async fn start_sync(&self) -> AppResult<SyncOutcome> {
        let outcome = self.sync.reconcile_on_load().await;
        self.sync.spawn_propagator();
        Ok(outcome?)
    }

    /// Flush pending folder writes and close the database.
    pub async fn shutdown(&self) {
        self.sync.shutdown().await;
        self.engine.close().await;
    }
}
