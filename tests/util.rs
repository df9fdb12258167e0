#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use libretto_lib::db::{Collection, Record, StoreEngine, StoreOptions};
use libretto_lib::sync::{FolderSync, MemoryFilesystem, SyncOptions};
use libretto_lib::user_active::StoreHandle;
use libretto_lib::{ChangeFeed, UserPartition};
use serde_json::Value;

pub const SHARED_DIR: &str = "mem://shared";

pub async fn open_memory_engine() -> Result<Arc<StoreEngine>> {
    let engine = StoreEngine::new(StoreOptions::in_memory());
    engine.open().await?;
    Ok(engine)
}

pub async fn seed(engine: &StoreEngine, collection: Collection, value: Value) -> Result<()> {
    engine
        .put(collection, &Record::from_value(collection, value)?)
        .await?;
    Ok(())
}

pub fn partition_over(engine: Arc<StoreEngine>) -> Arc<UserPartition> {
    Arc::new(UserPartition::new(
        engine,
        StoreHandle::in_memory(),
        ChangeFeed::new(),
    ))
}

pub async fn ready_partition() -> Result<Arc<UserPartition>> {
    let partition = partition_over(open_memory_engine().await?);
    partition.initialize().await?;
    Ok(partition)
}

pub fn memory_sync(
    partition: Arc<UserPartition>,
    fs: Arc<MemoryFilesystem>,
    debounce: Duration,
) -> Arc<FolderSync> {
    FolderSync::new(
        partition,
        fs,
        StoreHandle::in_memory(),
        SyncOptions {
            debounce,
            ..SyncOptions::default()
        },
    )
}

/// A device already linked to [`SHARED_DIR`].
pub async fn linked_device(
    fs: Arc<MemoryFilesystem>,
    debounce: Duration,
) -> Result<(Arc<UserPartition>, Arc<FolderSync>)> {
    let partition = ready_partition().await?;
    let sync = memory_sync(partition.clone(), fs.clone(), debounce);
    fs.set_selection(Some(SHARED_DIR));
    sync.select_folder().await?;
    Ok((partition, sync))
}
