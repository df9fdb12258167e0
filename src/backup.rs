use std::io;
use std::path::{Path, PathBuf};

use serde::Serialize;
use thiserror::Error;
use tokio::task;
use tracing::info;

use crate::db::snapshot::SnapshotError;
use crate::db::{write_atomic, Collection, StoreEngine, StoreError, SyncSnapshot};
use crate::partition::{PartitionError, UserPartition};
use crate::users;

#[derive(Debug, Error)]
pub enum BackupError {
    #[error("backup file io error: {0}")]
    Io(#[from] io::Error),
    #[error(transparent)]
    Snapshot(#[from] SnapshotError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Partition(#[from] PartitionError),
    #[error("unknown user: {0}")]
    UnknownUser(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportSummary {
    pub user_id: String,
    pub records: usize,
}

/// One user's data in the sync file format.
pub async fn export_backup(
    engine: &StoreEngine,
    user_id: &str,
) -> Result<SyncSnapshot, BackupError> {
    if users::find_user(engine, user_id).await?.is_none() {
        return Err(BackupError::UnknownUser(user_id.to_string()));
    }
    Ok(engine.export_for_user(user_id).await?)
}

/// Write `snapshot` to `path` as pretty JSON. An existing file is replaced
/// atomically.
pub async fn write_backup(path: &Path, snapshot: &SyncSnapshot) -> Result<(), BackupError> {
    let body = snapshot.to_json_pretty()?;
    let target: PathBuf = path.to_path_buf();
    task::spawn_blocking(move || {
        if let Some(parent) = target.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        write_atomic(&target, body.as_bytes())
    })
    .await
    .map_err(|err| io::Error::new(io::ErrorKind::Other, err))??;
    info!(
        target: "libretto",
        event = "backup_written",
        path = %path.display(),
        records = snapshot.record_count()
    );
    Ok(())
}

/// Read and validate a backup file in full.
pub async fn read_backup(path: &Path) -> Result<SyncSnapshot, BackupError> {
    let raw = tokio::fs::read_to_string(path).await?;
    Ok(SyncSnapshot::from_json(&raw)?)
}

/// Replace `user_id`'s data with the backup's. Every record is reowned to
/// that user; the backup's `users` array is ignored.
pub async fn import_backup(
    partition: &UserPartition,
    user_id: &str,
    snapshot: &SyncSnapshot,
) -> Result<ImportSummary, BackupError> {
    let engine = partition.engine();
    if users::find_user(engine, user_id).await?.is_none() {
        return Err(BackupError::UnknownUser(user_id.to_string()));
    }
    let records = engine.replace_user_records(user_id, snapshot).await?;
    if partition.active_id().as_deref() == Some(user_id) {
        partition.reload().await?;
    }
    partition.feed().notify("backup_import");
    info!(
        target: "libretto",
        event = "backup_imported",
        user_id = %user_id,
        records,
        ignored_users = snapshot.get(Collection::Users).map_or(0, <[_]>::len)
    );
    Ok(ImportSummary {
        user_id: user_id.to_string(),
        records,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collections::ChangeFeed;
    use crate::user_active::StoreHandle;
    use serde_json::json;
    use std::sync::Arc;
    use tempfile::tempdir;

    async fn ready() -> Arc<UserPartition> {
        let engine = StoreEngine::in_memory();
        engine.open().await.expect("open");
        let partition = Arc::new(UserPartition::new(
            engine,
            StoreHandle::in_memory(),
            ChangeFeed::new(),
        ));
        partition.initialize().await.expect("init");
        partition
    }

    #[tokio::test]
    async fn malformed_backup_is_rejected_before_anything_changes() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("backup.json");
        std::fs::write(&path, r#"{ "fatture": [ { "numero": 1 } ] }"#).expect("seed");
        let err = read_backup(&path).await.expect_err("invalid");
        assert!(matches!(
            err,
            BackupError::Snapshot(SnapshotError::InvalidRecord { .. })
        ));
    }

    #[tokio::test]
    async fn import_reowns_records_and_adopts_config() {
        let partition = ready().await;
        let user_id = partition.active_id().expect("active");
        partition
            .ledger()
            .clients
            .save(json!({ "id": "old", "nome": "Gone" }))
            .await
            .expect("save");

        let snapshot = SyncSnapshot::from_value(json!({
            "clienti": [ { "id": "c9", "userId": "someone-else", "nome": "Nuovo" } ],
            "config": [ { "id": "config_someone-else", "userId": "someone-else", "aliquota": 15 } ],
            "users": [ { "id": "someone-else", "nome": "Ignored" } ]
        }))
        .expect("snapshot");

        let before = partition.feed().generation();
        let summary = import_backup(&partition, &user_id, &snapshot)
            .await
            .expect("import");
        assert_eq!(summary.records, 2);
        assert!(partition.feed().generation() > before);

        let clients = partition.ledger().clients.list().expect("list");
        assert_eq!(clients.len(), 1);
        assert_eq!(clients[0].id(), "c9");
        assert_eq!(clients[0].user_id(), Some(user_id.as_str()));

        let config = partition
            .ledger()
            .config
            .current()
            .expect("config")
            .expect("adopted");
        assert_eq!(config.get("aliquota"), Some(&json!(15)));
        assert_eq!(partition.list_users().await.expect("users").len(), 1);
    }

    #[tokio::test]
    async fn unknown_user_is_rejected() {
        let partition = ready().await;
        let err = import_backup(&partition, "ghost", &SyncSnapshot::new())
            .await
            .expect_err("unknown");
        assert!(matches!(err, BackupError::UnknownUser(_)));
    }
}
