use std::sync::{Arc, Mutex, RwLock};

use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{info, warn};

use crate::collections::{ChangeFeed, Ledger};
use crate::db::{
    config_id_for, config_owner, Collection, StoreEngine, StoreError, LEGACY_CONFIG_ID,
};
use crate::user_active::{self, StoreHandle, ACTIVE_USER_KEY};
use crate::users::{self, User, DEFAULT_USER_NAME};

#[derive(Debug, Error)]
pub enum PartitionError {
    #[error("user data is not loaded yet")]
    NotReady,
    #[error("the last remaining user cannot be deleted")]
    LastUser,
    #[error("unknown user: {0}")]
    UnknownUser(String),
    #[error("user name must not be empty")]
    InvalidName,
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("failed to persist active user: {0}")]
    Pointer(#[source] anyhow::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionState {
    Uninitialized,
    Migrating,
    Ready,
}

/// What a migration pass changed. An all-default report means the data was
/// already in multi-user shape.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationReport {
    pub created_user: bool,
    pub stamped: usize,
    pub renamed_config: bool,
    pub active_changed: bool,
}

impl MigrationReport {
    /// Whether stored data was rewritten (pointer moves alone do not count).
    pub fn changed(&self) -> bool {
        self.created_user || self.stamped > 0 || self.renamed_config
    }
}

/// Owns the active user and the one-time upgrade of single-user data.
pub struct UserPartition {
    engine: Arc<StoreEngine>,
    prefs: StoreHandle,
    ledger: Arc<Ledger>,
    feed: ChangeFeed,
    state: Mutex<PartitionState>,
    active: RwLock<Option<String>>,
    migrate_lock: AsyncMutex<()>,
}

impl UserPartition {
    pub fn new(engine: Arc<StoreEngine>, prefs: StoreHandle, feed: ChangeFeed) -> Self {
        let ledger = Arc::new(Ledger::new(engine.clone(), feed.clone()));
        Self {
            engine,
            prefs,
            ledger,
            feed,
            state: Mutex::new(PartitionState::Uninitialized),
            active: RwLock::new(None),
            migrate_lock: AsyncMutex::new(()),
        }
    }

    pub fn state(&self) -> PartitionState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_state(&self, next: PartitionState) {
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = next;
    }

    pub fn ledger(&self) -> &Arc<Ledger> {
        &self.ledger
    }

    pub fn engine(&self) -> &Arc<StoreEngine> {
        &self.engine
    }

    pub fn feed(&self) -> &ChangeFeed {
        &self.feed
    }

    pub fn active_id(&self) -> Option<String> {
        self.active.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn set_active(&self, id: &str) {
        *self.active.write().unwrap_or_else(|e| e.into_inner()) = Some(id.to_string());
    }

    fn ensure_ready(&self) -> Result<(), PartitionError> {
        match self.state() {
            PartitionState::Ready => Ok(()),
            _ => Err(PartitionError::NotReady),
        }
    }

    /// Bring the partition to `Ready`. The store must already be open.
    /// Safe to call repeatedly; later calls return an empty report.
    pub async fn initialize(&self) -> Result<MigrationReport, PartitionError> {
        let _guard = self.migrate_lock.lock().await;
        if self.state() == PartitionState::Ready {
            return Ok(MigrationReport::default());
        }
        self.set_state(PartitionState::Migrating);

        let outcome = async {
            if let Some(pointer) = self.prefs.snapshot() {
                if users::find_user(&self.engine, &pointer).await?.is_some() {
                    info!(target: "libretto", event = "partition_fast_path", user_id = %pointer);
                    self.ledger.reload_all(&pointer).await?;
                    return Ok((pointer, MigrationReport::default()));
                }
            }
            let (user_id, report) = self.run_migration().await?;
            self.ledger.reload_all(&user_id).await?;
            Ok::<_, PartitionError>((user_id, report))
        }
        .await;

        match outcome {
            Ok((user_id, report)) => {
                self.set_active(&user_id);
                self.set_state(PartitionState::Ready);
                info!(
                    target: "libretto",
                    event = "partition_ready",
                    user_id = %user_id,
                    created_user = report.created_user,
                    stamped = report.stamped,
                    renamed_config = report.renamed_config
                );
                Ok(report)
            }
            Err(err) => {
                self.ledger.unload_all();
                self.set_state(PartitionState::Uninitialized);
                warn!(target: "libretto", event = "partition_init_failed", error = %err);
                Err(err)
            }
        }
    }

    /// Re-run the upgrade after an import replaced stored data, then reload
    /// the accessors. Stays `Ready` throughout.
    pub async fn migrate_after_import(&self) -> Result<MigrationReport, PartitionError> {
        self.ensure_ready()?;
        let _guard = self.migrate_lock.lock().await;
        let (user_id, report) = self.run_migration().await?;
        self.set_active(&user_id);
        self.ledger.reload_all(&user_id).await?;
        if report.changed() || report.active_changed {
            info!(
                target: "libretto",
                event = "partition_migrated_import",
                user_id = %user_id,
                created_user = report.created_user,
                stamped = report.stamped,
                renamed_config = report.renamed_config,
                active_changed = report.active_changed
            );
        }
        Ok(report)
    }

    /// Steps: ensure a user exists, stamp unowned records, rename the legacy
    /// config, persist the pointer. Everything but the pointer commits in one
    /// transaction.
    async fn run_migration(&self) -> Result<(String, MigrationReport), PartitionError> {
        let previous = self.active_id();
        let mut report = MigrationReport::default();
        let mut tx = self.engine.begin().await?;

        let existing = users::users_from_records(&tx.get_all(Collection::Users).await?)?;
        let pointer = self.prefs.snapshot();
        let user_id = match pointer
            .as_deref()
            .and_then(|p| existing.iter().find(|u| u.id == p))
            .or_else(|| existing.first())
        {
            Some(user) => user.id.clone(),
            None => {
                let user = User::new(DEFAULT_USER_NAME, None);
                tx.put(Collection::Users, &user.to_record()?).await?;
                report.created_user = true;
                user.id
            }
        };

        for collection in Collection::USER_DATA {
            for mut record in tx.get_unowned(collection).await? {
                record.set_user_id(&user_id);
                tx.put(collection, &record).await?;
                report.stamped += 1;
            }
        }
        // Config ids encode their owner; an unowned `config_<id>` goes back to
        // that owner, anything else is treated like the legacy singleton.
        let mut legacy_configs = Vec::new();
        for mut record in tx.get_unowned(Collection::Config).await? {
            match config_owner(record.id()).map(str::to_owned) {
                Some(owner) => {
                    record.set_user_id(&owner);
                    tx.put(Collection::Config, &record).await?;
                    report.stamped += 1;
                }
                None if record.id() == LEGACY_CONFIG_ID => {}
                None => legacy_configs.push(record),
            }
        }
        for stray in legacy_configs {
            tx.delete(Collection::Config, stray.id()).await?;
            let target = config_id_for(&user_id);
            if tx.get(Collection::Config, &target).await?.is_none() {
                let mut adopted = stray;
                adopted.set_id(&target);
                adopted.set_user_id(&user_id);
                tx.put(Collection::Config, &adopted).await?;
            }
            report.renamed_config = true;
        }

        if let Some(mut legacy) = tx.get(Collection::Config, LEGACY_CONFIG_ID).await? {
            let owner = legacy.user_id().unwrap_or(&user_id).to_string();
            let target = config_id_for(&owner);
            tx.delete(Collection::Config, LEGACY_CONFIG_ID).await?;
            if tx.get(Collection::Config, &target).await?.is_none() {
                legacy.set_id(&target);
                legacy.set_user_id(&owner);
                tx.put(Collection::Config, &legacy).await?;
            }
            report.renamed_config = true;
        }

        tx.commit().await?;

        if pointer.as_deref() != Some(user_id.as_str()) {
            self.prefs
                .put(ACTIVE_USER_KEY, Value::String(user_id.clone()))
                .map_err(PartitionError::Pointer)?;
        }
        report.active_changed = previous.as_deref() != Some(user_id.as_str());
        Ok((user_id, report))
    }

    /// Reload every accessor for the active user, e.g. after a backup import.
    pub async fn reload(&self) -> Result<(), PartitionError> {
        self.ensure_ready()?;
        let user_id = self.active_id().ok_or(PartitionError::NotReady)?;
        self.ledger.reload_all(&user_id).await?;
        Ok(())
    }

    pub async fn list_users(&self) -> Result<Vec<User>, PartitionError> {
        Ok(users::list_users(&self.engine).await?)
    }

    pub async fn active_user(&self) -> Result<User, PartitionError> {
        self.ensure_ready()?;
        let id = self.active_id().ok_or(PartitionError::NotReady)?;
        users::find_user(&self.engine, &id)
            .await?
            .ok_or(PartitionError::UnknownUser(id))
    }

    /// Make `id` the active user. Unknown ids are ignored and yield `false`.
    pub async fn switch_user(&self, id: &str) -> Result<bool, PartitionError> {
        self.ensure_ready()?;
        let switched = user_active::set_active_user_id(&self.engine, &self.prefs, id)
            .await
            .map_err(PartitionError::Pointer)?;
        if !switched {
            return Ok(false);
        }
        self.set_active(id);
        self.ledger.reload_all(id).await?;
        info!(target: "libretto", event = "active_user_switched", user_id = %id);
        Ok(true)
    }

    pub async fn create_user(
        &self,
        name: &str,
        accent_color: Option<String>,
    ) -> Result<User, PartitionError> {
        self.ensure_ready()?;
        if name.trim().is_empty() {
            return Err(PartitionError::InvalidName);
        }
        let user = User::new(name, accent_color);
        users::save_user(&self.engine, &user).await?;
        self.feed.notify("users");
        info!(target: "libretto", event = "user_created", user_id = %user.id);
        Ok(user)
    }

    pub async fn rename_user(&self, id: &str, name: &str) -> Result<User, PartitionError> {
        if name.trim().is_empty() {
            return Err(PartitionError::InvalidName);
        }
        self.update_user(id, |user| user.display_name = name.trim().to_string())
            .await
    }

    pub async fn set_accent_color(
        &self,
        id: &str,
        accent_color: Option<String>,
    ) -> Result<User, PartitionError> {
        self.update_user(id, |user| user.accent_color = accent_color)
            .await
    }

    async fn update_user<F>(&self, id: &str, apply: F) -> Result<User, PartitionError>
    where
        F: FnOnce(&mut User),
    {
        self.ensure_ready()?;
        let mut user = users::find_user(&self.engine, id)
            .await?
            .ok_or_else(|| PartitionError::UnknownUser(id.to_string()))?;
        apply(&mut user);
        users::save_user(&self.engine, &user).await?;
        self.feed.notify("users");
        Ok(user)
    }

    /// Delete a user with all of its records. If it was active, the oldest
    /// remaining user takes over.
    pub async fn delete_user(&self, id: &str) -> Result<(), PartitionError> {
        self.ensure_ready()?;
        let all = self.list_users().await?;
        if !all.iter().any(|u| u.id == id) {
            return Err(PartitionError::UnknownUser(id.to_string()));
        }
        if all.len() <= 1 {
            warn!(target: "libretto", event = "user_delete_rejected", reason = "last_user", user_id = %id);
            return Err(PartitionError::LastUser);
        }

        let removed = self.engine.delete_user_cascade(id).await?;
        info!(target: "libretto", event = "user_deleted", user_id = %id, records = removed);

        if self.active_id().as_deref() == Some(id) {
            // The pointer now names a deleted user, so this falls back to
            // the oldest remaining one and persists it.
            let next = user_active::get_active_user_id(&self.engine, &self.prefs)
                .await
                .map_err(PartitionError::Pointer)?
                .ok_or(PartitionError::LastUser)?;
            self.set_active(&next);
            self.ledger.reload_all(&next).await?;
            info!(target: "libretto", event = "active_user_switched", user_id = %next, reason = "deleted");
        }
        self.feed.notify("users");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Record;
    use serde_json::json;

    async fn partition() -> UserPartition {
        let engine = StoreEngine::in_memory();
        engine.open().await.expect("open");
        UserPartition::new(engine, StoreHandle::in_memory(), ChangeFeed::new())
    }

    async fn seed(engine: &StoreEngine, collection: Collection, value: serde_json::Value) {
        engine
            .put(
                collection,
                &Record::from_value(collection, value).expect("record"),
            )
            .await
            .expect("seed");
    }

    #[tokio::test]
    async fn fresh_store_gets_a_default_user() {
        let partition = partition().await;
        assert_eq!(partition.state(), PartitionState::Uninitialized);
        let report = partition.initialize().await.expect("init");
        assert!(report.created_user);
        assert_eq!(partition.state(), PartitionState::Ready);

        let users = partition.list_users().await.expect("users");
        assert_eq!(users.len(), 1);
        assert_eq!(users[0].display_name, DEFAULT_USER_NAME);
        assert_eq!(partition.active_id(), Some(users[0].id.clone()));
    }

    #[tokio::test]
    async fn legacy_data_is_stamped_and_config_renamed() {
        let partition = partition().await;
        let engine = partition.engine().clone();
        seed(&engine, Collection::Clients, json!({ "id": "c1", "nome": "ACME" })).await;
        seed(&engine, Collection::Invoices, json!({ "id": "f1" })).await;
        seed(&engine, Collection::Config, json!({ "id": "default", "regime": "forfettario" })).await;

        let report = partition.initialize().await.expect("init");
        let user_id = partition.active_id().expect("active");
        assert_eq!(report.stamped, 2);
        assert!(report.renamed_config);

        let config = engine
            .get(Collection::Config, &config_id_for(&user_id))
            .await
            .expect("get")
            .expect("renamed config");
        assert_eq!(config.user_id(), Some(user_id.as_str()));
        assert_eq!(config.get("regime"), Some(&json!("forfettario")));
        assert!(engine
            .get(Collection::Config, LEGACY_CONFIG_ID)
            .await
            .expect("get")
            .is_none());
        assert_eq!(partition.ledger().clients.list().expect("list").len(), 1);
    }

    #[tokio::test]
    async fn second_migration_is_a_no_op() {
        let partition = partition().await;
        seed(partition.engine(), Collection::WorkLogs, json!({ "id": "w1" })).await;
        partition.initialize().await.expect("init");
        let before = partition.engine().export_all().await.expect("export");

        let report = partition.migrate_after_import().await.expect("again");
        assert_eq!(report, MigrationReport::default());
        assert_eq!(partition.engine().export_all().await.expect("export"), before);
    }

    #[tokio::test]
    async fn switch_to_unknown_user_is_ignored() {
        let partition = partition().await;
        partition.initialize().await.expect("init");
        let active = partition.active_id();
        assert!(!partition.switch_user("ghost").await.expect("switch"));
        assert_eq!(partition.active_id(), active);
    }

    #[tokio::test]
    async fn operations_before_ready_are_rejected() {
        let partition = partition().await;
        assert!(matches!(
            partition.switch_user("x").await,
            Err(PartitionError::NotReady)
        ));
        assert!(matches!(
            partition.create_user("Anna", None).await,
            Err(PartitionError::NotReady)
        ));
    }

    #[tokio::test]
    async fn rename_rejects_blank_names() {
        let partition = partition().await;
        partition.initialize().await.expect("init");
        let id = partition.active_id().expect("active");
        assert!(matches!(
            partition.rename_user(&id, "   ").await,
            Err(PartitionError::InvalidName)
        ));
        let renamed = partition.rename_user(&id, " Giulia ").await.expect("rename");
        assert_eq!(renamed.display_name, "Giulia");
        let colored = partition
            .set_accent_color(&id, Some("#0af".into()))
            .await
            .expect("color");
        assert_eq!(colored.accent_color.as_deref(), Some("#0af"));
    }
}
