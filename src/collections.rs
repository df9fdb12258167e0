use std::sync::{Arc, RwLock};

use serde_json::Value;
use tokio::sync::watch;
use tracing::debug;

use crate::db::{config_id_for, Collection, Record, StoreEngine, StoreError};
use crate::id::new_uuid_v7;
use crate::partition::PartitionError;

/// Monotonic counter bumped on every local mutation. The folder sync
/// propagator watches it to know when to write.
#[derive(Clone)]
pub struct ChangeFeed {
    tx: Arc<watch::Sender<u64>>,
}

impl Default for ChangeFeed {
    fn default() -> Self {
        Self::new()
    }
}

impl ChangeFeed {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(0);
        Self { tx: Arc::new(tx) }
    }

    pub fn notify(&self, reason: &'static str) {
        self.tx.send_modify(|generation| *generation += 1);
        debug!(target: "libretto", event = "local_change", reason, generation = *self.tx.borrow());
    }

    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.tx.subscribe()
    }

    pub fn generation(&self) -> u64 {
        *self.tx.borrow()
    }
}

#[derive(Default)]
struct Mirror {
    user_id: Option<String>,
    records: Vec<Record>,
}

/// Read/write helper for one partitioned collection, scoped to the active
/// user. Keeps a single in-memory mirror of that user's records.
pub struct CollectionAccessor {
    collection: Collection,
    engine: Arc<StoreEngine>,
    feed: ChangeFeed,
    mirror: RwLock<Mirror>,
}

impl CollectionAccessor {
    fn new(collection: Collection, engine: Arc<StoreEngine>, feed: ChangeFeed) -> Self {
        Self {
            collection,
            engine,
            feed,
            mirror: RwLock::new(Mirror::default()),
        }
    }

    pub fn collection(&self) -> Collection {
        self.collection
    }

    /// Replace the mirror with `user_id`'s records from the store.
    pub async fn reload(&self, user_id: &str) -> Result<(), StoreError> {
        let records = self
            .engine
            .get_all_for_user(self.collection, user_id)
            .await?;
        let mut mirror = self.mirror.write().unwrap_or_else(|e| e.into_inner());
        mirror.user_id = Some(user_id.to_string());
        mirror.records = records;
        Ok(())
    }

    pub(crate) fn unload(&self) {
        *self.mirror.write().unwrap_or_else(|e| e.into_inner()) = Mirror::default();
    }

    fn owner(&self) -> Result<String, PartitionError> {
        self.mirror
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .user_id
            .clone()
            .ok_or(PartitionError::NotReady)
    }

    pub fn list(&self) -> Result<Vec<Record>, PartitionError> {
        let mirror = self.mirror.read().unwrap_or_else(|e| e.into_inner());
        if mirror.user_id.is_none() {
            return Err(PartitionError::NotReady);
        }
        Ok(mirror.records.clone())
    }

    pub fn get(&self, id: &str) -> Result<Option<Record>, PartitionError> {
        Ok(self.list()?.into_iter().find(|record| record.id() == id))
    }

    /// Insert or update a record for the active user. A missing `id` is
    /// generated; `userId` is always overwritten with the active user.
    pub async fn save(&self, value: Value) -> Result<Record, PartitionError> {
        let owner = self.owner()?;
        let mut value = value;
        if let Value::Object(map) = &mut value {
            if !map.contains_key("id") {
                map.insert("id".into(), Value::String(new_uuid_v7()));
            }
        }
        let mut record = Record::from_value(self.collection, value)?;
        record.set_user_id(&owner);
        self.write(&owner, record).await
    }

    async fn write(&self, owner: &str, record: Record) -> Result<Record, PartitionError> {
        self.engine.put(self.collection, &record).await?;
        {
            let mut mirror = self.mirror.write().unwrap_or_else(|e| e.into_inner());
            if mirror.user_id.as_deref() == Some(owner) {
                match mirror.records.iter_mut().find(|r| r.id() == record.id()) {
                    Some(existing) => *existing = record.clone(),
                    None => mirror.records.push(record.clone()),
                }
            }
        }
        self.feed.notify(self.collection.name());
        Ok(record)
    }

    /// Delete one of the active user's records. Records owned by someone
    /// else are left alone and reported as not found.
    pub async fn delete(&self, id: &str) -> Result<bool, PartitionError> {
        if self.get(id)?.is_none() {
            return Ok(false);
        }
        let removed = self.engine.delete(self.collection, id).await?;
        self.mirror
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .records
            .retain(|record| record.id() != id);
        if removed {
            self.feed.notify(self.collection.name());
        }
        Ok(removed)
    }
}

/// The per-user configuration record, keyed `config_<userId>`.
pub struct ConfigAccessor {
    inner: CollectionAccessor,
}

impl ConfigAccessor {
    pub fn current(&self) -> Result<Option<Record>, PartitionError> {
        Ok(self.inner.list()?.into_iter().next())
    }

    /// Store `value` as the active user's configuration.
    pub async fn save(&self, value: Value) -> Result<Record, PartitionError> {
        let owner = self.inner.owner()?;
        let mut value = value;
        if let Value::Object(map) = &mut value {
            map.insert("id".into(), Value::String(config_id_for(&owner)));
            map.remove("userId");
        }
        let mut record = Record::from_value(Collection::Config, value)?;
        record.set_user_id(&owner);
        self.inner.write(&owner, record).await
    }
}

/// Accessors for every partitioned collection.
pub struct Ledger {
    pub config: ConfigAccessor,
    pub clients: CollectionAccessor,
    pub invoices: CollectionAccessor,
    pub work_logs: CollectionAccessor,
    pub deadlines: CollectionAccessor,
}

impl Ledger {
    pub fn new(engine: Arc<StoreEngine>, feed: ChangeFeed) -> Self {
        let accessor = |c| CollectionAccessor::new(c, engine.clone(), feed.clone());
        Self {
            config: ConfigAccessor {
                inner: accessor(Collection::Config),
            },
            clients: accessor(Collection::Clients),
            invoices: accessor(Collection::Invoices),
            work_logs: accessor(Collection::WorkLogs),
            deadlines: accessor(Collection::Deadlines),
        }
    }

    /// Data accessor for a collection name; `None` for `config` and `users`.
    pub fn accessor(&self, collection: Collection) -> Option<&CollectionAccessor> {
        match collection {
            Collection::Clients => Some(&self.clients),
            Collection::Invoices => Some(&self.invoices),
            Collection::WorkLogs => Some(&self.work_logs),
            Collection::Deadlines => Some(&self.deadlines),
            Collection::Config | Collection::Users => None,
        }
    }

    fn all(&self) -> [&CollectionAccessor; 5] {
        [
            &self.config.inner,
            &self.clients,
            &self.invoices,
            &self.work_logs,
            &self.deadlines,
        ]
    }

    pub async fn reload_all(&self, user_id: &str) -> Result<(), StoreError> {
        for accessor in self.all() {
            accessor.reload(user_id).await?;
        }
        Ok(())
    }

    pub(crate) fn unload_all(&self) {
        for accessor in self.all() {
            accessor.unload();
        }
    }
}
