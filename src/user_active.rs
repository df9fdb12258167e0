use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::Context;
use serde_json::{Map, Value};
use tracing::{info, warn};

use crate::db::{write_atomic, StoreEngine};
use crate::users;

pub const ACTIVE_USER_KEY: &str = "activeUserId";
pub const PREFS_FILE: &str = "prefs.json";

trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Option<Value>;
    fn set(&self, key: &str, value: Value);
    fn remove(&self, key: &str);
    fn save(&self) -> anyhow::Result<()>;
}

/// Small JSON document on disk, loaded once and rewritten atomically on save.
struct JsonFileStore {
    path: PathBuf,
    data: Mutex<Map<String, Value>>,
}

impl JsonFileStore {
    fn load(path: PathBuf) -> anyhow::Result<Self> {
        let data = match fs::read_to_string(&path) {
            Ok(raw) => match serde_json::from_str::<Value>(&raw) {
                Ok(Value::Object(map)) => map,
                Ok(_) | Err(_) => {
                    warn!(
                        target: "libretto",
                        event = "kv_store_corrupt",
                        path = %path.display()
                    );
                    Map::new()
                }
            },
            Err(err) if err.kind() == io::ErrorKind::NotFound => Map::new(),
            Err(err) => {
                return Err(err).with_context(|| format!("read {}", path.display()));
            }
        };
        Ok(Self {
            path,
            data: Mutex::new(data),
        })
    }
}

impl KeyValueStore for JsonFileStore {
    fn get(&self, key: &str) -> Option<Value> {
        self.data
            .lock()
            .map(|guard| guard.get(key).cloned())
            .unwrap_or_default()
    }

    fn set(&self, key: &str, value: Value) {
        if let Ok(mut guard) = self.data.lock() {
            guard.insert(key.to_string(), value);
        }
    }

    fn remove(&self, key: &str) {
        if let Ok(mut guard) = self.data.lock() {
            guard.remove(key);
        }
    }

    fn save(&self) -> anyhow::Result<()> {
        let body = {
            let guard = self
                .data
                .lock()
                .map_err(|_| anyhow::anyhow!("key-value store lock poisoned"))?;
            serde_json::to_vec_pretty(&*guard)?
        };
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create {}", parent.display()))?;
        }
        write_atomic(&self.path, &body).with_context(|| format!("write {}", self.path.display()))
    }
}

#[derive(Default)]
struct MemoryStore {
    data: Mutex<HashMap<String, Value>>,
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Option<Value> {
        self.data
            .lock()
            .map(|guard| guard.get(key).cloned())
            .unwrap_or_default()
    }

    fn set(&self, key: &str, value: Value) {
        if let Ok(mut guard) = self.data.lock() {
            guard.insert(key.to_string(), value);
        }
    }

    fn remove(&self, key: &str) {
        if let Ok(mut guard) = self.data.lock() {
            guard.remove(key);
        }
    }

    fn save(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Durable key-value store kept outside the database: the active-user
/// pointer and the sync folder handle live here.
#[derive(Clone)]
pub struct StoreHandle {
    inner: Arc<dyn KeyValueStore + Send + Sync>,
}

impl StoreHandle {
    pub fn file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        Ok(Self {
            inner: Arc::new(JsonFileStore::load(path.as_ref().to_path_buf())?),
        })
    }

    pub fn in_memory() -> Self {
        Self {
            inner: Arc::new(MemoryStore::default()),
        }
    }

    pub fn get_value(&self, key: &str) -> Option<Value> {
        self.inner.get(key)
    }

    pub fn get_string(&self, key: &str) -> Option<String> {
        self.inner
            .get(key)
            .and_then(|value| value.as_str().map(str::to_owned))
    }

    /// Set and persist in one step.
    pub fn put(&self, key: &str, value: Value) -> anyhow::Result<()> {
        self.inner.set(key, value);
        self.inner.save()
    }

    /// Remove and persist in one step.
    pub fn remove(&self, key: &str) -> anyhow::Result<()> {
        self.inner.remove(key);
        self.inner.save()
    }

    /// Current active-user pointer, unvalidated.
    pub fn snapshot(&self) -> Option<String> {
        self.get_string(ACTIVE_USER_KEY).filter(|id| !id.is_empty())
    }
}

/// Resolve the active user: the stored pointer when it names an existing
/// user, otherwise the oldest user, persisted as the new pointer. `None`
/// only while no user exists yet.
pub async fn get_active_user_id(
    engine: &StoreEngine,
    store: &StoreHandle,
) -> anyhow::Result<Option<String>> {
    let reason = match store.snapshot() {
        Some(candidate) => {
            if users::find_user(engine, &candidate).await?.is_some() {
                return Ok(Some(candidate));
            }
            "not_found"
        }
        None => "missing",
    };

    let Some(fallback) = users::oldest_user(engine).await? else {
        return Ok(None);
    };
    store
        .put(ACTIVE_USER_KEY, Value::String(fallback.id.clone()))
        .context("persist fallback active user")?;
    info!(
        target: "libretto",
        event = "active_user_fallback",
        reason,
        chosen_id = %fallback.id
    );
    Ok(Some(fallback.id))
}

/// Point the active user at `id`. Returns `false` without touching the
/// pointer when no such user exists.
pub async fn set_active_user_id(
    engine: &StoreEngine,
    store: &StoreHandle,
    id: &str,
) -> anyhow::Result<bool> {
    if users::find_user(engine, id).await?.is_none() {
        warn!(
            target: "libretto",
            event = "active_user_set_rejected",
            reason = "not_found",
            id = %id
        );
        return Ok(false);
    }
    store
        .put(ACTIVE_USER_KEY, Value::String(id.to_string()))
        .context("persist active user selection")?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    #[test]
    fn file_store_persists_across_reloads() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join(PREFS_FILE);

        let store = StoreHandle::file(&path).expect("open");
        assert_eq!(store.snapshot(), None);
        store
            .put(ACTIVE_USER_KEY, json!("u1"))
            .expect("persist pointer");

        let reopened = StoreHandle::file(&path).expect("reopen");
        assert_eq!(reopened.snapshot().as_deref(), Some("u1"));

        reopened.remove(ACTIVE_USER_KEY).expect("remove");
        let again = StoreHandle::file(&path).expect("reopen again");
        assert_eq!(again.snapshot(), None);
    }

    #[test]
    fn corrupt_file_starts_empty() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join(PREFS_FILE);
        fs::write(&path, b"{ not json").expect("seed");
        let store = StoreHandle::file(&path).expect("open");
        assert_eq!(store.get_value(ACTIVE_USER_KEY), None);
    }

    #[test]
    fn empty_pointer_is_treated_as_missing() {
        let store = StoreHandle::in_memory();
        store.put(ACTIVE_USER_KEY, json!("")).expect("put");
        assert_eq!(store.snapshot(), None);
    }
}
