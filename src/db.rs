use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Row, Sqlite, SqliteConnection, SqlitePool, Transaction};
use thiserror::Error;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{error, info, warn};

use crate::migrate;
use crate::time::now_ms;

pub mod files;
pub mod records;
pub mod snapshot;

pub use files::{remove_database_files, write_atomic};
pub use records::{config_id_for, config_owner, Collection, Record, LEGACY_CONFIG_ID};
pub use snapshot::{SnapshotError, SyncSnapshot};

pub const DEFAULT_DB_FILE: &str = "libretto.sqlite3";
const DEFAULT_OPEN_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store is not open")]
    NotOpen,
    #[error("database is blocked by another connection after {attempts} attempts")]
    Blocked { attempts: usize },
    #[error("invalid record in {collection}: {reason}")]
    InvalidRecord {
        collection: &'static str,
        reason: String,
    },
    #[error("failed to apply migrations: {0}")]
    Migration(#[source] anyhow::Error),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("stored record is not valid json: {0}")]
    Decode(#[from] serde_json::Error),
}

#[derive(Debug, Clone)]
pub struct StoreOptions {
    /// Database file; `None` keeps everything in memory.
    pub path: Option<PathBuf>,
    /// Upper bound for connecting and applying migrations.
    pub open_timeout: Duration,
    /// How long a statement waits on a lock held by another connection.
    pub busy_timeout: Duration,
}

impl StoreOptions {
    pub fn file(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
            open_timeout: DEFAULT_OPEN_TIMEOUT,
            busy_timeout: DEFAULT_BUSY_TIMEOUT,
        }
    }

    pub fn in_memory() -> Self {
        Self {
            path: None,
            open_timeout: DEFAULT_OPEN_TIMEOUT,
            busy_timeout: DEFAULT_BUSY_TIMEOUT,
        }
    }
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self::in_memory()
    }
}

enum OpenFailure {
    Blocked {
        reason: String,
        lingering: Option<SqlitePool>,
    },
    Fatal(StoreError),
}

/// Row counts and schema version reported by `libretto status`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreStatus {
    pub path: Option<String>,
    pub schema_version: Option<String>,
    pub counts: BTreeMap<&'static str, i64>,
}

/// Durable, versioned record storage over a fixed set of collections.
///
/// The engine is created closed; [`StoreEngine::open`] connects and upgrades
/// the schema. Record operations fail with [`StoreError::NotOpen`] until then.
pub struct StoreEngine {
    options: StoreOptions,
    pool: RwLock<Option<SqlitePool>>,
    init: AsyncMutex<()>,
    open_attempts: AtomicUsize,
}

impl StoreEngine {
    pub fn new(options: StoreOptions) -> Arc<Self> {
        Arc::new(Self {
            options,
            pool: RwLock::new(None),
            init: AsyncMutex::new(()),
            open_attempts: AtomicUsize::new(0),
        })
    }

    pub fn in_memory() -> Arc<Self> {
        Self::new(StoreOptions::in_memory())
    }

    pub fn path(&self) -> Option<&Path> {
        self.options.path.as_deref()
    }

    /// Number of connection attempts made so far, recovery retries included.
    pub fn open_attempts(&self) -> usize {
        self.open_attempts.load(Ordering::SeqCst)
    }

    pub fn is_open(&self) -> bool {
        self.current().is_some()
    }

    fn current(&self) -> Option<SqlitePool> {
        self.pool.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn pool(&self) -> Result<SqlitePool, StoreError> {
        self.current().ok_or(StoreError::NotOpen)
    }

    /// Open the database. Idempotent; concurrent callers wait for the one
    /// attempt in flight instead of starting their own.
    pub async fn open(&self) -> Result<SqlitePool, StoreError> {
        if let Some(pool) = self.current() {
            return Ok(pool);
        }
        let _guard = self.init.lock().await;
        if let Some(pool) = self.current() {
            return Ok(pool);
        }

        let pool = self.open_with_recovery().await?;
        *self.pool.write().unwrap_or_else(|e| e.into_inner()) = Some(pool.clone());
        Ok(pool)
    }

    pub async fn close(&self) {
        let pool = self.pool.write().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(pool) = pool {
            pool.close().await;
            info!(target: "libretto", event = "db_closed");
        }
    }

    async fn open_with_recovery(&self) -> Result<SqlitePool, StoreError> {
        let lingering = match self.attempt().await {
            Ok(pool) => return Ok(pool),
            Err(OpenFailure::Fatal(err)) => return Err(err),
            Err(OpenFailure::Blocked { reason, lingering }) => {
                warn!(target: "libretto", event = "db_open_blocked", attempt = 1, reason = %reason);
                lingering
            }
        };

        if let Some(pool) = lingering {
            pool.close().await;
        }

        let reason = match self.attempt().await {
            Ok(pool) => return Ok(pool),
            Err(OpenFailure::Fatal(err)) => return Err(err),
            Err(OpenFailure::Blocked { reason, lingering }) => {
                if let Some(pool) = lingering {
                    pool.close().await;
                }
                reason
            }
        };

        let Some(path) = self.options.path.as_deref() else {
            return Err(StoreError::Blocked { attempts: 2 });
        };

        error!(
            target: "libretto",
            event = "db_recreated",
            path = %path.display(),
            reason = %reason,
            "database stayed blocked; deleting and recreating it"
        );
        remove_database_files(path)?;

        match self.attempt().await {
            Ok(pool) => Ok(pool),
            Err(OpenFailure::Fatal(err)) => Err(err),
            Err(OpenFailure::Blocked { lingering, .. }) => {
                if let Some(pool) = lingering {
                    pool.close().await;
                }
                Err(StoreError::Blocked { attempts: 3 })
            }
        }
    }

    async fn attempt(&self) -> Result<SqlitePool, OpenFailure> {
        let attempt = self.open_attempts.fetch_add(1, Ordering::SeqCst) + 1;
        let pool = match self.connect() {
            Ok(pool) => pool,
            Err(err) => return Err(OpenFailure::Fatal(err)),
        };

        let upgrade = async {
            // Force a real connection so locking problems surface here.
            pool.acquire().await?;
            migrate::apply_migrations(&pool).await
        };

        match tokio::time::timeout(self.options.open_timeout, upgrade).await {
            Ok(Ok(())) => {
                info!(
                    target: "libretto",
                    event = "db_open",
                    attempt,
                    path = %self.describe_path(),
                );
                Ok(pool)
            }
            Ok(Err(err)) if is_blocked(&err) => Err(OpenFailure::Blocked {
                reason: err.to_string(),
                lingering: Some(pool),
            }),
            Ok(Err(err)) => {
                pool.close().await;
                Err(OpenFailure::Fatal(into_store_error(err)))
            }
            Err(_) => Err(OpenFailure::Blocked {
                reason: format!("open exceeded {} ms", self.options.open_timeout.as_millis()),
                lingering: Some(pool),
            }),
        }
    }

    fn connect(&self) -> Result<SqlitePool, StoreError> {
        match &self.options.path {
            Some(path) => {
                if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                    std::fs::create_dir_all(parent)?;
                }
                let opts = SqliteConnectOptions::new()
                    .filename(path)
                    .create_if_missing(true)
                    .journal_mode(SqliteJournalMode::Wal)
                    .synchronous(SqliteSynchronous::Full)
                    .busy_timeout(self.options.busy_timeout);
                Ok(SqlitePoolOptions::new()
                    .max_connections(4)
                    .acquire_timeout(self.options.open_timeout)
                    .connect_lazy_with(opts))
            }
            None => {
                let opts = SqliteConnectOptions::from_str("sqlite::memory:")?
                    .busy_timeout(self.options.busy_timeout);
                // One long-lived connection: the in-memory database lives
                // exactly as long as it does.
                Ok(SqlitePoolOptions::new()
                    .max_connections(1)
                    .min_connections(1)
                    .idle_timeout(None)
                    .max_lifetime(None)
                    .acquire_timeout(self.options.open_timeout)
                    .connect_lazy_with(opts))
            }
        }
    }

    fn describe_path(&self) -> String {
        self.options
            .path
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| ":memory:".to_string())
    }

    pub async fn begin(&self) -> Result<StoreTx, StoreError> {
        let pool = self.pool()?;
        Ok(StoreTx {
            tx: pool.begin().await?,
        })
    }

    pub async fn get_all(&self, collection: Collection) -> Result<Vec<Record>, StoreError> {
        let pool = self.pool()?;
        let mut conn = pool.acquire().await?;
        fetch(&mut conn, collection, Filter::All).await
    }

    /// Records of one collection owned by `user_id`. For `users` this is the
    /// user's own row.
    pub async fn get_all_for_user(
        &self,
        collection: Collection,
        user_id: &str,
    ) -> Result<Vec<Record>, StoreError> {
        let pool = self.pool()?;
        let mut conn = pool.acquire().await?;
        fetch(&mut conn, collection, Filter::Owner(user_id)).await
    }

    pub async fn get(&self, collection: Collection, id: &str) -> Result<Option<Record>, StoreError> {
        let pool = self.pool()?;
        let mut conn = pool.acquire().await?;
        Ok(fetch(&mut conn, collection, Filter::Id(id))
            .await?
            .into_iter()
            .next())
    }

    pub async fn put(&self, collection: Collection, record: &Record) -> Result<(), StoreError> {
        let pool = self.pool()?;
        let mut conn = pool.acquire().await?;
        upsert(&mut conn, collection, record).await
    }

    /// Returns whether a record was removed.
    pub async fn delete(&self, collection: Collection, id: &str) -> Result<bool, StoreError> {
        let pool = self.pool()?;
        let mut conn = pool.acquire().await?;
        delete(&mut conn, collection, id).await
    }

    pub async fn clear(&self, collection: Collection) -> Result<(), StoreError> {
        let pool = self.pool()?;
        let mut conn = pool.acquire().await?;
        clear(&mut conn, collection).await
    }

    /// Every collection, users included.
    pub async fn export_all(&self) -> Result<SyncSnapshot, StoreError> {
        let pool = self.pool()?;
        let mut conn = pool.acquire().await?;
        let mut snapshot = SyncSnapshot::new();
        for collection in Collection::ALL {
            snapshot.insert(collection, fetch(&mut conn, collection, Filter::All).await?);
        }
        Ok(snapshot)
    }

    /// Every collection filtered to one user; `users` holds only that user.
    pub async fn export_for_user(&self, user_id: &str) -> Result<SyncSnapshot, StoreError> {
        let pool = self.pool()?;
        let mut conn = pool.acquire().await?;
        let mut snapshot = SyncSnapshot::new();
        for collection in Collection::ALL {
            snapshot.insert(
                collection,
                fetch(&mut conn, collection, Filter::Owner(user_id)).await?,
            );
        }
        Ok(snapshot)
    }

    /// Replace every collection present in `snapshot` with its contents.
    /// Collections missing from the snapshot are left alone. Either the whole
    /// snapshot lands or nothing does.
    pub async fn import_all(&self, snapshot: &SyncSnapshot) -> Result<(), StoreError> {
        let mut tx = self.begin().await?;
        for (collection, records) in snapshot.iter() {
            tx.clear(collection).await?;
            for record in records {
                tx.put(collection, record).await?;
            }
        }
        tx.commit().await?;
        info!(
            target: "libretto",
            event = "store_import_all",
            records = snapshot.record_count()
        );
        Ok(())
    }

    /// Delete a user and everything it owns in one transaction.
    pub async fn delete_user_cascade(&self, user_id: &str) -> Result<u64, StoreError> {
        let mut tx = self.begin().await?;
        let mut removed = 0;
        for collection in Collection::PARTITIONED {
            removed += tx.delete_owned_by(collection, user_id).await?;
        }
        tx.delete(Collection::Config, &config_id_for(user_id)).await?;
        tx.delete(Collection::Users, user_id).await?;
        tx.commit().await?;
        Ok(removed)
    }

    /// Swap one user's data for the contents of `snapshot`, reowned to
    /// `user_id`. Every data collection is replaced; one missing from the
    /// snapshot counts as empty. A config record becomes the user's config.
    /// Users and other owners' records are untouched.
    pub async fn replace_user_records(
        &self,
        user_id: &str,
        snapshot: &SyncSnapshot,
    ) -> Result<usize, StoreError> {
        let mut tx = self.begin().await?;
        let mut written = 0;
        for collection in Collection::USER_DATA {
            tx.delete_owned_by(collection, user_id).await?;
            for record in snapshot.get(collection).unwrap_or_default() {
                let mut record = record.clone();
                record.set_user_id(user_id);
                tx.put(collection, &record).await?;
                written += 1;
            }
        }
        if let Some(config) = snapshot.get(Collection::Config).and_then(|c| c.first()) {
            let mut config = config.clone();
            config.set_id(&config_id_for(user_id));
            config.set_user_id(user_id);
            tx.put(Collection::Config, &config).await?;
            written += 1;
        }
        tx.commit().await?;
        info!(
            target: "libretto",
            event = "store_replace_user_records",
            user_id = %user_id,
            records = written
        );
        Ok(written)
    }

    pub async fn status(&self) -> Result<StoreStatus, StoreError> {
        let pool = self.pool()?;
        let schema_version = migrate::current_version(&pool)
            .await
            .map_err(into_store_error)?;
        let mut counts = BTreeMap::new();
        for collection in Collection::ALL {
            let sql = format!("SELECT COUNT(*) FROM {}", collection.table());
            let count: i64 = sqlx::query_scalar(&sql).fetch_one(&pool).await?;
            counts.insert(collection.name(), count);
        }
        Ok(StoreStatus {
            path: self.options.path.as_ref().map(|p| p.display().to_string()),
            schema_version,
            counts,
        })
    }
}

/// A write transaction spanning any number of collections. Dropping it
/// without [`StoreTx::commit`] rolls back.
pub struct StoreTx {
    tx: Transaction<'static, Sqlite>,
}

impl StoreTx {
    pub async fn get_all(&mut self, collection: Collection) -> Result<Vec<Record>, StoreError> {
        fetch(&mut self.tx, collection, Filter::All).await
    }

    pub async fn get_unowned(&mut self, collection: Collection) -> Result<Vec<Record>, StoreError> {
        fetch(&mut self.tx, collection, Filter::Unowned).await
    }

    pub async fn get(
        &mut self,
        collection: Collection,
        id: &str,
    ) -> Result<Option<Record>, StoreError> {
        Ok(fetch(&mut self.tx, collection, Filter::Id(id))
            .await?
            .into_iter()
            .next())
    }

    pub async fn put(&mut self, collection: Collection, record: &Record) -> Result<(), StoreError> {
        upsert(&mut self.tx, collection, record).await
    }

    pub async fn delete(&mut self, collection: Collection, id: &str) -> Result<bool, StoreError> {
        delete(&mut self.tx, collection, id).await
    }

    pub async fn clear(&mut self, collection: Collection) -> Result<(), StoreError> {
        clear(&mut self.tx, collection).await
    }

    pub async fn delete_owned_by(
        &mut self,
        collection: Collection,
        user_id: &str,
    ) -> Result<u64, StoreError> {
        if !collection.is_partitioned() {
            return Ok(0);
        }
        let sql = format!("DELETE FROM {} WHERE user_id = ?", collection.table());
        let res = sqlx::query(&sql).bind(user_id).execute(&mut *self.tx).await?;
        Ok(res.rows_affected())
    }

    pub async fn commit(self) -> Result<(), StoreError> {
        self.tx.commit().await?;
        Ok(())
    }
}

enum Filter<'a> {
    All,
    Id(&'a str),
    Owner(&'a str),
    Unowned,
}

async fn fetch(
    conn: &mut SqliteConnection,
    collection: Collection,
    filter: Filter<'_>,
) -> Result<Vec<Record>, StoreError> {
    let table = collection.table();
    let (clause, bind) = match filter {
        Filter::All => ("", None),
        Filter::Id(id) => (" WHERE id = ?", Some(id)),
        Filter::Owner(user) if collection.is_partitioned() => (" WHERE user_id = ?", Some(user)),
        Filter::Owner(user) => (" WHERE id = ?", Some(user)),
        Filter::Unowned if collection.is_partitioned() => {
            (" WHERE user_id IS NULL OR user_id = ''", None)
        }
        Filter::Unowned => return Ok(Vec::new()),
    };
    let sql = format!("SELECT data FROM {table}{clause} ORDER BY rowid");
    let mut query = sqlx::query(&sql);
    if let Some(value) = bind {
        query = query.bind(value);
    }
    let rows = query.fetch_all(&mut *conn).await?;

    let mut records = Vec::with_capacity(rows.len());
    for row in rows {
        let data: String = row.try_get("data")?;
        let value: Value = serde_json::from_str(&data)?;
        records.push(Record::from_value(collection, value)?);
    }
    Ok(records)
}

async fn upsert(
    conn: &mut SqliteConnection,
    collection: Collection,
    record: &Record,
) -> Result<(), StoreError> {
    let data = serde_json::to_string(record.fields())?;
    let table = collection.table();
    if collection.is_partitioned() {
        let sql = format!(
            "INSERT INTO {table} (id, user_id, data, updated_at) VALUES (?, ?, ?, ?) \
             ON CONFLICT(id) DO UPDATE SET user_id = excluded.user_id, data = excluded.data, \
             updated_at = excluded.updated_at"
        );
        sqlx::query(&sql)
            .bind(record.id())
            .bind(record.user_id())
            .bind(&data)
            .bind(now_ms())
            .execute(&mut *conn)
            .await?;
    } else {
        let sql = format!(
            "INSERT INTO {table} (id, data, updated_at) VALUES (?, ?, ?) \
             ON CONFLICT(id) DO UPDATE SET data = excluded.data, updated_at = excluded.updated_at"
        );
        sqlx::query(&sql)
            .bind(record.id())
            .bind(&data)
            .bind(now_ms())
            .execute(&mut *conn)
            .await?;
    }
    Ok(())
}

async fn delete(
    conn: &mut SqliteConnection,
    collection: Collection,
    id: &str,
) -> Result<bool, StoreError> {
    let sql = format!("DELETE FROM {} WHERE id = ?", collection.table());
    let res = sqlx::query(&sql).bind(id).execute(&mut *conn).await?;
    Ok(res.rows_affected() > 0)
}

async fn clear(conn: &mut SqliteConnection, collection: Collection) -> Result<(), StoreError> {
    let sql = format!("DELETE FROM {}", collection.table());
    sqlx::query(&sql).execute(&mut *conn).await?;
    Ok(())
}

fn is_blocked_sqlx(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::PoolTimedOut => true,
        sqlx::Error::Database(db) => db
            .code()
            .and_then(|code| code.parse::<i64>().ok())
            // SQLITE_BUSY and SQLITE_LOCKED, extended codes included.
            .map(|code| matches!(code & 0xff, 5 | 6))
            .unwrap_or(false),
        _ => false,
    }
}

fn is_blocked(err: &anyhow::Error) -> bool {
    err.chain()
        .filter_map(|cause| cause.downcast_ref::<sqlx::Error>())
        .any(is_blocked_sqlx)
}

fn into_store_error(err: anyhow::Error) -> StoreError {
    match err.downcast::<sqlx::Error>() {
        Ok(sqlx_err) => StoreError::Database(sqlx_err),
        Err(other) => StoreError::Migration(other),
    }
}
