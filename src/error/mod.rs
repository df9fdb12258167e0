use std::collections::HashMap;
use std::error::Error as StdError;
use std::fmt;

use anyhow::Error as AnyhowError;
use serde::{Deserialize, Serialize};
use serde_json::Error as SerdeJsonError;
use sqlx::Error as SqlxError;
use std::io::Error as IoError;

use crate::backup::BackupError;
use crate::config::ConfigError;
use crate::db::snapshot::SnapshotError;
use crate::db::StoreError;
use crate::partition::PartitionError;
use crate::sync::{FsError, SyncError};

/// A structured application error that can be serialized and surfaced to the UI.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppError {
    /// Machine readable error code.
    pub code: String,
    /// Human friendly message that can be shown directly to the user.
    pub message: String,
    /// Arbitrary key/value pairs that provide additional context.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub context: HashMap<String, String>,
    /// Optional nested cause that preserves the error chain.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<Box<AppError>>,
}

pub type AppResult<T> = std::result::Result<T, AppError>;

impl AppError {
    /// Default code used when an upstream error does not expose a specific code.
    pub const UNKNOWN_CODE: &'static str = "APP/UNKNOWN";
    /// Code used for errors created from free-form messages.
    pub const GENERIC_CODE: &'static str = "APP/GENERIC";

    /// Construct a new application error with the provided code and message.
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        AppError {
            code: code.into(),
            message: message.into(),
            context: HashMap::new(),
            cause: None,
        }
    }

    pub fn code(&self) -> &str {
        &self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn context(&self) -> &HashMap<String, String> {
        &self.context
    }

    pub fn cause(&self) -> Option<&AppError> {
        self.cause.as_deref()
    }

    /// Adds a contextual key/value pair to the error.
    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    /// Sets the nested cause for the error.
    pub fn with_cause(mut self, cause: impl Into<AppError>) -> Self {
        self.cause = Some(Box::new(cause.into()));
        self
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.context.is_empty() {
            write!(f, "[{}] {}", self.code, self.message)
        } else {
            write!(f, "[{}] {} ({:?})", self.code, self.message, self.context)
        }
    }
}

impl std::error::Error for AppError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.cause
            .as_deref()
            .map(|cause| cause as &(dyn std::error::Error + 'static))
    }
}

impl From<&str> for AppError {
    fn from(message: &str) -> Self {
        AppError::new(AppError::GENERIC_CODE, message)
    }
}

impl From<String> for AppError {
    fn from(message: String) -> Self {
        AppError::new(AppError::GENERIC_CODE, message)
    }
}

impl From<AnyhowError> for AppError {
    fn from(error: AnyhowError) -> Self {
        fn convert(err: &(dyn StdError + 'static)) -> AppError {
            if let Some(app) = err.downcast_ref::<AppError>() {
                return app.clone();
            }

            let mut root = AppError::new(AppError::UNKNOWN_CODE, err.to_string());
            if let Some(source) = err.source() {
                root.cause = Some(Box::new(convert(source)));
            }
            root
        }

        convert(error.as_ref())
    }
}

impl From<IoError> for AppError {
    fn from(error: IoError) -> Self {
        let code = format!("IO/{:?}", error.kind());
        let mut app_error = AppError::new(code, error.to_string());
        if let Some(os_code) = error.raw_os_error() {
            app_error = app_error.with_context("os_code", os_code.to_string());
        }
        app_error
    }
}

impl From<SerdeJsonError> for AppError {
    fn from(error: SerdeJsonError) -> Self {
        let code = if error.is_data() {
            "JSON/DATA"
        } else if error.is_syntax() {
            "JSON/SYNTAX"
        } else if error.is_eof() {
            "JSON/EOF"
        } else if error.is_io() {
            "JSON/IO"
        } else {
            "JSON/ERROR"
        };

        let mut app_error = AppError::new(code, error.to_string());
        let line = error.line();
        if line > 0 {
            app_error = app_error.with_context("line", line.to_string());
        }
        let column = error.column();
        if column > 0 {
            app_error = app_error.with_context("column", column.to_string());
        }
        app_error
    }
}

impl From<SqlxError> for AppError {
    fn from(error: SqlxError) -> Self {
        match error {
            SqlxError::RowNotFound => AppError::new("SQLX/ROW_NOT_FOUND", "Record not found"),
            SqlxError::PoolTimedOut => AppError::new(
                "SQLX/POOL_TIMEOUT",
                "Timed out acquiring a database connection",
            ),
            SqlxError::PoolClosed => AppError::new("SQLX/POOL_CLOSED", "Database pool is closed"),
            SqlxError::Io(err) => AppError::from(err).with_context("source", "sqlx"),
            SqlxError::Database(db) => {
                let code = db
                    .code()
                    .map(|code| format!("Sqlite/{code}"))
                    .unwrap_or_else(|| "SQLX/DATABASE".to_string());
                AppError::new(code, db.message().to_string())
            }
            other => AppError::new("SQLX/ERROR", other.to_string()),
        }
    }
}

impl From<StoreError> for AppError {
    fn from(error: StoreError) -> Self {
        match error {
            StoreError::NotOpen => {
                AppError::new("STORE/NOT_OPEN", "The local database is not open yet.")
            }
            StoreError::Blocked { attempts } => AppError::new(
                "STORE/BLOCKED",
                "The local database is locked by another process.",
            )
            .with_context("attempts", attempts.to_string()),
            StoreError::InvalidRecord { collection, reason } => {
                AppError::new("STORE/INVALID_RECORD", reason).with_context("collection", collection)
            }
            StoreError::Migration(err) => {
                AppError::new("STORE/MIGRATION", "Database schema upgrade failed.").with_cause(err)
            }
            StoreError::Database(err) => AppError::from(err),
            StoreError::Io(err) => AppError::from(err),
            StoreError::Decode(err) => AppError::new("STORE/DECODE", "Stored record is corrupt.")
                .with_cause(AppError::from(err)),
        }
    }
}

impl From<SnapshotError> for AppError {
    fn from(error: SnapshotError) -> Self {
        let app_error = AppError::new(
            "SNAPSHOT/MALFORMED",
            "The data file is not a valid Libretto snapshot.",
        );
        match error {
            SnapshotError::Parse(err) => app_error.with_cause(AppError::from(err)),
            SnapshotError::NotAnObject => app_error.with_context("reason", "not_an_object"),
            SnapshotError::NotAnArray { collection } => app_error
                .with_context("reason", "not_an_array")
                .with_context("collection", collection),
            SnapshotError::InvalidRecord {
                collection,
                index,
                reason,
            } => app_error
                .with_context("reason", reason)
                .with_context("collection", collection)
                .with_context("index", index.to_string()),
        }
    }
}

impl From<PartitionError> for AppError {
    fn from(error: PartitionError) -> Self {
        match error {
            PartitionError::NotReady => AppError::new(
                "USERS/NOT_READY",
                "User data is still being prepared.",
            ),
            PartitionError::LastUser => AppError::new(
                "USERS/LAST_USER",
                "The last remaining user cannot be deleted.",
            ),
            PartitionError::UnknownUser(id) => {
                AppError::new("USERS/NOT_FOUND", "User not found.").with_context("id", id)
            }
            PartitionError::InvalidName => {
                AppError::new("USERS/INVALID_NAME", "User names cannot be empty.")
            }
            PartitionError::Store(err) => AppError::from(err),
            PartitionError::Pointer(err) => AppError::new(
                "USERS/POINTER",
                "The active user selection could not be saved.",
            )
            .with_cause(err),
        }
    }
}

impl From<FsError> for AppError {
    fn from(error: FsError) -> Self {
        match error {
            FsError::PermissionDenied => AppError::new(
                "SYNC/PERMISSION_DENIED",
                "Access to the sync folder was revoked. Choose the folder again.",
            ),
            FsError::Io(err) => AppError::from(err).with_context("source", "sync_folder"),
        }
    }
}

impl From<SyncError> for AppError {
    fn from(error: SyncError) -> Self {
        match error {
            SyncError::Fs(err) => AppError::from(err),
            SyncError::Snapshot(err) => AppError::from(err),
            SyncError::Store(err) => AppError::from(err),
            SyncError::Partition(err) => AppError::from(err),
            SyncError::HandleStore(err) => AppError::new(
                "SYNC/HANDLE_STORE",
                "The sync folder selection could not be saved.",
            )
            .with_cause(err),
        }
    }
}

impl From<BackupError> for AppError {
    fn from(error: BackupError) -> Self {
        match error {
            BackupError::Io(err) => AppError::from(err).with_context("source", "backup"),
            BackupError::Snapshot(err) => AppError::from(err),
            BackupError::Store(err) => AppError::from(err),
            BackupError::Partition(err) => AppError::from(err),
            BackupError::UnknownUser(id) => {
                AppError::new("USERS/NOT_FOUND", "User not found.").with_context("id", id)
            }
        }
    }
}

impl From<ConfigError> for AppError {
    fn from(error: ConfigError) -> Self {
        AppError::new("CONFIG/INVALID", error.to_string())
    }
}
