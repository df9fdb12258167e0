use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::db::{StoreOptions, DEFAULT_DB_FILE};
use crate::sync::{SyncOptions, DEFAULT_DEBOUNCE, SYNC_FILE_NAME};

pub const DATA_DIR_ENV: &str = "LIBRETTO_DATA_DIR";
pub const DEBOUNCE_ENV: &str = "LIBRETTO_DEBOUNCE_MS";
pub const OPEN_TIMEOUT_ENV: &str = "LIBRETTO_OPEN_TIMEOUT_MS";
pub const BUSY_TIMEOUT_ENV: &str = "LIBRETTO_BUSY_TIMEOUT_MS";
const APP_DIR_NAME: &str = "libretto";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{var} must be a whole number of milliseconds, got {value:?}")]
    InvalidNumber { var: &'static str, value: String },
    #[error("no data directory available; set {DATA_DIR_ENV}")]
    NoDataDir,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub data_dir: PathBuf,
    pub db_file: String,
    pub sync_file_name: String,
    pub debounce: Duration,
    pub open_timeout: Duration,
    pub busy_timeout: Duration,
    pub log_dir: Option<PathBuf>,
}

impl AppConfig {
    /// Defaults rooted at `data_dir`.
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        let data_dir = data_dir.into();
        let store = StoreOptions::default();
        Self {
            log_dir: Some(data_dir.join("logs")),
            data_dir,
            db_file: DEFAULT_DB_FILE.to_string(),
            sync_file_name: SYNC_FILE_NAME.to_string(),
            debounce: DEFAULT_DEBOUNCE,
            open_timeout: store.open_timeout,
            busy_timeout: store.busy_timeout,
        }
    }

    /// Defaults overridden by the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`AppConfig::from_env`] with an injectable variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let data_dir = match lookup(DATA_DIR_ENV).filter(|v| !v.trim().is_empty()) {
            Some(dir) => PathBuf::from(dir),
            None => dirs::data_dir()
                .ok_or(ConfigError::NoDataDir)?
                .join(APP_DIR_NAME),
        };
        let mut config = Self::with_data_dir(data_dir);
        if let Some(ms) = millis(&lookup, DEBOUNCE_ENV)? {
            config.debounce = ms;
        }
        if let Some(ms) = millis(&lookup, OPEN_TIMEOUT_ENV)? {
            config.open_timeout = ms;
        }
        if let Some(ms) = millis(&lookup, BUSY_TIMEOUT_ENV)? {
            config.busy_timeout = ms;
        }
        Ok(config)
    }

    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join(&self.db_file)
    }

    pub fn prefs_path(&self) -> PathBuf {
        self.data_dir.join(crate::user_active::PREFS_FILE)
    }

    pub fn handles_path(&self) -> PathBuf {
        self.data_dir.join(crate::sync::HANDLES_FILE)
    }

    pub fn store_options(&self) -> StoreOptions {
        StoreOptions {
            path: Some(self.db_path()),
            open_timeout: self.open_timeout,
            busy_timeout: self.busy_timeout,
        }
    }

    pub fn sync_options(&self) -> SyncOptions {
        SyncOptions {
            file_name: self.sync_file_name.clone(),
            debounce: self.debounce,
        }
    }
}

fn millis<F>(lookup: &F, var: &'static str) -> Result<Option<Duration>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let Some(raw) = lookup(var) else {
        return Ok(None);
    };
    raw.trim()
        .parse::<u64>()
        .map(|ms| Some(Duration::from_millis(ms)))
        .map_err(|_| ConfigError::InvalidNumber { var, value: raw })
}
