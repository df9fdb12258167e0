//! Local-first bookkeeping store: user-partitioned records in SQLite,
//! mirrored as one JSON file to a folder shared between devices.

pub mod backup;
pub mod collections;
pub mod config;
pub mod db;
pub mod error;
pub mod id;
pub mod logging;
pub mod migrate;
pub mod partition;
pub mod state;
pub mod sync;
pub mod time;
pub mod user_active;
pub mod users;

pub use collections::{ChangeFeed, CollectionAccessor, ConfigAccessor, Ledger};
pub use config::{AppConfig, ConfigError};
pub use db::{Collection, Record, StoreEngine, StoreError, StoreOptions, SyncSnapshot};
pub use error::{AppError, AppResult};
pub use partition::{MigrationReport, PartitionError, PartitionState, UserPartition};
pub use state::AppState;
pub use sync::{
    DirectoryHandle, Filesystem, FolderSync, FsError, LocalFilesystem, MemoryFilesystem,
    SyncError, SyncOutcome, SyncState, SyncStats,
};
pub use users::User;
