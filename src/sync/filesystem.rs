use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::db::write_atomic;
use crate::id::new_uuid_v7;

#[derive(Debug, Error)]
pub enum FsError {
    #[error("permission to the sync folder was denied")]
    PermissionDenied,
    #[error("sync folder io error: {0}")]
    Io(#[source] io::Error),
}

impl From<io::Error> for FsError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::PermissionDenied => FsError::PermissionDenied,
            _ => FsError::Io(err),
        }
    }
}

/// Opaque reference to a user-chosen folder. Persisted between sessions;
/// permission must be re-verified before every use.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryHandle {
    pub location: String,
}

impl DirectoryHandle {
    pub fn new(location: impl Into<String>) -> Self {
        Self {
            location: location.into(),
        }
    }
}

#[async_trait]
pub trait Filesystem: Send + Sync {
    /// Ask for a folder. `None` means the user cancelled.
    async fn pick_directory(&self) -> Result<Option<DirectoryHandle>, FsError>;

    async fn verify_permission(&self, dir: &DirectoryHandle) -> Result<bool, FsError>;

    /// Contents of `name` inside `dir`, `None` when the file does not exist.
    async fn read_file(&self, dir: &DirectoryHandle, name: &str)
        -> Result<Option<String>, FsError>;

    /// Replace `name` inside `dir` as a whole.
    async fn write_file(
        &self,
        dir: &DirectoryHandle,
        name: &str,
        contents: &str,
    ) -> Result<(), FsError>;
}

/// Real directories on the local disk. There is no interactive picker: the
/// folder to "pick" is chosen up front with [`LocalFilesystem::select`].
#[derive(Default)]
pub struct LocalFilesystem {
    selection: Mutex<Option<PathBuf>>,
}

impl LocalFilesystem {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_selection(path: impl Into<PathBuf>) -> Self {
        Self {
            selection: Mutex::new(Some(path.into())),
        }
    }

    pub fn select(&self, path: impl Into<PathBuf>) {
        *self.selection.lock().unwrap_or_else(|e| e.into_inner()) = Some(path.into());
    }

    fn resolve(dir: &DirectoryHandle, name: &str) -> PathBuf {
        Path::new(&dir.location).join(name)
    }
}

#[async_trait]
impl Filesystem for LocalFilesystem {
    async fn pick_directory(&self) -> Result<Option<DirectoryHandle>, FsError> {
        let selected = self
            .selection
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        let Some(path) = selected else {
            return Ok(None);
        };
        let path = match tokio::fs::canonicalize(&path).await {
            Ok(resolved) => resolved,
            Err(err) if err.kind() == io::ErrorKind::NotFound => path,
            Err(err) => return Err(err.into()),
        };
        Ok(Some(DirectoryHandle::new(path.to_string_lossy())))
    }

    async fn verify_permission(&self, dir: &DirectoryHandle) -> Result<bool, FsError> {
        let root = Path::new(&dir.location);
        match tokio::fs::metadata(root).await {
            Ok(meta) if meta.is_dir() => {}
            Ok(_) => return Ok(false),
            Err(err)
                if matches!(
                    err.kind(),
                    io::ErrorKind::NotFound | io::ErrorKind::PermissionDenied
                ) =>
            {
                return Ok(false)
            }
            Err(err) => return Err(FsError::Io(err)),
        }

        // Mode bits lie on some mounts; only a real write proves access.
        let probe = root.join(format!(".libretto-probe-{}", new_uuid_v7()));
        match tokio::fs::write(&probe, b"").await {
            Ok(()) => {
                let _ = tokio::fs::remove_file(&probe).await;
                Ok(true)
            }
            Err(err) if err.kind() == io::ErrorKind::PermissionDenied => Ok(false),
            Err(err) if err.raw_os_error() == Some(30) => Ok(false), // EROFS
            Err(err) => Err(FsError::Io(err)),
        }
    }

    async fn read_file(
        &self,
        dir: &DirectoryHandle,
        name: &str,
    ) -> Result<Option<String>, FsError> {
        match tokio::fs::read_to_string(Self::resolve(dir, name)).await {
            Ok(raw) => Ok(Some(raw)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    async fn write_file(
        &self,
        dir: &DirectoryHandle,
        name: &str,
        contents: &str,
    ) -> Result<(), FsError> {
        let path = Self::resolve(dir, name);
        let bytes = contents.as_bytes().to_vec();
        tokio::task::spawn_blocking(move || write_atomic(&path, &bytes))
            .await
            .map_err(|err| FsError::Io(io::Error::new(io::ErrorKind::Other, err)))??;
        Ok(())
    }
}
