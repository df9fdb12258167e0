use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use super::filesystem::{DirectoryHandle, Filesystem, FsError};

#[derive(Default)]
struct Inner {
    files: HashMap<(String, String), String>,
    selection: Option<DirectoryHandle>,
    denied: bool,
    read_delay: Option<Duration>,
}

/// In-process folder store with switchable permission and operation counters.
#[derive(Default)]
pub struct MemoryFilesystem {
    inner: Mutex<Inner>,
    reads: AtomicUsize,
    writes: AtomicUsize,
}

impl MemoryFilesystem {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Folder returned by the next `pick_directory`; `None` simulates cancel.
    pub fn set_selection(&self, location: Option<&str>) {
        self.lock().selection = location.map(DirectoryHandle::new);
    }

    pub fn set_permission(&self, granted: bool) {
        self.lock().denied = !granted;
    }

    pub fn set_read_delay(&self, delay: Option<Duration>) {
        self.lock().read_delay = delay;
    }

    pub fn put_file(&self, location: &str, name: &str, contents: &str) {
        self.lock()
            .files
            .insert((location.to_string(), name.to_string()), contents.to_string());
    }

    pub fn file(&self, location: &str, name: &str) -> Option<String> {
        self.lock()
            .files
            .get(&(location.to_string(), name.to_string()))
            .cloned()
    }

    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    fn check(&self) -> Result<(), FsError> {
        if self.lock().denied {
            Err(FsError::PermissionDenied)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Filesystem for MemoryFilesystem {
    async fn pick_directory(&self) -> Result<Option<DirectoryHandle>, FsError> {
        Ok(self.lock().selection.take())
    }

    async fn verify_permission(&self, _dir: &DirectoryHandle) -> Result<bool, FsError> {
        Ok(!self.lock().denied)
    }

    async fn read_file(
        &self,
        dir: &DirectoryHandle,
        name: &str,
    ) -> Result<Option<String>, FsError> {
        let delay = self.lock().read_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.check()?;
        self.reads.fetch_add(1, Ordering::SeqCst);
        Ok(self.file(&dir.location, name))
    }

    async fn write_file(
        &self,
        dir: &DirectoryHandle,
        name: &str,
        contents: &str,
    ) -> Result<(), FsError> {
        self.check()?;
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.put_file(&dir.location, name, contents);
        Ok(())
    }
}
