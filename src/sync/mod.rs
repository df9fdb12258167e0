//! Mirrors the whole dataset to a user-chosen folder so devices sharing that
//! folder through a file-sync service converge. Conflicts resolve by
//! last-writer-wins on the complete file.

mod filesystem;
mod memory;
mod state;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::db::snapshot::SnapshotError;
use crate::db::{StoreError, SyncSnapshot};
use crate::partition::{PartitionError, UserPartition};
use crate::user_active::StoreHandle;

pub use filesystem::{DirectoryHandle, Filesystem, FsError, LocalFilesystem};
pub use memory::MemoryFilesystem;
pub use state::{SyncOutcome, SyncState, SyncStats};

pub const SYNC_FILE_NAME: &str = "libretto-sync.json";
pub const HANDLES_FILE: &str = "handles.json";
pub const HANDLE_KEY: &str = "syncDirectory";
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(500);

#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Fs(#[from] FsError),
    #[error(transparent)]
    Snapshot(#[from] SnapshotError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Partition(#[from] PartitionError),
    #[error("failed to persist sync folder: {0}")]
    HandleStore(#[source] anyhow::Error),
}

#[derive(Debug, Clone)]
pub struct SyncOptions {
    pub file_name: String,
    pub debounce: Duration,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            file_name: SYNC_FILE_NAME.to_string(),
            debounce: DEFAULT_DEBOUNCE,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CycleKind {
    Load,
    Focus,
}

impl CycleKind {
    fn as_str(self) -> &'static str {
        match self {
            CycleKind::Load => "load",
            CycleKind::Focus => "focus",
        }
    }
}

enum LoadStart {
    Busy,
    NoFolder,
    Linked(DirectoryHandle),
    Verify(DirectoryHandle),
}

struct Propagator {
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

pub struct FolderSync {
    partition: Arc<UserPartition>,
    fs: Arc<dyn Filesystem>,
    handles: StoreHandle,
    options: SyncOptions,
    state: Mutex<SyncState>,
    stats: Mutex<SyncStats>,
    startup_complete: AtomicBool,
    propagator: Mutex<Option<Propagator>>,
}

impl FolderSync {
    pub fn new(
        partition: Arc<UserPartition>,
        fs: Arc<dyn Filesystem>,
        handles: StoreHandle,
        options: SyncOptions,
    ) -> Arc<Self> {
        Arc::new(Self {
            partition,
            fs,
            handles,
            options,
            state: Mutex::new(SyncState::NoFolder),
            stats: Mutex::new(SyncStats::default()),
            startup_complete: AtomicBool::new(false),
            propagator: Mutex::new(None),
        })
    }

    pub fn state(&self) -> SyncState {
        self.lock_state().clone()
    }

    pub fn stats(&self) -> SyncStats {
        *self.stats.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn is_startup_complete(&self) -> bool {
        self.startup_complete.load(Ordering::SeqCst)
    }

    /// Folder remembered from an earlier session, without checking access.
    pub fn persisted_handle(&self) -> Option<DirectoryHandle> {
        let value = self.handles.get_value(HANDLE_KEY)?;
        match serde_json::from_value(value) {
            Ok(handle) => Some(handle),
            Err(err) => {
                warn!(target: "libretto", event = "sync_handle_corrupt", error = %err);
                None
            }
        }
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, SyncState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn bump(&self, apply: impl FnOnce(&mut SyncStats)) {
        apply(&mut self.stats.lock().unwrap_or_else(|e| e.into_inner()));
    }

    fn skip(&self, trigger: &'static str) -> SyncOutcome {
        self.bump(|s| s.skips += 1);
        debug!(target: "libretto", event = "sync_cycle_skipped", trigger);
        SyncOutcome::Skipped
    }

    /// Ask for a folder, verify access, remember it and reconcile with it.
    pub async fn select_folder(&self) -> Result<SyncOutcome, SyncError> {
        if self.lock_state().is_busy() {
            return Ok(self.skip("select"));
        }
        // Cancelling keeps whatever folder is already linked.
        let Some(handle) = self.fs.pick_directory().await? else {
            info!(target: "libretto", event = "sync_folder_cancelled");
            return Ok(SyncOutcome::Cancelled);
        };

        // A rejected selection puts back the previous link, which is still
        // the persisted one.
        let previous = {
            let mut state = self.lock_state();
            if state.is_busy() {
                drop(state);
                return Ok(self.skip("select"));
            }
            std::mem::replace(&mut *state, SyncState::PermissionPending)
        };

        match self.fs.verify_permission(&handle).await {
            Ok(true) => {}
            Ok(false) | Err(FsError::PermissionDenied) => {
                *self.lock_state() = previous;
                warn!(target: "libretto", event = "sync_folder_denied", location = %handle.location);
                return Ok(SyncOutcome::PermissionLost);
            }
            Err(err) => {
                *self.lock_state() = previous;
                return Err(err.into());
            }
        }

        let stored = serde_json::to_value(&handle)
            .map_err(anyhow::Error::from)
            .and_then(|value| self.handles.put(HANDLE_KEY, value));
        if let Err(err) = stored {
            *self.lock_state() = previous;
            return Err(SyncError::HandleStore(err));
        }
        info!(target: "libretto", event = "sync_folder_selected", location = %handle.location);

        *self.lock_state() = SyncState::Linked {
            handle: handle.clone(),
            reconciling: true,
        };
        let result = self.run_cycle(&handle, CycleKind::Load).await;
        self.startup_complete.store(true, Ordering::SeqCst);
        self.finish_cycle(CycleKind::Load, result)
    }

    /// Startup reconcile. Must run after the partition is ready. Enables
    /// propagation whatever the outcome.
    pub async fn reconcile_on_load(&self) -> Result<SyncOutcome, SyncError> {
        let outcome = self.reconcile_on_load_inner().await;
        if !self.startup_complete.swap(true, Ordering::SeqCst) {
            debug!(target: "libretto", event = "sync_startup_complete");
        }
        outcome
    }

    async fn reconcile_on_load_inner(&self) -> Result<SyncOutcome, SyncError> {
        let start = {
            let mut state = self.lock_state();
            let linked = state.handle().cloned();
            if state.is_busy() {
                LoadStart::Busy
            } else if let Some(handle) = linked {
                *state = SyncState::Linked {
                    handle: handle.clone(),
                    reconciling: true,
                };
                LoadStart::Linked(handle)
            } else if let Some(handle) = self.persisted_handle() {
                *state = SyncState::PermissionPending;
                LoadStart::Verify(handle)
            } else {
                LoadStart::NoFolder
            }
        };

        let handle = match start {
            LoadStart::Busy => return Ok(self.skip(CycleKind::Load.as_str())),
            LoadStart::NoFolder => return Ok(SyncOutcome::NoFolder),
            LoadStart::Linked(handle) => handle,
            LoadStart::Verify(handle) => {
                // The state lock is released while the permission check runs.
                match self.fs.verify_permission(&handle).await {
                    Ok(true) => {}
                    Ok(false) | Err(FsError::PermissionDenied) => {
                        return Ok(self.permission_lost())
                    }
                    Err(err) => {
                        *self.lock_state() = SyncState::NoFolder;
                        return Err(err.into());
                    }
                }
                *self.lock_state() = SyncState::Linked {
                    handle: handle.clone(),
                    reconciling: true,
                };
                handle
            }
        };

        let result = self.run_cycle(&handle, CycleKind::Load).await;
        self.finish_cycle(CycleKind::Load, result)
    }

    /// Re-link the remembered folder after verifying access, without reading
    /// or writing it. Returns whether a folder is linked afterwards.
    pub async fn attach(&self) -> Result<bool, SyncError> {
        let handle = {
            let mut state = self.lock_state();
            match &*state {
                SyncState::Linked { .. } => return Ok(true),
                SyncState::PermissionPending => return Ok(false),
                SyncState::NoFolder => {}
            }
            let Some(handle) = self.persisted_handle() else {
                return Ok(false);
            };
            *state = SyncState::PermissionPending;
            handle
        };
        match self.fs.verify_permission(&handle).await {
            Ok(true) => {
                *self.lock_state() = SyncState::Linked {
                    handle,
                    reconciling: false,
                };
                Ok(true)
            }
            Ok(false) | Err(FsError::PermissionDenied) => {
                self.permission_lost();
                Ok(false)
            }
            Err(err) => {
                *self.lock_state() = SyncState::NoFolder;
                Err(err.into())
            }
        }
    }

    /// Pick up changes other devices wrote while the app was in the background.
    pub async fn reconcile_on_focus(&self) -> Result<SyncOutcome, SyncError> {
        let Some(handle) = self.begin() else {
            return Ok(self.idle_outcome());
        };
        let result = self.run_cycle(&handle, CycleKind::Focus).await;
        self.finish_cycle(CycleKind::Focus, result)
    }

    /// Queue a debounced write of the full dataset.
    pub fn propagate(&self) {
        self.partition.feed().notify("sync_request");
    }

    /// Write the full dataset to the folder right away.
    pub async fn propagate_now(&self) -> Result<SyncOutcome, SyncError> {
        let Some(handle) = self.begin() else {
            return Ok(self.idle_outcome());
        };
        let result = async {
            if !self.fs.verify_permission(&handle).await? {
                return Err(SyncError::Fs(FsError::PermissionDenied));
            }
            let records = self.write_snapshot(&handle).await?;
            Ok(SyncOutcome::Written { records })
        }
        .await;
        self.finish(result)
    }

    /// Forget the folder. The file inside it is left as is.
    pub fn unlink(&self) -> Result<(), SyncError> {
        self.handles
            .remove(HANDLE_KEY)
            .map_err(SyncError::HandleStore)?;
        *self.lock_state() = SyncState::NoFolder;
        info!(target: "libretto", event = "sync_unlinked");
        Ok(())
    }

    fn idle_outcome(&self) -> SyncOutcome {
        if self.lock_state().is_busy() {
            self.skip("busy")
        } else {
            SyncOutcome::NoFolder
        }
    }

    /// Claim the linked folder for one cycle. `None` when not linked or when
    /// another cycle holds it.
    fn begin(&self) -> Option<DirectoryHandle> {
        let mut state = self.lock_state();
        match &*state {
            SyncState::Linked {
                handle,
                reconciling: false,
            } => {
                let handle = handle.clone();
                *state = SyncState::Linked {
                    handle: handle.clone(),
                    reconciling: true,
                };
                Some(handle)
            }
            _ => None,
        }
    }

    async fn run_cycle(
        &self,
        handle: &DirectoryHandle,
        kind: CycleKind,
    ) -> Result<SyncOutcome, SyncError> {
        if !self.fs.verify_permission(handle).await? {
            return Err(SyncError::Fs(FsError::PermissionDenied));
        }
        let engine = self.partition.engine();

        let Some(raw) = self.fs.read_file(handle, &self.options.file_name).await? else {
            let records = self.write_snapshot(handle).await?;
            info!(target: "libretto", event = "sync_initialized", trigger = kind.as_str(), records);
            return Ok(SyncOutcome::Initialized { records });
        };

        let snapshot = SyncSnapshot::from_json(&raw)?;
        let records = snapshot.record_count();
        engine.import_all(&snapshot).await?;
        let report = self.partition.migrate_after_import().await?;

        let wrote_back = kind == CycleKind::Load && report.changed();
        if wrote_back {
            self.write_snapshot(handle).await?;
        }
        info!(
            target: "libretto",
            event = "sync_imported",
            trigger = kind.as_str(),
            records,
            stamped = report.stamped,
            wrote_back
        );
        Ok(SyncOutcome::Imported {
            records,
            wrote_back,
        })
    }

    async fn write_snapshot(&self, handle: &DirectoryHandle) -> Result<usize, SyncError> {
        let snapshot = self.partition.engine().export_all().await?;
        let body = snapshot.to_json_pretty()?;
        self.fs
            .write_file(handle, &self.options.file_name, &body)
            .await?;
        self.bump(|s| s.writes += 1);
        let records = snapshot.record_count();
        debug!(target: "libretto", event = "sync_written", records);
        Ok(records)
    }

    fn finish_cycle(
        &self,
        kind: CycleKind,
        result: Result<SyncOutcome, SyncError>,
    ) -> Result<SyncOutcome, SyncError> {
        if result.is_ok() {
            self.bump(|s| s.cycles += 1);
        } else if let Err(err) = &result {
            if !matches!(err, SyncError::Fs(FsError::PermissionDenied)) {
                error!(target: "libretto", event = "sync_cycle_failed", trigger = kind.as_str(), error = %err);
            }
        }
        self.finish(result)
    }

    /// Release the cycle claim. Operation-level permission denial unlinks.
    fn finish(&self, result: Result<SyncOutcome, SyncError>) -> Result<SyncOutcome, SyncError> {
        match result {
            Err(SyncError::Fs(FsError::PermissionDenied)) => Ok(self.permission_lost()),
            other => {
                let mut state = self.lock_state();
                if let SyncState::Linked { handle, .. } = &*state {
                    *state = SyncState::Linked {
                        handle: handle.clone(),
                        reconciling: false,
                    };
                }
                other
            }
        }
    }

    fn permission_lost(&self) -> SyncOutcome {
        if let Err(err) = self.handles.remove(HANDLE_KEY) {
            warn!(target: "libretto", event = "sync_handle_clear_failed", error = %err);
        }
        *self.lock_state() = SyncState::NoFolder;
        self.bump(|s| s.permission_losses += 1);
        warn!(target: "libretto", event = "sync_permission_lost");
        SyncOutcome::PermissionLost
    }

    /// Start the background task that turns change-feed bumps into debounced
    /// folder writes. Calling it twice keeps the first task.
    pub fn spawn_propagator(self: &Arc<Self>) {
        let mut slot = self.propagator.lock().unwrap_or_else(|e| e.into_inner());
        if slot.is_some() {
            return;
        }
        let (stop, stop_rx) = watch::channel(false);
        let changes = self.partition.feed().subscribe();
        let task = tokio::spawn(self.clone().run_propagator(changes, stop_rx));
        *slot = Some(Propagator { stop, task });
    }

    /// Flush a pending write and stop the propagator.
    pub async fn shutdown(&self) {
        let propagator = self
            .propagator
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(Propagator { stop, task }) = propagator {
            let _ = stop.send(true);
            if let Err(err) = task.await {
                warn!(target: "libretto", event = "sync_propagator_join_failed", error = %err);
            }
        }
    }

    async fn run_propagator(
        self: Arc<Self>,
        mut changes: watch::Receiver<u64>,
        mut stop: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                _ = stop.changed() => return,
                changed = changes.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
            }
            if !self.is_startup_complete() {
                debug!(target: "libretto", event = "propagation_suppressed");
                continue;
            }

            // Quiet window: every further change restarts it.
            let mut stopping = false;
            loop {
                tokio::select! {
                    _ = stop.changed() => { stopping = true; break; }
                    changed = changes.changed() => {
                        if changed.is_err() {
                            stopping = true;
                            break;
                        }
                    }
                    _ = tokio::time::sleep(self.options.debounce) => break,
                }
            }

            loop {
                match self.propagate_now().await {
                    Ok(SyncOutcome::Skipped) if !stopping => {
                        debug!(target: "libretto", event = "propagation_deferred");
                        tokio::select! {
                            _ = stop.changed() => stopping = true,
                            _ = tokio::time::sleep(self.options.debounce) => {}
                        }
                    }
                    Ok(outcome) => {
                        debug!(target: "libretto", event = "propagation_done", outcome = ?outcome);
                        break;
                    }
                    Err(err) => {
                        warn!(target: "libretto", event = "propagation_failed", error = %err);
                        break;
                    }
                }
            }
            if stopping {
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collections::ChangeFeed;
    use crate::db::{Collection, StoreEngine};
    use serde_json::json;

    const DIR: &str = "mem://shared";

    async fn fixture() -> (Arc<FolderSync>, Arc<MemoryFilesystem>) {
        let engine = StoreEngine::in_memory();
        engine.open().await.expect("open");
        let partition = Arc::new(UserPartition::new(
            engine,
            StoreHandle::in_memory(),
            ChangeFeed::new(),
        ));
        partition.initialize().await.expect("init");
        let fs = Arc::new(MemoryFilesystem::new());
        let sync = FolderSync::new(
            partition,
            fs.clone(),
            StoreHandle::in_memory(),
            SyncOptions::default(),
        );
        (sync, fs)
    }

    #[tokio::test]
    async fn cancelled_pick_is_not_an_error() {
        let (sync, fs) = fixture().await;
        fs.set_selection(None);
        assert_eq!(
            sync.select_folder().await.expect("select"),
            SyncOutcome::Cancelled
        );
        assert_eq!(sync.state(), SyncState::NoFolder);
        assert_eq!(sync.persisted_handle(), None);
    }

    #[tokio::test]
    async fn selecting_an_empty_folder_writes_local_data() {
        let (sync, fs) = fixture().await;
        fs.set_selection(Some(DIR));
        let outcome = sync.select_folder().await.expect("select");
        assert!(matches!(outcome, SyncOutcome::Initialized { .. }));
        assert_eq!(sync.persisted_handle(), Some(DirectoryHandle::new(DIR)));
        assert!(matches!(sync.state(), SyncState::Linked { reconciling: false, .. }));

        let written = fs.file(DIR, SYNC_FILE_NAME).expect("file written");
        let snapshot = SyncSnapshot::from_json(&written).expect("parse");
        assert_eq!(snapshot.get(Collection::Users).map(|u| u.len()), Some(1));
    }

    #[tokio::test]
    async fn focus_without_folder_is_a_no_op() {
        let (sync, fs) = fixture().await;
        assert_eq!(
            sync.reconcile_on_focus().await.expect("focus"),
            SyncOutcome::NoFolder
        );
        assert_eq!(fs.reads(), 0);
    }

    #[tokio::test]
    async fn malformed_file_leaves_local_data_alone() {
        let (sync, fs) = fixture().await;
        fs.set_selection(Some(DIR));
        sync.select_folder().await.expect("select");
        sync.partition
            .ledger()
            .clients
            .save(json!({ "id": "c1", "nome": "ACME" }))
            .await
            .expect("save");

        fs.put_file(DIR, SYNC_FILE_NAME, "{ \"clienti\": 42 }");
        let err = sync.reconcile_on_focus().await.expect_err("malformed");
        assert!(matches!(err, SyncError::Snapshot(_)));
        assert_eq!(sync.partition.ledger().clients.list().expect("list").len(), 1);
        assert!(matches!(sync.state(), SyncState::Linked { reconciling: false, .. }));
    }

    #[tokio::test]
    async fn unlink_forgets_folder_but_keeps_file() {
        let (sync, fs) = fixture().await;
        fs.set_selection(Some(DIR));
        sync.select_folder().await.expect("select");
        sync.unlink().expect("unlink");
        assert_eq!(sync.state(), SyncState::NoFolder);
        assert_eq!(sync.persisted_handle(), None);
        assert!(fs.file(DIR, SYNC_FILE_NAME).is_some());
    }
}
