use serde::Serialize;

use super::filesystem::DirectoryHandle;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncState {
    NoFolder,
    PermissionPending,
    Linked {
        handle: DirectoryHandle,
        reconciling: bool,
    },
}

impl SyncState {
    pub fn label(&self) -> &'static str {
        match self {
            SyncState::NoFolder => "no_folder",
            SyncState::PermissionPending => "permission_pending",
            SyncState::Linked {
                reconciling: true, ..
            } => "reconciling",
            SyncState::Linked { .. } => "linked",
        }
    }

    /// A cycle or a permission check is in flight.
    pub fn is_busy(&self) -> bool {
        matches!(
            self,
            SyncState::PermissionPending
                | SyncState::Linked {
                    reconciling: true,
                    ..
                }
        )
    }

    pub fn handle(&self) -> Option<&DirectoryHandle> {
        match self {
            SyncState::Linked { handle, .. } => Some(handle),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "camelCase")]
pub enum SyncOutcome {
    /// The folder's file replaced local data.
    #[serde(rename_all = "camelCase")]
    Imported { records: usize, wrote_back: bool },
    /// No file existed; local data was written to the folder.
    Initialized { records: usize },
    Written { records: usize },
    /// Another cycle was in flight.
    Skipped,
    Cancelled,
    NoFolder,
    PermissionLost,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStats {
    pub cycles: u64,
    pub writes: u64,
    pub skips: u64,
    pub permission_losses: u64,
}
