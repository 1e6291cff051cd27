//! Per-scope sync state, progress events, and the result types exposed to callers (spec §4.9).

use serde::{Deserialize, Serialize};

use crate::types::{GuidMap, Guid, ScopeSyncState, Usn};

use super::stop::StopSyncError;

/// Serializes a `u64` as a JSON string so 64-bit totals survive round-tripping through
/// JSON-number-as-f64 runtimes (spec §6 "totals as strings").
pub mod string_u64 {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(value: &u64, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&value.to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<u64, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Wraps a per-scope value as `{ user_own, linked_notebooks }` (the user-own scope plus one
/// entry per linked notebook, spec §4.9/§6). Used for every status/state aggregate that the
/// engine reports back to a caller.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PerScope<T> {
    pub user_own: T,
    pub linked_notebooks: GuidMap<T>,
}

impl<T> PerScope<T> {
    pub fn get(&self, scope: &crate::types::Scope) -> Option<&T> {
        match scope {
            crate::types::Scope::UserOwn => Some(&self.user_own),
            crate::types::Scope::LinkedNotebook(guid) => self.linked_notebooks.get(guid),
        }
    }

    pub fn set(&mut self, scope: &crate::types::Scope, value: T) {
        match scope {
            crate::types::Scope::UserOwn => self.user_own = value,
            crate::types::Scope::LinkedNotebook(guid) => {
                self.linked_notebooks.insert(guid.clone(), value);
            },
        }
    }
}

impl<T: Default + Clone> PerScope<T> {
    /// Gets or creates the entry for `scope`, applying `f` to it in place.
    pub fn update(&mut self, scope: &crate::types::Scope, f: impl FnOnce(&mut T)) {
        match scope {
            crate::types::Scope::UserOwn => f(&mut self.user_own),
            crate::types::Scope::LinkedNotebook(guid) => {
                let mut value = self.linked_notebooks.get(guid).cloned().unwrap_or_default();
                f(&mut value);
                self.linked_notebooks.insert(guid.clone(), value);
            },
        }
    }
}

/// Per-scope USN/timestamp bookkeeping exposed to callers (spec §4.9).
pub type SyncState = PerScope<ScopeSyncState>;

// SYNC CHUNKS DATA COUNTERS
// ================================================================================================

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncChunksDataCounters {
    #[serde(with = "string_u64")]
    pub total_saved_searches: u64,
    #[serde(with = "string_u64")]
    pub total_expunged_saved_searches: u64,
    #[serde(with = "string_u64")]
    pub total_tags: u64,
    #[serde(with = "string_u64")]
    pub total_expunged_tags: u64,
    #[serde(with = "string_u64")]
    pub total_deferred_tags: u64,
    #[serde(with = "string_u64")]
    pub total_notebooks: u64,
    #[serde(with = "string_u64")]
    pub total_expunged_notebooks: u64,
    #[serde(with = "string_u64")]
    pub total_notes: u64,
    #[serde(with = "string_u64")]
    pub total_expunged_notes: u64,
    #[serde(with = "string_u64")]
    pub total_resources: u64,
    #[serde(with = "string_u64")]
    pub total_linked_notebooks: u64,
    #[serde(with = "string_u64")]
    pub total_expunged_linked_notebooks: u64,
}

// DOWNLOAD STATUSES
// ================================================================================================

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FailedDownload {
    pub guid: Guid,
    pub error_description: String,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DownloadNotesStatus {
    #[serde(with = "string_u64")]
    pub total_new_notes: u64,
    #[serde(with = "string_u64")]
    pub total_updated_notes: u64,
    pub notes_which_failed_to_download: Vec<FailedDownload>,
    pub stop_synchronization_error: StopSyncError,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DownloadResourcesStatus {
    #[serde(with = "string_u64")]
    pub total_new_resources: u64,
    #[serde(with = "string_u64")]
    pub total_updated_resources: u64,
    pub resources_which_failed_to_download: Vec<FailedDownload>,
    pub stop_synchronization_error: StopSyncError,
}

// SEND STATUS
// ================================================================================================

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct KindSendCounters {
    #[serde(with = "string_u64")]
    pub attempted: u64,
    #[serde(with = "string_u64")]
    pub succeeded: u64,
}

impl KindSendCounters {
    pub fn record_attempt(&mut self, succeeded: bool) {
        self.attempted += 1;
        if succeeded {
            self.succeeded += 1;
        }
    }
}

/// The closed error taxonomy in wire form (spec §6: `{type, message}` with
/// `type ∈ {InvalidArgument, OperationCanceled, RuntimeError, LocalStorageOpenException,
/// LocalStorageOperationException}`).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "message")]
pub enum SerializableError {
    InvalidArgument(String),
    OperationCanceled,
    RuntimeError(String),
    LocalStorageOpenException(String),
    LocalStorageOperationException(String),
}

impl From<&crate::errors::SyncError> for SerializableError {
    fn from(err: &crate::errors::SyncError) -> Self {
        use crate::errors::SyncError;
        match err {
            SyncError::InvalidArgument(msg) => SerializableError::InvalidArgument(msg.clone()),
            SyncError::OperationCanceled => SerializableError::OperationCanceled,
            SyncError::LocalStorageOpen(e) => {
                SerializableError::LocalStorageOpenException(e.to_string())
            },
            SyncError::LocalStorageOperation(e) => {
                SerializableError::LocalStorageOperationException(e.to_string())
            },
            other => SerializableError::RuntimeError(other.to_string()),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FailedSendItem {
    pub item_description: String,
    pub error: SerializableError,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SendStatus {
    pub saved_searches: KindSendCounters,
    pub tags: KindSendCounters,
    pub notebooks: KindSendCounters,
    pub notes: KindSendCounters,
    pub failed_to_send: Vec<FailedSendItem>,
    pub stop_synchronization_error: StopSyncError,
    /// Set when the server's `updateCount` advanced during this send: new server-side changes
    /// exist and a subsequent download must run before another send is attempted (spec §4.6).
    pub need_to_repeat_incremental_sync: bool,
}

// SYNC RESULT
// ================================================================================================

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncResult {
    pub sync_state: SyncState,
    pub user_account_sync_chunks_downloaded: bool,
    pub sync_chunks_data_counters: PerScope<SyncChunksDataCounters>,
    pub download_notes_status: PerScope<DownloadNotesStatus>,
    pub download_resources_status: PerScope<DownloadResourcesStatus>,
    pub send_status: PerScope<SendStatus>,
    pub stop_synchronization_error: StopSyncError,
}

// PROGRESS EVENTS
// ================================================================================================

/// Progress notifications emitted during a run (spec §4.8). Every stream (identified by the
/// `scope` a variant carries, where applicable) carries monotonically non-decreasing counters;
/// callers may assume `chunk_high_usn`/`downloaded` never regress within one run for the same
/// scope.
#[derive(Clone, Debug)]
pub enum ProgressEvent {
    SyncChunksDownloadProgress {
        scope: crate::types::Scope,
        chunk_high_usn: Usn,
        update_count: Usn,
        last_previous_usn: Usn,
    },
    SyncChunksDownloaded {
        scope: crate::types::Scope,
    },
    SyncChunksDataProcessingProgress {
        scope: crate::types::Scope,
        counters: SyncChunksDataCounters,
    },
    StartLinkedNotebooksDataDownloading {
        linked_notebook_count: usize,
    },
    NoteDownloadProgress {
        scope: crate::types::Scope,
        downloaded: usize,
        total: usize,
    },
    ResourceDownloadProgress {
        scope: crate::types::Scope,
        downloaded: usize,
        total: usize,
    },
    SendStatusUpdate {
        scope: crate::types::Scope,
        status: SendStatus,
    },
}

/// Receives progress events emitted during a run.
pub trait ProgressSink: Send + Sync {
    fn emit(&self, event: ProgressEvent);
}

/// Discards every event; the default when a caller doesn't care about progress.
#[derive(Clone, Copy, Debug, Default)]
pub struct NullProgressSink;

impl ProgressSink for NullProgressSink {
    fn emit(&self, _event: ProgressEvent) {}
}

impl ProgressSink for tokio::sync::mpsc::UnboundedSender<ProgressEvent> {
    fn emit(&self, event: ProgressEvent) {
        // The receiver having been dropped is not this module's concern; the orchestrator keeps
        // running with or without a listener.
        let _ = self.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sync_chunks_data_counters_round_trip() {
        let counters = SyncChunksDataCounters {
            total_saved_searches: 10,
            total_notebooks: u64::MAX,
            ..Default::default()
        };
        let json = serde_json::to_value(&counters).unwrap();
        assert_eq!(json["total_notebooks"], serde_json::Value::String(u64::MAX.to_string()));
        let back: SyncChunksDataCounters = serde_json::from_value(json).unwrap();
        assert_eq!(back, counters);
    }

    #[test]
    fn send_status_round_trip() {
        let mut status = SendStatus::default();
        status.notes.record_attempt(true);
        status.notes.record_attempt(false);
        status.failed_to_send.push(FailedSendItem {
            item_description: "note abc".into(),
            error: SerializableError::RuntimeError("boom".into()),
        });
        status.stop_synchronization_error = StopSyncError::RateLimitReached { seconds: Some(60) };
        let json = serde_json::to_value(&status).unwrap();
        let back: SendStatus = serde_json::from_value(json).unwrap();
        assert_eq!(back, status);
    }

    #[test]
    fn sync_result_round_trip() {
        let mut result = SyncResult::default();
        result.sync_state.user_own.update_count = 42;
        result
            .sync_state
            .linked_notebooks
            .insert("ln-1".into(), ScopeSyncState { update_count: 7, ..Default::default() });
        let json = serde_json::to_value(&result).unwrap();
        let back: SyncResult = serde_json::from_value(json).unwrap();
        assert_eq!(back, result);
    }

    #[test]
    fn per_scope_update_creates_linked_notebook_entry() {
        let mut counters: PerScope<SyncChunksDataCounters> = PerScope::default();
        let scope = crate::types::Scope::LinkedNotebook("ln-1".into());
        counters.update(&scope, |c| c.total_notes += 1);
        assert_eq!(counters.get(&scope).unwrap().total_notes, 1);
    }
}
