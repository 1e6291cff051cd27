use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::types::{GuidMap, ScopeSyncState};

/// The non-sensitive half of an [`super::AuthInfo`] (the token itself goes to the keychain
/// instead, spec §4.1).
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct AuthMetadata {
    pub user_id: i32,
    pub authentication_time: DateTime<Utc>,
    pub note_store_url: String,
    pub shard_id: Option<String>,
    pub web_api_url_prefix: Option<String>,
}

/// Everything persisted between runs for one account: the user-own scope's progress markers
/// plus one entry per linked notebook (spec §4.9 "persisted per scope: `updateCount`,
/// `lastSyncTime`"; `fullSyncBefore` is server-declared and re-fetched each run, but is cached
/// here too so a resumed run can re-evaluate the full-vs-incremental decision without an extra
/// round trip when the cached value is still fresh), plus the non-sensitive half of the cached
/// [`super::AuthInfo`] per scope (spec §4.1 "persists non-sensitive parts via Sync-State
/// Storage, tokens via Keychain").
#[derive(Clone, Debug, Default, serde::Serialize, serde::Deserialize)]
pub struct PersistedSyncState {
    pub user_own: ScopeSyncState,
    pub linked_notebooks: GuidMap<ScopeSyncState>,
    pub user_own_auth: Option<AuthMetadata>,
    pub linked_notebook_auth: GuidMap<AuthMetadata>,
}

/// Errors from the sync-state storage collaborator (spec §1, §6).
#[derive(Clone, Debug, Error)]
pub enum SyncStateStorageError {
    #[error("sync state storage error: {0}")]
    Other(String),
}

/// Persists per-account sync progress markers (spec §1 "the sync-state storage", §6).
#[async_trait]
pub trait SyncStateStorage: Send + Sync {
    async fn get(&self, account: &str) -> Result<Option<PersistedSyncState>, SyncStateStorageError>;
    async fn set(&self, account: &str, state: PersistedSyncState) -> Result<(), SyncStateStorageError>;
}
