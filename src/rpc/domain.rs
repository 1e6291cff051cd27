//! Wire-shaped types exchanged with the note-store/user-store RPC surface (spec §6).

use chrono::{DateTime, Utc};

use crate::types::{LinkedNotebook, Note, Notebook, Resource, SavedSearch, Tag, Usn};

/// `getSyncState`/`getLinkedNotebookSyncState` response.
#[derive(Clone, Debug, PartialEq)]
pub struct SyncState {
    pub update_count: Usn,
    pub full_sync_before: Option<DateTime<Utc>>,
    pub user_last_updated: Option<DateTime<Utc>>,
    pub current_time: DateTime<Utc>,
}

/// Which entity kinds (and whether expunges) a sync chunk request should include.
#[derive(Clone, Debug)]
pub struct SyncChunkFilter {
    pub include_notes: bool,
    pub include_notebooks: bool,
    pub include_tags: bool,
    pub include_saved_searches: bool,
    pub include_resources: bool,
    pub include_linked_notebooks: bool,
    pub include_expunged: bool,
}

impl SyncChunkFilter {
    /// The filter for a full sync: everything except expunges (spec §4.8).
    pub fn full_sync() -> Self {
        Self {
            include_notes: true,
            include_notebooks: true,
            include_tags: true,
            include_saved_searches: true,
            include_resources: true,
            include_linked_notebooks: true,
            include_expunged: false,
        }
    }

    /// The filter for an incremental sync: everything, including expunges.
    pub fn incremental_sync() -> Self {
        Self {
            include_expunged: true,
            ..Self::full_sync()
        }
    }
}

/// One page of the server's change log for a scope (spec §6 `SyncChunk`).
#[derive(Clone, Debug, Default)]
pub struct SyncChunk {
    /// The highest USN present in this chunk. `None` signals an empty tail (spec §4.2 rule 4).
    pub chunk_high_usn: Option<Usn>,
    pub update_count: Usn,
    pub current_time: DateTime<Utc>,

    pub saved_searches: Vec<SavedSearch>,
    pub tags: Vec<Tag>,
    pub notebooks: Vec<Notebook>,
    pub notes: Vec<Note>,
    pub resources: Vec<Resource>,
    pub linked_notebooks: Vec<LinkedNotebook>,

    pub expunged_saved_searches: Vec<String>,
    pub expunged_tags: Vec<String>,
    pub expunged_notebooks: Vec<String>,
    pub expunged_notes: Vec<String>,
    pub expunged_linked_notebooks: Vec<String>,
}

/// Controls what a `getNoteWithResultSpec` request returns (spec §4.4).
#[derive(Clone, Copy, Debug)]
pub struct NoteResultSpec {
    pub include_content: bool,
    pub include_resources_data: bool,
    pub include_resources_recognition: bool,
    pub include_resources_alternate_data: bool,
    pub include_shared_notes: bool,
    pub include_note_app_data_values: bool,
}

impl Default for NoteResultSpec {
    fn default() -> Self {
        Self {
            include_content: true,
            include_resources_data: true,
            include_resources_recognition: true,
            include_resources_alternate_data: false,
            include_shared_notes: true,
            include_note_app_data_values: true,
        }
    }
}

/// Controls what a `getResource` request returns (spec §4.4/§6).
#[derive(Clone, Copy, Debug)]
pub struct ResourceFetchFlags {
    pub with_data: bool,
    pub with_recognition: bool,
    pub with_attributes: bool,
    pub with_alternate_data: bool,
}

impl Default for ResourceFetchFlags {
    fn default() -> Self {
        Self {
            with_data: true,
            with_recognition: true,
            with_attributes: true,
            with_alternate_data: true,
        }
    }
}

/// Returned by `authenticateToSharedNotebook` (spec §6).
#[derive(Clone, Debug)]
pub struct AuthenticationResult {
    pub auth_token: String,
    pub current_time: DateTime<Utc>,
    pub expiration: DateTime<Utc>,
}

/// `getUser` response (reduced to the fields the engine needs, spec SPEC_FULL §3).
#[derive(Clone, Debug)]
pub struct UserProfile {
    pub id: i32,
    pub username: String,
    pub shard_id: Option<String>,
}
