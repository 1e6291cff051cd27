//! The entity data model shared by every component of the synchronization engine.
//!
//! These types mirror the EDAM wire types closely enough that they can be produced directly
//! from `NoteStoreClient`/`UserStoreClient` responses, but they are not the wire types
//! themselves — fields irrelevant to synchronization (rendering hints, most attribute
//! sub-records) are intentionally omitted. See `DESIGN.md` for the grounding of this
//! simplification.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A server-assigned opaque identifier. Absent on items that only exist locally.
pub type Guid = String;

/// A per-scope monotonically increasing sequence number assigned by the server.
pub type Usn = i32;

/// Identifies which authentication/USN scope an item or operation belongs to.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
pub enum Scope {
    /// The user's own account.
    UserOwn,
    /// A notebook shared into this account by another user, identified by its linked notebook
    /// guid.
    LinkedNotebook(Guid),
}

impl Scope {
    pub fn is_user_own(&self) -> bool {
        matches!(self, Scope::UserOwn)
    }

    pub fn linked_notebook_guid(&self) -> Option<&str> {
        match self {
            Scope::UserOwn => None,
            Scope::LinkedNotebook(guid) => Some(guid),
        }
    }
}

impl std::fmt::Display for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Scope::UserOwn => write!(f, "user-own"),
            Scope::LinkedNotebook(guid) => write!(f, "linked-notebook:{guid}"),
        }
    }
}

// LOCAL IDENTITY
// ================================================================================================

/// A locally-assigned identifier used to track an item before the server has assigned it a
/// [`Guid`]. Never sent over the wire; used only to back-substitute guids once the Sender
/// learns them (spec §4.6).
pub type LocalId = uuid::Uuid;

/// Either a server guid (once known) or a local-only identifier.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum ItemId {
    Guid(Guid),
    Local(LocalId),
}

impl ItemId {
    pub fn guid(&self) -> Option<&str> {
        match self {
            ItemId::Guid(g) => Some(g),
            ItemId::Local(_) => None,
        }
    }
}

// SAVED SEARCH
// ================================================================================================

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SavedSearch {
    pub id: ItemId,
    pub usn: Option<Usn>,
    pub name: String,
    pub query: String,
    pub query_format: QueryFormat,
    pub locally_modified: bool,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum QueryFormat {
    UserQuery,
    Sexp,
}

// TAG
// ================================================================================================

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Tag {
    pub id: ItemId,
    pub usn: Option<Usn>,
    pub name: String,
    pub parent_guid: Option<Guid>,
    pub scope: Scope,
    pub locally_modified: bool,
}

// NOTEBOOK
// ================================================================================================

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Notebook {
    pub id: ItemId,
    pub usn: Option<Usn>,
    pub name: String,
    pub stack: Option<String>,
    pub is_default: bool,
    pub published: bool,
    pub scope: Scope,
    pub locally_modified: bool,
}

// NOTE
// ================================================================================================

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NoteAttributes {
    pub conflict_source_note_guid: Option<Guid>,
    pub shared_with_businesses: bool,
}

impl Default for NoteAttributes {
    fn default() -> Self {
        Self {
            conflict_source_note_guid: None,
            shared_with_businesses: false,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Note {
    pub id: ItemId,
    pub usn: Option<Usn>,
    pub title: String,
    /// `None` when only metadata has been fetched (see §4.4); `Some` once the full-data
    /// downloader has populated the ENML body.
    pub content: Option<String>,
    pub notebook_id: ItemId,
    /// Each entry is a server guid once synced, or a [`ItemId::Local`] id while it still
    /// points at a tag that hasn't been created server-side yet (spec §4.6 back-substitution).
    pub tag_guids: Vec<ItemId>,
    pub attributes: NoteAttributes,
    pub active: bool,
    pub needs_content: bool,
    pub locally_modified: bool,
}

impl Note {
    pub fn is_fully_fetched(&self) -> bool {
        !self.needs_content
    }
}

// RESOURCE
// ================================================================================================

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    pub id: ItemId,
    pub usn: Option<Usn>,
    pub note_id: ItemId,
    pub mime: String,
    /// `None` until the full-data downloader fetches the binary body.
    pub data: Option<Vec<u8>>,
    pub recognition: Option<Vec<u8>>,
    pub alternate_data: Option<Vec<u8>>,
    pub needs_content: bool,
    pub locally_modified: bool,
}

// LINKED NOTEBOOK
// ================================================================================================

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LinkedNotebook {
    pub guid: Guid,
    pub share_id: Option<i64>,
    pub share_key: Option<String>,
    pub shared_notebook_global_id: Option<String>,
    pub username: Option<String>,
    pub uri: Option<String>,
    pub note_store_url: String,
    pub shard_id: Option<String>,
}

// USER
// ================================================================================================

/// Minimal user-own account metadata cached from `UserStoreClient::get_user` (SPEC_FULL §3
/// addition), used as the stable key into sync-state storage and the keychain.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: i32,
    pub username: String,
    pub shard_id: Option<String>,
}

// PER-SCOPE SYNC STATE
// ================================================================================================

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct ScopeSyncState {
    pub update_count: Usn,
    pub last_sync_time: Option<DateTime<Utc>>,
    pub full_sync_before: Option<DateTime<Utc>>,
}

impl Default for ScopeSyncState {
    fn default() -> Self {
        Self {
            update_count: 0,
            last_sync_time: None,
            full_sync_before: None,
        }
    }
}

/// A guid-keyed map serialized as an array of `{guid, value}` pairs (spec §6 serialization
/// format), rather than a JSON object, so non-string/non-identifier guids never collide with
/// JSON object key-escaping rules and so the wire shape matches the source's own serializer.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GuidMap<V> {
    entries: Vec<GuidMapEntry<V>>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
struct GuidMapEntry<V> {
    guid: Guid,
    value: V,
}

impl<V> GuidMap<V> {
    pub fn new() -> Self {
        Self { entries: Vec::new() }
    }

    pub fn insert(&mut self, guid: Guid, value: V) {
        if let Some(entry) = self.entries.iter_mut().find(|e| e.guid == guid) {
            entry.value = value;
        } else {
            self.entries.push(GuidMapEntry { guid, value });
        }
    }

    pub fn get(&self, guid: &str) -> Option<&V> {
        self.entries.iter().find(|e| e.guid == guid).map(|e| &e.value)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &V)> {
        self.entries.iter().map(|e| (e.guid.as_str(), &e.value))
    }
}

impl<V> From<BTreeMap<Guid, V>> for GuidMap<V> {
    fn from(map: BTreeMap<Guid, V>) -> Self {
        Self {
            entries: map.into_iter().map(|(guid, value)| GuidMapEntry { guid, value }).collect(),
        }
    }
}

impl<V> FromIterator<(Guid, V)> for GuidMap<V> {
    fn from_iter<T: IntoIterator<Item = (Guid, V)>>(iter: T) -> Self {
        Self {
            entries: iter.into_iter().map(|(guid, value)| GuidMapEntry { guid, value }).collect(),
        }
    }
}
