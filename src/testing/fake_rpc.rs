//! An in-memory fake note-store server, grounded in
//! `original_source/tests/synchronization/FakeNoteStoreBackend.*`. This is test-only scaffolding
//! behind the `testing` feature (or `cfg(test)` for this crate's own unit tests) — not a
//! production backend.

use std::{
    collections::{HashMap, VecDeque},
    sync::Mutex,
};

use async_trait::async_trait;
use chrono::Utc;

use crate::{
    rpc::{
        domain::{
            AuthenticationResult, NoteResultSpec, ResourceFetchFlags, SyncChunk, SyncChunkFilter,
            SyncState, UserProfile,
        },
        NoteStoreClient, RpcError,
    },
    types::{Guid, ItemId, LinkedNotebook, Note, Notebook, Resource, SavedSearch, Tag, Usn},
};

/// A single server-log entry. The fake server represents its whole change history as one
/// ordered log so that `afterUsn`/`maxEntries` paging behaves like the real protocol regardless
/// of which entity kinds are present.
#[derive(Clone)]
enum Record {
    SavedSearch(SavedSearch),
    Tag(Tag),
    Notebook(Notebook),
    Note(Note),
    Resource(Resource),
    LinkedNotebook(LinkedNotebook),
    ExpungedSavedSearch(Guid),
    ExpungedTag(Guid),
    ExpungedNotebook(Guid),
    ExpungedNote(Guid),
    ExpungedLinkedNotebook(Guid),
}

/// A preprogrammed response for [`FakeNoteStore::script_sync_chunks`]: used when a test wants to
/// drive the downloader directly against a fixed chunk sequence rather than through the
/// simulated server log.
pub enum ScriptedChunk {
    Ok(SyncChunk),
    Err(RpcError),
}

/// A reusable error template (RpcError is not `Clone`, so injections are specified this way and
/// materialized into an `RpcError` at the moment they fire).
#[derive(Clone, Debug)]
pub enum ErrorSpec {
    RateLimitReached(Option<i32>),
    AuthenticationExpired,
    Transport(String),
}

impl ErrorSpec {
    fn into_rpc_error(self) -> RpcError {
        match self {
            ErrorSpec::RateLimitReached(secs) => RpcError::RateLimitReached(secs),
            ErrorSpec::AuthenticationExpired => RpcError::AuthenticationExpired,
            ErrorSpec::Transport(msg) => RpcError::Transport(msg),
        }
    }
}

#[derive(Default)]
struct State {
    log: Vec<(Usn, Record)>,
    next_usn: Usn,
    next_guid: HashMap<&'static str, u64>,
    full_sync_before: Option<chrono::DateTime<Utc>>,
    scripted_chunks: Option<VecDeque<ScriptedChunk>>,
    /// 1-indexed call number on which to fire `error`, for `get_filtered_sync_chunk` (seed
    /// scenario 5: rate-limit mid-sync-chunk).
    error_injection: Option<(u32, ErrorSpec)>,
    call_count: u32,
}

impl State {
    fn next_usn(&mut self) -> Usn {
        self.next_usn += 1;
        self.next_usn
    }

    fn next_guid(&mut self, prefix: &'static str) -> Guid {
        let counter = self.next_guid.entry(prefix).or_insert(0);
        *counter += 1;
        format!("{prefix}-{counter}")
    }
}

/// The fake note-store server.
pub struct FakeNoteStore {
    state: Mutex<State>,
}

impl Default for FakeNoteStore {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeNoteStore {
    pub fn new() -> Self {
        Self { state: Mutex::new(State::default()) }
    }

    pub fn script_sync_chunks(&self, chunks: Vec<ScriptedChunk>) {
        self.state.lock().unwrap().scripted_chunks = Some(chunks.into_iter().collect());
    }

    /// Injects `error` on the `nth` call (1-indexed) to `get_filtered_sync_chunk` /
    /// `get_linked_notebook_sync_chunk`. Consumed once; subsequent calls behave normally,
    /// letting a test re-run the sync after "clearing" the injection (seed scenario 5).
    pub fn inject_error_on_call(&self, nth: u32, error: ErrorSpec) {
        self.state.lock().unwrap().error_injection = Some((nth, error));
    }

    // SEEDING HELPERS
    // --------------------------------------------------------------------------------------------

    pub fn seed_saved_search(&self, name: &str) -> Guid {
        let mut state = self.state.lock().unwrap();
        let guid = state.next_guid("search");
        let usn = state.next_usn();
        let search = SavedSearch {
            id: ItemId::Guid(guid.clone()),
            usn: Some(usn),
            name: name.to_string(),
            query: name.to_string(),
            query_format: crate::types::QueryFormat::UserQuery,
            locally_modified: false,
        };
        state.log.push((usn, Record::SavedSearch(search)));
        guid
    }

    pub fn seed_notebook(&self, name: &str) -> Guid {
        let mut state = self.state.lock().unwrap();
        let guid = state.next_guid("notebook");
        let usn = state.next_usn();
        let notebook = Notebook {
            id: ItemId::Guid(guid.clone()),
            usn: Some(usn),
            name: name.to_string(),
            stack: None,
            is_default: false,
            published: false,
            scope: crate::types::Scope::UserOwn,
            locally_modified: false,
        };
        state.log.push((usn, Record::Notebook(notebook)));
        guid
    }

    pub fn seed_note(&self, title: &str, notebook_guid: &str, tag_guids: Vec<Guid>) -> Guid {
        let mut state = self.state.lock().unwrap();
        let guid = state.next_guid("note");
        let usn = state.next_usn();
        let note = Note {
            id: ItemId::Guid(guid.clone()),
            usn: Some(usn),
            title: title.to_string(),
            content: Some(format!("<en-note>{title}</en-note>")),
            notebook_id: ItemId::Guid(notebook_guid.to_string()),
            tag_guids: tag_guids.into_iter().map(ItemId::Guid).collect(),
            attributes: Default::default(),
            active: true,
            needs_content: false,
            locally_modified: false,
        };
        state.log.push((usn, Record::Note(note)));
        guid
    }

    pub fn seed_resource(&self, note_guid: &str, mime: &str, data: Vec<u8>) -> Guid {
        let mut state = self.state.lock().unwrap();
        let guid = state.next_guid("resource");
        let usn = state.next_usn();
        let resource = Resource {
            id: ItemId::Guid(guid.clone()),
            usn: Some(usn),
            note_id: ItemId::Guid(note_guid.to_string()),
            mime: mime.to_string(),
            data: Some(data),
            recognition: None,
            alternate_data: None,
            needs_content: false,
            locally_modified: false,
        };
        state.log.push((usn, Record::Resource(resource)));
        guid
    }

    pub fn seed_tag(&self, name: &str, parent_guid: Option<Guid>) -> Guid {
        let mut state = self.state.lock().unwrap();
        let guid = state.next_guid("tag");
        let usn = state.next_usn();
        let tag = Tag {
            id: ItemId::Guid(guid.clone()),
            usn: Some(usn),
            name: name.to_string(),
            parent_guid,
            scope: crate::types::Scope::UserOwn,
            locally_modified: false,
        };
        state.log.push((usn, Record::Tag(tag)));
        guid
    }

    pub fn seed_linked_notebook(&self, guid: &str, note_store_url: &str) -> Guid {
        let mut state = self.state.lock().unwrap();
        let usn = state.next_usn();
        let linked_notebook = LinkedNotebook {
            guid: guid.to_string(),
            share_id: Some(usn as i64),
            share_key: None,
            shared_notebook_global_id: None,
            username: None,
            uri: None,
            note_store_url: note_store_url.to_string(),
            shard_id: None,
        };
        state.log.push((usn, Record::LinkedNotebook(linked_notebook)));
        guid.to_string()
    }

    pub fn expunge_notebook(&self, guid: &str) {
        let mut state = self.state.lock().unwrap();
        let usn = state.next_usn();
        state.log.push((usn, Record::ExpungedNotebook(guid.to_string())));
    }

    pub fn update_count(&self) -> Usn {
        self.state.lock().unwrap().next_usn
    }

    fn build_chunk(&self, after_usn: Usn, max_entries: u32, filter: &SyncChunkFilter) -> SyncChunk {
        let state = self.state.lock().unwrap();
        let mut chunk = SyncChunk { update_count: state.next_usn, current_time: Utc::now(), ..Default::default() };

        let mut taken = 0u32;
        let mut last_usn = None;
        for (usn, record) in state.log.iter() {
            if *usn <= after_usn {
                continue;
            }
            if taken >= max_entries {
                break;
            }
            let included = match record {
                Record::SavedSearch(s) => {
                    if filter.include_saved_searches {
                        chunk.saved_searches.push(s.clone());
                        true
                    } else {
                        false
                    }
                },
                Record::Tag(t) => {
                    if filter.include_tags {
                        chunk.tags.push(t.clone());
                        true
                    } else {
                        false
                    }
                },
                Record::Notebook(n) => {
                    if filter.include_notebooks {
                        chunk.notebooks.push(n.clone());
                        true
                    } else {
                        false
                    }
                },
                Record::Note(n) => {
                    if filter.include_notes {
                        chunk.notes.push(n.clone());
                        true
                    } else {
                        false
                    }
                },
                Record::Resource(r) => {
                    if filter.include_resources {
                        chunk.resources.push(r.clone());
                        true
                    } else {
                        false
                    }
                },
                Record::LinkedNotebook(l) => {
                    if filter.include_linked_notebooks {
                        chunk.linked_notebooks.push(l.clone());
                        true
                    } else {
                        false
                    }
                },
                Record::ExpungedSavedSearch(g) => {
                    if filter.include_expunged {
                        chunk.expunged_saved_searches.push(g.clone());
                        true
                    } else {
                        false
                    }
                },
                Record::ExpungedTag(g) => {
                    if filter.include_expunged {
                        chunk.expunged_tags.push(g.clone());
                        true
                    } else {
                        false
                    }
                },
                Record::ExpungedNotebook(g) => {
                    if filter.include_expunged {
                        chunk.expunged_notebooks.push(g.clone());
                        true
                    } else {
                        false
                    }
                },
                Record::ExpungedNote(g) => {
                    if filter.include_expunged {
                        chunk.expunged_notes.push(g.clone());
                        true
                    } else {
                        false
                    }
                },
                Record::ExpungedLinkedNotebook(g) => {
                    if filter.include_expunged {
                        chunk.expunged_linked_notebooks.push(g.clone());
                        true
                    } else {
                        false
                    }
                },
            };
            if included {
                taken += 1;
                last_usn = Some(*usn);
            }
        }

        chunk.chunk_high_usn = last_usn.or_else(|| {
            // Nothing new was included in this page. If the caller is already at the tip this
            // is a legitimate empty-tail response; otherwise every remaining record was filtered
            // out, which we also represent as reaching the tip for the requested filter.
            None
        });

        chunk
    }

    fn take_call(&self) -> Option<ErrorSpec> {
        let mut state = self.state.lock().unwrap();
        state.call_count += 1;
        let call_count = state.call_count;
        if let Some((nth, _)) = &state.error_injection {
            if *nth == call_count {
                return state.error_injection.take().map(|(_, err)| err);
            }
        }
        None
    }
}

#[async_trait]
impl NoteStoreClient for FakeNoteStore {
    async fn get_sync_state(&self, _ctx: &crate::rpc::RequestContext) -> Result<SyncState, RpcError> {
        let state = self.state.lock().unwrap();
        Ok(SyncState {
            update_count: state.next_usn,
            full_sync_before: state.full_sync_before,
            user_last_updated: None,
            current_time: Utc::now(),
        })
    }

    async fn get_filtered_sync_chunk(
        &self,
        after_usn: Usn,
        max_entries: u32,
        filter: &SyncChunkFilter,
        _ctx: &crate::rpc::RequestContext,
    ) -> Result<SyncChunk, RpcError> {
        if let Some(err) = self.take_call() {
            return Err(err.into_rpc_error());
        }

        let scripted = {
            let mut state = self.state.lock().unwrap();
            state.scripted_chunks.as_mut().and_then(|q| q.pop_front())
        };
        if let Some(scripted) = scripted {
            return match scripted {
                ScriptedChunk::Ok(chunk) => Ok(chunk),
                ScriptedChunk::Err(err) => Err(err),
            };
        }

        Ok(self.build_chunk(after_usn, max_entries, filter))
    }

    async fn get_linked_notebook_sync_state(
        &self,
        _linked_notebook: &LinkedNotebook,
        ctx: &crate::rpc::RequestContext,
    ) -> Result<SyncState, RpcError> {
        self.get_sync_state(ctx).await
    }

    async fn get_linked_notebook_sync_chunk(
        &self,
        _linked_notebook: &LinkedNotebook,
        after_usn: Usn,
        max_entries: u32,
        filter: &SyncChunkFilter,
        ctx: &crate::rpc::RequestContext,
    ) -> Result<SyncChunk, RpcError> {
        self.get_filtered_sync_chunk(after_usn, max_entries, filter, ctx).await
    }

    async fn get_note_with_result_spec(
        &self,
        guid: &str,
        _spec: NoteResultSpec,
        _ctx: &crate::rpc::RequestContext,
    ) -> Result<Note, RpcError> {
        let state = self.state.lock().unwrap();
        state
            .log
            .iter()
            .find_map(|(_, record)| match record {
                Record::Note(n) if n.id.guid() == Some(guid) => Some(n.clone()),
                _ => None,
            })
            .ok_or_else(|| RpcError::NotFound { identifier: guid.to_string(), key: None })
    }

    async fn get_resource(
        &self,
        guid: &str,
        _flags: ResourceFetchFlags,
        _ctx: &crate::rpc::RequestContext,
    ) -> Result<Resource, RpcError> {
        let state = self.state.lock().unwrap();
        state
            .log
            .iter()
            .find_map(|(_, record)| match record {
                Record::Resource(r) if r.id.guid() == Some(guid) => Some(r.clone()),
                _ => None,
            })
            .ok_or_else(|| RpcError::NotFound { identifier: guid.to_string(), key: None })
    }

    async fn create_notebook(
        &self,
        mut notebook: Notebook,
        _linked_notebook_guid: Option<&str>,
        _ctx: &crate::rpc::RequestContext,
    ) -> Result<Notebook, RpcError> {
        let mut state = self.state.lock().unwrap();
        let guid = state.next_guid("notebook");
        let usn = state.next_usn();
        notebook.id = ItemId::Guid(guid.clone());
        notebook.usn = Some(usn);
        notebook.locally_modified = false;
        state.log.push((usn, Record::Notebook(notebook.clone())));
        Ok(notebook)
    }

    async fn update_notebook(
        &self,
        notebook: Notebook,
        _linked_notebook_guid: Option<&str>,
        _ctx: &crate::rpc::RequestContext,
    ) -> Result<Usn, RpcError> {
        let mut state = self.state.lock().unwrap();
        let usn = state.next_usn();
        let mut notebook = notebook;
        notebook.usn = Some(usn);
        notebook.locally_modified = false;
        state.log.push((usn, Record::Notebook(notebook)));
        Ok(usn)
    }

    async fn create_tag(
        &self,
        mut tag: Tag,
        _linked_notebook_guid: Option<&str>,
        _ctx: &crate::rpc::RequestContext,
    ) -> Result<Tag, RpcError> {
        let mut state = self.state.lock().unwrap();
        let guid = state.next_guid("tag");
        let usn = state.next_usn();
        tag.id = ItemId::Guid(guid.clone());
        tag.usn = Some(usn);
        tag.locally_modified = false;
        state.log.push((usn, Record::Tag(tag.clone())));
        Ok(tag)
    }

    async fn update_tag(
        &self,
        tag: Tag,
        _linked_notebook_guid: Option<&str>,
        _ctx: &crate::rpc::RequestContext,
    ) -> Result<Usn, RpcError> {
        let mut state = self.state.lock().unwrap();
        let usn = state.next_usn();
        let mut tag = tag;
        tag.usn = Some(usn);
        tag.locally_modified = false;
        state.log.push((usn, Record::Tag(tag)));
        Ok(usn)
    }

    async fn create_note(&self, mut note: Note, _ctx: &crate::rpc::RequestContext) -> Result<Note, RpcError> {
        let mut state = self.state.lock().unwrap();
        let guid = state.next_guid("note");
        let usn = state.next_usn();
        note.id = ItemId::Guid(guid.clone());
        note.usn = Some(usn);
        note.locally_modified = false;
        state.log.push((usn, Record::Note(note.clone())));
        Ok(note)
    }

    async fn update_note(&self, note: Note, _ctx: &crate::rpc::RequestContext) -> Result<Usn, RpcError> {
        let mut state = self.state.lock().unwrap();
        let usn = state.next_usn();
        let mut note = note;
        note.usn = Some(usn);
        note.locally_modified = false;
        state.log.push((usn, Record::Note(note)));
        Ok(usn)
    }

    async fn create_saved_search(
        &self,
        mut search: SavedSearch,
        _ctx: &crate::rpc::RequestContext,
    ) -> Result<SavedSearch, RpcError> {
        let mut state = self.state.lock().unwrap();
        let guid = state.next_guid("search");
        let usn = state.next_usn();
        search.id = ItemId::Guid(guid.clone());
        search.usn = Some(usn);
        search.locally_modified = false;
        state.log.push((usn, Record::SavedSearch(search.clone())));
        Ok(search)
    }

    async fn update_saved_search(
        &self,
        search: SavedSearch,
        _ctx: &crate::rpc::RequestContext,
    ) -> Result<Usn, RpcError> {
        let mut state = self.state.lock().unwrap();
        let usn = state.next_usn();
        let mut search = search;
        search.usn = Some(usn);
        search.locally_modified = false;
        state.log.push((usn, Record::SavedSearch(search)));
        Ok(usn)
    }

    async fn authenticate_to_shared_notebook(
        &self,
        _share_key_or_global_id: &str,
        _ctx: &crate::rpc::RequestContext,
    ) -> Result<AuthenticationResult, RpcError> {
        Ok(AuthenticationResult {
            auth_token: "fake-shared-notebook-token".to_string(),
            current_time: Utc::now(),
            expiration: Utc::now() + chrono::Duration::hours(1),
        })
    }
}

/// An in-memory fake user-store. `check_version` always succeeds; `get_user` returns whatever
/// profile the test configured (or a default one).
pub struct FakeUserStore {
    profile: UserProfile,
    version_ok: Mutex<bool>,
}

impl Default for FakeUserStore {
    fn default() -> Self {
        Self {
            profile: UserProfile { id: 1, username: "fake-user".to_string(), shard_id: Some("s1".to_string()) },
            version_ok: Mutex::new(true),
        }
    }
}

impl FakeUserStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_profile(profile: UserProfile) -> Self {
        Self { profile, version_ok: Mutex::new(true) }
    }

    pub fn set_version_ok(&self, ok: bool) {
        *self.version_ok.lock().unwrap() = ok;
    }
}

#[async_trait]
impl crate::rpc::UserStoreClient for FakeUserStore {
    async fn check_version(
        &self,
        _client_name: &str,
        _edam_version_major: i16,
        _edam_version_minor: i16,
    ) -> Result<bool, RpcError> {
        Ok(*self.version_ok.lock().unwrap())
    }

    async fn get_user(&self) -> Result<UserProfile, RpcError> {
        Ok(self.profile.clone())
    }
}

/// Builds [`FakeNoteStore`] clients for tests driving the full [`crate::sync::SyncEngine`].
///
/// The simplest useful fake: a single shared note store serves every scope (user-own and every
/// linked notebook), since the integration tests care about the Orchestrator's own logic, not
/// about routing requests to distinct endpoints (that's `NoteStoreClientFactory`'s whole job in
/// a real transport, not something this crate's tests need to exercise).
pub struct FakeNoteStoreClientFactory {
    note_store: std::sync::Arc<FakeNoteStore>,
}

impl FakeNoteStoreClientFactory {
    pub fn new(note_store: std::sync::Arc<FakeNoteStore>) -> Self {
        Self { note_store }
    }
}

impl crate::rpc::NoteStoreClientFactory for FakeNoteStoreClientFactory {
    fn client_for(&self, _auth: &crate::auth::AuthInfo) -> std::sync::Arc<dyn NoteStoreClient> {
        self.note_store.clone()
    }
}
