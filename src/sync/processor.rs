//! Applies a stream of sync chunks to local storage in dependency order (spec §4.3).

use std::collections::HashSet;

use tracing::{debug, warn};

use crate::{
    errors::SyncError,
    rpc::domain::SyncChunk,
    store::{Affiliation, ListFilter, LocalStorage, NoteFetchFlags, TagNotesRelation},
    types::{Guid, ItemId, LinkedNotebook, Note, Notebook, Resource, SavedSearch, Scope, Tag},
};

use super::{conflict::ConflictResolver, state::SyncChunksDataCounters};

/// An item whose full content/binary body still needs to be fetched by the full-data
/// downloader (spec §4.4), along with whether its metadata row is brand new this session (vs an
/// update to a note/resource the store already knew about) — feeds `DownloadNotesStatus`'s and
/// `DownloadResourcesStatus`'s new/updated split.
#[derive(Clone, Debug)]
pub struct PendingDownload {
    pub guid: Guid,
    pub is_new: bool,
}

/// Applies chunks to local storage in the dependency order spec §4.3 requires: expunges, saved
/// searches, linked notebooks, tags (two-pass), notebooks, notes, resources.
///
/// One processor is constructed per scope session and fed every chunk downloaded for that scope
/// in order; `pending_tags` survives across `apply_chunk` calls (spec §4.3: "items whose parent
/// is still unknown after the pass remain pending across chunks within the same scope session"),
/// so the processor is a stateful struct rather than a free function.
pub struct SyncChunksProcessor<'a> {
    store: &'a dyn LocalStorage,
    resolver: ConflictResolver,
    scope: Scope,
    counters: SyncChunksDataCounters,
    pending_tags: Vec<Tag>,
    seen_saved_searches: HashSet<Guid>,
    seen_tags: HashSet<Guid>,
    seen_notebooks: HashSet<Guid>,
    seen_notes: HashSet<Guid>,
    seen_resources: HashSet<Guid>,
    seen_linked_notebooks: HashSet<Guid>,
    pending_note_downloads: Vec<PendingDownload>,
    pending_resource_downloads: Vec<PendingDownload>,
}

impl<'a> SyncChunksProcessor<'a> {
    pub fn new(store: &'a dyn LocalStorage, scope: Scope) -> Self {
        Self {
            store,
            resolver: ConflictResolver::new(),
            scope,
            counters: SyncChunksDataCounters::default(),
            pending_tags: Vec::new(),
            seen_saved_searches: HashSet::new(),
            seen_tags: HashSet::new(),
            seen_notebooks: HashSet::new(),
            seen_notes: HashSet::new(),
            seen_resources: HashSet::new(),
            seen_linked_notebooks: HashSet::new(),
            pending_note_downloads: Vec::new(),
            pending_resource_downloads: Vec::new(),
        }
    }

    pub fn counters(&self) -> &SyncChunksDataCounters {
        &self.counters
    }

    /// Guids of every note/resource whose full content the caller must still fetch (spec §4.4),
    /// accumulated across every `apply_chunk` call so far. Draining leaves the processor's own
    /// bookkeeping untouched — callers take a copy once per scope session.
    pub fn take_pending_note_downloads(&mut self) -> Vec<PendingDownload> {
        std::mem::take(&mut self.pending_note_downloads)
    }

    pub fn take_pending_resource_downloads(&mut self) -> Vec<PendingDownload> {
        std::mem::take(&mut self.pending_resource_downloads)
    }

    /// Applies one chunk in full dependency order.
    pub async fn apply_chunk(&mut self, chunk: SyncChunk) -> Result<(), SyncError> {
        self.apply_expunges(&chunk).await?;

        if self.scope.is_user_own() {
            self.apply_saved_searches(sorted_by_usn(chunk.saved_searches)).await?;
            self.apply_linked_notebooks(sorted_by_usn(chunk.linked_notebooks)).await?;
        }

        self.apply_tags(sorted_by_usn(chunk.tags)).await?;
        self.apply_notebooks(sorted_by_usn(chunk.notebooks)).await?;
        self.apply_notes(sorted_by_usn(chunk.notes)).await?;
        self.apply_resources(sorted_by_usn(chunk.resources)).await?;

        Ok(())
    }

    /// Flushes any tags still waiting on a parent at the end of the scope session, applying them
    /// anyway and recording a protocol violation for each (SPEC_FULL §4.3 addition — the source
    /// gives no explicit end-of-session behavior for orphaned tags).
    pub async fn finish(mut self) -> Result<SyncChunksDataCounters, SyncError> {
        let pending = std::mem::take(&mut self.pending_tags);
        for tag in pending {
            warn!(
                guid = ?tag.id.guid(),
                parent = ?tag.parent_guid,
                "tag's parent never arrived in this scope session, applying without resolution",
            );
            self.store_tag(tag).await?;
        }
        Ok(self.counters)
    }

    /// Every guid of kind `K` observed (created/updated) during this scope session, used by the
    /// orchestrator's full-sync local reconciliation (spec §4.8: guids present locally but
    /// absent from the server-returned set must be expunged).
    pub fn seen_notebooks(&self) -> &HashSet<Guid> {
        &self.seen_notebooks
    }
    pub fn seen_tags(&self) -> &HashSet<Guid> {
        &self.seen_tags
    }
    pub fn seen_saved_searches(&self) -> &HashSet<Guid> {
        &self.seen_saved_searches
    }
    pub fn seen_notes(&self) -> &HashSet<Guid> {
        &self.seen_notes
    }
    pub fn seen_resources(&self) -> &HashSet<Guid> {
        &self.seen_resources
    }
    pub fn seen_linked_notebooks(&self) -> &HashSet<Guid> {
        &self.seen_linked_notebooks
    }

    // EXPUNGES
    // --------------------------------------------------------------------------------------------

    async fn apply_expunges(&mut self, chunk: &SyncChunk) -> Result<(), SyncError> {
        for guid in &chunk.expunged_saved_searches {
            if let Some(local) = self.store.find_saved_search(guid).await? {
                if local.locally_modified {
                    self.requeue_as_new_saved_search(local).await?;
                }
            }
            self.store.remove_saved_search(guid).await?;
            self.store.record_expunged(&self.scope, guid).await?;
            self.counters.total_expunged_saved_searches += 1;
        }

        for guid in &chunk.expunged_tags {
            if let Some(local) = self.store.find_tag(guid).await? {
                if local.locally_modified {
                    self.requeue_as_new_tag(local).await?;
                }
            }
            self.store.remove_tag(guid).await?;
            self.store.record_expunged(&self.scope, guid).await?;
            self.counters.total_expunged_tags += 1;
        }

        for guid in &chunk.expunged_notebooks {
            if let Some(local) = self.store.find_notebook(guid).await? {
                if local.locally_modified {
                    self.requeue_as_new_notebook(local).await?;
                }
            }
            self.store.remove_notebook(guid).await?;
            self.store.record_expunged(&self.scope, guid).await?;
            self.counters.total_expunged_notebooks += 1;
        }

        for guid in &chunk.expunged_notes {
            if let Some(local) = self.store.find_note(guid, NoteFetchFlags::default()).await? {
                if local.locally_modified {
                    self.requeue_as_new_note(local).await?;
                }
            }
            self.store.remove_note(guid).await?;
            self.store.record_expunged(&self.scope, guid).await?;
            self.counters.total_expunged_notes += 1;
        }

        for guid in &chunk.expunged_linked_notebooks {
            self.store.remove_linked_notebook(guid).await?;
            self.store.record_expunged(&self.scope, guid).await?;
            self.counters.total_expunged_linked_notebooks += 1;
        }

        Ok(())
    }

    /// A locally modified item whose guid the server just expunged is not silently dropped: it
    /// becomes a fresh local-only item so the Sender later re-creates it (spec §4.3 "any locally
    /// modified copy becomes a conflict").
    async fn requeue_as_new_saved_search(&self, mut item: SavedSearch) -> Result<(), SyncError> {
        item.id = ItemId::Local(uuid::Uuid::new_v4());
        item.usn = None;
        item.locally_modified = true;
        self.store.put_saved_search(item).await?;
        Ok(())
    }

    async fn requeue_as_new_tag(&self, mut item: Tag) -> Result<(), SyncError> {
        item.id = ItemId::Local(uuid::Uuid::new_v4());
        item.usn = None;
        item.locally_modified = true;
        self.store.put_tag(item).await?;
        Ok(())
    }

    async fn requeue_as_new_notebook(&self, mut item: Notebook) -> Result<(), SyncError> {
        item.id = ItemId::Local(uuid::Uuid::new_v4());
        item.usn = None;
        item.locally_modified = true;
        self.store.put_notebook(item).await?;
        Ok(())
    }

    async fn requeue_as_new_note(&self, mut item: Note) -> Result<(), SyncError> {
        item.id = ItemId::Local(uuid::Uuid::new_v4());
        item.usn = None;
        item.locally_modified = true;
        self.store.put_note(item).await?;
        Ok(())
    }

    // SAVED SEARCHES
    // --------------------------------------------------------------------------------------------

    async fn apply_saved_searches(&mut self, items: Vec<SavedSearch>) -> Result<(), SyncError> {
        for incoming in items {
            let Some(guid) = incoming.id.guid().map(|g| g.to_string()) else {
                continue;
            };
            self.seen_saved_searches.insert(guid.clone());

            let local = self.store.find_saved_search(&guid).await?;
            if is_stale(&local, incoming.usn) {
                continue;
            }

            match local {
                Some(local) if local.locally_modified && saved_search_differs(&local, &incoming) => {
                    let resolved = self.resolver.resolve_saved_search(incoming, local);
                    self.store.put_saved_search(resolved.server).await?;
                    self.store.put_saved_search(resolved.renamed_local).await?;
                },
                _ => {
                    self.store.put_saved_search(incoming).await?;
                },
            }
            self.counters.total_saved_searches += 1;
        }
        Ok(())
    }

    // LINKED NOTEBOOKS
    // --------------------------------------------------------------------------------------------

    async fn apply_linked_notebooks(&mut self, items: Vec<LinkedNotebook>) -> Result<(), SyncError> {
        for incoming in items {
            self.seen_linked_notebooks.insert(incoming.guid.clone());
            let local = self.store.find_linked_notebook(&incoming.guid).await?;
            let resolved = match local {
                Some(local) => self.resolver.resolve_linked_notebook(incoming, local),
                None => incoming,
            };
            self.store.put_linked_notebook(resolved).await?;
            self.counters.total_linked_notebooks += 1;
        }
        Ok(())
    }

    // TAGS (two-pass)
    // --------------------------------------------------------------------------------------------

    async fn apply_tags(&mut self, items: Vec<Tag>) -> Result<(), SyncError> {
        let mut ready = Vec::new();
        let mut deferred = Vec::new();

        for incoming in self.pending_tags.drain(..).chain(items) {
            if self.parent_known(&incoming).await? {
                ready.push(incoming);
            } else {
                deferred.push(incoming);
            }
        }

        // Second pass: parents in `ready` may resolve some of `deferred` once stored.
        for incoming in ready {
            self.apply_one_tag(incoming).await?;
        }

        let mut still_deferred = Vec::new();
        for incoming in deferred {
            if self.parent_known(&incoming).await? {
                self.apply_one_tag(incoming).await?;
            } else {
                still_deferred.push(incoming);
            }
        }

        self.counters.total_deferred_tags += still_deferred.len() as u64;
        self.pending_tags = still_deferred;
        Ok(())
    }

    async fn parent_known(&self, tag: &Tag) -> Result<bool, SyncError> {
        match &tag.parent_guid {
            None => Ok(true),
            Some(parent) => Ok(self.store.find_tag(parent).await?.is_some()),
        }
    }

    async fn apply_one_tag(&mut self, incoming: Tag) -> Result<(), SyncError> {
        let Some(guid) = incoming.id.guid().map(|g| g.to_string()) else {
            return self.store_tag(incoming).await;
        };
        self.seen_tags.insert(guid.clone());

        let local = self.store.find_tag(&guid).await?;
        if is_stale(&local, incoming.usn) {
            return Ok(());
        }

        match local {
            Some(local) if local.locally_modified && tag_differs(&local, &incoming) => {
                let resolved = self.resolver.resolve_tag(incoming, local);
                self.store.put_tag(resolved.server).await?;
                self.store.put_tag(resolved.renamed_local).await?;
            },
            _ => {
                self.store.put_tag(incoming).await?;
            },
        }
        self.counters.total_tags += 1;
        Ok(())
    }

    async fn store_tag(&self, tag: Tag) -> Result<(), SyncError> {
        self.store.put_tag(tag).await?;
        Ok(())
    }

    // NOTEBOOKS
    // --------------------------------------------------------------------------------------------

    async fn apply_notebooks(&mut self, items: Vec<Notebook>) -> Result<(), SyncError> {
        for incoming in items {
            let Some(guid) = incoming.id.guid().map(|g| g.to_string()) else {
                continue;
            };
            self.seen_notebooks.insert(guid.clone());

            let local = self.store.find_notebook(&guid).await?;
            if is_stale(&local, incoming.usn) {
                continue;
            }

            match local {
                Some(local) if local.locally_modified && notebook_differs(&local, &incoming) => {
                    let resolved = self.resolver.resolve_notebook(incoming, local);
                    self.store.put_notebook(resolved.server).await?;
                    self.store.put_notebook(resolved.renamed_local).await?;
                },
                _ => {
                    self.store.put_notebook(incoming).await?;
                },
            }
            self.counters.total_notebooks += 1;
        }
        Ok(())
    }

    // NOTES
    // --------------------------------------------------------------------------------------------

    async fn apply_notes(&mut self, items: Vec<Note>) -> Result<(), SyncError> {
        for mut incoming in items {
            let Some(guid) = incoming.id.guid().map(|g| g.to_string()) else {
                continue;
            };
            self.seen_notes.insert(guid.clone());

            if incoming.notebook_id.guid().is_some()
                && self.store.find_notebook(incoming.notebook_id.guid().unwrap()).await?.is_none()
            {
                warn!(note = %guid, "note references a notebook not yet known in this scope");
            }

            incoming.tag_guids = self.drop_unknown_tags(incoming.tag_guids).await?;
            incoming.needs_content = true;

            let local = self.store.find_note(&guid, NoteFetchFlags::default()).await?;
            if is_stale(&local, incoming.usn) {
                continue;
            }

            let is_new = local.is_none();
            match local {
                Some(local) if local.locally_modified && note_differs(&local, &incoming) => {
                    let (conflict_copy, server_version) = self.resolver.resolve_note(incoming, local);
                    self.store.put_note(conflict_copy).await?;
                    self.store.put_note(server_version).await?;
                },
                _ => {
                    self.store.put_note(incoming).await?;
                },
            }

            self.pending_note_downloads.push(PendingDownload { guid: guid.clone(), is_new });
            self.counters.total_notes += 1;
        }
        Ok(())
    }

    async fn drop_unknown_tags(&self, tag_ids: Vec<ItemId>) -> Result<Vec<ItemId>, SyncError> {
        let mut kept = Vec::with_capacity(tag_ids.len());
        for tag_id in tag_ids {
            match tag_id.guid() {
                Some(guid) => {
                    if self.store.find_tag(guid).await?.is_some() {
                        kept.push(tag_id);
                    } else {
                        debug!(tag = %guid, "dropping note's reference to an unknown tag");
                    }
                },
                None => kept.push(tag_id),
            }
        }
        Ok(kept)
    }

    // RESOURCES
    // --------------------------------------------------------------------------------------------

    async fn apply_resources(&mut self, items: Vec<Resource>) -> Result<(), SyncError> {
        for mut incoming in items {
            let Some(guid) = incoming.id.guid().map(|g| g.to_string()) else {
                continue;
            };
            self.seen_resources.insert(guid.clone());

            if let Some(note_guid) = incoming.note_id.guid() {
                if self.store.find_note(note_guid, NoteFetchFlags::default()).await?.is_none() {
                    warn!(resource = %guid, "resource references a note not yet known in this scope");
                }
            }

            let local = self.store.find_resource(&guid).await?;
            if is_stale(&local, incoming.usn) {
                continue;
            }
            let is_new = local.is_none();

            // Resources never get a conflict copy (spec §4.5): the server version always wins.
            incoming.needs_content = true;
            self.store.put_resource(incoming).await?;

            self.pending_resource_downloads.push(PendingDownload { guid: guid.clone(), is_new });
            self.counters.total_resources += 1;
        }
        Ok(())
    }

    // FULL-SYNC CLEANUP
    // --------------------------------------------------------------------------------------------

    /// Expunges local guids of kind `notebooks`/`tags`/`notes`/`saved_searches` that exist
    /// locally but were not observed anywhere in this full-sync session (spec §4.8: "a full sync
    /// additionally triggers local reconciliation").
    pub async fn full_sync_cleanup(&self) -> Result<(), SyncError> {
        let affiliation = match &self.scope {
            Scope::UserOwn => Affiliation::User,
            Scope::LinkedNotebook(guid) => Affiliation::Specific(guid.clone()),
        };

        for search in self.store.list_saved_searches(&ListFilter::all(affiliation.clone())).await? {
            if let Some(guid) = search.id.guid() {
                if !self.seen_saved_searches.contains(guid) {
                    self.store.remove_saved_search(guid).await?;
                    self.store.record_expunged(&self.scope, guid).await?;
                }
            }
        }

        for tag in self.store.list_tags(&ListFilter::all(affiliation.clone())).await? {
            if let Some(guid) = tag.id.guid() {
                if !self.seen_tags.contains(guid) {
                    self.store.remove_tag(guid).await?;
                    self.store.record_expunged(&self.scope, guid).await?;
                }
            }
        }

        for notebook in self.store.list_notebooks(&ListFilter::all(affiliation.clone())).await? {
            if let Some(guid) = notebook.id.guid() {
                if !self.seen_notebooks.contains(guid) {
                    self.store.remove_notebook(guid).await?;
                    self.store.record_expunged(&self.scope, guid).await?;
                }
            }
        }

        for note in self
            .store
            .list_notes(&ListFilter::all(affiliation.clone()), NoteFetchFlags::default())
            .await?
        {
            if let Some(guid) = note.id.guid() {
                if !self.seen_notes.contains(guid) {
                    self.store.remove_note(guid).await?;
                    self.store.record_expunged(&self.scope, guid).await?;
                }
            }
        }

        for resource in self.store.list_resources(&ListFilter::all(affiliation)).await? {
            if let Some(guid) = resource.id.guid() {
                if !self.seen_resources.contains(guid) {
                    self.store.remove_resource(guid).await?;
                    self.store.record_expunged(&self.scope, guid).await?;
                }
            }
        }

        if self.scope.is_user_own() {
            for linked_notebook in self.store.list_linked_notebooks().await? {
                if !self.seen_linked_notebooks.contains(&linked_notebook.guid) {
                    self.store.remove_linked_notebook(&linked_notebook.guid).await?;
                    self.store.record_expunged(&self.scope, &linked_notebook.guid).await?;
                }
            }
        }

        Ok(())
    }

    /// Purges linked-notebook-scoped tags unreferenced by any note in that scope (spec invariant
    /// 8). Called once the linked notebook's chunk session has fully applied.
    pub async fn purge_noteless_linked_notebook_tags(&self) -> Result<(), SyncError> {
        let Scope::LinkedNotebook(guid) = &self.scope else {
            return Ok(());
        };
        let mut filter = ListFilter::all(Affiliation::Specific(guid.clone()));
        filter.tag_notes_relation = TagNotesRelation::WithoutNotes;
        for tag in self.store.list_tags(&filter).await? {
            if let Some(tag_guid) = tag.id.guid() {
                self.store.remove_tag(tag_guid).await?;
            }
        }
        Ok(())
    }
}

fn sorted_by_usn<T: HasUsn>(mut items: Vec<T>) -> Vec<T> {
    items.sort_by_key(|item| item.usn().unwrap_or(i32::MIN));
    items
}

trait HasUsn {
    fn usn(&self) -> Option<i32>;
}

impl HasUsn for SavedSearch {
    fn usn(&self) -> Option<i32> {
        self.usn
    }
}
impl HasUsn for Tag {
    fn usn(&self) -> Option<i32> {
        self.usn
    }
}
impl HasUsn for Notebook {
    fn usn(&self) -> Option<i32> {
        self.usn
    }
}
impl HasUsn for Note {
    fn usn(&self) -> Option<i32> {
        self.usn
    }
}
impl HasUsn for Resource {
    fn usn(&self) -> Option<i32> {
        self.usn
    }
}
impl HasUsn for LinkedNotebook {
    fn usn(&self) -> Option<i32> {
        None
    }
}

fn is_stale<T: HasUsn>(local: &Option<T>, incoming_usn: Option<i32>) -> bool {
    match (local, incoming_usn) {
        (Some(local), Some(incoming)) => match local.usn() {
            Some(local_usn) => incoming <= local_usn,
            None => false,
        },
        _ => false,
    }
}

fn saved_search_differs(local: &SavedSearch, incoming: &SavedSearch) -> bool {
    local.name != incoming.name || local.query != incoming.query || local.query_format != incoming.query_format
}

fn tag_differs(local: &Tag, incoming: &Tag) -> bool {
    local.name != incoming.name || local.parent_guid != incoming.parent_guid
}

fn notebook_differs(local: &Notebook, incoming: &Notebook) -> bool {
    local.name != incoming.name
        || local.stack != incoming.stack
        || local.is_default != incoming.is_default
        || local.published != incoming.published
}

fn note_differs(local: &Note, incoming: &Note) -> bool {
    local.title != incoming.title
        || local.content != incoming.content
        || local.notebook_id != incoming.notebook_id
        || local.tag_guids != incoming.tag_guids
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::fake_store::FakeStore;
    use crate::types::QueryFormat;

    fn search(guid: &str, usn: i32, name: &str) -> SavedSearch {
        SavedSearch {
            id: ItemId::Guid(guid.to_string()),
            usn: Some(usn),
            name: name.to_string(),
            query: name.to_string(),
            query_format: QueryFormat::UserQuery,
            locally_modified: false,
        }
    }

    #[tokio::test]
    async fn applies_new_saved_search() {
        let store = FakeStore::new();
        let mut processor = SyncChunksProcessor::new(&store, Scope::UserOwn);
        let chunk = SyncChunk {
            saved_searches: vec![search("s1", 1, "Saved search #1")],
            ..Default::default()
        };
        processor.apply_chunk(chunk).await.unwrap();
        assert_eq!(processor.counters().total_saved_searches, 1);
        assert!(store.find_saved_search("s1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn stale_update_is_dropped() {
        let store = FakeStore::new();
        store.put_saved_search(search("s1", 5, "current")).await.unwrap();
        let mut processor = SyncChunksProcessor::new(&store, Scope::UserOwn);
        let chunk = SyncChunk { saved_searches: vec![search("s1", 3, "stale")], ..Default::default() };
        processor.apply_chunk(chunk).await.unwrap();
        let stored = store.find_saved_search("s1").await.unwrap().unwrap();
        assert_eq!(stored.name, "current");
    }

    #[tokio::test]
    async fn conflicting_local_notebook_is_renamed() {
        let store = FakeStore::new();
        let mut local = Notebook {
            id: ItemId::Guid("nb1".into()),
            usn: Some(1),
            name: "A".into(),
            stack: None,
            is_default: false,
            published: false,
            scope: Scope::UserOwn,
            locally_modified: true,
        };
        store.put_notebook(local.clone()).await.unwrap();
        local.name = "B".into();
        local.usn = Some(2);
        local.locally_modified = false;

        let mut processor = SyncChunksProcessor::new(&store, Scope::UserOwn);
        processor
            .apply_chunk(SyncChunk { notebooks: vec![local], ..Default::default() })
            .await
            .unwrap();

        let stored = store.find_notebook("nb1").await.unwrap().unwrap();
        assert_eq!(stored.name, "B");
        assert!(!stored.locally_modified);

        let renamed = store
            .list_notebooks(&ListFilter::locally_modified(Affiliation::User))
            .await
            .unwrap();
        assert_eq!(renamed.len(), 1);
        assert_eq!(renamed[0].name, "A_2");
    }

    #[tokio::test]
    async fn two_pass_tags_resolve_parent_in_same_chunk() {
        let store = FakeStore::new();
        let mut processor = SyncChunksProcessor::new(&store, Scope::UserOwn);
        let parent = Tag {
            id: ItemId::Guid("t1".into()),
            usn: Some(1),
            name: "parent".into(),
            parent_guid: None,
            scope: Scope::UserOwn,
            locally_modified: false,
        };
        let child = Tag {
            id: ItemId::Guid("t2".into()),
            usn: Some(2),
            name: "child".into(),
            parent_guid: Some("t1".into()),
            scope: Scope::UserOwn,
            locally_modified: false,
        };
        // Child arrives before parent in the chunk; the two-pass strategy must still apply both.
        processor
            .apply_chunk(SyncChunk { tags: vec![child, parent], ..Default::default() })
            .await
            .unwrap();
        assert_eq!(processor.counters().total_tags, 2);
        assert_eq!(processor.counters().total_deferred_tags, 0);
        assert!(store.find_tag("t2").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn tag_pending_across_chunks_then_flushed() {
        let store = FakeStore::new();
        let mut processor = SyncChunksProcessor::new(&store, Scope::UserOwn);
        let orphan = Tag {
            id: ItemId::Guid("t2".into()),
            usn: Some(1),
            name: "child".into(),
            parent_guid: Some("never-arrives".into()),
            scope: Scope::UserOwn,
            locally_modified: false,
        };
        processor
            .apply_chunk(SyncChunk { tags: vec![orphan], ..Default::default() })
            .await
            .unwrap();
        assert_eq!(processor.counters().total_tags, 0);
        assert_eq!(processor.counters().total_deferred_tags, 1);

        let counters = processor.finish().await.unwrap();
        assert_eq!(counters.total_tags, 0);
        assert!(store.find_tag("t2").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn note_drops_unknown_tag_references() {
        let store = FakeStore::new();
        let mut processor = SyncChunksProcessor::new(&store, Scope::UserOwn);
        let note = Note {
            id: ItemId::Guid("n1".into()),
            usn: Some(1),
            title: "title".into(),
            content: None,
            notebook_id: ItemId::Guid("nb1".into()),
            tag_guids: vec![ItemId::Guid("unknown-tag".into())],
            attributes: Default::default(),
            active: true,
            needs_content: false,
            locally_modified: false,
        };
        processor.apply_chunk(SyncChunk { notes: vec![note], ..Default::default() }).await.unwrap();
        let stored = store.find_note("n1", NoteFetchFlags::default()).await.unwrap().unwrap();
        assert!(stored.tag_guids.is_empty());
        assert!(stored.needs_content);
    }

    #[tokio::test]
    async fn full_sync_cleanup_expunges_unseen_notebook() {
        let store = FakeStore::new();
        store
            .put_notebook(Notebook {
                id: ItemId::Guid("stale-nb".into()),
                usn: Some(1),
                name: "stale".into(),
                stack: None,
                is_default: false,
                published: false,
                scope: Scope::UserOwn,
                locally_modified: false,
            })
            .await
            .unwrap();

        let processor = SyncChunksProcessor::new(&store, Scope::UserOwn);
        processor.full_sync_cleanup().await.unwrap();

        assert!(store.find_notebook("stale-nb").await.unwrap().is_none());
        assert_eq!(store.list_expunged(&Scope::UserOwn).await.unwrap(), vec!["stale-nb".to_string()]);
    }

    #[tokio::test]
    async fn full_sync_cleanup_expunges_unseen_resources_and_linked_notebooks() {
        let store = FakeStore::new();
        store
            .put_resource(Resource {
                id: ItemId::Guid("stale-res".into()),
                usn: Some(1),
                note_id: ItemId::Guid("n1".into()),
                mime: "text/plain".into(),
                data: None,
                recognition: None,
                alternate_data: None,
                needs_content: false,
                locally_modified: false,
            })
            .await
            .unwrap();
        store
            .put_linked_notebook(LinkedNotebook {
                guid: "stale-ln".into(),
                share_id: None,
                share_key: None,
                shared_notebook_global_id: None,
                username: None,
                uri: None,
                note_store_url: "https://example.test/shard/notestore".into(),
                shard_id: None,
            })
            .await
            .unwrap();

        let processor = SyncChunksProcessor::new(&store, Scope::UserOwn);
        processor.full_sync_cleanup().await.unwrap();

        assert!(store.find_resource("stale-res").await.unwrap().is_none());
        assert!(store.find_linked_notebook("stale-ln").await.unwrap().is_none());
        let expunged = store.list_expunged(&Scope::UserOwn).await.unwrap();
        assert!(expunged.contains(&"stale-res".to_string()));
        assert!(expunged.contains(&"stale-ln".to_string()));
    }
}
