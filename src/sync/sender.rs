//! Uploads locally new and locally modified items in dependency order (spec §4.6).

use std::collections::HashMap;

use tracing::{debug, warn};

use crate::{
    errors::SyncError,
    rpc::{NoteStoreClient, RequestContext, RpcError},
    store::{Affiliation, ListFilter, LocalStorage},
    types::{ItemId, Note, Notebook, SavedSearch, Scope, Tag},
};

use super::{
    state::{FailedSendItem, SendStatus, SerializableError},
    stop::{Canceler, StopSyncError},
};

/// A new local-only tag is only representable with a `Guid`-typed `parent_guid` field (spec §3
/// data model keeps `Tag::parent_guid: Option<Guid>`); this sender treats a new child tag whose
/// parent is also new-and-unsent by stashing the parent's [`crate::types::LocalId`] (stringified)
/// in that field until the parent is created and its real guid is known, at which point the
/// child's `parent_guid` is rewritten before it is uploaded. This is a local convention of this
/// crate, not a wire format — no such value ever reaches `create_tag`/`update_tag` unresolved.
fn local_ref(id: &ItemId) -> Option<String> {
    match id {
        ItemId::Local(uuid) => Some(uuid.to_string()),
        ItemId::Guid(_) => None,
    }
}

/// Drives the upload of one scope's locally-modified items (spec §4.6). At most one item is in
/// flight per scope (enforced structurally — this is a sequential `async fn`); cross-scope
/// concurrency is the caller's responsibility.
pub struct Sender<'a> {
    store: &'a dyn LocalStorage,
    canceler: &'a Canceler,
}

impl<'a> Sender<'a> {
    pub fn new(store: &'a dyn LocalStorage, canceler: &'a Canceler) -> Self {
        Self { store, canceler }
    }

    /// Sends everything locally modified in `scope`. `linked_notebook_guid` is `None` for the
    /// user-own scope and `Some` for a linked-notebook scope (threaded explicitly into
    /// `create_notebook`/`create_tag`/etc. rather than smuggled through the transport, per
    /// SPEC_FULL §9's redesign of the source's uri-smuggling pattern).
    ///
    /// `server_update_count_before` is the scope's `updateCount` as observed at the end of the
    /// last download phase; if a `getSyncState` call at the end of this send reports a higher
    /// value, `need_to_repeat_incremental_sync` is set (spec §4.6).
    pub async fn send_scope(
        &self,
        scope: &Scope,
        linked_notebook_guid: Option<&str>,
        note_store: &dyn NoteStoreClient,
        ctx: &RequestContext,
        server_update_count_before: crate::types::Usn,
    ) -> Result<SendStatus, SyncError> {
        let mut status = SendStatus::default();
        let affiliation = match scope {
            Scope::UserOwn => Affiliation::User,
            Scope::LinkedNotebook(guid) => Affiliation::Specific(guid.clone()),
        };

        if self.canceler.is_cancelled() {
            return Err(SyncError::OperationCanceled);
        }

        // 1. New saved searches (user-own only).
        if scope.is_user_own() {
            self.send_new_saved_searches(&affiliation, note_store, ctx, &mut status).await?;
        }

        // 2. New tags, topologically ordered by parent.
        let mut created_tag_guids: HashMap<String, String> = HashMap::new();
        self.send_new_tags(&affiliation, linked_notebook_guid, note_store, ctx, &mut status, &mut created_tag_guids)
            .await?;

        // 3. New notebooks.
        let mut created_notebook_guids: HashMap<String, String> = HashMap::new();
        self.send_new_notebooks(
            &affiliation,
            linked_notebook_guid,
            note_store,
            ctx,
            &mut status,
            &mut created_notebook_guids,
        )
        .await?;

        // Guid back-substitution: rewrite any pending note still referencing a notebook/tag by
        // its local id now that the create above learned its guid (spec §4.6).
        self.rewrite_note_references(&affiliation, &created_notebook_guids, &created_tag_guids)
            .await?;

        // 4. Modified saved searches, tags, notebooks.
        if scope.is_user_own() {
            self.send_modified_saved_searches(&affiliation, note_store, ctx, &mut status).await?;
        }
        self.send_modified_tags(&affiliation, linked_notebook_guid, note_store, ctx, &mut status)
            .await?;
        self.send_modified_notebooks(&affiliation, linked_notebook_guid, note_store, ctx, &mut status)
            .await?;

        // 5 & 6. New and modified notes.
        self.send_new_notes(&affiliation, note_store, ctx, &mut status).await?;
        self.send_modified_notes(&affiliation, note_store, ctx, &mut status).await?;

        if status.stop_synchronization_error.is_none() {
            match note_store.get_sync_state(ctx).await {
                Ok(state) if state.update_count > server_update_count_before => {
                    status.need_to_repeat_incremental_sync = true;
                },
                Ok(_) => {},
                Err(err) => {
                    if let Some(stop) = StopSyncError::from_rpc_error(&err) {
                        status.stop_synchronization_error = stop;
                    }
                },
            }
        }

        Ok(status)
    }

    // SAVED SEARCHES
    // --------------------------------------------------------------------------------------------

    async fn send_new_saved_searches(
        &self,
        affiliation: &Affiliation,
        note_store: &dyn NoteStoreClient,
        ctx: &RequestContext,
        status: &mut SendStatus,
    ) -> Result<(), SyncError> {
        let mut filter = ListFilter::locally_modified(affiliation.clone());
        filter.local_only = true;
        let items = self.store.list_saved_searches(&filter).await?;
        for item in items {
            if self.should_stop(status) {
                break;
            }
            let description = format!("saved search {}", item.name);
            match note_store.create_saved_search(item, ctx).await {
                Ok(created) => {
                    self.store.put_saved_search(created).await?;
                    status.saved_searches.record_attempt(true);
                },
                Err(err) => self.record_failure(status, SendKind::SavedSearch, description, err),
            }
        }
        Ok(())
    }

    async fn send_modified_saved_searches(
        &self,
        affiliation: &Affiliation,
        note_store: &dyn NoteStoreClient,
        ctx: &RequestContext,
        status: &mut SendStatus,
    ) -> Result<(), SyncError> {
        let filter = ListFilter::locally_modified(affiliation.clone());
        let items = self
            .store
            .list_saved_searches(&filter)
            .await?
            .into_iter()
            .filter(|s| s.id.guid().is_some());
        for item in items {
            if self.should_stop(status) {
                break;
            }
            let description = format!("saved search {}", item.name);
            match note_store.update_saved_search(item.clone(), ctx).await {
                Ok(usn) => {
                    let mut updated = item;
                    updated.usn = Some(usn);
                    updated.locally_modified = false;
                    self.store.put_saved_search(updated).await?;
                    status.saved_searches.record_attempt(true);
                },
                Err(err) => self.record_failure(status, SendKind::SavedSearch, description, err),
            }
        }
        Ok(())
    }

    // TAGS
    // --------------------------------------------------------------------------------------------

    async fn send_new_tags(
        &self,
        affiliation: &Affiliation,
        linked_notebook_guid: Option<&str>,
        note_store: &dyn NoteStoreClient,
        ctx: &RequestContext,
        status: &mut SendStatus,
        created_guids: &mut HashMap<String, String>,
    ) -> Result<(), SyncError> {
        let mut filter = ListFilter::locally_modified(affiliation.clone());
        filter.local_only = true;
        let mut pending = self.store.list_tags(&filter).await?;
        let mut iterations = pending.len() + 1;

        while !pending.is_empty() && iterations > 0 {
            iterations -= 1;
            let mut next_round = Vec::new();
            let mut made_progress = false;

            for mut tag in pending.drain(..) {
                if self.should_stop(status) {
                    next_round.push(tag);
                    continue;
                }

                let ready = match &tag.parent_guid {
                    None => true,
                    Some(parent) => {
                        if let Some(resolved) = created_guids.get(parent) {
                            tag.parent_guid = Some(resolved.clone());
                            true
                        } else {
                            self.store.find_tag(parent).await?.is_some()
                        }
                    },
                };

                if !ready {
                    next_round.push(tag);
                    continue;
                }

                made_progress = true;
                let local_key = local_ref(&tag.id);
                let description = format!("tag {}", tag.name);
                match note_store.create_tag(tag.clone(), linked_notebook_guid, ctx).await {
                    Ok(created) => {
                        if let (Some(local_key), Some(guid)) = (local_key, created.id.guid()) {
                            created_guids.insert(local_key, guid.to_string());
                        }
                        self.store.put_tag(created).await?;
                        status.tags.record_attempt(true);
                    },
                    Err(err) => self.record_failure(status, SendKind::Tag, description, err),
                }
            }

            if !made_progress {
                for tag in next_round {
                    status.failed_to_send.push(FailedSendItem {
                        item_description: format!("tag {}", tag.name),
                        error: SerializableError::RuntimeError(
                            "parent tag could not be resolved".to_string(),
                        ),
                    });
                }
                break;
            }
            pending = next_round;
        }

        Ok(())
    }

    async fn send_modified_tags(
        &self,
        affiliation: &Affiliation,
        linked_notebook_guid: Option<&str>,
        note_store: &dyn NoteStoreClient,
        ctx: &RequestContext,
        status: &mut SendStatus,
    ) -> Result<(), SyncError> {
        let filter = ListFilter::locally_modified(affiliation.clone());
        let items: Vec<Tag> = self
            .store
            .list_tags(&filter)
            .await?
            .into_iter()
            .filter(|t| t.id.guid().is_some())
            .collect();
        for item in items {
            if self.should_stop(status) {
                break;
            }
            let description = format!("tag {}", item.name);
            match note_store.update_tag(item.clone(), linked_notebook_guid, ctx).await {
                Ok(usn) => {
                    let mut updated = item;
                    updated.usn = Some(usn);
                    updated.locally_modified = false;
                    self.store.put_tag(updated).await?;
                    status.tags.record_attempt(true);
                },
                Err(err) => self.record_failure(status, SendKind::Tag, description, err),
            }
        }
        Ok(())
    }

    // NOTEBOOKS
    // --------------------------------------------------------------------------------------------

    async fn send_new_notebooks(
        &self,
        affiliation: &Affiliation,
        linked_notebook_guid: Option<&str>,
        note_store: &dyn NoteStoreClient,
        ctx: &RequestContext,
        status: &mut SendStatus,
        created_guids: &mut HashMap<String, String>,
    ) -> Result<(), SyncError> {
        let mut filter = ListFilter::locally_modified(affiliation.clone());
        filter.local_only = true;
        let items = self.store.list_notebooks(&filter).await?;
        for item in items {
            if self.should_stop(status) {
                break;
            }
            let local_key = local_ref(&item.id);
            let description = format!("notebook {}", item.name);
            match note_store.create_notebook(item, linked_notebook_guid, ctx).await {
                Ok(created) => {
                    if let (Some(local_key), Some(guid)) = (local_key, created.id.guid()) {
                        created_guids.insert(local_key, guid.to_string());
                    }
                    self.store.put_notebook(created).await?;
                    status.notebooks.record_attempt(true);
                },
                Err(err) => self.record_failure(status, SendKind::Notebook, description, err),
            }
        }
        Ok(())
    }

    /// After new notebooks/tags are created server-side, rewrites their guid into any
    /// locally-modified note that still points at the old local id, so `send_new_notes` can send
    /// it this same pass instead of deferring it forever (spec §4.6 guid back-substitution).
    async fn rewrite_note_references(
        &self,
        affiliation: &Affiliation,
        created_notebook_guids: &HashMap<String, String>,
        created_tag_guids: &HashMap<String, String>,
    ) -> Result<(), SyncError> {
        if created_notebook_guids.is_empty() && created_tag_guids.is_empty() {
            return Ok(());
        }

        let filter = ListFilter::locally_modified(affiliation.clone());
        let items = self
            .store
            .list_notes(&filter, crate::store::NoteFetchFlags { with_resource_metadata: false, with_resource_binary_data: false })
            .await?;

        for mut note in items {
            let mut changed = false;

            if let Some(local_key) = local_ref(&note.notebook_id) {
                if let Some(guid) = created_notebook_guids.get(&local_key) {
                    note.notebook_id = ItemId::Guid(guid.clone());
                    changed = true;
                }
            }

            for tag_id in &mut note.tag_guids {
                if let Some(local_key) = local_ref(tag_id) {
                    if let Some(guid) = created_tag_guids.get(&local_key) {
                        *tag_id = ItemId::Guid(guid.clone());
                        changed = true;
                    }
                }
            }

            if changed {
                self.store.put_note(note).await?;
            }
        }

        Ok(())
    }

    async fn send_modified_notebooks(
        &self,
        affiliation: &Affiliation,
        linked_notebook_guid: Option<&str>,
        note_store: &dyn NoteStoreClient,
        ctx: &RequestContext,
        status: &mut SendStatus,
    ) -> Result<(), SyncError> {
        let filter = ListFilter::locally_modified(affiliation.clone());
        let items: Vec<Notebook> = self
            .store
            .list_notebooks(&filter)
            .await?
            .into_iter()
            .filter(|n| n.id.guid().is_some())
            .collect();
        for item in items {
            if self.should_stop(status) {
                break;
            }
            let description = format!("notebook {}", item.name);
            match note_store.update_notebook(item.clone(), linked_notebook_guid, ctx).await {
                Ok(usn) => {
                    let mut updated = item;
                    updated.usn = Some(usn);
                    updated.locally_modified = false;
                    self.store.put_notebook(updated).await?;
                    status.notebooks.record_attempt(true);
                },
                Err(err) => self.record_failure(status, SendKind::Notebook, description, err),
            }
        }
        Ok(())
    }

    // NOTES
    // --------------------------------------------------------------------------------------------

    async fn send_new_notes(
        &self,
        affiliation: &Affiliation,
        note_store: &dyn NoteStoreClient,
        ctx: &RequestContext,
        status: &mut SendStatus,
    ) -> Result<(), SyncError> {
        let mut filter = ListFilter::locally_modified(affiliation.clone());
        filter.local_only = true;
        let items = self
            .store
            .list_notes(&filter, crate::store::NoteFetchFlags { with_resource_metadata: true, with_resource_binary_data: false })
            .await?;
        for item in items {
            if self.should_stop(status) {
                break;
            }
            // A new note can only be uploaded once its notebook has a server guid (spec §4.6).
            if item.notebook_id.guid().is_none() {
                debug!(note = item.title, "deferring new note until its notebook is created");
                continue;
            }
            let description = format!("note {}", item.title);
            match note_store.create_note(item, ctx).await {
                Ok(created) => {
                    self.store.put_note(created).await?;
                    status.notes.record_attempt(true);
                },
                Err(err) => self.record_failure(status, SendKind::Note, description, err),
            }
        }
        Ok(())
    }

    async fn send_modified_notes(
        &self,
        affiliation: &Affiliation,
        note_store: &dyn NoteStoreClient,
        ctx: &RequestContext,
        status: &mut SendStatus,
    ) -> Result<(), SyncError> {
        let filter = ListFilter::locally_modified(affiliation.clone());
        let items: Vec<Note> = self
            .store
            .list_notes(&filter, crate::store::NoteFetchFlags { with_resource_metadata: true, with_resource_binary_data: false })
            .await?
            .into_iter()
            .filter(|n| n.id.guid().is_some())
            .collect();
        for item in items {
            if self.should_stop(status) {
                break;
            }
            let description = format!("note {}", item.title);
            match note_store.update_note(item.clone(), ctx).await {
                Ok(usn) => {
                    let mut updated = item;
                    updated.usn = Some(usn);
                    updated.locally_modified = false;
                    self.store.put_note(updated).await?;
                    status.notes.record_attempt(true);
                },
                Err(err) => self.record_failure(status, SendKind::Note, description, err),
            }
        }
        Ok(())
    }

    // SHARED HELPERS
    // --------------------------------------------------------------------------------------------

    fn should_stop(&self, status: &SendStatus) -> bool {
        self.canceler.is_cancelled() || !status.stop_synchronization_error.is_none()
    }

    /// Records a failed upload attempt against the right counter in `status` and, if the error
    /// itself is a stop-sync trigger, sets `status.stop_synchronization_error` and cancels the
    /// run. Takes `kind` rather than a separate `&mut KindSendCounters` so the whole update goes
    /// through a single mutable borrow of `status`.
    fn record_failure(
        &self,
        status: &mut SendStatus,
        kind: SendKind,
        description: String,
        err: RpcError,
    ) {
        match kind {
            SendKind::SavedSearch => status.saved_searches.record_attempt(false),
            SendKind::Tag => status.tags.record_attempt(false),
            SendKind::Notebook => status.notebooks.record_attempt(false),
            SendKind::Note => status.notes.record_attempt(false),
        }
        if let Some(stop) = StopSyncError::from_rpc_error(&err) {
            warn!(item = %description, ?stop, "stop-sync signal while sending");
            status.stop_synchronization_error = stop;
            self.canceler.cancel();
            return;
        }
        status.failed_to_send.push(FailedSendItem {
            item_description: description,
            error: SerializableError::RuntimeError(err.to_string()),
        });
    }
}

#[derive(Clone, Copy)]
enum SendKind {
    SavedSearch,
    Tag,
    Notebook,
    Note,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{fake_rpc::FakeNoteStore, fake_store::FakeStore};
    use crate::types::QueryFormat;
    use uuid::Uuid;

    #[tokio::test]
    async fn sends_new_saved_search_and_records_guid() {
        let store = FakeStore::new();
        store
            .put_saved_search(SavedSearch {
                id: ItemId::Local(Uuid::new_v4()),
                usn: None,
                name: "My search".into(),
                query: "todo".into(),
                query_format: QueryFormat::UserQuery,
                locally_modified: true,
            })
            .await
            .unwrap();

        let fake = FakeNoteStore::new();
        let canceler = Canceler::new();
        let sender = Sender::new(&store, &canceler);
        let ctx = RequestContext::new(std::time::Duration::from_secs(5), 0, std::time::Duration::from_millis(1));

        let status = sender
            .send_scope(&Scope::UserOwn, None, &fake, &ctx, 0)
            .await
            .unwrap();

        assert_eq!(status.saved_searches.attempted, 1);
        assert_eq!(status.saved_searches.succeeded, 1);

        let remaining_local = store
            .list_saved_searches(&ListFilter::all(Affiliation::User))
            .await
            .unwrap();
        assert!(remaining_local.iter().all(|s| s.id.guid().is_some()));
    }

    #[tokio::test]
    async fn topologically_orders_new_tags_by_parent() {
        let store = FakeStore::new();
        let parent_local_id = Uuid::new_v4();
        let parent = Tag {
            id: ItemId::Local(parent_local_id),
            usn: None,
            name: "parent".into(),
            parent_guid: None,
            scope: Scope::UserOwn,
            locally_modified: true,
        };
        let child = Tag {
            id: ItemId::Local(Uuid::new_v4()),
            usn: None,
            name: "child".into(),
            parent_guid: Some(parent_local_id.to_string()),
            scope: Scope::UserOwn,
            locally_modified: true,
        };
        // Insert child first; the sender must still create parent before child.
        store.put_tag(child).await.unwrap();
        store.put_tag(parent).await.unwrap();

        let fake = FakeNoteStore::new();
        let canceler = Canceler::new();
        let sender = Sender::new(&store, &canceler);
        let ctx = RequestContext::new(std::time::Duration::from_secs(5), 0, std::time::Duration::from_millis(1));

        let status = sender.send_scope(&Scope::UserOwn, None, &fake, &ctx, 0).await.unwrap();

        assert_eq!(status.tags.succeeded, 2);
        assert!(status.failed_to_send.is_empty());

        let stored = store.list_tags(&ListFilter::all(Affiliation::User)).await.unwrap();
        let child = stored.iter().find(|t| t.name == "child").unwrap();
        assert!(child.parent_guid.as_deref().map(|p| p.starts_with("tag-")).unwrap_or(false));
    }

    #[tokio::test]
    async fn new_note_deferred_until_notebook_has_guid() {
        let store = FakeStore::new();
        store
            .put_note(Note {
                id: ItemId::Local(Uuid::new_v4()),
                usn: None,
                title: "orphan".into(),
                content: Some("<en-note/>".into()),
                notebook_id: ItemId::Local(Uuid::new_v4()),
                tag_guids: vec![],
                attributes: Default::default(),
                active: true,
                needs_content: false,
                locally_modified: true,
            })
            .await
            .unwrap();

        let fake = FakeNoteStore::new();
        let canceler = Canceler::new();
        let sender = Sender::new(&store, &canceler);
        let ctx = RequestContext::new(std::time::Duration::from_secs(5), 0, std::time::Duration::from_millis(1));

        let status = sender.send_scope(&Scope::UserOwn, None, &fake, &ctx, 0).await.unwrap();
        assert_eq!(status.notes.attempted, 0);
    }

    #[tokio::test]
    async fn new_note_becomes_sendable_once_its_new_notebook_is_created() {
        let store = FakeStore::new();
        let notebook_local_id = Uuid::new_v4();
        store
            .put_notebook(Notebook {
                id: ItemId::Local(notebook_local_id),
                usn: None,
                name: "new notebook".into(),
                stack: None,
                is_default: false,
                published: false,
                scope: Scope::UserOwn,
                locally_modified: true,
            })
            .await
            .unwrap();
        store
            .put_note(Note {
                id: ItemId::Local(Uuid::new_v4()),
                usn: None,
                title: "note in new notebook".into(),
                content: Some("<en-note/>".into()),
                notebook_id: ItemId::Local(notebook_local_id),
                tag_guids: vec![],
                attributes: Default::default(),
                active: true,
                needs_content: false,
                locally_modified: true,
            })
            .await
            .unwrap();

        let fake = FakeNoteStore::new();
        let canceler = Canceler::new();
        let sender = Sender::new(&store, &canceler);
        let ctx = RequestContext::new(std::time::Duration::from_secs(5), 0, std::time::Duration::from_millis(1));

        let status = sender.send_scope(&Scope::UserOwn, None, &fake, &ctx, 0).await.unwrap();

        assert_eq!(status.notebooks.succeeded, 1);
        assert_eq!(status.notes.attempted, 1);
        assert_eq!(status.notes.succeeded, 1);

        let stored = store.list_notes(&ListFilter::all(Affiliation::User), crate::store::NoteFetchFlags::default()).await.unwrap();
        assert_eq!(stored.len(), 1);
        assert!(stored[0].id.guid().is_some());
        assert!(stored[0].notebook_id.guid().is_some());
    }

    #[tokio::test]
    async fn new_note_becomes_sendable_once_its_new_tag_is_created() {
        let store = FakeStore::new();
        let notebook_guid = "nb-existing";
        store
            .put_notebook(Notebook {
                id: ItemId::Guid(notebook_guid.into()),
                usn: Some(1),
                name: "existing notebook".into(),
                stack: None,
                is_default: false,
                published: false,
                scope: Scope::UserOwn,
                locally_modified: false,
            })
            .await
            .unwrap();
        let tag_local_id = Uuid::new_v4();
        store
            .put_tag(Tag {
                id: ItemId::Local(tag_local_id),
                usn: None,
                name: "new tag".into(),
                parent_guid: None,
                scope: Scope::UserOwn,
                locally_modified: true,
            })
            .await
            .unwrap();
        store
            .put_note(Note {
                id: ItemId::Local(Uuid::new_v4()),
                usn: None,
                title: "tagged note".into(),
                content: Some("<en-note/>".into()),
                notebook_id: ItemId::Guid(notebook_guid.into()),
                tag_guids: vec![ItemId::Local(tag_local_id)],
                attributes: Default::default(),
                active: true,
                needs_content: false,
                locally_modified: true,
            })
            .await
            .unwrap();

        let fake = FakeNoteStore::new();
        let canceler = Canceler::new();
        let sender = Sender::new(&store, &canceler);
        let ctx = RequestContext::new(std::time::Duration::from_secs(5), 0, std::time::Duration::from_millis(1));

        let status = sender.send_scope(&Scope::UserOwn, None, &fake, &ctx, 0).await.unwrap();

        assert_eq!(status.tags.succeeded, 1);
        assert_eq!(status.notes.succeeded, 1);

        let stored = store.list_notes(&ListFilter::all(Affiliation::User), crate::store::NoteFetchFlags::default()).await.unwrap();
        assert_eq!(stored.len(), 1);
        assert!(stored[0].tag_guids.iter().all(|t| t.guid().is_some()));
    }
}
