//! An in-memory [`LocalStorage`] implementation for tests, behind the `testing` feature (or
//! `cfg(test)` for this crate's own unit tests). Not a production backend.

use std::{collections::HashMap, sync::Mutex};

use async_trait::async_trait;

use crate::{
    store::{Affiliation, ListFilter, LocalStorage, NoteFetchFlags, StoreError, TagNotesRelation},
    types::{Guid, LinkedNotebook, Note, Notebook, Resource, SavedSearch, Scope, Tag},
};

#[derive(Default)]
struct Tables {
    saved_searches: HashMap<Guid, SavedSearch>,
    tags: HashMap<Guid, Tag>,
    notebooks: HashMap<Guid, Notebook>,
    notes: HashMap<Guid, Note>,
    resources: HashMap<Guid, Resource>,
    linked_notebooks: HashMap<Guid, LinkedNotebook>,
    expunged: HashMap<String, Vec<Guid>>,
}

/// An in-memory local store. Every table is keyed by guid; local-only items (no guid yet) are
/// tracked by their [`crate::types::LocalId`] stringified, since `HashMap<Guid, _>` needs some
/// string key and these items never collide with server guids (spec §3 lifecycle).
pub struct FakeStore {
    tables: Mutex<Tables>,
}

impl Default for FakeStore {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeStore {
    pub fn new() -> Self {
        Self { tables: Mutex::new(Tables::default()) }
    }

    fn key_for(id: &crate::types::ItemId) -> String {
        match id {
            crate::types::ItemId::Guid(g) => g.clone(),
            crate::types::ItemId::Local(id) => format!("local:{id}"),
        }
    }

    fn expunged_key(scope: &Scope) -> String {
        scope.to_string()
    }
}

#[async_trait]
impl LocalStorage for FakeStore {
    async fn put_saved_search(&self, search: SavedSearch) -> Result<(), StoreError> {
        let key = Self::key_for(&search.id);
        self.tables.lock().unwrap().saved_searches.insert(key, search);
        Ok(())
    }

    async fn find_saved_search(&self, guid: &str) -> Result<Option<SavedSearch>, StoreError> {
        Ok(self.tables.lock().unwrap().saved_searches.get(guid).cloned())
    }

    async fn remove_saved_search(&self, guid: &str) -> Result<(), StoreError> {
        self.tables.lock().unwrap().saved_searches.remove(guid);
        Ok(())
    }

    async fn list_saved_searches(&self, filter: &ListFilter) -> Result<Vec<SavedSearch>, StoreError> {
        let tables = self.tables.lock().unwrap();
        Ok(tables
            .saved_searches
            .values()
            .filter(|s| !filter.locally_modified || s.locally_modified)
            .filter(|s| !filter.local_only || matches!(s.id, crate::types::ItemId::Local(_)))
            .filter(|s| filter.matches_scope(&Scope::UserOwn))
            .cloned()
            .collect())
    }

    async fn put_tag(&self, tag: Tag) -> Result<(), StoreError> {
        let key = Self::key_for(&tag.id);
        self.tables.lock().unwrap().tags.insert(key, tag);
        Ok(())
    }

    async fn find_tag(&self, guid: &str) -> Result<Option<Tag>, StoreError> {
        Ok(self.tables.lock().unwrap().tags.get(guid).cloned())
    }

    async fn remove_tag(&self, guid: &str) -> Result<(), StoreError> {
        self.tables.lock().unwrap().tags.remove(guid);
        Ok(())
    }

    async fn list_tags(&self, filter: &ListFilter) -> Result<Vec<Tag>, StoreError> {
        let tables = self.tables.lock().unwrap();
        let notes: Vec<Tag> = tables
            .tags
            .values()
            .filter(|t| !filter.locally_modified || t.locally_modified)
            .filter(|t| !filter.local_only || matches!(t.id, crate::types::ItemId::Local(_)))
            .filter(|t| filter.matches_scope(&t.scope))
            .cloned()
            .collect();

        let filtered = match filter.tag_notes_relation {
            TagNotesRelation::Any => notes,
            TagNotesRelation::WithNotes => {
                let referenced: std::collections::HashSet<&str> = tables
                    .notes
                    .values()
                    .flat_map(|n| n.tag_guids.iter().filter_map(|g| g.guid()))
                    .collect();
                notes
                    .into_iter()
                    .filter(|t| t.id.guid().map(|g| referenced.contains(g)).unwrap_or(false))
                    .collect()
            },
            TagNotesRelation::WithoutNotes => {
                let referenced: std::collections::HashSet<&str> = tables
                    .notes
                    .values()
                    .flat_map(|n| n.tag_guids.iter().filter_map(|g| g.guid()))
                    .collect();
                notes
                    .into_iter()
                    .filter(|t| !t.id.guid().map(|g| referenced.contains(g)).unwrap_or(false))
                    .collect()
            },
        };
        Ok(filtered)
    }

    async fn put_notebook(&self, notebook: Notebook) -> Result<(), StoreError> {
        let key = Self::key_for(&notebook.id);
        self.tables.lock().unwrap().notebooks.insert(key, notebook);
        Ok(())
    }

    async fn find_notebook(&self, guid: &str) -> Result<Option<Notebook>, StoreError> {
        Ok(self.tables.lock().unwrap().notebooks.get(guid).cloned())
    }

    async fn remove_notebook(&self, guid: &str) -> Result<(), StoreError> {
        self.tables.lock().unwrap().notebooks.remove(guid);
        Ok(())
    }

    async fn list_notebooks(&self, filter: &ListFilter) -> Result<Vec<Notebook>, StoreError> {
        let tables = self.tables.lock().unwrap();
        Ok(tables
            .notebooks
            .values()
            .filter(|n| !filter.locally_modified || n.locally_modified)
            .filter(|n| !filter.local_only || matches!(n.id, crate::types::ItemId::Local(_)))
            .filter(|n| filter.matches_scope(&n.scope))
            .cloned()
            .collect())
    }

    async fn put_note(&self, note: Note) -> Result<(), StoreError> {
        let key = Self::key_for(&note.id);
        self.tables.lock().unwrap().notes.insert(key, note);
        Ok(())
    }

    async fn find_note(&self, guid: &str, _flags: NoteFetchFlags) -> Result<Option<Note>, StoreError> {
        Ok(self.tables.lock().unwrap().notes.get(guid).cloned())
    }

    async fn remove_note(&self, guid: &str) -> Result<(), StoreError> {
        self.tables.lock().unwrap().notes.remove(guid);
        Ok(())
    }

    async fn list_notes(&self, filter: &ListFilter, _flags: NoteFetchFlags) -> Result<Vec<Note>, StoreError> {
        let tables = self.tables.lock().unwrap();
        let notebook_scope = |notebook_id: &crate::types::ItemId| -> Scope {
            notebook_id
                .guid()
                .and_then(|g| tables.notebooks.get(g))
                .map(|n| n.scope.clone())
                .unwrap_or(Scope::UserOwn)
        };
        Ok(tables
            .notes
            .values()
            .filter(|n| !filter.locally_modified || n.locally_modified)
            .filter(|n| !filter.local_only || matches!(n.id, crate::types::ItemId::Local(_)))
            .filter(|n| filter.matches_scope(&notebook_scope(&n.notebook_id)))
            .cloned()
            .collect())
    }

    async fn list_notes_needing_content(&self, scope: &Scope) -> Result<Vec<Note>, StoreError> {
        let tables = self.tables.lock().unwrap();
        Ok(tables
            .notes
            .values()
            .filter(|n| n.needs_content)
            .filter(|n| {
                n.notebook_id
                    .guid()
                    .and_then(|g| tables.notebooks.get(g))
                    .map(|nb| &nb.scope == scope)
                    .unwrap_or(false)
            })
            .cloned()
            .collect())
    }

    async fn put_resource(&self, resource: Resource) -> Result<(), StoreError> {
        let key = Self::key_for(&resource.id);
        self.tables.lock().unwrap().resources.insert(key, resource);
        Ok(())
    }

    async fn find_resource(&self, guid: &str) -> Result<Option<Resource>, StoreError> {
        Ok(self.tables.lock().unwrap().resources.get(guid).cloned())
    }

    async fn remove_resource(&self, guid: &str) -> Result<(), StoreError> {
        self.tables.lock().unwrap().resources.remove(guid);
        Ok(())
    }

    async fn list_resources(&self, filter: &ListFilter) -> Result<Vec<Resource>, StoreError> {
        let tables = self.tables.lock().unwrap();
        Ok(tables
            .resources
            .values()
            .filter(|r| !filter.locally_modified || r.locally_modified)
            .filter(|r| !filter.local_only || matches!(r.id, crate::types::ItemId::Local(_)))
            .cloned()
            .collect())
    }

    async fn list_resources_needing_content(&self, scope: &Scope) -> Result<Vec<Resource>, StoreError> {
        let tables = self.tables.lock().unwrap();
        Ok(tables
            .resources
            .values()
            .filter(|r| r.needs_content)
            .filter(|r| {
                r.note_id
                    .guid()
                    .and_then(|g| tables.notes.get(g))
                    .and_then(|n| n.notebook_id.guid())
                    .and_then(|g| tables.notebooks.get(g))
                    .map(|nb| &nb.scope == scope)
                    .unwrap_or(false)
            })
            .cloned()
            .collect())
    }

    async fn put_linked_notebook(&self, linked_notebook: LinkedNotebook) -> Result<(), StoreError> {
        self.tables
            .lock()
            .unwrap()
            .linked_notebooks
            .insert(linked_notebook.guid.clone(), linked_notebook);
        Ok(())
    }

    async fn find_linked_notebook(&self, guid: &str) -> Result<Option<LinkedNotebook>, StoreError> {
        Ok(self.tables.lock().unwrap().linked_notebooks.get(guid).cloned())
    }

    async fn remove_linked_notebook(&self, guid: &str) -> Result<(), StoreError> {
        self.tables.lock().unwrap().linked_notebooks.remove(guid);
        Ok(())
    }

    async fn list_linked_notebooks(&self) -> Result<Vec<LinkedNotebook>, StoreError> {
        Ok(self.tables.lock().unwrap().linked_notebooks.values().cloned().collect())
    }

    async fn record_expunged(&self, scope: &Scope, guid: &str) -> Result<(), StoreError> {
        self.tables
            .lock()
            .unwrap()
            .expunged
            .entry(Self::expunged_key(scope))
            .or_default()
            .push(guid.to_string());
        Ok(())
    }

    async fn list_expunged(&self, scope: &Scope) -> Result<Vec<Guid>, StoreError> {
        Ok(self
            .tables
            .lock()
            .unwrap()
            .expunged
            .get(&Self::expunged_key(scope))
            .cloned()
            .unwrap_or_default())
    }
}
