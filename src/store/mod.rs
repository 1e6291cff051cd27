//! Defines the local storage interface the synchronization engine consumes.
//!
//! The concrete storage engine (spec §1 "local storage engine") is explicitly out of scope for
//! this crate; [`LocalStorage`] is the trait boundary a real implementation (a SQLite/IndexedDB
//! backend, in the style of the teacher's `sqlite_store`/`web_store`) is expected to satisfy.
//! `testing::fake_store` ships an in-memory implementation for tests.

mod errors;
pub use errors::StoreError;

use async_trait::async_trait;

use crate::types::{Guid, LinkedNotebook, Note, Notebook, Resource, SavedSearch, Scope, Tag};

// FILTERS
// ================================================================================================

/// Narrows a `list_*` query to a subset of the owning scope (spec §6 local storage surface).
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Affiliation {
    /// Only the user-own scope.
    User,
    /// Any linked-notebook scope.
    AnyLinkedNotebook,
    /// User-own and every linked-notebook scope.
    Any,
    /// One specific linked notebook, by guid.
    Specific(Guid),
}

impl Affiliation {
    fn matches(&self, scope: &Scope) -> bool {
        match (self, scope) {
            (Affiliation::User, Scope::UserOwn) => true,
            (Affiliation::User, Scope::LinkedNotebook(_)) => false,
            (Affiliation::AnyLinkedNotebook, Scope::LinkedNotebook(_)) => true,
            (Affiliation::AnyLinkedNotebook, Scope::UserOwn) => false,
            (Affiliation::Any, _) => true,
            (Affiliation::Specific(guid), Scope::LinkedNotebook(other)) => guid == other,
            (Affiliation::Specific(_), Scope::UserOwn) => false,
        }
    }
}

/// Whether a tag must (or must not) be referenced by at least one note (used when purging
/// noteless linked-notebook tags, spec invariant 8).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TagNotesRelation {
    WithNotes,
    WithoutNotes,
    Any,
}

#[derive(Clone, Debug)]
pub struct ListFilter {
    pub local_only: bool,
    pub locally_modified: bool,
    pub affiliation: Affiliation,
    pub tag_notes_relation: TagNotesRelation,
}

impl ListFilter {
    pub fn all(affiliation: Affiliation) -> Self {
        Self {
            local_only: false,
            locally_modified: false,
            affiliation,
            tag_notes_relation: TagNotesRelation::Any,
        }
    }

    pub fn locally_modified(affiliation: Affiliation) -> Self {
        Self {
            local_only: false,
            locally_modified: true,
            affiliation,
            tag_notes_relation: TagNotesRelation::Any,
        }
    }

    pub fn matches_scope(&self, scope: &Scope) -> bool {
        self.affiliation.matches(scope)
    }
}

/// Controls how much of a note's content the store returns/accepts (spec §6).
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct NoteFetchFlags {
    pub with_resource_metadata: bool,
    pub with_resource_binary_data: bool,
}

// STORE TRAIT
// ================================================================================================

/// The storage surface the synchronization engine consumes.
///
/// All methods are `&self`, not `&mut self`: ownership of the store is shared between
/// concurrently running scope pipelines (spec §5), so interior mutability (a mutex, a
/// connection pool) is expected of implementations.
#[async_trait]
pub trait LocalStorage: Send + Sync {
    // SAVED SEARCHES
    // --------------------------------------------------------------------------------------------
    async fn put_saved_search(&self, search: SavedSearch) -> Result<(), StoreError>;
    async fn find_saved_search(&self, guid: &str) -> Result<Option<SavedSearch>, StoreError>;
    async fn remove_saved_search(&self, guid: &str) -> Result<(), StoreError>;
    async fn list_saved_searches(
        &self,
        filter: &ListFilter,
    ) -> Result<Vec<SavedSearch>, StoreError>;

    // TAGS
    // --------------------------------------------------------------------------------------------
    async fn put_tag(&self, tag: Tag) -> Result<(), StoreError>;
    async fn find_tag(&self, guid: &str) -> Result<Option<Tag>, StoreError>;
    async fn remove_tag(&self, guid: &str) -> Result<(), StoreError>;
    async fn list_tags(&self, filter: &ListFilter) -> Result<Vec<Tag>, StoreError>;

    // NOTEBOOKS
    // --------------------------------------------------------------------------------------------
    async fn put_notebook(&self, notebook: Notebook) -> Result<(), StoreError>;
    async fn find_notebook(&self, guid: &str) -> Result<Option<Notebook>, StoreError>;
    async fn remove_notebook(&self, guid: &str) -> Result<(), StoreError>;
    async fn list_notebooks(&self, filter: &ListFilter) -> Result<Vec<Notebook>, StoreError>;

    // NOTES
    // --------------------------------------------------------------------------------------------
    async fn put_note(&self, note: Note) -> Result<(), StoreError>;
    async fn find_note(
        &self,
        guid: &str,
        flags: NoteFetchFlags,
    ) -> Result<Option<Note>, StoreError>;
    async fn remove_note(&self, guid: &str) -> Result<(), StoreError>;
    async fn list_notes(
        &self,
        filter: &ListFilter,
        flags: NoteFetchFlags,
    ) -> Result<Vec<Note>, StoreError>;
    /// Notes whose `needs_content` marker is still set for the given scope (feeds §4.4).
    async fn list_notes_needing_content(&self, scope: &Scope) -> Result<Vec<Note>, StoreError>;

    // RESOURCES
    // --------------------------------------------------------------------------------------------
    async fn put_resource(&self, resource: Resource) -> Result<(), StoreError>;
    async fn find_resource(&self, guid: &str) -> Result<Option<Resource>, StoreError>;
    async fn remove_resource(&self, guid: &str) -> Result<(), StoreError>;
    async fn list_resources(&self, filter: &ListFilter) -> Result<Vec<Resource>, StoreError>;
    async fn list_resources_needing_content(&self, scope: &Scope) -> Result<Vec<Resource>, StoreError>;

    // LINKED NOTEBOOKS
    // --------------------------------------------------------------------------------------------
    async fn put_linked_notebook(&self, linked_notebook: LinkedNotebook) -> Result<(), StoreError>;
    async fn find_linked_notebook(&self, guid: &str) -> Result<Option<LinkedNotebook>, StoreError>;
    async fn remove_linked_notebook(&self, guid: &str) -> Result<(), StoreError>;
    async fn list_linked_notebooks(&self) -> Result<Vec<LinkedNotebook>, StoreError>;

    // EXPUNGE BOOKKEEPING
    // --------------------------------------------------------------------------------------------
    /// Records a guid as expunged for a scope (spec §3 Lifecycle: "guid added to the local
    /// expunged-guids set for that scope").
    async fn record_expunged(&self, scope: &Scope, guid: &str) -> Result<(), StoreError>;
    async fn list_expunged(&self, scope: &Scope) -> Result<Vec<Guid>, StoreError>;
}
