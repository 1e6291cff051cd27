//! Decides how to merge a server-incoming item with a locally modified item of the same
//! identity (spec §4.5).

use chrono::Utc;
use uuid::Uuid;

use crate::types::{ItemId, LinkedNotebook, Note, NoteAttributes, Notebook, SavedSearch, Tag};

/// The resolver never contacts the network; it is a pure function from (server, local) to the
/// pair of local-storage operations to apply atomically for that guid.
#[derive(Default)]
pub struct ConflictResolver;

/// A rename-on-conflict outcome shared by notebook/tag/saved-search/linked-notebook (spec
/// §4.5): keep the server version under the server guid, and keep the local edit as a new
/// locally-modified item without a guid so the Sender later uploads it as a create.
pub struct RenameConflict<T> {
    pub server: T,
    pub renamed_local: T,
}

impl ConflictResolver {
    pub fn new() -> Self {
        Self
    }

    fn renamed_name(base: &str, existing_names: &[&str]) -> String {
        let mut suffix = 2;
        loop {
            let candidate = format!("{base}_{suffix}");
            if !existing_names.contains(&candidate.as_str()) {
                return candidate;
            }
            suffix += 1;
        }
    }

    pub fn resolve_saved_search(
        &self,
        server: SavedSearch,
        mut local: SavedSearch,
    ) -> RenameConflict<SavedSearch> {
        let new_name = Self::renamed_name(&local.name, &[server.name.as_str()]);
        local.name = new_name;
        local.id = ItemId::Local(Uuid::new_v4());
        local.usn = None;
        local.locally_modified = true;
        RenameConflict { server, renamed_local: local }
    }

    pub fn resolve_tag(&self, server: Tag, mut local: Tag) -> RenameConflict<Tag> {
        let new_name = Self::renamed_name(&local.name, &[server.name.as_str()]);
        local.name = new_name;
        local.id = ItemId::Local(Uuid::new_v4());
        local.usn = None;
        local.locally_modified = true;
        RenameConflict { server, renamed_local: local }
    }

    pub fn resolve_notebook(&self, server: Notebook, mut local: Notebook) -> RenameConflict<Notebook> {
        let new_name = Self::renamed_name(&local.name, &[server.name.as_str()]);
        local.name = new_name;
        local.id = ItemId::Local(Uuid::new_v4());
        local.usn = None;
        local.locally_modified = true;
        RenameConflict { server, renamed_local: local }
    }

    pub fn resolve_linked_notebook(
        &self,
        server: LinkedNotebook,
        _local: LinkedNotebook,
    ) -> LinkedNotebook {
        // LinkedNotebook has no local-rename concept (it has no user-chosen name field that a
        // user could have locally edited in a way worth preserving as a separate item); the
        // server version simply wins.
        server
    }

    /// Creates a conflict copy of `local` and returns `(conflict_copy, server_version_to_store)`
    /// (spec §4.5 "Note" policy). The caller is responsible for storing both: the conflict copy
    /// as a brand-new local-only note, and `server` overwriting the original guid.
    pub fn resolve_note(&self, server: Note, mut local: Note) -> (Note, Note) {
        let original_guid = local.id.guid().map(|g| g.to_string());
        local.id = ItemId::Local(Uuid::new_v4());
        local.usn = None;
        local.locally_modified = true;
        local.title = format!(
            "{} (conflicting copy {})",
            local.title,
            Utc::now().format("%Y-%m-%d %H:%M:%S")
        );
        local.attributes = NoteAttributes {
            conflict_source_note_guid: original_guid,
            ..local.attributes
        };
        (local, server)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Scope;

    fn notebook(id: ItemId, name: &str) -> Notebook {
        Notebook {
            id,
            usn: None,
            name: name.to_string(),
            stack: None,
            is_default: false,
            published: false,
            scope: Scope::UserOwn,
            locally_modified: false,
        }
    }

    #[test]
    fn notebook_conflict_renames_local_and_keeps_server_guid() {
        let resolver = ConflictResolver::new();
        let server = notebook(ItemId::Guid("g1".into()), "B");
        let mut local = notebook(ItemId::Guid("g1".into()), "A");
        local.locally_modified = true;

        let result = resolver.resolve_notebook(server.clone(), local);

        assert_eq!(result.server.id, ItemId::Guid("g1".into()));
        assert_eq!(result.server.name, "B");
        assert_eq!(result.renamed_local.name, "A_2");
        assert!(matches!(result.renamed_local.id, ItemId::Local(_)));
        assert!(result.renamed_local.locally_modified);
        assert_ne!(result.server.id, result.renamed_local.id);
    }

    #[test]
    fn note_conflict_creates_conflict_copy_with_source_reference() {
        let resolver = ConflictResolver::new();
        let server = Note {
            id: ItemId::Guid("n1".into()),
            usn: Some(5),
            title: "Server title".into(),
            content: Some("server content".into()),
            notebook_id: ItemId::Guid("nb1".into()),
            tag_guids: vec![],
            attributes: Default::default(),
            active: true,
            needs_content: false,
            locally_modified: false,
        };
        let mut local = server.clone();
        local.title = "Local title".into();
        local.locally_modified = true;

        let (conflict_copy, stored_server) = resolver.resolve_note(server.clone(), local);

        assert!(conflict_copy.title.starts_with("Local title (conflicting copy"));
        assert_eq!(conflict_copy.attributes.conflict_source_note_guid, Some("n1".to_string()));
        assert!(matches!(conflict_copy.id, ItemId::Local(_)));
        assert_eq!(stored_server.id, ItemId::Guid("n1".into()));
    }
}
