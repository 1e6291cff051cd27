//! Enumerates linked notebooks and resolves a scoped note-store client and auth token for each
//! (spec §4.7).

use std::sync::Arc;

use crate::{
    auth::{AuthInfo, AuthScopeManager},
    errors::SyncError,
    rpc::{NoteStoreClient, NoteStoreClientFactory},
    store::LocalStorage,
    types::LinkedNotebook,
};

/// Everything the Orchestrator needs to run a download or send phase against one linked
/// notebook: the record itself (its note-store URL/shard, needed by
/// `get_linked_notebook_sync_chunk`), a note-store client already bound to that URL, and the
/// auth token that client was built from.
pub struct LinkedNotebookScope {
    pub linked_notebook: LinkedNotebook,
    pub note_store: Arc<dyn NoteStoreClient>,
    pub auth: AuthInfo,
}

/// Resolves one [`LinkedNotebookScope`] per linked notebook known to local storage (spec §4.7).
///
/// Each linked notebook gets its own note-store endpoint (derived from its `note_store_url`) and
/// its own authentication token (via [`AuthScopeManager`], keyed by the linked notebook's guid).
/// This manager does not itself run the download/send pipeline — it only resolves scopes; the
/// Orchestrator drives §4.2→§4.3→§4.4 (and later the Sender) against each resolved scope, the
/// same composition [`super::pipeline::run_download_phase`] already provides for the user-own
/// scope.
pub struct LinkedNotebookManager<'a> {
    store: &'a dyn LocalStorage,
    auth: &'a AuthScopeManager,
    note_store_factory: &'a dyn NoteStoreClientFactory,
}

impl<'a> LinkedNotebookManager<'a> {
    pub fn new(
        store: &'a dyn LocalStorage,
        auth: &'a AuthScopeManager,
        note_store_factory: &'a dyn NoteStoreClientFactory,
    ) -> Self {
        Self { store, auth, note_store_factory }
    }

    /// Enumerates every linked notebook currently known to local storage (populated by the
    /// user-own scope's sync chunks, spec §4.3 step 3) and authenticates each one.
    ///
    /// A per-linked-notebook authentication failure does not abort enumeration of the others —
    /// it is recorded against that one scope and surfaced to the caller as an error for that
    /// entry alone, the same "per-item failure, pipeline continues" policy spec §7 applies to
    /// send/download items. The Orchestrator decides whether to keep going with the scopes that
    /// did resolve.
    pub async fn resolve_scopes(&self) -> Result<Vec<(LinkedNotebook, Result<LinkedNotebookScope, SyncError>)>, SyncError> {
        let linked_notebooks = self.store.list_linked_notebooks().await?;
        let mut resolved = Vec::with_capacity(linked_notebooks.len());

        for linked_notebook in linked_notebooks {
            let outcome = self.resolve_one(linked_notebook.clone()).await;
            resolved.push((linked_notebook, outcome));
        }

        Ok(resolved)
    }

    async fn resolve_one(&self, linked_notebook: LinkedNotebook) -> Result<LinkedNotebookScope, SyncError> {
        let auth = self
            .auth
            .authenticate_linked_notebook(&linked_notebook.guid)
            .await
            .map_err(|err| SyncError::AuthenticationFailed(err.to_string()))?;
        let note_store = self.note_store_factory.client_for(&auth);
        Ok(LinkedNotebookScope { linked_notebook, note_store, auth })
    }
}
