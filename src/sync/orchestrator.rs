//! Top-level state machine driving a full synchronization run (spec §4.8).
//!
//! Represented as the closed [`OrchestratorState`] enum, transitioned by a sequence of awaited
//! phases inside [`SyncEngine::run`] — the same "closed enum over a match, no trait-object state
//! pattern" shape the rest of this crate's design favors for a small fixed state set (see
//! `store::Affiliation`/`TagNotesRelation`).

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::{
    auth::{AuthScopeManager, Authenticator, Keychain, PersistedSyncState, SyncStateStorage},
    config::SyncConfig,
    errors::SyncError,
    rpc::{domain::SyncChunkFilter, NoteStoreClient, NoteStoreClientFactory, RequestContext, UserStoreClient},
    store::LocalStorage,
    types::{Guid, Scope, ScopeSyncState},
};

use super::{
    downloader::DownloadRequest,
    full_data::FullDataDownloader,
    linked_notebooks::{LinkedNotebookManager, LinkedNotebookScope},
    pipeline::run_download_phase,
    sender::Sender,
    state::{NullProgressSink, ProgressEvent, ProgressSink, SyncResult},
    stop::{Canceler, StopSyncError, StopSynchronizationController},
};

/// `checkVersion` identifies this client to the user-store the way every EDAM client does
/// (spec §6); loading these from config/CLI is out of scope (spec §1), so they are fixed
/// constants here.
const CLIENT_NAME: &str = "edam-sync";
const EDAM_VERSION_MAJOR: i16 = 1;
const EDAM_VERSION_MINOR: i16 = 30;

/// States of a synchronization run (spec §4.8). Held as a plain value for tracing/introspection;
/// the phases themselves are driven by straight-line `async` code in [`SyncEngine::run`] rather
/// than a dispatch loop, since the transition graph has no branching the type system needs to
/// enforce (every state but the two terminal error states is visited at most once per run).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum OrchestratorState {
    Idle,
    AuthenticatingUser,
    DownloadingUserOwn,
    DownloadingLinkedNotebooks,
    SendingUserOwn,
    SendingLinkedNotebooks,
    Finalizing,
    Done,
    StoppedWithPartialResult,
    Failed,
}

fn transition(state: &mut OrchestratorState, next: OrchestratorState) {
    debug!(from = ?*state, to = ?next, "orchestrator state transition");
    *state = next;
}

fn storage_err(err: impl std::fmt::Display) -> SyncError {
    SyncError::RuntimeError(err.to_string())
}

/// Drives one account's synchronization run end to end (spec §4.8): authenticates, downloads and
/// applies the user-own scope, fans out to every linked notebook, sends locally modified items
/// back, and persists per-scope progress.
pub struct SyncEngine {
    account: String,
    auth: AuthScopeManager,
    store: Arc<dyn LocalStorage>,
    user_store: Arc<dyn UserStoreClient>,
    note_store_factory: Arc<dyn NoteStoreClientFactory>,
    sync_state_storage: Arc<dyn SyncStateStorage>,
    config: SyncConfig,
}

impl SyncEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        account: impl Into<String>,
        authenticator: Arc<dyn Authenticator>,
        keychain: Arc<dyn Keychain>,
        sync_state_storage: Arc<dyn SyncStateStorage>,
        store: Arc<dyn LocalStorage>,
        user_store: Arc<dyn UserStoreClient>,
        note_store_factory: Arc<dyn NoteStoreClientFactory>,
        config: SyncConfig,
    ) -> Self {
        let account = account.into();
        let auth = AuthScopeManager::new(
            account.clone(),
            authenticator,
            keychain,
            sync_state_storage.clone(),
            config.auth_token_expiry_slack,
        );
        Self { account, auth, store, user_store, note_store_factory, sync_state_storage, config }
    }

    /// Runs a full synchronization attempt, discarding progress events.
    pub async fn run(&self) -> Result<SyncResult, SyncError> {
        self.run_with_progress(&NullProgressSink).await
    }

    /// Runs a full synchronization attempt, delivering progress events to `progress` as the run
    /// proceeds (spec §4.8).
    pub async fn run_with_progress(&self, progress: &dyn ProgressSink) -> Result<SyncResult, SyncError> {
        let canceler = Canceler::new();
        let stop_controller = StopSynchronizationController::new(canceler.clone());
        let full_data_downloader = FullDataDownloader::new(
            self.config.max_in_flight_notes,
            self.config.max_in_flight_resources,
        )?;

        let mut result = SyncResult::default();
        let mut state = OrchestratorState::Idle;
        let mut persisted = self
            .sync_state_storage
            .get(&self.account)
            .await
            .map_err(storage_err)?
            .unwrap_or_default();

        transition(&mut state, OrchestratorState::AuthenticatingUser);
        let (user_note_store, user_ctx) = match self.authenticate_user().await {
            Ok(pair) => pair,
            Err(err) => {
                transition(&mut state, OrchestratorState::Failed);
                return Err(err);
            },
        };

        transition(&mut state, OrchestratorState::DownloadingUserOwn);
        if let Err(err) = self
            .sync_scope_download(
                Scope::UserOwn,
                user_note_store.as_ref(),
                None,
                &mut persisted,
                &canceler,
                &stop_controller,
                progress,
                &full_data_downloader,
                &mut result,
            )
            .await
        {
            transition(&mut state, OrchestratorState::Failed);
            return Err(err);
        }

        let mut linked_scopes: Vec<LinkedNotebookScope> = Vec::new();
        if !canceler.is_cancelled() {
            transition(&mut state, OrchestratorState::DownloadingLinkedNotebooks);
            linked_scopes = match self.download_linked_notebooks(&mut persisted, &canceler, &stop_controller, progress, &full_data_downloader, &mut result).await {
                Ok(scopes) => scopes,
                Err(err) => {
                    transition(&mut state, OrchestratorState::Failed);
                    return Err(err);
                },
            };
        }

        if !canceler.is_cancelled() {
            transition(&mut state, OrchestratorState::SendingUserOwn);
            if let Err(err) = self
                .sync_scope_send(Scope::UserOwn, user_note_store.as_ref(), None, &canceler, &stop_controller, &mut result)
                .await
            {
                transition(&mut state, OrchestratorState::Failed);
                return Err(err);
            }

            transition(&mut state, OrchestratorState::SendingLinkedNotebooks);
            for linked in &linked_scopes {
                if canceler.is_cancelled() {
                    break;
                }
                let guid = linked.linked_notebook.guid.clone();
                if let Err(err) = self
                    .sync_scope_send(
                        Scope::LinkedNotebook(guid.clone()),
                        linked.note_store.as_ref(),
                        Some(guid.as_str()),
                        &canceler,
                        &stop_controller,
                        &mut result,
                    )
                    .await
                {
                    transition(&mut state, OrchestratorState::Failed);
                    return Err(err);
                }
            }

            if let Err(err) = self
                .repeat_incremental_syncs(
                    user_note_store.as_ref(),
                    &linked_scopes,
                    &mut persisted,
                    &canceler,
                    &stop_controller,
                    progress,
                    &full_data_downloader,
                    &mut result,
                )
                .await
            {
                transition(&mut state, OrchestratorState::Failed);
                return Err(err);
            }
        }

        transition(&mut state, OrchestratorState::Finalizing);
        self.persist_sync_state(&persisted).await?;

        result.stop_synchronization_error = stop_controller.triggered();
        transition(
            &mut state,
            if result.stop_synchronization_error.is_none() {
                OrchestratorState::Done
            } else {
                OrchestratorState::StoppedWithPartialResult
            },
        );

        Ok(result)
    }

    // AUTHENTICATION
    // --------------------------------------------------------------------------------------------

    async fn authenticate_user(&self) -> Result<(Arc<dyn NoteStoreClient>, RequestContext), SyncError> {
        let ctx = self.config.request_context();

        match self.user_store.check_version(CLIENT_NAME, EDAM_VERSION_MAJOR, EDAM_VERSION_MINOR).await {
            Ok(true) => {},
            Ok(false) => warn!("server reports this client version is no longer supported"),
            Err(err) => warn!(error = %err, "checkVersion call failed, continuing anyway"),
        }

        let auth = self
            .auth
            .authenticate_account()
            .await
            .map_err(|err| SyncError::AuthenticationFailed(err.to_string()))?;

        if let Ok(profile) = self.user_store.get_user().await {
            info!(user_id = profile.id, username = %profile.username, "authenticated user-own scope");
        }

        let note_store = self.note_store_factory.client_for(&auth);
        Ok((note_store, ctx))
    }

    // DOWNLOAD
    // --------------------------------------------------------------------------------------------

    /// Resolves every linked notebook known to local storage and runs its download phase (spec
    /// §4.7). A linked notebook whose authentication fails is logged and skipped rather than
    /// aborting the whole run — this crate's resolution of an Open Question spec.md leaves
    /// undecided (see `DESIGN.md`).
    async fn download_linked_notebooks(
        &self,
        persisted: &mut PersistedSyncState,
        canceler: &Canceler,
        stop_controller: &StopSynchronizationController,
        progress: &dyn ProgressSink,
        full_data_downloader: &FullDataDownloader,
        result: &mut SyncResult,
    ) -> Result<Vec<LinkedNotebookScope>, SyncError> {
        let manager = LinkedNotebookManager::new(self.store.as_ref(), &self.auth, self.note_store_factory.as_ref());
        let resolved = manager.resolve_scopes().await?;

        progress.emit(ProgressEvent::StartLinkedNotebooksDataDownloading { linked_notebook_count: resolved.len() });

        let mut scopes = Vec::with_capacity(resolved.len());
        for (linked_notebook, outcome) in resolved {
            if canceler.is_cancelled() {
                break;
            }
            let scope = match outcome {
                Ok(scope) => scope,
                Err(err) => {
                    warn!(linked_notebook = %linked_notebook.guid, error = %err, "failed to authenticate linked notebook, skipping");
                    continue;
                },
            };

            self.sync_scope_download(
                Scope::LinkedNotebook(linked_notebook.guid.clone()),
                scope.note_store.as_ref(),
                Some(linked_notebook.clone()),
                persisted,
                canceler,
                stop_controller,
                progress,
                full_data_downloader,
                result,
            )
            .await?;

            scopes.push(scope);
        }

        Ok(scopes)
    }

    /// Decides full-vs-incremental sync for one scope (spec §4.8), runs its download phase if
    /// there is anything to fetch, and records the new `ScopeSyncState` both in `result` (for the
    /// caller) and `persisted` (to be written back to sync-state storage in `Finalizing`).
    #[allow(clippy::too_many_arguments)]
    async fn sync_scope_download(
        &self,
        scope: Scope,
        note_store: &dyn NoteStoreClient,
        linked_notebook: Option<crate::types::LinkedNotebook>,
        persisted: &mut PersistedSyncState,
        canceler: &Canceler,
        stop_controller: &StopSynchronizationController,
        progress: &dyn ProgressSink,
        full_data_downloader: &FullDataDownloader,
        result: &mut SyncResult,
    ) -> Result<(), SyncError> {
        if canceler.is_cancelled() {
            return Ok(());
        }

        let ctx = self.config.request_context();
        let existing = existing_state(persisted, &scope);

        let server_state = match &linked_notebook {
            Some(ln) => note_store.get_linked_notebook_sync_state(ln, &ctx).await,
            None => note_store.get_sync_state(&ctx).await,
        };
        let server_state = match server_state {
            Ok(state) => state,
            Err(err) => {
                if let Some(stop) = StopSyncError::from_rpc_error(&err) {
                    stop_controller.record(stop);
                    return Ok(());
                }
                return Err(SyncError::Rpc(err));
            },
        };

        let full_sync = match existing {
            None => true,
            Some(p) => match (p.last_sync_time, server_state.full_sync_before) {
                (None, _) => true,
                (Some(last), Some(full_before)) => last < full_before,
                (Some(_), None) => false,
            },
        };

        // Incremental sync with no server-side changes since the last run (seed scenario 4):
        // nothing to download, but the scope's state still round-trips into the result.
        if !full_sync {
            if let Some(p) = existing {
                if p.update_count == server_state.update_count {
                    debug!(%scope, "no server-side changes since last sync");
                    result.sync_state.set(&scope, p);
                    return Ok(());
                }
            }
        }

        if scope.is_user_own() {
            result.user_account_sync_chunks_downloaded = true;
        }

        let after_usn = if full_sync { 0 } else { existing.map(|p| p.update_count).unwrap_or(0) };
        let filter = if full_sync { SyncChunkFilter::full_sync() } else { SyncChunkFilter::incremental_sync() };
        let request = DownloadRequest { scope: scope.clone(), after_usn, filter, linked_notebook };

        let outcome = run_download_phase(
            request,
            full_sync,
            self.store.as_ref(),
            note_store,
            &self.config,
            canceler,
            progress,
            full_data_downloader,
        )
        .await;

        match outcome {
            Ok(outcome) => {
                result.sync_chunks_data_counters.set(&scope, outcome.counters);
                result.download_notes_status.set(&scope, outcome.notes_status);
                result.download_resources_status.set(&scope, outcome.resources_status);

                let new_state = ScopeSyncState {
                    update_count: outcome.new_update_count.max(server_state.update_count),
                    last_sync_time: Some(Utc::now()),
                    full_sync_before: server_state.full_sync_before,
                };
                result.sync_state.set(&scope, new_state);
                set_state(persisted, &scope, new_state);
                Ok(())
            },
            Err(err) => {
                if let Some(stop) = err.as_stop_sync_error() {
                    stop_controller.record(stop);
                    Ok(())
                } else {
                    Err(err)
                }
            },
        }
    }

    // SEND
    // --------------------------------------------------------------------------------------------

    async fn sync_scope_send(
        &self,
        scope: Scope,
        note_store: &dyn NoteStoreClient,
        linked_notebook_guid: Option<&str>,
        canceler: &Canceler,
        stop_controller: &StopSynchronizationController,
        result: &mut SyncResult,
    ) -> Result<(), SyncError> {
        if canceler.is_cancelled() {
            return Ok(());
        }

        let ctx = self.config.request_context();
        let server_update_count_before = result.sync_state.get(&scope).map(|s| s.update_count).unwrap_or(0);

        let sender = Sender::new(self.store.as_ref(), canceler);
        let status = sender
            .send_scope(&scope, linked_notebook_guid, note_store, &ctx, server_update_count_before)
            .await?;

        if !status.stop_synchronization_error.is_none() {
            stop_controller.record(status.stop_synchronization_error);
        }
        result.send_status.set(&scope, status);
        Ok(())
    }

    /// Re-enters the download (then send) phase for any scope whose send left
    /// `needToRepeatIncrementalSync` set, bounded by `max_incremental_sync_repetitions` (spec
    /// §4.8).
    #[allow(clippy::too_many_arguments)]
    async fn repeat_incremental_syncs(
        &self,
        user_note_store: &dyn NoteStoreClient,
        linked_scopes: &[LinkedNotebookScope],
        persisted: &mut PersistedSyncState,
        canceler: &Canceler,
        stop_controller: &StopSynchronizationController,
        progress: &dyn ProgressSink,
        full_data_downloader: &FullDataDownloader,
        result: &mut SyncResult,
    ) -> Result<(), SyncError> {
        for _ in 0..self.config.max_incremental_sync_repetitions {
            if canceler.is_cancelled() {
                break;
            }

            let repeat_user_own = result
                .send_status
                .get(&Scope::UserOwn)
                .map(|s| s.need_to_repeat_incremental_sync)
                .unwrap_or(false);
            let repeat_linked: Vec<Guid> = linked_scopes
                .iter()
                .map(|s| s.linked_notebook.guid.clone())
                .filter(|guid| {
                    result
                        .send_status
                        .linked_notebooks
                        .get(guid)
                        .map(|s| s.need_to_repeat_incremental_sync)
                        .unwrap_or(false)
                })
                .collect();

            if !repeat_user_own && repeat_linked.is_empty() {
                break;
            }

            if repeat_user_own {
                self.sync_scope_download(
                    Scope::UserOwn,
                    user_note_store,
                    None,
                    persisted,
                    canceler,
                    stop_controller,
                    progress,
                    full_data_downloader,
                    result,
                )
                .await?;
                self.sync_scope_send(Scope::UserOwn, user_note_store, None, canceler, stop_controller, result).await?;
            }

            for linked in linked_scopes {
                if !repeat_linked.contains(&linked.linked_notebook.guid) {
                    continue;
                }
                let guid = linked.linked_notebook.guid.clone();
                self.sync_scope_download(
                    Scope::LinkedNotebook(guid.clone()),
                    linked.note_store.as_ref(),
                    Some(linked.linked_notebook.clone()),
                    persisted,
                    canceler,
                    stop_controller,
                    progress,
                    full_data_downloader,
                    result,
                )
                .await?;
                self.sync_scope_send(
                    Scope::LinkedNotebook(guid.clone()),
                    linked.note_store.as_ref(),
                    Some(guid.as_str()),
                    canceler,
                    stop_controller,
                    result,
                )
                .await?;
            }
        }

        Ok(())
    }

    // FINALIZING
    // --------------------------------------------------------------------------------------------

    /// Writes the run's per-scope `ScopeSyncState` back to sync-state storage, re-reading the
    /// latest persisted value first so a concurrent auth-metadata write (spec §4.1) isn't
    /// clobbered by a stale copy of the `*_auth` fields (spec §4.9).
    async fn persist_sync_state(&self, persisted: &PersistedSyncState) -> Result<(), SyncError> {
        let mut latest = self
            .sync_state_storage
            .get(&self.account)
            .await
            .map_err(storage_err)?
            .unwrap_or_default();
        latest.user_own = persisted.user_own;
        latest.linked_notebooks = persisted.linked_notebooks.clone();
        self.sync_state_storage.set(&self.account, latest).await.map_err(storage_err)
    }
}

fn existing_state(persisted: &PersistedSyncState, scope: &Scope) -> Option<ScopeSyncState> {
    match scope {
        Scope::UserOwn => {
            if persisted.user_own.last_sync_time.is_some() || persisted.user_own.update_count > 0 {
                Some(persisted.user_own)
            } else {
                None
            }
        },
        Scope::LinkedNotebook(guid) => persisted.linked_notebooks.get(guid).copied(),
    }
}

fn set_state(persisted: &mut PersistedSyncState, scope: &Scope, state: ScopeSyncState) {
    match scope {
        Scope::UserOwn => persisted.user_own = state,
        Scope::LinkedNotebook(guid) => persisted.linked_notebooks.insert(guid.clone(), state),
    }
}
