//! End-to-end runs of [`edam_sync::sync::SyncEngine`] against the in-memory fakes, covering the
//! concrete scenarios the download/send/conflict pipeline must handle correctly together.

use std::sync::Arc;

use edam_sync::{
    auth::{Authenticator, Keychain, SyncStateStorage},
    config::SyncConfig,
    rpc::{NoteStoreClientFactory, UserStoreClient},
    store::{Affiliation, ListFilter, LocalStorage},
    sync::{ProgressEvent, SyncEngine},
    testing::{FakeAuthenticator, FakeKeychain, FakeNoteStore, FakeNoteStoreClientFactory, FakeStore, FakeSyncStateStorage, FakeUserStore},
    types::{ItemId, Notebook, Scope},
};

const NOTE_STORE_URL: &str = "https://fake.example.com/edam/notestore";

fn build_engine(
    note_store: &Arc<FakeNoteStore>,
    store: Arc<FakeStore>,
    sync_state_storage: Arc<FakeSyncStateStorage>,
    config: SyncConfig,
) -> SyncEngine {
    let authenticator: Arc<dyn Authenticator> = Arc::new(FakeAuthenticator::new(NOTE_STORE_URL));
    let keychain: Arc<dyn Keychain> = Arc::new(FakeKeychain::new());
    let sync_state_storage: Arc<dyn SyncStateStorage> = sync_state_storage;
    let store: Arc<dyn LocalStorage> = store;
    let user_store: Arc<dyn UserStoreClient> = Arc::new(FakeUserStore::new());
    let note_store_factory: Arc<dyn NoteStoreClientFactory> = Arc::new(FakeNoteStoreClientFactory::new(note_store.clone()));

    SyncEngine::new(
        "account-1",
        authenticator,
        keychain,
        sync_state_storage,
        store,
        user_store,
        note_store_factory,
        config,
    )
}

#[tokio::test]
async fn full_sync_downloads_user_own_saved_searches_only() {
    let note_store = Arc::new(FakeNoteStore::new());
    for i in 1..=10 {
        note_store.seed_saved_search(&format!("Saved search #{i} (base)"));
    }

    let store = Arc::new(FakeStore::new());
    let engine = build_engine(&note_store, store.clone(), Arc::new(FakeSyncStateStorage::new()), SyncConfig::default());

    let result = engine.run().await.unwrap();

    assert!(result.stop_synchronization_error.is_none());
    assert_eq!(result.sync_chunks_data_counters.user_own.total_saved_searches, 10);
    assert_eq!(result.sync_state.user_own.update_count, 10);
    assert!(result.user_account_sync_chunks_downloaded);

    let local = store.list_saved_searches(&ListFilter::all(Affiliation::User)).await.unwrap();
    assert_eq!(local.len(), 10);
    assert!(local.iter().all(|s| s.id.guid().is_some() && s.usn.is_some() && !s.locally_modified));
}

#[tokio::test]
async fn full_sync_downloads_notebooks_notes_and_every_other_notes_resources() {
    let note_store = Arc::new(FakeNoteStore::new());
    let notebook_guids: Vec<String> = (1..=10).map(|i| note_store.seed_notebook(&format!("Notebook {i}"))).collect();

    let mut resource_count = 0;
    for i in 1..=10 {
        let notebook_guid = &notebook_guids[(i - 1) % notebook_guids.len()];
        let note_guid = note_store.seed_note(&format!("Note {i}"), notebook_guid, vec![]);
        if i % 2 == 0 {
            for r in 1..=3 {
                note_store.seed_resource(&note_guid, "image/png", vec![r as u8; 4]);
                resource_count += 1;
            }
        }
    }
    assert_eq!(resource_count, 15);

    let store = Arc::new(FakeStore::new());
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<ProgressEvent>();
    let engine = build_engine(&note_store, store.clone(), Arc::new(FakeSyncStateStorage::new()), SyncConfig::default());

    let result = engine.run_with_progress(&tx).await.unwrap();
    drop(tx);

    assert_eq!(result.sync_chunks_data_counters.user_own.total_notebooks, 10);
    assert_eq!(result.sync_chunks_data_counters.user_own.total_notes, 10);
    assert_eq!(result.sync_chunks_data_counters.user_own.total_resources, 15);

    assert_eq!(store.list_notebooks(&ListFilter::all(Affiliation::User)).await.unwrap().len(), 10);
    let notes = store.list_notes(&ListFilter::all(Affiliation::User), Default::default()).await.unwrap();
    assert_eq!(notes.len(), 10);
    assert!(notes.iter().all(|n| n.content.is_some()));

    let mut last_downloaded = 0;
    let mut saw_note_progress = false;
    while let Ok(event) = rx.try_recv() {
        if let ProgressEvent::NoteDownloadProgress { downloaded, total, .. } = event {
            saw_note_progress = true;
            assert!(downloaded >= last_downloaded);
            assert!(downloaded <= total);
            last_downloaded = downloaded;
        }
    }
    assert!(saw_note_progress);
}

#[tokio::test]
async fn full_sync_with_linked_notebooks_downloads_each_scope() {
    let note_store = Arc::new(FakeNoteStore::new());
    let nb = note_store.seed_notebook("Shared notebook");
    note_store.seed_tag("shared-tag", None);
    note_store.seed_note("Shared note", &nb, vec![]);

    let linked_guids: Vec<String> =
        (1..=10).map(|i| note_store.seed_linked_notebook(&format!("ln-{i}"), NOTE_STORE_URL)).collect();

    let store = Arc::new(FakeStore::new());
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<ProgressEvent>();
    let engine = build_engine(&note_store, store.clone(), Arc::new(FakeSyncStateStorage::new()), SyncConfig::default());

    let result = engine.run_with_progress(&tx).await.unwrap();
    drop(tx);

    let mut saw_start_event = false;
    while let Ok(event) = rx.try_recv() {
        if let ProgressEvent::StartLinkedNotebooksDataDownloading { linked_notebook_count } = event {
            saw_start_event = true;
            assert_eq!(linked_notebook_count, 10);
        }
    }
    assert!(saw_start_event);

    assert_eq!(result.sync_chunks_data_counters.linked_notebooks.len(), linked_guids.len());
    for guid in &linked_guids {
        let counters = result.sync_chunks_data_counters.linked_notebooks.get(guid).unwrap();
        assert_eq!(counters.total_notebooks, 1);
        assert_eq!(counters.total_notes, 1);
        assert!(result.download_notes_status.linked_notebooks.get(guid).is_some());
    }
    assert_eq!(store.list_linked_notebooks().await.unwrap().len(), 10);
}

#[tokio::test]
async fn incremental_sync_with_no_changes_downloads_nothing() {
    let note_store = Arc::new(FakeNoteStore::new());
    note_store.seed_saved_search("Saved search #1 (base)");
    note_store.seed_notebook("Notebook 1");

    let store = Arc::new(FakeStore::new());
    let sync_state_storage = Arc::new(FakeSyncStateStorage::new());
    let engine = build_engine(&note_store, store.clone(), sync_state_storage, SyncConfig::default());

    let first = engine.run().await.unwrap();
    assert!(first.user_account_sync_chunks_downloaded);

    let second = engine.run().await.unwrap();

    assert!(!second.user_account_sync_chunks_downloaded);
    assert_eq!(second.sync_chunks_data_counters.user_own.total_saved_searches, 0);
    assert_eq!(second.sync_chunks_data_counters.user_own.total_notebooks, 0);
    assert_eq!(second.download_notes_status.user_own.total_new_notes, 0);
    assert_eq!(second.send_status.user_own.notes.attempted, 0);
    assert_eq!(second.sync_state.user_own.update_count, first.sync_state.user_own.update_count);
    assert!(second.stop_synchronization_error.is_none());
}

#[tokio::test]
async fn rate_limit_mid_sync_chunk_stops_and_a_clean_rerun_converges() {
    let note_store = Arc::new(FakeNoteStore::new());
    for i in 1..=3 {
        note_store.seed_saved_search(&format!("Saved search #{i} (base)"));
    }
    // Force one `getFilteredSyncChunk` call per saved search so the second call can be targeted.
    let config = SyncConfig { max_chunk_entries: 1, ..SyncConfig::default() };
    note_store.inject_error_on_call(2, edam_sync::testing::ErrorSpec::RateLimitReached(Some(300)));

    let store = Arc::new(FakeStore::new());
    let sync_state_storage = Arc::new(FakeSyncStateStorage::new());
    let engine = build_engine(&note_store, store.clone(), sync_state_storage.clone(), config.clone());

    let stopped = engine.run().await.unwrap();
    assert_eq!(
        stopped.stop_synchronization_error,
        edam_sync::sync::StopSyncError::RateLimitReached { seconds: Some(300) }
    );

    // The injection fired exactly once; re-running now proceeds uninterrupted.
    let converged = engine.run().await.unwrap();
    assert!(converged.stop_synchronization_error.is_none());

    let local = store.list_saved_searches(&ListFilter::all(Affiliation::User)).await.unwrap();
    assert_eq!(local.len(), 3);
}

#[tokio::test]
async fn conflicting_local_and_server_notebook_name_produces_a_renamed_local_copy() {
    let note_store = Arc::new(FakeNoteStore::new());
    // First seeded notebook is deterministically assigned guid "notebook-1".
    let guid = note_store.seed_notebook("B");

    let store = Arc::new(FakeStore::new());
    store
        .put_notebook(Notebook {
            id: ItemId::Guid(guid.clone()),
            usn: Some(0),
            name: "A".to_string(),
            stack: None,
            is_default: false,
            published: false,
            scope: Scope::UserOwn,
            locally_modified: true,
        })
        .await
        .unwrap();

    let engine = build_engine(&note_store, store.clone(), Arc::new(FakeSyncStateStorage::new()), SyncConfig::default());
    engine.run().await.unwrap();

    let server_version = store.find_notebook(&guid).await.unwrap().unwrap();
    assert_eq!(server_version.name, "B");
    assert!(!server_version.locally_modified);

    let renamed = store.list_notebooks(&ListFilter::locally_modified(Affiliation::User)).await.unwrap();
    assert_eq!(renamed.len(), 1);
    assert_eq!(renamed[0].name, "A_2");
    assert!(renamed[0].id.guid().is_none());
}
