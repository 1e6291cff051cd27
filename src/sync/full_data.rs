//! Fetches full note content and full resource bodies with bounded in-flight concurrency (spec
//! §4.4).

use std::sync::{atomic::{AtomicUsize, Ordering}, Arc};

use futures::stream::{FuturesUnordered, StreamExt};
use tokio::sync::Semaphore;
use tracing::debug;

use crate::{
    config::SyncConfig,
    errors::SyncError,
    rpc::{
        domain::{NoteResultSpec, ResourceFetchFlags},
        NoteStoreClient,
    },
    types::{Note, Resource, Scope},
};

use super::{
    processor::PendingDownload,
    state::{DownloadNotesStatus, DownloadResourcesStatus, FailedDownload, ProgressEvent, ProgressSink},
    stop::{Canceler, StopSyncError},
};

/// Two cooperating bounded pools (spec §4.4): one for notes, one for resources. Concurrency is
/// bounded with a `tokio::sync::Semaphore` per pool — a permit is acquired before issuing the RPC
/// call and held across the `await`, so at most `limit` requests from that pool are ever in
/// flight (the pack's standard bounded fan-out shape; see e.g. the backup-sync style concurrency
/// in `other_examples/a803c0c7_...pull.rs`).
pub struct FullDataDownloader {
    note_semaphore: Arc<Semaphore>,
    resource_semaphore: Arc<Semaphore>,
}

impl FullDataDownloader {
    pub fn new(max_in_flight_notes: usize, max_in_flight_resources: usize) -> Result<Self, SyncError> {
        if max_in_flight_notes == 0 {
            return Err(SyncError::InvalidArgument("max_in_flight_notes must be > 0".into()));
        }
        if max_in_flight_resources == 0 {
            return Err(SyncError::InvalidArgument("max_in_flight_resources must be > 0".into()));
        }
        Ok(Self {
            note_semaphore: Arc::new(Semaphore::new(max_in_flight_notes)),
            resource_semaphore: Arc::new(Semaphore::new(max_in_flight_resources)),
        })
    }

    /// Fetches full content for every note in `items`, bounded by the note pool's concurrency
    /// limit. Stops issuing new requests as soon as a stop-sync trigger or cancellation is
    /// observed and reports it in the returned status (spec §4.10); already in-flight requests
    /// are allowed to finish since a request itself is not a suspension point the canceler can
    /// interrupt mid-flight.
    pub async fn download_notes(
        &self,
        items: Vec<PendingDownload>,
        note_store: &dyn NoteStoreClient,
        config: &SyncConfig,
        scope: &Scope,
        canceler: &Canceler,
        progress: &dyn ProgressSink,
    ) -> (Vec<Note>, DownloadNotesStatus) {
        let total = items.len();
        let mut status = DownloadNotesStatus::default();
        let mut notes = Vec::with_capacity(total);
        if total == 0 {
            return (notes, status);
        }

        let ctx = config.request_context();
        let spec = NoteResultSpec::default();
        let downloaded = AtomicUsize::new(0);

        let mut futures = FuturesUnordered::new();
        for item in &items {
            let permit_source = self.note_semaphore.clone();
            let guid = item.guid.clone();
            let is_new = item.is_new;
            futures.push(async move {
                let _permit = permit_source.acquire_owned().await.expect("semaphore never closed");
                let result = note_store.get_note_with_result_spec(&guid, spec, &ctx).await;
                (guid, is_new, result)
            });
        }

        while let Some((guid, is_new, result)) = futures.next().await {
            match result {
                Ok(note) => {
                    if is_new {
                        status.total_new_notes += 1;
                    } else {
                        status.total_updated_notes += 1;
                    }
                    notes.push(note);
                },
                Err(err) => {
                    if let Some(stop) = StopSyncError::from_rpc_error(&err) {
                        status.stop_synchronization_error = stop;
                        canceler.cancel();
                    } else {
                        status.notes_which_failed_to_download.push(FailedDownload {
                            guid,
                            error_description: err.to_string(),
                        });
                    }
                },
            }
            let done = downloaded.fetch_add(1, Ordering::SeqCst) + 1;
            progress.emit(ProgressEvent::NoteDownloadProgress { scope: scope.clone(), downloaded: done, total });
            // Remaining futures in the unordered set are dropped here on cancellation, which
            // cancels their in-flight requests at the next suspension point (spec §5).
            if canceler.is_cancelled() {
                break;
            }
        }

        debug!(scope = %scope, downloaded = notes.len(), total, "note full-data download finished");
        (notes, status)
    }

    pub async fn download_resources(
        &self,
        items: Vec<PendingDownload>,
        note_store: &dyn NoteStoreClient,
        config: &SyncConfig,
        scope: &Scope,
        canceler: &Canceler,
        progress: &dyn ProgressSink,
    ) -> (Vec<Resource>, DownloadResourcesStatus) {
        let total = items.len();
        let mut status = DownloadResourcesStatus::default();
        let mut resources = Vec::with_capacity(total);
        if total == 0 {
            return (resources, status);
        }

        let ctx = config.request_context();
        let flags = ResourceFetchFlags::default();
        let downloaded = AtomicUsize::new(0);

        let mut futures = FuturesUnordered::new();
        for item in &items {
            let permit_source = self.resource_semaphore.clone();
            let guid = item.guid.clone();
            let is_new = item.is_new;
            futures.push(async move {
                let _permit = permit_source.acquire_owned().await.expect("semaphore never closed");
                (guid.clone(), is_new, note_store.get_resource(&guid, flags, &ctx).await)
            });
        }

        while let Some((guid, is_new, result)) = futures.next().await {
            match result {
                Ok(resource) => {
                    if is_new {
                        status.total_new_resources += 1;
                    } else {
                        status.total_updated_resources += 1;
                    }
                    resources.push(resource);
                },
                Err(err) => {
                    if let Some(stop) = StopSyncError::from_rpc_error(&err) {
                        status.stop_synchronization_error = stop;
                        canceler.cancel();
                    } else {
                        status.resources_which_failed_to_download.push(FailedDownload {
                            guid,
                            error_description: err.to_string(),
                        });
                    }
                },
            }
            let done = downloaded.fetch_add(1, Ordering::SeqCst) + 1;
            progress.emit(ProgressEvent::ResourceDownloadProgress { scope: scope.clone(), downloaded: done, total });
            if canceler.is_cancelled() {
                break;
            }
        }

        debug!(scope = %scope, downloaded = resources.len(), total, "resource full-data download finished");
        (resources, status)
    }

    /// Writes downloaded full notes/resources back to local storage, clearing the `needs_content`
    /// marker (spec §4.4 "clearing any needs-content marker on the local metadata row").
    pub async fn apply_downloaded_notes(
        store: &dyn crate::store::LocalStorage,
        mut notes: Vec<Note>,
    ) -> Result<(), SyncError> {
        for note in notes.drain(..) {
            let mut note = note;
            note.needs_content = false;
            store.put_note(note).await?;
        }
        Ok(())
    }

    pub async fn apply_downloaded_resources(
        store: &dyn crate::store::LocalStorage,
        mut resources: Vec<Resource>,
    ) -> Result<(), SyncError> {
        for resource in resources.drain(..) {
            let mut resource = resource;
            resource.needs_content = false;
            store.put_resource(resource).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::fake_rpc::FakeNoteStore;

    #[tokio::test]
    async fn invalid_argument_on_zero_limit() {
        assert!(FullDataDownloader::new(0, 1).is_err());
        assert!(FullDataDownloader::new(1, 0).is_err());
    }

    #[tokio::test]
    async fn downloads_all_requested_notes() {
        let fake = FakeNoteStore::new();
        let nb = fake.seed_notebook("nb");
        let n1 = fake.seed_note("one", &nb, vec![]);
        let n2 = fake.seed_note("two", &nb, vec![]);

        let downloader = FullDataDownloader::new(2, 2).unwrap();
        let config = SyncConfig::default();
        let canceler = Canceler::new();
        let (notes, status) = downloader
            .download_notes(
                vec![
                    PendingDownload { guid: n1, is_new: true },
                    PendingDownload { guid: n2, is_new: false },
                ],
                &fake,
                &config,
                &Scope::UserOwn,
                &canceler,
                &super::super::state::NullProgressSink,
            )
            .await;

        assert_eq!(notes.len(), 2);
        assert_eq!(status.total_new_notes, 1);
        assert_eq!(status.total_updated_notes, 1);
        assert!(status.notes_which_failed_to_download.is_empty());
    }

    #[tokio::test]
    async fn missing_note_is_recorded_as_failed() {
        let fake = FakeNoteStore::new();
        let downloader = FullDataDownloader::new(2, 2).unwrap();
        let config = SyncConfig::default();
        let canceler = Canceler::new();
        let (notes, status) = downloader
            .download_notes(
                vec![PendingDownload { guid: "missing".into(), is_new: true }],
                &fake,
                &config,
                &Scope::UserOwn,
                &canceler,
                &super::super::state::NullProgressSink,
            )
            .await;

        assert!(notes.is_empty());
        assert_eq!(status.notes_which_failed_to_download.len(), 1);
    }
}
