//! Composes the downloader, processor, and full-data downloader into one scope's complete
//! download phase (spec §4.2→§4.3→§4.4). Shared by the Orchestrator (user-own scope) and the
//! Linked Notebook Manager (one call per linked notebook) so the two callers never drift on how
//! the three collaborators are wired together.

use tracing::debug;

use crate::{config::SyncConfig, errors::SyncError, rpc::NoteStoreClient, store::LocalStorage, types::Scope};

use super::{
    downloader::{DownloadRequest, SyncChunksDownloader},
    full_data::FullDataDownloader,
    processor::SyncChunksProcessor,
    state::{DownloadNotesStatus, DownloadResourcesStatus, ProgressEvent, ProgressSink, SyncChunksDataCounters},
    stop::Canceler,
};

/// Everything a caller needs once a scope's download phase finishes.
pub struct DownloadPhaseOutcome {
    pub counters: SyncChunksDataCounters,
    pub new_update_count: crate::types::Usn,
    pub notes_status: DownloadNotesStatus,
    pub resources_status: DownloadResourcesStatus,
}

/// Runs one scope's full download phase to completion: pages every sync chunk (§4.2), applies
/// each in dependency order (§4.3), then fetches full note/resource content for everything the
/// processor flagged as needing it (§4.4).
///
/// `full_sync` additionally triggers local reconciliation (spec §4.8) and, for a linked-notebook
/// scope, the noteless-tag purge (invariant 8) always runs regardless of `full_sync`.
pub async fn run_download_phase(
    request: DownloadRequest,
    full_sync: bool,
    store: &dyn LocalStorage,
    note_store: &dyn NoteStoreClient,
    config: &SyncConfig,
    canceler: &Canceler,
    progress: &dyn ProgressSink,
    full_data_downloader: &FullDataDownloader,
) -> Result<DownloadPhaseOutcome, SyncError> {
    let scope = request.scope.clone();
    let downloader = SyncChunksDownloader::new(note_store, config, canceler);

    // `download`'s per-chunk callback is synchronous (spec §4.2 pages the stream, §4.3 applies
    // it); chunks are collected here and handed to the processor afterward so applying them can
    // `.await` local storage without an async closure.
    let mut chunks = Vec::new();
    let mut new_update_count = 0;
    downloader
        .download(request, progress, |chunk| {
            new_update_count = chunk.update_count;
            chunks.push(chunk);
            Ok(())
        })
        .await?;

    let mut processor = SyncChunksProcessor::new(store, scope.clone());
    for chunk in chunks {
        processor.apply_chunk(chunk).await?;
    }

    let pending_notes = processor.take_pending_note_downloads();
    let pending_resources = processor.take_pending_resource_downloads();

    if full_sync {
        processor.full_sync_cleanup().await?;
    }
    if matches!(scope, Scope::LinkedNotebook(_)) {
        processor.purge_noteless_linked_notebook_tags().await?;
    }

    let counters = processor.finish().await?;
    progress.emit(ProgressEvent::SyncChunksDataProcessingProgress { scope: scope.clone(), counters: counters.clone() });

    let (notes, notes_status) = full_data_downloader
        .download_notes(pending_notes, note_store, config, &scope, canceler, progress)
        .await;
    FullDataDownloader::apply_downloaded_notes(store, notes).await?;

    let (resources, resources_status) = full_data_downloader
        .download_resources(pending_resources, note_store, config, &scope, canceler, progress)
        .await;
    FullDataDownloader::apply_downloaded_resources(store, resources).await?;

    debug!(scope = %scope, total_notes = counters.total_notes, "download phase finished");
    Ok(DownloadPhaseOutcome { counters, new_update_count, notes_status, resources_status })
}
