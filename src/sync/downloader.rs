//! Pages sync chunks from the server for one scope (spec §4.2).

use std::sync::Arc;

use tracing::{debug, info};

use crate::{
    config::SyncConfig,
    errors::SyncError,
    rpc::{
        domain::{SyncChunk, SyncChunkFilter},
        NoteStoreClient, RpcError,
    },
    types::{LinkedNotebook, Scope, Usn},
};

use super::{
    state::{ProgressEvent, ProgressSink},
    stop::{Canceler, StopSyncError},
};

/// One page request's worth of input to the downloader.
#[derive(Clone, Debug)]
pub struct DownloadRequest {
    pub scope: Scope,
    pub after_usn: Usn,
    pub filter: SyncChunkFilter,
    /// Present for a linked-notebook scope; `get_linked_notebook_sync_chunk` needs the record
    /// itself (for its note-store URL/share id), not just the guid.
    pub linked_notebook: Option<LinkedNotebook>,
}

/// Pages `getFilteredSyncChunk`/`getLinkedNotebookSyncChunk` calls for one scope, producing a
/// finite ordered stream of chunks that collectively cover `[after_usn, updateCount]` (spec
/// §4.2).
pub struct SyncChunksDownloader<'a> {
    note_store: &'a dyn NoteStoreClient,
    config: &'a SyncConfig,
    canceler: &'a Canceler,
}

impl<'a> SyncChunksDownloader<'a> {
    pub fn new(note_store: &'a dyn NoteStoreClient, config: &'a SyncConfig, canceler: &'a Canceler) -> Self {
        Self { note_store, config, canceler }
    }

    /// Downloads every chunk for `request`, calling `on_chunk` for each one as it arrives and
    /// emitting a progress event through `progress`. Returns once the scope's tail is reached,
    /// or bails out early on cancellation or a stop-sync trigger.
    pub async fn download(
        &self,
        request: DownloadRequest,
        progress: &dyn ProgressSink,
        mut on_chunk: impl FnMut(SyncChunk) -> Result<(), SyncError>,
    ) -> Result<(), SyncError> {
        let mut after_usn = request.after_usn;
        let mut last_chunk_high_usn: Option<Usn> = None;
        let mut last_previous_usn = request.after_usn;

        loop {
            if self.canceler.is_cancelled() {
                return Err(SyncError::OperationCanceled);
            }

            let chunk = self.fetch_one(&request, after_usn).await?;

            if let Some(high) = chunk.chunk_high_usn {
                if let Some(previous_high) = last_chunk_high_usn {
                    if high <= previous_high {
                        return Err(SyncError::ProtocolViolation(format!(
                            "chunk high USN {high} did not increase past previous {previous_high}"
                        )));
                    }
                }
            }

            let update_count = chunk.update_count;
            let chunk_high_usn_for_progress = chunk.chunk_high_usn.unwrap_or(after_usn);

            progress.emit(ProgressEvent::SyncChunksDownloadProgress {
                scope: request.scope.clone(),
                chunk_high_usn: chunk_high_usn_for_progress,
                update_count,
                last_previous_usn,
            });

            let terminal = chunk.chunk_high_usn.is_none() || chunk.chunk_high_usn == Some(update_count);

            last_previous_usn = chunk_high_usn_for_progress;
            last_chunk_high_usn = chunk.chunk_high_usn.or(last_chunk_high_usn);

            if let Some(high) = chunk.chunk_high_usn {
                after_usn = high;
            }

            on_chunk(chunk)?;

            if terminal {
                debug!(scope = %request.scope, %update_count, "sync chunk download reached tail");
                progress.emit(ProgressEvent::SyncChunksDownloaded { scope: request.scope.clone() });
                return Ok(());
            }
        }
    }

    async fn fetch_one(&self, request: &DownloadRequest, after_usn: Usn) -> Result<SyncChunk, SyncError> {
        let ctx = self.config.request_context();
        let mut attempt = 0u32;

        loop {
            let result = match &request.linked_notebook {
                Some(linked_notebook) => {
                    self.note_store
                        .get_linked_notebook_sync_chunk(
                            linked_notebook,
                            after_usn,
                            self.config.max_chunk_entries,
                            &request.filter,
                            &ctx,
                        )
                        .await
                },
                None => {
                    self.note_store
                        .get_filtered_sync_chunk(
                            after_usn,
                            self.config.max_chunk_entries,
                            &request.filter,
                            &ctx,
                        )
                        .await
                },
            };

            match result {
                Ok(chunk) => return Ok(chunk),
                Err(err) => {
                    if let Some(stop) = StopSyncError::from_rpc_error(&err) {
                        info!(scope = %request.scope, ?stop, "stop-sync signal during chunk download");
                        return Err(stop_to_sync_error(stop));
                    }

                    if err.is_retryable() && attempt < ctx.max_retries {
                        attempt += 1;
                        let backoff = ctx.retry_backoff * attempt;
                        debug!(scope = %request.scope, attempt, ?backoff, "retrying sync chunk download");
                        tokio::select! {
                            _ = tokio::time::sleep(backoff) => continue,
                            _ = self.canceler.cancelled() => return Err(SyncError::OperationCanceled),
                        }
                    }

                    return Err(SyncError::Rpc(err));
                },
            }
        }
    }
}

fn stop_to_sync_error(stop: StopSyncError) -> SyncError {
    match stop {
        StopSyncError::RateLimitReached { seconds } => SyncError::RateLimitReached(seconds),
        StopSyncError::AuthenticationExpired => SyncError::AuthenticationExpired,
        StopSyncError::None => unreachable!("None is filtered out before reaching here"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::fake_rpc::{FakeNoteStore, ScriptedChunk};

    fn chunk(high_usn: Option<Usn>, update_count: Usn) -> SyncChunk {
        SyncChunk { chunk_high_usn: high_usn, update_count, ..Default::default() }
    }

    #[tokio::test]
    async fn pages_until_update_count_reached() {
        let fake = FakeNoteStore::new();
        fake.script_sync_chunks(vec![
            ScriptedChunk::Ok(chunk(Some(10), 30)),
            ScriptedChunk::Ok(chunk(Some(20), 30)),
            ScriptedChunk::Ok(chunk(Some(30), 30)),
        ]);

        let config = SyncConfig::default();
        let canceler = Canceler::new();
        let downloader = SyncChunksDownloader::new(&fake, &config, &canceler);

        let mut seen = vec![];
        downloader
            .download(
                DownloadRequest {
                    scope: Scope::UserOwn,
                    after_usn: 0,
                    filter: SyncChunkFilter::full_sync(),
                    linked_notebook: None,
                },
                &super::super::state::NullProgressSink,
                |chunk| {
                    seen.push(chunk.chunk_high_usn);
                    Ok(())
                },
            )
            .await
            .unwrap();

        assert_eq!(seen, vec![Some(10), Some(20), Some(30)]);
    }

    #[tokio::test]
    async fn out_of_order_chunk_high_usn_is_protocol_violation() {
        let fake = FakeNoteStore::new();
        fake.script_sync_chunks(vec![
            ScriptedChunk::Ok(chunk(Some(10), 30)),
            ScriptedChunk::Ok(chunk(Some(5), 30)),
        ]);

        let config = SyncConfig::default();
        let canceler = Canceler::new();
        let downloader = SyncChunksDownloader::new(&fake, &config, &canceler);

        let result = downloader
            .download(
                DownloadRequest {
                    scope: Scope::UserOwn,
                    after_usn: 0,
                    filter: SyncChunkFilter::full_sync(),
                    linked_notebook: None,
                },
                &super::super::state::NullProgressSink,
                |_| Ok(()),
            )
            .await;

        assert!(matches!(result, Err(SyncError::ProtocolViolation(_))));
    }

    #[tokio::test]
    async fn empty_tail_terminates() {
        let fake = FakeNoteStore::new();
        fake.script_sync_chunks(vec![chunk(None, 0)].into_iter().map(ScriptedChunk::Ok).collect());

        let config = SyncConfig::default();
        let canceler = Canceler::new();
        let downloader = SyncChunksDownloader::new(&fake, &config, &canceler);

        let mut count = 0;
        downloader
            .download(
                DownloadRequest {
                    scope: Scope::UserOwn,
                    after_usn: 0,
                    filter: SyncChunkFilter::full_sync(),
                    linked_notebook: None,
                },
                &super::super::state::NullProgressSink,
                |_| {
                    count += 1;
                    Ok(())
                },
            )
            .await
            .unwrap();

        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn rate_limit_short_circuits() {
        let fake = FakeNoteStore::new();
        fake.script_sync_chunks(vec![ScriptedChunk::Err(RpcError::RateLimitReached(Some(300)))]);

        let config = SyncConfig::default();
        let canceler = Canceler::new();
        let downloader = SyncChunksDownloader::new(&fake, &config, &canceler);

        let result = downloader
            .download(
                DownloadRequest {
                    scope: Scope::UserOwn,
                    after_usn: 0,
                    filter: SyncChunkFilter::full_sync(),
                    linked_notebook: None,
                },
                &super::super::state::NullProgressSink,
                |_| Ok(()),
            )
            .await;

        assert!(matches!(result, Err(SyncError::RateLimitReached(Some(300)))));
    }
}
