//! The synchronization engine: orchestrator, per-scope download/apply pipeline, sender,
//! conflict resolution, and the bookkeeping/progress types exposed to callers (spec §2, §4).

mod conflict;
mod downloader;
mod full_data;
mod linked_notebooks;
mod orchestrator;
mod pipeline;
mod processor;
mod sender;
mod state;
mod stop;

pub use conflict::{ConflictResolver, RenameConflict};
pub use downloader::{DownloadRequest, SyncChunksDownloader};
pub use full_data::FullDataDownloader;
pub use linked_notebooks::{LinkedNotebookManager, LinkedNotebookScope};
pub use orchestrator::{OrchestratorState, SyncEngine};
pub use pipeline::{run_download_phase, DownloadPhaseOutcome};
pub use processor::{PendingDownload, SyncChunksProcessor};
pub use sender::Sender;
pub use state::{
    DownloadNotesStatus, DownloadResourcesStatus, FailedDownload, FailedSendItem, KindSendCounters,
    NullProgressSink, PerScope, ProgressEvent, ProgressSink, SendStatus, SerializableError,
    SyncChunksDataCounters, SyncResult, SyncState,
};
pub use stop::{Canceler, StopSyncError, StopSynchronizationController};
