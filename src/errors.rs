use thiserror::Error;

use crate::rpc::RpcError;
use crate::store::StoreError;
use crate::sync::StopSyncError;

// SYNC ERROR
// ================================================================================================

/// The closed set of errors the synchronization engine can surface to a caller.
///
/// Per-item failures inside a chunk or a send batch are *not* represented here — those are
/// recorded in the applicable status record (see [`crate::sync::SendStatus`],
/// [`crate::sync::SyncChunksDataCounters`]) and do not abort the run. A [`SyncError`] is reserved
/// for failures that abort the whole synchronization attempt.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("operation canceled")]
    OperationCanceled,

    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("authentication expired")]
    AuthenticationExpired,

    #[error("server rate limit reached, retry after {0:?} seconds")]
    RateLimitReached(Option<i32>),

    #[error("local storage could not be opened")]
    LocalStorageOpen(#[source] StoreError),

    #[error("local storage operation failed")]
    LocalStorageOperation(#[source] StoreError),

    #[error("server returned sync chunks out of order: {0}")]
    ProtocolViolation(String),

    #[error("rpc error")]
    Rpc(#[from] RpcError),

    #[error("runtime error: {0}")]
    RuntimeError(String),
}

impl SyncError {
    /// True if this error is one of the two stop-synchronization triggers (spec §4.10).
    pub fn as_stop_sync_error(&self) -> Option<StopSyncError> {
        match self {
            SyncError::RateLimitReached(seconds) => Some(StopSyncError::RateLimitReached {
                seconds: *seconds,
            }),
            SyncError::AuthenticationExpired => Some(StopSyncError::AuthenticationExpired),
            SyncError::Rpc(RpcError::RateLimitReached(seconds)) => {
                Some(StopSyncError::RateLimitReached { seconds: *seconds })
            },
            SyncError::Rpc(RpcError::AuthenticationExpired) => {
                Some(StopSyncError::AuthenticationExpired)
            },
            _ => None,
        }
    }
}

impl From<StoreError> for SyncError {
    fn from(err: StoreError) -> Self {
        SyncError::LocalStorageOperation(err)
    }
}
