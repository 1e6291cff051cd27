use thiserror::Error;

/// Errors surfaced by the local storage collaborator (spec §6, out of scope for this crate to
/// implement, but its failure shape is part of the contract `SyncError` wraps).
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("local storage could not be opened: {0}")]
    Open(String),

    #[error("local storage operation failed: {0}")]
    Operation(String),

    #[error("item not found: {0}")]
    NotFound(String),
}
