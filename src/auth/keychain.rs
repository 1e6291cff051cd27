use async_trait::async_trait;
use thiserror::Error;

/// Errors from the keychain/secret-store collaborator (spec §1, §6).
#[derive(Clone, Debug, Error)]
pub enum KeychainError {
    #[error("no entry for service={service} key={key}")]
    EntryNotFound { service: String, key: String },

    #[error("keychain error: {0}")]
    Other(String),
}

/// The secret/keychain store (spec §1, §6). Only auth tokens are written here; non-sensitive
/// scope metadata goes through [`super::sync_state_storage::SyncStateStorage`] instead.
#[async_trait]
pub trait Keychain: Send + Sync {
    async fn write(&self, service: &str, key: &str, password: &str) -> Result<(), KeychainError>;
    async fn read(&self, service: &str, key: &str) -> Result<String, KeychainError>;
    async fn delete(&self, service: &str, key: &str) -> Result<(), KeychainError>;
}
