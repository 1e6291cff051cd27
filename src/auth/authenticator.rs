use async_trait::async_trait;
use thiserror::Error;

use super::AuthInfo;

/// Errors raised directly by the external [`Authenticator`] collaborator.
#[derive(Clone, Debug, Error)]
pub enum AuthError {
    #[error("authentication failed: {0}")]
    Failed(String),
}

/// The external collaborator that actually obtains tokens (spec §1 "the authenticator"; named
/// explicitly per SPEC_FULL §6 since spec §4.1 only implies its contract).
#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn authenticate_account(&self, account: &str) -> Result<AuthInfo, AuthError>;

    async fn authenticate_linked_notebook(
        &self,
        account: &str,
        linked_notebook_guid: &str,
    ) -> Result<AuthInfo, AuthError>;
}
