//! Caches authentication material per scope and refreshes it through the external
//! [`Authenticator`] (spec §4.1).

mod authenticator;
mod keychain;
mod sync_state_storage;

pub use authenticator::{AuthError, Authenticator};
pub use keychain::{Keychain, KeychainError};
pub use sync_state_storage::{AuthMetadata, PersistedSyncState, SyncStateStorage, SyncStateStorageError};

use std::{
    collections::HashMap,
    sync::{Arc, Mutex as StdMutex},
    time::Duration,
};

use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt, Shared};
use tracing::{debug, info};

use crate::types::Scope;

/// Everything the engine needs to talk to one scope's note-store (spec §4.1).
#[derive(Clone, Debug, PartialEq)]
pub struct AuthInfo {
    pub user_id: i32,
    pub auth_token: String,
    pub auth_token_expiration_time: DateTime<Utc>,
    pub authentication_time: DateTime<Utc>,
    pub note_store_url: String,
    pub shard_id: Option<String>,
    pub web_api_url_prefix: Option<String>,
    pub user_store_cookies: Option<String>,
}

impl AuthInfo {
    /// True when fewer than `slack` remains before the token expires.
    fn is_expiring(&self, now: DateTime<Utc>, slack: Duration) -> bool {
        let slack = chrono::Duration::from_std(slack).unwrap_or(chrono::Duration::zero());
        self.auth_token_expiration_time - slack <= now
    }
}

#[derive(Clone, Eq, PartialEq, Hash)]
enum ScopeKey {
    UserOwn,
    LinkedNotebook(String),
}

impl From<&Scope> for ScopeKey {
    fn from(scope: &Scope) -> Self {
        match scope {
            Scope::UserOwn => ScopeKey::UserOwn,
            Scope::LinkedNotebook(guid) => ScopeKey::LinkedNotebook(guid.clone()),
        }
    }
}

type AuthResult = Result<AuthInfo, AuthError>;
type InflightFuture = Shared<BoxFuture<'static, AuthResult>>;

/// Caches authentication material per scope (spec §4.1).
///
/// Concurrent callers for the same scope deduplicate onto a single in-flight authentication
/// attempt via a `Shared` future stashed in `inflight`, the same "only one refresh in flight"
/// shape the teacher uses for pooled connections (keeps this a plain struct with interior
/// mutability rather than an actor).
pub struct AuthScopeManager {
    account: String,
    authenticator: Arc<dyn Authenticator>,
    keychain: Arc<dyn Keychain>,
    sync_state_storage: Arc<dyn SyncStateStorage>,
    slack: Duration,
    cache: StdMutex<HashMap<ScopeKey, AuthInfo>>,
    inflight: StdMutex<HashMap<ScopeKey, InflightFuture>>,
}

impl AuthScopeManager {
    pub fn new(
        account: impl Into<String>,
        authenticator: Arc<dyn Authenticator>,
        keychain: Arc<dyn Keychain>,
        sync_state_storage: Arc<dyn SyncStateStorage>,
        slack: Duration,
    ) -> Self {
        Self {
            account: account.into(),
            authenticator,
            keychain,
            sync_state_storage,
            slack,
            cache: StdMutex::new(HashMap::new()),
            inflight: StdMutex::new(HashMap::new()),
        }
    }

    pub async fn authenticate_account(&self) -> AuthResult {
        let key = ScopeKey::UserOwn;
        if let Some(cached) = self.cached(&key) {
            return Ok(cached);
        }
        let account = self.account.clone();
        let authenticator = self.authenticator.clone();
        self.authenticate(key, move || {
            let account = account.clone();
            let authenticator = authenticator.clone();
            async move { authenticator.authenticate_account(&account).await }.boxed()
        })
        .await
    }

    pub async fn authenticate_linked_notebook(&self, linked_notebook_guid: &str) -> AuthResult {
        let key = ScopeKey::LinkedNotebook(linked_notebook_guid.to_string());
        if let Some(cached) = self.cached(&key) {
            return Ok(cached);
        }
        let account = self.account.clone();
        let authenticator = self.authenticator.clone();
        let guid = linked_notebook_guid.to_string();
        self.authenticate(key, move || {
            let account = account.clone();
            let authenticator = authenticator.clone();
            let guid = guid.clone();
            async move { authenticator.authenticate_linked_notebook(&account, &guid).await }
                .boxed()
        })
        .await
    }

    /// Evicts the cached entry for a scope. Called when the server reports
    /// `AuthenticationExpired` mid-run (spec §4.1) so the next call re-authenticates.
    pub fn invalidate(&self, scope: &Scope) {
        let key = ScopeKey::from(scope);
        self.cache.lock().expect("auth cache mutex poisoned").remove(&key);
    }

    fn cached(&self, key: &ScopeKey) -> Option<AuthInfo> {
        let cache = self.cache.lock().expect("auth cache mutex poisoned");
        let entry = cache.get(key)?;
        if entry.is_expiring(Utc::now(), self.slack) {
            None
        } else {
            Some(entry.clone())
        }
    }

    async fn authenticate(
        &self,
        key: ScopeKey,
        make_request: impl FnOnce() -> BoxFuture<'static, AuthResult> + Send + 'static,
    ) -> AuthResult {
        let shared = {
            let mut inflight = self.inflight.lock().expect("auth inflight mutex poisoned");
            if let Some(existing) = inflight.get(&key) {
                existing.clone()
            } else {
                debug!(scope = ?key_label(&key), "authenticating scope");
                let shared: InflightFuture = make_request().shared();
                inflight.insert(key.clone(), shared.clone());
                shared
            }
        };

        let result = shared.await;

        // Only the caller that actually issued the request clears the in-flight slot; callers
        // that joined an existing attempt leave it for the issuer to clear, avoiding a race
        // where a second request is kicked off before the first's result is cached.
        self.inflight.lock().expect("auth inflight mutex poisoned").remove(&key);

        match &result {
            Ok(info) => {
                self.persist(&key, info).await;
                self.cache
                    .lock()
                    .expect("auth cache mutex poisoned")
                    .insert(key, info.clone());
                info!(scope = ?key_label(&key), "authenticated scope");
            },
            Err(err) => {
                tracing::warn!(scope = ?key_label(&key), error = %err, "authentication failed");
            },
        }

        result
    }

    /// Persists the token to the keychain and the non-sensitive half of `info` to sync-state
    /// storage (spec §4.1). Progress markers (`updateCount`, `lastSyncTime`) are the Sync
    /// State & Progress module's responsibility to persist once a scope sync completes (§4.9),
    /// so this only ever touches the `*_auth` fields of [`PersistedSyncState`].
    async fn persist(&self, key: &ScopeKey, info: &AuthInfo) {
        let service = format!("edam-sync/{}", self.account);
        let secret_key = key_label(key);
        if let Err(err) = self.keychain.write(&service, &secret_key, &info.auth_token).await {
            tracing::warn!(error = %err, "failed to persist auth token to keychain");
        }

        let metadata = AuthMetadata {
            user_id: info.user_id,
            authentication_time: info.authentication_time,
            note_store_url: info.note_store_url.clone(),
            shard_id: info.shard_id.clone(),
            web_api_url_prefix: info.web_api_url_prefix.clone(),
        };

        let mut persisted = self
            .sync_state_storage
            .get(&self.account)
            .await
            .ok()
            .flatten()
            .unwrap_or_default();

        match key {
            ScopeKey::UserOwn => persisted.user_own_auth = Some(metadata),
            ScopeKey::LinkedNotebook(guid) => {
                persisted.linked_notebook_auth.insert(guid.clone(), metadata);
            },
        }

        if let Err(err) = self.sync_state_storage.set(&self.account, persisted).await {
            tracing::warn!(error = %err, "failed to persist auth metadata");
        }
    }
}

fn key_label(key: &ScopeKey) -> String {
    match key {
        ScopeKey::UserOwn => "user-own".to_string(),
        ScopeKey::LinkedNotebook(guid) => format!("linked-notebook:{guid}"),
    }
}
