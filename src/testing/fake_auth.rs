//! In-memory fakes of the [`Authenticator`], [`Keychain`], and [`SyncStateStorage`]
//! collaborators, behind the `testing` feature (or `cfg(test)` for this crate's own unit tests).

use std::{collections::HashMap, sync::Mutex};

use async_trait::async_trait;
use chrono::{Duration, Utc};

use crate::auth::{
    AuthError, AuthInfo, Authenticator, Keychain, KeychainError, PersistedSyncState,
    SyncStateStorage, SyncStateStorageError,
};

/// Always succeeds, minting a token valid for one hour pointed at a fixed note-store URL (tests
/// that need a scoped URL per linked notebook can still override `note_store_url` per call via
/// [`FakeAuthenticator::set_note_store_url`]).
pub struct FakeAuthenticator {
    note_store_urls: Mutex<HashMap<String, String>>,
    default_note_store_url: String,
    next_user_id: Mutex<i32>,
}

impl FakeAuthenticator {
    pub fn new(default_note_store_url: impl Into<String>) -> Self {
        Self {
            note_store_urls: Mutex::new(HashMap::new()),
            default_note_store_url: default_note_store_url.into(),
            next_user_id: Mutex::new(1),
        }
    }

    pub fn set_note_store_url(&self, linked_notebook_guid: &str, url: &str) {
        self.note_store_urls
            .lock()
            .unwrap()
            .insert(linked_notebook_guid.to_string(), url.to_string());
    }
}

#[async_trait]
impl Authenticator for FakeAuthenticator {
    async fn authenticate_account(&self, _account: &str) -> Result<AuthInfo, AuthError> {
        let now = Utc::now();
        Ok(AuthInfo {
            user_id: *self.next_user_id.lock().unwrap(),
            auth_token: "fake-user-token".to_string(),
            auth_token_expiration_time: now + Duration::hours(1),
            authentication_time: now,
            note_store_url: self.default_note_store_url.clone(),
            shard_id: Some("s1".to_string()),
            web_api_url_prefix: None,
            user_store_cookies: None,
        })
    }

    async fn authenticate_linked_notebook(
        &self,
        _account: &str,
        linked_notebook_guid: &str,
    ) -> Result<AuthInfo, AuthError> {
        let now = Utc::now();
        let note_store_url = self
            .note_store_urls
            .lock()
            .unwrap()
            .get(linked_notebook_guid)
            .cloned()
            .unwrap_or_else(|| self.default_note_store_url.clone());
        Ok(AuthInfo {
            user_id: *self.next_user_id.lock().unwrap(),
            auth_token: format!("fake-linked-token-{linked_notebook_guid}"),
            auth_token_expiration_time: now + Duration::hours(1),
            authentication_time: now,
            note_store_url,
            shard_id: Some("s1".to_string()),
            web_api_url_prefix: None,
            user_store_cookies: None,
        })
    }
}

#[derive(Default)]
pub struct FakeKeychain {
    entries: Mutex<HashMap<(String, String), String>>,
}

impl FakeKeychain {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Keychain for FakeKeychain {
    async fn write(&self, service: &str, key: &str, password: &str) -> Result<(), KeychainError> {
        self.entries
            .lock()
            .unwrap()
            .insert((service.to_string(), key.to_string()), password.to_string());
        Ok(())
    }

    async fn read(&self, service: &str, key: &str) -> Result<String, KeychainError> {
        self.entries
            .lock()
            .unwrap()
            .get(&(service.to_string(), key.to_string()))
            .cloned()
            .ok_or_else(|| KeychainError::EntryNotFound {
                service: service.to_string(),
                key: key.to_string(),
            })
    }

    async fn delete(&self, service: &str, key: &str) -> Result<(), KeychainError> {
        self.entries.lock().unwrap().remove(&(service.to_string(), key.to_string()));
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeSyncStateStorage {
    entries: Mutex<HashMap<String, PersistedSyncState>>,
}

impl FakeSyncStateStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SyncStateStorage for FakeSyncStateStorage {
    async fn get(&self, account: &str) -> Result<Option<PersistedSyncState>, SyncStateStorageError> {
        Ok(self.entries.lock().unwrap().get(account).cloned())
    }

    async fn set(&self, account: &str, state: PersistedSyncState) -> Result<(), SyncStateStorageError> {
        self.entries.lock().unwrap().insert(account.to_string(), state);
        Ok(())
    }
}
