//! The note-store/user-store RPC surface the synchronization engine consumes (spec §6).
//!
//! Both the transport and its concrete wire encoding (Thrift, in the real EDAM protocol) are out
//! of scope for this crate (spec §1); [`NoteStoreClient`] and [`UserStoreClient`] are the trait
//! boundaries a real transport implementation satisfies. `testing::fake_rpc` ships an in-memory
//! fake server used by the integration tests.

pub mod domain;
mod errors;
pub use errors::RpcError;

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;

use crate::{
    auth::AuthInfo,
    types::{LinkedNotebook, Note, Notebook, Resource, SavedSearch, Tag, Usn},
};
use domain::{AuthenticationResult, NoteResultSpec, ResourceFetchFlags, SyncChunk, SyncChunkFilter, SyncState, UserProfile};

/// Per-request tuning: connection timeout and retry policy (spec §4.2, §5).
///
/// One `RequestContext` is built per RPC call site from [`crate::config::SyncConfig`]; it is not
/// shared mutable state, it is a plain value passed down.
#[derive(Clone, Copy, Debug)]
pub struct RequestContext {
    pub timeout: Duration,
    pub max_retries: u32,
    pub retry_backoff: Duration,
}

impl RequestContext {
    pub fn new(timeout: Duration, max_retries: u32, retry_backoff: Duration) -> Self {
        Self { timeout, max_retries, retry_backoff }
    }
}

/// RPC operations against one scope's note-store endpoint.
///
/// A single implementor instance is bound to one note-store URL/shard; the user-own scope and
/// each linked notebook scope get their own instance, obtained via [`NoteStoreClientFactory`].
#[async_trait]
pub trait NoteStoreClient: Send + Sync {
    async fn get_sync_state(&self, ctx: &RequestContext) -> Result<SyncState, RpcError>;

    async fn get_filtered_sync_chunk(
        &self,
        after_usn: Usn,
        max_entries: u32,
        filter: &SyncChunkFilter,
        ctx: &RequestContext,
    ) -> Result<SyncChunk, RpcError>;

    async fn get_linked_notebook_sync_state(
        &self,
        linked_notebook: &LinkedNotebook,
        ctx: &RequestContext,
    ) -> Result<SyncState, RpcError>;

    async fn get_linked_notebook_sync_chunk(
        &self,
        linked_notebook: &LinkedNotebook,
        after_usn: Usn,
        max_entries: u32,
        filter: &SyncChunkFilter,
        ctx: &RequestContext,
    ) -> Result<SyncChunk, RpcError>;

    async fn get_note_with_result_spec(
        &self,
        guid: &str,
        spec: NoteResultSpec,
        ctx: &RequestContext,
    ) -> Result<Note, RpcError>;

    async fn get_resource(
        &self,
        guid: &str,
        flags: ResourceFetchFlags,
        ctx: &RequestContext,
    ) -> Result<Resource, RpcError>;

    /// `linked_notebook_guid` is passed explicitly rather than smuggled through the request
    /// transport (SPEC_FULL §9 redesign of the source's uri-smuggling pattern).
    async fn create_notebook(
        &self,
        notebook: Notebook,
        linked_notebook_guid: Option<&str>,
        ctx: &RequestContext,
    ) -> Result<Notebook, RpcError>;

    async fn update_notebook(
        &self,
        notebook: Notebook,
        linked_notebook_guid: Option<&str>,
        ctx: &RequestContext,
    ) -> Result<Usn, RpcError>;

    async fn create_tag(
        &self,
        tag: Tag,
        linked_notebook_guid: Option<&str>,
        ctx: &RequestContext,
    ) -> Result<Tag, RpcError>;

    async fn update_tag(
        &self,
        tag: Tag,
        linked_notebook_guid: Option<&str>,
        ctx: &RequestContext,
    ) -> Result<Usn, RpcError>;

    async fn create_note(&self, note: Note, ctx: &RequestContext) -> Result<Note, RpcError>;

    async fn update_note(&self, note: Note, ctx: &RequestContext) -> Result<Usn, RpcError>;

    async fn create_saved_search(
        &self,
        search: SavedSearch,
        ctx: &RequestContext,
    ) -> Result<SavedSearch, RpcError>;

    async fn update_saved_search(
        &self,
        search: SavedSearch,
        ctx: &RequestContext,
    ) -> Result<Usn, RpcError>;

    async fn authenticate_to_shared_notebook(
        &self,
        share_key_or_global_id: &str,
        ctx: &RequestContext,
    ) -> Result<AuthenticationResult, RpcError>;
}

/// User-store RPC operations (spec §6).
#[async_trait]
pub trait UserStoreClient: Send + Sync {
    async fn check_version(
        &self,
        client_name: &str,
        edam_version_major: i16,
        edam_version_minor: i16,
    ) -> Result<bool, RpcError>;

    async fn get_user(&self) -> Result<UserProfile, RpcError>;
}

/// Builds a scoped [`NoteStoreClient`] for a given [`AuthInfo`] (user-own or linked-notebook).
///
/// Real transports construct this from `auth.note_store_url`; kept as a factory trait so the
/// Auth Scope Manager and Linked Notebook Manager never depend on a concrete transport type.
pub trait NoteStoreClientFactory: Send + Sync {
    fn client_for(&self, auth: &AuthInfo) -> Arc<dyn NoteStoreClient>;
}
