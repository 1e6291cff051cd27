//! Synchronization engine configuration.
//!
//! Loading this from a file/CLI is explicitly out of scope (spec §1); [`SyncConfig`] is
//! assembled from discrete fields the way the teacher's `config.rs` assembles an `RpcConfig`,
//! rather than through a generic figment/toml loader.

use std::time::Duration;

/// Tuning knobs for one synchronization run.
#[derive(Clone, Debug)]
pub struct SyncConfig {
    /// `maxEntries` passed to `getFilteredSyncChunk`/`getLinkedNotebookSyncChunk` (spec §4.2).
    pub max_chunk_entries: u32,

    /// Maximum in-flight `getNoteWithResultSpec` requests (spec §4.4, default 16-100 per spec).
    pub max_in_flight_notes: usize,

    /// Maximum in-flight `getResource` requests (spec §4.4).
    pub max_in_flight_resources: usize,

    /// Per-RPC connection timeout (spec §5).
    pub rpc_timeout: Duration,

    /// Overall method-call timeout for a synchronous bridge (spec §5, default 10 minutes).
    pub overall_timeout: Duration,

    /// Bounded retries for transient/network errors on the sync-chunk downloader (spec §4.2).
    pub max_retries: u32,

    /// Base delay for the downloader's exponential backoff between retries.
    pub retry_backoff: Duration,

    /// If `false`, transient errors are not retried and surface immediately (spec §4.2
    /// "unless disabled by config").
    pub retries_enabled: bool,

    /// Bound on re-entering the download phase after a send leaves
    /// `needToRepeatIncrementalSync` set (spec §4.8).
    pub max_incremental_sync_repetitions: u32,

    /// Slack subtracted from a cached token's expiration time before it is considered stale
    /// (spec §4.1).
    pub auth_token_expiry_slack: Duration,
}

const DEFAULT_SERVER_MAX_CHUNK_ENTRIES: u32 = 200;

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_chunk_entries: DEFAULT_SERVER_MAX_CHUNK_ENTRIES,
            max_in_flight_notes: 16,
            max_in_flight_resources: 16,
            rpc_timeout: Duration::from_secs(30),
            overall_timeout: Duration::from_secs(10 * 60),
            max_retries: 3,
            retry_backoff: Duration::from_millis(500),
            retries_enabled: true,
            max_incremental_sync_repetitions: 3,
            auth_token_expiry_slack: Duration::from_secs(15 * 60),
        }
    }
}

impl SyncConfig {
    /// Builds a [`crate::rpc::RequestContext`] for one RPC call site from this config.
    pub fn request_context(&self) -> crate::rpc::RequestContext {
        let max_retries = if self.retries_enabled { self.max_retries } else { 0 };
        crate::rpc::RequestContext::new(self.rpc_timeout, max_retries, self.retry_backoff)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = SyncConfig::default();
        assert!(config.max_chunk_entries > 0);
        assert!(config.max_in_flight_notes > 0);
        assert!(config.max_in_flight_resources > 0);
    }

    #[test]
    fn retries_disabled_yields_zero_max_retries_in_context() {
        let mut config = SyncConfig::default();
        config.retries_enabled = false;
        let ctx = config.request_context();
        assert_eq!(ctx.max_retries, 0);
    }
}
