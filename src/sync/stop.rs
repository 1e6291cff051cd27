//! Stop-synchronization signal and cancellation plumbing (spec §4.10, §5).

use tokio_util::sync::CancellationToken;

use crate::rpc::RpcError;

/// The sum type embedded in every status record (spec §4.9, §9 "stop-sync sentinel").
///
/// Structurally this is a `None | RateLimitReached | AuthenticationExpired` tri-state rather
/// than the source's exception-based control flow (spec §9 redesign note).
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "type")]
pub enum StopSyncError {
    #[default]
    #[serde(rename = "none")]
    None,
    #[serde(rename = "rateLimitReached")]
    RateLimitReached { seconds: Option<i32> },
    #[serde(rename = "authenticationExpired")]
    AuthenticationExpired,
}

impl StopSyncError {
    pub fn is_none(&self) -> bool {
        matches!(self, StopSyncError::None)
    }

    pub fn from_rpc_error(err: &RpcError) -> Option<Self> {
        match err {
            RpcError::RateLimitReached(seconds) => {
                Some(StopSyncError::RateLimitReached { seconds: *seconds })
            },
            RpcError::AuthenticationExpired => Some(StopSyncError::AuthenticationExpired),
            _ => None,
        }
    }
}

/// One [`CancellationToken`] per synchronization run (spec §5), shared across every scope
/// pipeline and fired by the [`StopSynchronizationController`] when a rate-limit or
/// auth-expired signal arrives. Cloning is cheap and shares the same underlying token.
#[derive(Clone, Debug, Default)]
pub struct Canceler {
    token: CancellationToken,
}

impl Canceler {
    pub fn new() -> Self {
        Self { token: CancellationToken::new() }
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub async fn cancelled(&self) {
        self.token.cancelled().await;
    }
}

/// Raised internally by `Canceler::bail_if_cancelled`-style checks at suspension points;
/// converted to [`crate::errors::SyncError::OperationCanceled`] at the orchestrator boundary.
#[derive(Debug, thiserror::Error)]
#[error("operation canceled")]
pub struct Canceled;

/// Detects rate-limit/auth-expired signals and cancels in-flight work for the affected scope
/// (spec §4.10).
///
/// A single controller instance is shared by every scope pipeline in a run; each scope reports
/// its own trigger via [`Self::record`], and the orchestrator reads back the first one recorded
/// (there is at most one meaningful stop-sync error per run: once triggered, the canceler fires
/// and every other in-flight scope unwinds too).
pub struct StopSynchronizationController {
    canceler: Canceler,
    triggered: std::sync::Mutex<Option<StopSyncError>>,
}

impl StopSynchronizationController {
    pub fn new(canceler: Canceler) -> Self {
        Self { canceler, triggered: std::sync::Mutex::new(None) }
    }

    pub fn canceler(&self) -> &Canceler {
        &self.canceler
    }

    /// Records a stop-sync trigger and cancels the shared token. Idempotent: only the first
    /// trigger in a run is retained.
    pub fn record(&self, error: StopSyncError) {
        if error.is_none() {
            return;
        }
        let mut triggered = self.triggered.lock().expect("stop-sync mutex poisoned");
        if triggered.is_none() {
            tracing::warn!(?error, "stop-synchronization trigger recorded, cancelling run");
            *triggered = Some(error);
        }
        self.canceler.cancel();
    }

    pub fn triggered(&self) -> StopSyncError {
        self.triggered.lock().expect("stop-sync mutex poisoned").unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_trigger_wins() {
        let controller = StopSynchronizationController::new(Canceler::new());
        controller.record(StopSyncError::RateLimitReached { seconds: Some(300) });
        controller.record(StopSyncError::AuthenticationExpired);
        assert_eq!(controller.triggered(), StopSyncError::RateLimitReached { seconds: Some(300) });
        assert!(controller.canceler().is_cancelled());
    }

    #[test]
    fn none_does_not_cancel() {
        let controller = StopSynchronizationController::new(Canceler::new());
        controller.record(StopSyncError::None);
        assert!(!controller.canceler().is_cancelled());
        assert_eq!(controller.triggered(), StopSyncError::None);
    }
}
