use thiserror::Error;

/// Errors surfaced by the note-store/user-store RPC transport (spec §1 "remote service
/// transport", out of scope to implement here; spec §6 documents the EDAM wire error shapes
/// this enum classifies them into).
#[derive(Debug, Error)]
pub enum RpcError {
    /// EDAM `NotFoundException { identifier, key? }`.
    #[error("not found: {identifier}{}", key.as_deref().map(|k| format!(" ({k})")).unwrap_or_default())]
    NotFound { identifier: String, key: Option<String> },

    /// EDAM `UserException { errorCode, parameter }`.
    #[error("user error {error_code}{}", parameter.as_deref().map(|p| format!(": {p}")).unwrap_or_default())]
    User { error_code: String, parameter: Option<String> },

    /// EDAM `SystemException { errorCode, message, rateLimitDuration? }` that is not a
    /// rate-limit/auth-expired signal.
    #[error("system error {error_code}: {message}")]
    System { error_code: String, message: String },

    /// EDAM `SystemException { errorCode: RATE_LIMIT_REACHED, rateLimitDuration }`.
    #[error("server rate limit reached, retry after {0:?} seconds")]
    RateLimitReached(Option<i32>),

    /// EDAM `SystemException { errorCode: AUTH_EXPIRED }`, or any lower-level transport signal
    /// carrying the same meaning (spec §4.10: "any lower-level code may report one of these").
    #[error("authentication expired")]
    AuthenticationExpired,

    /// Connection-level failure, malformed response, timeout. Retried with backoff by the
    /// downloader unless the retry budget is disabled (spec §4.2).
    #[error("transport error: {0}")]
    Transport(String),
}

impl RpcError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, RpcError::Transport(_))
    }
}
