//! Bridge error types.

use thiserror::Error;

/// Result type for bridge operations.
pub type BridgeResult<T> = Result<T, BridgeError>;

/// Errors surfaced by the session/event bridge.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// The assistant process cannot be started or does not answer pings.
    /// Non-fatal; the next call retries lazily.
    #[error("assistant unavailable: {0}")]
    UpstreamUnavailable(String),

    /// The assistant refused to allocate a session handle.
    #[error("failed to create session: {0}")]
    SessionCreationFailed(String),

    /// No session with the given identifier.
    #[error("session not found: {0}")]
    SessionNotFound(String),

    /// The configured session cap would be exceeded.
    #[error("session limit reached ({0} active)")]
    SessionLimitReached(usize),

    /// The assistant reported an error event mid-turn. The message is the
    /// upstream's, verbatim.
    #[error("assistant error: {0}")]
    Upstream(String),
}
