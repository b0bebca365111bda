//! Error types surfaced at the library boundary.

use std::time::Duration;

use thiserror::Error;

/// Failure of a chat-completion call.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ModelError {
    /// Network trouble, request timeout, or a 5xx. Worth retrying.
    #[error("transient completion failure: {0}")]
    Transient(String),

    /// HTTP 429, optionally with the server's requested wait.
    #[error("rate limited by completion service")]
    RateLimited { retry_after: Option<Duration> },

    /// Bad request, auth failure, or an unusable response. Not retried.
    #[error("completion failed: {0}")]
    Fatal(String),

    /// Bounded retry policy gave up.
    #[error("completion failed after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: String },
}

impl ModelError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ModelError::Transient(_) | ModelError::RateLimited { .. })
    }
}

/// Failure of a whole fetch session.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("invalid fetch request: {0}")]
    InvalidRequest(String),

    #[error(transparent)]
    Model(#[from] ModelError),

    /// A broken internal invariant. Reported, never swallowed.
    #[error("internal fault: {0}")]
    Internal(String),
}
