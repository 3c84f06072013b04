use std::time::Duration;
use thiserror::Error;

/// Errors produced by the network collaborator.
///
/// The taxonomy matters to callers: transient errors are retried with backoff
/// and eventually downgraded to a reported per-resource failure, while fatal
/// errors are never retried.
#[derive(Error, Debug, Clone)]
pub enum FetchError {
    /// Connection failures, timeouts, and 5xx responses. Worth retrying.
    #[error("transient network error: {0}")]
    Transient(String),

    /// The server asked us to slow down (HTTP 429).
    #[error("rate limited (retry after {retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },

    /// Client errors (4xx other than 408/429) and malformed responses.
    /// Retrying will not help.
    #[error("fatal network error: {0}")]
    Fatal(String),
}

impl FetchError {
    /// Whether another attempt at the same request could succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::RateLimited { .. })
    }
}

pub type Result<T> = std::result::Result<T, FetchError>;
