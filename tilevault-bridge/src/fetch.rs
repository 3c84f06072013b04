//! Network Collaborator Abstraction
//!
//! The download pipeline never talks to the network directly; it goes through
//! [`ResourceFetcher`], which fetches one resource given its URL and the
//! validators of any stored copy. Conditional requests are first-class so
//! that invalidation is cheap when content is unchanged.

use async_trait::async_trait;
use bytes::Bytes;
use std::time::Duration;

use crate::error::Result;
use crate::validators::ResourceValidators;

/// Outcome of a single resource fetch.
#[derive(Debug, Clone)]
pub enum FetchOutcome {
    /// The origin returned a new body.
    Modified {
        body: Bytes,
        validators: ResourceValidators,
    },
    /// The stored copy is still current (HTTP 304). Only the validators are
    /// refreshed; the caller keeps its body.
    NotModified { validators: ResourceValidators },
}

impl FetchOutcome {
    /// The refreshed validators regardless of variant.
    pub fn validators(&self) -> &ResourceValidators {
        match self {
            Self::Modified { validators, .. } | Self::NotModified { validators } => validators,
        }
    }
}

/// Retry policy for transient fetch failures.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including the first).
    pub max_attempts: u32,
    /// Base delay between retries.
    pub base_delay: Duration,
    /// Ceiling for the exponential backoff.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Delay to sleep before retrying after attempt number `attempt`
    /// (1-based), doubling per attempt and capped at `max_delay`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let delay = self.base_delay.saturating_mul(1u32 << exp);
        delay.min(self.max_delay)
    }
}

/// Async network collaborator.
///
/// Implementations should send `If-None-Match` / `If-Modified-Since` when the
/// supplied validators allow it, and map transport failures onto the
/// [`FetchError`](crate::error::FetchError) taxonomy so the orchestrator can
/// tell retryable failures from hopeless ones.
#[async_trait]
pub trait ResourceFetcher: Send + Sync {
    /// Fetch one resource, conditionally when `validators` permit.
    async fn fetch(&self, url: &str, validators: &ResourceValidators) -> Result<FetchOutcome>;
}
