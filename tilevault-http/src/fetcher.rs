//! HTTP Resource Fetcher using Reqwest

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use reqwest::header::{self, HeaderMap};
use reqwest::{Client, StatusCode};
use std::time::Duration;
use tilevault_bridge::{FetchError, FetchOutcome, ResourceFetcher, ResourceValidators, Result};
use tracing::{debug, warn};

/// Reqwest-based [`ResourceFetcher`] implementation.
///
/// Sends `If-None-Match` / `If-Modified-Since` when the stored validators
/// allow a conditional request, and folds `ETag`, `Last-Modified`, `Expires`
/// and `Cache-Control: max-age` response headers back into
/// [`ResourceValidators`].
pub struct HttpResourceFetcher {
    client: Client,
}

impl HttpResourceFetcher {
    /// Create a fetcher with default configuration.
    pub fn new() -> Self {
        Self::with_timeout(Duration::from_secs(30))
    }

    /// Create a fetcher with a custom per-request timeout.
    pub fn with_timeout(timeout: Duration) -> Self {
        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(Duration::from_secs(10))
            .pool_max_idle_per_host(10)
            .user_agent("tilevault/0.1.0")
            .build()
            .expect("Failed to build HTTP client");

        Self { client }
    }

    /// Wrap an already-configured client.
    pub fn with_client(client: Client) -> Self {
        Self { client }
    }

    fn parse_validators(headers: &HeaderMap, now: i64) -> ResourceValidators {
        let etag = headers
            .get(header::ETAG)
            .and_then(|value| value.to_str().ok())
            .map(str::to_owned);

        let last_modified = headers
            .get(header::LAST_MODIFIED)
            .and_then(|value| value.to_str().ok())
            .and_then(parse_http_date);

        // Cache-Control: max-age wins over Expires, per RFC 9111.
        let max_age = headers
            .get(header::CACHE_CONTROL)
            .and_then(|value| value.to_str().ok())
            .and_then(parse_max_age);

        let expires = match max_age {
            Some(seconds) => Some(now.saturating_add(seconds)),
            None => headers
                .get(header::EXPIRES)
                .and_then(|value| value.to_str().ok())
                .and_then(parse_http_date),
        };

        ResourceValidators {
            etag,
            last_modified,
            expires,
        }
    }

    fn retry_after(headers: &HeaderMap) -> Option<Duration> {
        headers
            .get(header::RETRY_AFTER)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.parse::<u64>().ok())
            .map(Duration::from_secs)
    }
}

impl Default for HttpResourceFetcher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ResourceFetcher for HttpResourceFetcher {
    async fn fetch(&self, url: &str, validators: &ResourceValidators) -> Result<FetchOutcome> {
        let mut request = self.client.get(url);

        if let Some(etag) = &validators.etag {
            request = request.header(header::IF_NONE_MATCH, etag.clone());
        }
        if let Some(last_modified) = validators.last_modified {
            if let Some(formatted) = format_http_date(last_modified) {
                request = request.header(header::IF_MODIFIED_SINCE, formatted);
            }
        }

        debug!(url, conditional = validators.supports_conditional(), "Fetching resource");

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() || e.is_connect() {
                FetchError::Transient(format!("request to {} failed: {}", url, e))
            } else {
                FetchError::Fatal(format!("request to {} failed: {}", url, e))
            }
        })?;

        let status = response.status();
        let now = Utc::now().timestamp();
        let refreshed = Self::parse_validators(response.headers(), now);

        if status == StatusCode::NOT_MODIFIED {
            debug!(url, "Resource not modified");
            return Ok(FetchOutcome::NotModified {
                validators: refreshed,
            });
        }

        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after = Self::retry_after(response.headers());
            warn!(url, ?retry_after, "Rate limited");
            return Err(FetchError::RateLimited { retry_after });
        }

        if status.is_server_error() || status == StatusCode::REQUEST_TIMEOUT {
            return Err(FetchError::Transient(format!("HTTP {} for {}", status, url)));
        }

        if !status.is_success() {
            return Err(FetchError::Fatal(format!("HTTP {} for {}", status, url)));
        }

        let body: Bytes = response.bytes().await.map_err(|e| {
            FetchError::Transient(format!("reading body of {} failed: {}", url, e))
        })?;

        Ok(FetchOutcome::Modified {
            body,
            validators: refreshed,
        })
    }
}

fn parse_http_date(value: &str) -> Option<i64> {
    DateTime::parse_from_rfc2822(value)
        .ok()
        .map(|datetime| datetime.timestamp())
}

fn format_http_date(timestamp: i64) -> Option<String> {
    DateTime::<Utc>::from_timestamp(timestamp, 0)
        .map(|datetime| datetime.format("%a, %d %b %Y %H:%M:%S GMT").to_string())
}

fn parse_max_age(cache_control: &str) -> Option<i64> {
    cache_control.split(',').find_map(|directive| {
        let directive = directive.trim();
        directive
            .strip_prefix("max-age=")
            .and_then(|seconds| seconds.parse::<i64>().ok())
    })
}
