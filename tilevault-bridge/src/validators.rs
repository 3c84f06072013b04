//! Resource Cache Validators
//!
//! A resource is identified by its URL plus the validators the origin server
//! handed back with it. Validators drive two decisions: whether a stored copy
//! may be served without revalidation (`expires`), and whether a revalidation
//! can be conditional (`etag` / `last_modified`).

use serde::{Deserialize, Serialize};

/// Cache validators attached to a stored resource.
///
/// All timestamps are seconds since the Unix epoch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceValidators {
    /// Opaque entity tag, sent back as `If-None-Match`.
    pub etag: Option<String>,
    /// Last modification time, sent back as `If-Modified-Since`.
    pub last_modified: Option<i64>,
    /// Expiry time. Absent means "unknown", which is treated as stale.
    pub expires: Option<i64>,
}

impl ResourceValidators {
    /// Validators that immediately require revalidation.
    pub fn stale() -> Self {
        Self {
            expires: Some(0),
            ..Self::default()
        }
    }

    /// Whether the stored body may be served as-is at time `now`.
    pub fn is_fresh(&self, now: i64) -> bool {
        matches!(self.expires, Some(expires) if expires > now)
    }

    /// Whether a revalidation can be conditional (cheap when unchanged).
    pub fn supports_conditional(&self) -> bool {
        self.etag.is_some() || self.last_modified.is_some()
    }

    /// A copy of these validators with the expiry forced into the past.
    ///
    /// `etag` and `last_modified` are retained so the next access can still
    /// revalidate conditionally instead of re-downloading the body.
    pub fn invalidated(&self) -> Self {
        Self {
            etag: self.etag.clone(),
            last_modified: self.last_modified,
            expires: Some(0),
        }
    }
}
