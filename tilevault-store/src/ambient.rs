//! Ambient cache policy.
//!
//! Resources fetched outside any region (`pin_count == 0`) live under a
//! byte-size ceiling. When the ceiling is exceeded or lowered, the least
//! recently used ambient resources are evicted first, ties broken by
//! insertion order. Pinned resources are never touched by this policy.

use sqlx::Row;
use tracing::{info, instrument, warn};

use crate::error::Result;
use crate::store::LocalStore;

impl LocalStore {
    /// Set the ambient cache ceiling and synchronously evict least recently
    /// used unpinned resources until the total footprint fits.
    ///
    /// Returns the number of bytes by which the store still exceeds the
    /// ceiling after evicting everything evictable; non-zero only when the
    /// remaining bytes are all pinned by regions. That overshoot is reported,
    /// not an error; it shrinks as regions are deleted or unpinned.
    #[instrument(skip(self))]
    pub async fn set_maximum_ambient_size(&self, max_bytes: u64) -> Result<u64> {
        let _permit = self.write_permit().await;
        self.store_ambient_ceiling(max_bytes);
        let overshoot = self.enforce_ambient_ceiling(max_bytes).await?;
        if overshoot > 0 {
            warn!(
                max_bytes,
                overshoot, "Ambient ceiling accepted but pinned data exceeds it"
            );
        }
        Ok(overshoot)
    }

    /// Evict unpinned resources (LRU first, then insertion order) until the
    /// total stored bytes are within `max_bytes`. Returns the overshoot that
    /// pinned bytes alone account for.
    pub(crate) async fn enforce_ambient_ceiling(&self, max_bytes: u64) -> Result<u64> {
        let mut total = self.total_bytes().await?;
        if total <= max_bytes {
            return Ok(0);
        }

        let candidates = sqlx::query(
            "SELECT id, size_bytes FROM resources
             WHERE pin_count = 0
             ORDER BY last_used ASC, id ASC",
        )
        .fetch_all(self.pool())
        .await?;

        let mut evicted = 0u64;
        for row in &candidates {
            if total <= max_bytes {
                break;
            }
            let id: i64 = row.try_get("id")?;
            let size: i64 = row.try_get("size_bytes")?;

            sqlx::query("DELETE FROM resources WHERE id = ? AND pin_count = 0")
                .bind(id)
                .execute(self.pool())
                .await?;

            total = total.saturating_sub(size as u64);
            evicted += 1;
        }

        if evicted > 0 {
            info!(evicted, remaining_bytes = total, "Evicted ambient resources");
        }
        Ok(total.saturating_sub(max_bytes))
    }

    /// Delete every ambient (unpinned) resource. Pinned resources are
    /// untouched.
    #[instrument(skip(self))]
    pub async fn clear_ambient(&self) -> Result<u64> {
        let _permit = self.write_permit().await;
        let result = sqlx::query("DELETE FROM resources WHERE pin_count = 0")
            .execute(self.pool())
            .await?;
        info!(cleared = result.rows_affected(), "Cleared ambient cache");
        Ok(result.rows_affected())
    }

    /// Mark every ambient resource stale. Bodies are kept; the next access
    /// revalidates conditionally instead of serving possibly-outdated
    /// content.
    #[instrument(skip(self))]
    pub async fn invalidate_ambient(&self) -> Result<()> {
        let _permit = self.write_permit().await;
        sqlx::query("UPDATE resources SET expires = 0 WHERE pin_count = 0")
            .execute(self.pool())
            .await?;
        Ok(())
    }

    /// Total bytes held by ambient (unpinned) resources.
    pub async fn ambient_bytes(&self) -> Result<u64> {
        let sum: (Option<i64>,) = sqlx::query_as(
            "SELECT SUM(size_bytes) FROM resources WHERE pin_count = 0",
        )
        .fetch_one(self.pool())
        .await?;
        Ok(sum.0.unwrap_or(0) as u64)
    }

    /// Total bytes held by all resources, pinned and ambient.
    pub async fn total_bytes(&self) -> Result<u64> {
        let sum: (Option<i64>,) = sqlx::query_as("SELECT SUM(size_bytes) FROM resources")
            .fetch_one(self.pool())
            .await?;
        Ok(sum.0.unwrap_or(0) as u64)
    }
}
