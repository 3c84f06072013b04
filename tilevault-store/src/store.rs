//! The [`LocalStore`] facade over the backing SQLite file.
//!
//! All mutations are serialized through a single logical writer (one mutation
//! in flight at a time, guarded by an async mutex); reads hit the pool
//! directly and see a consistent WAL snapshot, never blocking on an
//! in-progress download.

use bytes::Bytes;
use chrono::Utc;
use sqlx::sqlite::SqliteRow;
use sqlx::{Pool, Row, Sqlite};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument};

use tilevault_bridge::ResourceValidators;

use crate::db::{create_pool, DatabaseConfig};
use crate::error::{Result, StoreError};
use crate::models::{
    DownloadState, OfflineRegion, RegionDefinition, RegionDownloadStatus, ResourceKind,
    StoredResource,
};
use crate::schema;

/// Default ceiling for ambient (unpinned) resources: 50 MB.
pub const DEFAULT_AMBIENT_CEILING_BYTES: u64 = 50 * 1024 * 1024;

/// Handle to the single local database file backing regions and the ambient
/// cache.
///
/// Cloning is cheap; all clones share the pool, the writer lock, and the
/// ambient ceiling.
#[derive(Clone)]
pub struct LocalStore {
    pool: Pool<Sqlite>,
    write_lock: Arc<Mutex<()>>,
    ambient_ceiling: Arc<AtomicU64>,
}

impl LocalStore {
    /// Wrap an already-created pool.
    pub fn new(pool: Pool<Sqlite>) -> Self {
        Self {
            pool,
            write_lock: Arc::new(Mutex::new(())),
            ambient_ceiling: Arc::new(AtomicU64::new(DEFAULT_AMBIENT_CEILING_BYTES)),
        }
    }

    /// Open (and create if missing) the store described by `config`.
    pub async fn open(config: DatabaseConfig) -> Result<Self> {
        Ok(Self::new(create_pool(config).await?))
    }

    /// The underlying connection pool. Exposed for maintenance tooling and
    /// tests; ordinary callers go through the typed operations.
    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    pub(crate) fn ambient_ceiling_bytes(&self) -> u64 {
        self.ambient_ceiling.load(Ordering::SeqCst)
    }

    pub(crate) fn store_ambient_ceiling(&self, bytes: u64) {
        self.ambient_ceiling.store(bytes, Ordering::SeqCst);
    }

    pub(crate) async fn write_permit(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.write_lock.lock().await
    }

    fn now() -> i64 {
        Utc::now().timestamp()
    }

    // ------------------------------------------------------------------
    // Resources
    // ------------------------------------------------------------------

    /// Look up a resource by URL, refreshing its last-used marker on hit.
    #[instrument(skip(self))]
    pub async fn get(&self, url: &str) -> Result<Option<StoredResource>> {
        let row = sqlx::query(
            "SELECT url, kind, body, size_bytes, etag, last_modified, expires,
                    pin_count, last_used
             FROM resources WHERE url = ?",
        )
        .bind(url)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let resource = Self::row_to_resource(&row)?;

        let _permit = self.write_permit().await;
        sqlx::query("UPDATE resources SET last_used = ? WHERE url = ?")
            .bind(Self::now())
            .bind(url)
            .execute(&self.pool)
            .await?;

        Ok(Some(resource))
    }

    /// Upsert a resource body and its validators, recomputing the size.
    ///
    /// When the touched row ends up unpinned, the ambient ceiling is enforced
    /// before returning.
    #[instrument(skip(self, body, validators), fields(bytes = body.len()))]
    pub async fn put(
        &self,
        url: &str,
        kind: ResourceKind,
        body: &Bytes,
        validators: &ResourceValidators,
    ) -> Result<()> {
        let _permit = self.write_permit().await;

        sqlx::query(
            "INSERT INTO resources (url, kind, body, size_bytes, etag, last_modified, expires,
                                    pin_count, last_used)
             VALUES (?, ?, ?, ?, ?, ?, ?, 0, ?)
             ON CONFLICT(url) DO UPDATE SET
                kind = excluded.kind,
                body = excluded.body,
                size_bytes = excluded.size_bytes,
                etag = excluded.etag,
                last_modified = excluded.last_modified,
                expires = excluded.expires,
                last_used = excluded.last_used",
        )
        .bind(url)
        .bind(kind.to_i64())
        .bind(body.as_ref())
        .bind(body.len() as i64)
        .bind(&validators.etag)
        .bind(validators.last_modified)
        .bind(validators.expires)
        .bind(Self::now())
        .execute(&self.pool)
        .await?;

        let pin_count: (i64,) =
            sqlx::query_as("SELECT pin_count FROM resources WHERE url = ?")
                .bind(url)
                .fetch_one(&self.pool)
                .await?;

        if pin_count.0 == 0 {
            self.enforce_ambient_ceiling(self.ambient_ceiling_bytes())
                .await?;
        }

        Ok(())
    }

    /// Upsert a resource and pin it to `region_id` in one transaction.
    ///
    /// Region downloads commit through this instead of [`put`](Self::put)
    /// followed by [`pin`](Self::pin): the row is already pinned when the
    /// ambient ceiling runs, so a tight ceiling can never evict it between
    /// the write and the pin.
    #[instrument(skip(self, body, validators), fields(bytes = body.len()))]
    pub async fn put_pinned(
        &self,
        url: &str,
        kind: ResourceKind,
        body: &Bytes,
        validators: &ResourceValidators,
        region_id: i64,
    ) -> Result<()> {
        let _permit = self.write_permit().await;

        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT INTO resources (url, kind, body, size_bytes, etag, last_modified, expires,
                                    pin_count, last_used)
             VALUES (?, ?, ?, ?, ?, ?, ?, 0, ?)
             ON CONFLICT(url) DO UPDATE SET
                kind = excluded.kind,
                body = excluded.body,
                size_bytes = excluded.size_bytes,
                etag = excluded.etag,
                last_modified = excluded.last_modified,
                expires = excluded.expires,
                last_used = excluded.last_used",
        )
        .bind(url)
        .bind(kind.to_i64())
        .bind(body.as_ref())
        .bind(body.len() as i64)
        .bind(&validators.etag)
        .bind(validators.last_modified)
        .bind(validators.expires)
        .bind(Self::now())
        .execute(&mut *tx)
        .await?;

        let (resource_id,): (i64,) = sqlx::query_as("SELECT id FROM resources WHERE url = ?")
            .bind(url)
            .fetch_one(&mut *tx)
            .await?;
        let inserted = sqlx::query(
            "INSERT OR IGNORE INTO region_resources (region_id, resource_id) VALUES (?, ?)",
        )
        .bind(region_id)
        .bind(resource_id)
        .execute(&mut *tx)
        .await?;
        if inserted.rows_affected() > 0 {
            sqlx::query("UPDATE resources SET pin_count = pin_count + 1 WHERE id = ?")
                .bind(resource_id)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;

        self.enforce_ambient_ceiling(self.ambient_ceiling_bytes())
            .await?;
        Ok(())
    }

    /// Refresh only the validators of a stored resource (the 304 path).
    #[instrument(skip(self, validators))]
    pub async fn touch_validators(
        &self,
        url: &str,
        validators: &ResourceValidators,
    ) -> Result<()> {
        let _permit = self.write_permit().await;

        let result = sqlx::query(
            "UPDATE resources
             SET etag = ?, last_modified = ?, expires = ?, last_used = ?
             WHERE url = ?",
        )
        .bind(&validators.etag)
        .bind(validators.last_modified)
        .bind(validators.expires)
        .bind(Self::now())
        .bind(url)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::ResourceNotFound(url.to_owned()));
        }
        Ok(())
    }

    /// Record that `region_id` owns the resource at `url`. Idempotent per
    /// (region, url): pinning twice from the same region is a no-op.
    #[instrument(skip(self))]
    pub async fn pin(&self, url: &str, region_id: i64) -> Result<()> {
        let _permit = self.write_permit().await;

        let resource_id = self.resource_id(url).await?;
        let inserted = sqlx::query(
            "INSERT OR IGNORE INTO region_resources (region_id, resource_id) VALUES (?, ?)",
        )
        .bind(region_id)
        .bind(resource_id)
        .execute(&self.pool)
        .await?;

        if inserted.rows_affected() > 0 {
            sqlx::query("UPDATE resources SET pin_count = pin_count + 1 WHERE id = ?")
                .bind(resource_id)
                .execute(&self.pool)
                .await?;
        }
        Ok(())
    }

    /// Drop `region_id`'s claim on the resource at `url`. The resource row
    /// itself survives (possibly as ambient) until evicted or cleared.
    #[instrument(skip(self))]
    pub async fn unpin(&self, url: &str, region_id: i64) -> Result<()> {
        let _permit = self.write_permit().await;

        let resource_id = self.resource_id(url).await?;
        let deleted = sqlx::query(
            "DELETE FROM region_resources WHERE region_id = ? AND resource_id = ?",
        )
        .bind(region_id)
        .bind(resource_id)
        .execute(&self.pool)
        .await?;

        if deleted.rows_affected() > 0 {
            sqlx::query(
                "UPDATE resources SET pin_count = MAX(pin_count - 1, 0) WHERE id = ?",
            )
            .bind(resource_id)
            .execute(&self.pool)
            .await?;
        }
        Ok(())
    }

    async fn resource_id(&self, url: &str) -> Result<i64> {
        let row: Option<(i64,)> = sqlx::query_as("SELECT id FROM resources WHERE url = ?")
            .bind(url)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|(id,)| id)
            .ok_or_else(|| StoreError::ResourceNotFound(url.to_owned()))
    }

    /// Committed tile resources across all regions, for the download budget.
    pub async fn total_tile_count(&self) -> Result<u64> {
        let count: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM resources WHERE kind = ? AND pin_count > 0",
        )
        .bind(ResourceKind::Tile.to_i64())
        .fetch_one(&self.pool)
        .await?;
        Ok(count.0 as u64)
    }

    // ------------------------------------------------------------------
    // Regions
    // ------------------------------------------------------------------

    /// Persist a new region. The store assigns a fresh id, monotonically
    /// increasing and never reused even after deletion.
    #[instrument(skip(self, definition, metadata))]
    pub async fn create_region(
        &self,
        definition: &RegionDefinition,
        metadata: &[u8],
    ) -> Result<OfflineRegion> {
        let _permit = self.write_permit().await;

        let result = sqlx::query(
            "INSERT INTO regions (definition, metadata) VALUES (?, ?)",
        )
        .bind(definition.to_json()?)
        .bind(metadata)
        .execute(&self.pool)
        .await?;

        let id = result.last_insert_rowid();
        info!(region_id = id, "Created offline region");

        Ok(OfflineRegion {
            id,
            definition: definition.clone(),
            metadata: metadata.to_vec(),
            download_state: DownloadState::Inactive,
            status: RegionDownloadStatus::default(),
        })
    }

    /// Look up one region. `Ok(None)` is the explicit not-found outcome,
    /// distinct from a store failure.
    pub async fn get_region(&self, id: i64) -> Result<Option<OfflineRegion>> {
        let row = sqlx::query(
            "SELECT id, definition, metadata, download_state, required_count,
                    required_exact, completed_count, completed_bytes
             FROM regions WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| Self::row_to_region(&row)).transpose()
    }

    /// All regions in id (creation) order.
    pub async fn list_regions(&self) -> Result<Vec<OfflineRegion>> {
        let rows = sqlx::query(
            "SELECT id, definition, metadata, download_state, required_count,
                    required_exact, completed_count, completed_bytes
             FROM regions ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::row_to_region).collect()
    }

    /// Replace a region's opaque metadata blob.
    #[instrument(skip(self, metadata))]
    pub async fn update_region_metadata(&self, id: i64, metadata: &[u8]) -> Result<()> {
        let _permit = self.write_permit().await;

        let result = sqlx::query("UPDATE regions SET metadata = ? WHERE id = ?")
            .bind(metadata)
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::RegionNotFound(id));
        }
        Ok(())
    }

    /// Persist refreshed progress counters.
    ///
    /// Rejects counter regressions: `completed_count` may never exceed
    /// `required_count`, and an exact requirement never goes back to an
    /// estimate.
    #[instrument(skip(self, status))]
    pub async fn update_region_status(
        &self,
        id: i64,
        status: &RegionDownloadStatus,
    ) -> Result<()> {
        if status.completed_count > status.required_count {
            return Err(StoreError::InvalidStatus(format!(
                "completed {} exceeds required {}",
                status.completed_count, status.required_count
            )));
        }

        let _permit = self.write_permit().await;

        let current: Option<(i64,)> =
            sqlx::query_as("SELECT required_exact FROM regions WHERE id = ?")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
        let Some(current) = current else {
            return Err(StoreError::RegionNotFound(id));
        };
        if current.0 != 0 && !status.required_count_is_exact {
            return Err(StoreError::InvalidStatus(
                "exact requirement cannot regress to an estimate".into(),
            ));
        }

        let result = sqlx::query(
            "UPDATE regions
             SET required_count = ?, required_exact = ?, completed_count = ?,
                 completed_bytes = ?
             WHERE id = ?",
        )
        .bind(status.required_count as i64)
        .bind(status.required_count_is_exact as i64)
        .bind(status.completed_count as i64)
        .bind(status.completed_bytes as i64)
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::RegionNotFound(id));
        }
        Ok(())
    }

    /// Persist a region's download state.
    #[instrument(skip(self))]
    pub async fn set_download_state(&self, id: i64, state: DownloadState) -> Result<()> {
        let _permit = self.write_permit().await;

        let result = sqlx::query("UPDATE regions SET download_state = ? WHERE id = ?")
            .bind(state.to_i64())
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::RegionNotFound(id));
        }
        Ok(())
    }

    /// Delete a region, unpin all of its resources, and immediately evict
    /// any that drop to a pin count of zero. One transaction: either the
    /// region and its exclusive resources are gone together, or nothing is.
    #[instrument(skip(self))]
    pub async fn delete_region(&self, id: i64) -> Result<()> {
        let _permit = self.write_permit().await;

        let mut tx = self.pool.begin().await?;

        let exists: Option<(i64,)> = sqlx::query_as("SELECT id FROM regions WHERE id = ?")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?;
        if exists.is_none() {
            return Err(StoreError::RegionNotFound(id));
        }

        sqlx::query(
            "UPDATE resources SET pin_count = MAX(pin_count - 1, 0)
             WHERE id IN (SELECT resource_id FROM region_resources WHERE region_id = ?)",
        )
        .bind(id)
        .execute(&mut *tx)
        .await?;

        // Evict only what this deletion dropped to zero. Unrelated ambient
        // entries stay, governed by the LRU policy alone. The join rows of
        // evicted resources go with them via the cascade.
        let evicted = sqlx::query(
            "DELETE FROM resources
             WHERE pin_count = 0
               AND id IN (SELECT resource_id FROM region_resources WHERE region_id = ?)",
        )
        .bind(id)
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM region_resources WHERE region_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;

        sqlx::query("DELETE FROM regions WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        debug!(
            region_id = id,
            evicted = evicted.rows_affected(),
            "Deleted offline region"
        );
        Ok(())
    }

    /// Mark every resource pinned by `id` stale so the next access triggers
    /// a conditional re-fetch. Bodies, counts and download state are
    /// untouched.
    #[instrument(skip(self))]
    pub async fn invalidate_region(&self, id: i64) -> Result<()> {
        let _permit = self.write_permit().await;

        if self.get_region(id).await?.is_none() {
            return Err(StoreError::RegionNotFound(id));
        }

        sqlx::query(
            "UPDATE resources SET expires = 0
             WHERE id IN (SELECT resource_id FROM region_resources WHERE region_id = ?)",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Maintenance
    // ------------------------------------------------------------------

    /// Drop and recreate the schema, discarding regions and cache alike.
    #[instrument(skip(self))]
    pub async fn reset(&self) -> Result<()> {
        let _permit = self.write_permit().await;
        info!("Resetting local store");
        schema::reset(&self.pool).await
    }

    /// Reclaim freed space without changing logical contents.
    #[instrument(skip(self))]
    pub async fn pack(&self) -> Result<()> {
        let _permit = self.write_permit().await;
        sqlx::query("VACUUM").execute(&self.pool).await?;
        Ok(())
    }

    /// Close the underlying pool, flushing the WAL. Further operations fail.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    // ------------------------------------------------------------------
    // Row mapping
    // ------------------------------------------------------------------

    fn row_to_region(row: &SqliteRow) -> Result<OfflineRegion> {
        let definition_json: String = row.try_get("definition")?;
        Ok(OfflineRegion {
            id: row.try_get("id")?,
            definition: RegionDefinition::from_json(&definition_json)?,
            metadata: row.try_get("metadata")?,
            download_state: DownloadState::from_i64(row.try_get("download_state")?)?,
            status: RegionDownloadStatus {
                required_count: row.try_get::<i64, _>("required_count")? as u64,
                required_count_is_exact: row.try_get::<i64, _>("required_exact")? != 0,
                completed_count: row.try_get::<i64, _>("completed_count")? as u64,
                completed_bytes: row.try_get::<i64, _>("completed_bytes")? as u64,
            },
        })
    }

    pub(crate) fn row_to_resource(row: &SqliteRow) -> Result<StoredResource> {
        let body: Vec<u8> = row.try_get("body")?;
        Ok(StoredResource {
            url: row.try_get("url")?,
            kind: ResourceKind::from_i64(row.try_get("kind")?),
            body: Bytes::from(body),
            size_bytes: row.try_get::<i64, _>("size_bytes")? as u64,
            validators: ResourceValidators {
                etag: row.try_get("etag")?,
                last_modified: row.try_get("last_modified")?,
                expires: row.try_get("expires")?,
            },
            pin_count: row.try_get::<i64, _>("pin_count")? as u64,
            last_used: row.try_get("last_used")?,
        })
    }
}
