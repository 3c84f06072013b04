//! Region merge.
//!
//! Imports the regions of another store file into this one. Source region
//! ids never survive the import: every imported region gets a fresh
//! destination id (which is also what resolves id collisions), and the
//! region→resource associations are rewritten against the remapped ids.
//! Resources already present in the destination (same URL) are reused with an
//! incremented pin count; the rest are copied row by row.
//!
//! The whole import runs inside one `BEGIN IMMEDIATE` transaction on a single
//! connection with the source file `ATTACH`ed, so it is all-or-nothing: on
//! any failure the destination is left exactly as it was.

use sqlx::pool::PoolConnection;
use sqlx::{Row, Sqlite};
use std::path::Path;
use tracing::{info, instrument, warn};

use crate::error::{Result, StoreError};
use crate::models::{DownloadState, OfflineRegion, RegionDefinition, RegionDownloadStatus};
use crate::store::LocalStore;

impl LocalStore {
    /// Merge the regions of the store file at `path` into this store.
    ///
    /// Returns the newly created regions, carrying destination-assigned ids,
    /// in source order.
    #[instrument(skip(self, path))]
    pub async fn merge_from(&self, path: impl AsRef<Path>) -> Result<Vec<OfflineRegion>> {
        let path = path.as_ref();
        let path_str = path.to_string_lossy().into_owned();

        let _permit = self.write_permit().await;
        let mut conn = self.pool().acquire().await?;

        // Read-only URI: nothing in the import may write to the source file.
        let source_uri = format!("file:{}?mode=ro", path_str);
        sqlx::query("ATTACH DATABASE ? AS merge_src")
            .bind(&source_uri)
            .execute(&mut *conn)
            .await
            .map_err(|e| StoreError::Merge {
                path: path_str.clone(),
                reason: format!("cannot attach source: {}", e),
            })?;

        sqlx::query("BEGIN IMMEDIATE").execute(&mut *conn).await?;

        let outcome = Self::import_attached(&mut conn).await;

        let result = match outcome {
            Ok(imported) => match sqlx::query("COMMIT").execute(&mut *conn).await {
                Ok(_) => {
                    info!(count = imported.len(), source = %path_str, "Merged offline regions");
                    Ok(imported)
                }
                Err(e) => Err(StoreError::Database(e)),
            },
            Err(e) => {
                warn!(source = %path_str, error = %e, "Merge failed, rolling back");
                sqlx::query("ROLLBACK").execute(&mut *conn).await.ok();
                Err(match e {
                    merge @ StoreError::Merge { .. } => merge,
                    other => StoreError::Merge {
                        path: path_str.clone(),
                        reason: other.to_string(),
                    },
                })
            }
        };

        sqlx::query("DETACH DATABASE merge_src")
            .execute(&mut *conn)
            .await
            .ok();

        result
    }

    /// Copy every region (and its resources) out of the attached source.
    /// Runs inside the caller's transaction.
    async fn import_attached(conn: &mut PoolConnection<Sqlite>) -> Result<Vec<OfflineRegion>> {
        let source_regions = sqlx::query(
            "SELECT id, definition, metadata, required_count, required_exact,
                    completed_count, completed_bytes
             FROM merge_src.regions ORDER BY id",
        )
        .fetch_all(&mut **conn)
        .await?;

        let mut imported = Vec::with_capacity(source_regions.len());

        for region_row in &source_regions {
            let source_id: i64 = region_row.try_get("id")?;
            let definition_json: String = region_row.try_get("definition")?;
            // Validates the source row; a corrupt definition aborts the
            // whole merge.
            let definition = RegionDefinition::from_json(&definition_json)?;
            let metadata: Vec<u8> = region_row.try_get("metadata")?;
            let status = RegionDownloadStatus {
                required_count: region_row.try_get::<i64, _>("required_count")? as u64,
                required_count_is_exact: region_row.try_get::<i64, _>("required_exact")? != 0,
                completed_count: region_row.try_get::<i64, _>("completed_count")? as u64,
                completed_bytes: region_row.try_get::<i64, _>("completed_bytes")? as u64,
            };

            let inserted = sqlx::query(
                "INSERT INTO regions (definition, metadata, download_state, required_count,
                                      required_exact, completed_count, completed_bytes)
                 VALUES (?, ?, 0, ?, ?, ?, ?)",
            )
            .bind(&definition_json)
            .bind(&metadata)
            .bind(status.required_count as i64)
            .bind(status.required_count_is_exact as i64)
            .bind(status.completed_count as i64)
            .bind(status.completed_bytes as i64)
            .execute(&mut **conn)
            .await?;
            let new_id = inserted.last_insert_rowid();

            Self::import_region_resources(conn, source_id, new_id).await?;

            imported.push(OfflineRegion {
                id: new_id,
                definition,
                metadata,
                download_state: DownloadState::Inactive,
                status,
            });
        }

        Ok(imported)
    }

    async fn import_region_resources(
        conn: &mut PoolConnection<Sqlite>,
        source_region_id: i64,
        dest_region_id: i64,
    ) -> Result<()> {
        let resources = sqlx::query(
            "SELECT r.url, r.kind, r.body, r.size_bytes, r.etag, r.last_modified,
                    r.expires, r.last_used
             FROM merge_src.region_resources j
             JOIN merge_src.resources r ON r.id = j.resource_id
             WHERE j.region_id = ?
             ORDER BY r.id",
        )
        .bind(source_region_id)
        .fetch_all(&mut **conn)
        .await?;

        for row in &resources {
            let url: String = row.try_get("url")?;

            let existing: Option<(i64,)> =
                sqlx::query_as("SELECT id FROM resources WHERE url = ?")
                    .bind(&url)
                    .fetch_optional(&mut **conn)
                    .await?;

            let resource_id = match existing {
                Some((id,)) => id,
                None => {
                    let body: Vec<u8> = row.try_get("body")?;
                    let inserted = sqlx::query(
                        "INSERT INTO resources (url, kind, body, size_bytes, etag,
                                                last_modified, expires, pin_count, last_used)
                         VALUES (?, ?, ?, ?, ?, ?, ?, 0, ?)",
                    )
                    .bind(&url)
                    .bind(row.try_get::<i64, _>("kind")?)
                    .bind(&body)
                    .bind(row.try_get::<i64, _>("size_bytes")?)
                    .bind(row.try_get::<Option<String>, _>("etag")?)
                    .bind(row.try_get::<Option<i64>, _>("last_modified")?)
                    .bind(row.try_get::<Option<i64>, _>("expires")?)
                    .bind(row.try_get::<i64, _>("last_used")?)
                    .execute(&mut **conn)
                    .await?;
                    inserted.last_insert_rowid()
                }
            };

            let pinned = sqlx::query(
                "INSERT OR IGNORE INTO region_resources (region_id, resource_id) VALUES (?, ?)",
            )
            .bind(dest_region_id)
            .bind(resource_id)
            .execute(&mut **conn)
            .await?;

            if pinned.rows_affected() > 0 {
                sqlx::query("UPDATE resources SET pin_count = pin_count + 1 WHERE id = ?")
                    .bind(resource_id)
                    .execute(&mut **conn)
                    .await?;
            }
        }

        Ok(())
    }
}
