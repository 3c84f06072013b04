//! Store statistics.
//!
//! Reporting code used to walk named numeric fields reflectively; here the
//! enumerable accessor list is spelled out once, next to the struct, so
//! min/max/average reporting iterates [`StoreStats::NUMERIC_FIELDS`] instead
//! of guessing field names at runtime.

use sqlx::Row;

use crate::error::Result;
use crate::models::ResourceKind;
use crate::store::LocalStore;

/// Point-in-time snapshot of the local store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub region_count: u64,
    pub resource_count: u64,
    pub tile_count: u64,
    pub ambient_resource_count: u64,
    pub ambient_bytes: u64,
    pub pinned_bytes: u64,
    pub total_bytes: u64,
}

impl StoreStats {
    /// Every numeric field, by name. The canonical list for reporting code.
    pub const NUMERIC_FIELDS: &'static [(&'static str, fn(&StoreStats) -> u64)] = &[
        ("region_count", |stats| stats.region_count),
        ("resource_count", |stats| stats.resource_count),
        ("tile_count", |stats| stats.tile_count),
        ("ambient_resource_count", |stats| stats.ambient_resource_count),
        ("ambient_bytes", |stats| stats.ambient_bytes),
        ("pinned_bytes", |stats| stats.pinned_bytes),
        ("total_bytes", |stats| stats.total_bytes),
    ];

    /// Look up one numeric field by name.
    pub fn numeric_field(&self, name: &str) -> Option<u64> {
        Self::NUMERIC_FIELDS
            .iter()
            .find(|(field, _)| *field == name)
            .map(|(_, accessor)| accessor(self))
    }
}

impl LocalStore {
    /// Compute a consistent statistics snapshot.
    pub async fn stats(&self) -> Result<StoreStats> {
        let row = sqlx::query(
            "SELECT
                (SELECT COUNT(*) FROM regions) AS region_count,
                (SELECT COUNT(*) FROM resources) AS resource_count,
                (SELECT COUNT(*) FROM resources WHERE kind = ?) AS tile_count,
                (SELECT COUNT(*) FROM resources WHERE pin_count = 0) AS ambient_resource_count,
                (SELECT COALESCE(SUM(size_bytes), 0) FROM resources WHERE pin_count = 0)
                    AS ambient_bytes,
                (SELECT COALESCE(SUM(size_bytes), 0) FROM resources WHERE pin_count > 0)
                    AS pinned_bytes,
                (SELECT COALESCE(SUM(size_bytes), 0) FROM resources) AS total_bytes",
        )
        .bind(ResourceKind::Tile.to_i64())
        .fetch_one(self.pool())
        .await?;

        Ok(StoreStats {
            region_count: row.try_get::<i64, _>("region_count")? as u64,
            resource_count: row.try_get::<i64, _>("resource_count")? as u64,
            tile_count: row.try_get::<i64, _>("tile_count")? as u64,
            ambient_resource_count: row.try_get::<i64, _>("ambient_resource_count")? as u64,
            ambient_bytes: row.try_get::<i64, _>("ambient_bytes")? as u64,
            pinned_bytes: row.try_get::<i64, _>("pinned_bytes")? as u64,
            total_bytes: row.try_get::<i64, _>("total_bytes")? as u64,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::create_test_pool;
    use crate::models::{Bounds, LatLng, RegionDefinition};
    use bytes::Bytes;
    use tilevault_bridge::ResourceValidators;

    #[test]
    fn accessor_table_covers_every_field() {
        let stats = StoreStats {
            region_count: 1,
            resource_count: 2,
            tile_count: 3,
            ambient_resource_count: 4,
            ambient_bytes: 5,
            pinned_bytes: 6,
            total_bytes: 7,
        };

        for (expected, (name, accessor)) in (1..=7u64).zip(StoreStats::NUMERIC_FIELDS) {
            assert_eq!(accessor(&stats), expected, "field {}", name);
            assert_eq!(stats.numeric_field(name), Some(expected));
        }
        assert_eq!(stats.numeric_field("no_such_field"), None);
    }

    #[tokio::test]
    async fn stats_reflect_store_contents() {
        let store = LocalStore::new(create_test_pool().await.unwrap());
        let definition = RegionDefinition {
            style_url: "https://styles.example.com/streets/style.json".into(),
            bounds: Bounds::Box {
                sw: LatLng::new(52.0, 13.0),
                ne: LatLng::new(53.0, 14.0),
            },
            min_zoom: 10,
            max_zoom: 10,
            pixel_ratio: 1.0,
            include_ideographs: false,
        };
        let region = store.create_region(&definition, b"{}").await.unwrap();

        let fresh = ResourceValidators {
            expires: Some(i64::MAX),
            ..Default::default()
        };
        store
            .put("https://t.example.com/10/1/2.pbf", ResourceKind::Tile, &Bytes::from_static(b"tile"), &fresh)
            .await
            .unwrap();
        store.pin("https://t.example.com/10/1/2.pbf", region.id).await.unwrap();
        store
            .put("https://a.example.com/loose", ResourceKind::Unknown, &Bytes::from_static(b"xy"), &fresh)
            .await
            .unwrap();

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.region_count, 1);
        assert_eq!(stats.resource_count, 2);
        assert_eq!(stats.tile_count, 1);
        assert_eq!(stats.ambient_resource_count, 1);
        assert_eq!(stats.ambient_bytes, 2);
        assert_eq!(stats.pinned_bytes, 4);
        assert_eq!(stats.total_bytes, 6);
    }
}
