//! # TileVault Local Store
//!
//! The single SQLite database file backing both offline regions and the
//! ambient cache. Two logical tables live here: a content table keyed by URL
//! (body, validators, size, last-used marker, pin count) and a region table
//! (definition, metadata blob, download state, progress counters), joined by
//! a pin table that records which regions own which resources.
//!
//! Everything above this crate (ambient eviction, region lifecycle, merge,
//! maintenance) goes through [`LocalStore`].

pub mod db;
pub mod error;
pub mod models;
pub mod stats;
pub mod store;

mod ambient;
mod merge;
mod schema;

pub use db::{create_pool, create_test_pool, DatabaseConfig};
pub use error::{Result, StoreError};
pub use models::{
    Bounds, DownloadState, LatLng, OfflineRegion, RegionDefinition, RegionDownloadStatus,
    RegionMetadata, ResourceKind, StoredResource,
};
pub use stats::StoreStats;
pub use store::LocalStore;
