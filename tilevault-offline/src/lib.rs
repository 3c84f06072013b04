//! # TileVault Offline Region Management
//!
//! The region lifecycle layer on top of the local store: enumerating the
//! resources a region needs, driving their download with progress and error
//! reporting, and the public [`OfflineRegionManager`] facade host
//! applications talk to.
//!
//! ## Workflow
//!
//! 1. Create a region from a [`RegionDefinition`](tilevault_store::RegionDefinition)
//!    and an opaque metadata blob.
//! 2. Attach a [`RegionObserver`] and flip the region to
//!    `DownloadState::Active`.
//! 3. The orchestrator enumerates the tile pyramid (estimate first, exact
//!    once the style document resolves), fetches every missing resource
//!    through the injected [`ResourceFetcher`](tilevault_bridge::ResourceFetcher),
//!    and reports progress after each commit.
//! 4. Pausing flips the region back to `Inactive`; downloaded resources stay
//!    pinned, so re-activating resumes where it stopped.

pub mod enumerator;
pub mod error;
pub mod manager;
pub mod observer;
pub mod orchestrator;

pub use enumerator::{RequiredResource, RequiredResources};
pub use error::{OfflineError, Result};
pub use manager::OfflineRegionManager;
pub use observer::{ObserverRegistry, RegionError, RegionObserver};
pub use orchestrator::{DownloadConfig, DownloadOrchestrator};
