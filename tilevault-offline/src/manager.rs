//! # Offline Region Manager
//!
//! The facade host applications talk to. Wires the store, the observer
//! registry, and the download orchestrator together and validates input at
//! the boundary so the layers below can assume well-formed definitions.

use std::path::Path;
use std::sync::Arc;
use tracing::instrument;

use tilevault_bridge::ResourceFetcher;
use tilevault_store::{DownloadState, LocalStore, OfflineRegion, RegionDefinition};

use crate::error::{OfflineError, Result};
use crate::observer::{ObserverRegistry, RegionObserver};
use crate::orchestrator::{DownloadConfig, DownloadOrchestrator};

pub struct OfflineRegionManager {
    store: LocalStore,
    observers: Arc<ObserverRegistry>,
    orchestrator: DownloadOrchestrator,
}

impl OfflineRegionManager {
    pub fn new(store: LocalStore, fetcher: Arc<dyn ResourceFetcher>, config: DownloadConfig) -> Self {
        let observers = Arc::new(ObserverRegistry::new());
        let orchestrator = DownloadOrchestrator::new(
            store.clone(),
            fetcher,
            Arc::clone(&observers),
            config,
        );
        Self {
            store,
            observers,
            orchestrator,
        }
    }

    /// The backing store, for ambient-cache and maintenance operations that
    /// do not involve the region lifecycle.
    pub fn store(&self) -> &LocalStore {
        &self.store
    }

    // ------------------------------------------------------------------
    // Region lifecycle
    // ------------------------------------------------------------------

    /// Create a region in the inactive state. Nothing downloads until the
    /// host flips it active.
    #[instrument(skip(self, definition, metadata))]
    pub async fn create_region(
        &self,
        definition: &RegionDefinition,
        metadata: &[u8],
    ) -> Result<OfflineRegion> {
        validate_definition(definition)?;
        Ok(self.store.create_region(definition, metadata).await?)
    }

    /// All regions in creation order.
    pub async fn list_regions(&self) -> Result<Vec<OfflineRegion>> {
        Ok(self.store.list_regions().await?)
    }

    /// Look up one region. `Ok(None)` means the id does not exist, distinct
    /// from a store failure.
    pub async fn get_region(&self, region_id: i64) -> Result<Option<OfflineRegion>> {
        Ok(self.store.get_region(region_id).await?)
    }

    /// Delete a region and release its resources. Refused while a download
    /// for the region is running; deactivate first.
    #[instrument(skip(self))]
    pub async fn delete_region(&self, region_id: i64) -> Result<()> {
        if self.orchestrator.is_active(region_id) {
            return Err(OfflineError::DownloadActive(region_id));
        }
        self.store.delete_region(region_id).await?;
        self.observers.forget(region_id);
        Ok(())
    }

    /// Mark every resource of a region stale so the next activation
    /// revalidates it against the origin.
    pub async fn invalidate_region(&self, region_id: i64) -> Result<()> {
        Ok(self.store.invalidate_region(region_id).await?)
    }

    /// Replace a region's opaque metadata blob.
    pub async fn update_metadata(&self, region_id: i64, metadata: &[u8]) -> Result<()> {
        Ok(self.store.update_region_metadata(region_id, metadata).await?)
    }

    /// Import every region from another store file. All-or-nothing; returns
    /// the imported regions with their newly assigned ids, in source order.
    #[instrument(skip(self, path), fields(path = %path.as_ref().display()))]
    pub async fn merge_from(&self, path: impl AsRef<Path>) -> Result<Vec<OfflineRegion>> {
        Ok(self.store.merge_from(path).await?)
    }

    // ------------------------------------------------------------------
    // Downloads
    // ------------------------------------------------------------------

    /// Flip a region's download state. Activating starts (or resumes) the
    /// download; deactivating cancels it cooperatively.
    pub async fn set_download_state(&self, region_id: i64, state: DownloadState) -> Result<()> {
        match state {
            DownloadState::Active => self.orchestrator.activate(region_id).await,
            DownloadState::Inactive => self.orchestrator.deactivate(region_id).await,
        }
    }

    /// Whether a download task for the region is currently running.
    pub fn is_downloading(&self, region_id: i64) -> bool {
        self.orchestrator.is_active(region_id)
    }

    /// Block until the region's download task (if any) has finished.
    pub async fn wait_until_idle(&self, region_id: i64) {
        self.orchestrator.wait_idle(region_id).await;
    }

    /// Register `observer` for progress callbacks, replacing any previous
    /// one. Held weakly; dropping the observer silences delivery.
    pub fn attach_observer(&self, region_id: i64, observer: &Arc<dyn RegionObserver>) {
        self.observers.attach(region_id, observer);
    }

    pub fn detach_observer(&self, region_id: i64) {
        self.observers.detach(region_id);
    }

    // ------------------------------------------------------------------
    // Ambient cache and maintenance
    // ------------------------------------------------------------------

    /// Cap the ambient (unpinned) footprint, evicting least-recently-used
    /// entries as needed. Returns how far pinned content alone already
    /// exceeds the new ceiling; zero when it fits.
    pub async fn set_maximum_ambient_size(&self, bytes: u64) -> Result<u64> {
        Ok(self.store.set_maximum_ambient_size(bytes).await?)
    }

    /// Drop every unpinned resource immediately. Returns how many were
    /// cleared.
    pub async fn clear_ambient_cache(&self) -> Result<u64> {
        Ok(self.store.clear_ambient().await?)
    }

    /// Mark every unpinned resource stale without dropping bodies.
    pub async fn invalidate_ambient_cache(&self) -> Result<()> {
        Ok(self.store.invalidate_ambient().await?)
    }

    /// Reclaim file space freed by deletions and evictions.
    pub async fn pack(&self) -> Result<()> {
        Ok(self.store.pack().await?)
    }

    /// Wipe regions and cache alike, back to an empty store.
    pub async fn reset(&self) -> Result<()> {
        Ok(self.store.reset().await?)
    }
}

/// Boundary validation for region definitions.
fn validate_definition(definition: &RegionDefinition) -> Result<()> {
    if definition.min_zoom > definition.max_zoom {
        return Err(OfflineError::InvalidDefinition(format!(
            "min zoom {} exceeds max zoom {}",
            definition.min_zoom, definition.max_zoom
        )));
    }
    if definition.bounds.is_degenerate() {
        return Err(OfflineError::InvalidDefinition(
            "bounds enclose no area".into(),
        ));
    }
    if !definition.style_url.starts_with("http://") && !definition.style_url.starts_with("https://")
    {
        return Err(OfflineError::InvalidDefinition(format!(
            "style URL must be http(s), got {}",
            definition.style_url
        )));
    }
    if definition.pixel_ratio <= 0.0 {
        return Err(OfflineError::InvalidDefinition(format!(
            "pixel ratio must be positive, got {}",
            definition.pixel_ratio
        )));
    }
    Ok(())
}
