//! Observer registry for region download progress.
//!
//! Hosts attach one observer per region and receive status, error, and
//! tile-limit callbacks as the download advances. Delivery guarantees:
//!
//! - Callbacks for a region arrive in the order the orchestrator produced
//!   them, never concurrently with each other.
//! - The registry holds observers weakly. A dropped or detached observer
//!   turns every later notification for that region into a no-op.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use tilevault_store::RegionDownloadStatus;

/// A problem encountered while downloading a region.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegionError {
    /// URL of the resource that failed, or the region's style URL when the
    /// whole download aborted rather than one resource.
    pub url: String,
    /// Human-readable reason.
    pub message: String,
    /// Whether the failure is permanent (retrying will not help).
    pub is_fatal: bool,
}

/// Callbacks a host implements to follow a region download.
///
/// Implementations must not block for long; the download loop waits for
/// each callback to return before committing the next resource.
#[async_trait]
pub trait RegionObserver: Send + Sync {
    /// Progress changed. `status.required_count_is_exact` is false until the
    /// style document has been resolved into the full resource list.
    async fn on_status_changed(&self, region_id: i64, status: RegionDownloadStatus);

    /// Something went wrong. Per-resource failures do not stop the download;
    /// an activation that aborts as a whole reports one final fatal error.
    async fn on_error(&self, region_id: i64, error: RegionError);

    /// The region needs more tiles than the configured limit allows. Sent at
    /// most once per activation, after which the download deactivates.
    async fn on_tile_count_limit_exceeded(&self, region_id: i64, limit: u64);
}

struct Slot {
    observer: Weak<dyn RegionObserver>,
    /// Serializes delivery for one region.
    delivery: Arc<tokio::sync::Mutex<()>>,
}

/// Per-region observer table shared between the manager and the download
/// tasks.
#[derive(Default)]
pub struct ObserverRegistry {
    slots: Mutex<HashMap<i64, Slot>>,
}

impl ObserverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `observer` for `region_id`, replacing any previous one.
    pub fn attach(&self, region_id: i64, observer: &Arc<dyn RegionObserver>) {
        let mut slots = self.slots.lock().unwrap();
        slots.insert(
            region_id,
            Slot {
                observer: Arc::downgrade(observer),
                delivery: Arc::new(tokio::sync::Mutex::new(())),
            },
        );
    }

    /// Removes the observer for `region_id`. In-flight downloads keep
    /// running; their notifications just stop arriving.
    pub fn detach(&self, region_id: i64) {
        self.slots.lock().unwrap().remove(&region_id);
    }

    /// Drops the registration when a region is deleted.
    pub fn forget(&self, region_id: i64) {
        self.detach(region_id);
    }

    pub async fn notify_status(&self, region_id: i64, status: RegionDownloadStatus) {
        if let Some((observer, delivery)) = self.claim(region_id) {
            let _ordered = delivery.lock().await;
            observer.on_status_changed(region_id, status).await;
        }
    }

    pub async fn notify_error(&self, region_id: i64, error: RegionError) {
        if let Some((observer, delivery)) = self.claim(region_id) {
            let _ordered = delivery.lock().await;
            observer.on_error(region_id, error).await;
        }
    }

    pub async fn notify_tile_count_limit_exceeded(&self, region_id: i64, limit: u64) {
        if let Some((observer, delivery)) = self.claim(region_id) {
            let _ordered = delivery.lock().await;
            observer.on_tile_count_limit_exceeded(region_id, limit).await;
        }
    }

    /// Upgrades the weak registration. Prunes the slot when the observer is
    /// gone so the table does not accumulate dead entries.
    fn claim(&self, region_id: i64) -> Option<(Arc<dyn RegionObserver>, Arc<tokio::sync::Mutex<()>>)> {
        let mut slots = self.slots.lock().unwrap();
        let slot = slots.get(&region_id)?;
        match slot.observer.upgrade() {
            Some(observer) => Some((observer, Arc::clone(&slot.delivery))),
            None => {
                slots.remove(&region_id);
                None
            }
        }
    }
}
