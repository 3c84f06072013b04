//! # Download Orchestrator
//!
//! Drives region downloads: one spawned task per active region, fetch
//! concurrency bounded by a semaphore shared across all regions, store
//! commits and observer callbacks applied one at a time in the driver loop
//! so progress arrives ordered.
//!
//! A download is resumable by construction. Every committed resource is
//! pinned immediately, so re-activating a region only fetches what is still
//! missing or stale; nothing is downloaded twice.

use bytes::Bytes;
use chrono::Utc;
use futures::stream::{self, StreamExt};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use tilevault_bridge::{
    Connectivity, FetchError, FetchOutcome, ResourceFetcher, ResourceValidators, RetryPolicy,
};
use tilevault_store::{
    DownloadState, LocalStore, RegionDefinition, RegionDownloadStatus, ResourceKind,
};

use crate::enumerator::{self, RequiredResource};
use crate::error::{OfflineError, Result};
use crate::observer::{ObserverRegistry, RegionError};

/// Tuning knobs for the download pipeline.
#[derive(Debug, Clone)]
pub struct DownloadConfig {
    /// Fetches in flight at once, across all active regions.
    pub max_concurrent_fetches: usize,
    /// Retry policy for transient fetch failures.
    pub retry: RetryPolicy,
    /// Ceiling on pinned tiles across all regions combined.
    pub tile_count_limit: u64,
    /// Forced-offline switch shared with the host.
    pub connectivity: Connectivity,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            max_concurrent_fetches: 8,
            retry: RetryPolicy::default(),
            tile_count_limit: 6000,
            connectivity: Connectivity::new(),
        }
    }
}

struct ActiveDownload {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Spawns and tracks one download task per active region.
pub struct DownloadOrchestrator {
    store: LocalStore,
    fetcher: Arc<dyn ResourceFetcher>,
    observers: Arc<ObserverRegistry>,
    config: Arc<DownloadConfig>,
    fetch_permits: Arc<Semaphore>,
    active: Arc<Mutex<HashMap<i64, ActiveDownload>>>,
}

impl DownloadOrchestrator {
    pub fn new(
        store: LocalStore,
        fetcher: Arc<dyn ResourceFetcher>,
        observers: Arc<ObserverRegistry>,
        config: DownloadConfig,
    ) -> Self {
        let fetch_permits = Arc::new(Semaphore::new(config.max_concurrent_fetches.max(1)));
        Self {
            store,
            fetcher,
            observers,
            config: Arc::new(config),
            fetch_permits,
            active: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Start downloading `region_id`. A no-op when a download for that
    /// region is already running.
    #[instrument(skip(self))]
    pub async fn activate(&self, region_id: i64) -> Result<()> {
        if self.is_active(region_id) {
            debug!(region_id, "Download already active");
            return Ok(());
        }

        let region = self
            .store
            .get_region(region_id)
            .await?
            .ok_or(OfflineError::RegionNotFound(region_id))?;

        self.store
            .set_download_state(region_id, DownloadState::Active)
            .await?;

        let cancel = CancellationToken::new();
        let task = Arc::new(DownloadTask {
            store: self.store.clone(),
            fetcher: Arc::clone(&self.fetcher),
            observers: Arc::clone(&self.observers),
            config: Arc::clone(&self.config),
            fetch_permits: Arc::clone(&self.fetch_permits),
            active: Arc::clone(&self.active),
            region_id,
            definition: region.definition,
            cancel: cancel.clone(),
        });
        let handle = tokio::spawn(task.run());

        info!(region_id, "Activated region download");
        self.active
            .lock()
            .unwrap()
            .insert(region_id, ActiveDownload { cancel, handle });
        Ok(())
    }

    /// Stop downloading `region_id` and persist the inactive state. The task
    /// stops cooperatively: whatever was already committed stays committed.
    #[instrument(skip(self))]
    pub async fn deactivate(&self, region_id: i64) -> Result<()> {
        let cancel = {
            let active = self.active.lock().unwrap();
            active.get(&region_id).map(|entry| entry.cancel.clone())
        };
        if let Some(cancel) = cancel {
            info!(region_id, "Cancelling region download");
            cancel.cancel();
        }
        self.store
            .set_download_state(region_id, DownloadState::Inactive)
            .await?;
        Ok(())
    }

    /// Whether a download task for `region_id` is currently running.
    pub fn is_active(&self, region_id: i64) -> bool {
        self.active
            .lock()
            .unwrap()
            .get(&region_id)
            .is_some_and(|entry| !entry.handle.is_finished())
    }

    /// Wait for the download task of `region_id` to finish, if one exists.
    pub async fn wait_idle(&self, region_id: i64) {
        let entry = self.active.lock().unwrap().remove(&region_id);
        if let Some(entry) = entry {
            entry.handle.await.ok();
        }
    }
}

/// A resource still to be fetched, with whatever the store already holds
/// about it so the fetch can be conditional.
struct PendingFetch {
    resource: RequiredResource,
    validators: ResourceValidators,
    stored_bytes: u64,
}

struct DownloadTask {
    store: LocalStore,
    fetcher: Arc<dyn ResourceFetcher>,
    observers: Arc<ObserverRegistry>,
    config: Arc<DownloadConfig>,
    fetch_permits: Arc<Semaphore>,
    active: Arc<Mutex<HashMap<i64, ActiveDownload>>>,
    region_id: i64,
    definition: RegionDefinition,
    cancel: CancellationToken,
}

impl DownloadTask {
    #[instrument(skip(self), fields(region_id = self.region_id))]
    async fn run(self: Arc<Self>) {
        if let Err(err) = self.drive().await {
            error!(region_id = self.region_id, %err, "Region download aborted");
            self.observers
                .notify_error(
                    self.region_id,
                    RegionError {
                        url: self.definition.style_url.clone(),
                        message: err.to_string(),
                        is_fatal: true,
                    },
                )
                .await;
        }
        // The region may have been deleted out from under the task.
        if let Err(err) = self
            .store
            .set_download_state(self.region_id, DownloadState::Inactive)
            .await
        {
            debug!(region_id = self.region_id, %err, "Could not persist inactive state");
        }
        self.active.lock().unwrap().remove(&self.region_id);
    }

    async fn drive(self: &Arc<Self>) -> Result<()> {
        let region = self
            .store
            .get_region(self.region_id)
            .await?
            .ok_or(OfflineError::RegionNotFound(self.region_id))?;

        // Re-activation keeps the exact count from the previous run; the
        // geometric estimate is only for a region downloading the first
        // time. Completed counters are recounted from what is stored.
        let mut status = if region.status.required_count_is_exact {
            RegionDownloadStatus {
                completed_count: 0,
                completed_bytes: 0,
                ..region.status
            }
        } else {
            let estimate = enumerator::estimate(&self.definition);
            RegionDownloadStatus {
                required_count: estimate.required_count(),
                required_count_is_exact: false,
                completed_count: 0,
                completed_bytes: 0,
            }
        };
        self.publish(&status).await?;

        let Some(style_body) = self.obtain_style(&mut status).await? else {
            return Ok(());
        };
        if self.cancel.is_cancelled() {
            return Ok(());
        }

        let resolved = match enumerator::resolve(&self.definition, &style_body) {
            Ok(resolved) => resolved,
            Err(err) => {
                warn!(region_id = self.region_id, %err, "Style resolution failed");
                self.observers
                    .notify_error(
                        self.region_id,
                        RegionError {
                            url: self.definition.style_url.clone(),
                            message: err.to_string(),
                            is_fatal: true,
                        },
                    )
                    .await;
                return Ok(());
            }
        };

        let now = Utc::now().timestamp();
        let mut pending = Vec::new();
        let mut missing_tiles = 0u64;
        for resource in &resolved.resources {
            if resource.url == self.definition.style_url {
                continue;
            }
            match self.store.get(&resource.url).await? {
                Some(stored) if stored.validators.is_fresh(now) => {
                    self.store.pin(&resource.url, self.region_id).await?;
                    status.completed_count += 1;
                    status.completed_bytes += stored.size_bytes;
                }
                stored => {
                    if resource.kind == ResourceKind::Tile {
                        missing_tiles += 1;
                    }
                    let (validators, stored_bytes) = stored
                        .map(|s| (s.validators, s.size_bytes))
                        .unwrap_or_default();
                    pending.push(PendingFetch {
                        resource: resource.clone(),
                        validators,
                        stored_bytes,
                    });
                }
            }
        }

        let pinned_tiles = self.store.total_tile_count().await?;
        if pinned_tiles + missing_tiles > self.config.tile_count_limit {
            warn!(
                region_id = self.region_id,
                pinned_tiles,
                missing_tiles,
                limit = self.config.tile_count_limit,
                "Tile count limit exceeded"
            );
            self.observers
                .notify_tile_count_limit_exceeded(self.region_id, self.config.tile_count_limit)
                .await;
            return Ok(());
        }

        status.required_count = resolved.required_count();
        status.required_count_is_exact = true;
        self.publish(&status).await?;

        if pending.is_empty() {
            info!(region_id = self.region_id, "Region already complete");
            return Ok(());
        }

        let mut fetches = stream::iter(pending.into_iter().map(|item| {
            let task = Arc::clone(self);
            async move {
                let outcome = task
                    .fetch_with_retry(&item.resource.url, &item.validators)
                    .await;
                (item, outcome)
            }
        }))
        .buffer_unordered(self.config.max_concurrent_fetches.max(1));

        loop {
            let next = tokio::select! {
                _ = self.cancel.cancelled() => break,
                next = fetches.next() => next,
            };
            let Some((item, outcome)) = next else {
                break;
            };
            if self.cancel.is_cancelled() {
                break;
            }

            match outcome {
                Ok(FetchOutcome::Modified { body, validators }) => {
                    self.commit(&item.resource, &body, &validators).await?;
                    status.completed_count += 1;
                    status.completed_bytes += body.len() as u64;
                    self.publish(&status).await?;
                }
                Ok(FetchOutcome::NotModified { validators }) => {
                    self.store
                        .touch_validators(&item.resource.url, &validators)
                        .await?;
                    self.store.pin(&item.resource.url, self.region_id).await?;
                    status.completed_count += 1;
                    status.completed_bytes += item.stored_bytes;
                    self.publish(&status).await?;
                }
                Err(err) => {
                    warn!(
                        region_id = self.region_id,
                        url = %item.resource.url,
                        %err,
                        "Resource download failed"
                    );
                    self.observers
                        .notify_error(
                            self.region_id,
                            RegionError {
                                url: item.resource.url,
                                message: err.to_string(),
                                is_fatal: !err.is_retryable(),
                            },
                        )
                        .await;
                }
            }
        }

        if status.is_complete() {
            info!(
                region_id = self.region_id,
                resources = status.completed_count,
                bytes = status.completed_bytes,
                "Region download complete"
            );
        }
        Ok(())
    }

    /// Produce the style body, fetching it when missing or stale. Returns
    /// `None` when the style cannot be obtained; the task then stops, since
    /// nothing else can be enumerated without it.
    async fn obtain_style(&self, status: &mut RegionDownloadStatus) -> Result<Option<Bytes>> {
        let url = self.definition.style_url.clone();
        let now = Utc::now().timestamp();
        let stored = self.store.get(&url).await?;

        if let Some(stored) = &stored {
            if stored.validators.is_fresh(now) {
                self.store.pin(&url, self.region_id).await?;
                status.completed_count += 1;
                status.completed_bytes += stored.size_bytes;
                return Ok(Some(stored.body.clone()));
            }
        }

        let validators = stored
            .as_ref()
            .map(|s| s.validators.clone())
            .unwrap_or_default();
        match self.fetch_with_retry(&url, &validators).await {
            Ok(FetchOutcome::Modified { body, validators }) => {
                self.store
                    .put_pinned(&url, ResourceKind::Style, &body, &validators, self.region_id)
                    .await?;
                status.completed_count += 1;
                status.completed_bytes += body.len() as u64;
                Ok(Some(body))
            }
            Ok(FetchOutcome::NotModified { validators }) => {
                self.store.touch_validators(&url, &validators).await?;
                self.store.pin(&url, self.region_id).await?;
                status.completed_count += 1;
                let stored = stored.expect("conditional fetch implies a stored copy");
                status.completed_bytes += stored.size_bytes;
                Ok(Some(stored.body))
            }
            Err(err) => {
                warn!(region_id = self.region_id, %err, "Style download failed");
                self.observers
                    .notify_error(
                        self.region_id,
                        RegionError {
                            url: url.clone(),
                            message: err.to_string(),
                            is_fatal: !err.is_retryable(),
                        },
                    )
                    .await;
                // A stale stored copy still lets enumeration proceed; only a
                // region with no style at all has to stop here.
                match stored {
                    Some(stored) => {
                        self.store.pin(&url, self.region_id).await?;
                        status.completed_count += 1;
                        status.completed_bytes += stored.size_bytes;
                        Ok(Some(stored.body))
                    }
                    None => Ok(None),
                }
            }
        }
    }

    async fn commit(
        &self,
        resource: &RequiredResource,
        body: &Bytes,
        validators: &ResourceValidators,
    ) -> Result<()> {
        // Write and pin atomically, or a tight ambient ceiling could evict
        // the row before the pin lands.
        self.store
            .put_pinned(&resource.url, resource.kind, body, validators, self.region_id)
            .await?;
        Ok(())
    }

    async fn publish(&self, status: &RegionDownloadStatus) -> Result<()> {
        self.store
            .update_region_status(self.region_id, status)
            .await?;
        self.observers.notify_status(self.region_id, *status).await;
        Ok(())
    }

    /// One fetch under the shared concurrency budget, retrying transient
    /// failures with capped exponential backoff. Honours a server-provided
    /// retry-after over the computed delay.
    async fn fetch_with_retry(
        &self,
        url: &str,
        validators: &ResourceValidators,
    ) -> std::result::Result<FetchOutcome, FetchError> {
        let _permit = self
            .fetch_permits
            .acquire()
            .await
            .map_err(|_| FetchError::Transient("fetch pool closed".into()))?;

        if self.config.connectivity.is_offline() {
            return Err(FetchError::Transient("network is offline".into()));
        }

        let mut attempt = 1u32;
        loop {
            let attempt_result = tokio::select! {
                _ = self.cancel.cancelled() => {
                    return Err(FetchError::Transient("download cancelled".into()));
                }
                result = self.fetcher.fetch(url, validators) => result,
            };
            match attempt_result {
                Ok(outcome) => return Ok(outcome),
                Err(err) if err.is_retryable() && attempt < self.config.retry.max_attempts => {
                    let delay = match &err {
                        FetchError::RateLimited {
                            retry_after: Some(delay),
                        } => *delay,
                        _ => self.config.retry.delay_for(attempt),
                    };
                    debug!(url, attempt, ?delay, %err, "Retrying fetch");
                    tokio::select! {
                        _ = self.cancel.cancelled() => {
                            return Err(FetchError::Transient("download cancelled".into()));
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU64, Ordering};
    use tilevault_store::{Bounds, DatabaseConfig, LatLng};

    /// Serves canned bodies by URL, failing URLs listed as broken.
    struct ScriptedFetcher {
        bodies: HashMap<String, Bytes>,
        broken: Vec<String>,
        calls: AtomicU64,
    }

    impl ScriptedFetcher {
        fn new(bodies: Vec<(&str, &[u8])>, broken: Vec<&str>) -> Self {
            Self {
                bodies: bodies
                    .into_iter()
                    .map(|(url, body)| (url.to_owned(), Bytes::copy_from_slice(body)))
                    .collect(),
                broken: broken.into_iter().map(str::to_owned).collect(),
                calls: AtomicU64::new(0),
            }
        }

        fn calls(&self) -> u64 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ResourceFetcher for ScriptedFetcher {
        async fn fetch(
            &self,
            url: &str,
            _validators: &ResourceValidators,
        ) -> tilevault_bridge::Result<FetchOutcome> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.broken.iter().any(|b| b == url) {
                return Err(FetchError::Fatal("not found".into()));
            }
            match self.bodies.get(url) {
                Some(body) => Ok(FetchOutcome::Modified {
                    body: body.clone(),
                    validators: ResourceValidators {
                        etag: Some("\"v1\"".into()),
                        last_modified: None,
                        expires: Some(i64::MAX),
                    },
                }),
                None => Err(FetchError::Fatal(format!("no script for {}", url))),
            }
        }
    }

    const STYLE_URL: &str = "https://styles.example.com/streets/style.json";
    const STYLE_BODY: &[u8] = br#"{
        "sources": {
            "composite": { "tiles": ["https://tiles.example.com/{z}/{x}/{y}.pbf"] }
        },
        "layers": []
    }"#;

    fn four_tile_definition() -> RegionDefinition {
        RegionDefinition {
            style_url: STYLE_URL.into(),
            bounds: Bounds::Box {
                sw: LatLng::new(52.3, 13.4),
                ne: LatLng::new(52.5, 14.0),
            },
            min_zoom: 10,
            max_zoom: 10,
            pixel_ratio: 1.0,
            include_ideographs: false,
        }
    }

    fn tile_urls() -> Vec<String> {
        [(550, 335), (550, 336), (551, 335), (551, 336)]
            .iter()
            .map(|(x, y)| format!("https://tiles.example.com/10/{}/{}.pbf", x, y))
            .collect()
    }

    fn full_script() -> Vec<(String, &'static [u8])> {
        let mut script = vec![(STYLE_URL.to_owned(), STYLE_BODY)];
        script.extend(tile_urls().into_iter().map(|url| (url, &b"tile"[..])));
        script
    }

    async fn orchestrator_with(
        fetcher: Arc<ScriptedFetcher>,
        config: DownloadConfig,
    ) -> (DownloadOrchestrator, LocalStore) {
        let store = LocalStore::open(DatabaseConfig::in_memory()).await.unwrap();
        let orchestrator = DownloadOrchestrator::new(
            store.clone(),
            fetcher,
            Arc::new(ObserverRegistry::new()),
            config,
        );
        (orchestrator, store)
    }

    fn scripted(broken: Vec<&str>) -> Arc<ScriptedFetcher> {
        let script = full_script();
        Arc::new(ScriptedFetcher::new(
            script
                .iter()
                .map(|(url, body)| (url.as_str(), *body))
                .collect(),
            broken,
        ))
    }

    #[tokio::test]
    async fn downloads_region_to_completion() {
        let fetcher = scripted(vec![]);
        let (orchestrator, store) = orchestrator_with(fetcher.clone(), Default::default()).await;
        let region = store
            .create_region(&four_tile_definition(), b"{}")
            .await
            .unwrap();

        orchestrator.activate(region.id).await.unwrap();
        orchestrator.wait_idle(region.id).await;

        let region = store.get_region(region.id).await.unwrap().unwrap();
        assert_eq!(region.download_state, DownloadState::Inactive);
        assert!(region.status.required_count_is_exact);
        assert_eq!(region.status.required_count, 5);
        assert_eq!(region.status.completed_count, 5);
        assert!(region.status.is_complete());
        assert_eq!(fetcher.calls(), 5);

        for url in tile_urls() {
            let tile = store.get(&url).await.unwrap().expect("tile committed");
            assert_eq!(tile.pin_count, 1);
        }
    }

    #[tokio::test]
    async fn reactivation_fetches_only_whats_missing() {
        let fetcher = scripted(vec![]);
        let (orchestrator, store) = orchestrator_with(fetcher.clone(), Default::default()).await;
        let region = store
            .create_region(&four_tile_definition(), b"{}")
            .await
            .unwrap();

        orchestrator.activate(region.id).await.unwrap();
        orchestrator.wait_idle(region.id).await;
        assert_eq!(fetcher.calls(), 5);

        orchestrator.activate(region.id).await.unwrap();
        orchestrator.wait_idle(region.id).await;
        assert_eq!(fetcher.calls(), 5, "everything fresh, no refetches");
    }

    #[tokio::test]
    async fn broken_tiles_do_not_block_the_rest() {
        let broken = "https://tiles.example.com/10/550/335.pbf";
        let fetcher = scripted(vec![broken]);
        let (orchestrator, store) = orchestrator_with(fetcher, Default::default()).await;
        let region = store
            .create_region(&four_tile_definition(), b"{}")
            .await
            .unwrap();

        orchestrator.activate(region.id).await.unwrap();
        orchestrator.wait_idle(region.id).await;

        let region = store.get_region(region.id).await.unwrap().unwrap();
        assert_eq!(region.status.completed_count, 4, "style plus three tiles");
        assert!(!region.status.is_complete());
        assert!(store.get(broken).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn tile_limit_stops_before_fetching_tiles() {
        let fetcher = scripted(vec![]);
        let config = DownloadConfig {
            tile_count_limit: 3,
            ..Default::default()
        };
        let (orchestrator, store) = orchestrator_with(fetcher.clone(), config).await;
        let region = store
            .create_region(&four_tile_definition(), b"{}")
            .await
            .unwrap();

        orchestrator.activate(region.id).await.unwrap();
        orchestrator.wait_idle(region.id).await;

        let region = store.get_region(region.id).await.unwrap().unwrap();
        assert_eq!(region.download_state, DownloadState::Inactive);
        assert_eq!(fetcher.calls(), 1, "only the style was fetched");
        assert_eq!(store.total_tile_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn zero_ambient_ceiling_still_allows_region_download() {
        let fetcher = scripted(vec![]);
        let (orchestrator, store) = orchestrator_with(fetcher.clone(), Default::default()).await;
        store.set_maximum_ambient_size(0).await.unwrap();
        let region = store
            .create_region(&four_tile_definition(), b"{}")
            .await
            .unwrap();

        orchestrator.activate(region.id).await.unwrap();
        orchestrator.wait_idle(region.id).await;

        let region = store.get_region(region.id).await.unwrap().unwrap();
        assert!(region.status.is_complete(), "pinned rows are exempt from the ceiling");
        assert_eq!(region.status.completed_count, 5);
        assert_eq!(store.total_tile_count().await.unwrap(), 4);
    }

    #[tokio::test]
    async fn forced_offline_fails_without_touching_the_network() {
        let fetcher = scripted(vec![]);
        let config = DownloadConfig {
            connectivity: Connectivity::offline(),
            ..Default::default()
        };
        let (orchestrator, store) = orchestrator_with(fetcher.clone(), config).await;
        let region = store
            .create_region(&four_tile_definition(), b"{}")
            .await
            .unwrap();

        orchestrator.activate(region.id).await.unwrap();
        orchestrator.wait_idle(region.id).await;

        assert_eq!(fetcher.calls(), 0);
        let region = store.get_region(region.id).await.unwrap().unwrap();
        assert_eq!(region.status.completed_count, 0);
    }

    #[tokio::test]
    async fn activate_missing_region_is_an_error() {
        let fetcher = scripted(vec![]);
        let (orchestrator, _store) = orchestrator_with(fetcher, Default::default()).await;
        assert!(matches!(
            orchestrator.activate(404).await,
            Err(OfflineError::RegionNotFound(404))
        ));
    }

    /// Blocks inside its first fetch until released, so a test can interleave
    /// store mutations with an in-flight download.
    #[derive(Default)]
    struct GatedFetcher {
        entered: tokio::sync::Notify,
        release: tokio::sync::Notify,
    }

    #[async_trait]
    impl ResourceFetcher for GatedFetcher {
        async fn fetch(
            &self,
            _url: &str,
            _validators: &ResourceValidators,
        ) -> tilevault_bridge::Result<FetchOutcome> {
            self.entered.notify_one();
            self.release.notified().await;
            Ok(FetchOutcome::Modified {
                body: Bytes::from_static(STYLE_BODY),
                validators: ResourceValidators {
                    etag: None,
                    last_modified: None,
                    expires: Some(i64::MAX),
                },
            })
        }
    }

    #[derive(Default)]
    struct ErrorRecorder {
        errors: Mutex<Vec<RegionError>>,
    }

    impl ErrorRecorder {
        fn errors(&self) -> Vec<RegionError> {
            self.errors.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl crate::observer::RegionObserver for ErrorRecorder {
        async fn on_status_changed(&self, _region_id: i64, _status: RegionDownloadStatus) {}

        async fn on_error(&self, _region_id: i64, error: RegionError) {
            self.errors.lock().unwrap().push(error);
        }

        async fn on_tile_count_limit_exceeded(&self, _region_id: i64, _limit: u64) {}
    }

    #[tokio::test]
    async fn store_failures_surface_as_one_fatal_error() {
        let fetcher = Arc::new(GatedFetcher::default());
        let store = LocalStore::open(DatabaseConfig::in_memory()).await.unwrap();
        let observers = Arc::new(ObserverRegistry::new());
        let orchestrator = DownloadOrchestrator::new(
            store.clone(),
            fetcher.clone(),
            Arc::clone(&observers),
            Default::default(),
        );
        let region = store
            .create_region(&four_tile_definition(), b"{}")
            .await
            .unwrap();
        let recorder = Arc::new(ErrorRecorder::default());
        let observer: Arc<dyn crate::observer::RegionObserver> = recorder.clone();
        observers.attach(region.id, &observer);

        orchestrator.activate(region.id).await.unwrap();
        fetcher.entered.notified().await;
        // The region disappears while its style fetch is in flight; the
        // commit then has nothing to pin to.
        store.delete_region(region.id).await.unwrap();
        fetcher.release.notify_one();
        orchestrator.wait_idle(region.id).await;

        let errors = recorder.errors();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].is_fatal, "an aborted activation reports a fatal error");
        assert_eq!(errors[0].url, STYLE_URL);
    }

    mod retries {
        use super::*;
        use mockall::mock;
        use std::time::Duration;

        mock! {
            Fetcher {}

            #[async_trait]
            impl ResourceFetcher for Fetcher {
                async fn fetch(
                    &self,
                    url: &str,
                    validators: &ResourceValidators,
                ) -> tilevault_bridge::Result<FetchOutcome>;
            }
        }

        fn fast_retry() -> RetryPolicy {
            RetryPolicy {
                max_attempts: 3,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(2),
            }
        }

        #[tokio::test]
        async fn transient_failures_retry_until_exhausted() {
            let mut fetcher = MockFetcher::new();
            fetcher
                .expect_fetch()
                .times(3)
                .returning(|_, _| Err(FetchError::Transient("flaky origin".into())));

            let store = LocalStore::open(DatabaseConfig::in_memory()).await.unwrap();
            let orchestrator = DownloadOrchestrator::new(
                store.clone(),
                Arc::new(fetcher),
                Arc::new(ObserverRegistry::new()),
                DownloadConfig {
                    retry: fast_retry(),
                    ..Default::default()
                },
            );
            let region = store
                .create_region(&four_tile_definition(), b"{}")
                .await
                .unwrap();

            orchestrator.activate(region.id).await.unwrap();
            orchestrator.wait_idle(region.id).await;

            let region = store.get_region(region.id).await.unwrap().unwrap();
            assert_eq!(region.status.completed_count, 0);
            assert!(!region.status.required_count_is_exact);
        }

        #[tokio::test]
        async fn fatal_failures_are_not_retried() {
            let mut fetcher = MockFetcher::new();
            fetcher
                .expect_fetch()
                .times(1)
                .returning(|_, _| Err(FetchError::Fatal("gone".into())));

            let store = LocalStore::open(DatabaseConfig::in_memory()).await.unwrap();
            let orchestrator = DownloadOrchestrator::new(
                store.clone(),
                Arc::new(fetcher),
                Arc::new(ObserverRegistry::new()),
                DownloadConfig {
                    retry: fast_retry(),
                    ..Default::default()
                },
            );
            let region = store
                .create_region(&four_tile_definition(), b"{}")
                .await
                .unwrap();

            orchestrator.activate(region.id).await.unwrap();
            orchestrator.wait_idle(region.id).await;

            let region = store.get_region(region.id).await.unwrap().unwrap();
            assert_eq!(region.status.completed_count, 0);
        }
    }

    #[tokio::test]
    async fn deactivate_persists_inactive_state() {
        let fetcher = scripted(vec![]);
        let (orchestrator, store) = orchestrator_with(fetcher, Default::default()).await;
        let region = store
            .create_region(&four_tile_definition(), b"{}")
            .await
            .unwrap();

        orchestrator.activate(region.id).await.unwrap();
        orchestrator.deactivate(region.id).await.unwrap();
        orchestrator.wait_idle(region.id).await;

        let region = store.get_region(region.id).await.unwrap().unwrap();
        assert_eq!(region.download_state, DownloadState::Inactive);
        assert!(!orchestrator.is_active(region.id));
    }
}
