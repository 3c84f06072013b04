//! End-to-end scenarios through the [`OfflineRegionManager`] facade: full
//! downloads with observer callbacks, error reporting, the tile-count
//! budget, pause and resume, merge, and ambient cache maintenance.

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use tokio::sync::Notify;

use tilevault_bridge::{FetchError, FetchOutcome, ResourceFetcher, ResourceValidators};
use tilevault_offline::{
    DownloadConfig, OfflineRegionManager, RegionError, RegionObserver,
};
use tilevault_store::{
    Bounds, DatabaseConfig, DownloadState, LatLng, LocalStore, RegionDefinition,
    RegionDownloadStatus, RegionMetadata, ResourceKind,
};

const STYLE_URL: &str = "https://styles.example.com/streets/style.json";
const STYLE_BODY: &[u8] = br#"{
    "sources": {
        "composite": { "tiles": ["https://tiles.example.com/{z}/{x}/{y}.pbf"] }
    },
    "layers": []
}"#;

/// Box covering exactly four tiles at zoom 10 (x 550..=551, y 335..=336).
fn definition() -> RegionDefinition {
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

fn fresh() -> ResourceValidators {
    ResourceValidators {
        etag: Some("\"v1\"".into()),
        last_modified: None,
        expires: Some(i64::MAX),
    }
}

/// Serves canned bodies by URL. URLs in `broken` fail permanently; tile
/// fetches block while `gate_closed` until `open_gate` is called.
struct ScriptedFetcher {
    bodies: HashMap<String, Bytes>,
    broken: Vec<String>,
    calls: AtomicU64,
    gate_closed: AtomicBool,
    gate: Notify,
}

impl ScriptedFetcher {
    fn new() -> Self {
        let mut bodies = HashMap::new();
        bodies.insert(STYLE_URL.to_owned(), Bytes::from_static(STYLE_BODY));
        for url in tile_urls() {
            bodies.insert(url, Bytes::from_static(b"tile"));
        }
        Self {
            bodies,
            broken: Vec::new(),
            calls: AtomicU64::new(0),
            gate_closed: AtomicBool::new(false),
            gate: Notify::new(),
        }
    }

    fn with_broken(broken: Vec<String>) -> Self {
        Self {
            broken,
            ..Self::new()
        }
    }

    fn gated() -> Self {
        let fetcher = Self::new();
        fetcher.gate_closed.store(true, Ordering::SeqCst);
        fetcher
    }

    fn open_gate(&self) {
        self.gate_closed.store(false, Ordering::SeqCst);
        self.gate.notify_waiters();
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
        while url != STYLE_URL && self.gate_closed.load(Ordering::SeqCst) {
            self.gate.notified().await;
        }
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.broken.iter().any(|b| b == url) {
            return Err(FetchError::Fatal("origin says 404".into()));
        }
        match self.bodies.get(url) {
            Some(body) => Ok(FetchOutcome::Modified {
                body: body.clone(),
                validators: fresh(),
            }),
            None => Err(FetchError::Fatal(format!("no script for {}", url))),
        }
    }
}

#[derive(Debug, Clone)]
enum Event {
    Status(RegionDownloadStatus),
    Error(RegionError),
    Limit(u64),
}

#[derive(Default)]
struct Recorder {
    events: Mutex<Vec<Event>>,
}

impl Recorder {
    fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    fn statuses(&self) -> Vec<RegionDownloadStatus> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Event::Status(status) => Some(status),
                _ => None,
            })
            .collect()
    }

    fn errors(&self) -> Vec<RegionError> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Event::Error(error) => Some(error),
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl RegionObserver for Recorder {
    async fn on_status_changed(&self, _region_id: i64, status: RegionDownloadStatus) {
        self.events.lock().unwrap().push(Event::Status(status));
    }

    async fn on_error(&self, _region_id: i64, error: RegionError) {
        self.events.lock().unwrap().push(Event::Error(error));
    }

    async fn on_tile_count_limit_exceeded(&self, _region_id: i64, limit: u64) {
        self.events.lock().unwrap().push(Event::Limit(limit));
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

async fn manager_with(fetcher: Arc<ScriptedFetcher>, config: DownloadConfig) -> OfflineRegionManager {
    init_tracing();
    let store = LocalStore::open(DatabaseConfig::in_memory()).await.unwrap();
    OfflineRegionManager::new(store, fetcher, config)
}

#[tokio::test]
async fn download_reports_estimate_then_exact_progress() {
    let fetcher = Arc::new(ScriptedFetcher::new());
    let manager = manager_with(fetcher.clone(), DownloadConfig::default()).await;
    let region = manager
        .create_region(&definition(), &RegionMetadata::encode("Berlin"))
        .await
        .unwrap();

    let recorder = Arc::new(Recorder::default());
    let observer: Arc<dyn RegionObserver> = recorder.clone();
    manager.attach_observer(region.id, &observer);

    manager
        .set_download_state(region.id, DownloadState::Active)
        .await
        .unwrap();
    manager.wait_until_idle(region.id).await;

    let statuses = recorder.statuses();
    assert!(!statuses.is_empty());
    assert!(
        !statuses[0].required_count_is_exact,
        "first notification is the geometric estimate"
    );
    assert_eq!(statuses[0].required_count, 5, "four tiles plus the style");

    let last = statuses.last().unwrap();
    assert!(last.required_count_is_exact);
    assert_eq!(last.required_count, 5);
    assert_eq!(last.completed_count, 5);
    assert!(last.is_complete());
    assert!(recorder.errors().is_empty());

    // Progress only ever moves forward.
    for pair in statuses.windows(2) {
        assert!(pair[1].completed_count >= pair[0].completed_count);
    }

    let region = manager.get_region(region.id).await.unwrap().unwrap();
    assert_eq!(region.download_state, DownloadState::Inactive);
    for url in tile_urls() {
        let tile = manager.store().get(&url).await.unwrap().unwrap();
        assert!(tile.is_pinned());
    }
}

#[tokio::test]
async fn failing_tiles_surface_errors_but_style_is_kept() {
    let fetcher = Arc::new(ScriptedFetcher::with_broken(tile_urls()));
    let manager = manager_with(fetcher, DownloadConfig::default()).await;
    let region = manager.create_region(&definition(), b"{}").await.unwrap();

    let recorder = Arc::new(Recorder::default());
    let observer: Arc<dyn RegionObserver> = recorder.clone();
    manager.attach_observer(region.id, &observer);

    manager
        .set_download_state(region.id, DownloadState::Active)
        .await
        .unwrap();
    manager.wait_until_idle(region.id).await;

    let errors = recorder.errors();
    assert_eq!(errors.len(), 4, "one error per failed tile");
    assert!(errors.iter().all(|e| e.is_fatal));

    let last = recorder.statuses().last().copied().unwrap();
    assert!(!last.is_complete());
    assert_eq!(last.completed_count, 1, "only the style landed");

    let style = manager.store().get(STYLE_URL).await.unwrap().unwrap();
    assert!(style.is_pinned());
    assert_eq!(manager.store().total_tile_count().await.unwrap(), 0);
}

#[tokio::test]
async fn dead_network_with_cached_style_reports_every_failing_fetch() {
    // The style is already stored but stale; revalidation fails along with
    // every tile, so all five fetches surface an error while the cached
    // style still carries the enumeration.
    let mut broken = tile_urls();
    broken.push(STYLE_URL.to_owned());
    let fetcher = Arc::new(ScriptedFetcher::with_broken(broken));
    let manager = manager_with(fetcher, DownloadConfig::default()).await;

    manager
        .store()
        .put(
            STYLE_URL,
            ResourceKind::Style,
            &Bytes::from_static(STYLE_BODY),
            &ResourceValidators {
                etag: Some("\"v0\"".into()),
                last_modified: None,
                expires: Some(0),
            },
        )
        .await
        .unwrap();

    let region = manager.create_region(&definition(), b"{}").await.unwrap();
    let recorder = Arc::new(Recorder::default());
    let observer: Arc<dyn RegionObserver> = recorder.clone();
    manager.attach_observer(region.id, &observer);

    manager
        .set_download_state(region.id, DownloadState::Active)
        .await
        .unwrap();
    manager.wait_until_idle(region.id).await;

    assert_eq!(recorder.errors().len(), 5, "style revalidation plus four tiles");

    let region = manager.get_region(region.id).await.unwrap().unwrap();
    assert_eq!(region.download_state, DownloadState::Inactive);
    assert!(!region.status.is_complete());
    assert_eq!(region.status.completed_count, 1, "the cached style");

    let style = manager.store().get(STYLE_URL).await.unwrap().unwrap();
    assert!(style.is_pinned(), "already-fetched resources stay pinned");
}

#[tokio::test]
async fn tile_budget_aborts_before_any_tile_is_fetched() {
    let fetcher = Arc::new(ScriptedFetcher::new());
    let config = DownloadConfig {
        tile_count_limit: 3,
        ..Default::default()
    };
    let manager = manager_with(fetcher.clone(), config).await;
    let region = manager.create_region(&definition(), b"{}").await.unwrap();

    let recorder = Arc::new(Recorder::default());
    let observer: Arc<dyn RegionObserver> = recorder.clone();
    manager.attach_observer(region.id, &observer);

    manager
        .set_download_state(region.id, DownloadState::Active)
        .await
        .unwrap();
    manager.wait_until_idle(region.id).await;

    let limits: Vec<u64> = recorder
        .events()
        .into_iter()
        .filter_map(|e| match e {
            Event::Limit(limit) => Some(limit),
            _ => None,
        })
        .collect();
    assert_eq!(limits, vec![3], "limit callback fires exactly once");

    assert_eq!(fetcher.calls(), 1, "only the style was fetched");
    let region = manager.get_region(region.id).await.unwrap().unwrap();
    assert_eq!(region.download_state, DownloadState::Inactive);
}

#[tokio::test]
async fn pause_keeps_progress_and_resume_completes() {
    let fetcher = Arc::new(ScriptedFetcher::gated());
    let manager = manager_with(fetcher.clone(), DownloadConfig::default()).await;
    let region = manager.create_region(&definition(), b"{}").await.unwrap();

    manager
        .set_download_state(region.id, DownloadState::Active)
        .await
        .unwrap();
    // Tile fetches are parked behind the gate; cancel while they wait.
    manager
        .set_download_state(region.id, DownloadState::Inactive)
        .await
        .unwrap();
    manager.wait_until_idle(region.id).await;

    let paused = manager.get_region(region.id).await.unwrap().unwrap();
    assert_eq!(paused.download_state, DownloadState::Inactive);
    assert!(!paused.status.is_complete());
    let committed_before = paused.status.completed_count;

    fetcher.open_gate();
    manager
        .set_download_state(region.id, DownloadState::Active)
        .await
        .unwrap();
    manager.wait_until_idle(region.id).await;

    let resumed = manager.get_region(region.id).await.unwrap().unwrap();
    assert!(resumed.status.is_complete());
    assert!(resumed.status.completed_count >= committed_before);
    assert_eq!(resumed.status.completed_count, 5);
}

#[tokio::test]
async fn detached_observer_hears_nothing() {
    let fetcher = Arc::new(ScriptedFetcher::new());
    let manager = manager_with(fetcher, DownloadConfig::default()).await;
    let region = manager.create_region(&definition(), b"{}").await.unwrap();

    let recorder = Arc::new(Recorder::default());
    let observer: Arc<dyn RegionObserver> = recorder.clone();
    manager.attach_observer(region.id, &observer);
    manager.detach_observer(region.id);

    manager
        .set_download_state(region.id, DownloadState::Active)
        .await
        .unwrap();
    manager.wait_until_idle(region.id).await;

    assert!(recorder.events().is_empty());
    let region = manager.get_region(region.id).await.unwrap().unwrap();
    assert!(region.status.is_complete(), "download ran regardless");
}

#[tokio::test]
async fn merge_through_the_manager_imports_with_fresh_ids() {
    init_tracing();
    let dir = TempDir::new().unwrap();

    // Build the source file with one downloaded region.
    let source = LocalStore::open(DatabaseConfig::new(dir.path().join("source.db")))
        .await
        .unwrap();
    let source_region = source
        .create_region(&definition(), &RegionMetadata::encode("imported"))
        .await
        .unwrap();
    source
        .put(STYLE_URL, ResourceKind::Style, &Bytes::from_static(STYLE_BODY), &fresh())
        .await
        .unwrap();
    source.pin(STYLE_URL, source_region.id).await.unwrap();
    source.close().await;

    let store = LocalStore::open(DatabaseConfig::new(dir.path().join("dest.db")))
        .await
        .unwrap();
    let manager = OfflineRegionManager::new(
        store,
        Arc::new(ScriptedFetcher::new()),
        DownloadConfig::default(),
    );
    // Destination already uses id 1, forcing a remap.
    let local = manager
        .create_region(&definition(), &RegionMetadata::encode("local"))
        .await
        .unwrap();

    let imported = manager.merge_from(dir.path().join("source.db")).await.unwrap();

    assert_eq!(imported.len(), 1);
    assert_ne!(imported[0].id, local.id);
    assert_eq!(
        RegionMetadata::decode(&imported[0].metadata).unwrap(),
        "imported"
    );
    assert_eq!(manager.list_regions().await.unwrap().len(), 2);

    let style = manager.store().get(STYLE_URL).await.unwrap().unwrap();
    assert!(style.is_pinned());
}

#[tokio::test]
async fn ambient_maintenance_through_the_manager() {
    let fetcher = Arc::new(ScriptedFetcher::new());
    let manager = manager_with(fetcher, DownloadConfig::default()).await;
    let region = manager.create_region(&definition(), b"{}").await.unwrap();

    // Three ambient entries and one pinned.
    for url in ["https://a.example.com/1", "https://a.example.com/2", "https://a.example.com/3"] {
        manager
            .store()
            .put(url, ResourceKind::Unknown, &Bytes::from_static(b"aaaa"), &fresh())
            .await
            .unwrap();
    }
    manager
        .store()
        .put(STYLE_URL, ResourceKind::Style, &Bytes::from_static(b"bbbb"), &fresh())
        .await
        .unwrap();
    manager.store().pin(STYLE_URL, region.id).await.unwrap();

    let overshoot = manager.set_maximum_ambient_size(0).await.unwrap();
    assert_eq!(overshoot, 4, "only the pinned style remains");
    assert_eq!(manager.store().ambient_bytes().await.unwrap(), 0);
    assert!(manager.store().get(STYLE_URL).await.unwrap().is_some());

    manager.invalidate_ambient_cache().await.unwrap();
    assert_eq!(manager.clear_ambient_cache().await.unwrap(), 0);
    manager.pack().await.unwrap();

    manager.reset().await.unwrap();
    assert!(manager.list_regions().await.unwrap().is_empty());
    assert!(manager.store().get(STYLE_URL).await.unwrap().is_none());
}
