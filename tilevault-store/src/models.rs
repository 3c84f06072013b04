//! Data model for the local store.
//!
//! [`RegionDefinition`] is immutable once a region is created; it only drives
//! enumeration. [`OfflineRegion`] is the persisted region row, including the
//! progress counters the download orchestrator maintains.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::json;

use tilevault_bridge::ResourceValidators;

use crate::error::{Result, StoreError};

/// Geographic coordinate in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LatLng {
    pub lat: f64,
    pub lon: f64,
}

impl LatLng {
    pub fn new(lat: f64, lon: f64) -> Self {
        Self { lat, lon }
    }
}

/// Geographic extent of a region.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "coordinates")]
pub enum Bounds {
    /// Axis-aligned box given by its south-west and north-east corners.
    Box { sw: LatLng, ne: LatLng },
    /// Closed polygon; the last vertex is implicitly joined to the first.
    Polygon(Vec<LatLng>),
}

impl Bounds {
    /// A bounds that cannot cover any area is rejected before any I/O.
    pub fn is_degenerate(&self) -> bool {
        match self {
            Self::Box { sw, ne } => ne.lat <= sw.lat || ne.lon <= sw.lon,
            Self::Polygon(vertices) => vertices.len() < 3,
        }
    }

    /// Smallest enclosing box, used for tile-range computation.
    pub fn bounding_box(&self) -> (LatLng, LatLng) {
        match self {
            Self::Box { sw, ne } => (*sw, *ne),
            Self::Polygon(vertices) => {
                let mut sw = LatLng::new(90.0, 180.0);
                let mut ne = LatLng::new(-90.0, -180.0);
                for vertex in vertices {
                    sw.lat = sw.lat.min(vertex.lat);
                    sw.lon = sw.lon.min(vertex.lon);
                    ne.lat = ne.lat.max(vertex.lat);
                    ne.lon = ne.lon.max(vertex.lon);
                }
                (sw, ne)
            }
        }
    }
}

/// What it takes to render a region offline. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegionDefinition {
    pub style_url: String,
    pub bounds: Bounds,
    pub min_zoom: u8,
    pub max_zoom: u8,
    /// Device pixel ratio; `> 1.0` selects `@2x` raster variants.
    pub pixel_ratio: f32,
    /// Whether to download ideographic (CJK) glyph ranges as well.
    pub include_ideographs: bool,
}

impl RegionDefinition {
    pub(crate) fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| StoreError::InvalidDefinition(e.to_string()))
    }

    pub(crate) fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| StoreError::InvalidDefinition(e.to_string()))
    }
}

/// Download state of a region. Persisted as an integer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DownloadState {
    #[default]
    Inactive,
    Active,
}

impl DownloadState {
    pub(crate) fn to_i64(self) -> i64 {
        match self {
            Self::Inactive => 0,
            Self::Active => 1,
        }
    }

    pub(crate) fn from_i64(value: i64) -> Result<Self> {
        match value {
            0 => Ok(Self::Inactive),
            1 => Ok(Self::Active),
            other => Err(StoreError::InvalidStatus(format!(
                "unknown download state {}",
                other
            ))),
        }
    }
}

/// Progress counters for a region download.
///
/// `required_count` starts as a geometric estimate
/// (`required_count_is_exact == false`) and is refined once the style
/// document resolves. It only ever decreases when the region is deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RegionDownloadStatus {
    pub required_count: u64,
    pub required_count_is_exact: bool,
    pub completed_count: u64,
    pub completed_bytes: u64,
}

impl RegionDownloadStatus {
    /// A download is complete when every required resource is present and
    /// the requirement is known exactly.
    pub fn is_complete(&self) -> bool {
        self.required_count_is_exact && self.completed_count == self.required_count
    }
}

/// A persisted offline region.
#[derive(Debug, Clone)]
pub struct OfflineRegion {
    /// Store-assigned id; unique, monotonically increasing, never reused.
    pub id: i64,
    pub definition: RegionDefinition,
    /// Opaque caller-owned blob; see [`RegionMetadata`] for the reference
    /// encoding.
    pub metadata: Vec<u8>,
    pub download_state: DownloadState,
    pub status: RegionDownloadStatus,
}

/// Classification of a stored resource, used for the tile-count budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResourceKind {
    #[default]
    Unknown,
    Style,
    Tile,
    Glyphs,
    SpriteImage,
    SpriteJson,
}

impl ResourceKind {
    pub(crate) fn to_i64(self) -> i64 {
        match self {
            Self::Unknown => 0,
            Self::Style => 1,
            Self::Tile => 2,
            Self::Glyphs => 3,
            Self::SpriteImage => 4,
            Self::SpriteJson => 5,
        }
    }

    pub(crate) fn from_i64(value: i64) -> Self {
        match value {
            1 => Self::Style,
            2 => Self::Tile,
            3 => Self::Glyphs,
            4 => Self::SpriteImage,
            5 => Self::SpriteJson,
            _ => Self::Unknown,
        }
    }
}

/// A resource row as read back from the store.
#[derive(Debug, Clone)]
pub struct StoredResource {
    pub url: String,
    pub kind: ResourceKind,
    pub body: Bytes,
    pub size_bytes: u64,
    pub validators: ResourceValidators,
    /// Number of regions whose enumerated set includes this URL. Zero means
    /// ambient, i.e. eligible for eviction.
    pub pin_count: u64,
    pub last_used: i64,
}

impl StoredResource {
    pub fn is_pinned(&self) -> bool {
        self.pin_count > 0
    }
}

/// Reference encoding for the opaque region metadata blob.
///
/// Callers conventionally store a UTF-8 JSON object of the shape
/// `{"FIELD_REGION_NAME": "<name>"}`. Decoding is the exact inverse of
/// encoding, so round-tripping is idempotent.
pub struct RegionMetadata;

impl RegionMetadata {
    pub const FIELD_REGION_NAME: &'static str = "FIELD_REGION_NAME";

    /// Encode a region name into a metadata blob.
    pub fn encode(name: &str) -> Vec<u8> {
        json!({ Self::FIELD_REGION_NAME: name }).to_string().into_bytes()
    }

    /// Decode a region name from a metadata blob.
    pub fn decode(metadata: &[u8]) -> Result<String> {
        let value: serde_json::Value = serde_json::from_slice(metadata)
            .map_err(|e| StoreError::InvalidMetadata(e.to_string()))?;
        value
            .get(Self::FIELD_REGION_NAME)
            .and_then(|name| name.as_str())
            .map(str::to_owned)
            .ok_or_else(|| {
                StoreError::InvalidMetadata(format!("missing {}", Self::FIELD_REGION_NAME))
            })
    }
}
