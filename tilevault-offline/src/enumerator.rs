//! Region Enumerator
//!
//! Turns a [`RegionDefinition`] into the set of resource URLs required to
//! render that region fully offline: the tile pyramid over the bounds and
//! zoom range under spherical-Mercator tiling, plus the style document and
//! the sprite/glyph resources the style references.
//!
//! The exact set needs the style document, which may itself require a
//! network round trip. Until then [`estimate`] returns a geometry-only
//! approximation (`exact = false`) so callers can show progress immediately;
//! [`resolve`] refines it once the style body is available.

use serde_json::Value;
use std::collections::BTreeSet;

use tilevault_store::{Bounds, LatLng, RegionDefinition, ResourceKind};

use crate::error::{OfflineError, Result};

/// Glyphs are fetched in ranges of 256 code points.
const GLYPH_RANGE_SIZE: u32 = 256;
/// Base coverage for label fonts: U+0000 through U+07FF.
const BASE_GLYPH_LIMIT: u32 = 2048;
/// CJK Unified Ideographs, fetched only when the definition asks for them.
const IDEOGRAPH_START: u32 = 19968;
const IDEOGRAPH_LIMIT: u32 = 40960;

/// One resource a region needs, with its classification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequiredResource {
    pub url: String,
    pub kind: ResourceKind,
}

/// The enumerated requirement of a region.
#[derive(Debug, Clone)]
pub struct RequiredResources {
    /// Deduplicated, deterministically ordered resource list. Empty of tile
    /// URLs while `exact` is false.
    pub resources: Vec<RequiredResource>,
    /// Number of tiles in the pyramid (geometry, independent of the style).
    pub tile_count: u64,
    /// Whether `resources` is the complete set or a geometry-only estimate.
    pub exact: bool,
}

impl RequiredResources {
    /// The required resource count to report: the listed resources once
    /// exact, otherwise the pyramid size plus the style document.
    pub fn required_count(&self) -> u64 {
        if self.exact {
            self.resources.len() as u64
        } else {
            self.tile_count + self.resources.len() as u64
        }
    }
}

/// A tile address under spherical-Mercator tiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileId {
    pub z: u8,
    pub x: u32,
    pub y: u32,
}

/// Geometry-only estimate: the tile pyramid size plus the style document.
pub fn estimate(definition: &RegionDefinition) -> RequiredResources {
    RequiredResources {
        resources: vec![RequiredResource {
            url: definition.style_url.clone(),
            kind: ResourceKind::Style,
        }],
        tile_count: tile_count(definition),
        exact: false,
    }
}

/// Exact enumeration from a fetched style document.
pub fn resolve(definition: &RegionDefinition, style_body: &[u8]) -> Result<RequiredResources> {
    let style: Value = serde_json::from_slice(style_body)
        .map_err(|e| OfflineError::StyleResolution(format!("style is not valid JSON: {}", e)))?;

    let mut seen = BTreeSet::new();
    let mut resources = Vec::new();
    let mut push = |url: String, kind: ResourceKind| {
        if seen.insert(url.clone()) {
            resources.push(RequiredResource { url, kind });
        }
    };

    push(definition.style_url.clone(), ResourceKind::Style);

    let tiles = tile_cover_all(definition);
    for template in tile_templates(&style) {
        for tile in &tiles {
            push(
                expand_tile_template(template, *tile, definition.pixel_ratio),
                ResourceKind::Tile,
            );
        }
    }

    if let Some(sprite) = style.get("sprite").and_then(Value::as_str) {
        let suffix = if definition.pixel_ratio > 1.0 { "@2x" } else { "" };
        push(format!("{}{}.json", sprite, suffix), ResourceKind::SpriteJson);
        push(format!("{}{}.png", sprite, suffix), ResourceKind::SpriteImage);
    }

    if let Some(glyph_template) = style.get("glyphs").and_then(Value::as_str) {
        for stack in font_stacks(&style) {
            for (start, end) in glyph_ranges(definition.include_ideographs) {
                let url = glyph_template
                    .replace("{fontstack}", &stack)
                    .replace("{range}", &format!("{}-{}", start, end));
                push(url, ResourceKind::Glyphs);
            }
        }
    }

    Ok(RequiredResources {
        resources,
        tile_count: tiles.len() as u64,
        exact: true,
    })
}

/// Size of the tile pyramid for a definition.
pub fn tile_count(definition: &RegionDefinition) -> u64 {
    tile_cover_all(definition).len() as u64
}

fn tile_cover_all(definition: &RegionDefinition) -> Vec<TileId> {
    let mut tiles = Vec::new();
    for z in definition.min_zoom..=definition.max_zoom {
        tiles.extend(tile_cover(&definition.bounds, z));
    }
    tiles
}

/// Tiles at zoom `z` covering `bounds`, clipped to the polygon when the
/// bounds are non-rectangular.
pub fn tile_cover(bounds: &Bounds, z: u8) -> Vec<TileId> {
    let (sw, ne) = bounds.bounding_box();
    let x_min = lon_to_x(sw.lon, z);
    let x_max = lon_to_x(ne.lon, z);
    // North has the smaller row number.
    let y_min = lat_to_y(ne.lat, z);
    let y_max = lat_to_y(sw.lat, z);

    let mut tiles = Vec::new();
    for x in x_min..=x_max {
        for y in y_min..=y_max {
            let tile = TileId { z, x, y };
            let keep = match bounds {
                Bounds::Box { .. } => true,
                Bounds::Polygon(vertices) => tile_touches_polygon(tile, vertices),
            };
            if keep {
                tiles.push(tile);
            }
        }
    }
    tiles
}

/// A tile belongs to a polygon region when its center or any corner lies
/// inside the polygon, or a polygon vertex lies inside the tile. This
/// overshoots slightly on thin polygon edges, which is the safe direction
/// for offline use.
fn tile_touches_polygon(tile: TileId, vertices: &[LatLng]) -> bool {
    if vertices.len() < 3 {
        return false;
    }
    let west = x_to_lon(tile.x, tile.z);
    let east = x_to_lon(tile.x + 1, tile.z);
    let north = y_to_lat(tile.y, tile.z);
    let south = y_to_lat(tile.y + 1, tile.z);

    let probes = [
        LatLng::new((north + south) / 2.0, (west + east) / 2.0),
        LatLng::new(north, west),
        LatLng::new(north, east),
        LatLng::new(south, west),
        LatLng::new(south, east),
    ];
    if probes.iter().any(|p| point_in_polygon(*p, vertices)) {
        return true;
    }

    vertices.iter().any(|v| {
        v.lat <= north && v.lat >= south && v.lon >= west && v.lon <= east
    })
}

/// Ray-casting point-in-polygon on plain lat/lon coordinates. A polygon
/// with fewer than three vertices encloses nothing; definitions are
/// validated on creation, but merged store files can carry them in.
fn point_in_polygon(point: LatLng, vertices: &[LatLng]) -> bool {
    if vertices.len() < 3 {
        return false;
    }
    let mut inside = false;
    let mut j = vertices.len() - 1;
    for i in 0..vertices.len() {
        let (a, b) = (vertices[i], vertices[j]);
        if (a.lat > point.lat) != (b.lat > point.lat) {
            let crossing_lon = (b.lon - a.lon) * (point.lat - a.lat) / (b.lat - a.lat) + a.lon;
            if point.lon < crossing_lon {
                inside = !inside;
            }
        }
        j = i;
    }
    inside
}

fn zoom_scale(z: u8) -> u32 {
    1u32 << z.min(30)
}

fn lon_to_x(lon: f64, z: u8) -> u32 {
    let scale = zoom_scale(z) as f64;
    let x = (lon + 180.0) / 360.0 * scale;
    (x.floor() as i64).clamp(0, zoom_scale(z) as i64 - 1) as u32
}

fn lat_to_y(lat: f64, z: u8) -> u32 {
    let scale = zoom_scale(z) as f64;
    let lat_rad = lat.to_radians();
    let y = (1.0 - (lat_rad.tan() + 1.0 / lat_rad.cos()).ln() / std::f64::consts::PI) / 2.0 * scale;
    (y.floor() as i64).clamp(0, zoom_scale(z) as i64 - 1) as u32
}

fn x_to_lon(x: u32, z: u8) -> f64 {
    x as f64 / zoom_scale(z) as f64 * 360.0 - 180.0
}

fn y_to_lat(y: u32, z: u8) -> f64 {
    let n = std::f64::consts::PI * (1.0 - 2.0 * y as f64 / zoom_scale(z) as f64);
    n.sinh().atan().to_degrees()
}

fn tile_templates(style: &Value) -> Vec<&str> {
    let mut templates = Vec::new();
    if let Some(sources) = style.get("sources").and_then(Value::as_object) {
        for source in sources.values() {
            if let Some(tiles) = source.get("tiles").and_then(Value::as_array) {
                templates.extend(tiles.iter().filter_map(Value::as_str));
            }
        }
    }
    templates
}

fn expand_tile_template(template: &str, tile: TileId, pixel_ratio: f32) -> String {
    let ratio = if pixel_ratio > 1.0 { "@2x" } else { "" };
    template
        .replace("{z}", &tile.z.to_string())
        .replace("{x}", &tile.x.to_string())
        .replace("{y}", &tile.y.to_string())
        .replace("{ratio}", ratio)
}

/// Comma-joined font stacks referenced by any layer's `text-font` layout
/// property.
fn font_stacks(style: &Value) -> BTreeSet<String> {
    let mut stacks = BTreeSet::new();
    if let Some(layers) = style.get("layers").and_then(Value::as_array) {
        for layer in layers {
            let fonts = layer
                .get("layout")
                .and_then(|layout| layout.get("text-font"))
                .and_then(Value::as_array);
            if let Some(fonts) = fonts {
                let names: Vec<&str> = fonts.iter().filter_map(Value::as_str).collect();
                if !names.is_empty() {
                    stacks.insert(names.join(","));
                }
            }
        }
    }
    stacks
}

fn glyph_ranges(include_ideographs: bool) -> Vec<(u32, u32)> {
    let mut ranges: Vec<(u32, u32)> = (0..BASE_GLYPH_LIMIT)
        .step_by(GLYPH_RANGE_SIZE as usize)
        .map(|start| (start, start + GLYPH_RANGE_SIZE - 1))
        .collect();
    if include_ideographs {
        ranges.extend(
            (IDEOGRAPH_START..IDEOGRAPH_LIMIT)
                .step_by(GLYPH_RANGE_SIZE as usize)
                .map(|start| (start, start + GLYPH_RANGE_SIZE - 1)),
        );
    }
    ranges
}
