//! Web Mercator tile math and the on-disk tile layout.
//!
//! Converts between geographic bounds and slippy-map tile indices, enumerates
//! the tile set an offline area needs, and reconciles that set against the
//! files present under `<area>/tiles/<z>/<x>/<y>.<ext>`.

use std::collections::HashSet;
use std::f64::consts::PI;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::{Bounds, GeoPoint};

/// Bounds narrower than this (degrees) are widened so a single point still
/// maps to at least one tile.
const DEGENERATE_EPSILON: f64 = 1e-7;

/// A tile address `(z, x, y)` with `x, y < 2^z`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TileKey {
    pub z: u8,
    pub x: u32,
    pub y: u32,
}

impl TileKey {
    pub fn new(z: u8, x: u32, y: u32) -> Self {
        Self { z, x, y }
    }

    /// Geographic rectangle covered by this tile.
    pub fn bounds(&self) -> Bounds {
        tile_to_bounds(self.x, self.y, self.z)
    }
}

impl std::fmt::Display for TileKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.z, self.x, self.y)
    }
}

// ============================================================================
// Web Mercator Math
// ============================================================================

#[inline]
fn tiles_per_axis(zoom: u8) -> f64 {
    2.0_f64.powi(zoom as i32)
}

/// Convert longitude to fractional tile X coordinate at given zoom
#[inline]
pub fn lon_to_tile_x(lon: f64, zoom: u8) -> f64 {
    (lon + 180.0) / 360.0 * tiles_per_axis(zoom)
}

/// Convert latitude to fractional tile Y coordinate at given zoom.
///
/// Produces values outside the tile range for `|lat| >= 90`.
#[inline]
pub fn lat_to_tile_y(lat: f64, zoom: u8) -> f64 {
    let lat_rad = lat.to_radians();
    (1.0 - (lat_rad.tan() + 1.0 / lat_rad.cos()).ln() / PI) / 2.0 * tiles_per_axis(zoom)
}

/// Convert tile X coordinate to longitude
#[inline]
pub fn tile_x_to_lon(x: f64, zoom: u8) -> f64 {
    x / tiles_per_axis(zoom) * 360.0 - 180.0
}

/// Convert tile Y coordinate to latitude
#[inline]
pub fn tile_y_to_lat(y: f64, zoom: u8) -> f64 {
    let lat_rad = (PI * (1.0 - 2.0 * y / tiles_per_axis(zoom))).sinh().atan();
    lat_rad.to_degrees()
}

/// Forward projection to fractional tile coordinates `(xf, yf)`.
pub fn degrees_to_tile_fraction(lat: f64, lon: f64, zoom: u8) -> (f64, f64) {
    (lon_to_tile_x(lon, zoom), lat_to_tile_y(lat, zoom))
}

/// Integer tile index containing `(lat, lon)`.
///
/// Callers must keep `lat` strictly inside ±90°; the result is otherwise
/// meaningless (negative fractions saturate to 0 on the cast).
pub fn tile_index_for(lat: f64, lon: f64, zoom: u8) -> (u32, u32) {
    let (xf, yf) = degrees_to_tile_fraction(lat, lon, zoom);
    (xf.floor() as u32, yf.floor() as u32)
}

/// Get the WGS84 bounds of a tile
pub fn tile_to_bounds(x: u32, y: u32, z: u8) -> Bounds {
    Bounds {
        min_lng: tile_x_to_lon(x as f64, z),
        max_lng: tile_x_to_lon(x as f64 + 1.0, z),
        max_lat: tile_y_to_lat(y as f64, z), // Y is inverted in web mercator
        min_lat: tile_y_to_lat(y as f64 + 1.0, z),
    }
}

/// Bing Maps quadkey for a tile.
pub fn quadkey(key: &TileKey) -> String {
    let mut out = String::with_capacity(key.z as usize);
    for i in (1..=key.z).rev() {
        // Digits above bit 31 are always 0
        let shift = u32::from(i - 1);
        let mut digit = b'0';
        if key.x.checked_shr(shift).unwrap_or(0) & 1 != 0 {
            digit += 1;
        }
        if key.y.checked_shr(shift).unwrap_or(0) & 1 != 0 {
            digit += 2;
        }
        out.push(digit as char);
    }
    out
}

// ============================================================================
// Tile Enumeration
// ============================================================================

/// Inclusive index rectangle `(min_x, max_x, min_y, max_y)` covering `bounds`
/// at `zoom`, clamped to the valid range.
fn tile_range(bounds: &Bounds, zoom: u8) -> (u32, u32, u32, u32) {
    let mut b = bounds.normalized();
    if b.max_lat - b.min_lat < DEGENERATE_EPSILON {
        b.min_lat -= DEGENERATE_EPSILON;
        b.max_lat += DEGENERATE_EPSILON;
    }
    if b.max_lng - b.min_lng < DEGENERATE_EPSILON {
        b.min_lng -= DEGENERATE_EPSILON;
        b.max_lng += DEGENERATE_EPSILON;
    }

    let max_index = tiles_per_axis(zoom) - 1.0;
    let clamp = |v: f64| v.floor().clamp(0.0, max_index) as u32;

    // North edge has the smaller Y
    let (x0, y0) = degrees_to_tile_fraction(b.max_lat, b.min_lng, zoom);
    let (x1, y1) = degrees_to_tile_fraction(b.min_lat, b.max_lng, zoom);

    let (min_x, max_x) = (clamp(x0.min(x1)), clamp(x0.max(x1)));
    let (min_y, max_y) = (clamp(y0.min(y1)), clamp(y0.max(y1)));
    (min_x, max_x, min_y, max_y)
}

/// All tiles covering `bounds` for every zoom in `[z_min, z_max]`.
pub fn enumerate_tiles(bounds: &Bounds, z_min: u8, z_max: u8) -> HashSet<TileKey> {
    let mut tiles = HashSet::new();
    for z in z_min..=z_max {
        let (min_x, max_x, min_y, max_y) = tile_range(bounds, z);
        for x in min_x..=max_x {
            for y in min_y..=max_y {
                tiles.insert(TileKey::new(z, x, y));
            }
        }
    }
    tiles
}

/// Number of tiles `enumerate_tiles` would return, without building the set.
/// Saturates at `u64::MAX` for zoom bands too deep to count.
pub fn count_tiles(bounds: &Bounds, z_min: u8, z_max: u8) -> u64 {
    (z_min..=z_max)
        .map(|z| {
            let (min_x, max_x, min_y, max_y) = tile_range(bounds, z);
            let cols = u64::from(max_x) - u64::from(min_x) + 1;
            let rows = u64::from(max_y) - u64::from(min_y) + 1;
            cols.saturating_mul(rows)
        })
        .fold(0u64, u64::saturating_add)
}

/// Union of all tiles covering `bounds` at `zoom`.
///
/// Offline areas fetch points for this region rather than the raw request,
/// so panning across the cached tiles at low zoom still shows points.
pub fn expanded_bounds(bounds: &Bounds, zoom: u8) -> Bounds {
    let (min_x, max_x, min_y, max_y) = tile_range(bounds, zoom);
    let north_west = tile_to_bounds(min_x, min_y, zoom);
    let south_east = tile_to_bounds(max_x, max_y, zoom);
    Bounds::from_corners(
        GeoPoint::new(north_west.max_lat, north_west.min_lng),
        GeoPoint::new(south_east.min_lat, south_east.max_lng),
    )
}

// ============================================================================
// Disk Layout
// ============================================================================

/// `<area_dir>/tiles/<z>/<x>/<y>.<ext>`
pub fn tile_path(area_dir: &Path, key: &TileKey, ext: &str) -> PathBuf {
    area_dir
        .join("tiles")
        .join(key.z.to_string())
        .join(key.x.to_string())
        .join(format!("{}.{}", key.y, ext))
}

/// Save a tile to disk. Rewriting an existing tile is harmless.
pub fn save_tile(area_dir: &Path, key: &TileKey, ext: &str, bytes: &[u8]) -> std::io::Result<()> {
    let path = tile_path(area_dir, key, ext);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, bytes)
}

/// Tiles from `keys` with no file on disk.
#[cfg(not(feature = "parallel"))]
pub fn missing_tiles<'a, I>(area_dir: &Path, keys: I, ext: &str) -> Vec<TileKey>
where
    I: IntoIterator<Item = &'a TileKey>,
{
    keys.into_iter()
        .filter(|key| !tile_path(area_dir, key, ext).exists())
        .copied()
        .collect()
}

/// Tiles from `keys` with no file on disk (parallel stat calls).
#[cfg(feature = "parallel")]
pub fn missing_tiles<'a, I>(area_dir: &Path, keys: I, ext: &str) -> Vec<TileKey>
where
    I: IntoIterator<Item = &'a TileKey>,
{
    use rayon::prelude::*;

    let keys: Vec<TileKey> = keys.into_iter().copied().collect();
    keys.into_par_iter()
        .filter(|key| !tile_path(area_dir, key, ext).exists())
        .collect()
}

// ============================================================================
// Tests
// ============================================================================
