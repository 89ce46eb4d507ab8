//! Configuration for offline area downloads and the point cache.
//!
//! All values have defaults tuned for a phone on a mobile connection. The
//! host app may override any subset by passing a JSON document; missing keys
//! fall back to the defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::source::TileSource;
use crate::{Bounds, Result};

/// Retry behavior for a single HTTP tile request.
///
/// This is separate from the orchestrator's retry passes: a pass calls the
/// fetcher once per tile, and the fetcher itself may retry transient
/// failures with exponential backoff before giving up for that pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Attempts per request, including the first. Default: 3
    pub max_attempts: u32,
    /// Delay before the first retry. Default: 500 ms
    pub initial_delay_ms: u64,
    /// Factor applied to the delay after each retry. Default: 2.0
    pub backoff_multiplier: f64,
    /// Upper bound on a single delay. Default: 10 s
    pub max_delay_ms: u64,
    /// Random extra delay in [0, jitter_ms]. Default: 250 ms
    pub jitter_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 500,
            backoff_multiplier: 2.0,
            max_delay_ms: 10_000,
            jitter_ms: 250,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `retry` (1-based), without jitter.
    pub fn delay_for(&self, retry: u32) -> Duration {
        let exp = retry.saturating_sub(1) as i32;
        let ms = self.initial_delay_ms as f64 * self.backoff_multiplier.powi(exp);
        Duration::from_millis((ms as u64).min(self.max_delay_ms))
    }
}

/// Configuration for the offline area subsystem.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OfflineConfig {
    /// Root directory; areas live under `<base_dir>/offline_areas/<id>` and
    /// the registry document at `<base_dir>/offline_areas.json`.
    pub base_dir: PathBuf,

    /// Full sweeps over missing tiles before an area is marked failed.
    /// Default: 3
    pub retry_passes: u32,

    /// Tiles fetched concurrently within a pass. 1 = sequential. Default: 4
    pub fetch_concurrency: usize,

    /// File extension for stored tiles. Default: "png"
    pub tile_extension: String,

    /// Lowest zoom of the permanent world area. Default: 1
    pub world_min_zoom: u8,

    /// Highest zoom of the permanent world area. Default: 5
    pub world_max_zoom: u8,

    /// Whole-world rectangle, shrunk from the poles and the antimeridian so
    /// tile indices never overflow. Default: ±85° lat, ±179.9° lng
    pub world_bounds: Bounds,

    /// Largest `max_zoom - min_zoom` a user area may request. Default: 7
    pub max_zoom_span: u8,

    /// Highest zoom a user area may request. Default: 19
    pub absolute_max_zoom: u8,

    /// Hard cap on tiles in one user area. Default: 50 000
    pub absolute_max_tile_count: u64,

    /// Average tile size used for download size estimates. Default: 25 KB
    pub fallback_tile_size_kb: u64,

    /// Quiet period before a cache refresh hits the network. Default: 400 ms
    pub debounce_ms: u64,

    /// Per-request HTTP retry policy.
    pub tile_fetch: RetryPolicy,

    /// Known tile sources. The first one is the default basemap used for
    /// legacy areas and the world area.
    pub tile_sources: Vec<TileSource>,

    /// Overpass API endpoint for point fetches.
    pub overpass_url: String,

    /// User-Agent sent with every HTTP request.
    pub user_agent: String,
}

impl Default for OfflineConfig {
    fn default() -> Self {
        Self {
            base_dir: PathBuf::from("."),
            retry_passes: 3,
            fetch_concurrency: 4,
            tile_extension: "png".to_string(),
            world_min_zoom: 1,
            world_max_zoom: 5,
            world_bounds: Bounds::new(-85.0, 85.0, -179.9, 179.9),
            max_zoom_span: 7,
            absolute_max_zoom: 19,
            absolute_max_tile_count: 50_000,
            fallback_tile_size_kb: 25,
            debounce_ms: 400,
            tile_fetch: RetryPolicy::default(),
            tile_sources: vec![TileSource::openstreetmap()],
            overpass_url: "https://overpass-api.de/api/interpreter".to_string(),
            user_agent: concat!("offline-areas/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

impl OfflineConfig {
    /// Default configuration rooted at `base_dir`.
    pub fn with_base_dir(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            ..Self::default()
        }
    }

    /// Parse a (possibly partial) JSON configuration document.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Load a JSON configuration file.
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_json(&content)
    }

    pub fn registry_path(&self) -> PathBuf {
        self.base_dir.join("offline_areas.json")
    }

    pub fn areas_dir(&self) -> PathBuf {
        self.base_dir.join("offline_areas")
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }
}
