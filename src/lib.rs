//! # Offline Areas
//!
//! Offline map area acquisition and spatial point caching for mobile mapping
//! clients.
//!
//! This library provides:
//! - Web Mercator tile math (bounds ↔ tile indices)
//! - A retry-driven bulk tile downloader that reconciles against disk
//! - A permanent low-zoom "world" base map that resumes across restarts
//! - An in-memory spatial cache of point-of-interest records with
//!   debounced network refresh
//!
//! ## Features
//!
//! - **`parallel`** - Reconcile tile sets against disk with rayon
//! - **`http`** - reqwest-backed tile and Overpass point fetchers
//! - **`full`** - Enable all features
//!
//! ## Quick Start
//!
//! ```rust
//! use offline_areas::{tiles, Bounds};
//!
//! let bounds = Bounds::new(51.50, 51.52, -0.14, -0.12);
//! let keys = tiles::enumerate_tiles(&bounds, 10, 12);
//! assert!(!keys.is_empty());
//! assert_eq!(keys.len() as u64, tiles::count_tiles(&bounds, 10, 12));
//! ```

use serde::{Deserialize, Serialize};

// Unified error handling
pub mod error;
pub use error::{OfflineError, Result};

// Configuration with documented defaults
pub mod config;
pub use config::{OfflineConfig, RetryPolicy};

// Web Mercator tile math and on-disk tile layout
pub mod tiles;
pub use tiles::TileKey;

// Point-of-interest records and profile matching
pub mod points;
pub use points::{NodeProfile, PointRecord};

// Offline area data model
pub mod area;
pub use area::{AreaRequest, AreaStatus, OfflineArea, TileProvenance};

// Tile sources and URL templates
pub mod source;
pub use source::{TileSource, TileSourceCatalog};

// Fetch collaborator contracts
pub mod fetch;
pub use fetch::{CancelToken, PointFetcher, ProgressCallback, TileFetcher};

// Area registry persistence
pub mod registry;
pub use registry::AreaRegistry;

// Area download orchestrator
pub mod downloader;
pub use downloader::AreaDownloader;

// Permanent world base area
pub mod world;
pub use world::WorldAreaManager;

// In-memory point cache with debounced refresh
pub mod spatial_cache;
pub use spatial_cache::SpatialCache;

// HTTP fetchers
#[cfg(feature = "http")]
pub mod http;
#[cfg(feature = "http")]
pub use http::{HttpTileFetcher, OverpassPointFetcher};

/// Initialize logging for Android
#[cfg(target_os = "android")]
pub fn init_logging() {
    use android_logger::Config;
    use log::LevelFilter;

    android_logger::init_once(
        Config::default()
            .with_max_level(LevelFilter::Debug)
            .with_tag("OfflineAreasRust"),
    );
}

#[cfg(not(target_os = "android"))]
pub fn init_logging() {
    // No-op on non-Android platforms
}

// ============================================================================
// Core Types
// ============================================================================

/// A geographic coordinate with latitude and longitude.
///
/// # Example
/// ```
/// use offline_areas::GeoPoint;
/// let point = GeoPoint::new(51.5074, -0.1278); // London
/// assert!(point.is_valid());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub latitude: f64,
    pub longitude: f64,
}

impl GeoPoint {
    /// Create a new point.
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }

    /// Check if the point has valid coordinates.
    pub fn is_valid(&self) -> bool {
        self.latitude.is_finite()
            && self.longitude.is_finite()
            && self.latitude >= -90.0
            && self.latitude <= 90.0
            && self.longitude >= -180.0
            && self.longitude <= 180.0
    }
}

/// Geographic rectangle (south-west / north-east corners).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Bounds {
    pub min_lat: f64,
    pub max_lat: f64,
    pub min_lng: f64,
    pub max_lng: f64,
}

impl Bounds {
    pub fn new(min_lat: f64, max_lat: f64, min_lng: f64, max_lng: f64) -> Self {
        Self {
            min_lat,
            max_lat,
            min_lng,
            max_lng,
        }
    }

    /// Build bounds from two corners given in any order.
    pub fn from_corners(a: GeoPoint, b: GeoPoint) -> Self {
        Self {
            min_lat: a.latitude.min(b.latitude),
            max_lat: a.latitude.max(b.latitude),
            min_lng: a.longitude.min(b.longitude),
            max_lng: a.longitude.max(b.longitude),
        }
    }

    /// Copy with min/max taken independently per axis, so swapped
    /// south/north or west/east corners become a proper rectangle.
    pub fn normalized(&self) -> Self {
        Self {
            min_lat: self.min_lat.min(self.max_lat),
            max_lat: self.min_lat.max(self.max_lat),
            min_lng: self.min_lng.min(self.max_lng),
            max_lng: self.min_lng.max(self.max_lng),
        }
    }

    pub fn south_west(&self) -> GeoPoint {
        GeoPoint::new(self.min_lat, self.min_lng)
    }

    pub fn north_east(&self) -> GeoPoint {
        GeoPoint::new(self.max_lat, self.max_lng)
    }

    /// Get the center point of the bounds.
    pub fn center(&self) -> GeoPoint {
        GeoPoint::new(
            (self.min_lat + self.max_lat) / 2.0,
            (self.min_lng + self.max_lng) / 2.0,
        )
    }

    /// Inclusive containment test.
    pub fn contains(&self, point: &GeoPoint) -> bool {
        point.latitude >= self.min_lat
            && point.latitude <= self.max_lat
            && point.longitude >= self.min_lng
            && point.longitude <= self.max_lng
    }
}

// ============================================================================
// Tests
// ============================================================================
