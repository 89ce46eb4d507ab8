//! The offline area data model.
//!
//! An `OfflineArea` is a plain value. The orchestrator owns the one mutable
//! instance of an area while it downloads and publishes clones to the
//! registry, so readers only ever see complete snapshots.

use std::collections::HashSet;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::config::OfflineConfig;
use crate::error::OfflineError;
use crate::points::PointRecord;
use crate::tiles::{self, TileKey};
use crate::{Bounds, Result};

/// Id of the permanent world area.
pub const WORLD_AREA_ID: &str = "world";

/// Download state of an area.
///
/// `Downloading` moves to exactly one of the terminal states. Only a new,
/// explicitly started download run moves a terminal area back to
/// `Downloading`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AreaStatus {
    /// Entries without a status are treated as interrupted and reconciled
    /// against disk on the next resume.
    #[default]
    Downloading,
    Complete,
    Error,
    Cancelled,
}

impl AreaStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, AreaStatus::Downloading)
    }
}

/// Which tile source an area was downloaded from. All `None` means a legacy
/// area that predates provenance tracking (treated as OSM).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TileProvenance {
    #[serde(rename = "tileProviderId", skip_serializing_if = "Option::is_none")]
    pub provider_id: Option<String>,
    #[serde(rename = "tileProviderName", skip_serializing_if = "Option::is_none")]
    pub provider_name: Option<String>,
    #[serde(rename = "tileTypeId", skip_serializing_if = "Option::is_none")]
    pub type_id: Option<String>,
    #[serde(rename = "tileTypeName", skip_serializing_if = "Option::is_none")]
    pub type_name: Option<String>,
}

impl TileProvenance {
    pub fn is_legacy(&self) -> bool {
        self.provider_id.is_none() && self.type_id.is_none()
    }
}

/// A downloadable or downloaded map region.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OfflineArea {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub bounds: Bounds,
    pub min_zoom: u8,
    pub max_zoom: u8,
    pub directory: PathBuf,
    #[serde(default)]
    pub status: AreaStatus,
    #[serde(default)]
    pub progress: f64,
    #[serde(default)]
    pub tiles_downloaded: u64,
    #[serde(default)]
    pub tiles_total: u64,
    /// Stored in `<directory>/points.json`, not in the registry document.
    #[serde(skip)]
    pub nodes: Vec<PointRecord>,
    #[serde(default)]
    pub size_bytes: u64,
    #[serde(default)]
    pub is_permanent: bool,
    #[serde(flatten)]
    pub provenance: TileProvenance,
}

impl OfflineArea {
    /// A new user area in the `Downloading` state.
    pub fn new(id: String, request: &AreaRequest, directory: PathBuf, provenance: TileProvenance) -> Self {
        Self {
            id,
            name: request.name.clone(),
            bounds: request.bounds.normalized(),
            min_zoom: request.min_zoom,
            max_zoom: request.max_zoom,
            directory,
            status: AreaStatus::Downloading,
            progress: 0.0,
            tiles_downloaded: 0,
            tiles_total: 0,
            nodes: Vec::new(),
            size_bytes: 0,
            is_permanent: false,
            provenance,
        }
    }

    /// The permanent world area as configured.
    pub fn world(config: &OfflineConfig, provenance: TileProvenance) -> Self {
        Self {
            id: WORLD_AREA_ID.to_string(),
            name: "World".to_string(),
            bounds: config.world_bounds,
            min_zoom: config.world_min_zoom,
            max_zoom: config.world_max_zoom,
            directory: config.areas_dir().join(WORLD_AREA_ID),
            status: AreaStatus::Downloading,
            progress: 0.0,
            tiles_downloaded: 0,
            tiles_total: 0,
            nodes: Vec::new(),
            size_bytes: 0,
            is_permanent: true,
            provenance,
        }
    }

    /// Bounds and zoom band actually downloaded. The permanent area always
    /// uses the configured world range, whatever its own fields say.
    pub fn download_range(&self, config: &OfflineConfig) -> (Bounds, u8, u8) {
        if self.is_permanent {
            (config.world_bounds, config.world_min_zoom, config.world_max_zoom)
        } else {
            (self.bounds, self.min_zoom, self.max_zoom)
        }
    }

    /// Every tile this area needs.
    pub fn required_tiles(&self, config: &OfflineConfig) -> HashSet<TileKey> {
        let (bounds, min_zoom, max_zoom) = self.download_range(config);
        tiles::enumerate_tiles(&bounds, min_zoom, max_zoom)
    }

    /// Update counters and the derived progress together.
    pub fn set_tile_counts(&mut self, downloaded: u64, total: u64) {
        self.tiles_downloaded = downloaded.min(total);
        self.tiles_total = total;
        self.progress = if total == 0 {
            0.0
        } else {
            self.tiles_downloaded as f64 / total as f64
        };
    }

    pub fn points_path(&self) -> PathBuf {
        self.directory.join("points.json")
    }
}

/// A user request for a new offline area.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AreaRequest {
    pub name: String,
    pub bounds: Bounds,
    pub min_zoom: u8,
    pub max_zoom: u8,
    /// `None` downloads from the default basemap.
    #[serde(default)]
    pub tile_provider_id: Option<String>,
    #[serde(default)]
    pub tile_type_id: Option<String>,
}

impl AreaRequest {
    pub fn new(name: &str, bounds: Bounds, min_zoom: u8, max_zoom: u8) -> Self {
        Self {
            name: name.to_string(),
            bounds,
            min_zoom,
            max_zoom,
            tile_provider_id: None,
            tile_type_id: None,
        }
    }

    /// Check the request against the configured limits. Returns the number
    /// of tiles the area needs.
    pub fn validate(&self, config: &OfflineConfig) -> Result<u64> {
        let b = self.bounds;
        if ![b.min_lat, b.max_lat, b.min_lng, b.max_lng]
            .iter()
            .all(|v| v.is_finite())
        {
            return Err(OfflineError::invalid("bounds must be finite"));
        }
        let b = b.normalized();
        if b.min_lat <= -90.0 || b.max_lat >= 90.0 || b.min_lng < -180.0 || b.max_lng > 180.0 {
            return Err(OfflineError::invalid("bounds outside the projectable range"));
        }
        if self.min_zoom > self.max_zoom {
            return Err(OfflineError::invalid(format!(
                "min zoom {} above max zoom {}",
                self.min_zoom, self.max_zoom
            )));
        }
        if self.max_zoom > config.absolute_max_zoom {
            return Err(OfflineError::invalid(format!(
                "max zoom {} above limit {}",
                self.max_zoom, config.absolute_max_zoom
            )));
        }
        if self.max_zoom - self.min_zoom > config.max_zoom_span {
            return Err(OfflineError::invalid(format!(
                "zoom span {} above limit {}",
                self.max_zoom - self.min_zoom,
                config.max_zoom_span
            )));
        }

        let count = tiles::count_tiles(&b, self.min_zoom, self.max_zoom);
        if count > config.absolute_max_tile_count {
            return Err(OfflineError::TooManyTiles {
                count,
                max: config.absolute_max_tile_count,
            });
        }
        Ok(count)
    }
}
