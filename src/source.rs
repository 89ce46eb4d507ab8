//! Tile sources: which server a tile comes from and how its URL is built.

use serde::{Deserialize, Serialize};

use crate::area::TileProvenance;
use crate::tiles::{quadkey, TileKey};

/// One tile type of one provider, e.g. "Esri / Satellite".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TileSource {
    pub provider_id: String,
    pub provider_name: String,
    pub type_id: String,
    pub type_name: String,
    /// URL with `{z}`, `{x}`, `{y}`, `{s}` and `{quadkey}` placeholders.
    pub url_template: String,
    /// Values substituted for `{s}`, rotated by tile.
    #[serde(default)]
    pub subdomains: Vec<String>,
}

impl TileSource {
    /// OpenStreetMap standard tiles, the default basemap.
    pub fn openstreetmap() -> Self {
        Self {
            provider_id: "openstreetmap".to_string(),
            provider_name: "OpenStreetMap".to_string(),
            type_id: "osm_street".to_string(),
            type_name: "Street Map".to_string(),
            url_template: "https://tile.openstreetmap.org/{z}/{x}/{y}.png".to_string(),
            subdomains: Vec::new(),
        }
    }

    /// Concrete URL for `key`.
    pub fn url_for(&self, key: &TileKey) -> String {
        let mut url = self
            .url_template
            .replace("{z}", &key.z.to_string())
            .replace("{x}", &key.x.to_string())
            .replace("{y}", &key.y.to_string());
        if url.contains("{quadkey}") {
            url = url.replace("{quadkey}", &quadkey(key));
        }
        if url.contains("{s}") && !self.subdomains.is_empty() {
            let idx = (key.x as usize + key.y as usize) % self.subdomains.len();
            url = url.replace("{s}", &self.subdomains[idx]);
        }
        url
    }

    /// Provenance recorded on areas downloaded from this source.
    pub fn provenance(&self) -> TileProvenance {
        TileProvenance {
            provider_id: Some(self.provider_id.clone()),
            provider_name: Some(self.provider_name.clone()),
            type_id: Some(self.type_id.clone()),
            type_name: Some(self.type_name.clone()),
        }
    }
}

/// Known tile sources with a default basemap fallback.
#[derive(Debug, Clone)]
pub struct TileSourceCatalog {
    sources: Vec<TileSource>,
    default: TileSource,
}

impl TileSourceCatalog {
    /// The first source is the default; an empty list falls back to OSM.
    pub fn new(sources: Vec<TileSource>) -> Self {
        let default = sources
            .first()
            .cloned()
            .unwrap_or_else(TileSource::openstreetmap);
        Self { sources, default }
    }

    pub fn default_source(&self) -> &TileSource {
        &self.default
    }

    pub fn find(&self, provider_id: &str, type_id: &str) -> Option<&TileSource> {
        self.sources
            .iter()
            .find(|s| s.provider_id == provider_id && s.type_id == type_id)
    }

    /// Source for an area's provenance. Legacy areas (no provenance) and
    /// unknown sources resolve to the default basemap.
    pub fn resolve(&self, provenance: &TileProvenance) -> &TileSource {
        match (&provenance.provider_id, &provenance.type_id) {
            (Some(provider), Some(kind)) => self.find(provider, kind).unwrap_or_else(|| {
                log::warn!(
                    "[TileSourceCatalog] Unknown source {}/{}, using default basemap",
                    provider,
                    kind
                );
                &self.default
            }),
            _ => &self.default,
        }
    }
}
