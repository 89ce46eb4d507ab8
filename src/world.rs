//! Permanent world area: a low-zoom basemap of the whole world that is
//! always present and can never be deleted.

use std::sync::Arc;

use log::{info, warn};

use crate::area::{AreaStatus, OfflineArea};
use crate::downloader::{directory_size, AreaDownloader};
use crate::error::OfflineError;
use crate::registry::AreaRegistry;
use crate::tiles;
use crate::Result;

/// Makes sure the permanent world area exists and is complete.
pub struct WorldAreaManager {
    downloader: AreaDownloader,
}

impl WorldAreaManager {
    pub fn new(downloader: AreaDownloader) -> Self {
        Self { downloader }
    }

    fn registry(&self) -> &Arc<AreaRegistry> {
        self.downloader.registry()
    }

    /// Find or create the permanent area, reconcile it against disk and start
    /// a background download when tiles are missing.
    ///
    /// Returns the registered snapshot. Safe to call on every startup.
    pub fn ensure_world_area(&self) -> Result<OfflineArea> {
        let config = self.downloader.config();
        let default_provenance = self.downloader.sources().default_source().provenance();

        let mut world = match self.registry().permanent() {
            Some(world) => world,
            None => {
                info!("[WorldAreaManager] Creating permanent world area");
                OfflineArea::world(config, default_provenance.clone())
            }
        };

        // Exactly one permanent area survives
        let duplicates = self
            .registry()
            .list()
            .iter()
            .filter(|a| a.is_permanent && a.id != world.id)
            .count();
        if duplicates > 0 {
            warn!(
                "[WorldAreaManager] Dropping {} duplicate permanent areas",
                duplicates
            );
            let keep_id = world.id.clone();
            self.registry()
                .retain(|a| !a.is_permanent || a.id == keep_id);
        }

        if world.provenance.is_legacy() {
            info!("[WorldAreaManager] Backfilling world area provenance");
            world.provenance = default_provenance;
        }

        let (bounds, min_zoom, max_zoom) = world.download_range(config);
        world.bounds = bounds;
        world.min_zoom = min_zoom;
        world.max_zoom = max_zoom;

        let required = world.required_tiles(config);
        let total = required.len() as u64;
        let missing = tiles::missing_tiles(&world.directory, &required, &config.tile_extension);
        world.set_tile_counts(total - missing.len() as u64, total);
        world.size_bytes = directory_size(&world.directory);

        if missing.is_empty() {
            world.status = AreaStatus::Complete;
            self.registry().upsert(world.clone());
            self.registry().persist()?;
            info!("[WorldAreaManager] World area complete ({} tiles)", total);
            return Ok(world);
        }

        if self.downloader.is_downloading(&world.id) {
            // Leave the running download's published state alone
            return Ok(self.registry().get(&world.id).unwrap_or(world));
        }

        world.status = AreaStatus::Downloading;
        self.registry().upsert(world.clone());
        self.registry().persist()?;

        info!(
            "[WorldAreaManager] World area missing {}/{} tiles, downloading",
            missing.len(),
            total
        );
        match self.downloader.start_download(world.clone(), None) {
            Ok(()) | Err(OfflineError::AlreadyDownloading { .. }) => {}
            Err(OfflineError::NoRuntime) => {
                warn!("[WorldAreaManager] No async runtime, world download deferred");
            }
            Err(e) => return Err(e),
        }
        Ok(world)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::area::TileProvenance;
    use crate::config::OfflineConfig;
    use crate::fetch::{PointFetcher, TileFetcher};
    use crate::points::{NodeProfile, PointRecord};
    use crate::source::TileSource;
    use crate::tiles::TileKey;
    use crate::Bounds;
    use async_trait::async_trait;

    struct Unreachable;

    #[async_trait]
    impl TileFetcher for Unreachable {
        async fn fetch_tile(&self, _key: TileKey, _source: &TileSource) -> Result<Vec<u8>> {
            Err(OfflineError::fetch("offline"))
        }
    }

    #[async_trait]
    impl PointFetcher for Unreachable {
        async fn fetch_points(&self, _b: Bounds, _p: &[NodeProfile]) -> Result<Vec<PointRecord>> {
            Ok(Vec::new())
        }
    }

    fn manager(config: OfflineConfig) -> WorldAreaManager {
        let registry = Arc::new(AreaRegistry::open(config.registry_path()));
        let downloader =
            AreaDownloader::new(config, registry, Arc::new(Unreachable), Arc::new(Unreachable));
        WorldAreaManager::new(downloader)
    }

    fn prefill(config: &OfflineConfig) {
        let world = OfflineArea::world(config, TileProvenance::default());
        for key in world.required_tiles(config) {
            tiles::save_tile(&world.directory, &key, &config.tile_extension, b"tile").unwrap();
        }
    }

    #[test]
    fn test_complete_world_needs_no_runtime() {
        let tmp = tempfile::tempdir().unwrap();
        let mut config = OfflineConfig::with_base_dir(tmp.path());
        config.world_max_zoom = 2;
        prefill(&config);

        let world = manager(config).ensure_world_area().unwrap();
        assert_eq!(world.status, AreaStatus::Complete);
        assert_eq!(world.tiles_total, 20);
        assert_eq!(world.tiles_downloaded, 20);
        assert!(world.is_permanent);
        assert_eq!(world.provenance.provider_id.as_deref(), Some("openstreetmap"));
    }

    #[test]
    fn test_duplicate_permanent_areas_collapse() {
        let tmp = tempfile::tempdir().unwrap();
        let mut config = OfflineConfig::with_base_dir(tmp.path());
        config.world_max_zoom = 1;
        prefill(&config);

        let registry = AreaRegistry::open(config.registry_path());
        let first = OfflineArea::world(&config, TileProvenance::default());
        let mut second = first.clone();
        second.id = "world_copy".to_string();
        registry.upsert(first);
        registry.upsert(second);
        registry.persist().unwrap();

        let manager = manager(config);
        manager.ensure_world_area().unwrap();
        let permanent: Vec<_> = manager
            .registry()
            .list()
            .into_iter()
            .filter(|a| a.is_permanent)
            .collect();
        assert_eq!(permanent.len(), 1);
    }

    #[test]
    fn test_missing_tiles_without_runtime_stays_downloading() {
        let tmp = tempfile::tempdir().unwrap();
        let mut config = OfflineConfig::with_base_dir(tmp.path());
        config.world_max_zoom = 1;

        let world = manager(config).ensure_world_area().unwrap();
        assert_eq!(world.status, AreaStatus::Downloading);
        assert_eq!(world.tiles_downloaded, 0);
        assert_eq!(world.tiles_total, 4);
    }
}
