//! # Area Download Orchestrator
//!
//! Downloads every tile an offline area needs and converges to either a
//! complete area or a bounded failure.
//!
//! ## Algorithm
//!
//! 1. Enumerate the required tile set (the fixed world range for the
//!    permanent area).
//! 2. Derive the outstanding set from the files on disk, so a restarted
//!    download never refetches tiles it already has.
//! 3. Run up to `retry_passes` passes over the outstanding tiles with a
//!    bounded pool of fetches. Failed or empty fetches are skipped, never
//!    propagated. The cancel token is checked before every fetch.
//! 4. After each pass, recompute the footprint, persist the registry and
//!    re-scan disk. Nothing missing means `Complete`.
//! 5. Passes exhausted with tiles still missing means `Error`. Fetched tiles
//!    stay on disk.
//! 6. User areas then fetch points for the min-zoom tile union of their
//!    bounds and store them in `points.json`.
//!
//! Disk writes happen in the single task that owns the mutable area; the
//! registry only ever receives snapshots.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;

use futures::stream::{self, StreamExt};
use log::{debug, info, warn};
use walkdir::WalkDir;

use crate::area::{AreaRequest, AreaStatus, OfflineArea};
use crate::config::OfflineConfig;
use crate::error::OfflineError;
use crate::fetch::{CancelToken, PointFetcher, ProgressCallback, TileFetcher};
use crate::points::NodeProfile;
use crate::registry::{self, AreaRegistry};
use crate::source::{TileSource, TileSourceCatalog};
use crate::tiles::{self, TileKey};
use crate::{Bounds, Result};

/// Helper to calculate elapsed milliseconds from an Instant
#[inline]
fn elapsed_ms(start: Instant) -> u64 {
    start.elapsed().as_millis() as u64
}

/// Total size of all files below `dir`.
pub fn directory_size(dir: &Path) -> u64 {
    WalkDir::new(dir)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .filter_map(|entry| entry.metadata().ok())
        .map(|meta| meta.len())
        .sum()
}

/// Releases an area's single-flight slot when the run ends.
struct InFlightGuard {
    in_flight: Arc<Mutex<HashMap<String, CancelToken>>>,
    area_id: String,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        let mut in_flight = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        in_flight.remove(&self.area_id);
    }
}

/// Downloads offline areas and manages their lifecycle.
///
/// Cheap to clone; clones share the registry, fetchers and the set of
/// running downloads.
#[derive(Clone)]
pub struct AreaDownloader {
    config: Arc<OfflineConfig>,
    registry: Arc<AreaRegistry>,
    tile_fetcher: Arc<dyn TileFetcher>,
    point_fetcher: Arc<dyn PointFetcher>,
    sources: Arc<TileSourceCatalog>,
    profiles: Arc<RwLock<Vec<NodeProfile>>>,
    in_flight: Arc<Mutex<HashMap<String, CancelToken>>>,
}

impl AreaDownloader {
    /// Create a downloader. Point fetches use the built-in profiles until
    /// [`set_profiles`](Self::set_profiles) is called.
    pub fn new(
        config: OfflineConfig,
        registry: Arc<AreaRegistry>,
        tile_fetcher: Arc<dyn TileFetcher>,
        point_fetcher: Arc<dyn PointFetcher>,
    ) -> Self {
        let sources = TileSourceCatalog::new(config.tile_sources.clone());
        Self {
            config: Arc::new(config),
            registry,
            tile_fetcher,
            point_fetcher,
            sources: Arc::new(sources),
            profiles: Arc::new(RwLock::new(NodeProfile::builtin())),
            in_flight: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn config(&self) -> &OfflineConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<AreaRegistry> {
        &self.registry
    }

    pub fn sources(&self) -> &TileSourceCatalog {
        &self.sources
    }

    /// Profiles used for the points of newly downloaded areas.
    pub fn set_profiles(&self, profiles: Vec<NodeProfile>) {
        *self.profiles.write().unwrap_or_else(|e| e.into_inner()) = profiles;
    }

    fn enabled_profiles(&self) -> Vec<NodeProfile> {
        NodeProfile::enabled(&self.profiles.read().unwrap_or_else(|e| e.into_inner()))
    }

    // ========================================================================
    // Single-flight and Cancellation
    // ========================================================================

    fn claim(&self, area_id: &str, token: CancelToken) -> Result<InFlightGuard> {
        let mut in_flight = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        if in_flight.contains_key(area_id) {
            return Err(OfflineError::AlreadyDownloading {
                id: area_id.to_string(),
            });
        }
        in_flight.insert(area_id.to_string(), token);
        Ok(InFlightGuard {
            in_flight: Arc::clone(&self.in_flight),
            area_id: area_id.to_string(),
        })
    }

    /// Whether a download for `area_id` is running.
    pub fn is_downloading(&self, area_id: &str) -> bool {
        let in_flight = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        in_flight.contains_key(area_id)
    }

    /// Request cancellation of a running download. The run stops before its
    /// next tile fetch. Returns false when nothing was running.
    pub fn cancel_download(&self, area_id: &str) -> bool {
        let in_flight = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        match in_flight.get(area_id) {
            Some(token) => {
                info!("[AreaDownloader] Cancelling download of {}", area_id);
                token.cancel();
                true
            }
            None => false,
        }
    }

    // ========================================================================
    // Area Management
    // ========================================================================

    /// Estimated on-disk size of a prospective area. Saturates instead of
    /// overflowing for unrealistic zoom bands.
    pub fn estimate_size_bytes(&self, bounds: &Bounds, min_zoom: u8, max_zoom: u8) -> u64 {
        tiles::count_tiles(bounds, min_zoom, max_zoom)
            .saturating_mul(self.config.fallback_tile_size_kb.saturating_mul(1024))
    }

    fn allocate_id(&self) -> String {
        let base = format!("area_{}", chrono::Utc::now().timestamp_millis());
        let mut id = base.clone();
        let mut suffix = 1;
        while self.registry.get(&id).is_some() {
            id = format!("{}_{}", base, suffix);
            suffix += 1;
        }
        id
    }

    /// Validate `request`, register a new area and start downloading it in
    /// the background. Returns the registered snapshot.
    pub fn create_area(
        &self,
        request: AreaRequest,
        progress: Option<ProgressCallback>,
    ) -> Result<OfflineArea> {
        let tile_count = request.validate(&self.config)?;

        let provenance = match (&request.tile_provider_id, &request.tile_type_id) {
            (Some(provider), Some(kind)) => self
                .sources
                .find(provider, kind)
                .ok_or_else(|| {
                    OfflineError::invalid(format!("unknown tile source {}/{}", provider, kind))
                })?
                .provenance(),
            _ => self.sources.default_source().provenance(),
        };

        let id = self.allocate_id();
        let directory = self.config.areas_dir().join(&id);
        let mut area = OfflineArea::new(id, &request, directory, provenance);
        area.set_tile_counts(0, tile_count);

        info!(
            "[AreaDownloader] Created area {} '{}' (z{}-{}, {} tiles)",
            area.id, area.name, area.min_zoom, area.max_zoom, tile_count
        );

        self.registry.upsert(area.clone());
        self.registry.persist()?;
        self.start_download(area.clone(), progress)?;
        Ok(area)
    }

    pub fn rename_area(&self, area_id: &str, name: &str) -> Result<()> {
        self.registry.rename(area_id, name)?;
        self.registry.persist()
    }

    /// Delete a user area and everything it stored. Running downloads are
    /// cancelled first. The permanent area cannot be deleted.
    pub fn delete_area(&self, area_id: &str) -> Result<()> {
        let area = self
            .registry
            .get(area_id)
            .ok_or_else(|| OfflineError::AreaNotFound {
                id: area_id.to_string(),
            })?;
        if area.is_permanent {
            return Err(OfflineError::PermanentArea {
                id: area_id.to_string(),
            });
        }

        self.cancel_download(area_id);
        self.registry.remove(area_id)?;
        remove_area_dir(&area.directory)?;
        self.registry.persist()?;

        info!("[AreaDownloader] Deleted area {}", area_id);
        Ok(())
    }

    /// Restart the download of a registered area in the background, e.g. to
    /// retry a failed or cancelled area.
    pub fn restart_download(&self, area_id: &str, progress: Option<ProgressCallback>) -> Result<()> {
        let area = self
            .registry
            .get(area_id)
            .ok_or_else(|| OfflineError::AreaNotFound {
                id: area_id.to_string(),
            })?;
        self.start_download(area, progress)
    }

    /// Restart user areas left in `Downloading` by a previous process.
    /// Returns how many were restarted.
    pub fn resume_interrupted(&self) -> Result<usize> {
        let pending: Vec<OfflineArea> = self
            .registry
            .list()
            .into_iter()
            .filter(|a| !a.is_permanent && a.status == AreaStatus::Downloading)
            .filter(|a| !self.is_downloading(&a.id))
            .collect();

        let count = pending.len();
        for area in pending {
            info!("[AreaDownloader] Resuming interrupted area {}", area.id);
            self.start_download(area, None)?;
        }
        Ok(count)
    }

    // ========================================================================
    // Download Runs
    // ========================================================================

    /// Start downloading `area` in the background and return immediately.
    ///
    /// Progress is observable through the registry. Fails only when the area
    /// is already downloading or no tokio runtime is available.
    pub fn start_download(&self, area: OfflineArea, progress: Option<ProgressCallback>) -> Result<()> {
        let handle = tokio::runtime::Handle::try_current().map_err(|_| OfflineError::NoRuntime)?;
        let token = CancelToken::new();
        let guard = self.claim(&area.id, token.clone())?;
        let this = self.clone();

        handle.spawn(async move {
            let _guard = guard;
            let area_id = area.id.clone();
            let start = Instant::now();
            match this.run_download(area, token, progress).await {
                Ok(true) => info!(
                    "[AreaDownloader] Background download of {} complete ({} ms)",
                    area_id,
                    elapsed_ms(start)
                ),
                Ok(false) => info!(
                    "[AreaDownloader] Background download of {} ended incomplete ({} ms)",
                    area_id,
                    elapsed_ms(start)
                ),
                Err(e) => {
                    warn!(
                        "[AreaDownloader] Background download of {} failed: {}",
                        area_id, e
                    );
                    this.mark_failed(&area_id);
                }
            }
        });

        Ok(())
    }

    /// Download `area` to completion or bounded failure.
    ///
    /// Returns `Ok(true)` when every tile is on disk, `Ok(false)` when the
    /// retry budget ran out or the run was cancelled. Only local I/O errors
    /// are returned as `Err`.
    pub async fn download_area(
        &self,
        area: OfflineArea,
        progress: Option<ProgressCallback>,
    ) -> Result<bool> {
        self.download_with_token(area, CancelToken::new(), progress).await
    }

    /// Like [`download_area`](Self::download_area) with a caller-provided
    /// cancel token.
    pub async fn download_with_token(
        &self,
        area: OfflineArea,
        token: CancelToken,
        progress: Option<ProgressCallback>,
    ) -> Result<bool> {
        let _guard = self.claim(&area.id, token.clone())?;
        self.run_download(area, token, progress).await
    }

    fn mark_failed(&self, area_id: &str) {
        if let Some(mut area) = self.registry.get(area_id) {
            area.status = AreaStatus::Error;
            self.registry.update_download_state(&area);
            if let Err(e) = self.registry.persist() {
                warn!("[AreaDownloader] Failed to persist registry: {}", e);
            }
        }
    }

    /// Publish a snapshot and persist the registry. Returns false when the
    /// area was deleted meanwhile.
    fn publish(&self, area: &OfflineArea) -> Result<bool> {
        if !self.registry.update_download_state(area) {
            return Ok(false);
        }
        self.registry.persist()?;
        Ok(true)
    }

    async fn run_download(
        &self,
        mut area: OfflineArea,
        token: CancelToken,
        progress: Option<ProgressCallback>,
    ) -> Result<bool> {
        let start = Instant::now();
        let ext = self.config.tile_extension.clone();
        let source = self.sources.resolve(&area.provenance).clone();
        if area.provenance.is_legacy() {
            debug!(
                "[AreaDownloader] {} has no provenance, using {}",
                area.id, source.provider_name
            );
        }

        let required = area.required_tiles(&self.config);
        let total = required.len() as u64;

        std::fs::create_dir_all(&area.directory)?;
        let mut outstanding = sorted(tiles::missing_tiles(&area.directory, &required, &ext));

        area.status = AreaStatus::Downloading;
        area.set_tile_counts(total - outstanding.len() as u64, total);
        if self.registry.get(&area.id).is_none() {
            self.registry.upsert(area.clone());
        }
        self.publish(&area)?;

        info!(
            "[AreaDownloader] Starting {} from {}: {} tiles, {} already on disk",
            area.id,
            source.provider_name,
            total,
            area.tiles_downloaded
        );

        let passes = self.config.retry_passes.max(1);
        let mut pass = 0;
        while !outstanding.is_empty() && pass < passes && !token.is_cancelled() {
            pass += 1;
            let pass_start = Instant::now();
            let fetched = self
                .run_pass(&mut area, &outstanding, &source, &token, progress.as_ref())
                .await?;

            // Disk is the source of truth, not the counters
            outstanding = sorted(tiles::missing_tiles(&area.directory, &required, &ext));
            area.set_tile_counts(total - outstanding.len() as u64, total);
            area.size_bytes = directory_size(&area.directory);
            if !self.publish(&area)? {
                return self.abandon_deleted(&area);
            }

            info!(
                "[AreaDownloader] {} pass {}/{}: fetched {}, {} missing ({} ms)",
                area.id,
                pass,
                passes,
                fetched,
                outstanding.len(),
                elapsed_ms(pass_start)
            );
        }

        let complete = outstanding.is_empty();

        if !complete && token.is_cancelled() {
            if self.registry.get(&area.id).is_none() {
                return self.abandon_deleted(&area);
            }
            area.status = AreaStatus::Cancelled;
            self.publish(&area)?;
            info!(
                "[AreaDownloader] {} cancelled with {}/{} tiles ({} ms)",
                area.id,
                area.tiles_downloaded,
                total,
                elapsed_ms(start)
            );
            return Ok(false);
        }

        if !area.is_permanent {
            self.fetch_area_points(&mut area).await?;
        }

        area.status = if complete {
            AreaStatus::Complete
        } else {
            AreaStatus::Error
        };
        area.size_bytes = directory_size(&area.directory);
        if !self.publish(&area)? {
            return self.abandon_deleted(&area);
        }

        if complete {
            info!(
                "[AreaDownloader] {} complete: {} tiles, {} bytes ({} ms)",
                area.id,
                total,
                area.size_bytes,
                elapsed_ms(start)
            );
        } else {
            warn!(
                "[AreaDownloader] {} failed after {} passes: {} of {} tiles missing ({} ms)",
                area.id,
                pass,
                outstanding.len(),
                total,
                elapsed_ms(start)
            );
        }
        Ok(complete)
    }

    /// One sweep over `outstanding`. Returns the number of tiles written.
    async fn run_pass(
        &self,
        area: &mut OfflineArea,
        outstanding: &[TileKey],
        source: &TileSource,
        token: &CancelToken,
        progress: Option<&ProgressCallback>,
    ) -> Result<u64> {
        let fetcher = self.tile_fetcher.as_ref();
        let concurrency = self.config.fetch_concurrency.max(1);

        let mut results = stream::iter(outstanding.iter().copied())
            .map(move |key| async move {
                if token.is_cancelled() {
                    return (key, None);
                }
                match fetcher.fetch_tile(key, source).await {
                    Ok(bytes) if !bytes.is_empty() => (key, Some(bytes)),
                    Ok(_) => {
                        debug!("[AreaDownloader] Empty body for tile {}", key);
                        (key, None)
                    }
                    Err(e) => {
                        debug!("[AreaDownloader] Tile {} failed: {}", key, e);
                        (key, None)
                    }
                }
            })
            .buffer_unordered(concurrency);

        let mut written = 0;
        while let Some((key, bytes)) = results.next().await {
            let Some(bytes) = bytes else {
                continue;
            };
            tiles::save_tile(&area.directory, &key, &self.config.tile_extension, &bytes)?;
            written += 1;

            area.set_tile_counts(area.tiles_downloaded + 1, area.tiles_total);
            if !self.registry.update_download_state(area) {
                // Deleted under us
                token.cancel();
            }
            if let Some(callback) = progress {
                callback(area.progress);
            }
        }

        Ok(written)
    }

    /// Fetch and store the points of a user area, retrying up to
    /// `retry_passes` times. Exhausted retries are logged and leave the area
    /// without points; write failures propagate.
    async fn fetch_area_points(&self, area: &mut OfflineArea) -> Result<()> {
        let profiles = self.enabled_profiles();
        if profiles.is_empty() {
            debug!("[AreaDownloader] No enabled profiles, skipping points for {}", area.id);
            return Ok(());
        }

        let bounds = tiles::expanded_bounds(&area.bounds, area.min_zoom);
        let attempts = self.config.retry_passes.max(1);
        for attempt in 1..=attempts {
            match self.point_fetcher.fetch_points(bounds, &profiles).await {
                Ok(points) => {
                    registry::write_points(&area.points_path(), &points)?;
                    info!(
                        "[AreaDownloader] Stored {} points for {}",
                        points.len(),
                        area.id
                    );
                    area.nodes = points;
                    return Ok(());
                }
                Err(e) => {
                    warn!(
                        "[AreaDownloader] Point fetch for {} failed (attempt {}/{}): {}",
                        area.id, attempt, attempts, e
                    );
                }
            }
        }
        Ok(())
    }

    /// The area was deleted during the run; drop whatever the run wrote
    /// after the delete.
    fn abandon_deleted(&self, area: &OfflineArea) -> Result<bool> {
        info!("[AreaDownloader] {} was deleted during download", area.id);
        remove_area_dir(&area.directory)?;
        Ok(false)
    }
}

fn sorted(mut keys: Vec<TileKey>) -> Vec<TileKey> {
    keys.sort_unstable();
    keys
}

fn remove_area_dir(dir: &Path) -> Result<()> {
    match std::fs::remove_dir_all(dir) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_directory_size_sums_nested_files() {
        let tmp = tempfile::tempdir().unwrap();
        tiles::save_tile(tmp.path(), &TileKey::new(2, 1, 1), "png", &[0u8; 100]).unwrap();
        tiles::save_tile(tmp.path(), &TileKey::new(3, 2, 2), "png", &[0u8; 50]).unwrap();
        assert_eq!(directory_size(tmp.path()), 150);
        assert_eq!(directory_size(&tmp.path().join("missing")), 0);
    }

    #[test]
    fn test_sorted_puts_low_zoom_first() {
        let keys = sorted(vec![
            TileKey::new(3, 0, 0),
            TileKey::new(1, 1, 1),
            TileKey::new(2, 0, 1),
        ]);
        assert_eq!(keys[0].z, 1);
        assert_eq!(keys[2].z, 3);
    }

    #[test]
    fn test_remove_missing_dir_is_ok() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(remove_area_dir(&tmp.path().join("nope")).is_ok());
    }
}
