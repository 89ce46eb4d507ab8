//! Shared fixtures: scripted fetchers and registry polling.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use offline_areas::{
    AreaDownloader, AreaRegistry, AreaStatus, Bounds, CancelToken, GeoPoint, NodeProfile,
    OfflineArea, OfflineConfig, OfflineError, PointFetcher, PointRecord, Result, TileFetcher,
    TileKey, TileSource,
};

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// A few tiles around Zurich at z12-14.
pub fn zurich() -> Bounds {
    Bounds::new(47.36, 47.38, 8.53, 8.55)
}

/// Tile fetcher with scripted failures.
#[derive(Default)]
pub struct ScriptedTileFetcher {
    /// Every tile fails this many times before succeeding.
    pub fail_first: u32,
    /// Tiles that always fail.
    pub always_fail: HashSet<TileKey>,
    /// Tiles that always return an empty body.
    pub always_empty: HashSet<TileKey>,
    /// Per-call latency.
    pub delay: Option<Duration>,
    /// Cancel this token once `cancel_after` tiles were served.
    pub cancel: Option<(CancelToken, usize)>,
    /// Attempts so far, per tile.
    pub attempts: Mutex<HashMap<TileKey, u32>>,
    /// Every call, including failures.
    pub calls: AtomicUsize,
    /// Successful non-empty responses.
    pub served: AtomicUsize,
}

impl ScriptedTileFetcher {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn served(&self) -> usize {
        self.served.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TileFetcher for ScriptedTileFetcher {
    async fn fetch_tile(&self, key: TileKey, _source: &TileSource) -> Result<Vec<u8>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let attempt = {
            let mut attempts = self.attempts.lock().unwrap();
            let n = attempts.entry(key).or_insert(0);
            *n += 1;
            *n
        };

        if self.always_fail.contains(&key) || attempt <= self.fail_first {
            return Err(OfflineError::Fetch {
                message: format!("scripted failure for {}", key),
                status_code: Some(503),
            });
        }
        if self.always_empty.contains(&key) {
            return Ok(Vec::new());
        }

        let served = self.served.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some((token, after)) = &self.cancel {
            if served >= *after {
                token.cancel();
            }
        }
        Ok(format!("tile {}", key).into_bytes())
    }
}

/// Point fetcher returning fixed records and recording requested bounds.
#[derive(Default)]
pub struct RecordingPointFetcher {
    pub points: Vec<PointRecord>,
    /// Every request fails.
    pub fail: bool,
    /// The first requests fail, later ones succeed.
    pub fail_first: usize,
    pub requests: Mutex<Vec<Bounds>>,
}

impl RecordingPointFetcher {
    pub fn with_points(points: Vec<PointRecord>) -> Self {
        Self {
            points,
            ..Self::default()
        }
    }

    pub fn requests(&self) -> Vec<Bounds> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl PointFetcher for RecordingPointFetcher {
    async fn fetch_points(&self, bounds: Bounds, _profiles: &[NodeProfile]) -> Result<Vec<PointRecord>> {
        let attempt = {
            let mut requests = self.requests.lock().unwrap();
            requests.push(bounds);
            requests.len()
        };
        if self.fail || attempt <= self.fail_first {
            return Err(OfflineError::Fetch {
                message: "overpass timeout".to_string(),
                status_code: Some(504),
            });
        }
        Ok(self.points.clone())
    }
}

pub fn alpr(id: i64, lat: f64, lng: f64) -> PointRecord {
    let mut tags = std::collections::BTreeMap::new();
    tags.insert("surveillance:type".to_string(), "ALPR".to_string());
    PointRecord::new(id, GeoPoint::new(lat, lng), tags)
}

pub fn downloader(
    config: OfflineConfig,
    tiles: Arc<ScriptedTileFetcher>,
    points: Arc<RecordingPointFetcher>,
) -> AreaDownloader {
    let registry = Arc::new(AreaRegistry::open(config.registry_path()));
    AreaDownloader::new(config, registry, tiles, points)
}

/// A user area over `bounds` registered nowhere yet.
pub fn user_area(config: &OfflineConfig, id: &str, bounds: Bounds, min_zoom: u8, max_zoom: u8) -> OfflineArea {
    let request = offline_areas::AreaRequest::new(id, bounds, min_zoom, max_zoom);
    OfflineArea::new(
        id.to_string(),
        &request,
        config.areas_dir().join(id),
        TileSource::openstreetmap().provenance(),
    )
}

/// Number of required tiles of `area` present on disk.
pub fn tiles_on_disk(config: &OfflineConfig, area: &OfflineArea) -> usize {
    let required = area.required_tiles(config);
    required.len() - offline_areas::tiles::missing_tiles(&area.directory, &required, &config.tile_extension).len()
}

/// Poll the registry until `id` reaches `status`.
pub async fn wait_for_status(registry: &AreaRegistry, id: &str, status: AreaStatus) -> OfflineArea {
    for _ in 0..500 {
        if let Some(area) = registry.get(id) {
            if area.status == status {
                return area;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!(
        "area {} never reached {:?}, last state: {:?}",
        id,
        status,
        registry.get(id).map(|a| a.status)
    );
}

/// Poll until no download for `id` is running.
pub async fn wait_until_idle(downloader: &AreaDownloader, id: &str) {
    for _ in 0..500 {
        if !downloader.is_downloading(id) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("download of {} never finished", id);
}
