//! # Spatial Point Cache
//!
//! In-memory index of point records, queried by map viewport.
//!
//! Queries never touch the network. Network refreshes go through
//! [`SpatialCache::fetch_and_update`], which is debounced so a burst of
//! viewport changes while panning results in a single request for the
//! final viewport.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use log::{debug, info, warn};
use rstar::{RTree, RTreeObject, AABB};
use tokio::sync::watch;

use crate::area::OfflineArea;
use crate::fetch::PointFetcher;
use crate::points::{NodeProfile, PointRecord};
use crate::Bounds;

/// A record id at its position, stored in the R-tree.
#[derive(Debug, Clone, Copy, PartialEq)]
struct IndexedPoint {
    id: i64,
    lng: f64,
    lat: f64,
}

impl IndexedPoint {
    fn of(record: &PointRecord) -> Self {
        Self {
            id: record.id,
            lng: record.coord.longitude,
            lat: record.coord.latitude,
        }
    }
}

impl RTreeObject for IndexedPoint {
    type Envelope = AABB<[f64; 2]>;

    fn envelope(&self) -> Self::Envelope {
        AABB::from_point([self.lng, self.lat])
    }
}

#[derive(Default)]
struct PointIndex {
    tree: RTree<IndexedPoint>,
    records: HashMap<i64, PointRecord>,
}

impl PointIndex {
    fn upsert(&mut self, record: &PointRecord) {
        if let Some(old) = self.records.get(&record.id) {
            self.tree.remove(&IndexedPoint::of(old));
        }
        self.tree.insert(IndexedPoint::of(record));
        self.records.insert(record.id, record.clone());
    }

    fn query(&self, bounds: &Bounds) -> Vec<PointRecord> {
        let b = bounds.normalized();
        let envelope = AABB::from_corners([b.min_lng, b.min_lat], [b.max_lng, b.max_lat]);
        self.tree
            .locate_in_envelope(&envelope)
            .filter_map(|p| self.records.get(&p.id))
            .cloned()
            .collect()
    }
}

/// Shared point cache. Clones share the same index and observers.
#[derive(Clone)]
pub struct SpatialCache {
    index: Arc<RwLock<PointIndex>>,
    fetcher: Arc<dyn PointFetcher>,
    /// Bumped by every refresh request; a sleeping refresh only fires if
    /// it is still the latest when its debounce window ends.
    generation: Arc<AtomicU64>,
    revision: Arc<watch::Sender<u64>>,
    debounce: Duration,
}

impl SpatialCache {
    pub fn new(fetcher: Arc<dyn PointFetcher>, debounce: Duration) -> Self {
        let (revision, _) = watch::channel(0);
        Self {
            index: Arc::new(RwLock::new(PointIndex::default())),
            fetcher,
            generation: Arc::new(AtomicU64::new(0)),
            revision: Arc::new(revision),
            debounce,
        }
    }

    /// Observe cache changes. The value is a revision counter bumped on every
    /// change notification.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.revision.subscribe()
    }

    fn notify(&self) {
        self.revision.send_modify(|rev| *rev += 1);
    }

    /// Cached points inside `bounds` (edges inclusive).
    pub fn query_by_bounds(&self, bounds: &Bounds) -> Vec<PointRecord> {
        self.index
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .query(bounds)
    }

    /// Insert or replace points by id.
    pub fn add_or_update(&self, points: &[PointRecord]) {
        {
            let mut index = self.index.write().unwrap_or_else(|e| e.into_inner());
            for point in points {
                index.upsert(point);
            }
        }
        self.notify();
    }

    pub fn clear(&self) {
        *self.index.write().unwrap_or_else(|e| e.into_inner()) = PointIndex::default();
        self.notify();
    }

    pub fn len(&self) -> usize {
        self.index
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .records
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Cached points inside `bounds` matching at least one profile.
    pub fn get_cached_for_bounds(&self, bounds: &Bounds, profiles: &[NodeProfile]) -> Vec<PointRecord> {
        if profiles.is_empty() {
            return Vec::new();
        }
        self.query_by_bounds(bounds)
            .into_iter()
            .filter(|p| p.matches_any(profiles))
            .collect()
    }

    /// Seed the cache with the points stored for downloaded areas.
    pub fn load_offline_areas(&self, areas: &[OfflineArea]) {
        let points: Vec<PointRecord> = areas
            .iter()
            .flat_map(|a| a.nodes.iter().cloned())
            .collect();
        info!(
            "[SpatialCache] Loading {} points from {} offline areas",
            points.len(),
            areas.len()
        );
        self.add_or_update(&points);
    }

    /// Notify observers with the current cache contents, then refresh
    /// `bounds` from the network after the debounce delay.
    ///
    /// A later call within the window supersedes a refresh that has not
    /// fired yet. A refresh already fetching is left to finish and merge.
    /// Requires a tokio runtime; without one only the immediate notification
    /// happens.
    pub fn fetch_and_update(&self, bounds: Bounds, profiles: Vec<NodeProfile>) {
        self.notify();

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;

        if profiles.is_empty() {
            return;
        }

        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(_) => {
                warn!("[SpatialCache] No async runtime, skipping refresh");
                return;
            }
        };

        let this = self.clone();
        let delay = self.debounce;
        runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            if this.generation.load(Ordering::SeqCst) != generation {
                debug!("[SpatialCache] Refresh superseded");
                return;
            }
            match this.fetcher.fetch_points(bounds, &profiles).await {
                Ok(points) if !points.is_empty() => {
                    debug!("[SpatialCache] Refresh returned {} points", points.len());
                    this.add_or_update(&points);
                }
                Ok(_) => debug!("[SpatialCache] Refresh returned no points"),
                Err(e) => warn!("[SpatialCache] Refresh failed: {}", e),
            }
        });
    }
}
