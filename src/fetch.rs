//! Contracts for the network collaborators and download control.
//!
//! Implementations may fail or return empty results at will; the core treats
//! both as "unavailable this attempt" and never propagates them.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;

use crate::points::{NodeProfile, PointRecord};
use crate::source::TileSource;
use crate::tiles::TileKey;
use crate::{Bounds, Result};

/// Fetches raw tile bytes.
#[async_trait]
pub trait TileFetcher: Send + Sync {
    async fn fetch_tile(&self, key: TileKey, source: &TileSource) -> Result<Vec<u8>>;
}

/// Fetches point-of-interest records for a region.
#[async_trait]
pub trait PointFetcher: Send + Sync {
    async fn fetch_points(&self, bounds: Bounds, profiles: &[NodeProfile]) -> Result<Vec<PointRecord>>;
}

/// Progress callback, invoked with a value in [0, 1] after each tile write.
/// Must not panic.
pub type ProgressCallback = Arc<dyn Fn(f64) + Send + Sync>;

/// Cooperative cancellation flag, checked before each tile fetch.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}
