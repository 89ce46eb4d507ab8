//! # Area Registry
//!
//! The list of offline areas, shared between the UI (readers) and the
//! download orchestrator (writer).
//!
//! In memory the registry holds the latest published snapshot of every area.
//! On disk it is a single JSON array written atomically (temp file, fsync,
//! rename), so a crash mid-write leaves the previous document intact.
//!
//! Loading is lenient: entries missing optional fields get defaults, and a
//! malformed entry is logged and skipped instead of failing the whole load.

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};

use log::{debug, info, warn};

use crate::area::OfflineArea;
use crate::error::OfflineError;
use crate::points::PointRecord;
use crate::Result;

/// Thread-safe, persistent list of offline areas.
#[derive(Debug)]
pub struct AreaRegistry {
    path: PathBuf,
    areas: RwLock<Vec<OfflineArea>>,
    /// Serializes writers of the registry file.
    persist_lock: Mutex<()>,
}

impl AreaRegistry {
    /// Load the registry at `path`. A missing file is an empty registry; an
    /// unreadable one is logged and also treated as empty.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let mut areas = match std::fs::read_to_string(&path) {
            Ok(content) => parse_areas(&content),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("[AreaRegistry] No registry at {}, starting empty", path.display());
                Vec::new()
            }
            Err(e) => {
                warn!(
                    "[AreaRegistry] Failed to read {}: {}, starting empty",
                    path.display(),
                    e
                );
                Vec::new()
            }
        };

        for area in areas.iter_mut().filter(|a| !a.is_permanent) {
            area.nodes = read_points(&area.points_path());
        }

        info!(
            "[AreaRegistry] Loaded {} areas from {}",
            areas.len(),
            path.display()
        );

        Self {
            path,
            areas: RwLock::new(areas),
            persist_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read(&self) -> RwLockReadGuard<'_, Vec<OfflineArea>> {
        self.areas.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Vec<OfflineArea>> {
        self.areas.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Snapshot of all areas.
    pub fn list(&self) -> Vec<OfflineArea> {
        self.read().clone()
    }

    pub fn get(&self, id: &str) -> Option<OfflineArea> {
        self.read().iter().find(|a| a.id == id).cloned()
    }

    /// The permanent world area, if registered.
    pub fn permanent(&self) -> Option<OfflineArea> {
        self.read().iter().find(|a| a.is_permanent).cloned()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Publish a snapshot of `area` (in memory only; see [`persist`](Self::persist)).
    pub fn upsert(&self, area: OfflineArea) {
        let mut areas = self.write();
        match areas.iter_mut().find(|a| a.id == area.id) {
            Some(existing) => *existing = area,
            None => areas.push(area),
        }
    }

    /// Copy the download state of `area` onto its registered entry, leaving
    /// user-owned fields (the name) untouched. Returns false when the area is
    /// no longer registered, e.g. deleted while downloading.
    pub fn update_download_state(&self, area: &OfflineArea) -> bool {
        let mut areas = self.write();
        let Some(existing) = areas.iter_mut().find(|a| a.id == area.id) else {
            return false;
        };
        existing.status = area.status;
        existing.progress = area.progress;
        existing.tiles_downloaded = area.tiles_downloaded;
        existing.tiles_total = area.tiles_total;
        existing.size_bytes = area.size_bytes;
        existing.nodes = area.nodes.clone();
        existing.provenance = area.provenance.clone();
        true
    }

    /// Rename an area.
    pub fn rename(&self, id: &str, name: &str) -> Result<()> {
        let mut areas = self.write();
        let area = areas
            .iter_mut()
            .find(|a| a.id == id)
            .ok_or_else(|| OfflineError::AreaNotFound { id: id.to_string() })?;
        area.name = name.to_string();
        Ok(())
    }

    /// Remove a user area. The permanent area cannot be removed.
    pub fn remove(&self, id: &str) -> Result<OfflineArea> {
        let mut areas = self.write();
        let idx = areas
            .iter()
            .position(|a| a.id == id)
            .ok_or_else(|| OfflineError::AreaNotFound { id: id.to_string() })?;
        if areas[idx].is_permanent {
            return Err(OfflineError::PermanentArea { id: id.to_string() });
        }
        Ok(areas.remove(idx))
    }

    /// Keep only areas for which `keep` returns true.
    pub(crate) fn retain<F>(&self, keep: F)
    where
        F: FnMut(&OfflineArea) -> bool,
    {
        self.write().retain(keep);
    }

    /// Write the full registry to disk atomically.
    pub fn persist(&self) -> Result<()> {
        let _guard = self.persist_lock.lock().unwrap_or_else(|e| e.into_inner());
        let json = areas_to_json(&self.read())?;
        write_atomic(&self.path, json.as_bytes())?;
        debug!("[AreaRegistry] Persisted to {}", self.path.display());
        Ok(())
    }
}

// ============================================================================
// Document Format
// ============================================================================

/// Serialize areas as the registry document.
pub fn areas_to_json(areas: &[OfflineArea]) -> Result<String> {
    Ok(serde_json::to_string_pretty(areas)?)
}

/// Parse a registry document, skipping (and logging) entries that do not
/// deserialize. A document that is not a JSON array yields no areas.
pub fn parse_areas(content: &str) -> Vec<OfflineArea> {
    let entries: Vec<serde_json::Value> = match serde_json::from_str(content) {
        Ok(entries) => entries,
        Err(e) => {
            warn!("[AreaRegistry] Registry document is not a JSON array: {}", e);
            return Vec::new();
        }
    };

    entries
        .into_iter()
        .enumerate()
        .filter_map(|(idx, entry)| match serde_json::from_value::<OfflineArea>(entry) {
            Ok(area) => Some(area),
            Err(e) => {
                warn!("[AreaRegistry] Skipping malformed area entry #{}: {}", idx, e);
                None
            }
        })
        .collect()
}

/// Read `points.json`; missing or malformed files yield no points.
pub fn read_points(path: &Path) -> Vec<PointRecord> {
    match std::fs::read_to_string(path) {
        Ok(content) => serde_json::from_str(&content).unwrap_or_else(|e| {
            warn!("[AreaRegistry] Ignoring malformed {}: {}", path.display(), e);
            Vec::new()
        }),
        Err(_) => Vec::new(),
    }
}

/// Write `points.json` atomically.
pub fn write_points(path: &Path, points: &[PointRecord]) -> Result<()> {
    let json = serde_json::to_vec(points)?;
    write_atomic(path, &json)
}

/// Write to a sibling temp file, fsync, then rename over `path`.
fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut tmp_name = path.as_os_str().to_owned();
    tmp_name.push(".tmp");
    let tmp_path = PathBuf::from(tmp_name);

    let mut file = File::create(&tmp_path)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    drop(file);

    std::fs::rename(&tmp_path, path)?;
    Ok(())
}
