//! Permanent world area reconciliation.

mod common;

use std::sync::Arc;

use common::*;
use offline_areas::tiles;
use offline_areas::{
    AreaRegistry, AreaStatus, OfflineArea, OfflineConfig, TileProvenance, WorldAreaManager,
};
use tempfile::TempDir;

fn world_config(tmp: &TempDir) -> OfflineConfig {
    let mut config = OfflineConfig::with_base_dir(tmp.path());
    config.world_max_zoom = 2;
    config
}

fn prefill(config: &OfflineConfig, max_zoom: u8) {
    let world = OfflineArea::world(config, TileProvenance::default());
    let keys = tiles::enumerate_tiles(&config.world_bounds, config.world_min_zoom, max_zoom);
    for key in keys {
        tiles::save_tile(&world.directory, &key, &config.tile_extension, b"tile").unwrap();
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn complete_world_is_not_refetched() {
    init_logging();
    let tmp = TempDir::new().unwrap();
    let config = world_config(&tmp);
    prefill(&config, 2);

    let fetcher = Arc::new(ScriptedTileFetcher::default());
    let manager = WorldAreaManager::new(downloader(config, fetcher.clone(), Arc::default()));

    let world = manager.ensure_world_area().unwrap();

    assert_eq!(world.status, AreaStatus::Complete);
    assert_eq!(world.tiles_downloaded, 20);
    assert_eq!(fetcher.calls(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn missing_world_tiles_are_downloaded() {
    init_logging();
    let tmp = TempDir::new().unwrap();
    let config = world_config(&tmp);
    prefill(&config, 1);

    let fetcher = Arc::new(ScriptedTileFetcher::default());
    let points = Arc::new(RecordingPointFetcher::default());
    let downloader = downloader(config.clone(), fetcher.clone(), points.clone());
    let manager = WorldAreaManager::new(downloader.clone());

    let world = manager.ensure_world_area().unwrap();
    assert_eq!(world.status, AreaStatus::Downloading);
    assert_eq!(world.tiles_downloaded, 4);
    assert_eq!(world.tiles_total, 20);

    let done = wait_for_status(downloader.registry(), &world.id, AreaStatus::Complete).await;
    wait_until_idle(&downloader, &world.id).await;

    assert_eq!(done.tiles_downloaded, 20);
    assert_eq!(fetcher.calls(), 16);
    assert!(points.requests().is_empty());

    // Second startup finds everything on disk
    let again = manager.ensure_world_area().unwrap();
    assert_eq!(again.status, AreaStatus::Complete);
    assert_eq!(fetcher.calls(), 16);
}

#[tokio::test(flavor = "multi_thread")]
async fn legacy_world_gets_provenance_backfilled() {
    let tmp = TempDir::new().unwrap();
    let config = world_config(&tmp);
    prefill(&config, 2);

    {
        let registry = AreaRegistry::open(config.registry_path());
        let mut legacy = OfflineArea::world(&config, TileProvenance::default());
        legacy.name = "My World".to_string();
        legacy.status = AreaStatus::Error;
        registry.upsert(legacy);
        registry.persist().unwrap();
    }

    let manager = WorldAreaManager::new(downloader(config.clone(), Arc::default(), Arc::default()));
    let world = manager.ensure_world_area().unwrap();

    assert_eq!(world.provenance.provider_id.as_deref(), Some("openstreetmap"));
    assert_eq!(world.name, "My World");
    assert_eq!(world.status, AreaStatus::Complete);

    let reopened = AreaRegistry::open(config.registry_path());
    let stored = reopened.permanent().unwrap();
    assert_eq!(stored.provenance.type_id.as_deref(), Some("osm_street"));
    assert_eq!(reopened.len(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn world_ignores_stale_stored_range() {
    let tmp = TempDir::new().unwrap();
    let config = world_config(&tmp);
    prefill(&config, 2);

    {
        let registry = AreaRegistry::open(config.registry_path());
        let mut stale = OfflineArea::world(&config, TileProvenance::default());
        stale.max_zoom = 6;
        stale.bounds = zurich();
        registry.upsert(stale);
        registry.persist().unwrap();
    }

    let manager = WorldAreaManager::new(downloader(config.clone(), Arc::default(), Arc::default()));
    let world = manager.ensure_world_area().unwrap();

    assert_eq!(world.status, AreaStatus::Complete);
    assert_eq!(world.max_zoom, 2);
    assert_eq!(world.bounds, config.world_bounds);
}
