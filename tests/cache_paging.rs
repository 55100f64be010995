//! Tile cache integration: paging under a bounded working set, state
//! round-trips through the backing store, re-opening a survey directory,
//! and replacement preferences.

use std::time::Instant;

use bathycube::cache::{estimate_tile_side, CacheConfig, CacheError, CachedSheet};
use bathycube::{
    CellCounts, CellSizes, GridIndex, IhoOrder, MapPosition, MapSheet, Parameters, Sounding,
};
use tempfile::TempDir;

fn params() -> Parameters {
    Parameters::new(CellSizes::square(1.0), IhoOrder::Order1a).expect("default parameters")
}

fn cached_sheet(dir: &TempDir) -> CachedSheet {
    CachedSheet::create(
        CacheConfig::new(dir.path()),
        CellCounts::square(50),
        CellSizes::square(1.0),
        params(),
    )
    .expect("cache creation succeeds")
}

/// One sounding at the center of the tile at `(tile_x, 0)`.
fn tile_center_sounding(tile_x: i32, depth: f32) -> Sounding {
    Sounding::new(f64::from(tile_x) * 50.0 + 25.0, 25.0, depth, 0.25, 0.25)
}

#[test]
fn test_eviction_keeps_working_set_bounded() {
    let dir = TempDir::new().expect("tempdir");
    let mut cached = cached_sheet(&dir);

    for tile_x in 0..5 {
        cached
            .add_soundings(&[tile_center_sounding(tile_x, 10.0)], Instant::now())
            .expect("insert succeeds");
    }

    assert!(cached.resident_count() <= 4);
    assert_eq!(cached.known_tiles().count(), 5);

    // The first-touched tile was evicted (flushed to disk, then dropped).
    assert!(cached.tile_status(GridIndex::new(0, 0)).is_none());
    assert!(dir.path().join("tile_0_0.json").exists());
}

#[test]
fn test_evicted_tile_round_trips_through_disk() {
    let dir = TempDir::new().expect("tempdir");
    let mut cached = cached_sheet(&dir);

    // Prime tile (0, 0) with a consistent stack of soundings, then force
    // it out of memory by touching four other tiles.
    let batch = vec![tile_center_sounding(0, 10.0); 20];
    cached
        .add_soundings(&batch, Instant::now())
        .expect("insert succeeds");
    for tile_x in 1..5 {
        cached
            .add_soundings(&[tile_center_sounding(tile_x, 30.0)], Instant::now())
            .expect("insert succeeds");
    }
    assert!(cached.tile_status(GridIndex::new(0, 0)).is_none());

    // Reloading must reproduce exactly what a never-evicted sheet gives for
    // identical input: queue contents and hypotheses survive serialization.
    let mut plain = MapSheet::with_parameters(
        CellCounts::square(50),
        CellSizes::square(1.0),
        params(),
    )
    .expect("valid sheet");
    plain.add_soundings(&batch, Instant::now());

    let from_cache = cached
        .values(GridIndex::new(0, 0))
        .expect("load succeeds")
        .expect("tile exists");
    let from_plain = plain
        .grid_values(GridIndex::new(0, 0))
        .expect("tile exists");

    let slot = 25 * 50 + 25;
    assert!((from_cache[slot].depth - 10.0).abs() < 1e-3);
    assert_eq!(from_cache[slot].depth, from_plain[slot].depth);
    assert_eq!(from_cache[slot].uncertainty, from_plain[slot].uncertainty);
}

#[test]
fn test_reopen_recovers_tile_population() {
    let dir = TempDir::new().expect("tempdir");

    {
        let mut cached = cached_sheet(&dir);
        for tile_x in 0..3 {
            cached
                .add_soundings(&[tile_center_sounding(tile_x, 12.0)], Instant::now())
                .expect("insert succeeds");
        }
        cached.flush_all().expect("flush succeeds");
    }

    let reopened = CachedSheet::open(CacheConfig::new(dir.path())).expect("reopen succeeds");

    assert_eq!(reopened.known_tiles().count(), 3);
    assert_eq!(reopened.resident_count(), 0);
    assert_eq!(reopened.cell_counts_per_grid(), CellCounts::square(50));
    assert_eq!(reopened.total_cell_counts(), CellCounts::new(150, 50));

    let bounds = reopened.grid_bounds().expect("tiles known");
    assert_eq!(bounds.min, MapPosition::new(0.0, 0.0));
    assert_eq!(bounds.max, MapPosition::new(150.0, 50.0));
}

#[test]
fn test_readback_survives_reopen() {
    let dir = TempDir::new().expect("tempdir");
    let expected;

    {
        let mut cached = cached_sheet(&dir);
        cached
            .add_soundings(&vec![tile_center_sounding(0, 10.0); 20], Instant::now())
            .expect("insert succeeds");
        let values = cached
            .values(GridIndex::new(0, 0))
            .expect("read succeeds")
            .expect("tile exists");
        expected = values[25 * 50 + 25];
        cached.flush_all().expect("flush succeeds");
    }

    let mut reopened = CachedSheet::open(CacheConfig::new(dir.path())).expect("reopen succeeds");
    let values = reopened
        .values(GridIndex::new(0, 0))
        .expect("read succeeds")
        .expect("tile exists");
    let value = values[25 * 50 + 25];

    assert_eq!(value.depth, expected.depth);
    assert_eq!(value.uncertainty, expected.uncertainty);
}

#[test]
fn test_mismatched_geometry_is_rejected() {
    let dir = TempDir::new().expect("tempdir");
    let _ = cached_sheet(&dir);

    let result = CachedSheet::create(
        CacheConfig::new(dir.path()),
        CellCounts::square(40),
        CellSizes::square(1.0),
        params(),
    );
    assert!(matches!(result, Err(CacheError::ManifestMismatch(_))));
}

#[test]
fn test_unknown_manifest_version_is_rejected() {
    let dir = TempDir::new().expect("tempdir");
    let _ = cached_sheet(&dir);

    let manifest_path = dir.path().join("sheet.json");
    let mut manifest: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&manifest_path).expect("manifest readable"))
            .expect("manifest parses");
    manifest["version"] = serde_json::json!(99);
    std::fs::write(&manifest_path, manifest.to_string()).expect("manifest writable");

    let result = CachedSheet::open(CacheConfig::new(dir.path()));
    assert!(matches!(
        result,
        Err(CacheError::VersionMismatch { found: 99, .. })
    ));
}

#[test]
fn test_replacement_prefers_clean_read_tiles() {
    let dir = TempDir::new().expect("tempdir");
    let mut cached = cached_sheet(&dir);

    // Four resident tiles, all flushed clean.
    for tile_x in 0..4 {
        cached
            .add_soundings(&[tile_center_sounding(tile_x, 10.0)], Instant::now())
            .expect("insert succeeds");
    }
    cached.flush_all().expect("flush succeeds");

    // Reading tile (0, 0) marks it read (the flush makes it dirty again, so
    // flush once more): a clean, already-read tile is the cheapest victim.
    cached
        .values(GridIndex::new(0, 0))
        .expect("read succeeds")
        .expect("tile exists");
    cached.flush_all().expect("flush succeeds");

    cached
        .add_soundings(&[tile_center_sounding(4, 10.0)], Instant::now())
        .expect("insert succeeds");

    assert!(
        cached.tile_status(GridIndex::new(0, 0)).is_none(),
        "the clean+read tile must be replaced first"
    );
    for tile_x in 1..5 {
        assert!(
            cached.tile_status(GridIndex::new(tile_x, 0)).is_some(),
            "tile ({tile_x}, 0) should stay resident"
        );
    }
}

#[test]
fn test_purge_retains_young_tiles() {
    let dir = TempDir::new().expect("tempdir");
    let mut cached = cached_sheet(&dir);

    for tile_x in 0..3 {
        cached
            .add_soundings(&[tile_center_sounding(tile_x, 10.0)], Instant::now())
            .expect("insert succeeds");
    }

    // Nothing has aged past the (clamped, >= 10 s) expiry.
    let left = cached.purge(false).expect("purge succeeds");
    assert_eq!(left, 3);
    let left = cached.purge(true).expect("purge succeeds");
    assert_eq!(left, 3);
}

#[test]
fn test_estimated_tile_side_scales_with_budget() {
    let small = CacheConfig {
        max_memory: 32 * 1024 * 1024,
        ..CacheConfig::new("unused")
    };
    let large = CacheConfig {
        max_memory: 512 * 1024 * 1024,
        ..CacheConfig::new("unused")
    };

    let small_side = estimate_tile_side(&small, 11);
    let large_side = estimate_tile_side(&large, 11);

    assert_eq!(small_side % 2, 1);
    assert_eq!(large_side % 2, 1);
    assert!(large_side >= small_side);
    assert!(large_side <= large.max_tile_dimension);
}
