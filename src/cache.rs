//! Disk-backed tile cache: a map sheet whose tiles page through a bounded
//! in-memory working set, backed by a directory of serialized tile files.
//!
//! ## Layout
//!
//! The backing directory holds one `tile_<x>_<y>.json` file per tile plus a
//! `sheet.json` manifest recording the format version, tile geometry, and
//! parameters, so a survey can be re-opened across runs.
//!
//! ## Replacement policy
//!
//! Each resident tile carries a last-access stamp and two status bits:
//! `read` (a readback produced a result since the last modification) and
//! `clean` (the in-memory contents agree with the on-disk copy). When the
//! working set is full, the tile with the lowest (retention weight, stamp)
//! pair is evicted: clean-and-read tiles first, dirty-and-unread last, so
//! replacement prefers tiles that need no flush. A periodic purge evicts
//! tiles in strict LRU order once their last-access age exceeds the expiry
//! timeout, always retaining the most recently used tile unless asked to
//! flush everything. Dirty tiles are always written out before eviction.

use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, File};
use std::io::{BufReader, BufWriter};
use std::path::PathBuf;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::{ConfigError, Parameters};
use crate::estimator::{DepthUncertainty, Hypothesis, Node};
use crate::geometry::{floor_divide, CellCounts, CellSizes, GridIndex, MapBounds, MapPosition};
use crate::grid::{influence_radius, Grid};
use crate::sheet::candidate_tiles;
use crate::sounding::Sounding;

/// On-disk tile and manifest format version.
pub const TILE_FORMAT_VERSION: u32 = 1;

/// Bounds and defaults for the cache configuration.
pub mod limits {
    use std::time::Duration;

    /// Smallest memory budget worth talking about.
    pub const MIN_MEMORY: usize = 20 * 1024 * 1024;
    pub const DEFAULT_MAX_MEMORY: usize = 128 * 1024 * 1024;

    /// Exaggeration factor for the expected hypotheses per node.
    pub const MIN_HYPOTHESIS_HINT: f32 = 1.0;
    pub const MAX_HYPOTHESIS_HINT: f32 = 5.0;
    pub const DEFAULT_HYPOTHESIS_HINT: f32 = 1.25;

    /// Probability of a node being occupied.
    pub const MIN_PROB_USE: f32 = 0.1;
    pub const MAX_PROB_USE: f32 = 1.0;
    pub const DEFAULT_PROB_USE: f32 = 0.8;

    /// Tile side length in nodes.
    pub const MIN_TILE_DIMENSION: u32 = 255;
    pub const MAX_TILE_DIMENSION: u32 = 5001;
    pub const DEFAULT_TILE_DIMENSION: u32 = 511;

    /// Last-access age after which a tile may be purged.
    pub const MIN_EXPIRY: Duration = Duration::from_secs(10);
    pub const MAX_EXPIRY: Duration = Duration::from_secs(3600);
    pub const DEFAULT_EXPIRY: Duration = Duration::from_secs(600);

    /// Worst-case working set: four tiles covers crossing a tile corner.
    pub const DEFAULT_MAX_RESIDENT: usize = 4;
}

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("tile format version mismatch: file has v{found}, expected v{expected}")]
    VersionMismatch { found: u32, expected: u32 },

    #[error("sheet manifest does not match: {0}")]
    ManifestMismatch(String),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Cache tuning. Values outside the documented bounds are clamped (with a
/// warning) when the cache is opened.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Directory holding the manifest and tile files.
    pub directory: PathBuf,
    /// Maximum number of tiles held in memory.
    pub max_resident: usize,
    /// Last-access age after which a purge may evict a tile.
    pub tile_expiry: Duration,
    /// Memory budget shared by the resident tiles.
    pub max_memory: usize,
    /// Expected hypotheses per node, for tile sizing.
    pub hypothesis_hint: f32,
    /// Probability of a node being occupied, for tile sizing.
    pub prob_use: f32,
    /// Hard cap on the tile side length in nodes.
    pub max_tile_dimension: u32,
}

impl CacheConfig {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
            max_resident: limits::DEFAULT_MAX_RESIDENT,
            tile_expiry: limits::DEFAULT_EXPIRY,
            max_memory: limits::DEFAULT_MAX_MEMORY,
            hypothesis_hint: limits::DEFAULT_HYPOTHESIS_HINT,
            prob_use: limits::DEFAULT_PROB_USE,
            max_tile_dimension: limits::DEFAULT_TILE_DIMENSION,
        }
    }

    fn clamped(mut self) -> Self {
        let original = (
            self.max_memory,
            self.hypothesis_hint,
            self.prob_use,
            self.max_tile_dimension,
            self.tile_expiry,
        );
        self.max_memory = self.max_memory.max(limits::MIN_MEMORY);
        self.hypothesis_hint = self
            .hypothesis_hint
            .clamp(limits::MIN_HYPOTHESIS_HINT, limits::MAX_HYPOTHESIS_HINT);
        self.prob_use = self.prob_use.clamp(limits::MIN_PROB_USE, limits::MAX_PROB_USE);
        self.max_tile_dimension = self
            .max_tile_dimension
            .clamp(limits::MIN_TILE_DIMENSION, limits::MAX_TILE_DIMENSION);
        self.tile_expiry = self
            .tile_expiry
            .clamp(limits::MIN_EXPIRY, limits::MAX_EXPIRY);
        self.max_resident = self.max_resident.max(1);

        if original
            != (
                self.max_memory,
                self.hypothesis_hint,
                self.prob_use,
                self.max_tile_dimension,
                self.tile_expiry,
            )
        {
            warn!("cache configuration values clamped into their legal ranges");
        }
        self
    }
}

/// Estimate the largest square tile side (in nodes) such that the
/// configured number of resident tiles fits the memory budget, given the
/// expected per-node cost. The side is forced odd and capped by
/// `max_tile_dimension`.
pub fn estimate_tile_side(config: &CacheConfig, median_length: usize) -> u32 {
    let per_node = std::mem::size_of::<Node>()
        + median_length * std::mem::size_of::<(f32, f32)>()
        + (config.hypothesis_hint * std::mem::size_of::<Hypothesis>() as f32) as usize;
    let expected_per_node = per_node as f64 * f64::from(config.prob_use);

    let memory_per_tile = config.max_memory / config.max_resident.max(1);
    let mut side = (memory_per_tile as f64 / expected_per_node).sqrt().floor() as u32;

    if side >= config.max_tile_dimension {
        side = config.max_tile_dimension;
    }
    if side % 2 == 0 {
        side += 1;
    }
    side.max(3)
}

/// Per-tile cache status bits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TileStatus {
    /// A readback produced a result from this tile since its last
    /// modification.
    pub read: bool,
    /// In-memory contents agree with the on-disk copy.
    pub clean: bool,
}

impl TileStatus {
    /// How much the cache wants to keep this tile: lower evicts first.
    /// Dirty tiles weigh heavier than clean ones so replacement avoids
    /// flushes where it can; already-read tiles go before unread ones.
    fn retention_weight(self) -> u8 {
        u8::from(!self.read) + 2 * u8::from(!self.clean)
    }
}

struct TileEntry {
    grid: Grid,
    stamp: Instant,
    status: TileStatus,
}

#[derive(Serialize, Deserialize)]
struct TileFile {
    version: u32,
    written_at: DateTime<Utc>,
    index: GridIndex,
    grid: Grid,
}

#[derive(Serialize, Deserialize)]
struct SheetManifest {
    version: u32,
    written_at: DateTime<Utc>,
    counts: CellCounts,
    sizes: CellSizes,
    parameters: Parameters,
}

/// A tiled surface whose tiles page through a bounded in-memory working
/// set, with the full tile population on disk.
pub struct CachedSheet {
    config: CacheConfig,
    counts: CellCounts,
    sizes: CellSizes,
    parameters: Parameters,
    resident: BTreeMap<GridIndex, TileEntry>,
    /// Every tile that exists, resident or not.
    known: BTreeSet<GridIndex>,
    last_update_time: Option<Instant>,
}

impl CachedSheet {
    /// Create (or re-attach to) a cached sheet in the configured directory.
    ///
    /// If a manifest already exists its geometry must match; otherwise a
    /// fresh manifest is written. Existing tile files are registered but
    /// not loaded.
    pub fn create(
        config: CacheConfig,
        counts: CellCounts,
        sizes: CellSizes,
        parameters: Parameters,
    ) -> Result<Self, CacheError> {
        if counts.is_empty() {
            return Err(ConfigError::InvalidCellCounts {
                x: counts.x,
                y: counts.y,
            }
            .into());
        }
        let config = config.clamped();
        fs::create_dir_all(&config.directory)?;

        let manifest_path = config.directory.join("sheet.json");
        if manifest_path.exists() {
            let manifest = read_manifest(&manifest_path)?;
            if manifest.counts != counts || manifest.sizes != sizes {
                return Err(CacheError::ManifestMismatch(format!(
                    "directory holds {}x{} tiles at {}x{} m, requested {}x{} at {}x{} m",
                    manifest.counts.x,
                    manifest.counts.y,
                    manifest.sizes.x,
                    manifest.sizes.y,
                    counts.x,
                    counts.y,
                    sizes.x,
                    sizes.y,
                )));
            }
        } else {
            write_manifest(&manifest_path, counts, sizes, &parameters)?;
        }

        let known = scan_tiles(&config.directory)?;
        debug!(tiles = known.len(), "attached tile cache");

        Ok(Self {
            config,
            counts,
            sizes,
            parameters,
            resident: BTreeMap::new(),
            known,
            last_update_time: None,
        })
    }

    /// Re-open an existing cached sheet, taking geometry and parameters
    /// from its manifest.
    pub fn open(config: CacheConfig) -> Result<Self, CacheError> {
        let config = config.clamped();
        let manifest = read_manifest(&config.directory.join("sheet.json"))?;
        let known = scan_tiles(&config.directory)?;
        debug!(tiles = known.len(), "re-opened tile cache");

        Ok(Self {
            config,
            counts: manifest.counts,
            sizes: manifest.sizes,
            parameters: manifest.parameters,
            resident: BTreeMap::new(),
            known,
            last_update_time: None,
        })
    }

    pub fn cell_counts_per_grid(&self) -> CellCounts {
        self.counts
    }

    pub fn cell_sizes(&self) -> CellSizes {
        self.sizes
    }

    pub fn parameters(&self) -> &Parameters {
        &self.parameters
    }

    pub fn last_update_time(&self) -> Option<Instant> {
        self.last_update_time
    }

    /// Tiles currently held in memory.
    pub fn resident_count(&self) -> usize {
        self.resident.len()
    }

    /// Every tile that exists, resident or evicted, in index order.
    pub fn known_tiles(&self) -> impl Iterator<Item = GridIndex> + '_ {
        self.known.iter().copied()
    }

    /// Cache status of a resident tile; None if the tile is not in memory.
    pub fn tile_status(&self, index: GridIndex) -> Option<TileStatus> {
        self.resident.get(&index).map(|entry| entry.status)
    }

    pub fn tile_extent(&self) -> crate::geometry::MapOffset {
        self.sizes * self.counts
    }

    pub fn grid_index(&self, position: MapPosition) -> GridIndex {
        floor_divide(position, self.tile_extent())
    }

    /// Size in cells of the index rectangle covering every known tile.
    pub fn total_cell_counts(&self) -> CellCounts {
        let mut indices = self.known.iter();
        let Some(first) = indices.next() else {
            return CellCounts::new(0, 0);
        };
        let (mut min, mut max) = (*first, *first);
        for index in indices {
            min.x = min.x.min(index.x);
            min.y = min.y.min(index.y);
            max.x = max.x.max(index.x);
            max.y = max.y.max(index.y);
        }
        CellCounts::new(
            (max.x - min.x + 1) as u32 * self.counts.x,
            (max.y - min.y + 1) as u32 * self.counts.y,
        )
    }

    /// Union of the bounds of every known tile (tile bounds are pure
    /// geometry, so evicted tiles need not be loaded).
    pub fn grid_bounds(&self) -> Option<MapBounds> {
        let extent = self.tile_extent();
        let mut indices = self.known.iter();
        let first = indices.next()?;
        let origin = extent * *first;
        let mut bounds = MapBounds::from_points(origin, origin + extent);
        for index in indices {
            let origin = extent * *index;
            bounds.expand(origin);
            bounds.expand(origin + extent);
        }
        Some(bounds)
    }

    // ------------------------------------------------------------------
    // Insertion and readback
    // ------------------------------------------------------------------

    /// Integrate a batch of soundings, paging tiles in and out as needed.
    pub fn add_soundings(
        &mut self,
        soundings: &[Sounding],
        timestamp: Instant,
    ) -> Result<bool, CacheError> {
        if soundings.is_empty() {
            return Ok(false);
        }

        let extent = self.tile_extent();
        let mut any_used = false;

        for sounding in soundings {
            if !sounding.position.is_valid() {
                continue;
            }
            let radius = influence_radius(sounding, &self.parameters);
            for index in
                candidate_tiles(sounding.position, radius, extent, self.counts, self.sizes)
            {
                self.ensure_resident(index)?;
                let Some(entry) = self.resident.get_mut(&index) else {
                    continue;
                };
                if entry.grid.insert(sounding, &self.parameters) {
                    any_used = true;
                }
                entry.stamp = Instant::now();
                entry.status = TileStatus {
                    read: false,
                    clean: false,
                };
            }
        }

        if any_used {
            self.last_update_time = Some(timestamp);
        }
        Ok(any_used)
    }

    /// Row-major readback of one tile, loading it if necessary.
    ///
    /// Flushing the node queues modifies the tile, so after this call the
    /// tile is marked read but dirty. Returns None for a tile that has
    /// never existed.
    pub fn values(&mut self, index: GridIndex) -> Result<Option<Vec<DepthUncertainty>>, CacheError> {
        if !self.known.contains(&index) {
            return Ok(None);
        }
        self.ensure_resident(index)?;
        let Some(entry) = self.resident.get_mut(&index) else {
            return Ok(None);
        };
        let values = entry.grid.values(&self.parameters);
        entry.stamp = Instant::now();
        entry.status = TileStatus {
            read: true,
            clean: false,
        };
        Ok(Some(values))
    }

    /// Write every dirty resident tile to disk, leaving all tiles resident.
    pub fn flush_all(&mut self) -> Result<(), CacheError> {
        for (index, entry) in &mut self.resident {
            if !entry.status.clean {
                write_tile(&self.config.directory, *index, &entry.grid)?;
                entry.status.clean = true;
            }
        }
        Ok(())
    }

    /// Evict tiles whose last-access age exceeds the expiry timeout, in
    /// strict LRU order, flushing dirty ones first. The most recently used
    /// tile is retained unless `flush_all` is set. Returns the number of
    /// tiles left resident.
    pub fn purge(&mut self, flush_all: bool) -> Result<usize, CacheError> {
        if self.resident.len() <= usize::from(!flush_all) {
            return Ok(self.resident.len());
        }

        let now = Instant::now();
        let mut by_age: Vec<(GridIndex, Instant)> = self
            .resident
            .iter()
            .map(|(index, entry)| (*index, entry.stamp))
            .collect();
        // Most recently used first; strict LRU, no status weighting, so the
        // user-facing timeout is honored exactly.
        by_age.sort_by(|a, b| b.1.cmp(&a.1));

        let keep = usize::from(!flush_all);
        for &(index, stamp) in by_age.iter().skip(keep).rev() {
            if now.duration_since(stamp) >= self.config.tile_expiry {
                self.evict(index)?;
            }
        }
        Ok(self.resident.len())
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    /// Make the tile at `index` resident, loading it from disk or creating
    /// it fresh, evicting the least valuable tiles if the working set is
    /// full.
    fn ensure_resident(&mut self, index: GridIndex) -> Result<(), CacheError> {
        if self.resident.contains_key(&index) {
            return Ok(());
        }

        while self.resident.len() >= self.config.max_resident && self.resident.len() > 1 {
            self.evict_preferred_victim()?;
        }

        let (grid, clean) = match self.load_tile(index)? {
            Some(grid) => {
                debug!(%index, "loaded tile from backing store");
                (grid, true)
            }
            None => {
                debug!(%index, "creating tile");
                let origin = self.tile_extent() * index;
                (Grid::new(self.counts, self.sizes, origin), false)
            }
        };

        self.resident.insert(
            index,
            TileEntry {
                grid,
                stamp: Instant::now(),
                status: TileStatus { read: false, clean },
            },
        );
        self.known.insert(index);
        Ok(())
    }

    /// Evict the tile with the lowest (retention weight, stamp): clean and
    /// already-read tiles go first, dirty unread tiles only as a last
    /// resort, oldest first within a class.
    fn evict_preferred_victim(&mut self) -> Result<(), CacheError> {
        let victim = self
            .resident
            .iter()
            .min_by_key(|(_, entry)| (entry.status.retention_weight(), entry.stamp))
            .map(|(index, _)| *index);

        match victim {
            Some(index) => self.evict(index),
            None => Ok(()),
        }
    }

    /// Flush (if dirty) and drop one resident tile. Only clean tiles are
    /// dropped without writing.
    fn evict(&mut self, index: GridIndex) -> Result<(), CacheError> {
        if let Some(entry) = self.resident.get_mut(&index) {
            if !entry.status.clean {
                write_tile(&self.config.directory, index, &entry.grid)?;
                entry.status.clean = true;
            }
            debug!(%index, "evicting tile");
            self.resident.remove(&index);
        }
        Ok(())
    }

    fn load_tile(&self, index: GridIndex) -> Result<Option<Grid>, CacheError> {
        let path = tile_path(&self.config.directory, index);
        if !path.exists() {
            return Ok(None);
        }
        let file: TileFile = serde_json::from_reader(BufReader::new(File::open(path)?))?;
        if file.version != TILE_FORMAT_VERSION {
            return Err(CacheError::VersionMismatch {
                found: file.version,
                expected: TILE_FORMAT_VERSION,
            });
        }
        if file.grid.cell_counts() != self.counts {
            return Err(CacheError::ManifestMismatch(format!(
                "tile {} has {}x{} cells, sheet expects {}x{}",
                index,
                file.grid.cell_counts().x,
                file.grid.cell_counts().y,
                self.counts.x,
                self.counts.y,
            )));
        }
        Ok(Some(file.grid))
    }
}

fn tile_path(directory: &std::path::Path, index: GridIndex) -> PathBuf {
    directory.join(format!("tile_{}_{}.json", index.x, index.y))
}

fn write_tile(
    directory: &std::path::Path,
    index: GridIndex,
    grid: &Grid,
) -> Result<(), CacheError> {
    let file = TileFile {
        version: TILE_FORMAT_VERSION,
        written_at: Utc::now(),
        index,
        grid: grid.clone(),
    };
    let path = tile_path(directory, index);
    serde_json::to_writer(BufWriter::new(File::create(path)?), &file)?;
    Ok(())
}

fn read_manifest(path: &std::path::Path) -> Result<SheetManifest, CacheError> {
    let manifest: SheetManifest = serde_json::from_reader(BufReader::new(File::open(path)?))?;
    if manifest.version != TILE_FORMAT_VERSION {
        return Err(CacheError::VersionMismatch {
            found: manifest.version,
            expected: TILE_FORMAT_VERSION,
        });
    }
    Ok(manifest)
}

fn write_manifest(
    path: &std::path::Path,
    counts: CellCounts,
    sizes: CellSizes,
    parameters: &Parameters,
) -> Result<(), CacheError> {
    let manifest = SheetManifest {
        version: TILE_FORMAT_VERSION,
        written_at: Utc::now(),
        counts,
        sizes,
        parameters: parameters.clone(),
    };
    serde_json::to_writer_pretty(BufWriter::new(File::create(path)?), &manifest)?;
    Ok(())
}

/// Parse tile indices out of the backing directory's file names.
fn scan_tiles(directory: &std::path::Path) -> Result<BTreeSet<GridIndex>, CacheError> {
    let mut known = BTreeSet::new();
    for entry in fs::read_dir(directory)? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        let Some(body) = name.strip_prefix("tile_").and_then(|n| n.strip_suffix(".json")) else {
            continue;
        };
        let Some((x, y)) = body.split_once('_') else { continue };
        if let (Ok(x), Ok(y)) = (x.parse::<i32>(), y.parse::<i32>()) {
            known.insert(GridIndex::new(x, y));
        }
    }
    Ok(known)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_estimate_tile_side_is_odd_and_clamped() {
        let mut config = CacheConfig::new("unused");
        let side = estimate_tile_side(&config, 11);
        assert_eq!(side % 2, 1, "tile side must be odd");
        assert!(side >= 3);
        assert!(side <= config.max_tile_dimension);

        // A huge budget hits the dimension cap.
        config.max_memory = usize::MAX / 1024;
        assert_eq!(
            estimate_tile_side(&config, 11),
            config.max_tile_dimension
        );

        // More memory never shrinks the tile.
        let small = CacheConfig {
            max_memory: limits::MIN_MEMORY,
            ..CacheConfig::new("unused")
        };
        let large = CacheConfig {
            max_memory: limits::MIN_MEMORY * 4,
            ..CacheConfig::new("unused")
        };
        assert!(estimate_tile_side(&large, 11) >= estimate_tile_side(&small, 11));
    }

    #[test]
    fn test_retention_weight_ordering() {
        let clean_read = TileStatus { read: true, clean: true };
        let clean_unread = TileStatus { read: false, clean: true };
        let dirty_read = TileStatus { read: true, clean: false };
        let dirty_unread = TileStatus { read: false, clean: false };

        // Replacement order: clean+read first, dirty+unread as the last
        // resort.
        assert!(clean_read.retention_weight() < clean_unread.retention_weight());
        assert!(clean_unread.retention_weight() < dirty_read.retention_weight());
        assert!(dirty_read.retention_weight() < dirty_unread.retention_weight());
    }

    #[test]
    fn test_config_clamping() {
        let config = CacheConfig {
            max_memory: 1,
            hypothesis_hint: 100.0,
            prob_use: 0.0,
            max_tile_dimension: 10,
            tile_expiry: Duration::from_secs(1),
            max_resident: 0,
            ..CacheConfig::new("unused")
        }
        .clamped();

        assert_eq!(config.max_memory, limits::MIN_MEMORY);
        assert!((config.hypothesis_hint - limits::MAX_HYPOTHESIS_HINT).abs() < 1e-6);
        assert!((config.prob_use - limits::MIN_PROB_USE).abs() < 1e-6);
        assert_eq!(config.max_tile_dimension, limits::MIN_TILE_DIMENSION);
        assert_eq!(config.tile_expiry, limits::MIN_EXPIRY);
        assert_eq!(config.max_resident, 1);
    }
}
