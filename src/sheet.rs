//! The map sheet: an open-ended collection of tiles that together form the
//! full survey surface.
//!
//! Tiles share one geometry (cell counts and sizes) and tile the plane with
//! no gaps or overlap: the tile at integer index `i` has origin
//! `sizes * counts * i`. Tiles are created on demand as soundings arrive,
//! so the sheet can grow to any extent without preallocation.

use std::collections::BTreeMap;
use std::time::Instant;

use tracing::{debug, warn};

use crate::config::{ConfigError, IhoOrder, Parameters};
use crate::estimator::DepthUncertainty;
use crate::geometry::{
    ceil_divide, floor_divide, CellCounts, CellSizes, GridIndex, MapBounds, MapOffset, MapPosition,
};
use crate::grid::{influence_radius, Grid};
use crate::sounding::Sounding;

/// Tile indices whose node lattice could lie inside the influence disc of a
/// sounding at `position`.
///
/// The candidate index box spans `floor((p - r) / extent)` to
/// `floor((p + r) / extent)` per axis; a candidate survives only if the
/// point of its node lattice closest to the sounding is strictly within the
/// radius. This keeps tile creation tight: a sounding on a tile corner does
/// not spawn neighbors that hold no node within reach.
pub(crate) fn candidate_tiles(
    position: MapPosition,
    radius: f64,
    extent: MapOffset,
    counts: CellCounts,
    sizes: CellSizes,
) -> Vec<GridIndex> {
    let lo = floor_divide(
        MapPosition::new(position.x - radius, position.y - radius),
        extent,
    );
    let hi = floor_divide(
        MapPosition::new(position.x + radius, position.y + radius),
        extent,
    );

    let mut candidates = Vec::with_capacity(4);
    for y in lo.y..=hi.y {
        for x in lo.x..=hi.x {
            let index = GridIndex::new(x, y);
            let origin = extent * index;
            let lattice_max_x = origin.x + f64::from(sizes.x) * f64::from(counts.x - 1);
            let lattice_max_y = origin.y + f64::from(sizes.y) * f64::from(counts.y - 1);
            let dx = position.x.clamp(origin.x, lattice_max_x) - position.x;
            let dy = position.y.clamp(origin.y, lattice_max_y) - position.y;
            if dx * dx + dy * dy < radius * radius {
                candidates.push(index);
            }
        }
    }
    candidates
}

/// An unbounded tiled surface built incrementally from soundings.
#[derive(Debug)]
pub struct MapSheet {
    /// Cell counts of every tile.
    counts: CellCounts,
    /// Cell sizes of every tile (meters).
    sizes: CellSizes,
    parameters: Parameters,
    grids: BTreeMap<GridIndex, Grid>,
    /// When the last accepted insertion happened.
    last_update_time: Option<Instant>,
}

impl MapSheet {
    /// New sheet with tiles of `counts` cells at `sizes` spacing, tuned for
    /// the given IHO survey order.
    pub fn new(counts: CellCounts, sizes: CellSizes, order: IhoOrder) -> Result<Self, ConfigError> {
        let parameters = Parameters::new(sizes, order)?;
        Self::with_parameters(counts, sizes, parameters)
    }

    /// New sheet with explicitly resolved parameters.
    pub fn with_parameters(
        counts: CellCounts,
        sizes: CellSizes,
        parameters: Parameters,
    ) -> Result<Self, ConfigError> {
        if counts.is_empty() {
            return Err(ConfigError::InvalidCellCounts {
                x: counts.x,
                y: counts.y,
            });
        }
        if !sizes.is_valid() {
            return Err(ConfigError::InvalidCellSizes {
                x: sizes.x,
                y: sizes.y,
            });
        }
        Ok(Self {
            counts,
            sizes,
            parameters,
            grids: BTreeMap::new(),
            last_update_time: None,
        })
    }

    pub fn cell_sizes(&self) -> CellSizes {
        self.sizes
    }

    pub fn cell_counts_per_grid(&self) -> CellCounts {
        self.counts
    }

    pub fn parameters(&self) -> &Parameters {
        &self.parameters
    }

    /// Offset spanned by one tile.
    pub fn tile_extent(&self) -> MapOffset {
        self.sizes * self.counts
    }

    /// Index of the tile containing `position` (floor division by the tile
    /// extent). A position strictly inside a tile maps to that tile.
    pub fn grid_index(&self, position: MapPosition) -> GridIndex {
        floor_divide(position, self.tile_extent())
    }

    /// Timestamp of the most recent insertion that plausibly updated a
    /// node, as supplied by the caller.
    pub fn last_update_time(&self) -> Option<Instant> {
        self.last_update_time
    }

    // ------------------------------------------------------------------
    // Insertion
    // ------------------------------------------------------------------

    /// Integrate a batch of soundings, creating tiles as needed.
    ///
    /// Each sounding is offered to every tile whose node lattice its
    /// influence radius can reach, so data near a tile boundary propagates
    /// into the neighboring tile as well. Returns true, and advances the
    /// update timestamp, only if at least one tile reported the batch as
    /// plausibly used. Soundings with invalid positions are skipped.
    pub fn add_soundings(&mut self, soundings: &[Sounding], timestamp: Instant) -> bool {
        if soundings.is_empty() {
            return false;
        }

        let extent = self.tile_extent();
        let counts = self.counts;
        let sizes = self.sizes;
        let mut any_used = false;
        let mut skipped = 0u64;

        for sounding in soundings {
            if !sounding.position.is_valid() {
                skipped += 1;
                continue;
            }
            let radius = influence_radius(sounding, &self.parameters);
            for index in candidate_tiles(sounding.position, radius, extent, counts, sizes) {
                let grid = self.grids.entry(index).or_insert_with(|| {
                    debug!(%index, "creating tile");
                    Grid::new(counts, sizes, extent * index)
                });
                any_used = grid.insert(sounding, &self.parameters) || any_used;
            }
        }

        if skipped > 0 {
            warn!(skipped, "ignored soundings with invalid positions");
        }
        if any_used {
            self.last_update_time = Some(timestamp);
        }
        any_used
    }

    /// Ensure tiles exist for the whole closed index rectangle spanned by
    /// `bounds` (floor of the minimum corner to ceiling of the maximum),
    /// returning their indices. Useful for preallocating a survey area.
    pub fn get_or_create_grids_in(&mut self, bounds: &MapBounds) -> Vec<GridIndex> {
        let extent = self.tile_extent();
        let counts = self.counts;
        let sizes = self.sizes;
        let min_index = floor_divide(bounds.min, extent);
        let max_index = ceil_divide(bounds.max, extent);

        let mut indices = Vec::new();
        for y in min_index.y..=max_index.y {
            for x in min_index.x..=max_index.x {
                let index = GridIndex::new(x, y);
                self.grids.entry(index).or_insert_with(|| {
                    debug!(%index, "creating tile");
                    Grid::new(counts, sizes, extent * index)
                });
                indices.push(index);
            }
        }
        indices
    }

    // ------------------------------------------------------------------
    // Readback
    // ------------------------------------------------------------------

    /// All existing tiles, in index order.
    pub fn grids(&self) -> impl Iterator<Item = (GridIndex, &Grid)> {
        self.grids.iter().map(|(index, grid)| (*index, grid))
    }

    pub fn grid(&self, index: GridIndex) -> Option<&Grid> {
        self.grids.get(&index)
    }

    pub fn grid_mut(&mut self, index: GridIndex) -> Option<&mut Grid> {
        self.grids.get_mut(&index)
    }

    pub fn grid_count(&self) -> usize {
        self.grids.len()
    }

    /// Row-major readback of one tile; None if the tile does not exist.
    /// Destructive to the tile's node queues, like [`Grid::values`].
    pub fn grid_values(&mut self, index: GridIndex) -> Option<Vec<DepthUncertainty>> {
        let parameters = &self.parameters;
        self.grids.get_mut(&index).map(|grid| grid.values(parameters))
    }

    /// Size in cells of the axis-aligned index rectangle covering every
    /// existing tile; zero when the sheet is empty.
    pub fn total_cell_counts(&self) -> CellCounts {
        let mut indices = self.grids.keys();
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

    /// Union of the bounds of every existing tile; None when empty.
    pub fn grid_bounds(&self) -> Option<MapBounds> {
        let mut grids = self.grids.values();
        let mut bounds = grids.next()?.bounds();
        for grid in grids {
            bounds.expand_bounds(&grid.bounds());
        }
        Some(bounds)
    }
}
