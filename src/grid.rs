//! A fixed-size tile of estimation nodes.
//!
//! The tile owns a row-major array of lazily created [`Node`]s. Row 0 lies
//! at the tile origin and rows advance in the +y world direction: node
//! `(col, row)` sits at `origin + (col * size.x, row * size.y)`. This
//! convention is held across all readbacks.
//!
//! Each sounding is spread over the nodes inside its influence radius,
//! derived from the IHO error budget for the survey order and the
//! sounding's own error variances; every receiving node sees the squared
//! distance so it can dilute the observation variance accordingly.

use serde::{Deserialize, Serialize};

use crate::config::{Parameters, CONF_95, CONF_99};
use crate::estimator::node::{InsertOutcome, Node};
use crate::estimator::DepthUncertainty;
use crate::geometry::{CellCounts, CellIndex, CellSizes, MapBounds, MapPosition};
use crate::sounding::Sounding;

/// Accounting for soundings offered to a tile. The insertion gates drop
/// data silently by design; these counters are the only trace.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct IngestStats {
    /// Soundings offered to the tile.
    pub offered: u64,
    /// Soundings whose influence box missed the tile entirely.
    pub outside_grid: u64,
    /// Node-level queue entries accepted.
    pub queued: u64,
    /// Node-level drops from locked nodes.
    pub locked_node_drops: u64,
    /// Node-level drops from the blunder gate.
    pub blunder_drops: u64,
    /// Node-level drops from the capture-radius gate.
    pub capture_drops: u64,
}

/// Influence radius of a sounding: how far from its position it can still
/// contribute to node estimates.
///
/// The IHO budget for the survey order bounds the variance a node may
/// accept (translated to one standard deviation); the radius is where the
/// distance dilution would push the sounding's vertical error past that
/// bound, less the 99% bound on its horizontal error, clamped into
/// `[distance_scale, max_radius]` with `distance_scale` as the final floor.
pub(crate) fn influence_radius(sounding: &Sounding, parameters: &Parameters) -> f64 {
    let depth = f64::from(sounding.depth);
    let max_variance_allowed =
        parameters.iho_fixed + parameters.iho_percent * depth * depth / (CONF_95 * CONF_95);

    let mut ratio = max_variance_allowed / f64::from(sounding.vertical_error);
    if ratio <= 2.0 {
        // Ensure some spreading on the point.
        ratio = 2.0;
    }

    let max_radius = CONF_99 * f64::from(sounding.horizontal_error).sqrt();

    let mut radius = parameters.distance_scale
        * (ratio - 1.0).powf(parameters.inverse_distance_exponent)
        - max_radius;
    if radius < 0.0 {
        radius = parameters.distance_scale;
    }
    if radius > max_radius {
        radius = max_radius;
    }
    if radius < parameters.distance_scale {
        radius = parameters.distance_scale;
    }
    radius
}

/// A fixed-size rectangular tile of nodes with a projected origin.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Grid {
    counts: CellCounts,
    sizes: CellSizes,
    origin: MapPosition,
    /// Row-major node array; nodes are created on first use.
    nodes: Vec<Option<Node>>,
    stats: IngestStats,
}

impl Grid {
    pub fn new(counts: CellCounts, sizes: CellSizes, origin: MapPosition) -> Self {
        Self {
            counts,
            sizes,
            origin,
            nodes: vec![None; counts.len()],
            stats: IngestStats::default(),
        }
    }

    pub fn origin(&self) -> MapPosition {
        self.origin
    }

    pub fn cell_counts(&self) -> CellCounts {
        self.counts
    }

    pub fn cell_sizes(&self) -> CellSizes {
        self.sizes
    }

    pub fn stats(&self) -> IngestStats {
        self.stats
    }

    /// Bounds covered by the tile, `[origin, origin + sizes * counts]`.
    pub fn bounds(&self) -> MapBounds {
        MapBounds::from_points(self.origin, self.origin + self.sizes * self.counts)
    }

    /// Absolute position of the node at `index`.
    pub fn node_position(&self, index: CellIndex) -> MapPosition {
        MapPosition::new(
            self.origin.x + f64::from(index.x) * f64::from(self.sizes.x),
            self.origin.y + f64::from(index.y) * f64::from(self.sizes.y),
        )
    }

    fn slot(&self, index: CellIndex) -> Option<usize> {
        if index.x < 0
            || index.y < 0
            || index.x >= self.counts.x as i32
            || index.y >= self.counts.y as i32
        {
            return None;
        }
        Some(index.y as usize * self.counts.x as usize + index.x as usize)
    }

    /// The node at `index`, if it has been touched.
    pub fn node(&self, index: CellIndex) -> Option<&Node> {
        self.slot(index).and_then(|slot| self.nodes[slot].as_ref())
    }

    /// The node at `index`, created if absent. Returns None only when the
    /// index is outside the tile. Useful for seeding a predicted surface or
    /// nominating hypotheses before data arrives.
    pub fn node_mut(&mut self, index: CellIndex) -> Option<&mut Node> {
        let slot = self.slot(index)?;
        Some(self.nodes[slot].get_or_insert_with(Node::new))
    }

    /// Spread one sounding over the nodes inside its influence radius.
    ///
    /// Returns true if the sounding's influence box overlapped the tile at
    /// all: a hint that a node may have been updated, not a guarantee.
    pub fn insert(&mut self, sounding: &Sounding, parameters: &Parameters) -> bool {
        self.stats.offered += 1;

        let radius = influence_radius(sounding, parameters);
        let size_x = f64::from(self.sizes.x);
        let size_y = f64::from(self.sizes.y);

        // Largest node-index box the sounding can affect.
        let min_x = ((sounding.position.x - radius - self.origin.x) / size_x).floor() as i32;
        let max_x = ((sounding.position.x + radius - self.origin.x) / size_x).floor() as i32;
        let min_y = ((sounding.position.y - radius - self.origin.y) / size_y).floor() as i32;
        let max_y = ((sounding.position.y + radius - self.origin.y) / size_y).floor() as i32;

        if max_x < 0
            || min_x >= self.counts.x as i32
            || max_y < 0
            || min_y >= self.counts.y as i32
        {
            self.stats.outside_grid += 1;
            return false;
        }

        let min_x = min_x.max(0);
        let max_x = max_x.min(self.counts.x as i32 - 1);
        let min_y = min_y.max(0);
        let max_y = max_y.min(self.counts.y as i32 - 1);

        let radius_squared = radius * radius;

        for y in min_y..=max_y {
            for x in min_x..=max_x {
                let index = CellIndex::new(x, y);
                let node_position = self.node_position(index);
                let dx = node_position.x - sounding.position.x;
                let dy = node_position.y - sounding.position.y;
                let distance_squared = dx * dx + dy * dy;
                if distance_squared >= radius_squared {
                    continue;
                }

                let slot = y as usize * self.counts.x as usize + x as usize;
                let node = self.nodes[slot].get_or_insert_with(Node::new);
                match node.insert(distance_squared, sounding, parameters) {
                    InsertOutcome::Queued => self.stats.queued += 1,
                    InsertOutcome::NodeLocked => self.stats.locked_node_drops += 1,
                    InsertOutcome::BlunderRejected => self.stats.blunder_drops += 1,
                    InsertOutcome::BeyondCaptureRadius => self.stats.capture_drops += 1,
                }
            }
        }
        true
    }

    /// Insert a batch; true if any sounding was plausibly used.
    pub fn insert_batch(&mut self, soundings: &[Sounding], parameters: &Parameters) -> bool {
        let mut any = false;
        for sounding in soundings {
            any = self.insert(sounding, parameters) || any;
        }
        any
    }

    /// Row-major readback of `(depth, uncertainty)` for every node position.
    ///
    /// Untouched nodes report the configured no-data pair. Touched nodes
    /// have their pre-filter queues flushed first; this read is
    /// destructive to the queues and cannot be undone.
    pub fn values(&mut self, parameters: &Parameters) -> Vec<DepthUncertainty> {
        self.nodes
            .iter_mut()
            .map(|slot| match slot {
                Some(node) => {
                    node.queue_flush(parameters);
                    node.extract_depth_and_uncertainty(parameters)
                }
                None => DepthUncertainty::new(
                    parameters.nodata_depth.unwrap_or(f32::NAN),
                    parameters.nodata_variance.unwrap_or(f32::NAN),
                ),
            })
            .collect()
    }

    /// Row-major count of hypotheses per node (0 for untouched nodes), a
    /// cheap proxy for how contested the seafloor is.
    pub fn hypothesis_counts(&self) -> Vec<usize> {
        self.nodes
            .iter()
            .map(|slot| slot.as_ref().map_or(0, Node::hypothesis_count))
            .collect()
    }
}
