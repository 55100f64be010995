//! Planar map geometry: positions, offsets, cell/tile sizes and counts,
//! integer indices, and axis-aligned bounds.
//!
//! All coordinates live in a single projected metric frame (meters),
//! established externally. Positions and offsets are distinct types with
//! distinct arithmetic: a position plus an offset is a position, the
//! difference of two positions is an offset, and sizes multiplied by counts
//! give the offset spanned by a tile. Integer indices address cells within a
//! tile (`CellIndex`) and tiles within a sheet (`GridIndex`).

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::ops::{Add, AddAssign, Mul, Neg, Sub};

// ============================================================================
// Positions and Offsets
// ============================================================================

/// Absolute position in the projected map frame (meters).
///
/// A position with a NaN component is invalid. Equality and ordering are
/// only defined between valid positions: `==` requires both components
/// finite and equal, `<` is strict componentwise.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct MapPosition {
    pub x: f64,
    pub y: f64,
}

impl MapPosition {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    /// Both components finite.
    pub fn is_valid(&self) -> bool {
        self.x.is_finite() && self.y.is_finite()
    }

    /// Componentwise minimum; an invalid operand yields the other.
    pub fn component_min(self, other: Self) -> Self {
        if !self.is_valid() {
            return other;
        }
        if !other.is_valid() {
            return self;
        }
        Self::new(self.x.min(other.x), self.y.min(other.y))
    }

    /// Componentwise maximum; an invalid operand yields the other.
    pub fn component_max(self, other: Self) -> Self {
        if !self.is_valid() {
            return other;
        }
        if !other.is_valid() {
            return self;
        }
        Self::new(self.x.max(other.x), self.y.max(other.y))
    }
}

impl PartialEq for MapPosition {
    fn eq(&self, other: &Self) -> bool {
        self.is_valid() && other.is_valid() && self.x == other.x && self.y == other.y
    }
}

impl PartialOrd for MapPosition {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        if !self.is_valid() || !other.is_valid() {
            return None;
        }
        if self == other {
            Some(Ordering::Equal)
        } else if self.x < other.x && self.y < other.y {
            Some(Ordering::Less)
        } else if self.x > other.x && self.y > other.y {
            Some(Ordering::Greater)
        } else {
            None
        }
    }
}

impl fmt::Display for MapPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "x: {} y: {}", self.x, self.y)
    }
}

/// Vector difference between two map positions (meters).
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct MapOffset {
    pub x: f64,
    pub y: f64,
}

impl MapOffset {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

impl Neg for MapOffset {
    type Output = MapOffset;

    fn neg(self) -> MapOffset {
        MapOffset::new(-self.x, -self.y)
    }
}

impl Add<MapOffset> for MapPosition {
    type Output = MapPosition;

    fn add(self, rhs: MapOffset) -> MapPosition {
        MapPosition::new(self.x + rhs.x, self.y + rhs.y)
    }
}

impl AddAssign<MapOffset> for MapPosition {
    fn add_assign(&mut self, rhs: MapOffset) {
        self.x += rhs.x;
        self.y += rhs.y;
    }
}

impl Sub<MapOffset> for MapPosition {
    type Output = MapPosition;

    fn sub(self, rhs: MapOffset) -> MapPosition {
        self + (-rhs)
    }
}

impl Sub<MapPosition> for MapPosition {
    type Output = MapOffset;

    fn sub(self, rhs: MapPosition) -> MapOffset {
        MapOffset::new(self.x - rhs.x, self.y - rhs.y)
    }
}

// ============================================================================
// Sizes and Counts
// ============================================================================

/// Node spacing within a tile (meters). Must be positive in both axes.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CellSizes {
    pub x: f32,
    pub y: f32,
}

impl CellSizes {
    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }

    /// Square cells of side `n`.
    pub fn square(n: f32) -> Self {
        Self { x: n, y: n }
    }

    pub fn is_valid(&self) -> bool {
        self.x > 0.0 && self.y > 0.0
    }
}

/// Tile dimensions in nodes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CellCounts {
    pub x: u32,
    pub y: u32,
}

impl CellCounts {
    pub fn new(x: u32, y: u32) -> Self {
        Self { x, y }
    }

    pub fn square(n: u32) -> Self {
        Self { x: n, y: n }
    }

    /// Total number of nodes covered.
    pub fn len(&self) -> usize {
        self.x as usize * self.y as usize
    }

    pub fn is_empty(&self) -> bool {
        self.x == 0 || self.y == 0
    }
}

/// Offset spanned by a tile of `counts` cells at `sizes` spacing.
impl Mul<CellCounts> for CellSizes {
    type Output = MapOffset;

    fn mul(self, counts: CellCounts) -> MapOffset {
        MapOffset::new(
            f64::from(self.x) * f64::from(counts.x),
            f64::from(self.y) * f64::from(counts.y),
        )
    }
}

// ============================================================================
// Indices
// ============================================================================

/// Index of a node within a tile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CellIndex {
    pub x: i32,
    pub y: i32,
}

impl CellIndex {
    pub fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }
}

/// Index of a tile within a sheet. Tile `(0, 0)` has its origin at the map
/// origin; indices may be negative.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct GridIndex {
    pub x: i32,
    pub y: i32,
}

impl GridIndex {
    pub fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }
}

impl fmt::Display for GridIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.x, self.y)
    }
}

/// Origin of the tile at `index`, given the offset one tile spans.
impl Mul<GridIndex> for MapOffset {
    type Output = MapPosition;

    fn mul(self, index: GridIndex) -> MapPosition {
        MapPosition::new(self.x * f64::from(index.x), self.y * f64::from(index.y))
    }
}

/// Tile index containing `position`, by floor division of each component by
/// the tile extent.
pub fn floor_divide(position: MapPosition, extent: MapOffset) -> GridIndex {
    GridIndex::new(
        (position.x / extent.x).floor() as i32,
        (position.y / extent.y).floor() as i32,
    )
}

/// Ceiling-division counterpart of [`floor_divide`].
pub fn ceil_divide(position: MapPosition, extent: MapOffset) -> GridIndex {
    GridIndex::new(
        (position.x / extent.x).ceil() as i32,
        (position.y / extent.y).ceil() as i32,
    )
}

// ============================================================================
// Bounds
// ============================================================================

/// Axis-aligned rectangle in the map frame. Valid when both corners are
/// valid and `min ≤ max` componentwise.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MapBounds {
    pub min: MapPosition,
    pub max: MapPosition,
}

impl MapBounds {
    /// Degenerate bounds covering a single point.
    pub fn from_point(p: MapPosition) -> Self {
        Self { min: p, max: p }
    }

    /// Smallest bounds covering both points.
    pub fn from_points(a: MapPosition, b: MapPosition) -> Self {
        let mut bounds = Self::from_point(a);
        bounds.expand(b);
        bounds
    }

    pub fn is_valid(&self) -> bool {
        self.min.is_valid()
            && self.max.is_valid()
            && self.min.x <= self.max.x
            && self.min.y <= self.max.y
    }

    /// Grow the bounds to cover `p`. Growth is monotonic; expanding invalid
    /// bounds by a valid point resets them to that point.
    pub fn expand(&mut self, p: MapPosition) -> &mut Self {
        if self.is_valid() {
            self.min = self.min.component_min(p);
            self.max = self.max.component_max(p);
        } else {
            self.min = p;
            self.max = p;
        }
        self
    }

    /// Grow the bounds to cover `other` entirely.
    pub fn expand_bounds(&mut self, other: &MapBounds) -> &mut Self {
        self.expand(other.min).expand(other.max)
    }

    /// Whether `p` lies inside the bounds, edges included.
    pub fn contains(&self, p: MapPosition) -> bool {
        self.is_valid()
            && p.is_valid()
            && p.x >= self.min.x
            && p.y >= self.min.y
            && p.x <= self.max.x
            && p.y <= self.max.y
    }

    /// Diagonal extent of the bounds.
    pub fn range(&self) -> MapOffset {
        self.max - self.min
    }
}
