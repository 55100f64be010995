//! bathycube: bathymetric surface estimation from streams of sonar
//! soundings.
//!
//! Builds a regularly spaced grid of depth nodes from individual soundings,
//! each carrying a position, a depth, and horizontal/vertical error
//! variances. Every node reports a best depth estimate with an associated
//! uncertainty, maintained incrementally as soundings arrive.
//!
//! ## Architecture
//!
//! - **Hypothesis**: one Bayesian depth track per competing seafloor model,
//!   with Bayes-factor model monitoring and automatic intervention
//! - **Node**: one grid point with input gates, a median pre-filter with outlier
//!   rejection, and the set of competing hypotheses
//! - **Grid**: a fixed-size tile of nodes; spreads each sounding over its
//!   influence radius derived from the IHO survey-order error budget
//! - **MapSheet**: an auto-growing collection of tiles covering unbounded
//!   survey extents without preallocation
//! - **CachedSheet**: the same surface with tiles paged through a bounded
//!   in-memory working set, backed by a directory of serialized tiles
//!
//! Soundings are expected in a projected planar coordinate frame (meters)
//! with error variances attached; projection, format ingestion, tide
//! correction, and raster export are the caller's concern.
//!
//! The estimation core is single-threaded and synchronous: operations on a
//! sheet run to completion, and aborting between calls leaves every
//! already-integrated sounding fully applied. Readback flushes the node
//! pre-filter queues and is therefore destructive; two readbacks with no
//! intervening insertion differ only by the first one's flush.

pub mod cache;
pub mod config;
pub mod estimator;
pub mod geometry;
pub mod grid;
pub mod sheet;
pub mod sounding;

// Re-export the working vocabulary.
pub use cache::{CacheConfig, CacheError, CachedSheet, TileStatus};
pub use config::{ConfigError, IhoOrder, Parameters, Tuning, CONF_95, CONF_99};
pub use estimator::{
    DepthUncertainty, Hypothesis, InsertOutcome, ModelCheck, Node, PredictedDepth, UpdateOutcome,
    INVALID_DATA,
};
pub use geometry::{
    CellCounts, CellIndex, CellSizes, GridIndex, MapBounds, MapOffset, MapPosition,
};
pub use grid::{Grid, IngestStats};
pub use sheet::MapSheet;
pub use sounding::Sounding;
