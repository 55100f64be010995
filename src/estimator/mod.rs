//! Per-node depth estimation: multi-hypothesis Bayesian tracking behind a
//! median pre-filter.
//!
//! - [`hypothesis`]: a single depth track (Kalman update + Bayes-factor
//!   model monitoring)
//! - [`node`]: one grid point (input gates, median queue, hypothesis
//!   management, readback)

pub mod hypothesis;
pub mod node;

pub use hypothesis::{Hypothesis, ModelCheck, UpdateOutcome};
pub use node::{InsertOutcome, Node, PredictedDepth};

use serde::{Deserialize, Serialize};

/// Sentinel for "no information available" in f32 slots that cannot use NaN
/// (NaN already means "locked" in the predicted-depth convention).
pub const INVALID_DATA: f32 = f32::MAX;

/// A readback pair: best depth estimate and its uncertainty interval.
///
/// Defaults to NaN in both slots, the "no data" report.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct DepthUncertainty {
    pub depth: f32,
    pub uncertainty: f32,
}

impl DepthUncertainty {
    pub fn new(depth: f32, uncertainty: f32) -> Self {
        Self { depth, uncertainty }
    }

    /// Whether either slot carries no value.
    pub fn is_no_data(&self) -> bool {
        self.depth.is_nan() || self.uncertainty.is_nan()
    }
}

impl Default for DepthUncertainty {
    fn default() -> Self {
        Self {
            depth: f32::NAN,
            uncertainty: f32::NAN,
        }
    }
}
