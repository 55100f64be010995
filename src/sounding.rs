//! Sounding input record.

use serde::{Deserialize, Serialize};

use crate::geometry::MapPosition;

/// One depth observation at a horizontal position.
///
/// The position is in the projected map frame (meters). Depth is positive
/// downward by convention, though the estimator does not enforce the sign.
/// Both error fields are variances (m²), not standard deviations: the
/// vertical error describes the depth measurement, the horizontal error the
/// positioning of the sounding.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Sounding {
    pub position: MapPosition,
    pub depth: f32,
    pub vertical_error: f32,
    pub horizontal_error: f32,
}

impl Sounding {
    pub fn new(x: f64, y: f64, depth: f32, vertical_error: f32, horizontal_error: f32) -> Self {
        Self {
            position: MapPosition::new(x, y),
            depth,
            vertical_error,
            horizontal_error,
        }
    }
}
