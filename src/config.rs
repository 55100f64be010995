//! Algorithm parameters: IHO survey-order error budgets, distance-variance
//! model, pre-filter and monitor tuning.
//!
//! A [`Parameters`] value is built once per sheet and shared read-only by
//! every tile and node; there is no global parameter state. Defaults match
//! the standard hydrographic tuning; a [`Tuning`] overlay deserialized from
//! TOML can override individual values, with range validation at resolution
//! time. Out-of-range-but-legal values produce non-fatal warnings.

use serde::{Deserialize, Serialize};
use statrs::distribution::{ContinuousCDF, Normal};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use tracing::warn;

use crate::geometry::CellSizes;

/// Scale for a 95% confidence interval on the unit normal.
pub const CONF_95: f64 = 1.96;

/// Scale for a 99% confidence interval on the unit normal (0.5% per tail).
pub const CONF_99: f64 = 2.95;

/// Default parameter values.
pub mod defaults {
    /// Length of the median pre-filter queue (odd).
    pub const MEDIAN_LENGTH: usize = 11;
    /// Upper allowable limit on the outlier quotient.
    pub const QUOTIENT_LIMIT: f32 = 30.0;
    /// Discount factor for the evolution noise variance.
    pub const DISCOUNT: f64 = 1.0;
    /// Normalized offset considered significant by the monitor (W&H `h`).
    pub const ESTIMATE_OFFSET: f64 = 4.0;
    /// Minimum acceptable Bayes factor (W&H `tau`).
    pub const BAYES_FACTOR_THRESHOLD: f64 = 0.135;
    /// Consecutive-suspect run length that forces an intervention (W&H `M`).
    pub const RUNLENGTH_THRESHOLD: u16 = 5;
    /// Exponent on distance for the observation variance dilution.
    pub const DISTANCE_EXPONENT: f64 = 2.0;
    /// Minimum depth excursion from the predicted depth to call a blunder (m).
    pub const BLUNDER_MINIMUM: f32 = 10.0;
    /// Fraction of the predicted depth treated as a blunder excursion.
    pub const BLUNDER_PERCENT: f32 = 0.25;
    /// Scale on the predicted-surface std. dev. allowed before a deep spike
    /// is a blunder.
    pub const BLUNDER_SCALAR: f32 = 3.0;
    /// Fraction of depth out to which a sounding is captured by a node.
    pub const CAPTURE_DISTANCE_SCALE: f32 = 0.05;
    /// Scale from posterior std. dev. to the reported uncertainty interval.
    pub const STDDEV_TO_CONFIDENCE_INTERVAL_SCALE: f64 = 1.96;
}

// ============================================================================
// IHO survey orders
// ============================================================================

/// IHO S-44 survey order, fixing the allowable vertical uncertainty budget
/// as a function of depth.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IhoOrder {
    Exclusive,
    Special,
    Order1a,
    Order1b,
    Order2,
}

impl IhoOrder {
    /// Error budget as variances: `(fixed, percent)` where `fixed` is m² and
    /// `percent` is the unitless depth-proportional term, both the squares
    /// of the tabulated standard deviations.
    pub fn budget(self) -> (f64, f64) {
        let (fixed, percent) = match self {
            IhoOrder::Exclusive => (0.15, 0.0075),
            IhoOrder::Special => (0.25, 0.0075),
            IhoOrder::Order1a | IhoOrder::Order1b => (0.50, 0.013),
            IhoOrder::Order2 => (1.00, 0.023),
        };
        (fixed * fixed, percent * percent)
    }
}

impl FromStr for IhoOrder {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, ConfigError> {
        match s {
            "exclusive" => Ok(IhoOrder::Exclusive),
            "special" => Ok(IhoOrder::Special),
            "order1a" => Ok(IhoOrder::Order1a),
            "order1b" => Ok(IhoOrder::Order1b),
            "order2" => Ok(IhoOrder::Order2),
            _ => Err(ConfigError::UnknownIhoOrder(s.to_string())),
        }
    }
}

impl fmt::Display for IhoOrder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            IhoOrder::Exclusive => "exclusive",
            IhoOrder::Special => "special",
            IhoOrder::Order1a => "order1a",
            IhoOrder::Order1b => "order1b",
            IhoOrder::Order2 => "order2",
        };
        write!(f, "{label}")
    }
}

// ============================================================================
// Errors and warnings
// ============================================================================

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unknown IHO order: {0}")]
    UnknownIhoOrder(String),

    #[error("cell sizes must be positive, got {x} x {y}")]
    InvalidCellSizes { x: f32, y: f32 },

    #[error("tile cell counts must be positive, got {x} x {y}")]
    InvalidCellCounts { x: u32, y: u32 },

    #[error("median length must be a positive odd integer, got {0}")]
    InvalidMedianLength(usize),

    #[error("discount must be in (0, 1], got {0}")]
    InvalidDiscount(f64),

    #[error("distance exponent must be positive, got {0}")]
    InvalidDistanceExponent(f64),

    #[error("confidence level must be in (0, 1), got {0}")]
    InvalidConfidenceLevel(f64),

    #[error("failed to parse tuning TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
}

/// A non-fatal tuning warning (legal but suspicious value).
#[derive(Debug, Clone)]
pub struct ValidationWarning {
    pub field: &'static str,
    pub message: String,
}

impl fmt::Display for ValidationWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Scale from standard deviation to a two-sided confidence interval at the
/// given level, via the unit-normal inverse CDF.
pub fn confidence_interval_scale(level: f64) -> Result<f64, ConfigError> {
    if !(level > 0.0 && level < 1.0) {
        return Err(ConfigError::InvalidConfidenceLevel(level));
    }
    let unit_normal = Normal::new(0.0, 1.0).expect("unit normal is a valid distribution");
    Ok(unit_normal.inverse_cdf(0.5 + level / 2.0))
}

// ============================================================================
// Tuning overlay
// ============================================================================

/// Optional overrides for [`Parameters`], deserializable from TOML.
///
/// Unknown keys are rejected at parse time. `confidence_level` is an
/// alternative to `stddev_to_confidence_interval_scale`; if both are given
/// the explicit scale wins and a warning is emitted.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Tuning {
    pub iho_order: Option<IhoOrder>,
    pub distance_exponent: Option<f64>,
    pub median_length: Option<usize>,
    pub quotient_limit: Option<f32>,
    pub discount: Option<f64>,
    pub estimate_offset: Option<f64>,
    pub bayes_factor_threshold: Option<f64>,
    pub runlength_threshold: Option<u16>,
    pub blunder_minimum: Option<f32>,
    pub blunder_percent: Option<f32>,
    pub blunder_scalar: Option<f32>,
    pub capture_distance_scale: Option<f32>,
    pub stddev_to_confidence_interval_scale: Option<f64>,
    pub confidence_level: Option<f64>,
    pub nodata_depth: Option<f32>,
    pub nodata_variance: Option<f32>,
}

impl Tuning {
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    /// Legal-but-suspicious values. These never fail resolution.
    pub fn warnings(&self) -> Vec<ValidationWarning> {
        let mut warnings = Vec::new();
        if let Some(p) = self.blunder_percent {
            if !(0.0..1.0).contains(&p) {
                warnings.push(ValidationWarning {
                    field: "blunder_percent",
                    message: format!("expected a fraction in (0, 1), got {p}"),
                });
            }
        }
        if let Some(s) = self.capture_distance_scale {
            if s <= 0.0 || s > 1.0 {
                warnings.push(ValidationWarning {
                    field: "capture_distance_scale",
                    message: format!("expected a fraction of depth in (0, 1], got {s}"),
                });
            }
        }
        if let Some(q) = self.quotient_limit {
            if q <= 0.0 {
                warnings.push(ValidationWarning {
                    field: "quotient_limit",
                    message: format!("non-positive limit {q} rejects every queued point"),
                });
            }
        }
        if self.confidence_level.is_some() && self.stddev_to_confidence_interval_scale.is_some() {
            warnings.push(ValidationWarning {
                field: "confidence_level",
                message: "both confidence_level and stddev_to_confidence_interval_scale set; \
                          the explicit scale wins"
                    .to_string(),
            });
        }
        warnings
    }
}

// ============================================================================
// Parameters
// ============================================================================

/// Resolved algorithm parameters, shared read-only across a sheet.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Parameters {
    /// Survey order fixing the vertical uncertainty budget.
    pub iho_order: IhoOrder,
    /// Fixed portion of the IHO error budget (m², a variance).
    pub iho_fixed: f64,
    /// Depth-proportional portion of the IHO error budget (unitless²).
    pub iho_percent: f64,

    /// Exponent on distance for the observation variance dilution.
    pub distance_exponent: f64,
    /// `1 / distance_exponent`, kept for the radius computation.
    pub inverse_distance_exponent: f64,
    /// Normalization distance, the smaller cell spacing (m).
    pub distance_scale: f64,
    /// Variance dilution factor, `distance_scale^-distance_exponent`.
    pub variance_scale: f64,

    /// Capacity of the median pre-filter queue (odd).
    pub median_length: usize,
    /// Upper allowable limit on the outlier quotient.
    pub quotient_limit: f32,

    /// Discount factor for the evolution noise variance, in (0, 1].
    pub discount: f64,
    /// Normalized offset considered significant by the monitor (W&H `h`).
    pub estimate_offset: f64,
    /// Minimum acceptable Bayes factor (W&H `tau`).
    pub bayes_factor_threshold: f64,
    /// Consecutive-suspect run length forcing an intervention (W&H `M`).
    pub runlength_threshold: u16,

    /// Minimum depth excursion from the predicted depth to call a blunder (m).
    pub blunder_minimum: f32,
    /// Fraction of the predicted depth treated as a blunder excursion.
    pub blunder_percent: f32,
    /// Scale on the predicted-surface std. dev. allowed before a deep spike
    /// is a blunder.
    pub blunder_scalar: f32,
    /// Fraction of depth out to which a sounding is captured by a node.
    pub capture_distance_scale: f32,

    /// Scale from posterior std. dev. to the reported uncertainty interval.
    pub stddev_to_confidence_interval_scale: f64,

    /// Depth reported for a node with no data; NaN when unset.
    pub nodata_depth: Option<f32>,
    /// Uncertainty reported for a node with no data; NaN when unset.
    pub nodata_variance: Option<f32>,
}

impl Parameters {
    /// Build parameters for the given node spacing and survey order, all
    /// other values at their defaults.
    pub fn new(sizes: CellSizes, order: IhoOrder) -> Result<Self, ConfigError> {
        Self::with_tuning(
            sizes,
            &Tuning {
                iho_order: Some(order),
                ..Tuning::default()
            },
        )
    }

    /// Build parameters with a [`Tuning`] overlay applied over the defaults.
    ///
    /// Warnings from [`Tuning::warnings`] are logged but do not fail
    /// resolution; range violations do.
    pub fn with_tuning(sizes: CellSizes, tuning: &Tuning) -> Result<Self, ConfigError> {
        if !sizes.is_valid() {
            return Err(ConfigError::InvalidCellSizes {
                x: sizes.x,
                y: sizes.y,
            });
        }

        let median_length = tuning.median_length.unwrap_or(defaults::MEDIAN_LENGTH);
        if median_length == 0 || median_length % 2 == 0 {
            return Err(ConfigError::InvalidMedianLength(median_length));
        }

        let discount = tuning.discount.unwrap_or(defaults::DISCOUNT);
        if !(discount > 0.0 && discount <= 1.0) {
            return Err(ConfigError::InvalidDiscount(discount));
        }

        let distance_exponent = tuning
            .distance_exponent
            .unwrap_or(defaults::DISTANCE_EXPONENT);
        if distance_exponent <= 0.0 {
            return Err(ConfigError::InvalidDistanceExponent(distance_exponent));
        }

        for warning in tuning.warnings() {
            warn!(field = warning.field, "tuning: {warning}");
        }

        let interval_scale = match (
            tuning.stddev_to_confidence_interval_scale,
            tuning.confidence_level,
        ) {
            (Some(scale), _) => scale,
            (None, Some(level)) => confidence_interval_scale(level)?,
            (None, None) => defaults::STDDEV_TO_CONFIDENCE_INTERVAL_SCALE,
        };

        let iho_order = tuning.iho_order.unwrap_or(IhoOrder::Order1a);
        let (iho_fixed, iho_percent) = iho_order.budget();

        let distance_scale = f64::from(sizes.x.min(sizes.y));

        Ok(Self {
            iho_order,
            iho_fixed,
            iho_percent,
            distance_exponent,
            inverse_distance_exponent: 1.0 / distance_exponent,
            distance_scale,
            variance_scale: distance_scale.powf(-distance_exponent),
            median_length,
            quotient_limit: tuning.quotient_limit.unwrap_or(defaults::QUOTIENT_LIMIT),
            discount,
            estimate_offset: tuning.estimate_offset.unwrap_or(defaults::ESTIMATE_OFFSET),
            bayes_factor_threshold: tuning
                .bayes_factor_threshold
                .unwrap_or(defaults::BAYES_FACTOR_THRESHOLD),
            runlength_threshold: tuning
                .runlength_threshold
                .unwrap_or(defaults::RUNLENGTH_THRESHOLD),
            blunder_minimum: tuning.blunder_minimum.unwrap_or(defaults::BLUNDER_MINIMUM),
            blunder_percent: tuning.blunder_percent.unwrap_or(defaults::BLUNDER_PERCENT),
            blunder_scalar: tuning.blunder_scalar.unwrap_or(defaults::BLUNDER_SCALAR),
            capture_distance_scale: tuning
                .capture_distance_scale
                .unwrap_or(defaults::CAPTURE_DISTANCE_SCALE),
            stddev_to_confidence_interval_scale: interval_scale,
            nodata_depth: tuning.nodata_depth,
            nodata_variance: tuning.nodata_variance,
        })
    }
}
