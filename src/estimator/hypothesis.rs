//! A single depth hypothesis: a univariate dynamic linear model tracking the
//! depth at one node, with Bayes-factor model monitoring.
//!
//! The update follows the standard DLM equations (West & Harrison, 'Bayesian
//! Forecasting and Dynamic Models', 2ed., ch. 2) with a discounted evolution
//! noise variance. Monitoring uses cumulative Bayes factors against the
//! unidirectional level-shift alternate model (W&H ch. 11, sec. 11.5.1); a
//! failed check means the sample does not belong to this track and the
//! caller must open a new hypothesis for it.

use serde::{Deserialize, Serialize};

use crate::config::Parameters;

/// Monitor verdict for a prospective sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelCheck {
    /// The current model still explains the input.
    Supported,
    /// The input is inconsistent with this track; open a new hypothesis.
    InterventionRequired,
}

/// Result of offering a sample to a hypothesis.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// The sample was incorporated.
    Accepted,
    /// The sample was not incorporated; the caller must consume it by
    /// opening a new hypothesis.
    InterventionRequired,
}

/// One competing posterior over depth at a node.
///
/// All estimation arithmetic is f64 to avoid round-off in long update
/// chains. The sample count allows a pseudo-MAP choice of the most visited
/// track; a count of zero marks a placeholder that readback treats as
/// absent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Hypothesis {
    /// Posterior depth mean.
    pub current_estimate: f64,
    /// Posterior depth variance.
    pub current_variance: f64,
    /// One-step-ahead depth mean.
    pub predicted_estimate: f64,
    /// One-step-ahead depth variance.
    pub predicted_variance: f64,

    /// Cumulative Bayes factor for monitoring.
    pub cumulative_bayes_factor: f64,
    /// Run length of consecutive suspect factors.
    pub sequence_length: u16,
    /// Creation-order id, for debugging.
    pub hypothesis_number: u16,
    /// Samples incorporated since creation.
    pub number_of_samples: u32,

    /// Running sample variance of the inputs. Not used by the update; kept
    /// for reporting when the posterior variance alone is misleading.
    pub input_sample_variance: f32,
    /// Maximum of the input sample variance and the one-step prediction
    /// variance, tracked alongside it.
    pub maximum_of_input_and_predicted_variance: f32,
}

impl Hypothesis {
    /// New track seeded from one sample.
    pub fn new(initial_mean: f32, initial_variance: f32) -> Self {
        Self {
            current_estimate: f64::from(initial_mean),
            current_variance: f64::from(initial_variance),
            predicted_estimate: f64::from(initial_mean),
            predicted_variance: f64::from(initial_variance),
            cumulative_bayes_factor: 1.0,
            sequence_length: 0,
            hypothesis_number: 0,
            number_of_samples: 1,
            input_sample_variance: 0.0,
            maximum_of_input_and_predicted_variance: 0.0,
        }
    }

    /// Placeholder track with a sample count of zero; readback treats it as
    /// absent until a real sample arrives.
    pub fn null(depth: f32, variance: f32) -> Self {
        let mut hypothesis = Self::new(depth, variance);
        hypothesis.number_of_samples = 0;
        hypothesis
    }

    /// Reset the monitoring state to its defaults.
    pub fn reset_monitor(&mut self) {
        self.cumulative_bayes_factor = 1.0;
        self.sequence_length = 0;
    }

    /// Normalized absolute error between the one-step forecast and a
    /// prospective sample; the node uses this to pick the closest track.
    pub fn forecast_error(&self, depth: f32, variance: f32) -> f64 {
        let forecast_variance = self.predicted_variance + f64::from(variance);
        (f64::from(depth) - self.predicted_estimate).abs() / forecast_variance.sqrt()
    }

    /// West & Harrison monitoring for a prospective sample.
    ///
    /// `estimate_offset` is W&H's `h` (the normalized level shift the
    /// alternate model expects), `bayes_factor_threshold` is `tau` (the
    /// smallest factor acceptable as evidence for the current model), and
    /// `runlength_threshold` bounds `l_t` (how many consecutive suspect
    /// factors indicate a gradual drift off the predictor).
    pub fn monitor(&mut self, depth: f32, variance: f32, parameters: &Parameters) -> ModelCheck {
        let forecast_variance = self.predicted_variance + f64::from(variance);
        let error = (f64::from(depth) - self.predicted_estimate) / forecast_variance.sqrt();

        let h = parameters.estimate_offset;
        let bayes_factor = if error >= 0.0 {
            (0.5 * (h * h - 2.0 * h * error)).exp()
        } else {
            (0.5 * (h * h + 2.0 * h * error)).exp()
        };

        // Single-component failure
        if bayes_factor < parameters.bayes_factor_threshold {
            return ModelCheck::InterventionRequired;
        }

        if self.cumulative_bayes_factor < 1.0 {
            self.sequence_length = self.sequence_length.saturating_add(1);
        } else {
            self.sequence_length = 1;
        }
        self.cumulative_bayes_factor = bayes_factor * self.cumulative_bayes_factor.min(1.0);

        // Consecutive failure
        if self.cumulative_bayes_factor < parameters.bayes_factor_threshold
            || self.sequence_length > parameters.runlength_threshold
        {
            return ModelCheck::InterventionRequired;
        }

        ModelCheck::Supported
    }

    /// Offer one sample (depth and observation variance) to this track.
    ///
    /// Runs the monitor first; if it indicates an intervention the sample is
    /// not incorporated and the caller owns it. Otherwise performs the
    /// Kalman/innovations update with the discounted system variance and
    /// rolls the one-step prediction forward.
    pub fn update(&mut self, depth: f32, variance: f32, parameters: &Parameters) -> UpdateOutcome {
        if self.monitor(depth, variance, parameters) == ModelCheck::InterventionRequired {
            return UpdateOutcome::InterventionRequired;
        }

        let depth = f64::from(depth);
        let variance = f64::from(variance);

        if self.number_of_samples > 0 {
            let n = f64::from(self.number_of_samples);
            self.input_sample_variance = ((n - 1.0) * f64::from(self.input_sample_variance) / n
                + (depth - self.current_estimate).powi(2) / n)
                as f32;
        }

        let system_variance =
            self.current_variance * (1.0 - parameters.discount) / parameters.discount;

        let gain = self.predicted_variance / (variance + self.predicted_variance);
        let innovation = depth - self.predicted_estimate;
        self.predicted_estimate += gain * innovation;
        self.current_estimate = self.predicted_estimate;
        self.current_variance = variance * self.predicted_variance / (variance + self.predicted_variance);
        self.predicted_variance = self.current_variance + system_variance;

        self.number_of_samples += 1;
        self.maximum_of_input_and_predicted_variance = self
            .input_sample_variance
            .max(self.predicted_variance as f32);

        UpdateOutcome::Accepted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{IhoOrder, Parameters};
    use crate::geometry::CellSizes;

    fn params() -> Parameters {
        Parameters::new(CellSizes::square(1.0), IhoOrder::Order1a).expect("default parameters")
    }

    #[test]
    fn test_new_seeds_current_and_predicted() {
        let h = Hypothesis::new(10.0, 0.5);
        assert!((h.current_estimate - 10.0).abs() < 1e-12);
        assert!((h.predicted_estimate - 10.0).abs() < 1e-12);
        assert!((h.current_variance - 0.5).abs() < 1e-12);
        assert_eq!(h.number_of_samples, 1);
        assert!((h.cumulative_bayes_factor - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_null_hypothesis_has_zero_samples() {
        let h = Hypothesis::null(0.0, 1.0e6);
        assert_eq!(h.number_of_samples, 0);
    }

    #[test]
    fn test_identical_updates_shrink_variance_harmonically() {
        let p = params();
        let v = 0.8_f32;
        let mut h = Hypothesis::new(10.0, v);

        for _ in 0..19 {
            assert_eq!(h.update(10.0, v, &p), UpdateOutcome::Accepted);
        }

        assert_eq!(h.number_of_samples, 20);
        assert!((h.current_estimate - 10.0).abs() < 1e-9);
        // With discount 1 and a constant observation variance the posterior
        // variance after n samples is exactly v/n.
        assert!((h.current_variance - f64::from(v) / 20.0).abs() < 1e-9);
    }

    #[test]
    fn test_large_jump_triggers_immediate_intervention() {
        let p = params();
        let mut h = Hypothesis::new(10.0, 1.0);

        // A 5-sigma level shift is far beyond the h = 4 alternate.
        let outcome = h.update(10.0 + 5.0 * (2.0_f32).sqrt(), 1.0, &p);
        assert_eq!(outcome, UpdateOutcome::InterventionRequired);
        assert_eq!(h.number_of_samples, 1, "rejected sample must not be incorporated");
    }

    #[test]
    fn test_cumulative_bayes_factor_decay_triggers_intervention() {
        let p = params();
        let mut h = Hypothesis::new(0.0, 1.0);

        // e = 2.2 gives a per-sample factor of exp(-0.8) ~ 0.449: each on
        // its own is acceptable, but the cumulative product drops below tau
        // on the third look.
        assert_eq!(h.monitor(2.2, 0.0, &p), ModelCheck::Supported);
        assert_eq!(h.monitor(2.2, 0.0, &p), ModelCheck::Supported);
        assert_eq!(h.monitor(2.2, 0.0, &p), ModelCheck::InterventionRequired);
    }

    #[test]
    fn test_runlength_triggers_intervention() {
        let p = params();
        let mut h = Hypothesis::new(0.0, 1.0);

        // e = 2.05 decays the cumulative factor slowly (exp(-0.2) ~ 0.82 per
        // sample), so the run-length limit of 5 fires before tau does.
        for _ in 0..5 {
            assert_eq!(h.monitor(2.05, 0.0, &p), ModelCheck::Supported);
        }
        assert_eq!(h.monitor(2.05, 0.0, &p), ModelCheck::InterventionRequired);
        assert!(h.cumulative_bayes_factor > p.bayes_factor_threshold);
        assert!(h.sequence_length > p.runlength_threshold);
    }

    #[test]
    fn test_reset_monitor_clears_state() {
        let p = params();
        let mut h = Hypothesis::new(0.0, 1.0);
        let _ = h.monitor(2.2, 0.0, &p);
        let _ = h.monitor(2.2, 0.0, &p);

        h.reset_monitor();
        assert!((h.cumulative_bayes_factor - 1.0).abs() < 1e-12);
        assert_eq!(h.sequence_length, 0);
    }

    #[test]
    fn test_discount_inflates_prediction_variance() {
        let sizes = CellSizes::square(1.0);
        let tuning = crate::config::Tuning {
            discount: Some(0.8),
            ..crate::config::Tuning::default()
        };
        let p = Parameters::with_tuning(sizes, &tuning).expect("valid tuning");

        let mut h = Hypothesis::new(10.0, 1.0);
        assert_eq!(h.update(10.0, 1.0, &p), UpdateOutcome::Accepted);

        // Posterior variance is 0.5; the discounted evolution noise adds
        // current_variance * (1 - d) / d = 0.25 to the prediction.
        assert!((h.current_variance - 0.5).abs() < 1e-9);
        assert!((h.predicted_variance - 0.75).abs() < 1e-9);
    }
}
