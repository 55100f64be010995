//! A single estimation node: input gates, median pre-filter, and the set of
//! competing depth hypotheses.
//!
//! Incoming soundings pass three gates (locked node, blunder, capture
//! radius), then enter a short depth-sorted queue. Once the queue is full,
//! each arrival pops the queue median into the Bayesian update path, which
//! either extends the closest-matching hypothesis or, on an intervention,
//! opens a new one. Readback flushes the queue and reports the hypothesis
//! with the most samples (or a user-nominated one).

use serde::{Deserialize, Serialize};

use crate::config::{Parameters, CONF_95, CONF_99};
use crate::estimator::hypothesis::{Hypothesis, UpdateOutcome};
use crate::estimator::{DepthUncertainty, INVALID_DATA};
use crate::sounding::Sounding;

/// Matching tolerance between a nominated depth and a hypothesis mean (m).
const NOMINATION_TOLERANCE: f32 = 1e-3;

/// Prior-surface state of a node.
///
/// The f32 sentinel convention of [`Node::set_predicted_depth`] maps onto
/// this: NaN means [`PredictedDepth::Locked`], [`INVALID_DATA`] means
/// [`PredictedDepth::Unknown`].
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub enum PredictedDepth {
    /// No prior surface information.
    #[default]
    Unknown,
    /// The node is frozen: inserts are accepted and ignored.
    Locked,
    /// A predicted depth and variance, used by the blunder and capture
    /// gates.
    Surface { depth: f32, variance: f32 },
}

/// What happened to a sounding offered to a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    /// Passed all gates and entered the pre-filter queue.
    Queued,
    /// The node is locked; the sounding was ignored.
    NodeLocked,
    /// Rejected as a deep spike against the predicted surface.
    BlunderRejected,
    /// Too far from the node for its depth.
    BeyondCaptureRadius,
}

/// A queued pre-filter sample.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
struct QueuedSample {
    depth: f32,
    variance: f32,
}

/// A grid point's estimation state.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Node {
    /// Pre-filter queue, sorted by depth descending, bounded by
    /// `median_length`.
    queue: Vec<QueuedSample>,
    /// Competing depth tracks, in creation order.
    hypotheses: Vec<Hypothesis>,
    /// User-nominated depth for readback; cleared by any accepted sample.
    nominated_depth: Option<f32>,
    /// Prior surface used by the blunder and capture gates.
    prediction: PredictedDepth,
}

impl Node {
    pub fn new() -> Self {
        Self::default()
    }

    // ------------------------------------------------------------------
    // Prior surface and nomination
    // ------------------------------------------------------------------

    /// Seed the prior surface used by the blunder and capture gates.
    ///
    /// A NaN depth locks the node against further updates; a depth of
    /// [`INVALID_DATA`] clears the prior to "no information".
    pub fn set_predicted_depth(&mut self, depth: f32, variance: f32) {
        self.prediction = if depth.is_nan() {
            PredictedDepth::Locked
        } else if depth == INVALID_DATA {
            PredictedDepth::Unknown
        } else {
            PredictedDepth::Surface { depth, variance }
        };
    }

    pub fn prediction(&self) -> PredictedDepth {
        self.prediction
    }

    /// Force readback to the hypothesis whose mean lies within 1 mm of
    /// `depth`. Returns false (and nominates nothing) if no track matches.
    pub fn nominate(&mut self, depth: f32) -> bool {
        let matched = self
            .hypotheses
            .iter()
            .any(|h| (h.current_estimate as f32 - depth).abs() <= NOMINATION_TOLERANCE);
        if matched {
            self.nominated_depth = Some(depth);
        }
        matched
    }

    pub fn clear_nomination(&mut self) {
        self.nominated_depth = None;
    }

    // ------------------------------------------------------------------
    // Sounding ingestion
    // ------------------------------------------------------------------

    /// Offer one sounding at the given squared distance from this node.
    ///
    /// Gates run in order: locked node, blunder (deep spike against the
    /// predicted surface), capture radius. A surviving sounding has its
    /// observation variance inflated by the propagation distance (including
    /// the 95% bound on its horizontal error) and enters the queue.
    pub fn insert(
        &mut self,
        distance_squared: f64,
        sounding: &Sounding,
        parameters: &Parameters,
    ) -> InsertOutcome {
        if self.prediction == PredictedDepth::Locked {
            return InsertOutcome::NodeLocked;
        }

        let mut distance = distance_squared.sqrt();

        // Depths are positive down: a blunder is a spike substantially
        // deeper than the predicted surface allows.
        let target_depth = match self.prediction {
            PredictedDepth::Surface { depth, variance } => {
                let allowed_excursion = parameters
                    .blunder_minimum
                    .max(parameters.blunder_percent * depth.abs())
                    .max(parameters.blunder_scalar * variance.sqrt());
                if sounding.depth - depth > allowed_excursion {
                    return InsertOutcome::BlunderRejected;
                }
                depth
            }
            _ => sounding.depth,
        };

        let capture_radius =
            f64::from(parameters.capture_distance_scale * target_depth.abs()).max(0.5);
        if distance > capture_radius {
            return InsertOutcome::BeyondCaptureRadius;
        }

        // Propagation distance from boresight to the node estimation point,
        // padded by the 95% bound on the horizontal positioning error.
        distance += CONF_95 * f64::from(sounding.horizontal_error).sqrt();

        let variance = f64::from(sounding.vertical_error)
            * (1.0
                + parameters.stddev_to_confidence_interval_scale
                    * distance.powf(parameters.distance_exponent));

        // Adding data removes any nomination in effect.
        self.nominated_depth = None;

        self.queue_estimate(sounding.depth, variance as f32, parameters);
        InsertOutcome::Queued
    }

    // ------------------------------------------------------------------
    // Median pre-filter
    // ------------------------------------------------------------------

    /// Push one estimate into the pre-filter queue.
    ///
    /// When the queue is at capacity the median is popped into the Bayesian
    /// update first, so the queue stays full once primed and must be
    /// flushed before readback. After insertion, non-overlapping 99%
    /// confidence tails of the shallowest and deepest entries trigger a
    /// round of outlier rejection.
    pub fn queue_estimate(&mut self, depth: f32, variance: f32, parameters: &Parameters) {
        if self.queue.len() >= parameters.median_length {
            let median = self.queue.remove(parameters.median_length / 2);
            self.update(median.depth, median.variance, parameters);
        }

        let at = self
            .queue
            .iter()
            .position(|sample| sample.depth <= depth)
            .unwrap_or(self.queue.len());
        self.queue.insert(at, QueuedSample { depth, variance });

        if self.queue.len() >= parameters.median_length {
            // 0.5% in either tail of a normal is at 2.5758 std. dev.; if the
            // tails below the deepest and above the shallowest points fail
            // to overlap, the buffer likely contains outliers.
            let front = self.queue[0];
            let back = self.queue[self.queue.len() - 1];
            let deep_tail = f64::from(front.depth) - CONF_99 * f64::from(front.variance).sqrt();
            let shallow_tail = f64::from(back.depth) + CONF_99 * f64::from(back.variance).sqrt();
            if deep_tail >= shallow_tail {
                self.truncate(parameters);
            }
        }
    }

    /// Reject suspect outliers from the queue by the leave-one-out variance
    /// quotient.
    ///
    /// The quotient is approximately F(1, n-2) distributed for clean input,
    /// positive and increasing for worse outliers; values above the
    /// configured limit are removed. A point whose squared deviation drives
    /// the quotient's denominator non-positive carries essentially the
    /// whole deviation of the buffer and counts as beyond any critical
    /// value (only applied once the buffer is long enough for the statistic
    /// to be meaningful).
    pub fn truncate(&mut self, parameters: &Parameters) {
        if self.queue.len() < 2 {
            return;
        }

        let count = self.queue.len() as f64;
        let n = count - 1.0;

        let mut sum = 0.0_f64;
        let mut sum_sq = 0.0_f64;
        for sample in &self.queue {
            sum += f64::from(sample.depth);
            sum_sq += f64::from(sample.depth) * f64::from(sample.depth);
        }
        let mean = sum / count;
        let ssd = sum_sq - sum * sum / count;
        let ssd_k = n * ssd / (n * n + 1.0);

        let pole_rejects = self.queue.len() >= 4;
        let limit = f64::from(parameters.quotient_limit);

        self.queue.retain(|sample| {
            let diff_sq = (f64::from(sample.depth) - mean).powi(2);
            if diff_sq == 0.0 {
                return true;
            }
            let denominator = ssd_k - diff_sq / (n - 1.0);
            if denominator <= 0.0 {
                return !pole_rejects;
            }
            diff_sq / denominator <= limit
        });
    }

    /// Flush the queue into the estimation sequence: one outlier-rejection
    /// pass, then repeatedly feed the current median until the queue is
    /// empty. Destructive; a second flush with no intervening insertions is
    /// a no-op.
    pub fn queue_flush(&mut self, parameters: &Parameters) {
        if self.queue.is_empty() {
            return;
        }

        self.truncate(parameters);

        while !self.queue.is_empty() {
            let median = self.queue.remove(self.queue.len() / 2);
            self.update(median.depth, median.variance, parameters);
        }
    }

    // ------------------------------------------------------------------
    // Bayesian update path
    // ------------------------------------------------------------------

    /// Feed one estimate to the closest-matching hypothesis, opening a new
    /// one on the first sample or on an intervention.
    pub fn update(&mut self, depth: f32, variance: f32, parameters: &Parameters) {
        let Some(best) = self.best_hypothesis(depth, variance) else {
            // No hypotheses yet: initialisation mode.
            self.add_hypothesis(depth, variance);
            return;
        };

        if self.hypotheses[best].update(depth, variance, parameters)
            == UpdateOutcome::InterventionRequired
        {
            // The sample does not match the track it was offered to; leave
            // the track with a clean monitor and capture the sample in a
            // fresh hypothesis.
            self.hypotheses[best].reset_monitor();
            self.add_hypothesis(depth, variance);
        }
    }

    /// Index of the hypothesis with the smallest normalized forecast error
    /// for the given sample; ties go to the most recently created track.
    fn best_hypothesis(&self, depth: f32, variance: f32) -> Option<usize> {
        let mut best = None;
        let mut min_error = f64::INFINITY;
        for (i, hypothesis) in self.hypotheses.iter().enumerate() {
            let error = hypothesis.forecast_error(depth, variance);
            if error <= min_error {
                min_error = error;
                best = Some(i);
            }
        }
        best
    }

    fn add_hypothesis(&mut self, depth: f32, variance: f32) {
        let mut hypothesis = Hypothesis::new(depth, variance);
        hypothesis.hypothesis_number = self.hypotheses.len() as u16;
        self.hypotheses.push(hypothesis);
    }

    // ------------------------------------------------------------------
    // Readback
    // ------------------------------------------------------------------

    /// The hypothesis with the most samples, a pseudo-MAP choice of the
    /// most frequently visited track. Placeholders with zero samples are
    /// never chosen.
    pub fn choose_hypothesis(&self) -> Option<&Hypothesis> {
        let mut chosen = None;
        let mut max_samples = 0;
        for hypothesis in &self.hypotheses {
            if hypothesis.number_of_samples > max_samples {
                max_samples = hypothesis.number_of_samples;
                chosen = Some(hypothesis);
            }
        }
        chosen
    }

    /// Depth and uncertainty of the current best (or nominated) hypothesis.
    ///
    /// The uncertainty is the posterior standard deviation scaled to the
    /// configured confidence interval. A node with no established track
    /// reports the configured no-data pair. Does not flush the queue; call
    /// [`Node::queue_flush`] first for a full readback.
    pub fn extract_depth_and_uncertainty(&self, parameters: &Parameters) -> DepthUncertainty {
        let scale = parameters.stddev_to_confidence_interval_scale;

        if let Some(nominated) = self.nominated_depth {
            if let Some(hypothesis) = self
                .hypotheses
                .iter()
                .find(|h| (h.current_estimate as f32 - nominated).abs() <= NOMINATION_TOLERANCE)
            {
                return DepthUncertainty::new(
                    hypothesis.current_estimate as f32,
                    (scale * hypothesis.current_variance.sqrt()) as f32,
                );
            }
        }

        match self.choose_hypothesis() {
            Some(hypothesis) => DepthUncertainty::new(
                hypothesis.current_estimate as f32,
                (scale * hypothesis.current_variance.sqrt()) as f32,
            ),
            None => DepthUncertainty::new(
                parameters.nodata_depth.unwrap_or(f32::NAN),
                parameters.nodata_variance.unwrap_or(f32::NAN),
            ),
        }
    }

    // ------------------------------------------------------------------
    // Introspection
    // ------------------------------------------------------------------

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    pub fn hypothesis_count(&self) -> usize {
        self.hypotheses.len()
    }

    pub fn hypotheses(&self) -> &[Hypothesis] {
        &self.hypotheses
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

    fn sounding_at_node(depth: f32, vertical_error: f32, horizontal_error: f32) -> Sounding {
        Sounding::new(0.0, 0.0, depth, vertical_error, horizontal_error)
    }

    #[test]
    fn test_queue_stays_sorted_and_bounded() {
        let p = params();
        let mut node = Node::new();

        for depth in [12.0, 9.5, 15.0, 10.0, 11.0, 9.0, 14.0, 13.0, 10.5, 12.5, 11.5, 9.8, 13.5] {
            node.queue_estimate(depth, 0.1, &p);
        }

        assert_eq!(node.queue_len(), p.median_length);
        let depths: Vec<f32> = node.queue.iter().map(|s| s.depth).collect();
        for pair in depths.windows(2) {
            assert!(pair[0] >= pair[1], "queue must stay sorted deepest first");
        }
    }

    #[test]
    fn test_first_bayes_update_fires_when_queue_overflows() {
        let p = params();
        let mut node = Node::new();

        for _ in 0..p.median_length {
            node.queue_estimate(10.0, 0.1, &p);
        }
        assert_eq!(node.hypothesis_count(), 0, "queue priming must not reach the estimator");

        node.queue_estimate(10.0, 0.1, &p);
        assert_eq!(node.hypothesis_count(), 1);
        assert_eq!(node.queue_len(), p.median_length);
    }

    #[test]
    fn test_locked_node_ignores_inserts() {
        let p = params();
        let mut node = Node::new();
        node.set_predicted_depth(f32::NAN, 0.0);

        let outcome = node.insert(0.0, &sounding_at_node(10.0, 0.25, 0.25), &p);
        assert_eq!(outcome, InsertOutcome::NodeLocked);
        assert_eq!(node.queue_len(), 0);
    }

    #[test]
    fn test_invalid_data_clears_prior_surface() {
        let mut node = Node::new();
        node.set_predicted_depth(10.0, 1.0);
        assert!(matches!(node.prediction(), PredictedDepth::Surface { .. }));

        node.set_predicted_depth(INVALID_DATA, 0.0);
        assert_eq!(node.prediction(), PredictedDepth::Unknown);
    }

    #[test]
    fn test_blunder_gate_rejects_deep_spike() {
        let p = params();
        let mut node = Node::new();
        node.set_predicted_depth(10.0, 1.0);

        // 100 m against a predicted 10 m is far beyond every blunder limit.
        let outcome = node.insert(0.0, &sounding_at_node(100.0, 0.25, 0.25), &p);
        assert_eq!(outcome, InsertOutcome::BlunderRejected);

        // A mild excursion inside the blunder_minimum allowance passes.
        let outcome = node.insert(0.0, &sounding_at_node(15.0, 0.25, 0.25), &p);
        assert_eq!(outcome, InsertOutcome::Queued);

        // Shallow spikes are not blunders; they must reach the estimator.
        let outcome = node.insert(0.0, &sounding_at_node(2.0, 0.25, 0.25), &p);
        assert_eq!(outcome, InsertOutcome::Queued);
    }

    #[test]
    fn test_capture_radius_gate() {
        let p = params();
        let mut node = Node::new();

        // Capture radius for a 10 m depth is max(0.05 * 10, 0.5) = 0.5 m.
        let outcome = node.insert(1.0, &sounding_at_node(10.0, 0.25, 0.0), &p);
        assert_eq!(outcome, InsertOutcome::BeyondCaptureRadius);

        let outcome = node.insert(0.16, &sounding_at_node(10.0, 0.25, 0.0), &p);
        assert_eq!(outcome, InsertOutcome::Queued);
    }

    #[test]
    fn test_truncate_rejects_single_extreme_outlier() {
        let p = params();
        let mut node = Node::new();

        for _ in 0..10 {
            node.queue_estimate(10.0, 0.01, &p);
        }
        node.queue_estimate(50.0, 0.01, &p);

        // The non-overlapping confidence tails trigger truncation, which
        // removes the 50 m spike and keeps the consistent samples.
        assert_eq!(node.queue_len(), 10);
        assert!(node.queue.iter().all(|s| (s.depth - 10.0).abs() < 1e-6));
    }

    #[test]
    fn test_truncate_keeps_identical_depths() {
        let p = params();
        let mut node = Node::new();
        for _ in 0..7 {
            node.queue_estimate(25.0, 0.05, &p);
        }
        node.truncate(&p);
        assert_eq!(node.queue_len(), 7);
    }

    #[test]
    fn test_flush_reaches_estimator_and_is_idempotent() {
        let p = params();
        let mut node = Node::new();
        for _ in 0..5 {
            node.queue_estimate(20.0, 0.1, &p);
        }

        node.queue_flush(&p);
        let first = node.extract_depth_and_uncertainty(&p);
        assert!((first.depth - 20.0).abs() < 1e-4);
        assert_eq!(node.queue_len(), 0);

        node.queue_flush(&p);
        let second = node.extract_depth_and_uncertainty(&p);
        assert!((first.depth - second.depth).abs() < 1e-9);
        assert!((first.uncertainty - second.uncertainty).abs() < 1e-9);
    }

    #[test]
    fn test_intervention_spawns_second_hypothesis() {
        let p = params();
        let mut node = Node::new();

        node.update(10.0, 0.25, &p);
        assert_eq!(node.hypothesis_count(), 1);

        // A gross shift cannot extend the existing track.
        node.update(15.0, 0.25, &p);
        assert_eq!(node.hypothesis_count(), 2);
        let first = &node.hypotheses()[0];
        assert!((first.cumulative_bayes_factor - 1.0).abs() < 1e-12, "monitor must be reset");
    }

    #[test]
    fn test_best_hypothesis_tie_goes_to_last() {
        let p = params();
        let mut node = Node::new();
        node.update(10.0, 1.0, &p);
        node.update(14.0, 1.0, &p);
        assert_eq!(node.hypothesis_count(), 2);

        // 12.0 is equidistant from both forecasts; the later track wins the
        // tie and absorbs the sample.
        node.update(12.0, 1.0, &p);
        assert_eq!(node.hypotheses()[0].number_of_samples, 1);
        assert_eq!(node.hypotheses()[1].number_of_samples, 2);
    }

    #[test]
    fn test_choose_hypothesis_by_sample_count() {
        let p = params();
        let mut node = Node::new();
        node.update(10.0, 0.25, &p);
        node.update(15.0, 0.25, &p);
        node.update(15.0, 0.25, &p);
        node.update(15.0, 0.25, &p);

        let chosen = node.choose_hypothesis().expect("tracks exist");
        assert!((chosen.current_estimate - 15.0).abs() < 1e-6);
    }

    #[test]
    fn test_null_hypothesis_reads_back_as_no_data() {
        let p = params();
        let mut node = Node::new();
        node.hypotheses.push(Hypothesis::null(0.0, 1.0e6));

        let value = node.extract_depth_and_uncertainty(&p);
        assert!(value.is_no_data());
    }

    #[test]
    fn test_nomination_forces_readback_until_next_sample() {
        let p = params();
        let mut node = Node::new();
        node.update(10.0, 0.25, &p);
        node.update(15.0, 0.25, &p);
        node.update(15.0, 0.25, &p);

        assert!(node.nominate(10.0));
        let value = node.extract_depth_and_uncertainty(&p);
        assert!((value.depth - 10.0).abs() < 1e-4);

        assert!(!node.nominate(30.0), "nomination must match an existing track");

        // Any accepted sample clears the nomination.
        let outcome = node.insert(0.0, &sounding_at_node(15.0, 0.25, 0.0), &p);
        assert_eq!(outcome, InsertOutcome::Queued);
        let value = node.extract_depth_and_uncertainty(&p);
        assert!((value.depth - 15.0).abs() < 1e-4);
    }

    #[test]
    fn test_empty_node_reports_no_data() {
        let p = params();
        let node = Node::new();
        assert!(node.extract_depth_and_uncertainty(&p).is_no_data());
    }
}
