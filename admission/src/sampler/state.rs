//! Per-category rate estimation and probability control.

use serde::Serialize;
use std::time::Instant;

/// Tuning parameters for [`SamplingState::roll_window`].
#[derive(Debug, Clone, Copy)]
pub struct Controller {
    /// EWMA smoothing factor.
    pub alpha: f64,
    /// Relative dead band around the target.
    pub hysteresis: f64,
    /// Largest relative probability change per window.
    pub max_adjustment: f64,
    /// Probability floor for non-zero targets.
    pub min_probability: f64,
}

/// Sampling state of one category.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SamplingState {
    /// Smoothed incoming rate in records/s; `None` before the first window closes.
    pub ewma_rate: Option<f64>,
    /// Current admission probability in `[0, 1]`.
    pub probability: f64,
    /// Target admitted rate in records/s.
    pub target_rate: f64,
    /// Records observed in the open window.
    pub window_count: u64,
    #[serde(skip)]
    window_started: Instant,
    #[serde(skip)]
    last_update: Instant,
}

impl SamplingState {
    /// Creates state for a newly observed category.
    ///
    /// Categories start fully admitted; a zero target starts fully dropped.
    #[must_use]
    pub fn new(target_rate: f64, now: Instant) -> Self {
        Self {
            ewma_rate: None,
            probability: if target_rate > 0.0 { 1.0 } else { 0.0 },
            target_rate,
            window_count: 0,
            window_started: now,
            last_update: now,
        }
    }

    /// Counts one incoming record and returns the probability to apply.
    pub fn observe(&mut self) -> f64 {
        self.window_count += 1;
        self.probability
    }

    /// Instant of the last probability update.
    #[must_use]
    pub const fn last_update(&self) -> Instant {
        self.last_update
    }

    /// Closes the open window: folds its rate into the EWMA and moves the
    /// probability toward `target / ewma` by at most one bounded step.
    ///
    /// Windows shorter than a millisecond are left open.
    pub fn roll_window(&mut self, now: Instant, ctl: &Controller) {
        let elapsed = now.saturating_duration_since(self.window_started).as_secs_f64();
        if elapsed < 1e-3 {
            return;
        }
        let rate = self.window_count as f64 / elapsed;
        let ewma = match self.ewma_rate {
            Some(prev) => ctl.alpha * rate + (1.0 - ctl.alpha) * prev,
            None => rate,
        };
        self.ewma_rate = Some(ewma);
        self.probability = next_probability(self.probability, ewma, self.target_rate, ctl);
        self.window_count = 0;
        self.window_started = now;
        self.last_update = now;
    }
}

fn next_probability(current: f64, ewma: f64, target: f64, ctl: &Controller) -> f64 {
    if target <= 0.0 {
        return 0.0;
    }
    let ideal = if ewma > 0.0 { (target / ewma).min(1.0) } else { 1.0 };
    let expected = ewma * current;
    let next = if expected > target * (1.0 + ctl.hysteresis) {
        ideal.max(current * (1.0 - ctl.max_adjustment))
    } else if expected < target * (1.0 - ctl.hysteresis) {
        ideal.min(current * (1.0 + ctl.max_adjustment))
    } else {
        current
    };
    next.clamp(ctl.min_probability.min(1.0), 1.0)
}
