//! Frame-rate annotation.

use std::time::Instant;

use crate::capture::Capture;
use crate::graph::{EdgeReceiver, EdgeSender, Node};

/// Smoothing factor for the rate EMA.
pub const RATE_ALPHA: f64 = 0.2;

/// Exponential moving average of the instantaneous arrival rate.
///
/// The first observation reports 0: a single sample carries no interval,
/// and starting from 0 makes the readout ramp up visibly instead of
/// opening on a noise value.
pub struct RateEstimator {
    alpha: f64,
    value: f64,
    last: Option<Instant>,
}

impl RateEstimator {
    pub fn new(alpha: f64) -> Self {
        Self {
            alpha,
            value: 0.0,
            last: None,
        }
    }

    pub fn observe(&mut self, now: Instant) -> f64 {
        if let Some(prev) = self.last.replace(now) {
            let dt = now.duration_since(prev).as_secs_f64();
            if dt > 0.0 {
                self.value = (1.0 - self.alpha) * self.value + self.alpha * (1.0 / dt);
            }
        }
        self.value
    }

    pub fn value(&self) -> f64 {
        self.value
    }
}

/// Annotates passing captures with the smoothed rate under the key
/// `<label>_fps`, which is also the node name.
pub struct RateNode {
    name: String,
    input: EdgeReceiver<Capture>,
    output: EdgeSender<Capture>,
    estimator: RateEstimator,
}

impl RateNode {
    pub fn new(label: &str, input: EdgeReceiver<Capture>, output: EdgeSender<Capture>) -> Self {
        Self {
            name: format!("{label}_fps"),
            input,
            output,
            estimator: RateEstimator::new(RATE_ALPHA),
        }
    }
}

impl Node for RateNode {
    fn name(&self) -> &str {
        &self.name
    }

    fn step(&mut self) {
        let Some(mut capture) = self.input.poll() else {
            return;
        };
        let rate = self.estimator.observe(Instant::now());
        capture.metadata.set(&self.name, rate);
        self.output.offer(capture);
    }
}
