//! Focus scoring for lens adjustment.
//!
//! Sharpness comes from a modified-Laplacian response: a discrete second
//! derivative evaluated along both axes with absolute responses summed,
//! averaged over a centered region of interest. The raw score has no
//! absolute meaning, so the meter normalizes against the best score seen
//! in a rolling window and reports a percentage: turn the focus ring until
//! the number stops climbing.

use std::collections::VecDeque;

use crate::capture::Capture;
use crate::frame::FrameImage;
use crate::graph::{EdgeReceiver, EdgeSender, Node};

/// Metadata key written by [`FocusNode`].
pub const FOCUS_KEY: &str = "percent_focus";

/// Rolling window over which raw scores are normalized.
pub const FOCUS_WINDOW_S: f64 = 10.0;

const ROI_COLOR: [u8; 3] = [240, 200, 40];
const TREND_COLOR: [u8; 3] = [80, 220, 80];
const CEILING_COLOR: [u8; 3] = [140, 140, 140];

/// Pixel region in frame coordinates.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Region {
    pub x: u32,
    pub y: u32,
    pub w: u32,
    pub h: u32,
}

/// Mean modified-Laplacian response over a region of a luma plane.
/// Neighbors are clamped at the region border (replicate boundary).
pub fn modified_laplacian(luma: &[u8], width: u32, height: u32, region: Region) -> f64 {
    let w = width as usize;
    debug_assert_eq!(luma.len(), w * height as usize);

    let x0 = region.x.min(width) as usize;
    let y0 = region.y.min(height) as usize;
    let rw = (region.w as usize).min(w - x0);
    let rh = (region.h as usize).min(height as usize - y0);
    if rw == 0 || rh == 0 {
        return 0.0;
    }

    let sample = |x: usize, y: usize| luma[y * w + x] as f64 / 255.0;
    let mut sum = 0.0;
    for y in y0..y0 + rh {
        let up = if y > y0 { y - 1 } else { y };
        let down = if y + 1 < y0 + rh { y + 1 } else { y };
        for x in x0..x0 + rw {
            let left = if x > x0 { x - 1 } else { x };
            let right = if x + 1 < x0 + rw { x + 1 } else { x };
            let center = sample(x, y);
            sum += (2.0 * center - sample(left, y) - sample(right, y)).abs()
                + (2.0 * center - sample(x, up) - sample(x, down)).abs();
        }
    }
    sum / (rw * rh) as f64
}

/// Stateful focus meter: centered fractional ROI, rolling score history,
/// max-normalized percentage.
pub struct FocusMeter {
    roi_width_frac: f64,
    roi_height_frac: f64,
    window_s: f64,
    history: VecDeque<(f64, f64)>,
}

impl FocusMeter {
    pub fn new(roi_width_frac: f64, roi_height_frac: f64, window_s: f64) -> Self {
        Self {
            roi_width_frac: roi_width_frac.clamp(0.0, 1.0),
            roi_height_frac: roi_height_frac.clamp(0.0, 1.0),
            window_s,
            history: VecDeque::new(),
        }
    }

    /// Whole-frame ROI with the default window.
    pub fn full_frame() -> Self {
        Self::new(1.0, 1.0, FOCUS_WINDOW_S)
    }

    pub fn region(&self, width: u32, height: u32) -> Region {
        let rw = ((width as f64 * self.roi_width_frac).round() as u32).clamp(1, width.max(1));
        let rh = ((height as f64 * self.roi_height_frac).round() as u32).clamp(1, height.max(1));
        Region {
            x: (width - rw) / 2,
            y: (height - rh) / 2,
            w: rw,
            h: rh,
        }
    }

    /// Scores one frame and returns the window-normalized percentage.
    /// A window with no signal at all (for example an all-black frame on a
    /// capped lens) reports 0 rather than dividing by zero.
    pub fn measure(&mut self, timestamp_s: f64, luma: &[u8], width: u32, height: u32) -> f64 {
        let raw = modified_laplacian(luma, width, height, self.region(width, height));
        while let Some(&(t, _)) = self.history.front() {
            if timestamp_s - t > self.window_s {
                self.history.pop_front();
            } else {
                break;
            }
        }
        self.history.push_back((timestamp_s, raw));
        let max = self.history.iter().fold(0.0_f64, |acc, &(_, s)| acc.max(s));
        if max <= 0.0 {
            0.0
        } else {
            raw / max * 100.0
        }
    }

    pub fn history_len(&self) -> usize {
        self.history.len()
    }

    /// ROI rectangle plus the score trend in the bottom-left quadrant.
    /// The gray ceiling line marks where the rolling-window max sits.
    pub fn paint(&self, image: &mut FrameImage) {
        let region = self.region(image.width(), image.height());
        image.draw_rect(region.x, region.y, region.w, region.h, ROI_COLOR);

        let max = self.history.iter().fold(0.0_f64, |acc, &(_, s)| acc.max(s));
        if self.history.len() < 2 || max <= 0.0 {
            return;
        }
        let graph_w = (image.width() / 2).max(2) as i64;
        let graph_h = (image.height() / 2).max(2) as i64;
        let base = image.height() as i64 - 1;
        let n = self.history.len() as i64;
        let mut prev: Option<(i64, i64)> = None;
        for (i, &(_, score)) in self.history.iter().enumerate() {
            let x = i as i64 * (graph_w - 1) / (n - 1);
            let y = base - ((score / max) * (graph_h - 1) as f64).round() as i64;
            if let Some((px, py)) = prev {
                image.draw_line(px, py, x, y, TREND_COLOR);
            }
            prev = Some((x, y));
        }
        image.draw_line(0, base - (graph_h - 1), graph_w - 1, base - (graph_h - 1), CEILING_COLOR);
    }
}

/// Scores captures and paints the focus overlay.
pub struct FocusNode {
    name: String,
    input: EdgeReceiver<Capture>,
    output: EdgeSender<Capture>,
    meter: FocusMeter,
}

impl FocusNode {
    pub fn new(
        name: &str,
        input: EdgeReceiver<Capture>,
        output: EdgeSender<Capture>,
        meter: FocusMeter,
    ) -> Self {
        Self {
            name: name.to_string(),
            input,
            output,
            meter,
        }
    }
}

impl Node for FocusNode {
    fn name(&self) -> &str {
        &self.name
    }

    fn step(&mut self) {
        let Some(mut capture) = self.input.poll() else {
            return;
        };
        let luma = capture.image.luma_plane();
        let pct = self.meter.measure(
            capture.meta.timestamp_s,
            &luma,
            capture.image.width(),
            capture.image.height(),
        );
        self.meter.paint(&mut capture.image);
        capture.metadata.set(FOCUS_KEY, pct);
        self.output.offer(capture);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::FrameMeta;
    use crate::graph::edge;

    fn full(width: u32, height: u32) -> Region {
        Region {
            x: 0,
            y: 0,
            w: width,
            h: height,
        }
    }

    fn stripes(width: u32, height: u32) -> Vec<u8> {
        let mut luma = Vec::with_capacity((width * height) as usize);
        for _ in 0..height {
            for x in 0..width {
                luma.push(if x % 2 == 0 { 0 } else { 255 });
            }
        }
        luma
    }

    fn gradient(width: u32, height: u32) -> Vec<u8> {
        let mut luma = Vec::with_capacity((width * height) as usize);
        for _ in 0..height {
            for x in 0..width {
                luma.push((x * 255 / width.max(1)) as u8);
            }
        }
        luma
    }

    #[test]
    fn flat_frame_scores_zero() {
        let luma = vec![77u8; 64];
        assert_eq!(modified_laplacian(&luma, 8, 8, full(8, 8)), 0.0);
    }

    #[test]
    fn sharp_pattern_outscores_smooth_ramp() {
        let sharp = modified_laplacian(&stripes(16, 16), 16, 16, full(16, 16));
        let smooth = modified_laplacian(&gradient(16, 16), 16, 16, full(16, 16));
        assert!(
            sharp > smooth * 4.0,
            "sharp {sharp} should beat smooth {smooth}"
        );
    }

    #[test]
    fn black_window_reports_zero_without_nan() {
        let mut meter = FocusMeter::full_frame();
        let luma = vec![0u8; 64];
        for i in 0..5 {
            let pct = meter.measure(i as f64 * 0.1, &luma, 8, 8);
            assert_eq!(pct, 0.0);
            assert!(pct.is_finite());
        }
    }

    #[test]
    fn best_frame_in_window_reads_one_hundred() {
        let mut meter = FocusMeter::full_frame();
        meter.measure(0.0, &gradient(16, 16), 16, 16);
        let pct = meter.measure(1.0, &stripes(16, 16), 16, 16);
        assert!((pct - 100.0).abs() < 1e-9, "got {pct}");
        // A worse frame afterwards reads below 100.
        let pct = meter.measure(2.0, &gradient(16, 16), 16, 16);
        assert!(pct < 100.0 && pct > 0.0, "got {pct}");
    }

    #[test]
    fn history_evicts_entries_older_than_window() {
        let mut meter = FocusMeter::new(1.0, 1.0, 10.0);
        meter.measure(0.0, &stripes(16, 16), 16, 16);
        meter.measure(5.0, &gradient(16, 16), 16, 16);
        assert_eq!(meter.history_len(), 2);
        // Both prior entries fall outside the window at t=16, so the dull
        // frame becomes its own maximum again.
        let pct = meter.measure(16.0, &gradient(16, 16), 16, 16);
        assert_eq!(meter.history_len(), 1);
        assert!((pct - 100.0).abs() < 1e-9, "got {pct}");
    }

    #[test]
    fn centered_region_has_expected_bounds() {
        let meter = FocusMeter::new(0.5, 0.5, FOCUS_WINDOW_S);
        let region = meter.region(100, 60);
        assert_eq!(region, Region { x: 25, y: 15, w: 50, h: 30 });
    }

    #[test]
    fn node_annotates_percent_focus() {
        let (in_tx, in_rx) = edge("in");
        let (out_tx, out_rx) = edge("out");
        let mut node = FocusNode::new("focus", in_rx, out_tx, FocusMeter::full_frame());

        in_tx.offer(Capture::new(
            FrameMeta {
                sequence: 0,
                timestamp_s: 0.0,
            },
            FrameImage::black(16, 16),
        ));
        node.step();
        let capture = out_rx.try_take().unwrap();
        assert_eq!(capture.metadata.get(FOCUS_KEY), Some(0.0));
    }
}
