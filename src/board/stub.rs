//! Synthetic board detector.

use anyhow::Result;

use crate::board::{BoardDetection, BoardDetector, BoardSpec};
use crate::frame::FrameImage;

/// Content-driven synthetic detector.
///
/// Projects the board's interior corner grid evenly across the frame and
/// reports a corner wherever the local luma clears the threshold. Bright
/// frames yield full boards, dark frames nothing, and partially lit frames
/// partial detections, so tests and bench rigs script detection quality
/// with plain image content.
pub struct GridStubDetector {
    board: BoardSpec,
    threshold: u8,
}

impl GridStubDetector {
    pub fn new(board: BoardSpec) -> Self {
        Self::with_threshold(board, 128)
    }

    pub fn with_threshold(board: BoardSpec, threshold: u8) -> Self {
        Self { board, threshold }
    }
}

impl BoardDetector for GridStubDetector {
    fn name(&self) -> &'static str {
        "grid"
    }

    fn detect(&mut self, image: &FrameImage) -> Result<BoardDetection> {
        let (w, h) = (image.width(), image.height());
        let mut detection = BoardDetection::default();
        if w < 2 || h < 2 {
            return Ok(detection);
        }

        let cols = self.board.interior_cols();
        let rows = self.board.interior_rows();
        for row in 0..rows {
            for col in 0..cols {
                let x = (col + 1) as f32 / (cols + 1) as f32 * (w - 1) as f32;
                let y = (row + 1) as f32 / (rows + 1) as f32 * (h - 1) as f32;
                let px = image.pixel(x.round() as u32, y.round() as u32);
                let luma =
                    0.299 * px[0] as f32 + 0.587 * px[1] as f32 + 0.114 * px[2] as f32;
                if luma >= self.threshold as f32 {
                    detection.corner_ids.push(row * cols + col);
                    detection.corners.push((x, y));
                }
            }
        }
        Ok(detection)
    }
}
