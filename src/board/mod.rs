//! Calibration target geometry and the board detector seam.
//!
//! Detection itself is a collaborator: the pipeline only needs interior
//! corner identities and pixel positions, so any detector that can produce
//! those plugs in behind [`BoardDetector`]. The built-in `grid` detector is
//! synthetic and content-driven, which keeps the calibration path fully
//! exercisable without camera hardware or an external vision stack.

pub mod stub;

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

use crate::frame::FrameImage;

pub use stub::GridStubDetector;

/// Calibration target geometry.
///
/// `squares_w` and `squares_h` count squares, not corners; the detectable
/// interior corner grid is one smaller in each direction.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BoardSpec {
    pub squares_w: u32,
    pub squares_h: u32,
    /// Square edge length in meters.
    pub square_len_m: f64,
    /// Marker edge length in meters; must fit inside a square.
    pub marker_len_m: f64,
}

impl BoardSpec {
    pub fn interior_cols(&self) -> u32 {
        self.squares_w.saturating_sub(1)
    }

    pub fn interior_rows(&self) -> u32 {
        self.squares_h.saturating_sub(1)
    }

    /// Total interior corners a full detection can report.
    pub fn corner_count(&self) -> u32 {
        self.interior_cols() * self.interior_rows()
    }

    pub fn validate(&self) -> Result<()> {
        if self.squares_w < 2 || self.squares_h < 2 {
            return Err(anyhow!(
                "board must be at least 2x2 squares, got {}x{}",
                self.squares_w,
                self.squares_h
            ));
        }
        if self.square_len_m <= 0.0 {
            return Err(anyhow!("board square length must be positive"));
        }
        if self.marker_len_m <= 0.0 || self.marker_len_m >= self.square_len_m {
            return Err(anyhow!(
                "marker length must be positive and smaller than the square length"
            ));
        }
        Ok(())
    }
}

/// Interior corners found in one frame.
///
/// `corner_ids` and `corners` are parallel: the id indexes the board's
/// interior corner grid in row-major order, the position is in pixels.
#[derive(Clone, Debug, Default)]
pub struct BoardDetection {
    pub corner_ids: Vec<u32>,
    pub corners: Vec<(f32, f32)>,
}

impl BoardDetection {
    pub fn len(&self) -> usize {
        self.corner_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.corner_ids.is_empty()
    }
}

/// Board corner detector. Constructed per camera via [`build_detector`]
/// and driven on that camera's calibration branch thread.
pub trait BoardDetector: Send {
    fn name(&self) -> &'static str;

    /// Finds interior corners of the board in a frame. An empty detection
    /// is normal (no board in view); `Err` means the detector itself
    /// failed on this frame.
    fn detect(&mut self, image: &FrameImage) -> Result<BoardDetection>;
}

/// Builds a detector by kind for the given board. Unrecognized kinds fail
/// with an explicit error instead of silently falling back.
impl std::fmt::Debug for dyn BoardDetector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoardDetector")
            .field("name", &self.name())
            .finish()
    }
}

pub fn build_detector(kind: &str, board: &BoardSpec) -> Result<Box<dyn BoardDetector>> {
    match kind {
        "grid" => Ok(Box::new(GridStubDetector::new(board.clone()))),
        other => Err(anyhow!("unrecognized board detector '{other}'")),
    }
}
