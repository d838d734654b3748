//! Calibration session lifecycle.
//!
//! A [`CalibrationRoutine`] covers one camera at one resolution. While the
//! camera is in calibration mode the capture stage feeds detections in via
//! [`CalibrationRoutine::observe`]; every observed frame is written to disk
//! first and then offered to the bounded [`SampleCache`], which decides
//! whether the file stays. Leaving calibration mode finalizes the session:
//! the retained samples become a correspondence file, the external solver
//! runs over them, and its model output is read back for publication.
//!
//! Storage layout: `<root>/<device>/<WxH>/imgN.png` plus `corners.vnl`,
//! with the solver's `camera-0.cameramodel` landing alongside.

pub mod cache;
pub mod corners;
pub mod model;
pub mod solver;

pub use cache::{CalibrationSample, Offer, SampleCache};
pub use model::CameraModel;

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use log::{info, warn};

use crate::board::{BoardDetection, BoardSpec};
use crate::frame::FrameImage;

pub const MODEL_FILE: &str = "camera-0.cameramodel";

/// Parameters for one calibration session.
#[derive(Clone, Debug)]
pub struct CalibrationConfig {
    pub storage_root: PathBuf,
    pub board: BoardSpec,
    /// Most samples kept on disk at once.
    pub capture_cap: usize,
    /// Diagonal field-of-view prior handed to the solver, in degrees.
    pub diag_fov_deg: f64,
    pub lens_model: String,
    pub solver_program: String,
    pub solver_jobs: usize,
}

pub struct CalibrationRoutine {
    cfg: CalibrationConfig,
    dir: PathBuf,
    width: u32,
    height: u32,
    cache: SampleCache,
    /// Total frames observed this session; names the next image file.
    observed: u64,
}

impl CalibrationRoutine {
    /// Opens a session for `device_key` at the given capture resolution.
    /// The storage directory is created fresh; anything a previous session
    /// for the same key left behind is removed first.
    pub fn begin(
        cfg: CalibrationConfig,
        device_key: &str,
        width: u32,
        height: u32,
    ) -> Result<Self> {
        let dir = cfg
            .storage_root
            .join(device_key)
            .join(format!("{width}x{height}"));
        // a new session for the same camera and resolution starts from
        // empty storage
        if dir.exists() {
            fs::remove_dir_all(&dir)
                .with_context(|| format!("clear calibration dir {}", dir.display()))?;
        }
        fs::create_dir_all(&dir)
            .with_context(|| format!("create calibration dir {}", dir.display()))?;
        info!("calibration session opened in {}", dir.display());
        Ok(Self {
            cache: SampleCache::new(cfg.capture_cap),
            cfg,
            dir,
            width,
            height,
            observed: 0,
        })
    }

    /// Records one detection: persists the frame as `imgN.png`, offers it
    /// to the cache, and deletes whichever file the cache declined.
    pub fn observe(&mut self, image: &FrameImage, detection: &BoardDetection) -> Result<()> {
        self.observed += 1;
        let path = self.dir.join(format!("img{}.png", self.observed));
        image.save_png(&path)?;
        let sample = CalibrationSample {
            score: detection.len() as u32,
            image_path: path,
            corner_ids: detection.corner_ids.clone(),
            corners: detection.corners.clone(),
        };
        match self.cache.offer(sample) {
            Offer::Retained => {}
            Offer::RetainedEvicting(evicted) => remove_sample_file(&evicted.image_path),
            Offer::Rejected(rejected) => remove_sample_file(&rejected.image_path),
        }
        Ok(())
    }

    pub fn sample_count(&self) -> usize {
        self.cache.len()
    }

    pub fn observed_count(&self) -> u64 {
        self.observed
    }

    /// Corners across all retained samples, for overlay painting.
    pub fn retained_corners(&self) -> impl Iterator<Item = (f32, f32)> + '_ {
        self.cache.iter().flat_map(|s| s.corners.iter().copied())
    }

    pub fn total_corners(&self) -> usize {
        self.cache.total_corners()
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn corners_path(&self) -> PathBuf {
        self.dir.join(corners::CORNERS_FILE)
    }

    pub fn model_path(&self) -> PathBuf {
        self.dir.join(MODEL_FILE)
    }

    /// Finalizes the session: writes the correspondence file (unless a
    /// previous run already left one) and hands the retained images to the
    /// external solver. Does nothing when no sample was retained.
    pub fn finish(&self) -> Result<()> {
        if self.cache.is_empty() {
            info!(
                "calibration session in {} retained no samples, skipping solve",
                self.dir.display()
            );
            return Ok(());
        }
        let corners_path = self.corners_path();
        if !corners_path.exists() {
            corners::write_corners_file(
                &corners_path,
                &self.cache.samples_by_arrival(),
                self.cfg.board.corner_count(),
            )?;
            info!(
                "wrote {} samples ({} corners) to {}",
                self.cache.len(),
                self.cache.total_corners(),
                corners_path.display()
            );
        }
        let invocation = solver::SolverInvocation {
            program: self.cfg.solver_program.clone(),
            lens_model: self.cfg.lens_model.clone(),
            focal_px: solver::estimate_focal_px(self.cfg.diag_fov_deg, self.width, self.height),
            object_width_n: self.cfg.board.interior_cols(),
            object_height_n: self.cfg.board.interior_rows(),
            object_spacing_m: self.cfg.board.square_len_m,
            corners_file: corners_path,
            work_dir: self.dir.clone(),
            image_glob: "img*.png".to_string(),
            jobs: self.cfg.solver_jobs,
        };
        solver::run_solver(&invocation)
    }

    /// Reads the solver's model output. `Ok(None)` when the solver never
    /// produced one.
    pub fn load_result(&self) -> Result<Option<CameraModel>> {
        let path = self.model_path();
        if !path.exists() {
            return Ok(None);
        }
        let text = fs::read_to_string(&path)
            .with_context(|| format!("read camera model {}", path.display()))?;
        model::parse_camera_model(&text).map(Some)
    }
}

fn remove_sample_file(path: &Path) {
    if let Err(err) = fs::remove_file(path) {
        warn!(
            "could not remove calibration sample {}: {err}",
            path.display()
        );
    }
}
