//! External solver hand-off.
//!
//! The daemon never solves the optimization itself; it shells out to an
//! mrcal-style calibrator pointed at the session's correspondence file and
//! image set, then reads the model file the solver leaves behind.

use std::path::PathBuf;
use std::process::Command;

use anyhow::{bail, Context, Result};
use log::info;

/// Focal length prior in pixels derived from a diagonal field of view.
///
/// The diagonal FOV is split into horizontal and vertical components by
/// the frame's aspect ratio, a pinhole focal is computed for each axis,
/// and the two are averaged.
pub fn estimate_focal_px(diag_fov_deg: f64, width: u32, height: u32) -> f64 {
    let w = width as f64;
    let h = height as f64;
    let diag = w.hypot(h);
    let half_tan = (diag_fov_deg.to_radians() / 2.0).tan();
    let hfov = 2.0 * (half_tan * (w / diag)).atan();
    let vfov = 2.0 * (half_tan * (h / diag)).atan();
    let fx = w / 2.0 / (hfov / 2.0).tan();
    let fy = h / 2.0 / (vfov / 2.0).tan();
    (fx + fy) / 2.0
}

/// Everything needed to invoke the calibrator for one session.
#[derive(Clone, Debug)]
pub struct SolverInvocation {
    pub program: String,
    pub lens_model: String,
    pub focal_px: f64,
    /// Interior corner columns on the board.
    pub object_width_n: u32,
    /// Interior corner rows on the board.
    pub object_height_n: u32,
    /// Corner-to-corner spacing in meters.
    pub object_spacing_m: f64,
    pub corners_file: PathBuf,
    /// Directory the solver runs in; the image glob resolves against it
    /// and the model output lands here.
    pub work_dir: PathBuf,
    pub image_glob: String,
    pub jobs: usize,
}

pub fn run_solver(inv: &SolverInvocation) -> Result<()> {
    info!(
        "running calibration solver {} in {}",
        inv.program,
        inv.work_dir.display()
    );
    let status = Command::new(&inv.program)
        .arg("--lensmodel")
        .arg(&inv.lens_model)
        .arg("--focal")
        .arg(format!("{:.1}", inv.focal_px))
        .arg("--object-width-n")
        .arg(inv.object_width_n.to_string())
        .arg("--object-height-n")
        .arg(inv.object_height_n.to_string())
        .arg("--object-spacing")
        .arg(inv.object_spacing_m.to_string())
        .arg("--corners-cache")
        .arg(&inv.corners_file)
        .arg("--jobs")
        .arg(inv.jobs.to_string())
        .arg("--outdir")
        .arg(&inv.work_dir)
        .arg(&inv.image_glob)
        .current_dir(&inv.work_dir)
        .status()
        .with_context(|| format!("spawn calibration solver '{}'", inv.program))?;
    if !status.success() {
        bail!("calibration solver '{}' failed: {status}", inv.program);
    }
    Ok(())
}

/// Parallelism to hand the solver when the configuration does not pin one.
pub fn default_jobs() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}
