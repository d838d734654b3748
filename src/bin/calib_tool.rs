//! calib_tool - offline camera calibration over a stored session folder
//!
//! Re-runs the daemon's calibration back-end on a directory of captured
//! frames:
//! 1. Detects board corners across the imgN.png files (worker pool)
//! 2. Retains the best-scoring samples, like the live capture cache
//! 3. Writes the correspondence file and invokes the external solver
//! 4. Prints the resulting camera model
//!
//! With `--from-corners` the detection steps are skipped and the solver
//! runs over the correspondence file a previous run left behind.

use anyhow::{bail, Context, Result};
use clap::Parser;
use crossbeam_channel::unbounded;
use std::io::{BufReader, IsTerminal};
use std::path::{Path, PathBuf};

use facet_vision::board::{build_detector, BoardDetection, BoardSpec};
use facet_vision::calib::corners::{self, CORNERS_FILE};
use facet_vision::calib::model::parse_camera_model;
use facet_vision::calib::solver::{self, SolverInvocation};
use facet_vision::calib::{CalibrationSample, SampleCache, MODEL_FILE};
use facet_vision::ui::Ui;
use facet_vision::FrameImage;

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Offline camera calibration over a stored session folder"
)]
struct Args {
    /// Session directory holding imgN.png captures; the correspondence
    /// file and the solver output land here too.
    dir: PathBuf,

    /// Board squares across.
    #[arg(long, default_value_t = 15)]
    squares_w: u32,

    /// Board squares down.
    #[arg(long, default_value_t = 15)]
    squares_h: u32,

    /// Square edge length in meters.
    #[arg(long, default_value_t = 0.03)]
    square_len: f64,

    /// Marker edge length in meters.
    #[arg(long, default_value_t = 0.022)]
    marker_len: f64,

    /// Board detector kind.
    #[arg(long, default_value = "grid")]
    detector: String,

    /// Most samples retained for the solve.
    #[arg(long, default_value_t = 1000)]
    cap: usize,

    /// Diagonal field-of-view prior in degrees.
    #[arg(long, default_value_t = 55.0)]
    fov_deg: f64,

    /// Lens model the solver fits.
    #[arg(long, default_value = "LENSMODEL_OPENCV8")]
    lens_model: String,

    /// Solver executable.
    #[arg(long, env = "FACET_SOLVER", default_value = "mrcal-calibrate-cameras")]
    solver: String,

    /// Detection worker threads and solver jobs. Defaults to the available
    /// parallelism.
    #[arg(long)]
    jobs: Option<usize>,

    /// Stop after writing the correspondence file.
    #[arg(long)]
    no_solve: bool,

    /// Solve over the directory's existing correspondence file instead of
    /// re-detecting, e.g. to refit with a different lens model.
    #[arg(long, conflicts_with = "no_solve")]
    from_corners: bool,

    /// Only print the model a previous solve left in the directory.
    #[arg(long)]
    show_model: bool,

    /// UI mode for stderr progress (auto|plain|pretty)
    #[arg(long, default_value = "auto", value_name = "MODE")]
    ui: String,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let ui = Ui::from_flag(Some(args.ui.as_str()), std::io::stderr().is_terminal());

    if args.show_model {
        return print_model(&args.dir.join(MODEL_FILE));
    }

    let board = BoardSpec {
        squares_w: args.squares_w,
        squares_h: args.squares_h,
        square_len_m: args.square_len,
        marker_len_m: args.marker_len,
    };
    board.validate()?;

    if args.from_corners {
        return solve_existing(&ui, &args, &board);
    }

    let files = session_images(&args.dir)?;
    if files.is_empty() {
        bail!("no imgN.png captures under {}", args.dir.display());
    }
    let jobs = args.jobs.unwrap_or_else(solver::default_jobs).max(1);
    let detected = detect_corners(&ui, &args.detector, &board, &files, jobs)?;

    // one session directory covers one capture resolution
    let (width, height) = (detected[0].width, detected[0].height);
    if let Some(odd) = detected
        .iter()
        .find(|d| (d.width, d.height) != (width, height))
    {
        bail!(
            "{} is {}x{}px but the session started at {width}x{height}px",
            odd.path.display(),
            odd.width,
            odd.height
        );
    }

    let total = detected.len();
    let mut cache = SampleCache::new(args.cap);
    let mut empty = 0usize;
    for found in detected {
        if found.detection.is_empty() {
            empty += 1;
            continue;
        }
        cache.offer(CalibrationSample {
            score: found.detection.len() as u32,
            image_path: found.path,
            corner_ids: found.detection.corner_ids,
            corners: found.detection.corners,
        });
    }
    if cache.is_empty() {
        bail!("the board was not detected in any of the {total} captures");
    }
    if empty > 0 {
        log::info!("{empty} captures had no detectable board");
    }

    let corners_path = args.dir.join(CORNERS_FILE);
    {
        let _stage = ui.stage("Write correspondences");
        corners::write_corners_file(
            &corners_path,
            &cache.samples_by_arrival(),
            board.corner_count(),
        )?;
    }
    println!(
        "{} of {total} captures retained ({} corners), wrote {}",
        cache.len(),
        cache.total_corners(),
        corners_path.display()
    );

    if args.no_solve {
        return Ok(());
    }

    let invocation = SolverInvocation {
        program: args.solver.clone(),
        lens_model: args.lens_model.clone(),
        focal_px: solver::estimate_focal_px(args.fov_deg, width, height),
        object_width_n: board.interior_cols(),
        object_height_n: board.interior_rows(),
        object_spacing_m: board.square_len_m,
        corners_file: corners_path,
        work_dir: args.dir.clone(),
        image_glob: "img*.png".to_string(),
        jobs,
    };
    {
        let _stage = ui.stage("Solve");
        solver::run_solver(&invocation)?;
    }
    print_model(&args.dir.join(MODEL_FILE))
}

/// Re-runs the solver over an existing correspondence file. The image size
/// for the focal prior comes from the first capture the file references.
fn solve_existing(ui: &Ui, args: &Args, board: &BoardSpec) -> Result<()> {
    let corners_path = args.dir.join(CORNERS_FILE);
    let file = std::fs::File::open(&corners_path)
        .with_context(|| format!("open correspondence file {}", corners_path.display()))?;
    let samples = corners::parse_corners(BufReader::new(file))?;
    if samples.is_empty() {
        bail!("{} holds no samples", corners_path.display());
    }
    let first = args.dir.join(&samples[0].filename);
    let image = FrameImage::load_png(&first)?;
    let observed: usize = samples
        .iter()
        .flat_map(|sample| &sample.corners)
        .filter(|corner| corner.is_some())
        .count();
    println!(
        "{} samples ({observed} corners) in {}",
        samples.len(),
        corners_path.display()
    );

    let invocation = SolverInvocation {
        program: args.solver.clone(),
        lens_model: args.lens_model.clone(),
        focal_px: solver::estimate_focal_px(args.fov_deg, image.width(), image.height()),
        object_width_n: board.interior_cols(),
        object_height_n: board.interior_rows(),
        object_spacing_m: board.square_len_m,
        corners_file: corners_path,
        work_dir: args.dir.clone(),
        image_glob: "img*.png".to_string(),
        jobs: args.jobs.unwrap_or_else(solver::default_jobs).max(1),
    };
    {
        let _stage = ui.stage("Solve");
        solver::run_solver(&invocation)?;
    }
    print_model(&args.dir.join(MODEL_FILE))
}

/// The session's captures in arrival order (imgN.png sorted by N).
fn session_images(dir: &Path) -> Result<Vec<PathBuf>> {
    let entries = std::fs::read_dir(dir)
        .with_context(|| format!("read session directory {}", dir.display()))?;
    let mut numbered = Vec::new();
    for entry in entries {
        let entry = entry.context("scan session directory")?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        let Some(number) = name
            .strip_prefix("img")
            .and_then(|rest| rest.strip_suffix(".png"))
            .and_then(|digits| digits.parse::<u64>().ok())
        else {
            continue;
        };
        numbered.push((number, entry.path()));
    }
    numbered.sort_by_key(|(number, _)| *number);
    Ok(numbered.into_iter().map(|(_, path)| path).collect())
}

struct Detected {
    index: usize,
    path: PathBuf,
    width: u32,
    height: u32,
    detection: BoardDetection,
}

/// Runs the detector over every capture on a small worker pool. Unreadable
/// files are skipped with a warning; only a fully empty batch is an error.
fn detect_corners(
    ui: &Ui,
    detector_kind: &str,
    board: &BoardSpec,
    files: &[PathBuf],
    jobs: usize,
) -> Result<Vec<Detected>> {
    let workers = jobs.min(files.len()).max(1);
    // detectors are built up front so factory errors surface before any
    // thread spawns
    let mut detectors = Vec::with_capacity(workers);
    for _ in 0..workers {
        detectors.push(build_detector(detector_kind, board)?);
    }

    let progress = ui.progress("Detect corners", files.len() as u64);
    let (job_tx, job_rx) = unbounded::<(usize, PathBuf)>();
    let (done_tx, done_rx) = unbounded::<Result<Detected>>();
    for job in files.iter().cloned().enumerate() {
        // the receiver outlives this loop, the queue cannot reject
        let _ = job_tx.send(job);
    }
    drop(job_tx);

    let mut pool = Vec::with_capacity(workers);
    for (worker, mut detector) in detectors.into_iter().enumerate() {
        let job_rx = job_rx.clone();
        let done_tx = done_tx.clone();
        let handle = std::thread::Builder::new()
            .name(format!("detect-{worker}"))
            .spawn(move || {
                for (index, path) in job_rx.iter() {
                    let result = FrameImage::load_png(&path).and_then(|image| {
                        let detection = detector.detect(&image)?;
                        Ok(Detected {
                            index,
                            width: image.width(),
                            height: image.height(),
                            path,
                            detection,
                        })
                    });
                    if done_tx.send(result).is_err() {
                        break;
                    }
                }
            })
            .context("spawn detection worker")?;
        pool.push(handle);
    }
    drop(done_tx);

    let mut detected = Vec::with_capacity(files.len());
    let mut failures = 0usize;
    for result in done_rx.iter() {
        progress.inc();
        match result {
            Ok(found) => detected.push(found),
            Err(err) => {
                failures += 1;
                log::warn!("skipping capture: {err:#}");
            }
        }
    }
    for handle in pool {
        if handle.join().is_err() {
            bail!("a detection worker panicked");
        }
    }
    if detected.is_empty() {
        bail!("none of the {} captures could be processed", files.len());
    }
    if failures > 0 {
        log::warn!("{failures} of {} captures skipped", files.len());
    }
    detected.sort_by_key(|found| found.index);
    Ok(detected)
}

fn print_model(path: &Path) -> Result<()> {
    if !path.exists() {
        bail!("no camera model at {}", path.display());
    }
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("read camera model {}", path.display()))?;
    let model = parse_camera_model(&text)?;
    println!("camera model {}", path.display());
    println!("  lensmodel    {}", model.lens_model);
    println!(
        "  imagersize   {}x{}px",
        model.imager_size.0, model.imager_size.1
    );
    println!(
        "  focal        fx {:.2} fy {:.2} px",
        model.intrinsics[0], model.intrinsics[1]
    );
    println!(
        "  center       cx {:.2} cy {:.2} px",
        model.intrinsics[2], model.intrinsics[3]
    );
    println!("  distortion   {} terms", model.intrinsics.len() - 4);
    if !model.valid_intrinsics_region.is_empty() {
        println!(
            "  valid region {} vertices",
            model.valid_intrinsics_region.len()
        );
    }
    Ok(())
}
