use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::board::BoardSpec;
use crate::calib::CalibrationConfig;

const DEFAULT_NAMESPACE: &str = "cameras";
const DEFAULT_STREAM_HOST: &str = "127.0.0.1";
const DEFAULT_STREAM_BASE_PORT: u16 = 5820;
const DEFAULT_DETECTOR: &str = "grid";
const DEFAULT_STORAGE_ROOT: &str = "calibration";
const DEFAULT_BOARD_SQUARES: u32 = 15;
const DEFAULT_SQUARE_LEN_M: f64 = 0.03;
const DEFAULT_MARKER_LEN_M: f64 = 0.022;
const DEFAULT_CAPTURE_CAP: usize = 1000;
const DEFAULT_DIAG_FOV_DEG: f64 = 55.0;
const DEFAULT_LENS_MODEL: &str = "LENSMODEL_OPENCV8";
const DEFAULT_SOLVER: &str = "mrcal-calibrate-cameras";

#[derive(Debug, Deserialize, Default)]
struct FacetdConfigFile {
    namespace: Option<String>,
    broker: Option<String>,
    stream: Option<StreamConfigFile>,
    sources: Option<Vec<String>>,
    detector: Option<String>,
    calibration: Option<CalibrationConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct StreamConfigFile {
    host: Option<String>,
    base_port: Option<u16>,
}

#[derive(Debug, Deserialize, Default)]
struct CalibrationConfigFile {
    storage_root: Option<PathBuf>,
    board: Option<BoardConfigFile>,
    capture_cap: Option<usize>,
    diag_fov_deg: Option<f64>,
    lens_model: Option<String>,
    solver_program: Option<String>,
    solver_jobs: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
struct BoardConfigFile {
    squares_w: Option<u32>,
    squares_h: Option<u32>,
    square_len_m: Option<f64>,
    marker_len_m: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct FacetdConfig {
    /// Root table name all camera namespaces live under.
    pub namespace: String,
    /// Remote table broker, e.g. `mqtt://10.0.0.2:1883`. `None` keeps the
    /// table in-process, which is what the tests and bench setups use.
    pub broker: Option<String>,
    pub stream: StreamSettings,
    /// Extra camera sources opened in addition to discovered `/dev/video*`
    /// nodes, e.g. `stub://checker`.
    pub sources: Vec<String>,
    /// Board detector kind, resolved through the detector factory.
    pub detector: String,
    pub calibration: CalibrationConfig,
}

#[derive(Debug, Clone)]
pub struct StreamSettings {
    /// Hostname advertised in published stream URLs.
    pub host: String,
    /// First debug stream port; each camera takes the next one up.
    pub base_port: u16,
}

impl FacetdConfig {
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("FACET_CONFIG").ok();
        Self::load_from(config_path.as_deref().map(Path::new))
    }

    /// Like [`load`](Self::load) but with the file path supplied by the
    /// caller, e.g. from a CLI flag.
    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let file_cfg = match path {
            Some(path) => Some(read_config_file(path)?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default());
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: FacetdConfigFile) -> Self {
        let namespace = file
            .namespace
            .unwrap_or_else(|| DEFAULT_NAMESPACE.to_string());
        let stream = StreamSettings {
            host: file
                .stream
                .as_ref()
                .and_then(|stream| stream.host.clone())
                .unwrap_or_else(|| DEFAULT_STREAM_HOST.to_string()),
            base_port: file
                .stream
                .as_ref()
                .and_then(|stream| stream.base_port)
                .unwrap_or(DEFAULT_STREAM_BASE_PORT),
        };
        let detector = file.detector.unwrap_or_else(|| DEFAULT_DETECTOR.to_string());
        let calib_file = file.calibration.unwrap_or_default();
        let board_file = calib_file.board.unwrap_or_default();
        let calibration = CalibrationConfig {
            storage_root: calib_file
                .storage_root
                .unwrap_or_else(|| PathBuf::from(DEFAULT_STORAGE_ROOT)),
            board: BoardSpec {
                squares_w: board_file.squares_w.unwrap_or(DEFAULT_BOARD_SQUARES),
                squares_h: board_file.squares_h.unwrap_or(DEFAULT_BOARD_SQUARES),
                square_len_m: board_file.square_len_m.unwrap_or(DEFAULT_SQUARE_LEN_M),
                marker_len_m: board_file.marker_len_m.unwrap_or(DEFAULT_MARKER_LEN_M),
            },
            capture_cap: calib_file.capture_cap.unwrap_or(DEFAULT_CAPTURE_CAP),
            diag_fov_deg: calib_file.diag_fov_deg.unwrap_or(DEFAULT_DIAG_FOV_DEG),
            lens_model: calib_file
                .lens_model
                .unwrap_or_else(|| DEFAULT_LENS_MODEL.to_string()),
            solver_program: calib_file
                .solver_program
                .unwrap_or_else(|| DEFAULT_SOLVER.to_string()),
            solver_jobs: resolve_jobs(calib_file.solver_jobs),
        };
        Self {
            namespace,
            broker: file.broker,
            stream,
            sources: file.sources.unwrap_or_default(),
            detector,
            calibration,
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(namespace) = std::env::var("FACET_NAMESPACE") {
            if !namespace.trim().is_empty() {
                self.namespace = namespace;
            }
        }
        if let Ok(broker) = std::env::var("FACET_BROKER") {
            if !broker.trim().is_empty() {
                self.broker = Some(broker);
            }
        }
        if let Ok(host) = std::env::var("FACET_STREAM_HOST") {
            if !host.trim().is_empty() {
                self.stream.host = host;
            }
        }
        if let Ok(port) = std::env::var("FACET_STREAM_PORT") {
            self.stream.base_port = port
                .parse()
                .map_err(|_| anyhow!("FACET_STREAM_PORT must be a port number"))?;
        }
        if let Ok(sources) = std::env::var("FACET_SOURCES") {
            let parsed = split_csv(&sources);
            if !parsed.is_empty() {
                self.sources = parsed;
            }
        }
        if let Ok(detector) = std::env::var("FACET_DETECTOR") {
            if !detector.trim().is_empty() {
                self.detector = detector;
            }
        }
        if let Ok(root) = std::env::var("FACET_STORAGE") {
            if !root.trim().is_empty() {
                self.calibration.storage_root = PathBuf::from(root);
            }
        }
        if let Ok(solver) = std::env::var("FACET_SOLVER") {
            if !solver.trim().is_empty() {
                self.calibration.solver_program = solver;
            }
        }
        if let Ok(fov) = std::env::var("FACET_FOV_DEG") {
            self.calibration.diag_fov_deg = fov
                .parse()
                .map_err(|_| anyhow!("FACET_FOV_DEG must be a number of degrees"))?;
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.namespace.trim().is_empty() {
            return Err(anyhow!("table namespace must not be empty"));
        }
        if self.stream.base_port == 0 {
            return Err(anyhow!("stream base port must be nonzero"));
        }
        self.calibration.board.validate()?;
        // fail fast on detector kinds the factory does not know
        crate::board::build_detector(&self.detector, &self.calibration.board)?;
        if self.calibration.capture_cap == 0 {
            return Err(anyhow!("calibration capture cap must be greater than zero"));
        }
        if !(self.calibration.diag_fov_deg > 0.0 && self.calibration.diag_fov_deg < 180.0) {
            return Err(anyhow!(
                "diagonal field of view must be between 0 and 180 degrees"
            ));
        }
        if self.calibration.lens_model.trim().is_empty() {
            return Err(anyhow!("lens model must not be empty"));
        }
        if self.calibration.solver_program.trim().is_empty() {
            return Err(anyhow!("solver program must not be empty"));
        }
        Ok(())
    }
}

impl Default for FacetdConfig {
    fn default() -> Self {
        Self::from_file(FacetdConfigFile::default())
    }
}

fn read_config_file(path: &Path) -> Result<FacetdConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let cfg = serde_json::from_str(&raw)
        .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?;
    Ok(cfg)
}

/// Zero or missing means one solver job per available core.
fn resolve_jobs(configured: Option<usize>) -> usize {
    match configured {
        Some(jobs) if jobs > 0 => jobs,
        _ => crate::calib::solver::default_jobs(),
    }
}

fn split_csv(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|entry| entry.trim())
        .filter(|entry| !entry.is_empty())
        .map(|entry| entry.to_string())
        .collect()
}
