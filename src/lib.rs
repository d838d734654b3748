//! Facet Vision
//!
//! Multi-camera pipeline daemon for robotics coprocessors. Each attached
//! camera gets its own processing graph of single-slot edges and
//! thread-per-node stages, a debug MJPEG stream, and a namespace on the
//! remote table for controls and mode selection.
//!
//! # Architecture
//!
//! - **Graph**: captures move by value through bounded single-slot edges;
//!   a full edge drops the newest item so every stage always works on the
//!   freshest frame the camera produced.
//! - **Modes**: one camera is always in exactly one of `setup`, `focus`,
//!   or `calibration`; routing nodes snapshot the mode once per iteration
//!   and forward down the matching branch only.
//! - **Calibration**: a bounded best-sample cache scores board detections,
//!   exports a correspondence file, and hands off to an external solver.
//!
//! # Module Structure
//!
//! - `graph`: edges, the node contract, per-node threads, stage nodes
//! - `device`: camera back-ends (synthetic always, V4L2 behind `device-v4l2`)
//! - `calib` / `board`: calibration session, sample cache, board detection
//! - `table` / `controls` / `stream`: remote table, device controls, debug video
//! - `manager`: per-camera orchestration and discovery

use std::str::FromStr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, Error, Result};

pub mod board;
pub mod calib;
pub mod capture;
pub mod config;
pub mod controls;
pub mod device;
pub mod frame;
pub mod graph;
pub mod manager;
pub mod stream;
pub mod table;
pub mod ui;

pub use capture::{Capture, FrameMeta, Metadata};
pub use config::FacetdConfig;
pub use frame::FrameImage;
pub use graph::{edge, EdgeReceiver, EdgeSender, Graph, Node, POLL_TIMEOUT};
pub use manager::CameraManager;

// -------------------- Pipeline Mode --------------------

/// Operating mode of a camera pipeline. A camera is always in exactly one
/// mode; the routing nodes forward captures down the matching branch only.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Mode {
    /// Live preview plus control/format reconfiguration.
    Setup,
    /// Focus scoring overlay for lens adjustment.
    Focus,
    /// Board detection feeding the calibration sample cache.
    Calibration,
}

impl Mode {
    pub const ALL: [Mode; 3] = [Mode::Setup, Mode::Focus, Mode::Calibration];

    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Setup => "setup",
            Mode::Focus => "focus",
            Mode::Calibration => "calibration",
        }
    }

    fn from_u8(raw: u8) -> Mode {
        match raw {
            1 => Mode::Focus,
            2 => Mode::Calibration,
            _ => Mode::Setup,
        }
    }

    fn to_u8(self) -> u8 {
        match self {
            Mode::Setup => 0,
            Mode::Focus => 1,
            Mode::Calibration => 2,
        }
    }
}

impl FromStr for Mode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "setup" => Ok(Mode::Setup),
            "focus" => Ok(Mode::Focus),
            "calibration" => Ok(Mode::Calibration),
            other => Err(anyhow!("unrecognized mode '{other}'")),
        }
    }
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Shared mode cell. The orchestrator writes it when the remote selector
/// changes; every routing node reads one snapshot per iteration, so a
/// mid-iteration switch never splits a single capture across branches.
#[derive(Clone, Debug)]
pub struct ModeSwitch {
    cell: Arc<AtomicU8>,
}

impl ModeSwitch {
    pub fn new(initial: Mode) -> Self {
        Self {
            cell: Arc::new(AtomicU8::new(initial.to_u8())),
        }
    }

    pub fn get(&self) -> Mode {
        Mode::from_u8(self.cell.load(Ordering::Acquire))
    }

    pub fn set(&self, mode: Mode) {
        self.cell.store(mode.to_u8(), Ordering::Release);
    }
}

impl Default for ModeSwitch {
    fn default() -> Self {
        Self::new(Mode::Setup)
    }
}
