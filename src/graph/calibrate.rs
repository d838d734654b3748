//! Calibration capture stage.

use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{anyhow, Result};
use log::warn;

use crate::board::BoardDetector;
use crate::calib::CalibrationRoutine;
use crate::capture::Capture;
use crate::graph::{EdgeReceiver, EdgeSender, Node};

pub const CORNERS_KEY: &str = "corners_found";
pub const TOTAL_CORNERS_KEY: &str = "total_corners_found";

/// Corners already banked by the session.
const RETAINED_COLOR: [u8; 3] = [80, 170, 255];
/// Corners found in the frame on screen right now.
const DETECTED_COLOR: [u8; 3] = [255, 90, 90];

/// Shared slot holding the active calibration session, if any.
///
/// The camera orchestrator begins and ends sessions; the capture node
/// observes through the same slot from its own thread. Ending detaches the
/// routine before finalizing it, so the solver runs on the orchestrator's
/// thread with no lock held and the capture node simply sees an idle slot.
#[derive(Clone, Default)]
pub struct CalibrationHandle {
    slot: Arc<Mutex<Option<CalibrationRoutine>>>,
}

impl CalibrationHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs a session. A previous unfinished session is dropped.
    pub fn begin(&self, routine: CalibrationRoutine) -> Result<()> {
        let mut slot = self.lock()?;
        if slot.is_some() {
            warn!("replacing an unfinished calibration session");
        }
        *slot = Some(routine);
        Ok(())
    }

    /// Detaches and returns the session. Idempotent; a second call (or a
    /// call with no session ever begun) yields `Ok(None)`.
    pub fn end(&self) -> Result<Option<CalibrationRoutine>> {
        Ok(self.lock()?.take())
    }

    pub fn is_active(&self) -> Result<bool> {
        Ok(self.lock()?.is_some())
    }

    /// Runs `f` against the active session, or returns `Ok(None)` when the
    /// slot is idle.
    pub fn with_active<R>(
        &self,
        f: impl FnOnce(&mut CalibrationRoutine) -> R,
    ) -> Result<Option<R>> {
        let mut slot = self.lock()?;
        Ok(slot.as_mut().map(f))
    }

    fn lock(&self) -> Result<MutexGuard<'_, Option<CalibrationRoutine>>> {
        self.slot
            .lock()
            .map_err(|_| anyhow!("calibration slot lock poisoned"))
    }
}

/// Runs board detection over calibration-mode frames, feeds the active
/// session, and paints progress onto the frame before forwarding it.
///
/// Frames always flow through, session or not: a frame arriving in the
/// window between a mode switch and session setup is forwarded unmarked.
pub struct CalibrationCaptureNode {
    name: String,
    detector: Box<dyn BoardDetector>,
    handle: CalibrationHandle,
    input: EdgeReceiver<Capture>,
    output: EdgeSender<Capture>,
}

impl CalibrationCaptureNode {
    pub fn new(
        name: impl Into<String>,
        detector: Box<dyn BoardDetector>,
        handle: CalibrationHandle,
        input: EdgeReceiver<Capture>,
        output: EdgeSender<Capture>,
    ) -> Self {
        Self {
            name: name.into(),
            detector,
            handle,
            input,
            output,
        }
    }

    fn process(&mut self, capture: &mut Capture) {
        // the detector only runs while a session is attached; idle frames
        // pass straight through
        match self.handle.is_active() {
            Ok(true) => {}
            Ok(false) => return,
            Err(err) => {
                warn!("{}: {err:#}", self.name);
                return;
            }
        }
        let detection = match self.detector.detect(&capture.image) {
            Ok(detection) => detection,
            Err(err) => {
                warn!("{}: board detection failed: {err:#}", self.name);
                return;
            }
        };
        let session = self.handle.with_active(|routine| {
            if !detection.is_empty() {
                if let Err(err) = routine.observe(&capture.image, &detection) {
                    warn!("{}: could not record sample: {err:#}", self.name);
                }
            }
            let banked: Vec<(f32, f32)> = routine.retained_corners().collect();
            (banked, routine.total_corners())
        });
        match session {
            Ok(Some((banked, total))) => {
                for (x, y) in banked {
                    capture
                        .image
                        .draw_marker(x.round() as u32, y.round() as u32, RETAINED_COLOR);
                }
                for &(x, y) in &detection.corners {
                    capture
                        .image
                        .draw_marker(x.round() as u32, y.round() as u32, DETECTED_COLOR);
                }
                capture.metadata.set(CORNERS_KEY, detection.len() as f64);
                capture.metadata.set(TOTAL_CORNERS_KEY, total as f64);
            }
            Ok(None) => {}
            Err(err) => warn!("{}: {err:#}", self.name),
        }
    }
}

impl Node for CalibrationCaptureNode {
    fn name(&self) -> &str {
        &self.name
    }

    fn step(&mut self) {
        let Some(mut capture) = self.input.poll() else {
            return;
        };
        self.process(&mut capture);
        self.output.offer(capture);
    }
}
