//! Camera discovery and per-camera orchestration.
//!
//! The manager runs a discovery pass on a fixed cadence: new capture
//! devices get a worker, vanished ones are stopped, and sources that
//! failed to open are left alone until they disappear from the scan.
//! Each worker thread owns its device handle outright and drives one
//! processing graph per streaming session, servicing remote table writes
//! between frames. A session ends when the format chooser changes (so the
//! device can be reconfigured), when the worker is stopped, or when the
//! device or a pipeline stage fails.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use log::{debug, error, info, warn};

use crate::board::build_detector;
use crate::calib::CalibrationRoutine;
use crate::capture::{Capture, FrameMeta};
use crate::config::FacetdConfig;
use crate::controls::ControlBindings;
use crate::device::{self, convert, CameraDevice, DeviceFormat};
use crate::graph::{
    edge, CalibrationCaptureNode, CalibrationHandle, DebugSinkNode, FocusMeter, FocusNode, Graph,
    RateNode, SelectIn, SelectOut,
};
use crate::stream::{stream_urls, PublishedStream, StreamRecord, StreamServer, VideoStream};
use crate::table::{Chooser, KvBackend, MemoryBackend, MqttBackend, Table};
use crate::{Mode, ModeSwitch};

/// Cadence of the manager's discovery pass.
pub const DISCOVERY_PERIOD: Duration = Duration::from_millis(100);

/// Cadence of a worker's slow housekeeping: control re-sync and the
/// dead-stage check.
const LIVENESS_PERIOD: Duration = Duration::from_secs(1);

/// Table name the per-camera stream records are published under.
const PUBLISHER_TABLE: &str = "CameraPublisher";

const DEFAULT_ROLE: &str = "Change Me!";

// -------------------- per-camera worker --------------------

/// Handle to one camera's session thread.
pub struct CameraWorker {
    source: String,
    port: u16,
    stop: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl CameraWorker {
    /// Opens the device and spawns its session thread. Open failures
    /// surface here so the manager can blacklist the source.
    pub fn start(
        cfg: &FacetdConfig,
        backend: Arc<dyn KvBackend>,
        source: &str,
        port: u16,
    ) -> Result<CameraWorker> {
        let mut device = device::open_device(source)?;
        device
            .open()
            .with_context(|| format!("open camera {source}"))?;

        let stop = Arc::new(AtomicBool::new(false));
        let worker_stop = Arc::clone(&stop);
        let cfg = cfg.clone();
        let join = thread::Builder::new()
            .name(device.id().to_string())
            .spawn(move || run_worker(device, cfg, backend, port, worker_stop))
            .context("spawn camera worker thread")?;
        Ok(CameraWorker {
            source: source.to_string(),
            port,
            stop,
            join: Some(join),
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Whether the session thread exited on its own, e.g. after a device
    /// failure or a dead pipeline stage.
    pub fn is_finished(&self) -> bool {
        self.join.as_ref().map_or(true, |join| join.is_finished())
    }

    /// Signals the session loop and joins it. Idempotent.
    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(join) = self.join.take() {
            if join.join().is_err() {
                warn!("camera worker {} panicked", self.source);
            }
        }
    }
}

impl Drop for CameraWorker {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_worker(
    mut device: Box<dyn CameraDevice>,
    cfg: FacetdConfig,
    backend: Arc<dyn KvBackend>,
    port: u16,
    stop: Arc<AtomicBool>,
) {
    let key = device.id().to_string();
    if let Err(err) = drive_camera(device.as_mut(), &cfg, backend, port, &stop) {
        error!("camera {key}: {err:#}");
    }
    // whatever ended the loop, the hardware handle gets released
    device.close();
    info!("camera {key} closed");
}

/// Why an acquisition session ended, short of an error.
enum SessionEnd {
    /// The worker's stop flag flipped.
    Stopped,
    /// The format chooser changed; reconfigure and start a new session.
    Reconfigure,
}

struct WorkerState {
    cfg: FacetdConfig,
    key: String,
    port: u16,
    camera_table: Table,
    publisher_table: Table,
    mode_switch: ModeSwitch,
    mode_chooser: Chooser,
    format_chooser: Chooser,
    formats: Vec<DeviceFormat>,
    format_options: Vec<String>,
    controls: ControlBindings,
    role_key: String,
    sequence: u64,
    epoch: Instant,
}

#[derive(Default)]
struct WriteEffects {
    mode_changed: bool,
    format_changed: bool,
}

fn drive_camera(
    device: &mut dyn CameraDevice,
    cfg: &FacetdConfig,
    backend: Arc<dyn KvBackend>,
    port: u16,
    stop: &AtomicBool,
) -> Result<()> {
    let key = device.id().to_string();
    let camera_table = Table::root(Arc::clone(&backend), &cfg.namespace).child(&key);
    let publisher_table = Table::root(Arc::clone(&backend), PUBLISHER_TABLE)
        .child(&format!("{}_{}", cfg.stream.host, key));

    // dashboard label; stored on the table, never interpreted here
    camera_table.put("role", DEFAULT_ROLE)?;
    camera_table.watch("role")?;
    let role_key = camera_table.key("role");

    let mode_options: Vec<String> = Mode::ALL.iter().map(|mode| mode.to_string()).collect();
    let mode_chooser = Chooser::new(
        camera_table.child("mode"),
        "mode",
        mode_options,
        Mode::Setup.as_str(),
    )?;

    let mut formats = device.formats()?;
    let mut format_options: Vec<String> = formats.iter().map(|f| f.to_string()).collect();
    let current_label = device.current_format().to_string();
    // the driver may sit on a format the enumeration missed; it is
    // evidently usable, so offer it
    if !format_options.contains(&current_label) {
        formats.push(device.current_format());
        format_options.push(current_label.clone());
    }
    let format_chooser = Chooser::new(
        camera_table.child("video_format"),
        "video_format",
        format_options.clone(),
        &current_label,
    )?;

    let controls = ControlBindings::publish(camera_table.child("config"), device)?;
    info!("camera {key}: {} controls bound", controls.len());

    let mut state = WorkerState {
        cfg: cfg.clone(),
        key,
        port,
        camera_table,
        publisher_table,
        mode_switch: ModeSwitch::new(Mode::Setup),
        mode_chooser,
        format_chooser,
        formats,
        format_options,
        controls,
        role_key,
        sequence: 0,
        epoch: Instant::now(),
    };

    loop {
        if stop.load(Ordering::Relaxed) {
            break;
        }
        state.apply_pending_format(device);
        match state.session(device, stop)? {
            SessionEnd::Stopped => break,
            SessionEnd::Reconfigure => continue,
        }
    }
    Ok(())
}

impl WorkerState {
    /// Brings the device in line with the format chooser. Runs only
    /// between sessions, when no stream borrows the device.
    fn apply_pending_format(&mut self, device: &mut dyn CameraDevice) {
        let Some(idx) = self
            .format_options
            .iter()
            .position(|option| option == self.format_chooser.active())
        else {
            return;
        };
        if self.formats[idx] == device.current_format() {
            return;
        }
        info!("camera {}: switching to {}", self.key, self.formats[idx]);
        if let Err(err) = device.set_format(&self.formats[idx]) {
            warn!("camera {}: format change failed: {err:#}", self.key);
            let actual = device.current_format().to_string();
            if self.format_options.contains(&actual) {
                if let Err(err) = self.format_chooser.set_active(&actual) {
                    warn!("camera {}: {err:#}", self.key);
                }
            }
        }
    }

    /// One streaming session: builds the pipeline graph and the debug
    /// stream for the current format, then pumps frames until something
    /// ends it. Teardown runs on every exit path.
    fn session(&mut self, device: &mut dyn CameraDevice, stop: &AtomicBool) -> Result<SessionEnd> {
        let format = device.current_format();

        let (entry_tx, entry_rx) = edge("entry");
        let (setup_tx, setup_rx) = edge("setup");
        let (focus_in_tx, focus_in_rx) = edge("focus_in");
        let (focus_out_tx, focus_out_rx) = edge("focus_out");
        let (calib_in_tx, calib_in_rx) = edge("calib_in");
        let (calib_out_tx, calib_out_rx) = edge("calib_out");
        let (merged_tx, merged_rx) = edge("merged");
        let (rated_tx, rated_rx) = edge("rated");

        let video = VideoStream::new("stream");
        let calibration = CalibrationHandle::new();
        let detector = build_detector(&self.cfg.detector, &self.cfg.calibration.board)?;

        let mut graph = Graph::new(&self.key);
        graph.add_node(SelectIn::new(
            "select_in",
            self.mode_switch.clone(),
            entry_rx,
            vec![
                (Mode::Setup, setup_tx),
                (Mode::Focus, focus_in_tx),
                (Mode::Calibration, calib_in_tx),
            ],
        ));
        graph.add_node(FocusNode::new(
            "focus",
            focus_in_rx,
            focus_out_tx,
            FocusMeter::full_frame(),
        ));
        graph.add_node(CalibrationCaptureNode::new(
            "calibrate",
            detector,
            calibration.clone(),
            calib_in_rx,
            calib_out_tx,
        ));
        graph.add_node(SelectOut::new(
            "select_out",
            self.mode_switch.clone(),
            vec![
                (Mode::Setup, setup_rx),
                (Mode::Focus, focus_out_rx),
                (Mode::Calibration, calib_out_rx),
            ],
            merged_tx,
        ));
        graph.add_node(RateNode::new("source", merged_rx, rated_tx));
        graph.add_node(DebugSinkNode::new("sink", rated_rx, video.clone()));

        let server =
            StreamServer::new(format!("0.0.0.0:{}", self.port), vec![video], format.fps).spawn()?;
        let record = PublishedStream::publish(
            self.publisher_table.clone(),
            &StreamRecord {
                description: device.description(),
                source: "cv:".to_string(),
                modes: Mode::ALL.iter().map(|mode| mode.to_string()).collect(),
                mode: self.mode_chooser.active().to_string(),
                stream_urls: stream_urls(&self.cfg.stream.host, server.addr.port(), &["stream"]),
            },
        )?;

        let mut liveness_at = Instant::now();
        let result = (|| -> Result<SessionEnd> {
            loop {
                if stop.load(Ordering::Relaxed) {
                    return Ok(SessionEnd::Stopped);
                }

                let frame = device.next_frame()?;
                let image = convert::to_rgb_or_placard(&frame);
                let (width, height) = (image.width(), image.height());
                let meta = FrameMeta {
                    sequence: self.sequence,
                    timestamp_s: self.epoch.elapsed().as_secs_f64(),
                };
                self.sequence += 1;

                let last_mode = self.mode_switch.get();
                let effects = self.service_writes(device)?;
                let mode = self.mode_switch.get();

                entry_tx.offer(Capture::new(meta, image));

                if last_mode == Mode::Calibration && mode != Mode::Calibration {
                    self.finish_calibration(&calibration)?;
                } else if mode == Mode::Calibration && last_mode != Mode::Calibration {
                    match CalibrationRoutine::begin(
                        self.cfg.calibration.clone(),
                        &self.key,
                        width,
                        height,
                    ) {
                        Ok(routine) => calibration.begin(routine)?,
                        Err(err) => {
                            error!(
                                "camera {}: cannot open calibration session: {err:#}",
                                self.key
                            );
                            self.mode_chooser.set_active(Mode::Setup.as_str())?;
                            self.mode_switch.set(Mode::Setup);
                        }
                    }
                }

                if effects.mode_changed {
                    record.set_mode(self.mode_chooser.active())?;
                }

                if mode == Mode::Setup && effects.format_changed {
                    return Ok(SessionEnd::Reconfigure);
                }

                if liveness_at.elapsed() >= LIVENESS_PERIOD {
                    liveness_at = Instant::now();
                    // drivers move values on their own; republish what stuck
                    self.controls.sync(device)?;
                    let dead = graph.dead_nodes();
                    if !dead.is_empty() {
                        bail!("pipeline stage(s) died: {}", dead.join(", "));
                    }
                }
            }
        })();

        // a session that ends mid-calibration abandons it; the files stay
        // on disk for the offline tool
        match calibration.end() {
            Ok(Some(_)) => warn!("camera {}: calibration session abandoned", self.key),
            Ok(None) => {}
            Err(err) => warn!("camera {}: {err:#}", self.key),
        }
        if let Err(err) = record.disable() {
            warn!("camera {}: could not mark stream offline: {err:#}", self.key);
        }
        if let Err(err) = server.stop() {
            warn!("camera {}: stream server: {err:#}", self.key);
        }
        graph.stop();
        result
    }

    /// Drains external table writes and routes each one to its owner.
    fn service_writes(&mut self, device: &mut dyn CameraDevice) -> Result<WriteEffects> {
        let mut effects = WriteEffects::default();
        let writes = self.camera_table.backend().take_writes()?;
        for (path, value) in writes {
            if self.mode_chooser.owns(&path) {
                if self.mode_chooser.apply_write(&value)? {
                    self.mode_switch.set(self.mode_chooser.active().parse()?);
                    effects.mode_changed = true;
                }
            } else if self.format_chooser.owns(&path) {
                if self.format_chooser.apply_write(&value)? {
                    effects.format_changed = true;
                }
            } else if self.controls.apply_write(&path, &value, device)? {
                // handled, current value already republished
            } else if path == self.role_key {
                debug!("camera {}: role set to {value}", self.key);
            } else {
                debug!("camera {}: unrouted table write at {path}", self.key);
            }
        }
        Ok(effects)
    }

    /// Detaches the calibration routine and runs the solver. This is the
    /// synchronous point of the whole pipeline; the acquisition loop stalls
    /// for the solver's duration, which is fine for session finalization.
    /// Solver failure kills the calibration, not the camera.
    fn finish_calibration(&self, calibration: &CalibrationHandle) -> Result<()> {
        let Some(routine) = calibration.end()? else {
            return Ok(());
        };
        info!(
            "camera {}: finalizing calibration, {} of {} observed frames retained",
            self.key,
            routine.sample_count(),
            routine.observed_count()
        );
        if let Err(err) = routine.finish() {
            error!("camera {}: calibration failed: {err:#}", self.key);
            return Ok(());
        }
        match routine.load_result() {
            Ok(Some(model)) => {
                let (width, height) = model.imager_size;
                info!(
                    "camera {} calibrated: {} over {width}x{height}px",
                    self.key, model.lens_model
                );
            }
            Ok(None) => warn!(
                "camera {}: solver succeeded but left no model in {}",
                self.key,
                routine.dir().display()
            ),
            Err(err) => error!("camera {}: unreadable solver output: {err:#}", self.key),
        }
        Ok(())
    }
}

// -------------------- discovery / lifecycle --------------------

/// Owns all camera workers plus the manager-level table state.
pub struct CameraManager {
    cfg: FacetdConfig,
    backend: Arc<dyn KvBackend>,
    mqtt: Option<Arc<MqttBackend>>,
    root: Table,
    workers: HashMap<String, Option<CameraWorker>>,
    ports: HashMap<String, u16>,
    next_port: u16,
    published_streams: Vec<String>,
}

impl CameraManager {
    /// Connects the table backend named in the config. Without a broker
    /// the table stays in-process, which suits bench and test setups.
    pub fn new(cfg: FacetdConfig) -> Result<Self> {
        let (backend, mqtt): (Arc<dyn KvBackend>, Option<Arc<MqttBackend>>) =
            match cfg.broker.as_deref() {
                Some(addr) => {
                    let mqtt = Arc::new(MqttBackend::connect(addr, "facetd")?);
                    (Arc::clone(&mqtt) as Arc<dyn KvBackend>, Some(mqtt))
                }
                None => (Arc::new(MemoryBackend::new()), None),
            };
        Ok(Self::assemble(cfg, backend, mqtt))
    }

    /// Manager over a caller-supplied backend; used by tests and embedders.
    pub fn with_backend(cfg: FacetdConfig, backend: Arc<dyn KvBackend>) -> Self {
        Self::assemble(cfg, backend, None)
    }

    fn assemble(
        cfg: FacetdConfig,
        backend: Arc<dyn KvBackend>,
        mqtt: Option<Arc<MqttBackend>>,
    ) -> Self {
        let root = Table::root(Arc::clone(&backend), &cfg.namespace);
        Self {
            next_port: cfg.stream.base_port,
            cfg,
            backend,
            mqtt,
            root,
            workers: HashMap::new(),
            ports: HashMap::new(),
            published_streams: Vec::new(),
        }
    }

    pub fn backend(&self) -> &Arc<dyn KvBackend> {
        &self.backend
    }

    /// Workers currently running. Blacklisted sources do not count.
    pub fn camera_count(&self) -> usize {
        self.workers.values().filter(|w| w.is_some()).count()
    }

    /// One discovery pass: reap exited workers, start workers for new
    /// sources, drop vanished ones. A source that failed to open is
    /// remembered and not retried until it disappears from the scan.
    pub fn load_cameras(&mut self) {
        let mut present = self.cfg.sources.clone();
        for source in device::discover_sources() {
            if !present.contains(&source) {
                present.push(source);
            }
        }

        // an exited worker means the device or its pipeline failed;
        // dropping the entry lets the next pass try a clean reopen
        let finished: Vec<String> = self
            .workers
            .iter()
            .filter(|(_, worker)| worker.as_ref().is_some_and(|w| w.is_finished()))
            .map(|(source, _)| source.clone())
            .collect();
        for source in finished {
            warn!("camera {source} worker exited, scheduling reopen");
            if let Some(Some(mut worker)) = self.workers.remove(&source) {
                worker.stop();
            }
        }

        let mut added = 0;
        for source in &present {
            if self.workers.contains_key(source) {
                continue;
            }
            added += 1;
            info!("adding camera {source}");
            let key = device::storage_key(source);
            // ports stick to their source so a reopened camera keeps its URL
            let port = match self.ports.get(source) {
                Some(port) => *port,
                None => {
                    let port = self.next_port;
                    self.next_port += 1;
                    self.ports.insert(source.clone(), port);
                    port
                }
            };
            let started = self
                .worker_backend(&key)
                .and_then(|backend| CameraWorker::start(&self.cfg, backend, source, port));
            match started {
                Ok(worker) => {
                    self.publish_stream_url(port);
                    self.workers.insert(source.clone(), Some(worker));
                }
                Err(err) => {
                    error!("cannot monitor {source}: {err:#}; will not retry until it is removed");
                    self.workers.insert(source.clone(), None);
                }
            }
        }
        if added > 0 {
            info!("found {added} new video devices");
        }

        let vanished: Vec<String> = self
            .workers
            .keys()
            .filter(|source| !present.contains(source))
            .cloned()
            .collect();
        for source in vanished {
            info!("removing camera {source}");
            if let Some(Some(mut worker)) = self.workers.remove(&source) {
                worker.stop();
            }
        }
    }

    /// Stops every worker and forgets them all.
    pub fn unload_cameras(&mut self) {
        for (source, worker) in self.workers.iter_mut() {
            if let Some(worker) = worker {
                info!("waiting on {source}...");
                worker.stop();
                info!("{source} closed");
            }
        }
        self.workers.clear();
    }

    /// Discovery loop until `stop` flips, then a full unload.
    pub fn run(&mut self, stop: &AtomicBool) {
        while !stop.load(Ordering::Relaxed) {
            self.load_cameras();
            thread::sleep(DISCOVERY_PERIOD);
        }
        self.unload_cameras();
    }

    /// Unloads all cameras and closes the broker connection.
    pub fn shutdown(mut self) -> Result<()> {
        self.unload_cameras();
        if let Some(mqtt) = &self.mqtt {
            mqtt.shutdown()?;
        }
        Ok(())
    }

    /// Workers each get their own broker connection so draining external
    /// writes stays scoped to their own subscriptions. The in-process
    /// backend is shared instead; its writes are test-injected and only
    /// single-camera setups exercise them.
    fn worker_backend(&self, key: &str) -> Result<Arc<dyn KvBackend>> {
        match self.cfg.broker.as_deref() {
            Some(addr) => Ok(Arc::new(MqttBackend::connect(addr, &format!("facetd-{key}"))?)),
            None => Ok(Arc::clone(&self.backend)),
        }
    }

    fn publish_stream_url(&mut self, port: u16) {
        let url = stream_urls(&self.cfg.stream.host, port, &["stream"]).remove(0);
        if self.published_streams.contains(&url) {
            return;
        }
        self.published_streams.push(url);
        if let Err(err) = self.root.put("video/streams", self.published_streams.clone()) {
            warn!("could not publish stream list: {err:#}");
        }
    }
}

impl Drop for CameraManager {
    fn drop(&mut self) {
        self.unload_cameras();
    }
}
