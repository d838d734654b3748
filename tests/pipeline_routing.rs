use std::fs;
use std::time::{Duration, Instant};

use tempfile::TempDir;

use facet_vision::board::{build_detector, BoardSpec};
use facet_vision::calib::{CalibrationConfig, CalibrationRoutine};
use facet_vision::graph::calibrate::{CORNERS_KEY, TOTAL_CORNERS_KEY};
use facet_vision::graph::focus::FOCUS_KEY;
use facet_vision::graph::{
    CalibrationCaptureNode, CalibrationHandle, DebugSinkNode, FocusMeter, FocusNode, RateNode,
    SelectIn, SelectOut,
};
use facet_vision::stream::VideoStream;
use facet_vision::{
    edge, Capture, EdgeReceiver, EdgeSender, FrameImage, FrameMeta, Graph, Mode, ModeSwitch,
};

fn board() -> BoardSpec {
    BoardSpec {
        squares_w: 4,
        squares_h: 3,
        square_len_m: 0.03,
        marker_len_m: 0.022,
    }
}

fn bright_capture(sequence: u64) -> Capture {
    Capture::new(
        FrameMeta {
            sequence,
            timestamp_s: sequence as f64 * 0.1,
        },
        FrameImage::filled(64, 48, [255, 255, 255]),
    )
}

/// Builds the per-camera wiring: a mode demultiplexer, the focus and
/// calibration branches, and the merge stage.
fn wire_branches(
    switch: &ModeSwitch,
    handle: &CalibrationHandle,
) -> (Graph, EdgeSender<Capture>, EdgeReceiver<Capture>) {
    let (entry_tx, entry_rx) = edge("entry");
    let (setup_tx, setup_rx) = edge("setup");
    let (focus_in_tx, focus_in_rx) = edge("focus_in");
    let (focus_out_tx, focus_out_rx) = edge("focus_out");
    let (calib_in_tx, calib_in_rx) = edge("calib_in");
    let (calib_out_tx, calib_out_rx) = edge("calib_out");
    let (merged_tx, merged_rx) = edge("merged");

    let detector = build_detector("grid", &board()).unwrap();

    let mut graph = Graph::new("routing");
    graph.add_node(SelectIn::new(
        "select_in",
        switch.clone(),
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
        handle.clone(),
        calib_in_rx,
        calib_out_tx,
    ));
    graph.add_node(SelectOut::new(
        "select_out",
        switch.clone(),
        vec![
            (Mode::Setup, setup_rx),
            (Mode::Focus, focus_out_rx),
            (Mode::Calibration, calib_out_rx),
        ],
        merged_tx,
    ));
    (graph, entry_tx, merged_rx)
}

/// Keeps feeding captures until one that satisfies `want` comes out merged.
/// The selectors snapshot the mode once per iteration, so the first capture
/// after a flip may still take the old branch; pumping rides that out.
fn pump_until(
    entry: &EdgeSender<Capture>,
    merged: &EdgeReceiver<Capture>,
    want: impl Fn(&Capture) -> bool,
) -> Capture {
    let start = Instant::now();
    let mut sequence = 0;
    while start.elapsed() < Duration::from_secs(10) {
        entry.offer(bright_capture(sequence));
        sequence += 1;
        if let Some(capture) = merged.poll_timeout(Duration::from_millis(50)) {
            if want(&capture) {
                return capture;
            }
        }
    }
    panic!("no capture matched within the deadline");
}

#[test]
fn setup_captures_pass_through_untouched() {
    let switch = ModeSwitch::new(Mode::Setup);
    let handle = CalibrationHandle::new();
    let (mut graph, entry, merged) = wire_branches(&switch, &handle);

    let capture = pump_until(&entry, &merged, |_| true);
    assert!(
        capture.metadata.is_empty(),
        "setup branch must not annotate captures"
    );

    graph.stop();
}

#[test]
fn focus_mode_scores_captures() {
    let switch = ModeSwitch::new(Mode::Setup);
    let handle = CalibrationHandle::new();
    let (mut graph, entry, merged) = wire_branches(&switch, &handle);

    switch.set(Mode::Focus);
    let capture = pump_until(&entry, &merged, |c| c.metadata.get(FOCUS_KEY).is_some());
    let score = capture.metadata.get(FOCUS_KEY).unwrap();
    assert!(score >= 0.0, "focus score must be non-negative, got {score}");

    graph.stop();
}

#[test]
fn calibration_mode_banks_samples_and_annotates_counts() {
    let storage = TempDir::new().unwrap();
    let cfg = CalibrationConfig {
        storage_root: storage.path().to_path_buf(),
        board: board(),
        capture_cap: 4,
        diag_fov_deg: 55.0,
        lens_model: "LENSMODEL_OPENCV8".to_string(),
        solver_program: "true".to_string(),
        solver_jobs: 1,
    };

    let switch = ModeSwitch::new(Mode::Setup);
    let handle = CalibrationHandle::new();
    let (mut graph, entry, merged) = wire_branches(&switch, &handle);

    let routine = CalibrationRoutine::begin(cfg, "routing", 64, 48).unwrap();
    handle.begin(routine).unwrap();
    switch.set(Mode::Calibration);

    let capture = pump_until(&entry, &merged, |c| c.metadata.get(CORNERS_KEY).is_some());
    // a 4x3 board has 3x2 interior corners, all visible on a bright frame
    assert_eq!(capture.metadata.get(CORNERS_KEY), Some(6.0));
    assert!(capture.metadata.get(TOTAL_CORNERS_KEY).unwrap() >= 6.0);

    switch.set(Mode::Setup);
    let routine = handle.end().unwrap().expect("session still active");
    assert!(routine.observed_count() >= 1);
    assert!(routine.sample_count() >= 1);
    let pngs = fs::read_dir(routine.dir())
        .unwrap()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_name().to_string_lossy().ends_with(".png"))
        .count();
    assert!(pngs >= 1, "retained captures must stay on disk");

    graph.stop();
}

#[test]
fn calibration_mode_without_a_session_leaves_captures_bare() {
    let switch = ModeSwitch::new(Mode::Calibration);
    let handle = CalibrationHandle::new();
    let (mut graph, entry, merged) = wire_branches(&switch, &handle);

    let capture = pump_until(&entry, &merged, |_| true);
    assert!(capture.metadata.get(CORNERS_KEY).is_none());
    assert!(capture.metadata.is_empty());

    graph.stop();
}

#[test]
fn full_wiring_flows_to_the_debug_stream_and_stops_quickly() {
    let switch = ModeSwitch::new(Mode::Setup);
    let handle = CalibrationHandle::new();
    let (mut graph, entry, merged_rx) = wire_branches(&switch, &handle);

    let (rated_tx, rated_rx) = edge("rated");
    let video = VideoStream::new("stream");
    graph.add_node(RateNode::new("source", merged_rx, rated_tx));
    graph.add_node(DebugSinkNode::new("sink", rated_rx, video.clone()));
    assert_eq!(graph.node_count(), 6);

    let start = Instant::now();
    let mut sequence = 0;
    let jpeg = loop {
        assert!(
            start.elapsed() < Duration::from_secs(10),
            "no frame reached the stream slot"
        );
        entry.offer(bright_capture(sequence));
        sequence += 1;
        if let Some(jpeg) = video.snapshot().unwrap() {
            break jpeg;
        }
        std::thread::sleep(Duration::from_millis(20));
    };
    let decoded = FrameImage::decode_jpeg(&jpeg).unwrap();
    assert_eq!((decoded.width(), decoded.height()), (64, 48));
    assert!(graph.dead_nodes().is_empty());

    let begun = Instant::now();
    graph.stop();
    // six nodes, stopped in order, each within about one poll timeout
    assert!(
        begun.elapsed() < Duration::from_secs(3),
        "graph stop took {:?}",
        begun.elapsed()
    );
}
