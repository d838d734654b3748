//! Mode routing stages.
//!
//! `SelectIn` demultiplexes the entry edge into one branch per mode;
//! `SelectOut` merges the branch outputs back into a single edge. Both read
//! the mode exactly once per iteration, so one capture always travels one
//! branch even if the selector changes mid-flight. A capture that entered a
//! branch just before a switch simply completes that branch; the next
//! capture takes the new route.

use std::thread;

use log::trace;

use crate::capture::Capture;
use crate::graph::{EdgeReceiver, EdgeSender, Node, POLL_TIMEOUT};
use crate::{Mode, ModeSwitch};

/// Routes captures from a single input to the branch matching the current
/// mode. A mode without a mapped branch discards the capture.
pub struct SelectIn {
    name: String,
    mode: ModeSwitch,
    input: EdgeReceiver<Capture>,
    routes: Vec<(Mode, EdgeSender<Capture>)>,
}

impl SelectIn {
    pub fn new(
        name: &str,
        mode: ModeSwitch,
        input: EdgeReceiver<Capture>,
        routes: Vec<(Mode, EdgeSender<Capture>)>,
    ) -> Self {
        Self {
            name: name.to_string(),
            mode,
            input,
            routes,
        }
    }
}

impl Node for SelectIn {
    fn name(&self) -> &str {
        &self.name
    }

    fn step(&mut self) {
        let mode = self.mode.get();
        let Some(capture) = self.input.poll() else {
            return;
        };
        match self.routes.iter().find(|(m, _)| *m == mode) {
            Some((_, out)) => {
                out.offer(capture);
            }
            None => trace!("{}: no branch for mode {mode}, capture dropped", self.name),
        }
    }
}

/// Merges per-mode branch outputs back into one edge, pulling only from
/// the branch matching the current mode.
pub struct SelectOut {
    name: String,
    mode: ModeSwitch,
    sources: Vec<(Mode, EdgeReceiver<Capture>)>,
    output: EdgeSender<Capture>,
}

impl SelectOut {
    pub fn new(
        name: &str,
        mode: ModeSwitch,
        sources: Vec<(Mode, EdgeReceiver<Capture>)>,
        output: EdgeSender<Capture>,
    ) -> Self {
        Self {
            name: name.to_string(),
            mode,
            sources,
            output,
        }
    }
}

impl Node for SelectOut {
    fn name(&self) -> &str {
        &self.name
    }

    fn step(&mut self) {
        let mode = self.mode.get();
        match self.sources.iter().find(|(m, _)| *m == mode) {
            Some((_, source)) => {
                if let Some(capture) = source.poll() {
                    self.output.offer(capture);
                }
            }
            // No source for this mode; sleep one poll so the loop stays
            // cooperative instead of spinning.
            None => thread::sleep(POLL_TIMEOUT),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::FrameMeta;
    use crate::frame::FrameImage;
    use crate::graph::edge;

    fn tagged_capture(tag: f64) -> Capture {
        let mut capture = Capture::new(
            FrameMeta {
                sequence: 0,
                timestamp_s: 0.0,
            },
            FrameImage::black(4, 4),
        );
        capture.metadata.set("tag", tag);
        capture
    }

    #[test]
    fn select_in_forwards_to_active_branch_only() {
        let switch = ModeSwitch::new(Mode::Focus);
        let (entry_tx, entry_rx) = edge("entry");
        let (setup_tx, setup_rx) = edge("setup");
        let (focus_tx, focus_rx) = edge("focus");
        let mut node = SelectIn::new(
            "select_in",
            switch.clone(),
            entry_rx,
            vec![(Mode::Setup, setup_tx), (Mode::Focus, focus_tx)],
        );

        entry_tx.offer(tagged_capture(1.0));
        node.step();
        assert!(setup_rx.try_take().is_none());
        assert_eq!(focus_rx.try_take().unwrap().metadata.get("tag"), Some(1.0));

        switch.set(Mode::Setup);
        entry_tx.offer(tagged_capture(2.0));
        node.step();
        assert_eq!(setup_rx.try_take().unwrap().metadata.get("tag"), Some(2.0));
        assert!(focus_rx.try_take().is_none());
    }

    #[test]
    fn select_in_drops_capture_for_unmapped_mode() {
        let switch = ModeSwitch::new(Mode::Calibration);
        let (entry_tx, entry_rx) = edge("entry");
        let (setup_tx, setup_rx) = edge("setup");
        let mut node = SelectIn::new(
            "select_in",
            switch,
            entry_rx,
            vec![(Mode::Setup, setup_tx)],
        );

        entry_tx.offer(tagged_capture(1.0));
        node.step();
        assert!(setup_rx.try_take().is_none());
    }

    #[test]
    fn select_out_pulls_active_branch_only() {
        let switch = ModeSwitch::new(Mode::Setup);
        let (setup_tx, setup_rx) = edge("setup");
        let (focus_tx, focus_rx) = edge("focus");
        let (out_tx, out_rx) = edge("merged");
        let mut node = SelectOut::new(
            "select_out",
            switch.clone(),
            vec![(Mode::Setup, setup_rx), (Mode::Focus, focus_rx)],
            out_tx,
        );

        setup_tx.offer(tagged_capture(1.0));
        focus_tx.offer(tagged_capture(2.0));
        node.step();
        assert_eq!(out_rx.try_take().unwrap().metadata.get("tag"), Some(1.0));

        // The focus branch item is only drained once the mode points at it.
        node.step();
        assert!(out_rx.try_take().is_none());
        switch.set(Mode::Focus);
        node.step();
        assert_eq!(out_rx.try_take().unwrap().metadata.get("tag"), Some(2.0));
    }
}
