//! Explicit fan-out.

use crate::capture::Capture;
use crate::graph::{EdgeReceiver, EdgeSender, Node};

/// Duplicates each capture to several outputs. Every branch gets its own
/// deep copy so downstream stages can mutate freely; the original moves
/// into the last output to save one copy. Each output drops independently
/// when its slot is occupied.
pub struct TeeNode {
    name: String,
    input: EdgeReceiver<Capture>,
    outputs: Vec<EdgeSender<Capture>>,
}

impl TeeNode {
    pub fn new(
        name: &str,
        input: EdgeReceiver<Capture>,
        outputs: Vec<EdgeSender<Capture>>,
    ) -> Self {
        Self {
            name: name.to_string(),
            input,
            outputs,
        }
    }
}

impl Node for TeeNode {
    fn name(&self) -> &str {
        &self.name
    }

    fn step(&mut self) {
        let Some(capture) = self.input.poll() else {
            return;
        };
        if let Some((last, rest)) = self.outputs.split_last() {
            for out in rest {
                out.offer(capture.deep_copy());
            }
            last.offer(capture);
        }
    }
}
