//! Per-camera processing graph.
//!
//! A graph is a set of stages connected by single-slot edges. Each stage
//! ([`Node`]) runs on its own thread and is scheduled by data availability:
//! one iteration is a bounded poll on the input, a transform, and a
//! non-blocking hand-off to the output. Edges hold at most one capture and
//! drop the newest item when the slot is occupied, so a slow stage sheds
//! load instead of building a stale backlog.

pub mod calibrate;
pub mod focus;
pub mod rate;
pub mod select;
pub mod sink;
pub mod tee;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use log::{debug, info, warn};

pub use calibrate::{CalibrationCaptureNode, CalibrationHandle};
pub use focus::{FocusMeter, FocusNode};
pub use rate::{RateEstimator, RateNode};
pub use select::{SelectIn, SelectOut};
pub use sink::DebugSinkNode;
pub use tee::TeeNode;

/// How long a node blocks on an empty input before re-checking its stop
/// flag. Bounds both idle wake-up latency and shutdown latency.
pub const POLL_TIMEOUT: Duration = Duration::from_millis(100);

/// Creates a connected single-slot edge.
pub fn edge<T>(name: &str) -> (EdgeSender<T>, EdgeReceiver<T>) {
    let (tx, rx) = bounded(1);
    let name: Arc<str> = Arc::from(name);
    (
        EdgeSender {
            name: name.clone(),
            tx,
            dropped: Arc::new(AtomicU64::new(0)),
        },
        EdgeReceiver { name, rx },
    )
}

/// Producer half of an edge. `offer` never blocks.
pub struct EdgeSender<T> {
    name: Arc<str>,
    tx: Sender<T>,
    dropped: Arc<AtomicU64>,
}

impl<T> EdgeSender<T> {
    /// Hands the item to the edge if the slot is free. When the slot is
    /// occupied the *new* item is discarded and `false` is returned; the
    /// occupant stays put for the consumer.
    pub fn offer(&self, item: T) -> bool {
        match self.tx.try_send(item) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    /// Items discarded so far because the slot was occupied.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Consumer half of an edge.
pub struct EdgeReceiver<T> {
    name: Arc<str>,
    rx: Receiver<T>,
}

impl<T> EdgeReceiver<T> {
    /// Blocks up to [`POLL_TIMEOUT`] for the next item.
    pub fn poll(&self) -> Option<T> {
        self.poll_timeout(POLL_TIMEOUT)
    }

    pub fn poll_timeout(&self, timeout: Duration) -> Option<T> {
        match self.rx.recv_timeout(timeout) {
            Ok(item) => Some(item),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    /// Non-blocking take, used by tests and teardown drains.
    pub fn try_take(&self) -> Option<T> {
        self.rx.try_recv().ok()
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// One processing stage. `step` is called in a loop on a dedicated thread;
/// an implementation should block no longer than roughly [`POLL_TIMEOUT`]
/// per call so the stop flag stays responsive.
pub trait Node: Send {
    fn name(&self) -> &str;
    fn step(&mut self);
}

struct NodeHandle {
    name: String,
    stop: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

/// Owns the node threads of one camera pipeline. Nodes are stopped in
/// registration order; each stop is a flag set plus a join that resolves
/// within about one poll timeout.
pub struct Graph {
    name: String,
    nodes: Vec<NodeHandle>,
}

impl Graph {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            nodes: Vec::new(),
        }
    }

    /// Spawns the node's thread immediately.
    pub fn add_node<N: Node + 'static>(&mut self, mut node: N) {
        let name = node.name().to_string();
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = stop.clone();
        let join = thread::spawn(move || {
            while !stop_flag.load(Ordering::Relaxed) {
                node.step();
            }
        });
        debug!("graph {}: node {} started", self.name, name);
        self.nodes.push(NodeHandle {
            name,
            stop,
            join: Some(join),
        });
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Names of nodes whose threads have exited. A healthy running graph
    /// returns an empty list; a panicked stage shows up here so the
    /// orchestrator can tear the session down instead of stalling silently.
    pub fn dead_nodes(&self) -> Vec<String> {
        self.nodes
            .iter()
            .filter(|h| h.join.as_ref().is_some_and(|j| j.is_finished()))
            .map(|h| h.name.clone())
            .collect()
    }

    /// Stops every node in registration order. Idempotent.
    pub fn stop(&mut self) {
        if self.nodes.is_empty() {
            return;
        }
        info!("graph {}: stopping {} nodes", self.name, self.nodes.len());
        for handle in &mut self.nodes {
            handle.stop.store(true, Ordering::Relaxed);
            if let Some(join) = handle.join.take() {
                if join.join().is_err() {
                    warn!("graph {}: node {} panicked", self.name, handle.name);
                } else {
                    debug!("graph {}: node {} stopped", self.name, handle.name);
                }
            }
        }
        self.nodes.clear();
    }
}

impl Drop for Graph {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    struct RelayNode {
        name: String,
        input: EdgeReceiver<u32>,
        output: EdgeSender<u32>,
    }

    impl Node for RelayNode {
        fn name(&self) -> &str {
            &self.name
        }

        fn step(&mut self) {
            if let Some(item) = self.input.poll() {
                self.output.offer(item);
            }
        }
    }

    #[test]
    fn occupied_edge_rejects_new_items() {
        let (tx, rx) = edge::<u32>("test");
        assert!(tx.offer(1));
        assert!(!tx.offer(2));
        assert_eq!(tx.dropped(), 1);
        assert_eq!(rx.try_take(), Some(1));
        assert!(tx.offer(3));
        assert_eq!(rx.try_take(), Some(3));
        assert_eq!(rx.try_take(), None);
    }

    #[test]
    fn poll_times_out_on_empty_edge() {
        let (_tx, rx) = edge::<u32>("test");
        let start = Instant::now();
        assert_eq!(rx.poll_timeout(Duration::from_millis(20)), None);
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn items_flow_through_a_running_node() {
        let (tx, mid_rx) = edge("in");
        let (mid_tx, rx) = edge("out");
        let mut graph = Graph::new("test");
        graph.add_node(RelayNode {
            name: "relay".into(),
            input: mid_rx,
            output: mid_tx,
        });

        assert!(tx.offer(42));
        assert_eq!(rx.poll_timeout(Duration::from_secs(1)), Some(42));
        graph.stop();
    }

    #[test]
    fn stop_joins_blocked_nodes_within_poll_budget() {
        let mut graph = Graph::new("test");
        // Keep all senders alive so every node is genuinely blocked in a
        // timed poll, not spinning on a disconnected edge.
        let mut inputs = Vec::new();
        let mut outputs = Vec::new();
        for i in 0..4 {
            let (in_tx, in_rx) = edge(&format!("in{i}"));
            let (out_tx, out_rx) = edge(&format!("out{i}"));
            inputs.push(in_tx);
            outputs.push(out_rx);
            graph.add_node(RelayNode {
                name: format!("relay{i}"),
                input: in_rx,
                output: out_tx,
            });
        }

        let start = Instant::now();
        graph.stop();
        // Sequential stop: four nodes, each at most one poll timeout, plus
        // generous scheduler slack.
        assert!(start.elapsed() < POLL_TIMEOUT * 4 + Duration::from_millis(400));
        assert_eq!(graph.node_count(), 0);
    }

    #[test]
    fn dead_nodes_reports_panicked_stage() {
        struct PanicNode;
        impl Node for PanicNode {
            fn name(&self) -> &str {
                "boom"
            }
            fn step(&mut self) {
                panic!("induced failure");
            }
        }

        let mut graph = Graph::new("test");
        graph.add_node(PanicNode);
        thread::sleep(Duration::from_millis(100));
        assert_eq!(graph.dead_nodes(), vec!["boom".to_string()]);
        graph.stop();
    }
}
