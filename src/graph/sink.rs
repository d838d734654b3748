//! Terminal stage feeding the debug stream.

use log::warn;

use crate::capture::Capture;
use crate::graph::{EdgeReceiver, Node};
use crate::stream::VideoStream;

const JPEG_QUALITY: u8 = 75;
const HUD_COLOR: [u8; 3] = [255, 255, 80];
const HUD_LINE_HEIGHT: u32 = 9;

/// Stamps a HUD onto each frame, JPEG-encodes it, and hands it to the
/// viewer-facing stream slot. The HUD is the capture clock plus every
/// metadata annotation upstream stages attached, one line each, in the
/// order they were attached.
pub struct DebugSinkNode {
    name: String,
    input: EdgeReceiver<Capture>,
    video: VideoStream,
    quality: u8,
}

impl DebugSinkNode {
    pub fn new(name: impl Into<String>, input: EdgeReceiver<Capture>, video: VideoStream) -> Self {
        Self {
            name: name.into(),
            input,
            video,
            quality: JPEG_QUALITY,
        }
    }

    fn hud_lines(capture: &Capture) -> Vec<String> {
        let mut lines = vec![format!(
            "t {:.2}s #{}",
            capture.meta.timestamp_s, capture.meta.sequence
        )];
        for (key, value) in capture.metadata.iter() {
            lines.push(format!("{key}: {value:.2}"));
        }
        lines
    }
}

impl Node for DebugSinkNode {
    fn name(&self) -> &str {
        &self.name
    }

    fn step(&mut self) {
        let Some(mut capture) = self.input.poll() else {
            return;
        };
        let lines = Self::hud_lines(&capture);
        let mut y = 2;
        for line in &lines {
            capture.image.draw_text(2, y, line, 1, HUD_COLOR);
            y += HUD_LINE_HEIGHT;
        }
        match capture.image.encode_jpeg(self.quality) {
            Ok(jpeg) => {
                if let Err(err) = self.video.publish(jpeg) {
                    warn!("{}: {err:#}", self.name);
                }
            }
            Err(err) => warn!("{}: jpeg encode failed: {err:#}", self.name),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{Capture, FrameMeta};
    use crate::frame::FrameImage;
    use crate::graph::edge;

    fn capture() -> Capture {
        let mut capture = Capture::new(
            FrameMeta {
                sequence: 42,
                timestamp_s: 1.25,
            },
            FrameImage::filled(160, 120, [20, 20, 20]),
        );
        capture.metadata.set("source_fps", 29.97);
        capture.metadata.set("percent_focus", 55.0);
        capture
    }

    #[test]
    fn hud_shows_clock_then_annotations_in_order() {
        let lines = DebugSinkNode::hud_lines(&capture());
        assert_eq!(
            lines,
            vec!["t 1.25s #42", "source_fps: 29.97", "percent_focus: 55.00"]
        );
    }

    #[test]
    fn step_publishes_an_encoded_frame() {
        let (tx, rx) = edge("cam_sink_in");
        let video = VideoStream::new("source");
        let mut node = DebugSinkNode::new("cam_sink", rx, video.clone());

        assert!(tx.offer(capture()));
        node.step();

        let jpeg = video.snapshot().unwrap().expect("frame published");
        let decoded = FrameImage::decode_jpeg(&jpeg).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (160, 120));
    }

    #[test]
    fn empty_edge_publishes_nothing() {
        let (_tx, rx) = edge::<Capture>("cam_sink_in");
        let video = VideoStream::new("source");
        let mut node = DebugSinkNode::new("cam_sink", rx, video.clone());
        node.step();
        assert!(video.snapshot().unwrap().is_none());
    }
}
