//! Capture units flowing through the pipeline graph.
//!
//! A [`Capture`] is owned by exactly one node at a time: edges transfer it
//! by value, so stages mutate the image and annotations in place without
//! locking. Duplication is always explicit via [`Capture::deep_copy`];
//! `Clone` is intentionally not implemented so an accidental copy of a
//! multi-megabyte frame cannot hide inside ordinary-looking code.

use crate::frame::FrameImage;

/// Acquisition facts recorded when the frame left the device.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct FrameMeta {
    /// Monotonic per-device frame counter.
    pub sequence: u64,
    /// Capture time in seconds (monotonic clock of the acquisition loop).
    pub timestamp_s: f64,
}

/// Numeric annotations attached by pipeline stages, keyed by name.
///
/// Preserves first-insertion order so the debug HUD renders values in the
/// order the pipeline produced them; writing an existing key updates it in
/// place.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Metadata {
    entries: Vec<(String, f64)>,
}

impl Metadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, key: &str, value: f64) {
        if let Some(entry) = self.entries.iter_mut().find(|(k, _)| k == key) {
            entry.1 = value;
        } else {
            self.entries.push((key.to_string(), value));
        }
    }

    pub fn get(&self, key: &str) -> Option<f64> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| *v)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), *v))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// One unit of pipeline work: a decoded frame plus its acquisition facts
/// and whatever annotations upstream stages have attached so far.
#[derive(Debug)]
pub struct Capture {
    pub meta: FrameMeta,
    pub image: FrameImage,
    pub metadata: Metadata,
}

impl Capture {
    pub fn new(meta: FrameMeta, image: FrameImage) -> Self {
        Self {
            meta,
            image,
            metadata: Metadata::new(),
        }
    }

    /// Full duplication, buffer included. Fan-out stages call this once per
    /// extra output so downstream branches never share a mutable frame.
    pub fn deep_copy(&self) -> Capture {
        Capture {
            meta: self.meta,
            image: self.image.deep_copy(),
            metadata: self.metadata.clone(),
        }
    }
}
