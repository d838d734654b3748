//! Bounded best-sample cache.
//!
//! The calibration capture stage offers every scored detection here; the
//! cache keeps the `capacity` best and reports exactly what it declined so
//! the caller can remove the corresponding image artifacts.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::path::PathBuf;

/// One calibration sample: the persisted frame plus the corners that
/// scored it.
#[derive(Clone, Debug)]
pub struct CalibrationSample {
    /// Number of interior corners detected in the frame.
    pub score: u32,
    pub image_path: PathBuf,
    pub corner_ids: Vec<u32>,
    pub corners: Vec<(f32, f32)>,
}

/// Outcome of [`SampleCache::offer`].
#[derive(Debug)]
pub enum Offer {
    /// Below capacity; the sample was kept.
    Retained,
    /// At capacity and strictly better than the current worst; the evicted
    /// sample is handed back for artifact cleanup.
    RetainedEvicting(CalibrationSample),
    /// Not strictly better than the current worst; the offered sample
    /// comes straight back. Ties favor what the cache already holds.
    Rejected(CalibrationSample),
}

struct Entry {
    seq: u64,
    sample: CalibrationSample,
}

// BinaryHeap is a max-heap, so entries are ordered by evictability: the
// peek is always the next candidate to go. Lowest score is most evictable;
// among equal scores the later arrival goes first, which is what makes a
// later equal-score offer lose to an earlier retained sample.
impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.sample
            .score
            .cmp(&other.sample.score)
            .reverse()
            .then(self.seq.cmp(&other.seq))
    }
}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Entry {}

/// Keeps the best `capacity` samples by corner count.
pub struct SampleCache {
    capacity: usize,
    next_seq: u64,
    heap: BinaryHeap<Entry>,
}

impl SampleCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            next_seq: 0,
            heap: BinaryHeap::with_capacity(capacity.min(1024)),
        }
    }

    pub fn offer(&mut self, sample: CalibrationSample) -> Offer {
        let entry = Entry {
            seq: self.next_seq,
            sample,
        };
        self.next_seq += 1;

        if self.heap.len() < self.capacity {
            self.heap.push(entry);
            return Offer::Retained;
        }
        let beats_worst = self
            .heap
            .peek()
            .is_some_and(|worst| entry.sample.score > worst.sample.score);
        if beats_worst {
            if let Some(evicted) = self.heap.pop() {
                self.heap.push(entry);
                return Offer::RetainedEvicting(evicted.sample);
            }
        }
        Offer::Rejected(entry.sample)
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Score of the weakest retained sample.
    pub fn min_score(&self) -> Option<u32> {
        self.heap.peek().map(|e| e.sample.score)
    }

    /// Sum of detected corners across all retained samples.
    pub fn total_corners(&self) -> usize {
        self.heap.iter().map(|e| e.sample.corner_ids.len()).sum()
    }

    /// Retained samples in unspecified order.
    pub fn iter(&self) -> impl Iterator<Item = &CalibrationSample> {
        self.heap.iter().map(|e| &e.sample)
    }

    /// Retained samples ordered by arrival, for deterministic output.
    pub fn samples_by_arrival(&self) -> Vec<&CalibrationSample> {
        let mut entries: Vec<&Entry> = self.heap.iter().collect();
        entries.sort_by_key(|e| e.seq);
        entries.into_iter().map(|e| &e.sample).collect()
    }
}
