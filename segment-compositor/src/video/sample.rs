//! Encoded samples and their decode-ordered timing list

use std::time::Duration;

use bytes::Bytes;

use super::time::{media_duration, Timestamp};

/// One compressed access unit read from the container
#[derive(Debug, Clone)]
pub struct Sample {
    /// Position in decode order
    pub index: usize,
    pub data: Bytes,
    /// Decode time in track timescale units
    pub decode_time: i64,
    /// Composition (presentation) time in track timescale units
    pub composition_time: i64,
    /// Duration in track timescale units
    pub duration: u32,
    pub timescale: u32,
    /// Key frame
    pub is_sync: bool,
}

impl Sample {
    pub fn timing(&self) -> SampleTiming {
        SampleTiming {
            index: self.index,
            composition_time: self.composition_time,
            duration: self.duration,
            timescale: self.timescale,
            is_sync: self.is_sync,
        }
    }

    pub fn timestamp(&self) -> Timestamp {
        Timestamp::from_media_units(self.composition_time, self.timescale)
    }
}

/// Timing metadata of a submitted sample, kept after its bytes are dropped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SampleTiming {
    pub index: usize,
    pub composition_time: i64,
    pub duration: u32,
    pub timescale: u32,
    pub is_sync: bool,
}

impl SampleTiming {
    pub fn timestamp(&self) -> Timestamp {
        Timestamp::from_media_units(self.composition_time, self.timescale)
    }

    pub fn duration(&self) -> Duration {
        media_duration(self.duration as u64, self.timescale)
    }

    /// Frame rate implied by this sample's duration.
    pub fn fps(&self) -> Option<f64> {
        (self.duration > 0).then(|| self.timescale as f64 / self.duration as f64)
    }
}

/// All samples submitted to the decoder, indexed by decode order
///
/// Decoders do not echo sample identity back, so each emitted frame is paired
/// with the next unconsumed entry here to recover its duration.
#[derive(Debug, Default)]
pub struct SampleList {
    entries: Vec<SampleTiming>,
    consumed: usize,
}

impl SampleList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, sample: &Sample) {
        debug_assert_eq!(sample.index, self.entries.len());
        self.entries.push(sample.timing());
    }

    /// Take the oldest sample that has not been matched with an output frame.
    pub fn next_unconsumed(&mut self) -> Option<SampleTiming> {
        let entry = self.entries.get(self.consumed).copied()?;
        self.consumed += 1;
        Some(entry)
    }

    pub fn get(&self, index: usize) -> Option<&SampleTiming> {
        self.entries.get(index)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn consumed(&self) -> usize {
        self.consumed
    }
}
