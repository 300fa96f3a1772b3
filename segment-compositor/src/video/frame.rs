//! Decoded frames and the presentation-ordered frame buffer

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use super::bitmap::Bitmap;
use super::demux::TrackInfo;
use super::time::Timestamp;

/// A decoded video frame ready for display
#[derive(Debug)]
pub struct DecodedFrame {
    /// RGBA pixels, owned by whoever holds the frame
    pub bitmap: Bitmap,
    /// Presentation timestamp
    pub timestamp: Timestamp,
    /// Display duration recovered from the container sample
    pub duration: Duration,
    /// Stream frame rate at capture time
    pub fps: f64,
}

impl DecodedFrame {
    pub fn width(&self) -> u32 {
        self.bitmap.width()
    }

    pub fn height(&self) -> u32 {
        self.bitmap.height()
    }
}

/// Progress/result shape of a decode run, without pixel data
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoSnapshot {
    pub width: u32,
    pub height: u32,
    pub decoded_frames: usize,
    pub frame_count: usize,
    pub fps: f64,
}

/// Frames of one video sorted by presentation timestamp
///
/// Decoders emit frames in decode order, which differs from presentation
/// order when B-frames are present. [`DecodedVideo::insert`] keeps the
/// sequence sorted after every insertion, so the frame at an index can
/// change until every earlier frame has arrived; see
/// [`DecodedVideo::is_settled`].
#[derive(Debug)]
pub struct DecodedVideo {
    pub width: u32,
    pub height: u32,
    /// Frames the track will yield after edit-list trimming
    pub frame_count: usize,
    pub fps: f64,
    frames: Vec<DecodedFrame>,
    /// Ascending presentation times the track declares; empty when unknown
    expected: Arc<[Timestamp]>,
}

impl DecodedVideo {
    pub fn new(width: u32, height: u32, frame_count: usize, fps: f64) -> Self {
        Self {
            width,
            height,
            frame_count,
            fps,
            frames: Vec::with_capacity(frame_count),
            expected: Arc::from(Vec::new()),
        }
    }

    pub fn from_track(track: &TrackInfo) -> Self {
        let mut video = Self::new(track.width, track.height, track.frame_count(), track.fps);
        video.expected = Arc::clone(&track.presentation_times);
        video
    }

    /// Insert keeping presentation order and return the frame's position.
    ///
    /// Timestamps are unique: a frame whose timestamp is already present is
    /// dropped and `None` returned.
    pub fn insert(&mut self, frame: DecodedFrame) -> Option<usize> {
        let position = self
            .frames
            .partition_point(|existing| existing.timestamp < frame.timestamp);
        if self
            .frames
            .get(position)
            .is_some_and(|existing| existing.timestamp == frame.timestamp)
        {
            return None;
        }
        self.frames.insert(position, frame);
        Some(position)
    }

    /// The frame at `index` is final: every frame presented before it has
    /// arrived, so no later insert can move it.
    ///
    /// Always false when the track's presentation times are unknown; callers
    /// then wait for decoding to finish.
    pub fn is_settled(&self, index: usize) -> bool {
        match (self.frames.get(index), self.expected.get(index)) {
            (Some(frame), Some(expected)) => frame.timestamp == *expected,
            _ => false,
        }
    }

    pub fn frames(&self) -> &[DecodedFrame] {
        &self.frames
    }

    pub fn frame(&self, index: usize) -> Option<&DecodedFrame> {
        self.frames.get(index)
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Release every held frame.
    pub fn clear(&mut self) {
        self.frames.clear();
    }

    pub fn into_frames(self) -> Vec<DecodedFrame> {
        self.frames
    }

    pub fn snapshot(&self) -> VideoSnapshot {
        VideoSnapshot {
            width: self.width,
            height: self.height,
            decoded_frames: self.frames.len(),
            frame_count: self.frame_count,
            fps: self.fps,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::video::BitmapTracker;

    fn frame(tracker: &BitmapTracker, micros: i64) -> DecodedFrame {
        DecodedFrame {
            bitmap: tracker.allocate(1, 1, vec![0; 4]).unwrap(),
            timestamp: Timestamp::from_micros(micros),
            duration: Duration::from_millis(40),
            fps: 25.0,
        }
    }

    #[test]
    fn test_insert_keeps_presentation_order() {
        let tracker = BitmapTracker::new();
        let mut video = DecodedVideo::new(1, 1, 5, 25.0);
        for micros in [0, 120_000, 40_000, 80_000, 160_000] {
            video.insert(frame(&tracker, micros));
        }

        let timestamps: Vec<i64> = video.frames().iter().map(|f| f.timestamp.as_micros()).collect();
        assert_eq!(timestamps, vec![0, 40_000, 80_000, 120_000, 160_000]);
        assert!(timestamps.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_duplicate_timestamp_is_dropped() {
        let tracker = BitmapTracker::new();
        let mut video = DecodedVideo::new(1, 1, 3, 25.0);
        assert_eq!(video.insert(frame(&tracker, 40_000)), Some(0));
        assert_eq!(video.insert(frame(&tracker, 0)), Some(0));
        assert_eq!(video.insert(frame(&tracker, 40_000)), None);

        assert_eq!(video.len(), 2);
        assert_eq!(tracker.live(), 2);
    }

    #[test]
    fn test_settled_frames_follow_declared_times() {
        let tracker = BitmapTracker::new();
        let mut video = DecodedVideo::new(1, 1, 3, 25.0);
        video.expected = Arc::from(vec![
            Timestamp::from_micros(0),
            Timestamp::from_micros(40_000),
            Timestamp::from_micros(80_000),
        ]);

        video.insert(frame(&tracker, 0));
        video.insert(frame(&tracker, 80_000));
        // Index 1 holds the 80ms frame until the 40ms one arrives
        assert!(video.is_settled(0));
        assert!(!video.is_settled(1));
        assert!(!video.is_settled(2));

        video.insert(frame(&tracker, 40_000));
        assert!((0..3).all(|i| video.is_settled(i)));
        assert!(!video.is_settled(3));
    }

    #[test]
    fn test_unknown_times_never_settle() {
        let tracker = BitmapTracker::new();
        let mut video = DecodedVideo::new(1, 1, 1, 25.0);
        video.insert(frame(&tracker, 0));
        assert!(!video.is_settled(0));
    }

    #[test]
    fn test_clear_releases_bitmaps() {
        let tracker = BitmapTracker::new();
        let mut video = DecodedVideo::new(1, 1, 2, 25.0);
        video.insert(frame(&tracker, 0));
        video.insert(frame(&tracker, 40_000));
        assert_eq!(tracker.live(), 2);

        video.clear();
        assert_eq!(tracker.live(), 0);
        assert!(video.is_empty());
    }

    #[test]
    fn test_snapshot() {
        let tracker = BitmapTracker::new();
        let mut video = DecodedVideo::new(640, 360, 10, 30.0);
        video.insert(frame(&tracker, 0));
        let snapshot = video.snapshot();
        assert_eq!(snapshot.decoded_frames, 1);
        assert_eq!(snapshot.frame_count, 10);

        let json = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(json["frameCount"], 10);
        assert_eq!(json["decodedFrames"], 1);
    }
}
