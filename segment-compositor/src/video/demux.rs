//! Incremental MP4 demuxer
//!
//! Bytes arrive as offset-tagged ranges, possibly out of order. The demuxer
//! walks top-level boxes as soon as their headers are available, parses
//! `moov` once it is complete, selects the video track and then releases
//! samples in decode order as their bytes become readable.

use std::collections::BTreeMap;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info};

use super::decoder::DecoderConfig;
use super::mp4::{self, FourCc, SampleLayout, Track};
use super::sample::Sample;
use super::time::Timestamp;

/// Container parsing errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DemuxError {
    #[error("truncated {0} box")]
    Truncated(FourCc),
    #[error("malformed {kind} box: {reason}")]
    Malformed { kind: FourCc, reason: String },
    #[error("container has no video track")]
    NoVideoTrack,
    #[error("video track uses unsupported codec {0}")]
    UnsupportedCodec(FourCc),
    #[error("stream ended before the movie header was found")]
    MissingMovieHeader,
    #[error("stream ended with {missing} of {total} samples unread")]
    TruncatedStream { missing: usize, total: usize },
}

/// A chunk of the source tagged with its absolute file offset
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ByteRange {
    pub offset: u64,
    pub data: Bytes,
}

impl ByteRange {
    pub fn new(offset: u64, data: impl Into<Bytes>) -> Self {
        Self {
            offset,
            data: data.into(),
        }
    }

    pub fn end(&self) -> u64 {
        self.offset + self.data.len() as u64
    }
}

/// Byte ranges keyed by offset; reads may span adjacent ranges
#[derive(Debug, Default)]
pub struct SparseBuffer {
    chunks: BTreeMap<u64, Bytes>,
}

impl SparseBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, range: ByteRange) {
        if range.data.is_empty() {
            return;
        }
        match self.chunks.get(&range.offset) {
            Some(existing) if existing.len() >= range.data.len() => {}
            _ => {
                self.chunks.insert(range.offset, range.data);
            }
        }
    }

    fn chunk_covering(&self, pos: u64) -> Option<(u64, &Bytes)> {
        self.chunks
            .range(..=pos)
            .rev()
            .find(|(start, data)| **start + data.len() as u64 > pos)
            .map(|(start, data)| (*start, data))
    }

    /// Read `len` bytes at `offset` if every byte is present.
    pub fn read(&self, offset: u64, len: u64) -> Option<Bytes> {
        if len == 0 {
            return Some(Bytes::new());
        }
        let end = offset.checked_add(len)?;

        let (start, chunk) = self.chunk_covering(offset)?;
        let chunk_end = start + chunk.len() as u64;
        if chunk_end >= end {
            let from = (offset - start) as usize;
            return Some(chunk.slice(from..from + len as usize));
        }

        let mut out = BytesMut::with_capacity(len as usize);
        let mut pos = offset;
        while pos < end {
            let (start, chunk) = self.chunk_covering(pos)?;
            let from = (pos - start) as usize;
            let to = ((end - start) as usize).min(chunk.len());
            out.extend_from_slice(&chunk[from..to]);
            pos = start + to as u64;
        }
        Some(out.freeze())
    }

    /// Drop ranges that end at or before `offset`.
    pub fn discard_before(&mut self, offset: u64) {
        self.chunks
            .retain(|start, data| *start + data.len() as u64 > offset);
    }

    pub fn clear(&mut self) {
        self.chunks.clear();
    }

    pub fn buffered_bytes(&self) -> usize {
        self.chunks.values().map(Bytes::len).sum()
    }
}

/// Video track description reported once the movie header is parsed
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrackInfo {
    pub track_id: u32,
    /// Sample entry format, e.g. `avc1`
    pub format: String,
    /// RFC 6381 codec string
    pub codec: String,
    pub width: u32,
    pub height: u32,
    pub timescale: u32,
    pub duration: Timestamp,
    pub sample_count: usize,
    pub fps: f64,
    /// Presentation start of the first non-empty edit
    pub edit_start: Option<Timestamp>,
    /// Ascending presentation times of the frames that survive edit-list
    /// trimming; one entry per frame the track will yield
    #[serde(skip)]
    pub presentation_times: Arc<[Timestamp]>,
    #[serde(skip)]
    pub description: Option<Bytes>,
}

impl TrackInfo {
    fn from_track(track: &Track, layout: &[SampleLayout]) -> Result<Self, DemuxError> {
        let entry = track.entry.as_ref().ok_or(DemuxError::NoVideoTrack)?;
        if ![FourCc::AVC1, FourCc::AVC3, FourCc::HVC1, FourCc::HEV1].contains(&entry.format) {
            return Err(DemuxError::UnsupportedCodec(entry.format));
        }

        let media_duration = if track.duration > 0 {
            track.duration
        } else {
            layout.iter().map(|s| s.duration as u64).sum()
        };
        let duration = Timestamp::from_media_units(media_duration as i64, track.timescale);
        let fps = if duration.as_micros() > 0 {
            layout.len() as f64 / duration.as_secs_f64()
        } else {
            0.0
        };

        let (width, height) = if entry.width > 0 && entry.height > 0 {
            (entry.width as u32, entry.height as u32)
        } else {
            (track.width, track.height)
        };

        let edit_start = track
            .edit_start
            .map(|t| Timestamp::from_media_units(t, track.timescale));
        let mut presentation_times: Vec<Timestamp> = layout
            .iter()
            .map(|s| Timestamp::from_media_units(s.composition_time, track.timescale))
            .filter(|t| edit_start.map_or(true, |start| *t >= start))
            .collect();
        presentation_times.sort_unstable();

        Ok(Self {
            track_id: track.id,
            format: entry.format.to_string(),
            codec: entry.codec_string(),
            width,
            height,
            timescale: track.timescale,
            duration,
            sample_count: layout.len(),
            fps,
            edit_start,
            presentation_times: presentation_times.into(),
            description: entry.config.as_ref().map(|c| c.record().clone()),
        })
    }

    /// Frames left after edit-list trimming
    pub fn frame_count(&self) -> usize {
        self.presentation_times.len()
    }

    pub fn decoder_config(&self) -> DecoderConfig {
        DecoderConfig {
            codec: self.codec.clone(),
            coded_width: self.width,
            coded_height: self.height,
            description: self.description.clone(),
        }
    }
}

/// Output of [`Mp4Demuxer::push`]
#[derive(Debug, Clone)]
pub enum DemuxEvent {
    /// The movie header was parsed and a video track selected
    Ready(TrackInfo),
    /// Samples whose bytes became available, in decode order
    Samples(Vec<Sample>),
}

struct ReadyTrack {
    info: TrackInfo,
    layout: Vec<SampleLayout>,
    next_sample: usize,
    /// Sample offsets never decrease, so consumed ranges can be discarded
    monotonic: bool,
}

/// Incremental demuxer for one MP4 resource
#[derive(Default)]
pub struct Mp4Demuxer {
    buffer: SparseBuffer,
    /// Offset of the next top-level box to inspect
    cursor: u64,
    /// Set when a box extends to the end of the file
    scan_finished: bool,
    track: Option<ReadyTrack>,
    stopped: bool,
}

impl Mp4Demuxer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_ready(&self) -> bool {
        self.track.is_some()
    }

    pub fn track(&self) -> Option<&TrackInfo> {
        self.track.as_ref().map(|t| &t.info)
    }

    pub fn samples_emitted(&self) -> usize {
        self.track.as_ref().map(|t| t.next_sample).unwrap_or(0)
    }

    /// All declared samples have been emitted.
    pub fn is_drained(&self) -> bool {
        self.track
            .as_ref()
            .is_some_and(|t| t.next_sample >= t.layout.len())
    }

    /// Halt demuxing; later pushes are ignored.
    pub fn stop(&mut self) {
        if !self.stopped {
            debug!("demuxer stopped");
            self.stopped = true;
            self.buffer.clear();
        }
    }

    /// Feed one byte range.
    pub fn push(&mut self, range: ByteRange) -> Result<Vec<DemuxEvent>, DemuxError> {
        if self.stopped {
            return Ok(Vec::new());
        }
        self.buffer.insert(range);

        let mut events = Vec::new();
        if self.track.is_none() {
            if let Some(info) = self.scan_for_movie()? {
                events.push(DemuxEvent::Ready(info));
            }
        }

        let samples = self.drain_samples();
        if !samples.is_empty() {
            events.push(DemuxEvent::Samples(samples));
        }
        Ok(events)
    }

    /// Signal end of input. Fails if the stream ended early.
    pub fn finish(&mut self) -> Result<(), DemuxError> {
        if self.stopped {
            return Ok(());
        }
        match &self.track {
            None => Err(DemuxError::MissingMovieHeader),
            Some(track) if track.next_sample < track.layout.len() => Err(DemuxError::TruncatedStream {
                missing: track.layout.len() - track.next_sample,
                total: track.layout.len(),
            }),
            Some(_) => Ok(()),
        }
    }

    fn scan_for_movie(&mut self) -> Result<Option<TrackInfo>, DemuxError> {
        while !self.scan_finished {
            let head = match self.buffer.read(self.cursor, 16) {
                Some(head) => head,
                None => match self.buffer.read(self.cursor, 8) {
                    Some(head) => head,
                    None => return Ok(None),
                },
            };
            let Some(header) = mp4::parse_box_header(&head)? else {
                return Ok(None);
            };

            if header.kind == FourCc::MOOV {
                let size = header.size.ok_or(DemuxError::Malformed {
                    kind: FourCc::MOOV,
                    reason: "movie header cannot extend to end of file".into(),
                })?;
                let Some(payload) = self
                    .buffer
                    .read(self.cursor + header.header_len, size - header.header_len)
                else {
                    return Ok(None);
                };
                let info = self.select_track(&payload)?;
                self.cursor += size;
                return Ok(Some(info));
            }

            debug!(kind = %header.kind, offset = self.cursor, "skipping top-level box");
            match header.size {
                Some(size) => self.cursor += size,
                None => self.scan_finished = true,
            }
        }
        Ok(None)
    }

    fn select_track(&mut self, moov: &[u8]) -> Result<TrackInfo, DemuxError> {
        let movie = mp4::parse_moov(moov)?;
        let track = movie
            .tracks
            .iter()
            .find(|t| t.is_video() && t.entry.is_some())
            .ok_or(DemuxError::NoVideoTrack)?;

        let layout = track.table.layout()?;
        let info = TrackInfo::from_track(track, &layout)?;
        info!(
            track_id = info.track_id,
            codec = %info.codec,
            width = info.width,
            height = info.height,
            samples = info.sample_count,
            fps = info.fps,
            "video track selected"
        );

        let monotonic = layout.windows(2).all(|w| w[0].offset <= w[1].offset);
        self.track = Some(ReadyTrack {
            info: info.clone(),
            layout,
            next_sample: 0,
            monotonic,
        });
        Ok(info)
    }

    fn drain_samples(&mut self) -> Vec<Sample> {
        let Some(track) = self.track.as_mut() else {
            return Vec::new();
        };

        let mut samples = Vec::new();
        while let Some(layout) = track.layout.get(track.next_sample) {
            let Some(data) = self.buffer.read(layout.offset, layout.size as u64) else {
                break;
            };
            samples.push(Sample {
                index: track.next_sample,
                data,
                decode_time: layout.decode_time,
                composition_time: layout.composition_time,
                duration: layout.duration,
                timescale: track.info.timescale,
                is_sync: layout.is_sync,
            });
            track.next_sample += 1;
        }

        if track.monotonic && !samples.is_empty() {
            match track.layout.get(track.next_sample) {
                Some(next) => self.buffer.discard_before(next.offset),
                None => self.buffer.clear(),
            }
        }
        samples
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::Mp4Builder;

    fn collect(events: Vec<DemuxEvent>, ready: &mut Option<TrackInfo>, samples: &mut Vec<Sample>) {
        for event in events {
            match event {
                DemuxEvent::Ready(info) => *ready = Some(info),
                DemuxEvent::Samples(batch) => samples.extend(batch),
            }
        }
    }

    #[test]
    fn test_sparse_buffer_spanning_reads() {
        let mut buffer = SparseBuffer::new();
        buffer.insert(ByteRange::new(4, &b"4567"[..]));
        assert!(buffer.read(0, 6).is_none());
        buffer.insert(ByteRange::new(0, &b"0123"[..]));
        assert_eq!(buffer.read(2, 4).unwrap(), Bytes::from_static(b"2345"));
        assert_eq!(buffer.read(4, 2).unwrap(), Bytes::from_static(b"45"));
        assert!(buffer.read(6, 4).is_none());

        buffer.discard_before(4);
        assert!(buffer.read(0, 1).is_none());
        assert_eq!(buffer.buffered_bytes(), 4);
    }

    #[test]
    fn test_whole_buffer() {
        let file = Mp4Builder::new(4).build();
        let mut demuxer = Mp4Demuxer::new();
        let mut ready = None;
        let mut samples = Vec::new();
        collect(demuxer.push(ByteRange::new(0, file)).unwrap(), &mut ready, &mut samples);

        let info = ready.expect("track info");
        assert_eq!(info.sample_count, 4);
        assert_eq!(info.format, "avc1");
        assert_eq!(info.codec, "avc1.64001f");
        assert_eq!((info.width, info.height), (4, 2));
        assert!((info.fps - 25.0).abs() < 1e-6);
        assert_eq!(samples.len(), 4);
        assert!(samples.iter().enumerate().all(|(i, s)| s.index == i));
        assert!(samples[0].is_sync);
        assert!(demuxer.is_drained());
        demuxer.finish().unwrap();
    }

    #[test]
    fn test_out_of_order_ranges() {
        let file = Mp4Builder::new(6).moov_at_end(true).build();
        let chunks: Vec<ByteRange> = file
            .chunks(7)
            .enumerate()
            .map(|(i, c)| ByteRange::new(i as u64 * 7, Bytes::copy_from_slice(c)))
            .collect();

        let mut demuxer = Mp4Demuxer::new();
        let mut ready = None;
        let mut samples = Vec::new();
        for range in chunks.into_iter().rev() {
            collect(demuxer.push(range).unwrap(), &mut ready, &mut samples);
        }

        assert_eq!(ready.unwrap().sample_count, 6);
        let indices: Vec<usize> = samples.iter().map(|s| s.index).collect();
        assert_eq!(indices, (0..6).collect::<Vec<_>>());
        for sample in &samples {
            assert_eq!(sample.data, Mp4Builder::sample_payload(sample.index));
        }
    }

    #[test]
    fn test_edit_list_and_reordering_metadata() {
        let file = Mp4Builder::new(5).edit_start(1024).b_frames(true).build();
        let mut demuxer = Mp4Demuxer::new();
        let mut ready = None;
        let mut samples = Vec::new();
        collect(demuxer.push(ByteRange::new(0, file)).unwrap(), &mut ready, &mut samples);

        let info = ready.unwrap();
        assert_eq!(info.edit_start, Some(Timestamp::from_micros(80_000)));
        let cts: Vec<i64> = samples.iter().map(|s| s.composition_time).collect();
        let mut sorted = cts.clone();
        sorted.sort();
        assert_ne!(cts, sorted);

        // The frame at 40ms is pre-roll
        let times: Vec<i64> = info.presentation_times.iter().map(|t| t.as_micros()).collect();
        assert_eq!(times, vec![80_000, 120_000, 160_000, 200_000]);
        assert_eq!(info.frame_count(), 4);
        assert_eq!(info.sample_count, 5);
    }

    #[test]
    fn test_no_video_track() {
        let file = Mp4Builder::new(2).handler(*b"soun").build();
        let mut demuxer = Mp4Demuxer::new();
        let err = demuxer.push(ByteRange::new(0, file)).unwrap_err();
        assert_eq!(err, DemuxError::NoVideoTrack);
    }

    #[test]
    fn test_unsupported_codec() {
        let file = Mp4Builder::new(2).format(*b"vp09").build();
        let mut demuxer = Mp4Demuxer::new();
        let err = demuxer.push(ByteRange::new(0, file)).unwrap_err();
        assert_eq!(err, DemuxError::UnsupportedCodec(FourCc(*b"vp09")));
    }

    #[test]
    fn test_finish_reports_truncation() {
        let file = Mp4Builder::new(3).build();
        let cut = file.len() - 2;
        let mut demuxer = Mp4Demuxer::new();
        demuxer.push(ByteRange::new(0, file.slice(..cut))).unwrap();
        assert!(demuxer.is_ready());
        assert_eq!(
            demuxer.finish().unwrap_err(),
            DemuxError::TruncatedStream {
                missing: 1,
                total: 3
            }
        );

        let mut empty = Mp4Demuxer::new();
        assert_eq!(empty.finish().unwrap_err(), DemuxError::MissingMovieHeader);
    }

    #[test]
    fn test_stop_ignores_further_input() {
        let file = Mp4Builder::new(2).build();
        let mut demuxer = Mp4Demuxer::new();
        demuxer.stop();
        demuxer.stop();
        assert!(demuxer.push(ByteRange::new(0, file)).unwrap().is_empty());
        assert!(demuxer.finish().is_ok());
    }
}
