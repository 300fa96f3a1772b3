//! Frame decoder adapter
//!
//! Drives a [`PlatformDecoder`] from demuxed samples. Samples go in strictly
//! in decode order; frames come back in whatever order the platform emits
//! them and are paired with the next unconsumed sample to recover duration.
//! Frames that precede the track's edit-list start are pre-roll and are
//! dropped without error.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use thiserror::Error;
use tracing::{debug, info, trace, warn};

use super::bitmap::{Bitmap, BitmapError, BitmapTracker};
use super::demux::{DemuxError, DemuxEvent, Mp4Demuxer, TrackInfo};
use super::frame::{DecodedFrame, DecodedVideo};
use super::sample::{Sample, SampleList};
use super::source::VideoSource;
use super::time::Timestamp;

/// Errors that end a decode session
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("container has no video track")]
    NoVideoTrack,
    #[error("{decoder} cannot decode {codec} at {width}x{height}")]
    UnsupportedConfig {
        decoder: String,
        codec: String,
        width: u32,
        height: u32,
    },
    #[error("decoder faulted: {0}")]
    Runtime(String),
    #[error("decoder produced {produced} frames for {expected} samples")]
    FrameCountMismatch { expected: usize, produced: usize },
    #[error("container parsing failed")]
    Demux(#[source] DemuxError),
    #[error("failed to read video source")]
    Io(#[from] std::io::Error),
    #[error("decoder returned an invalid frame")]
    Frame(#[from] BitmapError),
}

impl From<DemuxError> for DecodeError {
    fn from(err: DemuxError) -> Self {
        match err {
            DemuxError::NoVideoTrack => DecodeError::NoVideoTrack,
            other => DecodeError::Demux(other),
        }
    }
}

/// Parameters a decoder is configured with
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecoderConfig {
    /// RFC 6381 codec string
    pub codec: String,
    pub coded_width: u32,
    pub coded_height: u32,
    /// avcC / hvcC record
    pub description: Option<Bytes>,
}

impl DecoderConfig {
    pub fn is_hevc(&self) -> bool {
        self.codec.starts_with("hvc1") || self.codec.starts_with("hev1")
    }

    pub fn is_avc(&self) -> bool {
        self.codec.starts_with("avc1") || self.codec.starts_with("avc3")
    }
}

/// One compressed sample handed to the platform decoder
#[derive(Debug, Clone)]
pub struct EncodedChunk {
    pub data: Bytes,
    /// Presentation time in microseconds
    pub timestamp_us: i64,
    pub duration_us: i64,
    pub key: bool,
}

impl From<&Sample> for EncodedChunk {
    fn from(sample: &Sample) -> Self {
        let timing = sample.timing();
        Self {
            data: sample.data.clone(),
            timestamp_us: timing.timestamp().as_micros(),
            duration_us: timing.duration().as_micros() as i64,
            key: sample.is_sync,
        }
    }
}

/// Pixel storage of a frame handed out by the platform
pub enum FramePixels<'a> {
    /// The decoder gave up ownership
    Owned(Vec<u8>),
    /// The decoder reuses this buffer after the callback returns; it is
    /// copied before the callback ends
    Borrowed(&'a [u8]),
}

/// A decoded RGBA frame as emitted by the platform
pub struct PlatformFrame<'a> {
    pub timestamp_us: i64,
    pub width: u32,
    pub height: u32,
    pub pixels: FramePixels<'a>,
}

/// A hardware or software video decoder
pub trait PlatformDecoder: Send {
    fn name(&self) -> &str;

    /// Whether `config` can be decoded. Checked before [`configure`](Self::configure).
    fn is_config_supported(&self, config: &DecoderConfig) -> bool;

    fn configure(&mut self, config: &DecoderConfig) -> Result<(), DecodeError>;

    /// Submit one chunk; zero or more frames may be emitted through `output`.
    fn decode(
        &mut self,
        chunk: &EncodedChunk,
        output: &mut dyn FnMut(PlatformFrame<'_>),
    ) -> Result<(), DecodeError>;

    /// Emit every frame still held by the decoder.
    fn flush(&mut self, output: &mut dyn FnMut(PlatformFrame<'_>)) -> Result<(), DecodeError>;

    fn close(&mut self);
}

/// Builds a fresh decoder per decode session
pub type DecoderFactory = Arc<dyn Fn() -> Box<dyn PlatformDecoder> + Send + Sync>;

/// Decoder used when no platform backend is compiled in
pub struct UnavailableDecoder;

impl PlatformDecoder for UnavailableDecoder {
    fn name(&self) -> &str {
        "unavailable"
    }

    fn is_config_supported(&self, _config: &DecoderConfig) -> bool {
        false
    }

    fn configure(&mut self, config: &DecoderConfig) -> Result<(), DecodeError> {
        Err(DecodeError::UnsupportedConfig {
            decoder: self.name().to_string(),
            codec: config.codec.clone(),
            width: config.coded_width,
            height: config.coded_height,
        })
    }

    fn decode(
        &mut self,
        _chunk: &EncodedChunk,
        _output: &mut dyn FnMut(PlatformFrame<'_>),
    ) -> Result<(), DecodeError> {
        Err(DecodeError::Runtime("no decoder backend available".into()))
    }

    fn flush(&mut self, _output: &mut dyn FnMut(PlatformFrame<'_>)) -> Result<(), DecodeError> {
        Ok(())
    }

    fn close(&mut self) {}
}

/// The best decoder this build provides.
pub fn default_decoder() -> Box<dyn PlatformDecoder> {
    #[cfg(feature = "ffmpeg")]
    {
        Box::new(super::ffmpeg::FfmpegDecoder::new())
    }
    #[cfg(not(feature = "ffmpeg"))]
    {
        Box::new(UnavailableDecoder)
    }
}

pub fn default_decoder_factory() -> DecoderFactory {
    Arc::new(default_decoder)
}

/// Shared cancellation flag for a decode or extraction session
#[derive(Debug, Clone, Default)]
pub struct StopToken(Arc<AtomicBool>);

impl StopToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true for the call that actually flipped the flag.
    pub fn stop(&self) -> bool {
        !self.0.swap(true, Ordering::AcqRel)
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Owns a decoder and closes it exactly once
pub struct DecoderHandle {
    decoder: Box<dyn PlatformDecoder>,
    closed: bool,
}

impl DecoderHandle {
    pub fn new(decoder: Box<dyn PlatformDecoder>) -> Self {
        Self {
            decoder,
            closed: false,
        }
    }

    pub fn name(&self) -> &str {
        self.decoder.name()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    fn ensure_open(&self) -> Result<(), DecodeError> {
        if self.closed {
            return Err(DecodeError::Runtime(format!("{} is closed", self.decoder.name())));
        }
        Ok(())
    }

    /// Check support, then configure.
    pub fn configure(&mut self, config: &DecoderConfig) -> Result<(), DecodeError> {
        self.ensure_open()?;
        if !self.decoder.is_config_supported(config) {
            return Err(DecodeError::UnsupportedConfig {
                decoder: self.decoder.name().to_string(),
                codec: config.codec.clone(),
                width: config.coded_width,
                height: config.coded_height,
            });
        }
        self.decoder.configure(config)
    }

    pub fn decode(
        &mut self,
        chunk: &EncodedChunk,
        output: &mut dyn FnMut(PlatformFrame<'_>),
    ) -> Result<(), DecodeError> {
        self.ensure_open()?;
        self.decoder.decode(chunk, output)
    }

    pub fn flush(&mut self, output: &mut dyn FnMut(PlatformFrame<'_>)) -> Result<(), DecodeError> {
        self.ensure_open()?;
        self.decoder.flush(output)
    }

    /// Close the decoder. Later calls are no-ops; returns whether this call closed it.
    pub fn close(&mut self) -> bool {
        if self.closed {
            return false;
        }
        self.closed = true;
        self.decoder.close();
        debug!(decoder = self.decoder.name(), "decoder closed");
        true
    }
}

impl Drop for DecoderHandle {
    fn drop(&mut self) {
        self.close();
    }
}

/// Result of a session that may be stopped before it finishes
#[derive(Debug)]
pub enum DecodeOutcome<T> {
    Completed(T),
    /// A progress callback or stop token ended the session early
    Stopped,
}

impl<T> DecodeOutcome<T> {
    pub fn completed(self) -> Option<T> {
        match self {
            DecodeOutcome::Completed(value) => Some(value),
            DecodeOutcome::Stopped => None,
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, DecodeOutcome::Completed(_))
    }
}

/// Reported to the progress callback during [`decode_stream`]
#[derive(Debug)]
pub enum DecodeProgress {
    Ready(TrackInfo),
    Frame(DecodedFrame),
}

/// Totals of a completed session
#[derive(Debug, Clone)]
pub struct DecodeSummary {
    pub track: TrackInfo,
    /// Frames the decoder emitted, pre-roll included
    pub frames_emitted: usize,
    /// Pre-roll frames dropped by the edit list
    pub frames_dropped: usize,
}

/// Session-wide knobs
#[derive(Debug, Clone)]
pub struct DecodeContext {
    pub tracker: BitmapTracker,
    pub stop: StopToken,
    pub read_chunk_bytes: usize,
}

impl DecodeContext {
    pub fn new(tracker: BitmapTracker) -> Self {
        Self {
            tracker,
            stop: StopToken::new(),
            read_chunk_bytes: 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Stop,
}

struct Picture {
    timestamp: Timestamp,
    bitmap: Bitmap,
}

fn take_picture(frame: PlatformFrame<'_>, tracker: &BitmapTracker) -> Result<Picture, BitmapError> {
    let pixels = match frame.pixels {
        FramePixels::Owned(pixels) => pixels,
        FramePixels::Borrowed(pixels) => pixels.to_vec(),
    };
    Ok(Picture {
        timestamp: Timestamp::from_micros(frame.timestamp_us),
        bitmap: tracker.allocate(frame.width, frame.height, pixels)?,
    })
}

#[derive(Default)]
struct Session {
    track: Option<TrackInfo>,
    samples: SampleList,
    emitted: usize,
    dropped: usize,
}

impl Session {
    fn deliver(
        &mut self,
        picture: Picture,
        on_progress: &mut dyn FnMut(DecodeProgress) -> bool,
    ) -> Flow {
        self.emitted += 1;
        let timing = self.samples.next_unconsumed();
        let Some(track) = self.track.as_ref() else {
            return Flow::Continue;
        };

        if track.edit_start.is_some_and(|start| picture.timestamp < start) {
            self.dropped += 1;
            trace!(timestamp = %picture.timestamp, "dropping pre-roll frame");
            return Flow::Continue;
        }

        let (duration, fps) = match timing {
            Some(timing) => (timing.duration(), timing.fps().unwrap_or(track.fps)),
            None => (Duration::ZERO, track.fps),
        };
        let frame = DecodedFrame {
            bitmap: picture.bitmap,
            timestamp: picture.timestamp,
            duration,
            fps,
        };
        if on_progress(DecodeProgress::Frame(frame)) {
            Flow::Continue
        } else {
            Flow::Stop
        }
    }

    fn deliver_all(
        &mut self,
        pictures: Vec<Result<Picture, BitmapError>>,
        on_progress: &mut dyn FnMut(DecodeProgress) -> bool,
    ) -> Result<Flow, DecodeError> {
        for picture in pictures {
            if self.deliver(picture?, on_progress) == Flow::Stop {
                return Ok(Flow::Stop);
            }
        }
        Ok(Flow::Continue)
    }
}

/// Demux `source` and decode every sample, reporting through `on_progress`.
///
/// Returning `false` from the callback, or setting the context's stop token,
/// ends the session with [`DecodeOutcome::Stopped`]. The decoder is closed on
/// every exit path.
pub fn decode_stream<F>(
    ctx: &DecodeContext,
    source: VideoSource,
    decoder: Box<dyn PlatformDecoder>,
    mut on_progress: F,
) -> Result<DecodeOutcome<DecodeSummary>, DecodeError>
where
    F: FnMut(DecodeProgress) -> bool,
{
    let mut handle = DecoderHandle::new(decoder);
    let result = run_session(ctx, source, &mut handle, &mut on_progress);
    handle.close();
    result
}

fn run_session(
    ctx: &DecodeContext,
    source: VideoSource,
    handle: &mut DecoderHandle,
    on_progress: &mut dyn FnMut(DecodeProgress) -> bool,
) -> Result<DecodeOutcome<DecodeSummary>, DecodeError> {
    let description = source.describe();
    let mut reader = source.open(ctx.read_chunk_bytes)?;
    let mut demuxer = Mp4Demuxer::new();
    let mut session = Session::default();

    loop {
        let Some(range) = reader.next_range(&ctx.stop)? else {
            break;
        };

        for event in demuxer.push(range)? {
            let flow = match event {
                DemuxEvent::Ready(info) => {
                    handle.configure(&info.decoder_config())?;
                    info!(source = %description, decoder = handle.name(), codec = %info.codec, "decoder configured");
                    session.track = Some(info.clone());
                    if on_progress(DecodeProgress::Ready(info)) {
                        Flow::Continue
                    } else {
                        Flow::Stop
                    }
                }
                DemuxEvent::Samples(samples) => submit(handle, &mut session, &samples, ctx, on_progress)?,
            };
            if flow == Flow::Stop || ctx.stop.is_stopped() {
                demuxer.stop();
                return Ok(DecodeOutcome::Stopped);
            }
        }

        if demuxer.is_drained() {
            break;
        }
    }

    if ctx.stop.is_stopped() {
        demuxer.stop();
        return Ok(DecodeOutcome::Stopped);
    }
    demuxer.finish()?;

    let mut pending = Vec::new();
    let tracker = &ctx.tracker;
    if let Err(e) = handle.flush(&mut |frame| pending.push(take_picture(frame, tracker))) {
        handle.close();
        return Err(e);
    }
    if session.deliver_all(pending, on_progress)? == Flow::Stop {
        return Ok(DecodeOutcome::Stopped);
    }

    let track = session.track.take().ok_or(DecodeError::Demux(DemuxError::MissingMovieHeader))?;
    if session.emitted != track.sample_count {
        return Err(DecodeError::FrameCountMismatch {
            expected: track.sample_count,
            produced: session.emitted,
        });
    }

    info!(
        frames = session.emitted,
        dropped = session.dropped,
        "decode completed"
    );
    Ok(DecodeOutcome::Completed(DecodeSummary {
        track,
        frames_emitted: session.emitted,
        frames_dropped: session.dropped,
    }))
}

fn submit(
    handle: &mut DecoderHandle,
    session: &mut Session,
    samples: &[Sample],
    ctx: &DecodeContext,
    on_progress: &mut dyn FnMut(DecodeProgress) -> bool,
) -> Result<Flow, DecodeError> {
    for sample in samples {
        if ctx.stop.is_stopped() {
            return Ok(Flow::Stop);
        }
        session.samples.push(sample);

        let chunk = EncodedChunk::from(sample);
        let mut pending = Vec::new();
        let tracker = &ctx.tracker;
        if let Err(e) = handle.decode(&chunk, &mut |frame| pending.push(take_picture(frame, tracker))) {
            warn!(sample = sample.index, error = %e, "decoder faulted, closing");
            handle.close();
            return Err(e);
        }
        if session.deliver_all(pending, on_progress)? == Flow::Stop {
            return Ok(Flow::Stop);
        }
    }
    Ok(Flow::Continue)
}

/// Decode into a [`DecodedVideo`], calling `on_progress` after each inserted frame.
pub fn decode_video<F>(
    ctx: &DecodeContext,
    source: VideoSource,
    decoder: Box<dyn PlatformDecoder>,
    mut on_progress: F,
) -> Result<DecodeOutcome<DecodedVideo>, DecodeError>
where
    F: FnMut(&DecodedVideo) -> bool,
{
    let mut video: Option<DecodedVideo> = None;
    let outcome = decode_stream(ctx, source, decoder, |progress| match progress {
        DecodeProgress::Ready(info) => {
            let ready = DecodedVideo::from_track(&info);
            let proceed = on_progress(&ready);
            video = Some(ready);
            proceed
        }
        DecodeProgress::Frame(frame) => match video.as_mut() {
            Some(video) => {
                let timestamp = frame.timestamp;
                if video.insert(frame).is_none() {
                    warn!(%timestamp, "frame with a duplicate timestamp dropped");
                }
                on_progress(video)
            }
            None => false,
        },
    })?;

    match (outcome, video) {
        (DecodeOutcome::Completed(_), Some(video)) => Ok(DecodeOutcome::Completed(video)),
        _ => Ok(DecodeOutcome::Stopped),
    }
}
