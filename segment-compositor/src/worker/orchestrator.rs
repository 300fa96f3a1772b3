//! The worker loop
//!
//! One thread owns the canvas, the effects, the mask store and the decoded
//! frames. Commands are handled one at a time in arrival order. Decoding runs
//! on a helper thread per source and reports back over a channel, tagged with
//! the generation of the source it belongs to so output of a replaced source
//! is dropped on arrival.
//!
//! Playback and encoding are advanced between messages: the loop waits for
//! the next command or decode message no longer than the time until the next
//! frame is due.

use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{select, unbounded, Receiver, Sender};
use tracing::{debug, error, info, warn};

use crate::effects::{BackgroundUpdate, EffectOptions, EffectRegistry, EffectSettings, EffectSlots, FrameContext};
use crate::error::PipelineError;
use crate::mask::{ClearScope, MaskBatch, MaskStore};
use crate::render::Canvas;
use crate::settings::PipelineSettings;
use crate::telemetry::RenderProfiler;
use crate::video::encode::{FrameSink, SinkConfig};
use crate::video::{
    decode_stream, generate_filmstrip, Bitmap, BitmapTracker, DecodeContext, DecodeError, DecodeOutcome,
    DecodeProgress, DecodeSummary, DecodedVideo, DecoderFactory, StopToken, VideoSource,
};

use super::command::{Command, Event};
use super::state::PipelineState;

/// Longest wait when neither playback nor encoding is due
const IDLE_TICK: Duration = Duration::from_millis(250);
const FALLBACK_FPS: f64 = 30.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Flow {
    Continue,
    Exit,
}

struct DecodeMessage {
    generation: u64,
    body: DecodeBody,
}

enum DecodeBody {
    Progress(DecodeProgress),
    Finished(Result<DecodeOutcome<DecodeSummary>, DecodeError>),
}

struct DecodeSession {
    generation: u64,
    stop: StopToken,
    thread: JoinHandle<()>,
}

/// Wall-clock anchor of the playing position
struct PlaybackClock {
    started: Instant,
    start_frame: usize,
}

impl PlaybackClock {
    fn starting_at(frame: usize) -> Self {
        Self {
            started: Instant::now(),
            start_frame: frame,
        }
    }

    fn due_frame(&self, fps: f64) -> usize {
        self.start_frame + (self.started.elapsed().as_secs_f64() * fps) as usize
    }

    fn until_next_frame(&self, fps: f64) -> Duration {
        let elapsed = self.started.elapsed().as_secs_f64();
        let next = ((elapsed * fps).floor() + 1.0) / fps;
        Duration::from_secs_f64(next - elapsed).max(Duration::from_millis(1))
    }
}

struct EncodeJob {
    sink: Box<dyn FrameSink>,
    next: usize,
}

pub struct Orchestrator {
    settings: PipelineSettings,
    decoder_factory: DecoderFactory,
    tracker: BitmapTracker,
    events: Sender<Event>,
    decode_tx: Sender<DecodeMessage>,
    decode_rx: Receiver<DecodeMessage>,

    state: PipelineState,
    canvas: Option<Box<dyn Canvas>>,
    effects: EffectSlots,
    masks: MaskStore,
    video: Option<DecodedVideo>,
    decode_finished: bool,
    session: Option<DecodeSession>,
    /// Decode threads of replaced sources, joined once they exit
    stopped_threads: Vec<JoinHandle<()>>,
    generation: u64,

    /// Frame on display, or about to be
    position: usize,
    /// Requested seek not yet satisfiable; only the latest is kept
    pending_seek: Option<i64>,
    clock: Option<PlaybackClock>,
    encode: Option<EncodeJob>,
    profiler: Option<RenderProfiler>,
}

impl Orchestrator {
    pub fn new(
        settings: PipelineSettings,
        registry: EffectRegistry,
        decoder_factory: DecoderFactory,
        tracker: BitmapTracker,
        events: Sender<Event>,
    ) -> Self {
        let effect_settings = EffectSettings {
            max_mask_layers: settings.max_mask_layers,
            nearest_scan_limit: settings.nearest_scan_limit,
        };
        let (decode_tx, decode_rx) = unbounded();
        Self {
            settings,
            decoder_factory,
            tracker,
            events,
            decode_tx,
            decode_rx,
            state: PipelineState::default(),
            canvas: None,
            effects: EffectSlots::new(registry, effect_settings),
            masks: MaskStore::new(),
            video: None,
            decode_finished: false,
            session: None,
            stopped_threads: Vec::new(),
            generation: 0,
            position: 0,
            pending_seek: None,
            clock: None,
            encode: None,
            profiler: None,
        }
    }

    /// Process commands until `Shutdown` or until every sender is gone.
    pub fn run(mut self, commands: Receiver<Command>) {
        info!("worker started");
        let decode_rx = self.decode_rx.clone();
        loop {
            let timeout = self.next_timeout();
            let flow = select! {
                recv(commands) -> command => match command {
                    Ok(command) => self.handle(command),
                    Err(_) => {
                        debug!("command channel closed");
                        Flow::Exit
                    }
                },
                recv(decode_rx) -> message => {
                    if let Ok(message) = message {
                        self.on_decode(message);
                    }
                    Flow::Continue
                },
                default(timeout) => Flow::Continue,
            };
            if flow == Flow::Exit {
                break;
            }
            self.tick();
        }
        self.shutdown();
        info!("worker stopped");
    }

    pub(crate) fn handle(&mut self, command: Command) -> Flow {
        debug!(command = ?command, "handling command");
        let result = match command {
            Command::Shutdown => return Flow::Exit,
            Command::SetSource(source) => self.set_source(source),
            Command::SetCanvas(canvas) => self.set_canvas(canvas),
            Command::Play => self.play(),
            Command::Pause => self.pause(),
            Command::Stop => self.stop(),
            Command::Seek { frame_index } => self.seek(frame_index),
            Command::GenerateFilmstrip { width, height } => self.filmstrip(width, height),
            Command::SetEffect { name, slot, options } => self.set_effect(slot, name.as_deref(), options),
            Command::SetBackgroundFrames { timestamps, bitmaps } => self.set_background(timestamps, bitmaps),
            Command::SetMasks(batch) => self.set_masks(batch),
            Command::ClearMasks(scope) => self.clear_masks(scope),
            Command::Encode { sink } => self.begin_encode(sink),
            Command::CancelEncode => {
                self.cancel_encode();
                Ok(())
            }
            Command::EnableStats(enabled) => {
                self.enable_stats(enabled);
                Ok(())
            }
            Command::Close => {
                self.close();
                Ok(())
            }
        };
        if let Err(err) = result {
            self.report(&err, false);
        }
        Flow::Continue
    }

    /// Advance encoding and playback if due.
    pub(crate) fn tick(&mut self) {
        self.encode_step();
        self.advance_playback();
        self.reap_threads();
    }

    fn emit(&self, event: Event) {
        if self.events.send(event).is_err() {
            debug!("event receiver dropped");
        }
    }

    fn emit_state(&self) {
        self.emit(Event::StateChanged(self.state));
    }

    fn report(&self, err: &PipelineError, fatal: bool) {
        if fatal {
            error!(error = %err, kind = ?err.kind(), "session failed");
        } else {
            warn!(error = %err, kind = ?err.kind(), "command failed");
        }
        self.emit(Event::Error {
            payload: err.to_payload(),
            fatal,
        });
    }

    fn fps(&self) -> f64 {
        match &self.video {
            Some(video) if video.fps > 0.0 => video.fps,
            _ => FALLBACK_FPS,
        }
    }

    /// Trimmed track count while decoding, decoded count once finished
    fn frame_count(&self) -> Option<usize> {
        self.video.as_ref().map(|video| {
            if self.decode_finished {
                video.len()
            } else {
                video.frame_count.max(video.len())
            }
        })
    }

    /// Frame `index` is decoded and no earlier frame can still be inserted
    /// ahead of it
    fn is_available(&self, index: usize) -> bool {
        self.video
            .as_ref()
            .is_some_and(|video| video.len() > index && (self.decode_finished || video.is_settled(index)))
    }

    fn next_timeout(&self) -> Duration {
        if self.encode_ready() {
            return Duration::ZERO;
        }
        match &self.clock {
            Some(clock) => clock.until_next_frame(self.fps()).min(IDLE_TICK),
            None => IDLE_TICK,
        }
    }

    // ---- source and decode ----

    fn set_source(&mut self, source: VideoSource) -> Result<(), PipelineError> {
        self.end_session();
        self.generation += 1;
        let generation = self.generation;

        let mut ctx = DecodeContext::new(self.tracker.clone());
        ctx.read_chunk_bytes = self.settings.file_read_chunk_bytes;
        let stop = ctx.stop.clone();
        let decoder = (self.decoder_factory)();
        let tx = self.decode_tx.clone();
        info!(generation, source = %source.describe(), "loading source");

        let thread = thread::Builder::new()
            .name(format!("decode-{generation}"))
            .spawn(move || {
                let result = decode_stream(&ctx, source, decoder, |progress| {
                    tx.send(DecodeMessage {
                        generation,
                        body: DecodeBody::Progress(progress),
                    })
                    .is_ok()
                });
                let _ = tx.send(DecodeMessage {
                    generation,
                    body: DecodeBody::Finished(result),
                });
            })
            .map_err(PipelineError::Thread)?;

        self.session = Some(DecodeSession {
            generation,
            stop,
            thread,
        });
        self.state.load();
        self.pending_seek = Some(0);
        self.emit_state();
        Ok(())
    }

    fn on_decode(&mut self, message: DecodeMessage) {
        if self.session.as_ref().map(|s| s.generation) != Some(message.generation) {
            return;
        }

        match message.body {
            DecodeBody::Progress(DecodeProgress::Ready(track)) => {
                info!(
                    width = track.width,
                    height = track.height,
                    samples = track.sample_count,
                    fps = track.fps,
                    codec = %track.codec,
                    "track ready"
                );
                let video = DecodedVideo::from_track(&track);
                self.emit(Event::Ready(video.snapshot()));
                self.video = Some(video);
                if self.state.ready() {
                    self.emit_state();
                }
                self.resolve_pending_seek();
            }
            DecodeBody::Progress(DecodeProgress::Frame(frame)) => {
                let Some(video) = self.video.as_mut() else {
                    warn!("frame arrived before track info, dropped");
                    return;
                };
                let timestamp = frame.timestamp;
                if video.insert(frame).is_none() {
                    warn!(%timestamp, "frame with a duplicate timestamp dropped");
                    return;
                }
                let snapshot = video.snapshot();
                self.emit(Event::Progress(snapshot));
                self.resolve_pending_seek();
            }
            DecodeBody::Finished(Ok(DecodeOutcome::Completed(summary))) => {
                self.decode_finished = true;
                info!(
                    frames = summary.frames_emitted - summary.frames_dropped,
                    dropped = summary.frames_dropped,
                    "decode completed"
                );
                if let Some(video) = &self.video {
                    self.emit(Event::DecodeCompleted(video.snapshot()));
                }
                self.resolve_pending_seek();
            }
            DecodeBody::Finished(Ok(DecodeOutcome::Stopped)) => {
                debug!(generation = message.generation, "decode stopped");
            }
            DecodeBody::Finished(Err(err)) => {
                self.report(&PipelineError::Decode(err), true);
                self.close();
            }
        }
    }

    /// Stop decoding and drop everything tied to the current source.
    /// Safe to call repeatedly.
    fn end_session(&mut self) {
        if let Some(session) = self.session.take() {
            if session.stop.stop() {
                debug!(generation = session.generation, "decode session stopped");
            }
            self.stopped_threads.push(session.thread);
        }
        if self.abort_encode() {
            info!("encode aborted with its source");
        }
        self.clock = None;
        self.pending_seek = None;
        if let Some(video) = self.video.take() {
            debug!(frames = video.len(), "decoded frames released");
        }
        self.decode_finished = false;
        self.position = 0;
        self.masks.clear(ClearScope::All);
        self.reap_threads();
    }

    fn close(&mut self) {
        self.end_session();
        match self.canvas.as_deref_mut() {
            Some(canvas) => self.effects.cleanup(canvas),
            None => self.effects.forget_retired(),
        }
        if self.state != PipelineState::default() {
            self.state.reset();
            self.emit_state();
        }
    }

    fn reap_threads(&mut self) {
        let (done, running): (Vec<_>, Vec<_>) = self.stopped_threads.drain(..).partition(|t| t.is_finished());
        self.stopped_threads = running;
        for thread in done {
            if thread.join().is_err() {
                error!("decode thread panicked");
            }
        }
    }

    fn shutdown(&mut self) {
        self.close();
        for thread in self.stopped_threads.drain(..) {
            if thread.join().is_err() {
                error!("decode thread panicked");
            }
        }
        self.canvas = None;
    }

    // ---- rendering ----

    fn set_canvas(&mut self, canvas: Box<dyn Canvas>) -> Result<(), PipelineError> {
        match self.canvas.as_deref_mut() {
            Some(previous) => self.effects.cleanup(previous),
            None => self.effects.forget_retired(),
        }
        let (width, height) = canvas.size();
        info!(backend = canvas.backend().display_name(), width, height, "render target set");
        self.canvas = Some(canvas);
        self.redraw()
    }

    /// Draw the current position again if it is decoded.
    fn redraw(&mut self) -> Result<(), PipelineError> {
        if self.state.has_track() && !self.state.encoding && self.is_available(self.position) {
            self.render(self.position)?;
        }
        Ok(())
    }

    fn show_frame(&mut self, index: usize) {
        self.position = index;
        if let Err(err) = self.render(index) {
            self.report(&err, false);
        }
    }

    fn render(&mut self, index: usize) -> Result<(), PipelineError> {
        let total_frames = self.frame_count().unwrap_or(0);
        let fps = self.fps();
        let video = self.video.as_ref().ok_or(PipelineError::NoVideo)?;
        let frame = video.frame(index).ok_or(PipelineError::NoVideo)?;
        let Some(canvas) = self.canvas.as_deref_mut() else {
            debug!(frame_index = index, "no render target, frame not drawn");
            return Ok(());
        };

        let timer = self.profiler.as_ref().map(|profiler| profiler.start());
        canvas.resize(frame.width(), frame.height())?;
        let ctx = FrameContext {
            frame,
            frame_index: index,
            total_frames,
            fps,
            width: frame.width(),
            height: frame.height(),
            masks: self.masks.masks_for(index),
        };
        self.effects.apply(canvas, &ctx, self.masks.tracklets())?;
        let timestamp = frame.timestamp;

        let interval = self.settings.stats_interval_frames.max(1);
        let stats = match (timer, self.profiler.as_mut()) {
            (Some(timer), Some(profiler)) => {
                timer.finish(profiler);
                (profiler.frames_rendered() % interval == 0).then(|| profiler.stats())
            }
            _ => None,
        };

        self.emit(Event::Rendered {
            frame_index: index,
            timestamp,
        });
        if let Some(stats) = stats {
            debug!(avg_ms = stats.avg_ms, p95_ms = stats.p95_ms, fps = stats.fps, "render stats");
            self.emit(Event::Stats(stats));
        }
        Ok(())
    }

    fn enable_stats(&mut self, enabled: bool) {
        self.profiler = enabled.then(RenderProfiler::new);
        info!(enabled, "render statistics");
    }

    // ---- playback ----

    fn play(&mut self) -> Result<(), PipelineError> {
        self.state.play()?;
        let at_end = self.decode_finished && self.frame_count().is_some_and(|count| self.position + 1 >= count);
        if at_end {
            self.position = 0;
        }
        self.clock = Some(PlaybackClock::starting_at(self.position));
        self.emit_state();
        Ok(())
    }

    fn pause(&mut self) -> Result<(), PipelineError> {
        let was_playing = self.state.is_playing();
        self.state.pause()?;
        self.clock = None;
        if was_playing {
            self.emit_state();
        }
        Ok(())
    }

    fn stop(&mut self) -> Result<(), PipelineError> {
        self.state.stop()?;
        self.clock = None;
        self.pending_seek = None;
        self.emit_state();
        if self.is_available(0) {
            self.show_frame(0);
        } else {
            self.position = 0;
            self.pending_seek = Some(0);
        }
        Ok(())
    }

    fn seek(&mut self, frame_index: i64) -> Result<(), PipelineError> {
        self.state.check_seek()?;
        if let Some(previous) = self.pending_seek.replace(frame_index) {
            debug!(previous, frame_index, "pending seek superseded");
        }
        if self.clock.is_some() {
            let start = match self.frame_count() {
                Some(count) if count > 0 => clamp_index(frame_index, count),
                _ => 0,
            };
            self.clock = Some(PlaybackClock::starting_at(start));
        }
        self.resolve_pending_seek();
        Ok(())
    }

    fn resolve_pending_seek(&mut self) {
        let Some(requested) = self.pending_seek else {
            return;
        };
        let Some(count) = self.frame_count() else {
            return;
        };
        if count == 0 {
            if self.decode_finished {
                debug!(requested, "seek dropped, video has no frames");
                self.pending_seek = None;
            }
            return;
        }
        let index = clamp_index(requested, count);
        if self.is_available(index) {
            self.pending_seek = None;
            self.show_frame(index);
        }
    }

    fn advance_playback(&mut self) {
        let Some(clock) = &self.clock else {
            return;
        };
        let due = clock.due_frame(self.fps());
        let Some(count) = self.frame_count() else {
            return;
        };

        if self.decode_finished && due >= count {
            let last = count.saturating_sub(1);
            if count > 0 && self.position != last {
                self.show_frame(last);
            }
            self.clock = None;
            if self.state.pause().is_ok() {
                info!(frames = count, "playback reached the end");
                self.emit_state();
            }
            return;
        }
        if due != self.position && self.pending_seek.is_none() && self.is_available(due) {
            self.show_frame(due);
        }
    }

    fn filmstrip(&mut self, width: u32, height: u32) -> Result<(), PipelineError> {
        let video = self.video.as_ref().ok_or(PipelineError::NoVideo)?;
        let strip =
            generate_filmstrip(video, width, height, &self.tracker).ok_or(PipelineError::Filmstrip { width, height })?;
        debug!(width, height, "filmstrip generated");
        self.emit(Event::Filmstrip(strip));
        Ok(())
    }

    // ---- effects and masks ----

    fn set_effect(&mut self, slot: usize, name: Option<&str>, options: EffectOptions) -> Result<(), PipelineError> {
        let result = self.effects.select(slot, name, options);
        // A failed update leaves the effect in its fallback state, which is
        // still drawn
        self.redraw()?;
        result.map_err(PipelineError::from)
    }

    fn set_background(&mut self, timestamps: Vec<f64>, bitmaps: Vec<Bitmap>) -> Result<(), PipelineError> {
        let update = BackgroundUpdate { timestamps, bitmaps };
        let result = self.effects.deliver_background(update);
        self.redraw()?;
        result.map(|_| ()).map_err(PipelineError::from)
    }

    fn set_masks(&mut self, batch: MaskBatch) -> Result<(), PipelineError> {
        let frame_index = batch.frame_index;
        self.masks.apply_batch(batch);
        if frame_index == self.position && !self.state.is_playing() {
            self.redraw()?;
        }
        Ok(())
    }

    fn clear_masks(&mut self, scope: ClearScope) -> Result<(), PipelineError> {
        self.masks.clear(scope);
        debug!(?scope, "masks cleared");
        if !self.state.is_playing() {
            self.redraw()?;
        }
        Ok(())
    }

    // ---- encoding ----

    fn begin_encode(&mut self, mut sink: Box<dyn FrameSink>) -> Result<(), PipelineError> {
        if self.canvas.is_none() {
            return Err(PipelineError::NoCanvas);
        }
        let video = self.video.as_ref().ok_or(PipelineError::NoVideo)?;
        let config = SinkConfig {
            width: video.width,
            height: video.height,
            fps: self.fps(),
            frame_count: self.frame_count().unwrap_or(0),
        };
        self.state.begin_encode()?;
        if let Err(err) = sink.begin(config) {
            self.state.end_encode();
            return Err(err.into());
        }

        info!(
            width = config.width,
            height = config.height,
            frames = config.frame_count,
            "encode started"
        );
        self.encode = Some(EncodeJob { sink, next: 0 });
        self.emit_state();
        Ok(())
    }

    fn encode_ready(&self) -> bool {
        let Some(job) = &self.encode else {
            return false;
        };
        self.is_available(job.next) || self.decode_finished
    }

    fn encode_step(&mut self) {
        let Some(next) = self.encode.as_ref().map(|job| job.next) else {
            return;
        };
        let Some(count) = self.frame_count() else {
            return;
        };
        if next >= count || (self.decode_finished && !self.is_available(next)) {
            if self.decode_finished {
                self.finish_encode();
            }
            return;
        }
        if !self.is_available(next) {
            return;
        }

        match self.encode_frame(next) {
            Ok(()) => {
                if let Some(job) = self.encode.as_mut() {
                    job.next = next + 1;
                }
                self.emit(Event::EncodeProgress {
                    frame_index: next,
                    total: count,
                });
            }
            Err(err) => {
                self.abort_encode();
                self.report(&err, false);
                self.emit_state();
                if let Err(err) = self.redraw() {
                    self.report(&err, false);
                }
            }
        }
    }

    fn encode_frame(&mut self, index: usize) -> Result<(), PipelineError> {
        self.render(index)?;
        let canvas = self.canvas.as_deref_mut().ok_or(PipelineError::NoCanvas)?;
        let image = canvas.read_pixels()?;
        if let Some(job) = self.encode.as_mut() {
            job.sink.push_frame(index, &image)?;
        }
        Ok(())
    }

    fn finish_encode(&mut self) {
        let Some(mut job) = self.encode.take() else {
            return;
        };
        self.state.end_encode();
        match job.sink.end() {
            Ok(()) => {
                info!(frames = job.next, "encode completed");
                self.emit(Event::EncodeCompleted { frames: job.next });
            }
            Err(err) => self.report(&PipelineError::from(err), false),
        }
        self.emit_state();
        if let Err(err) = self.redraw() {
            self.report(&err, false);
        }
    }

    /// Drop the running job without finishing the sink.
    fn abort_encode(&mut self) -> bool {
        self.state.end_encode();
        self.encode.take().is_some()
    }

    fn cancel_encode(&mut self) {
        if self.abort_encode() {
            info!("encode cancelled");
            self.emit_state();
            if let Err(err) = self.redraw() {
                self.report(&err, false);
            }
        }
    }
}

fn clamp_index(requested: i64, count: usize) -> usize {
    requested.clamp(0, count.saturating_sub(1) as i64) as usize
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::effects::{EffectOptions, BACKGROUND_SLOT, HIGHLIGHT_SLOT};
    use crate::error::ErrorKind;
    use crate::mask::{Mask, ObjectId, RleCounts, RleMask};
    use crate::render::CpuCanvas;
    use crate::test_support::{FakeDecoder, Mp4Builder};
    use crate::video::encode::MemorySink;
    use crate::video::PlatformDecoder;
    use crate::worker::PlaybackState;

    fn orchestrator_with(decoder: fn() -> FakeDecoder) -> (Orchestrator, Receiver<Event>, BitmapTracker) {
        let (tx, rx) = unbounded();
        let tracker = BitmapTracker::new();
        let factory: DecoderFactory = Arc::new(move || Box::new(decoder()) as Box<dyn PlatformDecoder>);
        let orchestrator = Orchestrator::new(
            PipelineSettings::default(),
            EffectRegistry::with_builtin(),
            factory,
            tracker.clone(),
            tx,
        );
        (orchestrator, rx, tracker)
    }

    fn orchestrator() -> (Orchestrator, Receiver<Event>, BitmapTracker) {
        orchestrator_with(FakeDecoder::new)
    }

    impl Orchestrator {
        /// Feed decode messages until the session reports its end.
        fn pump_decode(&mut self) {
            let rx = self.decode_rx.clone();
            loop {
                let message = rx.recv_timeout(Duration::from_secs(5)).unwrap();
                let finished = matches!(message.body, DecodeBody::Finished(_));
                self.on_decode(message);
                if finished {
                    break;
                }
            }
        }

        fn pixel(&mut self) -> [u8; 4] {
            let image = self.canvas.as_deref_mut().unwrap().read_pixels().unwrap();
            image.get_pixel(0, 0).0
        }
    }

    fn loaded(samples: usize) -> (Orchestrator, Receiver<Event>, BitmapTracker) {
        let (mut orchestrator, rx, tracker) = orchestrator();
        orchestrator.handle(Command::SetCanvas(Box::new(CpuCanvas::new(1, 1).unwrap())));
        orchestrator.handle(Command::SetSource(VideoSource::Buffer(Mp4Builder::new(samples).build())));
        orchestrator.pump_decode();
        (orchestrator, rx, tracker)
    }

    fn rendered(rx: &Receiver<Event>) -> Vec<usize> {
        rx.try_iter()
            .filter_map(|event| match event {
                Event::Rendered { frame_index, .. } => Some(frame_index),
                _ => None,
            })
            .collect()
    }

    fn errors(rx: &Receiver<Event>) -> Vec<(ErrorKind, bool)> {
        rx.try_iter()
            .filter_map(|event| match event {
                Event::Error { payload, fatal } => Some((payload.kind, fatal)),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_decode_renders_first_frame_and_reports_progress() {
        let (orchestrator, rx, _tracker) = loaded(5);
        let events: Vec<Event> = rx.try_iter().collect();

        assert!(matches!(
            events.first(),
            Some(Event::StateChanged(PipelineState {
                playback: PlaybackState::SourceLoading,
                ..
            }))
        ));
        assert!(events.iter().any(|e| matches!(e, Event::Ready(s) if s.frame_count == 5)));
        let progress = events.iter().filter(|e| matches!(e, Event::Progress(_))).count();
        assert_eq!(progress, 5);
        assert!(matches!(events.last(), Some(Event::DecodeCompleted(s)) if s.decoded_frames == 5));
        assert!(events
            .iter()
            .any(|e| matches!(e, Event::Rendered { frame_index: 0, .. })));
        assert_eq!(orchestrator.state.playback, PlaybackState::Ready);
    }

    #[test]
    fn test_seek_renders_and_clamps() {
        let (mut orchestrator, rx, _tracker) = loaded(5);
        rx.try_iter().for_each(drop);

        orchestrator.handle(Command::Seek { frame_index: 3 });
        assert_eq!(orchestrator.pixel(), [4; 4]);
        orchestrator.handle(Command::Seek { frame_index: 99 });
        assert_eq!(orchestrator.pixel(), [5; 4]);
        orchestrator.handle(Command::Seek { frame_index: -7 });
        assert_eq!(orchestrator.pixel(), [1; 4]);

        assert_eq!(rendered(&rx), vec![3, 4, 0]);
    }

    #[test]
    fn test_seek_waits_for_earlier_frames_with_b_frames() {
        let (mut orchestrator, rx, _tracker) = orchestrator();
        orchestrator.handle(Command::SetCanvas(Box::new(CpuCanvas::new(1, 1).unwrap())));
        // Presentation order of the samples in decode order: 0 3 1 2 4 5
        orchestrator.handle(Command::SetSource(VideoSource::Buffer(Mp4Builder::new(6).b_frames(true).build())));
        orchestrator.handle(Command::Seek { frame_index: 1 });
        orchestrator.pump_decode();

        // Drawn once, after the third sample filled presentation slot 1
        assert_eq!(rendered(&rx), vec![1]);
        assert_eq!(orchestrator.pixel(), [3; 4]);

        for (frame_index, color) in [(0, 1), (2, 4), (3, 2)] {
            orchestrator.handle(Command::Seek { frame_index });
            assert_eq!(orchestrator.pixel(), [color; 4]);
        }
    }

    #[test]
    fn test_first_frame_shown_is_earliest_in_presentation() {
        let (mut orchestrator, _rx, _tracker) = orchestrator_with(|| FakeDecoder::new().latency(2));
        orchestrator.handle(Command::SetCanvas(Box::new(CpuCanvas::new(1, 1).unwrap())));
        orchestrator.handle(Command::SetSource(VideoSource::Buffer(Mp4Builder::new(6).b_frames(true).build())));
        orchestrator.pump_decode();

        assert_eq!(orchestrator.position, 0);
        let first = orchestrator.video.as_ref().unwrap().frame(0).unwrap().bitmap.pixel(0, 0).unwrap();
        assert_eq!(orchestrator.pixel(), first);
    }

    #[test]
    fn test_trimmed_frame_count_while_decoding() {
        let (mut orchestrator, rx, _tracker) = orchestrator();
        orchestrator.handle(Command::SetCanvas(Box::new(CpuCanvas::new(1, 1).unwrap())));
        // Two pre-roll frames before the edit start
        orchestrator.handle(Command::SetSource(VideoSource::Buffer(Mp4Builder::new(6).edit_start(1024).build())));

        let decode_rx = orchestrator.decode_rx.clone();
        loop {
            let message = decode_rx.recv_timeout(Duration::from_secs(5)).unwrap();
            let frame = matches!(message.body, DecodeBody::Progress(DecodeProgress::Frame(_)));
            orchestrator.on_decode(message);
            if frame {
                break;
            }
        }
        let sink = MemorySink::new();
        orchestrator.handle(Command::Encode {
            sink: Box::new(sink.clone()),
        });
        orchestrator.tick();
        orchestrator.pump_decode();
        for _ in 0..10 {
            orchestrator.tick();
        }

        let events: Vec<Event> = rx.try_iter().collect();
        assert!(events.iter().any(|e| matches!(e, Event::Ready(s) if s.frame_count == 4)));
        let totals: Vec<usize> = events
            .iter()
            .filter_map(|e| match e {
                Event::EncodeProgress { total, .. } => Some(*total),
                _ => None,
            })
            .collect();
        assert_eq!(totals, vec![4; 4]);
        assert!(events.iter().any(|e| matches!(e, Event::EncodeCompleted { frames: 4 })));
        assert_eq!(sink.captured().frames.len(), 4);
    }

    #[test]
    fn test_mismatched_background_without_effect_is_reported() {
        let (mut orchestrator, rx, tracker) = loaded(3);
        rx.try_iter().for_each(drop);
        orchestrator.handle(Command::SetBackgroundFrames {
            timestamps: vec![0.0, 1.0],
            bitmaps: vec![Bitmap::solid(4, 2, [0, 200, 0, 255]).unwrap()],
        });
        assert_eq!(errors(&rx), vec![(ErrorKind::MismatchedLength, false)]);
        assert_eq!(orchestrator.pixel(), [1; 4]);
        assert_eq!(tracker.live(), 3);
    }

    #[test]
    fn test_only_latest_pending_seek_is_honored() {
        let (mut orchestrator, rx, _tracker) = orchestrator();
        orchestrator.handle(Command::SetCanvas(Box::new(CpuCanvas::new(1, 1).unwrap())));
        orchestrator.handle(Command::SetSource(VideoSource::Buffer(Mp4Builder::new(6).build())));
        orchestrator.handle(Command::Seek { frame_index: 2 });
        orchestrator.handle(Command::Seek { frame_index: 4 });
        orchestrator.pump_decode();

        assert_eq!(rendered(&rx), vec![4]);
        assert_eq!(orchestrator.position, 4);
    }

    #[test]
    fn test_seek_without_source_is_rejected() {
        let (mut orchestrator, rx, _tracker) = orchestrator();
        orchestrator.handle(Command::Seek { frame_index: 1 });
        assert_eq!(errors(&rx), vec![(ErrorKind::InvalidState, false)]);
    }

    #[test]
    fn test_background_delivery_rerenders_current_frame() {
        let (mut orchestrator, rx, _tracker) = loaded(3);
        orchestrator.handle(Command::SetEffect {
            name: Some("background_video".into()),
            slot: BACKGROUND_SLOT,
            options: EffectOptions::default(),
        });
        // Placeholder background keeps the original frame
        assert_eq!(orchestrator.pixel(), [1; 4]);
        rx.try_iter().for_each(drop);

        orchestrator.handle(Command::SetBackgroundFrames {
            timestamps: vec![0.0],
            bitmaps: vec![Bitmap::solid(4, 2, [200, 0, 0, 255]).unwrap()],
        });
        assert_eq!(rendered(&rx), vec![0]);
        assert_eq!(orchestrator.pixel(), [200, 0, 0, 255]);
    }

    #[test]
    fn test_mismatched_background_falls_back_to_placeholder() {
        let (mut orchestrator, rx, _tracker) = loaded(3);
        orchestrator.handle(Command::SetEffect {
            name: Some("background_video".into()),
            slot: BACKGROUND_SLOT,
            options: EffectOptions::default(),
        });
        orchestrator.handle(Command::SetBackgroundFrames {
            timestamps: vec![0.0],
            bitmaps: vec![Bitmap::solid(4, 2, [200, 0, 0, 255]).unwrap()],
        });
        rx.try_iter().for_each(drop);

        orchestrator.handle(Command::SetBackgroundFrames {
            timestamps: vec![0.0, 1.0],
            bitmaps: vec![Bitmap::solid(4, 2, [0, 200, 0, 255]).unwrap()],
        });
        assert_eq!(errors(&rx), vec![(ErrorKind::MismatchedLength, false)]);
        assert_eq!(orchestrator.pixel(), [1; 4]);
    }

    #[test]
    fn test_masks_trigger_redraw_of_current_frame() {
        let (mut orchestrator, rx, _tracker) = loaded(2);
        orchestrator.handle(Command::SetEffect {
            name: Some("overlay".into()),
            slot: HIGHLIGHT_SLOT,
            options: EffectOptions::variant(3),
        });
        rx.try_iter().for_each(drop);

        // Full 4x2 coverage
        orchestrator.handle(Command::SetMasks(MaskBatch {
            frame_index: 0,
            masks: vec![Mask {
                object_id: ObjectId(0),
                rle: RleMask {
                    size: [2, 4],
                    counts: RleCounts::Runs(vec![0, 8]),
                },
                bbox: None,
            }],
        }));
        assert_eq!(rendered(&rx), vec![0]);
        assert_ne!(orchestrator.pixel(), [1; 4]);

        orchestrator.handle(Command::ClearMasks(ClearScope::All));
        assert_eq!(rendered(&rx), vec![0]);
        assert_eq!(orchestrator.pixel(), [1; 4]);
    }

    #[test]
    fn test_encode_renders_every_frame_in_order() {
        let (mut orchestrator, rx, _tracker) = loaded(4);
        orchestrator.handle(Command::Seek { frame_index: 2 });
        rx.try_iter().for_each(drop);

        let sink = MemorySink::new();
        orchestrator.handle(Command::Encode {
            sink: Box::new(sink.clone()),
        });
        assert!(orchestrator.state.encoding);
        for _ in 0..10 {
            orchestrator.tick();
        }

        let captured = sink.captured();
        assert!(captured.finished);
        let indices: Vec<usize> = captured.frames.iter().map(|(i, _)| *i).collect();
        assert_eq!(indices, vec![0, 1, 2, 3]);
        for (index, image) in &captured.frames {
            assert_eq!(image.get_pixel(0, 0).0, [*index as u8 + 1; 4]);
        }
        drop(captured);

        let events: Vec<Event> = rx.try_iter().collect();
        assert!(events.iter().any(|e| matches!(e, Event::EncodeCompleted { frames: 4 })));
        assert!(!orchestrator.state.encoding);
        // Display returns to where it was
        assert_eq!(orchestrator.pixel(), [3; 4]);
    }

    #[test]
    fn test_encode_requires_canvas() {
        let (mut orchestrator, rx, _tracker) = orchestrator();
        orchestrator.handle(Command::SetSource(VideoSource::Buffer(Mp4Builder::new(2).build())));
        orchestrator.pump_decode();
        rx.try_iter().for_each(drop);

        orchestrator.handle(Command::Encode {
            sink: Box::new(MemorySink::new()),
        });
        assert_eq!(errors(&rx), vec![(ErrorKind::InvalidState, false)]);
        assert!(!orchestrator.state.encoding);
    }

    #[test]
    fn test_decoder_fault_is_fatal_and_releases_frames() {
        let (mut orchestrator, rx, tracker) = orchestrator_with(|| FakeDecoder::new().fail_at(2));
        orchestrator.handle(Command::SetCanvas(Box::new(CpuCanvas::new(1, 1).unwrap())));
        orchestrator.handle(Command::SetSource(VideoSource::Buffer(Mp4Builder::new(5).build())));
        orchestrator.pump_decode();

        assert_eq!(errors(&rx), vec![(ErrorKind::DecoderRuntime, true)]);
        assert_eq!(orchestrator.state.playback, PlaybackState::Idle);
        assert!(orchestrator.video.is_none());
        assert_eq!(tracker.live(), 0);
        assert_eq!(orchestrator.canvas.as_ref().unwrap().texture_count(), 0);
    }

    #[test]
    fn test_close_releases_frames_and_textures() {
        let (mut orchestrator, rx, tracker) = loaded(3);
        assert_eq!(tracker.live(), 3);
        assert!(orchestrator.canvas.as_ref().unwrap().texture_count() > 0);

        orchestrator.handle(Command::Close);
        orchestrator.handle(Command::Close);
        assert_eq!(tracker.live(), 0);
        assert_eq!(orchestrator.canvas.as_ref().unwrap().texture_count(), 0);
        let idle = rx
            .try_iter()
            .filter(|e| {
                matches!(
                    e,
                    Event::StateChanged(PipelineState {
                        playback: PlaybackState::Idle,
                        ..
                    })
                )
            })
            .count();
        assert_eq!(idle, 1);
    }

    #[test]
    fn test_new_source_drops_previous_session() {
        let (mut orchestrator, _rx, tracker) = loaded(3);
        orchestrator.handle(Command::SetSource(VideoSource::Buffer(Mp4Builder::new(2).build())));
        orchestrator.pump_decode();
        assert_eq!(orchestrator.video.as_ref().unwrap().len(), 2);
        assert_eq!(tracker.live(), 2);
    }

    #[test]
    fn test_stats_every_interval() {
        let (mut orchestrator, rx, _tracker) = loaded(4);
        orchestrator.settings.stats_interval_frames = 2;
        orchestrator.handle(Command::EnableStats(true));
        rx.try_iter().for_each(drop);

        for frame_index in 1..=4 {
            orchestrator.handle(Command::Seek { frame_index });
        }
        let stats: Vec<_> = rx
            .try_iter()
            .filter_map(|e| match e {
                Event::Stats(stats) => Some(stats),
                _ => None,
            })
            .collect();
        assert_eq!(stats.len(), 2);
        assert_eq!(stats[1].frames_rendered, 4);
    }

    #[test]
    fn test_playback_runs_to_the_end_and_pauses() {
        let (mut orchestrator, rx, _tracker) = loaded(5);
        orchestrator.handle(Command::Play);
        assert!(orchestrator.state.is_playing());
        rx.try_iter().for_each(drop);

        // 5 frames at 25fps
        thread::sleep(Duration::from_millis(300));
        orchestrator.tick();

        assert_eq!(orchestrator.state.playback, PlaybackState::Paused);
        assert_eq!(orchestrator.position, 4);
        assert_eq!(rendered(&rx), vec![4]);

        // Playing again from the end restarts
        orchestrator.handle(Command::Play);
        assert_eq!(orchestrator.clock.as_ref().unwrap().start_frame, 0);
    }

    #[test]
    fn test_stop_rewinds() {
        let (mut orchestrator, rx, _tracker) = loaded(3);
        orchestrator.handle(Command::Seek { frame_index: 2 });
        orchestrator.handle(Command::Play);
        orchestrator.handle(Command::Stop);
        assert_eq!(orchestrator.state.playback, PlaybackState::Ready);
        assert_eq!(orchestrator.position, 0);
        assert_eq!(orchestrator.pixel(), [1; 4]);
        assert!(errors(&rx).is_empty());
    }

    #[test]
    fn test_filmstrip_event() {
        let (mut orchestrator, rx, tracker) = loaded(3);
        rx.try_iter().for_each(drop);
        orchestrator.handle(Command::GenerateFilmstrip { width: 16, height: 4 });
        let strip = rx
            .try_iter()
            .find_map(|e| match e {
                Event::Filmstrip(bitmap) => Some(bitmap),
                _ => None,
            })
            .unwrap();
        assert_eq!(strip.dimensions(), (16, 4));
        assert_eq!(tracker.live(), 4);
    }
}
