//! Messages between the control side and the worker thread
//!
//! Everything that crosses the boundary is moved: bitmaps, the canvas and the
//! encode sink are owned by the worker once sent.

use std::fmt;

use crate::effects::EffectOptions;
use crate::error::ErrorPayload;
use crate::mask::{ClearScope, MaskBatch};
use crate::render::Canvas;
use crate::telemetry::RenderStats;
use crate::video::encode::FrameSink;
use crate::video::{Bitmap, Timestamp, VideoSnapshot, VideoSource};

use super::state::PipelineState;

/// Requests processed in FIFO order by the worker
pub enum Command {
    /// Start decoding a new source, replacing the current one
    SetSource(VideoSource),
    /// Hand over the render target
    SetCanvas(Box<dyn Canvas>),
    Play,
    Pause,
    /// Pause and rewind to the first frame
    Stop,
    /// Out-of-range indices are clamped
    Seek { frame_index: i64 },
    GenerateFilmstrip { width: u32, height: u32 },
    /// `name: None` clears the slot
    SetEffect {
        name: Option<String>,
        slot: usize,
        options: EffectOptions,
    },
    /// Parallel arrays; timestamps are seconds
    SetBackgroundFrames { timestamps: Vec<f64>, bitmaps: Vec<Bitmap> },
    SetMasks(MaskBatch),
    ClearMasks(ClearScope),
    /// Render every frame through the active effects into `sink`
    Encode { sink: Box<dyn FrameSink> },
    CancelEncode,
    EnableStats(bool),
    /// Stop decoding and release every frame and texture
    Close,
    Shutdown,
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::SetSource(_) => "set_source",
            Command::SetCanvas(_) => "set_canvas",
            Command::Play => "play",
            Command::Pause => "pause",
            Command::Stop => "stop",
            Command::Seek { .. } => "seek",
            Command::GenerateFilmstrip { .. } => "generate_filmstrip",
            Command::SetEffect { .. } => "set_effect",
            Command::SetBackgroundFrames { .. } => "set_background_frames",
            Command::SetMasks(_) => "set_masks",
            Command::ClearMasks(_) => "clear_masks",
            Command::Encode { .. } => "encode",
            Command::CancelEncode => "cancel_encode",
            Command::EnableStats(_) => "enable_stats",
            Command::Close => "close",
            Command::Shutdown => "shutdown",
        }
    }
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::SetSource(source) => write!(f, "SetSource({})", source.describe()),
            Command::Seek { frame_index } => write!(f, "Seek({frame_index})"),
            Command::SetEffect { name, slot, .. } => write!(f, "SetEffect({name:?}, slot {slot})"),
            Command::SetBackgroundFrames { timestamps, bitmaps } => {
                write!(f, "SetBackgroundFrames({} timestamps, {} bitmaps)", timestamps.len(), bitmaps.len())
            }
            Command::SetMasks(batch) => write!(f, "SetMasks(frame {}, {} masks)", batch.frame_index, batch.masks.len()),
            Command::ClearMasks(scope) => write!(f, "ClearMasks({scope:?})"),
            Command::EnableStats(enabled) => write!(f, "EnableStats({enabled})"),
            other => f.write_str(other.name()),
        }
    }
}

/// Notifications from the worker
#[derive(Debug)]
pub enum Event {
    /// Track parsed; no frames yet
    Ready(VideoSnapshot),
    /// A frame was decoded
    Progress(VideoSnapshot),
    DecodeCompleted(VideoSnapshot),
    StateChanged(PipelineState),
    Rendered { frame_index: usize, timestamp: Timestamp },
    Filmstrip(Bitmap),
    EncodeProgress { frame_index: usize, total: usize },
    EncodeCompleted { frames: usize },
    Stats(RenderStats),
    /// `fatal` errors ended the session
    Error { payload: ErrorPayload, fatal: bool },
}
