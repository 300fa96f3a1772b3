//! Effect traits and per-frame inputs

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::mask::{Mask, Tracklet};
use crate::render::{Canvas, CanvasError};
use crate::video::{Bitmap, DecodedFrame};

/// Background frame arrays whose lengths disagree
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{timestamps} background timestamps but {bitmaps} bitmaps")]
pub struct MismatchedLengthError {
    pub timestamps: usize,
    pub bitmaps: usize,
}

#[derive(Debug, Error)]
pub enum EffectError {
    #[error(transparent)]
    MismatchedLength(#[from] MismatchedLengthError),
    #[error("canvas operation failed")]
    Canvas(#[from] CanvasError),
    #[error("unknown effect '{0}'")]
    UnknownEffect(String),
    #[error("effect slot {slot} out of range (0..{count})")]
    InvalidSlot { slot: usize, count: usize },
}

/// Pipeline-wide knobs every effect instance is created with
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EffectSettings {
    /// Masks combined per draw, capped at `render::MAX_MASK_LAYERS`
    pub max_mask_layers: usize,
    /// Largest background set searched linearly
    pub nearest_scan_limit: usize,
}

impl Default for EffectSettings {
    fn default() -> Self {
        Self {
            max_mask_layers: crate::render::MAX_MASK_LAYERS,
            nearest_scan_limit: 64,
        }
    }
}

/// Background frames handed over by value. Timestamps are seconds.
#[derive(Debug, Default)]
pub struct BackgroundUpdate {
    pub timestamps: Vec<f64>,
    pub bitmaps: Vec<Bitmap>,
}

impl BackgroundUpdate {
    /// Timestamps and bitmaps must pair up one to one.
    pub fn check_lengths(&self) -> Result<(), MismatchedLengthError> {
        if self.timestamps.len() == self.bitmaps.len() {
            Ok(())
        } else {
            Err(MismatchedLengthError {
                timestamps: self.timestamps.len(),
                bitmaps: self.bitmaps.len(),
            })
        }
    }
}

/// Parameters for [`Effect::update`]. Fields left `None` keep their value.
#[derive(Debug, Default)]
pub struct EffectOptions {
    pub variant: Option<i64>,
    pub background: Option<BackgroundUpdate>,
}

impl EffectOptions {
    pub fn variant(variant: i64) -> Self {
        Self {
            variant: Some(variant),
            ..Self::default()
        }
    }
}

/// Everything an effect may read while drawing one frame
#[derive(Debug, Clone, Copy)]
pub struct FrameContext<'a> {
    pub frame: &'a DecodedFrame,
    pub frame_index: usize,
    pub total_frames: usize,
    pub fps: f64,
    pub width: u32,
    pub height: u32,
    /// Masks known for this frame
    pub masks: &'a [Mask],
}

impl FrameContext<'_> {
    /// Main-video time in seconds derived from the frame index
    pub fn time_secs(&self) -> f64 {
        if self.fps > 0.0 {
            self.frame_index as f64 / self.fps
        } else {
            0.0
        }
    }
}

/// Factory for effect instances, registered with the `EffectRegistry`
pub trait EffectDefinition: Send + Sync {
    /// Unique identifier (e.g. "background_video")
    fn effect_type(&self) -> &'static str;

    fn display_name(&self) -> &'static str;

    fn variant_count(&self) -> usize;

    fn create(&self, settings: &EffectSettings) -> Box<dyn Effect>;
}

/// A live effect bound to one slot
///
/// `apply` draws synchronously; `cleanup` destroys every texture the effect
/// created and may be called any number of times.
pub trait Effect: Send {
    fn effect_type(&self) -> &'static str;

    fn variant_count(&self) -> usize;

    /// Active variant, already wrapped into `0..variant_count`
    fn variant(&self) -> usize;

    fn update(&mut self, options: EffectOptions) -> Result<(), EffectError>;

    fn apply(
        &mut self,
        canvas: &mut dyn Canvas,
        ctx: &FrameContext<'_>,
        tracklets: &[Tracklet],
    ) -> Result<(), EffectError>;

    fn cleanup(&mut self, canvas: &mut dyn Canvas);

    /// Canvas textures currently owned by this effect
    fn texture_count(&self) -> usize;
}
