//! Background Video Effect
//!
//! Replaces everything outside the tracked objects with frames from a
//! second video. Pixels covered by any mask keep the original frame; the
//! rest mix toward the background frame nearest in time, weighted by that
//! frame's alpha and the variant's strength.

use tracing::{debug, info, warn};

use crate::effects::textures::{FrameTexture, MaskTextures};
use crate::effects::traits::{
    BackgroundUpdate, Effect, EffectDefinition, EffectError, EffectOptions, EffectSettings,
    FrameContext, MismatchedLengthError,
};
use crate::effects::variant::VariantTable;
use crate::mask::Tracklet;
use crate::render::{Canvas, DrawPass, FilterMode, TextureDescriptor, TextureFormat, TextureHandle};
use crate::video::Bitmap;

const STRENGTH: VariantTable<f32> = VariantTable::new(&[1.0, 0.75, 0.5, 0.25]);

/// Background frames sorted by timestamp (seconds)
#[derive(Debug, Default)]
pub struct BackgroundFrameSet {
    timestamps: Vec<f64>,
    bitmaps: Vec<Bitmap>,
}

impl BackgroundFrameSet {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Pair timestamps with bitmaps by position and sort by time.
    pub fn from_parts(timestamps: Vec<f64>, bitmaps: Vec<Bitmap>) -> Result<Self, MismatchedLengthError> {
        if timestamps.len() != bitmaps.len() {
            return Err(MismatchedLengthError {
                timestamps: timestamps.len(),
                bitmaps: bitmaps.len(),
            });
        }
        let mut pairs: Vec<(f64, Bitmap)> = timestamps.into_iter().zip(bitmaps).collect();
        pairs.sort_by(|a, b| a.0.total_cmp(&b.0));
        let (timestamps, bitmaps) = pairs.into_iter().unzip();
        Ok(Self { timestamps, bitmaps })
    }

    pub fn len(&self) -> usize {
        self.timestamps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timestamps.is_empty()
    }

    pub fn timestamps(&self) -> &[f64] {
        &self.timestamps
    }

    pub fn bitmap(&self, index: usize) -> Option<&Bitmap> {
        self.bitmaps.get(index)
    }

    /// Index of the frame closest to `time`; ties keep the earlier frame.
    ///
    /// Sets up to `scan_limit` frames are scanned linearly, stopping once
    /// the distance starts growing. Larger sets use binary search.
    pub fn nearest(&self, time: f64, scan_limit: usize) -> Option<usize> {
        if self.timestamps.is_empty() {
            return None;
        }
        if self.timestamps.len() <= scan_limit {
            Some(self.nearest_linear(time))
        } else {
            Some(self.nearest_binary(time))
        }
    }

    fn nearest_linear(&self, time: f64) -> usize {
        let mut best = 0;
        let mut best_distance = (self.timestamps[0] - time).abs();
        for (i, t) in self.timestamps.iter().enumerate().skip(1) {
            let distance = (t - time).abs();
            if distance < best_distance {
                best = i;
                best_distance = distance;
            } else if distance > best_distance {
                break;
            }
        }
        best
    }

    fn nearest_binary(&self, time: f64) -> usize {
        let after = self.timestamps.partition_point(|&t| t < time);
        if after == 0 {
            return 0;
        }
        if after == self.timestamps.len() {
            return after - 1;
        }
        let before = after - 1;
        if (self.timestamps[after] - time).abs() < (time - self.timestamps[before]).abs() {
            after
        } else {
            before
        }
    }
}

/// What the background texture slot held during the last draw
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackgroundBinding {
    /// 1x1 transparent texture; output equals the original frame
    Placeholder,
    Frame(usize),
}

pub struct BackgroundVideoDefinition;

impl EffectDefinition for BackgroundVideoDefinition {
    fn effect_type(&self) -> &'static str {
        "background_video"
    }

    fn display_name(&self) -> &'static str {
        "Background Video"
    }

    fn variant_count(&self) -> usize {
        STRENGTH.len()
    }

    fn create(&self, settings: &EffectSettings) -> Box<dyn Effect> {
        Box::new(BackgroundVideoEffect::new(settings))
    }
}

pub struct BackgroundVideoEffect {
    settings: EffectSettings,
    variant: usize,
    frames: BackgroundFrameSet,
    frame_texture: FrameTexture,
    background_texture: FrameTexture,
    /// Background frame currently uploaded to `background_texture`
    uploaded: Option<usize>,
    placeholder: Option<TextureHandle>,
    masks: MaskTextures,
    last_binding: Option<BackgroundBinding>,
}

impl BackgroundVideoEffect {
    pub fn new(settings: &EffectSettings) -> Self {
        Self {
            settings: *settings,
            variant: 0,
            frames: BackgroundFrameSet::empty(),
            frame_texture: FrameTexture::new("background effect frame"),
            background_texture: FrameTexture::new("background video frame"),
            uploaded: None,
            placeholder: None,
            masks: MaskTextures::new(),
            last_binding: None,
        }
    }

    pub fn frames(&self) -> &BackgroundFrameSet {
        &self.frames
    }

    pub fn strength(&self) -> f32 {
        STRENGTH.get(self.variant)
    }

    pub fn last_binding(&self) -> Option<BackgroundBinding> {
        self.last_binding
    }

    /// Swap in a new frame set. The old bitmaps are released first; on a
    /// length mismatch the set stays empty.
    fn replace_frames(&mut self, update: BackgroundUpdate) -> Result<(), MismatchedLengthError> {
        let previous = std::mem::take(&mut self.frames);
        drop(previous);
        self.uploaded = None;

        match BackgroundFrameSet::from_parts(update.timestamps, update.bitmaps) {
            Ok(frames) => {
                info!(frames = frames.len(), "background frames installed");
                self.frames = frames;
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "background frames discarded");
                Err(e)
            }
        }
    }

    fn bind_background(&mut self, canvas: &mut dyn Canvas, time: f64) -> Result<(TextureHandle, BackgroundBinding), EffectError> {
        let Some(index) = self.frames.nearest(time, self.settings.nearest_scan_limit) else {
            let handle = match self.placeholder {
                Some(handle) => handle,
                None => {
                    let handle = canvas.create_texture(&TextureDescriptor {
                        label: "background placeholder",
                        width: 1,
                        height: 1,
                        format: TextureFormat::Rgba8,
                        filter: FilterMode::Nearest,
                    })?;
                    canvas.write_texture(handle, &[0, 0, 0, 0])?;
                    self.placeholder = Some(handle);
                    handle
                }
            };
            return Ok((handle, BackgroundBinding::Placeholder));
        };

        let handle = match (self.uploaded, self.background_texture.handle()) {
            (Some(uploaded), Some(handle)) if uploaded == index => handle,
            _ => {
                let handle = self
                    .background_texture
                    .upload(canvas, &self.frames.bitmaps[index])?;
                self.uploaded = Some(index);
                debug!(index, time, "background frame bound");
                handle
            }
        };
        Ok((handle, BackgroundBinding::Frame(index)))
    }
}

impl Effect for BackgroundVideoEffect {
    fn effect_type(&self) -> &'static str {
        "background_video"
    }

    fn variant_count(&self) -> usize {
        STRENGTH.len()
    }

    fn variant(&self) -> usize {
        self.variant
    }

    fn update(&mut self, options: EffectOptions) -> Result<(), EffectError> {
        if let Some(variant) = options.variant {
            self.variant = STRENGTH.index(variant);
        }
        if let Some(update) = options.background {
            self.replace_frames(update)?;
        }
        Ok(())
    }

    fn apply(
        &mut self,
        canvas: &mut dyn Canvas,
        ctx: &FrameContext<'_>,
        tracklets: &[Tracklet],
    ) -> Result<(), EffectError> {
        let (background, binding) = self.bind_background(canvas, ctx.time_secs())?;
        let layers = self.masks.upload(
            canvas,
            ctx.frame_index,
            ctx.masks,
            tracklets,
            self.settings.max_mask_layers.clamp(1, crate::render::MAX_MASK_LAYERS),
        )?;
        let frame = self.frame_texture.upload(canvas, &ctx.frame.bitmap)?;

        canvas.draw(&DrawPass::BackgroundBlend {
            frame,
            background,
            masks: &layers,
            strength: self.strength(),
        })?;
        self.last_binding = Some(binding);
        Ok(())
    }

    fn cleanup(&mut self, canvas: &mut dyn Canvas) {
        self.frame_texture.release(canvas);
        self.background_texture.release(canvas);
        if let Some(handle) = self.placeholder.take() {
            canvas.destroy_texture(handle);
        }
        self.masks.release(canvas);
        self.uploaded = None;
        self.last_binding = None;
        self.frames = BackgroundFrameSet::empty();
    }

    fn texture_count(&self) -> usize {
        usize::from(self.frame_texture.is_allocated())
            + usize::from(self.background_texture.is_allocated())
            + usize::from(self.placeholder.is_some())
            + self.masks.len()
    }
}
