//! Original Effect
//!
//! Draws the decoded frame unchanged.

use crate::effects::textures::FrameTexture;
use crate::effects::traits::{Effect, EffectDefinition, EffectError, EffectOptions, EffectSettings, FrameContext};
use crate::mask::Tracklet;
use crate::render::{Canvas, DrawPass};

pub struct OriginalDefinition;

impl EffectDefinition for OriginalDefinition {
    fn effect_type(&self) -> &'static str {
        "original"
    }

    fn display_name(&self) -> &'static str {
        "Original"
    }

    fn variant_count(&self) -> usize {
        1
    }

    fn create(&self, _settings: &EffectSettings) -> Box<dyn Effect> {
        Box::new(OriginalEffect::new())
    }
}

pub struct OriginalEffect {
    frame: FrameTexture,
}

impl OriginalEffect {
    pub fn new() -> Self {
        Self {
            frame: FrameTexture::new("original frame"),
        }
    }
}

impl Default for OriginalEffect {
    fn default() -> Self {
        Self::new()
    }
}

impl Effect for OriginalEffect {
    fn effect_type(&self) -> &'static str {
        "original"
    }

    fn variant_count(&self) -> usize {
        1
    }

    fn variant(&self) -> usize {
        0
    }

    fn update(&mut self, _options: EffectOptions) -> Result<(), EffectError> {
        Ok(())
    }

    fn apply(
        &mut self,
        canvas: &mut dyn Canvas,
        ctx: &FrameContext<'_>,
        _tracklets: &[Tracklet],
    ) -> Result<(), EffectError> {
        let source = self.frame.upload(canvas, &ctx.frame.bitmap)?;
        canvas.draw(&DrawPass::Blit { source })?;
        Ok(())
    }

    fn cleanup(&mut self, canvas: &mut dyn Canvas) {
        self.frame.release(canvas);
    }

    fn texture_count(&self) -> usize {
        usize::from(self.frame.is_allocated())
    }
}
