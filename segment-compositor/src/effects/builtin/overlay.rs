//! Overlay Effect
//!
//! Tints every tracked object with its palette color on top of whatever
//! the base slot drew. Variants select the tint opacity.

use crate::effects::textures::MaskTextures;
use crate::effects::traits::{Effect, EffectDefinition, EffectError, EffectOptions, EffectSettings, FrameContext};
use crate::effects::variant::VariantTable;
use crate::mask::Tracklet;
use crate::render::{Canvas, DrawPass};

const OPACITY: VariantTable<f32> = VariantTable::new(&[0.5, 0.75, 0.3, 1.0]);

pub struct OverlayDefinition;

impl EffectDefinition for OverlayDefinition {
    fn effect_type(&self) -> &'static str {
        "overlay"
    }

    fn display_name(&self) -> &'static str {
        "Overlay"
    }

    fn variant_count(&self) -> usize {
        OPACITY.len()
    }

    fn create(&self, settings: &EffectSettings) -> Box<dyn Effect> {
        Box::new(OverlayEffect::new(settings))
    }
}

pub struct OverlayEffect {
    variant: usize,
    max_layers: usize,
    masks: MaskTextures,
}

impl OverlayEffect {
    pub fn new(settings: &EffectSettings) -> Self {
        Self {
            variant: 0,
            max_layers: settings.max_mask_layers.clamp(1, crate::render::MAX_MASK_LAYERS),
            masks: MaskTextures::new(),
        }
    }

    pub fn opacity(&self) -> f32 {
        OPACITY.get(self.variant)
    }
}

impl Effect for OverlayEffect {
    fn effect_type(&self) -> &'static str {
        "overlay"
    }

    fn variant_count(&self) -> usize {
        OPACITY.len()
    }

    fn variant(&self) -> usize {
        self.variant
    }

    fn update(&mut self, options: EffectOptions) -> Result<(), EffectError> {
        if let Some(variant) = options.variant {
            self.variant = OPACITY.index(variant);
        }
        Ok(())
    }

    fn apply(
        &mut self,
        canvas: &mut dyn Canvas,
        ctx: &FrameContext<'_>,
        tracklets: &[Tracklet],
    ) -> Result<(), EffectError> {
        let layers = self
            .masks
            .upload(canvas, ctx.frame_index, ctx.masks, tracklets, self.max_layers)?;
        if layers.is_empty() {
            return Ok(());
        }
        canvas.draw(&DrawPass::MaskOverlay {
            masks: &layers,
            opacity: self.opacity(),
        })?;
        Ok(())
    }

    fn cleanup(&mut self, canvas: &mut dyn Canvas) {
        self.masks.release(canvas);
    }

    fn texture_count(&self) -> usize {
        self.masks.len()
    }
}
