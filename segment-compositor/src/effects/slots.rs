//! Active effect per slot

use tracing::{debug, info};

use crate::mask::Tracklet;
use crate::render::Canvas;

use super::builtin::OriginalEffect;
use super::registry::EffectRegistry;
use super::traits::{BackgroundUpdate, Effect, EffectError, EffectOptions, EffectSettings, FrameContext};

pub const SLOT_COUNT: usize = 2;
/// Base image: background replacement or the untouched frame
pub const BACKGROUND_SLOT: usize = 0;
/// Drawn over the base image
pub const HIGHLIGHT_SLOT: usize = 1;

/// Owns the selected effects and draws them in slot order
///
/// Replaced effects are parked until the next call that has a canvas and
/// are cleaned up there, before anything else is drawn.
pub struct EffectSlots {
    registry: EffectRegistry,
    settings: EffectSettings,
    slots: [Option<Box<dyn Effect>>; SLOT_COUNT],
    base: OriginalEffect,
    retired: Vec<Box<dyn Effect>>,
}

impl EffectSlots {
    pub fn new(registry: EffectRegistry, settings: EffectSettings) -> Self {
        Self {
            registry,
            settings,
            slots: Default::default(),
            base: OriginalEffect::new(),
            retired: Vec::new(),
        }
    }

    pub fn registry(&self) -> &EffectRegistry {
        &self.registry
    }

    /// Select (`Some`) or clear (`None`) the effect in a slot, then apply
    /// `options` to it. Selecting the effect already in the slot only
    /// updates it.
    ///
    /// An update error leaves the effect selected in its fallback state.
    pub fn select(&mut self, slot: usize, name: Option<&str>, options: EffectOptions) -> Result<(), EffectError> {
        if slot >= SLOT_COUNT {
            return Err(EffectError::InvalidSlot {
                slot,
                count: SLOT_COUNT,
            });
        }

        let Some(name) = name else {
            if let Some(previous) = self.slots[slot].take() {
                info!(slot, effect = previous.effect_type(), "effect cleared");
                self.retired.push(previous);
            }
            return Ok(());
        };

        if let Some(current) = self.slots[slot].as_mut() {
            if current.effect_type() == name {
                return current.update(options);
            }
        }

        let mut effect = self.registry.create(name, &self.settings)?;
        let outcome = effect.update(options);
        if let Some(previous) = self.slots[slot].replace(effect) {
            self.retired.push(previous);
        }
        info!(slot, effect = name, "effect selected");
        outcome
    }

    /// Hand background frames to the base slot. Returns false when that
    /// slot is empty, in which case the bitmaps are released. Mismatched
    /// arrays are an error either way.
    pub fn deliver_background(&mut self, update: BackgroundUpdate) -> Result<bool, EffectError> {
        match self.slots[BACKGROUND_SLOT].as_mut() {
            Some(effect) => {
                effect.update(EffectOptions {
                    background: Some(update),
                    ..EffectOptions::default()
                })?;
                Ok(true)
            }
            None => {
                update.check_lengths()?;
                debug!(frames = update.bitmaps.len(), "no base effect, background frames released");
                Ok(false)
            }
        }
    }

    pub fn active(&self, slot: usize) -> Option<&dyn Effect> {
        self.slots.get(slot).and_then(|s| s.as_deref())
    }

    /// Draw one frame through every slot.
    pub fn apply(
        &mut self,
        canvas: &mut dyn Canvas,
        ctx: &FrameContext<'_>,
        tracklets: &[Tracklet],
    ) -> Result<(), EffectError> {
        self.release_retired(canvas);

        match self.slots[BACKGROUND_SLOT].as_mut() {
            Some(effect) => {
                self.base.cleanup(canvas);
                effect.apply(canvas, ctx, tracklets)?;
            }
            None => self.base.apply(canvas, ctx, tracklets)?,
        }
        for effect in self.slots[BACKGROUND_SLOT + 1..].iter_mut().flatten() {
            effect.apply(canvas, ctx, tracklets)?;
        }
        Ok(())
    }

    pub fn release_retired(&mut self, canvas: &mut dyn Canvas) {
        for mut effect in self.retired.drain(..) {
            effect.cleanup(canvas);
        }
    }

    /// Drop parked effects without a canvas. Only valid when no canvas has
    /// ever been drawn to, so they own no textures.
    pub fn forget_retired(&mut self) {
        self.retired.clear();
    }

    /// Release every texture of every effect; selections stay in place.
    pub fn cleanup(&mut self, canvas: &mut dyn Canvas) {
        self.release_retired(canvas);
        self.base.cleanup(canvas);
        for effect in self.slots.iter_mut().flatten() {
            effect.cleanup(canvas);
        }
    }

    /// Textures held across all slots
    pub fn texture_count(&self) -> usize {
        self.base.texture_count()
            + self
                .slots
                .iter()
                .flatten()
                .chain(self.retired.iter())
                .map(|e| e.texture_count())
                .sum::<usize>()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::effects::MismatchedLengthError;
    use crate::render::CpuCanvas;
    use crate::video::{Bitmap, DecodedFrame, Timestamp};

    fn frame() -> DecodedFrame {
        DecodedFrame {
            bitmap: Bitmap::solid(2, 2, [9, 9, 9, 255]).unwrap(),
            timestamp: Timestamp::ZERO,
            duration: Duration::from_millis(40),
            fps: 25.0,
        }
    }

    fn ctx(frame: &DecodedFrame) -> FrameContext<'_> {
        FrameContext {
            frame,
            frame_index: 0,
            total_frames: 1,
            fps: 25.0,
            width: 2,
            height: 2,
            masks: &[],
        }
    }

    fn slots() -> EffectSlots {
        EffectSlots::new(EffectRegistry::with_builtin(), EffectSettings::default())
    }

    #[test]
    fn test_empty_slots_draw_original() {
        let mut canvas = CpuCanvas::new(2, 2).unwrap();
        let mut slots = slots();
        let frame = frame();
        slots.apply(&mut canvas, &ctx(&frame), &[]).unwrap();
        assert!(canvas.read_pixels().unwrap().pixels().all(|p| p.0 == [9, 9, 9, 255]));
    }

    #[test]
    fn test_replacing_effect_releases_its_textures() {
        let mut canvas = CpuCanvas::new(2, 2).unwrap();
        let mut slots = slots();
        let frame = frame();

        slots.select(BACKGROUND_SLOT, Some("background_video"), EffectOptions::default()).unwrap();
        slots.apply(&mut canvas, &ctx(&frame), &[]).unwrap();
        assert!(canvas.texture_count() > 0);

        slots.select(BACKGROUND_SLOT, Some("original"), EffectOptions::default()).unwrap();
        slots.apply(&mut canvas, &ctx(&frame), &[]).unwrap();
        assert_eq!(slots.active(BACKGROUND_SLOT).unwrap().effect_type(), "original");
        assert_eq!(canvas.texture_count(), 1);
        assert_eq!(slots.texture_count(), canvas.texture_count());

        slots.select(BACKGROUND_SLOT, None, EffectOptions::default()).unwrap();
        slots.cleanup(&mut canvas);
        assert_eq!(canvas.texture_count(), 0);
    }

    #[test]
    fn test_reselect_updates_in_place() {
        let mut slots = slots();
        slots.select(HIGHLIGHT_SLOT, Some("overlay"), EffectOptions::default()).unwrap();
        slots.select(HIGHLIGHT_SLOT, Some("overlay"), EffectOptions::variant(-1)).unwrap();
        let overlay = slots.active(HIGHLIGHT_SLOT).unwrap();
        assert_eq!(overlay.variant(), overlay.variant_count() - 1);
    }

    #[test]
    fn test_invalid_selection() {
        let mut slots = slots();
        assert!(matches!(
            slots.select(2, Some("overlay"), EffectOptions::default()),
            Err(EffectError::InvalidSlot { slot: 2, count: 2 })
        ));
        assert!(matches!(
            slots.select(0, Some("nope"), EffectOptions::default()),
            Err(EffectError::UnknownEffect(_))
        ));
        assert!(slots.active(0).is_none());
    }

    #[test]
    fn test_background_without_base_effect() {
        let mut slots = slots();
        let delivered = slots
            .deliver_background(BackgroundUpdate {
                timestamps: vec![0.0],
                bitmaps: vec![Bitmap::solid(1, 1, [0; 4]).unwrap()],
            })
            .unwrap();
        assert!(!delivered);
    }

    #[test]
    fn test_mismatched_background_without_base_effect() {
        let mut slots = slots();
        let err = slots
            .deliver_background(BackgroundUpdate {
                timestamps: vec![0.0, 1.0],
                bitmaps: vec![Bitmap::solid(1, 1, [0; 4]).unwrap()],
            })
            .unwrap_err();
        assert!(matches!(
            err,
            EffectError::MismatchedLength(MismatchedLengthError {
                timestamps: 2,
                bitmaps: 1
            })
        ));
    }
}
