//! Canvas textures owned by effects
//!
//! Both helpers allocate on first use and reallocate only when the incoming
//! size changes. Call `release` from `Effect::cleanup`.

use tracing::{debug, warn};

use crate::mask::{rle, Mask, Tracklet};
use crate::render::{
    Canvas, CanvasError, FilterMode, MaskLayer, TextureDescriptor, TextureFormat, TextureHandle,
};
use crate::video::Bitmap;

/// One RGBA texture re-filled from bitmaps
#[derive(Debug, Default)]
pub struct FrameTexture {
    label: &'static str,
    slot: Option<(TextureHandle, (u32, u32))>,
}

impl FrameTexture {
    pub fn new(label: &'static str) -> Self {
        Self { label, slot: None }
    }

    pub fn handle(&self) -> Option<TextureHandle> {
        self.slot.map(|(handle, _)| handle)
    }

    pub fn upload(&mut self, canvas: &mut dyn Canvas, bitmap: &Bitmap) -> Result<TextureHandle, CanvasError> {
        let size = bitmap.dimensions();
        let handle = match self.slot {
            Some((handle, current)) if current == size => handle,
            previous => {
                if let Some((old, _)) = previous {
                    canvas.destroy_texture(old);
                }
                self.slot = None;
                let handle = canvas.create_texture(&TextureDescriptor {
                    label: self.label,
                    width: size.0,
                    height: size.1,
                    format: TextureFormat::Rgba8,
                    filter: FilterMode::Linear,
                })?;
                self.slot = Some((handle, size));
                handle
            }
        };
        canvas.write_texture(handle, bitmap.pixels())?;
        Ok(handle)
    }

    pub fn release(&mut self, canvas: &mut dyn Canvas) {
        if let Some((handle, _)) = self.slot.take() {
            canvas.destroy_texture(handle);
        }
    }

    pub fn is_allocated(&self) -> bool {
        self.slot.is_some()
    }
}

/// Single channel textures for the masks of the current frame
///
/// Each mask is uploaded at the size carried in its payload with nearest
/// filtering, never resampled to the canvas size.
#[derive(Debug, Default)]
pub struct MaskTextures {
    slots: Vec<(TextureHandle, (u32, u32))>,
}

impl MaskTextures {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode and upload up to `limit` masks. Masks that fail to decode or
    /// carry no bounding box are skipped with a warning.
    pub fn upload(
        &mut self,
        canvas: &mut dyn Canvas,
        frame_index: usize,
        masks: &[Mask],
        tracklets: &[Tracklet],
        limit: usize,
    ) -> Result<Vec<MaskLayer>, CanvasError> {
        let mut layers = Vec::with_capacity(limit.min(masks.len()));
        for mask in masks {
            if layers.len() == limit {
                debug!(frame = frame_index, limit, "mask layer limit reached");
                break;
            }
            let dense = match rle::decode(&mask.rle) {
                Ok(dense) => dense,
                Err(e) => {
                    warn!(frame = frame_index, object = %mask.object_id, error = %e, "skipping undecodable mask");
                    continue;
                }
            };
            if dense.coverage() == 0 {
                continue;
            }
            let Some(bbox) = mask.bbox else {
                warn!(frame = frame_index, object = %mask.object_id, "skipping mask without bounding box");
                continue;
            };

            let slot = layers.len();
            let texture = self.ensure(canvas, slot, (dense.width(), dense.height()))?;
            canvas.write_texture(texture, dense.data())?;

            let color = tracklets
                .iter()
                .find(|t| t.id == mask.object_id)
                .copied()
                .unwrap_or_else(|| Tracklet::new(mask.object_id))
                .color;
            layers.push(MaskLayer { texture, bbox, color });
        }
        Ok(layers)
    }

    fn ensure(&mut self, canvas: &mut dyn Canvas, slot: usize, size: (u32, u32)) -> Result<TextureHandle, CanvasError> {
        if let Some(&(handle, current)) = self.slots.get(slot) {
            if current == size {
                return Ok(handle);
            }
            canvas.destroy_texture(handle);
        }
        let handle = canvas.create_texture(&TextureDescriptor {
            label: "mask",
            width: size.0,
            height: size.1,
            format: TextureFormat::R8,
            filter: FilterMode::Nearest,
        })?;
        if slot < self.slots.len() {
            self.slots[slot] = (handle, size);
        } else {
            self.slots.push((handle, size));
        }
        Ok(handle)
    }

    pub fn release(&mut self, canvas: &mut dyn Canvas) {
        for (handle, _) in self.slots.drain(..) {
            canvas.destroy_texture(handle);
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}
