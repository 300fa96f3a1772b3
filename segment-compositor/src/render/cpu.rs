//! Software canvas
//!
//! Samples textures at pixel centers with clamp-to-edge addressing, the
//! same way the GPU path does, so both backends agree on exact texel hits.

use std::collections::HashMap;

use image::RgbaImage;

use crate::mask::BoundingBox;
use crate::settings::CanvasBackend;

use super::blend::{background_blend, from_unorm, mask_overlay, to_unorm};
use super::canvas::{
    Canvas, CanvasError, DrawPass, FilterMode, MaskLayer, TextureDescriptor, TextureFormat,
    TextureHandle,
};

struct CpuTexture {
    label: String,
    width: u32,
    height: u32,
    format: TextureFormat,
    filter: FilterMode,
    data: Vec<u8>,
}

impl CpuTexture {
    fn texel(&self, x: u32, y: u32) -> [f32; 4] {
        let i = y as usize * self.width as usize + x as usize;
        match self.format {
            TextureFormat::Rgba8 => {
                let p = &self.data[i * 4..i * 4 + 4];
                [from_unorm(p[0]), from_unorm(p[1]), from_unorm(p[2]), from_unorm(p[3])]
            }
            TextureFormat::R8 => [from_unorm(self.data[i]), 0.0, 0.0, 1.0],
        }
    }

    fn sample(&self, u: f32, v: f32) -> [f32; 4] {
        let (w, h) = (self.width as f32, self.height as f32);
        match self.filter {
            FilterMode::Nearest => {
                let x = ((u * w).floor().max(0.0) as u32).min(self.width - 1);
                let y = ((v * h).floor().max(0.0) as u32).min(self.height - 1);
                self.texel(x, y)
            }
            FilterMode::Linear => {
                let fx = u * w - 0.5;
                let fy = v * h - 0.5;
                let (x0, y0) = (fx.floor(), fy.floor());
                let (tx, ty) = (fx - x0, fy - y0);
                let clamp_x = |x: f32| (x.max(0.0) as u32).min(self.width - 1);
                let clamp_y = |y: f32| (y.max(0.0) as u32).min(self.height - 1);
                let (xa, xb) = (clamp_x(x0), clamp_x(x0 + 1.0));
                let (ya, yb) = (clamp_y(y0), clamp_y(y0 + 1.0));

                let (p00, p10) = (self.texel(xa, ya), self.texel(xb, ya));
                let (p01, p11) = (self.texel(xa, yb), self.texel(xb, yb));
                std::array::from_fn(|i| {
                    let top = p00[i] * (1.0 - tx) + p10[i] * tx;
                    let bottom = p01[i] * (1.0 - tx) + p11[i] * tx;
                    top * (1.0 - ty) + bottom * ty
                })
            }
        }
    }
}

/// Canvas rendering into an in-memory RGBA buffer
pub struct CpuCanvas {
    target: RgbaImage,
    textures: HashMap<TextureHandle, CpuTexture>,
    next_id: u64,
}

impl CpuCanvas {
    pub fn new(width: u32, height: u32) -> Result<Self, CanvasError> {
        if width == 0 || height == 0 {
            return Err(CanvasError::InvalidSize { width, height });
        }
        Ok(Self {
            target: RgbaImage::new(width, height),
            textures: HashMap::new(),
            next_id: 1,
        })
    }

    fn texture(&self, handle: TextureHandle, format: TextureFormat) -> Result<&CpuTexture, CanvasError> {
        let texture = self
            .textures
            .get(&handle)
            .ok_or(CanvasError::UnknownTexture(handle))?;
        if texture.format != format {
            return Err(CanvasError::FormatMismatch {
                handle,
                expected: format,
                actual: texture.format,
            });
        }
        Ok(texture)
    }

    fn mask_textures<'a>(&'a self, masks: &[MaskLayer]) -> Result<Vec<(&'a CpuTexture, BoundingBox, [f32; 4])>, CanvasError> {
        masks
            .iter()
            .map(|layer| Ok((self.texture(layer.texture, TextureFormat::R8)?, layer.bbox, layer.color)))
            .collect()
    }

    /// Run `shade` for every target pixel with its normalized center.
    fn shade(target: &mut RgbaImage, mut shade: impl FnMut(f32, f32, [f32; 4]) -> [f32; 4]) {
        let (width, height) = target.dimensions();
        for (x, y, pixel) in target.enumerate_pixels_mut() {
            let u = (x as f32 + 0.5) / width as f32;
            let v = (y as f32 + 0.5) / height as f32;
            let dst = pixel.0.map(from_unorm);
            pixel.0 = shade(u, v, dst).map(to_unorm);
        }
    }
}

fn coverage(masks: &[(&CpuTexture, BoundingBox, [f32; 4])], u: f32, v: f32) -> f32 {
    masks
        .iter()
        .filter(|(_, bbox, _)| bbox.contains(u, v))
        .map(|(texture, _, _)| texture.sample(u, v)[0])
        .sum()
}

impl Canvas for CpuCanvas {
    fn backend(&self) -> CanvasBackend {
        CanvasBackend::Cpu
    }

    fn size(&self) -> (u32, u32) {
        self.target.dimensions()
    }

    fn resize(&mut self, width: u32, height: u32) -> Result<(), CanvasError> {
        if width == 0 || height == 0 {
            return Err(CanvasError::InvalidSize { width, height });
        }
        if self.target.dimensions() != (width, height) {
            self.target = RgbaImage::new(width, height);
        }
        Ok(())
    }

    fn create_texture(&mut self, desc: &TextureDescriptor<'_>) -> Result<TextureHandle, CanvasError> {
        if desc.width == 0 || desc.height == 0 {
            return Err(CanvasError::InvalidSize {
                width: desc.width,
                height: desc.height,
            });
        }
        let handle = TextureHandle(self.next_id);
        self.next_id += 1;
        self.textures.insert(
            handle,
            CpuTexture {
                label: desc.label.to_string(),
                width: desc.width,
                height: desc.height,
                format: desc.format,
                filter: desc.filter,
                data: vec![0; desc.byte_len()],
            },
        );
        Ok(handle)
    }

    fn write_texture(&mut self, handle: TextureHandle, data: &[u8]) -> Result<(), CanvasError> {
        let texture = self
            .textures
            .get_mut(&handle)
            .ok_or(CanvasError::UnknownTexture(handle))?;
        if data.len() != texture.data.len() {
            return Err(CanvasError::DataSizeMismatch {
                label: texture.label.clone(),
                expected: texture.data.len(),
                actual: data.len(),
            });
        }
        texture.data.copy_from_slice(data);
        Ok(())
    }

    fn destroy_texture(&mut self, handle: TextureHandle) -> bool {
        self.textures.remove(&handle).is_some()
    }

    fn texture_count(&self) -> usize {
        self.textures.len()
    }

    fn draw(&mut self, pass: &DrawPass<'_>) -> Result<(), CanvasError> {
        pass.check_mask_count()?;
        let mut target = std::mem::replace(&mut self.target, RgbaImage::new(0, 0));
        let result = match *pass {
            DrawPass::Blit { source } => self.texture(source, TextureFormat::Rgba8).map(|source| {
                Self::shade(&mut target, |u, v, _| source.sample(u, v));
            }),
            DrawPass::BackgroundBlend {
                frame,
                background,
                masks,
                strength,
            } => (|| {
                let frame = self.texture(frame, TextureFormat::Rgba8)?;
                let background = self.texture(background, TextureFormat::Rgba8)?;
                let masks = self.mask_textures(masks)?;
                Self::shade(&mut target, |u, v, _| {
                    background_blend(
                        frame.sample(u, v),
                        background.sample(u, v),
                        coverage(&masks, u, v),
                        strength,
                    )
                });
                Ok(())
            })(),
            DrawPass::MaskOverlay { masks, opacity } => self.mask_textures(masks).map(|masks| {
                Self::shade(&mut target, |u, v, dst| {
                    // Last covering layer wins
                    let color = masks.iter().rev().find_map(|(texture, bbox, color)| {
                        (bbox.contains(u, v) && texture.sample(u, v)[0] > 0.0).then_some(*color)
                    });
                    match color {
                        Some(color) => mask_overlay(dst, color, opacity),
                        None => dst,
                    }
                });
            }),
        };
        self.target = target;
        result
    }

    fn read_pixels(&mut self) -> Result<RgbaImage, CanvasError> {
        Ok(self.target.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rgba(canvas: &mut CpuCanvas, w: u32, h: u32, pixels: &[u8]) -> TextureHandle {
        let handle = canvas
            .create_texture(&TextureDescriptor {
                label: "rgba",
                width: w,
                height: h,
                format: TextureFormat::Rgba8,
                filter: FilterMode::Linear,
            })
            .unwrap();
        canvas.write_texture(handle, pixels).unwrap();
        handle
    }

    fn mask(canvas: &mut CpuCanvas, w: u32, h: u32, pixels: &[u8]) -> TextureHandle {
        let handle = canvas
            .create_texture(&TextureDescriptor {
                label: "mask",
                width: w,
                height: h,
                format: TextureFormat::R8,
                filter: FilterMode::Nearest,
            })
            .unwrap();
        canvas.write_texture(handle, pixels).unwrap();
        handle
    }

    fn solid(color: [u8; 4], count: usize) -> Vec<u8> {
        color.iter().copied().cycle().take(count * 4).collect()
    }

    const FRAME: [u8; 4] = [10, 20, 30, 255];
    const BG: [u8; 4] = [200, 0, 0, 255];

    #[test]
    fn test_blit_copies_exactly() {
        let mut canvas = CpuCanvas::new(2, 2).unwrap();
        let pixels: Vec<u8> = (0..16).map(|i| i * 10).collect();
        let source = rgba(&mut canvas, 2, 2, &pixels);
        canvas.draw(&DrawPass::Blit { source }).unwrap();
        assert_eq!(canvas.read_pixels().unwrap().into_raw(), pixels);
    }

    #[test]
    fn test_background_blend_respects_mask() {
        let mut canvas = CpuCanvas::new(4, 2).unwrap();
        let frame = rgba(&mut canvas, 4, 2, &solid(FRAME, 8));
        let background = rgba(&mut canvas, 1, 1, &BG);
        // Mask at half resolution covering the left column only
        let coverage = mask(&mut canvas, 2, 1, &[255, 0]);
        let masks = [MaskLayer {
            texture: coverage,
            bbox: BoundingBox::full(),
            color: [1.0; 4],
        }];

        canvas
            .draw(&DrawPass::BackgroundBlend {
                frame,
                background,
                masks: &masks,
                strength: 1.0,
            })
            .unwrap();
        let out = canvas.read_pixels().unwrap();
        assert_eq!(out.get_pixel(0, 0).0, FRAME);
        assert_eq!(out.get_pixel(1, 1).0, FRAME);
        assert_eq!(out.get_pixel(2, 0).0, BG);
        assert_eq!(out.get_pixel(3, 1).0, BG);
    }

    #[test]
    fn test_bbox_limits_mask_coverage() {
        let mut canvas = CpuCanvas::new(4, 1).unwrap();
        let frame = rgba(&mut canvas, 4, 1, &solid(FRAME, 4));
        let background = rgba(&mut canvas, 1, 1, &BG);
        let coverage = mask(&mut canvas, 4, 1, &[255; 4]);
        let masks = [MaskLayer {
            texture: coverage,
            bbox: BoundingBox::new(0.5, 0.0, 0.5, 1.0),
            color: [1.0; 4],
        }];
        canvas
            .draw(&DrawPass::BackgroundBlend {
                frame,
                background,
                masks: &masks,
                strength: 1.0,
            })
            .unwrap();
        let out = canvas.read_pixels().unwrap();
        assert_eq!(out.get_pixel(0, 0).0, BG);
        assert_eq!(out.get_pixel(3, 0).0, FRAME);
    }

    #[test]
    fn test_transparent_placeholder_shows_frame() {
        let mut canvas = CpuCanvas::new(2, 2).unwrap();
        let frame = rgba(&mut canvas, 2, 2, &solid(FRAME, 4));
        let placeholder = rgba(&mut canvas, 1, 1, &[0, 0, 0, 0]);
        canvas
            .draw(&DrawPass::BackgroundBlend {
                frame,
                background: placeholder,
                masks: &[],
                strength: 1.0,
            })
            .unwrap();
        assert!(canvas.read_pixels().unwrap().pixels().all(|p| p.0 == FRAME));
    }

    #[test]
    fn test_overlay_tints_covered_pixels() {
        let mut canvas = CpuCanvas::new(2, 1).unwrap();
        let frame = rgba(&mut canvas, 2, 1, &solid([0, 0, 0, 255], 2));
        canvas.draw(&DrawPass::Blit { source: frame }).unwrap();
        let coverage = mask(&mut canvas, 2, 1, &[0, 255]);
        let masks = [MaskLayer {
            texture: coverage,
            bbox: BoundingBox::full(),
            color: [1.0, 1.0, 1.0, 1.0],
        }];
        canvas
            .draw(&DrawPass::MaskOverlay {
                masks: &masks,
                opacity: 0.5,
            })
            .unwrap();
        let out = canvas.read_pixels().unwrap();
        assert_eq!(out.get_pixel(0, 0).0, [0, 0, 0, 255]);
        assert_eq!(out.get_pixel(1, 0).0, [128, 128, 128, 255]);
    }

    #[test]
    fn test_errors() {
        let mut canvas = CpuCanvas::new(2, 2).unwrap();
        let frame = rgba(&mut canvas, 2, 2, &solid(FRAME, 4));
        let coverage = mask(&mut canvas, 1, 1, &[255]);

        assert!(matches!(
            canvas.write_texture(frame, &[0; 3]),
            Err(CanvasError::DataSizeMismatch { expected: 16, actual: 3, .. })
        ));
        assert!(matches!(
            canvas.draw(&DrawPass::Blit { source: coverage }),
            Err(CanvasError::FormatMismatch { .. })
        ));
        let layer = MaskLayer {
            texture: coverage,
            bbox: BoundingBox::full(),
            color: [1.0; 4],
        };
        assert!(matches!(
            canvas.draw(&DrawPass::MaskOverlay {
                masks: &[layer; 4],
                opacity: 1.0
            }),
            Err(CanvasError::TooManyMasks { count: 4 })
        ));

        assert!(canvas.destroy_texture(frame));
        assert!(!canvas.destroy_texture(frame));
        assert!(matches!(
            canvas.draw(&DrawPass::Blit { source: frame }),
            Err(CanvasError::UnknownTexture(_))
        ));
        assert_eq!(canvas.texture_count(), 1);
        // A failed draw leaves the target in place
        assert_eq!(canvas.size(), (2, 2));
    }
}
