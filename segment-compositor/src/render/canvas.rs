//! Canvas abstraction
//!
//! A canvas owns one RGBA render target plus the textures effects upload
//! into it. Effects never touch backend objects directly; they create
//! textures, write pixels and issue one of the named [`DrawPass`]es. Both
//! the software and the wgpu backend implement identical blend math (see
//! `render::blend`).

use image::RgbaImage;
use thiserror::Error;

use crate::mask::BoundingBox;
use crate::settings::CanvasBackend;

use super::cpu::CpuCanvas;
use super::gpu::GpuCanvas;

/// Mask textures a single pass can combine
pub const MAX_MASK_LAYERS: usize = 3;

#[derive(Debug, Error)]
pub enum CanvasError {
    #[error("unknown texture {0:?}")]
    UnknownTexture(TextureHandle),
    #[error("canvas size {width}x{height} is invalid")]
    InvalidSize { width: u32, height: u32 },
    #[error("texture '{label}' expects {expected} bytes, got {actual}")]
    DataSizeMismatch {
        label: String,
        expected: usize,
        actual: usize,
    },
    #[error("texture {handle:?} has format {actual:?}, pass needs {expected:?}")]
    FormatMismatch {
        handle: TextureHandle,
        expected: TextureFormat,
        actual: TextureFormat,
    },
    #[error("{count} mask layers requested, at most {MAX_MASK_LAYERS} supported")]
    TooManyMasks { count: usize },
    #[error("no compatible GPU adapter found")]
    AdapterUnavailable,
    #[error("failed to create GPU device")]
    Device(#[from] wgpu::RequestDeviceError),
    #[error("GPU readback failed: {0}")]
    Readback(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextureFormat {
    /// Color, 4 bytes per pixel
    Rgba8,
    /// Single channel coverage, 1 byte per pixel
    R8,
}

impl TextureFormat {
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            TextureFormat::Rgba8 => 4,
            TextureFormat::R8 => 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FilterMode {
    Nearest,
    #[default]
    Linear,
}

#[derive(Debug, Clone)]
pub struct TextureDescriptor<'a> {
    pub label: &'a str,
    pub width: u32,
    pub height: u32,
    pub format: TextureFormat,
    pub filter: FilterMode,
}

impl TextureDescriptor<'_> {
    pub fn byte_len(&self) -> usize {
        self.width as usize * self.height as usize * self.format.bytes_per_pixel()
    }
}

/// Opaque id of a texture owned by a canvas
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TextureHandle(pub(crate) u64);

/// A mask texture covering the full frame, the region it is known to
/// occupy, and its tint for overlays
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MaskLayer {
    pub texture: TextureHandle,
    pub bbox: BoundingBox,
    pub color: [f32; 4],
}

/// Draw operations a canvas supports. Every pass covers the whole target.
#[derive(Debug, Clone, Copy)]
pub enum DrawPass<'a> {
    /// Copy `source` onto the target
    Blit { source: TextureHandle },
    /// Pixels covered by any mask show `frame`; the rest mix `frame` toward
    /// `background` by the background alpha times `strength`
    BackgroundBlend {
        frame: TextureHandle,
        background: TextureHandle,
        masks: &'a [MaskLayer],
        strength: f32,
    },
    /// Tint covered pixels with the mask color over the current target
    MaskOverlay { masks: &'a [MaskLayer], opacity: f32 },
}

impl DrawPass<'_> {
    pub fn name(&self) -> &'static str {
        match self {
            DrawPass::Blit { .. } => "blit",
            DrawPass::BackgroundBlend { .. } => "background_blend",
            DrawPass::MaskOverlay { .. } => "mask_overlay",
        }
    }

    pub fn masks(&self) -> &[MaskLayer] {
        match self {
            DrawPass::Blit { .. } => &[],
            DrawPass::BackgroundBlend { masks, .. } | DrawPass::MaskOverlay { masks, .. } => masks,
        }
    }

    pub(crate) fn check_mask_count(&self) -> Result<(), CanvasError> {
        let count = self.masks().len();
        if count > MAX_MASK_LAYERS {
            return Err(CanvasError::TooManyMasks { count });
        }
        Ok(())
    }
}

/// Render target plus texture storage
pub trait Canvas: Send {
    fn backend(&self) -> CanvasBackend;

    fn size(&self) -> (u32, u32);

    /// Resize the target. Contents are undefined afterwards.
    fn resize(&mut self, width: u32, height: u32) -> Result<(), CanvasError>;

    fn create_texture(&mut self, desc: &TextureDescriptor<'_>) -> Result<TextureHandle, CanvasError>;

    /// Replace the full contents of a texture, tightly packed rows.
    fn write_texture(&mut self, handle: TextureHandle, data: &[u8]) -> Result<(), CanvasError>;

    /// Returns false if the handle was already gone.
    fn destroy_texture(&mut self, handle: TextureHandle) -> bool;

    /// Live textures created through this canvas
    fn texture_count(&self) -> usize;

    fn draw(&mut self, pass: &DrawPass<'_>) -> Result<(), CanvasError>;

    fn read_pixels(&mut self) -> Result<RgbaImage, CanvasError>;
}

impl std::fmt::Debug for dyn Canvas {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Canvas")
            .field("backend", &self.backend())
            .field("size", &self.size())
            .field("textures", &self.texture_count())
            .finish()
    }
}

/// Build the canvas a backend setting names.
pub fn create_canvas(
    backend: CanvasBackend,
    width: u32,
    height: u32,
) -> Result<Box<dyn Canvas>, CanvasError> {
    Ok(match backend {
        CanvasBackend::Cpu => Box::new(CpuCanvas::new(width, height)?),
        CanvasBackend::Gpu => Box::new(GpuCanvas::headless(width, height)?),
    })
}
