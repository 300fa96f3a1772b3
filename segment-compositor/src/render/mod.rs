//! Offscreen canvases that effects draw composited frames into

mod blend;
mod canvas;
mod cpu;
mod gpu;

pub use blend::{background_blend, mask_overlay};
pub use canvas::{
    create_canvas, Canvas, CanvasError, DrawPass, FilterMode, MaskLayer, TextureDescriptor,
    TextureFormat, TextureHandle, MAX_MASK_LAYERS,
};
pub use cpu::CpuCanvas;
pub use gpu::GpuCanvas;
