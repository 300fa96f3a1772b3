//! wgpu canvas
//!
//! Renders into an offscreen `Rgba8Unorm` target. Every pass is one
//! full-screen triangle from `shaders/composite.wgsl`; unused texture slots
//! are bound to 1x1 transparent textures owned by the canvas.

use std::collections::HashMap;
use std::sync::Arc;

use image::RgbaImage;
use tracing::{debug, info};

use crate::settings::CanvasBackend;

use super::canvas::{
    Canvas, CanvasError, DrawPass, FilterMode, MaskLayer, TextureDescriptor, TextureFormat,
    TextureHandle, MAX_MASK_LAYERS,
};

const TARGET_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Rgba8Unorm;

/// Uniform block shared by all passes
/// Layout: 3 bbox vec4s, 3 color vec4s, strength, opacity, mask_count, pad = 112 bytes
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, bytemuck::Pod, bytemuck::Zeroable)]
struct CompositeUniforms {
    bboxes: [[f32; 4]; MAX_MASK_LAYERS],
    colors: [[f32; 4]; MAX_MASK_LAYERS],
    strength: f32,
    opacity: f32,
    mask_count: u32,
    _pad: u32,
}

impl CompositeUniforms {
    fn new(masks: &[MaskLayer], strength: f32, opacity: f32) -> Self {
        let mut uniforms = Self {
            strength,
            opacity,
            mask_count: masks.len() as u32,
            ..Default::default()
        };
        for (i, layer) in masks.iter().enumerate() {
            uniforms.bboxes[i] = layer.bbox.to_array();
            uniforms.colors[i] = layer.color;
        }
        uniforms
    }
}

struct GpuTexture {
    label: String,
    texture: wgpu::Texture,
    view: wgpu::TextureView,
    sampler: wgpu::Sampler,
    width: u32,
    height: u32,
    format: TextureFormat,
}

fn wgpu_format(format: TextureFormat) -> wgpu::TextureFormat {
    match format {
        TextureFormat::Rgba8 => wgpu::TextureFormat::Rgba8Unorm,
        TextureFormat::R8 => wgpu::TextureFormat::R8Unorm,
    }
}

fn wgpu_filter(filter: FilterMode) -> wgpu::FilterMode {
    match filter {
        FilterMode::Nearest => wgpu::FilterMode::Nearest,
        FilterMode::Linear => wgpu::FilterMode::Linear,
    }
}

/// Canvas backed by a wgpu device
pub struct GpuCanvas {
    device: Arc<wgpu::Device>,
    queue: Arc<wgpu::Queue>,
    width: u32,
    height: u32,
    target: wgpu::Texture,
    target_view: wgpu::TextureView,
    bind_group_layout: wgpu::BindGroupLayout,
    blit_pipeline: wgpu::RenderPipeline,
    composite_pipeline: wgpu::RenderPipeline,
    overlay_pipeline: wgpu::RenderPipeline,
    uniform_buffer: wgpu::Buffer,
    empty_color: GpuTexture,
    empty_mask: GpuTexture,
    textures: HashMap<TextureHandle, GpuTexture>,
    next_id: u64,
}

impl GpuCanvas {
    /// Create a device on the best available adapter and render offscreen.
    pub fn headless(width: u32, height: u32) -> Result<Self, CanvasError> {
        pollster::block_on(async {
            let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
                backends: wgpu::Backends::all(),
                ..Default::default()
            });

            let adapter = instance
                .request_adapter(&wgpu::RequestAdapterOptions {
                    power_preference: wgpu::PowerPreference::HighPerformance,
                    compatible_surface: None,
                    force_fallback_adapter: false,
                })
                .await
                .ok_or(CanvasError::AdapterUnavailable)?;

            info!(
                adapter = %adapter.get_info().name,
                backend = ?adapter.get_info().backend,
                "GPU canvas adapter selected"
            );

            let (device, queue) = adapter
                .request_device(
                    &wgpu::DeviceDescriptor {
                        label: Some("Segment Compositor Device"),
                        required_features: wgpu::Features::empty(),
                        required_limits: wgpu::Limits::downlevel_defaults()
                            .using_resolution(adapter.limits()),
                        memory_hints: wgpu::MemoryHints::Performance,
                    },
                    None,
                )
                .await?;

            Self::with_device(Arc::new(device), Arc::new(queue), width, height)
        })
    }

    /// Render with a device the caller already owns.
    pub fn with_device(
        device: Arc<wgpu::Device>,
        queue: Arc<wgpu::Queue>,
        width: u32,
        height: u32,
    ) -> Result<Self, CanvasError> {
        if width == 0 || height == 0 {
            return Err(CanvasError::InvalidSize { width, height });
        }

        let shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("Composite Shader"),
            source: wgpu::ShaderSource::Wgsl(include_str!("shaders/composite.wgsl").into()),
        });

        let mut entries = Vec::with_capacity(11);
        for slot in 0..(2 + MAX_MASK_LAYERS as u32) {
            entries.push(wgpu::BindGroupLayoutEntry {
                binding: slot * 2,
                visibility: wgpu::ShaderStages::FRAGMENT,
                ty: wgpu::BindingType::Texture {
                    sample_type: wgpu::TextureSampleType::Float { filterable: true },
                    view_dimension: wgpu::TextureViewDimension::D2,
                    multisampled: false,
                },
                count: None,
            });
            entries.push(wgpu::BindGroupLayoutEntry {
                binding: slot * 2 + 1,
                visibility: wgpu::ShaderStages::FRAGMENT,
                ty: wgpu::BindingType::Sampler(wgpu::SamplerBindingType::Filtering),
                count: None,
            });
        }
        entries.push(wgpu::BindGroupLayoutEntry {
            binding: 10,
            visibility: wgpu::ShaderStages::FRAGMENT,
            ty: wgpu::BindingType::Buffer {
                ty: wgpu::BufferBindingType::Uniform,
                has_dynamic_offset: false,
                min_binding_size: None,
            },
            count: None,
        });

        let bind_group_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("Composite Bind Group Layout"),
            entries: &entries,
        });

        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("Composite Pipeline Layout"),
            bind_group_layouts: &[&bind_group_layout],
            push_constant_ranges: &[],
        });

        let pipeline = |label: &str, entry_point: &str, blend: Option<wgpu::BlendState>| {
            device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
                label: Some(label),
                layout: Some(&pipeline_layout),
                vertex: wgpu::VertexState {
                    module: &shader,
                    entry_point: Some("vs_main"),
                    buffers: &[],
                    compilation_options: Default::default(),
                },
                fragment: Some(wgpu::FragmentState {
                    module: &shader,
                    entry_point: Some(entry_point),
                    targets: &[Some(wgpu::ColorTargetState {
                        format: TARGET_FORMAT,
                        blend,
                        write_mask: wgpu::ColorWrites::ALL,
                    })],
                    compilation_options: Default::default(),
                }),
                primitive: wgpu::PrimitiveState {
                    topology: wgpu::PrimitiveTopology::TriangleList,
                    ..Default::default()
                },
                depth_stencil: None,
                multisample: wgpu::MultisampleState::default(),
                multiview: None,
                cache: None,
            })
        };

        let blit_pipeline = pipeline("Blit Pipeline", "fs_blit", None);
        let composite_pipeline = pipeline("Background Blend Pipeline", "fs_composite", None);
        let overlay_pipeline = pipeline(
            "Mask Overlay Pipeline",
            "fs_overlay",
            Some(wgpu::BlendState::ALPHA_BLENDING),
        );

        let uniform_buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Composite Uniforms"),
            size: std::mem::size_of::<CompositeUniforms>() as u64,
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let empty_color = Self::allocate(
            &device,
            &TextureDescriptor {
                label: "Empty Color",
                width: 1,
                height: 1,
                format: TextureFormat::Rgba8,
                filter: FilterMode::Nearest,
            },
        );
        let empty_mask = Self::allocate(
            &device,
            &TextureDescriptor {
                label: "Empty Mask",
                width: 1,
                height: 1,
                format: TextureFormat::R8,
                filter: FilterMode::Nearest,
            },
        );
        Self::upload(&queue, &empty_color, &[0; 4]);
        Self::upload(&queue, &empty_mask, &[0]);

        let (target, target_view) = Self::create_target(&device, width, height);

        Ok(Self {
            device,
            queue,
            width,
            height,
            target,
            target_view,
            bind_group_layout,
            blit_pipeline,
            composite_pipeline,
            overlay_pipeline,
            uniform_buffer,
            empty_color,
            empty_mask,
            textures: HashMap::new(),
            next_id: 1,
        })
    }

    fn create_target(device: &wgpu::Device, width: u32, height: u32) -> (wgpu::Texture, wgpu::TextureView) {
        let target = device.create_texture(&wgpu::TextureDescriptor {
            label: Some("Canvas Target"),
            size: wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: TARGET_FORMAT,
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT | wgpu::TextureUsages::COPY_SRC,
            view_formats: &[],
        });
        let view = target.create_view(&wgpu::TextureViewDescriptor::default());
        (target, view)
    }

    fn allocate(device: &wgpu::Device, desc: &TextureDescriptor<'_>) -> GpuTexture {
        let texture = device.create_texture(&wgpu::TextureDescriptor {
            label: Some(desc.label),
            size: wgpu::Extent3d {
                width: desc.width,
                height: desc.height,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: wgpu_format(desc.format),
            usage: wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
            view_formats: &[],
        });
        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
        let filter = wgpu_filter(desc.filter);
        let sampler = device.create_sampler(&wgpu::SamplerDescriptor {
            label: Some(desc.label),
            address_mode_u: wgpu::AddressMode::ClampToEdge,
            address_mode_v: wgpu::AddressMode::ClampToEdge,
            address_mode_w: wgpu::AddressMode::ClampToEdge,
            mag_filter: filter,
            min_filter: filter,
            mipmap_filter: wgpu::FilterMode::Nearest,
            ..Default::default()
        });
        GpuTexture {
            label: desc.label.to_string(),
            texture,
            view,
            sampler,
            width: desc.width,
            height: desc.height,
            format: desc.format,
        }
    }

    fn upload(queue: &wgpu::Queue, texture: &GpuTexture, data: &[u8]) {
        queue.write_texture(
            wgpu::TexelCopyTextureInfo {
                texture: &texture.texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            data,
            wgpu::TexelCopyBufferLayout {
                offset: 0,
                bytes_per_row: Some(texture.width * texture.format.bytes_per_pixel() as u32),
                rows_per_image: Some(texture.height),
            },
            wgpu::Extent3d {
                width: texture.width,
                height: texture.height,
                depth_or_array_layers: 1,
            },
        );
    }

    fn texture(&self, handle: TextureHandle, format: TextureFormat) -> Result<&GpuTexture, CanvasError> {
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

    #[allow(clippy::too_many_arguments)]
    fn run_pass(
        &self,
        label: &str,
        pipeline: &wgpu::RenderPipeline,
        frame: &GpuTexture,
        background: &GpuTexture,
        masks: &[&GpuTexture],
        uniforms: CompositeUniforms,
        load: wgpu::LoadOp<wgpu::Color>,
    ) {
        self.queue
            .write_buffer(&self.uniform_buffer, 0, bytemuck::bytes_of(&uniforms));

        let mut slots: Vec<&GpuTexture> = vec![frame, background];
        for i in 0..MAX_MASK_LAYERS {
            slots.push(masks.get(i).copied().unwrap_or(&self.empty_mask));
        }
        let mut entries = Vec::with_capacity(11);
        for (slot, texture) in slots.iter().enumerate() {
            entries.push(wgpu::BindGroupEntry {
                binding: slot as u32 * 2,
                resource: wgpu::BindingResource::TextureView(&texture.view),
            });
            entries.push(wgpu::BindGroupEntry {
                binding: slot as u32 * 2 + 1,
                resource: wgpu::BindingResource::Sampler(&texture.sampler),
            });
        }
        entries.push(wgpu::BindGroupEntry {
            binding: 10,
            resource: self.uniform_buffer.as_entire_binding(),
        });

        let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some(label),
            layout: &self.bind_group_layout,
            entries: &entries,
        });

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some(label) });
        {
            let mut render_pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                label: Some(label),
                color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                    view: &self.target_view,
                    resolve_target: None,
                    ops: wgpu::Operations {
                        load,
                        store: wgpu::StoreOp::Store,
                    },
                })],
                depth_stencil_attachment: None,
                timestamp_writes: None,
                occlusion_query_set: None,
            });
            render_pass.set_pipeline(pipeline);
            render_pass.set_bind_group(0, &bind_group, &[]);
            render_pass.draw(0..3, 0..1);
        }
        self.queue.submit(std::iter::once(encoder.finish()));
    }
}

impl Canvas for GpuCanvas {
    fn backend(&self) -> CanvasBackend {
        CanvasBackend::Gpu
    }

    fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn resize(&mut self, width: u32, height: u32) -> Result<(), CanvasError> {
        if width == 0 || height == 0 {
            return Err(CanvasError::InvalidSize { width, height });
        }
        if (width, height) != (self.width, self.height) {
            let (target, view) = Self::create_target(&self.device, width, height);
            self.target = target;
            self.target_view = view;
            self.width = width;
            self.height = height;
            debug!(width, height, "GPU canvas resized");
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
        self.textures.insert(handle, Self::allocate(&self.device, desc));
        Ok(handle)
    }

    fn write_texture(&mut self, handle: TextureHandle, data: &[u8]) -> Result<(), CanvasError> {
        let texture = self
            .textures
            .get(&handle)
            .ok_or(CanvasError::UnknownTexture(handle))?;
        let expected =
            texture.width as usize * texture.height as usize * texture.format.bytes_per_pixel();
        if data.len() != expected {
            return Err(CanvasError::DataSizeMismatch {
                label: texture.label.clone(),
                expected,
                actual: data.len(),
            });
        }
        Self::upload(&self.queue, texture, data);
        Ok(())
    }

    fn destroy_texture(&mut self, handle: TextureHandle) -> bool {
        match self.textures.remove(&handle) {
            Some(texture) => {
                texture.texture.destroy();
                true
            }
            None => false,
        }
    }

    fn texture_count(&self) -> usize {
        self.textures.len()
    }

    fn draw(&mut self, pass: &DrawPass<'_>) -> Result<(), CanvasError> {
        pass.check_mask_count()?;
        let mask_textures = pass
            .masks()
            .iter()
            .map(|layer| self.texture(layer.texture, TextureFormat::R8))
            .collect::<Result<Vec<_>, _>>()?;

        match *pass {
            DrawPass::Blit { source } => {
                let source = self.texture(source, TextureFormat::Rgba8)?;
                self.run_pass(
                    "Blit Pass",
                    &self.blit_pipeline,
                    source,
                    &self.empty_color,
                    &[],
                    CompositeUniforms::default(),
                    wgpu::LoadOp::Clear(wgpu::Color::TRANSPARENT),
                );
            }
            DrawPass::BackgroundBlend {
                frame,
                background,
                masks,
                strength,
            } => {
                let frame = self.texture(frame, TextureFormat::Rgba8)?;
                let background = self.texture(background, TextureFormat::Rgba8)?;
                self.run_pass(
                    "Background Blend Pass",
                    &self.composite_pipeline,
                    frame,
                    background,
                    &mask_textures,
                    CompositeUniforms::new(masks, strength, 0.0),
                    wgpu::LoadOp::Clear(wgpu::Color::TRANSPARENT),
                );
            }
            DrawPass::MaskOverlay { masks, opacity } => {
                self.run_pass(
                    "Mask Overlay Pass",
                    &self.overlay_pipeline,
                    &self.empty_color,
                    &self.empty_color,
                    &mask_textures,
                    CompositeUniforms::new(masks, 0.0, opacity),
                    wgpu::LoadOp::Load,
                );
            }
        }
        Ok(())
    }

    fn read_pixels(&mut self) -> Result<RgbaImage, CanvasError> {
        let bytes_per_row = self.width * 4;
        let padded_bytes_per_row = bytes_per_row.div_ceil(256) * 256;

        let staging = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Canvas Readback"),
            size: padded_bytes_per_row as u64 * self.height as u64,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("Canvas Readback"),
            });
        encoder.copy_texture_to_buffer(
            wgpu::TexelCopyTextureInfo {
                texture: &self.target,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            wgpu::TexelCopyBufferInfo {
                buffer: &staging,
                layout: wgpu::TexelCopyBufferLayout {
                    offset: 0,
                    bytes_per_row: Some(padded_bytes_per_row),
                    rows_per_image: Some(self.height),
                },
            },
            wgpu::Extent3d {
                width: self.width,
                height: self.height,
                depth_or_array_layers: 1,
            },
        );
        self.queue.submit(std::iter::once(encoder.finish()));

        let slice = staging.slice(..);
        let (tx, rx) = std::sync::mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = tx.send(result);
        });
        self.device.poll(wgpu::Maintain::Wait);
        rx.recv()
            .map_err(|e| CanvasError::Readback(e.to_string()))?
            .map_err(|e| CanvasError::Readback(e.to_string()))?;

        let mut pixels = Vec::with_capacity((bytes_per_row * self.height) as usize);
        {
            let data = slice.get_mapped_range();
            for row in data.chunks(padded_bytes_per_row as usize) {
                pixels.extend_from_slice(&row[..bytes_per_row as usize]);
            }
        }
        staging.unmap();

        RgbaImage::from_raw(self.width, self.height, pixels)
            .ok_or_else(|| CanvasError::Readback("short readback buffer".into()))
    }
}

impl Drop for GpuCanvas {
    fn drop(&mut self) {
        for (_, texture) in self.textures.drain() {
            texture.texture.destroy();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uniform_layout_matches_shader() {
        assert_eq!(std::mem::size_of::<CompositeUniforms>(), 112);
    }

    #[test]
    fn test_uniforms_from_layers() {
        let layers = [MaskLayer {
            texture: TextureHandle(1),
            bbox: crate::mask::BoundingBox::new(0.1, 0.2, 0.3, 0.4),
            color: [1.0, 0.0, 0.0, 1.0],
        }];
        let uniforms = CompositeUniforms::new(&layers, 0.5, 0.25);
        assert_eq!(uniforms.mask_count, 1);
        assert_eq!(uniforms.bboxes[0], [0.1, 0.2, 0.3, 0.4]);
        assert_eq!(uniforms.colors[1], [0.0; 4]);
        assert_eq!(uniforms.strength, 0.5);
    }

    #[test]
    fn test_wgpu_format_mapping() {
        assert_eq!(wgpu_format(TextureFormat::R8), wgpu::TextureFormat::R8Unorm);
        assert_eq!(wgpu_filter(FilterMode::Nearest), wgpu::FilterMode::Nearest);
    }
}
