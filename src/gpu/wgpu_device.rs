//! [`GpuDevice`] on top of wgpu.
//!
//! wgpu has no separate memory objects or layout transitions, so images are
//! realized when their memory is allocated and recorded barriers are dropped
//! after the recorder has validated them. Binding state is scoped to a render
//! pass in wgpu and is re-applied whenever a pass begins.

use std::{
    collections::{BTreeMap, HashMap},
    sync::mpsc,
    time::Duration,
};

use parking_lot::Mutex;
use wgpu::util::DeviceExt;

use super::{
    BufferHandle, BufferUsage, ClearValue, Command, CommandBufferHandle, CommandList,
    CommandPoolHandle, ConvolutionProgram, DescriptorBinding, DescriptorPoolDesc,
    DescriptorPoolHandle, DescriptorSetHandle, DescriptorSetLayoutHandle, DeviceError,
    DeviceObject, DeviceResult, FenceHandle, Filter, Format, FramebufferDesc, FramebufferHandle,
    GpuDevice, GraphicsPipelineDesc, ImageDesc, ImageDescriptor, ImageHandle, ImageUsage,
    ImageViewDesc, ImageViewHandle, IndexType, MemoryHandle, MemoryLocation, ObjectKind,
    PipelineHandle, PipelineLayoutDesc, PipelineLayoutHandle, QueueInfo, RenderPassDesc,
    RenderPassHandle, SamplerDesc, SamplerHandle, ShaderStages, ViewDimension, Wrap,
};

const IRRADIANCE_WGSL: &str = include_str!("shaders/irradiance.wgsl");
const PREFILTER_WGSL: &str = include_str!("shaders/prefilter.wgsl");

/// Only queue a wgpu device exposes.
const GRAPHICS_QUEUE: &str = "graphics";

struct Image {
    desc: ImageDesc,
    texture: Option<wgpu::Texture>,
}

struct View {
    desc: ImageViewDesc,
    view: wgpu::TextureView,
}

struct SetLayout {
    layout: wgpu::BindGroupLayout,
    bindings: Vec<DescriptorBinding>,
}

struct PipelineLayout {
    layout: wgpu::PipelineLayout,
    /// Stages of the single merged push-constant range.
    push_stages: wgpu::ShaderStages,
}

struct DescriptorSet {
    pool: u64,
    layout: u64,
    writes: BTreeMap<u32, ImageDescriptor>,
    bind_group: Option<wgpu::BindGroup>,
}

struct CommandBuffer {
    pool: u64,
    recording: bool,
    encoded: Option<wgpu::CommandBuffer>,
}

#[derive(Default)]
struct Fence {
    signaled: bool,
    submission: Option<wgpu::SubmissionIndex>,
}

#[derive(Default)]
struct State {
    next_id: u64,
    buffers: HashMap<u64, wgpu::Buffer>,
    images: HashMap<u64, Image>,
    memories: HashMap<u64, Vec<u64>>,
    views: HashMap<u64, View>,
    samplers: HashMap<u64, wgpu::Sampler>,
    render_passes: HashMap<u64, RenderPassDesc>,
    framebuffers: HashMap<u64, FramebufferDesc>,
    set_layouts: HashMap<u64, SetLayout>,
    pipeline_layouts: HashMap<u64, PipelineLayout>,
    pipelines: HashMap<u64, wgpu::RenderPipeline>,
    descriptor_pools: HashMap<u64, (u32, Vec<u64>)>,
    descriptor_sets: HashMap<u64, DescriptorSet>,
    command_pools: HashMap<u64, Vec<u64>>,
    command_buffers: HashMap<u64, CommandBuffer>,
    fences: HashMap<u64, Fence>,
}

impl State {
    fn id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn texture(&self, image: u64) -> DeviceResult<&wgpu::Texture> {
        self.images
            .get(&image)
            .ok_or(DeviceError::InvalidHandle(ObjectKind::Image))?
            .texture
            .as_ref()
            .ok_or_else(|| DeviceError::Validation(format!("image {image} has no memory bound")))
    }
}

pub struct WgpuDevice {
    device: wgpu::Device,
    queue: wgpu::Queue,
    adapter_info: wgpu::AdapterInfo,
    state: Mutex<State>,
}

impl WgpuDevice {
    /// Opens the default adapter without a surface.
    pub fn new() -> Result<Self, Box<dyn std::error::Error>> {
        pollster::block_on(Self::request())
    }

    async fn request() -> Result<Self, Box<dyn std::error::Error>> {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            flags: wgpu::InstanceFlags::default(),
            ..Default::default()
        });

        let adapter = match instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                compatible_surface: None,
                force_fallback_adapter: false,
            })
            .await
        {
            Ok(adapter) => adapter,
            Err(e) => return Err(format!("Failed to find an appropriate adapter: {:?}", e).into()),
        };
        let adapter_info = adapter.get_info();
        log::info!(
            "Adapter: {} ({:?}, {:?}), Driver: {}",
            adapter_info.name,
            adapter_info.backend,
            adapter_info.device_type,
            adapter_info.driver
        );

        let adapter_features = adapter.features();
        if !adapter_features.contains(wgpu::Features::PUSH_CONSTANTS) {
            return Err("adapter does not support push constants".into());
        }
        let mut required_features = wgpu::Features::PUSH_CONSTANTS;
        if adapter_features.contains(wgpu::Features::FLOAT32_FILTERABLE) {
            required_features |= wgpu::Features::FLOAT32_FILTERABLE;
        }

        let (device, queue) = adapter
            .request_device(&wgpu::DeviceDescriptor {
                label: Some("ibl-baker"),
                required_features,
                required_limits: wgpu::Limits {
                    max_push_constant_size: super::headless::MAX_PUSH_CONSTANT_SIZE,
                    ..wgpu::Limits::default()
                },
                memory_hints: wgpu::MemoryHints::default(),
                trace: Default::default(),
            })
            .await?;

        Ok(Self {
            device,
            queue,
            adapter_info,
            state: Mutex::new(State::default()),
        })
    }

    pub fn adapter_info(&self) -> &wgpu::AdapterInfo {
        &self.adapter_info
    }

    /// Runs `build` inside validation and out-of-memory error scopes.
    fn scoped<T>(&self, build: impl FnOnce(&wgpu::Device) -> T) -> DeviceResult<T> {
        self.device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);
        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let value = build(&self.device);
        let validation = pollster::block_on(self.device.pop_error_scope());
        let out_of_memory = pollster::block_on(self.device.pop_error_scope());
        if out_of_memory.is_some() {
            return Err(DeviceError::OutOfDeviceMemory);
        }
        if let Some(error) = validation {
            return Err(DeviceError::Validation(error.to_string()));
        }
        Ok(value)
    }

    fn check_queue(queue: &QueueInfo) -> DeviceResult<()> {
        if queue.name == GRAPHICS_QUEUE {
            Ok(())
        } else {
            Err(DeviceError::Validation(format!("unknown queue `{}`", queue.name)))
        }
    }

    fn poll(&self, poll: wgpu::PollType) -> DeviceResult<()> {
        match self.device.poll(poll) {
            Ok(_) => Ok(()),
            Err(wgpu::PollError::Timeout) => Err(DeviceError::Timeout),
        }
    }

    fn build_bind_group(&self, state: &State, set: &DescriptorSet) -> DeviceResult<Option<wgpu::BindGroup>> {
        let layout = state
            .set_layouts
            .get(&set.layout)
            .ok_or(DeviceError::InvalidHandle(ObjectKind::DescriptorSetLayout))?;
        if layout
            .bindings
            .iter()
            .any(|b| !set.writes.contains_key(&b.binding))
        {
            return Ok(None);
        }
        let mut resources = Vec::with_capacity(set.writes.len());
        for (&binding, descriptor) in &set.writes {
            let view = &state
                .views
                .get(&descriptor.view.raw())
                .ok_or(DeviceError::InvalidHandle(ObjectKind::ImageView))?
                .view;
            let sampler = state
                .samplers
                .get(&descriptor.sampler.raw())
                .ok_or(DeviceError::InvalidHandle(ObjectKind::Sampler))?;
            resources.push((binding, view, sampler));
        }
        let entries: Vec<wgpu::BindGroupEntry> = resources
            .iter()
            .flat_map(|&(binding, view, sampler)| {
                [
                    wgpu::BindGroupEntry {
                        binding: 2 * binding,
                        resource: wgpu::BindingResource::TextureView(view),
                    },
                    wgpu::BindGroupEntry {
                        binding: 2 * binding + 1,
                        resource: wgpu::BindingResource::Sampler(sampler),
                    },
                ]
            })
            .collect();
        self.scoped(|device| {
            Some(device.create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some("convolution_source"),
                layout: &layout.layout,
                entries: &entries,
            }))
        })
    }

    /// Translates a recorded list into one wgpu command buffer.
    fn encode(&self, state: &State, commands: &CommandList) -> DeviceResult<wgpu::CommandBuffer> {
        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("convolution_encoder"),
            });
        let mut bound = Bindings::default();
        let mut iter = commands.commands().iter();
        while let Some(command) = iter.next() {
            match command {
                Command::BeginRenderPass {
                    framebuffer,
                    clear_values,
                    render_pass,
                    ..
                } => {
                    let pass_desc = state
                        .render_passes
                        .get(&render_pass.raw())
                        .ok_or(DeviceError::InvalidHandle(ObjectKind::RenderPass))?;
                    let fb = state
                        .framebuffers
                        .get(&framebuffer.raw())
                        .ok_or(DeviceError::InvalidHandle(ObjectKind::Framebuffer))?;
                    let attachment = fb
                        .attachments
                        .first()
                        .and_then(|v| state.views.get(&v.raw()))
                        .ok_or(DeviceError::InvalidHandle(ObjectKind::ImageView))?;
                    let load = match clear_values.first() {
                        Some(ClearValue::Color([r, g, b, a])) if pass_desc.clear_on_load => {
                            wgpu::LoadOp::Clear(wgpu::Color {
                                r: f64::from(*r),
                                g: f64::from(*g),
                                b: f64::from(*b),
                                a: f64::from(*a),
                            })
                        }
                        _ => wgpu::LoadOp::Load,
                    };
                    let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                        label: Some("convolution_pass"),
                        color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                            view: &attachment.view,
                            resolve_target: None,
                            ops: wgpu::Operations {
                                load,
                                store: wgpu::StoreOp::Store,
                            },
                        })],
                        depth_stencil_attachment: None,
                        occlusion_query_set: None,
                        timestamp_writes: None,
                    });
                    bound.apply(state, &mut pass)?;
                    for command in iter.by_ref() {
                        match command {
                            Command::EndRenderPass => break,
                            Command::SetViewport(v) => {
                                pass.set_viewport(v.x, v.y, v.width, v.height, v.min_depth, v.max_depth)
                            }
                            Command::SetScissor(r) => pass.set_scissor_rect(
                                r.x.max(0) as u32,
                                r.y.max(0) as u32,
                                r.extent.width,
                                r.extent.height,
                            ),
                            Command::PushConstants {
                                layout,
                                offset,
                                data,
                                ..
                            } => {
                                let stages = state
                                    .pipeline_layouts
                                    .get(&layout.raw())
                                    .ok_or(DeviceError::InvalidHandle(ObjectKind::PipelineLayout))?
                                    .push_stages;
                                pass.set_push_constants(stages, *offset, data);
                            }
                            Command::DrawIndexed {
                                index_count,
                                instance_count,
                                first_index,
                                vertex_offset,
                                first_instance,
                            } => pass.draw_indexed(
                                *first_index..first_index + index_count,
                                *vertex_offset,
                                *first_instance..first_instance + instance_count,
                            ),
                            other => {
                                if !bound.record(other) {
                                    return Err(DeviceError::Validation(format!(
                                        "{other:?} cannot be recorded inside a render pass"
                                    )));
                                }
                                bound.apply(state, &mut pass)?;
                            }
                        }
                    }
                }
                Command::PipelineBarrier(barrier) => {
                    log::trace!(
                        "eliding barrier {:?} -> {:?} on {:?}",
                        barrier.old_layout,
                        barrier.new_layout,
                        barrier.image
                    );
                }
                Command::CopyImage {
                    src, dst, regions, ..
                } => {
                    let src = state.texture(src.raw())?;
                    let dst = state.texture(dst.raw())?;
                    for region in regions {
                        encoder.copy_texture_to_texture(
                            wgpu::TexelCopyTextureInfo {
                                texture: src,
                                mip_level: region.src.mip_level,
                                origin: wgpu::Origin3d {
                                    x: 0,
                                    y: 0,
                                    z: region.src.base_layer,
                                },
                                aspect: wgpu::TextureAspect::All,
                            },
                            wgpu::TexelCopyTextureInfo {
                                texture: dst,
                                mip_level: region.dst.mip_level,
                                origin: wgpu::Origin3d {
                                    x: 0,
                                    y: 0,
                                    z: region.dst.base_layer,
                                },
                                aspect: wgpu::TextureAspect::All,
                            },
                            wgpu::Extent3d {
                                width: region.extent.width,
                                height: region.extent.height,
                                depth_or_array_layers: region.src.layer_count,
                            },
                        );
                    }
                }
                other => {
                    if !bound.record(other) {
                        return Err(DeviceError::Validation(format!(
                            "{other:?} must be recorded inside a render pass"
                        )));
                    }
                }
            }
        }
        Ok(encoder.finish())
    }
}

/// Binding state carried from one render pass to the next.
#[derive(Default)]
struct Bindings {
    pipeline: Option<u64>,
    set: Option<u64>,
    vertex: Option<u64>,
    index: Option<(u64, IndexType)>,
}

impl Bindings {
    /// Stores a bind command; false for anything else.
    fn record(&mut self, command: &Command) -> bool {
        match command {
            Command::BindPipeline(p) => self.pipeline = Some(p.raw()),
            Command::BindDescriptorSets { sets, .. } => self.set = sets.first().map(|s| s.raw()),
            Command::BindVertexBuffer { buffer, .. } => self.vertex = Some(buffer.raw()),
            Command::BindIndexBuffer {
                buffer, index_type, ..
            } => self.index = Some((buffer.raw(), *index_type)),
            _ => return false,
        }
        true
    }

    fn apply(&self, state: &State, pass: &mut wgpu::RenderPass<'_>) -> DeviceResult<()> {
        if let Some(pipeline) = self.pipeline {
            let pipeline = state
                .pipelines
                .get(&pipeline)
                .ok_or(DeviceError::InvalidHandle(ObjectKind::Pipeline))?;
            pass.set_pipeline(pipeline);
        }
        if let Some(set) = self.set {
            let group = state
                .descriptor_sets
                .get(&set)
                .ok_or(DeviceError::InvalidHandle(ObjectKind::DescriptorSet))?
                .bind_group
                .as_ref()
                .ok_or_else(|| DeviceError::Validation("descriptor set is incomplete".into()))?;
            pass.set_bind_group(0, group, &[]);
        }
        if let Some(vertex) = self.vertex {
            let buffer = state
                .buffers
                .get(&vertex)
                .ok_or(DeviceError::InvalidHandle(ObjectKind::Buffer))?;
            pass.set_vertex_buffer(0, buffer.slice(..));
        }
        if let Some((index, index_type)) = self.index {
            let buffer = state
                .buffers
                .get(&index)
                .ok_or(DeviceError::InvalidHandle(ObjectKind::Buffer))?;
            let format = match index_type {
                IndexType::U16 => wgpu::IndexFormat::Uint16,
                IndexType::U32 => wgpu::IndexFormat::Uint32,
            };
            pass.set_index_buffer(buffer.slice(..), format);
        }
        Ok(())
    }
}

fn texture_format(format: Format) -> wgpu::TextureFormat {
    match format {
        Format::Rgba8Unorm => wgpu::TextureFormat::Rgba8Unorm,
        Format::Rgba16Float => wgpu::TextureFormat::Rgba16Float,
        Format::Rgba32Float => wgpu::TextureFormat::Rgba32Float,
    }
}

fn texture_usage(usage: ImageUsage) -> wgpu::TextureUsages {
    let mut out = wgpu::TextureUsages::empty();
    if usage.contains(ImageUsage::TRANSFER_SRC) {
        out |= wgpu::TextureUsages::COPY_SRC;
    }
    if usage.contains(ImageUsage::TRANSFER_DST) {
        out |= wgpu::TextureUsages::COPY_DST;
    }
    if usage.contains(ImageUsage::SAMPLED) {
        out |= wgpu::TextureUsages::TEXTURE_BINDING;
    }
    if usage.contains(ImageUsage::COLOR_ATTACHMENT) {
        out |= wgpu::TextureUsages::RENDER_ATTACHMENT;
    }
    out
}

fn shader_stages(stages: ShaderStages) -> wgpu::ShaderStages {
    let mut out = wgpu::ShaderStages::NONE;
    if stages.contains(ShaderStages::VERTEX) {
        out |= wgpu::ShaderStages::VERTEX;
    }
    if stages.contains(ShaderStages::FRAGMENT) {
        out |= wgpu::ShaderStages::FRAGMENT;
    }
    out
}

fn filter_mode(filter: Filter) -> wgpu::FilterMode {
    match filter {
        Filter::Nearest => wgpu::FilterMode::Nearest,
        Filter::Linear => wgpu::FilterMode::Linear,
    }
}

fn address_mode(wrap: Wrap) -> wgpu::AddressMode {
    match wrap {
        Wrap::Repeat => wgpu::AddressMode::Repeat,
        Wrap::MirroredRepeat => wgpu::AddressMode::MirrorRepeat,
        Wrap::ClampToEdge => wgpu::AddressMode::ClampToEdge,
    }
}

fn shader_source(program: ConvolutionProgram) -> String {
    match program {
        ConvolutionProgram::Irradiance { sample_delta } => {
            IRRADIANCE_WGSL.replace("{{SAMPLE_DELTA}}", &format!("{sample_delta:?}"))
        }
        ConvolutionProgram::Prefilter { sample_count } => {
            PREFILTER_WGSL.replace("{{SAMPLE_COUNT}}", &format!("{sample_count}u"))
        }
    }
}

fn encode_texels(format: Format, texels: &[[f32; 4]]) -> Vec<u8> {
    match format {
        Format::Rgba32Float => bytemuck::cast_slice(texels).to_vec(),
        Format::Rgba16Float => {
            let data: Vec<u16> = texels
                .iter()
                .flatten()
                .map(|&c| half::f16::from_f32(c).to_bits())
                .collect();
            bytemuck::cast_slice(&data).to_vec()
        }
        Format::Rgba8Unorm => texels
            .iter()
            .flatten()
            .map(|&c| (c.clamp(0.0, 1.0) * 255.0).round() as u8)
            .collect(),
    }
}

fn decode_texels(format: Format, bytes: &[u8]) -> Vec<[f32; 4]> {
    let channels: Vec<f32> = match format {
        Format::Rgba32Float => bytes
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect(),
        Format::Rgba16Float => bytes
            .chunks_exact(2)
            .map(|c| half::f16::from_le_bytes([c[0], c[1]]).to_f32())
            .collect(),
        Format::Rgba8Unorm => bytes.iter().map(|&b| f32::from(b) / 255.0).collect(),
    };
    channels
        .chunks_exact(4)
        .map(|c| [c[0], c[1], c[2], c[3]])
        .collect()
}

impl GpuDevice for WgpuDevice {
    fn queue(&self, name: &str) -> Option<QueueInfo> {
        (name == GRAPHICS_QUEUE).then(|| QueueInfo {
            name: name.to_owned(),
            family_index: 0,
        })
    }

    fn create_buffer(
        &self,
        label: &str,
        usage: BufferUsage,
        contents: &[u8],
    ) -> DeviceResult<BufferHandle> {
        let mut wgpu_usage = wgpu::BufferUsages::empty();
        if usage.contains(BufferUsage::VERTEX) {
            wgpu_usage |= wgpu::BufferUsages::VERTEX;
        }
        if usage.contains(BufferUsage::INDEX) {
            wgpu_usage |= wgpu::BufferUsages::INDEX;
        }
        let buffer = self.scoped(|device| {
            device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some(label),
                contents,
                usage: wgpu_usage,
            })
        })?;
        let mut state = self.state.lock();
        let id = state.id();
        state.buffers.insert(id, buffer);
        Ok(BufferHandle::from_raw(id))
    }

    fn create_image(&self, desc: &ImageDesc) -> DeviceResult<ImageHandle> {
        if desc.extent.width == 0 || desc.extent.height == 0 || desc.mip_levels == 0 {
            return Err(DeviceError::Validation(format!(
                "image `{}` is empty",
                desc.label
            )));
        }
        let mut state = self.state.lock();
        let id = state.id();
        state.images.insert(
            id,
            Image {
                desc: desc.clone(),
                texture: None,
            },
        );
        Ok(ImageHandle::from_raw(id))
    }

    fn allocate_image_memory(
        &self,
        images: &[ImageHandle],
        _location: MemoryLocation,
    ) -> DeviceResult<MemoryHandle> {
        let mut state = self.state.lock();
        let mut textures = Vec::with_capacity(images.len());
        for image in images {
            let slot = state
                .images
                .get(&image.raw())
                .ok_or(DeviceError::InvalidHandle(ObjectKind::Image))?;
            if slot.texture.is_some() {
                return Err(DeviceError::Validation(format!(
                    "image `{}` is already bound",
                    slot.desc.label
                )));
            }
            let desc = &slot.desc;
            let texture = self.scoped(|device| {
                device.create_texture(&wgpu::TextureDescriptor {
                    label: Some(&desc.label),
                    size: wgpu::Extent3d {
                        width: desc.extent.width,
                        height: desc.extent.height,
                        depth_or_array_layers: desc.array_layers,
                    },
                    mip_level_count: desc.mip_levels,
                    sample_count: 1,
                    dimension: wgpu::TextureDimension::D2,
                    format: texture_format(desc.format),
                    usage: texture_usage(desc.usage),
                    view_formats: &[],
                })
            })?;
            textures.push((image.raw(), texture));
        }
        let id = state.id();
        let mut bound = Vec::with_capacity(textures.len());
        for (image, texture) in textures {
            if let Some(slot) = state.images.get_mut(&image) {
                slot.texture = Some(texture);
            }
            bound.push(image);
        }
        state.memories.insert(id, bound);
        Ok(MemoryHandle::from_raw(id))
    }

    fn create_image_view(&self, desc: &ImageViewDesc) -> DeviceResult<ImageViewHandle> {
        let mut state = self.state.lock();
        let texture = state.texture(desc.image.raw())?;
        let dimension = match desc.dimension {
            ViewDimension::D2 => wgpu::TextureViewDimension::D2,
            ViewDimension::D2Array => wgpu::TextureViewDimension::D2Array,
            ViewDimension::Cube => wgpu::TextureViewDimension::Cube,
        };
        let view = self.scoped(|_| {
            texture.create_view(&wgpu::TextureViewDescriptor {
                label: None,
                format: Some(texture_format(desc.format)),
                dimension: Some(dimension),
                aspect: wgpu::TextureAspect::All,
                base_mip_level: desc.range.base_mip,
                mip_level_count: Some(desc.range.mip_count),
                base_array_layer: desc.range.base_layer,
                array_layer_count: Some(desc.range.layer_count),
                ..Default::default()
            })
        })?;
        let id = state.id();
        state.views.insert(id, View { desc: *desc, view });
        Ok(ImageViewHandle::from_raw(id))
    }

    fn create_sampler(&self, desc: &SamplerDesc) -> DeviceResult<SamplerHandle> {
        let sampler = self.scoped(|device| {
            device.create_sampler(&wgpu::SamplerDescriptor {
                address_mode_u: address_mode(desc.wrap_u),
                address_mode_v: address_mode(desc.wrap_v),
                address_mode_w: address_mode(desc.wrap_w),
                mag_filter: filter_mode(desc.mag_filter),
                min_filter: filter_mode(desc.min_filter),
                mipmap_filter: filter_mode(desc.mipmap_filter),
                lod_max_clamp: desc.max_lod,
                ..Default::default()
            })
        })?;
        let mut state = self.state.lock();
        let id = state.id();
        state.samplers.insert(id, sampler);
        Ok(SamplerHandle::from_raw(id))
    }

    fn create_render_pass(&self, desc: &RenderPassDesc) -> DeviceResult<RenderPassHandle> {
        let mut state = self.state.lock();
        let id = state.id();
        state.render_passes.insert(id, *desc);
        Ok(RenderPassHandle::from_raw(id))
    }

    fn create_framebuffer(&self, desc: &FramebufferDesc) -> DeviceResult<FramebufferHandle> {
        let mut state = self.state.lock();
        let pass = state
            .render_passes
            .get(&desc.render_pass.raw())
            .ok_or(DeviceError::InvalidHandle(ObjectKind::RenderPass))?;
        let view = desc
            .attachments
            .first()
            .and_then(|v| state.views.get(&v.raw()))
            .ok_or(DeviceError::InvalidHandle(ObjectKind::ImageView))?;
        if view.desc.format != pass.color_format {
            return Err(DeviceError::Validation(
                "attachment format differs from the render pass".into(),
            ));
        }
        let id = state.id();
        state.framebuffers.insert(id, desc.clone());
        Ok(FramebufferHandle::from_raw(id))
    }

    fn create_descriptor_set_layout(
        &self,
        bindings: &[DescriptorBinding],
    ) -> DeviceResult<DescriptorSetLayoutHandle> {
        let entries: Vec<wgpu::BindGroupLayoutEntry> = bindings
            .iter()
            .flat_map(|b| {
                let visibility = shader_stages(b.stages);
                [
                    wgpu::BindGroupLayoutEntry {
                        binding: 2 * b.binding,
                        visibility,
                        ty: wgpu::BindingType::Texture {
                            multisampled: false,
                            view_dimension: wgpu::TextureViewDimension::Cube,
                            sample_type: wgpu::TextureSampleType::Float { filterable: true },
                        },
                        count: None,
                    },
                    wgpu::BindGroupLayoutEntry {
                        binding: 2 * b.binding + 1,
                        visibility,
                        ty: wgpu::BindingType::Sampler(wgpu::SamplerBindingType::Filtering),
                        count: None,
                    },
                ]
            })
            .collect();
        let layout = self.scoped(|device| {
            device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                label: Some("convolution_source_layout"),
                entries: &entries,
            })
        })?;
        let mut state = self.state.lock();
        let id = state.id();
        state.set_layouts.insert(
            id,
            SetLayout {
                layout,
                bindings: bindings.to_vec(),
            },
        );
        Ok(DescriptorSetLayoutHandle::from_raw(id))
    }

    fn create_pipeline_layout(
        &self,
        desc: &PipelineLayoutDesc,
    ) -> DeviceResult<PipelineLayoutHandle> {
        let mut state = self.state.lock();
        let mut set_layouts = Vec::with_capacity(desc.set_layouts.len());
        for handle in &desc.set_layouts {
            let layout = state
                .set_layouts
                .get(&handle.raw())
                .ok_or(DeviceError::InvalidHandle(ObjectKind::DescriptorSetLayout))?;
            set_layouts.push(&layout.layout);
        }
        // wgpu wants every stage of a range to see the whole block, so the
        // ranges are merged into one padded to the WGSL struct size.
        let push_stages = desc
            .push_constant_ranges
            .iter()
            .fold(wgpu::ShaderStages::NONE, |acc, r| acc | shader_stages(r.stages));
        let end = desc
            .push_constant_ranges
            .iter()
            .map(|r| r.range.end)
            .max()
            .unwrap_or(0)
            .next_multiple_of(16);
        let push_constant_ranges: Vec<wgpu::PushConstantRange> = if end == 0 {
            Vec::new()
        } else {
            vec![wgpu::PushConstantRange {
                stages: push_stages,
                range: 0..end,
            }]
        };
        let layout = self.scoped(|device| {
            device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                label: Some("convolution_pipeline_layout"),
                bind_group_layouts: &set_layouts,
                push_constant_ranges: &push_constant_ranges,
            })
        })?;
        let id = state.id();
        state.pipeline_layouts.insert(
            id,
            PipelineLayout {
                layout,
                push_stages,
            },
        );
        Ok(PipelineLayoutHandle::from_raw(id))
    }

    fn create_graphics_pipeline(
        &self,
        desc: &GraphicsPipelineDesc,
    ) -> DeviceResult<PipelineHandle> {
        let mut state = self.state.lock();
        let color_format = state
            .render_passes
            .get(&desc.render_pass.raw())
            .ok_or(DeviceError::InvalidHandle(ObjectKind::RenderPass))?
            .color_format;
        let layout = &state
            .pipeline_layouts
            .get(&desc.layout.raw())
            .ok_or(DeviceError::InvalidHandle(ObjectKind::PipelineLayout))?
            .layout;
        let source = shader_source(desc.program);
        let pipeline = self.scoped(|device| {
            let shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some(&desc.label),
                source: wgpu::ShaderSource::Wgsl(source.into()),
            });
            device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
                label: Some(&desc.label),
                layout: Some(layout),
                vertex: wgpu::VertexState {
                    module: &shader,
                    entry_point: Some("vs_main"),
                    buffers: &[wgpu::VertexBufferLayout {
                        array_stride: u64::from(desc.vertex_stride),
                        step_mode: wgpu::VertexStepMode::Vertex,
                        attributes: &wgpu::vertex_attr_array![0 => Float32x3],
                    }],
                    compilation_options: wgpu::PipelineCompilationOptions::default(),
                },
                fragment: Some(wgpu::FragmentState {
                    module: &shader,
                    entry_point: Some("fs_main"),
                    targets: &[Some(wgpu::ColorTargetState {
                        format: texture_format(color_format),
                        blend: None,
                        write_mask: wgpu::ColorWrites::ALL,
                    })],
                    compilation_options: wgpu::PipelineCompilationOptions::default(),
                }),
                primitive: wgpu::PrimitiveState::default(),
                depth_stencil: None,
                multisample: wgpu::MultisampleState::default(),
                multiview: None,
                cache: None,
            })
        })?;
        let id = state.id();
        state.pipelines.insert(id, pipeline);
        Ok(PipelineHandle::from_raw(id))
    }

    fn create_descriptor_pool(
        &self,
        desc: &DescriptorPoolDesc,
    ) -> DeviceResult<DescriptorPoolHandle> {
        let mut state = self.state.lock();
        let id = state.id();
        state.descriptor_pools.insert(id, (desc.max_sets, Vec::new()));
        Ok(DescriptorPoolHandle::from_raw(id))
    }

    fn allocate_descriptor_set(
        &self,
        pool: DescriptorPoolHandle,
        layout: DescriptorSetLayoutHandle,
    ) -> DeviceResult<DescriptorSetHandle> {
        let mut state = self.state.lock();
        if !state.set_layouts.contains_key(&layout.raw()) {
            return Err(DeviceError::InvalidHandle(ObjectKind::DescriptorSetLayout));
        }
        let id = state.id();
        let (max_sets, sets) = state
            .descriptor_pools
            .get_mut(&pool.raw())
            .ok_or(DeviceError::InvalidHandle(ObjectKind::DescriptorPool))?;
        if sets.len() as u32 >= *max_sets {
            return Err(DeviceError::OutOfDeviceMemory);
        }
        sets.push(id);
        state.descriptor_sets.insert(
            id,
            DescriptorSet {
                pool: pool.raw(),
                layout: layout.raw(),
                writes: BTreeMap::new(),
                bind_group: None,
            },
        );
        Ok(DescriptorSetHandle::from_raw(id))
    }

    fn write_image_descriptor(
        &self,
        set: DescriptorSetHandle,
        binding: u32,
        descriptor: ImageDescriptor,
    ) -> DeviceResult<()> {
        let mut state = self.state.lock();
        let slot = state
            .descriptor_sets
            .get_mut(&set.raw())
            .ok_or(DeviceError::InvalidHandle(ObjectKind::DescriptorSet))?;
        slot.writes.insert(binding, descriptor);
        let slot = state
            .descriptor_sets
            .get(&set.raw())
            .ok_or(DeviceError::InvalidHandle(ObjectKind::DescriptorSet))?;
        let group = self.build_bind_group(&state, slot)?;
        if let Some(slot) = state.descriptor_sets.get_mut(&set.raw()) {
            slot.bind_group = group;
        }
        Ok(())
    }

    fn create_command_pool(&self, queue: &QueueInfo) -> DeviceResult<CommandPoolHandle> {
        Self::check_queue(queue)?;
        let mut state = self.state.lock();
        let id = state.id();
        state.command_pools.insert(id, Vec::new());
        Ok(CommandPoolHandle::from_raw(id))
    }

    fn allocate_command_buffer(
        &self,
        pool: CommandPoolHandle,
    ) -> DeviceResult<CommandBufferHandle> {
        let mut state = self.state.lock();
        let id = state.id();
        state
            .command_pools
            .get_mut(&pool.raw())
            .ok_or(DeviceError::InvalidHandle(ObjectKind::CommandPool))?
            .push(id);
        state.command_buffers.insert(
            id,
            CommandBuffer {
                pool: pool.raw(),
                recording: false,
                encoded: None,
            },
        );
        Ok(CommandBufferHandle::from_raw(id))
    }

    fn begin_command_buffer(&self, buffer: CommandBufferHandle) -> DeviceResult<()> {
        let mut state = self.state.lock();
        let buffer = state
            .command_buffers
            .get_mut(&buffer.raw())
            .ok_or(DeviceError::InvalidHandle(ObjectKind::CommandBuffer))?;
        buffer.recording = true;
        buffer.encoded = None;
        Ok(())
    }

    fn end_command_buffer(
        &self,
        buffer: CommandBufferHandle,
        commands: CommandList,
    ) -> DeviceResult<()> {
        let mut state = self.state.lock();
        match state.command_buffers.get(&buffer.raw()) {
            None => return Err(DeviceError::InvalidHandle(ObjectKind::CommandBuffer)),
            Some(b) if !b.recording => {
                return Err(DeviceError::Validation("command buffer is not recording".into()));
            }
            Some(_) => {}
        }
        let encoded = self.scoped(|_| self.encode(&state, &commands))??;
        if let Some(slot) = state.command_buffers.get_mut(&buffer.raw()) {
            slot.recording = false;
            slot.encoded = Some(encoded);
        }
        Ok(())
    }

    fn create_fence(&self, signaled: bool) -> DeviceResult<FenceHandle> {
        let mut state = self.state.lock();
        let id = state.id();
        state.fences.insert(
            id,
            Fence {
                signaled,
                submission: None,
            },
        );
        Ok(FenceHandle::from_raw(id))
    }

    fn submit(
        &self,
        queue: &QueueInfo,
        buffer: CommandBufferHandle,
        fence: Option<FenceHandle>,
    ) -> DeviceResult<()> {
        Self::check_queue(queue)?;
        let mut state = self.state.lock();
        let encoded = state
            .command_buffers
            .get_mut(&buffer.raw())
            .ok_or(DeviceError::InvalidHandle(ObjectKind::CommandBuffer))?
            .encoded
            .take()
            .ok_or_else(|| DeviceError::Validation("command buffer was not ended".into()))?;
        let submission = self.scoped(|_| self.queue.submit(Some(encoded)))?;
        if let Some(fence) = fence {
            let slot = state
                .fences
                .get_mut(&fence.raw())
                .ok_or(DeviceError::InvalidHandle(ObjectKind::Fence))?;
            slot.signaled = false;
            slot.submission = Some(submission);
        }
        Ok(())
    }

    fn wait_for_fence(&self, fence: FenceHandle, timeout: Option<Duration>) -> DeviceResult<()> {
        let submission = {
            let state = self.state.lock();
            let slot = state
                .fences
                .get(&fence.raw())
                .ok_or(DeviceError::InvalidHandle(ObjectKind::Fence))?;
            if slot.signaled {
                return Ok(());
            }
            slot.submission.clone().ok_or(DeviceError::Timeout)?
        };
        if let Some(timeout) = timeout {
            log::debug!("wgpu waits on submissions without a timeout; ignoring {timeout:?}");
        }
        self.poll(wgpu::PollType::WaitForSubmissionIndex(submission))?;
        if let Some(slot) = self.state.lock().fences.get_mut(&fence.raw()) {
            slot.signaled = true;
        }
        Ok(())
    }

    fn queue_wait_idle(&self, queue: &QueueInfo) -> DeviceResult<()> {
        Self::check_queue(queue)?;
        self.poll(wgpu::PollType::Wait)
    }

    fn write_image(
        &self,
        image: ImageHandle,
        layer: u32,
        mip_level: u32,
        texels: &[[f32; 4]],
    ) -> DeviceResult<()> {
        let state = self.state.lock();
        let format = state
            .images
            .get(&image.raw())
            .ok_or(DeviceError::InvalidHandle(ObjectKind::Image))?
            .desc
            .format;
        let texture = state.texture(image.raw())?;
        let width = (texture.width() >> mip_level).max(1);
        let height = (texture.height() >> mip_level).max(1);
        if texels.len() != (width * height) as usize {
            return Err(DeviceError::Validation(format!(
                "upload carries {} texels for a {width}x{height} subresource",
                texels.len()
            )));
        }
        let data = encode_texels(format, texels);
        self.scoped(|_| {
            self.queue.write_texture(
                wgpu::TexelCopyTextureInfo {
                    texture,
                    mip_level,
                    origin: wgpu::Origin3d { x: 0, y: 0, z: layer },
                    aspect: wgpu::TextureAspect::All,
                },
                &data,
                wgpu::TexelCopyBufferLayout {
                    offset: 0,
                    bytes_per_row: Some(width * format.bytes_per_texel()),
                    rows_per_image: Some(height),
                },
                wgpu::Extent3d {
                    width,
                    height,
                    depth_or_array_layers: 1,
                },
            )
        })
    }

    fn read_image(
        &self,
        image: ImageHandle,
        layer: u32,
        mip_level: u32,
    ) -> DeviceResult<Vec<[f32; 4]>> {
        let state = self.state.lock();
        let format = state
            .images
            .get(&image.raw())
            .ok_or(DeviceError::InvalidHandle(ObjectKind::Image))?
            .desc
            .format;
        let texture = state.texture(image.raw())?;
        let width = (texture.width() >> mip_level).max(1);
        let height = (texture.height() >> mip_level).max(1);
        let tight_bpr = width * format.bytes_per_texel();
        let padded_bpr = tight_bpr.next_multiple_of(wgpu::COPY_BYTES_PER_ROW_ALIGNMENT);

        let staging = self.scoped(|device| {
            let staging = device.create_buffer(&wgpu::BufferDescriptor {
                label: Some("readback_staging"),
                size: u64::from(padded_bpr) * u64::from(height),
                usage: wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::MAP_READ,
                mapped_at_creation: false,
            });
            let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("readback_encoder"),
            });
            encoder.copy_texture_to_buffer(
                wgpu::TexelCopyTextureInfo {
                    texture,
                    mip_level,
                    origin: wgpu::Origin3d { x: 0, y: 0, z: layer },
                    aspect: wgpu::TextureAspect::All,
                },
                wgpu::TexelCopyBufferInfo {
                    buffer: &staging,
                    layout: wgpu::TexelCopyBufferLayout {
                        offset: 0,
                        bytes_per_row: Some(padded_bpr),
                        rows_per_image: Some(height),
                    },
                },
                wgpu::Extent3d {
                    width,
                    height,
                    depth_or_array_layers: 1,
                },
            );
            self.queue.submit(Some(encoder.finish()));
            staging
        })?;
        drop(state);

        let slice = staging.slice(..);
        let (sender, receiver) = mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = sender.send(result);
        });
        self.poll(wgpu::PollType::Wait)?;
        receiver
            .recv()
            .map_err(|_| DeviceError::DeviceLost)?
            .map_err(|e| DeviceError::Validation(e.to_string()))?;

        let data = slice.get_mapped_range();
        let mut tight = Vec::with_capacity((tight_bpr * height) as usize);
        for row in 0..height as usize {
            let start = row * padded_bpr as usize;
            tight.extend_from_slice(&data[start..start + tight_bpr as usize]);
        }
        drop(data);
        staging.unmap();
        Ok(decode_texels(format, &tight))
    }

    fn destroy(&self, kind: ObjectKind, raw: u64) {
        let mut state = self.state.lock();
        let removed = match kind {
            ObjectKind::Buffer => state.buffers.remove(&raw).is_some(),
            ObjectKind::Image => state.images.remove(&raw).is_some(),
            ObjectKind::Memory => match state.memories.remove(&raw) {
                Some(images) => {
                    for image in images {
                        if let Some(slot) = state.images.get_mut(&image) {
                            slot.texture = None;
                        }
                    }
                    true
                }
                None => false,
            },
            ObjectKind::ImageView => state.views.remove(&raw).is_some(),
            ObjectKind::Sampler => state.samplers.remove(&raw).is_some(),
            ObjectKind::RenderPass => state.render_passes.remove(&raw).is_some(),
            ObjectKind::Framebuffer => state.framebuffers.remove(&raw).is_some(),
            ObjectKind::DescriptorSetLayout => state.set_layouts.remove(&raw).is_some(),
            ObjectKind::PipelineLayout => state.pipeline_layouts.remove(&raw).is_some(),
            ObjectKind::Pipeline => state.pipelines.remove(&raw).is_some(),
            ObjectKind::DescriptorPool => match state.descriptor_pools.remove(&raw) {
                Some((_, sets)) => {
                    for set in sets {
                        state.descriptor_sets.remove(&set);
                    }
                    true
                }
                None => false,
            },
            ObjectKind::DescriptorSet => match state.descriptor_sets.remove(&raw) {
                Some(set) => {
                    if let Some((_, sets)) = state.descriptor_pools.get_mut(&set.pool) {
                        sets.retain(|&s| s != raw);
                    }
                    true
                }
                None => false,
            },
            ObjectKind::CommandPool => match state.command_pools.remove(&raw) {
                Some(buffers) => {
                    for buffer in buffers {
                        state.command_buffers.remove(&buffer);
                    }
                    true
                }
                None => false,
            },
            ObjectKind::CommandBuffer => match state.command_buffers.remove(&raw) {
                Some(buffer) => {
                    if let Some(buffers) = state.command_pools.get_mut(&buffer.pool) {
                        buffers.retain(|&b| b != raw);
                    }
                    true
                }
                None => false,
            },
            ObjectKind::Fence => state.fences.remove(&raw).is_some(),
        };
        if !removed {
            log::warn!("destroy of a {kind} ({raw}) that is not alive");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shader_constants_are_substituted() {
        let irradiance = shader_source(ConvolutionProgram::Irradiance { sample_delta: 0.025 });
        assert!(irradiance.contains("const SAMPLE_DELTA: f32 = 0.025;"));
        let prefilter = shader_source(ConvolutionProgram::Prefilter { sample_count: 1024 });
        assert!(prefilter.contains("const SAMPLE_COUNT: u32 = 1024u;"));
        assert!(!prefilter.contains("{{"));
    }

    #[test]
    fn texel_encoding_round_trips_per_format() {
        let texels = [[0.25, 0.5, 2.0, 1.0], [0.0, 1.0, 0.75, 1.0]];
        assert_eq!(
            decode_texels(Format::Rgba32Float, &encode_texels(Format::Rgba32Float, &texels)),
            texels
        );
        assert_eq!(
            decode_texels(Format::Rgba16Float, &encode_texels(Format::Rgba16Float, &texels)),
            texels
        );
        let unorm = decode_texels(Format::Rgba8Unorm, &encode_texels(Format::Rgba8Unorm, &texels));
        assert_eq!(unorm[0][2], 1.0);
    }
}
