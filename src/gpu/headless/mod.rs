//! A CPU implementation of [`GpuDevice`].
//!
//! Every object lives in a per-kind table, so tests can ask how many of each
//! kind are alive and how many were ever created. Commands are validated the
//! way a strict driver would (bound state, per-subresource layouts, copy
//! bounds, push-constant ranges) and draws are executed by evaluating the
//! bound pipeline's kernel for every covered pixel. Any creation step and
//! every synchronization call can be made to fail on demand.

mod execute;

use std::{
    collections::{BTreeMap, HashMap},
    time::Duration,
};

use parking_lot::Mutex;

use super::{
    BufferHandle, BufferUsage, CommandBufferHandle, CommandList, CommandPoolHandle,
    DescriptorBinding, DescriptorPoolDesc, DescriptorPoolHandle, DescriptorSetHandle,
    DescriptorSetLayoutHandle, DeviceError, DeviceObject, DeviceResult, Extent2d, FenceHandle,
    Format, FramebufferDesc, FramebufferHandle, GpuDevice, GraphicsPipelineDesc, ImageDesc,
    ImageDescriptor, ImageHandle, ImageLayout, ImageViewDesc, ImageViewHandle, MemoryHandle,
    MemoryLocation, ObjectKind, PipelineHandle, PipelineLayoutDesc, PipelineLayoutHandle,
    QueueInfo, RenderPassDesc, RenderPassHandle, SamplerDesc, SamplerHandle, ViewDimension,
};

/// Largest push-constant block a pipeline layout may declare.
pub const MAX_PUSH_CONSTANT_SIZE: u32 = 128;

/// Where an injected failure fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailurePoint {
    Create(ObjectKind),
    BeginCommandBuffer,
    EndCommandBuffer,
    Submit,
    FenceWait,
    QueueIdle,
}

#[derive(Debug)]
struct Injection {
    point: FailurePoint,
    skip: u32,
    error: DeviceError,
}

#[derive(Debug)]
struct Buffer {
    usage: BufferUsage,
    data: Vec<u8>,
}

#[derive(Debug)]
struct Image {
    desc: ImageDesc,
    memory: Option<u64>,
    /// Texels per subresource, indexed `layer * mip_levels + mip`.
    texels: Vec<Vec<[f32; 4]>>,
    layouts: Vec<ImageLayout>,
}

impl Image {
    fn new(desc: ImageDesc) -> Self {
        let mut texels = Vec::new();
        for _ in 0..desc.array_layers {
            for mip in 0..desc.mip_levels {
                texels.push(vec![[0.0; 4]; desc.extent.mip(mip).texel_count()]);
            }
        }
        let layouts = vec![ImageLayout::Undefined; texels.len()];
        Self {
            desc,
            memory: None,
            texels,
            layouts,
        }
    }

    fn subresource(&self, layer: u32, mip: u32) -> Option<usize> {
        (layer < self.desc.array_layers && mip < self.desc.mip_levels)
            .then(|| (layer * self.desc.mip_levels + mip) as usize)
    }
}

#[derive(Debug)]
struct DescriptorPool {
    max_sets: u32,
    sets: Vec<u64>,
}

#[derive(Debug)]
struct DescriptorSet {
    pool: u64,
    layout: u64,
    writes: BTreeMap<u32, ImageDescriptor>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RecordingState {
    Initial,
    Recording,
    Executable,
}

#[derive(Debug)]
struct CommandBuffer {
    pool: u64,
    state: RecordingState,
    commands: CommandList,
}

#[derive(Debug, Default)]
struct State {
    next_id: u64,
    injections: Vec<Injection>,
    created: HashMap<ObjectKind, usize>,
    invalid_destroys: usize,
    submissions: Vec<CommandList>,

    buffers: HashMap<u64, Buffer>,
    images: HashMap<u64, Image>,
    memories: HashMap<u64, Vec<u64>>,
    views: HashMap<u64, ImageViewDesc>,
    samplers: HashMap<u64, SamplerDesc>,
    render_passes: HashMap<u64, RenderPassDesc>,
    framebuffers: HashMap<u64, FramebufferDesc>,
    set_layouts: HashMap<u64, Vec<DescriptorBinding>>,
    pipeline_layouts: HashMap<u64, PipelineLayoutDesc>,
    pipelines: HashMap<u64, GraphicsPipelineDesc>,
    descriptor_pools: HashMap<u64, DescriptorPool>,
    descriptor_sets: HashMap<u64, DescriptorSet>,
    command_pools: HashMap<u64, Vec<u64>>,
    command_buffers: HashMap<u64, CommandBuffer>,
    fences: HashMap<u64, bool>,
}

impl State {
    fn inject(&mut self, point: FailurePoint) -> DeviceResult<()> {
        let Some(index) = self.injections.iter().position(|i| i.point == point) else {
            return Ok(());
        };
        let injection = &mut self.injections[index];
        if injection.skip > 0 {
            injection.skip -= 1;
            return Ok(());
        }
        let injection = self.injections.remove(index);
        log::debug!("injected failure at {point:?}: {}", injection.error);
        Err(injection.error)
    }

    /// Runs the creation failure hook and hands out a fresh id.
    fn begin_create(&mut self, kind: ObjectKind) -> DeviceResult<u64> {
        self.inject(FailurePoint::Create(kind))?;
        self.next_id += 1;
        Ok(self.next_id)
    }

    fn created(&mut self, kind: ObjectKind) {
        *self.created.entry(kind).or_default() += 1;
    }

    fn live(&self, kind: ObjectKind) -> usize {
        match kind {
            ObjectKind::Buffer => self.buffers.len(),
            ObjectKind::Image => self.images.len(),
            ObjectKind::Memory => self.memories.len(),
            ObjectKind::ImageView => self.views.len(),
            ObjectKind::Sampler => self.samplers.len(),
            ObjectKind::RenderPass => self.render_passes.len(),
            ObjectKind::Framebuffer => self.framebuffers.len(),
            ObjectKind::DescriptorSetLayout => self.set_layouts.len(),
            ObjectKind::PipelineLayout => self.pipeline_layouts.len(),
            ObjectKind::Pipeline => self.pipelines.len(),
            ObjectKind::DescriptorPool => self.descriptor_pools.len(),
            ObjectKind::DescriptorSet => self.descriptor_sets.len(),
            ObjectKind::CommandPool => self.command_pools.len(),
            ObjectKind::CommandBuffer => self.command_buffers.len(),
            ObjectKind::Fence => self.fences.len(),
        }
    }

    fn bound_image(&self, image: u64) -> DeviceResult<&Image> {
        let found = self
            .images
            .get(&image)
            .ok_or(DeviceError::InvalidHandle(ObjectKind::Image))?;
        if found.memory.is_none() {
            return Err(validation(format!("image {image} has no memory bound")));
        }
        Ok(found)
    }

    fn remove(&mut self, kind: ObjectKind, raw: u64) -> bool {
        match kind {
            ObjectKind::Buffer => self.buffers.remove(&raw).is_some(),
            ObjectKind::Image => {
                let removed = self.images.remove(&raw);
                if let Some(memory) = removed.as_ref().and_then(|i| i.memory) {
                    if let Some(images) = self.memories.get_mut(&memory) {
                        images.retain(|&i| i != raw);
                    }
                }
                removed.is_some()
            }
            ObjectKind::Memory => match self.memories.remove(&raw) {
                Some(images) => {
                    for image in images {
                        if let Some(image) = self.images.get_mut(&image) {
                            image.memory = None;
                        }
                    }
                    true
                }
                None => false,
            },
            ObjectKind::ImageView => self.views.remove(&raw).is_some(),
            ObjectKind::Sampler => self.samplers.remove(&raw).is_some(),
            ObjectKind::RenderPass => self.render_passes.remove(&raw).is_some(),
            ObjectKind::Framebuffer => self.framebuffers.remove(&raw).is_some(),
            ObjectKind::DescriptorSetLayout => self.set_layouts.remove(&raw).is_some(),
            ObjectKind::PipelineLayout => self.pipeline_layouts.remove(&raw).is_some(),
            ObjectKind::Pipeline => self.pipelines.remove(&raw).is_some(),
            ObjectKind::DescriptorPool => match self.descriptor_pools.remove(&raw) {
                Some(pool) => {
                    for set in pool.sets {
                        self.descriptor_sets.remove(&set);
                    }
                    true
                }
                None => false,
            },
            ObjectKind::DescriptorSet => match self.descriptor_sets.remove(&raw) {
                Some(set) => {
                    if let Some(pool) = self.descriptor_pools.get_mut(&set.pool) {
                        pool.sets.retain(|&s| s != raw);
                    }
                    true
                }
                None => false,
            },
            ObjectKind::CommandPool => match self.command_pools.remove(&raw) {
                Some(buffers) => {
                    for buffer in buffers {
                        self.command_buffers.remove(&buffer);
                    }
                    true
                }
                None => false,
            },
            ObjectKind::CommandBuffer => match self.command_buffers.remove(&raw) {
                Some(buffer) => {
                    if let Some(pool) = self.command_pools.get_mut(&buffer.pool) {
                        pool.retain(|&b| b != raw);
                    }
                    true
                }
                None => false,
            },
            ObjectKind::Fence => self.fences.remove(&raw).is_some(),
        }
    }
}

fn validation(message: impl Into<String>) -> DeviceError {
    DeviceError::Validation(message.into())
}

/// Rounds a texel to what `format` can store.
pub(crate) fn quantize(format: Format, texel: [f32; 4]) -> [f32; 4] {
    match format {
        Format::Rgba32Float => texel,
        Format::Rgba16Float => texel.map(|c| half::f16::from_f32(c).to_f32()),
        Format::Rgba8Unorm => texel.map(|c| (c.clamp(0.0, 1.0) * 255.0).round() / 255.0),
    }
}

/// Instrumented CPU device.
pub struct HeadlessDevice {
    queues: Vec<QueueInfo>,
    state: Mutex<State>,
}

impl Default for HeadlessDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl HeadlessDevice {
    /// A device exposing a single `"graphics"` queue.
    pub fn new() -> Self {
        Self::with_queues(&["graphics"])
    }

    pub fn with_queues(names: &[&str]) -> Self {
        let queues = names
            .iter()
            .enumerate()
            .map(|(family_index, name)| QueueInfo {
                name: (*name).to_owned(),
                family_index: family_index as u32,
            })
            .collect();
        Self {
            queues,
            state: Mutex::new(State::default()),
        }
    }

    /// Makes the next call reaching `point` fail with `error`.
    pub fn fail_next(&self, point: FailurePoint, error: DeviceError) {
        self.fail_after(point, 0, error);
    }

    /// Lets `skip` calls reaching `point` succeed, then fails the next one.
    pub fn fail_after(&self, point: FailurePoint, skip: u32, error: DeviceError) {
        self.state.lock().injections.push(Injection { point, skip, error });
    }

    pub fn clear_failures(&self) {
        self.state.lock().injections.clear();
    }

    pub fn live_count(&self, kind: ObjectKind) -> usize {
        self.state.lock().live(kind)
    }

    pub fn live_total(&self) -> usize {
        let state = self.state.lock();
        ObjectKind::ALL.iter().map(|&kind| state.live(kind)).sum()
    }

    /// Live count of every kind, for before/after comparisons.
    pub fn live_snapshot(&self) -> BTreeMap<ObjectKind, usize> {
        let state = self.state.lock();
        ObjectKind::ALL
            .iter()
            .map(|&kind| (kind, state.live(kind)))
            .collect()
    }

    pub fn created_count(&self, kind: ObjectKind) -> usize {
        self.state.lock().created.get(&kind).copied().unwrap_or(0)
    }

    pub fn created_total(&self) -> usize {
        self.state.lock().created.values().sum()
    }

    /// Destroy calls naming an object that was not alive.
    pub fn invalid_destroys(&self) -> usize {
        self.state.lock().invalid_destroys
    }

    /// Every command list submitted so far, oldest first.
    pub fn submissions(&self) -> Vec<CommandList> {
        self.state.lock().submissions.clone()
    }

    pub fn image_desc(&self, image: ImageHandle) -> Option<ImageDesc> {
        self.state
            .lock()
            .images
            .get(&image.raw())
            .map(|i| i.desc.clone())
    }

    pub fn image_layout(&self, image: ImageHandle, layer: u32, mip: u32) -> Option<ImageLayout> {
        let state = self.state.lock();
        let image = state.images.get(&image.raw())?;
        image.subresource(layer, mip).map(|i| image.layouts[i])
    }

    fn known_queue(&self, queue: &QueueInfo) -> DeviceResult<()> {
        if self.queues.contains(queue) {
            Ok(())
        } else {
            Err(validation(format!("unknown queue `{}`", queue.name)))
        }
    }
}

impl GpuDevice for HeadlessDevice {
    fn queue(&self, name: &str) -> Option<QueueInfo> {
        self.queues.iter().find(|q| q.name == name).cloned()
    }

    fn create_buffer(
        &self,
        label: &str,
        usage: BufferUsage,
        contents: &[u8],
    ) -> DeviceResult<BufferHandle> {
        let mut state = self.state.lock();
        if contents.is_empty() {
            return Err(validation(format!("buffer `{label}` is empty")));
        }
        let id = state.begin_create(ObjectKind::Buffer)?;
        state.buffers.insert(
            id,
            Buffer {
                usage,
                data: contents.to_vec(),
            },
        );
        state.created(ObjectKind::Buffer);
        Ok(BufferHandle::from_raw(id))
    }

    fn create_image(&self, desc: &ImageDesc) -> DeviceResult<ImageHandle> {
        let mut state = self.state.lock();
        let max_mips = 32 - desc.extent.width.max(desc.extent.height).leading_zeros();
        if desc.extent.width == 0 || desc.extent.height == 0 {
            return Err(validation(format!("image `{}` has a zero extent", desc.label)));
        }
        if desc.mip_levels == 0 || desc.mip_levels > max_mips {
            return Err(validation(format!(
                "image `{}` asks for {} mips, at most {max_mips} fit",
                desc.label, desc.mip_levels
            )));
        }
        if desc.array_layers == 0 || desc.usage.is_empty() {
            return Err(validation(format!("image `{}` has no layers or usage", desc.label)));
        }
        if desc.cube_compatible
            && (desc.array_layers % 6 != 0 || desc.extent.width != desc.extent.height)
        {
            return Err(validation(format!(
                "cube image `{}` needs square faces and a multiple of six layers",
                desc.label
            )));
        }
        let id = state.begin_create(ObjectKind::Image)?;
        state.images.insert(id, Image::new(desc.clone()));
        state.created(ObjectKind::Image);
        Ok(ImageHandle::from_raw(id))
    }

    fn allocate_image_memory(
        &self,
        images: &[ImageHandle],
        _location: MemoryLocation,
    ) -> DeviceResult<MemoryHandle> {
        let mut state = self.state.lock();
        if images.is_empty() {
            return Err(validation("memory allocation backs no image"));
        }
        for image in images {
            match state.images.get(&image.raw()) {
                None => return Err(DeviceError::InvalidHandle(ObjectKind::Image)),
                Some(i) if i.memory.is_some() => {
                    return Err(validation(format!("image `{}` is already bound", i.desc.label)));
                }
                Some(_) => {}
            }
        }
        let id = state.begin_create(ObjectKind::Memory)?;
        for image in images {
            if let Some(image) = state.images.get_mut(&image.raw()) {
                image.memory = Some(id);
            }
        }
        state
            .memories
            .insert(id, images.iter().map(|i| i.raw()).collect());
        state.created(ObjectKind::Memory);
        Ok(MemoryHandle::from_raw(id))
    }

    fn create_image_view(&self, desc: &ImageViewDesc) -> DeviceResult<ImageViewHandle> {
        let mut state = self.state.lock();
        let image = state.bound_image(desc.image.raw())?;
        let r = desc.range;
        if r.mip_count == 0
            || r.layer_count == 0
            || r.base_mip + r.mip_count > image.desc.mip_levels
            || r.base_layer + r.layer_count > image.desc.array_layers
        {
            return Err(validation(format!(
                "view range {r:?} exceeds image `{}`",
                image.desc.label
            )));
        }
        if desc.format != image.desc.format {
            return Err(validation("view format differs from its image"));
        }
        match desc.dimension {
            ViewDimension::Cube if !image.desc.cube_compatible || r.layer_count != 6 => {
                return Err(validation("cube views need six layers of a cube image"));
            }
            ViewDimension::D2 if r.layer_count != 1 => {
                return Err(validation("2-D views cover exactly one layer"));
            }
            _ => {}
        }
        let id = state.begin_create(ObjectKind::ImageView)?;
        state.views.insert(id, *desc);
        state.created(ObjectKind::ImageView);
        Ok(ImageViewHandle::from_raw(id))
    }

    fn create_sampler(&self, desc: &SamplerDesc) -> DeviceResult<SamplerHandle> {
        let mut state = self.state.lock();
        let id = state.begin_create(ObjectKind::Sampler)?;
        state.samplers.insert(id, *desc);
        state.created(ObjectKind::Sampler);
        Ok(SamplerHandle::from_raw(id))
    }

    fn create_render_pass(&self, desc: &RenderPassDesc) -> DeviceResult<RenderPassHandle> {
        let mut state = self.state.lock();
        let id = state.begin_create(ObjectKind::RenderPass)?;
        state.render_passes.insert(id, *desc);
        state.created(ObjectKind::RenderPass);
        Ok(RenderPassHandle::from_raw(id))
    }

    fn create_framebuffer(&self, desc: &FramebufferDesc) -> DeviceResult<FramebufferHandle> {
        let mut state = self.state.lock();
        let pass = *state
            .render_passes
            .get(&desc.render_pass.raw())
            .ok_or(DeviceError::InvalidHandle(ObjectKind::RenderPass))?;
        let [attachment] = desc.attachments.as_slice() else {
            return Err(validation("framebuffers carry exactly one color attachment"));
        };
        let view = *state
            .views
            .get(&attachment.raw())
            .ok_or(DeviceError::InvalidHandle(ObjectKind::ImageView))?;
        let image = state.bound_image(view.image.raw())?;
        let extent = image.desc.extent.mip(view.range.base_mip);
        if desc.extent.width > extent.width || desc.extent.height > extent.height {
            return Err(validation("framebuffer is larger than its attachment"));
        }
        if view.format != pass.color_format {
            return Err(validation("attachment format differs from the render pass"));
        }
        let id = state.begin_create(ObjectKind::Framebuffer)?;
        state.framebuffers.insert(id, desc.clone());
        state.created(ObjectKind::Framebuffer);
        Ok(FramebufferHandle::from_raw(id))
    }

    fn create_descriptor_set_layout(
        &self,
        bindings: &[DescriptorBinding],
    ) -> DeviceResult<DescriptorSetLayoutHandle> {
        let mut state = self.state.lock();
        let id = state.begin_create(ObjectKind::DescriptorSetLayout)?;
        state.set_layouts.insert(id, bindings.to_vec());
        state.created(ObjectKind::DescriptorSetLayout);
        Ok(DescriptorSetLayoutHandle::from_raw(id))
    }

    fn create_pipeline_layout(
        &self,
        desc: &PipelineLayoutDesc,
    ) -> DeviceResult<PipelineLayoutHandle> {
        let mut state = self.state.lock();
        if desc
            .set_layouts
            .iter()
            .any(|l| !state.set_layouts.contains_key(&l.raw()))
        {
            return Err(DeviceError::InvalidHandle(ObjectKind::DescriptorSetLayout));
        }
        for range in &desc.push_constant_ranges {
            if range.range.start % 4 != 0
                || range.range.end % 4 != 0
                || range.range.end > MAX_PUSH_CONSTANT_SIZE
                || range.range.is_empty()
            {
                return Err(validation(format!("bad push constant range {:?}", range.range)));
            }
        }
        let id = state.begin_create(ObjectKind::PipelineLayout)?;
        state.pipeline_layouts.insert(id, desc.clone());
        state.created(ObjectKind::PipelineLayout);
        Ok(PipelineLayoutHandle::from_raw(id))
    }

    fn create_graphics_pipeline(
        &self,
        desc: &GraphicsPipelineDesc,
    ) -> DeviceResult<PipelineHandle> {
        let mut state = self.state.lock();
        if !state.render_passes.contains_key(&desc.render_pass.raw()) {
            return Err(DeviceError::InvalidHandle(ObjectKind::RenderPass));
        }
        if !state.pipeline_layouts.contains_key(&desc.layout.raw()) {
            return Err(DeviceError::InvalidHandle(ObjectKind::PipelineLayout));
        }
        if desc.vertex_stride < 12 {
            return Err(validation("vertex stride cannot hold a position"));
        }
        let id = state.begin_create(ObjectKind::Pipeline)?;
        state.pipelines.insert(id, desc.clone());
        state.created(ObjectKind::Pipeline);
        Ok(PipelineHandle::from_raw(id))
    }

    fn create_descriptor_pool(
        &self,
        desc: &DescriptorPoolDesc,
    ) -> DeviceResult<DescriptorPoolHandle> {
        let mut state = self.state.lock();
        if desc.max_sets == 0 {
            return Err(validation("descriptor pool holds no sets"));
        }
        let id = state.begin_create(ObjectKind::DescriptorPool)?;
        state.descriptor_pools.insert(
            id,
            DescriptorPool {
                max_sets: desc.max_sets,
                sets: Vec::new(),
            },
        );
        state.created(ObjectKind::DescriptorPool);
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
        let found = state
            .descriptor_pools
            .get(&pool.raw())
            .ok_or(DeviceError::InvalidHandle(ObjectKind::DescriptorPool))?;
        if found.sets.len() as u32 >= found.max_sets {
            return Err(DeviceError::OutOfDeviceMemory);
        }
        let id = state.begin_create(ObjectKind::DescriptorSet)?;
        if let Some(found) = state.descriptor_pools.get_mut(&pool.raw()) {
            found.sets.push(id);
        }
        state.descriptor_sets.insert(
            id,
            DescriptorSet {
                pool: pool.raw(),
                layout: layout.raw(),
                writes: BTreeMap::new(),
            },
        );
        state.created(ObjectKind::DescriptorSet);
        Ok(DescriptorSetHandle::from_raw(id))
    }

    fn write_image_descriptor(
        &self,
        set: DescriptorSetHandle,
        binding: u32,
        descriptor: ImageDescriptor,
    ) -> DeviceResult<()> {
        let mut state = self.state.lock();
        if !state.samplers.contains_key(&descriptor.sampler.raw()) {
            return Err(DeviceError::InvalidHandle(ObjectKind::Sampler));
        }
        if !state.views.contains_key(&descriptor.view.raw()) {
            return Err(DeviceError::InvalidHandle(ObjectKind::ImageView));
        }
        let layout = state
            .descriptor_sets
            .get(&set.raw())
            .ok_or(DeviceError::InvalidHandle(ObjectKind::DescriptorSet))?
            .layout;
        let declared = state
            .set_layouts
            .get(&layout)
            .is_some_and(|bindings| bindings.iter().any(|b| b.binding == binding));
        if !declared {
            return Err(validation(format!("set layout has no binding {binding}")));
        }
        if let Some(set) = state.descriptor_sets.get_mut(&set.raw()) {
            set.writes.insert(binding, descriptor);
        }
        Ok(())
    }

    fn create_command_pool(&self, queue: &QueueInfo) -> DeviceResult<CommandPoolHandle> {
        self.known_queue(queue)?;
        let mut state = self.state.lock();
        let id = state.begin_create(ObjectKind::CommandPool)?;
        state.command_pools.insert(id, Vec::new());
        state.created(ObjectKind::CommandPool);
        Ok(CommandPoolHandle::from_raw(id))
    }

    fn allocate_command_buffer(
        &self,
        pool: CommandPoolHandle,
    ) -> DeviceResult<CommandBufferHandle> {
        let mut state = self.state.lock();
        if !state.command_pools.contains_key(&pool.raw()) {
            return Err(DeviceError::InvalidHandle(ObjectKind::CommandPool));
        }
        let id = state.begin_create(ObjectKind::CommandBuffer)?;
        if let Some(buffers) = state.command_pools.get_mut(&pool.raw()) {
            buffers.push(id);
        }
        state.command_buffers.insert(
            id,
            CommandBuffer {
                pool: pool.raw(),
                state: RecordingState::Initial,
                commands: CommandList::new(),
            },
        );
        state.created(ObjectKind::CommandBuffer);
        Ok(CommandBufferHandle::from_raw(id))
    }

    fn begin_command_buffer(&self, buffer: CommandBufferHandle) -> DeviceResult<()> {
        let mut state = self.state.lock();
        state.inject(FailurePoint::BeginCommandBuffer)?;
        let buffer = state
            .command_buffers
            .get_mut(&buffer.raw())
            .ok_or(DeviceError::InvalidHandle(ObjectKind::CommandBuffer))?;
        if buffer.state == RecordingState::Recording {
            return Err(validation("command buffer is already recording"));
        }
        buffer.state = RecordingState::Recording;
        buffer.commands = CommandList::new();
        Ok(())
    }

    fn end_command_buffer(
        &self,
        buffer: CommandBufferHandle,
        commands: CommandList,
    ) -> DeviceResult<()> {
        let mut state = self.state.lock();
        state.inject(FailurePoint::EndCommandBuffer)?;
        let buffer = state
            .command_buffers
            .get_mut(&buffer.raw())
            .ok_or(DeviceError::InvalidHandle(ObjectKind::CommandBuffer))?;
        if buffer.state != RecordingState::Recording {
            return Err(validation("command buffer is not recording"));
        }
        execute::check_pass_nesting(&commands).map_err(validation)?;
        buffer.state = RecordingState::Executable;
        buffer.commands = commands;
        Ok(())
    }

    fn create_fence(&self, signaled: bool) -> DeviceResult<FenceHandle> {
        let mut state = self.state.lock();
        let id = state.begin_create(ObjectKind::Fence)?;
        state.fences.insert(id, signaled);
        state.created(ObjectKind::Fence);
        Ok(FenceHandle::from_raw(id))
    }

    fn submit(
        &self,
        queue: &QueueInfo,
        buffer: CommandBufferHandle,
        fence: Option<FenceHandle>,
    ) -> DeviceResult<()> {
        self.known_queue(queue)?;
        let mut state = self.state.lock();
        state.inject(FailurePoint::Submit)?;
        let commands = {
            let buffer = state
                .command_buffers
                .get(&buffer.raw())
                .ok_or(DeviceError::InvalidHandle(ObjectKind::CommandBuffer))?;
            if buffer.state != RecordingState::Executable {
                return Err(validation("command buffer was not ended"));
            }
            buffer.commands.clone()
        };
        if let Some(fence) = fence {
            match state.fences.get(&fence.raw()) {
                None => return Err(DeviceError::InvalidHandle(ObjectKind::Fence)),
                Some(true) => return Err(validation("fence is already signaled")),
                Some(false) => {}
            }
        }
        execute::execute(&mut state, commands.commands())?;
        if let Some(fence) = fence {
            state.fences.insert(fence.raw(), true);
        }
        state.submissions.push(commands);
        Ok(())
    }

    fn wait_for_fence(&self, fence: FenceHandle, _timeout: Option<Duration>) -> DeviceResult<()> {
        let mut state = self.state.lock();
        state.inject(FailurePoint::FenceWait)?;
        match state.fences.get(&fence.raw()) {
            None => Err(DeviceError::InvalidHandle(ObjectKind::Fence)),
            Some(true) => Ok(()),
            // Execution is synchronous, so nothing is left that could signal it.
            Some(false) => Err(DeviceError::Timeout),
        }
    }

    fn queue_wait_idle(&self, queue: &QueueInfo) -> DeviceResult<()> {
        self.known_queue(queue)?;
        self.state.lock().inject(FailurePoint::QueueIdle)
    }

    fn write_image(
        &self,
        image: ImageHandle,
        layer: u32,
        mip_level: u32,
        texels: &[[f32; 4]],
    ) -> DeviceResult<()> {
        let mut state = self.state.lock();
        let target = state.bound_image(image.raw())?;
        if !target.desc.usage.contains(super::ImageUsage::TRANSFER_DST) {
            return Err(validation("image is not a transfer destination"));
        }
        let index = target
            .subresource(layer, mip_level)
            .ok_or_else(|| validation(format!("no subresource {layer}/{mip_level}")))?;
        let extent: Extent2d = target.desc.extent.mip(mip_level);
        if texels.len() != extent.texel_count() {
            return Err(validation(format!(
                "upload carries {} texels for a {}x{} subresource",
                texels.len(),
                extent.width,
                extent.height
            )));
        }
        let format = target.desc.format;
        if let Some(target) = state.images.get_mut(&image.raw()) {
            target.texels[index] = texels.iter().map(|&t| quantize(format, t)).collect();
            target.layouts[index] = ImageLayout::ShaderReadOnly;
        }
        Ok(())
    }

    fn read_image(
        &self,
        image: ImageHandle,
        layer: u32,
        mip_level: u32,
    ) -> DeviceResult<Vec<[f32; 4]>> {
        let state = self.state.lock();
        let source = state.bound_image(image.raw())?;
        if !source.desc.usage.contains(super::ImageUsage::TRANSFER_SRC) {
            return Err(validation("image is not a transfer source"));
        }
        let index = source
            .subresource(layer, mip_level)
            .ok_or_else(|| validation(format!("no subresource {layer}/{mip_level}")))?;
        Ok(source.texels[index].clone())
    }

    fn destroy(&self, kind: ObjectKind, raw: u64) {
        let mut state = self.state.lock();
        if !state.remove(kind, raw) {
            log::warn!("destroy of a {kind} ({raw}) that is not alive");
            state.invalid_destroys += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::{ImageUsage, SubresourceRange};

    fn cube_desc(size: u32, mips: u32) -> ImageDesc {
        ImageDesc {
            label: "cube".into(),
            extent: Extent2d::square(size),
            format: Format::Rgba16Float,
            mip_levels: mips,
            array_layers: 6,
            usage: ImageUsage::SAMPLED | ImageUsage::TRANSFER_DST | ImageUsage::TRANSFER_SRC,
            cube_compatible: true,
        }
    }

    #[test]
    fn views_require_bound_memory() {
        let device = HeadlessDevice::new();
        let image = device.create_image(&cube_desc(8, 1)).unwrap();
        let view = ImageViewDesc {
            image,
            dimension: ViewDimension::Cube,
            format: Format::Rgba16Float,
            range: SubresourceRange::whole(1, 6),
        };
        assert!(matches!(
            device.create_image_view(&view),
            Err(DeviceError::Validation(_))
        ));
        device
            .allocate_image_memory(&[image], MemoryLocation::DeviceLocal)
            .unwrap();
        device.create_image_view(&view).unwrap();
        assert_eq!(device.live_count(ObjectKind::ImageView), 1);
    }

    #[test]
    fn injected_failures_skip_then_fire_once() {
        let device = HeadlessDevice::new();
        device.fail_after(
            FailurePoint::Create(ObjectKind::Fence),
            1,
            DeviceError::OutOfHostMemory,
        );
        assert!(device.create_fence(false).is_ok());
        assert_eq!(device.create_fence(false), Err(DeviceError::OutOfHostMemory));
        assert!(device.create_fence(false).is_ok());
        assert_eq!(device.created_count(ObjectKind::Fence), 2);
    }

    #[test]
    fn destroying_a_pool_frees_its_children() {
        let device = HeadlessDevice::new();
        let queue = device.queue("graphics").unwrap();
        let pool = device.create_command_pool(&queue).unwrap();
        device.allocate_command_buffer(pool).unwrap();
        device.allocate_command_buffer(pool).unwrap();
        assert_eq!(device.live_count(ObjectKind::CommandBuffer), 2);
        device.destroy(ObjectKind::CommandPool, pool.raw());
        assert_eq!(device.live_count(ObjectKind::CommandBuffer), 0);
        assert_eq!(device.invalid_destroys(), 0);
        device.destroy(ObjectKind::CommandPool, pool.raw());
        assert_eq!(device.invalid_destroys(), 1);
    }

    #[test]
    fn uploads_are_stored_at_format_precision() {
        let device = HeadlessDevice::new();
        let image = device.create_image(&cube_desc(2, 1)).unwrap();
        device
            .allocate_image_memory(&[image], MemoryLocation::DeviceLocal)
            .unwrap();
        let texels = vec![[0.1, 1.0, 1000.0, 1.0]; 4];
        device.write_image(image, 3, 0, &texels).unwrap();
        let back = device.read_image(image, 3, 0).unwrap();
        assert_eq!(back[0], quantize(Format::Rgba16Float, texels[0]));
        assert!((back[0][0] - 0.1).abs() < 1e-3);
        assert_eq!(
            device.image_layout(image, 3, 0),
            Some(ImageLayout::ShaderReadOnly)
        );
        assert_eq!(device.image_layout(image, 2, 0), Some(ImageLayout::Undefined));
    }

    #[test]
    fn unsignaled_fences_do_not_hang() {
        let device = HeadlessDevice::new();
        let fence = device.create_fence(false).unwrap();
        assert_eq!(device.wait_for_fence(fence, None), Err(DeviceError::Timeout));
        let signaled = device.create_fence(true).unwrap();
        assert_eq!(device.wait_for_fence(signaled, None), Ok(()));
    }
}
