//! Graphics device contract used by the baking pipeline.
//!
//! Objects are created explicitly, in whatever order the caller chooses, and
//! are referred to by small `Copy` handles. Commands are recorded host-side
//! into a [`CommandList`] and handed to the device when the command buffer is
//! ended. [`Owned`] ties a handle to the device that created it and releases
//! the object when dropped.

mod command;
pub mod headless;
mod layout;
pub mod wgpu_device;

pub use command::{
    ClearValue, Command, CommandList, ImageCopy, IndexType, Rect2d, ShaderStages, Subresource,
    Viewport,
};
pub use headless::HeadlessDevice;
pub use layout::{
    AccessFlags, ImageBarrier, ImageLayout, LayoutError, LayoutTracker, PipelineStages,
    SubresourceRange,
};
pub use wgpu_device::WgpuDevice;

use std::{fmt, ops::Range, sync::Arc, time::Duration};

use bitflags::bitflags;

/// A device object handle. Handles are plain ids; the device owns the object.
pub trait DeviceObject: Copy + fmt::Debug + Eq + std::hash::Hash {
    const KIND: ObjectKind;
    fn from_raw(raw: u64) -> Self;
    fn raw(self) -> u64;
}

macro_rules! device_objects {
    ($($handle:ident => $kind:ident, $label:literal;)*) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub enum ObjectKind {
            $($kind,)*
        }

        impl ObjectKind {
            pub const ALL: &'static [ObjectKind] = &[$(ObjectKind::$kind,)*];

            pub fn label(self) -> &'static str {
                match self {
                    $(ObjectKind::$kind => $label,)*
                }
            }
        }

        $(
            #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
            pub struct $handle(u64);

            impl DeviceObject for $handle {
                const KIND: ObjectKind = ObjectKind::$kind;

                fn from_raw(raw: u64) -> Self {
                    Self(raw)
                }

                fn raw(self) -> u64 {
                    self.0
                }
            }
        )*
    };
}

device_objects! {
    BufferHandle => Buffer, "buffer";
    ImageHandle => Image, "image";
    MemoryHandle => Memory, "device memory";
    ImageViewHandle => ImageView, "image view";
    SamplerHandle => Sampler, "sampler";
    RenderPassHandle => RenderPass, "render pass";
    FramebufferHandle => Framebuffer, "framebuffer";
    DescriptorSetLayoutHandle => DescriptorSetLayout, "descriptor set layout";
    PipelineLayoutHandle => PipelineLayout, "pipeline layout";
    PipelineHandle => Pipeline, "pipeline";
    DescriptorPoolHandle => DescriptorPool, "descriptor pool";
    DescriptorSetHandle => DescriptorSet, "descriptor set";
    CommandPoolHandle => CommandPool, "command pool";
    CommandBufferHandle => CommandBuffer, "command buffer";
    FenceHandle => Fence, "fence";
}

impl ObjectKind {
    /// Kinds that only ever live for the duration of one bake call.
    pub const TRANSIENT: &'static [ObjectKind] = &[
        ObjectKind::Framebuffer,
        ObjectKind::DescriptorPool,
        ObjectKind::DescriptorSet,
        ObjectKind::CommandPool,
        ObjectKind::CommandBuffer,
        ObjectKind::Fence,
    ];
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Result code reported by the device when an operation fails.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeviceError {
    #[error("out of host memory")]
    OutOfHostMemory,
    #[error("out of device memory")]
    OutOfDeviceMemory,
    #[error("device lost")]
    DeviceLost,
    #[error("format {0:?} is not supported")]
    FormatNotSupported(Format),
    #[error("invalid {0} handle")]
    InvalidHandle(ObjectKind),
    #[error("timed out")]
    Timeout,
    #[error("validation failed: {0}")]
    Validation(String),
}

pub type DeviceResult<T> = Result<T, DeviceError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Format {
    Rgba8Unorm,
    Rgba16Float,
    Rgba32Float,
}

impl Format {
    pub fn bytes_per_texel(self) -> u32 {
        match self {
            Format::Rgba8Unorm => 4,
            Format::Rgba16Float => 8,
            Format::Rgba32Float => 16,
        }
    }

    /// Float formats able to hold radiance above 1.0 without clipping.
    pub fn is_hdr_float(self) -> bool {
        matches!(self, Format::Rgba16Float | Format::Rgba32Float)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Extent2d {
    pub width: u32,
    pub height: u32,
}

impl Extent2d {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn square(size: u32) -> Self {
        Self::new(size, size)
    }

    /// Size of mip `level`, never below one texel.
    pub fn mip(self, level: u32) -> Self {
        Self::new(
            (self.width >> level).max(1),
            (self.height >> level).max(1),
        )
    }

    pub fn texel_count(self) -> usize {
        self.width as usize * self.height as usize
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ImageUsage: u32 {
        const TRANSFER_SRC = 1 << 0;
        const TRANSFER_DST = 1 << 1;
        const SAMPLED = 1 << 2;
        const COLOR_ATTACHMENT = 1 << 3;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct BufferUsage: u32 {
        const VERTEX = 1 << 0;
        const INDEX = 1 << 1;
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ImageDesc {
    pub label: String,
    pub extent: Extent2d,
    pub format: Format,
    pub mip_levels: u32,
    pub array_layers: u32,
    pub usage: ImageUsage,
    pub cube_compatible: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryLocation {
    DeviceLocal,
    HostVisible,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewDimension {
    D2,
    D2Array,
    Cube,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageViewDesc {
    pub image: ImageHandle,
    pub dimension: ViewDimension,
    pub format: Format,
    pub range: SubresourceRange,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Filter {
    Nearest,
    Linear,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Wrap {
    Repeat,
    MirroredRepeat,
    ClampToEdge,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SamplerDesc {
    pub mag_filter: Filter,
    pub min_filter: Filter,
    pub mipmap_filter: Filter,
    pub wrap_u: Wrap,
    pub wrap_v: Wrap,
    pub wrap_w: Wrap,
    pub max_lod: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RenderPassDesc {
    pub color_format: Format,
    /// Clear the color attachment on load and store it at the end of the pass.
    pub clear_on_load: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FramebufferDesc {
    pub render_pass: RenderPassHandle,
    pub attachments: Vec<ImageViewHandle>,
    pub extent: Extent2d,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DescriptorType {
    CombinedImageSampler,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DescriptorBinding {
    pub binding: u32,
    pub ty: DescriptorType,
    pub stages: ShaderStages,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DescriptorPoolDesc {
    pub max_sets: u32,
    pub pool_sizes: Vec<(DescriptorType, u32)>,
}

/// Contents of one combined image-sampler descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageDescriptor {
    pub sampler: SamplerHandle,
    pub view: ImageViewHandle,
    pub layout: ImageLayout,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushConstantRange {
    pub stages: ShaderStages,
    pub range: Range<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineLayoutDesc {
    pub set_layouts: Vec<DescriptorSetLayoutHandle>,
    pub push_constant_ranges: Vec<PushConstantRange>,
}

/// Fragment program run by a convolution pipeline.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ConvolutionProgram {
    /// Cosine-weighted hemisphere integral, stepping `sample_delta` radians.
    Irradiance { sample_delta: f32 },
    /// GGX importance-sampled specular prefilter driven by a roughness push constant.
    Prefilter { sample_count: u32 },
}

#[derive(Debug, Clone, PartialEq)]
pub struct GraphicsPipelineDesc {
    pub label: String,
    pub render_pass: RenderPassHandle,
    pub layout: PipelineLayoutHandle,
    pub program: ConvolutionProgram,
    /// Stride of the single position-only vertex stream.
    pub vertex_stride: u32,
}

/// A hardware queue resolved by name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueInfo {
    pub name: String,
    pub family_index: u32,
}

/// Explicit graphics device.
///
/// Every creation call either returns a new object or the device's result
/// code; nothing is created implicitly. Implementations must tolerate
/// `destroy` of any live handle in any order the caller picks.
pub trait GpuDevice: Send + Sync {
    fn queue(&self, name: &str) -> Option<QueueInfo>;

    fn create_buffer(
        &self,
        label: &str,
        usage: BufferUsage,
        contents: &[u8],
    ) -> DeviceResult<BufferHandle>;

    fn create_image(&self, desc: &ImageDesc) -> DeviceResult<ImageHandle>;

    /// Allocates one block backing every listed image and binds them to it.
    fn allocate_image_memory(
        &self,
        images: &[ImageHandle],
        location: MemoryLocation,
    ) -> DeviceResult<MemoryHandle>;

    fn create_image_view(&self, desc: &ImageViewDesc) -> DeviceResult<ImageViewHandle>;

    fn create_sampler(&self, desc: &SamplerDesc) -> DeviceResult<SamplerHandle>;

    fn create_render_pass(&self, desc: &RenderPassDesc) -> DeviceResult<RenderPassHandle>;

    fn create_framebuffer(&self, desc: &FramebufferDesc) -> DeviceResult<FramebufferHandle>;

    fn create_descriptor_set_layout(
        &self,
        bindings: &[DescriptorBinding],
    ) -> DeviceResult<DescriptorSetLayoutHandle>;

    fn create_pipeline_layout(
        &self,
        desc: &PipelineLayoutDesc,
    ) -> DeviceResult<PipelineLayoutHandle>;

    fn create_graphics_pipeline(
        &self,
        desc: &GraphicsPipelineDesc,
    ) -> DeviceResult<PipelineHandle>;

    fn create_descriptor_pool(
        &self,
        desc: &DescriptorPoolDesc,
    ) -> DeviceResult<DescriptorPoolHandle>;

    /// Sets are released together with their pool.
    fn allocate_descriptor_set(
        &self,
        pool: DescriptorPoolHandle,
        layout: DescriptorSetLayoutHandle,
    ) -> DeviceResult<DescriptorSetHandle>;

    fn write_image_descriptor(
        &self,
        set: DescriptorSetHandle,
        binding: u32,
        descriptor: ImageDescriptor,
    ) -> DeviceResult<()>;

    fn create_command_pool(&self, queue: &QueueInfo) -> DeviceResult<CommandPoolHandle>;

    fn allocate_command_buffer(&self, pool: CommandPoolHandle)
    -> DeviceResult<CommandBufferHandle>;

    fn begin_command_buffer(&self, buffer: CommandBufferHandle) -> DeviceResult<()>;

    /// Finishes recording; `commands` becomes the buffer's contents.
    fn end_command_buffer(
        &self,
        buffer: CommandBufferHandle,
        commands: CommandList,
    ) -> DeviceResult<()>;

    fn create_fence(&self, signaled: bool) -> DeviceResult<FenceHandle>;

    /// Submits with no wait or signal semaphores.
    fn submit(
        &self,
        queue: &QueueInfo,
        buffer: CommandBufferHandle,
        fence: Option<FenceHandle>,
    ) -> DeviceResult<()>;

    /// `None` waits forever.
    fn wait_for_fence(&self, fence: FenceHandle, timeout: Option<Duration>) -> DeviceResult<()>;

    fn queue_wait_idle(&self, queue: &QueueInfo) -> DeviceResult<()>;

    /// Uploads RGBA texels into one subresource and leaves it shader-readable.
    fn write_image(
        &self,
        image: ImageHandle,
        layer: u32,
        mip_level: u32,
        texels: &[[f32; 4]],
    ) -> DeviceResult<()>;

    /// Downloads one subresource as RGBA f32 texels, row-major.
    fn read_image(
        &self,
        image: ImageHandle,
        layer: u32,
        mip_level: u32,
    ) -> DeviceResult<Vec<[f32; 4]>>;

    fn destroy(&self, kind: ObjectKind, raw: u64);
}

/// A device object released when dropped.
pub struct Owned<H: DeviceObject> {
    handle: H,
    device: Arc<dyn GpuDevice>,
}

impl<H: DeviceObject> Owned<H> {
    pub fn new(device: &Arc<dyn GpuDevice>, handle: H) -> Self {
        Self {
            handle,
            device: Arc::clone(device),
        }
    }

    pub fn handle(&self) -> H {
        self.handle
    }
}

impl<H: DeviceObject> Drop for Owned<H> {
    fn drop(&mut self) {
        self.device.destroy(H::KIND, self.handle.raw());
    }
}

impl<H: DeviceObject> fmt::Debug for Owned<H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Owned").field(&self.handle).finish()
    }
}
