use bitflags::bitflags;

use super::{
    BufferHandle, DescriptorSetHandle, Extent2d, FramebufferHandle, ImageBarrier, ImageHandle,
    ImageLayout, PipelineHandle, PipelineLayoutHandle, RenderPassHandle,
};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ShaderStages: u32 {
        const VERTEX = 1 << 0;
        const FRAGMENT = 1 << 1;
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Viewport {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub min_depth: f32,
    pub max_depth: f32,
}

impl Viewport {
    pub fn new(width: f32, height: f32) -> Self {
        Self {
            x: 0.0,
            y: 0.0,
            width,
            height,
            min_depth: 0.0,
            max_depth: 1.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rect2d {
    pub x: i32,
    pub y: i32,
    pub extent: Extent2d,
}

impl Rect2d {
    pub fn from_extent(extent: Extent2d) -> Self {
        Self { x: 0, y: 0, extent }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ClearValue {
    Color([f32; 4]),
    DepthStencil { depth: f32, stencil: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexType {
    U16,
    U32,
}

impl IndexType {
    pub fn size(self) -> u64 {
        match self {
            IndexType::U16 => 2,
            IndexType::U32 => 4,
        }
    }
}

/// One mip level of a run of array layers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Subresource {
    pub mip_level: u32,
    pub base_layer: u32,
    pub layer_count: u32,
}

impl Subresource {
    pub fn layer(layer: u32, mip_level: u32) -> Self {
        Self {
            mip_level,
            base_layer: layer,
            layer_count: 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageCopy {
    pub src: Subresource,
    pub dst: Subresource,
    pub extent: Extent2d,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    BindPipeline(PipelineHandle),
    BindDescriptorSets {
        layout: PipelineLayoutHandle,
        first_set: u32,
        sets: Vec<DescriptorSetHandle>,
    },
    BindVertexBuffer {
        binding: u32,
        buffer: BufferHandle,
        offset: u64,
    },
    BindIndexBuffer {
        buffer: BufferHandle,
        offset: u64,
        index_type: IndexType,
    },
    PipelineBarrier(ImageBarrier),
    BeginRenderPass {
        render_pass: RenderPassHandle,
        framebuffer: FramebufferHandle,
        area: Rect2d,
        clear_values: Vec<ClearValue>,
    },
    SetViewport(Viewport),
    SetScissor(Rect2d),
    PushConstants {
        layout: PipelineLayoutHandle,
        stages: ShaderStages,
        offset: u32,
        data: Vec<u8>,
    },
    DrawIndexed {
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        vertex_offset: i32,
        first_instance: u32,
    },
    EndRenderPass,
    CopyImage {
        src: ImageHandle,
        src_layout: ImageLayout,
        dst: ImageHandle,
        dst_layout: ImageLayout,
        regions: Vec<ImageCopy>,
    },
}

/// Commands recorded on the host, in submission order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommandList {
    commands: Vec<Command>,
}

impl CommandList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, command: Command) {
        self.commands.push(command);
    }

    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    pub fn bind_pipeline(&mut self, pipeline: PipelineHandle) {
        self.push(Command::BindPipeline(pipeline));
    }

    pub fn bind_descriptor_sets(
        &mut self,
        layout: PipelineLayoutHandle,
        first_set: u32,
        sets: &[DescriptorSetHandle],
    ) {
        self.push(Command::BindDescriptorSets {
            layout,
            first_set,
            sets: sets.to_vec(),
        });
    }

    pub fn bind_vertex_buffer(&mut self, binding: u32, buffer: BufferHandle) {
        self.push(Command::BindVertexBuffer {
            binding,
            buffer,
            offset: 0,
        });
    }

    pub fn bind_index_buffer(&mut self, buffer: BufferHandle, index_type: IndexType) {
        self.push(Command::BindIndexBuffer {
            buffer,
            offset: 0,
            index_type,
        });
    }

    pub fn pipeline_barrier(&mut self, barrier: ImageBarrier) {
        self.push(Command::PipelineBarrier(barrier));
    }

    pub fn begin_render_pass(
        &mut self,
        render_pass: RenderPassHandle,
        framebuffer: FramebufferHandle,
        area: Rect2d,
        clear_values: &[ClearValue],
    ) {
        self.push(Command::BeginRenderPass {
            render_pass,
            framebuffer,
            area,
            clear_values: clear_values.to_vec(),
        });
    }

    pub fn set_viewport(&mut self, viewport: Viewport) {
        self.push(Command::SetViewport(viewport));
    }

    pub fn set_scissor(&mut self, scissor: Rect2d) {
        self.push(Command::SetScissor(scissor));
    }

    pub fn push_constants(
        &mut self,
        layout: PipelineLayoutHandle,
        stages: ShaderStages,
        offset: u32,
        data: &[u8],
    ) {
        self.push(Command::PushConstants {
            layout,
            stages,
            offset,
            data: data.to_vec(),
        });
    }

    pub fn draw_indexed(&mut self, index_count: u32, instance_count: u32) {
        self.push(Command::DrawIndexed {
            index_count,
            instance_count,
            first_index: 0,
            vertex_offset: 0,
            first_instance: 0,
        });
    }

    pub fn end_render_pass(&mut self) {
        self.push(Command::EndRenderPass);
    }

    pub fn copy_image(
        &mut self,
        src: ImageHandle,
        dst: ImageHandle,
        regions: &[ImageCopy],
    ) {
        self.push(Command::CopyImage {
            src,
            src_layout: ImageLayout::TransferSrc,
            dst,
            dst_layout: ImageLayout::TransferDst,
            regions: regions.to_vec(),
        });
    }
}
