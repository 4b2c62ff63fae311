use std::sync::Arc;

use crate::{
    error::{Creating, IblResult},
    gpu::{
        Extent2d, FramebufferDesc, FramebufferHandle, GpuDevice, ImageDesc, ImageHandle,
        ImageUsage, ImageViewDesc, ImageViewHandle, MemoryHandle, MemoryLocation, ObjectKind,
        Owned, SubresourceRange, ViewDimension,
    },
    render::pipeline::Pipeline,
};

/// The single color target every face and mip is rendered into.
///
/// Always sized to the base resolution; lower mips only shrink the viewport.
pub struct OffscreenTarget {
    framebuffer: Owned<FramebufferHandle>,
    view: Owned<ImageViewHandle>,
    image: Owned<ImageHandle>,
    memory: Owned<MemoryHandle>,
    extent: Extent2d,
}

impl OffscreenTarget {
    /// Builds image, memory, view and framebuffer, in that order.
    pub fn new(
        device: &Arc<dyn GpuDevice>,
        pipeline: &Pipeline,
        resolution: u32,
    ) -> IblResult<Self> {
        let extent = Extent2d::square(resolution);
        let format = pipeline.color_format();

        let image = device
            .create_image(&ImageDesc {
                label: "offscreen_target".to_owned(),
                extent,
                format,
                mip_levels: 1,
                array_layers: 1,
                usage: ImageUsage::COLOR_ATTACHMENT | ImageUsage::TRANSFER_SRC,
                cube_compatible: false,
            })
            .creating(ObjectKind::Image)?;
        let image = Owned::new(device, image);

        let memory = device
            .allocate_image_memory(&[image.handle()], MemoryLocation::DeviceLocal)
            .creating(ObjectKind::Memory)?;
        let memory = Owned::new(device, memory);

        let view = device
            .create_image_view(&ImageViewDesc {
                image: image.handle(),
                dimension: ViewDimension::D2,
                format,
                range: SubresourceRange::whole(1, 1),
            })
            .creating(ObjectKind::ImageView)?;
        let view = Owned::new(device, view);

        let framebuffer = device
            .create_framebuffer(&FramebufferDesc {
                render_pass: pipeline.render_pass(),
                attachments: vec![view.handle()],
                extent,
            })
            .creating(ObjectKind::Framebuffer)?;

        log::debug!(
            "Offscreen target {}x{} {format:?} for {}",
            extent.width,
            extent.height,
            pipeline.id().label()
        );
        Ok(Self {
            framebuffer: Owned::new(device, framebuffer),
            view,
            image,
            memory,
            extent,
        })
    }

    pub fn framebuffer(&self) -> FramebufferHandle {
        self.framebuffer.handle()
    }

    pub fn view(&self) -> ImageViewHandle {
        self.view.handle()
    }

    pub fn image(&self) -> ImageHandle {
        self.image.handle()
    }

    pub fn memory(&self) -> MemoryHandle {
        self.memory.handle()
    }

    pub fn extent(&self) -> Extent2d {
        self.extent
    }
}
