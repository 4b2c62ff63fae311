use std::sync::Arc;

use crate::{
    error::{Creating, IblError, IblResult},
    gpu::{
        DescriptorPoolDesc, DescriptorPoolHandle, DescriptorSetHandle, DescriptorType, GpuDevice,
        ImageDescriptor, ImageLayout, ObjectKind, Owned,
    },
    render::{pipeline::Pipeline, texture::Texture},
};

/// Sets the source pool can hand out.
pub const POOL_CAPACITY: u32 = 42;

/// The source cube bound as the pipeline's only sampled input.
pub struct SourceBinding {
    set: Owned<DescriptorSetHandle>,
    pool: Owned<DescriptorPoolHandle>,
}

impl SourceBinding {
    pub fn new(
        device: &Arc<dyn GpuDevice>,
        pipeline: &Pipeline,
        source: &Texture,
    ) -> IblResult<Self> {
        let pool = device
            .create_descriptor_pool(&DescriptorPoolDesc {
                max_sets: POOL_CAPACITY,
                pool_sizes: vec![(DescriptorType::CombinedImageSampler, POOL_CAPACITY)],
            })
            .creating(ObjectKind::DescriptorPool)?;
        let pool = Owned::new(device, pool);

        let layout = pipeline
            .layout()
            .set_layout(0)
            .ok_or(IblError::MissingPipeline(pipeline.id()))?;
        let set = device
            .allocate_descriptor_set(pool.handle(), layout)
            .creating(ObjectKind::DescriptorSet)?;
        let set = Owned::new(device, set);

        device
            .write_image_descriptor(
                set.handle(),
                0,
                ImageDescriptor {
                    sampler: source.sampler(),
                    view: source.view(),
                    layout: ImageLayout::ShaderReadOnly,
                },
            )
            .creating(ObjectKind::DescriptorSet)?;

        Ok(Self { set, pool })
    }

    pub fn set(&self) -> DescriptorSetHandle {
        self.set.handle()
    }

    pub fn pool(&self) -> DescriptorPoolHandle {
        self.pool.handle()
    }
}
