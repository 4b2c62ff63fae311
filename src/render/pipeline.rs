use std::{collections::HashMap, sync::Arc};

use bytemuck::{Pod, Zeroable};
use glam::Mat4;

use crate::{
    config::IblSettings,
    error::{Creating, IblResult},
    gpu::{
        ConvolutionProgram, DescriptorBinding, DescriptorSetLayoutHandle, DescriptorType, Format,
        GpuDevice, GraphicsPipelineDesc, ObjectKind, Owned, PipelineHandle, PipelineLayoutDesc,
        PipelineLayoutHandle, PushConstantRange, RenderPassDesc, RenderPassHandle, ShaderStages,
    },
    model::Vertex,
};

/// Well-known convolution pipelines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PipelineId {
    IrradianceMap,
    PrefilteredMap,
}

impl PipelineId {
    pub const ALL: [PipelineId; 2] = [PipelineId::IrradianceMap, PipelineId::PrefilteredMap];

    pub fn label(self) -> &'static str {
        match self {
            PipelineId::IrradianceMap => "irradiance_map",
            PipelineId::PrefilteredMap => "prefiltered_map",
        }
    }

    fn program(self, settings: &IblSettings) -> ConvolutionProgram {
        match self {
            PipelineId::IrradianceMap => ConvolutionProgram::Irradiance {
                sample_delta: settings.irradiance_sample_delta,
            },
            PipelineId::PrefilteredMap => ConvolutionProgram::Prefilter {
                sample_count: settings.prefilter_sample_count,
            },
        }
    }
}

/// A push-constant block with a fixed place in the pipeline layout.
pub trait PushConstant: Pod {
    const OFFSET: u32;
    const STAGES: ShaderStages;

    fn range() -> PushConstantRange {
        PushConstantRange {
            stages: Self::STAGES,
            range: Self::OFFSET..Self::OFFSET + std::mem::size_of::<Self>() as u32,
        }
    }

    fn bytes(&self) -> &[u8] {
        bytemuck::bytes_of(self)
    }
}

#[repr(C)]
#[derive(Debug, Copy, Clone, Pod, Zeroable)]
pub struct FaceTransform {
    pub view_proj: [[f32; 4]; 4],
}

impl FaceTransform {
    pub fn new(view_proj: Mat4) -> Self {
        Self {
            view_proj: view_proj.to_cols_array_2d(),
        }
    }
}

impl PushConstant for FaceTransform {
    const OFFSET: u32 = 0;
    const STAGES: ShaderStages = ShaderStages::VERTEX;
}

/// Directly follows [`FaceTransform`].
#[repr(C)]
#[derive(Debug, Copy, Clone, Pod, Zeroable)]
pub struct PrefilterRoughness {
    pub roughness: f32,
}

impl PushConstant for PrefilterRoughness {
    const OFFSET: u32 = std::mem::size_of::<FaceTransform>() as u32;
    const STAGES: ShaderStages = ShaderStages::FRAGMENT;
}

pub struct PipelineLayout {
    layout: Owned<PipelineLayoutHandle>,
    set_layouts: Vec<Owned<DescriptorSetLayoutHandle>>,
    push_constant_ranges: Vec<PushConstantRange>,
}

impl PipelineLayout {
    pub fn handle(&self) -> PipelineLayoutHandle {
        self.layout.handle()
    }

    pub fn set_layout(&self, index: usize) -> Option<DescriptorSetLayoutHandle> {
        self.set_layouts.get(index).map(Owned::handle)
    }

    pub fn push_constant_ranges(&self) -> &[PushConstantRange] {
        &self.push_constant_ranges
    }
}

/// A convolution pipeline together with its render pass and layout.
pub struct Pipeline {
    id: PipelineId,
    color_format: Format,
    program: ConvolutionProgram,
    pipeline: Owned<PipelineHandle>,
    layout: PipelineLayout,
    render_pass: Owned<RenderPassHandle>,
}

impl Pipeline {
    pub fn create(
        device: &Arc<dyn GpuDevice>,
        id: PipelineId,
        color_format: Format,
        settings: &IblSettings,
    ) -> IblResult<Self> {
        let render_pass = device
            .create_render_pass(&RenderPassDesc {
                color_format,
                clear_on_load: true,
            })
            .creating(ObjectKind::RenderPass)?;
        let render_pass = Owned::new(device, render_pass);

        let set_layout = device
            .create_descriptor_set_layout(&[DescriptorBinding {
                binding: 0,
                ty: DescriptorType::CombinedImageSampler,
                stages: ShaderStages::FRAGMENT,
            }])
            .creating(ObjectKind::DescriptorSetLayout)?;
        let set_layouts = vec![Owned::new(device, set_layout)];

        let mut push_constant_ranges = vec![FaceTransform::range()];
        if id == PipelineId::PrefilteredMap {
            push_constant_ranges.push(PrefilterRoughness::range());
        }
        let layout = device
            .create_pipeline_layout(&PipelineLayoutDesc {
                set_layouts: set_layouts.iter().map(Owned::handle).collect(),
                push_constant_ranges: push_constant_ranges.clone(),
            })
            .creating(ObjectKind::PipelineLayout)?;
        let layout = PipelineLayout {
            layout: Owned::new(device, layout),
            set_layouts,
            push_constant_ranges,
        };

        let program = id.program(settings);
        let pipeline = device
            .create_graphics_pipeline(&GraphicsPipelineDesc {
                label: format!("{}_pipeline", id.label()),
                render_pass: render_pass.handle(),
                layout: layout.handle(),
                program,
                vertex_stride: Vertex::STRIDE,
            })
            .creating(ObjectKind::Pipeline)?;

        Ok(Self {
            id,
            color_format,
            program,
            pipeline: Owned::new(device, pipeline),
            layout,
            render_pass,
        })
    }

    pub fn id(&self) -> PipelineId {
        self.id
    }

    pub fn color_format(&self) -> Format {
        self.color_format
    }

    pub fn program(&self) -> ConvolutionProgram {
        self.program
    }

    pub fn handle(&self) -> PipelineHandle {
        self.pipeline.handle()
    }

    pub fn layout(&self) -> &PipelineLayout {
        &self.layout
    }

    pub fn render_pass(&self) -> RenderPassHandle {
        self.render_pass.handle()
    }
}

/// Shared pipelines by id.
#[derive(Default)]
pub struct PipelineRegistry {
    pipelines: HashMap<PipelineId, Arc<Pipeline>>,
}

impl PipelineRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the pipeline previously registered under the same id.
    pub fn register(&mut self, pipeline: Pipeline) -> Option<Arc<Pipeline>> {
        self.pipelines.insert(pipeline.id(), Arc::new(pipeline))
    }

    pub fn get(&self, id: PipelineId) -> Option<Arc<Pipeline>> {
        self.pipelines.get(&id).cloned()
    }

    pub fn remove(&mut self, id: PipelineId) -> Option<Arc<Pipeline>> {
        self.pipelines.remove(&id)
    }

    pub fn len(&self) -> usize {
        self.pipelines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pipelines.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::HeadlessDevice;

    #[test]
    fn roughness_follows_the_matrix() {
        assert_eq!(std::mem::size_of::<FaceTransform>(), 64);
        assert_eq!(FaceTransform::range().range, 0..64);
        assert_eq!(PrefilterRoughness::range().range, 64..68);
        assert_eq!(PrefilterRoughness::range().stages, ShaderStages::FRAGMENT);
    }

    #[test]
    fn only_the_prefilter_layout_pushes_roughness() {
        let device: Arc<dyn GpuDevice> = Arc::new(HeadlessDevice::new());
        let settings = IblSettings::default();
        let irradiance =
            Pipeline::create(&device, PipelineId::IrradianceMap, Format::Rgba16Float, &settings)
                .unwrap();
        let prefilter =
            Pipeline::create(&device, PipelineId::PrefilteredMap, Format::Rgba16Float, &settings)
                .unwrap();
        assert_eq!(irradiance.layout().push_constant_ranges().len(), 1);
        assert_eq!(prefilter.layout().push_constant_ranges().len(), 2);
        assert!(irradiance.layout().set_layout(0).is_some());
        assert!(irradiance.layout().set_layout(1).is_none());
        assert_eq!(
            prefilter.program(),
            ConvolutionProgram::Prefilter { sample_count: 1024 }
        );
    }

    #[test]
    fn registry_forgets_removed_pipelines() {
        let headless = Arc::new(HeadlessDevice::new());
        let device: Arc<dyn GpuDevice> = headless.clone();
        let mut registry = PipelineRegistry::new();
        let pipeline = Pipeline::create(
            &device,
            PipelineId::IrradianceMap,
            Format::Rgba16Float,
            &IblSettings::default(),
        )
        .unwrap();
        assert!(registry.register(pipeline).is_none());
        assert!(registry.get(PipelineId::IrradianceMap).is_some());
        assert!(registry.get(PipelineId::PrefilteredMap).is_none());

        assert!(registry.remove(PipelineId::IrradianceMap).is_some());
        assert!(registry.is_empty());
        // Dropping the last handle releases every object the pipeline made.
        assert_eq!(headless.live_total(), 0);
    }
}
