use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

use crate::{
    config::IblSettings,
    error::{Creating, IblResult},
    gpu::{BufferHandle, BufferUsage, Format, GpuDevice, IndexType, ObjectKind, Owned},
    model::CubeMesh,
    render::{
        brdf_lut::BrdfLut,
        environment::{Environment, LiveToken},
        pipeline::{Pipeline, PipelineId, PipelineRegistry},
        resources::ResourceManager,
        texture::{CubeFaces, Texture},
    },
};

/// The cube mesh's primitive set on the device.
pub struct MeshBuffers {
    vertices: Owned<BufferHandle>,
    indices: Owned<BufferHandle>,
    index_count: u32,
}

impl MeshBuffers {
    fn upload(device: &Arc<dyn GpuDevice>, mesh: &CubeMesh) -> IblResult<Self> {
        let set = mesh.primitive_set();
        let vertices = device
            .create_buffer(
                "cube_vertices",
                BufferUsage::VERTEX,
                bytemuck::cast_slice(&set.positions),
            )
            .creating(ObjectKind::Buffer)?;
        let vertices = Owned::new(device, vertices);
        let indices = device
            .create_buffer(
                "cube_indices",
                BufferUsage::INDEX,
                bytemuck::cast_slice(&set.indices),
            )
            .creating(ObjectKind::Buffer)?;
        Ok(Self {
            vertices,
            indices: Owned::new(device, indices),
            index_count: set.index_count(),
        })
    }

    pub fn vertex_buffer(&self) -> BufferHandle {
        self.vertices.handle()
    }

    pub fn index_buffer(&self) -> BufferHandle {
        self.indices.handle()
    }

    pub fn index_type(&self) -> IndexType {
        IndexType::U16
    }

    pub fn index_count(&self) -> u32 {
        self.index_count
    }
}

/// Device, pipelines and shared resources used by every bake.
///
/// Built once, torn down once when dropped. Fields drop top to bottom, so
/// everything holding device objects goes before the device handle.
pub struct RenderContext {
    settings: IblSettings,
    resources: ResourceManager,
    pipelines: PipelineRegistry,
    cube_mesh: MeshBuffers,
    brdf_lut: Arc<Texture>,
    live_environments: Arc<AtomicUsize>,
    device: Arc<dyn GpuDevice>,
}

impl RenderContext {
    pub fn new(device: Arc<dyn GpuDevice>, settings: IblSettings) -> IblResult<Self> {
        let mut pipelines = PipelineRegistry::new();
        for id in PipelineId::ALL {
            pipelines.register(Pipeline::create(&device, id, settings.format, &settings)?);
        }
        let cube_mesh = MeshBuffers::upload(&device, &CubeMesh::unit())?;

        let start = std::time::Instant::now();
        let brdf_lut = BrdfLut::compute(settings.brdf_lut_size, settings.brdf_sample_count)
            .upload(&device, Format::Rgba16Float)?;
        log::info!(
            "Integrated {0}x{0} BRDF LUT in {1:.2?}",
            settings.brdf_lut_size,
            start.elapsed()
        );

        Ok(Self {
            settings,
            resources: ResourceManager::new(),
            pipelines,
            cube_mesh,
            brdf_lut: Arc::new(brdf_lut),
            live_environments: Arc::new(AtomicUsize::new(0)),
            device,
        })
    }

    pub fn device(&self) -> &Arc<dyn GpuDevice> {
        &self.device
    }

    pub fn settings(&self) -> &IblSettings {
        &self.settings
    }

    pub fn resources(&self) -> &ResourceManager {
        &self.resources
    }

    pub fn pipelines(&self) -> &PipelineRegistry {
        &self.pipelines
    }

    pub fn pipelines_mut(&mut self) -> &mut PipelineRegistry {
        &mut self.pipelines
    }

    pub fn cube_mesh(&self) -> &MeshBuffers {
        &self.cube_mesh
    }

    pub fn brdf_lut(&self) -> &Arc<Texture> {
        &self.brdf_lut
    }

    /// Environments currently alive, registered or not.
    pub fn live_environments(&self) -> usize {
        self.live_environments.load(Ordering::SeqCst)
    }

    /// Registers an environment wrapping `texture`.
    pub fn environment(&self, name: &str, texture: Option<Arc<Texture>>) -> Arc<Environment> {
        let token = LiveToken::new(&self.live_environments);
        self.resources
            .add(Environment::new(name.to_owned(), texture, token))
    }

    /// Uploads `faces` as a source cube and registers it under `name`.
    pub fn load_environment(&self, name: &str, faces: &CubeFaces) -> IblResult<Arc<Environment>> {
        let texture = Texture::from_cube_faces(&self.device, faces, self.settings.format, name)?;
        Ok(self.environment(name, Some(Arc::new(texture))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::HeadlessDevice;

    fn settings() -> IblSettings {
        IblSettings {
            brdf_lut_size: 4,
            brdf_sample_count: 16,
            ..IblSettings::default()
        }
    }

    #[test]
    fn context_owns_its_shared_objects_once() {
        let headless = Arc::new(HeadlessDevice::new());
        let context = RenderContext::new(headless.clone(), settings()).unwrap();
        assert_eq!(context.pipelines().len(), 2);
        assert_eq!(context.cube_mesh().index_count(), 36);
        assert_eq!(context.brdf_lut().extent().width, 4);
        assert_eq!(headless.live_count(ObjectKind::Buffer), 2);
        assert_eq!(headless.live_count(ObjectKind::Pipeline), 2);

        drop(context);
        assert_eq!(headless.live_total(), 0);
        assert_eq!(headless.invalid_destroys(), 0);
    }

    #[test]
    fn environments_count_while_alive() {
        let context = RenderContext::new(Arc::new(HeadlessDevice::new()), settings()).unwrap();
        let env = context.environment("empty", None);
        assert_eq!(context.live_environments(), 1);
        drop(env);
        // The resource manager still holds it.
        assert_eq!(context.live_environments(), 1);
        context.resources().clear();
        assert_eq!(context.live_environments(), 0);
    }

    #[test]
    fn failed_init_releases_what_was_built() {
        let headless = Arc::new(HeadlessDevice::new());
        headless.fail_after(
            crate::gpu::headless::FailurePoint::Create(ObjectKind::Buffer),
            1,
            crate::gpu::DeviceError::OutOfDeviceMemory,
        );
        assert!(RenderContext::new(headless.clone(), settings()).is_err());
        assert_eq!(headless.live_total(), 0);
    }
}
