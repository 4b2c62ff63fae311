use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Instant,
};

use parking_lot::Mutex;

use crate::{
    error::{IblError, IblResult},
    render::{
        context::RenderContext,
        convolution::{self, ConvolutionPass},
        resources::Resource,
        texture::Texture,
    },
};

/// Counts one live [`Environment`] until dropped.
#[derive(Debug)]
pub struct LiveToken(Arc<AtomicUsize>);

impl LiveToken {
    pub(crate) fn new(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(Arc::clone(counter))
    }
}

impl Drop for LiveToken {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// A radiance source for ambient lighting and its derived maps.
///
/// Derived maps are environments themselves, holding only their cube.
#[derive(Debug)]
pub struct Environment {
    name: String,
    environment_texture: Option<Arc<Texture>>,
    irradiance_map: Mutex<Option<Arc<Environment>>>,
    prefiltered_map: Mutex<Option<Arc<Environment>>>,
    _live: LiveToken,
}

impl Environment {
    pub(crate) fn new(name: String, texture: Option<Arc<Texture>>, live: LiveToken) -> Self {
        Self {
            name,
            environment_texture: texture,
            irradiance_map: Mutex::new(None),
            prefiltered_map: Mutex::new(None),
            _live: live,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn environment_texture(&self) -> Option<&Arc<Texture>> {
        self.environment_texture.as_ref()
    }

    pub fn irradiance_map(&self) -> Option<Arc<Environment>> {
        self.irradiance_map.lock().clone()
    }

    pub fn prefiltered_map(&self) -> Option<Arc<Environment>> {
        self.prefiltered_map.lock().clone()
    }

    pub fn set_irradiance_map(&self, map: Arc<Environment>) {
        *self.irradiance_map.lock() = Some(map);
    }

    pub fn set_prefiltered_map(&self, map: Arc<Environment>) {
        *self.prefiltered_map.lock() = Some(map);
    }
}

impl Resource for Environment {
    fn name(&self) -> &str {
        &self.name
    }
}

impl RenderContext {
    /// Convolves `environment` into a `resolution`-sized diffuse irradiance cube.
    pub fn create_irradiance_map(
        &self,
        environment: &Environment,
        resolution: u32,
    ) -> IblResult<Arc<Environment>> {
        let (name, texture) = self.derive(environment, &ConvolutionPass::irradiance(resolution))?;
        Ok(self.environment(&name, Some(Arc::new(texture))))
    }

    /// Prefilters `environment` into a mip-chained specular cube, roughness
    /// rising from 0 at mip 0 to 1 at the last mip.
    pub fn create_prefiltered_map(
        &self,
        environment: &Environment,
        resolution: u32,
    ) -> IblResult<Arc<Environment>> {
        let (name, texture) =
            self.derive(environment, &ConvolutionPass::prefiltered(resolution))?;
        Ok(self.environment(&name, Some(Arc::new(texture))))
    }

    pub fn create_irradiance_map_default(
        &self,
        environment: &Environment,
    ) -> IblResult<Arc<Environment>> {
        self.create_irradiance_map(environment, self.settings().irradiance_resolution)
    }

    pub fn create_prefiltered_map_default(
        &self,
        environment: &Environment,
    ) -> IblResult<Arc<Environment>> {
        self.create_prefiltered_map(environment, self.settings().prefilter_resolution)
    }

    /// Creates both derived maps, registers them and attaches them to
    /// `environment`.
    ///
    /// Nothing is registered or attached unless both succeed.
    pub fn bake(&self, environment: &Environment) -> IblResult<()> {
        let settings = self.settings();
        let (irradiance_name, irradiance) = self.derive(
            environment,
            &ConvolutionPass::irradiance(settings.irradiance_resolution),
        )?;
        let (prefiltered_name, prefiltered) = self.derive(
            environment,
            &ConvolutionPass::prefiltered(settings.prefilter_resolution),
        )?;
        let irradiance = self.environment(&irradiance_name, Some(Arc::new(irradiance)));
        let prefiltered = self.environment(&prefiltered_name, Some(Arc::new(prefiltered)));
        environment.set_irradiance_map(irradiance);
        environment.set_prefiltered_map(prefiltered);
        Ok(())
    }

    /// Bakes one derived cube without registering it.
    fn derive(
        &self,
        environment: &Environment,
        pass: &ConvolutionPass,
    ) -> IblResult<(String, Texture)> {
        self.convolve(environment, pass).inspect_err(|e| {
            log::error!(
                "Can't create the {} of `{}`: {e}",
                pass.pipeline.label().replace('_', " "),
                environment.name()
            )
        })
    }

    fn convolve(
        &self,
        environment: &Environment,
        pass: &ConvolutionPass,
    ) -> IblResult<(String, Texture)> {
        let pipeline = self
            .pipelines()
            .get(pass.pipeline)
            .ok_or(IblError::MissingPipeline(pass.pipeline))?;
        let source = environment
            .environment_texture()
            .ok_or_else(|| IblError::MissingEnvironmentTexture(environment.name().to_owned()))?;

        let start = Instant::now();
        let name = pass.derived_name(environment.name());
        let texture = convolution::run(self, &pipeline, source, pass, &name)?;
        log::info!(
            "🌅 Baked `{name}`: {0}x{0}, {1} mips in {2:.2?}",
            pass.resolution,
            texture.mip_levels(),
            start.elapsed()
        );
        Ok((name, texture))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::IblSettings,
        gpu::HeadlessDevice,
        render::{pipeline::PipelineId, texture::CubeFaces},
    };

    fn context(headless: &Arc<HeadlessDevice>) -> RenderContext {
        let settings = IblSettings {
            irradiance_resolution: 4,
            prefilter_resolution: 4,
            irradiance_sample_delta: 0.3,
            prefilter_sample_count: 8,
            brdf_lut_size: 4,
            brdf_sample_count: 8,
            ..IblSettings::default()
        };
        RenderContext::new(headless.clone(), settings).unwrap()
    }

    #[test]
    fn missing_texture_builds_nothing() {
        let headless = Arc::new(HeadlessDevice::new());
        let ctx = context(&headless);
        let env = ctx.environment("void", None);
        let before = headless.created_total();

        let err = ctx.create_irradiance_map(&env, 4).unwrap_err();
        assert_eq!(err, IblError::MissingEnvironmentTexture("void".into()));
        assert!(ctx.create_prefiltered_map(&env, 4).is_err());
        assert_eq!(headless.created_total(), before);
    }

    #[test]
    fn missing_pipeline_is_checked_first() {
        let headless = Arc::new(HeadlessDevice::new());
        let mut ctx = context(&headless);
        ctx.pipelines_mut().remove(PipelineId::PrefilteredMap);
        let env = ctx
            .load_environment("sky", &CubeFaces::uniform(2, [1.0, 1.0, 1.0]))
            .unwrap();
        let before = headless.created_total();

        let err = ctx.create_prefiltered_map(&env, 4).unwrap_err();
        assert_eq!(err, IblError::MissingPipeline(PipelineId::PrefilteredMap));
        assert_eq!(headless.created_total(), before);
    }

    #[test]
    fn bake_attaches_both_maps() {
        let headless = Arc::new(HeadlessDevice::new());
        let ctx = context(&headless);
        let env = ctx
            .load_environment("sky", &CubeFaces::uniform(2, [0.5, 0.5, 0.5]))
            .unwrap();
        ctx.bake(&env).unwrap();

        let irradiance = env.irradiance_map().unwrap();
        let prefiltered = env.prefiltered_map().unwrap();
        assert_eq!(irradiance.name(), "sky_irradiance_map");
        assert_eq!(prefiltered.name(), "sky_prefiltered_map");
        assert!(irradiance.irradiance_map().is_none());
        assert_eq!(
            prefiltered.environment_texture().unwrap().mip_levels(),
            3
        );
        assert_eq!(ctx.live_environments(), 3);
    }

    #[test]
    fn failed_bake_registers_neither_map() {
        let headless = Arc::new(HeadlessDevice::new());
        let ctx = context(&headless);
        let env = ctx
            .load_environment("sky", &CubeFaces::uniform(2, [0.5, 0.5, 0.5]))
            .unwrap();
        // The irradiance bake submits first, so this fails the prefilter bake.
        headless.fail_after(
            crate::gpu::headless::FailurePoint::Submit,
            1,
            crate::gpu::DeviceError::DeviceLost,
        );

        assert!(ctx.bake(&env).is_err());
        assert_eq!(ctx.resources().count::<Environment>("sky_irradiance_map"), 0);
        assert_eq!(ctx.resources().count::<Environment>("sky_prefiltered_map"), 0);
        assert_eq!(ctx.resources().len(), 1);
        assert_eq!(ctx.live_environments(), 1);
        assert!(env.irradiance_map().is_none());
    }
}
