//! Offscreen cube convolution shared by both derived maps.
//!
//! One call builds the destination cube, a command pool and fence, the source
//! binding and an offscreen target, records every (mip, face) render and copy
//! into a single command buffer, submits it and waits. Transients are owned
//! by the call and released in reverse order on every exit path.

pub mod binding;
pub mod offscreen;
pub mod recorder;
pub mod sync;

use crate::{
    error::{IblError, IblResult},
    render::{
        context::RenderContext,
        pipeline::{Pipeline, PipelineId},
        texture::{Texture, TextureBuilder, TextureKind, mip_count_for},
    },
};

use self::{
    binding::SourceBinding, offscreen::OffscreenTarget, recorder::ConvolutionRecorder,
    sync::SyncGate,
};

/// What differs between the irradiance and prefilter bakes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConvolutionPass {
    pub pipeline: PipelineId,
    pub resolution: u32,
    pub mip_levels: u32,
    pub suffix: &'static str,
}

impl ConvolutionPass {
    pub fn irradiance(resolution: u32) -> Self {
        Self {
            pipeline: PipelineId::IrradianceMap,
            resolution,
            mip_levels: 1,
            suffix: "_irradiance_map",
        }
    }

    pub fn prefiltered(resolution: u32) -> Self {
        Self {
            pipeline: PipelineId::PrefilteredMap,
            resolution,
            mip_levels: mip_count_for(resolution),
            suffix: "_prefiltered_map",
        }
    }

    /// Only the prefilter program reads a roughness constant.
    pub fn pushes_roughness(&self) -> bool {
        self.pipeline == PipelineId::PrefilteredMap
    }

    pub fn derived_name(&self, source: &str) -> String {
        format!("{source}{}", self.suffix)
    }
}

/// Viewport edge length for mip `mip` of a `base`-texel cube.
pub fn mip_viewport(base: u32, mip: u32) -> f32 {
    base as f32 * 0.5_f32.powi(mip as i32)
}

/// Roughness baked into mip `mip` of a `mip_count`-level chain.
pub fn roughness_for_mip(mip: u32, mip_count: u32) -> f32 {
    if mip_count <= 1 {
        0.0
    } else {
        mip as f32 / (mip_count - 1) as f32
    }
}

/// Renders `source` through `pipeline` into a new cube texture named `name`.
pub fn run(
    ctx: &RenderContext,
    pipeline: &Pipeline,
    source: &Texture,
    pass: &ConvolutionPass,
    name: &str,
) -> IblResult<Texture> {
    let device = ctx.device();
    let queue_name = &ctx.settings().queue;
    let queue = device
        .queue(queue_name)
        .ok_or_else(|| IblError::MissingQueue(queue_name.clone()))?;

    let mut builder = TextureBuilder::new(TextureKind::CubeMap);
    builder.mip_levels(pass.mip_levels).sampling(source.sampling());
    for _ in 0..6 {
        builder.add_layer(pass.resolution, pass.resolution, pipeline.color_format())?;
    }
    let destination = builder.build(device, name)?;

    let gate = SyncGate::new(device, queue)?;
    let binding = SourceBinding::new(device, pipeline, source)?;
    let target = OffscreenTarget::new(device, pipeline, pass.resolution)?;

    gate.begin()?;
    let commands = ConvolutionRecorder {
        pipeline,
        mesh: ctx.cube_mesh(),
        binding: &binding,
        target: &target,
        destination: &destination,
        pass,
    }
    .record()?;
    log::debug!("Recorded {} commands for `{name}`", commands.len());
    gate.end(commands)?;
    gate.submit_and_wait()?;

    drop(target);
    drop(binding);
    drop(gate);
    Ok(destination)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefilter_chain_spans_zero_to_full_roughness() {
        let pass = ConvolutionPass::prefiltered(512);
        assert_eq!(pass.mip_levels, 10);
        assert_eq!(roughness_for_mip(0, pass.mip_levels), 0.0);
        assert_eq!(roughness_for_mip(9, pass.mip_levels), 1.0);
        let ramp: Vec<f32> = (0..10).map(|m| roughness_for_mip(m, 10)).collect();
        assert!(ramp.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn single_mip_is_perfectly_smooth() {
        assert_eq!(roughness_for_mip(0, 1), 0.0);
        assert_eq!(ConvolutionPass::irradiance(64).mip_levels, 1);
    }

    #[test]
    fn viewports_halve_per_mip() {
        assert_eq!(mip_viewport(512, 0), 512.0);
        assert_eq!(mip_viewport(512, 3), 64.0);
        assert_eq!(mip_viewport(512, 9), 1.0);
        assert_eq!(mip_viewport(100, 1), 50.0);
    }

    #[test]
    fn derived_names_carry_the_suffix() {
        assert_eq!(
            ConvolutionPass::irradiance(64).derived_name("sky"),
            "sky_irradiance_map"
        );
        assert_eq!(
            ConvolutionPass::prefiltered(64).derived_name("sky"),
            "sky_prefiltered_map"
        );
    }
}
