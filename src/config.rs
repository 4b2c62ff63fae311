use crate::gpu::Format;

/// Tunables for a [`RenderContext`](crate::render::RenderContext).
#[derive(Debug, Clone, PartialEq)]
pub struct IblSettings {
    /// Face size of the irradiance cube.
    pub irradiance_resolution: u32,
    /// Face size of mip 0 of the prefiltered cube.
    pub prefilter_resolution: u32,
    /// Color format of both derived cubes and the offscreen targets.
    ///
    /// Half floats keep HDR range at half the memory of `Rgba32Float` and are
    /// filterable without an optional device feature.
    pub format: Format,
    /// Name of the queue the bakes are submitted to.
    pub queue: String,
    /// Angular step of the irradiance hemisphere integral, in radians.
    pub irradiance_sample_delta: f32,
    pub prefilter_sample_count: u32,
    pub brdf_lut_size: u32,
    pub brdf_sample_count: u32,
}

impl Default for IblSettings {
    fn default() -> Self {
        Self {
            irradiance_resolution: 64,
            prefilter_resolution: 512,
            format: Format::Rgba16Float,
            queue: "graphics".to_owned(),
            irradiance_sample_delta: 0.025,
            prefilter_sample_count: 1024,
            brdf_lut_size: 128,
            brdf_sample_count: 512,
        }
    }
}
