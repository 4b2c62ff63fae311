pub mod brdf_lut;
pub mod context;
pub mod convolution;
pub mod environment;
pub mod kernels;
pub mod pipeline;
pub mod resources;
pub mod texture;

pub use brdf_lut::BrdfLut;
pub use context::{MeshBuffers, RenderContext};
pub use convolution::{ConvolutionPass, mip_viewport, roughness_for_mip};
pub use environment::Environment;
pub use pipeline::{Pipeline, PipelineId, PipelineRegistry};
pub use resources::{Resource, ResourceManager};
pub use texture::{CubeFaces, Sampling, Texture, TextureBuilder, TextureKind, mip_count_for};
