pub mod camera;
pub mod config;
pub mod error;
pub mod gpu;
pub mod model;
pub mod render;

pub use config::IblSettings;
pub use error::{ErrorCategory, IblError, IblResult};
pub use render::{CubeFaces, Environment, RenderContext, Texture};
