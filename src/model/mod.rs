pub mod mesh;

pub use mesh::{CubeMesh, PrimitiveSet, Vertex};
