use bytemuck::{Pod, Zeroable};

#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
pub struct Vertex {
    pub position: [f32; 3],
}

impl Vertex {
    pub const STRIDE: u32 = std::mem::size_of::<Vertex>() as u32;
}

/// A single indexed triangle list.
#[derive(Clone, Debug)]
pub struct PrimitiveSet {
    pub positions: Vec<Vertex>,
    pub indices: Vec<u16>,
}

impl PrimitiveSet {
    pub fn index_count(&self) -> u32 {
        self.indices.len() as u32
    }
}

/// Unit cube centred on the origin, viewed from inside during convolution.
#[derive(Clone, Debug)]
pub struct CubeMesh {
    pub primitive_sets: Vec<PrimitiveSet>,
}

impl CubeMesh {
    pub fn unit() -> Self {
        let positions = [
            [-1.0, -1.0, -1.0],
            [1.0, -1.0, -1.0],
            [1.0, 1.0, -1.0],
            [-1.0, 1.0, -1.0],
            [-1.0, -1.0, 1.0],
            [1.0, -1.0, 1.0],
            [1.0, 1.0, 1.0],
            [-1.0, 1.0, 1.0],
        ]
        .map(|position| Vertex { position })
        .to_vec();

        #[rustfmt::skip]
        let indices = vec![
            // -Z
            0, 2, 1, 0, 3, 2,
            // +Z
            4, 5, 6, 4, 6, 7,
            // -X
            0, 4, 7, 0, 7, 3,
            // +X
            1, 2, 6, 1, 6, 5,
            // -Y
            0, 1, 5, 0, 5, 4,
            // +Y
            3, 7, 6, 3, 6, 2,
        ];

        Self {
            primitive_sets: vec![PrimitiveSet { positions, indices }],
        }
    }

    /// The primitive set the convolution draws.
    pub fn primitive_set(&self) -> &PrimitiveSet {
        &self.primitive_sets[0]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unit_cube_has_twelve_triangles() {
        let mesh = CubeMesh::unit();
        let set = mesh.primitive_set();
        assert_eq!(set.positions.len(), 8);
        assert_eq!(set.index_count(), 36);
        assert!(set.indices.iter().all(|&i| (i as usize) < set.positions.len()));
        assert_eq!(Vertex::STRIDE, 12);
    }
}
