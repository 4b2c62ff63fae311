use std::f32::consts::FRAC_PI_2;

use glam::{Mat4, Vec3};

/// Cube faces in the order their renders are copied into array layers.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum CubeFace {
    NegX,
    PosX,
    PosY,
    NegY,
    PosZ,
    NegZ,
}

impl CubeFace {
    pub const ALL: [CubeFace; 6] = [
        CubeFace::NegX,
        CubeFace::PosX,
        CubeFace::PosY,
        CubeFace::NegY,
        CubeFace::PosZ,
        CubeFace::NegZ,
    ];

    /// Destination array layer.
    pub fn layer(self) -> u32 {
        self as u32
    }

    pub fn view_direction(self) -> Vec3 {
        match self {
            CubeFace::NegX => Vec3::NEG_X,
            CubeFace::PosX => Vec3::X,
            CubeFace::PosY => Vec3::Y,
            CubeFace::NegY => Vec3::NEG_Y,
            CubeFace::PosZ => Vec3::Z,
            CubeFace::NegZ => Vec3::NEG_Z,
        }
    }

    /// Up vector for the face's look-at; never parallel to the view direction.
    pub fn up(self) -> Vec3 {
        match self {
            CubeFace::PosY => Vec3::NEG_Z,
            CubeFace::NegY => Vec3::Z,
            _ => Vec3::Y,
        }
    }
}

/// The six face transforms used to render a unit cube from its center.
#[derive(Debug, Clone)]
pub struct CubeFaceBasis {
    projection: Mat4,
    views: [Mat4; 6],
}

impl CubeFaceBasis {
    pub const FOV_Y: f32 = FRAC_PI_2;
    pub const NEAR: f32 = 0.1;

    /// Far plane sits at `resolution`, as the bake has always done.
    pub fn new(resolution: u32) -> Self {
        let projection = Mat4::perspective_rh(Self::FOV_Y, 1.0, Self::NEAR, resolution as f32);
        let views = CubeFace::ALL
            .map(|face| Mat4::look_at_rh(Vec3::ZERO, face.view_direction(), face.up()));
        Self { projection, views }
    }

    pub fn projection(&self) -> Mat4 {
        self.projection
    }

    pub fn view(&self, face: CubeFace) -> Mat4 {
        self.views[face.layer() as usize]
    }

    pub fn view_projection(&self, face: CubeFace) -> Mat4 {
        self.projection * self.view(face)
    }
}

/// Direction through texel coordinate `(u, v)` (0..1, top-left origin) of
/// array layer `layer` of a cube texture, using the hardware face table
/// (+X, -X, +Y, -Y, +Z, -Z).
pub fn direction_for_texel(layer: u32, u: f32, v: f32) -> Vec3 {
    let s = 2.0 * u - 1.0;
    let t = 2.0 * v - 1.0;
    let dir = match layer {
        0 => Vec3::new(1.0, -t, -s),
        1 => Vec3::new(-1.0, -t, s),
        2 => Vec3::new(s, 1.0, t),
        3 => Vec3::new(s, -1.0, -t),
        4 => Vec3::new(s, -t, 1.0),
        _ => Vec3::new(-s, -t, -1.0),
    };
    dir.normalize()
}

/// Inverse of [`direction_for_texel`]: the layer hit by `dir` and the texel
/// coordinate on it.
pub fn texel_for_direction(dir: Vec3) -> (u32, f32, f32) {
    let a = dir.abs();
    let (layer, sc, tc, ma) = if a.x >= a.y && a.x >= a.z {
        if dir.x > 0.0 {
            (0, -dir.z, -dir.y, a.x)
        } else {
            (1, dir.z, -dir.y, a.x)
        }
    } else if a.y >= a.z {
        if dir.y > 0.0 {
            (2, dir.x, dir.z, a.y)
        } else {
            (3, dir.x, -dir.z, a.y)
        }
    } else if dir.z > 0.0 {
        (4, dir.x, -dir.y, a.z)
    } else {
        (5, -dir.x, -dir.y, a.z)
    };
    (layer, (sc / ma + 1.0) * 0.5, (tc / ma + 1.0) * 0.5)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn faces_follow_bake_order() {
        let dirs: Vec<Vec3> = CubeFace::ALL.iter().map(|f| f.view_direction()).collect();
        assert_eq!(
            dirs,
            vec![Vec3::NEG_X, Vec3::X, Vec3::Y, Vec3::NEG_Y, Vec3::Z, Vec3::NEG_Z]
        );
        for (i, face) in CubeFace::ALL.iter().enumerate() {
            assert_eq!(face.layer(), i as u32);
        }
    }

    #[test]
    fn up_vectors_are_never_parallel_to_view() {
        for face in CubeFace::ALL {
            let cross = face.view_direction().cross(face.up());
            assert!(cross.length() > 0.99, "{face:?} has a degenerate up vector");
        }
    }

    #[test]
    fn each_face_looks_down_its_axis() {
        let basis = CubeFaceBasis::new(64);
        for face in CubeFace::ALL {
            let clip = basis.view_projection(face) * face.view_direction().extend(1.0);
            let ndc = clip.truncate() / clip.w;
            assert!(ndc.x.abs() < 1e-5 && ndc.y.abs() < 1e-5, "{face:?}: {ndc:?}");
            assert!((0.0..=1.0).contains(&ndc.z));
        }
    }

    #[test]
    fn projection_is_square_ninety_degrees() {
        let p = CubeFaceBasis::new(512).projection();
        // cot(45deg) == 1 on both axes.
        assert!((p.x_axis.x - 1.0).abs() < 1e-5);
        assert!((p.y_axis.y - 1.0).abs() < 1e-5);
    }

    #[test]
    fn texel_addressing_round_trips() {
        for layer in 0..6 {
            for &(u, v) in &[(0.5, 0.5), (0.1, 0.8), (0.9, 0.25)] {
                let dir = direction_for_texel(layer, u, v);
                let (l, u2, v2) = texel_for_direction(dir);
                assert_eq!(l, layer);
                assert!((u - u2).abs() < 1e-5 && (v - v2).abs() < 1e-5);
            }
        }
    }
}
