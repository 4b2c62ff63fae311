//! Split-sum BRDF integration table.
//!
//! Texel `(x, y)` holds the Fresnel scale and bias for `NdotV = (x + 0.5) / N`
//! and `roughness = (y + 0.5) / N`.

use std::sync::Arc;

use glam::{Vec2, Vec3};

use crate::{
    error::IblResult,
    gpu::{Format, GpuDevice},
    render::{
        kernels::{hammersley, importance_sample_ggx},
        texture::{Texture, TextureBuilder, TextureKind},
    },
};

#[derive(Debug, Clone, PartialEq)]
pub struct BrdfLut {
    size: u32,
    texels: Vec<[f32; 4]>,
}

impl BrdfLut {
    pub fn compute(size: u32, sample_count: u32) -> Self {
        let size = size.max(1);
        let mut texels = Vec::with_capacity((size * size) as usize);
        for y in 0..size {
            let roughness = (y as f32 + 0.5) / size as f32;
            for x in 0..size {
                let n_dot_v = (x as f32 + 0.5) / size as f32;
                let ab = integrate(n_dot_v, roughness, sample_count);
                texels.push([ab.x, ab.y, 0.0, 1.0]);
            }
        }
        Self { size, texels }
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn texels(&self) -> &[[f32; 4]] {
        &self.texels
    }

    /// `(scale, bias)` at texel `(x, y)`.
    pub fn get(&self, x: u32, y: u32) -> Vec2 {
        let [a, b, _, _] = self.texels[(y * self.size + x) as usize];
        Vec2::new(a, b)
    }

    pub fn upload(&self, device: &Arc<dyn GpuDevice>, format: Format) -> IblResult<Texture> {
        let texture = TextureBuilder::new(TextureKind::D2)
            .add_layer(self.size, self.size, format)?
            .build(device, "brdf_lut")?;
        texture.upload_layer(0, 0, &self.texels)?;
        Ok(texture)
    }
}

/// Scale and bias applied to F0 for one `(NdotV, roughness)` pair.
pub fn integrate(n_dot_v: f32, roughness: f32, sample_count: u32) -> Vec2 {
    let n = Vec3::Z;
    let v = Vec3::new((1.0 - n_dot_v * n_dot_v).max(0.0).sqrt(), 0.0, n_dot_v);
    let mut a = 0.0;
    let mut b = 0.0;
    for i in 0..sample_count {
        let h = importance_sample_ggx(hammersley(i, sample_count), n, roughness);
        let l = 2.0 * v.dot(h) * h - v;
        let n_dot_l = l.z.max(0.0);
        let n_dot_h = h.z.max(0.0);
        let v_dot_h = v.dot(h).max(0.0);
        if n_dot_l > 0.0 {
            let g = geometry_smith(n_dot_v, n_dot_l, roughness);
            let g_vis = g * v_dot_h / (n_dot_h * n_dot_v).max(1e-4);
            let fc = (1.0 - v_dot_h).powi(5);
            a += (1.0 - fc) * g_vis;
            b += fc * g_vis;
        }
    }
    Vec2::new(a, b) / sample_count.max(1) as f32
}

fn geometry_smith(n_dot_v: f32, n_dot_l: f32, roughness: f32) -> f32 {
    // IBL remapping of k.
    let k = roughness * roughness / 2.0;
    let schlick = |n_dot_x: f32| n_dot_x / (n_dot_x * (1.0 - k) + k);
    schlick(n_dot_v) * schlick(n_dot_l)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn smooth_head_on_is_pure_scale() {
        let ab = integrate(0.999, 0.01, 256);
        assert!(ab.x > 0.95, "{ab}");
        assert!(ab.y < 0.05, "{ab}");
    }

    #[test]
    fn scale_and_bias_never_exceed_one() {
        let lut = BrdfLut::compute(16, 256);
        for y in 0..16 {
            for x in 0..16 {
                let ab = lut.get(x, y);
                assert!(ab.x >= 0.0 && ab.y >= 0.0);
                assert!(ab.x + ab.y <= 1.02, "({x}, {y}): {ab}");
            }
        }
    }

    #[test]
    fn rough_surfaces_reflect_less() {
        let lut = BrdfLut::compute(8, 256);
        let smooth = lut.get(6, 0);
        let rough = lut.get(6, 7);
        assert!(smooth.x + smooth.y > rough.x + rough.y);
    }
}
