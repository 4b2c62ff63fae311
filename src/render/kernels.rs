//! Host versions of the convolution shaders.
//!
//! These evaluate exactly what `irradiance.wgsl` and `prefilter.wgsl` compute
//! for one output direction, given a radiance lookup.

use std::f32::consts::{FRAC_PI_2, PI, TAU};

use glam::{Vec2, Vec3};

/// Cosine-weighted irradiance around `normal`, normalized so a constant
/// radiance field integrates back to itself.
///
/// The hemisphere is walked on a regular (phi, theta) grid no coarser than
/// `sample_delta` radians, sampling cell midpoints.
pub fn irradiance(normal: Vec3, sample_delta: f32, radiance: impl Fn(Vec3) -> Vec3) -> Vec3 {
    let normal = normal.normalize();
    let (tangent, bitangent) = tangent_frame(normal);
    let delta = sample_delta.max(1e-3);
    let phi_steps = (TAU / delta).ceil() as u32;
    let theta_steps = (FRAC_PI_2 / delta).ceil() as u32;
    let phi_step = TAU / phi_steps as f32;
    let theta_step = FRAC_PI_2 / theta_steps as f32;

    let mut sum = Vec3::ZERO;
    for p in 0..phi_steps {
        let phi = (p as f32 + 0.5) * phi_step;
        for t in 0..theta_steps {
            let theta = (t as f32 + 0.5) * theta_step;
            let (sin_theta, cos_theta) = theta.sin_cos();
            let local = Vec3::new(sin_theta * phi.cos(), sin_theta * phi.sin(), cos_theta);
            let dir = tangent * local.x + bitangent * local.y + normal * local.z;
            sum += radiance(dir) * cos_theta * sin_theta;
        }
    }
    PI * sum / (phi_steps * theta_steps) as f32
}

/// GGX-prefiltered radiance around `normal`, assuming the view and reflection
/// vectors equal the normal.
pub fn prefilter(
    normal: Vec3,
    roughness: f32,
    sample_count: u32,
    radiance: impl Fn(Vec3) -> Vec3,
) -> Vec3 {
    let n = normal.normalize();
    if roughness <= 0.0 || sample_count == 0 {
        return radiance(n);
    }

    let mut sum = Vec3::ZERO;
    let mut weight = 0.0;
    for i in 0..sample_count {
        let h = importance_sample_ggx(hammersley(i, sample_count), n, roughness);
        let l = (2.0 * n.dot(h) * h - n).normalize();
        let n_dot_l = n.dot(l);
        if n_dot_l > 0.0 {
            sum += radiance(l) * n_dot_l;
            weight += n_dot_l;
        }
    }
    if weight > 0.0 {
        sum / weight
    } else {
        radiance(n)
    }
}

pub fn hammersley(i: u32, n: u32) -> Vec2 {
    Vec2::new(i as f32 / n as f32, radical_inverse_vdc(i))
}

fn radical_inverse_vdc(bits: u32) -> f32 {
    bits.reverse_bits() as f32 * 2.328_306_4e-10
}

/// Half vector around `normal` drawn from the GGX distribution.
pub fn importance_sample_ggx(xi: Vec2, normal: Vec3, roughness: f32) -> Vec3 {
    let a = roughness * roughness;
    let phi = TAU * xi.x;
    let cos_theta = ((1.0 - xi.y) / (1.0 + (a * a - 1.0) * xi.y)).sqrt();
    let sin_theta = (1.0 - cos_theta * cos_theta).max(0.0).sqrt();
    let (tangent, bitangent) = tangent_frame(normal);
    (tangent * (phi.cos() * sin_theta) + bitangent * (phi.sin() * sin_theta) + normal * cos_theta)
        .normalize()
}

fn tangent_frame(normal: Vec3) -> (Vec3, Vec3) {
    let up = if normal.z.abs() < 0.999 { Vec3::Z } else { Vec3::X };
    let tangent = up.cross(normal).normalize();
    (tangent, normal.cross(tangent))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sky(dir: Vec3) -> Vec3 {
        if dir.y > 0.0 { Vec3::splat(4.0) } else { Vec3::splat(0.5) }
    }

    #[test]
    fn constant_radiance_integrates_to_itself() {
        let color = Vec3::new(0.2, 1.5, 3.0);
        for normal in [Vec3::X, Vec3::NEG_Y, Vec3::new(1.0, 2.0, -0.5)] {
            let e = irradiance(normal, 0.05, |_| color);
            assert!((e - color).abs().max_element() < 0.01 * 3.0, "{normal}: {e}");
        }
    }

    #[test]
    fn irradiance_blends_across_the_horizon() {
        // Facing sideways sees half bright sky and half dark ground.
        let e = irradiance(Vec3::X, 0.05, sky);
        assert!((e.x - 2.25).abs() < 0.05, "{e}");
        let up = irradiance(Vec3::Y, 0.05, sky);
        assert!((up.x - 4.0).abs() < 0.01);
    }

    #[test]
    fn zero_roughness_returns_the_source() {
        let dir = Vec3::new(0.3, -0.7, 0.2);
        let got = prefilter(dir, 0.0, 256, |d| d * 10.0);
        assert!((got - dir.normalize() * 10.0).length() < 1e-5);
    }

    #[test]
    fn rough_prefilter_reaches_below_the_horizon() {
        let n = Vec3::new(1.0, 0.2, 0.0).normalize();
        let sharp = prefilter(n, 0.05, 512, sky);
        let rough = prefilter(n, 1.0, 512, sky);
        assert!(sharp.x > 3.99, "{sharp}");
        assert!(rough.x < 3.5 && rough.x > 0.5, "{rough}");
    }

    #[test]
    fn ggx_samples_stay_in_the_upper_hemisphere() {
        let n = Vec3::new(0.0, 0.6, 0.8);
        for i in 0..64 {
            let h = importance_sample_ggx(hammersley(i, 64), n, 0.7);
            assert!(h.dot(n) >= 0.0);
            assert!((h.length() - 1.0).abs() < 1e-4);
        }
    }
}
