use std::sync::Arc;

use glam::Vec3;
use ibl_baker::{
    Environment, IblSettings, RenderContext,
    camera::{CubeFace, CubeFaceBasis},
    gpu::{Command, Format, HeadlessDevice, ImageLayout, ObjectKind, ShaderStages},
    render::CubeFaces,
};

fn settings() -> IblSettings {
    IblSettings {
        irradiance_resolution: 8,
        prefilter_resolution: 8,
        irradiance_sample_delta: 0.2,
        prefilter_sample_count: 64,
        brdf_lut_size: 4,
        brdf_sample_count: 16,
        ..IblSettings::default()
    }
}

fn setup(settings: IblSettings) -> (Arc<HeadlessDevice>, RenderContext) {
    let headless = Arc::new(HeadlessDevice::new());
    let context = RenderContext::new(headless.clone(), settings).unwrap();
    (headless, context)
}

fn sky(dir: Vec3) -> Vec3 {
    if dir.y > 0.0 { Vec3::splat(4.0) } else { Vec3::splat(0.5) }
}

fn gradient(dir: Vec3) -> Vec3 {
    Vec3::splat(1.5) + dir
}

fn rgb(texel: [f32; 4]) -> Vec3 {
    Vec3::new(texel[0], texel[1], texel[2])
}

#[test]
fn default_irradiance_map_is_a_64px_float_cube() {
    let (_, ctx) = setup(IblSettings {
        irradiance_resolution: 64,
        irradiance_sample_delta: 0.4,
        ..settings()
    });
    let env = ctx
        .load_environment("studio", &CubeFaces::uniform(4, [1.0, 1.0, 1.0]))
        .unwrap();
    let map = ctx.create_irradiance_map_default(&env).unwrap();
    let texture = map.environment_texture().unwrap();

    assert_eq!(texture.layer_count(), 6);
    assert_eq!(texture.mip_levels(), 1);
    assert_eq!(texture.extent().width, 64);
    assert_eq!(texture.extent().height, 64);
    assert!(texture.format().is_hdr_float());
    assert_eq!(texture.format(), Format::Rgba16Float);
}

#[test]
fn constant_environment_irradiance_is_the_constant() {
    let (_, ctx) = setup(settings());
    let color = Vec3::new(0.25, 1.0, 3.0);
    let env = ctx
        .load_environment("flat", &CubeFaces::uniform(4, color.into()))
        .unwrap();
    let map = ctx.create_irradiance_map(&env, 8).unwrap();
    let texture = map.environment_texture().unwrap();

    for layer in 0..6 {
        for texel in texture.read_texels(layer, 0).unwrap() {
            let got = rgb(texel);
            assert!(
                ((got - color) / color).abs().max_element() < 0.02,
                "layer {layer}: {got}"
            );
            assert_eq!(texel[3], 1.0);
        }
    }
}

#[test]
fn prefiltered_mip_zero_reproduces_the_source() {
    let (_, ctx) = setup(settings());
    let env = ctx
        .load_environment("gradient", &CubeFaces::from_fn(16, gradient))
        .unwrap();
    let map = ctx.create_prefiltered_map(&env, 8).unwrap();
    let texture = map.environment_texture().unwrap();
    assert_eq!(texture.mip_levels(), 4);

    let basis = CubeFaceBasis::new(8);
    for face in CubeFace::ALL {
        let inverse = basis.view_projection(face).inverse();
        let texels = texture.read_texels(face.layer(), 0).unwrap();
        for y in 0..8 {
            for x in 0..8 {
                let ndc = Vec3::new(
                    (x as f32 + 0.5) / 8.0 * 2.0 - 1.0,
                    (y as f32 + 0.5) / 8.0 * 2.0 - 1.0,
                    1.0,
                );
                let dir = inverse.project_point3(ndc).normalize();
                let got = rgb(texels[y * 8 + x]);
                let expected = gradient(dir);
                assert!(
                    (got - expected).abs().max_element() < 0.1,
                    "{face:?} ({x}, {y}): {got} vs {expected}"
                );
            }
        }
    }
}

#[test]
fn last_mip_blurs_across_the_horizon() {
    let (_, ctx) = setup(settings());
    let env = ctx
        .load_environment("sky", &CubeFaces::from_fn(16, sky))
        .unwrap();
    let map = ctx.create_prefiltered_map(&env, 8).unwrap();
    let texture = map.environment_texture().unwrap();
    let last = texture.mip_levels() - 1;

    let sharp: Vec<f32> = texture
        .read_texels(CubeFace::PosX.layer(), 0)
        .unwrap()
        .iter()
        .map(|t| t[0])
        .collect();
    let max = sharp.iter().copied().fold(f32::MIN, f32::max);
    let min = sharp.iter().copied().fold(f32::MAX, f32::min);
    assert!(max > 3.9 && min < 0.6, "mip 0 spans {min}..{max}");

    for face in [CubeFace::NegX, CubeFace::PosX, CubeFace::PosZ, CubeFace::NegZ] {
        let texels = texture.read_texels(face.layer(), last).unwrap();
        assert_eq!(texels.len(), 1);
        let blurred = texels[0][0];
        assert!(blurred > 1.0 && blurred < 3.5, "{face:?}: {blurred}");
    }
}

#[test]
fn recording_follows_the_face_and_mip_loop() {
    let (headless, ctx) = setup(settings());
    let env = ctx
        .load_environment("sky", &CubeFaces::uniform(4, [1.0, 0.5, 0.25]))
        .unwrap();
    let map = ctx.create_prefiltered_map(&env, 8).unwrap();
    let destination = map.environment_texture().unwrap().image();

    let submissions = headless.submissions();
    let commands = submissions.last().unwrap().commands();

    assert!(matches!(commands[0], Command::BindPipeline(_)));
    assert!(matches!(commands[1], Command::BindDescriptorSets { .. }));
    assert!(matches!(commands[2], Command::BindVertexBuffer { .. }));
    assert!(matches!(commands[3], Command::BindIndexBuffer { .. }));

    let draws = commands
        .iter()
        .filter(|c| matches!(c, Command::DrawIndexed { index_count: 36, instance_count: 1, .. }))
        .count();
    assert_eq!(draws, 24);

    let viewports: Vec<f32> = commands
        .iter()
        .filter_map(|c| match c {
            Command::SetViewport(v) => Some(v.width),
            _ => None,
        })
        .collect();
    let expected: Vec<f32> = [8.0, 4.0, 2.0, 1.0]
        .iter()
        .flat_map(|&size| [size; 6])
        .collect();
    assert_eq!(viewports, expected);
    assert!(commands.iter().all(|c| match c {
        Command::SetScissor(s) => s.extent.width == 8 && s.extent.height == 8,
        _ => true,
    }));

    let roughness: Vec<f32> = commands
        .iter()
        .filter_map(|c| match c {
            Command::PushConstants {
                stages, offset, data, ..
            } if *stages == ShaderStages::FRAGMENT => {
                assert_eq!(*offset, 64);
                Some(bytemuck::pod_read_unaligned::<f32>(data))
            }
            _ => None,
        })
        .step_by(6)
        .collect();
    assert_eq!(roughness, vec![0.0, 1.0 / 3.0, 2.0 / 3.0, 1.0]);

    let copies: Vec<(u32, u32, u32)> = commands
        .iter()
        .filter_map(|c| match c {
            Command::CopyImage { dst, regions, .. } => {
                assert_eq!(*dst, destination);
                let r = regions[0];
                assert_eq!(r.src.mip_level, 0);
                Some((r.dst.base_layer, r.dst.mip_level, r.extent.width))
            }
            _ => None,
        })
        .collect();
    let expected: Vec<(u32, u32, u32)> = (0..4)
        .flat_map(|mip| (0..6).map(move |layer| (layer, mip, 8 >> mip)))
        .collect();
    assert_eq!(copies, expected);

    let barriers: Vec<_> = commands
        .iter()
        .filter_map(|c| match c {
            Command::PipelineBarrier(b) => Some(*b),
            _ => None,
        })
        .collect();
    assert_eq!(barriers.len(), 2 + 24 * 2 + 1);
    assert_eq!(barriers[0].new_layout, ImageLayout::ColorAttachment);
    assert_eq!(barriers[1].image, destination);
    assert_eq!(barriers[1].new_layout, ImageLayout::TransferDst);
    assert_eq!(barriers[1].range.mip_count, 4);
    let last = barriers.last().unwrap();
    assert_eq!(last.image, destination);
    assert_eq!(
        (last.old_layout, last.new_layout),
        (ImageLayout::TransferDst, ImageLayout::ShaderReadOnly)
    );

    for layer in 0..6 {
        for mip in 0..4 {
            assert_eq!(
                headless.image_layout(destination, layer, mip),
                Some(ImageLayout::ShaderReadOnly)
            );
        }
    }
}

#[test]
fn successful_bakes_release_every_transient() {
    let (headless, ctx) = setup(settings());
    let env = ctx
        .load_environment("sky", &CubeFaces::uniform(4, [1.0, 1.0, 1.0]))
        .unwrap();
    let before = headless.live_snapshot();

    let irradiance = ctx.create_irradiance_map(&env, 8).unwrap();
    let prefiltered = ctx.create_prefiltered_map(&env, 8).unwrap();

    let after = headless.live_snapshot();
    for kind in ObjectKind::ALL {
        let added = after[kind] - before[kind];
        let expected = match kind {
            // Two new textures.
            ObjectKind::Image | ObjectKind::Memory | ObjectKind::ImageView | ObjectKind::Sampler => 2,
            _ => 0,
        };
        assert_eq!(added, expected, "{kind}");
    }
    assert!(headless.created_count(ObjectKind::Framebuffer) >= 2);
    assert_eq!(headless.invalid_destroys(), 0);

    drop((irradiance, prefiltered, env));
    drop(ctx);
    assert_eq!(headless.live_total(), 0);
    assert_eq!(headless.invalid_destroys(), 0);
}

#[test]
fn repeated_bakes_register_distinct_resources() {
    let (_, ctx) = setup(settings());
    let env = ctx
        .load_environment("sky", &CubeFaces::uniform(4, [1.0, 1.0, 1.0]))
        .unwrap();
    let first = ctx.create_irradiance_map(&env, 8).unwrap();
    let second = ctx.create_irradiance_map(&env, 8).unwrap();

    assert!(!Arc::ptr_eq(&first, &second));
    assert_eq!(first.name(), second.name());
    assert_eq!(ctx.resources().count::<Environment>("sky_irradiance_map"), 2);
    let newest = ctx
        .resources()
        .find::<Environment>("sky_irradiance_map")
        .unwrap();
    assert!(Arc::ptr_eq(&newest, &second));
    assert_eq!(ctx.live_environments(), 3);
}
