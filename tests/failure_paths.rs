use std::sync::Arc;

use ibl_baker::{
    Environment, ErrorCategory, IblError, IblSettings, RenderContext,
    error::SyncOp,
    gpu::{DeviceError, HeadlessDevice, ObjectKind, headless::FailurePoint},
    render::CubeFaces,
};

fn settings() -> IblSettings {
    IblSettings {
        irradiance_resolution: 4,
        prefilter_resolution: 4,
        irradiance_sample_delta: 0.4,
        prefilter_sample_count: 8,
        brdf_lut_size: 4,
        brdf_sample_count: 8,
        ..IblSettings::default()
    }
}

struct Fixture {
    headless: Arc<HeadlessDevice>,
    ctx: RenderContext,
    env: Arc<Environment>,
}

fn fixture(headless: HeadlessDevice) -> Fixture {
    let headless = Arc::new(headless);
    let ctx = RenderContext::new(headless.clone(), settings()).unwrap();
    let env = ctx
        .load_environment("sky", &CubeFaces::uniform(4, [1.0, 0.8, 0.6]))
        .unwrap();
    Fixture { headless, ctx, env }
}

fn assert_nothing_leaked(f: &Fixture, before: &std::collections::BTreeMap<ObjectKind, usize>) {
    assert_eq!(&f.headless.live_snapshot(), before);
    assert_eq!(f.headless.invalid_destroys(), 0);
    for kind in ObjectKind::TRANSIENT {
        assert_eq!(f.headless.live_count(*kind), 0, "{kind}");
    }
}

const CREATION_STEPS: [ObjectKind; 10] = [
    ObjectKind::Image,
    ObjectKind::Memory,
    ObjectKind::ImageView,
    ObjectKind::Sampler,
    ObjectKind::Framebuffer,
    ObjectKind::DescriptorPool,
    ObjectKind::DescriptorSet,
    ObjectKind::CommandPool,
    ObjectKind::CommandBuffer,
    ObjectKind::Fence,
];

#[test]
fn every_creation_failure_releases_what_was_built() {
    for kind in CREATION_STEPS {
        for prefiltered in [false, true] {
            let f = fixture(HeadlessDevice::new());
            let before = f.headless.live_snapshot();
            f.headless
                .fail_next(FailurePoint::Create(kind), DeviceError::OutOfDeviceMemory);

            let result = if prefiltered {
                f.ctx.create_prefiltered_map(&f.env, 4)
            } else {
                f.ctx.create_irradiance_map(&f.env, 4)
            };
            let err = result.unwrap_err();
            assert_eq!(
                err,
                IblError::Creation {
                    object: kind,
                    source: DeviceError::OutOfDeviceMemory,
                },
                "{kind}"
            );
            assert_eq!(err.category(), ErrorCategory::Creation);
            assert_nothing_leaked(&f, &before);
            assert_eq!(f.ctx.live_environments(), 1);
        }
    }
}

#[test]
fn offscreen_image_failure_releases_the_destination() {
    let f = fixture(HeadlessDevice::new());
    let before = f.headless.live_snapshot();
    // The destination cube is the first image, the offscreen target the second.
    f.headless
        .fail_after(FailurePoint::Create(ObjectKind::Image), 1, DeviceError::OutOfHostMemory);

    let err = f.ctx.create_prefiltered_map(&f.env, 4).unwrap_err();
    assert_eq!(err.category(), ErrorCategory::Creation);
    assert_nothing_leaked(&f, &before);
}

#[test]
fn recording_failures_are_reported_as_recording() {
    for point in [FailurePoint::BeginCommandBuffer, FailurePoint::EndCommandBuffer] {
        let f = fixture(HeadlessDevice::new());
        let before = f.headless.live_snapshot();
        f.headless.fail_next(point, DeviceError::DeviceLost);

        let err = f.ctx.create_irradiance_map(&f.env, 4).unwrap_err();
        assert_eq!(err.category(), ErrorCategory::Recording, "{point:?}");
        assert_nothing_leaked(&f, &before);
        assert!(f.headless.submissions().is_empty());
    }
}

#[test]
fn synchronization_failures_are_reported_as_synchronization() {
    let cases = [
        (FailurePoint::Submit, SyncOp::Submit),
        (FailurePoint::FenceWait, SyncOp::FenceWait),
        (FailurePoint::QueueIdle, SyncOp::QueueIdle),
    ];
    for (point, op) in cases {
        let f = fixture(HeadlessDevice::new());
        let before = f.headless.live_snapshot();
        f.headless.fail_next(point, DeviceError::DeviceLost);

        let err = f.ctx.create_prefiltered_map(&f.env, 4).unwrap_err();
        assert_eq!(
            err,
            IblError::Sync {
                op,
                source: DeviceError::DeviceLost,
            }
        );
        assert_eq!(err.category(), ErrorCategory::Synchronization);
        assert_nothing_leaked(&f, &before);
        assert!(f.ctx.resources().find::<Environment>("sky_prefiltered_map").is_none());
    }
}

#[test]
fn fence_failure_wins_over_a_failed_drain() {
    let f = fixture(HeadlessDevice::new());
    let before = f.headless.live_snapshot();
    f.headless.fail_next(FailurePoint::FenceWait, DeviceError::Timeout);
    f.headless.fail_next(FailurePoint::QueueIdle, DeviceError::DeviceLost);

    let err = f.ctx.create_irradiance_map(&f.env, 4).unwrap_err();
    assert_eq!(
        err,
        IblError::Sync {
            op: SyncOp::FenceWait,
            source: DeviceError::Timeout,
        }
    );
    assert_nothing_leaked(&f, &before);
}

#[test]
fn missing_queue_is_a_precondition() {
    let f = fixture(HeadlessDevice::with_queues(&["compute"]));
    let before = f.headless.live_snapshot();
    let created = f.headless.created_total();

    let err = f.ctx.create_irradiance_map(&f.env, 4).unwrap_err();
    assert_eq!(err, IblError::MissingQueue("graphics".into()));
    assert_eq!(err.category(), ErrorCategory::Precondition);
    assert_nothing_leaked(&f, &before);
    assert_eq!(f.headless.created_total(), created);
}

#[test]
fn bake_attaches_nothing_when_one_map_fails() {
    let f = fixture(HeadlessDevice::new());
    // The irradiance bake creates one fence, the prefilter bake the second.
    f.headless
        .fail_after(FailurePoint::Create(ObjectKind::Fence), 1, DeviceError::OutOfHostMemory);

    assert!(f.ctx.bake(&f.env).is_err());
    assert!(f.env.irradiance_map().is_none());
    assert!(f.env.prefiltered_map().is_none());
    assert!(f.ctx.resources().find::<Environment>("sky_irradiance_map").is_none());
}

#[test]
fn context_recovers_after_a_failed_bake() {
    let f = fixture(HeadlessDevice::new());
    f.headless.fail_next(FailurePoint::Submit, DeviceError::DeviceLost);
    assert!(f.ctx.create_irradiance_map(&f.env, 4).is_err());

    let map = f.ctx.create_irradiance_map(&f.env, 4).unwrap();
    assert_eq!(map.environment_texture().unwrap().extent().width, 4);
    assert_eq!(f.headless.invalid_destroys(), 0);
}
