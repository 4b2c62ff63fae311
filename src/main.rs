use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
    time::Instant,
};

use anyhow::{Context, Result};
use clap::Parser;
use ibl_baker::{
    CubeFaces, IblSettings, RenderContext, Texture,
    gpu::{GpuDevice, HeadlessDevice, WgpuDevice},
};
use image::{DynamicImage, ImageFormat, Rgb32FImage};

/// File suffixes for cube layers 0..6.
const FACE_NAMES: [&str; 6] = ["px", "nx", "py", "ny", "pz", "nz"];

#[derive(Parser)]
#[command(name = "ibl-baker")]
#[command(about = "Bakes irradiance and prefiltered specular cube maps from an HDR panorama")]
#[command(version = "0.1.0")]
struct Args {
    /// Equirectangular Radiance HDR image
    #[arg(value_name = "INPUT_HDR")]
    input: PathBuf,

    /// Output directory
    #[arg(short, long, default_value = "ibl")]
    out: PathBuf,

    /// Face size of the source cube built from the panorama
    #[arg(long, default_value_t = 512)]
    face_size: u32,

    /// Face size of the irradiance map
    #[arg(long, default_value_t = 64)]
    irradiance_size: u32,

    /// Face size of mip 0 of the prefiltered map
    #[arg(long, default_value_t = 512)]
    prefilter_size: u32,

    /// GGX samples per prefiltered texel
    #[arg(long, default_value_t = 1024)]
    samples: u32,

    /// Bake on the CPU device instead of the GPU
    #[arg(long)]
    headless: bool,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    // - By default, keep our app at Info/Debug, but silence noisy GPU deps to Warn.
    // - If RUST_LOG is set, respect it entirely (no overrides here).
    let rust_log_set = std::env::var("RUST_LOG").is_ok();
    let mut builder = env_logger::Builder::from_default_env();
    if !rust_log_set {
        if args.verbose {
            builder.filter_level(log::LevelFilter::Debug);
        } else {
            builder.filter_level(log::LevelFilter::Info);
        }

        builder
            .filter_module("wgpu", log::LevelFilter::Warn)
            .filter_module("wgpu_core", log::LevelFilter::Warn)
            .filter_module("wgpu_hal", log::LevelFilter::Warn)
            .filter_module("naga", log::LevelFilter::Warn);
    }
    builder.init();

    log::info!("📁 Loading panorama: {}", args.input.display());
    let panorama = image::open(&args.input)
        .with_context(|| format!("Failed to read {}", args.input.display()))?
        .to_rgb32f();
    let faces = CubeFaces::from_equirect(&panorama, args.face_size);

    let device: Arc<dyn GpuDevice> = if args.headless {
        log::info!("🧮 Using the headless CPU device");
        Arc::new(HeadlessDevice::new())
    } else {
        Arc::new(WgpuDevice::new().map_err(|e| anyhow::anyhow!("Failed to open a GPU: {e}"))?)
    };

    let settings = IblSettings {
        irradiance_resolution: args.irradiance_size,
        prefilter_resolution: args.prefilter_size,
        prefilter_sample_count: args.samples,
        ..IblSettings::default()
    };
    let context =
        RenderContext::new(device, settings).context("Failed to set up the render context")?;

    let name = args
        .input
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("environment")
        .to_owned();
    let environment = context
        .load_environment(&name, &faces)
        .context("Failed to upload the source cube")?;

    let start = Instant::now();
    context.bake(&environment).context("Bake failed")?;
    log::info!("✅ Baked `{name}` in {:.2?}", start.elapsed());

    fs::create_dir_all(&args.out)
        .with_context(|| format!("Failed to create {}", args.out.display()))?;
    let maps = [environment.irradiance_map(), environment.prefiltered_map()];
    for map in maps.iter().flatten() {
        if let Some(texture) = map.environment_texture() {
            write_cube(texture, &args.out, map.name())?;
        }
    }
    let lut = context.brdf_lut().to_rgb32f(0, 0)?;
    write_hdr(lut, &args.out.join("brdf_lut.hdr"))?;

    log::info!("📁 Wrote maps to {}", args.out.display());
    Ok(())
}

fn write_cube(texture: &Texture, dir: &Path, name: &str) -> Result<()> {
    for mip in 0..texture.mip_levels() {
        for (layer, face) in FACE_NAMES.iter().enumerate() {
            let image = texture.to_rgb32f(layer as u32, mip)?;
            let file = if texture.mip_levels() == 1 {
                format!("{name}_{face}.hdr")
            } else {
                format!("{name}_mip{mip}_{face}.hdr")
            };
            write_hdr(image, &dir.join(file))?;
        }
    }
    Ok(())
}

fn write_hdr(image: Rgb32FImage, path: &Path) -> Result<()> {
    DynamicImage::ImageRgb32F(image)
        .save_with_format(path, ImageFormat::Hdr)
        .with_context(|| format!("Failed to write {}", path.display()))
}
