use std::{
    f32::consts::{PI, TAU},
    sync::Arc,
};

use glam::Vec3;
use image::Rgb32FImage;

use crate::{
    camera::direction_for_texel,
    error::{Creating, IblError, IblResult, SyncOp},
    gpu::{
        Extent2d, Filter, Format, GpuDevice, ImageDesc, ImageHandle, ImageUsage, ImageViewDesc,
        ImageViewHandle, MemoryHandle, MemoryLocation, ObjectKind, Owned, SamplerDesc,
        SamplerHandle, SubresourceRange, ViewDimension, Wrap,
    },
};

/// Number of mips in a full chain for a `size`-texel square.
pub fn mip_count_for(size: u32) -> u32 {
    u32::BITS - size.max(1).leading_zeros()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextureKind {
    D2,
    CubeMap,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sampling {
    pub mag_filter: Filter,
    pub min_filter: Filter,
    pub mipmap_filter: Filter,
    pub wrap_u: Wrap,
    pub wrap_v: Wrap,
    pub wrap_w: Wrap,
}

impl Default for Sampling {
    fn default() -> Self {
        Self {
            mag_filter: Filter::Linear,
            min_filter: Filter::Linear,
            mipmap_filter: Filter::Linear,
            wrap_u: Wrap::ClampToEdge,
            wrap_v: Wrap::ClampToEdge,
            wrap_w: Wrap::ClampToEdge,
        }
    }
}

impl Sampling {
    fn sampler_desc(&self, mip_levels: u32) -> SamplerDesc {
        SamplerDesc {
            mag_filter: self.mag_filter,
            min_filter: self.min_filter,
            mipmap_filter: self.mipmap_filter,
            wrap_u: self.wrap_u,
            wrap_v: self.wrap_v,
            wrap_w: self.wrap_w,
            max_lod: mip_levels as f32,
        }
    }
}

/// Configures and creates a [`Texture`].
///
/// Every layer must share the first layer's size and format. A cube map
/// takes exactly six.
#[derive(Debug, Clone)]
pub struct TextureBuilder {
    kind: TextureKind,
    mip_levels: u32,
    sampling: Sampling,
    layers: Vec<(Extent2d, Format)>,
}

impl TextureBuilder {
    pub fn new(kind: TextureKind) -> Self {
        Self {
            kind,
            mip_levels: 1,
            sampling: Sampling::default(),
            layers: Vec::new(),
        }
    }

    pub fn mip_levels(&mut self, mip_levels: u32) -> &mut Self {
        self.mip_levels = mip_levels;
        self
    }

    pub fn sampling(&mut self, sampling: Sampling) -> &mut Self {
        self.sampling = sampling;
        self
    }

    pub fn add_layer(&mut self, width: u32, height: u32, format: Format) -> IblResult<&mut Self> {
        let extent = Extent2d::new(width, height);
        if width == 0 || height == 0 {
            return Err(IblError::InvalidTexture(format!("layer of size {width}x{height}")));
        }
        if let Some(&(first, first_format)) = self.layers.first() {
            if first != extent || first_format != format {
                return Err(IblError::InvalidTexture(format!(
                    "layer {width}x{height} {format:?} differs from {}x{} {first_format:?}",
                    first.width, first.height
                )));
            }
        }
        if self.kind == TextureKind::CubeMap && self.layers.len() == 6 {
            return Err(IblError::InvalidTexture("a cube map has six layers".into()));
        }
        self.layers.push((extent, format));
        Ok(self)
    }

    /// Creates image, memory, view and sampler, in that order.
    pub fn build(&self, device: &Arc<dyn GpuDevice>, label: &str) -> IblResult<Texture> {
        let &(extent, format) = self
            .layers
            .first()
            .ok_or_else(|| IblError::InvalidTexture(format!("`{label}` has no layers")))?;
        let layer_count = self.layers.len() as u32;
        if self.kind == TextureKind::CubeMap && (layer_count != 6 || extent.width != extent.height)
        {
            return Err(IblError::InvalidTexture(format!(
                "cube map `{label}` needs six square layers"
            )));
        }
        let max_mips = mip_count_for(extent.width.max(extent.height));
        if self.mip_levels == 0 || self.mip_levels > max_mips {
            return Err(IblError::InvalidTexture(format!(
                "`{label}` asks for {} mips, at most {max_mips} fit",
                self.mip_levels
            )));
        }

        let image = device
            .create_image(&ImageDesc {
                label: label.to_owned(),
                extent,
                format,
                mip_levels: self.mip_levels,
                array_layers: layer_count,
                usage: ImageUsage::SAMPLED | ImageUsage::TRANSFER_DST | ImageUsage::TRANSFER_SRC,
                cube_compatible: self.kind == TextureKind::CubeMap,
            })
            .creating(ObjectKind::Image)?;
        let image = Owned::new(device, image);

        let memory = device
            .allocate_image_memory(&[image.handle()], MemoryLocation::DeviceLocal)
            .creating(ObjectKind::Memory)?;
        let memory = Owned::new(device, memory);

        let dimension = match (self.kind, layer_count) {
            (TextureKind::CubeMap, _) => ViewDimension::Cube,
            (TextureKind::D2, 1) => ViewDimension::D2,
            (TextureKind::D2, _) => ViewDimension::D2Array,
        };
        let view = device
            .create_image_view(&ImageViewDesc {
                image: image.handle(),
                dimension,
                format,
                range: SubresourceRange::whole(self.mip_levels, layer_count),
            })
            .creating(ObjectKind::ImageView)?;
        let view = Owned::new(device, view);

        let sampler = device
            .create_sampler(&self.sampling.sampler_desc(self.mip_levels))
            .creating(ObjectKind::Sampler)?;
        let sampler = Owned::new(device, sampler);

        Ok(Texture {
            sampler,
            view,
            image,
            memory,
            label: label.to_owned(),
            kind: self.kind,
            format,
            extent,
            layer_count,
            mip_levels: self.mip_levels,
            sampling: self.sampling,
            device: Arc::clone(device),
        })
    }
}

/// A sampled image on the device.
pub struct Texture {
    sampler: Owned<SamplerHandle>,
    view: Owned<ImageViewHandle>,
    image: Owned<ImageHandle>,
    memory: Owned<MemoryHandle>,
    label: String,
    kind: TextureKind,
    format: Format,
    extent: Extent2d,
    layer_count: u32,
    mip_levels: u32,
    sampling: Sampling,
    device: Arc<dyn GpuDevice>,
}

impl std::fmt::Debug for Texture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Texture")
            .field("label", &self.label)
            .field("kind", &self.kind)
            .field("format", &self.format)
            .field("extent", &self.extent)
            .field("layer_count", &self.layer_count)
            .field("mip_levels", &self.mip_levels)
            .finish_non_exhaustive()
    }
}

impl Texture {
    /// Uploads `faces` as a single-mip cube map.
    pub fn from_cube_faces(
        device: &Arc<dyn GpuDevice>,
        faces: &CubeFaces,
        format: Format,
        label: &str,
    ) -> IblResult<Self> {
        let mut builder = TextureBuilder::new(TextureKind::CubeMap);
        for _ in 0..6 {
            builder.add_layer(faces.size(), faces.size(), format)?;
        }
        let texture = builder.build(device, label)?;
        texture.upload_faces(faces)?;
        Ok(texture)
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn kind(&self) -> TextureKind {
        self.kind
    }

    pub fn format(&self) -> Format {
        self.format
    }

    pub fn extent(&self) -> Extent2d {
        self.extent
    }

    pub fn layer_count(&self) -> u32 {
        self.layer_count
    }

    pub fn mip_levels(&self) -> u32 {
        self.mip_levels
    }

    pub fn sampling(&self) -> Sampling {
        self.sampling
    }

    pub fn image(&self) -> ImageHandle {
        self.image.handle()
    }

    pub fn memory(&self) -> MemoryHandle {
        self.memory.handle()
    }

    pub fn view(&self) -> ImageViewHandle {
        self.view.handle()
    }

    pub fn sampler(&self) -> SamplerHandle {
        self.sampler.handle()
    }

    pub fn upload_layer(&self, layer: u32, mip_level: u32, texels: &[[f32; 4]]) -> IblResult<()> {
        self.device
            .write_image(self.image(), layer, mip_level, texels)
            .map_err(|source| IblError::Sync {
                op: SyncOp::Upload,
                source,
            })
    }

    /// Fills mip 0 of all six layers.
    pub fn upload_faces(&self, faces: &CubeFaces) -> IblResult<()> {
        if self.kind != TextureKind::CubeMap || faces.size() != self.extent.width {
            return Err(IblError::InvalidTexture(format!(
                "{}px faces do not fit `{}`",
                faces.size(),
                self.label
            )));
        }
        for layer in 0..6 {
            self.upload_layer(layer, 0, faces.face(layer))?;
        }
        Ok(())
    }

    /// Row-major RGBA texels of one layer and mip.
    pub fn read_texels(&self, layer: u32, mip_level: u32) -> IblResult<Vec<[f32; 4]>> {
        self.device
            .read_image(self.image(), layer, mip_level)
            .map_err(|source| IblError::Sync {
                op: SyncOp::Readback,
                source,
            })
    }

    /// One layer and mip as an RGB float image, alpha dropped.
    pub fn to_rgb32f(&self, layer: u32, mip_level: u32) -> IblResult<Rgb32FImage> {
        let extent = self.extent.mip(mip_level);
        let data = self
            .read_texels(layer, mip_level)?
            .into_iter()
            .flat_map(|[r, g, b, _]| [r, g, b])
            .collect();
        Rgb32FImage::from_raw(extent.width, extent.height, data).ok_or_else(|| {
            IblError::InvalidTexture(format!("readback of `{}` has the wrong size", self.label))
        })
    }
}

/// Host-side cube map: six square faces in cube-map layer order.
#[derive(Debug, Clone, PartialEq)]
pub struct CubeFaces {
    size: u32,
    faces: Vec<Vec<[f32; 4]>>,
}

impl CubeFaces {
    pub fn uniform(size: u32, color: [f32; 3]) -> Self {
        Self::from_fn(size, |_| Vec3::from(color))
    }

    /// Evaluates `radiance` through the center of every texel.
    pub fn from_fn(size: u32, radiance: impl Fn(Vec3) -> Vec3) -> Self {
        let size = size.max(1);
        let faces = (0..6)
            .map(|layer| {
                let mut face = Vec::with_capacity((size * size) as usize);
                for y in 0..size {
                    for x in 0..size {
                        let u = (x as f32 + 0.5) / size as f32;
                        let v = (y as f32 + 0.5) / size as f32;
                        let c = radiance(direction_for_texel(layer, u, v));
                        face.push([c.x, c.y, c.z, 1.0]);
                    }
                }
                face
            })
            .collect();
        Self { size, faces }
    }

    /// Resamples an equirectangular panorama, +Y up.
    pub fn from_equirect(image: &Rgb32FImage, size: u32) -> Self {
        Self::from_fn(size, |dir| sample_equirect(image, dir))
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn face(&self, layer: u32) -> &[[f32; 4]] {
        &self.faces[layer as usize]
    }
}

fn sample_equirect(image: &Rgb32FImage, dir: Vec3) -> Vec3 {
    let (width, height) = image.dimensions();
    if width == 0 || height == 0 {
        return Vec3::ZERO;
    }
    let d = dir.normalize();
    let theta = d.y.clamp(-1.0, 1.0).acos();
    let phi = d.z.atan2(d.x);
    let x = (phi + PI) / TAU * (width as f32 - 1.0);
    let y = theta / PI * (height as f32 - 1.0);
    let (x0, y0) = (x.floor(), y.floor());
    let (tx, ty) = (x - x0, y - y0);

    let pixel = |x: f32, y: f32| {
        let x = x.rem_euclid(width as f32) as u32;
        let y = y.clamp(0.0, (height - 1) as f32) as u32;
        Vec3::from(image.get_pixel(x, y).0)
    };
    let top = pixel(x0, y0).lerp(pixel(x0 + 1.0, y0), tx);
    let bottom = pixel(x0, y0 + 1.0).lerp(pixel(x0 + 1.0, y0 + 1.0), tx);
    top.lerp(bottom, ty)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::{HeadlessDevice, ImageLayout};

    fn device() -> (Arc<HeadlessDevice>, Arc<dyn GpuDevice>) {
        let headless = Arc::new(HeadlessDevice::new());
        let device: Arc<dyn GpuDevice> = headless.clone();
        (headless, device)
    }

    #[test]
    fn mip_counts_cover_the_full_chain() {
        assert_eq!(mip_count_for(1), 1);
        assert_eq!(mip_count_for(64), 7);
        assert_eq!(mip_count_for(500), 9);
        assert_eq!(mip_count_for(512), 10);
    }

    #[test]
    fn layers_must_match_the_first() {
        let mut builder = TextureBuilder::new(TextureKind::CubeMap);
        builder.add_layer(16, 16, Format::Rgba16Float).unwrap();
        assert!(builder.add_layer(8, 8, Format::Rgba16Float).is_err());
        assert!(builder.add_layer(16, 16, Format::Rgba8Unorm).is_err());
        for _ in 0..5 {
            builder.add_layer(16, 16, Format::Rgba16Float).unwrap();
        }
        let err = builder.add_layer(16, 16, Format::Rgba16Float).unwrap_err();
        assert!(matches!(err, IblError::InvalidTexture(_)));
    }

    #[test]
    fn incomplete_cube_creates_nothing() {
        let (headless, device) = device();
        let mut builder = TextureBuilder::new(TextureKind::CubeMap);
        builder.add_layer(8, 8, Format::Rgba16Float).unwrap();
        assert!(builder.build(&device, "partial").is_err());
        assert_eq!(headless.created_total(), 0);
    }

    #[test]
    fn failed_view_releases_image_and_memory() {
        let (headless, device) = device();
        headless.fail_next(
            crate::gpu::headless::FailurePoint::Create(ObjectKind::ImageView),
            crate::gpu::DeviceError::OutOfDeviceMemory,
        );
        let mut builder = TextureBuilder::new(TextureKind::D2);
        builder.add_layer(4, 4, Format::Rgba8Unorm).unwrap();
        let err = builder.build(&device, "lut").unwrap_err();
        assert_eq!(
            err,
            IblError::Creation {
                object: ObjectKind::ImageView,
                source: crate::gpu::DeviceError::OutOfDeviceMemory,
            }
        );
        assert_eq!(headless.live_total(), 0);
        assert_eq!(headless.invalid_destroys(), 0);
    }

    #[test]
    fn cube_upload_round_trips_through_the_device() {
        let (headless, device) = device();
        let faces = CubeFaces::from_fn(4, |d| d.abs());
        let texture = Texture::from_cube_faces(&device, &faces, Format::Rgba32Float, "sky").unwrap();
        assert_eq!(texture.layer_count(), 6);
        assert_eq!(texture.read_texels(3, 0).unwrap(), faces.face(3));
        assert_eq!(
            headless.image_layout(texture.image(), 5, 0),
            Some(ImageLayout::ShaderReadOnly)
        );
        drop(texture);
        assert_eq!(headless.live_total(), 0);
    }

    #[test]
    fn equirect_poles_and_horizon_resample_the_right_rows() {
        let mut pano = Rgb32FImage::new(8, 4);
        for (_, y, pixel) in pano.enumerate_pixels_mut() {
            pixel.0 = if y < 2 { [3.0, 3.0, 3.0] } else { [0.5, 0.5, 0.5] };
        }
        let faces = CubeFaces::from_equirect(&pano, 4);
        // Layer 2 faces +Y, layer 3 faces -Y.
        assert!(faces.face(2).iter().all(|t| (t[0] - 3.0).abs() < 1e-5));
        assert!(faces.face(3).iter().all(|t| (t[0] - 0.5).abs() < 1e-5));
    }
}
