//! Command execution for the headless device.

use glam::{Mat4, Vec3};

use super::{Image, State, quantize, validation};
use crate::{
    camera::texel_for_direction,
    gpu::{
        Command, ConvolutionProgram, DeviceObject, DeviceResult, Extent2d, ImageBarrier, ImageCopy,
        ImageLayout, ImageUsage, IndexType, Rect2d, ShaderStages, ViewDimension, Viewport,
    },
    render::kernels,
};

use super::MAX_PUSH_CONSTANT_SIZE;

/// Every render pass must be closed before another begins and before the
/// buffer ends.
pub(super) fn check_pass_nesting(commands: &crate::gpu::CommandList) -> Result<(), String> {
    let mut open = false;
    for command in commands.commands() {
        match command {
            Command::BeginRenderPass { .. } if open => {
                return Err("render pass begun inside another".into());
            }
            Command::BeginRenderPass { .. } => open = true,
            Command::EndRenderPass if !open => return Err("no render pass to end".into()),
            Command::EndRenderPass => open = false,
            Command::CopyImage { .. } | Command::PipelineBarrier(_) if open => {
                return Err("transfer recorded inside a render pass".into());
            }
            _ => {}
        }
    }
    if open {
        return Err("render pass left open".into());
    }
    Ok(())
}

pub(super) fn execute(state: &mut State, commands: &[Command]) -> DeviceResult<()> {
    let mut executor = Executor::default();
    for (index, command) in commands.iter().enumerate() {
        executor
            .step(state, command)
            .map_err(|message| validation(format!("command {index}: {message}")))?;
    }
    Ok(())
}

#[derive(Debug, Clone, Copy)]
struct ActivePass {
    render_pass: u64,
    framebuffer: u64,
    area: Rect2d,
}

struct Executor {
    pipeline: Option<u64>,
    sets: Vec<u64>,
    vertex_buffer: Option<u64>,
    index_buffer: Option<(u64, IndexType)>,
    pass: Option<ActivePass>,
    viewport: Option<Viewport>,
    scissor: Option<Rect2d>,
    push: [u8; MAX_PUSH_CONSTANT_SIZE as usize],
}

impl Default for Executor {
    fn default() -> Self {
        Self {
            pipeline: None,
            sets: Vec::new(),
            vertex_buffer: None,
            index_buffer: None,
            pass: None,
            viewport: None,
            scissor: None,
            push: [0; MAX_PUSH_CONSTANT_SIZE as usize],
        }
    }
}

type Step = Result<(), String>;

impl Executor {
    fn step(&mut self, state: &mut State, command: &Command) -> Step {
        match command {
            Command::BindPipeline(pipeline) => {
                if !state.pipelines.contains_key(&pipeline.raw()) {
                    return Err("bound pipeline is not alive".into());
                }
                self.pipeline = Some(pipeline.raw());
            }
            Command::BindDescriptorSets {
                layout,
                first_set,
                sets,
            } => {
                if !state.pipeline_layouts.contains_key(&layout.raw()) {
                    return Err("descriptor sets bound against a dead layout".into());
                }
                if *first_set != 0 {
                    return Err("only set 0 is used".into());
                }
                if let Some(dead) = sets
                    .iter()
                    .find(|s| !state.descriptor_sets.contains_key(&s.raw()))
                {
                    return Err(format!("descriptor set {dead:?} is not alive"));
                }
                self.sets = sets.iter().map(|s| s.raw()).collect();
            }
            Command::BindVertexBuffer { buffer, .. } => {
                let found = state
                    .buffers
                    .get(&buffer.raw())
                    .ok_or("vertex buffer is not alive")?;
                if !found.usage.contains(crate::gpu::BufferUsage::VERTEX) {
                    return Err("buffer bound as vertices lacks vertex usage".into());
                }
                self.vertex_buffer = Some(buffer.raw());
            }
            Command::BindIndexBuffer {
                buffer, index_type, ..
            } => {
                let found = state
                    .buffers
                    .get(&buffer.raw())
                    .ok_or("index buffer is not alive")?;
                if !found.usage.contains(crate::gpu::BufferUsage::INDEX) {
                    return Err("buffer bound as indices lacks index usage".into());
                }
                self.index_buffer = Some((buffer.raw(), *index_type));
            }
            Command::PipelineBarrier(barrier) => barrier_step(state, barrier)?,
            Command::BeginRenderPass {
                render_pass,
                framebuffer,
                area,
                clear_values,
            } => self.begin_pass(state, render_pass.raw(), framebuffer.raw(), *area, clear_values)?,
            Command::SetViewport(viewport) => {
                if viewport.width <= 0.0 || viewport.height <= 0.0 {
                    return Err(format!("empty viewport {viewport:?}"));
                }
                self.viewport = Some(*viewport);
            }
            Command::SetScissor(scissor) => self.scissor = Some(*scissor),
            Command::PushConstants {
                layout,
                stages,
                offset,
                data,
            } => {
                let desc = state
                    .pipeline_layouts
                    .get(&layout.raw())
                    .ok_or("push constants against a dead layout")?;
                let end = offset + data.len() as u32;
                let covered = desc.push_constant_ranges.iter().any(|r| {
                    r.stages == *stages && r.range.start <= *offset && end <= r.range.end
                });
                if !covered {
                    return Err(format!(
                        "push constants {offset}..{end} for {stages:?} fall outside the layout"
                    ));
                }
                self.push[*offset as usize..end as usize].copy_from_slice(data);
            }
            Command::DrawIndexed {
                index_count,
                instance_count,
                first_index,
                ..
            } => self.draw(state, *index_count, *instance_count, *first_index)?,
            Command::EndRenderPass => {
                self.pass.take().ok_or("no render pass to end")?;
            }
            Command::CopyImage {
                src,
                src_layout,
                dst,
                dst_layout,
                regions,
            } => copy_step(state, src.raw(), *src_layout, dst.raw(), *dst_layout, regions)?,
        }
        Ok(())
    }

    fn begin_pass(
        &mut self,
        state: &mut State,
        render_pass: u64,
        framebuffer: u64,
        area: Rect2d,
        clear_values: &[crate::gpu::ClearValue],
    ) -> Step {
        if self.pass.is_some() {
            return Err("render pass already active".into());
        }
        let pass_desc = state
            .render_passes
            .get(&render_pass)
            .ok_or("render pass is not alive")?;
        let clear_on_load = pass_desc.clear_on_load;
        let fb = state
            .framebuffers
            .get(&framebuffer)
            .ok_or("framebuffer is not alive")?;
        if fb.render_pass.raw() != render_pass {
            return Err("framebuffer was built for another render pass".into());
        }
        if area.x < 0
            || area.y < 0
            || area.x as u32 + area.extent.width > fb.extent.width
            || area.y as u32 + area.extent.height > fb.extent.height
        {
            return Err(format!("render area {area:?} exceeds the framebuffer"));
        }
        let (image_id, index) = attachment(state, framebuffer)?;
        let image = state.images.get_mut(&image_id).ok_or("attachment image is gone")?;
        if image.layouts[index] != ImageLayout::ColorAttachment {
            return Err(format!(
                "attachment is in {:?}, not ColorAttachment",
                image.layouts[index]
            ));
        }
        if clear_on_load {
            let Some(crate::gpu::ClearValue::Color(color)) = clear_values.first() else {
                return Err("clearing render pass needs a color clear value".into());
            };
            let color = quantize(image.desc.format, *color);
            let width = image_width(image, index);
            for y in area.y as u32..area.y as u32 + area.extent.height {
                for x in area.x as u32..area.x as u32 + area.extent.width {
                    image.texels[index][(y * width + x) as usize] = color;
                }
            }
        }
        self.pass = Some(ActivePass {
            render_pass,
            framebuffer,
            area,
        });
        Ok(())
    }

    fn draw(&mut self, state: &mut State, index_count: u32, instances: u32, first_index: u32) -> Step {
        let pass = self.pass.ok_or("draw outside a render pass")?;
        let pipeline = state
            .pipelines
            .get(&self.pipeline.ok_or("draw without a pipeline")?)
            .ok_or("bound pipeline is not alive")?
            .clone();
        if state.render_passes.get(&pipeline.render_pass.raw())
            != state.render_passes.get(&pass.render_pass)
        {
            return Err("pipeline is incompatible with the active render pass".into());
        }
        let layout = state
            .pipeline_layouts
            .get(&pipeline.layout.raw())
            .ok_or("pipeline layout is not alive")?;
        let vertices = state
            .buffers
            .get(&self.vertex_buffer.ok_or("draw without a vertex buffer")?)
            .ok_or("vertex buffer is not alive")?;
        if vertices.data.len() < pipeline.vertex_stride as usize {
            return Err("vertex buffer holds no vertex".into());
        }
        let (index_buffer, index_type) = self.index_buffer.ok_or("draw without an index buffer")?;
        let indices = state
            .buffers
            .get(&index_buffer)
            .ok_or("index buffer is not alive")?;
        let available = indices.data.len() as u64 / index_type.size();
        if u64::from(first_index) + u64::from(index_count) > available {
            return Err(format!("draw reads {index_count} indices, buffer holds {available}"));
        }
        if index_count == 0 || instances == 0 {
            return Ok(());
        }
        let viewport = self.viewport.ok_or("draw without a viewport")?;
        let scissor = self.scissor.ok_or("draw without a scissor")?;

        let set = *self.sets.first().ok_or("draw without a descriptor set")?;
        let set = state.descriptor_sets.get(&set).ok_or("descriptor set is not alive")?;
        if layout.set_layouts.first().map(|l| l.raw()) != Some(set.layout) {
            return Err("descriptor set does not match the pipeline layout".into());
        }
        let descriptor = *set.writes.get(&0).ok_or("binding 0 was never written")?;
        if !state.samplers.contains_key(&descriptor.sampler.raw()) {
            return Err("sampled through a dead sampler".into());
        }
        let view = *state
            .views
            .get(&descriptor.view.raw())
            .ok_or("sampled view is not alive")?;
        if view.dimension != ViewDimension::Cube {
            return Err("convolution source must be a cube view".into());
        }
        let source = state.bound_image(view.image.raw()).map_err(|e| e.to_string())?;
        let mip = view.range.base_mip;
        let mut faces = Vec::with_capacity(6);
        for layer in view.range.base_layer..view.range.base_layer + 6 {
            let index = source.subresource(layer, mip).ok_or("view outlives its image range")?;
            if source.layouts[index] != descriptor.layout {
                return Err(format!(
                    "source layer {layer} is in {:?}, descriptor expects {:?}",
                    source.layouts[index], descriptor.layout
                ));
            }
            faces.push(source.texels[index].clone());
        }
        let source = CubeSampler {
            faces,
            extent: source.desc.extent.mip(mip),
        };

        let view_proj: [f32; 16] = bytemuck::pod_read_unaligned(&self.push[0..64]);
        let inverse = Mat4::from_cols_array(&view_proj).inverse();
        let roughness: f32 = bytemuck::pod_read_unaligned(&self.push[64..68]);
        let shade = |dir: Vec3| match pipeline.program {
            ConvolutionProgram::Irradiance { sample_delta } => {
                kernels::irradiance(dir, sample_delta, |d| source.sample(d))
            }
            ConvolutionProgram::Prefilter { sample_count } => {
                kernels::prefilter(dir, roughness, sample_count, |d| source.sample(d))
            }
        };
        if matches!(pipeline.program, ConvolutionProgram::Prefilter { .. })
            && !layout
                .push_constant_ranges
                .iter()
                .any(|r| r.stages.contains(ShaderStages::FRAGMENT))
        {
            return Err("prefilter pipeline has no fragment push constants".into());
        }

        let (image_id, index) = attachment(state, pass.framebuffer)?;
        let target = state.images.get_mut(&image_id).ok_or("attachment image is gone")?;
        let width = image_width(target, index);
        let height = target.texels[index].len() as u32 / width;
        let format = target.desc.format;

        let x0 = (viewport.x.floor() as i64).max(i64::from(scissor.x)).max(i64::from(pass.area.x)).max(0);
        let y0 = (viewport.y.floor() as i64).max(i64::from(scissor.y)).max(i64::from(pass.area.y)).max(0);
        let x1 = ((viewport.x + viewport.width).ceil() as i64)
            .min(i64::from(scissor.x) + i64::from(scissor.extent.width))
            .min(i64::from(pass.area.x) + i64::from(pass.area.extent.width))
            .min(i64::from(width));
        let y1 = ((viewport.y + viewport.height).ceil() as i64)
            .min(i64::from(scissor.y) + i64::from(scissor.extent.height))
            .min(i64::from(pass.area.y) + i64::from(pass.area.extent.height))
            .min(i64::from(height));

        for y in y0..y1 {
            for x in x0..x1 {
                // Clip-space y points down the image, top row at -1.
                let ndc_x = ((x as f32 + 0.5 - viewport.x) / viewport.width) * 2.0 - 1.0;
                let ndc_y = ((y as f32 + 0.5 - viewport.y) / viewport.height) * 2.0 - 1.0;
                let dir = inverse.project_point3(Vec3::new(ndc_x, ndc_y, 1.0)).normalize();
                let color = shade(dir);
                target.texels[index][(y as u32 * width + x as u32) as usize] =
                    quantize(format, [color.x, color.y, color.z, 1.0]);
            }
        }
        Ok(())
    }
}

/// Image id and subresource index behind a framebuffer's color attachment.
fn attachment(state: &State, framebuffer: u64) -> Result<(u64, usize), String> {
    let fb = state
        .framebuffers
        .get(&framebuffer)
        .ok_or("framebuffer is not alive")?;
    let view = fb
        .attachments
        .first()
        .and_then(|v| state.views.get(&v.raw()))
        .ok_or("framebuffer attachment is not alive")?;
    let image = state.bound_image(view.image.raw()).map_err(|e| e.to_string())?;
    if !image.desc.usage.contains(ImageUsage::COLOR_ATTACHMENT) {
        return Err("attachment image lacks color attachment usage".into());
    }
    let index = image
        .subresource(view.range.base_layer, view.range.base_mip)
        .ok_or("attachment view exceeds its image")?;
    Ok((view.image.raw(), index))
}

fn image_width(image: &Image, index: usize) -> u32 {
    image.desc.extent.mip(index as u32 % image.desc.mip_levels).width
}

fn barrier_step(state: &mut State, barrier: &ImageBarrier) -> Step {
    let image = state
        .images
        .get_mut(&barrier.image.raw())
        .ok_or("barrier on a dead image")?;
    if image.memory.is_none() {
        return Err("barrier on an image without memory".into());
    }
    let range = barrier.range;
    for layer in range.base_layer..range.base_layer + range.layer_count {
        for mip in range.base_mip..range.base_mip + range.mip_count {
            let index = image
                .subresource(layer, mip)
                .ok_or_else(|| format!("barrier range {range:?} exceeds the image"))?;
            let current = image.layouts[index];
            if barrier.old_layout != ImageLayout::Undefined && current != barrier.old_layout {
                return Err(format!(
                    "barrier expects {:?} but layer {layer} mip {mip} is in {current:?}",
                    barrier.old_layout
                ));
            }
            image.layouts[index] = barrier.new_layout;
        }
    }
    Ok(())
}

fn copy_step(
    state: &mut State,
    src: u64,
    src_layout: ImageLayout,
    dst: u64,
    dst_layout: ImageLayout,
    regions: &[ImageCopy],
) -> Step {
    if src_layout != ImageLayout::TransferSrc || dst_layout != ImageLayout::TransferDst {
        return Err("copies read TransferSrc and write TransferDst".into());
    }
    let source = state.bound_image(src).map_err(|e| e.to_string())?;
    let target = state.bound_image(dst).map_err(|e| e.to_string())?;
    if !source.desc.usage.contains(ImageUsage::TRANSFER_SRC)
        || !target.desc.usage.contains(ImageUsage::TRANSFER_DST)
    {
        return Err("copy images lack transfer usage".into());
    }
    if source.desc.format != target.desc.format {
        return Err("copy between different formats".into());
    }

    let mut writes = Vec::with_capacity(regions.len());
    for region in regions {
        if region.src.layer_count != 1 || region.dst.layer_count != 1 {
            return Err("copies move one layer at a time".into());
        }
        let src_index = source
            .subresource(region.src.base_layer, region.src.mip_level)
            .ok_or("copy source subresource does not exist")?;
        let dst_index = target
            .subresource(region.dst.base_layer, region.dst.mip_level)
            .ok_or("copy destination subresource does not exist")?;
        if source.layouts[src_index] != src_layout {
            return Err(format!("copy source is in {:?}", source.layouts[src_index]));
        }
        if target.layouts[dst_index] != dst_layout {
            return Err(format!("copy destination is in {:?}", target.layouts[dst_index]));
        }
        let src_extent = source.desc.extent.mip(region.src.mip_level);
        let dst_extent = target.desc.extent.mip(region.dst.mip_level);
        if !fits(region.extent, src_extent) || !fits(region.extent, dst_extent) {
            return Err(format!(
                "copy of {:?} exceeds {src_extent:?} or {dst_extent:?}",
                region.extent
            ));
        }
        let mut rows = Vec::with_capacity(region.extent.texel_count());
        for y in 0..region.extent.height {
            let start = (y * src_extent.width) as usize;
            rows.extend_from_slice(
                &source.texels[src_index][start..start + region.extent.width as usize],
            );
        }
        writes.push((dst_index, dst_extent.width, region.extent, rows));
    }

    let target = state.images.get_mut(&dst).ok_or("copy destination is gone")?;
    for (index, width, extent, rows) in writes {
        for y in 0..extent.height {
            let start = (y * width) as usize;
            let row = (y * extent.width) as usize;
            target.texels[index][start..start + extent.width as usize]
                .copy_from_slice(&rows[row..row + extent.width as usize]);
        }
    }
    Ok(())
}

fn fits(extent: Extent2d, within: Extent2d) -> bool {
    extent.width <= within.width && extent.height <= within.height
}

/// Bilinear lookups into one mip of a cube, clamped within each face.
struct CubeSampler {
    faces: Vec<Vec<[f32; 4]>>,
    extent: Extent2d,
}

impl CubeSampler {
    fn sample(&self, dir: Vec3) -> Vec3 {
        let (layer, u, v) = texel_for_direction(dir);
        let face = &self.faces[layer as usize];
        let (w, h) = (self.extent.width, self.extent.height);
        let x = (u * w as f32 - 0.5).clamp(0.0, (w - 1) as f32);
        let y = (v * h as f32 - 0.5).clamp(0.0, (h - 1) as f32);
        let (x0, y0) = (x.floor() as u32, y.floor() as u32);
        let (x1, y1) = ((x0 + 1).min(w - 1), (y0 + 1).min(h - 1));
        let (tx, ty) = (x - x0 as f32, y - y0 as f32);
        let texel = |x: u32, y: u32| {
            let [r, g, b, _] = face[(y * w + x) as usize];
            Vec3::new(r, g, b)
        };
        let top = texel(x0, y0).lerp(texel(x1, y0), tx);
        let bottom = texel(x0, y1).lerp(texel(x1, y1), tx);
        top.lerp(bottom, ty)
    }
}
