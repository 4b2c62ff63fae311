use crate::{
    camera::{CubeFace, CubeFaceBasis},
    error::IblResult,
    gpu::{
        ClearValue, CommandList, ImageCopy, ImageLayout, LayoutTracker, Rect2d, Subresource,
        SubresourceRange, Viewport,
    },
    render::{
        context::MeshBuffers,
        convolution::{
            ConvolutionPass, binding::SourceBinding, mip_viewport, offscreen::OffscreenTarget,
            roughness_for_mip,
        },
        pipeline::{FaceTransform, Pipeline, PrefilterRoughness, PushConstant},
        texture::Texture,
    },
};

/// Records the whole bake into one command list.
///
/// The offscreen image cycles ColorAttachment -> TransferSrc -> ColorAttachment
/// around every copy; the destination goes to TransferDst once before the
/// loop and to ShaderReadOnly once after it.
pub struct ConvolutionRecorder<'a> {
    pub pipeline: &'a Pipeline,
    pub mesh: &'a MeshBuffers,
    pub binding: &'a SourceBinding,
    pub target: &'a OffscreenTarget,
    pub destination: &'a Texture,
    pub pass: &'a ConvolutionPass,
}

impl ConvolutionRecorder<'_> {
    pub fn record(&self) -> IblResult<CommandList> {
        let mut commands = CommandList::new();
        let mut layouts = LayoutTracker::new();
        let layout = self.pipeline.layout().handle();

        commands.bind_pipeline(self.pipeline.handle());
        commands.bind_descriptor_sets(layout, 0, &[self.binding.set()]);
        commands.bind_vertex_buffer(0, self.mesh.vertex_buffer());
        commands.bind_index_buffer(self.mesh.index_buffer(), self.mesh.index_type());

        let offscreen = self.target.image();
        let destination = self.destination.image();
        let offscreen_range = SubresourceRange::whole(1, 1);
        let destination_range =
            SubresourceRange::whole(self.destination.mip_levels(), self.destination.layer_count());
        layouts.track(offscreen, ImageLayout::Undefined);
        layouts.track(destination, ImageLayout::Undefined);

        commands.pipeline_barrier(layouts.transition(
            offscreen,
            ImageLayout::Undefined,
            ImageLayout::ColorAttachment,
            offscreen_range,
        )?);
        commands.pipeline_barrier(layouts.transition(
            destination,
            ImageLayout::Undefined,
            ImageLayout::TransferDst,
            destination_range,
        )?);

        let full = Rect2d::from_extent(self.target.extent());
        let basis = CubeFaceBasis::new(self.pass.resolution);
        let mip_levels = self.destination.mip_levels();
        for mip in 0..mip_levels {
            let size = mip_viewport(self.pass.resolution, mip);
            let roughness = roughness_for_mip(mip, mip_levels);
            for face in CubeFace::ALL {
                commands.begin_render_pass(
                    self.pipeline.render_pass(),
                    self.target.framebuffer(),
                    full,
                    &[
                        ClearValue::Color([0.0, 0.0, 0.0, 1.0]),
                        ClearValue::DepthStencil {
                            depth: 1.0,
                            stencil: 0,
                        },
                    ],
                );
                commands.set_viewport(Viewport::new(size, size));
                commands.set_scissor(full);
                let transform = FaceTransform::new(basis.view_projection(face));
                commands.push_constants(
                    layout,
                    FaceTransform::STAGES,
                    FaceTransform::OFFSET,
                    transform.bytes(),
                );
                if self.pass.pushes_roughness() {
                    commands.push_constants(
                        layout,
                        PrefilterRoughness::STAGES,
                        PrefilterRoughness::OFFSET,
                        PrefilterRoughness { roughness }.bytes(),
                    );
                }
                commands.draw_indexed(self.mesh.index_count(), 1);
                commands.end_render_pass();

                self.copy_face(&mut commands, &mut layouts, face, mip)?;
            }
        }

        commands.pipeline_barrier(layouts.transition(
            destination,
            ImageLayout::TransferDst,
            ImageLayout::ShaderReadOnly,
            destination_range,
        )?);
        Ok(commands)
    }

    fn copy_face(
        &self,
        commands: &mut CommandList,
        layouts: &mut LayoutTracker,
        face: CubeFace,
        mip: u32,
    ) -> IblResult<()> {
        let offscreen = self.target.image();
        let range = SubresourceRange::whole(1, 1);
        commands.pipeline_barrier(layouts.transition(
            offscreen,
            ImageLayout::ColorAttachment,
            ImageLayout::TransferSrc,
            range,
        )?);

        layouts.expect(self.destination.image(), ImageLayout::TransferDst)?;
        let extent = self.destination.extent().mip(mip);
        commands.copy_image(
            offscreen,
            self.destination.image(),
            &[ImageCopy {
                src: Subresource::layer(0, 0),
                dst: Subresource::layer(face.layer(), mip),
                extent,
            }],
        );

        commands.pipeline_barrier(layouts.transition(
            offscreen,
            ImageLayout::TransferSrc,
            ImageLayout::ColorAttachment,
            range,
        )?);
        Ok(())
    }
}
