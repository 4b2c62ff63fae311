//! Image layout state, tracked explicitly per image.
//!
//! Nothing here tracks usage automatically: every transition names the layout
//! it expects to leave, and the tracker refuses the barrier if that is not the
//! layout the image is actually in.

use std::collections::HashMap;

use bitflags::bitflags;

use super::ImageHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ImageLayout {
    /// Contents are undefined; only valid as the source of a transition.
    Undefined,
    ColorAttachment,
    TransferSrc,
    TransferDst,
    ShaderReadOnly,
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct AccessFlags: u32 {
        const COLOR_ATTACHMENT_WRITE = 1 << 0;
        const TRANSFER_READ = 1 << 1;
        const TRANSFER_WRITE = 1 << 2;
        const SHADER_READ = 1 << 3;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct PipelineStages: u32 {
        const TOP_OF_PIPE = 1 << 0;
        const COLOR_ATTACHMENT_OUTPUT = 1 << 1;
        const TRANSFER = 1 << 2;
        const FRAGMENT_SHADER = 1 << 3;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubresourceRange {
    pub base_mip: u32,
    pub mip_count: u32,
    pub base_layer: u32,
    pub layer_count: u32,
}

impl SubresourceRange {
    pub fn whole(mip_count: u32, layer_count: u32) -> Self {
        Self {
            base_mip: 0,
            mip_count,
            base_layer: 0,
            layer_count,
        }
    }

    pub fn contains(&self, layer: u32, mip_level: u32) -> bool {
        (self.base_layer..self.base_layer + self.layer_count).contains(&layer)
            && (self.base_mip..self.base_mip + self.mip_count).contains(&mip_level)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageBarrier {
    pub image: ImageHandle,
    pub old_layout: ImageLayout,
    pub new_layout: ImageLayout,
    pub src_access: AccessFlags,
    pub dst_access: AccessFlags,
    pub src_stage: PipelineStages,
    pub dst_stage: PipelineStages,
    pub range: SubresourceRange,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum LayoutError {
    #[error("image {image:?} is not tracked")]
    Untracked { image: ImageHandle },
    #[error("image {image:?} is in {actual:?} but the transition expects {expected:?}")]
    Mismatch {
        image: ImageHandle,
        expected: ImageLayout,
        actual: ImageLayout,
    },
    #[error("no barrier is defined for {from:?} -> {to:?}")]
    Unsupported { from: ImageLayout, to: ImageLayout },
}

/// Access and stage masks for the transitions the bake pipeline issues.
pub fn transition_masks(
    from: ImageLayout,
    to: ImageLayout,
) -> Option<(AccessFlags, AccessFlags, PipelineStages, PipelineStages)> {
    use ImageLayout::*;
    let masks = match (from, to) {
        (Undefined, ColorAttachment) => (
            AccessFlags::empty(),
            AccessFlags::COLOR_ATTACHMENT_WRITE,
            PipelineStages::TOP_OF_PIPE,
            PipelineStages::COLOR_ATTACHMENT_OUTPUT,
        ),
        (Undefined, TransferDst) => (
            AccessFlags::empty(),
            AccessFlags::TRANSFER_WRITE,
            PipelineStages::TOP_OF_PIPE,
            PipelineStages::TRANSFER,
        ),
        (ColorAttachment, TransferSrc) => (
            AccessFlags::COLOR_ATTACHMENT_WRITE,
            AccessFlags::TRANSFER_READ,
            PipelineStages::COLOR_ATTACHMENT_OUTPUT,
            PipelineStages::TRANSFER,
        ),
        (TransferSrc, ColorAttachment) => (
            AccessFlags::TRANSFER_READ,
            AccessFlags::COLOR_ATTACHMENT_WRITE,
            PipelineStages::TRANSFER,
            PipelineStages::COLOR_ATTACHMENT_OUTPUT,
        ),
        (TransferDst, ShaderReadOnly) => (
            AccessFlags::TRANSFER_WRITE,
            AccessFlags::SHADER_READ,
            PipelineStages::TRANSFER,
            PipelineStages::FRAGMENT_SHADER,
        ),
        _ => return None,
    };
    Some(masks)
}

/// Current layout of every image a recording touches.
#[derive(Debug, Default)]
pub struct LayoutTracker {
    layouts: HashMap<ImageHandle, ImageLayout>,
}

impl LayoutTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn track(&mut self, image: ImageHandle, layout: ImageLayout) {
        self.layouts.insert(image, layout);
    }

    pub fn current(&self, image: ImageHandle) -> Option<ImageLayout> {
        self.layouts.get(&image).copied()
    }

    pub fn expect(&self, image: ImageHandle, layout: ImageLayout) -> Result<(), LayoutError> {
        match self.current(image) {
            None => Err(LayoutError::Untracked { image }),
            Some(actual) if actual != layout => Err(LayoutError::Mismatch {
                image,
                expected: layout,
                actual,
            }),
            Some(_) => Ok(()),
        }
    }

    /// Builds the barrier moving `image` from `from` to `to` and records the
    /// new layout.
    pub fn transition(
        &mut self,
        image: ImageHandle,
        from: ImageLayout,
        to: ImageLayout,
        range: SubresourceRange,
    ) -> Result<ImageBarrier, LayoutError> {
        self.expect(image, from)?;
        let (src_access, dst_access, src_stage, dst_stage) =
            transition_masks(from, to).ok_or(LayoutError::Unsupported { from, to })?;
        self.layouts.insert(image, to);
        Ok(ImageBarrier {
            image,
            old_layout: from,
            new_layout: to,
            src_access,
            dst_access,
            src_stage,
            dst_stage,
            range,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::DeviceObject;

    fn image(raw: u64) -> ImageHandle {
        ImageHandle::from_raw(raw)
    }

    #[test]
    fn attachment_to_transfer_serializes_writes_before_reads() {
        let mut tracker = LayoutTracker::new();
        tracker.track(image(1), ImageLayout::ColorAttachment);
        let barrier = tracker
            .transition(
                image(1),
                ImageLayout::ColorAttachment,
                ImageLayout::TransferSrc,
                SubresourceRange::whole(1, 1),
            )
            .unwrap();
        assert_eq!(barrier.src_access, AccessFlags::COLOR_ATTACHMENT_WRITE);
        assert_eq!(barrier.dst_access, AccessFlags::TRANSFER_READ);
        assert_eq!(tracker.current(image(1)), Some(ImageLayout::TransferSrc));
    }

    #[test]
    fn mismatched_old_layout_is_rejected() {
        let mut tracker = LayoutTracker::new();
        tracker.track(image(7), ImageLayout::TransferSrc);
        let err = tracker
            .transition(
                image(7),
                ImageLayout::ColorAttachment,
                ImageLayout::TransferSrc,
                SubresourceRange::whole(1, 1),
            )
            .unwrap_err();
        assert_eq!(
            err,
            LayoutError::Mismatch {
                image: image(7),
                expected: ImageLayout::ColorAttachment,
                actual: ImageLayout::TransferSrc,
            }
        );
        // State is untouched by a refused transition.
        assert_eq!(tracker.current(image(7)), Some(ImageLayout::TransferSrc));
    }

    #[test]
    fn untracked_images_and_unknown_transitions_fail() {
        let mut tracker = LayoutTracker::new();
        assert!(matches!(
            tracker.transition(
                image(3),
                ImageLayout::Undefined,
                ImageLayout::TransferDst,
                SubresourceRange::whole(1, 6),
            ),
            Err(LayoutError::Untracked { .. })
        ));

        tracker.track(image(3), ImageLayout::ShaderReadOnly);
        assert_eq!(
            tracker.transition(
                image(3),
                ImageLayout::ShaderReadOnly,
                ImageLayout::ColorAttachment,
                SubresourceRange::whole(1, 6),
            ),
            Err(LayoutError::Unsupported {
                from: ImageLayout::ShaderReadOnly,
                to: ImageLayout::ColorAttachment,
            })
        );
    }
}
