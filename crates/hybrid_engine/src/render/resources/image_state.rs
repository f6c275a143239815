//! Image layout and access tracking
//!
//! Every render target remembers the layout it is in and the stage/access of
//! its last use. A transition emits one barrier whose source half is that last
//! use, so a writer always completes before the next reader starts.

use ash::vk;

use crate::render::api::{CommandBufferHandle, ImageBarrier, ImageHandle, RenderDevice};

/// Layout plus the stage and access of the last use
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageState {
    /// Image layout
    pub layout: vk::ImageLayout,
    /// Pipeline stage of the use
    pub stage: vk::PipelineStageFlags,
    /// Access of the use
    pub access: vk::AccessFlags,
}

impl ImageState {
    /// Freshly created or resized, contents undefined
    pub const UNDEFINED: Self = Self {
        layout: vk::ImageLayout::UNDEFINED,
        stage: vk::PipelineStageFlags::TOP_OF_PIPE,
        access: vk::AccessFlags::empty(),
    };

    /// Written as a color attachment by a render pass
    pub const COLOR_ATTACHMENT: Self = Self {
        layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
        stage: vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
        access: vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
    };

    /// Written as a depth attachment by a render pass
    pub const DEPTH_ATTACHMENT: Self = Self {
        layout: vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
        stage: vk::PipelineStageFlags::LATE_FRAGMENT_TESTS,
        access: vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
    };

    /// Sampled by fragment or ray-tracing shaders
    pub const SHADER_READ: Self = Self {
        layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        stage: vk::PipelineStageFlags::from_raw(
            vk::PipelineStageFlags::FRAGMENT_SHADER.as_raw()
                | vk::PipelineStageFlags::RAY_TRACING_SHADER_KHR.as_raw(),
        ),
        access: vk::AccessFlags::SHADER_READ,
    };

    /// Read and written as a storage image by ray-tracing shaders
    pub const STORAGE: Self = Self {
        layout: vk::ImageLayout::GENERAL,
        stage: vk::PipelineStageFlags::RAY_TRACING_SHADER_KHR,
        access: vk::AccessFlags::from_raw(
            vk::AccessFlags::SHADER_READ.as_raw() | vk::AccessFlags::SHADER_WRITE.as_raw(),
        ),
    };

    /// Source of a copy or blit
    pub const TRANSFER_SRC: Self = Self {
        layout: vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
        stage: vk::PipelineStageFlags::TRANSFER,
        access: vk::AccessFlags::TRANSFER_READ,
    };

    fn writes(&self) -> bool {
        self.access.intersects(
            vk::AccessFlags::SHADER_WRITE
                | vk::AccessFlags::COLOR_ATTACHMENT_WRITE
                | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE
                | vk::AccessFlags::TRANSFER_WRITE
                | vk::AccessFlags::HOST_WRITE,
        )
    }
}

/// Image handle plus its tracked state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackedImage {
    handle: ImageHandle,
    aspect: vk::ImageAspectFlags,
    state: ImageState,
}

impl TrackedImage {
    /// Track a freshly created image
    pub fn new(handle: ImageHandle, aspect: vk::ImageAspectFlags) -> Self {
        Self {
            handle,
            aspect,
            state: ImageState::UNDEFINED,
        }
    }

    /// Underlying image
    pub fn handle(&self) -> ImageHandle {
        self.handle
    }

    /// Current state
    pub fn state(&self) -> ImageState {
        self.state
    }

    /// Current layout
    pub fn layout(&self) -> vk::ImageLayout {
        self.state.layout
    }

    /// Record a state change that happened implicitly (render pass store,
    /// resize back to `UNDEFINED`).
    pub fn assume(&mut self, state: ImageState) {
        self.state = state;
    }

    /// Barrier moving the image to `target`, or `None` when it already is
    /// there and neither side writes.
    pub fn transition(&mut self, target: ImageState) -> Option<ImageBarrier> {
        let previous = self.state;
        self.state = target;
        if previous.layout == target.layout && !previous.writes() && !target.writes() {
            return None;
        }
        Some(ImageBarrier {
            image: self.handle,
            aspect: self.aspect,
            old_layout: previous.layout,
            new_layout: target.layout,
            src_stage: previous.stage,
            src_access: previous.access,
            dst_stage: target.stage,
            dst_access: target.access,
        })
    }
}

/// Transition several images with one barrier call
pub fn transition_images(
    device: &mut dyn RenderDevice,
    cmd: CommandBufferHandle,
    images: &mut [&mut TrackedImage],
    target: ImageState,
) {
    let barriers: Vec<ImageBarrier> = images.iter_mut().filter_map(|image| image.transition(target)).collect();
    if !barriers.is_empty() {
        device.cmd_pipeline_barrier(cmd, &barriers);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_masks_come_from_previous_writer() {
        let mut image = TrackedImage::new(ImageHandle(1), vk::ImageAspectFlags::COLOR);
        image.assume(ImageState::COLOR_ATTACHMENT);

        let barrier = image.transition(ImageState::SHADER_READ).unwrap();
        assert_eq!(barrier.old_layout, vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL);
        assert_eq!(barrier.src_stage, vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT);
        assert_eq!(barrier.src_access, vk::AccessFlags::COLOR_ATTACHMENT_WRITE);
        assert_eq!(barrier.dst_access, vk::AccessFlags::SHADER_READ);
        assert_eq!(image.layout(), vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);
    }

    #[test]
    fn test_read_to_read_in_same_layout_is_elided() {
        let mut image = TrackedImage::new(ImageHandle(1), vk::ImageAspectFlags::COLOR);
        image.assume(ImageState::SHADER_READ);
        assert!(image.transition(ImageState::SHADER_READ).is_none());
    }

    #[test]
    fn test_storage_to_storage_keeps_write_dependency() {
        let mut image = TrackedImage::new(ImageHandle(1), vk::ImageAspectFlags::COLOR);
        image.assume(ImageState::STORAGE);
        let barrier = image.transition(ImageState::STORAGE).unwrap();
        assert_eq!(barrier.old_layout, barrier.new_layout);
        assert!(barrier.src_access.contains(vk::AccessFlags::SHADER_WRITE));
    }
}
