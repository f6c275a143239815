//! Render targets
//!
//! [`Film`] is the raster pass output: four float G-buffer targets, the
//! integer picking target and depth. [`RayTracingFilm`] holds the storage
//! images the ray-trace pass writes and accumulates into.

use ash::vk;

use crate::foundation::logging::debug;
use crate::render::api::{
    ClearValue, CommandBufferHandle, DescriptorBinding, DescriptorResource, DescriptorSetHandle,
    DescriptorSetLayoutHandle, DescriptorWrite, DeviceError, DeviceResult, FramebufferHandle, ImageDesc,
    ImageHandle, RenderDevice, RenderPassDesc, RenderPassHandle,
};
use crate::render::resources::{transition_images, ImageState, TrackedImage};

/// Picking value of pixels no entity covers
pub const NO_ENTITY: [u32; 2] = [u32::MAX; 2];

/// Initial selection, distinct from [`NO_ENTITY`] so nothing counts as selected
pub const NOTHING_SELECTED: [u32; 2] = [0xFFFF_FFFE; 2];

/// Format of the albedo, position, normal and radiance targets
pub const GBUFFER_FORMAT: vk::Format = vk::Format::R32G32B32A32_SFLOAT;

/// Format of the picking target, two packed instance IDs per pixel
pub const PICKING_FORMAT: vk::Format = vk::Format::R32G32_UINT;

/// Depth format
pub const DEPTH_FORMAT: vk::Format = vk::Format::D32_SFLOAT;

/// Raster pass targets
pub struct Film {
    extent: vk::Extent2D,
    render_pass: RenderPassHandle,
    albedo: TrackedImage,
    position: TrackedImage,
    normal: TrackedImage,
    radiance: TrackedImage,
    stencil: TrackedImage,
    depth: TrackedImage,
    framebuffer: FramebufferHandle,
}

impl Film {
    /// Color attachments written by every raster pipeline
    pub const COLOR_ATTACHMENT_COUNT: u32 = 5;

    /// Attachments in framebuffer order: albedo, position, normal, radiance,
    /// picking, depth
    pub fn render_pass_desc() -> RenderPassDesc {
        RenderPassDesc {
            color_formats: vec![GBUFFER_FORMAT, GBUFFER_FORMAT, GBUFFER_FORMAT, GBUFFER_FORMAT, PICKING_FORMAT],
            depth_format: Some(DEPTH_FORMAT),
            final_color_layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
        }
    }

    /// Clear values matching [`render_pass_desc`](Self::render_pass_desc)
    pub fn clear_values() -> [ClearValue; 6] {
        let black = ClearValue::Color([0.0; 4]);
        [
            black,
            black,
            black,
            black,
            ClearValue::ColorUint([u32::MAX; 4]),
            ClearValue::DepthStencil(1.0, 0),
        ]
    }

    /// Create the targets and their framebuffer for `render_pass`
    pub fn new(
        device: &mut dyn RenderDevice,
        render_pass: RenderPassHandle,
        width: u32,
        height: u32,
    ) -> DeviceResult<Self> {
        let color_usage = vk::ImageUsageFlags::COLOR_ATTACHMENT
            | vk::ImageUsageFlags::SAMPLED
            | vk::ImageUsageFlags::TRANSFER_SRC;
        let color = |device: &mut dyn RenderDevice, format, usage| -> DeviceResult<TrackedImage> {
            let image = device.create_image(&ImageDesc::color(width, height, format, usage))?;
            Ok(TrackedImage::new(image, vk::ImageAspectFlags::COLOR))
        };

        let albedo = color(device, GBUFFER_FORMAT, color_usage)?;
        let position = color(device, GBUFFER_FORMAT, color_usage)?;
        let normal = color(device, GBUFFER_FORMAT, color_usage)?;
        let radiance = color(device, GBUFFER_FORMAT, color_usage)?;
        let stencil = color(
            device,
            PICKING_FORMAT,
            vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::TRANSFER_SRC,
        )?;
        let depth = TrackedImage::new(
            device.create_image(&ImageDesc::depth(width, height, DEPTH_FORMAT))?,
            vk::ImageAspectFlags::DEPTH,
        );

        let mut film = Self {
            extent: vk::Extent2D { width, height },
            render_pass,
            albedo,
            position,
            normal,
            radiance,
            stencil,
            depth,
            framebuffer: FramebufferHandle(0),
        };
        film.framebuffer = device.create_framebuffer(render_pass, &film.attachments(), film.extent)?;
        debug!("[FILM] Created {}x{} raster targets", width, height);
        Ok(film)
    }

    /// Re-create every target at the new size. The device must be idle.
    pub fn resize(&mut self, device: &mut dyn RenderDevice, width: u32, height: u32) -> DeviceResult<()> {
        device.destroy_framebuffer(self.framebuffer);
        for image in self.images_mut() {
            device.resize_image(image.handle(), width, height)?;
            image.assume(ImageState::UNDEFINED);
        }
        self.extent = vk::Extent2D { width, height };
        self.framebuffer = device.create_framebuffer(self.render_pass, &self.attachments(), self.extent)?;
        debug!("[FILM] Resized raster targets to {}x{}", width, height);
        Ok(())
    }

    /// Target size
    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    /// Framebuffer over all targets
    pub fn framebuffer(&self) -> FramebufferHandle {
        self.framebuffer
    }

    /// Render pass the framebuffer was created for
    pub fn render_pass(&self) -> RenderPassHandle {
        self.render_pass
    }

    /// Albedo target
    pub fn albedo(&self) -> &TrackedImage {
        &self.albedo
    }

    /// World-space position target
    pub fn position(&self) -> &TrackedImage {
        &self.position
    }

    /// World-space normal target
    pub fn normal(&self) -> &TrackedImage {
        &self.normal
    }

    /// Raster radiance target
    pub fn radiance(&self) -> &TrackedImage {
        &self.radiance
    }

    /// Picking target
    pub fn stencil(&self) -> &TrackedImage {
        &self.stencil
    }

    /// Depth target
    pub fn depth(&self) -> &TrackedImage {
        &self.depth
    }

    fn attachments(&self) -> [ImageHandle; 6] {
        [
            self.albedo.handle(),
            self.position.handle(),
            self.normal.handle(),
            self.radiance.handle(),
            self.stencil.handle(),
            self.depth.handle(),
        ]
    }

    fn images_mut(&mut self) -> [&mut TrackedImage; 6] {
        [
            &mut self.albedo,
            &mut self.position,
            &mut self.normal,
            &mut self.radiance,
            &mut self.stencil,
            &mut self.depth,
        ]
    }

    pub(crate) fn image_mut(&mut self, image: ImageHandle) -> Option<&mut TrackedImage> {
        self.images_mut().into_iter().find(|tracked| tracked.handle() == image)
    }

    /// Make every target writable by the render pass. Earlier readers of
    /// the previous frame's contents finish first.
    pub(crate) fn begin_raster(&mut self, device: &mut dyn RenderDevice, cmd: CommandBufferHandle) {
        let [albedo, position, normal, radiance, stencil, depth] = self.images_mut();
        transition_images(
            device,
            cmd,
            &mut [albedo, position, normal, radiance, stencil],
            ImageState::COLOR_ATTACHMENT,
        );
        transition_images(device, cmd, &mut [depth], ImageState::DEPTH_ATTACHMENT);
    }

    /// Record the render pass stores, then hand the G-buffer to shader reads
    /// and the picking target to transfers.
    pub(crate) fn end_raster(&mut self, device: &mut dyn RenderDevice, cmd: CommandBufferHandle) {
        let [albedo, position, normal, radiance, stencil, depth] = self.images_mut();
        for image in [&mut *albedo, &mut *position, &mut *normal, &mut *radiance, &mut *stencil] {
            image.assume(ImageState::COLOR_ATTACHMENT);
        }
        depth.assume(ImageState::DEPTH_ATTACHMENT);

        transition_images(device, cmd, &mut [albedo, position, normal, radiance], ImageState::SHADER_READ);
        transition_images(device, cmd, &mut [stencil], ImageState::TRANSFER_SRC);
    }

    /// Instance pair under pixel `(x, y)`.
    ///
    /// Outside the targets, or before the first raster pass finished, this
    /// is [`NO_ENTITY`] and the device is not touched. Picking reads the
    /// stencil target synchronously, so it must happen after `end_frame`;
    /// a pick while a frame is recording is an error.
    pub fn pick(&self, device: &mut dyn RenderDevice, x: i32, y: i32) -> DeviceResult<[u32; 2]> {
        if device.is_recording() {
            return Err(DeviceError::invalid("pick while a frame is recording"));
        }
        let (Ok(x), Ok(y)) = (u32::try_from(x), u32::try_from(y)) else {
            return Ok(NO_ENTITY);
        };
        if x >= self.extent.width || y >= self.extent.height {
            return Ok(NO_ENTITY);
        }
        if self.stencil.layout() != vk::ImageLayout::TRANSFER_SRC_OPTIMAL {
            return Ok(NO_ENTITY);
        }

        let texel = device.read_image_texel(self.stencil.handle(), self.stencil.layout(), x, y)?;
        if texel.len() != std::mem::size_of::<[u32; 2]>() {
            return Err(DeviceError::invalid(format!(
                "picking texel of {} bytes",
                texel.len()
            )));
        }
        Ok(bytemuck::pod_read_unaligned(&texel))
    }

    /// Release the targets
    pub fn destroy(self, device: &mut dyn RenderDevice) {
        device.destroy_framebuffer(self.framebuffer);
        for image in self.attachments() {
            device.destroy_image(image);
        }
    }
}

/// Hovered and selected instance pairs, fed by [`Film::pick`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SelectionState {
    hovering: [u32; 2],
    selected: [u32; 2],
}

impl Default for SelectionState {
    fn default() -> Self {
        Self {
            hovering: NO_ENTITY,
            selected: NOTHING_SELECTED,
        }
    }
}

impl SelectionState {
    /// Record the pair under the cursor
    pub fn hover(&mut self, picked: [u32; 2]) {
        self.hovering = picked;
    }

    /// Pair under the cursor
    pub fn hovering(&self) -> [u32; 2] {
        self.hovering
    }

    /// Whether the cursor is over an entity
    pub fn is_hovering(&self) -> bool {
        self.hovering != NO_ENTITY
    }

    /// Select whatever is hovered; clicking empty space clears the selection
    pub fn select_hovered(&mut self) {
        self.selected = if self.is_hovering() {
            self.hovering
        } else {
            NOTHING_SELECTED
        };
    }

    /// Selected pair
    pub fn selected(&self) -> [u32; 2] {
        self.selected
    }

    /// Whether anything is selected
    pub fn has_selection(&self) -> bool {
        self.selected != NOTHING_SELECTED
    }

    /// Drop the selection
    pub fn clear_selection(&mut self) {
        self.selected = NOTHING_SELECTED;
    }
}

/// Format of the ray-traced result and the accumulated radiance
pub const RAY_TRACING_FORMAT: vk::Format = vk::Format::R32G32B32A32_SFLOAT;

/// Format of the accumulated sample weight
pub const WEIGHT_FORMAT: vk::Format = vk::Format::R32_SFLOAT;

/// Storage images of the ray-trace pass
///
/// The accumulation images keep their contents across frames; the shaders
/// restart accumulation when the scene's sample count drops to zero.
pub struct RayTracingFilm {
    extent: vk::Extent2D,
    result: TrackedImage,
    accumulated_radiance: TrackedImage,
    accumulated_weight: TrackedImage,
    layout: DescriptorSetLayoutHandle,
    set: DescriptorSetHandle,
}

impl RayTracingFilm {
    /// Create the images, their layout and descriptor set
    pub fn new(device: &mut dyn RenderDevice, width: u32, height: u32) -> DeviceResult<Self> {
        let usage = vk::ImageUsageFlags::STORAGE | vk::ImageUsageFlags::TRANSFER_SRC;
        let mut storage = |format| -> DeviceResult<TrackedImage> {
            let image = device.create_image(&ImageDesc::color(width, height, format, usage))?;
            Ok(TrackedImage::new(image, vk::ImageAspectFlags::COLOR))
        };
        let result = storage(RAY_TRACING_FORMAT)?;
        let accumulated_radiance = storage(RAY_TRACING_FORMAT)?;
        let accumulated_weight = storage(WEIGHT_FORMAT)?;

        let bindings: Vec<DescriptorBinding> = (0..3)
            .map(|binding| {
                DescriptorBinding::single(
                    binding,
                    vk::DescriptorType::STORAGE_IMAGE,
                    vk::ShaderStageFlags::RAYGEN_KHR,
                )
            })
            .collect();
        let layout = device.create_descriptor_set_layout(&bindings)?;
        let set = device.allocate_descriptor_set(layout)?;

        let film = Self {
            extent: vk::Extent2D { width, height },
            result,
            accumulated_radiance,
            accumulated_weight,
            layout,
            set,
        };
        film.write_set(device)?;
        debug!("[FILM] Created {}x{} ray tracing targets", width, height);
        Ok(film)
    }

    fn write_set(&self, device: &mut dyn RenderDevice) -> DeviceResult<()> {
        device.write_descriptor_set(
            self.set,
            &[
                DescriptorWrite::new(0, DescriptorResource::StorageImage(self.result.handle())),
                DescriptorWrite::new(1, DescriptorResource::StorageImage(self.accumulated_radiance.handle())),
                DescriptorWrite::new(2, DescriptorResource::StorageImage(self.accumulated_weight.handle())),
            ],
        )
    }

    /// Re-create the images at the new size and rebind them. The device
    /// must be idle.
    pub fn resize(&mut self, device: &mut dyn RenderDevice, width: u32, height: u32) -> DeviceResult<()> {
        for image in self.images_mut() {
            device.resize_image(image.handle(), width, height)?;
            image.assume(ImageState::UNDEFINED);
        }
        self.extent = vk::Extent2D { width, height };
        self.write_set(device)?;
        debug!("[FILM] Resized ray tracing targets to {}x{}", width, height);
        Ok(())
    }

    /// Image size
    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    /// Storage image set layout (set 4 of the ray-tracing pipeline)
    pub fn layout(&self) -> DescriptorSetLayoutHandle {
        self.layout
    }

    /// Storage image set
    pub fn descriptor_set(&self) -> DescriptorSetHandle {
        self.set
    }

    /// Final ray-traced image
    pub fn result(&self) -> &TrackedImage {
        &self.result
    }

    /// Running radiance sum
    pub fn accumulated_radiance(&self) -> &TrackedImage {
        &self.accumulated_radiance
    }

    /// Running sample weight
    pub fn accumulated_weight(&self) -> &TrackedImage {
        &self.accumulated_weight
    }

    fn images_mut(&mut self) -> [&mut TrackedImage; 3] {
        [&mut self.result, &mut self.accumulated_radiance, &mut self.accumulated_weight]
    }

    pub(crate) fn image_mut(&mut self, image: ImageHandle) -> Option<&mut TrackedImage> {
        self.images_mut().into_iter().find(|tracked| tracked.handle() == image)
    }

    /// Move every image to `GENERAL` for the ray-generation shader. The
    /// first use after creation or resize starts from `UNDEFINED`.
    pub(crate) fn begin_trace(&mut self, device: &mut dyn RenderDevice, cmd: CommandBufferHandle) {
        let [result, radiance, weight] = self.images_mut();
        transition_images(device, cmd, &mut [result, radiance, weight], ImageState::STORAGE);
    }

    /// Release the images and their set
    pub fn destroy(self, device: &mut dyn RenderDevice) {
        device.free_descriptor_set(self.set);
        for image in [self.result, self.accumulated_radiance, self.accumulated_weight] {
            device.destroy_image(image.handle());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::backends::headless::HeadlessDevice;

    fn film(device: &mut HeadlessDevice, width: u32, height: u32) -> Film {
        let render_pass = device.create_render_pass(&Film::render_pass_desc()).unwrap();
        Film::new(device, render_pass, width, height).unwrap()
    }

    fn rasterize(device: &mut HeadlessDevice, film: &mut Film) {
        let frame = device.begin_frame().unwrap();
        let cmd = frame.command_buffer;
        film.begin_raster(device, cmd);
        device
            .cmd_begin_render_pass(cmd, film.render_pass(), film.framebuffer(), &Film::clear_values())
            .unwrap();
        device.cmd_end_render_pass(cmd);
        film.end_raster(device, cmd);
        device.end_frame(frame).unwrap();
    }

    #[test]
    fn test_pick_outside_bounds_is_no_entity() {
        let mut device = HeadlessDevice::new(2);
        let mut film = film(&mut device, 4, 3);
        rasterize(&mut device, &mut film);

        let before = device.stats().single_time_submits;
        for (x, y) in [(-1, 0), (0, -1), (4, 0), (0, 3), (i32::MAX, i32::MAX)] {
            assert_eq!(film.pick(&mut device, x, y).unwrap(), NO_ENTITY);
        }
        assert_eq!(device.stats().single_time_submits, before);
    }

    #[test]
    fn test_pick_before_first_frame_is_no_entity() {
        let mut device = HeadlessDevice::new(2);
        let film = film(&mut device, 4, 4);
        assert_eq!(film.pick(&mut device, 1, 1).unwrap(), NO_ENTITY);
    }

    #[test]
    fn test_cleared_picking_target_reads_no_entity() {
        let mut device = HeadlessDevice::new(2);
        let mut film = film(&mut device, 4, 4);
        rasterize(&mut device, &mut film);
        assert_eq!(film.pick(&mut device, 2, 2).unwrap(), NO_ENTITY);
    }

    #[test]
    fn test_pick_reads_written_instance_pair() {
        let mut device = HeadlessDevice::new(2);
        let mut film = film(&mut device, 4, 4);
        rasterize(&mut device, &mut film);

        let pair: [u32; 2] = [3, 11];
        device
            .write_image_texel(film.stencil().handle(), 1, 2, bytemuck::cast_slice(&pair))
            .unwrap();
        assert_eq!(film.pick(&mut device, 1, 2).unwrap(), pair);
        assert_eq!(film.pick(&mut device, 2, 1).unwrap(), NO_ENTITY);
    }

    #[test]
    fn test_pick_while_recording_is_rejected() {
        let mut device = HeadlessDevice::new(2);
        let mut film = film(&mut device, 4, 4);

        let frame = device.begin_frame().unwrap();
        let cmd = frame.command_buffer;
        film.begin_raster(&mut device, cmd);
        device
            .cmd_begin_render_pass(cmd, film.render_pass(), film.framebuffer(), &Film::clear_values())
            .unwrap();
        device.cmd_end_render_pass(cmd);
        film.end_raster(&mut device, cmd);
        // The stencil only looks readable; nothing was submitted yet.
        assert_eq!(film.stencil().layout(), vk::ImageLayout::TRANSFER_SRC_OPTIMAL);
        let before = device.stats().single_time_submits;
        assert!(film.pick(&mut device, 1, 1).is_err());
        assert_eq!(device.stats().single_time_submits, before);

        device.end_frame(frame).unwrap();
        assert_eq!(film.pick(&mut device, 1, 1).unwrap(), NO_ENTITY);
    }

    #[test]
    fn test_end_raster_hands_targets_to_readers() {
        let mut device = HeadlessDevice::new(2);
        let mut film = film(&mut device, 2, 2);
        rasterize(&mut device, &mut film);

        assert_eq!(
            device.image_layout(film.albedo().handle()),
            Some(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)
        );
        assert_eq!(film.stencil().layout(), vk::ImageLayout::TRANSFER_SRC_OPTIMAL);
        assert_eq!(device.stats().layout_mismatches, 0);

        // Second frame starts from the tracked reader states.
        rasterize(&mut device, &mut film);
        assert_eq!(device.stats().layout_mismatches, 0);
    }

    #[test]
    fn test_resize_resets_targets() {
        let mut device = HeadlessDevice::new(2);
        let mut film = film(&mut device, 4, 4);
        rasterize(&mut device, &mut film);

        film.resize(&mut device, 8, 2).unwrap();
        assert_eq!(film.extent(), vk::Extent2D { width: 8, height: 2 });
        assert_eq!(film.stencil().layout(), vk::ImageLayout::UNDEFINED);
        assert_eq!(film.pick(&mut device, 6, 1).unwrap(), NO_ENTITY);
        assert_eq!(
            device.image_extent(film.depth().handle()).unwrap(),
            vk::Extent2D { width: 8, height: 2 }
        );

        rasterize(&mut device, &mut film);
        assert_eq!(film.pick(&mut device, 7, 1).unwrap(), NO_ENTITY);
    }

    #[test]
    fn test_selection_follows_hover() {
        let mut selection = SelectionState::default();
        assert!(!selection.has_selection());
        assert_eq!(selection.selected(), NOTHING_SELECTED);

        selection.hover([4, 0]);
        selection.select_hovered();
        assert_eq!(selection.selected(), [4, 0]);

        selection.hover(NO_ENTITY);
        assert!(!selection.is_hovering());
        selection.select_hovered();
        assert!(!selection.has_selection());
    }

    #[test]
    fn test_ray_tracing_film_binds_storage_images() {
        let mut device = HeadlessDevice::new(2);
        let mut film = RayTracingFilm::new(&mut device, 4, 4).unwrap();
        let set = film.descriptor_set();

        assert_eq!(
            device.descriptor(set, 0, 0),
            Some(&DescriptorResource::StorageImage(film.result().handle()))
        );
        assert_eq!(
            device.descriptor(set, 2, 0),
            Some(&DescriptorResource::StorageImage(film.accumulated_weight().handle()))
        );

        let frame = device.begin_frame().unwrap();
        film.begin_trace(&mut device, frame.command_buffer);
        device.end_frame(frame).unwrap();
        assert_eq!(film.accumulated_radiance().layout(), vk::ImageLayout::GENERAL);

        film.resize(&mut device, 2, 6).unwrap();
        assert_eq!(film.result().layout(), vk::ImageLayout::UNDEFINED);
        assert_eq!(
            device.image_extent(film.accumulated_weight().handle()).unwrap(),
            vk::Extent2D { width: 2, height: 6 }
        );
    }
}
