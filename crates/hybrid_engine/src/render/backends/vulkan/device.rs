//! `RenderDevice` implementation for [`VulkanDevice`]

use ash::vk;

use crate::foundation::logging::{debug, warn};
use crate::render::api::{
    format_texel_size, AccelerationStructureHandle, BlasDesc, BufferBarrier, BufferDesc, BufferHandle,
    ClearValue, CommandBufferHandle, DescriptorBinding, DescriptorSetHandle, DescriptorSetLayoutHandle,
    DescriptorWrite, DeviceError, DeviceResult, FrameContext, FramebufferHandle, GraphicsPipelineDesc,
    ImageBarrier, ImageDesc, ImageHandle, MemoryLocation, PipelineHandle, PipelineLayoutHandle,
    RayTracingPipelineDesc, RayTracingProperties, RenderDevice, RenderPassDesc, RenderPassHandle, SamplerDesc,
    SamplerHandle, ShaderBindingRegions, StridedRegion, TlasInstance,
};

use super::super::keys::{to_id, to_key};
use super::descriptors::{self, VulkanDescriptorSet, VulkanSetLayout};
use super::memory::{subresource_range, VulkanBuffer, VulkanImage};
use super::pipelines;
use super::{VulkanDevice, VulkanFramebuffer, VulkanPipeline};

fn strided(region: &StridedRegion) -> vk::StridedDeviceAddressRegionKHR {
    vk::StridedDeviceAddressRegionKHR {
        device_address: region.device_address,
        stride: region.stride,
        size: region.size,
    }
}

fn unknown(kind: &'static str, id: u64) -> DeviceError {
    DeviceError::UnknownHandle { kind, id }
}

impl VulkanDevice {
    fn buffer(&self, handle: BufferHandle) -> DeviceResult<&VulkanBuffer> {
        self.buffers.get(to_key(handle.0)).ok_or(unknown("buffer", handle.0))
    }

    fn image(&self, handle: ImageHandle) -> DeviceResult<&VulkanImage> {
        self.images.get(to_key(handle.0)).ok_or(unknown("image", handle.0))
    }

    fn pipeline_layout(&self, handle: PipelineLayoutHandle) -> DeviceResult<vk::PipelineLayout> {
        self.pipeline_layouts
            .get(to_key(handle.0))
            .copied()
            .ok_or(unknown("pipeline layout", handle.0))
    }

    /// Raw command buffer of `cmd` if it is the one currently recording
    fn recording_buffer(&self, cmd: CommandBufferHandle) -> DeviceResult<vk::CommandBuffer> {
        let slot = usize::try_from(cmd.0).map_err(|_| unknown("command buffer", cmd.0))?;
        if self.recording != Some(slot) {
            return Err(DeviceError::invalid(format!("command buffer {} is not recording", cmd.0)));
        }
        Ok(self.frames[slot].command_buffer)
    }

    /// Like `recording_buffer`, logging instead of failing for infallible commands
    fn command_target(&self, cmd: CommandBufferHandle, what: &str) -> Option<vk::CommandBuffer> {
        match self.recording_buffer(cmd) {
            Ok(buffer) => Some(buffer),
            Err(err) => {
                warn!("[RENDER] Dropped {what}: {err}");
                None
            }
        }
    }

    fn staging_buffer(&self, size: u64, usage: vk::BufferUsageFlags) -> DeviceResult<VulkanBuffer> {
        VulkanBuffer::new(
            self.device(),
            &self.memory_properties,
            &BufferDesc {
                size: size.max(1),
                usage,
                location: MemoryLocation::HostVisible,
            },
        )
    }

    fn record_image_barrier(
        &self,
        cmd: vk::CommandBuffer,
        image: &VulkanImage,
        old_layout: vk::ImageLayout,
        new_layout: vk::ImageLayout,
        (src_stage, src_access): (vk::PipelineStageFlags, vk::AccessFlags),
        (dst_stage, dst_access): (vk::PipelineStageFlags, vk::AccessFlags),
    ) {
        let barrier = vk::ImageMemoryBarrier::builder()
            .old_layout(old_layout)
            .new_layout(new_layout)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .image(image.image)
            .subresource_range(subresource_range(image.desc.aspect))
            .src_access_mask(src_access)
            .dst_access_mask(dst_access)
            .build();
        unsafe {
            self.device().cmd_pipeline_barrier(
                cmd,
                src_stage,
                dst_stage,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[barrier],
            );
        }
    }
}

fn image_copy_region(aspect: vk::ImageAspectFlags, offset: vk::Offset3D, extent: vk::Extent3D) -> vk::BufferImageCopy {
    vk::BufferImageCopy::builder()
        .buffer_offset(0)
        .buffer_row_length(0)
        .buffer_image_height(0)
        .image_subresource(vk::ImageSubresourceLayers {
            aspect_mask: aspect,
            mip_level: 0,
            base_array_layer: 0,
            layer_count: 1,
        })
        .image_offset(offset)
        .image_extent(extent)
        .build()
}

impl RenderDevice for VulkanDevice {
    fn frames_in_flight(&self) -> usize {
        self.frames.len()
    }

    fn current_frame(&self) -> usize {
        self.current_frame
    }

    fn begin_frame(&mut self) -> DeviceResult<FrameContext> {
        if self.recording.is_some() {
            return Err(DeviceError::invalid("begin_frame called while a frame is recording"));
        }
        let frame_index = self.current_frame;
        let slot = &self.frames[frame_index];
        let begin_info = vk::CommandBufferBeginInfo::builder().flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        unsafe {
            self.device().wait_for_fences(&[slot.fence], true, u64::MAX)?;
            self.device()
                .reset_command_buffer(slot.command_buffer, vk::CommandBufferResetFlags::empty())?;
            self.device().begin_command_buffer(slot.command_buffer, &begin_info)?;
        }
        self.recording = Some(frame_index);
        Ok(FrameContext {
            frame_index,
            command_buffer: CommandBufferHandle(frame_index as u64),
        })
    }

    fn end_frame(&mut self, frame: FrameContext) -> DeviceResult<()> {
        if self.recording != Some(frame.frame_index) {
            return Err(DeviceError::invalid(format!(
                "end_frame for slot {} which is not recording",
                frame.frame_index
            )));
        }
        self.recording = None;
        let slot = &self.frames[frame.frame_index];
        let command_buffers = [slot.command_buffer];
        let submit_info = vk::SubmitInfo::builder().command_buffers(&command_buffers).build();
        unsafe {
            self.device().end_command_buffer(slot.command_buffer)?;
            // Reset only once a submission is certain to signal it again.
            self.device().reset_fences(&[slot.fence])?;
            self.device()
                .queue_submit(self.context.queue, &[submit_info], slot.fence)?;
        }
        self.current_frame = (self.current_frame + 1) % self.frames.len();
        Ok(())
    }

    fn frame_pending(&self, frame: usize) -> bool {
        self.frames
            .get(frame)
            .is_some_and(|slot| matches!(unsafe { self.device().get_fence_status(slot.fence) }, Ok(false)))
    }

    fn is_recording(&self) -> bool {
        self.recording.is_some()
    }

    fn wait_idle(&mut self) -> DeviceResult<()> {
        unsafe { self.device().device_wait_idle()? };
        Ok(())
    }

    fn create_buffer(&mut self, desc: &BufferDesc) -> DeviceResult<BufferHandle> {
        let buffer = VulkanBuffer::new(self.device(), &self.memory_properties, desc)?;
        Ok(BufferHandle(to_id(self.buffers.insert(buffer))))
    }

    fn write_buffer(&mut self, buffer: BufferHandle, offset: u64, data: &[u8]) -> DeviceResult<()> {
        self.buffer(buffer)?.write(offset, data)
    }

    fn upload_buffer(&mut self, buffer: BufferHandle, data: &[u8]) -> DeviceResult<()> {
        let target = self.buffer(buffer)?;
        if data.len() as u64 > target.desc.size {
            return Err(DeviceError::invalid("upload larger than the destination buffer"));
        }
        if data.is_empty() {
            return Ok(());
        }
        let dst = target.buffer;
        let staging = self.staging_buffer(data.len() as u64, vk::BufferUsageFlags::TRANSFER_SRC)?;
        let result = staging.write(0, data).and_then(|()| {
            self.single_time(|cmd| unsafe {
                let region = vk::BufferCopy {
                    src_offset: 0,
                    dst_offset: 0,
                    size: data.len() as u64,
                };
                self.device().cmd_copy_buffer(cmd, staging.buffer, dst, &[region]);
            })
        });
        staging.destroy(self.device());
        result
    }

    fn buffer_device_address(&self, buffer: BufferHandle) -> DeviceResult<u64> {
        self.buffer(buffer)?
            .address
            .ok_or_else(|| DeviceError::invalid("buffer was created without SHADER_DEVICE_ADDRESS"))
    }

    fn destroy_buffer(&mut self, buffer: BufferHandle) {
        match self.buffers.remove(to_key(buffer.0)) {
            Some(removed) => removed.destroy(self.device()),
            None => warn!("destroy_buffer on unknown handle {}", buffer.0),
        }
    }

    fn create_image(&mut self, desc: &ImageDesc) -> DeviceResult<ImageHandle> {
        let image = VulkanImage::new(self.device(), &self.memory_properties, desc)?;
        Ok(ImageHandle(to_id(self.images.insert(image))))
    }

    fn resize_image(&mut self, image: ImageHandle, width: u32, height: u32) -> DeviceResult<()> {
        let desc = ImageDesc {
            width,
            height,
            ..self.image(image)?.desc
        };
        let replacement = VulkanImage::new(self.device(), &self.memory_properties, &desc)?;
        if let Some(slot) = self.images.get_mut(to_key(image.0)) {
            let old = std::mem::replace(slot, replacement);
            old.destroy(&self.context.device);
        }
        Ok(())
    }

    fn image_extent(&self, image: ImageHandle) -> DeviceResult<vk::Extent2D> {
        Ok(self.image(image)?.extent())
    }

    fn upload_image(&mut self, image: ImageHandle, data: &[u8]) -> DeviceResult<()> {
        let target = self.image(image)?;
        let texel_size = format_texel_size(target.desc.format)
            .ok_or_else(|| DeviceError::Unsupported(format!("image format {:?}", target.desc.format)))?;
        let expected = target.desc.width as usize * target.desc.height as usize * texel_size;
        if data.len() != expected {
            return Err(DeviceError::invalid(format!(
                "image upload of {} bytes, expected {expected}",
                data.len()
            )));
        }

        let staging = self.staging_buffer(data.len() as u64, vk::BufferUsageFlags::TRANSFER_SRC)?;
        let extent = vk::Extent3D {
            width: target.desc.width,
            height: target.desc.height,
            depth: 1,
        };
        let result = staging.write(0, data).and_then(|()| {
            self.single_time(|cmd| {
                self.record_image_barrier(
                    cmd,
                    target,
                    vk::ImageLayout::UNDEFINED,
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    (vk::PipelineStageFlags::TOP_OF_PIPE, vk::AccessFlags::empty()),
                    (vk::PipelineStageFlags::TRANSFER, vk::AccessFlags::TRANSFER_WRITE),
                );
                let region = image_copy_region(target.desc.aspect, vk::Offset3D::default(), extent);
                unsafe {
                    self.device().cmd_copy_buffer_to_image(
                        cmd,
                        staging.buffer,
                        target.image,
                        vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                        &[region],
                    );
                }
                self.record_image_barrier(
                    cmd,
                    target,
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                    (vk::PipelineStageFlags::TRANSFER, vk::AccessFlags::TRANSFER_WRITE),
                    (
                        vk::PipelineStageFlags::FRAGMENT_SHADER | vk::PipelineStageFlags::RAY_TRACING_SHADER_KHR,
                        vk::AccessFlags::SHADER_READ,
                    ),
                );
            })
        });
        staging.destroy(self.device());
        result
    }

    fn read_image_texel(
        &mut self,
        image: ImageHandle,
        layout: vk::ImageLayout,
        x: u32,
        y: u32,
    ) -> DeviceResult<Vec<u8>> {
        if layout != vk::ImageLayout::TRANSFER_SRC_OPTIMAL && layout != vk::ImageLayout::GENERAL {
            return Err(DeviceError::invalid(format!("cannot copy from an image in {layout:?}")));
        }
        let source = self.image(image)?;
        if x >= source.desc.width || y >= source.desc.height {
            return Err(DeviceError::invalid(format!(
                "texel ({x}, {y}) outside {}x{} image",
                source.desc.width, source.desc.height
            )));
        }
        let texel_size = format_texel_size(source.desc.format)
            .ok_or_else(|| DeviceError::Unsupported(format!("image format {:?}", source.desc.format)))?;

        let staging = self.staging_buffer(texel_size as u64, vk::BufferUsageFlags::TRANSFER_DST)?;
        let offset = vk::Offset3D {
            x: x as i32,
            y: y as i32,
            z: 0,
        };
        let extent = vk::Extent3D {
            width: 1,
            height: 1,
            depth: 1,
        };
        let result = self
            .single_time(|cmd| unsafe {
                let region = image_copy_region(source.desc.aspect, offset, extent);
                self.device()
                    .cmd_copy_image_to_buffer(cmd, source.image, layout, staging.buffer, &[region]);
            })
            .and_then(|()| staging.read(texel_size));
        staging.destroy(self.device());
        result
    }

    fn destroy_image(&mut self, image: ImageHandle) {
        match self.images.remove(to_key(image.0)) {
            Some(removed) => removed.destroy(self.device()),
            None => warn!("destroy_image on unknown handle {}", image.0),
        }
    }

    fn create_sampler(&mut self, desc: &SamplerDesc) -> DeviceResult<SamplerHandle> {
        let sampler_info = vk::SamplerCreateInfo::builder()
            .mag_filter(desc.filter)
            .min_filter(desc.filter)
            .address_mode_u(desc.address_mode)
            .address_mode_v(desc.address_mode)
            .address_mode_w(desc.address_mode)
            .anisotropy_enable(false)
            .max_anisotropy(1.0)
            .border_color(vk::BorderColor::INT_OPAQUE_BLACK)
            .unnormalized_coordinates(false)
            .compare_enable(false)
            .mipmap_mode(vk::SamplerMipmapMode::LINEAR)
            .min_lod(0.0)
            .max_lod(0.0);
        let sampler = unsafe { self.device().create_sampler(&sampler_info, None)? };
        Ok(SamplerHandle(to_id(self.samplers.insert(sampler))))
    }

    fn destroy_sampler(&mut self, sampler: SamplerHandle) {
        if let Some(removed) = self.samplers.remove(to_key(sampler.0)) {
            unsafe { self.device().destroy_sampler(removed, None) };
        }
    }

    fn create_blas(&mut self, desc: &BlasDesc) -> DeviceResult<AccelerationStructureHandle> {
        let record = self.build_blas(desc)?;
        Ok(AccelerationStructureHandle(to_id(self.structures.insert(record))))
    }

    fn build_tlas(&mut self, instances: &[TlasInstance]) -> DeviceResult<AccelerationStructureHandle> {
        let record = self.build_top_level(instances)?;
        Ok(AccelerationStructureHandle(to_id(self.structures.insert(record))))
    }

    fn cmd_refit_tlas(
        &mut self,
        cmd: CommandBufferHandle,
        tlas: AccelerationStructureHandle,
        instances: &[TlasInstance],
    ) -> DeviceResult<()> {
        let command_buffer = self.recording_buffer(cmd)?;
        self.record_tlas_refit(command_buffer, cmd.0 as usize, tlas, instances)
    }

    fn destroy_acceleration_structure(&mut self, structure: AccelerationStructureHandle) {
        if let Some(removed) = self.structures.remove(to_key(structure.0)) {
            removed.destroy(&self.context.device, &self.acceleration_loader);
        }
    }

    fn create_descriptor_set_layout(
        &mut self,
        bindings: &[DescriptorBinding],
    ) -> DeviceResult<DescriptorSetLayoutHandle> {
        let layout = descriptors::create_set_layout(self.device(), bindings)?;
        let key = self.set_layouts.insert(VulkanSetLayout {
            layout,
            bindings: bindings.to_vec(),
        });
        Ok(DescriptorSetLayoutHandle(to_id(key)))
    }

    fn allocate_descriptor_set(
        &mut self,
        layout: DescriptorSetLayoutHandle,
    ) -> DeviceResult<DescriptorSetHandle> {
        let set_layout = self
            .set_layouts
            .get(to_key(layout.0))
            .ok_or(unknown("descriptor set layout", layout.0))?;
        let (set, pool) = self
            .descriptor_allocator
            .allocate(&self.context.device, set_layout)?;
        let key = self.sets.insert(VulkanDescriptorSet {
            set,
            pool,
            bindings: set_layout.bindings.clone(),
        });
        Ok(DescriptorSetHandle(to_id(key)))
    }

    fn destroy_descriptor_set_layout(&mut self, layout: DescriptorSetLayoutHandle) {
        if let Some(removed) = self.set_layouts.remove(to_key(layout.0)) {
            unsafe { self.device().destroy_descriptor_set_layout(removed.layout, None) };
        }
    }

    fn free_descriptor_set(&mut self, set: DescriptorSetHandle) {
        if let Some(removed) = self.sets.remove(to_key(set.0)) {
            if let Err(err) = unsafe { self.device().free_descriptor_sets(removed.pool, &[removed.set]) } {
                warn!("[RENDER] free_descriptor_sets failed: {err:?}");
            }
        }
    }

    fn write_descriptor_set(
        &mut self,
        set: DescriptorSetHandle,
        writes: &[DescriptorWrite],
    ) -> DeviceResult<()> {
        self.update_descriptor_set(set, writes)
    }

    fn create_render_pass(&mut self, desc: &RenderPassDesc) -> DeviceResult<RenderPassHandle> {
        let render_pass = pipelines::create_render_pass(self.device(), desc)?;
        Ok(RenderPassHandle(to_id(self.render_passes.insert(render_pass))))
    }

    fn destroy_render_pass(&mut self, render_pass: RenderPassHandle) {
        if let Some(removed) = self.render_passes.remove(to_key(render_pass.0)) {
            unsafe { self.device().destroy_render_pass(removed, None) };
        }
    }

    fn create_framebuffer(
        &mut self,
        render_pass: RenderPassHandle,
        attachments: &[ImageHandle],
        extent: vk::Extent2D,
    ) -> DeviceResult<FramebufferHandle> {
        let raw_pass = *self
            .render_passes
            .get(to_key(render_pass.0))
            .ok_or(unknown("render pass", render_pass.0))?;
        let views = attachments
            .iter()
            .map(|&image| self.image(image).map(|i| i.view))
            .collect::<DeviceResult<Vec<_>>>()?;
        let framebuffer_info = vk::FramebufferCreateInfo::builder()
            .render_pass(raw_pass)
            .attachments(&views)
            .width(extent.width)
            .height(extent.height)
            .layers(1);
        let framebuffer = unsafe { self.device().create_framebuffer(&framebuffer_info, None)? };
        let key = self.framebuffers.insert(VulkanFramebuffer { framebuffer, extent });
        Ok(FramebufferHandle(to_id(key)))
    }

    fn destroy_framebuffer(&mut self, framebuffer: FramebufferHandle) {
        if let Some(removed) = self.framebuffers.remove(to_key(framebuffer.0)) {
            unsafe { self.device().destroy_framebuffer(removed.framebuffer, None) };
        }
    }

    fn create_pipeline_layout(
        &mut self,
        set_layouts: &[DescriptorSetLayoutHandle],
    ) -> DeviceResult<PipelineLayoutHandle> {
        let raw_layouts = set_layouts
            .iter()
            .map(|handle| {
                self.set_layouts
                    .get(to_key(handle.0))
                    .map(|l| l.layout)
                    .ok_or(unknown("descriptor set layout", handle.0))
            })
            .collect::<DeviceResult<Vec<_>>>()?;
        let layout = pipelines::create_pipeline_layout(self.device(), &raw_layouts)?;
        Ok(PipelineLayoutHandle(to_id(self.pipeline_layouts.insert(layout))))
    }

    fn destroy_pipeline_layout(&mut self, layout: PipelineLayoutHandle) {
        if let Some(removed) = self.pipeline_layouts.remove(to_key(layout.0)) {
            unsafe { self.device().destroy_pipeline_layout(removed, None) };
        }
    }

    fn create_graphics_pipeline(&mut self, desc: &GraphicsPipelineDesc<'_>) -> DeviceResult<PipelineHandle> {
        let layout = self.pipeline_layout(desc.layout)?;
        let render_pass = *self
            .render_passes
            .get(to_key(desc.render_pass.0))
            .ok_or(unknown("render pass", desc.render_pass.0))?;
        let pipeline = pipelines::create_graphics_pipeline(self.device(), desc, layout, render_pass)?;
        let key = self.pipelines.insert(VulkanPipeline {
            pipeline,
            bind_point: vk::PipelineBindPoint::GRAPHICS,
        });
        Ok(PipelineHandle(to_id(key)))
    }

    fn create_ray_tracing_pipeline(
        &mut self,
        desc: &RayTracingPipelineDesc<'_>,
    ) -> DeviceResult<PipelineHandle> {
        if desc.max_recursion_depth > self.ray_tracing_properties.max_ray_recursion_depth {
            return Err(DeviceError::Unsupported(format!(
                "ray recursion depth {} exceeds the device limit of {}",
                desc.max_recursion_depth, self.ray_tracing_properties.max_ray_recursion_depth
            )));
        }
        let layout = self.pipeline_layout(desc.layout)?;
        let pipeline =
            pipelines::create_ray_tracing_pipeline(self.device(), &self.ray_tracing_loader, desc, layout)?;
        let key = self.pipelines.insert(VulkanPipeline {
            pipeline,
            bind_point: vk::PipelineBindPoint::RAY_TRACING_KHR,
        });
        Ok(PipelineHandle(to_id(key)))
    }

    fn destroy_pipeline(&mut self, pipeline: PipelineHandle) {
        if let Some(removed) = self.pipelines.remove(to_key(pipeline.0)) {
            unsafe { self.device().destroy_pipeline(removed.pipeline, None) };
        }
    }

    fn ray_tracing_properties(&self) -> RayTracingProperties {
        self.ray_tracing_properties
    }

    fn shader_group_handles(&mut self, pipeline: PipelineHandle, group_count: u32) -> DeviceResult<Vec<u8>> {
        let record = self
            .pipelines
            .get(to_key(pipeline.0))
            .ok_or(unknown("pipeline", pipeline.0))?;
        if record.bind_point != vk::PipelineBindPoint::RAY_TRACING_KHR {
            return Err(DeviceError::invalid("shader group handles of a graphics pipeline"));
        }
        let data_size = group_count as usize * self.ray_tracing_properties.shader_group_handle_size as usize;
        let handles = unsafe {
            self.ray_tracing_loader
                .get_ray_tracing_shader_group_handles(record.pipeline, 0, group_count, data_size)?
        };
        Ok(handles)
    }

    fn cmd_pipeline_barrier(&mut self, cmd: CommandBufferHandle, barriers: &[ImageBarrier]) {
        let Some(command_buffer) = self.command_target(cmd, "image barriers") else {
            return;
        };
        for barrier in barriers {
            match self.image(barrier.image) {
                Ok(image) => self.record_image_barrier(
                    command_buffer,
                    image,
                    barrier.old_layout,
                    barrier.new_layout,
                    (barrier.src_stage, barrier.src_access),
                    (barrier.dst_stage, barrier.dst_access),
                ),
                Err(err) => warn!("[RENDER] Dropped image barrier: {err}"),
            }
        }
    }

    fn cmd_buffer_barrier(&mut self, cmd: CommandBufferHandle, barrier: &BufferBarrier) {
        let Some(command_buffer) = self.command_target(cmd, "buffer barrier") else {
            return;
        };
        let buffer = match self.buffer(barrier.buffer) {
            Ok(buffer) => buffer.buffer,
            Err(err) => {
                warn!("[RENDER] Dropped buffer barrier: {err}");
                return;
            }
        };
        let memory_barrier = vk::BufferMemoryBarrier::builder()
            .src_access_mask(barrier.src_access)
            .dst_access_mask(barrier.dst_access)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .buffer(buffer)
            .offset(0)
            .size(vk::WHOLE_SIZE)
            .build();
        unsafe {
            self.device().cmd_pipeline_barrier(
                command_buffer,
                barrier.src_stage,
                barrier.dst_stage,
                vk::DependencyFlags::empty(),
                &[],
                &[memory_barrier],
                &[],
            );
        }
    }

    fn cmd_copy_buffer(
        &mut self,
        cmd: CommandBufferHandle,
        src: BufferHandle,
        dst: BufferHandle,
        size: u64,
    ) -> DeviceResult<()> {
        let command_buffer = self.recording_buffer(cmd)?;
        let source = self.buffer(src)?;
        let destination = self.buffer(dst)?;
        if size > source.desc.size || size > destination.desc.size {
            return Err(DeviceError::invalid(format!("copy of {size} bytes overflows a buffer")));
        }
        let region = vk::BufferCopy {
            src_offset: 0,
            dst_offset: 0,
            size,
        };
        unsafe {
            self.device()
                .cmd_copy_buffer(command_buffer, source.buffer, destination.buffer, &[region]);
        }
        Ok(())
    }

    fn cmd_begin_render_pass(
        &mut self,
        cmd: CommandBufferHandle,
        render_pass: RenderPassHandle,
        framebuffer: FramebufferHandle,
        clear_values: &[ClearValue],
    ) -> DeviceResult<()> {
        let command_buffer = self.recording_buffer(cmd)?;
        let raw_pass = *self
            .render_passes
            .get(to_key(render_pass.0))
            .ok_or(unknown("render pass", render_pass.0))?;
        let target = self
            .framebuffers
            .get(to_key(framebuffer.0))
            .ok_or(unknown("framebuffer", framebuffer.0))?;

        let clears: Vec<vk::ClearValue> = clear_values.iter().copied().map(vk::ClearValue::from).collect();
        let render_area = vk::Rect2D {
            offset: vk::Offset2D { x: 0, y: 0 },
            extent: target.extent,
        };
        let begin_info = vk::RenderPassBeginInfo::builder()
            .render_pass(raw_pass)
            .framebuffer(target.framebuffer)
            .render_area(render_area)
            .clear_values(&clears);
        let viewport = vk::Viewport {
            x: 0.0,
            y: 0.0,
            width: target.extent.width as f32,
            height: target.extent.height as f32,
            min_depth: 0.0,
            max_depth: 1.0,
        };
        unsafe {
            self.device()
                .cmd_begin_render_pass(command_buffer, &begin_info, vk::SubpassContents::INLINE);
            // Every pipeline declares viewport and scissor dynamic.
            self.device().cmd_set_viewport(command_buffer, 0, &[viewport]);
            self.device().cmd_set_scissor(command_buffer, 0, &[render_area]);
        }
        Ok(())
    }

    fn cmd_end_render_pass(&mut self, cmd: CommandBufferHandle) {
        if let Some(command_buffer) = self.command_target(cmd, "end render pass") {
            unsafe { self.device().cmd_end_render_pass(command_buffer) };
        }
    }

    fn cmd_bind_pipeline(
        &mut self,
        cmd: CommandBufferHandle,
        bind_point: vk::PipelineBindPoint,
        pipeline: PipelineHandle,
    ) {
        let Some(command_buffer) = self.command_target(cmd, "pipeline bind") else {
            return;
        };
        match self.pipelines.get(to_key(pipeline.0)) {
            Some(record) if record.bind_point == bind_point => unsafe {
                self.device()
                    .cmd_bind_pipeline(command_buffer, bind_point, record.pipeline);
            },
            Some(_) => warn!("[RENDER] Pipeline {} bound at the wrong bind point {bind_point:?}", pipeline.0),
            None => warn!("[RENDER] Dropped bind of unknown pipeline {}", pipeline.0),
        }
    }

    fn cmd_bind_descriptor_sets(
        &mut self,
        cmd: CommandBufferHandle,
        bind_point: vk::PipelineBindPoint,
        layout: PipelineLayoutHandle,
        first_set: u32,
        sets: &[DescriptorSetHandle],
    ) {
        let Some(command_buffer) = self.command_target(cmd, "descriptor set bind") else {
            return;
        };
        let bound = self.pipeline_layout(layout).and_then(|raw_layout| {
            let raw_sets = sets
                .iter()
                .map(|set| {
                    self.sets
                        .get(to_key(set.0))
                        .map(|s| s.set)
                        .ok_or(unknown("descriptor set", set.0))
                })
                .collect::<DeviceResult<Vec<_>>>()?;
            unsafe {
                self.device()
                    .cmd_bind_descriptor_sets(command_buffer, bind_point, raw_layout, first_set, &raw_sets, &[]);
            }
            Ok(())
        });
        if let Err(err) = bound {
            warn!("[RENDER] Dropped descriptor set bind: {err}");
        }
    }

    fn cmd_bind_vertex_buffer(&mut self, cmd: CommandBufferHandle, buffer: BufferHandle) {
        let Some(command_buffer) = self.command_target(cmd, "vertex buffer bind") else {
            return;
        };
        match self.buffer(buffer) {
            Ok(vertex) => unsafe {
                self.device()
                    .cmd_bind_vertex_buffers(command_buffer, 0, &[vertex.buffer], &[0]);
            },
            Err(err) => warn!("[RENDER] Dropped vertex buffer bind: {err}"),
        }
    }

    fn cmd_bind_index_buffer(&mut self, cmd: CommandBufferHandle, buffer: BufferHandle) {
        let Some(command_buffer) = self.command_target(cmd, "index buffer bind") else {
            return;
        };
        match self.buffer(buffer) {
            Ok(index) => unsafe {
                self.device()
                    .cmd_bind_index_buffer(command_buffer, index.buffer, 0, vk::IndexType::UINT32);
            },
            Err(err) => warn!("[RENDER] Dropped index buffer bind: {err}"),
        }
    }

    fn cmd_draw(&mut self, cmd: CommandBufferHandle, vertex_count: u32, instance_count: u32) {
        if let Some(command_buffer) = self.command_target(cmd, "draw") {
            unsafe { self.device().cmd_draw(command_buffer, vertex_count, instance_count, 0, 0) };
        }
    }

    fn cmd_draw_indexed(&mut self, cmd: CommandBufferHandle, index_count: u32, instance_count: u32) {
        if let Some(command_buffer) = self.command_target(cmd, "indexed draw") {
            unsafe {
                self.device()
                    .cmd_draw_indexed(command_buffer, index_count, instance_count, 0, 0, 0);
            }
        }
    }

    fn cmd_clear_depth(&mut self, cmd: CommandBufferHandle, extent: vk::Extent2D, depth: f32) {
        let Some(command_buffer) = self.command_target(cmd, "depth clear") else {
            return;
        };
        let attachment = vk::ClearAttachment {
            aspect_mask: vk::ImageAspectFlags::DEPTH,
            color_attachment: 0,
            clear_value: ClearValue::DepthStencil(depth, 0).into(),
        };
        let rect = vk::ClearRect {
            rect: vk::Rect2D {
                offset: vk::Offset2D { x: 0, y: 0 },
                extent,
            },
            base_array_layer: 0,
            layer_count: 1,
        };
        unsafe {
            self.device()
                .cmd_clear_attachments(command_buffer, &[attachment], &[rect]);
        }
    }

    fn cmd_trace_rays(
        &mut self,
        cmd: CommandBufferHandle,
        regions: &ShaderBindingRegions,
        width: u32,
        height: u32,
    ) {
        let Some(command_buffer) = self.command_target(cmd, "trace rays") else {
            return;
        };
        debug!("[RENDER] Tracing {width}x{height} rays");
        unsafe {
            self.ray_tracing_loader.cmd_trace_rays(
                command_buffer,
                &strided(&regions.raygen),
                &strided(&regions.miss),
                &strided(&regions.hit),
                &strided(&regions.callable),
                width,
                height,
                1,
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strided_region_conversion() {
        let region = StridedRegion {
            device_address: 0x4000,
            stride: 64,
            size: 128,
        };
        let raw = strided(&region);
        assert_eq!(raw.device_address, 0x4000);
        assert_eq!(raw.stride, 64);
        assert_eq!(raw.size, 128);
    }

    #[test]
    fn test_single_texel_copy_region() {
        let region = image_copy_region(
            vk::ImageAspectFlags::COLOR,
            vk::Offset3D { x: 3, y: 5, z: 0 },
            vk::Extent3D {
                width: 1,
                height: 1,
                depth: 1,
            },
        );
        assert_eq!(region.image_offset.x, 3);
        assert_eq!(region.image_offset.y, 5);
        assert_eq!(region.image_extent.width, 1);
        assert_eq!(region.image_subresource.aspect_mask, vk::ImageAspectFlags::COLOR);
    }
}
