//! Vulkan backend
//!
//! `VulkanDevice` implements [`RenderDevice`](crate::render::api::RenderDevice)
//! with `ash` on top of an instance and device the application created
//! (see [`VulkanContext`]). Resources live in slot maps keyed the same way as
//! in the headless backend; every buffer and image owns a dedicated memory
//! allocation.
//!
//! Frame protocol: one primary command buffer and one fence per
//! frame-in-flight slot. `begin_frame` waits on and resets the slot's fence,
//! `end_frame` submits with it. Synchronous operations (uploads, structure
//! builds, readbacks) go through a single-time command buffer followed by a
//! queue wait.

mod acceleration;
mod commands;
mod context;
mod descriptors;
mod device;
mod memory;
mod pipelines;

pub use context::VulkanContext;

use ash::extensions::khr::{AccelerationStructure, RayTracingPipeline};
use ash::vk;
use slotmap::SlotMap;

use crate::foundation::logging::{info, warn};
use crate::render::api::{DeviceResult, RayTracingProperties};

use super::keys::{
    BufferKey, FramebufferKey, ImageKey, PipelineKey, PipelineLayoutKey, RenderPassKey, SamplerKey, SetKey,
    SetLayoutKey, StructureKey,
};
use acceleration::AccelerationRecord;
use commands::FrameSlot;
use descriptors::{DescriptorAllocator, VulkanDescriptorSet, VulkanSetLayout};
use memory::{VulkanBuffer, VulkanImage};

struct VulkanFramebuffer {
    framebuffer: vk::Framebuffer,
    extent: vk::Extent2D,
}

struct VulkanPipeline {
    pipeline: vk::Pipeline,
    bind_point: vk::PipelineBindPoint,
}

/// [`RenderDevice`](crate::render::api::RenderDevice) over a Vulkan device
pub struct VulkanDevice {
    context: VulkanContext,
    acceleration_loader: AccelerationStructure,
    ray_tracing_loader: RayTracingPipeline,
    memory_properties: vk::PhysicalDeviceMemoryProperties,
    ray_tracing_properties: RayTracingProperties,
    scratch_alignment: u64,

    command_pool: vk::CommandPool,
    frames: Vec<FrameSlot>,
    current_frame: usize,
    recording: Option<usize>,
    descriptor_allocator: DescriptorAllocator,

    buffers: SlotMap<BufferKey, VulkanBuffer>,
    images: SlotMap<ImageKey, VulkanImage>,
    samplers: SlotMap<SamplerKey, vk::Sampler>,
    structures: SlotMap<StructureKey, AccelerationRecord>,
    set_layouts: SlotMap<SetLayoutKey, VulkanSetLayout>,
    sets: SlotMap<SetKey, VulkanDescriptorSet>,
    render_passes: SlotMap<RenderPassKey, vk::RenderPass>,
    framebuffers: SlotMap<FramebufferKey, VulkanFramebuffer>,
    pipeline_layouts: SlotMap<PipelineLayoutKey, vk::PipelineLayout>,
    pipelines: SlotMap<PipelineKey, VulkanPipeline>,
}

impl VulkanDevice {
    /// Wrap a bootstrapped context, processing `frames_in_flight` frames concurrently
    pub fn new(context: VulkanContext, frames_in_flight: usize) -> DeviceResult<Self> {
        let frames_in_flight = frames_in_flight.max(1);
        let acceleration_loader = AccelerationStructure::new(&context.instance, &context.device);
        let ray_tracing_loader = RayTracingPipeline::new(&context.instance, &context.device);

        let pipeline_properties = context.ray_tracing_pipeline_properties();
        let structure_properties = context.acceleration_structure_properties();
        let ray_tracing_properties = RayTracingProperties {
            shader_group_handle_size: pipeline_properties.shader_group_handle_size,
            shader_group_handle_alignment: pipeline_properties.shader_group_handle_alignment,
            shader_group_base_alignment: pipeline_properties.shader_group_base_alignment,
            max_ray_recursion_depth: pipeline_properties.max_ray_recursion_depth,
        };

        let command_pool = commands::create_command_pool(&context.device, context.queue_family_index)?;
        let frames = match commands::create_frame_slots(&context.device, command_pool, frames_in_flight) {
            Ok(frames) => frames,
            Err(err) => {
                unsafe { context.device.destroy_command_pool(command_pool, None) };
                return Err(err);
            }
        };

        info!(
            "[RENDER] Vulkan device ready: {frames_in_flight} frames in flight, max ray recursion {}",
            ray_tracing_properties.max_ray_recursion_depth
        );

        Ok(Self {
            memory_properties: context.memory_properties(),
            acceleration_loader,
            ray_tracing_loader,
            ray_tracing_properties,
            scratch_alignment: u64::from(structure_properties.min_acceleration_structure_scratch_offset_alignment)
                .max(1),
            command_pool,
            frames,
            current_frame: 0,
            recording: None,
            descriptor_allocator: DescriptorAllocator::default(),
            buffers: SlotMap::with_key(),
            images: SlotMap::with_key(),
            samplers: SlotMap::with_key(),
            structures: SlotMap::with_key(),
            set_layouts: SlotMap::with_key(),
            sets: SlotMap::with_key(),
            render_passes: SlotMap::with_key(),
            framebuffers: SlotMap::with_key(),
            pipeline_layouts: SlotMap::with_key(),
            pipelines: SlotMap::with_key(),
            context,
        })
    }

    /// Context the device was created from
    pub fn context(&self) -> &VulkanContext {
        &self.context
    }

    /// Raw image, for presenting the renderer's output
    pub fn raw_image(&self, image: crate::render::api::ImageHandle) -> Option<vk::Image> {
        self.images.get(super::keys::to_key(image.0)).map(|i| i.image)
    }

    fn device(&self) -> &ash::Device {
        &self.context.device
    }

    fn single_time(&self, record: impl FnOnce(vk::CommandBuffer)) -> DeviceResult<()> {
        commands::submit_single_time(self.device(), self.command_pool, self.context.queue, record)
    }
}

impl Drop for VulkanDevice {
    fn drop(&mut self) {
        let device = self.context.device.clone();
        unsafe {
            if let Err(err) = device.device_wait_idle() {
                warn!("[RENDER] device_wait_idle failed during teardown: {err:?}");
            }

            for (_, pipeline) in self.pipelines.drain() {
                device.destroy_pipeline(pipeline.pipeline, None);
            }
            for (_, layout) in self.pipeline_layouts.drain() {
                device.destroy_pipeline_layout(layout, None);
            }
            for (_, framebuffer) in self.framebuffers.drain() {
                device.destroy_framebuffer(framebuffer.framebuffer, None);
            }
            for (_, render_pass) in self.render_passes.drain() {
                device.destroy_render_pass(render_pass, None);
            }
            self.sets.clear();
            self.descriptor_allocator.destroy(&device);
            for (_, layout) in self.set_layouts.drain() {
                device.destroy_descriptor_set_layout(layout.layout, None);
            }
            for (_, structure) in self.structures.drain() {
                structure.destroy(&device, &self.acceleration_loader);
            }
            for (_, sampler) in self.samplers.drain() {
                device.destroy_sampler(sampler, None);
            }
            for (_, image) in self.images.drain() {
                image.destroy(&device);
            }
            for (_, buffer) in self.buffers.drain() {
                buffer.destroy(&device);
            }

            commands::destroy_frame_slots(&device, &self.frames);
            device.destroy_command_pool(self.command_pool, None);
        }
    }
}
