//! In-memory device backend
//!
//! `HeadlessDevice` implements [`RenderDevice`] entirely on the CPU. Buffers and
//! images are byte vectors, commands are recorded into per-slot lists, and
//! commands with a data effect (buffer copies, render-pass clears, depth
//! clears) are applied when recorded. It models the frame-in-flight protocol
//! closely enough to catch CPU writes into slots the "GPU" may still read:
//! a submitted slot stays pending until `begin_frame` comes back to it or
//! `wait_idle` is called.
//!
//! It backs the headless application mode and the test suite.

use std::collections::BTreeMap;

use ash::vk;
use slotmap::SlotMap;

use crate::foundation::logging::{debug, warn};
use crate::render::api::{
    format_texel_size, AccelerationStructureHandle, BlasDesc, BufferBarrier, BufferDesc, BufferHandle,
    ClearValue, CommandBufferHandle, DescriptorBinding, DescriptorResource, DescriptorSetHandle,
    DescriptorSetLayoutHandle, DescriptorWrite, DeviceError, DeviceResult, FrameContext,
    FramebufferHandle, GraphicsPipelineDesc, ImageBarrier, ImageDesc, ImageHandle, MemoryLocation,
    PipelineHandle, PipelineLayoutHandle, RayTracingPipelineDesc, RayTracingProperties, RenderDevice,
    RenderPassDesc, RenderPassHandle, SamplerDesc, SamplerHandle, ShaderBindingRegions, TlasInstance,
};
use crate::render::resources::SPIRV_MAGIC;

use super::keys::{
    to_id, to_key, BufferKey, FramebufferKey, ImageKey, PipelineKey, PipelineLayoutKey, RenderPassKey, SamplerKey,
    SetKey, SetLayoutKey, StructureKey,
};

/// Counters exposed for tests and the headless application's summary
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeviceStats {
    /// `wait_idle` calls
    pub wait_idle_calls: u64,
    /// Frames submitted through `end_frame`
    pub frames_submitted: u64,
    /// Synchronous single-time submissions (uploads, builds, readbacks)
    pub single_time_submits: u64,
    /// Bottom-level builds
    pub blas_builds: u64,
    /// Full top-level builds
    pub tlas_builds: u64,
    /// Recorded top-level refits
    pub tlas_refits: u64,
    /// `write_descriptor_set` calls
    pub descriptor_writes: u64,
    /// Descriptor sets bound while any element referenced a destroyed resource
    pub stale_descriptor_binds: u64,
    /// Image barriers whose `old_layout` did not match the tracked layout
    pub layout_mismatches: u64,
}

/// A command captured by [`HeadlessDevice`]
#[derive(Debug, Clone, PartialEq)]
pub enum RecordedCommand {
    /// Image layout transition
    ImageBarrier(ImageBarrier),
    /// Buffer memory barrier
    BufferBarrier(BufferBarrier),
    /// Buffer copy
    CopyBuffer {
        /// Source buffer
        src: BufferHandle,
        /// Destination buffer
        dst: BufferHandle,
        /// Bytes copied
        size: u64,
    },
    /// Render pass begin
    BeginRenderPass {
        /// Render pass
        render_pass: RenderPassHandle,
        /// Framebuffer
        framebuffer: FramebufferHandle,
    },
    /// Render pass end
    EndRenderPass,
    /// Pipeline bind
    BindPipeline {
        /// Bind point
        bind_point: vk::PipelineBindPoint,
        /// Pipeline
        pipeline: PipelineHandle,
    },
    /// Descriptor sets bind
    BindDescriptorSets {
        /// Bind point
        bind_point: vk::PipelineBindPoint,
        /// First set index
        first_set: u32,
        /// Bound sets
        sets: Vec<DescriptorSetHandle>,
    },
    /// Vertex buffer bind
    BindVertexBuffer(BufferHandle),
    /// Index buffer bind
    BindIndexBuffer(BufferHandle),
    /// Non-indexed draw
    Draw {
        /// Vertex count
        vertex_count: u32,
        /// Instance count
        instance_count: u32,
    },
    /// Indexed draw
    DrawIndexed {
        /// Index count
        index_count: u32,
        /// Instance count
        instance_count: u32,
    },
    /// Depth clear inside a render pass
    ClearDepth,
    /// Top-level refit
    RefitTlas {
        /// Refitted structure
        tlas: AccelerationStructureHandle,
        /// Instances in the refit
        instance_count: usize,
    },
    /// Ray dispatch
    TraceRays {
        /// Dispatch width
        width: u32,
        /// Dispatch height
        height: u32,
    },
}

struct HeadlessBuffer {
    desc: BufferDesc,
    data: Vec<u8>,
    address: u64,
}

struct HeadlessImage {
    desc: ImageDesc,
    texel_size: usize,
    data: Vec<u8>,
    layout: vk::ImageLayout,
}

enum StructureLevel {
    Bottom { triangle_count: u32 },
    Top { instances: Vec<TlasInstance> },
}

struct HeadlessDescriptorSet {
    layout: Vec<DescriptorBinding>,
    bound: BTreeMap<(u32, u32), DescriptorResource>,
}

struct HeadlessFramebuffer {
    render_pass: RenderPassHandle,
    attachments: Vec<ImageHandle>,
}

struct HeadlessPipeline {
    bind_point: vk::PipelineBindPoint,
    group_count: u32,
}

#[derive(Default)]
struct Recording {
    commands: Vec<RecordedCommand>,
    active_framebuffer: Option<FramebufferHandle>,
}

/// CPU-only implementation of [`RenderDevice`]
pub struct HeadlessDevice {
    frames_in_flight: usize,
    current_frame: usize,
    pending: Vec<bool>,
    recording: Option<usize>,
    recordings: Vec<Recording>,
    last_submitted: Vec<RecordedCommand>,

    buffers: SlotMap<BufferKey, HeadlessBuffer>,
    images: SlotMap<ImageKey, HeadlessImage>,
    samplers: SlotMap<SamplerKey, SamplerDesc>,
    structures: SlotMap<StructureKey, StructureLevel>,
    set_layouts: SlotMap<SetLayoutKey, Vec<DescriptorBinding>>,
    sets: SlotMap<SetKey, HeadlessDescriptorSet>,
    render_passes: SlotMap<RenderPassKey, RenderPassDesc>,
    framebuffers: SlotMap<FramebufferKey, HeadlessFramebuffer>,
    pipeline_layouts: SlotMap<PipelineLayoutKey, Vec<DescriptorSetLayoutHandle>>,
    pipelines: SlotMap<PipelineKey, HeadlessPipeline>,

    next_device_address: u64,
    properties: RayTracingProperties,
    stats: DeviceStats,
    fail_next_allocation: bool,
}

impl HeadlessDevice {
    /// Create a device processing `frames_in_flight` frames concurrently
    pub fn new(frames_in_flight: usize) -> Self {
        let frames_in_flight = frames_in_flight.max(1);
        Self {
            frames_in_flight,
            current_frame: 0,
            pending: vec![false; frames_in_flight],
            recording: None,
            recordings: (0..frames_in_flight).map(|_| Recording::default()).collect(),
            last_submitted: Vec::new(),
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
            next_device_address: 0x1000,
            properties: RayTracingProperties {
                shader_group_handle_size: 32,
                shader_group_handle_alignment: 32,
                shader_group_base_alignment: 64,
                max_ray_recursion_depth: 1,
            },
            stats: DeviceStats::default(),
            fail_next_allocation: false,
        }
    }

    /// Override the reported ray-tracing limits
    #[must_use]
    pub fn with_ray_tracing_properties(mut self, properties: RayTracingProperties) -> Self {
        self.properties = properties;
        self
    }

    /// Make the next buffer, image or acceleration-structure allocation fail
    /// with [`DeviceError::OutOfMemory`].
    pub fn fail_next_allocation(&mut self) {
        self.fail_next_allocation = true;
    }

    /// Counters
    pub fn stats(&self) -> DeviceStats {
        self.stats
    }

    /// Commands recorded so far into a command buffer
    pub fn recorded_commands(&self, cmd: CommandBufferHandle) -> &[RecordedCommand] {
        usize::try_from(cmd.0)
            .ok()
            .and_then(|slot| self.recordings.get(slot))
            .map_or(&[], |recording| recording.commands.as_slice())
    }

    /// Commands of the most recent `end_frame`
    pub fn last_submitted_commands(&self) -> &[RecordedCommand] {
        &self.last_submitted
    }

    /// Contents of a buffer
    pub fn buffer_contents(&self, buffer: BufferHandle) -> Option<&[u8]> {
        self.buffers.get(to_key(buffer.0)).map(|b| b.data.as_slice())
    }

    /// Tracked layout of an image
    pub fn image_layout(&self, image: ImageHandle) -> Option<vk::ImageLayout> {
        self.images.get(to_key(image.0)).map(|i| i.layout)
    }

    /// Overwrite one texel, standing in for a shader write
    pub fn write_image_texel(&mut self, image: ImageHandle, x: u32, y: u32, texel: &[u8]) -> DeviceResult<()> {
        let image = self.image_mut(image)?;
        let offset = texel_offset(image, x, y)?;
        if texel.len() != image.texel_size {
            return Err(DeviceError::invalid("texel size does not match the image format"));
        }
        image.data[offset..offset + texel.len()].copy_from_slice(texel);
        Ok(())
    }

    /// Instances of a top-level structure
    pub fn tlas_instances(&self, tlas: AccelerationStructureHandle) -> Option<&[TlasInstance]> {
        match self.structures.get(to_key(tlas.0)) {
            Some(StructureLevel::Top { instances }) => Some(instances),
            _ => None,
        }
    }

    /// Triangle count of a bottom-level structure
    pub fn blas_triangle_count(&self, blas: AccelerationStructureHandle) -> Option<u32> {
        match self.structures.get(to_key(blas.0)) {
            Some(StructureLevel::Bottom { triangle_count }) => Some(*triangle_count),
            _ => None,
        }
    }

    /// Descriptor currently written at `(binding, element)`
    pub fn descriptor(&self, set: DescriptorSetHandle, binding: u32, element: u32) -> Option<&DescriptorResource> {
        self.sets.get(to_key(set.0))?.bound.get(&(binding, element))
    }

    /// Number of live buffers
    pub fn live_buffer_count(&self) -> usize {
        self.buffers.len()
    }

    /// Number of live images
    pub fn live_image_count(&self) -> usize {
        self.images.len()
    }

    /// Number of live acceleration structures
    pub fn live_acceleration_structure_count(&self) -> usize {
        self.structures.len()
    }

    /// Live objects of every kind, zero once everything was released
    pub fn live_object_count(&self) -> usize {
        self.buffers.len()
            + self.images.len()
            + self.samplers.len()
            + self.structures.len()
            + self.set_layouts.len()
            + self.sets.len()
            + self.render_passes.len()
            + self.framebuffers.len()
            + self.pipeline_layouts.len()
            + self.pipelines.len()
    }

    fn take_allocation_failure(&mut self, requested: u64) -> DeviceResult<()> {
        if std::mem::take(&mut self.fail_next_allocation) {
            warn!("Injected allocation failure ({requested} bytes)");
            return Err(DeviceError::OutOfMemory { requested });
        }
        Ok(())
    }

    fn buffer(&self, handle: BufferHandle) -> DeviceResult<&HeadlessBuffer> {
        self.buffers
            .get(to_key(handle.0))
            .ok_or(DeviceError::UnknownHandle { kind: "buffer", id: handle.0 })
    }

    fn buffer_mut(&mut self, handle: BufferHandle) -> DeviceResult<&mut HeadlessBuffer> {
        self.buffers
            .get_mut(to_key(handle.0))
            .ok_or(DeviceError::UnknownHandle { kind: "buffer", id: handle.0 })
    }

    fn image(&self, handle: ImageHandle) -> DeviceResult<&HeadlessImage> {
        self.images
            .get(to_key(handle.0))
            .ok_or(DeviceError::UnknownHandle { kind: "image", id: handle.0 })
    }

    fn image_mut(&mut self, handle: ImageHandle) -> DeviceResult<&mut HeadlessImage> {
        self.images
            .get_mut(to_key(handle.0))
            .ok_or(DeviceError::UnknownHandle { kind: "image", id: handle.0 })
    }

    fn recording_mut(&mut self, cmd: CommandBufferHandle) -> DeviceResult<&mut Recording> {
        let slot = usize::try_from(cmd.0).map_err(|_| DeviceError::UnknownHandle {
            kind: "command buffer",
            id: cmd.0,
        })?;
        if self.recording != Some(slot) {
            return Err(DeviceError::invalid(format!(
                "command buffer {} is not recording",
                cmd.0
            )));
        }
        Ok(&mut self.recordings[slot])
    }

    fn record(&mut self, cmd: CommandBufferHandle, command: RecordedCommand) {
        match self.recording_mut(cmd) {
            Ok(recording) => recording.commands.push(command),
            Err(err) => warn!("Dropped command {command:?}: {err}"),
        }
    }

    fn structure_exists(&self, handle: AccelerationStructureHandle, bottom: bool) -> bool {
        matches!(
            (self.structures.get(to_key(handle.0)), bottom),
            (Some(StructureLevel::Bottom { .. }), true) | (Some(StructureLevel::Top { .. }), false)
        )
    }

    fn resource_alive(&self, resource: &DescriptorResource) -> bool {
        match resource {
            DescriptorResource::UniformBuffer(buffer) | DescriptorResource::StorageBuffer(buffer) => {
                self.buffers.contains_key(to_key(buffer.0))
            }
            DescriptorResource::StorageBuffers(buffers) => {
                buffers.iter().all(|b| self.buffers.contains_key(to_key(b.0)))
            }
            DescriptorResource::SampledImage(image, sampler) => {
                self.images.contains_key(to_key(image.0)) && self.samplers.contains_key(to_key(sampler.0))
            }
            DescriptorResource::SampledImages(images) => images.iter().all(|(image, sampler)| {
                self.images.contains_key(to_key(image.0)) && self.samplers.contains_key(to_key(sampler.0))
            }),
            DescriptorResource::StorageImage(image) => self.images.contains_key(to_key(image.0)),
            DescriptorResource::AccelerationStructure(structure) => {
                self.structures.contains_key(to_key(structure.0))
            }
        }
    }

    fn allocate_address(&mut self, size: u64) -> u64 {
        let address = self.next_device_address;
        self.next_device_address += size.max(1).next_multiple_of(256);
        address
    }
}

fn texel_offset(image: &HeadlessImage, x: u32, y: u32) -> DeviceResult<usize> {
    if x >= image.desc.width || y >= image.desc.height {
        return Err(DeviceError::invalid(format!(
            "texel ({x}, {y}) outside {}x{} image",
            image.desc.width, image.desc.height
        )));
    }
    Ok((y as usize * image.desc.width as usize + x as usize) * image.texel_size)
}

fn clear_bytes(value: ClearValue, texel_size: usize) -> Vec<u8> {
    let words: Vec<u8> = match value {
        ClearValue::Color(color) => bytemuck::cast_slice(&color).to_vec(),
        ClearValue::ColorUint(color) => bytemuck::cast_slice(&color).to_vec(),
        ClearValue::DepthStencil(depth, _) => depth.to_ne_bytes().to_vec(),
    };
    words.into_iter().cycle().take(texel_size).collect()
}

fn fill_image(image: &mut HeadlessImage, value: ClearValue) {
    let texel = clear_bytes(value, image.texel_size);
    for chunk in image.data.chunks_exact_mut(image.texel_size) {
        chunk.copy_from_slice(&texel);
    }
}

fn validate_spirv(words: &[u32], stage: &str) -> DeviceResult<()> {
    if words.first() == Some(&SPIRV_MAGIC) {
        Ok(())
    } else {
        Err(DeviceError::invalid(format!("{stage} shader is not SPIR-V")))
    }
}

fn split_resource(resource: &DescriptorResource) -> Vec<DescriptorResource> {
    match resource {
        DescriptorResource::StorageBuffers(buffers) => {
            buffers.iter().copied().map(DescriptorResource::StorageBuffer).collect()
        }
        DescriptorResource::SampledImages(images) => images
            .iter()
            .map(|&(image, sampler)| DescriptorResource::SampledImage(image, sampler))
            .collect(),
        single => vec![single.clone()],
    }
}

impl RenderDevice for HeadlessDevice {
    fn frames_in_flight(&self) -> usize {
        self.frames_in_flight
    }

    fn current_frame(&self) -> usize {
        self.current_frame
    }

    fn begin_frame(&mut self) -> DeviceResult<FrameContext> {
        if self.recording.is_some() {
            return Err(DeviceError::invalid("begin_frame called while a frame is recording"));
        }
        let frame_index = self.current_frame;
        // The fence of this slot's previous submission is waited on here.
        self.pending[frame_index] = false;
        self.recordings[frame_index] = Recording::default();
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
        let recording = std::mem::take(&mut self.recordings[frame.frame_index]);
        if recording.active_framebuffer.is_some() {
            return Err(DeviceError::invalid("end_frame inside a render pass"));
        }
        self.last_submitted = recording.commands;
        self.pending[frame.frame_index] = true;
        self.recording = None;
        self.current_frame = (self.current_frame + 1) % self.frames_in_flight;
        self.stats.frames_submitted += 1;
        Ok(())
    }

    fn frame_pending(&self, frame: usize) -> bool {
        self.pending.get(frame).copied().unwrap_or(false)
    }

    fn is_recording(&self) -> bool {
        self.recording.is_some()
    }

    fn wait_idle(&mut self) -> DeviceResult<()> {
        self.pending.iter_mut().for_each(|p| *p = false);
        self.stats.wait_idle_calls += 1;
        Ok(())
    }

    fn create_buffer(&mut self, desc: &BufferDesc) -> DeviceResult<BufferHandle> {
        if desc.size == 0 {
            return Err(DeviceError::invalid("buffer size must be non-zero"));
        }
        self.take_allocation_failure(desc.size)?;
        let size = usize::try_from(desc.size).map_err(|_| DeviceError::OutOfMemory { requested: desc.size })?;
        let address = self.allocate_address(desc.size);
        let key = self.buffers.insert(HeadlessBuffer {
            desc: *desc,
            data: vec![0; size],
            address,
        });
        Ok(BufferHandle(to_id(key)))
    }

    fn write_buffer(&mut self, buffer: BufferHandle, offset: u64, data: &[u8]) -> DeviceResult<()> {
        let target = self.buffer_mut(buffer)?;
        if target.desc.location != MemoryLocation::HostVisible {
            return Err(DeviceError::invalid("write_buffer on a device-local buffer"));
        }
        let start = offset as usize;
        let end = start + data.len();
        if end > target.data.len() {
            return Err(DeviceError::invalid(format!(
                "write of {} bytes at {offset} overflows {} byte buffer",
                data.len(),
                target.data.len()
            )));
        }
        target.data[start..end].copy_from_slice(data);
        Ok(())
    }

    fn upload_buffer(&mut self, buffer: BufferHandle, data: &[u8]) -> DeviceResult<()> {
        let target = self.buffer_mut(buffer)?;
        if data.len() > target.data.len() {
            return Err(DeviceError::invalid("upload larger than the destination buffer"));
        }
        target.data[..data.len()].copy_from_slice(data);
        self.stats.single_time_submits += 1;
        Ok(())
    }

    fn buffer_device_address(&self, buffer: BufferHandle) -> DeviceResult<u64> {
        let buffer = self.buffer(buffer)?;
        if !buffer.desc.usage.contains(vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS) {
            return Err(DeviceError::invalid("buffer was created without SHADER_DEVICE_ADDRESS"));
        }
        Ok(buffer.address)
    }

    fn destroy_buffer(&mut self, buffer: BufferHandle) {
        if self.buffers.remove(to_key(buffer.0)).is_none() {
            warn!("destroy_buffer on unknown handle {}", buffer.0);
        }
    }

    fn create_image(&mut self, desc: &ImageDesc) -> DeviceResult<ImageHandle> {
        let texel_size = format_texel_size(desc.format)
            .ok_or_else(|| DeviceError::Unsupported(format!("image format {:?}", desc.format)))?;
        if desc.width == 0 || desc.height == 0 {
            return Err(DeviceError::invalid("image extent must be non-zero"));
        }
        let bytes = desc.width as usize * desc.height as usize * texel_size;
        self.take_allocation_failure(bytes as u64)?;
        let key = self.images.insert(HeadlessImage {
            desc: *desc,
            texel_size,
            data: vec![0; bytes],
            layout: vk::ImageLayout::UNDEFINED,
        });
        Ok(ImageHandle(to_id(key)))
    }

    fn resize_image(&mut self, image: ImageHandle, width: u32, height: u32) -> DeviceResult<()> {
        if width == 0 || height == 0 {
            return Err(DeviceError::invalid("image extent must be non-zero"));
        }
        let target = self.image_mut(image)?;
        target.desc.width = width;
        target.desc.height = height;
        target.data = vec![0; width as usize * height as usize * target.texel_size];
        target.layout = vk::ImageLayout::UNDEFINED;
        Ok(())
    }

    fn image_extent(&self, image: ImageHandle) -> DeviceResult<vk::Extent2D> {
        Ok(self.image(image)?.desc.extent())
    }

    fn upload_image(&mut self, image: ImageHandle, data: &[u8]) -> DeviceResult<()> {
        let target = self.image_mut(image)?;
        if data.len() != target.data.len() {
            return Err(DeviceError::invalid(format!(
                "image upload of {} bytes, expected {}",
                data.len(),
                target.data.len()
            )));
        }
        target.data.copy_from_slice(data);
        target.layout = vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL;
        self.stats.single_time_submits += 1;
        Ok(())
    }

    fn read_image_texel(
        &mut self,
        image: ImageHandle,
        layout: vk::ImageLayout,
        x: u32,
        y: u32,
    ) -> DeviceResult<Vec<u8>> {
        let source = self.image(image)?;
        if layout != vk::ImageLayout::TRANSFER_SRC_OPTIMAL && layout != vk::ImageLayout::GENERAL {
            return Err(DeviceError::invalid(format!("cannot copy from an image in {layout:?}")));
        }
        if source.layout != layout {
            return Err(DeviceError::invalid(format!(
                "image is in {:?}, caller assumed {layout:?}",
                source.layout
            )));
        }
        let offset = texel_offset(source, x, y)?;
        let texel = source.data[offset..offset + source.texel_size].to_vec();
        self.stats.single_time_submits += 1;
        Ok(texel)
    }

    fn destroy_image(&mut self, image: ImageHandle) {
        if self.images.remove(to_key(image.0)).is_none() {
            warn!("destroy_image on unknown handle {}", image.0);
        }
    }

    fn create_sampler(&mut self, desc: &SamplerDesc) -> DeviceResult<SamplerHandle> {
        Ok(SamplerHandle(to_id(self.samplers.insert(*desc))))
    }

    fn destroy_sampler(&mut self, sampler: SamplerHandle) {
        self.samplers.remove(to_key(sampler.0));
    }

    fn create_blas(&mut self, desc: &BlasDesc) -> DeviceResult<AccelerationStructureHandle> {
        self.buffer(desc.vertex_buffer)?;
        self.buffer(desc.index_buffer)?;
        if desc.index_count == 0 || desc.index_count % 3 != 0 {
            return Err(DeviceError::invalid(format!(
                "index count {} is not a non-empty triangle list",
                desc.index_count
            )));
        }
        self.take_allocation_failure(u64::from(desc.index_count) * 4)?;
        let key = self.structures.insert(StructureLevel::Bottom {
            triangle_count: desc.index_count / 3,
        });
        self.stats.blas_builds += 1;
        self.stats.single_time_submits += 1;
        debug!("Built BLAS with {} triangles", desc.index_count / 3);
        Ok(AccelerationStructureHandle(to_id(key)))
    }

    fn build_tlas(&mut self, instances: &[TlasInstance]) -> DeviceResult<AccelerationStructureHandle> {
        if let Some(missing) = instances.iter().find(|i| !self.structure_exists(i.blas, true)) {
            return Err(DeviceError::UnknownHandle {
                kind: "bottom-level structure",
                id: missing.blas.0,
            });
        }
        self.take_allocation_failure((instances.len() * 64) as u64)?;
        let key = self.structures.insert(StructureLevel::Top {
            instances: instances.to_vec(),
        });
        self.stats.tlas_builds += 1;
        self.stats.single_time_submits += 1;
        Ok(AccelerationStructureHandle(to_id(key)))
    }

    fn cmd_refit_tlas(
        &mut self,
        cmd: CommandBufferHandle,
        tlas: AccelerationStructureHandle,
        instances: &[TlasInstance],
    ) -> DeviceResult<()> {
        self.recording_mut(cmd)?;
        if let Some(missing) = instances.iter().find(|i| !self.structure_exists(i.blas, true)) {
            return Err(DeviceError::UnknownHandle {
                kind: "bottom-level structure",
                id: missing.blas.0,
            });
        }
        match self.structures.get_mut(to_key(tlas.0)) {
            Some(StructureLevel::Top { instances: built }) => {
                if built.len() != instances.len() {
                    return Err(DeviceError::invalid(format!(
                        "refit with {} instances of a structure built for {}",
                        instances.len(),
                        built.len()
                    )));
                }
                built.copy_from_slice(instances);
            }
            _ => {
                return Err(DeviceError::UnknownHandle {
                    kind: "top-level structure",
                    id: tlas.0,
                })
            }
        }
        self.stats.tlas_refits += 1;
        self.record(
            cmd,
            RecordedCommand::RefitTlas {
                tlas,
                instance_count: instances.len(),
            },
        );
        Ok(())
    }

    fn destroy_acceleration_structure(&mut self, structure: AccelerationStructureHandle) {
        self.structures.remove(to_key(structure.0));
    }

    fn create_descriptor_set_layout(
        &mut self,
        bindings: &[DescriptorBinding],
    ) -> DeviceResult<DescriptorSetLayoutHandle> {
        Ok(DescriptorSetLayoutHandle(to_id(self.set_layouts.insert(bindings.to_vec()))))
    }

    fn allocate_descriptor_set(
        &mut self,
        layout: DescriptorSetLayoutHandle,
    ) -> DeviceResult<DescriptorSetHandle> {
        let bindings = self
            .set_layouts
            .get(to_key(layout.0))
            .ok_or(DeviceError::UnknownHandle {
                kind: "descriptor set layout",
                id: layout.0,
            })?
            .clone();
        let key = self.sets.insert(HeadlessDescriptorSet {
            layout: bindings,
            bound: BTreeMap::new(),
        });
        Ok(DescriptorSetHandle(to_id(key)))
    }

    fn destroy_descriptor_set_layout(&mut self, layout: DescriptorSetLayoutHandle) {
        self.set_layouts.remove(to_key(layout.0));
    }

    fn free_descriptor_set(&mut self, set: DescriptorSetHandle) {
        self.sets.remove(to_key(set.0));
    }

    fn write_descriptor_set(
        &mut self,
        set: DescriptorSetHandle,
        writes: &[DescriptorWrite],
    ) -> DeviceResult<()> {
        if let Some(dead) = writes.iter().find(|w| !self.resource_alive(&w.resource)) {
            return Err(DeviceError::invalid(format!(
                "descriptor write to binding {} references a destroyed resource",
                dead.binding
            )));
        }
        let target = self.sets.get_mut(to_key(set.0)).ok_or(DeviceError::UnknownHandle {
            kind: "descriptor set",
            id: set.0,
        })?;
        for write in writes {
            let binding = target
                .layout
                .iter()
                .find(|b| b.binding == write.binding)
                .ok_or_else(|| DeviceError::invalid(format!("binding {} not in layout", write.binding)))?;
            let end = write.array_element as usize + write.resource.len();
            if end > binding.count as usize {
                return Err(DeviceError::invalid(format!(
                    "binding {} holds {} descriptors, write ends at {end}",
                    write.binding, binding.count
                )));
            }
            if binding.bindless {
                // Partially bound array: elements past the written range are
                // never indexed, so they no longer count as bound.
                let written = write.binding;
                target.bound.retain(|(b, element), _| *b != written || (*element as usize) < end);
            }
            for (offset, single) in split_resource(&write.resource).into_iter().enumerate() {
                target.bound.insert((write.binding, write.array_element + offset as u32), single);
            }
        }
        self.stats.descriptor_writes += 1;
        Ok(())
    }

    fn create_render_pass(&mut self, desc: &RenderPassDesc) -> DeviceResult<RenderPassHandle> {
        for format in desc.color_formats.iter().chain(desc.depth_format.iter()) {
            if format_texel_size(*format).is_none() {
                return Err(DeviceError::Unsupported(format!("attachment format {format:?}")));
            }
        }
        Ok(RenderPassHandle(to_id(self.render_passes.insert(desc.clone()))))
    }

    fn destroy_render_pass(&mut self, render_pass: RenderPassHandle) {
        self.render_passes.remove(to_key(render_pass.0));
    }

    fn create_framebuffer(
        &mut self,
        render_pass: RenderPassHandle,
        attachments: &[ImageHandle],
        extent: vk::Extent2D,
    ) -> DeviceResult<FramebufferHandle> {
        let pass = self.render_passes.get(to_key(render_pass.0)).ok_or(DeviceError::UnknownHandle {
            kind: "render pass",
            id: render_pass.0,
        })?;
        let expected = pass.color_formats.len() + usize::from(pass.depth_format.is_some());
        if attachments.len() != expected {
            return Err(DeviceError::invalid(format!(
                "framebuffer has {} attachments, render pass expects {expected}",
                attachments.len()
            )));
        }
        for &attachment in attachments {
            if self.image(attachment)?.desc.extent() != extent {
                return Err(DeviceError::invalid("attachment extent differs from framebuffer extent"));
            }
        }
        let key = self.framebuffers.insert(HeadlessFramebuffer {
            render_pass,
            attachments: attachments.to_vec(),
        });
        Ok(FramebufferHandle(to_id(key)))
    }

    fn destroy_framebuffer(&mut self, framebuffer: FramebufferHandle) {
        self.framebuffers.remove(to_key(framebuffer.0));
    }

    fn create_pipeline_layout(
        &mut self,
        set_layouts: &[DescriptorSetLayoutHandle],
    ) -> DeviceResult<PipelineLayoutHandle> {
        for layout in set_layouts {
            if !self.set_layouts.contains_key(to_key(layout.0)) {
                return Err(DeviceError::UnknownHandle {
                    kind: "descriptor set layout",
                    id: layout.0,
                });
            }
        }
        Ok(PipelineLayoutHandle(to_id(self.pipeline_layouts.insert(set_layouts.to_vec()))))
    }

    fn destroy_pipeline_layout(&mut self, layout: PipelineLayoutHandle) {
        self.pipeline_layouts.remove(to_key(layout.0));
    }

    fn create_graphics_pipeline(&mut self, desc: &GraphicsPipelineDesc<'_>) -> DeviceResult<PipelineHandle> {
        validate_spirv(desc.vertex_spirv, "vertex")?;
        validate_spirv(desc.fragment_spirv, "fragment")?;
        if !self.pipeline_layouts.contains_key(to_key(desc.layout.0)) {
            return Err(DeviceError::UnknownHandle {
                kind: "pipeline layout",
                id: desc.layout.0,
            });
        }
        debug!("Created graphics pipeline '{}'", desc.name);
        let key = self.pipelines.insert(HeadlessPipeline {
            bind_point: vk::PipelineBindPoint::GRAPHICS,
            group_count: 0,
        });
        Ok(PipelineHandle(to_id(key)))
    }

    fn create_ray_tracing_pipeline(
        &mut self,
        desc: &RayTracingPipelineDesc<'_>,
    ) -> DeviceResult<PipelineHandle> {
        validate_spirv(desc.raygen_spirv, "ray generation")?;
        for words in desc.miss_spirv.iter().chain(desc.closest_hit_spirv.iter()) {
            validate_spirv(words, "ray tracing")?;
        }
        if desc.max_recursion_depth > self.properties.max_ray_recursion_depth {
            return Err(DeviceError::Unsupported(format!(
                "recursion depth {} exceeds device limit {}",
                desc.max_recursion_depth, self.properties.max_ray_recursion_depth
            )));
        }
        debug!("Created ray tracing pipeline '{}' with {} groups", desc.name, desc.group_count());
        let key = self.pipelines.insert(HeadlessPipeline {
            bind_point: vk::PipelineBindPoint::RAY_TRACING_KHR,
            group_count: desc.group_count(),
        });
        Ok(PipelineHandle(to_id(key)))
    }

    fn destroy_pipeline(&mut self, pipeline: PipelineHandle) {
        self.pipelines.remove(to_key(pipeline.0));
    }

    fn ray_tracing_properties(&self) -> RayTracingProperties {
        self.properties
    }

    fn shader_group_handles(&mut self, pipeline: PipelineHandle, group_count: u32) -> DeviceResult<Vec<u8>> {
        let pipeline = self.pipelines.get(to_key(pipeline.0)).ok_or(DeviceError::UnknownHandle {
            kind: "pipeline",
            id: pipeline.0,
        })?;
        if pipeline.bind_point != vk::PipelineBindPoint::RAY_TRACING_KHR || group_count > pipeline.group_count {
            return Err(DeviceError::invalid("shader group handles requested from an incompatible pipeline"));
        }
        let handle_size = self.properties.shader_group_handle_size as usize;
        Ok((0..group_count)
            .flat_map(|group| std::iter::repeat((group + 1) as u8).take(handle_size))
            .collect())
    }

    fn cmd_pipeline_barrier(&mut self, cmd: CommandBufferHandle, barriers: &[ImageBarrier]) {
        for barrier in barriers {
            match self.images.get_mut(to_key(barrier.image.0)) {
                Some(image) => {
                    if barrier.old_layout != vk::ImageLayout::UNDEFINED && barrier.old_layout != image.layout {
                        warn!(
                            "Barrier expects {:?} but image is in {:?}",
                            barrier.old_layout, image.layout
                        );
                        self.stats.layout_mismatches += 1;
                    }
                    image.layout = barrier.new_layout;
                }
                None => warn!("Barrier on unknown image {}", barrier.image.0),
            }
            self.record(cmd, RecordedCommand::ImageBarrier(*barrier));
        }
    }

    fn cmd_buffer_barrier(&mut self, cmd: CommandBufferHandle, barrier: &BufferBarrier) {
        self.record(cmd, RecordedCommand::BufferBarrier(*barrier));
    }

    fn cmd_copy_buffer(
        &mut self,
        cmd: CommandBufferHandle,
        src: BufferHandle,
        dst: BufferHandle,
        size: u64,
    ) -> DeviceResult<()> {
        self.recording_mut(cmd)?;
        let len = size as usize;
        let bytes = self
            .buffer(src)?
            .data
            .get(..len)
            .ok_or_else(|| DeviceError::invalid("copy past the end of the source buffer"))?
            .to_vec();
        self.buffer_mut(dst)?
            .data
            .get_mut(..len)
            .ok_or_else(|| DeviceError::invalid("copy past the end of the destination buffer"))?
            .copy_from_slice(&bytes);
        self.record(cmd, RecordedCommand::CopyBuffer { src, dst, size });
        Ok(())
    }

    fn cmd_begin_render_pass(
        &mut self,
        cmd: CommandBufferHandle,
        render_pass: RenderPassHandle,
        framebuffer: FramebufferHandle,
        clear_values: &[ClearValue],
    ) -> DeviceResult<()> {
        if self.recording_mut(cmd)?.active_framebuffer.is_some() {
            return Err(DeviceError::invalid("render pass begun inside another render pass"));
        }
        let target = self.framebuffers.get(to_key(framebuffer.0)).ok_or(DeviceError::UnknownHandle {
            kind: "framebuffer",
            id: framebuffer.0,
        })?;
        if target.render_pass != render_pass {
            return Err(DeviceError::invalid("framebuffer was created for another render pass"));
        }
        if clear_values.len() != target.attachments.len() {
            return Err(DeviceError::invalid(format!(
                "{} clear values for {} attachments",
                clear_values.len(),
                target.attachments.len()
            )));
        }
        let attachments = target.attachments.clone();
        for (&attachment, &clear) in attachments.iter().zip(clear_values) {
            let image = self.image_mut(attachment)?;
            fill_image(image, clear);
            image.layout = if image.desc.aspect.contains(vk::ImageAspectFlags::DEPTH) {
                vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL
            } else {
                vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL
            };
        }
        self.recording_mut(cmd)?.active_framebuffer = Some(framebuffer);
        self.record(cmd, RecordedCommand::BeginRenderPass { render_pass, framebuffer });
        Ok(())
    }

    fn cmd_end_render_pass(&mut self, cmd: CommandBufferHandle) {
        let Ok(recording) = self.recording_mut(cmd) else {
            warn!("cmd_end_render_pass on a command buffer that is not recording");
            return;
        };
        let Some(framebuffer) = recording.active_framebuffer.take() else {
            warn!("cmd_end_render_pass without an active render pass");
            return;
        };
        if let Some(target) = self.framebuffers.get(to_key(framebuffer.0)) {
            let final_layout = self
                .render_passes
                .get(to_key(target.render_pass.0))
                .map_or(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL, |pass| pass.final_color_layout);
            for attachment in &target.attachments {
                if let Some(image) = self.images.get_mut(to_key(attachment.0)) {
                    if !image.desc.aspect.contains(vk::ImageAspectFlags::DEPTH) {
                        image.layout = final_layout;
                    }
                }
            }
        }
        self.record(cmd, RecordedCommand::EndRenderPass);
    }

    fn cmd_bind_pipeline(
        &mut self,
        cmd: CommandBufferHandle,
        bind_point: vk::PipelineBindPoint,
        pipeline: PipelineHandle,
    ) {
        self.record(cmd, RecordedCommand::BindPipeline { bind_point, pipeline });
    }

    fn cmd_bind_descriptor_sets(
        &mut self,
        cmd: CommandBufferHandle,
        bind_point: vk::PipelineBindPoint,
        _layout: PipelineLayoutHandle,
        first_set: u32,
        sets: &[DescriptorSetHandle],
    ) {
        for set in sets {
            let Some(bound) = self.sets.get(to_key(set.0)) else {
                warn!("Binding unknown descriptor set {}", set.0);
                self.stats.stale_descriptor_binds += 1;
                continue;
            };
            let stale = bound.bound.values().any(|resource| !self.resource_alive(resource));
            if stale {
                warn!("Descriptor set {} references a destroyed resource", set.0);
                self.stats.stale_descriptor_binds += 1;
            }
        }
        self.record(
            cmd,
            RecordedCommand::BindDescriptorSets {
                bind_point,
                first_set,
                sets: sets.to_vec(),
            },
        );
    }

    fn cmd_bind_vertex_buffer(&mut self, cmd: CommandBufferHandle, buffer: BufferHandle) {
        self.record(cmd, RecordedCommand::BindVertexBuffer(buffer));
    }

    fn cmd_bind_index_buffer(&mut self, cmd: CommandBufferHandle, buffer: BufferHandle) {
        self.record(cmd, RecordedCommand::BindIndexBuffer(buffer));
    }

    fn cmd_draw(&mut self, cmd: CommandBufferHandle, vertex_count: u32, instance_count: u32) {
        self.record(cmd, RecordedCommand::Draw { vertex_count, instance_count });
    }

    fn cmd_draw_indexed(&mut self, cmd: CommandBufferHandle, index_count: u32, instance_count: u32) {
        self.record(cmd, RecordedCommand::DrawIndexed { index_count, instance_count });
    }

    fn cmd_clear_depth(&mut self, cmd: CommandBufferHandle, _extent: vk::Extent2D, depth: f32) {
        let active = self.recording_mut(cmd).ok().and_then(|r| r.active_framebuffer);
        let Some(framebuffer) = active else {
            warn!("cmd_clear_depth outside a render pass");
            return;
        };
        let attachments = self
            .framebuffers
            .get(to_key(framebuffer.0))
            .map(|f| f.attachments.clone())
            .unwrap_or_default();
        for attachment in attachments {
            if let Some(image) = self.images.get_mut(to_key(attachment.0)) {
                if image.desc.aspect.contains(vk::ImageAspectFlags::DEPTH) {
                    fill_image(image, ClearValue::DepthStencil(depth, 0));
                }
            }
        }
        self.record(cmd, RecordedCommand::ClearDepth);
    }

    fn cmd_trace_rays(
        &mut self,
        cmd: CommandBufferHandle,
        _regions: &ShaderBindingRegions,
        width: u32,
        height: u32,
    ) {
        self.record(cmd, RecordedCommand::TraceRays { width, height });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_submitted_slot_stays_pending_until_revisited() {
        let mut device = HeadlessDevice::new(2);

        let first = device.begin_frame().unwrap();
        assert_eq!(first.frame_index, 0);
        device.end_frame(first).unwrap();
        assert!(device.frame_pending(0));

        let second = device.begin_frame().unwrap();
        assert_eq!(second.frame_index, 1);
        assert!(device.frame_pending(0));
        device.end_frame(second).unwrap();

        let third = device.begin_frame().unwrap();
        assert_eq!(third.frame_index, 0);
        assert!(!device.frame_pending(0));
        assert!(device.frame_pending(1));
    }

    #[test]
    fn test_wait_idle_retires_everything() {
        let mut device = HeadlessDevice::new(3);
        for _ in 0..3 {
            let frame = device.begin_frame().unwrap();
            device.end_frame(frame).unwrap();
        }
        device.wait_idle().unwrap();
        assert!((0..3).all(|slot| !device.frame_pending(slot)));
        assert_eq!(device.stats().wait_idle_calls, 1);
    }

    #[test]
    fn test_injected_allocation_failure_is_one_shot() {
        let mut device = HeadlessDevice::new(2);
        device.fail_next_allocation();
        let desc = BufferDesc::staging(64);
        assert!(matches!(device.create_buffer(&desc), Err(DeviceError::OutOfMemory { .. })));
        assert!(device.create_buffer(&desc).is_ok());
    }

    #[test]
    fn test_copy_applies_when_recorded() {
        let mut device = HeadlessDevice::new(2);
        let staging = device.create_buffer(&BufferDesc::staging(4)).unwrap();
        let target = device
            .create_buffer(&BufferDesc::device_local(4, vk::BufferUsageFlags::UNIFORM_BUFFER))
            .unwrap();
        device.write_buffer(staging, 0, &[1, 2, 3, 4]).unwrap();

        let frame = device.begin_frame().unwrap();
        device.cmd_copy_buffer(frame.command_buffer, staging, target, 4).unwrap();
        device.end_frame(frame).unwrap();

        assert_eq!(device.buffer_contents(target).unwrap(), &[1, 2, 3, 4]);
        assert!(matches!(
            device.last_submitted_commands(),
            [RecordedCommand::CopyBuffer { size: 4, .. }]
        ));
    }

    #[test]
    fn test_device_local_buffers_reject_direct_writes() {
        let mut device = HeadlessDevice::new(2);
        let buffer = device
            .create_buffer(&BufferDesc::device_local(16, vk::BufferUsageFlags::STORAGE_BUFFER))
            .unwrap();
        assert!(device.write_buffer(buffer, 0, &[0; 4]).is_err());
        assert!(device.upload_buffer(buffer, &[0; 4]).is_ok());
    }

    #[test]
    fn test_refit_requires_matching_instance_count() {
        let mut device = HeadlessDevice::new(2);
        let vertices = device.create_buffer(&BufferDesc::staging(36)).unwrap();
        let indices = device.create_buffer(&BufferDesc::staging(12)).unwrap();
        let blas = device
            .create_blas(&BlasDesc {
                vertex_buffer: vertices,
                vertex_count: 3,
                vertex_stride: 12,
                index_buffer: indices,
                index_count: 3,
            })
            .unwrap();
        let instance = TlasInstance {
            blas,
            transform: [1.0, 0.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 0.0, 1.0, 0.0],
            custom_index: 0,
            mask: 0xFF,
        };
        let tlas = device.build_tlas(&[instance]).unwrap();

        let frame = device.begin_frame().unwrap();
        assert!(device.cmd_refit_tlas(frame.command_buffer, tlas, &[instance, instance]).is_err());
        device.cmd_refit_tlas(frame.command_buffer, tlas, &[instance]).unwrap();
        device.end_frame(frame).unwrap();

        assert_eq!(device.stats().tlas_builds, 1);
        assert_eq!(device.stats().tlas_refits, 1);
    }

    #[test]
    fn test_texel_readback_checks_layout_and_bounds() {
        let mut device = HeadlessDevice::new(2);
        let image = device
            .create_image(&ImageDesc::color(
                2,
                2,
                vk::Format::R32G32_UINT,
                vk::ImageUsageFlags::TRANSFER_SRC,
            ))
            .unwrap();
        assert!(device
            .read_image_texel(image, vk::ImageLayout::TRANSFER_SRC_OPTIMAL, 0, 0)
            .is_err());

        let frame = device.begin_frame().unwrap();
        device.cmd_pipeline_barrier(
            frame.command_buffer,
            &[ImageBarrier {
                image,
                aspect: vk::ImageAspectFlags::COLOR,
                old_layout: vk::ImageLayout::UNDEFINED,
                new_layout: vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                src_stage: vk::PipelineStageFlags::TOP_OF_PIPE,
                src_access: vk::AccessFlags::empty(),
                dst_stage: vk::PipelineStageFlags::TRANSFER,
                dst_access: vk::AccessFlags::TRANSFER_READ,
            }],
        );
        device.end_frame(frame).unwrap();

        let texel: [u32; 2] = [7, 9];
        device
            .write_image_texel(image, 1, 1, bytemuck::cast_slice(&texel))
            .unwrap();
        let read = device
            .read_image_texel(image, vk::ImageLayout::TRANSFER_SRC_OPTIMAL, 1, 1)
            .unwrap();
        assert_eq!(bytemuck::pod_read_unaligned::<[u32; 2]>(&read), texel);
        assert!(device
            .read_image_texel(image, vk::ImageLayout::TRANSFER_SRC_OPTIMAL, 2, 0)
            .is_err());
    }
}
