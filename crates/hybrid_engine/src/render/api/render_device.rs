//! Graphics-device abstraction
//!
//! `RenderDevice` is the seam between the renderer core (asset pool, scene,
//! render graph) and a concrete backend. It covers exactly what the core
//! consumes: the frame-in-flight protocol, resource creation, synchronous
//! single-time uploads, and command recording. Instance, device and
//! swapchain bootstrap live outside of it.
//!
//! Commands are recorded into the command buffer returned by
//! [`RenderDevice::begin_frame`] and submitted by [`RenderDevice::end_frame`].
//! Operations documented as synchronous block until the device finished them.

use ash::vk;
use thiserror::Error;

use super::resources::{
    AccelerationStructureHandle, BlasDesc, BufferBarrier, BufferDesc, BufferHandle, ClearValue,
    CommandBufferHandle, DescriptorBinding, DescriptorSetHandle, DescriptorSetLayoutHandle,
    DescriptorWrite, FrameContext, FramebufferHandle, GraphicsPipelineDesc, ImageBarrier, ImageDesc,
    ImageHandle, PipelineHandle, PipelineLayoutHandle, RayTracingPipelineDesc, RayTracingProperties,
    RenderPassDesc, RenderPassHandle, SamplerDesc, SamplerHandle, ShaderBindingRegions, TlasInstance,
};

/// Errors reported by device backends
#[derive(Error, Debug)]
pub enum DeviceError {
    /// Vulkan API call failed
    #[error("Vulkan API error: {0:?}")]
    Api(vk::Result),

    /// Device or host memory exhausted
    #[error("Out of memory: requested {requested} bytes")]
    OutOfMemory {
        /// Bytes requested by the failing allocation
        requested: u64,
    },

    /// Format, feature or parameter the device cannot provide
    #[error("Unsupported: {0}")]
    Unsupported(String),

    /// Handle that is unknown or already destroyed
    #[error("Unknown {kind} handle {id}")]
    UnknownHandle {
        /// Resource kind
        kind: &'static str,
        /// Raw handle value
        id: u64,
    },

    /// CPU write targeting a frame slot the device may still be reading
    #[error("Frame slot {frame} is still in flight")]
    FrameInFlight {
        /// Frame-in-flight slot
        frame: usize,
    },

    /// Invalid use of the API
    #[error("Invalid operation: {reason}")]
    InvalidOperation {
        /// What went wrong
        reason: String,
    },
}

impl From<vk::Result> for DeviceError {
    fn from(result: vk::Result) -> Self {
        match result {
            vk::Result::ERROR_OUT_OF_DEVICE_MEMORY | vk::Result::ERROR_OUT_OF_HOST_MEMORY => {
                Self::OutOfMemory { requested: 0 }
            }
            other => Self::Api(other),
        }
    }
}

impl DeviceError {
    /// Shorthand for [`DeviceError::InvalidOperation`]
    pub fn invalid(reason: impl Into<String>) -> Self {
        Self::InvalidOperation { reason: reason.into() }
    }
}

/// Result type for device operations
pub type DeviceResult<T> = Result<T, DeviceError>;

/// Graphics device consumed by the renderer core
pub trait RenderDevice {
    // ---- frame protocol -------------------------------------------------

    /// Number of frames the device processes concurrently (N)
    fn frames_in_flight(&self) -> usize;

    /// Slot the CPU records into next, in `[0, N)`
    fn current_frame(&self) -> usize;

    /// Wait until the current slot's previous submission retired, then start
    /// recording its command buffer.
    fn begin_frame(&mut self) -> DeviceResult<FrameContext>;

    /// Submit the frame's command buffer and advance to the next slot.
    fn end_frame(&mut self, frame: FrameContext) -> DeviceResult<()>;

    /// Whether a submission that used slot `frame` may still be executing
    fn frame_pending(&self, frame: usize) -> bool;

    /// Whether a frame is between `begin_frame` and `end_frame`
    fn is_recording(&self) -> bool;

    /// Block until the device finished all submitted work.
    fn wait_idle(&mut self) -> DeviceResult<()>;

    // ---- buffers --------------------------------------------------------

    /// Create a buffer
    fn create_buffer(&mut self, desc: &BufferDesc) -> DeviceResult<BufferHandle>;

    /// Write bytes into a host-visible buffer at `offset`.
    fn write_buffer(&mut self, buffer: BufferHandle, offset: u64, data: &[u8]) -> DeviceResult<()>;

    /// Upload bytes into a device-local buffer (synchronous).
    fn upload_buffer(&mut self, buffer: BufferHandle, data: &[u8]) -> DeviceResult<()>;

    /// GPU virtual address of a buffer created with `SHADER_DEVICE_ADDRESS`
    fn buffer_device_address(&self, buffer: BufferHandle) -> DeviceResult<u64>;

    /// Destroy a buffer
    fn destroy_buffer(&mut self, buffer: BufferHandle);

    // ---- images ---------------------------------------------------------

    /// Create an image in `UNDEFINED` layout
    fn create_image(&mut self, desc: &ImageDesc) -> DeviceResult<ImageHandle>;

    /// Re-create an image's storage at a new size, keeping its handle.
    /// Contents are discarded and the layout returns to `UNDEFINED`.
    fn resize_image(&mut self, image: ImageHandle, width: u32, height: u32) -> DeviceResult<()>;

    /// Current size of an image
    fn image_extent(&self, image: ImageHandle) -> DeviceResult<vk::Extent2D>;

    /// Upload tightly packed texels and leave the image in
    /// `SHADER_READ_ONLY_OPTIMAL` (synchronous).
    fn upload_image(&mut self, image: ImageHandle, data: &[u8]) -> DeviceResult<()>;

    /// Read one texel of an image currently in `layout` (synchronous).
    fn read_image_texel(
        &mut self,
        image: ImageHandle,
        layout: vk::ImageLayout,
        x: u32,
        y: u32,
    ) -> DeviceResult<Vec<u8>>;

    /// Destroy an image
    fn destroy_image(&mut self, image: ImageHandle);

    /// Create a sampler
    fn create_sampler(&mut self, desc: &SamplerDesc) -> DeviceResult<SamplerHandle>;

    /// Destroy a sampler
    fn destroy_sampler(&mut self, sampler: SamplerHandle);

    // ---- acceleration structures ---------------------------------------

    /// Build a bottom-level structure over triangle geometry (synchronous).
    fn create_blas(&mut self, desc: &BlasDesc) -> DeviceResult<AccelerationStructureHandle>;

    /// Allocate and build a top-level structure sized for `instances`
    /// (synchronous). The structure allows later refits.
    fn build_tlas(&mut self, instances: &[TlasInstance]) -> DeviceResult<AccelerationStructureHandle>;

    /// Record an in-place refit of `tlas` with a new instance list of the
    /// same length. Does not block.
    fn cmd_refit_tlas(
        &mut self,
        cmd: CommandBufferHandle,
        tlas: AccelerationStructureHandle,
        instances: &[TlasInstance],
    ) -> DeviceResult<()>;

    /// Destroy an acceleration structure and its backing memory
    fn destroy_acceleration_structure(&mut self, structure: AccelerationStructureHandle);

    // ---- descriptors ----------------------------------------------------

    /// Create a descriptor set layout
    fn create_descriptor_set_layout(
        &mut self,
        bindings: &[DescriptorBinding],
    ) -> DeviceResult<DescriptorSetLayoutHandle>;

    /// Allocate a descriptor set
    fn allocate_descriptor_set(
        &mut self,
        layout: DescriptorSetLayoutHandle,
    ) -> DeviceResult<DescriptorSetHandle>;

    /// Destroy a descriptor set layout
    fn destroy_descriptor_set_layout(&mut self, layout: DescriptorSetLayoutHandle);

    /// Return a descriptor set to its pool
    fn free_descriptor_set(&mut self, set: DescriptorSetHandle);

    /// Write descriptors. The set must not be referenced by pending work.
    fn write_descriptor_set(
        &mut self,
        set: DescriptorSetHandle,
        writes: &[DescriptorWrite],
    ) -> DeviceResult<()>;

    // ---- pipelines ------------------------------------------------------

    /// Create a render pass
    fn create_render_pass(&mut self, desc: &RenderPassDesc) -> DeviceResult<RenderPassHandle>;

    /// Destroy a render pass
    fn destroy_render_pass(&mut self, render_pass: RenderPassHandle);

    /// Create a framebuffer over `attachments`
    fn create_framebuffer(
        &mut self,
        render_pass: RenderPassHandle,
        attachments: &[ImageHandle],
        extent: vk::Extent2D,
    ) -> DeviceResult<FramebufferHandle>;

    /// Destroy a framebuffer
    fn destroy_framebuffer(&mut self, framebuffer: FramebufferHandle);

    /// Create a pipeline layout
    fn create_pipeline_layout(
        &mut self,
        set_layouts: &[DescriptorSetLayoutHandle],
    ) -> DeviceResult<PipelineLayoutHandle>;

    /// Destroy a pipeline layout
    fn destroy_pipeline_layout(&mut self, layout: PipelineLayoutHandle);

    /// Create a graphics pipeline
    fn create_graphics_pipeline(&mut self, desc: &GraphicsPipelineDesc<'_>) -> DeviceResult<PipelineHandle>;

    /// Create a ray-tracing pipeline
    fn create_ray_tracing_pipeline(
        &mut self,
        desc: &RayTracingPipelineDesc<'_>,
    ) -> DeviceResult<PipelineHandle>;

    /// Destroy a graphics or ray-tracing pipeline
    fn destroy_pipeline(&mut self, pipeline: PipelineHandle);

    /// Ray-tracing limits
    fn ray_tracing_properties(&self) -> RayTracingProperties;

    /// Raw shader group handles, `group_count * handle_size` bytes
    fn shader_group_handles(&mut self, pipeline: PipelineHandle, group_count: u32) -> DeviceResult<Vec<u8>>;

    // ---- command recording ---------------------------------------------

    /// Record image barriers
    fn cmd_pipeline_barrier(&mut self, cmd: CommandBufferHandle, barriers: &[ImageBarrier]);

    /// Record a buffer barrier
    fn cmd_buffer_barrier(&mut self, cmd: CommandBufferHandle, barrier: &BufferBarrier);

    /// Record a buffer-to-buffer copy of `size` bytes
    fn cmd_copy_buffer(
        &mut self,
        cmd: CommandBufferHandle,
        src: BufferHandle,
        dst: BufferHandle,
        size: u64,
    ) -> DeviceResult<()>;

    /// Begin a render pass, clearing every attachment
    fn cmd_begin_render_pass(
        &mut self,
        cmd: CommandBufferHandle,
        render_pass: RenderPassHandle,
        framebuffer: FramebufferHandle,
        clear_values: &[ClearValue],
    ) -> DeviceResult<()>;

    /// End the current render pass
    fn cmd_end_render_pass(&mut self, cmd: CommandBufferHandle);

    /// Bind a pipeline
    fn cmd_bind_pipeline(
        &mut self,
        cmd: CommandBufferHandle,
        bind_point: vk::PipelineBindPoint,
        pipeline: PipelineHandle,
    );

    /// Bind descriptor sets starting at `first_set`
    fn cmd_bind_descriptor_sets(
        &mut self,
        cmd: CommandBufferHandle,
        bind_point: vk::PipelineBindPoint,
        layout: PipelineLayoutHandle,
        first_set: u32,
        sets: &[DescriptorSetHandle],
    );

    /// Bind a vertex buffer to binding 0
    fn cmd_bind_vertex_buffer(&mut self, cmd: CommandBufferHandle, buffer: BufferHandle);

    /// Bind a `u32` index buffer
    fn cmd_bind_index_buffer(&mut self, cmd: CommandBufferHandle, buffer: BufferHandle);

    /// Non-indexed draw
    fn cmd_draw(&mut self, cmd: CommandBufferHandle, vertex_count: u32, instance_count: u32);

    /// Indexed draw
    fn cmd_draw_indexed(&mut self, cmd: CommandBufferHandle, index_count: u32, instance_count: u32);

    /// Clear the depth attachment of the current render pass
    fn cmd_clear_depth(&mut self, cmd: CommandBufferHandle, extent: vk::Extent2D, depth: f32);

    /// Dispatch one ray-generation invocation per pixel
    fn cmd_trace_rays(
        &mut self,
        cmd: CommandBufferHandle,
        regions: &ShaderBindingRegions,
        width: u32,
        height: u32,
    );
}
