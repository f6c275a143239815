//! Resource handles and creation descriptors shared by every device backend
//!
//! Handles are opaque `u64` newtypes: backends decide what the number means
//! and callers only store, copy and hand them back. Vulkan vocabulary
//! (`vk::Format`, layouts, stage/access masks) is used directly.

use ash::vk;

macro_rules! define_handle {
    ($($(#[$meta:meta])* $name:ident;)*) => {
        $(
            $(#[$meta])*
            #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
            pub struct $name(pub u64);
        )*
    };
}

define_handle! {
    /// Handle to a GPU buffer
    BufferHandle;
    /// Handle to a 2D image (texture or render target)
    ImageHandle;
    /// Handle to a sampler
    SamplerHandle;
    /// Handle to a bottom- or top-level acceleration structure
    AccelerationStructureHandle;
    /// Handle to a descriptor set layout
    DescriptorSetLayoutHandle;
    /// Handle to an allocated descriptor set
    DescriptorSetHandle;
    /// Handle to a render pass
    RenderPassHandle;
    /// Handle to a framebuffer
    FramebufferHandle;
    /// Handle to a pipeline layout
    PipelineLayoutHandle;
    /// Handle to a graphics or ray-tracing pipeline
    PipelineHandle;
    /// Handle to a command buffer owned by the device
    CommandBufferHandle;
}

/// Where a buffer's memory lives
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryLocation {
    /// Device-local, filled through staging uploads or GPU copies
    DeviceLocal,
    /// Host-visible and coherent, written directly by the CPU
    HostVisible,
}

/// Buffer creation parameters
#[derive(Debug, Clone, Copy)]
pub struct BufferDesc {
    /// Size in bytes, must be non-zero
    pub size: u64,
    /// Vulkan usage flags
    pub usage: vk::BufferUsageFlags,
    /// Memory placement
    pub location: MemoryLocation,
}

impl BufferDesc {
    /// Host-visible staging buffer used as a copy source
    pub fn staging(size: u64) -> Self {
        Self {
            size,
            usage: vk::BufferUsageFlags::TRANSFER_SRC,
            location: MemoryLocation::HostVisible,
        }
    }

    /// Device-local buffer that is the destination of per-frame copies
    pub fn device_local(size: u64, usage: vk::BufferUsageFlags) -> Self {
        Self {
            size,
            usage: usage | vk::BufferUsageFlags::TRANSFER_DST,
            location: MemoryLocation::DeviceLocal,
        }
    }
}

/// 2D image creation parameters
#[derive(Debug, Clone, Copy)]
pub struct ImageDesc {
    /// Width in texels
    pub width: u32,
    /// Height in texels
    pub height: u32,
    /// Texel format
    pub format: vk::Format,
    /// Vulkan usage flags
    pub usage: vk::ImageUsageFlags,
    /// Aspect used for views and barriers
    pub aspect: vk::ImageAspectFlags,
}

impl ImageDesc {
    /// Color image with the given format and usage
    pub fn color(width: u32, height: u32, format: vk::Format, usage: vk::ImageUsageFlags) -> Self {
        Self {
            width,
            height,
            format,
            usage,
            aspect: vk::ImageAspectFlags::COLOR,
        }
    }

    /// Depth attachment
    pub fn depth(width: u32, height: u32, format: vk::Format) -> Self {
        Self {
            width,
            height,
            format,
            usage: vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT,
            aspect: vk::ImageAspectFlags::DEPTH,
        }
    }

    /// Image extent
    pub fn extent(&self) -> vk::Extent2D {
        vk::Extent2D {
            width: self.width,
            height: self.height,
        }
    }
}

/// Bytes per texel for the formats this renderer creates
pub fn format_texel_size(format: vk::Format) -> Option<usize> {
    match format {
        vk::Format::R32G32B32A32_SFLOAT | vk::Format::R32G32B32A32_UINT => Some(16),
        vk::Format::R32G32_UINT | vk::Format::R32G32_SFLOAT => Some(8),
        vk::Format::R8G8B8A8_UNORM
        | vk::Format::R8G8B8A8_SRGB
        | vk::Format::B8G8R8A8_UNORM
        | vk::Format::B8G8R8A8_SRGB
        | vk::Format::R32_SFLOAT
        | vk::Format::R32_UINT
        | vk::Format::D32_SFLOAT => Some(4),
        _ => None,
    }
}

/// Sampler creation parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SamplerDesc {
    /// Magnification and minification filter
    pub filter: vk::Filter,
    /// Addressing mode on all axes
    pub address_mode: vk::SamplerAddressMode,
}

impl Default for SamplerDesc {
    fn default() -> Self {
        Self {
            filter: vk::Filter::LINEAR,
            address_mode: vk::SamplerAddressMode::REPEAT,
        }
    }
}

/// Triangle geometry for a bottom-level acceleration structure
#[derive(Debug, Clone, Copy)]
pub struct BlasDesc {
    /// Buffer holding vertices, position as the first three floats
    pub vertex_buffer: BufferHandle,
    /// Number of vertices
    pub vertex_count: u32,
    /// Size of one vertex in bytes
    pub vertex_stride: u64,
    /// Buffer holding `u32` indices
    pub index_buffer: BufferHandle,
    /// Number of indices, a multiple of three
    pub index_count: u32,
}

/// One instance of a bottom-level structure inside a top-level structure
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TlasInstance {
    /// Referenced bottom-level structure
    pub blas: AccelerationStructureHandle,
    /// Row-major 3x4 object-to-world transform
    pub transform: [f32; 12],
    /// Value reported as `gl_InstanceCustomIndexEXT`
    pub custom_index: u32,
    /// Visibility mask
    pub mask: u8,
}

/// Ray-tracing limits the shader binding table has to respect
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RayTracingProperties {
    /// Size of one shader group handle in bytes
    pub shader_group_handle_size: u32,
    /// Required alignment of handles inside a region
    pub shader_group_handle_alignment: u32,
    /// Required alignment of each region's start address
    pub shader_group_base_alignment: u32,
    /// Maximum ray recursion depth
    pub max_ray_recursion_depth: u32,
}

/// One binding of a descriptor set layout
#[derive(Debug, Clone, Copy)]
pub struct DescriptorBinding {
    /// Binding number
    pub binding: u32,
    /// Descriptor type
    pub descriptor_type: vk::DescriptorType,
    /// Array length (bindless capacity for bindless bindings)
    pub count: u32,
    /// Stages that read the binding
    pub stages: vk::ShaderStageFlags,
    /// Partially bound bindless array
    pub bindless: bool,
}

impl DescriptorBinding {
    /// Single descriptor binding
    pub fn single(binding: u32, descriptor_type: vk::DescriptorType, stages: vk::ShaderStageFlags) -> Self {
        Self {
            binding,
            descriptor_type,
            count: 1,
            stages,
            bindless: false,
        }
    }

    /// Partially bound array of `capacity` descriptors
    pub fn bindless(
        binding: u32,
        descriptor_type: vk::DescriptorType,
        capacity: u32,
        stages: vk::ShaderStageFlags,
    ) -> Self {
        Self {
            binding,
            descriptor_type,
            count: capacity,
            stages,
            bindless: true,
        }
    }
}

/// Resource written into a descriptor binding
#[derive(Debug, Clone, PartialEq)]
pub enum DescriptorResource {
    /// Whole uniform buffer
    UniformBuffer(BufferHandle),
    /// Whole storage buffer
    StorageBuffer(BufferHandle),
    /// Consecutive storage buffers of a bindless array
    StorageBuffers(Vec<BufferHandle>),
    /// Combined image sampler in shader-read layout
    SampledImage(ImageHandle, SamplerHandle),
    /// Consecutive combined image samplers of a bindless array
    SampledImages(Vec<(ImageHandle, SamplerHandle)>),
    /// Storage image in `GENERAL` layout
    StorageImage(ImageHandle),
    /// Top-level acceleration structure
    AccelerationStructure(AccelerationStructureHandle),
}

impl DescriptorResource {
    /// Number of descriptors this write covers
    pub fn len(&self) -> usize {
        match self {
            Self::StorageBuffers(buffers) => buffers.len(),
            Self::SampledImages(images) => images.len(),
            _ => 1,
        }
    }

    /// Whether the write covers no descriptors
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A write into one binding of a descriptor set
#[derive(Debug, Clone, PartialEq)]
pub struct DescriptorWrite {
    /// Binding number
    pub binding: u32,
    /// First array element written
    pub array_element: u32,
    /// Resource(s) written
    pub resource: DescriptorResource,
}

impl DescriptorWrite {
    /// Write starting at array element 0
    pub fn new(binding: u32, resource: DescriptorResource) -> Self {
        Self {
            binding,
            array_element: 0,
            resource,
        }
    }
}

/// Render pass attachment description
#[derive(Debug, Clone)]
pub struct RenderPassDesc {
    /// Color attachment formats, in attachment order
    pub color_formats: Vec<vk::Format>,
    /// Optional depth attachment format (last attachment)
    pub depth_format: Option<vk::Format>,
    /// Layout color attachments are left in at the end of the pass
    pub final_color_layout: vk::ImageLayout,
}

/// Clear value for one attachment
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ClearValue {
    /// Float color
    Color([f32; 4]),
    /// Unsigned integer color
    ColorUint([u32; 4]),
    /// Depth and stencil
    DepthStencil(f32, u32),
}

impl From<ClearValue> for vk::ClearValue {
    fn from(value: ClearValue) -> Self {
        match value {
            ClearValue::Color(float32) => Self {
                color: vk::ClearColorValue { float32 },
            },
            ClearValue::ColorUint(uint32) => Self {
                color: vk::ClearColorValue { uint32 },
            },
            ClearValue::DepthStencil(depth, stencil) => Self {
                depth_stencil: vk::ClearDepthStencilValue { depth, stencil },
            },
        }
    }
}

/// One vertex attribute of a vertex input layout
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VertexAttribute {
    /// Shader location
    pub location: u32,
    /// Attribute format
    pub format: vk::Format,
    /// Byte offset inside the vertex
    pub offset: u32,
}

/// Per-vertex input layout of a single interleaved binding
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VertexInputLayout {
    /// Vertex stride in bytes
    pub stride: u32,
    /// Attributes
    pub attributes: Vec<VertexAttribute>,
}

/// Graphics pipeline creation parameters
#[derive(Debug, Clone)]
pub struct GraphicsPipelineDesc<'a> {
    /// Debug name
    pub name: &'a str,
    /// Pipeline layout
    pub layout: PipelineLayoutHandle,
    /// Render pass the pipeline draws in
    pub render_pass: RenderPassHandle,
    /// Vertex shader SPIR-V
    pub vertex_spirv: &'a [u32],
    /// Fragment shader SPIR-V
    pub fragment_spirv: &'a [u32],
    /// Vertex input, `None` for shaders that synthesize vertices
    pub vertex_input: Option<VertexInputLayout>,
    /// Number of color attachments written
    pub color_attachment_count: u32,
    /// Depth test enabled
    pub depth_test: bool,
    /// Depth write enabled
    pub depth_write: bool,
    /// Face culling
    pub cull_mode: vk::CullModeFlags,
}

/// Ray-tracing pipeline creation parameters
///
/// Groups are laid out in order: ray generation, misses, closest hits.
#[derive(Debug, Clone)]
pub struct RayTracingPipelineDesc<'a> {
    /// Debug name
    pub name: &'a str,
    /// Pipeline layout
    pub layout: PipelineLayoutHandle,
    /// Ray generation shader SPIR-V
    pub raygen_spirv: &'a [u32],
    /// Miss shaders SPIR-V
    pub miss_spirv: Vec<&'a [u32]>,
    /// Closest-hit shaders SPIR-V
    pub closest_hit_spirv: Vec<&'a [u32]>,
    /// Maximum recursion depth requested
    pub max_recursion_depth: u32,
}

impl RayTracingPipelineDesc<'_> {
    /// Total number of shader groups
    pub fn group_count(&self) -> u32 {
        (1 + self.miss_spirv.len() + self.closest_hit_spirv.len()) as u32
    }
}

/// Image layout transition recorded into a command buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageBarrier {
    /// Transitioned image
    pub image: ImageHandle,
    /// Aspect of the image
    pub aspect: vk::ImageAspectFlags,
    /// Layout before the barrier
    pub old_layout: vk::ImageLayout,
    /// Layout after the barrier
    pub new_layout: vk::ImageLayout,
    /// Stages that must finish first
    pub src_stage: vk::PipelineStageFlags,
    /// Accesses made visible
    pub src_access: vk::AccessFlags,
    /// Stages that wait
    pub dst_stage: vk::PipelineStageFlags,
    /// Accesses that wait
    pub dst_access: vk::AccessFlags,
}

/// Buffer memory barrier recorded into a command buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferBarrier {
    /// Guarded buffer
    pub buffer: BufferHandle,
    /// Stages that must finish first
    pub src_stage: vk::PipelineStageFlags,
    /// Accesses made visible
    pub src_access: vk::AccessFlags,
    /// Stages that wait
    pub dst_stage: vk::PipelineStageFlags,
    /// Accesses that wait
    pub dst_access: vk::AccessFlags,
}

/// Device-address region of a shader binding table
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StridedRegion {
    /// Start address
    pub device_address: u64,
    /// Distance between records
    pub stride: u64,
    /// Total region size
    pub size: u64,
}

/// The four regions passed to `trace_rays`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShaderBindingRegions {
    /// Ray generation region (one record)
    pub raygen: StridedRegion,
    /// Miss region
    pub miss: StridedRegion,
    /// Hit group region
    pub hit: StridedRegion,
    /// Callable region, unused
    pub callable: StridedRegion,
}

/// Per-frame recording context returned by `begin_frame`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameContext {
    /// Frame-in-flight slot in `[0, N)`
    pub frame_index: usize,
    /// Command buffer recording this frame
    pub command_buffer: CommandBufferHandle,
}
