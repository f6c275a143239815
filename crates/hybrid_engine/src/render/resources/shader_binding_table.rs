//! Shader binding table for the ray-tracing pass
//!
//! Layout: one ray-generation record, then the miss records, then the hit
//! group records. Every record is `handle_size` rounded up to the handle
//! alignment; every region starts on the base alignment.

use ash::vk;

use crate::render::api::{
    BufferDesc, BufferHandle, DeviceError, DeviceResult, PipelineHandle, RayTracingProperties, RenderDevice,
    ShaderBindingRegions, StridedRegion,
};

/// Round `value` up to a multiple of `alignment` (a power of two or any non-zero value)
pub fn align_up(value: u64, alignment: u64) -> u64 {
    if alignment == 0 {
        value
    } else {
        value.div_ceil(alignment) * alignment
    }
}

/// Offsets and strides of the three regions relative to the table start
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SbtLayout {
    /// Bytes copied per handle
    pub handle_size: u64,
    /// Aligned record stride
    pub handle_stride: u64,
    /// Ray generation region (offset in `device_address`)
    pub raygen: StridedRegion,
    /// Miss region (offset in `device_address`)
    pub miss: StridedRegion,
    /// Hit region (offset in `device_address`)
    pub hit: StridedRegion,
    /// Total bytes
    pub total_size: u64,
}

impl SbtLayout {
    /// Compute the layout for one ray-generation, `miss_count` miss and
    /// `hit_count` hit groups.
    pub fn new(properties: &RayTracingProperties, miss_count: u32, hit_count: u32) -> Self {
        let handle_size = u64::from(properties.shader_group_handle_size);
        let base_alignment = u64::from(properties.shader_group_base_alignment);
        let handle_stride = align_up(handle_size, u64::from(properties.shader_group_handle_alignment));

        // The ray generation region's stride must equal its size.
        let raygen_size = align_up(handle_stride, base_alignment);
        let raygen = StridedRegion {
            device_address: 0,
            stride: raygen_size,
            size: raygen_size,
        };
        let miss = StridedRegion {
            device_address: raygen.size,
            stride: handle_stride,
            size: align_up(u64::from(miss_count) * handle_stride, base_alignment),
        };
        let hit = StridedRegion {
            device_address: miss.device_address + miss.size,
            stride: handle_stride,
            size: align_up(u64::from(hit_count) * handle_stride, base_alignment),
        };

        Self {
            handle_size,
            handle_stride,
            raygen,
            miss,
            hit,
            total_size: hit.device_address + hit.size,
        }
    }

    /// Byte offset of shader group `group` (in pipeline group order)
    pub fn record_offset(&self, group: u32, miss_count: u32) -> u64 {
        match group {
            0 => self.raygen.device_address,
            g if g <= miss_count => self.miss.device_address + u64::from(g - 1) * self.handle_stride,
            g => self.hit.device_address + u64::from(g - 1 - miss_count) * self.handle_stride,
        }
    }
}

/// Device buffer holding the records plus the regions for `trace_rays`
pub struct ShaderBindingTable {
    buffer: BufferHandle,
    layout: SbtLayout,
    regions: ShaderBindingRegions,
}

impl ShaderBindingTable {
    /// Fetch the pipeline's group handles and upload them into a new table
    pub fn new(
        device: &mut dyn RenderDevice,
        pipeline: PipelineHandle,
        miss_count: u32,
        hit_count: u32,
    ) -> DeviceResult<Self> {
        let properties = device.ray_tracing_properties();
        let layout = SbtLayout::new(&properties, miss_count, hit_count);
        let group_count = 1 + miss_count + hit_count;
        let handle_size = layout.handle_size as usize;

        let handles = device.shader_group_handles(pipeline, group_count)?;
        if handles.len() < group_count as usize * handle_size {
            return Err(DeviceError::invalid("device returned too few shader group handle bytes"));
        }

        // Over-allocate so the table start can be moved onto the base alignment.
        let base_alignment = u64::from(properties.shader_group_base_alignment).max(1);
        let buffer = device.create_buffer(&BufferDesc::device_local(
            layout.total_size + base_alignment,
            vk::BufferUsageFlags::SHADER_BINDING_TABLE_KHR | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
        ))?;

        let mut upload = || -> DeviceResult<ShaderBindingRegions> {
            let address = device.buffer_device_address(buffer)?;
            let start = align_up(address, base_alignment) - address;

            let mut data = vec![0u8; (start + layout.total_size) as usize];
            for (group, handle) in handles.chunks_exact(handle_size).take(group_count as usize).enumerate() {
                let offset = (start + layout.record_offset(group as u32, miss_count)) as usize;
                data[offset..offset + handle_size].copy_from_slice(handle);
            }
            device.upload_buffer(buffer, &data)?;

            let region = |r: StridedRegion| StridedRegion {
                device_address: address + start + r.device_address,
                ..r
            };
            Ok(ShaderBindingRegions {
                raygen: region(layout.raygen),
                miss: region(layout.miss),
                hit: region(layout.hit),
                callable: StridedRegion::default(),
            })
        };

        match upload() {
            Ok(regions) => Ok(Self { buffer, layout, regions }),
            Err(err) => {
                device.destroy_buffer(buffer);
                Err(err)
            }
        }
    }

    /// Regions passed to `trace_rays`
    pub fn regions(&self) -> &ShaderBindingRegions {
        &self.regions
    }

    /// Region layout
    pub fn layout(&self) -> &SbtLayout {
        &self.layout
    }

    /// Release the table buffer
    pub fn destroy(self, device: &mut dyn RenderDevice) {
        device.destroy_buffer(self.buffer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn properties(handle_size: u32, handle_alignment: u32, base_alignment: u32) -> RayTracingProperties {
        RayTracingProperties {
            shader_group_handle_size: handle_size,
            shader_group_handle_alignment: handle_alignment,
            shader_group_base_alignment: base_alignment,
            max_ray_recursion_depth: 1,
        }
    }

    #[test]
    fn test_align_up() {
        assert_eq!(align_up(0, 64), 0);
        assert_eq!(align_up(1, 64), 64);
        assert_eq!(align_up(64, 64), 64);
        assert_eq!(align_up(65, 64), 128);
        assert_eq!(align_up(7, 0), 7);
    }

    #[test]
    fn test_regions_respect_alignment() {
        let layout = SbtLayout::new(&properties(32, 32, 64), 2, 1);
        assert_eq!(layout.handle_stride, 32);
        assert_eq!(layout.raygen.size, 64);
        assert_eq!(layout.raygen.stride, layout.raygen.size);
        assert_eq!(layout.miss.device_address, 64);
        assert_eq!(layout.miss.size, 64);
        assert_eq!(layout.hit.device_address, 128);
        assert_eq!(layout.hit.size, 64);
        assert_eq!(layout.total_size, 192);
    }

    #[test]
    fn test_handle_stride_rounds_to_handle_alignment() {
        let layout = SbtLayout::new(&properties(24, 32, 128), 1, 3);
        assert_eq!(layout.handle_stride, 32);
        assert_eq!(layout.miss.stride, 32);
        assert_eq!(layout.hit.size, 128);
        for region in [layout.raygen, layout.miss, layout.hit] {
            assert_eq!(region.device_address % 128, 0);
        }
    }

    #[test]
    fn test_record_offsets_follow_group_order() {
        let layout = SbtLayout::new(&properties(32, 32, 64), 2, 2);
        assert_eq!(layout.record_offset(0, 2), 0);
        assert_eq!(layout.record_offset(1, 2), 64);
        assert_eq!(layout.record_offset(2, 2), 96);
        assert_eq!(layout.record_offset(3, 2), 128);
        assert_eq!(layout.record_offset(4, 2), 160);
    }
}
