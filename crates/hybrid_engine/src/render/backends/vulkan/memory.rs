//! Buffers and images with dedicated memory allocations
//!
//! Every resource gets its own `vkAllocateMemory` call and memory type
//! selection walks the device's types in order, the same way texture uploads
//! always have. Host-visible buffers stay mapped for their whole lifetime.

use ash::vk;

use crate::render::api::{BufferDesc, DeviceError, DeviceResult, ImageDesc, MemoryLocation};

/// First memory type allowed by `type_filter` that has all of `properties`
pub(super) fn find_memory_type(
    memory_properties: &vk::PhysicalDeviceMemoryProperties,
    type_filter: u32,
    properties: vk::MemoryPropertyFlags,
) -> DeviceResult<u32> {
    (0..memory_properties.memory_type_count)
        .find(|&i| {
            (type_filter & (1 << i)) != 0
                && memory_properties.memory_types[i as usize]
                    .property_flags
                    .contains(properties)
        })
        .ok_or_else(|| DeviceError::Unsupported(format!("no memory type with {properties:?}")))
}

fn allocate_memory(
    device: &ash::Device,
    memory_properties: &vk::PhysicalDeviceMemoryProperties,
    requirements: vk::MemoryRequirements,
    properties: vk::MemoryPropertyFlags,
    device_address: bool,
) -> DeviceResult<vk::DeviceMemory> {
    let memory_type_index = find_memory_type(memory_properties, requirements.memory_type_bits, properties)?;
    let mut flags_info = vk::MemoryAllocateFlagsInfo::builder().flags(vk::MemoryAllocateFlags::DEVICE_ADDRESS);
    let mut allocate_info = vk::MemoryAllocateInfo::builder()
        .allocation_size(requirements.size)
        .memory_type_index(memory_type_index);
    if device_address {
        allocate_info = allocate_info.push_next(&mut flags_info);
    }

    unsafe { device.allocate_memory(&allocate_info, None) }.map_err(|e| match e {
        vk::Result::ERROR_OUT_OF_DEVICE_MEMORY | vk::Result::ERROR_OUT_OF_HOST_MEMORY => {
            DeviceError::OutOfMemory {
                requested: requirements.size,
            }
        }
        other => DeviceError::Api(other),
    })
}

/// Buffer plus its memory
pub(super) struct VulkanBuffer {
    pub buffer: vk::Buffer,
    pub memory: vk::DeviceMemory,
    pub desc: BufferDesc,
    pub mapped: Option<*mut u8>,
    pub address: Option<u64>,
}

impl VulkanBuffer {
    pub fn new(
        device: &ash::Device,
        memory_properties: &vk::PhysicalDeviceMemoryProperties,
        desc: &BufferDesc,
    ) -> DeviceResult<Self> {
        if desc.size == 0 {
            return Err(DeviceError::invalid("buffer size must be non-zero"));
        }
        let buffer_info = vk::BufferCreateInfo::builder()
            .size(desc.size)
            .usage(desc.usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        let buffer = unsafe { device.create_buffer(&buffer_info, None)? };

        let properties = match desc.location {
            MemoryLocation::DeviceLocal => vk::MemoryPropertyFlags::DEVICE_LOCAL,
            MemoryLocation::HostVisible => {
                vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT
            }
        };
        let device_address = desc.usage.contains(vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS);
        let requirements = unsafe { device.get_buffer_memory_requirements(buffer) };

        let memory = match allocate_memory(device, memory_properties, requirements, properties, device_address) {
            Ok(memory) => memory,
            Err(err) => {
                unsafe { device.destroy_buffer(buffer, None) };
                return Err(err);
            }
        };

        let mut created = Self {
            buffer,
            memory,
            desc: *desc,
            mapped: None,
            address: None,
        };
        if let Err(err) = created.bind_and_map(device, device_address) {
            created.destroy(device);
            return Err(err);
        }
        Ok(created)
    }

    fn bind_and_map(&mut self, device: &ash::Device, device_address: bool) -> DeviceResult<()> {
        unsafe {
            device.bind_buffer_memory(self.buffer, self.memory, 0)?;
            if self.desc.location == MemoryLocation::HostVisible {
                let pointer = device.map_memory(self.memory, 0, vk::WHOLE_SIZE, vk::MemoryMapFlags::empty())?;
                self.mapped = Some(pointer.cast::<u8>());
            }
            if device_address {
                let info = vk::BufferDeviceAddressInfo::builder().buffer(self.buffer);
                self.address = Some(device.get_buffer_device_address(&info));
            }
        }
        Ok(())
    }

    /// Copy `data` into the mapping at `offset`
    pub fn write(&self, offset: u64, data: &[u8]) -> DeviceResult<()> {
        let pointer = self
            .mapped
            .ok_or_else(|| DeviceError::invalid("buffer is not host visible"))?;
        if offset + data.len() as u64 > self.desc.size {
            return Err(DeviceError::invalid(format!(
                "write of {} bytes at {offset} past the end of a {} byte buffer",
                data.len(),
                self.desc.size
            )));
        }
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), pointer.add(offset as usize), data.len());
        }
        Ok(())
    }

    /// Copy `len` bytes out of the mapping
    pub fn read(&self, len: usize) -> DeviceResult<Vec<u8>> {
        let pointer = self
            .mapped
            .ok_or_else(|| DeviceError::invalid("buffer is not host visible"))?;
        let len = len.min(self.desc.size as usize);
        let mut bytes = vec![0u8; len];
        unsafe {
            std::ptr::copy_nonoverlapping(pointer, bytes.as_mut_ptr(), len);
        }
        Ok(bytes)
    }

    pub fn destroy(&self, device: &ash::Device) {
        unsafe {
            if self.mapped.is_some() {
                device.unmap_memory(self.memory);
            }
            device.destroy_buffer(self.buffer, None);
            device.free_memory(self.memory, None);
        }
    }
}

/// 2D image, its memory and a view over all of it
pub(super) struct VulkanImage {
    pub image: vk::Image,
    pub memory: vk::DeviceMemory,
    pub view: vk::ImageView,
    pub desc: ImageDesc,
}

impl VulkanImage {
    pub fn new(
        device: &ash::Device,
        memory_properties: &vk::PhysicalDeviceMemoryProperties,
        desc: &ImageDesc,
    ) -> DeviceResult<Self> {
        if desc.width == 0 || desc.height == 0 {
            return Err(DeviceError::invalid("image extent must be non-zero"));
        }
        let image_info = vk::ImageCreateInfo::builder()
            .image_type(vk::ImageType::TYPE_2D)
            .extent(vk::Extent3D {
                width: desc.width,
                height: desc.height,
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(1)
            .format(desc.format)
            .tiling(vk::ImageTiling::OPTIMAL)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .usage(desc.usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .samples(vk::SampleCountFlags::TYPE_1);
        let image = unsafe { device.create_image(&image_info, None)? };

        let requirements = unsafe { device.get_image_memory_requirements(image) };
        let memory = match allocate_memory(
            device,
            memory_properties,
            requirements,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
            false,
        ) {
            Ok(memory) => memory,
            Err(err) => {
                unsafe { device.destroy_image(image, None) };
                return Err(err);
            }
        };

        let view = unsafe {
            device
                .bind_image_memory(image, memory, 0)
                .and_then(|()| {
                    let view_info = vk::ImageViewCreateInfo::builder()
                        .image(image)
                        .view_type(vk::ImageViewType::TYPE_2D)
                        .format(desc.format)
                        .subresource_range(subresource_range(desc.aspect));
                    device.create_image_view(&view_info, None)
                })
        };
        match view {
            Ok(view) => Ok(Self {
                image,
                memory,
                view,
                desc: *desc,
            }),
            Err(err) => {
                unsafe {
                    device.destroy_image(image, None);
                    device.free_memory(memory, None);
                }
                Err(err.into())
            }
        }
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.desc.extent()
    }

    pub fn destroy(&self, device: &ash::Device) {
        unsafe {
            device.destroy_image_view(self.view, None);
            device.destroy_image(self.image, None);
            device.free_memory(self.memory, None);
        }
    }
}

/// The single mip level and layer of an image
pub(super) fn subresource_range(aspect: vk::ImageAspectFlags) -> vk::ImageSubresourceRange {
    vk::ImageSubresourceRange {
        aspect_mask: aspect,
        base_mip_level: 0,
        level_count: 1,
        base_array_layer: 0,
        layer_count: 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn properties(types: &[vk::MemoryPropertyFlags]) -> vk::PhysicalDeviceMemoryProperties {
        let mut properties = vk::PhysicalDeviceMemoryProperties {
            memory_type_count: types.len() as u32,
            ..Default::default()
        };
        for (i, flags) in types.iter().enumerate() {
            properties.memory_types[i].property_flags = *flags;
        }
        properties
    }

    #[test]
    fn test_memory_type_respects_filter_and_flags() {
        let props = properties(&[
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
            vk::MemoryPropertyFlags::DEVICE_LOCAL | vk::MemoryPropertyFlags::HOST_VISIBLE,
        ]);
        let host = vk::MemoryPropertyFlags::HOST_VISIBLE;

        assert_eq!(find_memory_type(&props, 0b111, host).unwrap(), 1);
        assert_eq!(find_memory_type(&props, 0b100, host).unwrap(), 2);
        assert_eq!(
            find_memory_type(&props, 0b111, vk::MemoryPropertyFlags::DEVICE_LOCAL).unwrap(),
            0
        );
    }

    #[test]
    fn test_missing_memory_type_is_unsupported() {
        let props = properties(&[vk::MemoryPropertyFlags::DEVICE_LOCAL]);
        let result = find_memory_type(&props, 0b1, vk::MemoryPropertyFlags::HOST_VISIBLE);
        assert!(matches!(result, Err(DeviceError::Unsupported(_))));
    }
}
