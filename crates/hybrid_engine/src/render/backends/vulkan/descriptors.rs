//! Descriptor set layouts, a growable pool allocator and descriptor writes

use ash::vk;

use crate::foundation::logging::debug;
use crate::render::api::{
    BufferHandle, DescriptorBinding, DescriptorResource, DescriptorSetHandle, DescriptorWrite, DeviceError,
    DeviceResult, ImageHandle, SamplerHandle,
};

use super::super::keys::to_key;
use super::VulkanDevice;

const SETS_PER_POOL: u32 = 32;
const DEFAULT_DESCRIPTORS_PER_TYPE: u32 = 64;

const POOLED_TYPES: [vk::DescriptorType; 5] = [
    vk::DescriptorType::UNIFORM_BUFFER,
    vk::DescriptorType::STORAGE_BUFFER,
    vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
    vk::DescriptorType::STORAGE_IMAGE,
    vk::DescriptorType::ACCELERATION_STRUCTURE_KHR,
];

pub(super) struct VulkanSetLayout {
    pub layout: vk::DescriptorSetLayout,
    pub bindings: Vec<DescriptorBinding>,
}

pub(super) struct VulkanDescriptorSet {
    pub set: vk::DescriptorSet,
    pub pool: vk::DescriptorPool,
    pub bindings: Vec<DescriptorBinding>,
}

/// Pool sizes for a new pool that can hold at least a few sets of `bindings`
pub(super) fn pool_sizes(bindings: &[DescriptorBinding]) -> Vec<vk::DescriptorPoolSize> {
    POOLED_TYPES
        .iter()
        .map(|&ty| {
            let needed: u32 = bindings
                .iter()
                .filter(|b| b.descriptor_type == ty)
                .map(|b| b.count)
                .sum();
            vk::DescriptorPoolSize {
                ty,
                descriptor_count: DEFAULT_DESCRIPTORS_PER_TYPE.max(needed.saturating_mul(8)),
            }
        })
        .collect()
}

/// Allocates sets from a list of pools, adding a pool when the newest one is exhausted
#[derive(Default)]
pub(super) struct DescriptorAllocator {
    pools: Vec<vk::DescriptorPool>,
}

impl DescriptorAllocator {
    pub fn allocate(
        &mut self,
        device: &ash::Device,
        layout: &VulkanSetLayout,
    ) -> DeviceResult<(vk::DescriptorSet, vk::DescriptorPool)> {
        if let Some(&pool) = self.pools.last() {
            match Self::allocate_from(device, pool, layout.layout) {
                Ok(set) => return Ok((set, pool)),
                Err(vk::Result::ERROR_OUT_OF_POOL_MEMORY | vk::Result::ERROR_FRAGMENTED_POOL) => {}
                Err(err) => return Err(err.into()),
            }
        }

        let sizes = pool_sizes(&layout.bindings);
        let pool_info = vk::DescriptorPoolCreateInfo::builder()
            .flags(vk::DescriptorPoolCreateFlags::FREE_DESCRIPTOR_SET)
            .max_sets(SETS_PER_POOL)
            .pool_sizes(&sizes);
        let pool = unsafe { device.create_descriptor_pool(&pool_info, None)? };
        self.pools.push(pool);
        debug!("[RENDER] Descriptor pool {} created", self.pools.len());

        let set = Self::allocate_from(device, pool, layout.layout)?;
        Ok((set, pool))
    }

    fn allocate_from(
        device: &ash::Device,
        pool: vk::DescriptorPool,
        layout: vk::DescriptorSetLayout,
    ) -> Result<vk::DescriptorSet, vk::Result> {
        let layouts = [layout];
        let alloc_info = vk::DescriptorSetAllocateInfo::builder()
            .descriptor_pool(pool)
            .set_layouts(&layouts);
        unsafe { device.allocate_descriptor_sets(&alloc_info) }.map(|sets| sets[0])
    }

    pub fn destroy(&mut self, device: &ash::Device) {
        for pool in self.pools.drain(..) {
            unsafe { device.destroy_descriptor_pool(pool, None) };
        }
    }
}

/// Layout with `PARTIALLY_BOUND` on bindless bindings
pub(super) fn create_set_layout(
    device: &ash::Device,
    bindings: &[DescriptorBinding],
) -> DeviceResult<vk::DescriptorSetLayout> {
    let vk_bindings: Vec<vk::DescriptorSetLayoutBinding> = bindings
        .iter()
        .map(|b| {
            vk::DescriptorSetLayoutBinding::builder()
                .binding(b.binding)
                .descriptor_type(b.descriptor_type)
                .descriptor_count(b.count)
                .stage_flags(b.stages)
                .build()
        })
        .collect();
    let binding_flags: Vec<vk::DescriptorBindingFlags> = bindings
        .iter()
        .map(|b| {
            if b.bindless {
                vk::DescriptorBindingFlags::PARTIALLY_BOUND
            } else {
                vk::DescriptorBindingFlags::empty()
            }
        })
        .collect();

    let mut flags_info = vk::DescriptorSetLayoutBindingFlagsCreateInfo::builder().binding_flags(&binding_flags);
    let layout_info = vk::DescriptorSetLayoutCreateInfo::builder()
        .bindings(&vk_bindings)
        .push_next(&mut flags_info);
    Ok(unsafe { device.create_descriptor_set_layout(&layout_info, None)? })
}

fn write_builder<'a>(
    set: vk::DescriptorSet,
    write: &DescriptorWrite,
    descriptor_type: vk::DescriptorType,
) -> vk::WriteDescriptorSetBuilder<'a> {
    vk::WriteDescriptorSet::builder()
        .dst_set(set)
        .dst_binding(write.binding)
        .dst_array_element(write.array_element)
        .descriptor_type(descriptor_type)
}

impl VulkanDevice {
    fn buffer_info(&self, buffer: BufferHandle) -> DeviceResult<vk::DescriptorBufferInfo> {
        let buffer = self
            .buffers
            .get(to_key(buffer.0))
            .ok_or(DeviceError::UnknownHandle { kind: "buffer", id: buffer.0 })?;
        Ok(vk::DescriptorBufferInfo {
            buffer: buffer.buffer,
            offset: 0,
            range: vk::WHOLE_SIZE,
        })
    }

    fn image_info(
        &self,
        image: ImageHandle,
        sampler: Option<SamplerHandle>,
        layout: vk::ImageLayout,
    ) -> DeviceResult<vk::DescriptorImageInfo> {
        let view = self
            .images
            .get(to_key(image.0))
            .ok_or(DeviceError::UnknownHandle { kind: "image", id: image.0 })?
            .view;
        let sampler = match sampler {
            Some(handle) => *self
                .samplers
                .get(to_key(handle.0))
                .ok_or(DeviceError::UnknownHandle { kind: "sampler", id: handle.0 })?,
            None => vk::Sampler::null(),
        };
        Ok(vk::DescriptorImageInfo {
            sampler,
            image_view: view,
            image_layout: layout,
        })
    }

    fn submit_write(&self, write: vk::WriteDescriptorSet) {
        unsafe { self.device().update_descriptor_sets(&[write], &[]) };
    }

    /// One `vkUpdateDescriptorSets` call per write
    pub(super) fn update_descriptor_set(&self, set: DescriptorSetHandle, writes: &[DescriptorWrite]) -> DeviceResult<()> {
        let record = self
            .sets
            .get(to_key(set.0))
            .ok_or(DeviceError::UnknownHandle { kind: "descriptor set", id: set.0 })?;

        for write in writes {
            let binding = record
                .bindings
                .iter()
                .find(|b| b.binding == write.binding)
                .ok_or_else(|| DeviceError::invalid(format!("set has no binding {}", write.binding)))?;
            if write.array_element + write.resource.len() as u32 > binding.count {
                return Err(DeviceError::invalid(format!(
                    "write of {} descriptors at element {} overflows binding {} of {}",
                    write.resource.len(),
                    write.array_element,
                    write.binding,
                    binding.count
                )));
            }
            if write.resource.is_empty() {
                continue;
            }
            let (dst_set, descriptor_type) = (record.set, binding.descriptor_type);

            match &write.resource {
                DescriptorResource::UniformBuffer(buffer) | DescriptorResource::StorageBuffer(buffer) => {
                    let infos = [self.buffer_info(*buffer)?];
                    self.submit_write(write_builder(dst_set, write, descriptor_type).buffer_info(&infos).build());
                }
                DescriptorResource::StorageBuffers(buffers) => {
                    let infos = buffers
                        .iter()
                        .map(|&b| self.buffer_info(b))
                        .collect::<DeviceResult<Vec<_>>>()?;
                    self.submit_write(write_builder(dst_set, write, descriptor_type).buffer_info(&infos).build());
                }
                DescriptorResource::SampledImage(image, sampler) => {
                    let infos = [self.image_info(*image, Some(*sampler), vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)?];
                    self.submit_write(write_builder(dst_set, write, descriptor_type).image_info(&infos).build());
                }
                DescriptorResource::SampledImages(images) => {
                    let infos = images
                        .iter()
                        .map(|&(image, sampler)| {
                            self.image_info(image, Some(sampler), vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)
                        })
                        .collect::<DeviceResult<Vec<_>>>()?;
                    self.submit_write(write_builder(dst_set, write, descriptor_type).image_info(&infos).build());
                }
                DescriptorResource::StorageImage(image) => {
                    let infos = [self.image_info(*image, None, vk::ImageLayout::GENERAL)?];
                    self.submit_write(write_builder(dst_set, write, descriptor_type).image_info(&infos).build());
                }
                DescriptorResource::AccelerationStructure(structure) => {
                    let handle = self
                        .structures
                        .get(to_key(structure.0))
                        .ok_or(DeviceError::UnknownHandle {
                            kind: "acceleration structure",
                            id: structure.0,
                        })?
                        .handle;
                    let handles = [handle];
                    let mut structure_write =
                        vk::WriteDescriptorSetAccelerationStructureKHR::builder().acceleration_structures(&handles);
                    let mut built = write_builder(dst_set, write, descriptor_type).push_next(&mut structure_write).build();
                    // The structure count lives in the extension struct.
                    built.descriptor_count = 1;
                    self.submit_write(built);
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_sizes_cover_every_pooled_type() {
        let sizes = pool_sizes(&[]);
        assert_eq!(sizes.len(), POOLED_TYPES.len());
        assert!(sizes.iter().all(|s| s.descriptor_count == DEFAULT_DESCRIPTORS_PER_TYPE));
    }

    #[test]
    fn test_pool_sizes_grow_for_bindless_arrays() {
        let bindings = [
            DescriptorBinding::bindless(
                0,
                vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
                1024,
                vk::ShaderStageFlags::ALL,
            ),
            DescriptorBinding::single(1, vk::DescriptorType::UNIFORM_BUFFER, vk::ShaderStageFlags::ALL),
        ];
        let sizes = pool_sizes(&bindings);
        let count = |ty| sizes.iter().find(|s| s.ty == ty).map(|s| s.descriptor_count);

        assert_eq!(count(vk::DescriptorType::COMBINED_IMAGE_SAMPLER), Some(1024 * 8));
        assert_eq!(count(vk::DescriptorType::UNIFORM_BUFFER), Some(DEFAULT_DESCRIPTORS_PER_TYPE));
    }
}
