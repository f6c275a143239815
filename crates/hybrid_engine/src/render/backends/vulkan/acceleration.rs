//! Bottom- and top-level acceleration structures
//!
//! Bottom-level structures are built once with a throwaway scratch buffer.
//! Top-level structures allow updates: each keeps a scratch buffer large
//! enough for both a build and an update, plus one host-visible instance
//! buffer per frame-in-flight slot so a refit never overwrites instances a
//! pending frame still reads.

use ash::extensions::khr::AccelerationStructure;
use ash::vk;

use crate::foundation::logging::debug;
use crate::render::api::{
    AccelerationStructureHandle, BlasDesc, BufferDesc, BufferHandle, DeviceError, DeviceResult, MemoryLocation,
    TlasInstance,
};
use crate::render::resources::align_up;

use super::super::keys::to_key;
use super::memory::VulkanBuffer;
use super::VulkanDevice;

const INSTANCE_SIZE: usize = std::mem::size_of::<vk::AccelerationStructureInstanceKHR>();

struct TopLevel {
    instance_count: usize,
    instance_buffers: Vec<VulkanBuffer>,
    scratch: VulkanBuffer,
    scratch_address: u64,
}

/// Acceleration structure with the buffers it owns
pub(super) struct AccelerationRecord {
    pub handle: vk::AccelerationStructureKHR,
    pub address: u64,
    storage: VulkanBuffer,
    top: Option<TopLevel>,
}

impl AccelerationRecord {
    pub fn is_bottom_level(&self) -> bool {
        self.top.is_none()
    }

    pub fn destroy(self, device: &ash::Device, loader: &AccelerationStructure) {
        unsafe { loader.destroy_acceleration_structure(self.handle, None) };
        self.storage.destroy(device);
        if let Some(top) = self.top {
            for buffer in &top.instance_buffers {
                buffer.destroy(device);
            }
            top.scratch.destroy(device);
        }
    }
}

fn instance_geometry(instance_address: u64) -> vk::AccelerationStructureGeometryKHR {
    let instances = vk::AccelerationStructureGeometryInstancesDataKHR::builder()
        .array_of_pointers(false)
        .data(vk::DeviceOrHostAddressConstKHR {
            device_address: instance_address,
        })
        .build();
    vk::AccelerationStructureGeometryKHR::builder()
        .geometry_type(vk::GeometryTypeKHR::INSTANCES)
        .geometry(vk::AccelerationStructureGeometryDataKHR { instances })
        .flags(vk::GeometryFlagsKHR::OPAQUE)
        .build()
}

/// Device layout of one instance
fn raw_instance(instance: &TlasInstance, blas_address: u64) -> vk::AccelerationStructureInstanceKHR {
    vk::AccelerationStructureInstanceKHR {
        transform: vk::TransformMatrixKHR {
            matrix: instance.transform,
        },
        instance_custom_index_and_mask: vk::Packed24_8::new(instance.custom_index, instance.mask),
        instance_shader_binding_table_record_offset_and_flags: vk::Packed24_8::new(
            0,
            vk::GeometryInstanceFlagsKHR::TRIANGLE_FACING_CULL_DISABLE.as_raw() as u8,
        ),
        acceleration_structure_reference: vk::AccelerationStructureReferenceKHR {
            device_handle: blas_address,
        },
    }
}

fn structure_barrier(
    device: &ash::Device,
    cmd: vk::CommandBuffer,
    dst_stage: vk::PipelineStageFlags,
    dst_access: vk::AccessFlags,
) {
    let barrier = vk::MemoryBarrier::builder()
        .src_access_mask(vk::AccessFlags::ACCELERATION_STRUCTURE_WRITE_KHR)
        .dst_access_mask(dst_access)
        .build();
    unsafe {
        device.cmd_pipeline_barrier(
            cmd,
            vk::PipelineStageFlags::ACCELERATION_STRUCTURE_BUILD_KHR,
            dst_stage,
            vk::DependencyFlags::empty(),
            &[barrier],
            &[],
            &[],
        );
    }
}

impl VulkanDevice {
    fn geometry_address(&self, buffer: BufferHandle) -> DeviceResult<u64> {
        self.buffers
            .get(to_key(buffer.0))
            .ok_or(DeviceError::UnknownHandle { kind: "buffer", id: buffer.0 })?
            .address
            .ok_or_else(|| DeviceError::invalid("geometry buffer was created without SHADER_DEVICE_ADDRESS"))
    }

    fn create_address_buffer(&self, size: u64, usage: vk::BufferUsageFlags, location: MemoryLocation) -> DeviceResult<VulkanBuffer> {
        VulkanBuffer::new(
            self.device(),
            &self.memory_properties,
            &BufferDesc {
                size: size.max(1),
                usage: usage | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
                location,
            },
        )
    }

    /// Scratch buffer and its start address rounded up to the scratch alignment
    fn create_scratch(&self, size: u64) -> DeviceResult<(VulkanBuffer, u64)> {
        let scratch = self.create_address_buffer(
            size + self.scratch_alignment,
            vk::BufferUsageFlags::STORAGE_BUFFER,
            MemoryLocation::DeviceLocal,
        )?;
        let address = scratch.address.unwrap_or_default();
        Ok((scratch, align_up(address, self.scratch_alignment)))
    }

    fn create_structure(
        &self,
        ty: vk::AccelerationStructureTypeKHR,
        size: u64,
    ) -> DeviceResult<(vk::AccelerationStructureKHR, VulkanBuffer, u64)> {
        let storage = self.create_address_buffer(
            size,
            vk::BufferUsageFlags::ACCELERATION_STRUCTURE_STORAGE_KHR,
            MemoryLocation::DeviceLocal,
        )?;
        let create_info = vk::AccelerationStructureCreateInfoKHR::builder()
            .buffer(storage.buffer)
            .size(size)
            .ty(ty);
        match unsafe { self.acceleration_loader.create_acceleration_structure(&create_info, None) } {
            Ok(handle) => {
                let address_info = vk::AccelerationStructureDeviceAddressInfoKHR::builder().acceleration_structure(handle);
                let address = unsafe {
                    self.acceleration_loader
                        .get_acceleration_structure_device_address(&address_info)
                };
                Ok((handle, storage, address))
            }
            Err(err) => {
                storage.destroy(self.device());
                Err(err.into())
            }
        }
    }

    fn instance_bytes(&self, instances: &[TlasInstance]) -> DeviceResult<Vec<u8>> {
        let mut bytes = Vec::with_capacity(instances.len() * INSTANCE_SIZE);
        for instance in instances {
            let blas = self
                .structures
                .get(to_key(instance.blas.0))
                .filter(|record| record.is_bottom_level())
                .ok_or(DeviceError::UnknownHandle {
                    kind: "bottom-level structure",
                    id: instance.blas.0,
                })?;
            let raw = raw_instance(instance, blas.address);
            // SAFETY: the instance struct is plain data of exactly INSTANCE_SIZE bytes
            let raw_bytes = unsafe {
                std::slice::from_raw_parts(
                    (&raw as *const vk::AccelerationStructureInstanceKHR).cast::<u8>(),
                    INSTANCE_SIZE,
                )
            };
            bytes.extend_from_slice(raw_bytes);
        }
        Ok(bytes)
    }

    pub(super) fn build_blas(&self, desc: &BlasDesc) -> DeviceResult<AccelerationRecord> {
        if desc.index_count == 0 || desc.index_count % 3 != 0 {
            return Err(DeviceError::invalid(format!(
                "index count {} is not a non-empty triangle list",
                desc.index_count
            )));
        }
        let triangles = vk::AccelerationStructureGeometryTrianglesDataKHR::builder()
            .vertex_format(vk::Format::R32G32B32_SFLOAT)
            .vertex_data(vk::DeviceOrHostAddressConstKHR {
                device_address: self.geometry_address(desc.vertex_buffer)?,
            })
            .vertex_stride(desc.vertex_stride)
            .max_vertex(desc.vertex_count.saturating_sub(1))
            .index_type(vk::IndexType::UINT32)
            .index_data(vk::DeviceOrHostAddressConstKHR {
                device_address: self.geometry_address(desc.index_buffer)?,
            })
            .build();
        let geometries = [vk::AccelerationStructureGeometryKHR::builder()
            .geometry_type(vk::GeometryTypeKHR::TRIANGLES)
            .geometry(vk::AccelerationStructureGeometryDataKHR { triangles })
            .flags(vk::GeometryFlagsKHR::OPAQUE)
            .build()];
        let primitive_count = desc.index_count / 3;

        let build_info = vk::AccelerationStructureBuildGeometryInfoKHR::builder()
            .ty(vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL)
            .flags(vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_TRACE)
            .mode(vk::BuildAccelerationStructureModeKHR::BUILD)
            .geometries(&geometries);
        let sizes = unsafe {
            self.acceleration_loader.get_acceleration_structure_build_sizes(
                vk::AccelerationStructureBuildTypeKHR::DEVICE,
                &build_info,
                &[primitive_count],
            )
        };

        let (handle, storage, address) = self.create_structure(
            vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL,
            sizes.acceleration_structure_size,
        )?;
        let record = AccelerationRecord {
            handle,
            address,
            storage,
            top: None,
        };

        let built = self.create_scratch(sizes.build_scratch_size).and_then(|(scratch, scratch_address)| {
            let build_info = build_info
                .dst_acceleration_structure(handle)
                .scratch_data(vk::DeviceOrHostAddressKHR {
                    device_address: scratch_address,
                })
                .build();
            let range = vk::AccelerationStructureBuildRangeInfoKHR {
                primitive_count,
                primitive_offset: 0,
                first_vertex: 0,
                transform_offset: 0,
            };
            let result = self.single_time(|cmd| unsafe {
                self.acceleration_loader
                    .cmd_build_acceleration_structures(cmd, &[build_info], &[&[range]]);
            });
            scratch.destroy(self.device());
            result
        });

        match built {
            Ok(()) => {
                debug!("[TLAS] Built BLAS with {primitive_count} triangles");
                Ok(record)
            }
            Err(err) => {
                record.destroy(self.device(), &self.acceleration_loader);
                Err(err)
            }
        }
    }

    pub(super) fn build_top_level(&self, instances: &[TlasInstance]) -> DeviceResult<AccelerationRecord> {
        let bytes = self.instance_bytes(instances)?;
        let instance_count = instances.len();
        let buffer_size = (instance_count.max(1) * INSTANCE_SIZE) as u64;

        let mut instance_buffers = Vec::with_capacity(self.frames.len());
        for _ in 0..self.frames.len() {
            match self.create_address_buffer(
                buffer_size,
                vk::BufferUsageFlags::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR,
                MemoryLocation::HostVisible,
            ) {
                Ok(buffer) => instance_buffers.push(buffer),
                Err(err) => {
                    instance_buffers.iter().for_each(|b: &VulkanBuffer| b.destroy(self.device()));
                    return Err(err);
                }
            }
        }
        let first_address = instance_buffers[0].address.unwrap_or_default();
        let geometries = [instance_geometry(first_address)];

        let build_info = vk::AccelerationStructureBuildGeometryInfoKHR::builder()
            .ty(vk::AccelerationStructureTypeKHR::TOP_LEVEL)
            .flags(
                vk::BuildAccelerationStructureFlagsKHR::ALLOW_UPDATE
                    | vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_TRACE,
            )
            .mode(vk::BuildAccelerationStructureModeKHR::BUILD)
            .geometries(&geometries);
        let sizes = unsafe {
            self.acceleration_loader.get_acceleration_structure_build_sizes(
                vk::AccelerationStructureBuildTypeKHR::DEVICE,
                &build_info,
                &[instance_count as u32],
            )
        };

        let release_instances = |buffers: &[VulkanBuffer]| buffers.iter().for_each(|b| b.destroy(self.device()));
        let (handle, storage, address) =
            match self.create_structure(vk::AccelerationStructureTypeKHR::TOP_LEVEL, sizes.acceleration_structure_size) {
                Ok(created) => created,
                Err(err) => {
                    release_instances(&instance_buffers);
                    return Err(err);
                }
            };
        let (scratch, scratch_address) =
            match self.create_scratch(sizes.build_scratch_size.max(sizes.update_scratch_size)) {
                Ok(created) => created,
                Err(err) => {
                    unsafe { self.acceleration_loader.destroy_acceleration_structure(handle, None) };
                    storage.destroy(self.device());
                    release_instances(&instance_buffers);
                    return Err(err);
                }
            };

        let record = AccelerationRecord {
            handle,
            address,
            storage,
            top: Some(TopLevel {
                instance_count,
                instance_buffers,
                scratch,
                scratch_address,
            }),
        };

        let built = (|| -> DeviceResult<()> {
            if let Some(top) = &record.top {
                if !bytes.is_empty() {
                    top.instance_buffers[0].write(0, &bytes)?;
                }
            }
            let build_info = build_info
                .dst_acceleration_structure(handle)
                .scratch_data(vk::DeviceOrHostAddressKHR {
                    device_address: scratch_address,
                })
                .build();
            let range = vk::AccelerationStructureBuildRangeInfoKHR {
                primitive_count: instance_count as u32,
                ..Default::default()
            };
            self.single_time(|cmd| unsafe {
                self.acceleration_loader
                    .cmd_build_acceleration_structures(cmd, &[build_info], &[&[range]]);
            })
        })();

        match built {
            Ok(()) => {
                debug!("[TLAS] Built TLAS with {instance_count} instances");
                Ok(record)
            }
            Err(err) => {
                record.destroy(self.device(), &self.acceleration_loader);
                Err(err)
            }
        }
    }

    /// Record an update of `tlas` from the instance buffer of frame `slot`
    pub(super) fn record_tlas_refit(
        &self,
        cmd: vk::CommandBuffer,
        slot: usize,
        tlas: AccelerationStructureHandle,
        instances: &[TlasInstance],
    ) -> DeviceResult<()> {
        let bytes = self.instance_bytes(instances)?;
        let record = self.structures.get(to_key(tlas.0));
        let (record, top) = match record {
            Some(record) => match &record.top {
                Some(top) => (record, top),
                None => {
                    return Err(DeviceError::UnknownHandle {
                        kind: "top-level structure",
                        id: tlas.0,
                    })
                }
            },
            None => {
                return Err(DeviceError::UnknownHandle {
                    kind: "top-level structure",
                    id: tlas.0,
                })
            }
        };
        if top.instance_count != instances.len() {
            return Err(DeviceError::invalid(format!(
                "refit with {} instances of a structure built for {}",
                instances.len(),
                top.instance_count
            )));
        }
        let instance_buffer = top
            .instance_buffers
            .get(slot)
            .ok_or_else(|| DeviceError::invalid(format!("no instance buffer for frame slot {slot}")))?;
        if !bytes.is_empty() {
            instance_buffer.write(0, &bytes)?;
        }

        let geometries = [instance_geometry(instance_buffer.address.unwrap_or_default())];
        let build_info = vk::AccelerationStructureBuildGeometryInfoKHR::builder()
            .ty(vk::AccelerationStructureTypeKHR::TOP_LEVEL)
            .flags(
                vk::BuildAccelerationStructureFlagsKHR::ALLOW_UPDATE
                    | vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_TRACE,
            )
            .mode(vk::BuildAccelerationStructureModeKHR::UPDATE)
            .src_acceleration_structure(record.handle)
            .dst_acceleration_structure(record.handle)
            .geometries(&geometries)
            .scratch_data(vk::DeviceOrHostAddressKHR {
                device_address: top.scratch_address,
            })
            .build();
        let range = vk::AccelerationStructureBuildRangeInfoKHR {
            primitive_count: instances.len() as u32,
            ..Default::default()
        };

        // Earlier traces and builds touching the structure or the shared scratch finish first.
        let before = vk::MemoryBarrier::builder()
            .src_access_mask(
                vk::AccessFlags::ACCELERATION_STRUCTURE_READ_KHR | vk::AccessFlags::ACCELERATION_STRUCTURE_WRITE_KHR,
            )
            .dst_access_mask(
                vk::AccessFlags::ACCELERATION_STRUCTURE_READ_KHR | vk::AccessFlags::ACCELERATION_STRUCTURE_WRITE_KHR,
            )
            .build();
        unsafe {
            self.device().cmd_pipeline_barrier(
                cmd,
                vk::PipelineStageFlags::ACCELERATION_STRUCTURE_BUILD_KHR
                    | vk::PipelineStageFlags::RAY_TRACING_SHADER_KHR,
                vk::PipelineStageFlags::ACCELERATION_STRUCTURE_BUILD_KHR,
                vk::DependencyFlags::empty(),
                &[before],
                &[],
                &[],
            );
            self.acceleration_loader
                .cmd_build_acceleration_structures(cmd, &[build_info], &[&[range]]);
        }
        structure_barrier(
            self.device(),
            cmd,
            vk::PipelineStageFlags::RAY_TRACING_SHADER_KHR,
            vk::AccessFlags::ACCELERATION_STRUCTURE_READ_KHR,
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_instance_record_is_sixty_four_bytes() {
        assert_eq!(INSTANCE_SIZE, 64);
    }

    #[test]
    fn test_raw_instance_packs_index_mask_and_flags() {
        let instance = TlasInstance {
            blas: AccelerationStructureHandle(1),
            transform: [1.0, 0.0, 0.0, 2.0, 0.0, 1.0, 0.0, 3.0, 0.0, 0.0, 1.0, 4.0],
            custom_index: 7,
            mask: 0xFF,
        };
        let raw = raw_instance(&instance, 0xABCD);

        assert_eq!(raw.instance_custom_index_and_mask.low_24(), 7);
        assert_eq!(raw.instance_custom_index_and_mask.high_8(), 0xFF);
        assert_eq!(raw.instance_shader_binding_table_record_offset_and_flags.low_24(), 0);
        assert_eq!(
            u32::from(raw.instance_shader_binding_table_record_offset_and_flags.high_8()),
            vk::GeometryInstanceFlagsKHR::TRIANGLE_FACING_CULL_DISABLE.as_raw()
        );
        assert_eq!(raw.transform.matrix[3], 2.0);
        assert_eq!(unsafe { raw.acceleration_structure_reference.device_handle }, 0xABCD);
    }
}
