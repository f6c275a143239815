//! Vulkan objects created outside the renderer
//!
//! Instance, physical device selection, logical device and queue creation
//! belong to the application's bootstrap (window system integration, layer
//! selection). The renderer receives the finished objects here.

use std::ffi::CStr;

use ash::extensions::khr::{AccelerationStructure, DeferredHostOperations, RayTracingPipeline};
use ash::vk;

/// Bootstrapped instance, device and graphics queue
///
/// The logical device must enable [`VulkanContext::required_device_extensions`]
/// and the `bufferDeviceAddress`, `accelerationStructure`,
/// `rayTracingPipeline` and `descriptorBindingPartiallyBound` features.
#[derive(Clone)]
pub struct VulkanContext {
    /// Vulkan instance
    pub instance: ash::Instance,
    /// Logical device
    pub device: ash::Device,
    /// Physical device the logical device was created from
    pub physical_device: vk::PhysicalDevice,
    /// Queue supporting graphics, compute and transfer
    pub queue: vk::Queue,
    /// Family of `queue`
    pub queue_family_index: u32,
}

impl VulkanContext {
    /// Device extensions the backend relies on
    pub fn required_device_extensions() -> [&'static CStr; 3] {
        [
            AccelerationStructure::name(),
            RayTracingPipeline::name(),
            DeferredHostOperations::name(),
        ]
    }

    /// Memory heaps and types of the physical device
    pub fn memory_properties(&self) -> vk::PhysicalDeviceMemoryProperties {
        unsafe {
            self.instance
                .get_physical_device_memory_properties(self.physical_device)
        }
    }

    /// Ray-tracing pipeline limits
    pub fn ray_tracing_pipeline_properties(&self) -> vk::PhysicalDeviceRayTracingPipelinePropertiesKHR {
        unsafe { RayTracingPipeline::get_properties(&self.instance, self.physical_device) }
    }

    /// Acceleration-structure limits
    pub fn acceleration_structure_properties(&self) -> vk::PhysicalDeviceAccelerationStructurePropertiesKHR {
        let mut properties = vk::PhysicalDeviceAccelerationStructurePropertiesKHR::default();
        let mut properties2 = vk::PhysicalDeviceProperties2::builder().push_next(&mut properties);
        unsafe {
            self.instance
                .get_physical_device_properties2(self.physical_device, &mut properties2);
        }
        properties
    }
}
