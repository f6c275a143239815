//! Command pool, per-frame command buffers and single-time submissions

use ash::vk;

use crate::render::api::DeviceResult;

/// Command buffer and fence of one frame-in-flight slot
pub(super) struct FrameSlot {
    pub command_buffer: vk::CommandBuffer,
    /// Signaled when the slot's last submission retired
    pub fence: vk::Fence,
}

pub(super) fn create_command_pool(device: &ash::Device, queue_family_index: u32) -> DeviceResult<vk::CommandPool> {
    let pool_create_info = vk::CommandPoolCreateInfo::builder()
        .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)
        .queue_family_index(queue_family_index);
    Ok(unsafe { device.create_command_pool(&pool_create_info, None)? })
}

/// One command buffer and one signaled fence per slot
pub(super) fn create_frame_slots(
    device: &ash::Device,
    command_pool: vk::CommandPool,
    count: usize,
) -> DeviceResult<Vec<FrameSlot>> {
    let alloc_info = vk::CommandBufferAllocateInfo::builder()
        .command_pool(command_pool)
        .level(vk::CommandBufferLevel::PRIMARY)
        .command_buffer_count(count as u32);
    let command_buffers = unsafe { device.allocate_command_buffers(&alloc_info)? };

    // Created signaled so the first wait on each slot returns immediately
    let fence_info = vk::FenceCreateInfo::builder().flags(vk::FenceCreateFlags::SIGNALED);
    let mut slots = Vec::with_capacity(count);
    for command_buffer in command_buffers {
        match unsafe { device.create_fence(&fence_info, None) } {
            Ok(fence) => slots.push(FrameSlot { command_buffer, fence }),
            Err(err) => {
                destroy_frame_slots(device, &slots);
                return Err(err.into());
            }
        }
    }
    Ok(slots)
}

pub(super) fn destroy_frame_slots(device: &ash::Device, slots: &[FrameSlot]) {
    for slot in slots {
        unsafe { device.destroy_fence(slot.fence, None) };
    }
}

/// Record with `record`, submit, and block until the queue drained.
pub(super) fn submit_single_time(
    device: &ash::Device,
    command_pool: vk::CommandPool,
    queue: vk::Queue,
    record: impl FnOnce(vk::CommandBuffer),
) -> DeviceResult<()> {
    let alloc_info = vk::CommandBufferAllocateInfo::builder()
        .level(vk::CommandBufferLevel::PRIMARY)
        .command_pool(command_pool)
        .command_buffer_count(1);
    let command_buffers = unsafe { device.allocate_command_buffers(&alloc_info)? };

    let result = (|| -> DeviceResult<()> {
        let command_buffer = command_buffers[0];
        let begin_info = vk::CommandBufferBeginInfo::builder().flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        unsafe { device.begin_command_buffer(command_buffer, &begin_info)? };

        record(command_buffer);

        unsafe {
            device.end_command_buffer(command_buffer)?;
            let submit_info = vk::SubmitInfo::builder().command_buffers(&command_buffers);
            device.queue_submit(queue, &[submit_info.build()], vk::Fence::null())?;
            device.queue_wait_idle(queue)?;
        }
        Ok(())
    })();

    unsafe { device.free_command_buffers(command_pool, &command_buffers) };
    result
}
