//! Double-buffered GPU arrays of plain-old-data structs
//!
//! A `DynamicBuffer<T>` keeps the authoritative copy of its elements on the
//! CPU. Each frame-in-flight slot owns a host-visible staging buffer and a
//! device-local buffer; `sync` writes the staging buffer of one slot and
//! records the copy into that slot's device buffer, followed by a barrier so
//! shaders of the same submission see the new data.

use ash::vk;
use bytemuck::Pod;

use crate::render::api::{
    BufferBarrier, BufferDesc, BufferHandle, CommandBufferHandle, DeviceError, DeviceResult, RenderDevice,
};
use crate::render::resources::PerFrame;

/// CPU-authoritative array mirrored into one device buffer per frame slot
pub struct DynamicBuffer<T: Pod> {
    cpu: Vec<T>,
    staging: PerFrame<BufferHandle>,
    gpu: PerFrame<BufferHandle>,
    dst_stage: vk::PipelineStageFlags,
    dst_access: vk::AccessFlags,
}

impl<T: Pod> DynamicBuffer<T> {
    /// Create a buffer of `count` zeroed elements.
    ///
    /// `usage` is `UNIFORM_BUFFER` or `STORAGE_BUFFER`; the barrier recorded by
    /// `sync` targets every shader stage that may read it.
    pub fn new(
        device: &mut dyn RenderDevice,
        count: usize,
        usage: vk::BufferUsageFlags,
    ) -> DeviceResult<Self> {
        if count == 0 {
            return Err(DeviceError::invalid("dynamic buffer needs at least one element"));
        }
        let size = (std::mem::size_of::<T>() * count) as u64;
        let frames = device.frames_in_flight();

        let staging = PerFrame::try_new(frames, |_| device.create_buffer(&BufferDesc::staging(size)))?;
        let gpu = match PerFrame::try_new(frames, |_| {
            device.create_buffer(&BufferDesc::device_local(size, usage))
        }) {
            Ok(gpu) => gpu,
            Err(err) => {
                staging.iter().for_each(|&buffer| device.destroy_buffer(buffer));
                return Err(err);
            }
        };

        let dst_access = if usage.contains(vk::BufferUsageFlags::UNIFORM_BUFFER) {
            vk::AccessFlags::UNIFORM_READ
        } else {
            vk::AccessFlags::SHADER_READ
        };

        Ok(Self {
            cpu: vec![T::zeroed(); count],
            staging,
            gpu,
            dst_stage: vk::PipelineStageFlags::VERTEX_SHADER
                | vk::PipelineStageFlags::FRAGMENT_SHADER
                | vk::PipelineStageFlags::RAY_TRACING_SHADER_KHR,
            dst_access,
        })
    }

    /// Number of elements
    pub fn len(&self) -> usize {
        self.cpu.len()
    }

    /// Whether the buffer holds no elements
    pub fn is_empty(&self) -> bool {
        self.cpu.is_empty()
    }

    /// Size in bytes of one frame's buffer
    pub fn size_bytes(&self) -> u64 {
        (std::mem::size_of::<T>() * self.cpu.len()) as u64
    }

    /// CPU copy of element `index`
    pub fn at(&self, index: usize) -> &T {
        &self.cpu[index]
    }

    /// Mutable CPU copy of element `index`; takes effect on the next `sync`
    pub fn at_mut(&mut self, index: usize) -> &mut T {
        &mut self.cpu[index]
    }

    /// All CPU elements
    pub fn as_slice(&self) -> &[T] {
        &self.cpu
    }

    /// Device buffer read by shaders of `frame`
    pub fn buffer(&self, frame: usize) -> BufferHandle {
        *self.gpu.get(frame)
    }

    /// Upload the CPU copy into `frame`'s device buffer.
    ///
    /// Fails with [`DeviceError::FrameInFlight`] if the device may still be
    /// reading that slot.
    pub fn sync(
        &self,
        device: &mut dyn RenderDevice,
        cmd: CommandBufferHandle,
        frame: usize,
    ) -> DeviceResult<()> {
        self.sync_prefix(device, cmd, frame, self.cpu.len())
    }

    /// Upload only the first `count` elements into `frame`'s device buffer.
    ///
    /// Elements past `count` keep whatever that slot held before; shaders
    /// must not index them. Nothing is recorded for an empty prefix.
    pub fn sync_prefix(
        &self,
        device: &mut dyn RenderDevice,
        cmd: CommandBufferHandle,
        frame: usize,
        count: usize,
    ) -> DeviceResult<()> {
        let slot = self.gpu.slot(frame);
        if device.frame_pending(slot) {
            return Err(DeviceError::FrameInFlight { frame: slot });
        }
        let bytes: &[u8] = bytemuck::cast_slice(&self.cpu[..count.min(self.cpu.len())]);
        if bytes.is_empty() {
            return Ok(());
        }
        let staging = *self.staging.get(frame);
        let gpu = *self.gpu.get(frame);

        device.write_buffer(staging, 0, bytes)?;
        device.cmd_copy_buffer(cmd, staging, gpu, bytes.len() as u64)?;
        device.cmd_buffer_barrier(
            cmd,
            &BufferBarrier {
                buffer: gpu,
                src_stage: vk::PipelineStageFlags::TRANSFER,
                src_access: vk::AccessFlags::TRANSFER_WRITE,
                dst_stage: self.dst_stage,
                dst_access: self.dst_access,
            },
        );
        Ok(())
    }

    /// Release every per-frame buffer
    pub fn destroy(self, device: &mut dyn RenderDevice) {
        for &buffer in self.staging.iter().chain(self.gpu.iter()) {
            device.destroy_buffer(buffer);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::backends::headless::{HeadlessDevice, RecordedCommand};

    #[repr(C)]
    #[derive(Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
    struct Sample {
        value: [f32; 4],
    }

    #[test]
    fn test_sync_copies_cpu_state_into_frame_buffer() {
        let mut device = HeadlessDevice::new(2);
        let mut buffer = DynamicBuffer::<Sample>::new(&mut device, 1, vk::BufferUsageFlags::UNIFORM_BUFFER).unwrap();
        buffer.at_mut(0).value = [1.0, 2.0, 3.0, 4.0];

        let frame = device.begin_frame().unwrap();
        buffer.sync(&mut device, frame.command_buffer, frame.frame_index).unwrap();
        device.end_frame(frame).unwrap();

        let bytes = device.buffer_contents(buffer.buffer(0)).unwrap();
        let synced: [f32; 4] = bytemuck::pod_read_unaligned(bytes);
        assert_eq!(synced, [1.0, 2.0, 3.0, 4.0]);
        // The other slot was never written.
        let other = device.buffer_contents(buffer.buffer(1)).unwrap();
        assert!(other.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_sync_into_pending_slot_is_rejected() {
        let mut device = HeadlessDevice::new(2);
        let buffer = DynamicBuffer::<Sample>::new(&mut device, 1, vk::BufferUsageFlags::UNIFORM_BUFFER).unwrap();

        let first = device.begin_frame().unwrap();
        device.end_frame(first).unwrap();
        let second = device.begin_frame().unwrap();

        let result = buffer.sync(&mut device, second.command_buffer, first.frame_index);
        assert!(matches!(result, Err(DeviceError::FrameInFlight { frame: 0 })));
        buffer.sync(&mut device, second.command_buffer, second.frame_index).unwrap();
    }

    #[test]
    fn test_prefix_sync_copies_only_used_elements() {
        let mut device = HeadlessDevice::new(2);
        let mut buffer = DynamicBuffer::<Sample>::new(&mut device, 64, vk::BufferUsageFlags::STORAGE_BUFFER).unwrap();
        buffer.at_mut(0).value = [5.0; 4];
        buffer.at_mut(1).value = [6.0; 4];
        buffer.at_mut(2).value = [7.0; 4];

        let frame = device.begin_frame().unwrap();
        buffer.sync_prefix(&mut device, frame.command_buffer, frame.frame_index, 2).unwrap();
        assert!(matches!(
            device.recorded_commands(frame.command_buffer),
            [RecordedCommand::CopyBuffer { size: 32, .. }, ..]
        ));
        device.end_frame(frame).unwrap();

        let bytes = device.buffer_contents(buffer.buffer(0)).unwrap();
        let synced: [f32; 4] = bytemuck::pod_read_unaligned(&bytes[16..32]);
        assert_eq!(synced, [6.0; 4]);
        assert!(bytes[32..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_empty_prefix_records_nothing() {
        let mut device = HeadlessDevice::new(2);
        let buffer = DynamicBuffer::<Sample>::new(&mut device, 8, vk::BufferUsageFlags::STORAGE_BUFFER).unwrap();
        let frame = device.begin_frame().unwrap();
        buffer.sync_prefix(&mut device, frame.command_buffer, frame.frame_index, 0).unwrap();
        assert!(device.recorded_commands(frame.command_buffer).is_empty());
        device.end_frame(frame).unwrap();
    }

    #[test]
    fn test_slots_use_distinct_buffers() {
        let mut device = HeadlessDevice::new(3);
        let buffer = DynamicBuffer::<Sample>::new(&mut device, 4, vk::BufferUsageFlags::STORAGE_BUFFER).unwrap();
        assert_ne!(buffer.buffer(0), buffer.buffer(1));
        assert_ne!(buffer.buffer(1), buffer.buffer(2));
        assert_eq!(buffer.buffer(0), buffer.buffer(3));
        assert_eq!(buffer.size_bytes(), 64);
    }

    #[test]
    fn test_partial_failure_releases_staging_buffers() {
        let mut device = HeadlessDevice::new(2);
        let before = device.live_buffer_count();
        device.fail_next_allocation();
        assert!(DynamicBuffer::<Sample>::new(&mut device, 1, vk::BufferUsageFlags::UNIFORM_BUFFER).is_err());
        assert_eq!(device.live_buffer_count(), before);
    }
}
