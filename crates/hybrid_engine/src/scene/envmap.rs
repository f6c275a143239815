//! Environment map: backdrop texture and its settings uniform

use ash::vk;

use crate::assets::{AssetPool, TextureId};
use crate::render::api::{
    CommandBufferHandle, DescriptorBinding, DescriptorResource, DescriptorSetHandle, DescriptorSetLayoutHandle,
    DescriptorWrite, DeviceError, DeviceResult, RenderDevice,
};
use crate::render::resources::{DynamicBuffer, PerFrame};

use super::settings::EnvMapSettings;

pub(crate) fn envmap_set_bindings() -> [DescriptorBinding; 2] {
    let stages = vk::ShaderStageFlags::VERTEX
        | vk::ShaderStageFlags::FRAGMENT
        | vk::ShaderStageFlags::RAYGEN_KHR
        | vk::ShaderStageFlags::MISS_KHR
        | vk::ShaderStageFlags::CLOSEST_HIT_KHR;
    [
        DescriptorBinding::single(0, vk::DescriptorType::UNIFORM_BUFFER, stages),
        DescriptorBinding::single(1, vk::DescriptorType::COMBINED_IMAGE_SAMPLER, stages),
    ]
}

/// Scene-wide environment lighting
pub struct EnvironmentMap {
    settings: EnvMapSettings,
    texture: TextureId,
    buffer: DynamicBuffer<EnvMapSettings>,
    descriptor_sets: PerFrame<DescriptorSetHandle>,
    bound: PerFrame<Option<(u64, TextureId)>>,
}

impl EnvironmentMap {
    pub(crate) fn new(device: &mut dyn RenderDevice, layout: DescriptorSetLayoutHandle) -> DeviceResult<Self> {
        let frames = device.frames_in_flight();
        let buffer = DynamicBuffer::<EnvMapSettings>::new(device, 1, vk::BufferUsageFlags::UNIFORM_BUFFER)?;
        let descriptor_sets = PerFrame::try_new(frames, |frame| {
            let set = device.allocate_descriptor_set(layout)?;
            device.write_descriptor_set(
                set,
                &[DescriptorWrite::new(0, DescriptorResource::UniformBuffer(buffer.buffer(frame)))],
            )?;
            Ok::<_, DeviceError>(set)
        });
        let descriptor_sets = match descriptor_sets {
            Ok(sets) => sets,
            Err(err) => {
                buffer.destroy(device);
                return Err(err);
            }
        };
        Ok(Self {
            settings: EnvMapSettings::default(),
            texture: TextureId(0),
            buffer,
            descriptor_sets,
            bound: PerFrame::new(frames, |_| None),
        })
    }

    /// Current settings
    pub fn settings(&self) -> &EnvMapSettings {
        &self.settings
    }

    /// Mutable settings, uploaded on the next update/sync
    pub fn settings_mut(&mut self) -> &mut EnvMapSettings {
        &mut self.settings
    }

    /// Backdrop texture
    pub fn texture(&self) -> TextureId {
        self.texture
    }

    /// Descriptor set of `frame`
    pub fn descriptor_set(&self, frame: usize) -> DescriptorSetHandle {
        *self.descriptor_sets.get(frame)
    }

    pub(super) fn set_texture(&mut self, texture: TextureId) {
        self.texture = texture;
    }

    pub(super) fn update(&mut self) {
        *self.buffer.at_mut(0) = self.settings;
    }

    pub(super) fn prepare_bindings(
        &mut self,
        device: &mut dyn RenderDevice,
        assets: &AssetPool,
        frame: usize,
    ) -> DeviceResult<()> {
        let wanted = (assets.revision(), self.texture);
        if *self.bound.get(frame) == Some(wanted) {
            return Ok(());
        }
        let (image, sampler) = assets
            .texture_binding(self.texture)
            .ok_or_else(|| DeviceError::invalid("asset pool holds no textures"))?;
        device.write_descriptor_set(
            *self.descriptor_sets.get(frame),
            &[DescriptorWrite::new(1, DescriptorResource::SampledImage(image, sampler))],
        )?;
        *self.bound.get_mut(frame) = Some(wanted);
        Ok(())
    }

    pub(super) fn sync(&self, device: &mut dyn RenderDevice, cmd: CommandBufferHandle, frame: usize) -> DeviceResult<()> {
        self.buffer.sync(device, cmd, frame)
    }

    pub(super) fn destroy(self, device: &mut dyn RenderDevice) {
        for &set in &self.descriptor_sets {
            device.free_descriptor_set(set);
        }
        self.buffer.destroy(device);
    }
}
