//! Per-entity GPU state
//!
//! An entity owns two single-element uniform buffers (metadata and material)
//! replicated per frame slot, and one descriptor set per frame slot that binds
//! them together with the albedo and detail textures. Texture references are
//! stable IDs; the descriptor of a slot is rewritten lazily, when that slot is
//! prepared and therefore not in flight, whenever the referenced IDs or the
//! asset pool's structure changed.

use ash::vk;

use crate::assets::{AssetPool, MeshId, TextureId};
use crate::foundation::logging::debug;
use crate::foundation::math::{Mat4, Mat4Ext};
use crate::render::api::{
    CommandBufferHandle, DescriptorBinding, DescriptorResource, DescriptorSetHandle, DescriptorSetLayoutHandle,
    DescriptorWrite, DeviceError, DeviceResult, RenderDevice,
};
use crate::render::resources::{DynamicBuffer, PerFrame};

use super::material::{EntityMetadata, Material};

/// Stable entity identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct EntityId(pub u32);

impl std::fmt::Display for EntityId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "entity#{}", self.0)
    }
}

/// Bindings of the entity descriptor set
pub(crate) fn entity_set_bindings() -> [DescriptorBinding; 4] {
    let stages = vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT;
    [
        DescriptorBinding::single(0, vk::DescriptorType::UNIFORM_BUFFER, stages),
        DescriptorBinding::single(1, vk::DescriptorType::UNIFORM_BUFFER, stages),
        DescriptorBinding::single(2, vk::DescriptorType::COMBINED_IMAGE_SAMPLER, vk::ShaderStageFlags::FRAGMENT),
        DescriptorBinding::single(3, vk::DescriptorType::COMBINED_IMAGE_SAMPLER, vk::ShaderStageFlags::FRAGMENT),
    ]
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct BoundTextures {
    revision: u64,
    albedo: TextureId,
    detail: TextureId,
}

fn allocate_sets(
    device: &mut dyn RenderDevice,
    layout: DescriptorSetLayoutHandle,
    metadata: &DynamicBuffer<EntityMetadata>,
    material: &DynamicBuffer<Material>,
) -> DeviceResult<PerFrame<DescriptorSetHandle>> {
    let frames = device.frames_in_flight();
    let mut allocated = Vec::with_capacity(frames);
    let sets = PerFrame::try_new(frames, |frame| {
        let set = device.allocate_descriptor_set(layout)?;
        allocated.push(set);
        device.write_descriptor_set(
            set,
            &[
                DescriptorWrite::new(0, DescriptorResource::UniformBuffer(metadata.buffer(frame))),
                DescriptorWrite::new(1, DescriptorResource::UniformBuffer(material.buffer(frame))),
            ],
        )?;
        Ok(set)
    });
    if sets.is_err() {
        allocated.into_iter().for_each(|set| device.free_descriptor_set(set));
    }
    sets
}

/// One renderable instance
pub struct EntityRecord {
    id: EntityId,
    mesh: MeshId,
    albedo: TextureId,
    detail: TextureId,
    transform: Mat4,
    material: Material,

    metadata_buffer: DynamicBuffer<EntityMetadata>,
    material_buffer: DynamicBuffer<Material>,
    descriptor_sets: PerFrame<DescriptorSetHandle>,
    bound: PerFrame<Option<BoundTextures>>,
}

impl EntityRecord {
    pub(crate) fn new(
        device: &mut dyn RenderDevice,
        layout: DescriptorSetLayoutHandle,
        id: EntityId,
    ) -> DeviceResult<Self> {
        let frames = device.frames_in_flight();
        let usage = vk::BufferUsageFlags::UNIFORM_BUFFER;
        let metadata_buffer = DynamicBuffer::<EntityMetadata>::new(device, 1, usage)?;
        let material_buffer = match DynamicBuffer::<Material>::new(device, 1, usage) {
            Ok(buffer) => buffer,
            Err(err) => {
                metadata_buffer.destroy(device);
                return Err(err);
            }
        };

        let descriptor_sets = match allocate_sets(device, layout, &metadata_buffer, &material_buffer) {
            Ok(sets) => sets,
            Err(err) => {
                metadata_buffer.destroy(device);
                material_buffer.destroy(device);
                return Err(err);
            }
        };

        let mut entity = Self {
            id,
            mesh: MeshId(0),
            albedo: TextureId(0),
            detail: TextureId(0),
            transform: Mat4::identity(),
            material: Material::default(),
            metadata_buffer,
            material_buffer,
            descriptor_sets,
            bound: PerFrame::new(frames, |_| None),
        };
        *entity.material_buffer.at_mut(0) = entity.material;
        debug!("[SCENE] Created {id}");
        Ok(entity)
    }

    /// Stable ID
    pub fn id(&self) -> EntityId {
        self.id
    }

    /// Referenced mesh
    pub fn mesh(&self) -> MeshId {
        self.mesh
    }

    /// Albedo and detail textures
    pub fn textures(&self) -> (TextureId, TextureId) {
        (self.albedo, self.detail)
    }

    /// Object-to-world transform
    pub fn transform(&self) -> Mat4 {
        self.transform
    }

    /// Shading parameters
    pub fn material(&self) -> Material {
        self.material
    }

    /// Descriptor set of `frame`
    pub fn descriptor_set(&self, frame: usize) -> DescriptorSetHandle {
        *self.descriptor_sets.get(frame)
    }

    pub(super) fn set_transform(&mut self, transform: Mat4) {
        self.transform = transform;
    }

    pub(super) fn set_material(&mut self, material: Material) {
        self.material = material;
    }

    pub(super) fn material_mut(&mut self) -> &mut Material {
        &mut self.material
    }

    pub(super) fn set_mesh(&mut self, mesh: MeshId) {
        self.mesh = mesh;
    }

    pub(super) fn set_albedo_texture(&mut self, texture: TextureId) {
        self.albedo = texture;
    }

    pub(super) fn set_albedo_detail_texture(&mut self, texture: TextureId) {
        self.detail = texture;
    }

    /// Copy the current state into the CPU staging copies and return the
    /// metadata that was staged.
    pub(super) fn update(&mut self, assets: &AssetPool) -> EntityMetadata {
        let metadata = EntityMetadata {
            transform: self.transform.to_cols_array(),
            entity_id: self.id.0,
            albedo_map_slot: assets.texture_binding_slot(self.albedo),
            albedo_detail_map_slot: assets.texture_binding_slot(self.detail),
            mesh_slot: assets.mesh_binding_slot(self.mesh),
        };
        *self.metadata_buffer.at_mut(0) = metadata;
        *self.material_buffer.at_mut(0) = self.material;
        metadata
    }

    /// Rewrite `frame`'s texture bindings if they are out of date.
    ///
    /// The caller guarantees `frame` is not in flight.
    pub(super) fn prepare_bindings(
        &mut self,
        device: &mut dyn RenderDevice,
        assets: &AssetPool,
        frame: usize,
    ) -> DeviceResult<()> {
        let wanted = BoundTextures {
            revision: assets.revision(),
            albedo: self.albedo,
            detail: self.detail,
        };
        if *self.bound.get(frame) == Some(wanted) {
            return Ok(());
        }
        let (Some((albedo, sampler)), Some((detail, detail_sampler))) =
            (assets.texture_binding(self.albedo), assets.texture_binding(self.detail))
        else {
            return Err(DeviceError::invalid("asset pool holds no textures"));
        };
        device.write_descriptor_set(
            *self.descriptor_sets.get(frame),
            &[
                DescriptorWrite::new(2, DescriptorResource::SampledImage(albedo, sampler)),
                DescriptorWrite::new(3, DescriptorResource::SampledImage(detail, detail_sampler)),
            ],
        )?;
        *self.bound.get_mut(frame) = Some(wanted);
        Ok(())
    }

    /// Upload the staged uniforms into `frame`'s buffers
    pub(super) fn sync(&self, device: &mut dyn RenderDevice, cmd: CommandBufferHandle, frame: usize) -> DeviceResult<()> {
        self.metadata_buffer.sync(device, cmd, frame)?;
        self.material_buffer.sync(device, cmd, frame)
    }

    /// Release buffers and descriptor sets; the caller has quiesced the device
    pub(super) fn destroy(self, device: &mut dyn RenderDevice) {
        for &set in &self.descriptor_sets {
            device.free_descriptor_set(set);
        }
        self.metadata_buffer.destroy(device);
        self.material_buffer.destroy(device);
        debug!("[SCENE] Destroyed {}", self.id);
    }
}
