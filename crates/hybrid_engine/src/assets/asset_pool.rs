//! Texture and mesh pool with stable IDs and dense binding slots
//!
//! Assets are keyed by IDs handed out from strictly increasing counters
//! (separate for textures and meshes). Independently of the IDs, every live
//! asset has a binding slot: live assets are numbered `0..count` in ID order
//! after every load or destroy, and those slots index the bindless arrays the
//! ray tracer reads. Slots are therefore not stable across structural changes;
//! CPU-side references always use IDs.
//!
//! Destroyed assets leave the live set at once but their device resources are
//! parked in the bindless table until every frame slot's bindless set has been
//! rewritten without them.
//!
//! Unknown or destroyed IDs resolve to the asset in slot 0 instead of failing.
//! The pool is created with a 1×1 white texture and a unit cube so that such a
//! fallback always exists.

use std::collections::BTreeMap;

use ash::vk;

use super::mesh::{MeshAsset, MeshData, MeshId};
use super::texture::{TextureAsset, TextureData, TextureId};
use super::AssetError;
use crate::foundation::logging::{debug, info, warn};
use crate::render::api::{
    BufferHandle, DescriptorBinding, DescriptorResource, DescriptorSetHandle, DescriptorSetLayoutHandle, DescriptorWrite,
    DeviceError, ImageHandle, RenderDevice, SamplerDesc, SamplerHandle,
};
use crate::render::resources::{BindlessTable, PerFrame};

/// Name of the pre-registered fallback texture
pub const DEFAULT_TEXTURE_NAME: &str = "Pure White";

/// Name of the pre-registered fallback mesh
pub const DEFAULT_MESH_NAME: &str = "Cube";

/// Binding of the texture array in the bindless set
pub const TEXTURE_BINDING: u32 = 0;
/// Binding of the vertex buffer array in the bindless set
pub const VERTEX_BUFFER_BINDING: u32 = 1;
/// Binding of the index buffer array in the bindless set
pub const INDEX_BUFFER_BINDING: u32 = 2;
/// Binding of the area CDF buffer array in the bindless set
pub const AREA_CDF_BINDING: u32 = 3;

/// Pool capacities
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AssetPoolConfig {
    /// Texture array capacity
    pub max_textures: u32,
    /// Mesh array capacity
    pub max_meshes: u32,
}

impl Default for AssetPoolConfig {
    fn default() -> Self {
        Self {
            max_textures: crate::core::config::DEFAULT_MAX_RESOURCES,
            max_meshes: crate::core::config::DEFAULT_MAX_RESOURCES,
        }
    }
}

/// GPU texture and mesh pool
pub struct AssetPool {
    config: AssetPoolConfig,
    textures: BTreeMap<TextureId, TextureAsset>,
    meshes: BTreeMap<MeshId, MeshAsset>,
    next_texture_id: u32,
    next_mesh_id: u32,
    sampler: SamplerHandle,

    bindless_layout: DescriptorSetLayoutHandle,
    bindless_sets: PerFrame<DescriptorSetHandle>,
    texture_table: BindlessTable<TextureAsset>,
    mesh_table: BindlessTable<MeshAsset>,
    revision: u64,
    bound_revision: PerFrame<Option<u64>>,
}

impl AssetPool {
    /// Create the pool, its bindless descriptor sets and the default assets
    pub fn new(device: &mut dyn RenderDevice, config: AssetPoolConfig) -> Result<Self, AssetError> {
        if config.max_textures == 0 || config.max_meshes == 0 {
            return Err(AssetError::InvalidData("asset pool capacities must be non-zero".into()));
        }
        let frames = device.frames_in_flight();
        let stages = vk::ShaderStageFlags::RAYGEN_KHR
            | vk::ShaderStageFlags::CLOSEST_HIT_KHR
            | vk::ShaderStageFlags::MISS_KHR;
        let storage = vk::DescriptorType::STORAGE_BUFFER;
        let bindless_layout = device.create_descriptor_set_layout(&[
            DescriptorBinding::bindless(
                TEXTURE_BINDING,
                vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
                config.max_textures,
                stages,
            ),
            DescriptorBinding::bindless(VERTEX_BUFFER_BINDING, storage, config.max_meshes, stages),
            DescriptorBinding::bindless(INDEX_BUFFER_BINDING, storage, config.max_meshes, stages),
            DescriptorBinding::bindless(AREA_CDF_BINDING, storage, config.max_meshes, stages),
        ])?;
        let bindless_sets = PerFrame::try_new(frames, |_| device.allocate_descriptor_set(bindless_layout))?;
        let sampler = device.create_sampler(&SamplerDesc::default())?;

        let mut pool = Self {
            config,
            textures: BTreeMap::new(),
            meshes: BTreeMap::new(),
            next_texture_id: 0,
            next_mesh_id: 0,
            sampler,
            bindless_layout,
            bindless_sets,
            texture_table: BindlessTable::new(config.max_textures as usize, frames),
            mesh_table: BindlessTable::new(config.max_meshes as usize, frames),
            revision: 0,
            bound_revision: PerFrame::new(frames, |_| None),
        };

        pool.load_texture(device, &TextureData::solid(1, 1, [1.0; 4]), DEFAULT_TEXTURE_NAME)?;
        pool.load_mesh(device, &MeshData::cube(), DEFAULT_MESH_NAME)?;
        info!("[ASSETS] Asset pool ready ({frames} frames in flight)");
        Ok(pool)
    }

    /// Upload a texture and return its new stable ID.
    ///
    /// Fails with [`AssetError::ResourceCreation`] when the device cannot
    /// create the image; the pool is left unchanged.
    pub fn load_texture(
        &mut self,
        device: &mut dyn RenderDevice,
        data: &TextureData,
        name: &str,
    ) -> Result<TextureId, AssetError> {
        if self.textures.len() >= self.config.max_textures as usize {
            return Err(AssetError::CapacityExceeded {
                kind: "texture",
                capacity: self.config.max_textures,
            });
        }
        let id = TextureId(self.next_texture_id);
        let asset = TextureAsset::upload(device, id, data, name)?;
        self.next_texture_id += 1;
        self.textures.insert(id, asset);
        self.structure_changed();
        Ok(id)
    }

    /// Upload a mesh, build its bottom-level structure and return its new
    /// stable ID.
    pub fn load_mesh(
        &mut self,
        device: &mut dyn RenderDevice,
        data: &MeshData,
        name: &str,
    ) -> Result<MeshId, AssetError> {
        if self.meshes.len() >= self.config.max_meshes as usize {
            return Err(AssetError::CapacityExceeded {
                kind: "mesh",
                capacity: self.config.max_meshes,
            });
        }
        let id = MeshId(self.next_mesh_id);
        let asset = MeshAsset::upload(device, id, data, name)?;
        self.next_mesh_id += 1;
        self.meshes.insert(id, asset);
        self.structure_changed();
        Ok(id)
    }

    /// Destroy a texture.
    ///
    /// Quiesces the device first: frames in flight may still sample it. The
    /// image itself is freed by the refresh that reclaims its bindless slot.
    pub fn destroy_texture(&mut self, device: &mut dyn RenderDevice, id: TextureId) -> Result<(), AssetError> {
        if !self.textures.contains_key(&id) {
            return Err(AssetError::UnknownTexture(id));
        }
        if self.textures.len() == 1 {
            return Err(AssetError::LastAsset("texture"));
        }
        device.wait_idle()?;
        if let Some(texture) = self.textures.remove(&id) {
            debug!("[ASSETS] Destroyed {id} '{}', image retiring", texture.name);
            self.texture_table.retire(texture);
        }
        self.structure_changed();
        Ok(())
    }

    /// Destroy a mesh and its bottom-level structure.
    ///
    /// Quiesces the device first. Buffers and structure are freed by the
    /// refresh that reclaims the mesh's bindless slot. The scene must rebuild its top-level
    /// structure before the next trace; `SceneGraph::destroy_mesh` does both.
    pub fn destroy_mesh(&mut self, device: &mut dyn RenderDevice, id: MeshId) -> Result<(), AssetError> {
        if !self.meshes.contains_key(&id) {
            return Err(AssetError::UnknownMesh(id));
        }
        if self.meshes.len() == 1 {
            return Err(AssetError::LastAsset("mesh"));
        }
        device.wait_idle()?;
        if let Some(mesh) = self.meshes.remove(&id) {
            debug!("[ASSETS] Destroyed {id} '{}', buffers retiring", mesh.name);
            self.mesh_table.retire(mesh);
        }
        self.structure_changed();
        Ok(())
    }

    fn structure_changed(&mut self) {
        for (slot, texture) in self.textures.values_mut().enumerate() {
            texture.binding_slot = slot as u32;
        }
        for (slot, mesh) in self.meshes.values_mut().enumerate() {
            mesh.binding_slot = slot as u32;
        }
        self.revision += 1;
    }

    /// Texture by ID, or the texture in slot 0 for unknown IDs
    pub fn get_texture(&self, id: TextureId) -> Option<&TextureAsset> {
        self.textures.get(&id).or_else(|| {
            warn!("[ASSETS] Unknown {id}, using fallback texture");
            self.textures.values().next()
        })
    }

    /// Mesh by ID, or the mesh in slot 0 for unknown IDs
    pub fn get_mesh(&self, id: MeshId) -> Option<&MeshAsset> {
        self.meshes.get(&id).or_else(|| {
            warn!("[ASSETS] Unknown {id}, using fallback mesh");
            self.meshes.values().next()
        })
    }

    /// Current binding slot of a texture; 0 for unknown IDs
    pub fn texture_binding_slot(&self, id: TextureId) -> u32 {
        self.textures.get(&id).map_or(0, TextureAsset::binding_slot)
    }

    /// Current binding slot of a mesh; 0 for unknown IDs
    pub fn mesh_binding_slot(&self, id: MeshId) -> u32 {
        self.meshes.get(&id).map_or(0, MeshAsset::binding_slot)
    }

    /// Image and sampler of a texture, with fallback
    pub fn texture_binding(&self, id: TextureId) -> Option<(ImageHandle, SamplerHandle)> {
        self.get_texture(id).map(|texture| (texture.image, self.sampler))
    }

    /// Whether a texture ID is live
    pub fn contains_texture(&self, id: TextureId) -> bool {
        self.textures.contains_key(&id)
    }

    /// Whether a mesh ID is live
    pub fn contains_mesh(&self, id: MeshId) -> bool {
        self.meshes.contains_key(&id)
    }

    /// Live texture IDs in slot order
    pub fn texture_ids(&self) -> Vec<TextureId> {
        self.textures.keys().copied().collect()
    }

    /// Live mesh IDs in slot order
    pub fn mesh_ids(&self) -> Vec<MeshId> {
        self.meshes.keys().copied().collect()
    }

    /// Live textures with their names, in slot order
    pub fn texture_names(&self) -> Vec<(TextureId, &str)> {
        self.textures.iter().map(|(id, t)| (*id, t.name.as_str())).collect()
    }

    /// Live meshes with their names, in slot order
    pub fn mesh_names(&self) -> Vec<(MeshId, &str)> {
        self.meshes.iter().map(|(id, m)| (*id, m.name.as_str())).collect()
    }

    /// Number of live textures
    pub fn texture_count(&self) -> usize {
        self.textures.len()
    }

    /// Number of live meshes
    pub fn mesh_count(&self) -> usize {
        self.meshes.len()
    }

    /// Counter bumped by every load and destroy
    pub fn revision(&self) -> u64 {
        self.revision
    }

    /// Shared texture sampler
    pub fn sampler(&self) -> SamplerHandle {
        self.sampler
    }

    /// Layout of the bindless set
    pub fn bindless_layout(&self) -> DescriptorSetLayoutHandle {
        self.bindless_layout
    }

    /// Bindless set of `frame`
    pub fn bindless_set(&self, frame: usize) -> DescriptorSetHandle {
        *self.bindless_sets.get(frame)
    }

    /// Bookkeeping of the texture array
    pub fn texture_table(&self) -> &BindlessTable<TextureAsset> {
        &self.texture_table
    }

    /// Bookkeeping of the mesh arrays
    pub fn mesh_table(&self) -> &BindlessTable<MeshAsset> {
        &self.mesh_table
    }

    /// Bring `frame`'s bindless set up to date with the live asset set.
    ///
    /// Advances one bindless generation per call and rewrites the set only if
    /// assets were loaded or destroyed since it was last written. The frame
    /// must not be in flight.
    pub fn refresh_bindings(&mut self, device: &mut dyn RenderDevice, frame: usize) -> Result<(), AssetError> {
        let slot = self.bindless_sets.slot(frame);
        if device.frame_pending(slot) {
            return Err(DeviceError::FrameInFlight { frame: slot }.into());
        }
        let textures = self.texture_table.refresh(self.textures.len())?;
        let meshes = self.mesh_table.refresh(self.meshes.len())?;
        for texture in &textures.released {
            device.destroy_image(texture.image);
            debug!("[ASSETS] Released image of {}", texture.id);
        }
        for mesh in &meshes.released {
            mesh.destroy(device);
            debug!("[ASSETS] Released buffers of {}", mesh.id);
        }

        if *self.bound_revision.get(frame) == Some(self.revision) {
            return Ok(());
        }

        let mut writes = Vec::with_capacity(4);
        if !self.textures.is_empty() {
            writes.push(DescriptorWrite::new(
                TEXTURE_BINDING,
                DescriptorResource::SampledImages(
                    self.textures.values().map(|t| (t.image, self.sampler)).collect(),
                ),
            ));
        }
        if !self.meshes.is_empty() {
            writes.push(DescriptorWrite::new(VERTEX_BUFFER_BINDING, self.mesh_buffers(MeshAsset::vertex_buffer)));
            writes.push(DescriptorWrite::new(INDEX_BUFFER_BINDING, self.mesh_buffers(MeshAsset::index_buffer)));
            writes.push(DescriptorWrite::new(AREA_CDF_BINDING, self.mesh_buffers(MeshAsset::area_cdf_buffer)));
        }
        device.write_descriptor_set(*self.bindless_sets.get(frame), &writes)?;
        *self.bound_revision.get_mut(frame) = Some(self.revision);

        debug!(
            "[ASSETS] Frame {slot} bindless set at revision {}: {} textures ({} bound), {} meshes ({} bound)",
            self.revision, textures.live, textures.bound_len, meshes.live, meshes.bound_len
        );
        Ok(())
    }

    fn mesh_buffers(&self, select: impl Fn(&MeshAsset) -> BufferHandle) -> DescriptorResource {
        DescriptorResource::StorageBuffers(self.meshes.values().map(select).collect())
    }

    /// Release every asset, including retiring ones, and the pool's
    /// descriptor objects. The device must be idle.
    pub fn destroy(mut self, device: &mut dyn RenderDevice) {
        for texture in self.textures.values().chain(&self.texture_table.drain_retired()) {
            device.destroy_image(texture.image);
        }
        for mesh in self.meshes.values().chain(&self.mesh_table.drain_retired()) {
            mesh.destroy(device);
        }
        for &set in &self.bindless_sets {
            device.free_descriptor_set(set);
        }
        device.destroy_descriptor_set_layout(self.bindless_layout);
        device.destroy_sampler(self.sampler);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::api::PipelineLayoutHandle;
    use crate::render::backends::headless::HeadlessDevice;
    use crate::render::resources::SlotState;

    fn pool(device: &mut HeadlessDevice) -> AssetPool {
        AssetPool::new(device, AssetPoolConfig::default()).unwrap()
    }

    fn assert_dense(pool: &AssetPool) {
        let mut slots: Vec<u32> = pool
            .texture_ids()
            .into_iter()
            .map(|id| pool.texture_binding_slot(id))
            .collect();
        slots.sort_unstable();
        assert_eq!(slots, (0..pool.texture_count() as u32).collect::<Vec<_>>());
    }

    #[test]
    fn test_defaults_take_id_and_slot_zero() {
        let mut device = HeadlessDevice::new(2);
        let pool = pool(&mut device);
        assert_eq!(pool.texture_ids(), vec![TextureId(0)]);
        assert_eq!(pool.mesh_ids(), vec![MeshId(0)]);
        assert_eq!(pool.texture_binding_slot(TextureId(0)), 0);
        assert_eq!(pool.mesh_binding_slot(MeshId(0)), 0);
        assert_eq!(pool.get_texture(TextureId(0)).unwrap().name(), DEFAULT_TEXTURE_NAME);
        assert_eq!(pool.get_mesh(MeshId(0)).unwrap().name(), DEFAULT_MESH_NAME);
        assert_eq!(device.stats().blas_builds, 1);
    }

    #[test]
    fn test_ids_strictly_increase_and_are_not_reused() {
        let mut device = HeadlessDevice::new(2);
        let mut pool = pool(&mut device);
        let texture = TextureData::solid(2, 2, [0.5; 4]);
        let a = pool.load_texture(&mut device, &texture, "a").unwrap();
        let b = pool.load_texture(&mut device, &texture, "b").unwrap();
        assert!(a < b);
        pool.destroy_texture(&mut device, b).unwrap();
        let c = pool.load_texture(&mut device, &texture, "c").unwrap();
        assert!(c > b);
    }

    #[test]
    fn test_slots_stay_dense_through_loads_and_destroys() {
        let mut device = HeadlessDevice::new(2);
        let mut pool = pool(&mut device);
        let texture = TextureData::solid(1, 1, [0.0; 4]);
        let mut ids = Vec::new();
        for i in 0..6 {
            ids.push(pool.load_texture(&mut device, &texture, &format!("t{i}")).unwrap());
            assert_dense(&pool);
        }
        for id in [ids[2], TextureId(0), ids[5], ids[0]] {
            pool.destroy_texture(&mut device, id).unwrap();
            assert_dense(&pool);
        }
        assert_eq!(pool.texture_count(), 3);
    }

    #[test]
    fn test_destroying_default_compacts_remaining_slots() {
        let mut device = HeadlessDevice::new(2);
        let mut pool = pool(&mut device);
        let extra = pool
            .load_texture(&mut device, &TextureData::solid(1, 1, [0.2; 4]), "extra")
            .unwrap();
        assert_eq!(pool.texture_binding_slot(extra), 1);
        pool.destroy_texture(&mut device, TextureId(0)).unwrap();
        assert_eq!(pool.texture_binding_slot(extra), 0);
        // Stale lookups now resolve to the new slot-0 asset.
        assert_eq!(pool.get_texture(TextureId(0)).unwrap().id(), extra);
    }

    #[test]
    fn test_unknown_ids_fall_back_to_slot_zero() {
        let mut device = HeadlessDevice::new(2);
        let pool = pool(&mut device);
        assert_eq!(pool.get_texture(TextureId(99)).unwrap().id(), TextureId(0));
        assert_eq!(pool.get_mesh(MeshId(42)).unwrap().id(), MeshId(0));
        assert_eq!(pool.texture_binding_slot(TextureId(99)), 0);
    }

    #[test]
    fn test_destroy_quiesces_device() {
        let mut device = HeadlessDevice::new(2);
        let mut pool = pool(&mut device);
        let mesh = pool.load_mesh(&mut device, &MeshData::plane(1.0, 2), "plane").unwrap();
        let before = device.stats().wait_idle_calls;
        let structures = device.live_acceleration_structure_count();
        pool.destroy_mesh(&mut device, mesh).unwrap();
        assert_eq!(device.stats().wait_idle_calls, before + 1);
        assert_eq!(pool.mesh_count(), 1);
        // The structure outlives the destroy until every slot is rewritten.
        assert_eq!(device.live_acceleration_structure_count(), structures);
        for frame in [0, 1, 0] {
            pool.refresh_bindings(&mut device, frame).unwrap();
        }
        assert_eq!(device.live_acceleration_structure_count(), structures - 1);
    }

    #[test]
    fn test_destroyed_texture_outlives_frame_sets_that_reference_it() {
        let mut device = HeadlessDevice::new(2);
        let mut pool = pool(&mut device);
        let texture = TextureData::solid(1, 1, [0.3; 4]);
        pool.load_texture(&mut device, &texture, "a").unwrap();
        let b = pool.load_texture(&mut device, &texture, "b").unwrap();
        let b_image = pool.get_texture(b).unwrap().image();
        pool.refresh_bindings(&mut device, 0).unwrap();
        pool.refresh_bindings(&mut device, 1).unwrap();
        let images = device.live_image_count();

        pool.destroy_texture(&mut device, b).unwrap();
        pool.refresh_bindings(&mut device, 0).unwrap();
        assert_eq!(pool.texture_table().state(2), SlotState::Retiring { until: 5 });

        // Frame 1 has not been re-prepared: its set still names the image.
        let element = DescriptorResource::SampledImage(b_image, pool.sampler());
        assert_eq!(device.descriptor(pool.bindless_set(1), TEXTURE_BINDING, 2), Some(&element));
        assert_eq!(device.live_image_count(), images);

        let frame = device.begin_frame().unwrap();
        let rt = vk::PipelineBindPoint::RAY_TRACING_KHR;
        device.cmd_bind_descriptor_sets(frame.command_buffer, rt, PipelineLayoutHandle(0), 0, &[pool.bindless_set(1)]);
        assert_eq!(device.stats().stale_descriptor_binds, 0);

        pool.refresh_bindings(&mut device, 1).unwrap();
        assert_eq!(device.descriptor(pool.bindless_set(1), TEXTURE_BINDING, 2), None);
        assert_eq!(device.live_image_count(), images);

        pool.refresh_bindings(&mut device, 0).unwrap();
        assert_eq!(device.live_image_count(), images - 1);
        assert_eq!(pool.texture_table().state(2), SlotState::Free);
        device.cmd_bind_descriptor_sets(
            frame.command_buffer,
            rt,
            PipelineLayoutHandle(0),
            0,
            &[pool.bindless_set(0), pool.bindless_set(1)],
        );
        assert_eq!(device.stats().stale_descriptor_binds, 0);
        device.end_frame(frame).unwrap();
    }

    #[test]
    fn test_pool_destroy_releases_retiring_assets() {
        let mut device = HeadlessDevice::new(2);
        let mut pool = pool(&mut device);
        let mesh = pool.load_mesh(&mut device, &MeshData::plane(1.0, 1), "plane").unwrap();
        let texture = pool
            .load_texture(&mut device, &TextureData::solid(1, 1, [0.0; 4]), "black")
            .unwrap();
        pool.destroy_mesh(&mut device, mesh).unwrap();
        pool.destroy_texture(&mut device, texture).unwrap();
        assert_eq!(pool.mesh_table().pending_release(), 1);

        pool.destroy(&mut device);
        assert_eq!(device.live_object_count(), 0);
    }

    #[test]
    fn test_last_asset_cannot_be_destroyed() {
        let mut device = HeadlessDevice::new(2);
        let mut pool = pool(&mut device);
        assert!(matches!(
            pool.destroy_mesh(&mut device, MeshId(0)),
            Err(AssetError::LastAsset("mesh"))
        ));
        assert!(matches!(
            pool.destroy_texture(&mut device, TextureId(7)),
            Err(AssetError::UnknownTexture(TextureId(7)))
        ));
    }

    #[test]
    fn test_allocation_failure_is_surfaced_and_leaves_pool_unchanged() {
        let mut device = HeadlessDevice::new(2);
        let mut pool = pool(&mut device);
        let buffers = device.live_buffer_count();
        device.fail_next_allocation();
        let result = pool.load_mesh(&mut device, &MeshData::cube(), "doomed");
        assert!(matches!(result, Err(AssetError::ResourceCreation(DeviceError::OutOfMemory { .. }))));
        assert_eq!(pool.mesh_count(), 1);
        assert_eq!(device.live_buffer_count(), buffers);
        // The failed load did not consume an ID.
        assert_eq!(pool.load_mesh(&mut device, &MeshData::cube(), "ok").unwrap(), MeshId(1));
    }

    #[test]
    fn test_refresh_rewrites_only_after_structural_change() {
        let mut device = HeadlessDevice::new(2);
        let mut pool = pool(&mut device);
        pool.refresh_bindings(&mut device, 0).unwrap();
        let writes = device.stats().descriptor_writes;
        pool.refresh_bindings(&mut device, 0).unwrap();
        assert_eq!(device.stats().descriptor_writes, writes);

        let id = pool
            .load_texture(&mut device, &TextureData::solid(1, 1, [0.0; 4]), "new")
            .unwrap();
        pool.refresh_bindings(&mut device, 0).unwrap();
        assert_eq!(device.stats().descriptor_writes, writes + 1);
        let image = pool.get_texture(id).unwrap().image();
        assert_eq!(
            device.descriptor(pool.bindless_set(0), TEXTURE_BINDING, 1),
            Some(&DescriptorResource::SampledImage(image, pool.sampler()))
        );
    }

    #[test]
    fn test_refresh_of_pending_frame_is_rejected() {
        let mut device = HeadlessDevice::new(2);
        let mut pool = pool(&mut device);
        let frame = device.begin_frame().unwrap();
        device.end_frame(frame).unwrap();
        assert!(pool.refresh_bindings(&mut device, 0).is_err());
        assert!(pool.refresh_bindings(&mut device, 1).is_ok());
    }
}
