//! Scene graph: entities, camera, environment map and the top-level structure
//!
//! The per-frame protocol is
//!
//! 1. `device.begin_frame()`
//! 2. [`SceneGraph::update`] with the frame's delta time
//! 3. [`SceneGraph::sync`] with the frame's command buffer
//! 4. the renderer's raster and ray-trace passes
//! 5. `device.end_frame()`
//!
//! `update` prepares the current frame slot (descriptor rewrites included) and
//! must therefore run after `begin_frame` has retired that slot.

use std::collections::BTreeMap;

use ash::vk;

use crate::assets::{AssetError, AssetPool, AssetPoolConfig, MeshId, TextureId};
use crate::core::EngineConfig;
use crate::foundation::logging::{debug, info, warn};
use crate::foundation::math::{Mat4, Mat4Ext};
use crate::render::api::{
    AccelerationStructureHandle, CommandBufferHandle, DescriptorBinding, DescriptorResource, DescriptorSetHandle,
    DescriptorSetLayoutHandle, DescriptorWrite, DeviceError, PipelineLayoutHandle, RenderDevice, TlasInstance,
};
use crate::render::resources::{DynamicBuffer, PerFrame};

use super::acceleration::{TlasUpdate, TopLevelStructure};
use super::camera::Camera;
use super::entity::{entity_set_bindings, EntityId, EntityRecord};
use super::envmap::{envmap_set_bindings, EnvironmentMap};
use super::material::{EntityMetadata, Material};
use super::settings::{EnvMapSettings, SceneSettings};
use super::SceneError;

/// Scene behavior callback, run first in every [`SceneGraph::update`]
///
/// Entities are addressed by stable ID through the scene handle.
pub type UpdateHook = Box<dyn FnMut(&mut SceneGraph, f32)>;

/// Descriptor set layouts owned by the scene, used by the renderer's pipeline layouts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SceneLayouts {
    /// Set 0 of every pipeline: scene settings uniform
    pub scene: DescriptorSetLayoutHandle,
    /// Top-level structure plus per-instance metadata and materials
    pub acceleration: DescriptorSetLayoutHandle,
    /// Environment map settings and texture
    pub envmap: DescriptorSetLayoutHandle,
    /// Per-entity uniforms and textures
    pub entity: DescriptorSetLayoutHandle,
}

/// Flat collection of entities plus scene-wide state
pub struct SceneGraph {
    assets: AssetPool,
    layouts: SceneLayouts,
    camera: Camera,
    envmap: EnvironmentMap,
    entities: BTreeMap<EntityId, EntityRecord>,
    next_entity_id: u32,
    max_entities: u32,

    extent: vk::Extent2D,
    exposure: f32,
    gamma: f32,
    accumulated_samples: u32,
    frame_counter: u32,
    last_camera: Option<(Mat4, Mat4)>,

    settings_buffer: DynamicBuffer<SceneSettings>,
    instance_metadata: DynamicBuffer<EntityMetadata>,
    instance_materials: DynamicBuffer<Material>,
    scene_sets: PerFrame<DescriptorSetHandle>,
    acceleration_sets: PerFrame<DescriptorSetHandle>,
    bound_tlas: PerFrame<Option<AccelerationStructureHandle>>,
    tlas: TopLevelStructure,

    update_hook: Option<UpdateHook>,
}

impl SceneGraph {
    /// Create an empty scene with its asset pool.
    ///
    /// Failures here are startup failures; partially created objects are not
    /// released.
    pub fn new(device: &mut dyn RenderDevice, config: &EngineConfig) -> Result<Self, SceneError> {
        let frames = device.frames_in_flight();
        let assets = AssetPool::new(
            device,
            AssetPoolConfig {
                max_textures: config.max_textures,
                max_meshes: config.max_meshes,
            },
        )?;

        let all_stages = vk::ShaderStageFlags::VERTEX
            | vk::ShaderStageFlags::FRAGMENT
            | vk::ShaderStageFlags::RAYGEN_KHR
            | vk::ShaderStageFlags::MISS_KHR
            | vk::ShaderStageFlags::CLOSEST_HIT_KHR;
        let ray_stages = vk::ShaderStageFlags::RAYGEN_KHR | vk::ShaderStageFlags::CLOSEST_HIT_KHR;
        let layouts = SceneLayouts {
            scene: device.create_descriptor_set_layout(&[DescriptorBinding::single(
                0,
                vk::DescriptorType::UNIFORM_BUFFER,
                all_stages,
            )])?,
            acceleration: device.create_descriptor_set_layout(&[
                DescriptorBinding::single(0, vk::DescriptorType::ACCELERATION_STRUCTURE_KHR, ray_stages),
                DescriptorBinding::single(1, vk::DescriptorType::STORAGE_BUFFER, ray_stages),
                DescriptorBinding::single(2, vk::DescriptorType::STORAGE_BUFFER, ray_stages),
            ])?,
            envmap: device.create_descriptor_set_layout(&envmap_set_bindings())?,
            entity: device.create_descriptor_set_layout(&entity_set_bindings())?,
        };

        let settings_buffer = DynamicBuffer::<SceneSettings>::new(device, 1, vk::BufferUsageFlags::UNIFORM_BUFFER)?;
        let capacity = config.max_entities.max(1) as usize;
        let instance_metadata = DynamicBuffer::<EntityMetadata>::new(device, capacity, vk::BufferUsageFlags::STORAGE_BUFFER)?;
        let instance_materials = DynamicBuffer::<Material>::new(device, capacity, vk::BufferUsageFlags::STORAGE_BUFFER)?;

        let scene_sets = PerFrame::try_new(frames, |frame| {
            let set = device.allocate_descriptor_set(layouts.scene)?;
            device.write_descriptor_set(
                set,
                &[DescriptorWrite::new(0, DescriptorResource::UniformBuffer(settings_buffer.buffer(frame)))],
            )?;
            Ok::<_, DeviceError>(set)
        })?;
        let acceleration_sets = PerFrame::try_new(frames, |frame| {
            let set = device.allocate_descriptor_set(layouts.acceleration)?;
            device.write_descriptor_set(
                set,
                &[
                    DescriptorWrite::new(1, DescriptorResource::StorageBuffer(instance_metadata.buffer(frame))),
                    DescriptorWrite::new(2, DescriptorResource::StorageBuffer(instance_materials.buffer(frame))),
                ],
            )?;
            Ok::<_, DeviceError>(set)
        })?;

        let envmap = EnvironmentMap::new(device, layouts.envmap)?;
        info!(
            "[SCENE] Scene ready: {frames} frames in flight, up to {} entities",
            config.max_entities
        );

        Ok(Self {
            assets,
            layouts,
            camera: Camera::default(),
            envmap,
            entities: BTreeMap::new(),
            next_entity_id: 0,
            max_entities: config.max_entities,
            extent: vk::Extent2D {
                width: config.frame_width,
                height: config.frame_height,
            },
            exposure: 1.0,
            gamma: 2.2,
            accumulated_samples: 0,
            frame_counter: 0,
            last_camera: None,
            settings_buffer,
            instance_metadata,
            instance_materials,
            scene_sets,
            acceleration_sets,
            bound_tlas: PerFrame::new(frames, |_| None),
            tlas: TopLevelStructure::new(config.tlas_policy),
            update_hook: None,
        })
    }

    // ------------------------------------------------------------------
    // Entities

    /// Create an entity with the default mesh, textures and material.
    ///
    /// IDs start at 0 and strictly increase; destroyed IDs are not reused.
    pub fn create_entity(&mut self, device: &mut dyn RenderDevice) -> Result<EntityId, SceneError> {
        if self.entities.len() >= self.max_entities as usize {
            return Err(SceneError::CapacityExceeded {
                capacity: self.max_entities,
            });
        }
        let id = EntityId(self.next_entity_id);
        let entity = EntityRecord::new(device, self.layouts.entity, id)?;
        self.next_entity_id += 1;
        self.entities.insert(id, entity);
        Ok(id)
    }

    /// Destroy an entity; quiesces the device because in-flight frames may
    /// still bind its descriptor sets.
    pub fn destroy_entity(&mut self, device: &mut dyn RenderDevice, id: EntityId) -> Result<(), SceneError> {
        if !self.entities.contains_key(&id) {
            return Err(SceneError::EntityNotFound(id));
        }
        device.wait_idle()?;
        if let Some(entity) = self.entities.remove(&id) {
            entity.destroy(device);
        }
        Ok(())
    }

    /// Entity by ID
    pub fn entity(&self, id: EntityId) -> Result<&EntityRecord, SceneError> {
        self.entities.get(&id).ok_or(SceneError::EntityNotFound(id))
    }

    fn entity_mut(&mut self, id: EntityId) -> Result<&mut EntityRecord, SceneError> {
        self.entities.get_mut(&id).ok_or(SceneError::EntityNotFound(id))
    }

    /// Live entity IDs in ascending order
    pub fn entity_ids(&self) -> Vec<EntityId> {
        self.entities.keys().copied().collect()
    }

    /// Number of live entities
    pub fn entity_count(&self) -> usize {
        self.entities.len()
    }

    /// Set an entity's object-to-world transform
    pub fn set_entity_transform(&mut self, id: EntityId, transform: Mat4) -> Result<(), SceneError> {
        self.entity_mut(id)?.set_transform(transform);
        Ok(())
    }

    /// Object-to-world transform of an entity
    pub fn get_entity_transform(&self, id: EntityId) -> Result<Mat4, SceneError> {
        Ok(self.entity(id)?.transform())
    }

    /// Set an entity's material
    pub fn set_entity_material(&mut self, id: EntityId, material: Material) -> Result<(), SceneError> {
        self.entity_mut(id)?.set_material(material);
        Ok(())
    }

    /// Material of an entity
    pub fn get_entity_material(&self, id: EntityId) -> Result<Material, SceneError> {
        Ok(self.entity(id)?.material())
    }

    /// Edit an entity's material in place
    pub fn modify_entity_material(
        &mut self,
        id: EntityId,
        edit: impl FnOnce(&mut Material),
    ) -> Result<(), SceneError> {
        edit(self.entity_mut(id)?.material_mut());
        Ok(())
    }

    /// Point an entity at a mesh. Unknown mesh IDs resolve to the fallback
    /// mesh when the instance list is built.
    pub fn set_entity_mesh(&mut self, id: EntityId, mesh: MeshId) -> Result<(), SceneError> {
        if !self.assets.contains_mesh(mesh) {
            warn!("[SCENE] {id} set to unknown {mesh}");
        }
        self.entity_mut(id)?.set_mesh(mesh);
        Ok(())
    }

    /// Mesh of an entity
    pub fn get_entity_mesh(&self, id: EntityId) -> Result<MeshId, SceneError> {
        Ok(self.entity(id)?.mesh())
    }

    /// Set the albedo texture; the descriptor of each frame slot is rewritten
    /// when that slot is next prepared.
    pub fn set_entity_albedo_texture(&mut self, id: EntityId, texture: TextureId) -> Result<(), SceneError> {
        self.entity_mut(id)?.set_albedo_texture(texture);
        Ok(())
    }

    /// Set the albedo detail texture
    pub fn set_entity_albedo_detail_texture(&mut self, id: EntityId, texture: TextureId) -> Result<(), SceneError> {
        self.entity_mut(id)?.set_albedo_detail_texture(texture);
        Ok(())
    }

    /// Set both textures at once
    pub fn set_entity_textures(
        &mut self,
        id: EntityId,
        albedo: TextureId,
        detail: TextureId,
    ) -> Result<(), SceneError> {
        let entity = self.entity_mut(id)?;
        entity.set_albedo_texture(albedo);
        entity.set_albedo_detail_texture(detail);
        Ok(())
    }

    /// Albedo and detail textures of an entity
    pub fn get_entity_textures(&self, id: EntityId) -> Result<(TextureId, TextureId), SceneError> {
        Ok(self.entity(id)?.textures())
    }

    // ------------------------------------------------------------------
    // Assets

    /// Asset pool
    pub fn assets(&self) -> &AssetPool {
        &self.assets
    }

    /// Mutable asset pool (loading)
    pub fn assets_mut(&mut self) -> &mut AssetPool {
        &mut self.assets
    }

    /// Destroy a texture; entities and the environment map referencing it fall
    /// back to the slot-0 texture.
    pub fn destroy_texture(&mut self, device: &mut dyn RenderDevice, id: TextureId) -> Result<(), SceneError> {
        self.assets.destroy_texture(device, id)?;
        Ok(())
    }

    /// Destroy a mesh and schedule a top-level rebuild, since bottom-level
    /// references held by the current structure are gone.
    pub fn destroy_mesh(&mut self, device: &mut dyn RenderDevice, id: MeshId) -> Result<(), SceneError> {
        self.assets.destroy_mesh(device, id)?;
        self.tlas.invalidate();
        Ok(())
    }

    // ------------------------------------------------------------------
    // Camera, environment and frame settings

    /// Camera
    pub fn camera(&self) -> &Camera {
        &self.camera
    }

    /// Mutable camera
    pub fn camera_mut(&mut self) -> &mut Camera {
        &mut self.camera
    }

    /// Environment map
    pub fn envmap(&self) -> &EnvironmentMap {
        &self.envmap
    }

    /// Replace the environment map settings
    pub fn set_envmap_settings(&mut self, settings: EnvMapSettings) {
        *self.envmap.settings_mut() = settings;
    }

    /// Change the environment map texture; rebinding is deferred per frame slot
    pub fn set_envmap_texture(&mut self, texture: TextureId) {
        self.envmap.set_texture(texture);
        self.reset_accumulation();
    }

    /// Output size used for the projection aspect ratio
    pub fn set_output_extent(&mut self, width: u32, height: u32) {
        self.extent = vk::Extent2D {
            width: width.max(1),
            height: height.max(1),
        };
    }

    /// Output size
    pub fn output_extent(&self) -> vk::Extent2D {
        self.extent
    }

    /// Set exposure and gamma
    pub fn set_tone_mapping(&mut self, exposure: f32, gamma: f32) {
        self.exposure = exposure;
        self.gamma = gamma;
    }

    /// Restart ray-tracing accumulation on the next frame
    pub fn reset_accumulation(&mut self) {
        self.accumulated_samples = 0;
        self.last_camera = None;
    }

    /// Scene settings staged by the last update
    pub fn scene_settings(&self) -> SceneSettings {
        *self.settings_buffer.at(0)
    }

    /// Install the scene behavior hook
    pub fn set_update_hook(&mut self, hook: impl FnMut(&mut SceneGraph, f32) + 'static) {
        self.update_hook = Some(Box::new(hook));
    }

    /// Remove the scene behavior hook
    pub fn clear_update_hook(&mut self) {
        self.update_hook = None;
    }

    /// Top-level structure state
    pub fn tlas(&self) -> &TopLevelStructure {
        &self.tlas
    }

    /// Layouts for pipeline creation
    pub fn layouts(&self) -> SceneLayouts {
        self.layouts
    }

    /// Scene settings set of `frame`
    pub fn scene_set(&self, frame: usize) -> DescriptorSetHandle {
        *self.scene_sets.get(frame)
    }

    /// Acceleration-structure set of `frame`
    pub fn acceleration_set(&self, frame: usize) -> DescriptorSetHandle {
        *self.acceleration_sets.get(frame)
    }

    // ------------------------------------------------------------------
    // Frame protocol

    /// Advance the scene by `delta_time` seconds and prepare the current
    /// frame slot.
    ///
    /// Runs, in order: the update hook, the camera uniform, per-entity
    /// staging, the instance list, the rebuild-or-refit decision, and the
    /// binding refresh of the current slot.
    pub fn update(&mut self, device: &mut dyn RenderDevice, delta_time: f32) -> Result<(), SceneError> {
        if let Some(mut hook) = self.update_hook.take() {
            hook(self, delta_time);
            // The hook may have installed a replacement.
            if self.update_hook.is_none() {
                self.update_hook = Some(hook);
            }
        }

        self.update_scene_settings();

        self.envmap.update();
        for (index, entity) in self.entities.values_mut().enumerate() {
            let metadata = entity.update(&self.assets);
            *self.instance_metadata.at_mut(index) = metadata;
            *self.instance_materials.at_mut(index) = entity.material();
        }

        let mut instances = Vec::with_capacity(self.entities.len());
        let mut composition = Vec::with_capacity(self.entities.len());
        for (index, entity) in self.entities.values().enumerate() {
            let mesh = self
                .assets
                .get_mesh(entity.mesh())
                .ok_or(AssetError::UnknownMesh(entity.mesh()))?;
            instances.push(TlasInstance {
                blas: mesh.blas(),
                transform: entity.transform().to_rows_3x4(),
                custom_index: index as u32,
                mask: 0xFF,
            });
            composition.push((entity.id(), mesh.blas()));
        }

        if self.tlas.update(device, instances, composition)? == TlasUpdate::Rebuilt {
            self.accumulated_samples = 0;
            self.settings_buffer.at_mut(0).accumulated_samples = 0;
        }

        let frame = device.current_frame();
        self.assets.refresh_bindings(device, frame)?;
        self.envmap.prepare_bindings(device, &self.assets, frame)?;
        for entity in self.entities.values_mut() {
            entity.prepare_bindings(device, &self.assets, frame)?;
        }
        if let Some(tlas) = self.tlas.handle() {
            if *self.bound_tlas.get(frame) != Some(tlas) {
                device.write_descriptor_set(
                    *self.acceleration_sets.get(frame),
                    &[DescriptorWrite::new(0, DescriptorResource::AccelerationStructure(tlas))],
                )?;
                *self.bound_tlas.get_mut(frame) = Some(tlas);
            }
        }
        Ok(())
    }

    fn update_scene_settings(&mut self) {
        let aspect = self.extent.width as f32 / self.extent.height.max(1) as f32;
        let view = self.camera.view();
        let projection = self.camera.projection(aspect);

        if self.last_camera == Some((view, projection)) {
            self.accumulated_samples = self.accumulated_samples.saturating_add(1);
        } else {
            self.accumulated_samples = 0;
            self.last_camera = Some((view, projection));
        }
        self.frame_counter = self.frame_counter.wrapping_add(1);

        *self.settings_buffer.at_mut(0) = SceneSettings {
            view: view.to_cols_array(),
            inv_view: self.camera.inverse_view().to_cols_array(),
            projection: projection.to_cols_array(),
            inv_projection: projection.try_inverse().unwrap_or_else(Mat4::identity).to_cols_array(),
            exposure: self.exposure,
            gamma: self.gamma,
            accumulated_samples: self.accumulated_samples,
            seed: self.frame_counter.wrapping_mul(0x9E37_79B9),
        };
    }

    /// Record the staged refit and upload every staged uniform into `frame`'s
    /// buffers. Call after [`update`](Self::update), before any pass of `frame`.
    pub fn sync(
        &mut self,
        device: &mut dyn RenderDevice,
        cmd: CommandBufferHandle,
        frame: usize,
    ) -> Result<(), SceneError> {
        self.tlas.record_refit(device, cmd)?;
        self.settings_buffer.sync(device, cmd, frame)?;
        self.envmap.sync(device, cmd, frame)?;
        let live = self.entities.len();
        self.instance_metadata.sync_prefix(device, cmd, frame, live)?;
        self.instance_materials.sync_prefix(device, cmd, frame, live)?;
        for entity in self.entities.values() {
            entity.sync(device, cmd, frame)?;
        }
        Ok(())
    }

    /// Draw the environment backdrop as a full-screen pair of triangles
    pub fn draw_envmap(
        &self,
        device: &mut dyn RenderDevice,
        cmd: CommandBufferHandle,
        layout: PipelineLayoutHandle,
        frame: usize,
    ) {
        device.cmd_bind_descriptor_sets(
            cmd,
            vk::PipelineBindPoint::GRAPHICS,
            layout,
            1,
            &[self.envmap.descriptor_set(frame)],
        );
        device.cmd_draw(cmd, 6, 1);
    }

    /// Draw every entity twice: instance 0 writes the picking target,
    /// instance 1 the shaded targets.
    pub fn draw_entities(
        &self,
        device: &mut dyn RenderDevice,
        cmd: CommandBufferHandle,
        layout: PipelineLayoutHandle,
        frame: usize,
    ) -> Result<(), SceneError> {
        for entity in self.entities.values() {
            let mesh = self
                .assets
                .get_mesh(entity.mesh())
                .ok_or(AssetError::UnknownMesh(entity.mesh()))?;
            device.cmd_bind_descriptor_sets(
                cmd,
                vk::PipelineBindPoint::GRAPHICS,
                layout,
                1,
                &[entity.descriptor_set(frame)],
            );
            device.cmd_bind_vertex_buffer(cmd, mesh.vertex_buffer());
            device.cmd_bind_index_buffer(cmd, mesh.index_buffer());
            device.cmd_draw_indexed(cmd, mesh.index_count(), 2);
        }
        Ok(())
    }

    /// Release everything the scene owns
    pub fn destroy(mut self, device: &mut dyn RenderDevice) -> Result<(), SceneError> {
        device.wait_idle()?;
        for (_, entity) in std::mem::take(&mut self.entities) {
            entity.destroy(device);
        }
        self.tlas.destroy(device);
        for &set in self.scene_sets.iter().chain(self.acceleration_sets.iter()) {
            device.free_descriptor_set(set);
        }
        self.envmap.destroy(device);
        self.settings_buffer.destroy(device);
        self.instance_metadata.destroy(device);
        self.instance_materials.destroy(device);
        for layout in [
            self.layouts.scene,
            self.layouts.acceleration,
            self.layouts.envmap,
            self.layouts.entity,
        ] {
            device.destroy_descriptor_set_layout(layout);
        }
        self.assets.destroy(device);
        debug!("[SCENE] Scene destroyed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assets::TextureData;
    use crate::foundation::math::Vec3;
    use crate::render::backends::headless::{HeadlessDevice, RecordedCommand};

    fn setup() -> (HeadlessDevice, SceneGraph) {
        let mut device = HeadlessDevice::new(2);
        let config = EngineConfig {
            max_entities: 16,
            ..EngineConfig::headless(64, 48)
        };
        let scene = SceneGraph::new(&mut device, &config).unwrap();
        (device, scene)
    }

    fn run_frame(device: &mut HeadlessDevice, scene: &mut SceneGraph, dt: f32) {
        let frame = device.begin_frame().unwrap();
        scene.update(device, dt).unwrap();
        scene.sync(device, frame.command_buffer, frame.frame_index).unwrap();
        device.end_frame(frame).unwrap();
    }

    #[test]
    fn test_entity_ids_start_at_zero_and_increase() {
        let (mut device, mut scene) = setup();
        let a = scene.create_entity(&mut device).unwrap();
        let b = scene.create_entity(&mut device).unwrap();
        assert_eq!(a, EntityId(0));
        assert_eq!(b, EntityId(1));
        scene.destroy_entity(&mut device, b).unwrap();
        assert_eq!(scene.create_entity(&mut device).unwrap(), EntityId(2));
    }

    #[test]
    fn test_unknown_entity_is_not_found() {
        let (mut device, mut scene) = setup();
        let id = scene.create_entity(&mut device).unwrap();
        scene.destroy_entity(&mut device, id).unwrap();
        for missing in [id, EntityId(99)] {
            assert!(matches!(
                scene.set_entity_transform(missing, Mat4::identity()),
                Err(SceneError::EntityNotFound(_))
            ));
            assert!(matches!(scene.get_entity_material(missing), Err(SceneError::EntityNotFound(_))));
            assert!(matches!(
                scene.set_entity_mesh(missing, MeshId(0)),
                Err(SceneError::EntityNotFound(_))
            ));
        }
        assert!(matches!(
            scene.destroy_entity(&mut device, id),
            Err(SceneError::EntityNotFound(_))
        ));
    }

    #[test]
    fn test_transform_round_trip_is_exact() {
        let (mut device, mut scene) = setup();
        let id = scene.create_entity(&mut device).unwrap();
        let transform = Mat4::new_translation(&Vec3::new(0.1, -7.25, 1e-7)) * Mat4::rotation_y(0.37);
        scene.set_entity_transform(id, transform).unwrap();
        assert_eq!(scene.get_entity_transform(id).unwrap(), transform);
    }

    #[test]
    fn test_capacity_is_enforced() {
        let mut device = HeadlessDevice::new(2);
        let config = EngineConfig {
            max_entities: 2,
            ..EngineConfig::headless(8, 8)
        };
        let mut scene = SceneGraph::new(&mut device, &config).unwrap();
        scene.create_entity(&mut device).unwrap();
        scene.create_entity(&mut device).unwrap();
        assert!(matches!(
            scene.create_entity(&mut device),
            Err(SceneError::CapacityExceeded { capacity: 2 })
        ));
    }

    #[test]
    fn test_rebuild_iff_entity_count_changed() {
        let (mut device, mut scene) = setup();
        scene.create_entity(&mut device).unwrap();
        run_frame(&mut device, &mut scene, 0.016);
        assert_eq!(scene.tlas().last_update(), Some(TlasUpdate::Rebuilt));

        let id = scene.create_entity(&mut device).unwrap();
        scene
            .set_entity_transform(id, Mat4::new_translation(&Vec3::new(2.0, 0.0, 0.0)))
            .unwrap();
        run_frame(&mut device, &mut scene, 0.016);
        assert_eq!(scene.tlas().last_update(), Some(TlasUpdate::Rebuilt));

        scene
            .set_entity_transform(id, Mat4::new_translation(&Vec3::new(3.0, 0.0, 0.0)))
            .unwrap();
        let builds = device.stats().tlas_builds;
        run_frame(&mut device, &mut scene, 0.016);
        assert_eq!(scene.tlas().last_update(), Some(TlasUpdate::RefitStaged));
        assert_eq!(device.stats().tlas_builds, builds);
        assert_eq!(device.stats().tlas_refits, 1);
        assert_eq!(scene.tlas().instance_count(), 2);
    }

    #[test]
    fn test_instance_count_matches_live_entities() {
        let (mut device, mut scene) = setup();
        let ids: Vec<_> = (0..4).map(|_| scene.create_entity(&mut device).unwrap()).collect();
        run_frame(&mut device, &mut scene, 0.016);
        scene.destroy_entity(&mut device, ids[1]).unwrap();
        run_frame(&mut device, &mut scene, 0.016);

        let tlas = scene.tlas().handle().unwrap();
        assert_eq!(device.tlas_instances(tlas).unwrap().len(), 3);
        assert_eq!(scene.tlas().instance_count(), scene.entity_count());
    }

    #[test]
    fn test_hook_mutates_entities_by_id() {
        let (mut device, mut scene) = setup();
        let id = scene.create_entity(&mut device).unwrap();
        scene.set_update_hook(move |scene, dt| {
            let _ = scene.modify_entity_material(id, |m| m.detail_scale_offset[2] += dt);
        });
        run_frame(&mut device, &mut scene, 0.5);
        run_frame(&mut device, &mut scene, 0.25);
        assert_eq!(scene.get_entity_material(id).unwrap().detail_scale_offset[2], 0.75);

        // A hook referencing a destroyed entity keeps running harmlessly.
        scene.destroy_entity(&mut device, id).unwrap();
        run_frame(&mut device, &mut scene, 0.25);
    }

    #[test]
    fn test_texture_change_rebinds_each_slot_when_prepared() {
        let (mut device, mut scene) = setup();
        let id = scene.create_entity(&mut device).unwrap();
        run_frame(&mut device, &mut scene, 0.016);
        run_frame(&mut device, &mut scene, 0.016);

        let texture = scene
            .assets_mut()
            .load_texture(&mut device, &TextureData::solid(2, 2, [0.0, 0.5, 1.0, 1.0]), "blue")
            .unwrap();
        scene.set_entity_albedo_texture(id, texture).unwrap();
        let image = scene.assets().get_texture(texture).unwrap().image();
        let entity_set = |scene: &SceneGraph, frame| scene.entity(id).unwrap().descriptor_set(frame);

        run_frame(&mut device, &mut scene, 0.016);
        let sampler = scene.assets().sampler();
        assert_eq!(
            device.descriptor(entity_set(&scene, 0), 2, 0),
            Some(&DescriptorResource::SampledImage(image, sampler))
        );
        // Slot 1 is untouched until it is prepared.
        assert_ne!(
            device.descriptor(entity_set(&scene, 1), 2, 0),
            Some(&DescriptorResource::SampledImage(image, sampler))
        );
        run_frame(&mut device, &mut scene, 0.016);
        assert_eq!(
            device.descriptor(entity_set(&scene, 1), 2, 0),
            Some(&DescriptorResource::SampledImage(image, sampler))
        );
    }

    #[test]
    fn test_destroyed_texture_falls_back_without_stale_binds() {
        let (mut device, mut scene) = setup();
        let id = scene.create_entity(&mut device).unwrap();
        let texture = scene
            .assets_mut()
            .load_texture(&mut device, &TextureData::solid(1, 1, [1.0, 0.0, 0.0, 1.0]), "red")
            .unwrap();
        scene.set_entity_textures(id, texture, texture).unwrap();
        run_frame(&mut device, &mut scene, 0.016);
        run_frame(&mut device, &mut scene, 0.016);

        scene.destroy_texture(&mut device, texture).unwrap();
        run_frame(&mut device, &mut scene, 0.016);
        run_frame(&mut device, &mut scene, 0.016);

        let fallback = scene.assets().get_texture(TextureId(0)).unwrap().image();
        let set = scene.entity(id).unwrap().descriptor_set(0);
        assert_eq!(
            device.descriptor(set, 2, 0),
            Some(&DescriptorResource::SampledImage(fallback, scene.assets().sampler()))
        );
    }

    #[test]
    fn test_destroying_mesh_forces_rebuild() {
        let (mut device, mut scene) = setup();
        let mesh = scene
            .assets_mut()
            .load_mesh(&mut device, &crate::assets::MeshData::plane(2.0, 2), "plane")
            .unwrap();
        let id = scene.create_entity(&mut device).unwrap();
        scene.set_entity_mesh(id, mesh).unwrap();
        run_frame(&mut device, &mut scene, 0.016);

        scene.destroy_mesh(&mut device, mesh).unwrap();
        run_frame(&mut device, &mut scene, 0.016);
        assert_eq!(scene.tlas().last_update(), Some(TlasUpdate::Rebuilt));
        let tlas = scene.tlas().handle().unwrap();
        let cube = scene.assets().get_mesh(MeshId(0)).unwrap().blas();
        assert_eq!(device.tlas_instances(tlas).unwrap()[0].blas, cube);
    }

    #[test]
    fn test_same_count_swap_refits_against_new_mesh() {
        let (mut device, mut scene) = setup();
        let plane = scene
            .assets_mut()
            .load_mesh(&mut device, &crate::assets::MeshData::plane(2.0, 2), "plane")
            .unwrap();
        let cube_entity = scene.create_entity(&mut device).unwrap();
        run_frame(&mut device, &mut scene, 0.016);
        assert_eq!(scene.tlas().last_update(), Some(TlasUpdate::Rebuilt));
        let builds = device.stats().tlas_builds;

        scene.destroy_entity(&mut device, cube_entity).unwrap();
        let plane_entity = scene.create_entity(&mut device).unwrap();
        scene.set_entity_mesh(plane_entity, plane).unwrap();
        run_frame(&mut device, &mut scene, 0.016);

        assert_eq!(scene.tlas().last_update(), Some(TlasUpdate::RefitStaged));
        assert_eq!(device.stats().tlas_builds, builds);
        let tlas = scene.tlas().handle().unwrap();
        let instances = device.tlas_instances(tlas).unwrap();
        assert_eq!(instances.len(), 1);
        assert_eq!(instances[0].blas, scene.assets().get_mesh(plane).unwrap().blas());
    }

    #[test]
    fn test_sync_uploads_only_live_instances() {
        let (mut device, mut scene) = setup();
        for _ in 0..3 {
            scene.create_entity(&mut device).unwrap();
        }
        run_frame(&mut device, &mut scene, 0.016);

        let copies: Vec<u64> = device
            .last_submitted_commands()
            .iter()
            .filter_map(|command| match command {
                RecordedCommand::CopyBuffer { size, .. } => Some(*size),
                _ => None,
            })
            .collect();
        let metadata = std::mem::size_of::<EntityMetadata>() as u64;
        let material = std::mem::size_of::<Material>() as u64;
        assert!(copies.contains(&(3 * metadata)));
        assert!(copies.contains(&(3 * material)));
        assert!(!copies.contains(&(16 * metadata)));
        assert!(!copies.contains(&(16 * material)));
    }

    #[test]
    fn test_accumulation_restarts_when_camera_moves() {
        let (mut device, mut scene) = setup();
        run_frame(&mut device, &mut scene, 0.016);
        run_frame(&mut device, &mut scene, 0.016);
        run_frame(&mut device, &mut scene, 0.016);
        assert_eq!(scene.scene_settings().accumulated_samples, 2);

        scene.camera_mut().set_position(Vec3::new(0.0, 1.0, 0.0));
        run_frame(&mut device, &mut scene, 0.016);
        assert_eq!(scene.scene_settings().accumulated_samples, 0);
    }

    #[test]
    fn test_update_before_begin_frame_on_pending_slot_is_rejected() {
        let (mut device, mut scene) = setup();
        run_frame(&mut device, &mut scene, 0.016);
        run_frame(&mut device, &mut scene, 0.016);
        // Slot 0 was submitted and begin_frame has not retired it yet.
        assert!(scene.update(&mut device, 0.016).is_err());
    }
}
