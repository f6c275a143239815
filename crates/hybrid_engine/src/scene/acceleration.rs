//! Top-level acceleration structure upkeep
//!
//! One top-level structure aggregates every live entity's (bottom-level
//! structure, transform) pair. When the instance count changes the structure
//! is rebuilt synchronously behind a device-idle wait, because its backing
//! allocation is sized by the count. Otherwise a refit is staged and recorded
//! into the frame's command buffer by `record_refit`, which never blocks.
//!
//! A refit always carries the complete instance list, bottom-level references
//! included, so a same-count change of composition is refitted against the
//! current references. `TlasPolicy::Composition` rebuilds in that case instead.

use crate::core::TlasPolicy;
use crate::foundation::logging::{debug, info};
use crate::render::api::{AccelerationStructureHandle, CommandBufferHandle, DeviceResult, RenderDevice, TlasInstance};

use super::entity::EntityId;

/// What the last `update` did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlasUpdate {
    /// Full synchronous rebuild
    Rebuilt,
    /// Refit staged for the next recorded frame
    RefitStaged,
}

/// Owner of the scene's top-level structure
pub struct TopLevelStructure {
    policy: TlasPolicy,
    handle: Option<AccelerationStructureHandle>,
    built_count: Option<usize>,
    composition: Vec<(EntityId, AccelerationStructureHandle)>,
    force_rebuild: bool,
    pending_refit: Option<Vec<TlasInstance>>,
    rebuilds: u64,
    refits: u64,
    last_update: Option<TlasUpdate>,
}

impl TopLevelStructure {
    /// Empty manager; the first `update` builds
    pub fn new(policy: TlasPolicy) -> Self {
        Self {
            policy,
            handle: None,
            built_count: None,
            composition: Vec::new(),
            force_rebuild: false,
            pending_refit: None,
            rebuilds: 0,
            refits: 0,
            last_update: None,
        }
    }

    /// Current structure, once built
    pub fn handle(&self) -> Option<AccelerationStructureHandle> {
        self.handle
    }

    /// Instance count of the current structure
    pub fn instance_count(&self) -> usize {
        self.built_count.unwrap_or(0)
    }

    /// Full rebuilds so far
    pub fn rebuilds(&self) -> u64 {
        self.rebuilds
    }

    /// Refits staged so far
    pub fn refits(&self) -> u64 {
        self.refits
    }

    /// Outcome of the most recent `update`
    pub fn last_update(&self) -> Option<TlasUpdate> {
        self.last_update
    }

    /// Whether a refit waits to be recorded
    pub fn has_pending_refit(&self) -> bool {
        self.pending_refit.is_some()
    }

    /// Force the next `update` to rebuild (bottom-level structures went away)
    pub fn invalidate(&mut self) {
        self.force_rebuild = true;
    }

    /// Bring the structure in line with `instances`.
    ///
    /// `composition` pairs each instance with its entity and is only consulted
    /// under [`TlasPolicy::Composition`].
    pub fn update(
        &mut self,
        device: &mut dyn RenderDevice,
        instances: Vec<TlasInstance>,
        composition: Vec<(EntityId, AccelerationStructureHandle)>,
    ) -> DeviceResult<TlasUpdate> {
        let count_changed = self.built_count != Some(instances.len());
        let composition_changed = self.policy == TlasPolicy::Composition && composition != self.composition;

        let outcome = if self.handle.is_none() || count_changed || composition_changed || self.force_rebuild {
            // The structure may be in use by frames in flight.
            device.wait_idle()?;
            let handle = device.build_tlas(&instances)?;
            if let Some(old) = self.handle.replace(handle) {
                device.destroy_acceleration_structure(old);
            }
            info!(
                "[TLAS] Rebuilt with {} instances (was {:?})",
                instances.len(),
                self.built_count
            );
            self.built_count = Some(instances.len());
            self.pending_refit = None;
            self.force_rebuild = false;
            self.rebuilds += 1;
            TlasUpdate::Rebuilt
        } else {
            self.pending_refit = Some(instances);
            self.refits += 1;
            TlasUpdate::RefitStaged
        };
        self.composition = composition;
        self.last_update = Some(outcome);
        Ok(outcome)
    }

    /// Record the staged refit, if any, into `cmd`
    pub fn record_refit(&mut self, device: &mut dyn RenderDevice, cmd: CommandBufferHandle) -> DeviceResult<()> {
        let (Some(handle), Some(instances)) = (self.handle, self.pending_refit.take()) else {
            return Ok(());
        };
        device.cmd_refit_tlas(cmd, handle, &instances)?;
        debug!("[TLAS] Refit recorded with {} instances", instances.len());
        Ok(())
    }

    /// Destroy the structure
    pub fn destroy(&mut self, device: &mut dyn RenderDevice) {
        if let Some(handle) = self.handle.take() {
            device.destroy_acceleration_structure(handle);
        }
        self.built_count = None;
        self.pending_refit = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::api::{BlasDesc, BufferDesc};
    use crate::render::backends::headless::HeadlessDevice;

    fn blas(device: &mut HeadlessDevice) -> AccelerationStructureHandle {
        let vertices = device.create_buffer(&BufferDesc::staging(36)).unwrap();
        let indices = device.create_buffer(&BufferDesc::staging(12)).unwrap();
        device
            .create_blas(&BlasDesc {
                vertex_buffer: vertices,
                vertex_count: 3,
                vertex_stride: 12,
                index_buffer: indices,
                index_count: 3,
            })
            .unwrap()
    }

    fn instances(blas: AccelerationStructureHandle, count: usize) -> (Vec<TlasInstance>, Vec<(EntityId, AccelerationStructureHandle)>) {
        let instances = (0..count)
            .map(|i| TlasInstance {
                blas,
                transform: [1.0, 0.0, 0.0, i as f32, 0.0, 1.0, 0.0, 0.0, 0.0, 0.0, 1.0, 0.0],
                custom_index: i as u32,
                mask: 0xFF,
            })
            .collect();
        let composition = (0..count).map(|i| (EntityId(i as u32), blas)).collect();
        (instances, composition)
    }

    #[test]
    fn test_rebuild_only_when_count_changes() {
        let mut device = HeadlessDevice::new(2);
        let blas = blas(&mut device);
        let mut tlas = TopLevelStructure::new(TlasPolicy::Count);

        let (list, comp) = instances(blas, 2);
        assert_eq!(tlas.update(&mut device, list, comp).unwrap(), TlasUpdate::Rebuilt);
        let (list, comp) = instances(blas, 2);
        assert_eq!(tlas.update(&mut device, list, comp).unwrap(), TlasUpdate::RefitStaged);
        let (list, comp) = instances(blas, 3);
        assert_eq!(tlas.update(&mut device, list, comp).unwrap(), TlasUpdate::Rebuilt);

        assert_eq!(tlas.rebuilds(), 2);
        assert_eq!(tlas.instance_count(), 3);
        assert_eq!(device.stats().tlas_builds, 2);
        assert_eq!(device.stats().wait_idle_calls, 2);
    }

    #[test]
    fn test_rebuild_releases_previous_structure() {
        let mut device = HeadlessDevice::new(2);
        let blas = blas(&mut device);
        let mut tlas = TopLevelStructure::new(TlasPolicy::Count);
        let (list, comp) = instances(blas, 1);
        tlas.update(&mut device, list, comp).unwrap();
        let live = device.live_acceleration_structure_count();
        let (list, comp) = instances(blas, 4);
        tlas.update(&mut device, list, comp).unwrap();
        assert_eq!(device.live_acceleration_structure_count(), live);
    }

    #[test]
    fn test_refit_is_recorded_once() {
        let mut device = HeadlessDevice::new(2);
        let blas = blas(&mut device);
        let mut tlas = TopLevelStructure::new(TlasPolicy::Count);
        let (list, comp) = instances(blas, 2);
        tlas.update(&mut device, list, comp).unwrap();
        let (list, comp) = instances(blas, 2);
        tlas.update(&mut device, list, comp).unwrap();

        let frame = device.begin_frame().unwrap();
        tlas.record_refit(&mut device, frame.command_buffer).unwrap();
        tlas.record_refit(&mut device, frame.command_buffer).unwrap();
        device.end_frame(frame).unwrap();

        assert_eq!(device.stats().tlas_refits, 1);
        assert!(!tlas.has_pending_refit());
    }

    #[test]
    fn test_composition_policy_rebuilds_on_same_count_swap() {
        let mut device = HeadlessDevice::new(2);
        let blas = blas(&mut device);
        let mut tlas = TopLevelStructure::new(TlasPolicy::Composition);
        let (list, comp) = instances(blas, 2);
        tlas.update(&mut device, list, comp).unwrap();

        let (list, mut comp) = instances(blas, 2);
        comp[1].0 = EntityId(7);
        assert_eq!(tlas.update(&mut device, list, comp).unwrap(), TlasUpdate::Rebuilt);
    }

    #[test]
    fn test_invalidate_forces_rebuild() {
        let mut device = HeadlessDevice::new(2);
        let blas = blas(&mut device);
        let mut tlas = TopLevelStructure::new(TlasPolicy::Count);
        let (list, comp) = instances(blas, 1);
        tlas.update(&mut device, list, comp).unwrap();
        tlas.invalidate();
        let (list, comp) = instances(blas, 1);
        assert_eq!(tlas.update(&mut device, list, comp).unwrap(), TlasUpdate::Rebuilt);
    }
}
