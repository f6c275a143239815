//! Per-entity shading parameters and GPU metadata

use bytemuck::{Pod, Zeroable};

use crate::foundation::math::{Mat4, Mat4Ext};

/// Shading parameters of one entity, uploaded as a uniform
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct Material {
    /// Texture-space model matrix, column-major
    pub model: [[f32; 4]; 4],
    /// Detail texture scale (xy) and offset (zw)
    pub detail_scale_offset: [f32; 4],
    /// Base color multiplier
    pub color: [f32; 4],
}

impl Default for Material {
    fn default() -> Self {
        Self {
            model: Mat4::identity().to_cols_array(),
            detail_scale_offset: [10.0, 10.0, 0.0, 0.0],
            color: [1.0; 4],
        }
    }
}

impl Material {
    /// Default material tinted with `color`
    pub fn with_color(color: [f32; 4]) -> Self {
        Self {
            color,
            ..Self::default()
        }
    }
}

/// Per-entity data read by the raster and ray-tracing shaders
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct EntityMetadata {
    /// Object-to-world transform, column-major
    pub transform: [[f32; 4]; 4],
    /// Stable entity ID, written into the picking target
    pub entity_id: u32,
    /// Binding slot of the albedo texture
    pub albedo_map_slot: u32,
    /// Binding slot of the albedo detail texture
    pub albedo_detail_map_slot: u32,
    /// Binding slot of the mesh
    pub mesh_slot: u32,
}

impl Default for EntityMetadata {
    fn default() -> Self {
        Self {
            transform: Mat4::identity().to_cols_array(),
            entity_id: 0,
            albedo_map_slot: 0,
            albedo_detail_map_slot: 0,
            mesh_slot: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gpu_layouts_are_std140_friendly() {
        assert_eq!(std::mem::size_of::<Material>(), 96);
        assert_eq!(std::mem::size_of::<EntityMetadata>(), 80);
    }

    #[test]
    fn test_default_detail_scale() {
        assert_eq!(Material::default().detail_scale_offset, [10.0, 10.0, 0.0, 0.0]);
    }
}
