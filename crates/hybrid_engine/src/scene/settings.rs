//! Per-frame uniform blocks shared by all passes

use bytemuck::{Pod, Zeroable};

/// Camera and accumulation state of one frame
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct SceneSettings {
    /// World-to-camera
    pub view: [[f32; 4]; 4],
    /// Camera-to-world
    pub inv_view: [[f32; 4]; 4],
    /// Camera-to-clip
    pub projection: [[f32; 4]; 4],
    /// Clip-to-camera
    pub inv_projection: [[f32; 4]; 4],
    /// Radiance scale applied before tone mapping
    pub exposure: f32,
    /// Display gamma
    pub gamma: f32,
    /// Samples already accumulated into the ray-tracing film; 0 restarts accumulation
    pub accumulated_samples: u32,
    /// Per-frame random seed
    pub seed: u32,
}

/// Environment map parameters
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct EnvMapSettings {
    /// Horizontal rotation in `[0, 1)` turns
    pub offset: f32,
    /// Radiance scale
    pub exposure: f32,
    /// Non-zero when the map lights reflections
    pub reflect: i32,
    padding: u32,
}

impl Default for EnvMapSettings {
    fn default() -> Self {
        Self {
            offset: 0.0,
            exposure: 1.0,
            reflect: 1,
            padding: 0,
        }
    }
}

impl EnvMapSettings {
    /// Settings with the given offset, exposure and reflect flag
    pub fn new(offset: f32, exposure: f32, reflect: bool) -> Self {
        Self {
            offset,
            exposure,
            reflect: i32::from(reflect),
            padding: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uniform_sizes() {
        assert_eq!(std::mem::size_of::<SceneSettings>(), 272);
        assert_eq!(std::mem::size_of::<EnvMapSettings>(), 16);
    }
}
