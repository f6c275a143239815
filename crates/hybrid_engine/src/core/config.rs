//! # Engine Configuration
//!
//! Startup settings for the hybrid renderer. Everything here is fixed for the
//! lifetime of a device: the number of frames in flight in particular sizes
//! every per-frame resource and cannot change afterwards.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

pub use crate::config::{Config, ConfigError, ConfigFormat};

/// Capacity of the texture and mesh bindless arrays and of the entity table
pub const DEFAULT_MAX_RESOURCES: u32 = 8192;

/// How the scene decides between rebuilding and refitting the top-level
/// acceleration structure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TlasPolicy {
    /// Rebuild only when the instance count changes, refit otherwise.
    #[default]
    Count,
    /// Also rebuild when the set of (entity, mesh) pairs changes at equal count.
    Composition,
}

/// Top-level engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Number of frames the device may process concurrently
    pub frames_in_flight: u32,
    /// Output width in pixels
    pub frame_width: u32,
    /// Output height in pixels
    pub frame_height: u32,
    /// Bindless texture array capacity
    pub max_textures: u32,
    /// Bindless mesh array capacity
    pub max_meshes: u32,
    /// Maximum number of live entities
    pub max_entities: u32,
    /// Run without a presentation surface
    pub headless: bool,
    /// Directory holding precompiled `.spv` shaders
    pub shader_directory: PathBuf,
    /// Rebuild-vs-refit policy for the top-level structure
    pub tlas_policy: TlasPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            frames_in_flight: 2,
            frame_width: 1280,
            frame_height: 720,
            max_textures: DEFAULT_MAX_RESOURCES,
            max_meshes: DEFAULT_MAX_RESOURCES,
            max_entities: DEFAULT_MAX_RESOURCES,
            headless: false,
            shader_directory: PathBuf::from("target/shaders"),
            tlas_policy: TlasPolicy::Count,
        }
    }
}

impl Config for EngineConfig {}

impl EngineConfig {
    /// Headless configuration with a custom output size
    pub fn headless(width: u32, height: u32) -> Self {
        Self {
            frame_width: width,
            frame_height: height,
            headless: true,
            ..Self::default()
        }
    }

    /// Builder-style override of the TLAS policy
    #[must_use]
    pub fn with_tlas_policy(mut self, policy: TlasPolicy) -> Self {
        self.tlas_policy = policy;
        self
    }

    /// Check values that would otherwise surface as device errors later
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.frames_in_flight == 0 {
            return Err(ConfigError::Invalid("frames_in_flight must be at least 1".into()));
        }
        if self.frame_width == 0 || self.frame_height == 0 {
            return Err(ConfigError::Invalid(format!(
                "frame size {}x{} has a zero dimension",
                self.frame_width, self.frame_height
            )));
        }
        if self.max_textures == 0 || self.max_meshes == 0 {
            return Err(ConfigError::Invalid(
                "bindless capacities must leave room for the default assets".into(),
            ));
        }
        if self.max_entities == 0 {
            return Err(ConfigError::Invalid("max_entities must be at least 1".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = EngineConfig::default();
        assert_eq!(config.frames_in_flight, 2);
        assert_eq!(config.max_textures, 8192);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_frames_in_flight_rejected() {
        let config = EngineConfig {
            frames_in_flight: 0,
            ..EngineConfig::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_zero_sized_frame_rejected() {
        assert!(EngineConfig::headless(0, 720).validate().is_err());
    }

    #[test]
    fn test_toml_partial_overrides_keep_defaults() {
        let text = "frames_in_flight = 3\ntlas_policy = \"composition\"\n";
        let config = EngineConfig::from_str_with_format(text, ConfigFormat::Toml).unwrap();
        assert_eq!(config.frames_in_flight, 3);
        assert_eq!(config.tlas_policy, TlasPolicy::Composition);
        assert_eq!(config.frame_width, 1280);
    }

    #[test]
    fn test_ron_round_trip() {
        let config = EngineConfig::headless(64, 32).with_tlas_policy(TlasPolicy::Composition);
        let text = config.to_string_with_format(ConfigFormat::Ron).unwrap();
        let parsed = EngineConfig::from_str_with_format(&text, ConfigFormat::Ron).unwrap();
        assert_eq!(parsed, config);
    }
}
