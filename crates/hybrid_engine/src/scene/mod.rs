//! Scene: entities, camera, environment map and the top-level acceleration structure

pub mod acceleration;
pub mod built_in;
pub mod camera;
pub mod entity;
pub mod envmap;
pub mod material;
pub mod scene_graph;
pub mod settings;

pub use acceleration::{TlasUpdate, TopLevelStructure};
pub use built_in::{built_in_scenes, load_cornell_box, load_island, SceneLoader};
pub use camera::Camera;
pub use entity::{EntityId, EntityRecord};
pub use envmap::EnvironmentMap;
pub use material::{EntityMetadata, Material};
pub use scene_graph::{SceneGraph, SceneLayouts, UpdateHook};
pub use settings::{EnvMapSettings, SceneSettings};

use thiserror::Error;

use crate::assets::AssetError;
use crate::render::api::DeviceError;

/// Scene errors
#[derive(Error, Debug)]
pub enum SceneError {
    /// Never-created or destroyed entity
    #[error("{0} not found")]
    EntityNotFound(EntityId),

    /// `max_entities` reached
    #[error("Entity capacity of {capacity} exhausted")]
    CapacityExceeded {
        /// Configured capacity
        capacity: u32,
    },

    /// Asset pool failure
    #[error("Asset error: {0}")]
    Asset(#[from] AssetError),

    /// Device failure
    #[error("Device error: {0}")]
    Device(#[from] DeviceError),
}
