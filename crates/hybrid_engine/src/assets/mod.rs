//! Asset management
//!
//! GPU-resident textures and meshes keyed by stable IDs, plus the dense
//! binding slots used to fill bindless descriptor arrays.

pub mod asset_pool;
pub mod mesh;
pub mod texture;

pub use asset_pool::{AssetPool, AssetPoolConfig, DEFAULT_MESH_NAME, DEFAULT_TEXTURE_NAME};
pub use mesh::{MeshAsset, MeshData, MeshId, Vertex};
pub use texture::{TextureAsset, TextureData, TextureId, TEXTURE_FORMAT};

use thiserror::Error;

use crate::render::api::DeviceError;

/// Asset errors
#[derive(Error, Debug)]
pub enum AssetError {
    /// Device resource creation failed (out of memory, rejected format).
    /// Not retryable; the caller decides whether to skip the asset.
    #[error("Resource creation failed: {0}")]
    ResourceCreation(#[from] DeviceError),

    /// Input data is malformed
    #[error("Invalid asset data: {0}")]
    InvalidData(String),

    /// Bindless capacity reached
    #[error("{kind} capacity of {capacity} exhausted")]
    CapacityExceeded {
        /// "texture" or "mesh"
        kind: &'static str,
        /// Configured capacity
        capacity: u32,
    },

    /// Destroy of an unknown texture
    #[error("Unknown {0}")]
    UnknownTexture(TextureId),

    /// Destroy of an unknown mesh
    #[error("Unknown {0}")]
    UnknownMesh(MeshId),

    /// The last asset of a kind backs every fallback lookup
    #[error("Cannot destroy the last remaining {0}")]
    LastAsset(&'static str),
}
