//! # Rendering System
//!
//! The render graph and everything it stands on: the backend-neutral device
//! API, the device backends, the frame-in-flight resource helpers and the
//! render targets.
//!
//! ## Architecture
//!
//! - **Renderer**: owns the pipelines of the three passes (environment backdrop,
//!   rasterized entities, ray-traced lighting) and records them in order
//! - **Film / RayTracingFilm**: the render targets, resized on output-size change
//! - **API**: [`RenderDevice`](api::RenderDevice) and the opaque handle types
//! - **Backends**: a Vulkan implementation and a CPU-only headless one

// Device seam and implementations
pub mod api;
pub mod backends;

// Frame-in-flight helpers
pub mod resources;

// Render targets and passes
pub mod film;
pub mod renderer;

pub use film::{Film, RayTracingFilm, SelectionState, NO_ENTITY};
pub use renderer::{OutputImage, Renderer};

use thiserror::Error;

use crate::render::api::DeviceError;
use crate::scene::SceneError;

/// Errors raised while creating or running the render graph
#[derive(Error, Debug)]
pub enum RenderError {
    /// Shader file or module not found
    #[error("Missing shader: {0}")]
    MissingShader(String),

    /// File exists but is not a SPIR-V module
    #[error("Invalid shader: {0}")]
    InvalidShader(String),

    /// Pipeline or pipeline layout rejected by the device
    #[error("Pipeline creation failed: {0}")]
    PipelineCreation(String),

    /// Device failure
    #[error("Device error: {0}")]
    Device(#[from] DeviceError),

    /// Scene failure while recording a pass
    #[error("Scene error: {0}")]
    Scene(#[from] SceneError),
}
