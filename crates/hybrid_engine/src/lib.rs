//! # Hybrid Engine
//!
//! Renderer core for a hybrid raster + ray-traced pipeline on Vulkan.
//!
//! ## Features
//!
//! - **Asset Pool**: textures and meshes with stable IDs and dense bindless slots
//! - **Scene Graph**: entities, camera, environment map and a top-level
//!   acceleration structure that is rebuilt or refitted as the scene changes
//! - **Frames in Flight**: every CPU-written GPU resource is replicated per slot
//! - **Render Graph**: environment backdrop, rasterized G-buffer with entity
//!   picking, and a progressive ray-traced lighting pass
//! - **Backends**: Vulkan through `ash`, plus a CPU-only headless device
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use hybrid_engine::prelude::*;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = EngineConfig::headless(640, 360);
//!     let mut device = HeadlessDevice::new(config.frames_in_flight as usize);
//!     let mut scene = SceneGraph::new(&mut device, &config)?;
//!     load_island(&mut scene, &mut device)?;
//!
//!     let shaders = ShaderLibrary::stub(REQUIRED_SHADERS);
//!     let mut renderer = Renderer::new(&mut device, &shaders, &scene, 640, 360)?;
//!
//!     let frame = device.begin_frame()?;
//!     scene.update(&mut device, 1.0 / 60.0)?;
//!     scene.sync(&mut device, frame.command_buffer, frame.frame_index)?;
//!     renderer.render_raster_pass(&mut device, frame.command_buffer, &scene, frame.frame_index)?;
//!     renderer.render_ray_trace_pass(&mut device, frame.command_buffer, &scene, frame.frame_index)?;
//!     device.end_frame(frame)?;
//!
//!     renderer.destroy(&mut device)?;
//!     scene.destroy(&mut device)?;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions, clippy::similar_names, clippy::too_many_arguments)]

// Core engine modules
pub mod config;
pub mod core;
pub mod foundation;

// Renderer core
pub mod assets;
pub mod render;
pub mod scene;

/// Common imports for engine users
pub mod prelude {
    pub use crate::{
        assets::{AssetError, AssetPool, MeshData, MeshId, TextureData, TextureId, Vertex},
        config::Config,
        core::{EngineConfig, TlasPolicy},
        foundation::{
            math::{Mat4, Vec3},
            time::{Stopwatch, Timer},
        },
        render::{
            api::RenderDevice,
            backends::{HeadlessDevice, VulkanContext, VulkanDevice},
            resources::{ShaderLibrary, REQUIRED_SHADERS},
            OutputImage, RenderError, Renderer, SelectionState, NO_ENTITY,
        },
        scene::{
            built_in_scenes, load_cornell_box, load_island, Camera, EntityId, Material, SceneError, SceneGraph,
        },
    };
}
