//! Backend-neutral rendering API
//!
//! Everything above this module (assets, scene, render graph) talks to the
//! GPU only through [`RenderDevice`] and the handle types defined here.

pub mod render_device;
pub mod resources;

pub use render_device::{DeviceError, DeviceResult, RenderDevice};
pub use resources::*;
