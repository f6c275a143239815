//! Frame-in-flight resources and ray-tracing support objects

pub mod bindless;
pub mod dynamic_buffer;
pub mod image_state;
pub mod per_frame;
pub mod shader_binding_table;
pub mod shader_library;

pub use bindless::{BindlessRefresh, BindlessTable, SlotState};
pub use dynamic_buffer::DynamicBuffer;
pub use image_state::{transition_images, ImageState, TrackedImage};
pub use per_frame::PerFrame;
pub use shader_binding_table::{align_up, SbtLayout, ShaderBindingTable};
pub use shader_library::{ShaderLibrary, REQUIRED_SHADERS, SPIRV_MAGIC};
