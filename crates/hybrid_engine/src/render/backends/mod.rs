//! Graphics backend implementations
//!
//! - [`vulkan`]: `ash` over an externally bootstrapped instance and device
//! - [`headless`]: CPU-only device for headless runs and tests

pub mod headless;
pub mod vulkan;

mod keys;

pub use headless::{DeviceStats, HeadlessDevice, RecordedCommand};
pub use vulkan::{VulkanContext, VulkanDevice};
