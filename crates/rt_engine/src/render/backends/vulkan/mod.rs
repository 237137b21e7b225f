//! Vulkan device backend
//!
//! Instance and device bring-up plus the [`VulkanBackend`] implementation
//! of the device seam. The Vulkan loader is resolved at runtime, so the
//! crate itself links against nothing.

mod backend;
mod device;
mod instance;

pub use backend::VulkanBackend;
