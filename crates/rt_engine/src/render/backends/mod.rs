//! Device backend implementations

pub mod headless;
pub mod vulkan;
