//! Rendering core
//!
//! Frame-pipelining building blocks: the device backend seam, per-slot sync
//! objects, the command buffer manager, and the swapchain lifecycle.

pub mod api;
pub mod backends;
pub mod commands;
pub mod swapchain;
pub mod sync;
