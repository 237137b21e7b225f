//! Synchronization primitives for frame pipelining
//!
//! One set of semaphores and fences per frame slot. Frame fences start life
//! signaled so the first occupancy of every slot passes its wait immediately;
//! out-of-frame fences start unsignaled and are only ever waited after a
//! deferred submit armed them.

use ash::vk;

use crate::frame::MAX_FRAMES_IN_FLIGHT;
use crate::render::api::{DeviceBackend, DeviceResult};

/// Timeline semaphore wait entry: semaphore plus the counter value to wait
/// for. The value is ignored for binary semaphores.
#[derive(Debug, Clone, Copy)]
pub struct ToWait {
    /// Semaphore to wait on; null entries are skipped at submission
    pub semaphore: vk::Semaphore,
    /// Counter value the wait completes at
    pub value: u64,
}

/// Timeline semaphore signal entry: semaphore plus the counter value to set.
#[derive(Debug, Clone, Copy)]
pub struct ToSignal {
    /// Semaphore to signal
    pub semaphore: vk::Semaphore,
    /// Counter value to signal
    pub value: u64,
}

/// Per-slot synchronization objects for the frame pipeline.
pub struct FrameSync {
    image_available: Vec<vk::Semaphore>,
    in_frame: Vec<vk::Semaphore>,
    render_finished: Vec<vk::Semaphore>,
    frame_fences: Vec<vk::Fence>,
    out_of_frame_fences: Vec<vk::Fence>,
}

impl FrameSync {
    /// Create the full per-slot set through the backend.
    pub fn new(backend: &mut dyn DeviceBackend) -> DeviceResult<Self> {
        let mut image_available = Vec::with_capacity(MAX_FRAMES_IN_FLIGHT);
        let mut in_frame = Vec::with_capacity(MAX_FRAMES_IN_FLIGHT);
        let mut render_finished = Vec::with_capacity(MAX_FRAMES_IN_FLIGHT);
        let mut frame_fences = Vec::with_capacity(MAX_FRAMES_IN_FLIGHT);
        let mut out_of_frame_fences = Vec::with_capacity(MAX_FRAMES_IN_FLIGHT);

        for slot in 0..MAX_FRAMES_IN_FLIGHT {
            image_available
                .push(backend.create_binary_semaphore(&format!("Image available semaphore {slot}"))?);
            in_frame.push(backend.create_binary_semaphore(&format!("In-frame semaphore {slot}"))?);
            render_finished
                .push(backend.create_binary_semaphore(&format!("Render finished semaphore {slot}"))?);
            frame_fences.push(backend.create_fence(true, &format!("Frame fence {slot}"))?);
            out_of_frame_fences
                .push(backend.create_fence(false, &format!("Out of frame fence {slot}"))?);
        }

        Ok(Self {
            image_available,
            in_frame,
            render_finished,
            frame_fences,
            out_of_frame_fences,
        })
    }

    /// Semaphore signaled when the slot's swapchain image is ready
    pub fn image_available(&self, slot: usize) -> vk::Semaphore {
        self.image_available[slot]
    }

    /// Semaphore chaining deferred pre-frame work into the slot's main work
    pub fn in_frame(&self, slot: usize) -> vk::Semaphore {
        self.in_frame[slot]
    }

    /// Semaphore signaled when the slot's main work finishes
    pub fn render_finished(&self, slot: usize) -> vk::Semaphore {
        self.render_finished[slot]
    }

    /// Fence signaled by the slot's main submission
    pub fn frame_fence(&self, slot: usize) -> vk::Fence {
        self.frame_fences[slot]
    }

    /// Fence signaled by a deferred pre-frame submission targeting this slot
    pub fn out_of_frame_fence(&self, slot: usize) -> vk::Fence {
        self.out_of_frame_fences[slot]
    }

    /// Destroy every owned object through the backend.
    pub fn destroy(&mut self, backend: &mut dyn DeviceBackend) {
        for semaphore in self
            .image_available
            .drain(..)
            .chain(self.in_frame.drain(..))
            .chain(self.render_finished.drain(..))
        {
            backend.destroy_semaphore(semaphore);
        }
        for fence in self
            .frame_fences
            .drain(..)
            .chain(self.out_of_frame_fences.drain(..))
        {
            backend.destroy_fence(fence);
        }
    }
}
