//! Frame state machine
//!
//! [`FrameState`] enforces the StartFrame → DrawFrame contract: a frame is
//! Open strictly between the two calls, and the machine carries the open
//! frame's command buffer, the wait-semaphore choice for the main
//! submission, and any deferred work parked while no frame was open.

use ash::vk;

use crate::render::api::{DeviceBackend, DeviceResult};
use crate::render::commands::CommandBufferManager;

/// Number of frames the CPU records ahead of the GPU. Every slot-indexed
/// resource set (buffers, fences, semaphores) has this many entries.
pub const MAX_FRAMES_IN_FLIGHT: usize = 2;

/// Deferred GPU work parked outside the StartFrame/DrawFrame window.
///
/// Consumed exactly once per frame-open: `Pending` work is submitted ahead
/// of the frame's main work, chained by semaphore, and the state returns to
/// `Idle`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreFrame {
    /// Nothing parked
    Idle,
    /// A begun command buffer awaiting submission at the next frame-open
    Pending(vk::CommandBuffer),
}

/// Per-frame contract state: Closed → Open → Closed.
pub struct FrameState {
    slot: usize,
    frame_cmd: Option<vk::CommandBuffer>,
    pre_frame: PreFrame,
    submit_wait: Option<vk::Semaphore>,
}

impl FrameState {
    /// Start Closed, positioned so the first frame lands on slot 0.
    pub fn new() -> Self {
        Self {
            slot: MAX_FRAMES_IN_FLIGHT - 1,
            frame_cmd: None,
            pre_frame: PreFrame::Idle,
            submit_wait: None,
        }
    }

    /// Advance to the next slot (wrapping) and return it.
    pub fn advance_slot(&mut self) -> usize {
        self.slot = (self.slot + 1) % MAX_FRAMES_IN_FLIGHT;
        self.slot
    }

    /// Currently live slot index.
    pub fn slot(&self) -> usize {
        self.slot
    }

    /// Whether a frame is open right now.
    pub fn is_open(&self) -> bool {
        self.frame_cmd.is_some()
    }

    /// Transition Closed → Open with the frame's main command buffer.
    pub fn on_begin_frame(&mut self, cmd: vk::CommandBuffer) {
        debug_assert!(self.frame_cmd.is_none());
        self.frame_cmd = Some(cmd);
    }

    /// Transition Open → Closed.
    pub fn on_end_frame(&mut self) {
        debug_assert!(self.frame_cmd.is_some());
        self.frame_cmd = None;
        self.submit_wait = None;
    }

    /// The open frame's command buffer. Stable for the whole Open period;
    /// `None` while Closed.
    pub fn frame_cmd(&self) -> Option<vk::CommandBuffer> {
        self.frame_cmd
    }

    /// Take parked deferred work, leaving `Idle` behind.
    pub fn take_pre_frame(&mut self) -> PreFrame {
        std::mem::replace(&mut self.pre_frame, PreFrame::Idle)
    }

    /// Record which semaphore the main submission must wait on.
    pub fn set_submit_wait(&mut self, semaphore: Option<vk::Semaphore>) {
        self.submit_wait = semaphore;
    }

    /// Take the main submission's wait semaphore choice.
    pub fn take_submit_wait(&mut self) -> Option<vk::Semaphore> {
        self.submit_wait.take()
    }

    /// The command buffer for application-triggered GPU work.
    ///
    /// While a frame is Open this is simply the frame's buffer. While Closed
    /// it starts (once) a graphics buffer and parks it; the parked buffer is
    /// submitted ahead of the next frame's main work. Repeated Closed-state
    /// calls return the same parked buffer.
    pub fn deferred_cmd(
        &mut self,
        backend: &mut dyn DeviceBackend,
        cmds: &mut CommandBufferManager,
    ) -> DeviceResult<vk::CommandBuffer> {
        if let Some(cmd) = self.frame_cmd {
            return Ok(cmd);
        }

        match self.pre_frame {
            PreFrame::Pending(cmd) => Ok(cmd),
            PreFrame::Idle => {
                let cmd = cmds.start_graphics_cmd(backend)?;
                self.pre_frame = PreFrame::Pending(cmd);
                Ok(cmd)
            }
        }
    }
}

impl Default for FrameState {
    fn default() -> Self {
        Self::new()
    }
}
