//! Engine facade and per-frame orchestration
//!
//! [`Engine`] ties the pieces together: the frame state machine, the
//! command buffer manager, the per-slot synchronization objects, and one
//! or two swapchains. The host drives it with [`Engine::start_frame`] and
//! [`Engine::draw_frame`] once per frame and records into the command
//! buffer the open frame exposes.
//!
//! Frame pacing works on slots. Each frame advances to the next slot
//! (wrapping), waits for the fence the submission two frames back armed
//! there, and only then touches that slot's buffers and semaphores. Work
//! recorded outside the frame window via [`Engine::upload_cmd`] is parked
//! and submitted at the next frame open, chained so the main submission
//! waits on its completion semaphore instead of the raw image-available
//! one.

use ash::vk;
use raw_window_handle::{RawDisplayHandle, RawWindowHandle};
use thiserror::Error;

use crate::config::EngineSettings;
use crate::frame::{FrameState, PreFrame, MAX_FRAMES_IN_FLIGHT};
use crate::msg::{MessageCallback, MessageSeverity, MessageSink};
use crate::render::api::{DeviceBackend, DeviceError, PresentRequest, QueueKind};
use crate::render::backends::vulkan::VulkanBackend;
use crate::render::commands::CommandBufferManager;
use crate::render::swapchain::Swapchain;
use crate::render::sync::{FrameSync, ToSignal, ToWait};

/// Errors surfaced to the host.
#[derive(Error, Debug)]
pub enum EngineError {
    /// `start_frame` was called while a frame was already open
    #[error("Frame was not ended: draw_frame must close the previous frame first")]
    FrameWasntEnded,

    /// `draw_frame` was called with no open frame
    #[error("Frame was not started: call start_frame first")]
    FrameWasntStarted,

    /// A device operation failed
    #[error(transparent)]
    Device(#[from] DeviceError),
}

/// Result type for engine operations
pub type EngineResult<T> = Result<T, EngineError>;

/// Raw handles for one host window.
#[derive(Debug, Clone, Copy)]
pub struct WindowHandles {
    /// Display or connection handle
    pub display: RawDisplayHandle,
    /// Window handle
    pub window: RawWindowHandle,
}

/// Everything needed to bring the engine up on real windows.
pub struct EngineCreateInfo {
    /// Engine settings, usually loaded from a config file
    pub settings: EngineSettings,
    /// The main window
    pub window: WindowHandles,
    /// Optional second window for a debug overlay
    pub overlay_window: Option<WindowHandles>,
    /// Callback receiving engine messages, in addition to the logger
    pub message_callback: Option<MessageCallback>,
}

/// Pre-created surfaces for [`Engine::with_backend`].
#[derive(Debug, Clone, Copy)]
pub struct EngineSurfaces {
    /// Surface of the main window
    pub primary: vk::SurfaceKHR,
    /// Surface of the optional overlay window
    pub overlay: Option<vk::SurfaceKHR>,
}

/// Per-frame parameters for [`Engine::start_frame`].
#[derive(Debug, Clone, Copy)]
pub struct StartFrameInfo {
    /// Whether presentation should wait for vblank this frame
    pub vsync: bool,
}

impl Default for StartFrameInfo {
    fn default() -> Self {
        Self { vsync: true }
    }
}

/// A rendered image to copy onto the presentable image.
///
/// The source must be in transfer-source layout when the frame's command
/// buffer executes.
#[derive(Debug, Clone, Copy)]
pub struct PresentBlit {
    /// Source image
    pub image: vk::Image,
    /// Source extent in pixels
    pub extent: vk::Extent2D,
    /// Scaling filter for the copy
    pub filter: vk::Filter,
}

/// Per-frame parameters for [`Engine::draw_frame`].
#[derive(Debug, Clone, Copy, Default)]
pub struct DrawFrameInfo {
    /// Optional blit of a rendered image onto the acquired one
    pub blit: Option<PresentBlit>,
    /// Optional blit onto the overlay window's acquired image
    pub overlay_blit: Option<PresentBlit>,
}

struct OverlayTarget {
    swapchain: Swapchain,
    image_available: Vec<vk::Semaphore>,
}

/// The rendering engine.
///
/// One instance per host process. All methods take `&mut self`; the engine
/// is not thread safe and expects to be driven from the render thread.
pub struct Engine {
    backend: Box<dyn DeviceBackend>,
    cmd_manager: CommandBufferManager,
    sync: FrameSync,
    frame_state: FrameState,
    swapchain: Swapchain,
    overlay: Option<OverlayTarget>,
    pending_out_of_frame: Option<vk::Fence>,
    messages: MessageSink,
    frame_id: u64,
}

impl Engine {
    /// Bring the engine up on real windows through the Vulkan backend.
    pub fn new(info: EngineCreateInfo) -> EngineResult<Self> {
        let validation = info
            .settings
            .enable_validation
            .unwrap_or(cfg!(debug_assertions));
        let (backend, primary, overlay) = VulkanBackend::create(
            &info.settings.app_name,
            validation,
            &info.window,
            info.overlay_window.as_ref(),
        )?;
        Self::with_backend(
            Box::new(backend),
            EngineSurfaces { primary, overlay },
            info.settings,
            info.message_callback,
        )
    }

    /// Build the engine over an explicit backend. This is how tests run
    /// the full frame loop against the headless backend.
    pub fn with_backend(
        mut backend: Box<dyn DeviceBackend>,
        surfaces: EngineSurfaces,
        settings: EngineSettings,
        message_callback: Option<MessageCallback>,
    ) -> EngineResult<Self> {
        settings
            .validate()
            .map_err(DeviceError::InitializationFailed)?;

        let mut messages = MessageSink::new(message_callback);
        let cmd_manager = CommandBufferManager::new(backend.as_mut())?;
        let sync = FrameSync::new(backend.as_mut())?;
        let swapchain = Swapchain::new(
            surfaces.primary,
            settings.preferred_image_count,
            settings.vsync,
        );

        let overlay = match surfaces.overlay {
            Some(surface) => {
                let mut image_available = Vec::with_capacity(MAX_FRAMES_IN_FLIGHT);
                for slot in 0..MAX_FRAMES_IN_FLIGHT {
                    image_available.push(backend.create_binary_semaphore(&format!(
                        "Overlay image available semaphore {slot}"
                    ))?);
                }
                // The overlay surface never waits for vblank; the primary
                // swapchain already paces the frame.
                Some(OverlayTarget {
                    swapchain: Swapchain::new(surface, settings.preferred_image_count, false),
                    image_available,
                })
            }
            None => None,
        };

        messages.print(MessageSeverity::INFO, "Engine initialized");
        Ok(Self {
            backend,
            cmd_manager,
            sync,
            frame_state: FrameState::new(),
            swapchain,
            overlay,
            pending_out_of_frame: None,
            messages,
            frame_id: 0,
        })
    }

    /// Open a frame: advance the slot, wait for its resources, acquire
    /// presentable images, flush parked deferred work, and hand the frame's
    /// command buffer to the state machine.
    ///
    /// Fails with [`EngineError::FrameWasntEnded`] if a frame is already
    /// open; the open frame is left untouched in that case.
    pub fn start_frame(&mut self, info: &StartFrameInfo) -> EngineResult<()> {
        if self.frame_state.is_open() {
            return Err(EngineError::FrameWasntEnded);
        }

        self.swapchain.request_vsync(info.vsync);

        let slot = self.frame_state.advance_slot();

        // Wait for the fence the main submission armed here two frames
        // back, plus the out of frame fence if a deferred submission armed
        // it for this slot. Waiting any other fence could deadlock.
        let mut fences = vec![self.sync.frame_fence(slot)];
        if let Some(fence) = self.pending_out_of_frame.take() {
            fences.push(fence);
        }
        self.backend.wait_and_reset_fences(&fences)?;

        let image_available = self.sync.image_available(slot);
        let acquired = self.swapchain.acquire_image(
            &mut *self.backend,
            &mut self.cmd_manager,
            &mut self.messages,
            image_available,
        )?;
        if let Some(overlay) = &mut self.overlay {
            overlay.swapchain.acquire_image(
                &mut *self.backend,
                &mut self.cmd_manager,
                &mut self.messages,
                overlay.image_available[slot],
            )?;
        }

        // Deferred work recorded outside the frame window goes first. It
        // waits for the acquired image and signals the in-frame semaphore,
        // which replaces image-available as the main submission's wait. Its
        // fence lands on the next slot and is collected there.
        let submit_wait = match self.frame_state.take_pre_frame() {
            PreFrame::Pending(cmd) => {
                let waits: Vec<vk::Semaphore> = if acquired.is_some() {
                    vec![image_available]
                } else {
                    Vec::new()
                };
                let in_frame = self.sync.in_frame(slot);
                let next_slot = (slot + 1) % MAX_FRAMES_IN_FLIGHT;
                let fence = self.sync.out_of_frame_fence(next_slot);
                self.cmd_manager
                    .submit_binary(&mut *self.backend, cmd, &waits, in_frame, fence)?;
                self.pending_out_of_frame = Some(fence);
                Some(in_frame)
            }
            PreFrame::Idle => acquired.is_some().then_some(image_available),
        };
        self.frame_state.set_submit_wait(submit_wait);

        self.cmd_manager.prepare_for_frame(&mut *self.backend, slot)?;
        let cmd = self.cmd_manager.start_graphics_cmd(&mut *self.backend)?;
        self.frame_state.on_begin_frame(cmd);
        Ok(())
    }

    /// Close the frame: submit its command buffer and present every surface
    /// that acquired an image, all in one present call.
    ///
    /// Fails with [`EngineError::FrameWasntStarted`] if no frame is open.
    pub fn draw_frame(&mut self, info: &DrawFrameInfo) -> EngineResult<()> {
        let Some(cmd) = self.frame_state.frame_cmd() else {
            return Err(EngineError::FrameWasntStarted);
        };
        let slot = self.frame_state.slot();

        if let Some(blit) = &info.blit {
            self.swapchain.blit_for_present(
                &mut *self.backend,
                cmd,
                blit.image,
                blit.extent,
                blit.filter,
            )?;
        }
        if let (Some(blit), Some(overlay)) = (&info.overlay_blit, &self.overlay) {
            overlay.swapchain.blit_for_present(
                &mut *self.backend,
                cmd,
                blit.image,
                blit.extent,
                blit.filter,
            )?;
        }

        let mut requests = Vec::with_capacity(2);
        let primary_presents = self.swapchain.current_image().is_some();
        if let Some(index) = self.swapchain.current_image() {
            requests.push(PresentRequest {
                swapchain: self.swapchain.handle(),
                image_index: index,
            });
        }
        let mut overlay_presents = false;
        if let Some(overlay) = &self.overlay {
            if let Some(index) = overlay.swapchain.current_image() {
                requests.push(PresentRequest {
                    swapchain: overlay.swapchain.handle(),
                    image_index: index,
                });
                overlay_presents = true;
            }
        }

        let mut waits = Vec::with_capacity(2);
        if let Some(semaphore) = self.frame_state.take_submit_wait() {
            waits.push(semaphore);
        }
        if overlay_presents {
            if let Some(overlay) = &self.overlay {
                waits.push(overlay.image_available[slot]);
            }
        }

        // With no surface to present, nothing ever waits the render
        // finished semaphore, so it must not be signaled either.
        let render_finished = if requests.is_empty() {
            vk::Semaphore::null()
        } else {
            self.sync.render_finished(slot)
        };
        self.cmd_manager.submit_binary(
            &mut *self.backend,
            cmd,
            &waits,
            render_finished,
            self.sync.frame_fence(slot),
        )?;
        self.frame_state.on_end_frame();
        self.frame_id += 1;

        if requests.is_empty() {
            return Ok(());
        }

        let outcomes =
            self.backend
                .queue_present(QueueKind::Graphics, &[render_finished], &requests)?;
        let mut outcomes = outcomes.into_iter();
        if primary_presents {
            if let Some(outcome) = outcomes.next() {
                self.swapchain.on_queue_present(
                    &mut *self.backend,
                    &mut self.cmd_manager,
                    &mut self.messages,
                    outcome,
                )?;
            }
        }
        if overlay_presents {
            if let Some(overlay) = &mut self.overlay {
                if let Some(outcome) = outcomes.next() {
                    overlay.swapchain.on_queue_present(
                        &mut *self.backend,
                        &mut self.cmd_manager,
                        &mut self.messages,
                        outcome,
                    )?;
                }
            }
        }
        Ok(())
    }

    /// The open frame's command buffer, `None` while no frame is open.
    ///
    /// Stable across repeated calls within one frame; this is the buffer
    /// [`Self::draw_frame`] will submit.
    pub fn frame_cmd(&self) -> Option<vk::CommandBuffer> {
        self.frame_state.frame_cmd()
    }

    /// Command buffer for host-triggered GPU work such as uploads.
    ///
    /// Inside a frame this is the frame's own buffer. Outside, a buffer is
    /// started once and parked; it is submitted ahead of the next frame's
    /// work. Repeated calls return the same buffer either way.
    pub fn upload_cmd(&mut self) -> EngineResult<vk::CommandBuffer> {
        Ok(self
            .frame_state
            .deferred_cmd(&mut *self.backend, &mut self.cmd_manager)?)
    }

    /// Start a one-time graphics command buffer on the current slot.
    pub fn start_graphics_cmd(&mut self) -> EngineResult<vk::CommandBuffer> {
        Ok(self.cmd_manager.start_graphics_cmd(&mut *self.backend)?)
    }

    /// Start a one-time compute command buffer on the current slot.
    pub fn start_compute_cmd(&mut self) -> EngineResult<vk::CommandBuffer> {
        Ok(self.cmd_manager.start_compute_cmd(&mut *self.backend)?)
    }

    /// Start a one-time transfer command buffer on the current slot.
    pub fn start_transfer_cmd(&mut self) -> EngineResult<vk::CommandBuffer> {
        Ok(self.cmd_manager.start_transfer_cmd(&mut *self.backend)?)
    }

    /// Submit a command buffer to its owning queue with no semaphores.
    pub fn submit(&mut self, cmd: vk::CommandBuffer, fence: vk::Fence) -> EngineResult<()> {
        Ok(self.cmd_manager.submit(&mut *self.backend, cmd, fence)?)
    }

    /// Submit a command buffer with binary semaphores.
    pub fn submit_binary(
        &mut self,
        cmd: vk::CommandBuffer,
        wait_semaphores: &[vk::Semaphore],
        signal_semaphore: vk::Semaphore,
        fence: vk::Fence,
    ) -> EngineResult<()> {
        Ok(self
            .cmd_manager
            .submit_binary(&mut *self.backend, cmd, wait_semaphores, signal_semaphore, fence)?)
    }

    /// Submit a command buffer with timeline semaphores.
    pub fn submit_timeline(
        &mut self,
        cmd: vk::CommandBuffer,
        fence: vk::Fence,
        waits: &[ToWait],
        signal: ToSignal,
    ) -> EngineResult<()> {
        Ok(self
            .cmd_manager
            .submit_timeline(&mut *self.backend, cmd, fence, waits, signal)?)
    }

    /// Block until the graphics queue drains.
    pub fn wait_graphics_idle(&mut self) -> EngineResult<()> {
        Ok(self.cmd_manager.wait_graphics_idle(&mut *self.backend)?)
    }

    /// Block until the compute queue drains.
    pub fn wait_compute_idle(&mut self) -> EngineResult<()> {
        Ok(self.cmd_manager.wait_compute_idle(&mut *self.backend)?)
    }

    /// Block until the transfer queue drains.
    pub fn wait_transfer_idle(&mut self) -> EngineResult<()> {
        Ok(self.cmd_manager.wait_transfer_idle(&mut *self.backend)?)
    }

    /// Block until the whole device drains.
    pub fn wait_device_idle(&mut self) -> EngineResult<()> {
        Ok(self.cmd_manager.wait_device_idle(&mut *self.backend)?)
    }

    /// Slot index the current or most recent frame runs on.
    pub fn frame_slot(&self) -> usize {
        self.frame_state.slot()
    }

    /// Monotonic count of completed frames.
    pub fn frame_id(&self) -> u64 {
        self.frame_id
    }

    /// The primary window's swapchain.
    pub fn swapchain(&mut self) -> &mut Swapchain {
        &mut self.swapchain
    }

    /// The overlay window's swapchain, when one was created.
    pub fn overlay_swapchain(&mut self) -> Option<&mut Swapchain> {
        self.overlay.as_mut().map(|overlay| &mut overlay.swapchain)
    }

    /// The engine's message sink, for adjusting the severity filter.
    pub fn messages(&mut self) -> &mut MessageSink {
        &mut self.messages
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        if let Err(e) = self.backend.device_wait_idle() {
            log::error!("Device wait failed during engine teardown: {e}");
        }
        self.swapchain.destroy(&mut *self.backend);
        if let Some(mut overlay) = self.overlay.take() {
            overlay.swapchain.destroy(&mut *self.backend);
            for semaphore in overlay.image_available.drain(..) {
                self.backend.destroy_semaphore(semaphore);
            }
        }
        self.sync.destroy(&mut *self.backend);
        self.cmd_manager.destroy(&mut *self.backend);
        self.messages.print(MessageSeverity::INFO, "Engine destroyed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::backends::headless::HeadlessBackend;

    fn test_engine() -> (Engine, HeadlessBackend) {
        let (backend, surface) = HeadlessBackend::with_surface(1280, 720);
        let engine = Engine::with_backend(
            Box::new(backend.clone()),
            EngineSurfaces {
                primary: surface,
                overlay: None,
            },
            EngineSettings::default(),
            None,
        )
        .unwrap();
        (engine, backend)
    }

    #[test]
    fn test_start_frame_twice_is_rejected_and_state_kept() {
        let (mut engine, _backend) = test_engine();
        engine.start_frame(&StartFrameInfo::default()).unwrap();
        let slot = engine.frame_slot();

        let err = engine.start_frame(&StartFrameInfo::default());
        assert!(matches!(err, Err(EngineError::FrameWasntEnded)));
        assert_eq!(engine.frame_slot(), slot);

        // The open frame is still usable.
        engine.draw_frame(&DrawFrameInfo::default()).unwrap();
        assert_eq!(engine.frame_id(), 1);
    }

    #[test]
    fn test_draw_frame_without_start_is_rejected() {
        let (mut engine, backend) = test_engine();
        let err = engine.draw_frame(&DrawFrameInfo::default());
        assert!(matches!(err, Err(EngineError::FrameWasntStarted)));
        assert_eq!(engine.frame_id(), 0);

        // The failed call must not have touched the device.
        assert!(backend.violations().is_empty());
        engine.start_frame(&StartFrameInfo::default()).unwrap();
        engine.draw_frame(&DrawFrameInfo::default()).unwrap();
        assert_eq!(engine.frame_id(), 1);
    }

    #[test]
    fn test_teardown_destroys_every_device_object() {
        let (engine, backend) = test_engine();
        assert!(backend.live_object_count() > 0);
        drop(engine);
        assert_eq!(backend.live_object_count(), 0);
        assert!(backend.violations().is_empty());
    }
}
