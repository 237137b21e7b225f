//! Simulated device backend
//!
//! [`HeadlessBackend`] implements [`DeviceBackend`] without a GPU. Every
//! interaction is appended to an event log, and the backend tracks the
//! lifecycle of fences and command buffers closely enough to catch the
//! mistakes a real driver punishes with a data race instead of an error:
//! reusing a command buffer before its fence was waited on, resetting a
//! pool with buffers still in flight, or waiting on a fence that no
//! submission will ever signal. Such mistakes are recorded as violations
//! rather than errors, so a test can drive a whole misbehaving frame loop
//! and inspect the damage afterwards.
//!
//! The backend is a cloneable facade over shared state. A test hands one
//! clone to the engine and keeps another to inject surface staleness and
//! to read the log.
//!
//! Binary semaphore signal/wait pairing is not modeled; semaphores are
//! only checked for liveness.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::rc::Rc;

use ash::vk;
use ash::vk::Handle;

use crate::render::api::{
    AcquireOutcome, DeviceBackend, DeviceError, DeviceResult, PresentOutcome, PresentRequest,
    QueueKind, SubmitRequest, SwapchainDesc,
};

/// One recorded device interaction.
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceEvent {
    /// `wait_and_reset_fences` completed
    FencesWaited {
        /// The fences waited on, in call order
        fences: Vec<vk::Fence>,
    },
    /// A command pool was reset
    PoolReset {
        /// The pool
        pool: vk::CommandPool,
    },
    /// Command buffers were allocated from a pool
    CommandBuffersAllocated {
        /// The pool
        pool: vk::CommandPool,
        /// How many buffers the call produced
        count: u32,
    },
    /// A command buffer was submitted
    Submitted {
        /// Queue the submission went to
        queue: QueueKind,
        /// The command buffer
        cmd: vk::CommandBuffer,
        /// Semaphores the submission waits on
        waits: Vec<vk::Semaphore>,
        /// Timeline wait counters, empty for binary submissions
        wait_values: Vec<u64>,
        /// Semaphores the submission signals
        signals: Vec<vk::Semaphore>,
        /// Timeline signal counters, empty for binary submissions
        signal_values: Vec<u64>,
        /// Completion fence, possibly null
        fence: vk::Fence,
        /// Whether this was a timeline submission
        timeline: bool,
    },
    /// An image was acquired from a swapchain
    ImageAcquired {
        /// The swapchain
        swapchain: vk::SwapchainKHR,
        /// Semaphore the acquire signals
        semaphore: vk::Semaphore,
        /// Index handed out
        image_index: u32,
    },
    /// A swapchain was created
    SwapchainCreated {
        /// The new handle
        swapchain: vk::SwapchainKHR,
        /// The retired handle passed in, possibly null
        old: vk::SwapchainKHR,
        /// Image extent as (width, height)
        extent: (u32, u32),
        /// Present mode the swapchain was created with
        present_mode: vk::PresentModeKHR,
        /// Number of images
        image_count: u32,
    },
    /// A swapchain handle was destroyed
    SwapchainDestroyed {
        /// The destroyed handle
        swapchain: vk::SwapchainKHR,
    },
    /// A present call completed
    Presented {
        /// Queue the present went to
        queue: QueueKind,
        /// Semaphores the present waited on
        waits: Vec<vk::Semaphore>,
        /// Swapchains in request order
        swapchains: Vec<vk::SwapchainKHR>,
        /// Per-swapchain outcomes, parallel to `swapchains`
        outcomes: Vec<PresentOutcome>,
    },
    /// Present-layout transitions were recorded into a command buffer
    TransitionedToPresent {
        /// The command buffer
        cmd: vk::CommandBuffer,
        /// How many images were transitioned
        image_count: usize,
    },
    /// A blit was recorded into a command buffer
    BlitRecorded {
        /// The command buffer
        cmd: vk::CommandBuffer,
        /// Blit source image
        src: vk::Image,
        /// Blit destination image
        dst: vk::Image,
    },
    /// `queue_wait_idle` completed
    QueueIdled {
        /// The drained queue
        queue: QueueKind,
    },
    /// `device_wait_idle` completed
    DeviceIdled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FenceState {
    Unsignaled,
    Pending,
    Signaled,
}

#[derive(Debug)]
struct FenceSlot {
    state: FenceState,
    queue: Option<QueueKind>,
    guarded_cmds: Vec<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CmdState {
    Initial,
    Recording,
    Executable,
    InFlight,
}

#[derive(Debug)]
struct CmdSlot {
    pool: u64,
    state: CmdState,
    queue: Option<QueueKind>,
}

#[derive(Debug)]
struct PoolState {
    queue: QueueKind,
    cmds: Vec<u64>,
}

#[derive(Debug)]
enum SemaphoreKind {
    Binary,
    Timeline(u64),
}

#[derive(Debug)]
struct SurfaceState {
    caps: vk::SurfaceCapabilitiesKHR,
    formats: Vec<vk::SurfaceFormatKHR>,
    present_modes: Vec<vk::PresentModeKHR>,
    fail_acquires: u32,
    fail_presents: u32,
}

#[derive(Debug)]
struct SwapchainState {
    surface: u64,
    extent: (u32, u32),
    images: Vec<u64>,
    next_image: u32,
}

fn default_caps(extent: vk::Extent2D) -> vk::SurfaceCapabilitiesKHR {
    vk::SurfaceCapabilitiesKHR {
        min_image_count: 2,
        max_image_count: 8,
        current_extent: extent,
        min_image_extent: vk::Extent2D {
            width: 1,
            height: 1,
        },
        max_image_extent: vk::Extent2D {
            width: 4096,
            height: 4096,
        },
        max_image_array_layers: 1,
        supported_transforms: vk::SurfaceTransformFlagsKHR::IDENTITY,
        current_transform: vk::SurfaceTransformFlagsKHR::IDENTITY,
        supported_composite_alpha: vk::CompositeAlphaFlagsKHR::OPAQUE,
        supported_usage_flags: vk::ImageUsageFlags::COLOR_ATTACHMENT
            | vk::ImageUsageFlags::TRANSFER_DST,
    }
}

fn default_formats() -> Vec<vk::SurfaceFormatKHR> {
    vec![
        vk::SurfaceFormatKHR {
            format: vk::Format::B8G8R8A8_SRGB,
            color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
        },
        vk::SurfaceFormatKHR {
            format: vk::Format::B8G8R8A8_UNORM,
            color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
        },
    ]
}

fn default_present_modes() -> Vec<vk::PresentModeKHR> {
    vec![
        vk::PresentModeKHR::FIFO,
        vk::PresentModeKHR::FIFO_RELAXED,
        vk::PresentModeKHR::MAILBOX,
        vk::PresentModeKHR::IMMEDIATE,
    ]
}

#[derive(Debug, Default)]
struct Inner {
    next_handle: u64,
    events: Vec<DeviceEvent>,
    violations: Vec<String>,
    names: HashMap<u64, String>,
    semaphores: HashMap<u64, SemaphoreKind>,
    fences: HashMap<u64, FenceSlot>,
    pools: HashMap<u64, PoolState>,
    cmds: HashMap<u64, CmdSlot>,
    surfaces: HashMap<u64, SurfaceState>,
    swapchains: HashMap<u64, SwapchainState>,
    images: HashSet<u64>,
    views: HashMap<u64, u64>,
}

impl Inner {
    fn mint(&mut self) -> u64 {
        self.next_handle += 1;
        self.next_handle
    }

    fn violation(&mut self, text: String) {
        log::error!("{text}");
        self.violations.push(text);
    }

    fn describe(&self, raw: u64) -> String {
        match self.names.get(&raw) {
            Some(name) => format!("'{name}'"),
            None => format!("{raw:#x}"),
        }
    }

    fn release_cmds(&mut self, queue: Option<QueueKind>) {
        for slot in self.cmds.values_mut() {
            if slot.state == CmdState::InFlight && (queue.is_none() || slot.queue == queue) {
                slot.state = CmdState::Executable;
            }
        }
        for fence in self.fences.values_mut() {
            if fence.state == FenceState::Pending && (queue.is_none() || fence.queue == queue) {
                fence.state = FenceState::Signaled;
            }
        }
    }

    fn check_semaphores_known(&mut self, semaphores: &[vk::Semaphore], context: &str) {
        let unknown: Vec<u64> = semaphores
            .iter()
            .filter(|s| !self.semaphores.contains_key(&s.as_raw()))
            .map(|s| s.as_raw())
            .collect();
        for raw in unknown {
            let what = self.describe(raw);
            self.violation(format!("{context} references unknown semaphore {what}"));
        }
    }
}

/// A [`DeviceBackend`] that records instead of rendering.
///
/// Clones share state: hand one clone to the engine, keep another to
/// inspect [`Self::events`] and [`Self::violations`] and to inject
/// surface changes.
#[derive(Debug, Clone, Default)]
pub struct HeadlessBackend {
    inner: Rc<RefCell<Inner>>,
}

impl HeadlessBackend {
    /// A backend with no surfaces.
    pub fn new() -> Self {
        Self::default()
    }

    /// A backend with one surface of the given size.
    pub fn with_surface(width: u32, height: u32) -> (Self, vk::SurfaceKHR) {
        let backend = Self::new();
        let surface = backend.add_surface(vk::Extent2D { width, height });
        (backend, surface)
    }

    /// Register a surface the backend will answer queries for.
    pub fn add_surface(&self, extent: vk::Extent2D) -> vk::SurfaceKHR {
        let mut inner = self.inner.borrow_mut();
        let raw = inner.mint();
        inner.surfaces.insert(
            raw,
            SurfaceState {
                caps: default_caps(extent),
                formats: default_formats(),
                present_modes: default_present_modes(),
                fail_acquires: 0,
                fail_presents: 0,
            },
        );
        vk::SurfaceKHR::from_raw(raw)
    }

    /// Resize a surface. The next capability query reports the new extent.
    pub fn set_surface_extent(&self, surface: vk::SurfaceKHR, extent: vk::Extent2D) {
        let mut inner = self.inner.borrow_mut();
        if let Some(state) = inner.surfaces.get_mut(&surface.as_raw()) {
            state.caps.current_extent = extent;
        }
    }

    /// Make the next acquire on this surface's swapchain report staleness.
    pub fn fail_next_acquire(&self, surface: vk::SurfaceKHR) {
        let mut inner = self.inner.borrow_mut();
        if let Some(state) = inner.surfaces.get_mut(&surface.as_raw()) {
            state.fail_acquires += 1;
        }
    }

    /// Make the next present on this surface's swapchain report staleness.
    pub fn fail_next_present(&self, surface: vk::SurfaceKHR) {
        let mut inner = self.inner.borrow_mut();
        if let Some(state) = inner.surfaces.get_mut(&surface.as_raw()) {
            state.fail_presents += 1;
        }
    }

    /// Snapshot of the event log.
    pub fn events(&self) -> Vec<DeviceEvent> {
        self.inner.borrow().events.clone()
    }

    /// Drain the event log, leaving it empty.
    pub fn take_events(&self) -> Vec<DeviceEvent> {
        std::mem::take(&mut self.inner.borrow_mut().events)
    }

    /// Synchronization violations detected so far.
    pub fn violations(&self) -> Vec<String> {
        self.inner.borrow().violations.clone()
    }

    /// Count of live device objects, zero after a clean teardown.
    pub fn live_object_count(&self) -> usize {
        let inner = self.inner.borrow();
        inner.semaphores.len()
            + inner.fences.len()
            + inner.pools.len()
            + inner.swapchains.len()
            + inner.views.len()
    }
}

impl DeviceBackend for HeadlessBackend {
    fn create_binary_semaphore(&mut self, name: &str) -> DeviceResult<vk::Semaphore> {
        let mut inner = self.inner.borrow_mut();
        let raw = inner.mint();
        inner.semaphores.insert(raw, SemaphoreKind::Binary);
        inner.names.insert(raw, name.to_string());
        Ok(vk::Semaphore::from_raw(raw))
    }

    fn create_timeline_semaphore(
        &mut self,
        initial_value: u64,
        name: &str,
    ) -> DeviceResult<vk::Semaphore> {
        let mut inner = self.inner.borrow_mut();
        let raw = inner.mint();
        inner
            .semaphores
            .insert(raw, SemaphoreKind::Timeline(initial_value));
        inner.names.insert(raw, name.to_string());
        Ok(vk::Semaphore::from_raw(raw))
    }

    fn destroy_semaphore(&mut self, semaphore: vk::Semaphore) {
        let mut inner = self.inner.borrow_mut();
        if inner.semaphores.remove(&semaphore.as_raw()).is_none() {
            let what = inner.describe(semaphore.as_raw());
            inner.violation(format!("Destroyed unknown semaphore {what}"));
        }
    }

    fn create_fence(&mut self, signaled: bool, name: &str) -> DeviceResult<vk::Fence> {
        let mut inner = self.inner.borrow_mut();
        let raw = inner.mint();
        let state = if signaled {
            FenceState::Signaled
        } else {
            FenceState::Unsignaled
        };
        inner.fences.insert(
            raw,
            FenceSlot {
                state,
                queue: None,
                guarded_cmds: Vec::new(),
            },
        );
        inner.names.insert(raw, name.to_string());
        Ok(vk::Fence::from_raw(raw))
    }

    fn destroy_fence(&mut self, fence: vk::Fence) {
        let mut inner = self.inner.borrow_mut();
        if inner.fences.remove(&fence.as_raw()).is_none() {
            let what = inner.describe(fence.as_raw());
            inner.violation(format!("Destroyed unknown fence {what}"));
        }
    }

    fn wait_and_reset_fences(&mut self, fences: &[vk::Fence]) -> DeviceResult<()> {
        let mut inner = self.inner.borrow_mut();
        for fence in fences {
            let raw = fence.as_raw();
            let Some(slot) = inner.fences.get(&raw) else {
                let what = inner.describe(raw);
                inner.violation(format!("Waited on unknown fence {what}"));
                continue;
            };
            match slot.state {
                FenceState::Unsignaled => {
                    let what = inner.describe(raw);
                    inner.violation(format!(
                        "Waited on fence {what} that no submission will signal"
                    ));
                }
                FenceState::Pending | FenceState::Signaled => {
                    let slot = inner.fences.get_mut(&raw).ok_or_else(|| {
                        DeviceError::InvalidOperation {
                            reason: "fence vanished mid wait".to_string(),
                        }
                    })?;
                    slot.state = FenceState::Unsignaled;
                    slot.queue = None;
                    let guarded = std::mem::take(&mut slot.guarded_cmds);
                    for cmd in guarded {
                        if let Some(cmd_slot) = inner.cmds.get_mut(&cmd) {
                            if cmd_slot.state == CmdState::InFlight {
                                cmd_slot.state = CmdState::Executable;
                            }
                        }
                    }
                }
            }
        }
        inner.events.push(DeviceEvent::FencesWaited {
            fences: fences.to_vec(),
        });
        Ok(())
    }

    fn create_command_pool(&mut self, queue: QueueKind) -> DeviceResult<vk::CommandPool> {
        let mut inner = self.inner.borrow_mut();
        let raw = inner.mint();
        inner.pools.insert(
            raw,
            PoolState {
                queue,
                cmds: Vec::new(),
            },
        );
        Ok(vk::CommandPool::from_raw(raw))
    }

    fn destroy_command_pool(&mut self, pool: vk::CommandPool) {
        let mut inner = self.inner.borrow_mut();
        match inner.pools.remove(&pool.as_raw()) {
            Some(state) => {
                for cmd in state.cmds {
                    inner.cmds.remove(&cmd);
                }
            }
            None => {
                let what = inner.describe(pool.as_raw());
                inner.violation(format!("Destroyed unknown command pool {what}"));
            }
        }
    }

    fn reset_command_pool(&mut self, pool: vk::CommandPool) -> DeviceResult<()> {
        let mut inner = self.inner.borrow_mut();
        let raw = pool.as_raw();
        let cmds = match inner.pools.get(&raw) {
            Some(state) => state.cmds.clone(),
            None => {
                return Err(DeviceError::InvalidOperation {
                    reason: format!("reset of unknown command pool {raw:#x}"),
                })
            }
        };
        for cmd in cmds {
            let in_flight = inner
                .cmds
                .get(&cmd)
                .map(|slot| slot.state == CmdState::InFlight)
                .unwrap_or(false);
            if in_flight {
                let what = inner.describe(cmd);
                inner.violation(format!(
                    "Command pool reset while buffer {what} may still be executing"
                ));
            }
            if let Some(slot) = inner.cmds.get_mut(&cmd) {
                slot.state = CmdState::Initial;
                slot.queue = None;
            }
        }
        inner.events.push(DeviceEvent::PoolReset { pool });
        Ok(())
    }

    fn allocate_command_buffers(
        &mut self,
        pool: vk::CommandPool,
        count: u32,
    ) -> DeviceResult<Vec<vk::CommandBuffer>> {
        let mut inner = self.inner.borrow_mut();
        let pool_raw = pool.as_raw();
        if !inner.pools.contains_key(&pool_raw) {
            return Err(DeviceError::InvalidOperation {
                reason: format!("allocation from unknown command pool {pool_raw:#x}"),
            });
        }
        let mut out = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let raw = inner.mint();
            inner.cmds.insert(
                raw,
                CmdSlot {
                    pool: pool_raw,
                    state: CmdState::Initial,
                    queue: None,
                },
            );
            if let Some(state) = inner.pools.get_mut(&pool_raw) {
                state.cmds.push(raw);
            }
            out.push(vk::CommandBuffer::from_raw(raw));
        }
        inner
            .events
            .push(DeviceEvent::CommandBuffersAllocated { pool, count });
        Ok(out)
    }

    fn begin_command_buffer(&mut self, cmd: vk::CommandBuffer) -> DeviceResult<()> {
        let mut inner = self.inner.borrow_mut();
        let raw = cmd.as_raw();
        let state = match inner.cmds.get(&raw) {
            Some(slot) => slot.state,
            None => {
                return Err(DeviceError::InvalidOperation {
                    reason: format!("begin of unknown command buffer {raw:#x}"),
                })
            }
        };
        match state {
            CmdState::Initial => {}
            CmdState::Recording => {
                let what = inner.describe(raw);
                inner.violation(format!("Command buffer {what} begun while already recording"));
            }
            CmdState::Executable => {
                let what = inner.describe(raw);
                inner.violation(format!(
                    "Command buffer {what} re-begun without a pool reset"
                ));
            }
            CmdState::InFlight => {
                let what = inner.describe(raw);
                inner.violation(format!(
                    "Command buffer {what} begun while the device may still be executing it"
                ));
            }
        }
        if let Some(slot) = inner.cmds.get_mut(&raw) {
            slot.state = CmdState::Recording;
        }
        Ok(())
    }

    fn end_command_buffer(&mut self, cmd: vk::CommandBuffer) -> DeviceResult<()> {
        let mut inner = self.inner.borrow_mut();
        let raw = cmd.as_raw();
        let state = match inner.cmds.get(&raw) {
            Some(slot) => slot.state,
            None => {
                return Err(DeviceError::InvalidOperation {
                    reason: format!("end of unknown command buffer {raw:#x}"),
                })
            }
        };
        if state != CmdState::Recording {
            let what = inner.describe(raw);
            inner.violation(format!("Command buffer {what} ended while not recording"));
        }
        if let Some(slot) = inner.cmds.get_mut(&raw) {
            slot.state = CmdState::Executable;
        }
        Ok(())
    }

    fn queue_submit(&mut self, queue: QueueKind, request: &SubmitRequest<'_>) -> DeviceResult<()> {
        let mut inner = self.inner.borrow_mut();
        let raw = request.cmd.as_raw();
        let (state, pool) = match inner.cmds.get(&raw) {
            Some(slot) => (slot.state, slot.pool),
            None => {
                return Err(DeviceError::InvalidOperation {
                    reason: format!("submit of unknown command buffer {raw:#x}"),
                })
            }
        };

        match state {
            CmdState::Executable => {}
            CmdState::Initial => {
                let what = inner.describe(raw);
                inner.violation(format!("Command buffer {what} submitted without recording"));
            }
            CmdState::Recording => {
                let what = inner.describe(raw);
                inner.violation(format!("Command buffer {what} submitted before end"));
            }
            CmdState::InFlight => {
                let what = inner.describe(raw);
                inner.violation(format!(
                    "One-time command buffer {what} submitted twice without completing"
                ));
            }
        }

        let pool_queue = inner.pools.get(&pool).map(|p| p.queue);
        if pool_queue != Some(queue) {
            let what = inner.describe(raw);
            inner.violation(format!(
                "Command buffer {what} submitted to {queue:?} but its pool belongs to {pool_queue:?}"
            ));
        }

        inner.check_semaphores_known(request.wait_semaphores, "Submit wait");
        inner.check_semaphores_known(request.signal_semaphores, "Submit signal");

        if request.timeline {
            for (semaphore, &value) in request
                .signal_semaphores
                .iter()
                .zip(request.signal_values.iter())
            {
                let sem_raw = semaphore.as_raw();
                let bad = match inner.semaphores.get_mut(&sem_raw) {
                    Some(SemaphoreKind::Timeline(current)) => {
                        if value <= *current {
                            true
                        } else {
                            *current = value;
                            false
                        }
                    }
                    _ => false,
                };
                if bad {
                    let what = inner.describe(sem_raw);
                    inner.violation(format!(
                        "Timeline semaphore {what} signaled with a non increasing value {value}"
                    ));
                }
            }
        }

        if request.fence != vk::Fence::null() {
            let fence_raw = request.fence.as_raw();
            let fence_state = inner.fences.get(&fence_raw).map(|f| f.state);
            match fence_state {
                None => {
                    let what = inner.describe(fence_raw);
                    inner.violation(format!("Submitted with unknown fence {what}"));
                }
                Some(FenceState::Pending) => {
                    let what = inner.describe(fence_raw);
                    inner.violation(format!("Submitted with fence {what} already in flight"));
                }
                Some(FenceState::Signaled) => {
                    let what = inner.describe(fence_raw);
                    inner.violation(format!(
                        "Submitted with fence {what} still signaled, reset it first"
                    ));
                }
                Some(FenceState::Unsignaled) => {}
            }
            if let Some(slot) = inner.fences.get_mut(&fence_raw) {
                slot.state = FenceState::Pending;
                slot.queue = Some(queue);
                slot.guarded_cmds.push(raw);
            }
        }

        if let Some(slot) = inner.cmds.get_mut(&raw) {
            slot.state = CmdState::InFlight;
            slot.queue = Some(queue);
        }

        inner.events.push(DeviceEvent::Submitted {
            queue,
            cmd: request.cmd,
            waits: request.wait_semaphores.to_vec(),
            wait_values: request.wait_values.to_vec(),
            signals: request.signal_semaphores.to_vec(),
            signal_values: request.signal_values.to_vec(),
            fence: request.fence,
            timeline: request.timeline,
        });
        Ok(())
    }

    fn queue_wait_idle(&mut self, queue: QueueKind) -> DeviceResult<()> {
        let mut inner = self.inner.borrow_mut();
        inner.release_cmds(Some(queue));
        inner.events.push(DeviceEvent::QueueIdled { queue });
        Ok(())
    }

    fn device_wait_idle(&mut self) -> DeviceResult<()> {
        let mut inner = self.inner.borrow_mut();
        inner.release_cmds(None);
        inner.events.push(DeviceEvent::DeviceIdled);
        Ok(())
    }

    fn surface_capabilities(
        &mut self,
        surface: vk::SurfaceKHR,
    ) -> DeviceResult<vk::SurfaceCapabilitiesKHR> {
        let inner = self.inner.borrow();
        inner
            .surfaces
            .get(&surface.as_raw())
            .map(|s| s.caps)
            .ok_or_else(|| DeviceError::InvalidOperation {
                reason: format!("capability query for unknown surface {:#x}", surface.as_raw()),
            })
    }

    fn surface_formats(
        &mut self,
        surface: vk::SurfaceKHR,
    ) -> DeviceResult<Vec<vk::SurfaceFormatKHR>> {
        let inner = self.inner.borrow();
        inner
            .surfaces
            .get(&surface.as_raw())
            .map(|s| s.formats.clone())
            .ok_or_else(|| DeviceError::InvalidOperation {
                reason: format!("format query for unknown surface {:#x}", surface.as_raw()),
            })
    }

    fn surface_present_modes(
        &mut self,
        surface: vk::SurfaceKHR,
    ) -> DeviceResult<Vec<vk::PresentModeKHR>> {
        let inner = self.inner.borrow();
        inner
            .surfaces
            .get(&surface.as_raw())
            .map(|s| s.present_modes.clone())
            .ok_or_else(|| DeviceError::InvalidOperation {
                reason: format!(
                    "present mode query for unknown surface {:#x}",
                    surface.as_raw()
                ),
            })
    }

    fn create_swapchain(
        &mut self,
        surface: vk::SurfaceKHR,
        desc: &SwapchainDesc,
        old: vk::SwapchainKHR,
    ) -> DeviceResult<(vk::SwapchainKHR, Vec<vk::Image>)> {
        let mut inner = self.inner.borrow_mut();
        let surface_raw = surface.as_raw();
        let (min_count, max_count, modes) = match inner.surfaces.get(&surface_raw) {
            Some(state) => (
                state.caps.min_image_count,
                state.caps.max_image_count,
                state.present_modes.clone(),
            ),
            None => {
                return Err(DeviceError::InvalidOperation {
                    reason: format!("swapchain creation on unknown surface {surface_raw:#x}"),
                })
            }
        };

        if desc.image_count < min_count || (max_count > 0 && desc.image_count > max_count) {
            inner.violation(format!(
                "Swapchain image count {} outside the supported range {min_count}..={max_count}",
                desc.image_count
            ));
        }
        if !modes.contains(&desc.present_mode) {
            inner.violation(format!(
                "Swapchain created with unsupported present mode {:?}",
                desc.present_mode
            ));
        }
        if old != vk::SwapchainKHR::null() && !inner.swapchains.contains_key(&old.as_raw()) {
            inner.violation(format!(
                "Swapchain chained to unknown old handle {:#x}",
                old.as_raw()
            ));
        }

        let raw = inner.mint();
        let mut images = Vec::with_capacity(desc.image_count as usize);
        let mut image_handles = Vec::with_capacity(desc.image_count as usize);
        for _ in 0..desc.image_count {
            let image_raw = inner.mint();
            inner.images.insert(image_raw);
            images.push(image_raw);
            image_handles.push(vk::Image::from_raw(image_raw));
        }
        inner.swapchains.insert(
            raw,
            SwapchainState {
                surface: surface_raw,
                extent: (desc.extent.width, desc.extent.height),
                images,
                next_image: 0,
            },
        );
        let swapchain = vk::SwapchainKHR::from_raw(raw);
        inner.events.push(DeviceEvent::SwapchainCreated {
            swapchain,
            old,
            extent: (desc.extent.width, desc.extent.height),
            present_mode: desc.present_mode,
            image_count: desc.image_count,
        });
        Ok((swapchain, image_handles))
    }

    fn destroy_swapchain(&mut self, swapchain: vk::SwapchainKHR) {
        let mut inner = self.inner.borrow_mut();
        match inner.swapchains.remove(&swapchain.as_raw()) {
            Some(state) => {
                for image in state.images {
                    inner.images.remove(&image);
                }
                inner
                    .events
                    .push(DeviceEvent::SwapchainDestroyed { swapchain });
            }
            None => {
                inner.violation(format!(
                    "Destroyed unknown swapchain {:#x}",
                    swapchain.as_raw()
                ));
            }
        }
    }

    fn create_image_view(
        &mut self,
        image: vk::Image,
        _format: vk::Format,
    ) -> DeviceResult<vk::ImageView> {
        let mut inner = self.inner.borrow_mut();
        let image_raw = image.as_raw();
        if !inner.images.contains(&image_raw) {
            inner.violation(format!("View created over unknown image {image_raw:#x}"));
        }
        let raw = inner.mint();
        inner.views.insert(raw, image_raw);
        Ok(vk::ImageView::from_raw(raw))
    }

    fn destroy_image_view(&mut self, view: vk::ImageView) {
        let mut inner = self.inner.borrow_mut();
        if inner.views.remove(&view.as_raw()).is_none() {
            inner.violation(format!("Destroyed unknown image view {:#x}", view.as_raw()));
        }
    }

    fn acquire_next_image(
        &mut self,
        swapchain: vk::SwapchainKHR,
        semaphore: vk::Semaphore,
    ) -> DeviceResult<AcquireOutcome> {
        let mut inner = self.inner.borrow_mut();
        let raw = swapchain.as_raw();
        let (surface, extent, image_count) = match inner.swapchains.get(&raw) {
            Some(state) => (state.surface, state.extent, state.images.len() as u32),
            None => {
                return Err(DeviceError::InvalidOperation {
                    reason: format!("acquire from unknown swapchain {raw:#x}"),
                })
            }
        };
        if !inner.semaphores.contains_key(&semaphore.as_raw()) {
            let what = inner.describe(semaphore.as_raw());
            inner.violation(format!("Acquire signals unknown semaphore {what}"));
        }

        let stale = {
            let Some(surface_state) = inner.surfaces.get_mut(&surface) else {
                return Err(DeviceError::InvalidOperation {
                    reason: format!("acquire on swapchain of unknown surface {surface:#x}"),
                });
            };
            if surface_state.fail_acquires > 0 {
                surface_state.fail_acquires -= 1;
                true
            } else {
                let current = surface_state.caps.current_extent;
                (current.width, current.height) != extent
            }
        };
        if stale {
            return Ok(AcquireOutcome::Stale);
        }

        let index = {
            let state = inner.swapchains.get_mut(&raw).ok_or_else(|| {
                DeviceError::InvalidOperation {
                    reason: "swapchain vanished mid acquire".to_string(),
                }
            })?;
            let index = state.next_image;
            state.next_image = (state.next_image + 1) % image_count;
            index
        };
        inner.events.push(DeviceEvent::ImageAcquired {
            swapchain,
            semaphore,
            image_index: index,
        });
        Ok(AcquireOutcome::Acquired(index))
    }

    fn queue_present(
        &mut self,
        queue: QueueKind,
        wait_semaphores: &[vk::Semaphore],
        requests: &[PresentRequest],
    ) -> DeviceResult<Vec<PresentOutcome>> {
        let mut inner = self.inner.borrow_mut();
        inner.check_semaphores_known(wait_semaphores, "Present wait");

        let mut outcomes = Vec::with_capacity(requests.len());
        for request in requests {
            let raw = request.swapchain.as_raw();
            let (surface, extent, image_count) = match inner.swapchains.get(&raw) {
                Some(state) => (state.surface, state.extent, state.images.len() as u32),
                None => {
                    inner.violation(format!("Present to unknown swapchain {raw:#x}"));
                    outcomes.push(PresentOutcome::Stale);
                    continue;
                }
            };
            if request.image_index >= image_count {
                inner.violation(format!(
                    "Present of out of range image index {} on swapchain {raw:#x}",
                    request.image_index
                ));
            }

            let stale = {
                let Some(surface_state) = inner.surfaces.get_mut(&surface) else {
                    outcomes.push(PresentOutcome::Stale);
                    continue;
                };
                if surface_state.fail_presents > 0 {
                    surface_state.fail_presents -= 1;
                    true
                } else {
                    let current = surface_state.caps.current_extent;
                    (current.width, current.height) != extent
                }
            };
            outcomes.push(if stale {
                PresentOutcome::Stale
            } else {
                PresentOutcome::Presented
            });
        }

        inner.events.push(DeviceEvent::Presented {
            queue,
            waits: wait_semaphores.to_vec(),
            swapchains: requests.iter().map(|r| r.swapchain).collect(),
            outcomes: outcomes.clone(),
        });
        Ok(outcomes)
    }

    fn cmd_transition_to_present(&mut self, cmd: vk::CommandBuffer, images: &[vk::Image]) {
        let mut inner = self.inner.borrow_mut();
        let recording = inner
            .cmds
            .get(&cmd.as_raw())
            .map(|slot| slot.state == CmdState::Recording)
            .unwrap_or(false);
        if !recording {
            let what = inner.describe(cmd.as_raw());
            inner.violation(format!(
                "Layout transition recorded into {what} which is not recording"
            ));
        }
        inner.events.push(DeviceEvent::TransitionedToPresent {
            cmd,
            image_count: images.len(),
        });
    }

    fn cmd_blit_to_swapchain(
        &mut self,
        cmd: vk::CommandBuffer,
        src_image: vk::Image,
        _src_extent: vk::Extent2D,
        _filter: vk::Filter,
        dst_image: vk::Image,
        _dst_extent: vk::Extent2D,
    ) {
        let mut inner = self.inner.borrow_mut();
        let recording = inner
            .cmds
            .get(&cmd.as_raw())
            .map(|slot| slot.state == CmdState::Recording)
            .unwrap_or(false);
        if !recording {
            let what = inner.describe(cmd.as_raw());
            inner.violation(format!("Blit recorded into {what} which is not recording"));
        }
        inner.events.push(DeviceEvent::BlitRecorded {
            cmd,
            src: src_image,
            dst: dst_image,
        });
    }
}
