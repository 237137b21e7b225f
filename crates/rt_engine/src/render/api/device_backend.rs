//! Device backend abstraction
//!
//! This trait is the single seam between the frame-pipelining core and the
//! graphics API. The production implementation drives Vulkan through `ash`;
//! the headless implementation records every interaction so the whole engine
//! can be exercised without a GPU. Handle types are `ash::vk` newtypes, which
//! are plain ids and carry no driver state of their own.

use ash::vk;
use thiserror::Error;

/// Device-level error types
#[derive(Error, Debug)]
pub enum DeviceError {
    /// General graphics API error with result code
    #[error("Vulkan API error: {0:?}")]
    Api(vk::Result),

    /// Invalid operation attempted
    #[error("Invalid operation: {reason}")]
    InvalidOperation {
        /// Description of why the operation is invalid
        reason: String,
    },

    /// Device or backend initialization failed
    #[error("Initialization failed: {0}")]
    InitializationFailed(String),
}

/// Result type for device operations
pub type DeviceResult<T> = Result<T, DeviceError>;

/// The three queue families the engine records and submits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueKind {
    /// Graphics queue; also the presentation queue
    Graphics,
    /// Compute queue (dedicated family when the device has one)
    Compute,
    /// Transfer queue (dedicated family when the device has one)
    Transfer,
}

/// One queue submission.
///
/// Covers both semaphore flavors: with `timeline` set, `wait_values` and
/// `signal_values` must parallel the semaphore slices and carry the 64-bit
/// counters; binary submissions leave the value slices empty.
#[derive(Debug, Clone, Copy)]
pub struct SubmitRequest<'a> {
    /// Ended command buffer to submit
    pub cmd: vk::CommandBuffer,
    /// Semaphores the submission waits on
    pub wait_semaphores: &'a [vk::Semaphore],
    /// Timeline wait counters, parallel to `wait_semaphores`
    pub wait_values: &'a [u64],
    /// Semaphores the submission signals
    pub signal_semaphores: &'a [vk::Semaphore],
    /// Timeline signal counters, parallel to `signal_semaphores`
    pub signal_values: &'a [u64],
    /// Fence signaled on completion; may be null
    pub fence: vk::Fence,
    /// Whether the value slices are meaningful
    pub timeline: bool,
}

/// Result of one swapchain image acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireOutcome {
    /// Image at this index is acquired; the acquire semaphore will signal
    Acquired(u32),
    /// Swapchain is stale or suboptimal and must be recreated
    Stale,
}

/// Per-swapchain result of one present call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresentOutcome {
    /// Image queued for presentation
    Presented,
    /// This swapchain is stale or suboptimal and must be recreated
    Stale,
}

/// One swapchain's entry in a present call.
#[derive(Debug, Clone, Copy)]
pub struct PresentRequest {
    /// Swapchain to present on
    pub swapchain: vk::SwapchainKHR,
    /// Previously acquired image index
    pub image_index: u32,
}

/// Parameters for swapchain creation, already resolved against the surface.
#[derive(Debug, Clone, Copy)]
pub struct SwapchainDesc {
    /// Image format and color space
    pub format: vk::SurfaceFormatKHR,
    /// Presentation mode
    pub present_mode: vk::PresentModeKHR,
    /// Image extent in pixels
    pub extent: vk::Extent2D,
    /// Minimum image count
    pub image_count: u32,
}

/// Object-safe device interface the frame core runs on.
///
/// Components hold no device state; they receive `&mut dyn DeviceBackend` per
/// call, mirroring how the rest of the engine passes its context around.
pub trait DeviceBackend {
    /// Create a binary semaphore; `name` feeds debug-utils labeling
    fn create_binary_semaphore(&mut self, name: &str) -> DeviceResult<vk::Semaphore>;

    /// Create a timeline semaphore starting at `initial_value`
    fn create_timeline_semaphore(&mut self, initial_value: u64, name: &str)
        -> DeviceResult<vk::Semaphore>;

    /// Destroy a semaphore
    fn destroy_semaphore(&mut self, semaphore: vk::Semaphore);

    /// Create a fence, optionally in the signaled state
    fn create_fence(&mut self, signaled: bool, name: &str) -> DeviceResult<vk::Fence>;

    /// Destroy a fence
    fn destroy_fence(&mut self, fence: vk::Fence);

    /// Block until every fence is signaled, then reset them all
    fn wait_and_reset_fences(&mut self, fences: &[vk::Fence]) -> DeviceResult<()>;

    /// Create a command pool on the given queue family
    fn create_command_pool(&mut self, queue: QueueKind) -> DeviceResult<vk::CommandPool>;

    /// Destroy a command pool and every buffer allocated from it
    fn destroy_command_pool(&mut self, pool: vk::CommandPool);

    /// Reset a pool, returning all its buffers to the initial state
    fn reset_command_pool(&mut self, pool: vk::CommandPool) -> DeviceResult<()>;

    /// Allocate `count` primary command buffers from `pool`
    fn allocate_command_buffers(
        &mut self,
        pool: vk::CommandPool,
        count: u32,
    ) -> DeviceResult<Vec<vk::CommandBuffer>>;

    /// Begin one-time-submit recording
    fn begin_command_buffer(&mut self, cmd: vk::CommandBuffer) -> DeviceResult<()>;

    /// End recording
    fn end_command_buffer(&mut self, cmd: vk::CommandBuffer) -> DeviceResult<()>;

    /// Submit one command buffer to a queue
    fn queue_submit(&mut self, queue: QueueKind, request: &SubmitRequest<'_>) -> DeviceResult<()>;

    /// Block until the queue drains
    fn queue_wait_idle(&mut self, queue: QueueKind) -> DeviceResult<()>;

    /// Block until the whole device drains
    fn device_wait_idle(&mut self) -> DeviceResult<()>;

    /// Query surface capabilities
    fn surface_capabilities(
        &mut self,
        surface: vk::SurfaceKHR,
    ) -> DeviceResult<vk::SurfaceCapabilitiesKHR>;

    /// Query supported surface formats
    fn surface_formats(
        &mut self,
        surface: vk::SurfaceKHR,
    ) -> DeviceResult<Vec<vk::SurfaceFormatKHR>>;

    /// Query supported present modes
    fn surface_present_modes(
        &mut self,
        surface: vk::SurfaceKHR,
    ) -> DeviceResult<Vec<vk::PresentModeKHR>>;

    /// Create a swapchain; `old` may be a retired handle reused by the driver
    /// to keep presentation seamless, and stays valid until destroyed by the
    /// caller afterwards
    fn create_swapchain(
        &mut self,
        surface: vk::SurfaceKHR,
        desc: &SwapchainDesc,
        old: vk::SwapchainKHR,
    ) -> DeviceResult<(vk::SwapchainKHR, Vec<vk::Image>)>;

    /// Destroy a swapchain handle
    fn destroy_swapchain(&mut self, swapchain: vk::SwapchainKHR);

    /// Create a 2D color view over a swapchain image
    fn create_image_view(
        &mut self,
        image: vk::Image,
        format: vk::Format,
    ) -> DeviceResult<vk::ImageView>;

    /// Destroy an image view
    fn destroy_image_view(&mut self, view: vk::ImageView);

    /// Acquire the next image, signaling `semaphore` when it is ready
    fn acquire_next_image(
        &mut self,
        swapchain: vk::SwapchainKHR,
        semaphore: vk::Semaphore,
    ) -> DeviceResult<AcquireOutcome>;

    /// Present to one or more swapchains in a single call; the returned
    /// vector carries one outcome per request, in request order
    fn queue_present(
        &mut self,
        queue: QueueKind,
        wait_semaphores: &[vk::Semaphore],
        requests: &[PresentRequest],
    ) -> DeviceResult<Vec<PresentOutcome>>;

    /// Record layout transitions moving `images` to the present layout
    fn cmd_transition_to_present(&mut self, cmd: vk::CommandBuffer, images: &[vk::Image]);

    /// Record a full-image blit onto a swapchain image, with layout
    /// round-trips from and back to the present layout on the destination
    fn cmd_blit_to_swapchain(
        &mut self,
        cmd: vk::CommandBuffer,
        src_image: vk::Image,
        src_extent: vk::Extent2D,
        filter: vk::Filter,
        dst_image: vk::Image,
        dst_extent: vk::Extent2D,
    );
}
