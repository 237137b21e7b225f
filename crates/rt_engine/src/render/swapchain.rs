//! Presentation surface management
//!
//! A [`Swapchain`] wraps one window surface. Creation is lazy: nothing is
//! built until the first acquire, and from then on the swapchain rebuilds
//! itself whenever the surface extent changes, the vsync request flips, or
//! the driver reports it out of date. Rebuilds pass the retired handle to
//! the new one so the driver can carry resources over without flicker.
//!
//! Parties that derive resources from swapchain images register a
//! [`SwapchainSubscriber`]. Around every rebuild, all subscribers hear
//! `on_swapchain_destroy` strictly before any image is destroyed, and
//! `on_swapchain_create` only after the new images exist.

use ash::vk;
use slotmap::SlotMap;

use crate::msg::{MessageSeverity, MessageSink};
use crate::render::api::{
    AcquireOutcome, DeviceBackend, DeviceError, DeviceResult, PresentOutcome, SwapchainDesc,
};
use crate::render::commands::CommandBufferManager;

slotmap::new_key_type! {
    /// Stable handle for a registered [`SwapchainSubscriber`].
    pub struct SubscriberKey;
}

/// Snapshot of a freshly created swapchain, handed to subscribers.
#[derive(Debug, Clone)]
pub struct SwapchainProperties {
    /// Extent of every image in the swapchain
    pub extent: vk::Extent2D,
    /// Color format and color space of the images
    pub format: vk::SurfaceFormatKHR,
    /// The swapchain images, index-aligned with `views`
    pub images: Vec<vk::Image>,
    /// One color view per image
    pub views: Vec<vk::ImageView>,
}

/// Receives lifecycle notifications around swapchain rebuilds.
pub trait SwapchainSubscriber {
    /// The current images are about to be destroyed. Drop any resource
    /// derived from them before returning.
    fn on_swapchain_destroy(&mut self);

    /// A new set of images exists and is safe to build resources against.
    fn on_swapchain_create(&mut self, properties: &SwapchainProperties);
}

const MAX_ACQUIRE_ATTEMPTS: u32 = 8;

/// One presentable surface and its current swapchain, if any.
pub struct Swapchain {
    surface: vk::SurfaceKHR,
    handle: vk::SwapchainKHR,
    format: vk::SurfaceFormatKHR,
    extent: vk::Extent2D,
    preferred_image_count: u32,
    images: Vec<vk::Image>,
    views: Vec<vk::ImageView>,
    current_image: Option<u32>,
    vsync: bool,
    requested_vsync: bool,
    subscribers: SlotMap<SubscriberKey, Box<dyn SwapchainSubscriber>>,
    recreations: u64,
}

impl Swapchain {
    /// Bind to a surface without touching the device. The swapchain itself
    /// is built on the first [`Self::acquire_image`] call.
    pub fn new(surface: vk::SurfaceKHR, preferred_image_count: u32, vsync: bool) -> Self {
        Self {
            surface,
            handle: vk::SwapchainKHR::null(),
            format: vk::SurfaceFormatKHR::default(),
            extent: vk::Extent2D::default(),
            preferred_image_count,
            images: Vec::new(),
            views: Vec::new(),
            current_image: None,
            vsync,
            requested_vsync: vsync,
            subscribers: SlotMap::with_key(),
            recreations: 0,
        }
    }

    /// Acquire the next presentable image, signaling `semaphore` when it is
    /// ready. Rebuilds the swapchain first if the surface demands it, and
    /// again if the acquire itself reports a stale swapchain.
    ///
    /// Returns `None` when the surface currently has zero area (minimized
    /// window). The frame must then run without presenting to this surface.
    pub fn acquire_image(
        &mut self,
        backend: &mut dyn DeviceBackend,
        cmds: &mut CommandBufferManager,
        msg: &mut MessageSink,
        semaphore: vk::Semaphore,
    ) -> DeviceResult<Option<u32>> {
        self.current_image = None;
        self.ensure_current(backend, cmds, msg)?;
        if self.handle == vk::SwapchainKHR::null() {
            return Ok(None);
        }

        for _ in 0..MAX_ACQUIRE_ATTEMPTS {
            match backend.acquire_next_image(self.handle, semaphore)? {
                AcquireOutcome::Acquired(index) => {
                    self.current_image = Some(index);
                    return Ok(Some(index));
                }
                AcquireOutcome::Stale => {
                    msg.print(
                        MessageSeverity::VERBOSE,
                        "Swapchain out of date at acquire, recreating",
                    );
                    self.recreate(backend, cmds, msg)?;
                    if self.handle == vk::SwapchainKHR::null() {
                        return Ok(None);
                    }
                }
            }
        }

        Err(DeviceError::Api(vk::Result::ERROR_OUT_OF_DATE_KHR))
    }

    /// Handle the present result for the image acquired this frame. A stale
    /// result triggers an immediate rebuild so the next acquire starts from
    /// a swapchain that matches the surface.
    pub fn on_queue_present(
        &mut self,
        backend: &mut dyn DeviceBackend,
        cmds: &mut CommandBufferManager,
        msg: &mut MessageSink,
        outcome: PresentOutcome,
    ) -> DeviceResult<()> {
        self.current_image = None;
        if outcome == PresentOutcome::Stale {
            msg.print(
                MessageSeverity::VERBOSE,
                "Swapchain out of date at present, recreating",
            );
            self.recreate(backend, cmds, msg)?;
        }
        Ok(())
    }

    /// Record a blit of `src_image` onto the image acquired this frame,
    /// scaling to the swapchain extent. No-op if no image is acquired.
    pub fn blit_for_present(
        &self,
        backend: &mut dyn DeviceBackend,
        cmd: vk::CommandBuffer,
        src_image: vk::Image,
        src_extent: vk::Extent2D,
        filter: vk::Filter,
    ) -> DeviceResult<()> {
        let Some(index) = self.current_image else {
            return Ok(());
        };
        let dst_image = self.images[index as usize];
        backend.cmd_blit_to_swapchain(cmd, src_image, src_extent, filter, dst_image, self.extent);
        Ok(())
    }

    /// Request a vsync mode. Takes effect on the next acquire; a change
    /// relative to the live swapchain forces a rebuild there.
    pub fn request_vsync(&mut self, vsync: bool) {
        self.requested_vsync = vsync;
    }

    /// Register a subscriber. It is notified starting with the next rebuild.
    pub fn subscribe(&mut self, subscriber: Box<dyn SwapchainSubscriber>) -> SubscriberKey {
        self.subscribers.insert(subscriber)
    }

    /// Remove a subscriber. Returns false if the key was already gone.
    pub fn unsubscribe(&mut self, key: SubscriberKey) -> bool {
        self.subscribers.remove(key).is_some()
    }

    /// Image index acquired by the current frame, if any.
    pub fn current_image(&self) -> Option<u32> {
        self.current_image
    }

    /// Extent of the live swapchain images.
    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    /// Format of the live swapchain images.
    pub fn format(&self) -> vk::SurfaceFormatKHR {
        self.format
    }

    /// Number of images in the live swapchain.
    pub fn image_count(&self) -> usize {
        self.images.len()
    }

    /// How many times a swapchain has been built for this surface, the
    /// lazy first build included.
    pub fn recreations(&self) -> u64 {
        self.recreations
    }

    /// Raw swapchain handle, null before the first build.
    pub fn handle(&self) -> vk::SwapchainKHR {
        self.handle
    }

    /// Tear down views and the swapchain handle. The caller must have
    /// waited for the device to go idle.
    pub fn destroy(&mut self, backend: &mut dyn DeviceBackend) {
        for (_, subscriber) in self.subscribers.iter_mut() {
            subscriber.on_swapchain_destroy();
        }
        for view in self.views.drain(..) {
            backend.destroy_image_view(view);
        }
        self.images.clear();
        self.current_image = None;
        if self.handle != vk::SwapchainKHR::null() {
            backend.destroy_swapchain(self.handle);
            self.handle = vk::SwapchainKHR::null();
        }
    }

    /// Build the swapchain if there is none, or rebuild it if the surface
    /// extent or the vsync request no longer match the live one.
    fn ensure_current(
        &mut self,
        backend: &mut dyn DeviceBackend,
        cmds: &mut CommandBufferManager,
        msg: &mut MessageSink,
    ) -> DeviceResult<()> {
        let caps = backend.surface_capabilities(self.surface)?;
        let desired = calculate_optimal_extent(&caps);
        if desired.width == 0 || desired.height == 0 {
            return Ok(());
        }

        let extent_changed =
            desired.width != self.extent.width || desired.height != self.extent.height;
        if self.handle == vk::SwapchainKHR::null() {
            self.create_from_surface(backend, cmds, msg, vk::SwapchainKHR::null())?;
            self.notify_created();
        } else if extent_changed || self.requested_vsync != self.vsync {
            self.recreate(backend, cmds, msg)?;
        }
        Ok(())
    }

    /// Full rebuild: destroy notifications, views down, new swapchain
    /// chained to the old handle, old handle destroyed only after the new
    /// one exists, create notifications last.
    fn recreate(
        &mut self,
        backend: &mut dyn DeviceBackend,
        cmds: &mut CommandBufferManager,
        msg: &mut MessageSink,
    ) -> DeviceResult<()> {
        backend.device_wait_idle()?;

        for (_, subscriber) in self.subscribers.iter_mut() {
            subscriber.on_swapchain_destroy();
        }
        for view in self.views.drain(..) {
            backend.destroy_image_view(view);
        }
        self.images.clear();
        self.current_image = None;

        let old = self.handle;
        self.handle = vk::SwapchainKHR::null();
        self.create_from_surface(backend, cmds, msg, old)?;
        if old != vk::SwapchainKHR::null() {
            backend.destroy_swapchain(old);
        }

        self.notify_created();
        Ok(())
    }

    fn notify_created(&mut self) {
        if self.handle == vk::SwapchainKHR::null() {
            return;
        }
        self.recreations += 1;
        let properties = SwapchainProperties {
            extent: self.extent,
            format: self.format,
            images: self.images.clone(),
            views: self.views.clone(),
        };
        for (_, subscriber) in self.subscribers.iter_mut() {
            subscriber.on_swapchain_create(&properties);
        }
    }

    /// Query the surface, create the swapchain and its views, and move the
    /// new images to present layout with a one-shot command buffer. Leaves
    /// the handle null when the surface has zero area.
    fn create_from_surface(
        &mut self,
        backend: &mut dyn DeviceBackend,
        cmds: &mut CommandBufferManager,
        msg: &mut MessageSink,
        old: vk::SwapchainKHR,
    ) -> DeviceResult<()> {
        let caps = backend.surface_capabilities(self.surface)?;
        let extent = calculate_optimal_extent(&caps);
        if extent.width == 0 || extent.height == 0 {
            return Ok(());
        }

        let formats = backend.surface_formats(self.surface)?;
        let format = choose_surface_format(&formats).ok_or_else(|| {
            DeviceError::InitializationFailed("Surface reports no formats".to_string())
        })?;
        let modes = backend.surface_present_modes(self.surface)?;
        let present_mode = choose_present_mode(&modes, self.requested_vsync, msg);
        let image_count = clamp_image_count(self.preferred_image_count, &caps);

        let desc = SwapchainDesc {
            format,
            present_mode,
            extent,
            image_count,
        };
        let (handle, images) = backend.create_swapchain(self.surface, &desc, old)?;
        let mut views = Vec::with_capacity(images.len());
        for &image in &images {
            views.push(backend.create_image_view(image, format.format)?);
        }

        self.handle = handle;
        self.images = images;
        self.views = views;
        self.extent = extent;
        self.format = format;
        self.vsync = self.requested_vsync;

        // New images start in undefined layout. Move them all to present
        // layout now so the first frame can treat every image uniformly.
        let cmd = cmds.start_graphics_cmd(backend)?;
        backend.cmd_transition_to_present(cmd, &self.images);
        cmds.submit(backend, cmd, vk::Fence::null())?;
        cmds.wait_graphics_idle(backend)?;

        log::info!(
            "Created swapchain: {}x{}, {} images, {:?}",
            extent.width,
            extent.height,
            self.images.len(),
            present_mode
        );
        Ok(())
    }
}

/// Surface extent to build against. `u32::MAX` in `current_extent` is the
/// sentinel for "the swapchain decides", in which case the largest
/// supported extent is used.
pub fn calculate_optimal_extent(caps: &vk::SurfaceCapabilitiesKHR) -> vk::Extent2D {
    if caps.current_extent.width != u32::MAX {
        caps.current_extent
    } else {
        caps.max_image_extent
    }
}

/// Pick a swapchain format: sRGB BGRA if the surface offers it, then sRGB
/// RGBA, then whatever comes first. `None` only for an empty list.
pub fn choose_surface_format(formats: &[vk::SurfaceFormatKHR]) -> Option<vk::SurfaceFormatKHR> {
    let preferred = [vk::Format::B8G8R8A8_SRGB, vk::Format::R8G8B8A8_SRGB];
    for want in preferred {
        if let Some(found) = formats.iter().find(|f| {
            f.format == want && f.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
        }) {
            return Some(*found);
        }
    }
    formats.first().copied()
}

/// Pick a present mode for the requested vsync state. FIFO is the only
/// mode the surface is guaranteed to support, so both branches can fall
/// back to it.
pub fn choose_present_mode(
    modes: &[vk::PresentModeKHR],
    vsync: bool,
    msg: &mut MessageSink,
) -> vk::PresentModeKHR {
    if vsync {
        if modes.contains(&vk::PresentModeKHR::FIFO_RELAXED) {
            vk::PresentModeKHR::FIFO_RELAXED
        } else {
            vk::PresentModeKHR::FIFO
        }
    } else if modes.contains(&vk::PresentModeKHR::IMMEDIATE) {
        vk::PresentModeKHR::IMMEDIATE
    } else {
        msg.print(
            MessageSeverity::WARNING,
            "Immediate present mode is not supported, falling back to FIFO",
        );
        vk::PresentModeKHR::FIFO
    }
}

/// Clamp the preferred image count into the surface's supported range.
/// A `max_image_count` of zero means the surface imposes no upper bound.
pub fn clamp_image_count(preferred: u32, caps: &vk::SurfaceCapabilitiesKHR) -> u32 {
    let mut count = preferred.max(caps.min_image_count);
    if caps.max_image_count > 0 {
        count = count.min(caps.max_image_count);
    }
    count
}
