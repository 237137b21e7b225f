//! The production device backend

use std::ffi::CString;

use ash::extensions::ext::DebugUtils;
use ash::extensions::khr;
use ash::vk;
use ash::vk::Handle;

use crate::engine::WindowHandles;
use crate::render::api::{
    AcquireOutcome, DeviceBackend, DeviceError, DeviceResult, PresentOutcome, PresentRequest,
    QueueKind, SubmitRequest, SwapchainDesc,
};

use super::device::{select_physical_device, LogicalDevice};
use super::instance::VulkanInstance;

fn color_subresource_range() -> vk::ImageSubresourceRange {
    vk::ImageSubresourceRange {
        aspect_mask: vk::ImageAspectFlags::COLOR,
        base_mip_level: 0,
        level_count: 1,
        base_array_layer: 0,
        layer_count: 1,
    }
}

fn color_subresource_layers() -> vk::ImageSubresourceLayers {
    vk::ImageSubresourceLayers {
        aspect_mask: vk::ImageAspectFlags::COLOR,
        mip_level: 0,
        base_array_layer: 0,
        layer_count: 1,
    }
}

/// [`DeviceBackend`] over a real Vulkan device.
///
/// Owns the whole API stack from loaded entry points down to the logical
/// device and the window surfaces. Dropping the backend tears the stack
/// down in reverse order; the device must be idle by then.
pub struct VulkanBackend {
    device: LogicalDevice,
    physical_device: vk::PhysicalDevice,
    swapchain_loader: khr::Swapchain,
    surface_loader: khr::Surface,
    surfaces: Vec<vk::SurfaceKHR>,
    debug_utils: Option<DebugUtils>,
    instance: VulkanInstance,
}

impl VulkanBackend {
    /// Bring up Vulkan against the host's windows. Returns the backend
    /// plus the surface for each window, in the order given.
    pub fn create(
        app_name: &str,
        enable_validation: bool,
        window: &WindowHandles,
        overlay_window: Option<&WindowHandles>,
    ) -> DeviceResult<(Self, vk::SurfaceKHR, Option<vk::SurfaceKHR>)> {
        let instance = VulkanInstance::new(app_name, enable_validation, window.display)?;
        let surface_loader = khr::Surface::new(instance.entry(), instance.instance());

        let primary = unsafe {
            ash_window::create_surface(
                instance.entry(),
                instance.instance(),
                window.display,
                window.window,
                None,
            )
        }
        .map_err(DeviceError::Api)?;
        let overlay = match overlay_window {
            Some(handles) => Some(
                unsafe {
                    ash_window::create_surface(
                        instance.entry(),
                        instance.instance(),
                        handles.display,
                        handles.window,
                        None,
                    )
                }
                .map_err(DeviceError::Api)?,
            ),
            None => None,
        };

        let selection = select_physical_device(instance.instance(), &surface_loader, primary)?;
        log::info!("Using GPU: {}", selection.name);
        let device = LogicalDevice::new(instance.instance(), &selection)?;
        let swapchain_loader = khr::Swapchain::new(instance.instance(), device.device());
        let debug_utils = instance.debug_utils().cloned();

        let mut surfaces = vec![primary];
        if let Some(surface) = overlay {
            surfaces.push(surface);
        }

        Ok((
            Self {
                device,
                physical_device: selection.device,
                swapchain_loader,
                surface_loader,
                surfaces,
                debug_utils,
                instance,
            },
            primary,
            overlay,
        ))
    }

    fn name_object(&self, object_type: vk::ObjectType, handle: u64, name: &str) {
        let Some(debug_utils) = &self.debug_utils else {
            return;
        };
        let Ok(name_c) = CString::new(name) else {
            return;
        };
        let info = vk::DebugUtilsObjectNameInfoEXT::builder()
            .object_type(object_type)
            .object_handle(handle)
            .object_name(&name_c);
        let _ = unsafe {
            debug_utils.set_debug_utils_object_name(self.device.device().handle(), &info)
        };
    }
}

impl DeviceBackend for VulkanBackend {
    fn create_binary_semaphore(&mut self, name: &str) -> DeviceResult<vk::Semaphore> {
        let info = vk::SemaphoreCreateInfo::builder();
        let semaphore = unsafe { self.device.device().create_semaphore(&info, None) }
            .map_err(DeviceError::Api)?;
        self.name_object(vk::ObjectType::SEMAPHORE, semaphore.as_raw(), name);
        Ok(semaphore)
    }

    fn create_timeline_semaphore(
        &mut self,
        initial_value: u64,
        name: &str,
    ) -> DeviceResult<vk::Semaphore> {
        let mut type_info = vk::SemaphoreTypeCreateInfo::builder()
            .semaphore_type(vk::SemaphoreType::TIMELINE)
            .initial_value(initial_value);
        let info = vk::SemaphoreCreateInfo::builder().push_next(&mut type_info);
        let semaphore = unsafe { self.device.device().create_semaphore(&info, None) }
            .map_err(DeviceError::Api)?;
        self.name_object(vk::ObjectType::SEMAPHORE, semaphore.as_raw(), name);
        Ok(semaphore)
    }

    fn destroy_semaphore(&mut self, semaphore: vk::Semaphore) {
        unsafe {
            self.device.device().destroy_semaphore(semaphore, None);
        }
    }

    fn create_fence(&mut self, signaled: bool, name: &str) -> DeviceResult<vk::Fence> {
        let flags = if signaled {
            vk::FenceCreateFlags::SIGNALED
        } else {
            vk::FenceCreateFlags::empty()
        };
        let info = vk::FenceCreateInfo::builder().flags(flags);
        let fence = unsafe { self.device.device().create_fence(&info, None) }
            .map_err(DeviceError::Api)?;
        self.name_object(vk::ObjectType::FENCE, fence.as_raw(), name);
        Ok(fence)
    }

    fn destroy_fence(&mut self, fence: vk::Fence) {
        unsafe {
            self.device.device().destroy_fence(fence, None);
        }
    }

    fn wait_and_reset_fences(&mut self, fences: &[vk::Fence]) -> DeviceResult<()> {
        if fences.is_empty() {
            return Ok(());
        }
        unsafe {
            self.device
                .device()
                .wait_for_fences(fences, true, u64::MAX)
                .map_err(DeviceError::Api)?;
            self.device
                .device()
                .reset_fences(fences)
                .map_err(DeviceError::Api)
        }
    }

    fn create_command_pool(&mut self, queue: QueueKind) -> DeviceResult<vk::CommandPool> {
        let info = vk::CommandPoolCreateInfo::builder()
            .queue_family_index(self.device.family_index(queue));
        unsafe { self.device.device().create_command_pool(&info, None) }
            .map_err(DeviceError::Api)
    }

    fn destroy_command_pool(&mut self, pool: vk::CommandPool) {
        unsafe {
            self.device.device().destroy_command_pool(pool, None);
        }
    }

    fn reset_command_pool(&mut self, pool: vk::CommandPool) -> DeviceResult<()> {
        unsafe {
            self.device
                .device()
                .reset_command_pool(pool, vk::CommandPoolResetFlags::empty())
        }
        .map_err(DeviceError::Api)
    }

    fn allocate_command_buffers(
        &mut self,
        pool: vk::CommandPool,
        count: u32,
    ) -> DeviceResult<Vec<vk::CommandBuffer>> {
        let info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(count);
        unsafe { self.device.device().allocate_command_buffers(&info) }
            .map_err(DeviceError::Api)
    }

    fn begin_command_buffer(&mut self, cmd: vk::CommandBuffer) -> DeviceResult<()> {
        let info = vk::CommandBufferBeginInfo::builder()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        unsafe { self.device.device().begin_command_buffer(cmd, &info) }
            .map_err(DeviceError::Api)
    }

    fn end_command_buffer(&mut self, cmd: vk::CommandBuffer) -> DeviceResult<()> {
        unsafe { self.device.device().end_command_buffer(cmd) }.map_err(DeviceError::Api)
    }

    fn queue_submit(&mut self, queue: QueueKind, request: &SubmitRequest<'_>) -> DeviceResult<()> {
        let stages =
            vec![vk::PipelineStageFlags::ALL_COMMANDS; request.wait_semaphores.len()];
        let cmds = [request.cmd];
        let mut timeline_info = vk::TimelineSemaphoreSubmitInfo::builder()
            .wait_semaphore_values(request.wait_values)
            .signal_semaphore_values(request.signal_values);
        let mut submit = vk::SubmitInfo::builder()
            .wait_semaphores(request.wait_semaphores)
            .wait_dst_stage_mask(&stages)
            .command_buffers(&cmds)
            .signal_semaphores(request.signal_semaphores);
        if request.timeline {
            submit = submit.push_next(&mut timeline_info);
        }
        unsafe {
            self.device.device().queue_submit(
                self.device.queue(queue),
                &[submit.build()],
                request.fence,
            )
        }
        .map_err(DeviceError::Api)
    }

    fn queue_wait_idle(&mut self, queue: QueueKind) -> DeviceResult<()> {
        unsafe { self.device.device().queue_wait_idle(self.device.queue(queue)) }
            .map_err(DeviceError::Api)
    }

    fn device_wait_idle(&mut self) -> DeviceResult<()> {
        unsafe { self.device.device().device_wait_idle() }.map_err(DeviceError::Api)
    }

    fn surface_capabilities(
        &mut self,
        surface: vk::SurfaceKHR,
    ) -> DeviceResult<vk::SurfaceCapabilitiesKHR> {
        unsafe {
            self.surface_loader
                .get_physical_device_surface_capabilities(self.physical_device, surface)
        }
        .map_err(DeviceError::Api)
    }

    fn surface_formats(
        &mut self,
        surface: vk::SurfaceKHR,
    ) -> DeviceResult<Vec<vk::SurfaceFormatKHR>> {
        unsafe {
            self.surface_loader
                .get_physical_device_surface_formats(self.physical_device, surface)
        }
        .map_err(DeviceError::Api)
    }

    fn surface_present_modes(
        &mut self,
        surface: vk::SurfaceKHR,
    ) -> DeviceResult<Vec<vk::PresentModeKHR>> {
        unsafe {
            self.surface_loader
                .get_physical_device_surface_present_modes(self.physical_device, surface)
        }
        .map_err(DeviceError::Api)
    }

    fn create_swapchain(
        &mut self,
        surface: vk::SurfaceKHR,
        desc: &SwapchainDesc,
        old: vk::SwapchainKHR,
    ) -> DeviceResult<(vk::SwapchainKHR, Vec<vk::Image>)> {
        let caps = unsafe {
            self.surface_loader
                .get_physical_device_surface_capabilities(self.physical_device, surface)
        }
        .map_err(DeviceError::Api)?;

        let info = vk::SwapchainCreateInfoKHR::builder()
            .surface(surface)
            .min_image_count(desc.image_count)
            .image_format(desc.format.format)
            .image_color_space(desc.format.color_space)
            .image_extent(desc.extent)
            .image_array_layers(1)
            .image_usage(
                vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::TRANSFER_DST,
            )
            .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
            .pre_transform(caps.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(desc.present_mode)
            .clipped(true)
            .old_swapchain(old);

        let swapchain = unsafe { self.swapchain_loader.create_swapchain(&info, None) }
            .map_err(DeviceError::Api)?;
        let images = unsafe { self.swapchain_loader.get_swapchain_images(swapchain) }
            .map_err(DeviceError::Api)?;
        Ok((swapchain, images))
    }

    fn destroy_swapchain(&mut self, swapchain: vk::SwapchainKHR) {
        unsafe {
            self.swapchain_loader.destroy_swapchain(swapchain, None);
        }
    }

    fn create_image_view(
        &mut self,
        image: vk::Image,
        format: vk::Format,
    ) -> DeviceResult<vk::ImageView> {
        let info = vk::ImageViewCreateInfo::builder()
            .image(image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(format)
            .components(vk::ComponentMapping::default())
            .subresource_range(color_subresource_range());
        unsafe { self.device.device().create_image_view(&info, None) }
            .map_err(DeviceError::Api)
    }

    fn destroy_image_view(&mut self, view: vk::ImageView) {
        unsafe {
            self.device.device().destroy_image_view(view, None);
        }
    }

    fn acquire_next_image(
        &mut self,
        swapchain: vk::SwapchainKHR,
        semaphore: vk::Semaphore,
    ) -> DeviceResult<AcquireOutcome> {
        let result = unsafe {
            self.swapchain_loader.acquire_next_image(
                swapchain,
                u64::MAX,
                semaphore,
                vk::Fence::null(),
            )
        };
        match result {
            // A suboptimal acquire still hands out an image and signals the
            // semaphore; the frame runs and the present reports staleness.
            Ok((index, _suboptimal)) => Ok(AcquireOutcome::Acquired(index)),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(AcquireOutcome::Stale),
            Err(code) => Err(DeviceError::Api(code)),
        }
    }

    fn queue_present(
        &mut self,
        queue: QueueKind,
        wait_semaphores: &[vk::Semaphore],
        requests: &[PresentRequest],
    ) -> DeviceResult<Vec<PresentOutcome>> {
        if requests.is_empty() {
            return Ok(Vec::new());
        }
        let swapchains: Vec<vk::SwapchainKHR> =
            requests.iter().map(|r| r.swapchain).collect();
        let indices: Vec<u32> = requests.iter().map(|r| r.image_index).collect();
        let mut results = vec![vk::Result::SUCCESS; requests.len()];

        let mut info = vk::PresentInfoKHR::builder()
            .wait_semaphores(wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&indices)
            .build();
        info.p_results = results.as_mut_ptr();

        let overall =
            unsafe { self.swapchain_loader.queue_present(self.device.queue(queue), &info) };
        match overall {
            Ok(_) | Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => {}
            Err(code) => return Err(DeviceError::Api(code)),
        }

        let mut outcomes = Vec::with_capacity(results.len());
        for code in results {
            outcomes.push(match code {
                vk::Result::SUCCESS => PresentOutcome::Presented,
                vk::Result::SUBOPTIMAL_KHR | vk::Result::ERROR_OUT_OF_DATE_KHR => {
                    PresentOutcome::Stale
                }
                other => return Err(DeviceError::Api(other)),
            });
        }
        Ok(outcomes)
    }

    fn cmd_transition_to_present(&mut self, cmd: vk::CommandBuffer, images: &[vk::Image]) {
        let barriers: Vec<vk::ImageMemoryBarrier> = images
            .iter()
            .map(|&image| {
                vk::ImageMemoryBarrier::builder()
                    .src_access_mask(vk::AccessFlags::empty())
                    .dst_access_mask(vk::AccessFlags::empty())
                    .old_layout(vk::ImageLayout::UNDEFINED)
                    .new_layout(vk::ImageLayout::PRESENT_SRC_KHR)
                    .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                    .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                    .image(image)
                    .subresource_range(color_subresource_range())
                    .build()
            })
            .collect();
        unsafe {
            self.device.device().cmd_pipeline_barrier(
                cmd,
                vk::PipelineStageFlags::TOP_OF_PIPE,
                vk::PipelineStageFlags::BOTTOM_OF_PIPE,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &barriers,
            );
        }
    }

    fn cmd_blit_to_swapchain(
        &mut self,
        cmd: vk::CommandBuffer,
        src_image: vk::Image,
        src_extent: vk::Extent2D,
        filter: vk::Filter,
        dst_image: vk::Image,
        dst_extent: vk::Extent2D,
    ) {
        let device = self.device.device();
        let to_transfer = vk::ImageMemoryBarrier::builder()
            .src_access_mask(vk::AccessFlags::empty())
            .dst_access_mask(vk::AccessFlags::TRANSFER_WRITE)
            .old_layout(vk::ImageLayout::PRESENT_SRC_KHR)
            .new_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .image(dst_image)
            .subresource_range(color_subresource_range())
            .build();
        let to_present = vk::ImageMemoryBarrier::builder()
            .src_access_mask(vk::AccessFlags::TRANSFER_WRITE)
            .dst_access_mask(vk::AccessFlags::empty())
            .old_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
            .new_layout(vk::ImageLayout::PRESENT_SRC_KHR)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .image(dst_image)
            .subresource_range(color_subresource_range())
            .build();

        let blit = vk::ImageBlit {
            src_subresource: color_subresource_layers(),
            src_offsets: [
                vk::Offset3D { x: 0, y: 0, z: 0 },
                vk::Offset3D {
                    x: src_extent.width as i32,
                    y: src_extent.height as i32,
                    z: 1,
                },
            ],
            dst_subresource: color_subresource_layers(),
            dst_offsets: [
                vk::Offset3D { x: 0, y: 0, z: 0 },
                vk::Offset3D {
                    x: dst_extent.width as i32,
                    y: dst_extent.height as i32,
                    z: 1,
                },
            ],
        };

        unsafe {
            device.cmd_pipeline_barrier(
                cmd,
                vk::PipelineStageFlags::TOP_OF_PIPE,
                vk::PipelineStageFlags::TRANSFER,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[to_transfer],
            );
            device.cmd_blit_image(
                cmd,
                src_image,
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                dst_image,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &[blit],
                filter,
            );
            device.cmd_pipeline_barrier(
                cmd,
                vk::PipelineStageFlags::TRANSFER,
                vk::PipelineStageFlags::BOTTOM_OF_PIPE,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[to_present],
            );
        }
    }
}

impl Drop for VulkanBackend {
    fn drop(&mut self) {
        unsafe {
            for surface in self.surfaces.drain(..) {
                self.surface_loader.destroy_surface(surface, None);
            }
        }
    }
}
