//! Physical device selection and logical device creation

use std::collections::HashSet;
use std::ffi::CStr;

use ash::extensions::khr;
use ash::vk;

use crate::render::api::{DeviceError, DeviceResult, QueueKind};

/// Queue family indices for the three submission queues. Families may
/// alias on devices without dedicated compute or transfer queues.
#[derive(Debug, Clone, Copy)]
pub struct QueueFamilies {
    pub graphics: u32,
    pub compute: u32,
    pub transfer: u32,
}

/// A physical device that passed suitability checks.
pub struct PhysicalDeviceSelection {
    pub device: vk::PhysicalDevice,
    pub families: QueueFamilies,
    pub name: String,
}

/// Pick the best physical device that can present to `surface`, has the
/// swapchain extension, and supports timeline semaphores.
pub fn select_physical_device(
    instance: &ash::Instance,
    surface_loader: &khr::Surface,
    surface: vk::SurfaceKHR,
) -> DeviceResult<PhysicalDeviceSelection> {
    let devices =
        unsafe { instance.enumerate_physical_devices() }.map_err(DeviceError::Api)?;
    if devices.is_empty() {
        return Err(DeviceError::InitializationFailed(
            "No Vulkan capable GPU found".to_string(),
        ));
    }

    let mut best: Option<(u32, PhysicalDeviceSelection)> = None;
    for device in devices {
        let properties = unsafe { instance.get_physical_device_properties(device) };
        let name = unsafe { CStr::from_ptr(properties.device_name.as_ptr()) }
            .to_string_lossy()
            .into_owned();

        if !supports_swapchain_extension(instance, device)? {
            log::debug!("Skipping {name}: no swapchain extension");
            continue;
        }
        if !supports_timeline_semaphores(instance, device) {
            log::debug!("Skipping {name}: no timeline semaphore support");
            continue;
        }
        let Some(families) = find_queue_families(instance, surface_loader, surface, device)?
        else {
            log::debug!("Skipping {name}: no graphics queue with present support");
            continue;
        };

        let score = device_type_score(properties.device_type);
        log::debug!("Candidate GPU {name} scored {score}");
        if best.as_ref().map_or(true, |(b, _)| score > *b) {
            best = Some((
                score,
                PhysicalDeviceSelection {
                    device,
                    families,
                    name,
                },
            ));
        }
    }

    best.map(|(_, selection)| selection)
        .ok_or_else(|| {
            DeviceError::InitializationFailed(
                "No GPU meets the engine's requirements".to_string(),
            )
        })
}

fn device_type_score(device_type: vk::PhysicalDeviceType) -> u32 {
    match device_type {
        vk::PhysicalDeviceType::DISCRETE_GPU => 3,
        vk::PhysicalDeviceType::INTEGRATED_GPU => 2,
        vk::PhysicalDeviceType::VIRTUAL_GPU => 1,
        _ => 0,
    }
}

fn supports_swapchain_extension(
    instance: &ash::Instance,
    device: vk::PhysicalDevice,
) -> DeviceResult<bool> {
    let extensions = unsafe { instance.enumerate_device_extension_properties(device) }
        .map_err(DeviceError::Api)?;
    Ok(extensions.iter().any(|ext| {
        let name = unsafe { CStr::from_ptr(ext.extension_name.as_ptr()) };
        name == khr::Swapchain::name()
    }))
}

fn supports_timeline_semaphores(instance: &ash::Instance, device: vk::PhysicalDevice) -> bool {
    let mut features12 = vk::PhysicalDeviceVulkan12Features::default();
    let mut features2 = vk::PhysicalDeviceFeatures2::builder()
        .push_next(&mut features12)
        .build();
    unsafe { instance.get_physical_device_features2(device, &mut features2) };
    features12.timeline_semaphore == vk::TRUE
}

/// Graphics family must support presenting to the surface. Compute and
/// transfer prefer dedicated families and fall back to the graphics one.
fn find_queue_families(
    instance: &ash::Instance,
    surface_loader: &khr::Surface,
    surface: vk::SurfaceKHR,
    device: vk::PhysicalDevice,
) -> DeviceResult<Option<QueueFamilies>> {
    let properties = unsafe { instance.get_physical_device_queue_family_properties(device) };

    let mut graphics = None;
    for (index, family) in properties.iter().enumerate() {
        if !family.queue_flags.contains(vk::QueueFlags::GRAPHICS) {
            continue;
        }
        let index = index as u32;
        let present =
            unsafe { surface_loader.get_physical_device_surface_support(device, index, surface) }
                .map_err(DeviceError::Api)?;
        if present {
            graphics = Some(index);
            break;
        }
    }
    let Some(graphics) = graphics else {
        return Ok(None);
    };

    let compute = pick_family(&properties, vk::QueueFlags::COMPUTE, vk::QueueFlags::GRAPHICS)
        .unwrap_or(graphics);
    let transfer = pick_family(
        &properties,
        vk::QueueFlags::TRANSFER,
        vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE,
    )
    .unwrap_or(graphics);

    Ok(Some(QueueFamilies {
        graphics,
        compute,
        transfer,
    }))
}

fn pick_family(
    properties: &[vk::QueueFamilyProperties],
    wanted: vk::QueueFlags,
    avoided: vk::QueueFlags,
) -> Option<u32> {
    let dedicated = properties
        .iter()
        .position(|p| p.queue_flags.contains(wanted) && !p.queue_flags.intersects(avoided));
    let any = properties.iter().position(|p| p.queue_flags.contains(wanted));
    dedicated.or(any).map(|index| index as u32)
}

/// The logical device plus one queue per [`QueueKind`].
pub struct LogicalDevice {
    device: ash::Device,
    graphics_queue: vk::Queue,
    compute_queue: vk::Queue,
    transfer_queue: vk::Queue,
    families: QueueFamilies,
}

impl LogicalDevice {
    /// Create the device with the swapchain extension and timeline
    /// semaphores enabled, and fetch one queue per family.
    pub fn new(
        instance: &ash::Instance,
        selection: &PhysicalDeviceSelection,
    ) -> DeviceResult<Self> {
        let families = selection.families;
        let unique: HashSet<u32> = [families.graphics, families.compute, families.transfer]
            .into_iter()
            .collect();

        let priorities = [1.0_f32];
        let queue_infos: Vec<vk::DeviceQueueCreateInfo> = unique
            .iter()
            .map(|&family| {
                vk::DeviceQueueCreateInfo::builder()
                    .queue_family_index(family)
                    .queue_priorities(&priorities)
                    .build()
            })
            .collect();

        let extensions = [khr::Swapchain::name().as_ptr()];
        let mut features12 =
            vk::PhysicalDeviceVulkan12Features::builder().timeline_semaphore(true);
        let create_info = vk::DeviceCreateInfo::builder()
            .queue_create_infos(&queue_infos)
            .enabled_extension_names(&extensions)
            .push_next(&mut features12);

        let device = unsafe { instance.create_device(selection.device, &create_info, None) }
            .map_err(DeviceError::Api)?;

        let graphics_queue = unsafe { device.get_device_queue(families.graphics, 0) };
        let compute_queue = unsafe { device.get_device_queue(families.compute, 0) };
        let transfer_queue = unsafe { device.get_device_queue(families.transfer, 0) };

        Ok(Self {
            device,
            graphics_queue,
            compute_queue,
            transfer_queue,
            families,
        })
    }

    pub fn device(&self) -> &ash::Device {
        &self.device
    }

    pub fn queue(&self, kind: QueueKind) -> vk::Queue {
        match kind {
            QueueKind::Graphics => self.graphics_queue,
            QueueKind::Compute => self.compute_queue,
            QueueKind::Transfer => self.transfer_queue,
        }
    }

    pub fn family_index(&self, kind: QueueKind) -> u32 {
        match kind {
            QueueKind::Graphics => self.families.graphics,
            QueueKind::Compute => self.families.compute,
            QueueKind::Transfer => self.families.transfer,
        }
    }
}

impl Drop for LogicalDevice {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_device(None);
        }
    }
}
