//! Vulkan instance bring-up

use std::ffi::{c_void, CStr, CString};

use ash::extensions::ext::DebugUtils;
use ash::vk;
use raw_window_handle::RawDisplayHandle;

use crate::render::api::{DeviceError, DeviceResult};

fn validation_layer() -> &'static CStr {
    unsafe { CStr::from_bytes_with_nul_unchecked(b"VK_LAYER_KHRONOS_validation\0") }
}

/// Routes validation messages into the logger.
unsafe extern "system" fn vulkan_debug_callback(
    severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    _types: vk::DebugUtilsMessageTypeFlagsEXT,
    data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _user_data: *mut c_void,
) -> vk::Bool32 {
    if data.is_null() || (*data).p_message.is_null() {
        return vk::FALSE;
    }
    let message = CStr::from_ptr((*data).p_message).to_string_lossy();
    if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::ERROR) {
        log::error!("Vulkan: {message}");
    } else if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::WARNING) {
        log::warn!("Vulkan: {message}");
    } else {
        log::debug!("Vulkan: {message}");
    }
    vk::FALSE
}

/// Loaded entry points, the instance, and the optional validation hookup.
pub struct VulkanInstance {
    entry: ash::Entry,
    instance: ash::Instance,
    debug_utils: Option<DebugUtils>,
    messenger: vk::DebugUtilsMessengerEXT,
}

impl VulkanInstance {
    /// Load the Vulkan library and create an instance with the surface
    /// extensions the platform's windowing system requires.
    pub fn new(
        app_name: &str,
        enable_validation: bool,
        display: RawDisplayHandle,
    ) -> DeviceResult<Self> {
        let entry = unsafe { ash::Entry::load() }.map_err(|e| {
            DeviceError::InitializationFailed(format!("Failed to load the Vulkan library: {e}"))
        })?;

        let app_name_c = CString::new(app_name).map_err(|_| {
            DeviceError::InitializationFailed("Application name contains a nul byte".to_string())
        })?;
        let engine_name_c = CString::new("rt_engine").map_err(|_| {
            DeviceError::InitializationFailed("Engine name contains a nul byte".to_string())
        })?;
        let app_info = vk::ApplicationInfo::builder()
            .application_name(&app_name_c)
            .application_version(vk::make_api_version(0, 0, 1, 0))
            .engine_name(&engine_name_c)
            .engine_version(vk::make_api_version(0, 0, 1, 0))
            .api_version(vk::API_VERSION_1_2);

        let mut extensions = ash_window::enumerate_required_extensions(display)
            .map_err(DeviceError::Api)?
            .to_vec();
        let validation = enable_validation && Self::validation_available(&entry);
        if enable_validation && !validation {
            log::warn!("Validation layers requested but not installed, continuing without them");
        }
        if validation {
            extensions.push(DebugUtils::name().as_ptr());
        }
        let layers = if validation {
            vec![validation_layer().as_ptr()]
        } else {
            Vec::new()
        };

        let create_info = vk::InstanceCreateInfo::builder()
            .application_info(&app_info)
            .enabled_extension_names(&extensions)
            .enabled_layer_names(&layers);
        let instance =
            unsafe { entry.create_instance(&create_info, None) }.map_err(DeviceError::Api)?;

        let (debug_utils, messenger) = if validation {
            let loader = DebugUtils::new(&entry, &instance);
            let messenger_info = vk::DebugUtilsMessengerCreateInfoEXT::builder()
                .message_severity(
                    vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                        | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
                )
                .message_type(
                    vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                        | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                        | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
                )
                .pfn_user_callback(Some(vulkan_debug_callback));
            let messenger = unsafe { loader.create_debug_utils_messenger(&messenger_info, None) }
                .map_err(DeviceError::Api)?;
            log::debug!("Vulkan validation layers enabled");
            (Some(loader), messenger)
        } else {
            (None, vk::DebugUtilsMessengerEXT::null())
        };

        Ok(Self {
            entry,
            instance,
            debug_utils,
            messenger,
        })
    }

    fn validation_available(entry: &ash::Entry) -> bool {
        match entry.enumerate_instance_layer_properties() {
            Ok(layers) => layers.iter().any(|layer| {
                let name = unsafe { CStr::from_ptr(layer.layer_name.as_ptr()) };
                name == validation_layer()
            }),
            Err(e) => {
                log::warn!("Failed to enumerate instance layers: {e}");
                false
            }
        }
    }

    pub fn entry(&self) -> &ash::Entry {
        &self.entry
    }

    pub fn instance(&self) -> &ash::Instance {
        &self.instance
    }

    pub fn debug_utils(&self) -> Option<&DebugUtils> {
        self.debug_utils.as_ref()
    }
}

impl Drop for VulkanInstance {
    fn drop(&mut self) {
        unsafe {
            if let Some(loader) = &self.debug_utils {
                if self.messenger != vk::DebugUtilsMessengerEXT::null() {
                    loader.destroy_debug_utils_messenger(self.messenger, None);
                }
            }
            self.instance.destroy_instance(None);
        }
    }
}
