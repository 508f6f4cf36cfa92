//! Vulkan instance, surface and adapter selection.
//!
//! A [`Context`] owns the instance-level state: the loaded entry points,
//! the optional presentation surface, the debug messenger (validation
//! builds) and the list of adapters that satisfy the caller's
//! requirements. Logical devices are created from an adapter via
//! [`crate::device::Device::new`].

use std::ffi::CStr;

use ash::{Entry, Instance, vk};
use ember_core::log;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use winit::window::Window;

use crate::error::{RhiError, RhiResult};

/// Validation layers to enable in validation builds.
#[cfg(feature = "validation")]
const VALIDATION_LAYERS: &[&CStr] = &[c"VK_LAYER_KHRONOS_validation"];

pub const MAX_ADAPTER_COUNT: usize = 8;

/// Optional device capabilities a caller can require. Dynamic rendering,
/// synchronization2 and the descriptor indexing set are always required;
/// they underpin the whole backend.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DeviceFeatures {
    pub sampler_anisotropy: bool,
    pub buffer_device_address: bool,
    pub ray_tracing: bool,
}

impl DeviceFeatures {
    /// Whether `self` (as supported features) covers `required`.
    pub fn contains(&self, required: &DeviceFeatures) -> bool {
        (self.sampler_anisotropy || !required.sampler_anisotropy)
            && (self.buffer_device_address || !required.buffer_device_address)
            && (self.ray_tracing || !required.ray_tracing)
    }
}

pub struct ContextDesc<'a> {
    pub app_name: &'a str,
    /// Device extensions beyond the swapchain extension.
    pub device_extensions: Vec<&'static CStr>,
    pub features: DeviceFeatures,
}

impl Default for ContextDesc<'_> {
    fn default() -> Self {
        Self {
            app_name: "ember",
            device_extensions: Vec::new(),
            features: DeviceFeatures::default(),
        }
    }
}

/// A physical device that passed all context filters.
#[derive(Clone)]
pub struct Adapter {
    handle: vk::PhysicalDevice,
    properties: vk::PhysicalDeviceProperties,
    memory_properties: vk::PhysicalDeviceMemoryProperties,
    graphics_compute_family: u32,
    present_family: Option<u32>,
    supported_features: DeviceFeatures,
}

impl Adapter {
    #[inline]
    pub fn handle(&self) -> vk::PhysicalDevice {
        self.handle
    }

    #[inline]
    pub fn properties(&self) -> &vk::PhysicalDeviceProperties {
        &self.properties
    }

    #[inline]
    pub fn memory_properties(&self) -> &vk::PhysicalDeviceMemoryProperties {
        &self.memory_properties
    }

    #[inline]
    pub fn graphics_compute_family(&self) -> u32 {
        self.graphics_compute_family
    }

    #[inline]
    pub fn present_family(&self) -> Option<u32> {
        self.present_family
    }

    #[inline]
    pub fn supported_features(&self) -> &DeviceFeatures {
        &self.supported_features
    }

    pub fn name(&self) -> String {
        self.properties
            .device_name_as_c_str()
            .unwrap_or(c"unknown")
            .to_string_lossy()
            .into_owned()
    }

    pub fn is_discrete(&self) -> bool {
        self.properties.device_type == vk::PhysicalDeviceType::DISCRETE_GPU
    }
}

pub(crate) struct Surface {
    pub loader: ash::khr::surface::Instance,
    pub handle: vk::SurfaceKHR,
}

pub struct Context {
    entry: Entry,
    instance: Instance,
    #[cfg(feature = "validation")]
    debug_utils: Option<ash::ext::debug_utils::Instance>,
    #[cfg(feature = "validation")]
    debug_messenger: Option<vk::DebugUtilsMessengerEXT>,
    surface: Option<Surface>,
    adapters: Vec<Adapter>,
    requested_features: DeviceFeatures,
    device_extensions: Vec<&'static CStr>,
}

impl Context {
    /// Creates the instance, the surface (when a window is given) and
    /// enumerates suitable adapters. `suitability` lets the caller veto
    /// adapters that pass all built-in filters.
    #[profiling::function]
    pub fn new(
        desc: &ContextDesc,
        window: Option<&Window>,
        suitability: Option<&dyn Fn(&Adapter) -> bool>,
    ) -> RhiResult<Self> {
        let entry = unsafe { Entry::load()? };
        let instance = create_instance(&entry, desc.app_name, window)?;

        #[cfg(feature = "validation")]
        let (debug_utils, debug_messenger) = create_debug_messenger(&entry, &instance)?;

        let surface = match window {
            Some(window) => Some(create_surface(&entry, &instance, window)?),
            None => None,
        };

        let mut device_extensions = desc.device_extensions.clone();
        if surface.is_some() && !device_extensions.contains(&ash::khr::swapchain::NAME) {
            device_extensions.push(ash::khr::swapchain::NAME);
        }
        if desc.features.ray_tracing {
            for ext in [
                ash::khr::acceleration_structure::NAME,
                ash::khr::ray_query::NAME,
                ash::khr::deferred_host_operations::NAME,
            ] {
                if !device_extensions.contains(&ext) {
                    device_extensions.push(ext);
                }
            }
        }

        let adapters = enumerate_adapters(
            &instance,
            surface.as_ref(),
            &device_extensions,
            &desc.features,
            suitability,
        )?;
        if adapters.is_empty() {
            return Err(RhiError::Config(
                "no adapter satisfies the requested extensions and features".into(),
            ));
        }
        for adapter in &adapters {
            log::info!("suitable adapter: {}", adapter.name());
        }

        Ok(Self {
            entry,
            instance,
            #[cfg(feature = "validation")]
            debug_utils,
            #[cfg(feature = "validation")]
            debug_messenger,
            surface,
            adapters,
            requested_features: desc.features,
            device_extensions,
        })
    }

    #[inline]
    pub fn entry(&self) -> &Entry {
        &self.entry
    }

    #[inline]
    pub fn instance(&self) -> &Instance {
        &self.instance
    }

    #[inline]
    pub fn adapters(&self) -> &[Adapter] {
        &self.adapters
    }

    /// The adapter a device should default to: the first discrete one,
    /// else the first suitable one.
    pub fn default_adapter_index(&self) -> usize {
        self.adapters
            .iter()
            .position(|a| a.is_discrete())
            .unwrap_or(0)
    }

    #[inline]
    pub fn has_surface(&self) -> bool {
        self.surface.is_some()
    }

    pub(crate) fn surface(&self) -> Option<&Surface> {
        self.surface.as_ref()
    }

    pub(crate) fn requested_features(&self) -> &DeviceFeatures {
        &self.requested_features
    }

    pub(crate) fn device_extensions(&self) -> &[&'static CStr] {
        &self.device_extensions
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        unsafe {
            if let Some(surface) = self.surface.take() {
                surface.loader.destroy_surface(surface.handle, None);
            }

            #[cfg(feature = "validation")]
            if let (Some(debug_utils), Some(messenger)) = (&self.debug_utils, self.debug_messenger)
            {
                debug_utils.destroy_debug_utils_messenger(messenger, None);
            }

            self.instance.destroy_instance(None);
        }
    }
}

fn create_instance(entry: &Entry, app_name: &str, window: Option<&Window>) -> RhiResult<Instance> {
    let app_name = std::ffi::CString::new(app_name)
        .map_err(|_| RhiError::Config("application name contains a NUL byte".into()))?;
    let app_info = vk::ApplicationInfo::default()
        .application_name(&app_name)
        .application_version(vk::make_api_version(0, 1, 0, 0))
        .engine_name(c"Ember")
        .engine_version(vk::make_api_version(0, 1, 0, 0))
        .api_version(vk::API_VERSION_1_3);

    let mut extensions: Vec<*const i8> = Vec::new();
    if let Some(window) = window {
        let display_handle = window
            .display_handle()
            .map_err(|e| RhiError::Loading(e.to_string()))?;
        extensions.extend_from_slice(ash_window::enumerate_required_extensions(
            display_handle.as_raw(),
        )?);
    }
    #[cfg(feature = "validation")]
    extensions.push(ash::ext::debug_utils::NAME.as_ptr());

    #[cfg(feature = "validation")]
    let layers: Vec<*const i8> = {
        let available = unsafe { entry.enumerate_instance_layer_properties()? };
        VALIDATION_LAYERS
            .iter()
            .filter(|&&wanted| {
                let found = available.iter().any(|l| {
                    l.layer_name_as_c_str().is_ok_and(|name| name == wanted)
                });
                if !found {
                    log::warn!("validation layer {:?} not available", wanted);
                }
                found
            })
            .map(|l| l.as_ptr())
            .collect()
    };
    #[cfg(not(feature = "validation"))]
    let layers: Vec<*const i8> = Vec::new();

    let create_info = vk::InstanceCreateInfo::default()
        .application_info(&app_info)
        .enabled_extension_names(&extensions)
        .enabled_layer_names(&layers);

    Ok(unsafe { entry.create_instance(&create_info, None) }?)
}

fn create_surface(entry: &Entry, instance: &Instance, window: &Window) -> RhiResult<Surface> {
    let display_handle = window
        .display_handle()
        .map_err(|e| RhiError::Loading(e.to_string()))?;
    let window_handle = window
        .window_handle()
        .map_err(|e| RhiError::Loading(e.to_string()))?;

    let handle = unsafe {
        ash_window::create_surface(
            entry,
            instance,
            display_handle.as_raw(),
            window_handle.as_raw(),
            None,
        )?
    };
    let loader = ash::khr::surface::Instance::new(entry, instance);
    Ok(Surface { loader, handle })
}

#[cfg(feature = "validation")]
fn create_debug_messenger(
    entry: &Entry,
    instance: &Instance,
) -> RhiResult<(
    Option<ash::ext::debug_utils::Instance>,
    Option<vk::DebugUtilsMessengerEXT>,
)> {
    let debug_utils = ash::ext::debug_utils::Instance::new(entry, instance);

    let create_info = vk::DebugUtilsMessengerCreateInfoEXT::default()
        .message_severity(
            vk::DebugUtilsMessageSeverityFlagsEXT::ERROR
                | vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                | vk::DebugUtilsMessageSeverityFlagsEXT::INFO,
        )
        .message_type(
            vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
        )
        .pfn_user_callback(Some(vulkan_debug_callback));

    let messenger = unsafe { debug_utils.create_debug_utils_messenger(&create_info, None)? };
    Ok((Some(debug_utils), Some(messenger)))
}

#[cfg(feature = "validation")]
unsafe extern "system" fn vulkan_debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    p_callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT<'_>,
    _user_data: *mut std::ffi::c_void,
) -> vk::Bool32 {
    let callback_data = unsafe { *p_callback_data };
    let message = unsafe { CStr::from_ptr(callback_data.p_message) }.to_string_lossy();

    let type_str = match message_type {
        vk::DebugUtilsMessageTypeFlagsEXT::GENERAL => "[General]",
        vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION => "[Validation]",
        vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE => "[Performance]",
        _ => "[Unknown]",
    };

    match message_severity {
        vk::DebugUtilsMessageSeverityFlagsEXT::ERROR => {
            log::error!("Vulkan {}: {}", type_str, message);
        }
        vk::DebugUtilsMessageSeverityFlagsEXT::WARNING => {
            log::warn!("Vulkan {}: {}", type_str, message);
        }
        vk::DebugUtilsMessageSeverityFlagsEXT::INFO => {
            log::info!("Vulkan {}: {}", type_str, message);
        }
        _ => {
            log::debug!("Vulkan {}: {}", type_str, message);
        }
    }

    vk::FALSE
}

fn enumerate_adapters(
    instance: &Instance,
    surface: Option<&Surface>,
    required_extensions: &[&'static CStr],
    required_features: &DeviceFeatures,
    suitability: Option<&dyn Fn(&Adapter) -> bool>,
) -> RhiResult<Vec<Adapter>> {
    let physical_devices = unsafe { instance.enumerate_physical_devices()? };

    let mut adapters = Vec::new();
    for physical_device in physical_devices {
        let properties = unsafe { instance.get_physical_device_properties(physical_device) };

        if !supports_extensions(instance, physical_device, required_extensions)? {
            continue;
        }

        let Some(supported_features) = query_device_features(instance, physical_device) else {
            continue;
        };
        if !supported_features.contains(required_features) {
            continue;
        }

        let Some(graphics_compute_family) = find_graphics_compute_family(instance, physical_device)
        else {
            continue;
        };
        let present_family = match surface {
            Some(surface) => {
                match find_present_family(instance, physical_device, surface) {
                    Some(family) => Some(family),
                    None => continue,
                }
            }
            None => None,
        };

        let adapter = Adapter {
            handle: physical_device,
            properties,
            memory_properties: unsafe {
                instance.get_physical_device_memory_properties(physical_device)
            },
            graphics_compute_family,
            present_family,
            supported_features,
        };
        if let Some(suitability) = suitability {
            if !suitability(&adapter) {
                continue;
            }
        }

        adapters.push(adapter);
        if adapters.len() == MAX_ADAPTER_COUNT {
            break;
        }
    }
    Ok(adapters)
}

fn supports_extensions(
    instance: &Instance,
    physical_device: vk::PhysicalDevice,
    required: &[&'static CStr],
) -> RhiResult<bool> {
    let available =
        unsafe { instance.enumerate_device_extension_properties(physical_device)? };
    Ok(required.iter().all(|&wanted| {
        available
            .iter()
            .any(|ext| ext.extension_name_as_c_str().is_ok_and(|name| name == wanted))
    }))
}

/// Queries the feature chain and folds it into the closed feature set.
/// Returns `None` when the always-required baseline (dynamic rendering,
/// synchronization2, descriptor indexing with update-after-bind) is
/// missing.
fn query_device_features(
    instance: &Instance,
    physical_device: vk::PhysicalDevice,
) -> Option<DeviceFeatures> {
    let mut v12 = vk::PhysicalDeviceVulkan12Features::default();
    let mut v13 = vk::PhysicalDeviceVulkan13Features::default();
    let mut accel = vk::PhysicalDeviceAccelerationStructureFeaturesKHR::default();
    let mut ray_query = vk::PhysicalDeviceRayQueryFeaturesKHR::default();
    let mut features2 = vk::PhysicalDeviceFeatures2::default()
        .push_next(&mut v12)
        .push_next(&mut v13)
        .push_next(&mut accel)
        .push_next(&mut ray_query);
    unsafe {
        instance.get_physical_device_features2(physical_device, &mut features2);
    }
    let features = features2.features;

    let baseline = v13.dynamic_rendering == vk::TRUE
        && v13.synchronization2 == vk::TRUE
        && v12.descriptor_indexing == vk::TRUE
        && v12.runtime_descriptor_array == vk::TRUE
        && v12.descriptor_binding_partially_bound == vk::TRUE
        && v12.descriptor_binding_uniform_buffer_update_after_bind == vk::TRUE
        && v12.descriptor_binding_storage_buffer_update_after_bind == vk::TRUE
        && v12.descriptor_binding_sampled_image_update_after_bind == vk::TRUE
        && v12.descriptor_binding_storage_image_update_after_bind == vk::TRUE;
    if !baseline {
        return None;
    }

    Some(DeviceFeatures {
        sampler_anisotropy: features.sampler_anisotropy == vk::TRUE,
        buffer_device_address: v12.buffer_device_address == vk::TRUE,
        ray_tracing: accel.acceleration_structure == vk::TRUE && ray_query.ray_query == vk::TRUE,
    })
}

fn find_graphics_compute_family(
    instance: &Instance,
    physical_device: vk::PhysicalDevice,
) -> Option<u32> {
    let families =
        unsafe { instance.get_physical_device_queue_family_properties(physical_device) };
    families.iter().position(|f| {
        f.queue_flags
            .contains(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE)
    }).map(|i| i as u32)
}

fn find_present_family(
    instance: &Instance,
    physical_device: vk::PhysicalDevice,
    surface: &Surface,
) -> Option<u32> {
    let families =
        unsafe { instance.get_physical_device_queue_family_properties(physical_device) };
    (0..families.len() as u32).find(|&index| unsafe {
        surface
            .loader
            .get_physical_device_surface_support(physical_device, index, surface.handle)
            .unwrap_or(false)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn feature_containment() {
        let full = DeviceFeatures {
            sampler_anisotropy: true,
            buffer_device_address: true,
            ray_tracing: true,
        };
        let none = DeviceFeatures::default();
        let bda_only = DeviceFeatures {
            buffer_device_address: true,
            ..Default::default()
        };

        assert!(full.contains(&none));
        assert!(full.contains(&bda_only));
        assert!(full.contains(&full));
        assert!(none.contains(&none));
        assert!(!none.contains(&bda_only));
        assert!(!bda_only.contains(&full));
    }
}
