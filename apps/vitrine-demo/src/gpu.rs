//! Vulkan bootstrap for the demo.
//!
//! Brings up the instance, surface, and logical device that back the
//! [`vitrine_present::VulkanDevice`] adapter. The demo renders and presents
//! on a single queue family, so device selection requires one family with
//! both graphics and surface support.

use std::ffi::{CStr, CString};
use std::sync::Arc;

use anyhow::anyhow;
use ash::vk;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle, RawDisplayHandle};
use tracing::{info, warn};
use vitrine_present::{PresentConfig, STALL_GUARD_ACQUIRE_TIMEOUT};

/// Required instance extensions for windowed presentation.
fn required_instance_extensions() -> Vec<&'static CStr> {
    vec![
        ash::khr::surface::NAME,
        #[cfg(target_os = "windows")]
        ash::khr::win32_surface::NAME,
        #[cfg(target_os = "linux")]
        ash::khr::xlib_surface::NAME,
        #[cfg(target_os = "linux")]
        ash::khr::wayland_surface::NAME,
        #[cfg(target_os = "macos")]
        ash::ext::metal_surface::NAME,
        #[cfg(target_os = "macos")]
        ash::khr::portability_enumeration::NAME,
    ]
}

/// Validation layers to enable in debug builds.
fn validation_layers() -> Vec<&'static CStr> {
    vec![c"VK_LAYER_KHRONOS_validation"]
}

/// Vulkan resources owned by the demo.
pub struct GpuContext {
    // Entry must be kept alive for the lifetime of the context
    #[allow(dead_code)]
    entry: ash::Entry,
    instance: ash::Instance,
    surface: vk::SurfaceKHR,
    surface_loader: ash::khr::surface::Instance,
    physical_device: vk::PhysicalDevice,
    device: Arc<ash::Device>,
    queue_family: u32,
    queue: vk::Queue,
    enabled_extensions: Vec<&'static CStr>,
    uses_x11: bool,
}

impl GpuContext {
    /// Bring up the full Vulkan stack for `window`.
    pub fn build<W>(app_name: &str, window: &W) -> anyhow::Result<Self>
    where
        W: HasDisplayHandle + HasWindowHandle,
    {
        let entry =
            unsafe { ash::Entry::load() }.map_err(|e| anyhow!("Failed to load Vulkan: {e}"))?;

        let instance = unsafe { create_instance(&entry, app_name, cfg!(debug_assertions))? };

        let display = window
            .display_handle()
            .map_err(|e| anyhow!("Failed to get display handle: {e}"))?;
        let window_handle = window
            .window_handle()
            .map_err(|e| anyhow!("Failed to get window handle: {e}"))?;
        let uses_x11 = matches!(
            display.as_raw(),
            RawDisplayHandle::Xlib(_) | RawDisplayHandle::Xcb(_)
        );

        // SAFETY: Handles come from a live window
        let surface = unsafe {
            ash_window::create_surface(
                &entry,
                &instance,
                display.as_raw(),
                window_handle.as_raw(),
                None,
            )
        }
        .map_err(|e| anyhow!("Failed to create surface: {e}"))?;

        let surface_loader = ash::khr::surface::Instance::new(&entry, &instance);

        let (physical_device, queue_family) =
            unsafe { select_physical_device(&instance, &surface_loader, surface)? };

        let mut enabled_extensions = vec![ash::khr::swapchain::NAME];
        if unsafe { supports_incremental_present(&instance, physical_device)? } {
            enabled_extensions.push(ash::khr::incremental_present::NAME);
        }

        let device = unsafe {
            create_device(&instance, physical_device, queue_family, &enabled_extensions)?
        };
        let queue = unsafe { device.get_device_queue(queue_family, 0) };

        Ok(Self {
            entry,
            instance,
            surface,
            surface_loader,
            physical_device,
            device: Arc::new(device),
            queue_family,
            queue,
            enabled_extensions,
            uses_x11,
        })
    }

    /// Build a [`PresentConfig`] sized against the current surface state.
    ///
    /// Surface capabilities go stale across resizes, so this re-queries them
    /// on every chain (re)build.
    pub fn present_config(&self, width: u32, height: u32) -> anyhow::Result<PresentConfig> {
        let (caps, formats) = unsafe {
            let caps = self
                .surface_loader
                .get_physical_device_surface_capabilities(self.physical_device, self.surface)?;
            let formats = self
                .surface_loader
                .get_physical_device_surface_formats(self.physical_device, self.surface)?;
            (caps, formats)
        };
        if formats.is_empty() {
            return Err(anyhow!("Surface reports no formats"));
        }

        let mut config = PresentConfig::new(
            select_surface_format(&formats),
            calculate_extent(&caps, width, height),
        )
        .with_min_image_count(select_image_count(&caps))
        .with_pre_transform(caps.current_transform);

        // An obscured X11 window can stop receiving vblanks, which leaves an
        // unbounded acquisition stuck until the window is visible again.
        if self.uses_x11 {
            config = config.with_acquire_timeout(STALL_GUARD_ACQUIRE_TIMEOUT);
        }

        Ok(config)
    }

    /// The Vulkan instance handle.
    pub fn instance(&self) -> &ash::Instance {
        &self.instance
    }

    /// The logical device handle.
    pub fn device(&self) -> &ash::Device {
        &self.device
    }

    /// Shared handle to the logical device.
    pub fn device_arc(&self) -> Arc<ash::Device> {
        self.device.clone()
    }

    /// The presentation surface.
    pub fn surface(&self) -> vk::SurfaceKHR {
        self.surface
    }

    /// Queue family index used for rendering and presentation.
    pub fn queue_family(&self) -> u32 {
        self.queue_family
    }

    /// The combined graphics and presentation queue.
    pub fn queue(&self) -> vk::Queue {
        self.queue
    }

    /// Device extensions the logical device was created with.
    pub fn enabled_extensions(&self) -> &[&'static CStr] {
        &self.enabled_extensions
    }

    /// Wait for the device to go idle.
    pub fn wait_idle(&self) -> anyhow::Result<()> {
        unsafe {
            self.device.device_wait_idle()?;
        }
        Ok(())
    }
}

impl Drop for GpuContext {
    fn drop(&mut self) {
        unsafe {
            let _ = self.device.device_wait_idle();
            self.device.destroy_device(None);
            self.surface_loader.destroy_surface(self.surface, None);
            self.instance.destroy_instance(None);
        }
    }
}

/// Create a Vulkan instance.
///
/// # Safety
/// The entry must be a valid Vulkan entry point.
unsafe fn create_instance(
    entry: &ash::Entry,
    app_name: &str,
    enable_validation: bool,
) -> anyhow::Result<ash::Instance> {
    let app_name = CString::new(app_name).unwrap();
    let engine_name = CString::new("Vitrine").unwrap();

    let app_info = vk::ApplicationInfo::default()
        .application_name(&app_name)
        .application_version(vk::make_api_version(0, 0, 1, 0))
        .engine_name(&engine_name)
        .engine_version(vk::make_api_version(0, 0, 1, 0))
        .api_version(vk::API_VERSION_1_1);

    let extension_names: Vec<*const i8> = required_instance_extensions()
        .iter()
        .map(|ext| ext.as_ptr())
        .collect();

    let layers = if enable_validation {
        validation_layers()
    } else {
        vec![]
    };

    // Check that requested layers are available
    let available_layers = entry.enumerate_instance_layer_properties()?;
    for layer in &layers {
        let layer_name = layer.to_str().unwrap();
        let found = available_layers.iter().any(|props| {
            let name = CStr::from_ptr(props.layer_name.as_ptr());
            name.to_str().ok() == Some(layer_name)
        });
        if !found {
            warn!("Validation layer {} not available", layer_name);
        }
    }

    let layer_names: Vec<*const i8> = layers.iter().map(|l| l.as_ptr()).collect();

    // Required for MoltenVK on macOS
    #[cfg(target_os = "macos")]
    let create_flags = vk::InstanceCreateFlags::ENUMERATE_PORTABILITY_KHR;
    #[cfg(not(target_os = "macos"))]
    let create_flags = vk::InstanceCreateFlags::empty();

    let create_info = vk::InstanceCreateInfo::default()
        .application_info(&app_info)
        .enabled_extension_names(&extension_names)
        .enabled_layer_names(&layer_names)
        .flags(create_flags);

    let instance = entry.create_instance(&create_info, None)?;

    Ok(instance)
}

/// Select the physical device and a queue family able to present to
/// `surface`.
///
/// # Safety
/// The instance and surface must be valid.
unsafe fn select_physical_device(
    instance: &ash::Instance,
    surface_loader: &ash::khr::surface::Instance,
    surface: vk::SurfaceKHR,
) -> anyhow::Result<(vk::PhysicalDevice, u32)> {
    let devices = instance.enumerate_physical_devices()?;

    let mut best = None;
    let mut best_score = -1i32;

    for device in devices {
        let Some(family) = find_present_queue_family(instance, surface_loader, surface, device)?
        else {
            continue;
        };
        let score = score_physical_device(instance, device);
        if score > best_score {
            best_score = score;
            best = Some((device, family));
        }
    }

    let (device, family) =
        best.ok_or_else(|| anyhow!("No Vulkan device can present to this surface"))?;
    let properties = instance.get_physical_device_properties(device);
    let name = CStr::from_ptr(properties.device_name.as_ptr());
    info!("Selected GPU: {}", name.to_string_lossy());

    Ok((device, family))
}

/// Score a physical device for selection.
unsafe fn score_physical_device(instance: &ash::Instance, device: vk::PhysicalDevice) -> i32 {
    let properties = instance.get_physical_device_properties(device);

    let mut score = 0;

    // Prefer discrete GPUs
    match properties.device_type {
        vk::PhysicalDeviceType::DISCRETE_GPU => score += 1000,
        vk::PhysicalDeviceType::INTEGRATED_GPU => score += 100,
        vk::PhysicalDeviceType::VIRTUAL_GPU => score += 50,
        _ => {}
    }

    // Prefer more VRAM
    let memory = instance.get_physical_device_memory_properties(device);
    let vram_mb: u64 = memory
        .memory_heaps
        .iter()
        .take(memory.memory_heap_count as usize)
        .filter(|h| h.flags.contains(vk::MemoryHeapFlags::DEVICE_LOCAL))
        .map(|h| h.size / (1024 * 1024))
        .sum();
    score += (vram_mb / 1024) as i32; // +1 per GB

    score
}

/// Find a queue family supporting both graphics work and presentation.
///
/// # Safety
/// The instance, surface, and device must be valid.
unsafe fn find_present_queue_family(
    instance: &ash::Instance,
    surface_loader: &ash::khr::surface::Instance,
    surface: vk::SurfaceKHR,
    device: vk::PhysicalDevice,
) -> anyhow::Result<Option<u32>> {
    let families = instance.get_physical_device_queue_family_properties(device);

    for (i, family) in families.iter().enumerate() {
        let i = i as u32;
        if !family.queue_flags.contains(vk::QueueFlags::GRAPHICS) {
            continue;
        }
        if surface_loader.get_physical_device_surface_support(device, i, surface)? {
            return Ok(Some(i));
        }
    }

    Ok(None)
}

/// Whether the device exposes `VK_KHR_incremental_present`.
///
/// # Safety
/// The instance and device must be valid.
unsafe fn supports_incremental_present(
    instance: &ash::Instance,
    device: vk::PhysicalDevice,
) -> anyhow::Result<bool> {
    let extensions = instance.enumerate_device_extension_properties(device)?;
    Ok(extensions.iter().any(|props| {
        CStr::from_ptr(props.extension_name.as_ptr()) == ash::khr::incremental_present::NAME
    }))
}

/// Create the logical device with a single presentation-capable queue.
///
/// # Safety
/// The instance and physical device must be valid.
unsafe fn create_device(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
    queue_family: u32,
    extensions: &[&CStr],
) -> anyhow::Result<ash::Device> {
    let queue_priority = 1.0_f32;
    let queue_create_infos = [vk::DeviceQueueCreateInfo::default()
        .queue_family_index(queue_family)
        .queue_priorities(std::slice::from_ref(&queue_priority))];

    let extension_names: Vec<*const i8> = extensions.iter().map(|ext| ext.as_ptr()).collect();

    let device_create_info = vk::DeviceCreateInfo::default()
        .queue_create_infos(&queue_create_infos)
        .enabled_extension_names(&extension_names);

    let device = instance.create_device(physical_device, &device_create_info, None)?;

    Ok(device)
}

/// Pick a surface format, preferring 8-bit BGRA.
fn select_surface_format(available: &[vk::SurfaceFormatKHR]) -> vk::SurfaceFormatKHR {
    for format in available {
        if format.format == vk::Format::B8G8R8A8_UNORM
            && format.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
        {
            return *format;
        }
    }

    // Fall back to first available
    available[0]
}

/// Resolve the swapchain extent from surface capabilities.
fn calculate_extent(
    capabilities: &vk::SurfaceCapabilitiesKHR,
    desired_width: u32,
    desired_height: u32,
) -> vk::Extent2D {
    if capabilities.current_extent.width != u32::MAX {
        capabilities.current_extent
    } else {
        vk::Extent2D {
            width: desired_width.clamp(
                capabilities.min_image_extent.width,
                capabilities.max_image_extent.width,
            ),
            height: desired_height.clamp(
                capabilities.min_image_extent.height,
                capabilities.max_image_extent.height,
            ),
        }
    }
}

/// One image above the driver minimum, clamped to the driver maximum.
fn select_image_count(capabilities: &vk::SurfaceCapabilitiesKHR) -> u32 {
    let mut count = capabilities.min_image_count + 1;
    if capabilities.max_image_count > 0 {
        count = count.min(capabilities.max_image_count);
    }
    count
}
