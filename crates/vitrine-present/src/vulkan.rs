//! Production [`PresentDevice`] backed by ash.

use std::ffi::CStr;
use std::sync::Arc;

use ash::vk;
use tracing::debug;

use crate::device::{AcquireOutcome, PresentDevice, PresentOutcome, SwapchainDesc};
use crate::error::{PresentError, Result};

/// Live logical device plus the presentation queue.
///
/// The queue is touched without internal synchronization; the presentation
/// engine serializes all access through its own state lock, so the queue must
/// not be submitted to concurrently from outside.
pub struct VulkanDevice {
    device: Arc<ash::Device>,
    swapchain_loader: ash::khr::swapchain::Device,
    queue: vk::Queue,
    incremental_present: bool,
}

impl VulkanDevice {
    /// Wrap an externally created logical device and presentation queue.
    ///
    /// `enabled_extensions` is the device-extension list the logical device
    /// was created with; it is inspected only for incremental-present
    /// support.
    ///
    /// # Safety
    /// All handles must be valid, and the instance and device must outlive
    /// the returned wrapper.
    pub unsafe fn new(
        instance: &ash::Instance,
        device: Arc<ash::Device>,
        queue: vk::Queue,
        enabled_extensions: &[&CStr],
    ) -> Self {
        let swapchain_loader = ash::khr::swapchain::Device::new(instance, &device);
        let incremental_present =
            enabled_extensions.contains(&ash::khr::incremental_present::NAME);
        if incremental_present {
            debug!("Incremental present supported, damage rects will be attached");
        }

        Self {
            device,
            swapchain_loader,
            queue,
            incremental_present,
        }
    }

    /// The wrapped logical device.
    pub fn device(&self) -> &ash::Device {
        &self.device
    }

    /// The presentation queue.
    pub fn queue(&self) -> vk::Queue {
        self.queue
    }
}

impl PresentDevice for VulkanDevice {
    fn create_semaphore(&self) -> Result<vk::Semaphore> {
        let create_info = vk::SemaphoreCreateInfo::default();
        let semaphore = unsafe { self.device.create_semaphore(&create_info, None)? };
        Ok(semaphore)
    }

    fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        unsafe { self.device.destroy_semaphore(semaphore, None) };
    }

    fn create_fence(&self) -> Result<vk::Fence> {
        // Acquire fences must start unsignaled.
        let create_info = vk::FenceCreateInfo::default();
        let fence = unsafe { self.device.create_fence(&create_info, None)? };
        Ok(fence)
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        unsafe { self.device.destroy_fence(fence, None) };
    }

    fn fence_signaled(&self, fence: vk::Fence) -> Result<bool> {
        let signaled = unsafe { self.device.get_fence_status(fence)? };
        Ok(signaled)
    }

    fn reset_fence(&self, fence: vk::Fence) -> Result<()> {
        unsafe { self.device.reset_fences(&[fence])? };
        Ok(())
    }

    fn wait_for_fence(&self, fence: vk::Fence, timeout_ns: u64) -> Result<()> {
        unsafe { self.device.wait_for_fences(&[fence], true, timeout_ns)? };
        Ok(())
    }

    fn create_swapchain(
        &self,
        desc: &SwapchainDesc,
        old_swapchain: vk::SwapchainKHR,
    ) -> Result<vk::SwapchainKHR> {
        let flags = if desc.protected {
            vk::SwapchainCreateFlagsKHR::PROTECTED
        } else {
            vk::SwapchainCreateFlagsKHR::empty()
        };
        let create_info = vk::SwapchainCreateInfoKHR::default()
            .flags(flags)
            .surface(desc.surface)
            .min_image_count(desc.min_image_count)
            .image_format(desc.format.format)
            .image_color_space(desc.format.color_space)
            .image_extent(desc.extent)
            .image_array_layers(1)
            .image_usage(desc.image_usage)
            .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
            .pre_transform(desc.pre_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(vk::PresentModeKHR::FIFO)
            .clipped(true)
            .old_swapchain(old_swapchain);

        let swapchain = unsafe { self.swapchain_loader.create_swapchain(&create_info, None) }
            .map_err(PresentError::SwapchainCreation)?;
        Ok(swapchain)
    }

    fn destroy_swapchain(&self, swapchain: vk::SwapchainKHR) {
        unsafe { self.swapchain_loader.destroy_swapchain(swapchain, None) };
    }

    fn swapchain_images(&self, swapchain: vk::SwapchainKHR) -> Result<Vec<vk::Image>> {
        let images = unsafe { self.swapchain_loader.get_swapchain_images(swapchain)? };
        Ok(images)
    }

    fn acquire_next_image(
        &self,
        swapchain: vk::SwapchainKHR,
        timeout_ns: u64,
        semaphore: vk::Semaphore,
        fence: vk::Fence,
    ) -> AcquireOutcome {
        let result = unsafe {
            self.swapchain_loader
                .acquire_next_image(swapchain, timeout_ns, semaphore, fence)
        };
        match result {
            Ok((index, suboptimal)) => AcquireOutcome::Acquired { index, suboptimal },
            Err(vk::Result::TIMEOUT | vk::Result::NOT_READY) => AcquireOutcome::TimedOut,
            Err(result) => AcquireOutcome::Failed(result),
        }
    }

    fn queue_present(
        &self,
        swapchain: vk::SwapchainKHR,
        image_index: u32,
        wait_semaphore: vk::Semaphore,
        damage: Option<vk::Rect2D>,
    ) -> PresentOutcome {
        let wait_semaphores = [wait_semaphore];
        let swapchains = [swapchain];
        let image_indices = [image_index];
        let mut present_info = vk::PresentInfoKHR::default()
            .wait_semaphores(&wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        let rectangles;
        let regions;
        let mut present_regions;
        if let Some(rect) = damage {
            rectangles = [vk::RectLayerKHR::default()
                .offset(rect.offset)
                .extent(rect.extent)
                .layer(0)];
            regions = [vk::PresentRegionKHR::default().rectangles(&rectangles)];
            present_regions = vk::PresentRegionsKHR::default().regions(&regions);
            present_info = present_info.push_next(&mut present_regions);
        }

        let result = unsafe { self.swapchain_loader.queue_present(self.queue, &present_info) };
        match result {
            Ok(suboptimal) => PresentOutcome::Presented { suboptimal },
            Err(result) => PresentOutcome::Failed(result),
        }
    }

    fn incremental_present_supported(&self) -> bool {
        self.incremental_present
    }
}
