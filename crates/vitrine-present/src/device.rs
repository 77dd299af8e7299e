//! Device interface consumed by the presentation engine.
//!
//! The engine drives the GPU through [`PresentDevice`] rather than calling
//! Vulkan directly, so the acquisition and presentation logic can run against
//! a deterministic double in tests. The production implementation lives in
//! [`crate::vulkan`].

use ash::vk;

use crate::error::Result;

/// Parameters for creating the underlying swapchain object.
#[derive(Debug, Clone, Copy)]
pub struct SwapchainDesc {
    pub surface: vk::SurfaceKHR,
    pub format: vk::SurfaceFormatKHR,
    pub extent: vk::Extent2D,
    pub min_image_count: u32,
    pub image_usage: vk::ImageUsageFlags,
    pub pre_transform: vk::SurfaceTransformFlagsKHR,
    pub protected: bool,
}

/// Outcome of a bounded image acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireOutcome {
    /// An image index was handed out. `suboptimal` mirrors the driver
    /// reporting that the swapchain no longer matches the surface exactly.
    Acquired { index: u32, suboptimal: bool },
    /// The bounded wait elapsed without an image becoming available.
    TimedOut,
    /// The driver rejected the acquisition.
    Failed(vk::Result),
}

/// Outcome of a present submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresentOutcome {
    /// The frame was queued for display.
    Presented { suboptimal: bool },
    /// The driver rejected the present.
    Failed(vk::Result),
}

/// GPU entry points used by the presentation engine.
///
/// Covers synchronization-primitive lifetime, swapchain lifetime, and the
/// acquire/present calls themselves. Implementations must be callable from
/// both the producer thread and the post-buffer worker thread; the engine
/// serializes swapchain and queue access through its own state lock.
pub trait PresentDevice: Send + Sync {
    /// Create an unsignaled binary semaphore.
    fn create_semaphore(&self) -> Result<vk::Semaphore>;

    fn destroy_semaphore(&self, semaphore: vk::Semaphore);

    /// Create an unsignaled fence.
    fn create_fence(&self) -> Result<vk::Fence>;

    fn destroy_fence(&self, fence: vk::Fence);

    /// Non-blocking fence status query.
    fn fence_signaled(&self, fence: vk::Fence) -> Result<bool>;

    /// Return a signaled fence to the unsignaled state.
    fn reset_fence(&self, fence: vk::Fence) -> Result<()>;

    /// Block until the fence signals or `timeout_ns` elapses.
    fn wait_for_fence(&self, fence: vk::Fence, timeout_ns: u64) -> Result<()>;

    /// Create a swapchain for `desc.surface`, passing `old_swapchain` as the
    /// resource-reuse hint when it is not null.
    fn create_swapchain(
        &self,
        desc: &SwapchainDesc,
        old_swapchain: vk::SwapchainKHR,
    ) -> Result<vk::SwapchainKHR>;

    fn destroy_swapchain(&self, swapchain: vk::SwapchainKHR);

    /// Query the presentable images backing `swapchain`.
    fn swapchain_images(&self, swapchain: vk::SwapchainKHR) -> Result<Vec<vk::Image>>;

    /// Acquire the next presentable image, signaling `semaphore` and `fence`
    /// once the image is ready for writes.
    fn acquire_next_image(
        &self,
        swapchain: vk::SwapchainKHR,
        timeout_ns: u64,
        semaphore: vk::Semaphore,
        fence: vk::Fence,
    ) -> AcquireOutcome;

    /// Queue `image_index` for display after `wait_semaphore` signals.
    /// `damage` restricts the update to a sub-rectangle on devices where
    /// [`Self::incremental_present_supported`] reports true.
    fn queue_present(
        &self,
        swapchain: vk::SwapchainKHR,
        image_index: u32,
        wait_semaphore: vk::Semaphore,
        damage: Option<vk::Rect2D>,
    ) -> PresentOutcome;

    /// Whether presents may carry damage rectangles.
    fn incremental_present_supported(&self) -> bool;
}
