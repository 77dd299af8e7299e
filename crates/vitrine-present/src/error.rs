//! Presentation error types.

use ash::vk;
use thiserror::Error;

/// Presentation-related errors.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresentError {
    /// Vulkan error.
    #[error("Vulkan error: {0}")]
    Vulkan(#[from] vk::Result),

    /// Swapchain creation failed.
    #[error("Swapchain creation failed: {0}")]
    SwapchainCreation(vk::Result),

    /// No presentable image is currently acquired.
    #[error("No presentable image is acquired")]
    NoImageAcquired,

    /// A fatal acquire or present result disabled the swapchain. It must be
    /// destroyed and recreated before presentation can continue.
    #[error("Surface lost ({0}), swapchain must be recreated")]
    SurfaceLost(vk::Result),
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, PresentError>;
