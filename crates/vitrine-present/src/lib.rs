//! Presentable-image synchronization engine for Vulkan swapchains.
//!
//! This crate provides:
//! - A presentable-image ring with single-writer sessions per frame
//! - Fence-gated recycling of acquire/present synchronization primitives
//! - Synchronous and asynchronous present-and-reacquire paths
//! - Swapchain recreation that hands pool and worker over to the successor
//! - Deferred destruction of retired swapchains and semaphores

pub mod deferred;
pub mod device;
pub mod error;
pub mod pool;
pub mod swapchain;
pub mod vulkan;
mod worker;

#[cfg(test)]
pub(crate) mod testing;

pub use deferred::{DeferredCleanup, DeferredCleanupQueue, RetiredSwapchain};
pub use device::{AcquireOutcome, PresentDevice, PresentOutcome, SwapchainDesc};
pub use error::{PresentError, Result};
pub use pool::{SyncBundle, SyncPool};
pub use swapchain::{
    PresentChain, PresentConfig, ScopedWrite, SwapResult, WriteAccess,
    STALL_GUARD_ACQUIRE_TIMEOUT,
};
pub use vulkan::VulkanDevice;
