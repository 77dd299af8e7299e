//! Deferred destruction of retired presentation objects.
//!
//! A replaced swapchain and the semaphores stranded by its image ring may
//! still be referenced by in-flight GPU work when the chain lets go of them.
//! The chain hands such objects to a [`DeferredCleanup`] collaborator instead
//! of destroying them inline; [`DeferredCleanupQueue`] is the stock
//! implementation, holding every object for a fixed number of ticks before
//! destruction.

use std::collections::VecDeque;
use std::sync::Arc;

use ash::vk;
use parking_lot::Mutex;
use tracing::debug;

use crate::device::PresentDevice;

/// A swapchain retired by recreation, with the per-image semaphores its ring
/// still held.
#[derive(Debug)]
pub struct RetiredSwapchain {
    pub swapchain: vk::SwapchainKHR,
    pub semaphores: Vec<vk::Semaphore>,
}

/// Sink for GPU objects that must outlive their last submitted reference.
pub trait DeferredCleanup: Send + Sync {
    /// Queue a semaphore whose final wait has already been submitted.
    fn retire_semaphore(&self, semaphore: vk::Semaphore);

    /// Queue a replaced swapchain together with its stranded semaphores.
    fn retire_swapchain(&self, retired: RetiredSwapchain);
}

enum Retired {
    Semaphore(vk::Semaphore),
    Swapchain(RetiredSwapchain),
}

struct PendingRetire {
    resource: Retired,
    /// Tick at which the resource was queued.
    tick: u64,
}

/// Tick-delayed implementation of [`DeferredCleanup`].
///
/// Resources are destroyed once `depth` ticks have passed since they were
/// queued. Callers advance the tick once per frame, after the frame's fences
/// have been waited, so `depth` equal to the number of frames in flight
/// guarantees the GPU no longer references a resource when it is destroyed.
pub struct DeferredCleanupQueue {
    device: Arc<dyn PresentDevice>,
    /// Number of ticks a resource is held before destruction.
    depth: u64,
    inner: Mutex<CleanupState>,
}

#[derive(Default)]
struct CleanupState {
    tick: u64,
    pending: VecDeque<PendingRetire>,
}

impl DeferredCleanupQueue {
    /// Create a queue that holds resources for `depth` ticks.
    pub fn new(device: Arc<dyn PresentDevice>, depth: u64) -> Self {
        Self {
            device,
            depth,
            inner: Mutex::new(CleanupState::default()),
        }
    }

    /// Advance the tick and destroy every resource queued long enough ago.
    pub fn process(&self) {
        let mut inner = self.inner.lock();
        inner.tick += 1;
        let cutoff = inner.tick.saturating_sub(self.depth);

        // Queue order is FIFO and ticks are non-decreasing, so only the front can mature.
        while matches!(inner.pending.front(), Some(p) if p.tick < cutoff) {
            let pending = inner.pending.pop_front().expect("front just matched");
            self.destroy(pending.resource);
        }
    }

    /// Destroy every pending resource immediately.
    ///
    /// Call this during shutdown after the device has been idled.
    pub fn flush(&self) {
        let mut inner = self.inner.lock();
        while let Some(pending) = inner.pending.pop_front() {
            self.destroy(pending.resource);
        }
    }

    /// Get the number of pending destructions.
    pub fn pending_count(&self) -> usize {
        self.inner.lock().pending.len()
    }

    fn destroy(&self, resource: Retired) {
        match resource {
            Retired::Semaphore(semaphore) => self.device.destroy_semaphore(semaphore),
            Retired::Swapchain(retired) => {
                debug!("Destroying retired swapchain {:?}", retired.swapchain);
                for semaphore in retired.semaphores {
                    if semaphore != vk::Semaphore::null() {
                        self.device.destroy_semaphore(semaphore);
                    }
                }
                self.device.destroy_swapchain(retired.swapchain);
            }
        }
    }
}

impl DeferredCleanup for DeferredCleanupQueue {
    fn retire_semaphore(&self, semaphore: vk::Semaphore) {
        let mut inner = self.inner.lock();
        let tick = inner.tick;
        inner.pending.push_back(PendingRetire {
            resource: Retired::Semaphore(semaphore),
            tick,
        });
    }

    fn retire_swapchain(&self, retired: RetiredSwapchain) {
        debug!(
            "Retiring swapchain {:?} with {} stranded semaphores",
            retired.swapchain,
            retired.semaphores.len()
        );
        let mut inner = self.inner.lock();
        let tick = inner.tick;
        inner.pending.push_back(PendingRetire {
            resource: Retired::Swapchain(retired),
            tick,
        });
    }
}
