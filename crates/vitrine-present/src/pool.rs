//! Recycling pool for per-acquisition synchronization primitives.
//!
//! Every acquisition consumes a fence plus a pair of semaphores. The driver
//! signals the fence once the acquired image is ready, which is also the
//! point at which the primitives retired by the previous occupant of that
//! image slot become safe to reuse. Bundles therefore travel through a FIFO
//! queue keyed on fence completion: the front bundle is reused once its
//! fence has signaled, otherwise a fresh bundle is fabricated.

use std::collections::VecDeque;

use ash::vk;
use tracing::debug;

use crate::device::PresentDevice;
use crate::error::Result;

/// A fence and the semaphore pair recycled through one acquisition.
///
/// `semaphores[0]` is signaled by the acquisition and waited by the producer;
/// `semaphores[1]` is signaled by the producer and waited by the present.
/// Slots may be null for bundles recycled out of a freshly created ring,
/// where the image had no previous occupant.
#[derive(Debug, Clone, Copy)]
pub struct SyncBundle {
    pub fence: vk::Fence,
    pub semaphores: [vk::Semaphore; 2],
}

impl SyncBundle {
    /// Destroy every primitive the bundle still carries.
    pub(crate) fn release(&self, device: &dyn PresentDevice) {
        for semaphore in self.semaphores {
            if semaphore != vk::Semaphore::null() {
                device.destroy_semaphore(semaphore);
            }
        }
        if self.fence != vk::Fence::null() {
            device.destroy_fence(self.fence);
        }
    }
}

/// FIFO pool of [`SyncBundle`]s gated on fence completion.
#[derive(Default)]
pub struct SyncPool {
    bundles: VecDeque<SyncBundle>,
}

impl SyncPool {
    /// Create an empty pool.
    pub fn new() -> Self {
        Self {
            bundles: VecDeque::new(),
        }
    }

    /// Hand out a bundle ready for the next acquisition.
    ///
    /// Reuses the front bundle when its fence has signaled, resetting the
    /// fence and filling any null semaphore slots. An unsignaled front stays
    /// queued and a fresh bundle is fabricated instead, so primitives are
    /// never reused while the GPU may still reference them.
    pub fn get_or_create(&mut self, device: &dyn PresentDevice) -> Result<SyncBundle> {
        let front_ready = match self.bundles.front() {
            Some(front) => device.fence_signaled(front.fence)?,
            None => false,
        };
        if !front_ready {
            return Self::create(device);
        }

        let mut bundle = self.bundles.pop_front().expect("front just checked");
        if let Err(e) = device.reset_fence(bundle.fence) {
            bundle.release(device);
            return Err(e);
        }
        for slot in &mut bundle.semaphores {
            if *slot == vk::Semaphore::null() {
                match device.create_semaphore() {
                    Ok(semaphore) => *slot = semaphore,
                    Err(e) => {
                        bundle.release(device);
                        return Err(e);
                    }
                }
            }
        }
        Ok(bundle)
    }

    fn create(device: &dyn PresentDevice) -> Result<SyncBundle> {
        let fence = device.create_fence()?;
        let mut semaphores = [vk::Semaphore::null(); 2];
        for slot in &mut semaphores {
            match device.create_semaphore() {
                Ok(semaphore) => *slot = semaphore,
                Err(e) => {
                    SyncBundle { fence, semaphores }.release(device);
                    return Err(e);
                }
            }
        }
        debug!("Fabricated new sync bundle");
        Ok(SyncBundle { fence, semaphores })
    }

    /// Return a used bundle to the back of the queue for a later fence check.
    pub fn recycle(&mut self, bundle: SyncBundle) {
        debug_assert_ne!(bundle.fence, vk::Fence::null());
        self.bundles.push_back(bundle);
    }

    /// Number of bundles waiting on their fences.
    pub fn len(&self) -> usize {
        self.bundles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bundles.is_empty()
    }

    /// Wait out and destroy every queued bundle.
    pub fn drain(&mut self, device: &dyn PresentDevice) {
        while let Some(bundle) = self.bundles.pop_front() {
            if bundle.fence != vk::Fence::null() {
                if let Err(e) = device.wait_for_fence(bundle.fence, u64::MAX) {
                    tracing::error!("Fence wait failed while draining sync pool: {e}");
                }
            }
            bundle.release(device);
        }
    }
}
