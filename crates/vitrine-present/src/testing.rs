//! Deterministic doubles for the device and cleanup collaborators.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use ash::vk::{self, Handle};
use parking_lot::Mutex;

use crate::deferred::{DeferredCleanup, RetiredSwapchain};
use crate::device::{AcquireOutcome, PresentDevice, PresentOutcome, SwapchainDesc};
use crate::error::{PresentError, Result};
use crate::swapchain::PresentConfig;

pub(crate) fn test_surface() -> vk::SurfaceKHR {
    vk::SurfaceKHR::from_raw(0x5AFE)
}

pub(crate) fn test_config() -> PresentConfig {
    PresentConfig::new(
        vk::SurfaceFormatKHR {
            format: vk::Format::B8G8R8A8_UNORM,
            color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
        },
        vk::Extent2D {
            width: 640,
            height: 480,
        },
    )
}

pub(crate) fn test_desc() -> SwapchainDesc {
    SwapchainDesc {
        surface: test_surface(),
        format: vk::SurfaceFormatKHR {
            format: vk::Format::B8G8R8A8_UNORM,
            color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
        },
        extent: vk::Extent2D {
            width: 640,
            height: 480,
        },
        min_image_count: 3,
        image_usage: vk::ImageUsageFlags::COLOR_ATTACHMENT,
        pre_transform: vk::SurfaceTransformFlagsKHR::IDENTITY,
        protected: false,
    }
}

/// One recorded present submission.
#[derive(Debug, Clone, Copy)]
pub(crate) struct PresentRecord {
    pub(crate) image_index: u32,
    pub(crate) wait_semaphore: vk::Semaphore,
    pub(crate) damage: Option<vk::Rect2D>,
}

/// Deterministic [`PresentDevice`] double.
///
/// Handles come from a shared counter and stay tracked while live, so tests
/// can assert exact create/destroy balance; destroying an unknown handle
/// panics. Fences signal either automatically on acquisition (the default)
/// or only when the test says so. Acquisitions hand out ring indices
/// round-robin unless an outcome has been scripted.
pub(crate) struct FakeGpu {
    inner: Mutex<FakeState>,
}

struct FakeState {
    next_handle: u64,
    live_semaphores: HashSet<u64>,
    live_fences: HashSet<u64>,
    live_swapchains: HashSet<u64>,
    images: HashMap<u64, Vec<vk::Image>>,
    signaled_fences: HashSet<u64>,
    auto_signal: bool,
    incremental_present: bool,
    image_count: u32,
    next_image: u32,
    acquire_script: VecDeque<AcquireOutcome>,
    present_script: VecDeque<PresentOutcome>,
    acquire_calls: u32,
    presents: Vec<PresentRecord>,
    fail_semaphores: u32,
    fail_swapchains: u32,
    acquire_delay: Option<Duration>,
}

impl FakeGpu {
    pub(crate) fn new(image_count: u32) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(FakeState {
                next_handle: 1,
                live_semaphores: HashSet::new(),
                live_fences: HashSet::new(),
                live_swapchains: HashSet::new(),
                images: HashMap::new(),
                signaled_fences: HashSet::new(),
                auto_signal: true,
                incremental_present: true,
                image_count,
                next_image: 0,
                acquire_script: VecDeque::new(),
                present_script: VecDeque::new(),
                acquire_calls: 0,
                presents: Vec::new(),
                fail_semaphores: 0,
                fail_swapchains: 0,
                acquire_delay: None,
            }),
        })
    }

    pub(crate) fn live_semaphores(&self) -> usize {
        self.inner.lock().live_semaphores.len()
    }

    pub(crate) fn live_fences(&self) -> usize {
        self.inner.lock().live_fences.len()
    }

    pub(crate) fn live_swapchains(&self) -> usize {
        self.inner.lock().live_swapchains.len()
    }

    pub(crate) fn acquire_calls(&self) -> u32 {
        self.inner.lock().acquire_calls
    }

    pub(crate) fn present_calls(&self) -> usize {
        self.inner.lock().presents.len()
    }

    pub(crate) fn presents(&self) -> Vec<PresentRecord> {
        self.inner.lock().presents.clone()
    }

    pub(crate) fn signal_fence(&self, fence: vk::Fence) {
        let mut state = self.inner.lock();
        assert!(state.live_fences.contains(&fence.as_raw()));
        state.signaled_fences.insert(fence.as_raw());
    }

    pub(crate) fn signal_all_fences(&self) {
        let mut state = self.inner.lock();
        let fences: Vec<u64> = state.live_fences.iter().copied().collect();
        state.signaled_fences.extend(fences);
    }

    pub(crate) fn set_auto_signal(&self, auto_signal: bool) {
        self.inner.lock().auto_signal = auto_signal;
    }

    pub(crate) fn set_incremental_present(&self, supported: bool) {
        self.inner.lock().incremental_present = supported;
    }

    pub(crate) fn set_acquire_delay(&self, delay: Duration) {
        self.inner.lock().acquire_delay = Some(delay);
    }

    pub(crate) fn script_acquire(&self, outcome: AcquireOutcome) {
        self.inner.lock().acquire_script.push_back(outcome);
    }

    pub(crate) fn script_present(&self, outcome: PresentOutcome) {
        self.inner.lock().present_script.push_back(outcome);
    }

    pub(crate) fn fail_semaphore_creations(&self, count: u32) {
        self.inner.lock().fail_semaphores = count;
    }

    pub(crate) fn fail_swapchain_creations(&self, count: u32) {
        self.inner.lock().fail_swapchains = count;
    }

    fn handle(state: &mut FakeState) -> u64 {
        let handle = state.next_handle;
        state.next_handle += 1;
        handle
    }
}

impl PresentDevice for FakeGpu {
    fn create_semaphore(&self) -> Result<vk::Semaphore> {
        let mut state = self.inner.lock();
        if state.fail_semaphores > 0 {
            state.fail_semaphores -= 1;
            return Err(PresentError::Vulkan(vk::Result::ERROR_OUT_OF_HOST_MEMORY));
        }
        let handle = Self::handle(&mut state);
        state.live_semaphores.insert(handle);
        Ok(vk::Semaphore::from_raw(handle))
    }

    fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        let removed = self
            .inner
            .lock()
            .live_semaphores
            .remove(&semaphore.as_raw());
        assert!(removed, "destroying unknown semaphore {semaphore:?}");
    }

    fn create_fence(&self) -> Result<vk::Fence> {
        let mut state = self.inner.lock();
        let handle = Self::handle(&mut state);
        state.live_fences.insert(handle);
        Ok(vk::Fence::from_raw(handle))
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        let mut state = self.inner.lock();
        let removed = state.live_fences.remove(&fence.as_raw());
        assert!(removed, "destroying unknown fence {fence:?}");
        state.signaled_fences.remove(&fence.as_raw());
    }

    fn fence_signaled(&self, fence: vk::Fence) -> Result<bool> {
        let state = self.inner.lock();
        assert!(state.live_fences.contains(&fence.as_raw()));
        Ok(state.signaled_fences.contains(&fence.as_raw()))
    }

    fn reset_fence(&self, fence: vk::Fence) -> Result<()> {
        let mut state = self.inner.lock();
        assert!(state.live_fences.contains(&fence.as_raw()));
        state.signaled_fences.remove(&fence.as_raw());
        Ok(())
    }

    fn wait_for_fence(&self, fence: vk::Fence, _timeout_ns: u64) -> Result<()> {
        // The pretend GPU always finishes; the wait never blocks.
        let mut state = self.inner.lock();
        assert!(state.live_fences.contains(&fence.as_raw()));
        state.signaled_fences.insert(fence.as_raw());
        Ok(())
    }

    fn create_swapchain(
        &self,
        _desc: &SwapchainDesc,
        _old_swapchain: vk::SwapchainKHR,
    ) -> Result<vk::SwapchainKHR> {
        let mut state = self.inner.lock();
        if state.fail_swapchains > 0 {
            state.fail_swapchains -= 1;
            return Err(PresentError::SwapchainCreation(
                vk::Result::ERROR_INITIALIZATION_FAILED,
            ));
        }
        let handle = Self::handle(&mut state);
        state.live_swapchains.insert(handle);
        let count = state.image_count;
        let mut images = Vec::with_capacity(count as usize);
        for _ in 0..count {
            images.push(vk::Image::from_raw(Self::handle(&mut state)));
        }
        state.images.insert(handle, images);
        Ok(vk::SwapchainKHR::from_raw(handle))
    }

    fn destroy_swapchain(&self, swapchain: vk::SwapchainKHR) {
        let mut state = self.inner.lock();
        let removed = state.live_swapchains.remove(&swapchain.as_raw());
        assert!(removed, "destroying unknown swapchain {swapchain:?}");
        state.images.remove(&swapchain.as_raw());
    }

    fn swapchain_images(&self, swapchain: vk::SwapchainKHR) -> Result<Vec<vk::Image>> {
        let state = self.inner.lock();
        Ok(state.images[&swapchain.as_raw()].clone())
    }

    fn acquire_next_image(
        &self,
        swapchain: vk::SwapchainKHR,
        _timeout_ns: u64,
        semaphore: vk::Semaphore,
        fence: vk::Fence,
    ) -> AcquireOutcome {
        let delay = {
            let mut state = self.inner.lock();
            state.acquire_calls += 1;
            assert!(state.live_swapchains.contains(&swapchain.as_raw()));
            assert!(
                state.live_semaphores.contains(&semaphore.as_raw()),
                "acquire with unknown semaphore"
            );
            assert!(
                state.live_fences.contains(&fence.as_raw()),
                "acquire with unknown fence"
            );
            assert!(
                !state.signaled_fences.contains(&fence.as_raw()),
                "acquire fence must arrive unsignaled"
            );
            state.acquire_delay
        };
        if let Some(delay) = delay {
            thread::sleep(delay);
        }

        let mut state = self.inner.lock();
        if let Some(outcome) = state.acquire_script.pop_front() {
            if matches!(outcome, AcquireOutcome::Acquired { .. }) && state.auto_signal {
                state.signaled_fences.insert(fence.as_raw());
            }
            return outcome;
        }

        let index = state.next_image;
        state.next_image = (state.next_image + 1) % state.image_count;
        if state.auto_signal {
            state.signaled_fences.insert(fence.as_raw());
        }
        AcquireOutcome::Acquired {
            index,
            suboptimal: false,
        }
    }

    fn queue_present(
        &self,
        swapchain: vk::SwapchainKHR,
        image_index: u32,
        wait_semaphore: vk::Semaphore,
        damage: Option<vk::Rect2D>,
    ) -> PresentOutcome {
        let mut state = self.inner.lock();
        assert!(state.live_swapchains.contains(&swapchain.as_raw()));
        assert!(
            state.live_semaphores.contains(&wait_semaphore.as_raw()),
            "present with unknown semaphore"
        );
        assert!(image_index < state.image_count);
        state.presents.push(PresentRecord {
            image_index,
            wait_semaphore,
            damage,
        });
        state
            .present_script
            .pop_front()
            .unwrap_or(PresentOutcome::Presented { suboptimal: false })
    }

    fn incremental_present_supported(&self) -> bool {
        self.inner.lock().incremental_present
    }
}

/// [`DeferredCleanup`] double that records retired objects without
/// destroying them.
#[derive(Default)]
pub(crate) struct RecordingCleanup {
    pub(crate) semaphores: Mutex<Vec<vk::Semaphore>>,
    pub(crate) swapchains: Mutex<Vec<RetiredSwapchain>>,
}

impl DeferredCleanup for RecordingCleanup {
    fn retire_semaphore(&self, semaphore: vk::Semaphore) {
        self.semaphores.lock().push(semaphore);
    }

    fn retire_swapchain(&self, retired: RetiredSwapchain) {
        self.swapchains.lock().push(retired);
    }
}
