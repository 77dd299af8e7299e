//! Presentable-image ring and frame hand-off.
//!
//! [`PresentChain`] owns a small ring of presentable images and sequences each
//! one between the producer and the display engine. Per frame the producer
//! brackets its work with [`PresentChain::begin_write`] and
//! [`PresentChain::end_write`], then calls [`PresentChain::post_sub_buffer`]
//! (or its asynchronous variant) to queue the image for display and acquire
//! the next one. Fences and semaphores recycle through a
//! [`SyncPool`](crate::pool::SyncPool), and on resize a successor chain takes
//! over the predecessor's pool and worker thread while the replaced swapchain
//! retires through deferred cleanup.

use std::sync::Arc;
use std::time::Duration;

use ash::vk;
use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, info, warn};

use crate::deferred::{DeferredCleanup, RetiredSwapchain};
use crate::device::{AcquireOutcome, PresentDevice, PresentOutcome, SwapchainDesc};
use crate::error::{PresentError, Result};
use crate::pool::{SyncBundle, SyncPool};
use crate::worker::PostBufferWorker;

/// Suggested acquire bound for window systems that can stall the acquire
/// call. Some X11 servers stop delivering vblanks once the screen turns off,
/// which hangs a FIFO swapchain inside the acquire; a bounded wait converts
/// that hang into a surface loss so the swapchain gets recreated.
pub const STALL_GUARD_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(2);

/// Creation parameters and policy for a [`PresentChain`].
#[derive(Debug, Clone, Copy)]
pub struct PresentConfig {
    /// Surface format of the presentable images.
    pub format: vk::SurfaceFormatKHR,
    /// Image extent in pixels.
    pub extent: vk::Extent2D,
    /// Lower bound on the ring size; the driver may allocate more.
    pub min_image_count: u32,
    /// Usage flags the presentable images are created with.
    pub image_usage: vk::ImageUsageFlags,
    /// Transform applied by the presentation engine.
    pub pre_transform: vk::SurfaceTransformFlagsKHR,
    /// Back the ring with protected-memory images.
    pub protected: bool,
    /// Upper bound on each acquire call. `None` waits unbounded, which is
    /// correct on platforms without known acquire stalls; see
    /// [`STALL_GUARD_ACQUIRE_TIMEOUT`] for the others.
    pub acquire_timeout: Option<Duration>,
}

impl PresentConfig {
    /// Create a config with default policy for the given format and extent.
    pub fn new(format: vk::SurfaceFormatKHR, extent: vk::Extent2D) -> Self {
        Self {
            format,
            extent,
            min_image_count: 3,
            image_usage: vk::ImageUsageFlags::COLOR_ATTACHMENT
                | vk::ImageUsageFlags::TRANSFER_DST,
            pre_transform: vk::SurfaceTransformFlagsKHR::IDENTITY,
            protected: false,
            acquire_timeout: None,
        }
    }

    /// Set the minimum image count.
    #[must_use]
    pub fn with_min_image_count(mut self, count: u32) -> Self {
        self.min_image_count = count;
        self
    }

    /// Set the image usage flags.
    #[must_use]
    pub fn with_image_usage(mut self, usage: vk::ImageUsageFlags) -> Self {
        self.image_usage = usage;
        self
    }

    /// Set the presentation pre-transform.
    #[must_use]
    pub fn with_pre_transform(mut self, transform: vk::SurfaceTransformFlagsKHR) -> Self {
        self.pre_transform = transform;
        self
    }

    /// Request protected-memory images.
    #[must_use]
    pub fn with_protected(mut self, protected: bool) -> Self {
        self.protected = protected;
        self
    }

    /// Bound each acquire call to `timeout`.
    #[must_use]
    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = Some(timeout);
        self
    }

    fn swapchain_desc(&self, surface: vk::SurfaceKHR) -> SwapchainDesc {
        SwapchainDesc {
            surface,
            format: self.format,
            extent: self.extent,
            min_image_count: self.min_image_count,
            image_usage: self.image_usage,
            pre_transform: self.pre_transform,
            protected: self.protected,
        }
    }
}

/// Combined outcome of a post-buffer call: the present submission plus the
/// follow-up acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwapResult {
    /// The frame was queued for display and the next image was acquired.
    Ack,
    /// The present or the reacquisition failed; the chain records the driver
    /// code in [`PresentChain::last_result`].
    Failed,
}

/// Everything the producer needs for one write against the acquired image.
#[derive(Debug, Clone, Copy)]
pub struct WriteAccess {
    /// Image to record against.
    pub image: vk::Image,
    /// Ring index of the image.
    pub image_index: u32,
    /// Layout the image is currently in.
    pub layout: vk::ImageLayout,
    /// Semaphore the producer's first submission must wait on.
    pub wait_semaphore: vk::Semaphore,
    /// Semaphore the producer's last submission must signal.
    pub signal_semaphore: vk::Semaphore,
}

/// Per-image record in the ring.
///
/// The semaphores are owned by the recycling protocol: they are installed by
/// an acquisition and leave again with that acquisition's fence when a later
/// acquisition lands on the same slot.
#[derive(Debug)]
struct ImageSlot {
    image: vk::Image,
    layout: vk::ImageLayout,
    acquire_semaphore: vk::Semaphore,
    present_semaphore: vk::Semaphore,
}

impl ImageSlot {
    fn new(image: vk::Image) -> Self {
        Self {
            image,
            layout: vk::ImageLayout::UNDEFINED,
            acquire_semaphore: vk::Semaphore::null(),
            present_semaphore: vk::Semaphore::null(),
        }
    }
}

/// Lock-guarded chain state shared with the post-buffer worker.
struct ChainState {
    swapchain: vk::SwapchainKHR,
    images: Vec<ImageSlot>,
    pool: SyncPool,
    /// Last driver result; anything other than `SUCCESS` disables the chain.
    last_result: vk::Result,
    /// Ring index currently held for writing or presenting.
    acquired: Option<u32>,
    is_writing: bool,
    /// True from an acquisition until the first write against it ends.
    new_acquired: bool,
    /// Asynchronous post-buffer operations not yet completed.
    pending_post_buffers: usize,
}

struct ChainShared {
    state: Mutex<ChainState>,
    /// Signaled whenever an asynchronous post-buffer operation completes.
    post_buffer_done: Condvar,
}

impl ChainState {
    /// Acquire the next presentable image using a pool bundle.
    ///
    /// On success the previous occupant's semaphores return to the pool with
    /// the bundle's fence and the bundle's semaphores take their place in the
    /// ring. A timeout is escalated to a surface loss; any fatal result
    /// disables the chain.
    fn acquire_next_image(&mut self, device: &dyn PresentDevice, timeout_ns: u64) -> Result<()> {
        debug_assert!(self.acquired.is_none(), "acquire with an image still held");
        debug_assert_eq!(self.last_result, vk::Result::SUCCESS);

        // Pool failure leaves the chain state untouched.
        let bundle = self.pool.get_or_create(device)?;

        let outcome = device.acquire_next_image(
            self.swapchain,
            timeout_ns,
            bundle.semaphores[0],
            bundle.fence,
        );
        match outcome {
            AcquireOutcome::Acquired { index, suboptimal } => {
                if suboptimal {
                    warn!("Acquired image {index} from a suboptimal swapchain");
                }
                let slot = &mut self.images[index as usize];
                // The previous occupant's semaphores become reusable once
                // this acquisition's fence signals.
                let recycled = SyncBundle {
                    fence: bundle.fence,
                    semaphores: [slot.acquire_semaphore, slot.present_semaphore],
                };
                slot.acquire_semaphore = bundle.semaphores[0];
                slot.present_semaphore = bundle.semaphores[1];
                self.pool.recycle(recycled);
                self.acquired = Some(index);
                self.new_acquired = true;
                Ok(())
            }
            AcquireOutcome::TimedOut => {
                error!(
                    "Image acquisition timed out after {timeout_ns} ns, treating surface as lost"
                );
                bundle.release(device);
                self.last_result = vk::Result::ERROR_SURFACE_LOST_KHR;
                Err(PresentError::SurfaceLost(self.last_result))
            }
            AcquireOutcome::Failed(result) => {
                error!("Image acquisition failed: {result:?}");
                bundle.release(device);
                self.last_result = result;
                Err(PresentError::SurfaceLost(result))
            }
        }
    }

    /// Queue the acquired image for display.
    ///
    /// On success ownership of the image passes to the display engine and the
    /// acquired index clears. A suboptimal result is logged and treated as
    /// success; any other failure disables the chain.
    fn present_buffer(
        &mut self,
        device: &dyn PresentDevice,
        incremental: bool,
        rect: vk::Rect2D,
    ) -> Result<()> {
        assert!(!self.is_writing, "present during an open write session");
        if self.last_result != vk::Result::SUCCESS {
            return Err(PresentError::SurfaceLost(self.last_result));
        }
        let Some(index) = self.acquired else {
            error!("Present requested with no image acquired");
            return Err(PresentError::NoImageAcquired);
        };

        let slot = &self.images[index as usize];
        let damage = if incremental { Some(rect) } else { None };

        match device.queue_present(self.swapchain, index, slot.present_semaphore, damage) {
            PresentOutcome::Presented { suboptimal } => {
                if suboptimal {
                    warn!("Swapchain is suboptimal for the surface");
                }
                self.acquired = None;
                Ok(())
            }
            PresentOutcome::Failed(result) => {
                error!("Present failed: {result:?}");
                self.last_result = result;
                Err(PresentError::SurfaceLost(result))
            }
        }
    }
}

/// A presentable-image chain bound to one surface size.
///
/// All methods take `&mut self`; callers needing cross-thread access must
/// serialize externally. The only internal thread is the post-buffer worker,
/// which shares the chain state through its lock.
pub struct PresentChain {
    device: Arc<dyn PresentDevice>,
    cleanup: Arc<dyn DeferredCleanup>,
    shared: Arc<ChainShared>,
    /// Sequential worker; `None` once the chain has been destroyed.
    worker: Option<PostBufferWorker>,
    extent: vk::Extent2D,
    acquire_timeout_ns: u64,
    incremental_present: bool,
}

impl PresentChain {
    /// Create a swapchain for `surface` and prime the first acquisition.
    ///
    /// `previous` is the chain being replaced on a resize. Its pending
    /// asynchronous post-buffer (if any) is waited out, its primitive pool
    /// and worker thread carry over to the new chain, its handle serves as
    /// the driver's resource-reuse hint, and its swapchain plus stranded
    /// ring semaphores go to `cleanup` for deferred destruction.
    pub fn new(
        device: Arc<dyn PresentDevice>,
        cleanup: Arc<dyn DeferredCleanup>,
        surface: vk::SurfaceKHR,
        config: &PresentConfig,
        previous: Option<PresentChain>,
    ) -> Result<Self> {
        let (mut pool, worker, retired) = match previous {
            Some(mut prev) => {
                prev.wait_until_post_buffer_finished();
                let (pool, worker, retired) = prev.release();
                (pool, worker, Some(retired))
            }
            None => (SyncPool::new(), PostBufferWorker::spawn(), None),
        };
        let old_handle = retired
            .as_ref()
            .map_or(vk::SwapchainKHR::null(), |r| r.swapchain);

        let created = device.create_swapchain(&config.swapchain_desc(surface), old_handle);

        // The replaced swapchain may still back in-flight presents even
        // though its handle was consumed as the reuse hint.
        if let Some(retired) = retired {
            cleanup.retire_swapchain(retired);
        }

        let swapchain = match created {
            Ok(swapchain) => swapchain,
            Err(e) => {
                error!("Failed to create swapchain: {e}");
                pool.drain(&*device);
                return Err(e);
            }
        };

        let images = match device.swapchain_images(swapchain) {
            Ok(images) => images,
            Err(e) => {
                error!("Failed to query swapchain images: {e}");
                pool.drain(&*device);
                device.destroy_swapchain(swapchain);
                return Err(e);
            }
        };
        info!(
            "Created swapchain with {} images ({}x{})",
            images.len(),
            config.extent.width,
            config.extent.height
        );

        let state = ChainState {
            swapchain,
            images: images.into_iter().map(ImageSlot::new).collect(),
            pool,
            last_result: vk::Result::SUCCESS,
            acquired: None,
            is_writing: false,
            new_acquired: false,
            pending_post_buffers: 0,
        };
        let mut chain = Self {
            incremental_present: device.incremental_present_supported(),
            device,
            cleanup,
            shared: Arc::new(ChainShared {
                state: Mutex::new(state),
                post_buffer_done: Condvar::new(),
            }),
            worker: Some(worker),
            extent: config.extent,
            acquire_timeout_ns: config
                .acquire_timeout
                .map_or(u64::MAX, |t| u64::try_from(t.as_nanos()).unwrap_or(u64::MAX)),
        };

        // Prime the ring so the first write finds an image waiting.
        let primed = chain
            .shared
            .state
            .lock()
            .acquire_next_image(&*chain.device, chain.acquire_timeout_ns);
        if let Err(e) = primed {
            error!("Priming acquisition failed: {e}");
            chain.destroy();
            return Err(e);
        }
        Ok(chain)
    }

    /// Release every GPU object the chain owns.
    ///
    /// Blocks until any pending asynchronous post-buffer completes, waits out
    /// every pooled fence, then destroys the ring semaphores and the
    /// swapchain. Must not be called with a write session open.
    pub fn destroy(&mut self) {
        self.wait_until_post_buffer_finished();

        {
            let mut state = self.shared.state.lock();
            let state = &mut *state;
            assert!(!state.is_writing, "destroy during an open write session");

            state.pool.drain(&*self.device);
            for slot in state.images.drain(..) {
                if slot.acquire_semaphore != vk::Semaphore::null() {
                    self.device.destroy_semaphore(slot.acquire_semaphore);
                }
                if slot.present_semaphore != vk::Semaphore::null() {
                    self.device.destroy_semaphore(slot.present_semaphore);
                }
            }
            if state.swapchain != vk::SwapchainKHR::null() {
                self.device.destroy_swapchain(state.swapchain);
                state.swapchain = vk::SwapchainKHR::null();
            }
            state.acquired = None;
        }

        // Joins the worker thread unless a successor chain took it over. The
        // state lock is released first; queued failure reports never touch
        // the state, so the join cannot deadlock either way.
        self.worker = None;
        debug!("Present chain destroyed");
    }

    /// Open a write session against the acquired image.
    ///
    /// The producer must make its first submission wait on
    /// [`WriteAccess::wait_semaphore`] and its last submission signal
    /// [`WriteAccess::signal_semaphore`]. A second session against the same
    /// acquisition (repeated partial updates without an intervening present)
    /// chains onto the previous session's signal semaphore.
    ///
    /// # Panics
    /// Panics if a write session is already open.
    pub fn begin_write(&mut self) -> Result<WriteAccess> {
        let mut state = self.shared.state.lock();
        let state = &mut *state;
        assert!(!state.is_writing, "write session already open");

        if state.last_result != vk::Result::SUCCESS {
            return Err(PresentError::SurfaceLost(state.last_result));
        }
        let Some(index) = state.acquired else {
            return Err(PresentError::NoImageAcquired);
        };

        let slot = &mut state.images[index as usize];
        if !state.new_acquired {
            // Second write against the same acquisition: the previous
            // signal becomes this write's wait and a fresh signal semaphore
            // is minted. The stale acquire semaphore has already been waited
            // on, so it retires through deferred cleanup.
            let fresh = self.device.create_semaphore()?;
            self.cleanup.retire_semaphore(slot.acquire_semaphore);
            slot.acquire_semaphore = slot.present_semaphore;
            slot.present_semaphore = fresh;
        }
        state.is_writing = true;

        Ok(WriteAccess {
            image: slot.image,
            image_index: index,
            layout: slot.layout,
            wait_semaphore: slot.acquire_semaphore,
            signal_semaphore: slot.present_semaphore,
        })
    }

    /// Close the write session and mark the image presentable.
    ///
    /// # Panics
    /// Panics if no write session is open.
    pub fn end_write(&mut self) {
        let mut state = self.shared.state.lock();
        let state = &mut *state;
        assert!(state.is_writing, "no write session is open");
        let index = state.acquired.expect("write session without an acquired image");

        state.images[index as usize].layout = vk::ImageLayout::PRESENT_SRC_KHR;
        state.is_writing = false;
        state.new_acquired = false;
    }

    /// Open a write session that ends automatically on drop.
    pub fn scoped_write(&mut self) -> Result<ScopedWrite<'_>> {
        let access = self.begin_write()?;
        Ok(ScopedWrite {
            chain: self,
            access,
        })
    }

    /// Present the written image with `rect` as the damage region, then
    /// immediately acquire the next image.
    ///
    /// The damage rectangle only reaches the driver when the device supports
    /// incremental presentation; otherwise the whole surface is redrawn.
    pub fn post_sub_buffer(&mut self, rect: vk::Rect2D) -> SwapResult {
        let mut state = self.shared.state.lock();
        if state
            .present_buffer(&*self.device, self.incremental_present, rect)
            .is_err()
        {
            return SwapResult::Failed;
        }
        if state
            .acquire_next_image(&*self.device, self.acquire_timeout_ns)
            .is_err()
        {
            return SwapResult::Failed;
        }
        SwapResult::Ack
    }

    /// Present the written image synchronously, then run the reacquisition on
    /// the background worker.
    ///
    /// `callback` is invoked on the worker thread with the combined outcome;
    /// callbacks from consecutive calls run in issuance order. The next
    /// write session can only begin once the callback reports, since the
    /// follow-up acquisition supplies the image it needs.
    pub fn post_sub_buffer_async(
        &mut self,
        rect: vk::Rect2D,
        callback: impl FnOnce(SwapResult) + Send + 'static,
    ) {
        {
            let mut state = self.shared.state.lock();
            if state
                .present_buffer(&*self.device, self.incremental_present, rect)
                .is_err()
            {
                drop(state);
                // Routed through the worker so the report still lands behind
                // any earlier async completion.
                self.worker().post(move || callback(SwapResult::Failed));
                return;
            }
            state.pending_post_buffers += 1;
        }

        let shared = Arc::clone(&self.shared);
        let device = Arc::clone(&self.device);
        let timeout_ns = self.acquire_timeout_ns;
        self.worker().post(move || {
            let acquired = shared
                .state
                .lock()
                .acquire_next_image(&*device, timeout_ns);
            // The callback runs outside the lock so it may inspect the chain.
            callback(if acquired.is_ok() {
                SwapResult::Ack
            } else {
                SwapResult::Failed
            });
            let mut state = shared.state.lock();
            state.pending_post_buffers -= 1;
            shared.post_buffer_done.notify_all();
        });
    }

    /// Block until no asynchronous post-buffer operation is pending.
    pub fn wait_until_post_buffer_finished(&self) {
        let mut state = self.shared.state.lock();
        while state.pending_post_buffers > 0 {
            self.shared.post_buffer_done.wait(&mut state);
        }
    }

    /// Image extent in pixels.
    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    /// Last driver result recorded by an acquire or present.
    pub fn last_result(&self) -> vk::Result {
        self.shared.state.lock().last_result
    }

    /// Number of images in the ring.
    pub fn image_count(&self) -> usize {
        self.shared.state.lock().images.len()
    }

    /// Ring index currently held for writing, if any.
    pub fn acquired_index(&self) -> Option<u32> {
        self.shared.state.lock().acquired
    }

    /// Number of asynchronous post-buffer operations still in flight.
    pub fn pending_post_buffers(&self) -> usize {
        self.shared.state.lock().pending_post_buffers
    }

    /// Whether presents carry damage rectangles.
    pub fn incremental_present_supported(&self) -> bool {
        self.incremental_present
    }

    /// Strip the chain for succession: hand over the pool, the worker thread
    /// and the retired swapchain husk. Pending async work must be finished.
    fn release(&mut self) -> (SyncPool, PostBufferWorker, RetiredSwapchain) {
        let (pool, retired) = {
            let mut state = self.shared.state.lock();
            let state = &mut *state;
            debug_assert_eq!(state.pending_post_buffers, 0);
            assert!(
                !state.is_writing,
                "swapchain replaced during an open write session"
            );

            let pool = std::mem::take(&mut state.pool);
            let mut semaphores = Vec::with_capacity(state.images.len() * 2);
            for slot in state.images.drain(..) {
                if slot.acquire_semaphore != vk::Semaphore::null() {
                    semaphores.push(slot.acquire_semaphore);
                }
                if slot.present_semaphore != vk::Semaphore::null() {
                    semaphores.push(slot.present_semaphore);
                }
            }
            let retired = RetiredSwapchain {
                swapchain: state.swapchain,
                semaphores,
            };
            state.swapchain = vk::SwapchainKHR::null();
            state.acquired = None;
            (pool, retired)
        };

        let worker = self.worker.take().expect("present chain already destroyed");
        (pool, worker, retired)
    }

    fn worker(&self) -> &PostBufferWorker {
        self.worker.as_ref().expect("present chain already destroyed")
    }

    #[cfg(test)]
    pub(crate) fn pool_len(&self) -> usize {
        self.shared.state.lock().pool.len()
    }

    #[cfg(test)]
    pub(crate) fn ring_semaphores(&self) -> Vec<[vk::Semaphore; 2]> {
        self.shared
            .state
            .lock()
            .images
            .iter()
            .map(|slot| [slot.acquire_semaphore, slot.present_semaphore])
            .collect()
    }
}

impl Drop for PresentChain {
    fn drop(&mut self) {
        debug_assert!(
            self.worker.is_none() || std::thread::panicking(),
            "present chain dropped without destroy or hand-off"
        );
    }
}

/// Write session that ends automatically when dropped.
pub struct ScopedWrite<'a> {
    chain: &'a mut PresentChain,
    access: WriteAccess,
}

impl ScopedWrite<'_> {
    /// The image and semaphore pair for this session.
    pub fn access(&self) -> &WriteAccess {
        &self.access
    }
}

impl Drop for ScopedWrite<'_> {
    fn drop(&mut self) {
        self.chain.end_write();
    }
}
