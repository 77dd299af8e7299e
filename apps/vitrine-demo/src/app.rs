//! Demo application state and frame loop.

use std::sync::Arc;
use std::time::Instant;

use ash::vk;
use tracing::{error, info, warn};
use vitrine_present::{
    DeferredCleanupQueue, PresentChain, SwapResult, VulkanDevice, WriteAccess,
};
use winit::application::ApplicationHandler;
use winit::dpi::PhysicalSize;
use winit::event::WindowEvent;
use winit::event_loop::ActiveEventLoop;
use winit::window::{Window, WindowId};

use crate::gpu::GpuContext;

const WINDOW_TITLE: &str = "Vitrine Demo";
const WIDTH: u32 = 1280;
const HEIGHT: u32 = 720;

/// Post-buffers a retired object must age before destruction. Covers the
/// deepest presentation queue a driver is allowed to keep in flight here.
const CLEANUP_DEPTH: u64 = 4;

/// Winit application shell.
#[derive(Default)]
pub struct DemoApp {
    state: Option<DemoState>,
}

/// Everything the demo owns while the window is alive.
///
/// Field order keeps the GPU context and window alive until the engine
/// objects above them have dropped.
struct DemoState {
    device: Arc<VulkanDevice>,
    cleanup_queue: Arc<DeferredCleanupQueue>,
    /// `None` after shutdown or after a failed replacement.
    chain: Option<PresentChain>,
    command_pool: vk::CommandPool,
    command_buffer: vk::CommandBuffer,
    submit_fence: vk::Fence,
    start_time: Instant,
    frame_count: u64,
    gpu: GpuContext,
    window: Arc<Window>,
}

impl ApplicationHandler for DemoApp {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.state.is_some() {
            return;
        }

        info!("Creating application state...");

        match Self::create_state(event_loop) {
            Ok(state) => {
                self.state = Some(state);
                info!("Application ready");
            }
            Err(e) => {
                error!("Failed to initialize application: {e}");
                event_loop.exit();
            }
        }
    }

    fn window_event(&mut self, event_loop: &ActiveEventLoop, _id: WindowId, event: WindowEvent) {
        match event {
            WindowEvent::CloseRequested => {
                info!("Close requested");
                self.shutdown();
                event_loop.exit();
            }
            WindowEvent::RedrawRequested => {
                let result = match &mut self.state {
                    Some(state) => state.render_frame(),
                    None => return,
                };
                match result {
                    Ok(()) => {
                        if let Some(state) = &self.state {
                            state.window.request_redraw();
                        }
                    }
                    Err(e) => {
                        error!("Render error: {e}");
                        self.shutdown();
                        event_loop.exit();
                    }
                }
            }
            WindowEvent::Resized(size) => {
                let result = match &mut self.state {
                    Some(state) => state.handle_resize(size.width, size.height),
                    None => return,
                };
                if let Err(e) = result {
                    error!("Resize error: {e}");
                    self.shutdown();
                    event_loop.exit();
                }
            }
            _ => {}
        }
    }

    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        if let Some(state) = &self.state {
            state.window.request_redraw();
        }
    }
}

impl DemoApp {
    fn create_state(event_loop: &ActiveEventLoop) -> anyhow::Result<DemoState> {
        let window_attrs = Window::default_attributes()
            .with_title(WINDOW_TITLE)
            .with_inner_size(PhysicalSize::new(WIDTH, HEIGHT));
        let window = Arc::new(event_loop.create_window(window_attrs)?);

        let gpu = GpuContext::build(WINDOW_TITLE, window.as_ref())?;
        // SAFETY: Handles were just created and the context outlives the
        // adapter through DemoState
        let device = Arc::new(unsafe {
            VulkanDevice::new(
                gpu.instance(),
                gpu.device_arc(),
                gpu.queue(),
                gpu.enabled_extensions(),
            )
        });
        let cleanup_queue = Arc::new(DeferredCleanupQueue::new(device.clone(), CLEANUP_DEPTH));

        let size = window.inner_size();
        let config = gpu.present_config(size.width.max(1), size.height.max(1))?;
        let chain = PresentChain::new(
            device.clone(),
            cleanup_queue.clone(),
            gpu.surface(),
            &config,
            None,
        )?;

        let pool_info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(gpu.queue_family())
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);
        // SAFETY: Device is valid
        let command_pool = unsafe { gpu.device().create_command_pool(&pool_info, None)? };

        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(command_pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        // SAFETY: Device and command pool are valid
        let command_buffer = unsafe { gpu.device().allocate_command_buffers(&alloc_info)?[0] };

        // Starts signaled so the first frame does not wait
        let fence_info = vk::FenceCreateInfo::default().flags(vk::FenceCreateFlags::SIGNALED);
        // SAFETY: Device is valid
        let submit_fence = unsafe { gpu.device().create_fence(&fence_info, None)? };

        Ok(DemoState {
            device,
            cleanup_queue,
            chain: Some(chain),
            command_pool,
            command_buffer,
            submit_fence,
            start_time: Instant::now(),
            frame_count: 0,
            gpu,
            window,
        })
    }

    fn shutdown(&mut self) {
        if let Some(mut state) = self.state.take() {
            state.cleanup();
        }
    }
}

impl DemoState {
    /// Record and submit one animated clear, then post the full frame.
    fn render_frame(&mut self) -> anyhow::Result<()> {
        let Some(chain) = self.chain.as_mut() else {
            return Ok(());
        };
        let device = self.gpu.device();

        // One producer submission in flight; its command buffer is reused
        // only after the GPU is done with it.
        unsafe {
            device.wait_for_fences(&[self.submit_fence], true, u64::MAX)?;
            device.reset_fences(&[self.submit_fence])?;
        }

        let elapsed = self.start_time.elapsed().as_secs_f32();
        {
            let write = chain.scoped_write()?;
            let access = *write.access();

            unsafe {
                device.reset_command_buffer(
                    self.command_buffer,
                    vk::CommandBufferResetFlags::empty(),
                )?;
                let begin_info = vk::CommandBufferBeginInfo::default()
                    .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
                device.begin_command_buffer(self.command_buffer, &begin_info)?;

                record_clear(device, self.command_buffer, &access, clear_color(elapsed));

                device.end_command_buffer(self.command_buffer)?;

                let wait_semaphores = [access.wait_semaphore];
                let wait_stages = [vk::PipelineStageFlags::TRANSFER];
                let signal_semaphores = [access.signal_semaphore];
                let command_buffers = [self.command_buffer];
                let submit_info = vk::SubmitInfo::default()
                    .wait_semaphores(&wait_semaphores)
                    .wait_dst_stage_mask(&wait_stages)
                    .command_buffers(&command_buffers)
                    .signal_semaphores(&signal_semaphores);
                device.queue_submit(self.gpu.queue(), &[submit_info], self.submit_fence)?;
            }
        }

        let damage = vk::Rect2D {
            offset: vk::Offset2D { x: 0, y: 0 },
            extent: chain.extent(),
        };
        if chain.post_sub_buffer(damage) == SwapResult::Failed {
            anyhow::bail!("Post-buffer failed with {:?}", chain.last_result());
        }

        self.cleanup_queue.process();
        self.frame_count += 1;
        Ok(())
    }

    /// Replace the chain, handing the primitive pool and worker over to the
    /// successor.
    fn handle_resize(&mut self, width: u32, height: u32) -> anyhow::Result<()> {
        if width == 0 || height == 0 {
            return Ok(());
        }
        let Some(current) = self.chain.as_ref() else {
            return Ok(());
        };
        if current.extent().width == width && current.extent().height == height {
            return Ok(());
        }

        let config = self.gpu.present_config(width, height)?;
        let old = self.chain.take();
        let chain = PresentChain::new(
            self.device.clone(),
            self.cleanup_queue.clone(),
            self.gpu.surface(),
            &config,
            old,
        )?;
        self.chain = Some(chain);

        info!("Resized to {width}x{height}");
        Ok(())
    }

    /// Tear down GPU state. Blocks until the device is idle.
    fn cleanup(&mut self) {
        if let Err(e) = self.gpu.wait_idle() {
            warn!("Device wait failed during shutdown: {e}");
        }
        if let Some(mut chain) = self.chain.take() {
            chain.destroy();
        }
        self.cleanup_queue.flush();

        let device = self.gpu.device();
        // SAFETY: The device is idle and nothing references these objects
        unsafe {
            device.destroy_fence(self.submit_fence, None);
            device.destroy_command_pool(self.command_pool, None);
        }

        info!("Shut down after {} frames", self.frame_count);
    }
}

/// Record the transition out of the acquired layout, the clear itself, and
/// the transition into the presentable layout.
fn record_clear(
    device: &ash::Device,
    command_buffer: vk::CommandBuffer,
    access: &WriteAccess,
    color: [f32; 4],
) {
    let subresource_range = vk::ImageSubresourceRange::default()
        .aspect_mask(vk::ImageAspectFlags::COLOR)
        .base_mip_level(0)
        .level_count(1)
        .base_array_layer(0)
        .layer_count(1);

    let to_transfer = vk::ImageMemoryBarrier::default()
        .src_access_mask(vk::AccessFlags::empty())
        .dst_access_mask(vk::AccessFlags::TRANSFER_WRITE)
        .old_layout(access.layout)
        .new_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .image(access.image)
        .subresource_range(subresource_range);

    let to_present = vk::ImageMemoryBarrier::default()
        .src_access_mask(vk::AccessFlags::TRANSFER_WRITE)
        .dst_access_mask(vk::AccessFlags::empty())
        .old_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
        .new_layout(vk::ImageLayout::PRESENT_SRC_KHR)
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .image(access.image)
        .subresource_range(subresource_range);

    // SAFETY: Command buffer is in the recording state
    unsafe {
        device.cmd_pipeline_barrier(
            command_buffer,
            vk::PipelineStageFlags::TRANSFER,
            vk::PipelineStageFlags::TRANSFER,
            vk::DependencyFlags::empty(),
            &[],
            &[],
            &[to_transfer],
        );

        let clear_value = vk::ClearColorValue { float32: color };
        device.cmd_clear_color_image(
            command_buffer,
            access.image,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            &clear_value,
            &[subresource_range],
        );

        device.cmd_pipeline_barrier(
            command_buffer,
            vk::PipelineStageFlags::TRANSFER,
            vk::PipelineStageFlags::BOTTOM_OF_PIPE,
            vk::DependencyFlags::empty(),
            &[],
            &[],
            &[to_present],
        );
    }
}

/// Slow sweep around the color wheel.
fn clear_color(t: f32) -> [f32; 4] {
    let phase = |offset: f32| 0.5 + 0.5 * (0.6 * t + offset).sin();
    [phase(0.0), phase(2.1), phase(4.2), 1.0]
}
