//! Vitrine Demo
//!
//! Opens a window and clears each presentable image with a slowly cycling
//! color, driving one write session and one post-buffer per frame through
//! [`vitrine_present::PresentChain`]. Resizing the window exercises the
//! swapchain replacement hand-off; closing it exercises the full teardown
//! path.
//!
//! ## Usage
//!
//! ```bash
//! cargo run -p vitrine-demo
//! ```
//!
//! ## Environment Variables
//!
//! - `RUST_LOG`: Set log level (e.g., info, debug, trace)

mod app;
mod gpu;

use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use winit::event_loop::{ControlFlow, EventLoop};

use crate::app::DemoApp;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Vitrine demo starting...");

    let event_loop = EventLoop::new().expect("Failed to create event loop");
    event_loop.set_control_flow(ControlFlow::Poll);

    let mut app = DemoApp::default();
    if let Err(e) = event_loop.run_app(&mut app) {
        error!("Event loop error: {e}");
    }

    Ok(())
}
