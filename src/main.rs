//! Helios: V4L2 multi-planar capture with an SDL2 GPU preview.

use std::process::ExitCode;
use std::sync::Arc;

use color_eyre::{eyre::eyre, Result};
use tracing::{error, info};

use helios::capture::controls::{self, CameraControls};
use helios::capture::{CaptureDevice, CaptureSession, SubDevice};
use helios::display::Sdl2Display;
use helios::{pipeline, utils};

fn main() -> Result<ExitCode> {
    // Initialize error handling and logging
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "helios=info".into()),
        )
        .with_timer(tracing_subscriber::fmt::time::uptime())
        .init();

    info!("Helios launching...");

    // Load configuration
    let config = helios::Config::load().map_err(|e| eyre!(e))?;
    helios::CONFIG.store(Arc::new(config.clone()));

    // Auto-detect capture device if needed
    let device_path = if config.capture.device.is_empty() {
        utils::auto_detect_device()
            .ok_or_else(|| eyre!("no multi-planar capture device found"))?
    } else {
        config.capture.device.clone()
    };
    info!("Using capture device: {device_path}");

    // Open the streaming node and the sensor control sub-device
    let device = CaptureDevice::open(&device_path)?;
    let subdevice = SubDevice::open(&config.capture.subdevice)?;
    let mut camera = CameraControls::new(subdevice);

    let sdl_context = sdl2::init().map_err(|e| eyre!(e))?;
    let mut display = Sdl2Display::new(
        &sdl_context,
        config.display.width,
        config.display.height,
        config.display.fullscreen,
    )
    .map_err(|e| eyre!(e))?;

    // SIGINT only raises a flag; the loop below observes it and unwinds here
    // so the kernel buffers can be released.
    let stop = utils::install_signal_hook().map_err(|e| eyre!("sigaction: {e}"))?;

    // Allocate, map, and queue kernel buffers, then start streaming. Setup
    // releases anything partially acquired before reporting failure, and
    // nothing fallible runs between here and the loop, so the shutdown
    // below is reached on every path that pinned buffers.
    let mut session = CaptureSession::new(device, config.capture.width, config.capture.height);
    session.setup(config.capture.buffer_count, config.capture.dma_export)?;

    controls::print_key_help();

    let result = pipeline::run(
        &mut session,
        &mut display,
        &mut camera,
        stop,
        config.capture.capture_count,
    );

    // Buffers go back to the kernel on every path; closing the device alone
    // does not release them.
    if let Err(e) = session.shutdown() {
        error!("capture shutdown: {e}");
    }

    match result {
        Ok(exit) => {
            info!("Helios shutting down ({exit:?})");
            Ok(ExitCode::SUCCESS)
        }
        Err(e) => {
            error!("capture loop terminated: {e}");
            Ok(ExitCode::FAILURE)
        }
    }
}
