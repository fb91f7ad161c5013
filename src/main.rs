//! vistream - frame and detection streaming daemon
//!
//! Captures from a camera device and serves two TCP ports from the socket pool:
//!
//! - **frame port**: encoded frames (JPEG by default), downsampled to the
//!   configured output size
//! - **detection port** (frame port + 1 by default): detection lists
//!
//! Usage:
//!   vistream --config vistream.toml
//!   vistream --demo                  # built-in defaults with random detections

use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;
use vistream::camera::{Camera, DeviceRegistry, FrameSource, TestPatternDevice};
use vistream::config::AppConfig;
use vistream::detection;
use vistream::streaming::{MatchStream, SocketPool};
use vistream::{Error, Result};

/// Frame and detection streaming daemon
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file path (built-in defaults if omitted)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Publish random detections regardless of the config file
    #[arg(long)]
    demo: bool,

    /// Write the effective configuration to this path and exit
    #[arg(long)]
    dump_config: Option<PathBuf>,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => AppConfig::from_file(path)?,
        None => AppConfig::default(),
    };
    if args.demo {
        config.detector.demo = true;
    }

    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(config.logging.level.as_str()),
    )
    .init();

    log::info!("vistream v{} starting...", env!("CARGO_PKG_VERSION"));

    if let Some(path) = &args.dump_config {
        config.to_file(path)?;
        log::info!("Configuration written to {}", path.display());
        return Ok(());
    }

    let running = Arc::new(AtomicBool::new(true));
    let r = Arc::clone(&running);
    ctrlc::set_handler(move || {
        log::info!("Received shutdown signal");
        r.store(false, Ordering::SeqCst);
    })
    .map_err(|e| Error::Other(format!("Error setting Ctrl-C handler: {}", e)))?;

    // Camera
    let registry = DeviceRegistry::new(config.camera.devices.iter().copied());
    let device_index = registry.claim(config.camera.device)?;
    let device = TestPatternDevice::new(
        device_index,
        config.camera.width,
        config.camera.height,
        config.camera.fps,
    )?;
    let camera: Arc<dyn FrameSource> = Arc::new(Camera::new(device)?);
    log::info!("Camera device {} opened", device_index);

    // Stream
    let pool = Arc::new(SocketPool::with_host(
        config.pool.host.clone(),
        config.pool.start,
        config.pool.end,
    )?);

    let mut builder = MatchStream::builder(Arc::clone(&camera))
        .socket_pool(Arc::clone(&pool))
        .codec(config.stream.codec)
        .buffer_size(config.stream.buffer_size);
    if let Some(port) = config.stream.port {
        builder = builder.port(port);
    }
    if let Some(port) = config.stream.detection_port {
        builder = builder.detection_port(port);
    }
    if let Some((width, height)) = config.stream.output_size() {
        builder = builder.stream_size(width, height);
    }
    if let Some(rate) = config.stream.rate {
        builder = builder.stream_rate(rate);
    }
    let stream = builder.build()?;

    if config.detector.demo {
        log::info!(
            "Demo detector enabled (up to {} detections per frame)",
            config.detector.max_count
        );
        stream.set_matcher(detection::demo_detector(config.detector.max_count));
    }

    stream.start()?;
    log::info!(
        "Streaming frames on port {}, detections on port {}",
        stream.frame_port(),
        stream.detection_port()
    );

    while running.load(Ordering::SeqCst) {
        thread::sleep(Duration::from_millis(100));
    }

    log::info!("Shutting down...");
    stream.stop();
    camera.stop();
    pool.collapse();
    registry.release(device_index);
    log::info!("vistream stopped");

    Ok(())
}
