//! Headless stream client
//!
//! Connects to a running vistream daemon and reports how many frames and
//! detection lists arrive per interval.
//!
//! Usage:
//!   vistream-client --host 10.0.0.2 --port 1180
//!   vistream-client --mode detections --duration 30

use clap::{Parser, ValueEnum};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};
use vistream::streaming::{FrameStreamClient, MatchDataStreamClient};
use vistream::{Error, Frame, MatchData, Result};

/// Poll interval for new results
const POLL_INTERVAL: Duration = Duration::from_millis(5);

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Frames,
    Detections,
    Both,
}

/// Headless vistream client
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Server host
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Frame port
    #[arg(short, long, default_value_t = 1180)]
    port: u16,

    /// Detection port (frame port + 1 if omitted)
    #[arg(short, long)]
    detection_port: Option<u16>,

    /// Which streams to subscribe to
    #[arg(short, long, value_enum, default_value_t = Mode::Both)]
    mode: Mode,

    /// Stop after this many seconds
    #[arg(long)]
    duration: Option<f64>,

    /// Seconds between reports
    #[arg(long, default_value_t = 1.0)]
    interval: f64,
}

/// Counts distinct results seen from one client
struct Tally<M> {
    last: Option<Arc<M>>,
    count: u64,
}

impl<M> Tally<M> {
    fn new() -> Self {
        Self {
            last: None,
            count: 0,
        }
    }

    fn observe(&mut self, latest: Option<Arc<M>>) {
        if let Some(latest) = latest {
            let is_new = self.last.as_ref().is_none_or(|last| !Arc::ptr_eq(last, &latest));
            if is_new {
                self.count += 1;
                self.last = Some(latest);
            }
        }
    }

    fn take_count(&mut self) -> u64 {
        std::mem::take(&mut self.count)
    }
}

fn main() -> Result<()> {
    let args = Args::parse();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    if args.interval.is_nan() || args.interval <= 0.0 {
        return Err(Error::Config(format!(
            "report interval must be positive ({})",
            args.interval
        )));
    }

    let running = Arc::new(AtomicBool::new(true));
    let r = Arc::clone(&running);
    ctrlc::set_handler(move || {
        r.store(false, Ordering::SeqCst);
    })
    .map_err(|e| Error::Other(format!("Error setting Ctrl-C handler: {}", e)))?;

    let detection_port = match args.detection_port {
        Some(port) => port,
        None => args
            .port
            .checked_add(1)
            .ok_or_else(|| Error::Config("no port after 65535".to_string()))?,
    };

    let frames = match args.mode {
        Mode::Frames | Mode::Both => {
            let client = FrameStreamClient::connect((args.host.as_str(), args.port))?;
            client.start()?;
            Some(client)
        }
        Mode::Detections => None,
    };
    let detections = match args.mode {
        Mode::Detections | Mode::Both => {
            let client = MatchDataStreamClient::connect((args.host.as_str(), detection_port))?;
            client.start()?;
            Some(client)
        }
        Mode::Frames => None,
    };

    let interval = Duration::from_secs_f64(args.interval);
    let deadline = args.duration.map(|secs| Instant::now() + Duration::from_secs_f64(secs.max(0.0)));
    let mut frame_tally: Tally<Frame> = Tally::new();
    let mut detection_tally: Tally<Vec<MatchData>> = Tally::new();
    let mut next_report = Instant::now() + interval;

    while running.load(Ordering::SeqCst) {
        if deadline.is_some_and(|d| Instant::now() >= d) {
            break;
        }
        let frames_alive = frames.as_ref().is_some_and(|c| c.is_running());
        let detections_alive = detections.as_ref().is_some_and(|c| c.is_running());
        if !frames_alive && !detections_alive {
            log::warn!("All streams closed");
            break;
        }

        if let Some(client) = &frames {
            frame_tally.observe(client.latest_result());
        }
        if let Some(client) = &detections {
            detection_tally.observe(client.latest_result());
        }

        if Instant::now() >= next_report {
            let secs = interval.as_secs_f64();
            if frames.is_some() {
                let size = frame_tally.last.as_ref().map(|f| f.size()).unwrap_or((0, 0));
                println!(
                    "frames: {:.1}/s ({}x{})",
                    frame_tally.take_count() as f64 / secs,
                    size.0,
                    size.1
                );
            }
            if detections.is_some() {
                let latest = detection_tally.last.as_ref().map(|d| d.len()).unwrap_or(0);
                println!(
                    "detections: {:.1} lists/s (latest: {} records)",
                    detection_tally.take_count() as f64 / secs,
                    latest
                );
            }
            next_report += interval;
        }

        thread::sleep(POLL_INTERVAL);
    }

    if let Some(client) = &frames {
        client.stop();
    }
    if let Some(client) = &detections {
        client.stop();
    }
    Ok(())
}
