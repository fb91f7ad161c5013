//! Match stream server
//!
//! Broadcasts frames and detection lists from one [`FrameSource`] to every
//! connected client. Frame clients and detection clients connect to separate
//! ports, both taken from a shared [`SocketPool`].
//!
//! # Threads
//!
//! | Thread | Role |
//! |--------|------|
//! | `stream-frame-accept` | Accepts frame subscribers |
//! | `stream-detection-accept` | Accepts detection subscribers |
//! | `stream-broadcast` | Pulls frames, runs the detector, writes to subscribers |
//!
//! # Broadcast cycle
//!
//! ```text
//! next distinct frame ─┬─▶ detector ──▶ detection subscribers
//!                       │       └──▶ visualizer ──▶ local preview
//!                       └─▶ (rate gate, resize) ──▶ frame subscribers
//! ```
//!
//! The detector only runs while detection subscribers are connected. Visualizer
//! output stays local ([`MatchStream::preview`]) and is never sent.
//!
//! Subscriber lists are locked only to take and re-merge them, never across a
//! socket write. A subscriber whose write fails is closed and dropped; the
//! others are unaffected.

use super::buffered_socket::{BufferedSocket, DEFAULT_BUFFER_SIZE};
use super::socket_pool::SocketPool;
use super::wire::{self, FrameCodec};
use crate::camera::{FrameSequencer, FrameSource};
use crate::detection::MatchData;
use crate::error::{Error, Result};
use crate::frame::Frame;
use parking_lot::{Mutex, RwLock};
use std::io::ErrorKind;
use std::net::{TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Sleep between accept polls
const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Sleep while nobody is subscribed
const IDLE_INTERVAL: Duration = Duration::from_millis(100);

/// Longest wait for a new source frame before re-checking the stop flag
const FRAME_WAIT: Duration = Duration::from_millis(50);

/// Default bound on a single subscriber write
const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(2);

/// Detector run on every broadcast frame
pub type Matcher = Arc<dyn Fn(&Frame) -> Vec<MatchData> + Send + Sync>;

/// Overlay drawn on a copy of a frame from its detections, for local preview
pub type MatchVisualizer = Arc<dyn Fn(Frame, &[MatchData]) -> Frame + Send + Sync>;

type Subscribers = Mutex<Vec<BufferedSocket>>;

#[derive(Debug, Clone, Copy)]
struct StreamOptions {
    stream_size: Option<(u32, u32)>,
    frame_delay: Duration,
    codec: FrameCodec,
    buffer_size: usize,
    write_timeout: Duration,
}

struct Shared {
    source: FrameSequencer,
    frame_subscribers: Subscribers,
    detection_subscribers: Subscribers,
    matcher: RwLock<Option<Matcher>>,
    visualizer: RwLock<Option<MatchVisualizer>>,
    preview: Mutex<Option<Arc<Frame>>>,
    options: StreamOptions,
    terminate: AtomicBool,
}

/// Builder for [`MatchStream`]
pub struct MatchStreamBuilder {
    source: Arc<dyn FrameSource>,
    pool: Option<Arc<SocketPool>>,
    port: Option<u16>,
    detection_port: Option<u16>,
    stream_size: Option<(u32, u32)>,
    stream_rate: Option<f64>,
    codec: FrameCodec,
    buffer_size: usize,
    write_timeout: Duration,
}

impl MatchStreamBuilder {
    pub fn new(source: Arc<dyn FrameSource>) -> Self {
        Self {
            source,
            pool: None,
            port: None,
            detection_port: None,
            stream_size: None,
            stream_rate: None,
            codec: FrameCodec::default(),
            buffer_size: DEFAULT_BUFFER_SIZE,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
        }
    }

    /// Pool the listening ports come from (required)
    pub fn socket_pool(mut self, pool: Arc<SocketPool>) -> Self {
        self.pool = Some(pool);
        self
    }

    /// Frame port. The detection port then defaults to `port + 1`.
    pub fn port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// Explicit detection port
    pub fn detection_port(mut self, port: u16) -> Self {
        self.detection_port = Some(port);
        self
    }

    /// Downsample frames to (width, height) before encoding
    pub fn stream_size(mut self, width: u32, height: u32) -> Self {
        self.stream_size = Some((width, height));
        self
    }

    /// Upper bound on frames per second sent to frame subscribers.
    /// Non-positive rates mean unlimited.
    pub fn stream_rate(mut self, fps: f64) -> Self {
        self.stream_rate = Some(fps);
        self
    }

    pub fn codec(mut self, codec: FrameCodec) -> Self {
        self.codec = codec;
        self
    }

    /// Per-subscriber buffer size
    pub fn buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = size;
        self
    }

    /// Bound on a single subscriber write. A subscriber that cannot keep up
    /// within it is dropped.
    pub fn write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    /// Allocate both listening ports and create the (stopped) stream
    pub fn build(self) -> Result<MatchStream> {
        let pool = self.pool.ok_or(Error::MissingSocketPool)?;
        if self.buffer_size == 0 {
            return Err(Error::InvalidBufferSize(0));
        }
        if let Some((width, height)) = self.stream_size
            && (width == 0 || height == 0)
        {
            return Err(Error::Config(format!(
                "stream size must be non-zero ({}x{})",
                width, height
            )));
        }
        let frame_delay = match self.stream_rate {
            Some(fps) if fps > 0.0 => Duration::from_secs_f64(1.0 / fps),
            _ => Duration::ZERO,
        };

        let (frame_port, frame_listener) = pool.allocate_port(self.port)?;

        let detection_request = self
            .detection_port
            .or_else(|| self.port.and_then(|p| p.checked_add(1)));
        let (detection_port, detection_listener) = match pool.allocate_port(detection_request) {
            Ok(allocated) => allocated,
            Err(e) => {
                drop(frame_listener);
                pool.deallocate(frame_port);
                return Err(e);
            }
        };

        let stream = MatchStream {
            pool,
            frame_port,
            detection_port,
            shared: Arc::new(Shared {
                source: FrameSequencer::new(self.source),
                frame_subscribers: Mutex::new(Vec::new()),
                detection_subscribers: Mutex::new(Vec::new()),
                matcher: RwLock::new(None),
                visualizer: RwLock::new(None),
                preview: Mutex::new(None),
                options: StreamOptions {
                    stream_size: self.stream_size,
                    frame_delay,
                    codec: self.codec,
                    buffer_size: self.buffer_size,
                    write_timeout: self.write_timeout,
                },
                terminate: AtomicBool::new(false),
            }),
            listeners: Mutex::new(Some((frame_listener, detection_listener))),
            handles: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
        };

        // on failure, dropping the stream returns both ports
        stream.set_listeners_nonblocking()?;
        log::info!(
            "Match stream created (frames on {}, detections on {})",
            frame_port,
            detection_port
        );
        Ok(stream)
    }
}

/// Frame and detection broadcast server
pub struct MatchStream {
    pool: Arc<SocketPool>,
    frame_port: u16,
    detection_port: u16,
    shared: Arc<Shared>,
    listeners: Mutex<Option<(TcpListener, TcpListener)>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
}

impl MatchStream {
    pub fn builder(source: Arc<dyn FrameSource>) -> MatchStreamBuilder {
        MatchStreamBuilder::new(source)
    }

    fn set_listeners_nonblocking(&self) -> Result<()> {
        if let Some((frame_listener, detection_listener)) = self.listeners.lock().as_ref() {
            frame_listener.set_nonblocking(true)?;
            detection_listener.set_nonblocking(true)?;
        }
        Ok(())
    }

    /// Port frame clients connect to
    pub fn frame_port(&self) -> u16 {
        self.frame_port
    }

    /// Port detection clients connect to
    pub fn detection_port(&self) -> u16 {
        self.detection_port
    }

    pub fn frame_subscriber_count(&self) -> usize {
        self.shared.frame_subscribers.lock().len()
    }

    pub fn detection_subscriber_count(&self) -> usize {
        self.shared.detection_subscribers.lock().len()
    }

    /// Install the detector. Takes effect on the next frame.
    pub fn set_matcher<F>(&self, matcher: F)
    where
        F: Fn(&Frame) -> Vec<MatchData> + Send + Sync + 'static,
    {
        *self.shared.matcher.write() = Some(Arc::new(matcher));
    }

    /// Install the detection overlay. Takes effect on the next frame.
    pub fn set_match_visualizer<F>(&self, visualizer: F)
    where
        F: Fn(Frame, &[MatchData]) -> Frame + Send + Sync + 'static,
    {
        *self.shared.visualizer.write() = Some(Arc::new(visualizer));
    }

    /// Latest visualizer output. Only produced while a matcher, a visualizer
    /// and at least one detection subscriber are present.
    pub fn preview(&self) -> Option<Arc<Frame>> {
        self.shared.preview.lock().clone()
    }

    /// Whether the worker threads are running
    pub fn is_running(&self) -> bool {
        self.started.load(Ordering::SeqCst) && !self.shared.terminate.load(Ordering::SeqCst)
    }

    /// Start accepting subscribers and broadcasting
    pub fn start(&self) -> Result<()> {
        if self.shared.terminate.load(Ordering::SeqCst) {
            return Err(Error::Terminated("match stream"));
        }
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(Error::AlreadyRunning("match stream"));
        }
        let Some((frame_listener, detection_listener)) = self.listeners.lock().take() else {
            return Err(Error::AlreadyRunning("match stream"));
        };

        if let Err(e) = self.spawn_workers(frame_listener, detection_listener) {
            self.stop();
            return Err(e);
        }
        log::info!("Match stream started");
        Ok(())
    }

    fn spawn_workers(&self, frame_listener: TcpListener, detection_listener: TcpListener) -> Result<()> {
        let mut handles = self.handles.lock();

        let shared = Arc::clone(&self.shared);
        handles.push(
            thread::Builder::new()
                .name("stream-frame-accept".to_string())
                .spawn(move || accept_loop(frame_listener, &shared, Kind::Frame))?,
        );

        let shared = Arc::clone(&self.shared);
        handles.push(
            thread::Builder::new()
                .name("stream-detection-accept".to_string())
                .spawn(move || accept_loop(detection_listener, &shared, Kind::Detection))?,
        );

        let shared = Arc::clone(&self.shared);
        handles.push(
            thread::Builder::new()
                .name("stream-broadcast".to_string())
                .spawn(move || broadcast_loop(&shared))?,
        );
        Ok(())
    }

    /// Stop all workers, close every subscriber and release both ports.
    /// Idempotent. A stopped stream cannot be restarted.
    pub fn stop(&self) {
        if self.shared.terminate.swap(true, Ordering::SeqCst) {
            return;
        }

        let handles: Vec<_> = self.handles.lock().drain(..).collect();
        for handle in handles {
            if handle.join().is_err() {
                log::error!("Match stream worker panicked");
            }
        }

        // a broadcast in flight when the accept threads exited re-merged its
        // subscribers after their final close
        let closed = close_all(&self.shared.frame_subscribers)
            + close_all(&self.shared.detection_subscribers);
        if closed > 0 {
            log::debug!("Closed {} subscribers left after worker exit", closed);
        }

        // listeners still held here if the stream never started
        drop(self.listeners.lock().take());
        self.pool.deallocate(self.frame_port);
        self.pool.deallocate(self.detection_port);
        log::info!("Match stream stopped");
    }
}

impl Drop for MatchStream {
    fn drop(&mut self) {
        self.stop();
    }
}

#[derive(Debug, Clone, Copy)]
enum Kind {
    Frame,
    Detection,
}

impl Kind {
    fn name(self) -> &'static str {
        match self {
            Kind::Frame => "frame",
            Kind::Detection => "detection",
        }
    }

    fn subscribers(self, shared: &Shared) -> &Subscribers {
        match self {
            Kind::Frame => &shared.frame_subscribers,
            Kind::Detection => &shared.detection_subscribers,
        }
    }
}

fn accept_loop(listener: TcpListener, shared: &Shared, kind: Kind) {
    let subscribers = kind.subscribers(shared);

    while !shared.terminate.load(Ordering::Relaxed) {
        match listener.accept() {
            Ok((stream, addr)) => match prepare_subscriber(stream, &shared.options) {
                Ok(sock) => {
                    subscribers.lock().push(sock);
                    log::info!("New {} subscriber: {}", kind.name(), addr);
                }
                Err(e) => log::warn!("Failed to set up {} subscriber {}: {}", kind.name(), addr, e),
            },
            Err(ref e) if e.kind() == ErrorKind::WouldBlock => {
                thread::sleep(ACCEPT_POLL_INTERVAL);
            }
            Err(e) => {
                log::error!("Error accepting {} subscriber: {}", kind.name(), e);
                thread::sleep(ACCEPT_POLL_INTERVAL);
            }
        }
    }

    log::debug!(
        "{} accept thread exiting ({} subscribers closed)",
        kind.name(),
        close_all(subscribers)
    );
}

/// Close and remove every subscriber in the list
fn close_all(subscribers: &Subscribers) -> usize {
    let mut remaining = std::mem::take(&mut *subscribers.lock());
    for sock in remaining.iter_mut() {
        sock.close();
    }
    remaining.len()
}

fn prepare_subscriber(stream: TcpStream, options: &StreamOptions) -> Result<BufferedSocket> {
    stream.set_nonblocking(false)?;
    stream.set_write_timeout(Some(options.write_timeout))?;
    stream.set_nodelay(true)?;
    BufferedSocket::with_capacity(stream, options.buffer_size)
}

/// Write `msg` to every subscriber, dropping those whose write fails.
///
/// Returns the number of subscribers that received the message.
fn broadcast(subscribers: &Subscribers, msg: &[u8], kind: Kind) -> usize {
    let mut active = std::mem::take(&mut *subscribers.lock());

    active.retain_mut(|sock| match sock.write(msg, true) {
        Ok(()) => true,
        Err(e) => {
            match sock.get_ref().peer_addr() {
                Ok(addr) => log::info!("{} subscriber {} dropped: {}", kind.name(), addr, e),
                Err(_) => log::info!("{} subscriber dropped: {}", kind.name(), e),
            }
            sock.close();
            false
        }
    });
    let delivered = active.len();

    // subscribers accepted during the write go after the existing ones
    let mut list = subscribers.lock();
    let joined = std::mem::replace(&mut *list, active);
    list.extend(joined);
    delivered
}

fn broadcast_loop(shared: &Shared) {
    let options = shared.options;
    let mut last_frame_sent: Option<Instant> = None;
    let mut frames_sent = 0u64;
    let mut detections_sent = 0u64;

    while !shared.terminate.load(Ordering::Relaxed) {
        let want_frames = !shared.frame_subscribers.lock().is_empty();
        let want_detections = !shared.detection_subscribers.lock().is_empty();
        if !want_frames && !want_detections {
            thread::sleep(IDLE_INTERVAL);
            continue;
        }

        let Some(frame) = shared.source.next_frame_timeout(FRAME_WAIT) else {
            continue;
        };

        let matcher = shared.matcher.read().clone();
        if let Some(matcher) = matcher
            && want_detections
        {
            let matches = matcher(frame.as_ref());
            let visualizer = shared.visualizer.read().clone();
            if let Some(visualizer) = visualizer {
                let preview = visualizer(Frame::clone(&frame), &matches[..]);
                *shared.preview.lock() = Some(Arc::new(preview));
            }
            let msg = wire::encode_detections(&matches);
            if broadcast(&shared.detection_subscribers, &msg, Kind::Detection) > 0 {
                detections_sent += 1;
            }
        }

        if !want_frames {
            continue;
        }
        if let Some(last) = last_frame_sent
            && last.elapsed() < options.frame_delay
        {
            continue;
        }
        last_frame_sent = Some(Instant::now());

        let encoded = match options.stream_size {
            Some((width, height)) if frame.size() != (width, height) => {
                wire::encode_frame(&frame.resized(width, height), options.codec)
            }
            _ => wire::encode_frame(&frame, options.codec),
        };
        match encoded {
            Ok(msg) => {
                if broadcast(&shared.frame_subscribers, &msg, Kind::Frame) > 0 {
                    frames_sent += 1;
                    if frames_sent % 1000 == 0 {
                        log::debug!("Broadcast {} frames", frames_sent);
                    }
                }
            }
            Err(e) => log::warn!("Failed to encode frame: {}", e),
        }
    }

    log::info!(
        "Broadcast thread exiting ({} frames, {} detection lists sent)",
        frames_sent,
        detections_sent
    );
}
