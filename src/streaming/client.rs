//! Stream clients
//!
//! A client connects to one port of a [`MatchStream`](super::MatchStream) and
//! runs a background read loop that keeps only the latest decoded message.
//!
//! ```text
//! decode ──ok──▶ publish latest
//!   │
//!   └─parse failure──▶ salvage ──ok──▶ decode again
//!                         │
//!                         └─closed──▶ exit, clear latest
//! ```
//!
//! A read timeout or closed socket also ends the loop and clears the latest
//! result. Clients are single-use: once stopped they cannot be restarted.

use super::buffered_socket::BufferedSocket;
use super::wire;
use crate::detection::MatchData;
use crate::error::{Error, Result};
use crate::frame::Frame;
use parking_lot::Mutex;
use std::marker::PhantomData;
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Bound on establishing the connection
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// A message type a client can read off the wire
pub trait StreamMessage: Sized + Send + Sync + 'static {
    /// Short name for logs and thread names
    const NAME: &'static str;

    /// Steady-state read timeout
    const READ_TIMEOUT: Duration;

    /// `Ok(None)` on parse failure
    fn decode(sock: &mut BufferedSocket) -> Result<Option<Self>>;

    /// Skip to the next message start. `Ok(false)` if the peer closed.
    fn salvage(sock: &mut BufferedSocket) -> Result<bool>;
}

impl StreamMessage for Frame {
    const NAME: &'static str = "frame";
    const READ_TIMEOUT: Duration = Duration::from_secs(1);

    fn decode(sock: &mut BufferedSocket) -> Result<Option<Self>> {
        wire::decode_frame(sock)
    }

    fn salvage(sock: &mut BufferedSocket) -> Result<bool> {
        wire::salvage_frame_stream(sock)
    }
}

impl StreamMessage for Vec<MatchData> {
    const NAME: &'static str = "detection";
    const READ_TIMEOUT: Duration = Duration::from_secs(5);

    fn decode(sock: &mut BufferedSocket) -> Result<Option<Self>> {
        wire::decode_detections(sock)
    }

    fn salvage(sock: &mut BufferedSocket) -> Result<bool> {
        wire::salvage_data_stream(sock)
    }
}

/// Client receiving frames
pub type FrameStreamClient = StreamClient<Frame>;

/// Client receiving detection lists
pub type MatchDataStreamClient = StreamClient<Vec<MatchData>>;

/// Background reader keeping the latest message of type `M`
pub struct StreamClient<M: StreamMessage> {
    control: TcpStream,
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
    socket: Mutex<Option<BufferedSocket>>,
    latest: Arc<Mutex<Option<Arc<M>>>>,
    terminate: Arc<AtomicBool>,
    running: Arc<AtomicBool>,
    handle: Mutex<Option<JoinHandle<()>>>,
    _message: PhantomData<fn() -> M>,
}

impl<M: StreamMessage> StreamClient<M> {
    /// Connect to `addr`. The read loop starts with [`start`](Self::start).
    pub fn connect(addr: impl ToSocketAddrs) -> Result<Self> {
        let mut last_error = None;
        let mut connected = None;
        for candidate in addr.to_socket_addrs()? {
            match TcpStream::connect_timeout(&candidate, CONNECT_TIMEOUT) {
                Ok(stream) => {
                    connected = Some(stream);
                    break;
                }
                Err(e) => last_error = Some(e),
            }
        }
        let stream = match (connected, last_error) {
            (Some(stream), _) => stream,
            (None, Some(e)) => return Err(Error::Io(e)),
            (None, None) => return Err(Error::Other("address resolved to nothing".to_string())),
        };

        stream.set_read_timeout(Some(M::READ_TIMEOUT))?;
        stream.set_nodelay(true)?;
        let control = stream.try_clone()?;
        let local_addr = stream.local_addr()?;
        let peer_addr = stream.peer_addr()?;
        log::info!("{} client connected to {}", M::NAME, peer_addr);

        Ok(Self {
            control,
            local_addr,
            peer_addr,
            socket: Mutex::new(Some(BufferedSocket::new(stream))),
            latest: Arc::new(Mutex::new(None)),
            terminate: Arc::new(AtomicBool::new(false)),
            running: Arc::new(AtomicBool::new(false)),
            handle: Mutex::new(None),
            _message: PhantomData,
        })
    }

    /// Replace the steady-state read timeout
    pub fn with_read_timeout(self, timeout: Duration) -> Result<Self> {
        self.control.set_read_timeout(Some(timeout))?;
        Ok(self)
    }

    /// Start the read loop. A client starts at most once.
    pub fn start(&self) -> Result<()> {
        if self.terminate.load(Ordering::SeqCst) {
            return Err(Error::Terminated("stream client"));
        }
        let Some(sock) = self.socket.lock().take() else {
            return Err(Error::AlreadyRunning("stream client"));
        };

        let latest = Arc::clone(&self.latest);
        let terminate = Arc::clone(&self.terminate);
        let running = Arc::clone(&self.running);
        running.store(true, Ordering::SeqCst);

        let spawned = thread::Builder::new()
            .name(format!("{}-client", M::NAME))
            .spawn(move || read_loop::<M>(sock, &latest, &terminate, &running));
        match spawned {
            Ok(handle) => {
                *self.handle.lock() = Some(handle);
                Ok(())
            }
            Err(e) => {
                self.running.store(false, Ordering::SeqCst);
                Err(Error::Io(e))
            }
        }
    }

    /// Stop the read loop and close the socket. Idempotent.
    pub fn stop(&self) {
        if self.terminate.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Err(e) = self.control.shutdown(Shutdown::Both) {
            log::trace!("Shutdown on closed socket: {}", e);
        }
        let handle = self.handle.lock().take();
        if let Some(handle) = handle
            && handle.join().is_err()
        {
            log::error!("{} client thread panicked", M::NAME);
        }
        self.running.store(false, Ordering::SeqCst);
    }

    /// Most recent message, if the stream is alive and has delivered one
    pub fn latest_result(&self) -> Option<Arc<M>> {
        self.latest.lock().clone()
    }

    pub fn has_result(&self) -> bool {
        self.latest.lock().is_some()
    }

    /// Whether the read loop is still running
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }
}

impl<M: StreamMessage> Drop for StreamClient<M> {
    fn drop(&mut self) {
        self.stop();
    }
}

fn read_loop<M: StreamMessage>(
    mut sock: BufferedSocket,
    latest: &Mutex<Option<Arc<M>>>,
    terminate: &AtomicBool,
    running: &AtomicBool,
) {
    let mut received = 0u64;

    while !terminate.load(Ordering::Relaxed) {
        match M::decode(&mut sock) {
            Ok(Some(message)) => {
                *latest.lock() = Some(Arc::new(message));
                received += 1;
            }
            Ok(None) => {
                log::debug!("Corrupt {} message, salvaging stream", M::NAME);
                match M::salvage(&mut sock) {
                    Ok(true) => {}
                    Ok(false) => {
                        log::info!("{} stream closed", M::NAME);
                        break;
                    }
                    Err(e) => {
                        log::info!("{} stream ended during salvage: {}", M::NAME, e);
                        break;
                    }
                }
            }
            Err(e) => {
                if !terminate.load(Ordering::Relaxed) {
                    log::info!("{} stream ended: {}", M::NAME, e);
                }
                break;
            }
        }
    }

    *latest.lock() = None;
    running.store(false, Ordering::SeqCst);
    log::debug!("{} client exiting ({} messages)", M::NAME, received);
}
