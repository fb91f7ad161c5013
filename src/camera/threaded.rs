//! Threaded camera
//!
//! A [`Camera`] owns one capture thread that loops over its device:
//!
//! 1. Pull a frame (device-specific, may block for about one frame period)
//! 2. Skip empty pulls
//! 3. Swap the new frame in and bump the frame id, both under the frame mutex
//!
//! The capture thread is the only writer of the id, so a plain atomic counter
//! is enough for [`FrameSource::frame_id`]. [`FrameSource::snapshot`] reads
//! frame and id under the same mutex, so the pair always matches. Readers
//! never wait on the device, only on the frame mutex.

use super::device::CaptureDevice;
use super::{FrameId, FrameSource};
use crate::error::{Error, Result};
use crate::frame::Frame;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Back-off after a device error
const DEVICE_ERROR_BACKOFF_MS: u64 = 10;

/// State shared between the camera handle and its capture thread
struct Shared {
    current: Mutex<Option<Arc<Frame>>>,
    frame_id: AtomicU64,
    stop: AtomicBool,
    error_count: AtomicU64,
}

/// Background-captured camera over a [`CaptureDevice`]
pub struct Camera {
    shared: Arc<Shared>,
    frame_size: (u32, u32),
    field_of_view: Option<(f32, f32)>,
    capture_handle: Mutex<Option<JoinHandle<()>>>,
}

impl Camera {
    /// Start capturing from `device` on a dedicated thread
    pub fn new<D: CaptureDevice>(device: D) -> Result<Self> {
        let frame_size = device.frame_size();
        let field_of_view = device.field_of_view();

        let shared = Arc::new(Shared {
            current: Mutex::new(None),
            frame_id: AtomicU64::new(0),
            stop: AtomicBool::new(false),
            error_count: AtomicU64::new(0),
        });

        let thread_shared = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name("camera-capture".to_string())
            .spawn(move || capture_loop(device, thread_shared))
            .map_err(|e| Error::Other(format!("Failed to spawn capture thread: {}", e)))?;

        log::info!("Camera started ({}x{})", frame_size.0, frame_size.1);

        Ok(Self {
            shared,
            frame_size,
            field_of_view,
            capture_handle: Mutex::new(Some(handle)),
        })
    }

    /// Whether the capture thread is still running
    pub fn is_capturing(&self) -> bool {
        self.capture_handle
            .lock()
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }

    /// Number of device errors seen by the capture thread
    pub fn error_count(&self) -> u64 {
        self.shared.error_count.load(Ordering::Relaxed)
    }
}

fn capture_loop<D: CaptureDevice>(mut device: D, shared: Arc<Shared>) {
    while !shared.stop.load(Ordering::Relaxed) {
        match device.next_frame() {
            Ok(Some(frame)) => {
                if frame.is_empty() {
                    continue;
                }
                let mut current = shared.current.lock();
                *current = Some(Arc::new(frame));
                shared.frame_id.fetch_add(1, Ordering::Release);
            }
            Ok(None) => {}
            Err(e) => {
                let errors = shared.error_count.fetch_add(1, Ordering::Relaxed) + 1;
                if errors % 100 == 1 {
                    log::warn!("Capture error ({} total): {}", errors, e);
                }
                thread::sleep(Duration::from_millis(DEVICE_ERROR_BACKOFF_MS));
            }
        }
    }

    if let Err(e) = device.release() {
        log::error!("Failed to release capture device: {}", e);
    }
    log::info!("Capture thread exiting");
}

impl FrameSource for Camera {
    fn get_frame(&self) -> Option<Arc<Frame>> {
        self.shared.current.lock().clone()
    }

    fn frame_id(&self) -> FrameId {
        self.shared.frame_id.load(Ordering::Acquire)
    }

    fn snapshot(&self) -> Option<(FrameId, Arc<Frame>)> {
        let current = self.shared.current.lock();
        let frame = current.clone()?;
        Some((self.shared.frame_id.load(Ordering::Acquire), frame))
    }

    fn frame_size(&self) -> (u32, u32) {
        self.frame_size
    }

    fn field_of_view(&self) -> Option<(f32, f32)> {
        self.field_of_view
    }

    fn stop(&self) {
        if self.shared.stop.swap(true, Ordering::SeqCst) {
            return;
        }
        let handle = self.capture_handle.lock().take();
        if let Some(handle) = handle
            && handle.join().is_err()
        {
            log::error!("Capture thread panicked");
        }
        log::info!("Camera stopped");
    }
}

impl Drop for Camera {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::TestPatternDevice;
    use std::time::Instant;

    /// Device that yields a fixed number of frames, then nothing
    struct CountingDevice {
        remaining: u32,
        released: Arc<AtomicBool>,
    }

    impl CaptureDevice for CountingDevice {
        fn next_frame(&mut self) -> Result<Option<Frame>> {
            thread::sleep(Duration::from_millis(1));
            if self.remaining == 0 {
                return Ok(None);
            }
            self.remaining -= 1;
            Ok(Some(Frame::filled(2, 2, [self.remaining as u8, 0, 0])))
        }

        fn frame_size(&self) -> (u32, u32) {
            (2, 2)
        }

        fn release(&mut self) -> Result<()> {
            self.released.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(2));
        }
        false
    }

    #[test]
    fn test_camera_publishes_frames() {
        let released = Arc::new(AtomicBool::new(false));
        let camera = Camera::new(CountingDevice {
            remaining: 5,
            released: Arc::clone(&released),
        })
        .unwrap();

        assert!(wait_for(|| camera.frame_id() == 5));
        let frame = camera.get_frame().unwrap();
        assert_eq!(frame.pixel(0, 0), Some([0, 0, 0]));
        assert_eq!(camera.frame_size(), (2, 2));

        camera.stop();
        assert!(released.load(Ordering::SeqCst));
        assert!(!camera.is_capturing());
    }

    #[test]
    fn test_snapshot_pairs_id_with_its_frame() {
        let released = Arc::new(AtomicBool::new(false));
        let camera = Camera::new(CountingDevice {
            remaining: 200,
            released,
        })
        .unwrap();

        // frame n carries 200 - n in its first channel
        let mut checked = 0;
        while camera.frame_id() < 200 {
            if let Some((id, frame)) = camera.snapshot() {
                assert_eq!(frame.pixel(0, 0), Some([(200 - id) as u8, 0, 0]));
                checked += 1;
            }
        }
        assert!(checked > 0);
        camera.stop();
    }

    #[test]
    fn test_stop_is_idempotent() {
        let camera = Camera::new(TestPatternDevice::new(0, 8, 8, 200.0).unwrap()).unwrap();
        assert!(camera.is_capturing());
        camera.stop();
        camera.stop();
        let id = camera.frame_id();
        thread::sleep(Duration::from_millis(20));
        assert_eq!(camera.frame_id(), id);
    }

    #[test]
    fn test_field_of_view_from_device() {
        let camera = Camera::new(TestPatternDevice::new(0, 8, 8, 100.0).unwrap()).unwrap();
        assert_eq!(camera.field_of_view(), Some((65.368, 36.770)));
    }
}
