//! Camera decorator that runs image layers on a worker thread
//!
//! The worker polls the wrapped source's snapshot. Only when the id changes does
//! it run every layer in insertion order and publish the result under the
//! source's id. Layer cost is therefore decoupled from the upstream capture
//! rate, and no layer ever runs twice on the same source frame.

use super::{FrameId, FrameSource};
use crate::error::{Error, Result};
use crate::frame::Frame;
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Poll interval while the source has nothing new
const SOURCE_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// A single `image → image` transform
pub type Layer = Box<dyn Fn(Frame) -> Frame + Send + Sync>;

struct Shared {
    current: Mutex<Option<Arc<Frame>>>,
    frame_id: AtomicU64,
    layers: RwLock<Vec<Layer>>,
    stop: AtomicBool,
}

/// Frame source that applies an ordered list of layers to another source
pub struct ProcessedCamera {
    source: Arc<dyn FrameSource>,
    shared: Arc<Shared>,
    worker_handle: Mutex<Option<JoinHandle<()>>>,
}

impl ProcessedCamera {
    /// Wrap `source` and start the processing thread
    pub fn new(source: Arc<dyn FrameSource>) -> Result<Self> {
        let shared = Arc::new(Shared {
            current: Mutex::new(None),
            frame_id: AtomicU64::new(0),
            layers: RwLock::new(Vec::new()),
            stop: AtomicBool::new(false),
        });

        let thread_source = Arc::clone(&source);
        let thread_shared = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name("camera-layers".to_string())
            .spawn(move || process_loop(thread_source, thread_shared))
            .map_err(|e| Error::Other(format!("Failed to spawn layer thread: {}", e)))?;

        Ok(Self {
            source,
            shared,
            worker_handle: Mutex::new(Some(handle)),
        })
    }

    /// Append a layer. Layers run in the order they were added, starting
    /// with the next source frame.
    pub fn add_layer<F>(&self, layer: F)
    where
        F: Fn(Frame) -> Frame + Send + Sync + 'static,
    {
        self.shared.layers.write().push(Box::new(layer));
    }

    /// Number of installed layers
    pub fn layer_count(&self) -> usize {
        self.shared.layers.read().len()
    }

    /// Whether the processing thread is still running
    pub fn is_capturing(&self) -> bool {
        self.worker_handle
            .lock()
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }

    /// The wrapped source
    pub fn source(&self) -> &Arc<dyn FrameSource> {
        &self.source
    }
}

fn process_loop(source: Arc<dyn FrameSource>, shared: Arc<Shared>) {
    let mut last_seen: FrameId = 0;

    while !shared.stop.load(Ordering::Relaxed) {
        let (source_id, frame) = match source.snapshot() {
            Some((id, frame)) if id != last_seen => (id, frame),
            _ => {
                thread::sleep(SOURCE_POLL_INTERVAL);
                continue;
            }
        };
        last_seen = source_id;

        let mut frame = Arc::unwrap_or_clone(frame);
        {
            let layers = shared.layers.read();
            for layer in layers.iter() {
                frame = layer(frame);
            }
        }

        let mut current = shared.current.lock();
        *current = Some(Arc::new(frame));
        shared.frame_id.store(source_id, Ordering::Release);
    }

    log::debug!("Layer thread exiting");
}

impl FrameSource for ProcessedCamera {
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
        self.source.frame_size()
    }

    fn field_of_view(&self) -> Option<(f32, f32)> {
        self.source.field_of_view()
    }

    /// Stops the layer thread, then the wrapped source
    fn stop(&self) {
        if self.shared.stop.swap(true, Ordering::SeqCst) {
            return;
        }
        let handle = self.worker_handle.lock().take();
        if let Some(handle) = handle
            && handle.join().is_err()
        {
            log::error!("Layer thread panicked");
        }
        self.source.stop();
    }
}

impl Drop for ProcessedCamera {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Instant;

    /// Source whose frame and id are set by the test
    struct ManualSource {
        frame: Mutex<Option<Arc<Frame>>>,
        id: AtomicU64,
        stopped: AtomicBool,
    }

    impl ManualSource {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                frame: Mutex::new(None),
                id: AtomicU64::new(0),
                stopped: AtomicBool::new(false),
            })
        }

        fn publish(&self, value: u8) {
            let mut frame = self.frame.lock();
            *frame = Some(Arc::new(Frame::filled(4, 4, [value, 0, 0])));
            self.id.fetch_add(1, Ordering::SeqCst);
        }
    }

    impl FrameSource for ManualSource {
        fn get_frame(&self) -> Option<Arc<Frame>> {
            self.frame.lock().clone()
        }

        fn frame_id(&self) -> FrameId {
            self.id.load(Ordering::SeqCst)
        }

        fn snapshot(&self) -> Option<(FrameId, Arc<Frame>)> {
            let frame = self.frame.lock();
            Some((self.id.load(Ordering::SeqCst), frame.clone()?))
        }

        fn frame_size(&self) -> (u32, u32) {
            (4, 4)
        }

        fn stop(&self) {
            self.stopped.store(true, Ordering::SeqCst);
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
    fn test_layers_apply_in_order() {
        let source = ManualSource::new();
        let processed = ProcessedCamera::new(source.clone()).unwrap();
        processed.add_layer(|mut f| {
            f.set_pixel(0, 0, [1, 1, 1]);
            f
        });
        processed.add_layer(|f| f.resized(2, 2));
        assert_eq!(processed.layer_count(), 2);

        source.publish(50);
        assert!(wait_for(|| processed.frame_id() == 1));

        let frame = processed.get_frame().unwrap();
        assert_eq!(frame.size(), (2, 2));
        assert_eq!(processed.frame_size(), (4, 4));
        processed.stop();
    }

    #[test]
    fn test_layers_run_once_per_source_frame() {
        let source = ManualSource::new();
        let processed = ProcessedCamera::new(source.clone()).unwrap();
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&runs);
        processed.add_layer(move |f| {
            counter.fetch_add(1, Ordering::SeqCst);
            f
        });

        source.publish(1);
        assert!(wait_for(|| processed.frame_id() == 1));
        thread::sleep(Duration::from_millis(30));
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        source.publish(2);
        assert!(wait_for(|| processed.frame_id() == 2));
        thread::sleep(Duration::from_millis(30));
        assert_eq!(runs.load(Ordering::SeqCst), 2);
        processed.stop();
    }

    #[test]
    fn test_processed_snapshot_keeps_source_pairing() {
        let source = ManualSource::new();
        let processed = ProcessedCamera::new(source.clone()).unwrap();
        processed.add_layer(|mut f| {
            let [value, _, _] = f.pixel(0, 0).unwrap_or([0, 0, 0]);
            f.set_pixel(1, 1, [value, value, value]);
            f
        });

        for value in 1..=50u8 {
            source.publish(value);
            if let Some((id, frame)) = processed.snapshot() {
                assert_eq!(frame.pixel(1, 1), Some([id as u8; 3]));
            }
        }
        assert!(wait_for(|| processed.frame_id() == 50));
        let (id, frame) = processed.snapshot().unwrap();
        assert_eq!(id, 50);
        assert_eq!(frame.pixel(1, 1), Some([50, 50, 50]));
        processed.stop();
    }

    #[test]
    fn test_stop_propagates_to_source() {
        let source = ManualSource::new();
        let processed = ProcessedCamera::new(source.clone()).unwrap();
        assert!(processed.is_capturing());
        processed.stop();
        processed.stop();
        assert!(!processed.is_capturing());
        assert!(source.stopped.load(Ordering::SeqCst));
    }
}
