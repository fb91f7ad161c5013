//! Capture device contract and device bookkeeping
//!
//! Hardware drivers (USB capture, CSI camera) live outside this crate. They plug
//! into [`Camera`](super::Camera) by implementing [`CaptureDevice`]. The
//! [`TestPatternDevice`] stands in for real hardware in the daemon and in tests.

use crate::error::{Error, Result};
use crate::frame::Frame;
use parking_lot::Mutex;
use rand::prelude::*;
use rand::rngs::StdRng;
use std::collections::BTreeSet;
use std::thread;
use std::time::{Duration, Instant};

/// A frame-producing device driven by a camera's capture thread
pub trait CaptureDevice: Send + 'static {
    /// Pull the next frame from the device.
    ///
    /// May block for roughly one frame period but must not block indefinitely.
    /// `Ok(None)` means nothing was captured this time and is simply retried.
    fn next_frame(&mut self) -> Result<Option<Frame>>;

    /// (width, height) of captured frames
    fn frame_size(&self) -> (u32, u32);

    /// Horizontal and vertical field of view in degrees
    fn field_of_view(&self) -> Option<(f32, f32)> {
        None
    }

    /// Release the underlying hardware. Called once from the capture thread on exit.
    fn release(&mut self) -> Result<()> {
        Ok(())
    }
}

impl<D: CaptureDevice + ?Sized> CaptureDevice for Box<D> {
    fn next_frame(&mut self) -> Result<Option<Frame>> {
        (**self).next_frame()
    }

    fn frame_size(&self) -> (u32, u32) {
        (**self).frame_size()
    }

    fn field_of_view(&self) -> Option<(f32, f32)> {
        (**self).field_of_view()
    }

    fn release(&mut self) -> Result<()> {
        (**self).release()
    }
}

/// Tracks which device indices exist and which are already claimed.
///
/// Owned by whoever opens cameras and passed to them explicitly, so two
/// cameras can never open the same device.
#[derive(Debug, Default)]
pub struct DeviceRegistry {
    known: BTreeSet<u32>,
    available: Mutex<BTreeSet<u32>>,
}

impl DeviceRegistry {
    /// Registry over a fixed list of device indices
    pub fn new(indices: impl IntoIterator<Item = u32>) -> Self {
        let known: BTreeSet<u32> = indices.into_iter().collect();
        Self {
            available: Mutex::new(known.clone()),
            known,
        }
    }

    /// Probe indices starting at `skip`, stopping after `max_fail` consecutive
    /// indices that `opens` rejects.
    pub fn probe<F>(skip: u32, max_fail: u32, mut opens: F) -> Self
    where
        F: FnMut(u32) -> bool,
    {
        let mut failures = 0;
        let mut index = skip;
        let mut found = Vec::new();
        while failures < max_fail {
            if opens(index) {
                found.push(index);
                failures = 0;
            } else {
                failures += 1;
            }
            index += 1;
        }
        log::info!("Detected camera devices: {:?}", found);
        Self::new(found)
    }

    /// Claim a device. `None` takes the lowest-numbered free device.
    pub fn claim(&self, index: Option<u32>) -> Result<u32> {
        let mut available = self.available.lock();
        match index {
            Some(index) => {
                if available.remove(&index) {
                    Ok(index)
                } else {
                    Err(Error::DeviceUnavailable(index))
                }
            }
            None => available.pop_first().ok_or(Error::NoDeviceAvailable),
        }
    }

    /// Return a claimed device. Unknown indices are ignored.
    pub fn release(&self, index: u32) -> bool {
        if !self.known.contains(&index) {
            return false;
        }
        self.available.lock().insert(index)
    }

    /// Currently unclaimed devices, ascending
    pub fn available(&self) -> Vec<u32> {
        self.available.lock().iter().copied().collect()
    }
}

/// Synthetic device producing a moving gradient at a fixed rate
pub struct TestPatternDevice {
    width: u32,
    height: u32,
    period: Duration,
    tint: u8,
    noise: u8,
    rng: StdRng,
    counter: u32,
    next_deadline: Instant,
    released: bool,
}

impl TestPatternDevice {
    /// Create a pattern generator. `index` tints the pattern so several
    /// devices are distinguishable.
    pub fn new(index: u32, width: u32, height: u32, fps: f64) -> Result<Self> {
        if width == 0 || height == 0 {
            return Err(Error::Config(format!(
                "test pattern size must be non-zero ({}x{})",
                width, height
            )));
        }
        if fps.is_nan() || fps <= 0.0 {
            return Err(Error::InvalidFrameRate(fps));
        }
        Ok(Self {
            width,
            height,
            period: Duration::from_secs_f64(1.0 / fps),
            tint: (index.wrapping_mul(67) % 256) as u8,
            noise: 0,
            rng: StdRng::seed_from_u64(index as u64),
            counter: 0,
            next_deadline: Instant::now(),
            released: false,
        })
    }

    /// Add uniform per-pixel noise of the given amplitude
    pub fn with_noise(mut self, amplitude: u8) -> Self {
        self.noise = amplitude;
        self
    }

    fn render(&mut self) -> Frame {
        let mut frame = Frame::filled(self.width, self.height, [self.tint, 0, 0]);
        let bar = self.counter % self.width;
        for y in 0..self.height {
            let green = (y * 255 / self.height.max(1)) as u8;
            for x in 0..self.width {
                let red = if x == bar {
                    255
                } else {
                    (x * 255 / self.width.max(1)) as u8
                };
                let mut px = [self.tint, green, red];
                if self.noise > 0 {
                    for c in px.iter_mut() {
                        let jitter = self.rng.random_range(0..=self.noise);
                        *c = c.saturating_add(jitter);
                    }
                }
                frame.set_pixel(x, y, px);
            }
        }
        frame
    }
}

impl CaptureDevice for TestPatternDevice {
    fn next_frame(&mut self) -> Result<Option<Frame>> {
        if self.released {
            return Ok(None);
        }
        let now = Instant::now();
        if now < self.next_deadline {
            thread::sleep(self.next_deadline - now);
        }
        self.next_deadline = Instant::now() + self.period;
        self.counter = self.counter.wrapping_add(1);
        Ok(Some(self.render()))
    }

    fn frame_size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn field_of_view(&self) -> Option<(f32, f32)> {
        Some((65.368, 36.770))
    }

    fn release(&mut self) -> Result<()> {
        self.released = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_claims_lowest_first() {
        let registry = DeviceRegistry::new([2, 0, 4]);
        assert_eq!(registry.claim(None).unwrap(), 0);
        assert_eq!(registry.claim(None).unwrap(), 2);
        assert_eq!(registry.available(), vec![4]);
    }

    #[test]
    fn test_registry_rejects_claimed_device() {
        let registry = DeviceRegistry::new([0, 1]);
        assert_eq!(registry.claim(Some(1)).unwrap(), 1);
        assert!(matches!(
            registry.claim(Some(1)),
            Err(Error::DeviceUnavailable(1))
        ));

        assert!(registry.release(1));
        assert_eq!(registry.claim(Some(1)).unwrap(), 1);
    }

    #[test]
    fn test_registry_exhausted() {
        let registry = DeviceRegistry::new([0]);
        registry.claim(None).unwrap();
        assert!(matches!(registry.claim(None), Err(Error::NoDeviceAvailable)));
        assert!(!registry.release(7));
    }

    #[test]
    fn test_probe_stops_after_consecutive_failures() {
        let mut probed = Vec::new();
        let registry = DeviceRegistry::probe(0, 3, |i| {
            probed.push(i);
            i == 0 || i == 2
        });
        assert_eq!(registry.available(), vec![0, 2]);
        assert_eq!(probed, vec![0, 1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_pattern_device_frames() {
        let mut device = TestPatternDevice::new(1, 16, 8, 1000.0).unwrap();
        let first = device.next_frame().unwrap().unwrap();
        let second = device.next_frame().unwrap().unwrap();
        assert_eq!(first.size(), (16, 8));
        assert_ne!(first, second);

        device.release().unwrap();
        assert!(device.next_frame().unwrap().is_none());
    }

    #[test]
    fn test_pattern_device_rejects_bad_rate() {
        assert!(matches!(
            TestPatternDevice::new(0, 4, 4, 0.0),
            Err(Error::InvalidFrameRate(_))
        ));
    }
}
