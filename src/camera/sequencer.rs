//! Frame de-duplication and rate limiting
//!
//! [`FrameSequencer`] remembers the id of the last frame it handed out and only
//! reports a frame as available once the source id moves on.
//! [`FrameRateLimiter`] additionally enforces a minimum interval between
//! delivered frames.

use super::{FrameId, FrameSource};
use crate::error::{Error, Result};
use crate::frame::Frame;
use parking_lot::Mutex;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Poll granularity while waiting for a new frame
const POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Hands out each source frame at most once
pub struct FrameSequencer<S: FrameSource = Arc<dyn FrameSource>> {
    source: S,
    last_frame_id: Mutex<Option<FrameId>>,
}

impl<S: FrameSource> FrameSequencer<S> {
    pub fn new(source: S) -> Self {
        Self {
            source,
            last_frame_id: Mutex::new(None),
        }
    }

    /// True iff the source id differs from the last id handed out
    pub fn frame_available(&self) -> bool {
        *self.last_frame_id.lock() != Some(self.source.frame_id())
    }

    /// Next unseen frame.
    ///
    /// Non-blocking calls return `None` when nothing new is available.
    /// Blocking calls poll until the source publishes a new frame.
    pub fn next_frame(&self, blocking: bool) -> Option<Arc<Frame>> {
        loop {
            if let Some((_, frame)) = self.try_take() {
                return Some(frame);
            }
            if !blocking {
                return None;
            }
            thread::sleep(POLL_INTERVAL);
        }
    }

    /// Blocking pull bounded by `timeout`
    pub fn next_frame_timeout(&self, timeout: Duration) -> Option<Arc<Frame>> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some((_, frame)) = self.try_take() {
                return Some(frame);
            }
            if Instant::now() >= deadline {
                return None;
            }
            thread::sleep(POLL_INTERVAL);
        }
    }

    fn try_take(&self) -> Option<(FrameId, Arc<Frame>)> {
        let mut last = self.last_frame_id.lock();
        let (id, frame) = self.source.snapshot()?;
        if *last == Some(id) {
            return None;
        }
        *last = Some(id);
        Some((id, frame))
    }

    /// The wrapped source
    pub fn source(&self) -> &S {
        &self.source
    }
}

impl<S: FrameSource> FrameSource for FrameSequencer<S> {
    /// Non-blocking: `None` unless an unseen frame is available
    fn get_frame(&self) -> Option<Arc<Frame>> {
        self.next_frame(false)
    }

    fn frame_id(&self) -> FrameId {
        self.source.frame_id()
    }

    /// Non-blocking: marks the returned frame as handed out
    fn snapshot(&self) -> Option<(FrameId, Arc<Frame>)> {
        self.try_take()
    }

    fn frame_size(&self) -> (u32, u32) {
        self.source.frame_size()
    }

    fn field_of_view(&self) -> Option<(f32, f32)> {
        self.source.field_of_view()
    }

    fn stop(&self) {
        self.source.stop();
    }
}

/// Sequencer with an upper bound on the delivered frame rate
pub struct FrameRateLimiter<S: FrameSource = Arc<dyn FrameSource>> {
    sequencer: FrameSequencer<S>,
    target_fps: f64,
    frame_delay: Duration,
    last_frame: Mutex<Option<Instant>>,
}

impl<S: FrameSource> FrameRateLimiter<S> {
    /// Limit `source` to at most `target_fps` frames per second
    pub fn new(source: S, target_fps: f64) -> Result<Self> {
        if target_fps.is_nan() || target_fps <= 0.0 {
            return Err(Error::InvalidFrameRate(target_fps));
        }
        Ok(Self {
            sequencer: FrameSequencer::new(source),
            target_fps,
            frame_delay: Duration::from_secs_f64(1.0 / target_fps),
            last_frame: Mutex::new(None),
        })
    }

    pub fn target_fps(&self) -> f64 {
        self.target_fps
    }

    /// Time left before the next frame may be delivered
    fn remaining_delay(&self) -> Duration {
        match *self.last_frame.lock() {
            Some(last) => self.frame_delay.saturating_sub(last.elapsed()),
            None => Duration::ZERO,
        }
    }

    /// True iff an unseen frame exists and the minimum interval has elapsed
    pub fn frame_available(&self) -> bool {
        self.sequencer.frame_available() && self.remaining_delay().is_zero()
    }

    /// Next unseen frame, no sooner than the minimum interval after the last.
    ///
    /// Blocking calls sleep out the remaining interval instead of polling.
    pub fn next_frame(&self, blocking: bool) -> Option<Arc<Frame>> {
        let delay = self.remaining_delay();
        if !delay.is_zero() {
            if !blocking {
                return None;
            }
            thread::sleep(delay);
        }
        let frame = self.sequencer.next_frame(blocking)?;
        *self.last_frame.lock() = Some(Instant::now());
        Some(frame)
    }

    fn try_take(&self) -> Option<(FrameId, Arc<Frame>)> {
        if !self.remaining_delay().is_zero() {
            return None;
        }
        let taken = self.sequencer.try_take()?;
        *self.last_frame.lock() = Some(Instant::now());
        Some(taken)
    }

    /// The wrapped source
    pub fn source(&self) -> &S {
        self.sequencer.source()
    }
}

impl<S: FrameSource> FrameSource for FrameRateLimiter<S> {
    /// Non-blocking: `None` unless a frame may be delivered right now
    fn get_frame(&self) -> Option<Arc<Frame>> {
        self.next_frame(false)
    }

    fn frame_id(&self) -> FrameId {
        self.sequencer.frame_id()
    }

    fn snapshot(&self) -> Option<(FrameId, Arc<Frame>)> {
        self.try_take()
    }

    fn frame_size(&self) -> (u32, u32) {
        self.sequencer.frame_size()
    }

    fn field_of_view(&self) -> Option<(f32, f32)> {
        self.sequencer.field_of_view()
    }

    fn stop(&self) {
        self.sequencer.stop();
    }
}

/// Wrap a source so each frame is handed out once
pub fn sequential_frames<S: FrameSource>(source: S) -> FrameSequencer<S> {
    FrameSequencer::new(source)
}

/// Wrap a source with a frame rate ceiling
pub fn limit_framerate<S: FrameSource>(source: S, target_fps: f64) -> Result<FrameRateLimiter<S>> {
    FrameRateLimiter::new(source, target_fps)
}
