//! Frame producers
//!
//! Everything that hands out frames implements [`FrameSource`]:
//!
//! | Type | Role |
//! |------|------|
//! | [`Camera`] | Background capture thread over a [`CaptureDevice`] |
//! | [`ProcessedCamera`] | Runs an ordered list of layers over another source |
//! | [`FrameSequencer`] | Only hands out frames it has not seen before |
//! | [`FrameRateLimiter`] | Sequencer with an upper bound on frame rate |
//!
//! ```text
//! CaptureDevice ──▶ Camera ──▶ ProcessedCamera ──▶ FrameSequencer ──▶ MatchStream
//!   (driver)      (capture)      (layers)          (dedup / rate)     (broadcast)
//! ```

pub mod device;
mod processed;
mod sequencer;
mod threaded;

pub use device::{CaptureDevice, DeviceRegistry, TestPatternDevice};
pub use processed::{Layer, ProcessedCamera};
pub use sequencer::{FrameRateLimiter, FrameSequencer, limit_framerate, sequential_frames};
pub use threaded::Camera;

use crate::frame::Frame;
use std::sync::Arc;

/// Identifier of the frame currently published by a source.
///
/// Only compared for equality. Ids are not contiguous and restart at zero with
/// every new source; zero means nothing has been captured yet.
pub type FrameId = u64;

/// Capability contract for anything that produces frames
pub trait FrameSource: Send + Sync {
    /// Most recent frame. Never blocks indefinitely and may return the same
    /// frame on consecutive calls.
    fn get_frame(&self) -> Option<Arc<Frame>>;

    /// Id of the frame `get_frame` would currently return
    fn frame_id(&self) -> FrameId;

    /// Current frame together with its id, read as one unit.
    ///
    /// Consumers that track ids must use this instead of pairing separate
    /// `frame_id` and `get_frame` calls, which can straddle a new capture.
    fn snapshot(&self) -> Option<(FrameId, Arc<Frame>)>;

    /// (width, height) of produced frames in pixels
    fn frame_size(&self) -> (u32, u32);

    /// Horizontal and vertical field of view in degrees, if the root device reports one
    fn field_of_view(&self) -> Option<(f32, f32)> {
        None
    }

    /// Stop capturing and release the device. Idempotent; blocks until the
    /// worker thread has exited. Safe to call from any thread.
    fn stop(&self);
}

impl<S: FrameSource + ?Sized> FrameSource for Arc<S> {
    fn get_frame(&self) -> Option<Arc<Frame>> {
        (**self).get_frame()
    }

    fn frame_id(&self) -> FrameId {
        (**self).frame_id()
    }

    fn snapshot(&self) -> Option<(FrameId, Arc<Frame>)> {
        (**self).snapshot()
    }

    fn frame_size(&self) -> (u32, u32) {
        (**self).frame_size()
    }

    fn field_of_view(&self) -> Option<(f32, f32)> {
        (**self).field_of_view()
    }

    fn stop(&self) {
        (**self).stop()
    }
}
